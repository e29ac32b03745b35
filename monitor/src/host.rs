use std::{
    io::ErrorKind,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use tokio::{net::TcpListener, sync::Mutex, task::JoinHandle};
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use vrms_common::{
    auth::{self, AuthOutcome, WWW_AUTHENTICATE},
    config::RemoteConfig,
    remote::{control_params, control_url},
    BatchSource, Calibration, ConfigView, CycleOutcome, EnergyReading, EstimatorConfig,
    EstimatorUpdate, MonitorState, RemoteCommand, RuntimeConfig, Sampler,
};

use crate::simulated::SimulatedSource;

const MAX_ECHO_BODY: usize = 4096;
const SOURCE_RESTART_DELAY_MS: u64 = 1_000;

#[derive(Clone)]
struct AppState {
    monitor: Arc<Mutex<MonitorState>>,
    config: Arc<Mutex<RuntimeConfig>>,
    device_id: Arc<String>,
    shutdown: Arc<AtomicBool>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();
    runtime
        .validate()
        .context("runtime config rejected")?;

    let device_id = std::env::var("VRMS_DEVICE_ID").unwrap_or_else(|_| "vrms-host".to_string());
    info!(
        "sampling channel {} at {} Hz, batch {} ({}), device `{device_id}`",
        runtime.sampler.channel,
        runtime.sampler.sample_rate_hz,
        runtime.sampler.batch_len,
        runtime.estimator.policy.as_str(),
    );

    let calibration = runtime
        .calibration
        .build()
        .context("invalid calibration")?;
    let sampler = Sampler::new(&runtime.sampler, calibration, runtime.estimator.estimator());
    let source = SimulatedSource::new(&runtime.sampler, runtime.simulation.clone());

    let app_state = AppState {
        monitor: Arc::new(Mutex::new(MonitorState::new(&runtime))),
        config: Arc::new(Mutex::new(runtime.clone())),
        device_id: Arc::new(device_id),
        shutdown: Arc::new(AtomicBool::new(false)),
        store,
    };

    let sampler_task = spawn_sampler_loop(
        app_state.clone(),
        source,
        sampler,
        Duration::from_millis(runtime.sampler.cycle_delay_ms),
    );
    if runtime.remote.enabled {
        spawn_remote_loop(app_state.clone(), runtime.remote.clone(), runtime.relay.gpio);
    } else {
        info!("remote control disabled; relay stays OFF");
    }

    let web_root = format!("{}/web", env!("CARGO_MANIFEST_DIR"));
    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/config", get(handle_get_config))
        .route("/api/estimator", put(handle_put_estimator))
        .route("/hello", get(handle_hello))
        .route("/echo", post(handle_echo))
        .route("/ctrl", put(handle_ctrl))
        .route("/basic_auth", get(handle_basic_auth))
        .fallback_service(ServeDir::new(web_root))
        .with_state(app_state.clone());

    let port = std::env::var("VRMS_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind monitor server at {addr}"))?;

    info!("monitor listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(app_state.shutdown.clone()))
        .await?;

    sampler_task.await.context("sampler loop panicked")?;
    Ok(())
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(url) = std::env::var("VRMS_REMOTE_URL") {
        if !url.trim().is_empty() {
            runtime.remote.base_url = url;
            runtime.remote.enabled = true;
        }
    }
}

async fn shutdown_signal(shutdown: Arc<AtomicBool>) {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
    shutdown.store(true, Ordering::Relaxed);
}

/// The sampler blocks on the source, so it lives on a blocking thread.
fn spawn_sampler_loop(
    app_state: AppState,
    mut source: SimulatedSource,
    mut sampler: Sampler<Box<dyn Calibration + Send>>,
    cycle_delay: Duration,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if let Err(err) = source.start() {
            warn!("failed to start sample source: {err}");
            return;
        }

        let mut reported_overruns = 0;
        while !app_state.shutdown.load(Ordering::Relaxed) {
            let estimator = app_state.monitor.blocking_lock().estimator();
            sampler.set_estimator(estimator.estimator());

            match sampler.poll(&mut source) {
                Ok(outcome) => {
                    log_outcome(&outcome);
                    let reading = app_state
                        .monitor
                        .blocking_lock()
                        .record_cycle(outcome, monotonic_ms());
                    log_energy(&reading);
                }
                Err(err) => {
                    warn!("sample source failed: {err}; restarting");
                    if let Err(err) = source.stop().and_then(|()| {
                        std::thread::sleep(Duration::from_millis(SOURCE_RESTART_DELAY_MS));
                        source.start()
                    }) {
                        warn!("sample source restart failed: {err}");
                    }
                }
            }

            let overruns = source.overruns();
            if overruns > reported_overruns {
                debug!("{} frames lost to overruns so far", overruns);
                reported_overruns = overruns;
            }

            std::thread::sleep(cycle_delay);
        }

        if let Err(err) = source.stop() {
            warn!("failed to stop sample source: {err}");
        }
        info!("sampler loop stopped");
    })
}

fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Measured(m) => info!(
            "vrms {:.1} mV, mean {:.1} mV ({} samples, {} dropped, {}..{} mV)",
            m.result.rms_mv, m.result.mean_mv, m.samples, m.dropped, m.min_mv, m.max_mv
        ),
        CycleOutcome::NoData { reason, dropped } => {
            warn!("no samples this cycle: {} ({dropped} dropped)", reason.as_str())
        }
        CycleOutcome::Rejected { error, samples } => {
            warn!("estimate rejected for {samples} samples: {error}")
        }
    }
}

fn log_energy(reading: &EnergyReading) {
    debug!(
        "{:.2} A, {:.0} W, {:.6} kWh total",
        reading.amps, reading.watts, reading.total_kwh
    );
}

fn spawn_remote_loop(app_state: AppState, remote: RemoteConfig, relay_gpio: i32) {
    tokio::spawn(async move {
        let client = match reqwest::Client::builder()
            .timeout(Duration::from_millis(remote.timeout_ms))
            .build()
        {
            Ok(client) => client,
            Err(err) => {
                warn!("failed to build control client: {err}");
                return;
            }
        };

        let mut interval = tokio::time::interval(Duration::from_millis(remote.poll_interval_ms));
        loop {
            interval.tick().await;
            if app_state.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let status = call_remote(
                &client,
                &remote.base_url,
                &app_state.device_id,
                RemoteCommand::DeviceStatus,
                "",
            )
            .await;
            let transition = {
                let mut monitor = app_state.monitor.lock().await;
                match status {
                    Ok(body) => monitor.apply_remote_status(&body),
                    Err(err) => {
                        warn!("device status request failed: {err:#}");
                        monitor.remote_failed(format!("{err:#}"))
                    }
                }
            };
            if let Some(relay) = transition {
                info!("relay on GPIO{relay_gpio} -> {}", relay.as_str());
            }

            let (kwh, value) = app_state
                .monitor
                .lock()
                .await
                .energy_report(Utc::now().timestamp_micros());
            match call_remote(
                &client,
                &remote.base_url,
                &app_state.device_id,
                RemoteCommand::ReportEnergy,
                &value,
            )
            .await
            {
                Ok(_) => app_state.monitor.lock().await.mark_reported(kwh),
                Err(err) => warn!("energy report failed: {err:#}"),
            }
        }
    });
}

async fn call_remote(
    client: &reqwest::Client,
    base_url: &str,
    device_id: &str,
    command: RemoteCommand,
    value: &str,
) -> anyhow::Result<String> {
    debug!("GET {}", control_url(base_url, device_id, command, value));
    let response = client
        .get(base_url)
        .query(&control_params(device_id, command, value))
        .send()
        .await
        .context("control request failed")?;

    let status = response.status();
    if !status.is_success() {
        anyhow::bail!("control service returned HTTP {status}");
    }
    Ok(response.text().await?)
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let status = state
        .monitor
        .lock()
        .await
        .status(&state.device_id, monotonic_ms());
    Json(status)
}

async fn handle_get_config(State(state): State<AppState>) -> impl IntoResponse {
    let config = state.config.lock().await;
    Json(ConfigView::from(&*config))
}

async fn handle_put_estimator(
    State(state): State<AppState>,
    Json(update): Json<EstimatorUpdate>,
) -> impl IntoResponse {
    // Held across the write so the file and the live config cannot diverge.
    let mut config = state.config.lock().await;
    let estimator = match config.estimator_update(&update) {
        Ok(estimator) => estimator,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };

    if let Err(err) = persist_estimator(&state.store, estimator).await {
        warn!("failed to persist estimator update: {err:#}");
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to persist runtime settings",
        );
    }
    config.estimator = estimator;
    drop(config);

    state.monitor.lock().await.set_estimator(estimator);
    info!(
        "estimator switched to {} (smoothing {})",
        estimator.policy.as_str(),
        estimator.smoothing
    );
    Json(estimator).into_response()
}

async fn handle_hello(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let mut monitor = state.monitor.lock().await;
    if !monitor.demo_routes_enabled() {
        return (StatusCode::NOT_FOUND, "/hello URI is not available").into_response();
    }

    if let Some(host) = headers.get(header::HOST).and_then(|value| value.to_str().ok()) {
        debug!("hello from host {host}");
    }
    let lit = monitor.toggle_charger_led();
    info!("charger LED turned {}", if lit { "ON" } else { "OFF" });

    (
        StatusCode::OK,
        [
            ("Custom-Header-1", "Custom-Value-1"),
            ("Custom-Header-2", "Custom-Value-2"),
        ],
        monitor.charger_message(),
    )
        .into_response()
}

async fn handle_echo(State(state): State<AppState>, body: String) -> impl IntoResponse {
    if !state.monitor.lock().await.demo_routes_enabled() {
        return (StatusCode::NOT_FOUND, "/echo URI is not available").into_response();
    }
    if body.len() > MAX_ECHO_BODY {
        return error_response(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
    }

    debug!("echo {} bytes", body.len());
    body.into_response()
}

async fn handle_ctrl(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let Some(first) = body.bytes().next() else {
        return error_response(StatusCode::BAD_REQUEST, "Missing control byte");
    };

    let enabled = first != b'0';
    info!(
        "{} /hello and /echo URIs",
        if enabled { "Registering" } else { "Unregistering" }
    );
    state.monitor.lock().await.set_demo_routes_enabled(enabled);
    StatusCode::OK.into_response()
}

async fn handle_basic_auth(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let credentials = state.config.lock().await.auth.clone();
    if !credentials.enabled {
        return error_response(StatusCode::NOT_FOUND, "Basic auth is disabled");
    }

    let header_value = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    match auth::verify(header_value, &credentials.username, &credentials.password) {
        AuthOutcome::Authenticated => {
            info!("authenticated `{}`", credentials.username);
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/json")],
                auth::authenticated_body(&credentials.username),
            )
                .into_response()
        }
        outcome => {
            warn!("basic auth failed: {}", outcome.as_str());
            (
                StatusCode::UNAUTHORIZED,
                [
                    (header::CONTENT_TYPE, "application/json"),
                    (header::WWW_AUTHENTICATE, WWW_AUTHENTICATE),
                ],
            )
                .into_response()
        }
    }
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("VRMS_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.vrms"));
        Self::in_dir(data_dir)
    }

    fn in_dir(data_dir: PathBuf) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(self.runtime_path.as_ref()).await {
            Ok(raw) => Ok(serde_json::from_slice::<RuntimeConfig>(&raw)?),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
            Err(err) => Err(err.into()),
        }
    }

    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.runtime_path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(runtime)?;
        tokio::fs::write(path, payload).await?;
        Ok(())
    }
}

/// Only the estimator section is written back; env overrides stay out of the file.
async fn persist_estimator(store: &AppStore, estimator: EstimatorConfig) -> anyhow::Result<()> {
    let mut runtime = store.load_runtime_config().await?;
    runtime.estimator = estimator;
    store.save_runtime_config(&runtime).await
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use vrms_common::EstimatorPolicy;

    fn state_with_store(store: AppStore) -> AppState {
        let runtime = RuntimeConfig::default();
        AppState {
            monitor: Arc::new(Mutex::new(MonitorState::new(&runtime))),
            config: Arc::new(Mutex::new(runtime)),
            device_id: Arc::new("test".to_string()),
            shutdown: Arc::new(AtomicBool::new(false)),
            store,
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("vrms-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn median_update() -> Json<EstimatorUpdate> {
        Json(EstimatorUpdate {
            policy: "MEDIAN_OFFSET".to_string(),
            smoothing: None,
        })
    }

    #[tokio::test]
    async fn estimator_update_is_saved_and_applied() {
        let dir = scratch_dir("estimator-ok");
        let state = state_with_store(AppStore::in_dir(dir.clone()));

        let response = handle_put_estimator(State(state.clone()), median_update())
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            state.config.lock().await.estimator.policy,
            EstimatorPolicy::MedianOffset
        );
        assert_eq!(
            state.monitor.lock().await.estimator().policy,
            EstimatorPolicy::MedianOffset
        );
        let stored = state.store.load_runtime_config().await.unwrap();
        assert_eq!(stored.estimator.policy, EstimatorPolicy::MedianOffset);
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn failed_save_leaves_the_estimator_unchanged() {
        let dir = scratch_dir("estimator-fail");
        // A regular file where the data directory should be.
        let blocker = dir.join("not-a-dir");
        std::fs::write(&blocker, b"").unwrap();
        let state = state_with_store(AppStore::in_dir(blocker));

        let response = handle_put_estimator(State(state.clone()), median_update())
            .await
            .into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            state.config.lock().await.estimator.policy,
            EstimatorPolicy::MeanDeviation
        );
        assert_eq!(
            state.monitor.lock().await.estimator().policy,
            EstimatorPolicy::MeanDeviation
        );
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn invalid_estimator_update_is_a_bad_request() {
        let dir = scratch_dir("estimator-bad");
        let state = state_with_store(AppStore::in_dir(dir.clone()));

        let response = handle_put_estimator(
            State(state.clone()),
            Json(EstimatorUpdate {
                policy: "rms".to_string(),
                smoothing: None,
            }),
        )
        .await
        .into_response();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(!dir.join("runtime.json").exists());
        let _ = std::fs::remove_dir_all(dir);
    }
}
