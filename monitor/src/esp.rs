use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use chrono::Utc;
use embedded_svc::{
    http::{client::Client as HttpClient, Headers, Method, Status},
    io::{Read, Write},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{Configuration as HttpClientConfiguration, EspHttpConnection},
    http::server::{Configuration as HttpConfiguration, EspHttpServer},
    log::EspLogger,
    nvs::{EspDefaultNvsPartition, EspNvs},
    sntp::EspSntp,
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use vrms_common::{
    auth::{self, AuthOutcome, WWW_AUTHENTICATE},
    config::{NetworkConfig, RemoteConfig},
    remote::{control_url, device_id_from_mac},
    BatchSource, Calibration, ConfigView, CycleOutcome, EstimatorUpdate, FallbackCalibration,
    MonitorState, RemoteCommand, RuntimeConfig, Sampler,
};

use crate::adc::{AdcSource, ChipCalibration, RelayPin};

const NVS_NAMESPACE: &str = "vrms";
const NVS_RUNTIME_KEY: &str = "runtime_json";
const MAX_HTTP_BODY: usize = 4096;
const MAX_REMOTE_REPLY: usize = 64;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const SOURCE_RESTART_DELAY_MS: u64 = 1_000;

const INDEX_HTML: &str = include_str!("../web/index.html");

#[derive(Clone)]
struct SharedState {
    monitor: Arc<Mutex<MonitorState>>,
    config: Arc<Mutex<RuntimeConfig>>,
    device_id: Arc<String>,
}

#[derive(Clone)]
struct NvsStore {
    partition: EspDefaultNvsPartition,
    lock: Arc<Mutex<()>>,
}

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let nvs_store = NvsStore {
        partition: nvs_partition.clone(),
        lock: Arc::new(Mutex::new(())),
    };

    let mut runtime = nvs_store.load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config from NVS: {err:#}");
        RuntimeConfig::default()
    });
    runtime.sanitize();
    ensure_wifi_defaults(&mut runtime);
    runtime.validate().context("runtime config rejected")?;

    let device_id = read_device_id();
    info!(
        "device `{device_id}`: channel {} at {} Hz, batch {} ({})",
        runtime.sampler.channel,
        runtime.sampler.sample_rate_hz,
        runtime.sampler.batch_len,
        runtime.estimator.policy.as_str(),
    );

    let peripherals = Peripherals::take()?;
    let source = AdcSource::new(peripherals.adc1, peripherals.pins.gpio35, &runtime.sampler)
        .context("failed to configure continuous ADC")?;
    let (calibration, fallback_codes) = select_calibration(&runtime)?;
    let sampler = Sampler::new(&runtime.sampler, calibration, runtime.estimator.estimator());

    let relay = match RelayPin::new(runtime.relay.gpio, runtime.relay.active_high) {
        Ok(relay) => Some(relay),
        Err(err) => {
            warn!("relay unavailable on GPIO{}: {err:#}", runtime.relay.gpio);
            None
        }
    };

    let wifi = connect_wifi(peripherals.modem, sys_loop, nvs_partition, &runtime.network)
        .context("wifi startup failed")?;

    let _sntp = EspSntp::new_default().context("failed to start SNTP")?;
    info!("SNTP initialized");

    let state = SharedState {
        monitor: Arc::new(Mutex::new(MonitorState::new(&runtime))),
        config: Arc::new(Mutex::new(runtime.clone())),
        device_id: Arc::new(device_id),
    };

    spawn_sampler_loop(
        state.clone(),
        source,
        sampler,
        fallback_codes,
        Duration::from_millis(runtime.sampler.cycle_delay_ms),
    )?;
    if runtime.remote.enabled {
        spawn_remote_loop(state.clone(), runtime.remote.clone(), relay)?;
    } else {
        info!("remote control disabled; relay stays OFF");
    }

    let server = create_http_server(state, nvs_store, runtime.network.http_port)?;

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn ensure_wifi_defaults(runtime: &mut RuntimeConfig) {
    if runtime.network.wifi_ssid.is_empty() {
        if let Some(ssid) = option_env!("WIFI_SSID") {
            runtime.network.wifi_ssid = ssid.to_string();
        }
    }

    if runtime.network.wifi_pass.is_empty() {
        if let Some(pass) = option_env!("WIFI_PASS") {
            runtime.network.wifi_pass = pass.to_string();
        }
    }
}

fn read_device_id() -> String {
    let mut mac = [0_u8; 6];
    let rc = unsafe {
        esp_idf_svc::sys::esp_read_mac(
            mac.as_mut_ptr(),
            esp_idf_svc::sys::esp_mac_type_t_ESP_MAC_ETH,
        )
    };
    if rc != esp_idf_svc::sys::ESP_OK {
        warn!("failed to read MAC address: esp_err_t={rc}");
    }
    device_id_from_mac(mac)
}

type FallbackCounter = Option<Arc<AtomicU64>>;

fn select_calibration(
    runtime: &RuntimeConfig,
) -> anyhow::Result<(Box<dyn Calibration + Send>, FallbackCounter)> {
    if runtime.calibration.use_chip_scheme && runtime.calibration.curve.is_none() {
        match ChipCalibration::new() {
            Ok(chip) => {
                info!("using eFuse line-fitting ADC calibration");
                let calibration = FallbackCalibration::new(
                    move |code| chip.try_to_millivolts(code),
                    runtime.calibration.linear,
                );
                let failures = calibration.failures();
                let calibration: Box<dyn Calibration + Send> = Box::new(calibration);
                return Ok((calibration, Some(failures)));
            }
            Err(err) => warn!("chip ADC calibration unavailable ({err}); using config"),
        }
    }
    let calibration = runtime
        .calibration
        .build()
        .context("invalid calibration")?;
    Ok((calibration, None))
}

fn spawn_sampler_loop(
    state: SharedState,
    mut source: AdcSource,
    mut sampler: Sampler<Box<dyn Calibration + Send>>,
    fallback_codes: FallbackCounter,
    cycle_delay: Duration,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("sampler".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            if let Err(err) = source.start() {
                warn!("failed to start continuous ADC: {err}");
                return;
            }

            let mut reported_fallbacks = 0;
            loop {
                let estimator = state.monitor.lock().unwrap().estimator();
                sampler.set_estimator(estimator.estimator());

                match sampler.poll(&mut source) {
                    Ok(outcome) => {
                        log_outcome(&outcome);
                        state
                            .monitor
                            .lock()
                            .unwrap()
                            .record_cycle(outcome, monotonic_ms());
                    }
                    Err(err) => {
                        warn!("ADC read failed: {err}; restarting driver");
                        let _ = source.stop();
                        thread::sleep(Duration::from_millis(SOURCE_RESTART_DELAY_MS));
                        if let Err(err) = source.start() {
                            warn!("ADC restart failed: {err}");
                        }
                    }
                }

                if let Some(counter) = &fallback_codes {
                    let fallbacks = counter.load(Ordering::Relaxed);
                    if fallbacks > reported_fallbacks {
                        warn!("{fallbacks} ADC codes rejected by chip calibration so far");
                        reported_fallbacks = fallbacks;
                    }
                }

                thread::sleep(cycle_delay);
            }
        })
        .context("failed to spawn sampler thread")?;
    Ok(())
}

fn log_outcome(outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Measured(m) => info!(
            "vrms {:.1} mV, mean {:.1} mV ({} samples, {} dropped)",
            m.result.rms_mv, m.result.mean_mv, m.samples, m.dropped
        ),
        CycleOutcome::NoData { reason, dropped } => {
            warn!("no samples this cycle: {} ({dropped} dropped)", reason.as_str())
        }
        CycleOutcome::Rejected { error, samples } => {
            warn!("estimate rejected for {samples} samples: {error}")
        }
    }
}

fn spawn_remote_loop(
    state: SharedState,
    remote: RemoteConfig,
    mut relay: Option<RelayPin>,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("remote".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            let status_url = control_url(
                &remote.base_url,
                &state.device_id,
                RemoteCommand::DeviceStatus,
                "",
            );
            let transition = match call_remote(&status_url, remote.timeout_ms) {
                Ok(body) => state.monitor.lock().unwrap().apply_remote_status(&body),
                Err(err) => {
                    warn!("device status request failed: {err:#}");
                    state.monitor.lock().unwrap().remote_failed(format!("{err:#}"))
                }
            };
            if let Some(next) = transition {
                info!("relay -> {}", next.as_str());
                if let Some(pin) = relay.as_mut() {
                    if let Err(err) = pin.set(next) {
                        warn!("failed to drive relay: {err:#}");
                    }
                }
            }

            let (kwh, value) = state
                .monitor
                .lock()
                .unwrap()
                .energy_report(Utc::now().timestamp_micros());
            let report_url = control_url(
                &remote.base_url,
                &state.device_id,
                RemoteCommand::ReportEnergy,
                &value,
            );
            match call_remote(&report_url, remote.timeout_ms) {
                Ok(_) => state.monitor.lock().unwrap().mark_reported(kwh),
                Err(err) => warn!("energy report failed: {err:#}"),
            }

            thread::sleep(Duration::from_millis(remote.poll_interval_ms));
        })
        .context("failed to spawn remote thread")?;
    Ok(())
}

fn call_remote(url: &str, timeout_ms: u64) -> anyhow::Result<String> {
    let http_conf = HttpClientConfiguration {
        timeout: Some(Duration::from_millis(timeout_ms)),
        crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
        ..Default::default()
    };
    let mut client = HttpClient::wrap(EspHttpConnection::new(&http_conf)?);
    let request = client.request(Method::Get, url, &[])?;
    let mut response = request.submit().map_err(|e| anyhow!("{e:?}"))?;

    let status = response.status();
    if !(200..300).contains(&status) {
        return Err(anyhow!("control service returned HTTP {status}"));
    }

    let mut body = Vec::with_capacity(MAX_REMOTE_REPLY);
    let mut chunk = [0_u8; MAX_REMOTE_REPLY];
    loop {
        let read = response.read(&mut chunk).map_err(|e| anyhow!("{e:?}"))?;
        if read == 0 || body.len() >= MAX_REMOTE_REPLY {
            break;
        }
        let take = read.min(MAX_REMOTE_REPLY - body.len());
        body.extend_from_slice(&chunk[..take]);
    }
    Ok(String::from_utf8_lossy(&body).into_owned())
}

fn create_http_server(
    state: SharedState,
    nvs_store: NvsStore,
    http_port: u16,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        http_port,
        stack_size: 12 * 1024,
        ..Default::default()
    };

    let mut server = EspHttpServer::new(&conf)?;

    server.fn_handler::<anyhow::Error, _>("/", Method::Get, move |req| {
        req.into_ok_response()?.write_all(INDEX_HTML.as_bytes())?;
        Ok(())
    })?;

    {
        let state = state.clone();
        server.fn_handler("/api/status", Method::Get, move |req| {
            let status = state
                .monitor
                .lock()
                .unwrap()
                .status(&state.device_id, monotonic_ms());
            write_json(req, &status)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/config", Method::Get, move |req| {
            let view = ConfigView::from(&*state.config.lock().unwrap());
            write_json(req, &view)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler("/api/estimator", Method::Put, move |mut req| {
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 400, &format!("{err:#}")),
            };
            let update = match serde_json::from_slice::<EstimatorUpdate>(&body) {
                Ok(update) => update,
                Err(err) => return write_error(req, 400, &format!("invalid JSON: {err}")),
            };

            let estimator = {
                let mut config = state.config.lock().unwrap();
                let estimator = match config.estimator_update(&update) {
                    Ok(estimator) => estimator,
                    Err(err) => return write_error(req, 400, &err.to_string()),
                };

                let mut snapshot = config.clone();
                snapshot.estimator = estimator;
                if let Err(err) = nvs_store.save_runtime_config(&snapshot) {
                    warn!("failed to persist estimator update: {err:#}");
                    return write_error(req, 500, "Failed to persist runtime settings");
                }
                config.estimator = estimator;
                estimator
            };

            state.monitor.lock().unwrap().set_estimator(estimator);
            info!(
                "estimator switched to {} (smoothing {})",
                estimator.policy.as_str(),
                estimator.smoothing
            );
            write_json(req, &estimator)
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/hello", Method::Get, move |req| {
            let message = {
                let mut monitor = state.monitor.lock().unwrap();
                if !monitor.demo_routes_enabled() {
                    None
                } else {
                    let lit = monitor.toggle_charger_led();
                    info!("charger LED turned {}", if lit { "ON" } else { "OFF" });
                    Some(monitor.charger_message())
                }
            };

            let Some(message) = message else {
                req.into_status_response(404)?
                    .write_all(b"/hello URI is not available")?;
                return Ok(());
            };
            req.into_response(
                200,
                Some("OK"),
                &[
                    ("Custom-Header-1", "Custom-Value-1"),
                    ("Custom-Header-2", "Custom-Value-2"),
                ],
            )?
            .write_all(message.as_bytes())?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/echo", Method::Post, move |mut req| {
            if !state.monitor.lock().unwrap().demo_routes_enabled() {
                req.into_status_response(404)?
                    .write_all(b"/echo URI is not available")?;
                return Ok(());
            }
            let body = match read_request_body(&mut req) {
                Ok(body) => body,
                Err(err) => return write_error(req, 413, &format!("{err:#}")),
            };
            req.into_ok_response()?.write_all(&body)?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/ctrl", Method::Put, move |mut req| {
            let body = read_request_body(&mut req)?;
            let Some(&first) = body.first() else {
                return write_error(req, 400, "Missing control byte");
            };

            let enabled = first != b'0';
            info!(
                "{} /hello and /echo URIs",
                if enabled { "Registering" } else { "Unregistering" }
            );
            state.monitor.lock().unwrap().set_demo_routes_enabled(enabled);
            req.into_ok_response()?;
            Ok(())
        })?;
    }

    {
        let state = state.clone();
        server.fn_handler::<anyhow::Error, _>("/basic_auth", Method::Get, move |req| {
            let credentials = state.config.lock().unwrap().auth.clone();
            if !credentials.enabled {
                return write_error(req, 404, "Basic auth is disabled");
            }

            let outcome = auth::verify(
                req.header("Authorization"),
                &credentials.username,
                &credentials.password,
            );
            if outcome != AuthOutcome::Authenticated {
                warn!("basic auth failed: {}", outcome.as_str());
                req.into_response(
                    401,
                    Some("UNAUTHORIZED"),
                    &[
                        ("Content-Type", "application/json"),
                        ("Connection", "keep-alive"),
                        ("WWW-Authenticate", WWW_AUTHENTICATE),
                    ],
                )?;
                return Ok(());
            }

            info!("authenticated `{}`", credentials.username);
            req.into_response(
                200,
                Some("OK"),
                &[
                    ("Content-Type", "application/json"),
                    ("Connection", "keep-alive"),
                ],
            )?
            .write_all(auth::authenticated_body(&credentials.username).as_bytes())?;
            Ok(())
        })?;
    }

    Ok(server)
}

fn read_request_body(
    req: &mut esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        200,
        Some("OK"),
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_error(
    req: esp_idf_svc::http::server::Request<
        &mut esp_idf_svc::http::server::EspHttpConnection<'_>,
    >,
    status_code: u16,
    message: &str,
) -> anyhow::Result<()> {
    let payload = serde_json::json!({ "error": message });
    let body = serde_json::to_vec(&payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    network: &NetworkConfig,
) -> anyhow::Result<EspWifi<'static>> {
    if network.wifi_ssid.trim().is_empty() {
        return Err(anyhow!("wifi credentials missing"));
    }

    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let auth_method = if network.wifi_pass.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: network
            .wifi_ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: network
            .wifi_pass
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", network.wifi_ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(esp_wifi),
        Some(err) => Err(anyhow!(
            "all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}"
        )),
    }
}

impl NvsStore {
    fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        let _guard = self.lock.lock().unwrap();
        let nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let mut buffer = vec![0_u8; 4096];

        match nvs.get_str(NVS_RUNTIME_KEY, &mut buffer)? {
            Some(value) => Ok(serde_json::from_str::<RuntimeConfig>(value)?),
            None => Ok(RuntimeConfig::default()),
        }
    }

    fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().unwrap();
        let mut nvs = EspNvs::new(self.partition.clone(), NVS_NAMESPACE, true)?;
        let payload = serde_json::to_string(runtime)?;
        nvs.set_str(NVS_RUNTIME_KEY, &payload)?;
        Ok(())
    }
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
