//! Protocol spoken with the charger control service.
//!
//! Every request is a GET on the control endpoint carrying four query
//! parameters. The service replies with a short plain-text body.

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};

/// RFC 3986 unreserved characters plus `:`, which device ids carry verbatim.
const QUERY_VALUE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b':');

pub const CHARGING_STATUS: &str = "CHARGING";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    DeviceStatus,
    ReportEnergy,
}

impl RemoteCommand {
    pub fn cmd(self) -> &'static str {
        match self {
            Self::DeviceStatus => "get",
            Self::ReportEnergy => "set",
        }
    }

    pub fn key(self) -> &'static str {
        match self {
            Self::DeviceStatus => "devicestatus",
            Self::ReportEnergy => "kWh",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelayState {
    On,
    #[default]
    Off,
}

impl RelayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::On => "ON",
            Self::Off => "OFF",
        }
    }

    pub fn is_on(self) -> bool {
        self == Self::On
    }

    /// Only an exact `CHARGING` reply closes the relay.
    pub fn from_status_body(body: &str) -> Self {
        if body.trim() == CHARGING_STATUS {
            Self::On
        } else {
            Self::Off
        }
    }
}

/// Query parameters in the order the service expects them.
pub fn control_params<'a>(
    device_id: &'a str,
    command: RemoteCommand,
    value: &'a str,
) -> [(&'static str, &'a str); 4] {
    [
        ("devid", device_id),
        ("cmd", command.cmd()),
        ("key", command.key()),
        ("value", value),
    ]
}

pub fn control_url(base_url: &str, device_id: &str, command: RemoteCommand, value: &str) -> String {
    let query = control_params(device_id, command, value)
        .iter()
        .map(|(name, value)| format!("{name}={}", utf8_percent_encode(value, QUERY_VALUE)))
        .collect::<Vec<_>>()
        .join("&");
    format!("{base_url}?{query}")
}

pub fn energy_report_value(kwh: f64, epoch_us: i64) -> String {
    format!("kWh:{kwh:.6}_epochtime:{epoch_us}")
}

/// MAC bytes printed last-to-first as unpadded lowercase hex, which is the
/// form the control service registered devices under.
pub fn device_id_from_mac(mac: [u8; 6]) -> String {
    mac.iter()
        .rev()
        .map(|byte| format!("{byte:x}"))
        .collect::<Vec<_>>()
        .join(":")
}
