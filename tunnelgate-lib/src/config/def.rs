use std::{fmt::Display, net::SocketAddr, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(PartialEq, Eq, Serialize, Deserialize, Default, Copy, Clone, Debug)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    #[serde(alias = "off")]
    Silent,
}

impl Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warning => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
            LogLevel::Silent => write!(f, "off"),
        }
    }
}

/// Example
/// ```yaml
/// ---
/// listen: 0.0.0.0:8080
/// log-level: info
///
/// # datagrams to port 53 go here instead of their own destination
/// dns-server: 8.8.8.8:53
/// # every UDP session is framed over TCP to this host
/// udp-relay: udp-relay.hobihaus.space:7300
///
/// # retried once when a TCP destination fails or never answers.
/// # a session can override it with its request path, e.g. `/1.2.3.4-443`
/// fallback: proxy.example.com:443
///
/// # seconds
/// dial-timeout: 10
/// early-data-header: sec-websocket-protocol
/// ```
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    pub listen: SocketAddr,
    pub log_level: LogLevel,
    pub dns_server: String,
    pub udp_relay: String,
    pub fallback: Option<String>,
    /// seconds
    pub dial_timeout: u64,
    pub early_data_header: String,
}

impl TryFrom<PathBuf> for Config {
    type Error = Error;

    fn try_from(value: PathBuf) -> Result<Self, Self::Error> {
        let content = std::fs::read_to_string(value)?;
        let config = content.parse::<Config>()?;
        Ok(config)
    }
}

impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s).map_err(|x| {
            Error::InvalidConfig(format!("could not parse config content {s}: {x}"))
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: Default::default(),
            dns_server: "8.8.8.8:53".to_owned(),
            udp_relay: "udp-relay.hobihaus.space:7300".to_owned(),
            fallback: None,
            dial_timeout: 10,
            early_data_header: "sec-websocket-protocol".to_owned(),
        }
    }
}
