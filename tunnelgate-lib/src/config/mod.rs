use std::{net::SocketAddr, sync::Arc, time::Duration};

use http::HeaderName;

use crate::{Error, config::def::LogLevel, session::TargetAddr};

pub mod def;

/// Validated process configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: SocketAddr,
    pub log_level: LogLevel,
    pub early_data_header: HeaderName,
    pub relay: Arc<RelayConfig>,
}

/// What every relay session needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub dns_server: TargetAddr,
    pub udp_relay: TargetAddr,
    /// Default fallback for the TCP retry, used when the request path names
    /// none.
    pub fallback: Option<TargetAddr>,
    pub dial_timeout: Duration,
}

fn parse_target(field: &str, value: &str) -> Result<TargetAddr, Error> {
    value
        .parse()
        .map_err(|e| Error::InvalidConfig(format!("{field}: {e}")))
}

impl TryFrom<&def::Config> for RelayConfig {
    type Error = Error;

    fn try_from(c: &def::Config) -> Result<Self, Self::Error> {
        if c.dial_timeout == 0 {
            return Err(Error::InvalidConfig(
                "dial-timeout must be at least 1 second".to_owned(),
            ));
        }
        Ok(Self {
            dns_server: parse_target("dns-server", &c.dns_server)?,
            udp_relay: parse_target("udp-relay", &c.udp_relay)?,
            fallback: c
                .fallback
                .as_deref()
                .map(|f| parse_target("fallback", f))
                .transpose()?,
            dial_timeout: Duration::from_secs(c.dial_timeout),
        })
    }
}

impl TryFrom<def::Config> for RuntimeConfig {
    type Error = Error;

    fn try_from(c: def::Config) -> Result<Self, Self::Error> {
        let relay = RelayConfig::try_from(&c)?;
        let early_data_header = HeaderName::try_from(c.early_data_header.as_str())
            .map_err(|e| Error::InvalidConfig(format!("early-data-header: {e}")))?;
        Ok(Self {
            listen: c.listen,
            log_level: c.log_level,
            early_data_header,
            relay: Arc::new(relay),
        })
    }
}
