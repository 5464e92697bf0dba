use std::{
    fmt::{Display, Formatter},
    net::IpAddr,
    str::FromStr,
    sync::LazyLock,
};

use regex::Regex;
use serde::Serialize;

/// Address encodings carried by the tunnel headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressType {
    Ipv4,
    Domain,
    Ipv6,
}

impl Display for AddressType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressType::Ipv4 => write!(f, "ipv4"),
            AddressType::Domain => write!(f, "domain"),
            AddressType::Ipv6 => write!(f, "ipv6"),
        }
    }
}

#[derive(PartialEq, Eq, Hash, Clone, Copy, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Tcp => write!(f, "TCP"),
            Network::Udp => write!(f, "UDP"),
        }
    }
}

/// A dialable `host:port` pair. The host is kept as text, so it may be a
/// domain name or the textual form of an IP address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TargetAddr {
    pub host: String,
    pub port: u16,
}

impl TargetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl Display for TargetAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => write!(f, "[{}]:{}", self.host, self.port),
            _ => write!(f, "{}:{}", self.host, self.port),
        }
    }
}

static TARGET_ADDR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(.+)[:=-](\d+)$").expect("target address regex must compile")
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid target address: {0}")]
pub struct InvalidTargetAddr(pub String);

impl FromStr for TargetAddr {
    type Err = InvalidTargetAddr;

    /// Accepts `host:port`, `host-port`, `host=port` and `[v6]:port`.
    /// The split happens at the last delimiter.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('[') {
            let (host, port) = rest
                .split_once("]:")
                .ok_or_else(|| InvalidTargetAddr(s.to_owned()))?;
            let port = port.parse().map_err(|_| InvalidTargetAddr(s.to_owned()))?;
            return Ok(Self::new(host, port));
        }

        let caps = TARGET_ADDR_RE
            .captures(s)
            .ok_or_else(|| InvalidTargetAddr(s.to_owned()))?;
        let port = caps[2]
            .parse::<u16>()
            .map_err(|_| InvalidTargetAddr(s.to_owned()))?;
        Ok(Self::new(&caps[1], port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_target_addr() {
        assert_eq!(
            "1.2.3.4:443".parse::<TargetAddr>().unwrap(),
            TargetAddr::new("1.2.3.4", 443)
        );
        assert_eq!(
            "1.2.3.4-8443".parse::<TargetAddr>().unwrap(),
            TargetAddr::new("1.2.3.4", 8443)
        );
        assert_eq!(
            "relay.example.com=7300".parse::<TargetAddr>().unwrap(),
            TargetAddr::new("relay.example.com", 7300)
        );
        assert_eq!(
            "my-proxy.example.com-443".parse::<TargetAddr>().unwrap(),
            TargetAddr::new("my-proxy.example.com", 443)
        );
        assert_eq!(
            "[2001:db8::1]:53".parse::<TargetAddr>().unwrap(),
            TargetAddr::new("2001:db8::1", 53)
        );
    }

    #[test]
    fn test_parse_target_addr_rejects_garbage() {
        assert!("example.com".parse::<TargetAddr>().is_err());
        assert!("example.com:".parse::<TargetAddr>().is_err());
        assert!("example.com:70000".parse::<TargetAddr>().is_err());
        assert!("[::1]53".parse::<TargetAddr>().is_err());
    }

    #[test]
    fn test_display_target_addr() {
        assert_eq!(TargetAddr::new("example.com", 80).to_string(), "example.com:80");
        assert_eq!(TargetAddr::new("::1", 53).to_string(), "[::1]:53");
    }
}
