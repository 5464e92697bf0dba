use std::fmt::{Display, Formatter};

use serde::Serialize;

use crate::proxy::{
    codec::{DestinationDescriptor, ParseError},
    shadowsocks, trojan, vmess,
};

/// Tunnel protocols recognised on the first inbound chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Trojan,
    Vmess,
    Shadowsocks,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Trojan => write!(f, "trojan"),
            Protocol::Vmess => write!(f, "vmess"),
            Protocol::Shadowsocks => write!(f, "shadowsocks"),
        }
    }
}

impl Protocol {
    pub fn parse_header(
        self,
        buf: &[u8],
    ) -> Result<DestinationDescriptor, ParseError> {
        match self {
            Protocol::Trojan => trojan::parse_header(buf),
            Protocol::Vmess => vmess::parse_header(buf),
            Protocol::Shadowsocks => shadowsocks::parse_header(buf),
        }
    }
}

const TROJAN_MIN_LEN: usize = 62;
const VMESS_ID_RANGE: std::ops::Range<usize> = 1..1 + vmess::ID_LEN;

/// Classifies a first chunk. Never fails: anything that looks like neither
/// Trojan nor VMess is taken to be Shadowsocks.
pub fn detect(prefix: &[u8]) -> Protocol {
    if looks_like_trojan(prefix) {
        Protocol::Trojan
    } else if looks_like_vmess(prefix) {
        Protocol::Vmess
    } else {
        Protocol::Shadowsocks
    }
}

/// CRLF right after the 56-byte credential, followed by a plausible
/// command and address type.
fn looks_like_trojan(prefix: &[u8]) -> bool {
    if prefix.len() < TROJAN_MIN_LEN {
        return false;
    }
    let at = trojan::CREDENTIAL_LEN;
    prefix[at] == b'\r'
        && prefix[at + 1] == b'\n'
        && matches!(prefix[at + 2], 0x01 | 0x03 | 0x7f)
        && matches!(prefix[at + 3], 0x01 | 0x03 | 0x04)
}

/// A UUIDv4-shaped user id at offset 1: version nibble 4, variant 10xx.
fn looks_like_vmess(prefix: &[u8]) -> bool {
    let Some(id) = prefix.get(VMESS_ID_RANGE) else {
        return false;
    };
    id[6] >> 4 == 0x4 && (0x8..=0xb).contains(&(id[8] >> 4))
}
