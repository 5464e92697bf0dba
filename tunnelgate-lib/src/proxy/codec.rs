//! Shared pieces of the tunnel header decoders.
//!
//! Every supported header ends in the same three address encodings; only the
//! type codes and the bytes in front of the address differ. Each decoder walks
//! its fixed layout with a [`HeaderReader`], which turns any read past the end
//! of the buffer into [`ParseError::Truncated`].

use std::net::{Ipv4Addr, Ipv6Addr};

use bytes::Bytes;

use crate::session::{AddressType, Network, TargetAddr};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("invalid address type: {0}")]
    InvalidAddressType(u8),
    #[error("command {0} is not supported")]
    InvalidCommand(u8),
    #[error("header truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },
    #[error("domain name is not valid utf-8")]
    InvalidDomain,
}

/// Where the first chunk of a session wants to go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationDescriptor {
    pub address_type: AddressType,
    pub address: String,
    pub port: u16,
    pub is_udp: bool,
    /// Offset of the first payload byte in the parsed buffer.
    pub payload_offset: usize,
    /// Echoed once in front of the first chunk sent back to the client.
    pub response_preamble: Option<Bytes>,
}

impl DestinationDescriptor {
    pub fn target(&self) -> TargetAddr {
        TargetAddr::new(self.address.clone(), self.port)
    }

    pub fn network(&self) -> Network {
        if self.is_udp { Network::Udp } else { Network::Tcp }
    }
}

/// Per-protocol wire codes for the three address encodings.
pub(crate) struct AddressTypeCodes {
    pub ipv4: u8,
    pub domain: u8,
    pub ipv6: u8,
}

impl AddressTypeCodes {
    fn resolve(&self, code: u8) -> Result<AddressType, ParseError> {
        match code {
            c if c == self.ipv4 => Ok(AddressType::Ipv4),
            c if c == self.domain => Ok(AddressType::Domain),
            c if c == self.ipv6 => Ok(AddressType::Ipv6),
            c => Err(ParseError::InvalidAddressType(c)),
        }
    }
}

pub(crate) struct HeaderReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> HeaderReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn at(buf: &'a [u8], pos: usize) -> Result<Self, ParseError> {
        if pos > buf.len() {
            return Err(ParseError::Truncated {
                needed: pos,
                available: buf.len(),
            });
        }
        Ok(Self { buf, pos })
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], ParseError> {
        let end = self.pos + n;
        if end > self.buf.len() {
            return Err(ParseError::Truncated {
                needed: end,
                available: self.buf.len(),
            });
        }
        let s = &self.buf[self.pos..end];
        self.pos = end;
        Ok(s)
    }

    pub fn skip(&mut self, n: usize) -> Result<(), ParseError> {
        self.take(n).map(|_| ())
    }

    pub fn read_u8(&mut self) -> Result<u8, ParseError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ParseError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads an address type byte followed by the address it announces.
    pub fn read_address(
        &mut self,
        codes: &AddressTypeCodes,
    ) -> Result<(AddressType, String), ParseError> {
        let typ = codes.resolve(self.read_u8()?)?;
        let address = match typ {
            AddressType::Ipv4 => {
                let b = self.take(4)?;
                Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string()
            }
            AddressType::Domain => {
                let len = self.read_u8()? as usize;
                let b = self.take(len)?;
                std::str::from_utf8(b)
                    .map_err(|_| ParseError::InvalidDomain)?
                    .to_owned()
            }
            AddressType::Ipv6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(self.take(16)?);
                // full form, one group per segment, no `::` compression
                Ipv6Addr::from(octets)
                    .segments()
                    .iter()
                    .map(|seg| format!("{seg:x}"))
                    .collect::<Vec<_>>()
                    .join(":")
            }
        };
        Ok((typ, address))
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use std::net::{Ipv4Addr, Ipv6Addr};

    pub enum Addr<'a> {
        V4(Ipv4Addr),
        Domain(&'a str),
        V6(Ipv6Addr),
    }

    /// Writes `code` + address bytes, as all three headers do.
    pub fn put_address(buf: &mut Vec<u8>, code: u8, addr: &Addr<'_>) {
        buf.push(code);
        match addr {
            Addr::V4(ip) => buf.extend_from_slice(&ip.octets()),
            Addr::Domain(d) => {
                buf.push(d.len() as u8);
                buf.extend_from_slice(d.as_bytes());
            }
            Addr::V6(ip) => buf.extend_from_slice(&ip.octets()),
        }
    }
}
