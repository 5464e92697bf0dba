//! Shadowsocks-style request header, already stripped of its AEAD layer:
//! `ATYP | DST.ADDR | PORT | Payload`.
//!
//! There is no command byte; traffic to port 53 is treated as DNS over UDP.

use crate::proxy::codec::{
    AddressTypeCodes, DestinationDescriptor, HeaderReader, ParseError,
};

pub const DNS_PORT: u16 = 53;

const ADDRESS_CODES: AddressTypeCodes = AddressTypeCodes {
    ipv4: 1,
    domain: 3,
    ipv6: 4,
};

pub fn parse_header(buf: &[u8]) -> Result<DestinationDescriptor, ParseError> {
    let mut r = HeaderReader::new(buf);
    let (address_type, address) = r.read_address(&ADDRESS_CODES)?;
    let port = r.read_u16()?;

    Ok(DestinationDescriptor {
        address_type,
        address,
        port,
        is_udp: port == DNS_PORT,
        payload_offset: r.position(),
        response_preamble: None,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use std::net::{Ipv4Addr, Ipv6Addr};

    use super::*;
    use crate::{
        proxy::codec::test_utils::{Addr, put_address},
        session::AddressType,
    };

    pub fn build_header(code: u8, addr: &Addr<'_>, port: u16) -> Vec<u8> {
        let mut buf = Vec::new();
        put_address(&mut buf, code, addr);
        buf.extend_from_slice(&port.to_be_bytes());
        buf
    }

    #[test]
    fn test_parse_ipv4() {
        let mut buf = build_header(1, &Addr::V4(Ipv4Addr::new(10, 0, 0, 7)), 22);
        buf.extend_from_slice(b"SSH-2.0-OpenSSH\r\n");

        let d = parse_header(&buf).unwrap();
        assert_eq!(d.address_type, AddressType::Ipv4);
        assert_eq!(d.address, "10.0.0.7");
        assert_eq!(d.port, 22);
        assert!(!d.is_udp);
        assert_eq!(d.payload_offset, 7);
        assert_eq!(&buf[d.payload_offset..], b"SSH-2.0-OpenSSH\r\n");
    }

    #[test]
    fn test_parse_domain() {
        let mut buf = build_header(3, &Addr::Domain("www.rust-lang.org"), 443);
        buf.push(0x16);

        let d = parse_header(&buf).unwrap();
        assert_eq!(d.address_type, AddressType::Domain);
        assert_eq!(d.address, "www.rust-lang.org");
        assert_eq!(d.port, 443);
        assert_eq!(d.payload_offset, 1 + 1 + 17 + 2);
        assert_eq!(&buf[d.payload_offset..], &[0x16]);
    }

    #[test]
    fn test_parse_ipv6() {
        let buf = build_header(4, &Addr::V6(Ipv6Addr::LOCALHOST), 8443);

        let d = parse_header(&buf).unwrap();
        assert_eq!(d.address_type, AddressType::Ipv6);
        assert_eq!(d.address, "0:0:0:0:0:0:0:1");
        assert_eq!(d.port, 8443);
        assert_eq!(d.payload_offset, buf.len());
    }

    #[test]
    fn test_port_53_is_udp() {
        let buf = build_header(1, &Addr::V4(Ipv4Addr::new(1, 1, 1, 1)), 53);
        let d = parse_header(&buf).unwrap();
        assert!(d.is_udp);
    }

    #[test]
    fn test_invalid_address_type() {
        let buf = build_header(2, &Addr::Domain("example.com"), 443);
        assert_eq!(parse_header(&buf), Err(ParseError::InvalidAddressType(2)));
    }

    #[test]
    fn test_missing_port() {
        let buf = build_header(1, &Addr::V4(Ipv4Addr::LOCALHOST), 443);
        assert!(matches!(
            parse_header(&buf[..5]),
            Err(ParseError::Truncated { .. })
        ));
    }
}
