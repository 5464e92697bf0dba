//! Trojan-style request header.
//!
//! ```text
//! +-----------------------+---------+-----+------+----------+------+---------+---------+
//! | hex(SHA224(password)) |  CRLF   | CMD | ATYP | DST.ADDR | PORT |  CRLF   | Payload |
//! +-----------------------+---------+-----+------+----------+------+---------+---------+
//! |          56           | X'0D0A' |  1  |  1   | Variable |  2   | X'0D0A' |   ...   |
//! +-----------------------+---------+-----+------+----------+------+---------+---------+
//! ```
//!
//! The credential is not checked here.

use crate::proxy::codec::{
    AddressTypeCodes, DestinationDescriptor, HeaderReader, ParseError,
};

pub const CREDENTIAL_LEN: usize = 56;
const TERMINATOR_LEN: usize = 2;
/// Start of the command byte.
pub const DATA_OFFSET: usize = CREDENTIAL_LEN + TERMINATOR_LEN;
/// CMD + ATYP + shortest address + PORT.
const MIN_DATA_LEN: usize = 6;

pub const COMMAND_TCP: u8 = 1;
pub const COMMAND_UDP: u8 = 3;

const ADDRESS_CODES: AddressTypeCodes = AddressTypeCodes {
    ipv4: 1,
    domain: 3,
    ipv6: 4,
};

pub fn parse_header(buf: &[u8]) -> Result<DestinationDescriptor, ParseError> {
    if buf.len() < DATA_OFFSET + MIN_DATA_LEN {
        return Err(ParseError::Truncated {
            needed: DATA_OFFSET + MIN_DATA_LEN,
            available: buf.len(),
        });
    }

    let mut r = HeaderReader::at(buf, DATA_OFFSET)?;
    let is_udp = match r.read_u8()? {
        COMMAND_TCP => false,
        COMMAND_UDP => true,
        cmd => return Err(ParseError::InvalidCommand(cmd)),
    };

    let (address_type, address) = r.read_address(&ADDRESS_CODES)?;
    let port = r.read_u16()?;
    r.skip(TERMINATOR_LEN)?;

    Ok(DestinationDescriptor {
        address_type,
        address,
        port,
        is_udp,
        payload_offset: r.position(),
        response_preamble: None,
    })
}
