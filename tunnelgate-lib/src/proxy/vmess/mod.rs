//! VMess/VLESS-style request header, without the AEAD envelope:
//!
//! ```text
//! +-----+------+---------+---------+-----+------+------+----------+---------+
//! | Ver |  ID  | OptLen  | Options | Cmd | Port | ATYP | DST.ADDR | Payload |
//! +-----+------+---------+---------+-----+------+------+----------+---------+
//! |  1  |  16  |    1    |  OptLen |  1  |  2   |  1   | Variable |   ...   |
//! +-----+------+---------+---------+-----+------+------+----------+---------+
//! ```
//!
//! Note the port comes before the address here. The client expects
//! `[Ver, 0x00]` in front of the first response chunk.

use bytes::Bytes;

use crate::proxy::codec::{
    AddressTypeCodes, DestinationDescriptor, HeaderReader, ParseError,
};

pub const ID_LEN: usize = 16;

pub const COMMAND_TCP: u8 = 1;
pub const COMMAND_UDP: u8 = 2;

const ADDRESS_CODES: AddressTypeCodes = AddressTypeCodes {
    ipv4: 1,
    domain: 2,
    ipv6: 3,
};

pub fn parse_header(buf: &[u8]) -> Result<DestinationDescriptor, ParseError> {
    let mut r = HeaderReader::new(buf);
    let version = r.read_u8()?;
    r.skip(ID_LEN)?;
    let opt_len = r.read_u8()? as usize;
    r.skip(opt_len)?;

    let is_udp = match r.read_u8()? {
        COMMAND_TCP => false,
        COMMAND_UDP => true,
        cmd => return Err(ParseError::InvalidCommand(cmd)),
    };

    let port = r.read_u16()?;
    let (address_type, address) = r.read_address(&ADDRESS_CODES)?;

    Ok(DestinationDescriptor {
        address_type,
        address,
        port,
        is_udp,
        payload_offset: r.position(),
        response_preamble: Some(Bytes::copy_from_slice(&[version, 0])),
    })
}
