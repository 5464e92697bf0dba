//! Message framing for clients that front the tunnel with a gRPC-shaped
//! HTTP facade instead of a websocket, where each request and response body
//! is a run of `flag(1) | length(4, big endian) | payload(length)` messages.
//!
//! The payload is opaque here. This framing never wraps the tunnel headers
//! themselves.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::common::errors::new_io_error;

const HEADER_LEN: usize = 5;
const DEFAULT_MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrpcFrame {
    pub compressed: bool,
    pub data: Bytes,
}

impl GrpcFrame {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            compressed: false,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GrpcFrameCodec {
    max_frame_len: usize,
}

impl Default for GrpcFrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LEN)
    }
}

impl GrpcFrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }
}

impl Decoder for GrpcFrameCodec {
    type Error = io::Error;
    type Item = GrpcFrame;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let compressed = match src[0] {
            0 => false,
            1 => true,
            flag => return Err(new_io_error(format!("invalid frame flag: {flag}"))),
        };
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_frame_len {
            return Err(new_io_error(format!(
                "frame of {len} bytes exceeds limit of {}",
                self.max_frame_len
            )));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let data = src.split_to(len).freeze();
        Ok(Some(GrpcFrame { compressed, data }))
    }
}

impl Encoder<GrpcFrame> for GrpcFrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: GrpcFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.data.len() > self.max_frame_len {
            return Err(new_io_error(format!(
                "frame of {} bytes exceeds limit of {}",
                item.data.len(),
                self.max_frame_len
            )));
        }
        dst.reserve(HEADER_LEN + item.data.len());
        dst.put_u8(item.compressed as u8);
        dst.put_u32(item.data.len() as u32);
        dst.put_slice(&item.data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;

    #[test]
    fn test_encode_layout() {
        let mut buf = BytesMut::new();
        GrpcFrameCodec::default()
            .encode(GrpcFrame::new(&b"{\"ok\":true}"[..]), &mut buf)
            .unwrap();
        assert_eq!(&buf[..5], &[0, 0, 0, 0, 11]);
        assert_eq!(&buf[5..], b"{\"ok\":true}");
    }

    #[test]
    fn test_decode_waits_for_whole_frame() {
        let mut codec = GrpcFrameCodec::default();
        let mut buf = BytesMut::from(&[1u8, 0, 0, 0, 3, b'a'][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"bc\x00\x00");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.compressed);
        assert_eq!(frame.data, &b"abc"[..]);
        // start of the next frame stays buffered
        assert_eq!(&buf[..], &[0, 0]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_rejects_bad_flag_and_oversize() {
        let mut codec = GrpcFrameCodec::new(8);
        let mut buf = BytesMut::from(&[2u8, 0, 0, 0, 0][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut buf = BytesMut::from(&[0u8, 0, 0, 0, 9][..]);
        assert!(codec.decode(&mut buf).is_err());

        let mut out = BytesMut::new();
        assert!(codec.encode(GrpcFrame::new(vec![0u8; 9]), &mut out).is_err());
    }

    #[tokio::test]
    async fn test_framed_stream() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, GrpcFrameCodec::default());
        let mut reader = FramedRead::new(server, GrpcFrameCodec::default());

        writer.send(GrpcFrame::new(&b"first"[..])).await.unwrap();
        writer.send(GrpcFrame::new(Bytes::new())).await.unwrap();
        drop(writer);

        assert_eq!(reader.next().await.unwrap().unwrap().data, &b"first"[..]);
        assert!(reader.next().await.unwrap().unwrap().data.is_empty());
        assert!(reader.next().await.is_none());
    }
}
