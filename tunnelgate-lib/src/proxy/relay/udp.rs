use std::{io, sync::Arc};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{Sink, Stream};
use tokio::io::{AsyncWriteExt, WriteHalf};
use tracing::{debug, trace};

use super::{OutboundWriter, RelayError, pump_inbound, pump_outbound};
use crate::{
    proxy::{AnyStream, inbound::InboundWriter, utils::Dialer},
    session::TargetAddr,
};

/// Frames one datagram for the UDP relay host:
/// `udp:<host>:<port>|<payload>`. IPv6 hosts are written unbracketed.
pub fn encode_udp_frame(target: &TargetAddr, payload: &[u8]) -> Bytes {
    let header = format!("udp:{}:{}|", target.host, target.port);
    let mut buf = BytesMut::with_capacity(header.len() + payload.len());
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.freeze()
}

/// Carries datagrams over one TCP connection to the relay host, each
/// client chunk as one frame. There is no fallback retry for UDP.
pub struct UdpRelay {
    dialer: Arc<dyn Dialer>,
    relay: TargetAddr,
    target: TargetAddr,
    preamble: Option<Bytes>,
    stream: Option<AnyStream>,
}

impl UdpRelay {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        relay: TargetAddr,
        target: TargetAddr,
        preamble: Option<Bytes>,
    ) -> Self {
        Self {
            dialer,
            relay,
            target,
            preamble,
            stream: None,
        }
    }

    pub async fn connect(&mut self) -> Result<(), RelayError> {
        let stream = self
            .dialer
            .dial(self.relay.host.clone(), self.relay.port)
            .await
            .map_err(|source| RelayError::OutboundDial {
                target: self.relay.clone(),
                source,
            })?;
        debug!("connected to udp relay {}", self.relay);
        self.stream = Some(stream);
        Ok(())
    }

    /// `first_payload` is what followed the header in the first chunk; only
    /// that part goes into the first frame. Must follow a successful
    /// [`UdpRelay::connect`].
    pub async fn run<S, W>(
        mut self,
        inbound: &mut S,
        writer: &mut InboundWriter<W>,
        first_payload: Bytes,
    ) -> Result<(), RelayError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
        W: Sink<Bytes, Error = io::Error> + Unpin + Send,
    {
        let Some(stream) = self.stream.take() else {
            return Err(RelayError::Relay(io::Error::new(
                io::ErrorKind::NotConnected,
                "udp relay not connected",
            )));
        };
        let (mut reader, relay_writer) = tokio::io::split(stream);
        let mut forwarder = UdpForwarder {
            writer: relay_writer,
            target: self.target.clone(),
        };

        if !first_payload.is_empty() {
            forwarder.forward(first_payload).await?;
        }

        let mut received = 0;
        let result = tokio::select! {
            r = pump_inbound(inbound, &mut forwarder) => r,
            r = pump_outbound(&mut reader, writer, &mut self.preamble, &mut received) => {
                r.and_then(|end| match end {
                    Some(e) => Err(RelayError::Relay(e)),
                    None => Ok(()),
                })
            }
        };
        trace!("udp relay {} returned {} bytes", self.relay, received);

        if let Err(e) = forwarder.writer.shutdown().await {
            debug!("shutting down udp relay connection: {}", e);
        }
        result
    }
}

struct UdpForwarder {
    writer: WriteHalf<AnyStream>,
    target: TargetAddr,
}

#[async_trait]
impl OutboundWriter for UdpForwarder {
    async fn forward(&mut self, chunk: Bytes) -> Result<(), RelayError> {
        let frame = encode_udp_frame(&self.target, &chunk);
        self.writer
            .write_all(&frame)
            .await
            .map_err(RelayError::Relay)
    }
}
