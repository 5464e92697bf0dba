//! Per-connection relay: sniff the first chunk, decode its header, then pump
//! bytes between the client and one outbound connection until either side
//! goes away.

use std::{
    fmt::{Display, Formatter},
    future::Future,
    io,
    sync::Arc,
};

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use futures::{Sink, Stream, StreamExt, stream};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, trace, warn};

use crate::{
    app::session_table::TrackedSession,
    config::RelayConfig,
    proxy::{
        codec::ParseError,
        inbound::{InboundAdapter, InboundWriter},
        shadowsocks::DNS_PORT,
        sniffer,
        utils::Dialer,
    },
    session::{Network, TargetAddr},
};

mod tcp;
mod udp;

pub use tcp::TcpRelay;
pub use udp::{UdpRelay, encode_udp_frame};

const BUF_SIZE: usize = 16 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("header parse error: {0}")]
    HeaderParse(#[from] ParseError),
    #[error("early data decode error: {0}")]
    EarlyData(#[from] base64::DecodeError),
    #[error("dial {target} failed: {source}")]
    OutboundDial {
        target: TargetAddr,
        #[source]
        source: io::Error,
    },
    #[error("outbound io error: {0}")]
    OutboundIo(#[source] io::Error),
    #[error("relay io error: {0}")]
    Relay(#[source] io::Error),
    #[error("inbound transport error: {0}")]
    Inbound(#[source] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sniffing,
    Connecting,
    Relaying,
    Closed,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Sniffing => write!(f, "sniffing"),
            Phase::Connecting => write!(f, "connecting"),
            Phase::Relaying => write!(f, "relaying"),
            Phase::Closed => write!(f, "closed"),
        }
    }
}

/// One accepted client connection.
pub struct RelaySession {
    config: Arc<RelayConfig>,
    dialer: Arc<dyn Dialer>,
    fallback: Option<TargetAddr>,
    tracker: TrackedSession,
    phase: Phase,
}

impl RelaySession {
    /// `fallback` overrides the configured fallback target for this session.
    pub fn new(
        config: Arc<RelayConfig>,
        dialer: Arc<dyn Dialer>,
        fallback: Option<TargetAddr>,
        tracker: TrackedSession,
    ) -> Self {
        let fallback = fallback.or_else(|| config.fallback.clone());
        Self {
            config,
            dialer,
            fallback,
            tracker,
            phase: Phase::Sniffing,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn transition(&mut self, next: Phase) {
        trace!(
            "session {} phase {} -> {}",
            self.tracker.id(),
            self.phase,
            next
        );
        self.phase = next;
    }

    /// Drives the session to completion. The client transport is closed
    /// exactly once on the way out, whatever the outcome.
    pub async fn run<R, W>(
        mut self,
        reader: R,
        writer: W,
        early_data: Option<String>,
    ) -> Result<(), RelayError>
    where
        R: Stream<Item = io::Result<Bytes>> + Unpin + Send,
        W: Sink<Bytes, Error = io::Error> + Unpin + Send,
    {
        let mut writer = InboundWriter::new(writer);
        let result = match InboundAdapter::new(reader, early_data.as_deref()) {
            Ok(mut inbound) => {
                let result = self.drive(&mut inbound, &mut writer).await;
                inbound.close();
                result
            }
            Err(e) => Err(e.into()),
        };

        self.transition(Phase::Closed);
        writer.close().await;

        match &result {
            Ok(()) => debug!("session {} closed", self.tracker.id()),
            Err(e) => warn!("session {} closed: {}", self.tracker.id(), e),
        }
        result
    }

    async fn drive<S, W>(
        &mut self,
        inbound: &mut S,
        writer: &mut InboundWriter<W>,
    ) -> Result<(), RelayError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
        W: Sink<Bytes, Error = io::Error> + Unpin + Send,
    {
        let first = match inbound.next().await {
            None => return Ok(()),
            Some(chunk) => chunk.map_err(RelayError::Inbound)?,
        };

        let protocol = sniffer::detect(&first);
        let dest = protocol.parse_header(&first)?;
        let payload = first.slice(dest.payload_offset..);

        let mut backlog = Vec::new();
        if dest.is_udp || dest.port == DNS_PORT {
            let target = if dest.port == DNS_PORT {
                self.config.dns_server.clone()
            } else {
                dest.target()
            };
            info!(
                "session {} [{}:{} -> UDP] {} via {}",
                self.tracker.id(),
                dest.address,
                dest.port,
                protocol,
                self.config.udp_relay
            );
            self.tracker.set_route(protocol, dest.target(), Network::Udp);
            self.transition(Phase::Connecting);

            let mut relay = UdpRelay::new(
                self.dialer.clone(),
                self.config.udp_relay.clone(),
                target,
                dest.response_preamble,
            );
            if !connect_while_watching(inbound, &mut backlog, relay.connect()).await? {
                return Ok(());
            }
            self.transition(Phase::Relaying);
            let mut inbound =
                stream::iter(backlog.into_iter().map(Ok::<_, io::Error>)).chain(inbound);
            relay.run(&mut inbound, writer, payload).await
        } else {
            info!(
                "session {} [{}:{} -> TCP] {}",
                self.tracker.id(),
                dest.address,
                dest.port,
                protocol
            );
            self.tracker.set_route(protocol, dest.target(), Network::Tcp);
            self.transition(Phase::Connecting);

            let mut relay = TcpRelay::new(
                self.dialer.clone(),
                dest.target(),
                self.fallback.clone(),
                payload,
                dest.response_preamble,
            );
            if !connect_while_watching(inbound, &mut backlog, relay.connect()).await? {
                relay.close().await;
                return Ok(());
            }
            self.transition(Phase::Relaying);
            let mut inbound =
                stream::iter(backlog.into_iter().map(Ok::<_, io::Error>)).chain(inbound);
            relay.run(&mut inbound, writer).await
        }
    }
}

/// Awaits `connecting` while still reading the client. Chunks that arrive in
/// the meantime are kept in `backlog`, in order. Returns false when the
/// client goes away first, in which case `connecting` is dropped and the dial
/// with it.
async fn connect_while_watching<S, F>(
    inbound: &mut S,
    backlog: &mut Vec<Bytes>,
    connecting: F,
) -> Result<bool, RelayError>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
    F: Future<Output = Result<(), RelayError>>,
{
    tokio::pin!(connecting);
    loop {
        tokio::select! {
            r = &mut connecting => return r.map(|_| true),
            chunk = inbound.next() => match chunk {
                Some(Ok(chunk)) => backlog.push(chunk),
                Some(Err(e)) => return Err(RelayError::Inbound(e)),
                None => {
                    debug!("client went away while connecting");
                    return Ok(false);
                }
            },
        }
    }
}

/// Where client chunks go once the outbound side is up.
#[async_trait]
trait OutboundWriter: Send {
    async fn forward(&mut self, chunk: Bytes) -> Result<(), RelayError>;
}

/// Client -> outbound, one chunk at a time. Ends cleanly when the client
/// closes its side.
async fn pump_inbound<S, O>(inbound: &mut S, outbound: &mut O) -> Result<(), RelayError>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
    O: OutboundWriter,
{
    while let Some(chunk) = inbound.next().await {
        let chunk = chunk.map_err(RelayError::Inbound)?;
        outbound.forward(chunk).await?;
    }
    debug!("inbound transport closed");
    Ok(())
}

/// Outbound -> client until the outbound side ends. Returns the read error
/// that stopped it, `None` on a clean EOF. `received` counts bytes as soon as
/// they are read, so it stays accurate if the pump is dropped mid-send. The
/// response preamble, when present, is glued to the first chunk and then
/// dropped for good.
async fn pump_outbound<R, W>(
    reader: &mut R,
    writer: &mut InboundWriter<W>,
    preamble: &mut Option<Bytes>,
    received: &mut u64,
) -> Result<Option<io::Error>, RelayError>
where
    R: AsyncRead + Unpin + Send,
    W: Sink<Bytes, Error = io::Error> + Unpin + Send,
{
    let mut buf = BytesMut::with_capacity(BUF_SIZE);
    loop {
        buf.reserve(BUF_SIZE);
        let n = match reader.read_buf(&mut buf).await {
            Ok(0) => return Ok(None),
            Ok(n) => n,
            Err(e) => return Ok(Some(e)),
        };
        *received += n as u64;

        let chunk = buf.split().freeze();
        let chunk = match preamble.take() {
            Some(p) => {
                let mut joined = BytesMut::with_capacity(p.len() + chunk.len());
                joined.put(p);
                joined.put(chunk);
                joined.freeze()
            }
            None => chunk,
        };
        writer.send(chunk).await.map_err(RelayError::Relay)?;
    }
}
