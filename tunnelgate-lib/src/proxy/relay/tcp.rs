use std::{io, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, Stream};
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    sync::{Mutex, oneshot},
};
use tracing::{debug, info, warn};

use super::{OutboundWriter, RelayError, pump_inbound, pump_outbound};
use crate::{
    proxy::{AnyStream, inbound::InboundWriter, utils::Dialer},
    session::TargetAddr,
};

/// The write side of the current outbound connection, shared by both pumps.
#[derive(Default)]
struct OutboundState {
    writer: Option<WriteHalf<AnyStream>>,
    /// Client chunks that still have to reach the next connection, in order.
    backlog: Vec<Bytes>,
    /// Fired at most once, when a client chunk cannot be written.
    on_write_error: Option<oneshot::Sender<io::Error>>,
}

type OutboundSlot = Arc<Mutex<OutboundState>>;

/// A TCP relay to the decoded destination, with a single retry against the
/// fallback target when the first connection fails or closes without ever
/// sending a byte back.
pub struct TcpRelay {
    dialer: Arc<dyn Dialer>,
    target: TargetAddr,
    fallback: Option<TargetAddr>,
    /// Written to every connection right after it is opened.
    payload: Bytes,
    preamble: Option<Bytes>,
    outbound: OutboundSlot,
    reader: Option<ReadHalf<AnyStream>>,
    write_error: Option<oneshot::Receiver<io::Error>>,
    retried: bool,
    saw_incoming: bool,
}

impl TcpRelay {
    pub fn new(
        dialer: Arc<dyn Dialer>,
        target: TargetAddr,
        fallback: Option<TargetAddr>,
        payload: Bytes,
        preamble: Option<Bytes>,
    ) -> Self {
        Self {
            dialer,
            target,
            fallback,
            payload,
            preamble,
            outbound: Arc::new(Mutex::new(OutboundState::default())),
            reader: None,
            write_error: None,
            retried: false,
            saw_incoming: false,
        }
    }

    fn can_retry(&self) -> bool {
        !self.retried && !self.saw_incoming && self.fallback.is_some()
    }

    /// Opens the first connection and writes the initial payload to it,
    /// falling back once if that fails.
    pub async fn connect(&mut self) -> Result<(), RelayError> {
        let target = self.target.clone();
        match self.attempt(&target).await {
            Ok(()) => Ok(()),
            Err(e) if self.can_retry() => {
                warn!("{}, retrying via fallback", e);
                self.retry().await
            }
            Err(e) => Err(e),
        }
    }

    async fn retry(&mut self) -> Result<(), RelayError> {
        self.retried = true;
        let Some(fallback) = self.fallback.clone() else {
            return Ok(());
        };
        info!("retrying {} via fallback {}", self.target, fallback);
        self.attempt(&fallback).await
    }

    /// Replaces the current outbound connection with a fresh one to `target`.
    /// The slot stays locked for the whole swap, so client chunks arriving
    /// meanwhile queue up and land on the new connection after the payload
    /// and the backlog.
    async fn attempt(&mut self, target: &TargetAddr) -> Result<(), RelayError> {
        let slot = self.outbound.clone();
        let mut state = slot.lock().await;
        if let Some(mut old) = state.writer.take() {
            if let Err(e) = old.shutdown().await {
                debug!("shutting down previous outbound: {}", e);
            }
        }
        state.on_write_error = None;
        self.reader = None;
        self.write_error = None;

        let stream = self
            .dialer
            .dial(target.host.clone(), target.port)
            .await
            .map_err(|source| RelayError::OutboundDial {
                target: target.clone(),
                source,
            })?;
        let (reader, mut writer) = tokio::io::split(stream);
        if !self.payload.is_empty() {
            writer
                .write_all(&self.payload)
                .await
                .map_err(RelayError::OutboundIo)?;
        }
        for chunk in &state.backlog {
            writer
                .write_all(chunk)
                .await
                .map_err(RelayError::OutboundIo)?;
        }
        if !state.backlog.is_empty() {
            debug!("replayed {} client chunks to {}", state.backlog.len(), target);
            state.backlog.clear();
        }
        debug!("connected to {}", target);

        let (tx, rx) = oneshot::channel();
        state.writer = Some(writer);
        state.on_write_error = Some(tx);
        self.reader = Some(reader);
        self.write_error = Some(rx);
        Ok(())
    }

    /// Relays in both directions until either side is done. Must follow a
    /// successful [`TcpRelay::connect`].
    pub async fn run<S, W>(
        &mut self,
        inbound: &mut S,
        writer: &mut InboundWriter<W>,
    ) -> Result<(), RelayError>
    where
        S: Stream<Item = io::Result<Bytes>> + Unpin + Send,
        W: Sink<Bytes, Error = io::Error> + Unpin + Send,
    {
        let mut forwarder = TcpForwarder {
            slot: self.outbound.clone(),
        };
        let result = tokio::select! {
            r = pump_inbound(inbound, &mut forwarder) => r,
            r = self.pump_outbound_with_retry(writer) => r,
        };
        self.close().await;
        result
    }

    /// A connection ends when its read side does or when a client chunk
    /// fails to reach it, whichever comes first. Either way the retry rules
    /// are the same.
    async fn pump_outbound_with_retry<W>(
        &mut self,
        writer: &mut InboundWriter<W>,
    ) -> Result<(), RelayError>
    where
        W: Sink<Bytes, Error = io::Error> + Unpin + Send,
    {
        loop {
            let (Some(mut reader), Some(write_error)) =
                (self.reader.take(), self.write_error.take())
            else {
                return Ok(());
            };

            let mut received = 0;
            let error = tokio::select! {
                r = pump_outbound(&mut reader, writer, &mut self.preamble, &mut received) => r?,
                Ok(e) = write_error => Some(e),
            };
            drop(reader);
            if received > 0 {
                self.saw_incoming = true;
            }

            if !self.can_retry() {
                return match error {
                    Some(e) => Err(RelayError::OutboundIo(e)),
                    None => {
                        debug!("outbound {} closed", self.target);
                        Ok(())
                    }
                };
            }

            match error {
                Some(e) => warn!("outbound {} failed before replying: {}", self.target, e),
                None => warn!("outbound {} closed without replying", self.target),
            }
            self.retry().await?;
        }
    }

    /// Shuts the outbound connection down. Safe to call more than once.
    pub async fn close(&mut self) {
        self.reader = None;
        self.write_error = None;
        let mut state = self.outbound.lock().await;
        state.backlog.clear();
        state.on_write_error = None;
        if let Some(mut writer) = state.writer.take() {
            if let Err(e) = writer.shutdown().await {
                debug!("shutting down outbound: {}", e);
            }
        }
    }
}

struct TcpForwarder {
    slot: OutboundSlot,
}

#[async_trait]
impl OutboundWriter for TcpForwarder {
    /// A failed write hands the chunk to the backlog and reports the error
    /// to the outbound pump, which decides between a retry and giving up.
    async fn forward(&mut self, chunk: Bytes) -> Result<(), RelayError> {
        let mut state = self.slot.lock().await;
        let Some(w) = state.writer.as_mut() else {
            // the connection is being replaced
            state.backlog.push(chunk);
            return Ok(());
        };
        let written = w.write_all(&chunk).await;
        if let Err(e) = written {
            debug!("outbound write failed: {}", e);
            state.writer = None;
            state.backlog.push(chunk);
            if let Some(tx) = state.on_write_error.take() {
                let _ = tx.send(e);
            }
        }
        Ok(())
    }
}
