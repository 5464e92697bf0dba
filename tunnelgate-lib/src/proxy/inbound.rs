use std::{
    io,
    pin::Pin,
    task::{Context, Poll},
};

use base64::{
    Engine,
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
};
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt, ready};
use tracing::{debug, trace};

/// base64url, with or without padding.
const EARLY_DATA_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decodes the early data side channel. An empty value means there is none.
/// `+` and `/` are accepted in place of `-` and `_`.
pub fn decode_early_data(
    value: Option<&str>,
) -> Result<Option<Bytes>, base64::DecodeError> {
    let value = match value.map(str::trim) {
        None | Some("") => return Ok(None),
        Some(v) => v,
    };
    let normalized = value.replace('+', "-").replace('/', "_");
    let decoded = EARLY_DATA_ENGINE.decode(normalized)?;
    Ok((!decoded.is_empty()).then(|| Bytes::from(decoded)))
}

/// The client side of a session as a sequence of byte chunks.
///
/// Early data, if any, is yielded before the first chunk read from the
/// transport. Chunks are passed through as they arrive.
pub struct InboundAdapter<S> {
    inner: Option<S>,
    early_data: Option<Bytes>,
}

impl<S> InboundAdapter<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    pub fn new(
        inner: S,
        early_data: Option<&str>,
    ) -> Result<Self, base64::DecodeError> {
        let early_data = decode_early_data(early_data)?;
        if let Some(data) = &early_data {
            debug!("inbound carries {} bytes of early data", data.len());
        }
        Ok(Self {
            inner: Some(inner),
            early_data,
        })
    }

    /// Stops delivery and releases the transport. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.early_data = None;
        if self.inner.take().is_some() {
            trace!("inbound reader released");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl<S> Stream for InboundAdapter<S>
where
    S: Stream<Item = io::Result<Bytes>> + Unpin,
{
    type Item = io::Result<Bytes>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if let Some(data) = this.early_data.take() {
            return Poll::Ready(Some(Ok(data)));
        }

        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        match ready!(inner.poll_next_unpin(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(e)) => {
                this.inner = None;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.inner = None;
                Poll::Ready(None)
            }
        }
    }
}

/// Write side of the client transport. Closing is idempotent: the underlying
/// sink is closed at most once, and writes after close fail.
pub struct InboundWriter<W> {
    inner: W,
    closed: bool,
}

impl<W> InboundWriter<W>
where
    W: Sink<Bytes, Error = io::Error> + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    pub async fn send(&mut self, chunk: Bytes) -> io::Result<()> {
        if self.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "inbound transport closed",
            ));
        }
        self.inner.send(chunk).await
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.inner.close().await {
            debug!("closing inbound transport: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
