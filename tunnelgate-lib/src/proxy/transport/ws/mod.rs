use std::{
    fmt::Debug,
    io,
    pin::Pin,
    task::{Context, Poll},
};

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures::{Sink, Stream, ready};

use crate::common::errors::map_io_error;

/// An upgraded websocket seen as binary chunks.
///
/// Each binary (or text) message is one chunk; control frames are skipped and
/// a close frame ends the stream.
pub struct WebsocketTransport {
    inner: WebSocket,
}

impl Debug for WebsocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebsocketTransport").finish()
    }
}

impl WebsocketTransport {
    pub fn new(inner: WebSocket) -> Self {
        Self { inner }
    }
}

impl Stream for WebsocketTransport {
    type Item = io::Result<Bytes>;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        loop {
            let msg = match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                None => return Poll::Ready(None),
                Some(Err(e)) => return Poll::Ready(Some(Err(map_io_error(e)))),
                Some(Ok(msg)) => msg,
            };
            match msg {
                Message::Binary(data) => return Poll::Ready(Some(Ok(data))),
                Message::Text(text) => {
                    return Poll::Ready(Some(Ok(Bytes::copy_from_slice(
                        text.as_str().as_bytes(),
                    ))));
                }
                Message::Close(_) => return Poll::Ready(None),
                Message::Ping(_) | Message::Pong(_) => continue,
            }
        }
    }
}

impl Sink<Bytes> for WebsocketTransport {
    type Error = io::Error;

    fn poll_ready(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_ready(cx).map_err(map_io_error)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        Pin::new(&mut self.inner)
            .start_send(Message::Binary(item))
            .map_err(map_io_error)
    }

    fn poll_flush(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_flush(cx).map_err(map_io_error)
    }

    fn poll_close(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        Pin::new(&mut self.inner).poll_close(cx).map_err(map_io_error)
    }
}
