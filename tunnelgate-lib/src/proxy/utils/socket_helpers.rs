use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use socket2::TcpKeepalive;
use tokio::{
    net::{TcpSocket, TcpStream, lookup_host},
    time::timeout,
};
use tracing::debug;

use crate::{common::errors::new_io_error, proxy::AnyStream};

pub fn apply_tcp_options(s: &TcpStream) -> std::io::Result<()> {
    #[cfg(not(target_os = "windows"))]
    {
        let s = socket2::SockRef::from(s);
        s.set_tcp_keepalive(
            &TcpKeepalive::new()
                .with_time(Duration::from_secs(10))
                .with_interval(Duration::from_secs(1))
                .with_retries(3),
        )
    }
    #[cfg(target_os = "windows")]
    {
        let s = socket2::SockRef::from(s);
        s.set_tcp_keepalive(
            &TcpKeepalive::new()
                .with_time(Duration::from_secs(10))
                .with_interval(Duration::from_secs(1)),
        )
    }
}

pub async fn new_tcp_stream(endpoint: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(endpoint),
        socket2::Type::STREAM,
        None,
    )?;

    socket.set_keepalive(true)?;
    socket.set_tcp_nodelay(true)?;
    socket.set_nonblocking(true)?;

    let stream = TcpSocket::from_std_stream(socket.into())
        .connect(endpoint)
        .await?;
    apply_tcp_options(&stream)?;
    Ok(stream)
}

/// Opens outbound byte streams. The relay only ever talks to this seam.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, host: String, port: u16) -> io::Result<AnyStream>;
}

/// Plain TCP. Name resolution and the connect attempts share one deadline.
pub struct TcpDialer {
    timeout: Duration,
}

impl TcpDialer {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in lookup_host((host, port)).await? {
            match new_tcp_stream(addr).await {
                Ok(s) => return Ok(s),
                Err(e) => {
                    debug!("connect {} ({}) failed: {}", host, addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err
            .unwrap_or_else(|| new_io_error(format!("no address for {host}"))))
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, host: String, port: u16) -> io::Result<AnyStream> {
        let stream = timeout(self.timeout, self.connect(&host, port))
            .await
            .map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("dial {host}:{port} timed out"),
                )
            })??;
        debug!("connected to {}:{}", host, port);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[tokio::test]
    async fn test_dial_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (mut s, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            s.write_all(&buf).await.unwrap();
        });

        let dialer = TcpDialer::new(Duration::from_secs(5));
        let mut stream = dialer.dial("127.0.0.1".to_owned(), port).await.unwrap();
        stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let dialer = TcpDialer::new(Duration::from_secs(5));
        assert!(dialer.dial("127.0.0.1".to_owned(), port).await.is_err());
    }
}
