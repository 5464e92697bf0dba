use tokio::io::{AsyncRead, AsyncWrite};

pub mod codec;
pub mod inbound;
pub mod relay;
pub mod shadowsocks;
pub mod sniffer;
pub mod transport;
pub mod trojan;
pub mod utils;
pub mod vmess;

pub trait ProxyStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T> ProxyStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}
pub type AnyStream = Box<dyn ProxyStream>;
