mod socket_helpers;

pub use socket_helpers::{Dialer, TcpDialer, apply_tcp_options, new_tcp_stream};

#[cfg(test)]
pub use socket_helpers::MockDialer;
