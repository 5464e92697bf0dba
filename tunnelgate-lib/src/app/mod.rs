pub mod inbound;
pub mod logging;
pub mod session_table;
