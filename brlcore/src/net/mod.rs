//! The networking modules handle all communication between clients and the
//! server: framing, per-connection sessions and the server loop itself.

pub mod buffer;
pub mod connection;
pub mod packet;
pub mod server;
pub mod support;
