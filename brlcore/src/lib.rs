//! Core of the braille API server: the framed client protocol, per-client
//! sessions, tty arbitration, key routing and the raw-mode gate, all driven
//! by a single-threaded server loop. Hardware access and OS console probing
//! sit behind the capability traits in `driver`.

pub mod api;
pub mod auth;
pub mod bindings;
pub mod driver;
pub mod error;
pub mod logging;
pub mod mask;
pub mod net;

pub use crate::auth::Authenticator;
pub use crate::driver::{Console, Driver, ScreenReader};
pub use crate::error::ApiError;
pub use crate::net::server::{Server, DEFAULT_PORT};
