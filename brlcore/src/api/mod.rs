//! Arbitration of the shared display among clients: who owns which tty,
//! who (if anyone) holds the raw channel, and where each key event goes.

pub mod rawgate;
pub mod registry;
pub mod router;
