//! Capability seams the server core is built against: the braille `Driver`,
//! the OS `Console` probe and the fallback `ScreenReader` key consumer.

use crate::logging;
use std::net::SocketAddr;

pub type DriverResult<T> = Result<T, DriverError>;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DriverError {
    /// The driver cannot perform the operation at all.
    Unsupported,
    /// The hardware refused or the transfer failed.
    Failed,
}

/// The hardware-facing capability. One implementation per braille display
/// family; the server treats it opaquely and serializes every call through
/// the server loop.
pub trait Driver {
    /// Two-character driver code, e.g. `b"vo"`.
    fn driver_id(&self) -> [u8; 2];

    /// Human-readable terminal name.
    fn driver_name(&self) -> &str;

    /// Display dimensions in cells, `(columns, rows)`.
    fn display_size(&self) -> (u32, u32);

    /// Writes a text line already padded/truncated to the display size.
    /// `cursor` is a 1-based cell index; `None` hides the cursor.
    fn write_cells(&mut self, text: &str, cursor: Option<u32>) -> DriverResult<()>;

    /// Writes raw dot patterns, one byte per cell, full display.
    fn write_dots(&mut self, dots: &[u8]) -> DriverResult<()>;

    /// Writes the status cells.
    fn write_status(&mut self, cells: &[u8]) -> DriverResult<()>;

    /// Whether the display has keys at all.
    fn keys_supported(&self) -> bool;

    /// Non-blocking probe for the next pressed key.
    fn read_key(&mut self) -> Option<u32>;

    /// Maps a raw keycode through the driver's command table.
    fn translate_key(&self, key: u32) -> Option<u32>;

    fn raw_supported(&self) -> bool {
        false
    }

    fn begin_raw(&mut self) -> DriverResult<()> {
        Err(DriverError::Unsupported)
    }

    fn end_raw(&mut self) {}

    fn raw_send(&mut self, _packet: &[u8]) -> DriverResult<()> {
        Err(DriverError::Unsupported)
    }

    /// Non-blocking probe for the next raw byte chunk from the terminal.
    fn raw_recv(&mut self) -> Option<Vec<u8>> {
        None
    }
}

/// Probes the text console the display mirrors. The foreground tty changes
/// underneath the server; the controlling tty resolves the `tty = 0`
/// sentinel against the peer's process.
pub trait Console {
    fn foreground_tty(&self) -> Option<u32>;

    fn controlling_tty(&self, peer: SocketAddr) -> Option<u32>;
}

/// The in-process default consumer of keys whenever no client owns the
/// foreground tty (or the key is masked away from the owner).
pub trait ScreenReader {
    fn deliver_key(&mut self, key: u32);
}

/// Placeholder driver used when no hardware is wired in: an 80x1 display
/// that discards output and produces no keys.
pub struct NullDriver {
    log: logging::Logger,
}

impl NullDriver {
    pub const DISPLAY_SIZE: (u32, u32) = (80, 1);

    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> NullDriver {
        NullDriver {
            log: logging::child(log),
        }
    }
}

impl Driver for NullDriver {
    fn driver_id(&self) -> [u8; 2] {
        *b"no"
    }

    fn driver_name(&self) -> &str {
        "null display"
    }

    fn display_size(&self) -> (u32, u32) {
        Self::DISPLAY_SIZE
    }

    fn write_cells(&mut self, text: &str, cursor: Option<u32>) -> DriverResult<()> {
        logging::debug!(self.log, "write discarded";
                        "text" => text,
                        "cursor" => cursor);
        Ok(())
    }

    fn write_dots(&mut self, _dots: &[u8]) -> DriverResult<()> {
        logging::debug!(self.log, "dot write discarded");
        Ok(())
    }

    fn write_status(&mut self, _cells: &[u8]) -> DriverResult<()> {
        logging::debug!(self.log, "status write discarded");
        Ok(())
    }

    fn keys_supported(&self) -> bool {
        false
    }

    fn read_key(&mut self) -> Option<u32> {
        None
    }

    fn translate_key(&self, _key: u32) -> Option<u32> {
        None
    }
}
