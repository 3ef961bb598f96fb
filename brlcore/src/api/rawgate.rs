use crate::net::connection::ConnId;

/// The mutually exclusive gate over the driver's raw channel. At most one
/// connection holds it; while held, every cooked write path is locked out
/// and key routing is suspended.
#[derive(Debug, Default)]
pub struct RawGate {
    holder: Option<ConnId>,
}

impl RawGate {
    #[inline]
    pub fn new() -> RawGate {
        RawGate { holder: None }
    }

    /// Takes the gate for `conn`. Fails if any connection, including `conn`
    /// itself, already holds it.
    #[inline]
    pub fn acquire(&mut self, conn: ConnId) -> bool {
        match self.holder {
            Some(_) => false,
            None => {
                self.holder = Some(conn);
                true
            }
        }
    }

    /// Releases the gate if `conn` holds it.
    #[inline]
    pub fn release(&mut self, conn: ConnId) -> bool {
        match self.holder {
            Some(holder) if holder == conn => {
                self.holder = None;
                true
            }
            _ => false,
        }
    }

    #[inline]
    pub fn holder(&self) -> Option<ConnId> {
        self.holder
    }

    #[inline]
    pub fn is_held(&self) -> bool {
        self.holder.is_some()
    }

    #[inline]
    pub fn is_held_by(&self, conn: ConnId) -> bool {
        self.holder == Some(conn)
    }
}
