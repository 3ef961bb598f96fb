use crate::api::registry::TtyRegistry;
use crate::net::connection::{ConnId, ConnState, Connection};

/// Where a key event goes. Exactly one destination per event; translation
/// and enqueueing are the server loop's effect phase.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Route {
    Owner(ConnId),
    ScreenReader,
}

/// Routing decision for one key event (raw mode suspends routing entirely,
/// so this is never consulted while the raw gate is held):
///
/// 1. no foreground tty, or nobody owns it → screen reader;
/// 2. owner not yet authenticated (keys racing a handshake) → screen reader;
/// 3. keycode inside the owner's ignore mask → screen reader;
/// 4. otherwise → the owner.
pub fn route(
    registry: &TtyRegistry,
    foreground: Option<u32>,
    connections: &[Connection],
    key: u32,
) -> Route {
    let foreground = match foreground {
        Some(tty) => tty,
        None => return Route::ScreenReader,
    };

    let owner = match registry.lookup(foreground) {
        Some(owner) => owner,
        None => return Route::ScreenReader,
    };

    let conn = &connections[owner];

    if conn.state() != ConnState::Authenticated {
        return Route::ScreenReader;
    }

    if conn.mask().contains(key) {
        return Route::ScreenReader;
    }

    Route::Owner(owner)
}
