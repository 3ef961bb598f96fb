//! Thin facade over `slog` so components only ever import one logging path.

pub use slog::{crit, debug, error, info, o, trace, warn, Discard, Logger};

/// A logger that swallows everything. Components constructed without a
/// parent logger fall back to this.
#[inline]
pub fn unattached() -> Logger {
    Logger::root(Discard, o!())
}

/// Derives a child logger from an optional parent.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => unattached(),
    }
}
