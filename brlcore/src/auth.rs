use crate::logging;
use crate::net::packet::MAX_PAYLOAD_SIZE;
use std::fs;
use std::io;
use std::path::Path;

/// Default location of the shared-secret key file.
pub const DEFAULT_AUTH_FILE: &str = "/etc/brltty/brlapi-key";

/// Largest secret that still fits a single AUTHKEY payload.
pub const MAX_KEY_SIZE: usize = MAX_PAYLOAD_SIZE;

/// Shared-secret authenticator. The secret is read once at startup; clients
/// present the bytes of their copy of the key file as the first packet of a
/// connection.
pub struct Authenticator {
    secret: Vec<u8>,
    log: logging::Logger,
}

impl Authenticator {
    #[inline]
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(secret: Vec<u8>, log: L) -> Authenticator {
        Authenticator {
            secret,
            log: logging::child(log),
        }
    }

    /// Loads the secret from the key file. Anything larger than one packet
    /// payload could never be presented by a client and is rejected outright.
    pub fn from_file<'a, L: Into<Option<&'a logging::Logger>>>(
        path: &Path,
        log: L,
    ) -> io::Result<Authenticator> {
        let secret = fs::read(path)?;

        if secret.len() > MAX_KEY_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "key file {} is {} bytes, limit is {}",
                    path.display(),
                    secret.len(),
                    MAX_KEY_SIZE
                ),
            ));
        }

        Ok(Authenticator::new(secret, log))
    }

    /// Compares the supplied bytes against the secret. Length mismatch is an
    /// immediate refusal; equal lengths are compared with a fixed-time fold
    /// so the comparison leaks nothing about the prefix.
    pub fn verify(&self, supplied: &[u8]) -> bool {
        if supplied.len() != self.secret.len() {
            logging::info!(self.log, "authentication refused";
                           "reason" => "length mismatch",
                           "supplied_len" => supplied.len());
            return false;
        }

        let mut diff = 0u8;
        for (lhs, rhs) in supplied.iter().zip(self.secret.iter()) {
            diff |= lhs ^ rhs;
        }

        if diff != 0 {
            logging::info!(self.log, "authentication refused"; "reason" => "key mismatch");
        }

        diff == 0
    }
}
