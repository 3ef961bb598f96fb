use brlcore::auth::DEFAULT_AUTH_FILE;
use brlcore::DEFAULT_PORT;
use serde_derive::{Deserialize, Serialize};

/// The sloggers snippet used when the config file does not say otherwise.
pub const DEFAULT_LOGGING: &str = "type = \"terminal\"\nlevel = \"info\"\ndestination = \"stderr\"\n";

/// Daemon configuration, deserialized from a JSON file. Every field has a
/// default so an empty object (or no file at all) yields a working server.
#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listen specification. A bare `:PORT` means loopback.
    pub listen: String,
    /// Path of the shared-secret key file.
    pub auth_file: String,
    /// Override for the per-user key-binding directory.
    pub key_dir: Option<String>,
    /// sloggers logger configuration, as a TOML snippet.
    pub logging: String,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            listen: format!("0.0.0.0:{}", DEFAULT_PORT),
            auth_file: DEFAULT_AUTH_FILE.to_string(),
            key_dir: None,
            logging: DEFAULT_LOGGING.to_string(),
        }
    }
}

/// Expands the client-side `:PORT` loopback convention into a bindable
/// address.
pub fn resolve_listen(spec: &str) -> String {
    match spec.starts_with(':') {
        true => format!("127.0.0.1{}", spec),
        false => spec.to_string(),
    }
}
