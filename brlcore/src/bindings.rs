//! Per-client key-binding files: `<dir>/<client>-<driver_id>.kbd`, one
//! binding per line, mapping driver keycodes to symbolic names.

use hashbrown::HashMap;
use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Directory under `$HOME` holding the per-user binding files.
pub const HOME_KEY_DIR: &str = ".brlkeys";
/// Binding file suffix.
pub const KEY_FILE_EXT: &str = "kbd";

#[derive(Debug, Eq, PartialEq)]
pub enum BindingError {
    /// The client name would escape the binding directory.
    BadClient,
    /// The binding file could not be read.
    Io(io::ErrorKind),
    /// A line failed to parse (1-based line number).
    Parse(usize),
}

impl From<io::Error> for BindingError {
    #[inline]
    fn from(err: io::Error) -> Self {
        BindingError::Io(err.kind())
    }
}

/// A parsed keycode → symbolic-name map for one client.
#[derive(Debug, Default)]
pub struct KeyBindings {
    names: HashMap<u32, String>,
}

impl KeyBindings {
    /// The per-user binding directory, `$HOME/.brlkeys`.
    pub fn default_dir() -> Option<PathBuf> {
        env::var_os("HOME").map(|home| PathBuf::from(home).join(HOME_KEY_DIR))
    }

    /// Resolves the binding file path for a client name and driver id.
    /// Client names must be plain file stems; anything resembling a path is
    /// rejected so a client cannot read outside the binding directory.
    pub fn resolve(dir: &Path, client: &str, driver_id: [u8; 2]) -> Result<PathBuf, BindingError> {
        if client.is_empty()
            || client.contains('/')
            || client.contains('\\')
            || client.contains("..")
        {
            return Err(BindingError::BadClient);
        }

        let file = format!(
            "{}-{}{}.{}",
            client, driver_id[0] as char, driver_id[1] as char, KEY_FILE_EXT
        );

        Ok(dir.join(file))
    }

    /// Loads and parses a binding file.
    pub fn load(path: &Path) -> Result<KeyBindings, BindingError> {
        let text = fs::read_to_string(path)?;
        KeyBindings::parse(&text)
    }

    /// Parses binding text. Each non-empty, non-comment line is
    /// `<keycode> <name>` with the keycode in decimal or `0x` hex. Any
    /// malformed line fails the whole file.
    pub fn parse(text: &str) -> Result<KeyBindings, BindingError> {
        let mut names = HashMap::new();

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let mut fields = line.splitn(2, char::is_whitespace);

            let code = fields
                .next()
                .and_then(parse_keycode)
                .ok_or(BindingError::Parse(index + 1))?;
            let name = fields
                .next()
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .ok_or(BindingError::Parse(index + 1))?;

            names.insert(code, name.to_string());
        }

        Ok(KeyBindings { names })
    }

    #[inline]
    pub fn name_of(&self, key: u32) -> Option<&str> {
        self.names.get(&key).map(String::as_str)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

fn parse_keycode(field: &str) -> Option<u32> {
    if let Some(hex) = field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16).ok()
    } else {
        field.parse().ok()
    }
}
