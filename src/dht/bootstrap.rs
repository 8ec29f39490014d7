//! Persisted bootstrap lists.
//!
//! A bootstrap list is a newline-delimited text resource of
//! `address[,alternate]` entries, e.g.
//!
//! ```text
//! 203.0.113.7:6881
//! [2001:db8::1]:6881,198.51.100.2:7000
//! ```
//!
//! Blank lines and `#` comments are ignored; malformed lines are skipped.

use super::error::DhtError;
use super::network::NetworkAddress;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// One remembered contact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BootstrapEntry {
    pub address: NetworkAddress,
    pub alternate: NetworkAddress,
}

impl BootstrapEntry {
    pub fn new(address: NetworkAddress) -> Self {
        Self {
            address,
            alternate: NetworkAddress::Empty,
        }
    }

    pub fn with_alternate(address: NetworkAddress, alternate: NetworkAddress) -> Self {
        Self { address, alternate }
    }
}

impl FromStr for BootstrapEntry {
    type Err = DhtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, alternate) = match s.split_once(',') {
            Some((a, b)) => (a.parse()?, b.parse()?),
            None => (s.parse()?, NetworkAddress::Empty),
        };
        if NetworkAddress::is_empty(&address) {
            return Err(DhtError::InvalidAddress(s.to_string()));
        }
        Ok(Self { address, alternate })
    }
}

impl fmt::Display for BootstrapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.alternate.is_empty() {
            write!(f, "{}", self.address)
        } else {
            write!(f, "{},{}", self.address, self.alternate)
        }
    }
}

pub(crate) fn parse_list(text: &str) -> Vec<BootstrapEntry> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match line.parse() {
            Ok(entry) => Some(entry),
            Err(e) => {
                debug!("Skipping bootstrap line {:?}: {}", line, e);
                None
            }
        })
        .collect()
}

pub(crate) fn format_list(entries: &[BootstrapEntry]) -> String {
    let mut out = String::new();
    for entry in entries {
        out.push_str(&entry.to_string());
        out.push('\n');
    }
    out
}

/// Where bootstrap lists live.
pub trait BootstrapStore: Send + Sync {
    /// Loads the list saved under `name`; a missing list is empty.
    fn load(&self, name: &str) -> Result<Vec<BootstrapEntry>, DhtError>;

    fn save(&self, name: &str, entries: &[BootstrapEntry]) -> Result<(), DhtError>;
}

/// Keeps each list as a file in one directory.
#[derive(Debug, Clone)]
pub struct FileBootstrapStore {
    dir: PathBuf,
}

impl FileBootstrapStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.bootstrap", file))
    }
}

impl BootstrapStore for FileBootstrapStore {
    fn load(&self, name: &str) -> Result<Vec<BootstrapEntry>, DhtError> {
        match std::fs::read_to_string(self.path_for(name)) {
            Ok(text) => Ok(parse_list(&text)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, name: &str, entries: &[BootstrapEntry]) -> Result<(), DhtError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(name);
        let tmp = path.with_extension("bootstrap.tmp");
        std::fs::write(&tmp, format_list(entries))?;
        std::fs::rename(&tmp, &path)?;
        debug!("Saved {} bootstrap entries to {}", entries.len(), path.display());
        Ok(())
    }
}

/// Keeps lists in memory.
#[derive(Debug, Default)]
pub struct MemoryBootstrapStore {
    lists: Mutex<HashMap<String, Vec<BootstrapEntry>>>,
}

impl MemoryBootstrapStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl BootstrapStore for MemoryBootstrapStore {
    fn load(&self, name: &str) -> Result<Vec<BootstrapEntry>, DhtError> {
        Ok(self.lists.lock().get(name).cloned().unwrap_or_default())
    }

    fn save(&self, name: &str, entries: &[BootstrapEntry]) -> Result<(), DhtError> {
        self.lists.lock().insert(name.to_string(), entries.to_vec());
        Ok(())
    }
}
