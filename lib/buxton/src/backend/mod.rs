//! Pluggable persistence for a single layer.
//!
//! A backend stores `(value, label)` records keyed by compound key, one
//! logical database per `(layer, uid-if-user)`. Implementations register
//! in a name-to-factory registry and are selected by the identifiers
//! `"table"` and `"memory"`.

use crate::key::Key;
use crate::layer::{BackendKind, Layer};
use crate::logging::{self, Logger};
use crate::value::Datum;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

pub mod memory;
pub mod table;

pub use memory::MemoryBackend;
pub use table::TableBackend;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug)]
pub enum BackendError {
    /// The underlying database reported an error.
    Database(String),
    /// A stored record failed to decode.
    Corrupt,
    Io(io::Error),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendError::Database(msg) => write!(f, "database error: {}", msg),
            BackendError::Corrupt => f.write_str("stored record failed to decode"),
            BackendError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for BackendError {}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> BackendError {
        BackendError::Io(e)
    }
}

/// The four operations a backend exposes over a layer. The `uid` selects
/// the per-user database for USER layers and is ignored for SYSTEM ones.
pub trait Backend: Send {
    fn set(&mut self, layer: &Layer, uid: u32, key: &Key, record: &Datum) -> BackendResult<()>;

    fn get(&mut self, layer: &Layer, uid: u32, key: &Key) -> BackendResult<Option<Datum>>;

    /// Returns false when there was nothing to remove.
    fn unset(&mut self, layer: &Layer, uid: u32, key: &Key) -> BackendResult<bool>;

    fn list_keys(&mut self, layer: &Layer, uid: u32) -> BackendResult<Vec<Key>>;
}

type Factory = fn(&Path, Logger) -> Box<dyn Backend>;

/// Name-to-factory registry for the compiled-in backends.
pub struct BackendRegistry {
    db_path: PathBuf,
    log: Logger,
}

impl BackendRegistry {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(db_path: &Path, log: L) -> BackendRegistry {
        BackendRegistry {
            db_path: db_path.to_owned(),
            log: logging::child(log),
        }
    }

    fn factory(name: &str) -> Option<Factory> {
        match name {
            "table" => Some(|path, log| Box::new(TableBackend::new(path, log))),
            "memory" => Some(|_, log| Box::new(MemoryBackend::new(log))),
            _ => None,
        }
    }

    /// Instantiate the backend registered under `kind`.
    pub fn open(&self, kind: BackendKind) -> Option<Box<dyn Backend>> {
        let factory = Self::factory(kind.name())?;

        logging::debug!(self.log, "backend opened";
                        "context" => "backend_open",
                        "backend" => kind.name());

        Some(factory(&self.db_path, self.log.new(logging::o!())))
    }
}
