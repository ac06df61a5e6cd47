use crate::backend::{Backend, BackendResult};
use crate::key::Key;
use crate::layer::Layer;
use crate::logging::{self, Logger};
use crate::value::Datum;
use hashbrown::HashMap;

/// Process-lifetime map store. Identical semantics to the table backend
/// minus persistence; used for volatile layers and in tests.
pub struct MemoryBackend {
    databases: HashMap<String, HashMap<Vec<u8>, Datum>>,
    log: Logger,
}

impl MemoryBackend {
    pub fn new(log: Logger) -> MemoryBackend {
        MemoryBackend {
            databases: HashMap::new(),
            log,
        }
    }

    #[inline]
    fn database(&mut self, name: &str) -> &mut HashMap<Vec<u8>, Datum> {
        if !self.databases.contains_key(name) {
            logging::debug!(self.log, "opening database";
                            "context" => "memory_open",
                            "database" => name);
            self.databases.insert(name.to_owned(), HashMap::new());
        }

        self.databases.get_mut(name).expect("database just inserted")
    }
}

impl Backend for MemoryBackend {
    fn set(&mut self, layer: &Layer, uid: u32, key: &Key, record: &Datum) -> BackendResult<()> {
        self.database(&layer.database_name(uid))
            .insert(key.record_key(), record.clone());
        Ok(())
    }

    fn get(&mut self, layer: &Layer, uid: u32, key: &Key) -> BackendResult<Option<Datum>> {
        Ok(self
            .database(&layer.database_name(uid))
            .get(&key.record_key())
            .cloned())
    }

    fn unset(&mut self, layer: &Layer, uid: u32, key: &Key) -> BackendResult<bool> {
        Ok(self
            .database(&layer.database_name(uid))
            .remove(&key.record_key())
            .is_some())
    }

    fn list_keys(&mut self, layer: &Layer, uid: u32) -> BackendResult<Vec<Key>> {
        let mut keys: Vec<_> = self
            .database(&layer.database_name(uid))
            .keys()
            .filter_map(|bytes| Key::from_record_key(bytes))
            .collect();

        // Match the sorted iteration order of the table backend.
        keys.sort_by_key(Key::record_key);
        Ok(keys)
    }
}
