use crate::backend::{Backend, BackendError, BackendResult};
use crate::key::Key;
use crate::layer::Layer;
use crate::logging::{self, Logger};
use crate::value::Datum;
use crate::wire;
use hashbrown::HashMap;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::{Path, PathBuf};

const RECORDS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("records");

/// On-disk table store. One database file per database name under the
/// configured path (`<name>.db`), opened lazily and cached for the life
/// of the backend. Record bodies reuse the wire encoding of a datum, so
/// a record read back decodes with the same codec the protocol uses.
pub struct TableBackend {
    db_path: PathBuf,
    databases: HashMap<String, Database>,
    log: Logger,
}

impl TableBackend {
    pub fn new(db_path: &Path, log: Logger) -> TableBackend {
        TableBackend {
            db_path: db_path.to_owned(),
            databases: HashMap::new(),
            log,
        }
    }

    /// Open or create the database for `name`. The records table is
    /// created eagerly so reads on a fresh database see an empty table.
    fn database(&mut self, name: &str) -> BackendResult<&Database> {
        if !self.databases.contains_key(name) {
            let path = self.db_path.join(format!("{}.db", name));

            logging::debug!(self.log, "opening database";
                            "context" => "table_open",
                            "database" => name,
                            "path" => %path.display());

            let db = Database::create(&path).map_err(db_err)?;

            let txn = db.begin_write().map_err(db_err)?;
            {
                txn.open_table(RECORDS).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)?;

            self.databases.insert(name.to_owned(), db);
        }

        Ok(&self.databases[name])
    }
}

impl Backend for TableBackend {
    fn set(&mut self, layer: &Layer, uid: u32, key: &Key, record: &Datum) -> BackendResult<()> {
        let body = wire::encode_datum(record).map_err(|_| BackendError::Corrupt)?;
        let db = self.database(&layer.database_name(uid))?;

        let txn = db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(RECORDS).map_err(db_err)?;
            table
                .insert(key.record_key().as_slice(), body.as_slice())
                .map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;

        Ok(())
    }

    fn get(&mut self, layer: &Layer, uid: u32, key: &Key) -> BackendResult<Option<Datum>> {
        let db = self.database(&layer.database_name(uid))?;

        let txn = db.begin_read().map_err(db_err)?;
        let table = txn.open_table(RECORDS).map_err(db_err)?;

        match table.get(key.record_key().as_slice()).map_err(db_err)? {
            Some(guard) => {
                let record =
                    wire::decode_datum(guard.value()).map_err(|_| BackendError::Corrupt)?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    fn unset(&mut self, layer: &Layer, uid: u32, key: &Key) -> BackendResult<bool> {
        let db = self.database(&layer.database_name(uid))?;

        let txn = db.begin_write().map_err(db_err)?;
        let existed = {
            let mut table = txn.open_table(RECORDS).map_err(db_err)?;
            let removed = table.remove(key.record_key().as_slice()).map_err(db_err)?;
            removed.is_some()
        };
        txn.commit().map_err(db_err)?;

        Ok(existed)
    }

    fn list_keys(&mut self, layer: &Layer, uid: u32) -> BackendResult<Vec<Key>> {
        let db = self.database(&layer.database_name(uid))?;

        let txn = db.begin_read().map_err(db_err)?;
        let table = txn.open_table(RECORDS).map_err(db_err)?;

        let mut keys = Vec::new();
        for row in table.iter().map_err(db_err)? {
            let (record_key, _) = row.map_err(db_err)?;
            let key = Key::from_record_key(record_key.value()).ok_or(BackendError::Corrupt)?;
            keys.push(key);
        }

        Ok(keys)
    }
}

fn db_err<E: Into<redb::Error>>(error: E) -> BackendError {
    BackendError::Database(error.into().to_string())
}
