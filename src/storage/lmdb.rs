use anyhow::Result;
use lmdb::{ Database, Environment, Transaction, WriteFlags };
use std::fs;
use std::path::Path;
use std::sync::Arc;

use crate::{ log_debug, log_info, log_warn };

/// Cache records are small JSON documents, 64MB leaves plenty of headroom
const CACHE_MAP_SIZE: usize = 64 * 1024 * 1024;

/// LMDB storage manager for persisted cache records
#[derive(Debug)]
pub struct LmdbStorage {
    env: Environment,
    db: Database,
}

impl LmdbStorage {
    /// Open (or create) an LMDB environment in `db_path`
    pub fn new(db_path: &Path) -> Result<Self> {
        // LMDB expects a directory, not a file
        if !db_path.exists() {
            fs::create_dir_all(db_path).map_err(|e| {
                anyhow::anyhow!("Failed to create LMDB directory {:?}: {}", db_path, e)
            })?;
            log_info!("Created LMDB directory: {:?}", db_path);
        }

        let env = Environment::new()
            .set_map_size(CACHE_MAP_SIZE)
            .set_max_dbs(1)
            .set_flags(lmdb::EnvironmentFlags::NO_SYNC)
            .open(db_path)
            .map_err(|e| {
                anyhow::anyhow!("Failed to open LMDB environment at {:?}: {}", db_path, e)
            })?;

        let db = env.open_db(None)?;

        log_debug!("LMDB storage initialized at: {:?}", db_path);

        Ok(LmdbStorage { env, db })
    }

    pub fn put(&self, key: &str, value: &str) -> Result<()> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.db, &key, &value, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    /// Retrieve a value by key. Non-UTF-8 payloads are reported as errors.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let txn = self.env.begin_ro_txn()?;
        match txn.get(self.db, &key) {
            Ok(bytes) => {
                let value = std::str::from_utf8(bytes)?.to_string();
                Ok(Some(value))
            }
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => {
                log_warn!("LMDB: Error reading key '{}': {}", key, e);
                Err(e.into())
            }
        }
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let mut txn = self.env.begin_rw_txn()?;
        match txn.del(self.db, &key, None) {
            Ok(_) => {
                txn.commit()?;
                Ok(())
            }
            Err(lmdb::Error::NotFound) => Ok(()), // Key already doesn't exist
            Err(e) => Err(e.into()),
        }
    }
}

pub type SharedLmdbStorage = Arc<LmdbStorage>;

pub fn create_shared_storage(db_path: &Path) -> Result<SharedLmdbStorage> {
    Ok(Arc::new(LmdbStorage::new(db_path)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_delete() {
        let dir = TempDir::new().unwrap();
        let storage = LmdbStorage::new(&dir.path().join("db")).unwrap();

        storage.put("cpu/", "{}").unwrap();
        assert_eq!(storage.get("cpu/").unwrap().as_deref(), Some("{}"));

        storage.delete("cpu/").unwrap();
        assert_eq!(storage.get("cpu/").unwrap(), None);
        // Deleting twice is not an error
        storage.delete("cpu/").unwrap();
    }
}
