//! Persistent key-value store.
//!
//! One rocksdb database per node, opened at a path derived from the node address.
//! Both the write-through bridge and the gateway's GET path share the same handle;
//! there is no isolation between a read and a concurrent replicated write.

use std::path::{Path, PathBuf};

use rocksdb::{Options, DB};
use tracing::{debug, info};

const PROP_LIVE_DATA: &str = "rocksdb.estimate-live-data-size";
const PROP_MEMTABLES: &str = "rocksdb.cur-size-all-mem-tables";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open store at {path}: {source}")]
    Open {
        path: PathBuf,
        source: rocksdb::Error,
    },

    #[error("Store read failed: {0}")]
    Read(rocksdb::Error),

    #[error("Store write failed: {0}")]
    Write(rocksdb::Error),

    #[error("Stored value for key '{key}' is not valid UTF-8")]
    Corrupt { key: String },

    #[error("Store capacity of {limit} bytes exceeded ({used} bytes in use, {incoming} incoming)")]
    CapacityExceeded { limit: u64, used: u64, incoming: u64 },
}

/// Local persistent store with bounded size and open-file count
#[derive(Debug)]
pub struct KvStore {
    db: DB,
    path: PathBuf,
    max_size_bytes: u64,
}

impl KvStore {
    /// Open (or create) the store. Reopening the same path sees earlier writes.
    pub fn open<P: AsRef<Path>>(
        path: P,
        max_size_bytes: u64,
        max_handles: u32,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_max_open_files(i32::try_from(max_handles).unwrap_or(i32::MAX));

        let db = DB::open(&opts, &path).map_err(|source| StoreError::Open {
            path: path.clone(),
            source,
        })?;

        info!(
            path = %path.display(),
            max_size_bytes,
            max_handles,
            "Opened persistent store"
        );

        Ok(Self {
            db,
            path,
            max_size_bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `value` under `key`, replacing any earlier value.
    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let incoming = (key.len() + value.len()) as u64;
        let used = self.approximate_size()?;
        if used.saturating_add(incoming) > self.max_size_bytes {
            return Err(StoreError::CapacityExceeded {
                limit: self.max_size_bytes,
                used,
                incoming,
            });
        }

        debug!(key, "Store set");
        self.db
            .put(key.as_bytes(), value.as_bytes())
            .map_err(StoreError::Write)
    }

    /// Read the value for `key`. Absent keys are `Ok(None)`, not an error.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        match self.db.get(key.as_bytes()).map_err(StoreError::Read)? {
            Some(bytes) => String::from_utf8(bytes)
                .map(Some)
                .map_err(|_| StoreError::Corrupt {
                    key: key.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Estimated bytes held by the store, on disk plus in memtables
    pub fn approximate_size(&self) -> Result<u64, StoreError> {
        let live = self
            .db
            .property_int_value(PROP_LIVE_DATA)
            .map_err(StoreError::Read)?
            .unwrap_or(0);
        let memtables = self
            .db
            .property_int_value(PROP_MEMTABLES)
            .map_err(StoreError::Read)?
            .unwrap_or(0);
        Ok(live + memtables)
    }
}
