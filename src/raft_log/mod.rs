//! Durable log and vote storage for the consensus engine.
//!
//! The engine's log never carries client data: entries are leader blanks and
//! membership changes. The "state machine" is therefore just the applied position
//! and the latest membership, which is all a restarted node needs to rejoin.

use std::fmt::Debug;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use openraft::{
    storage::{Adaptor, LogState, RaftLogReader, RaftSnapshotBuilder, RaftStorage, Snapshot},
    Entry, EntryPayload, LogId, OptionalSend, SnapshotMeta, StorageError, StorageIOError,
    StoredMembership, Vote,
};
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::{Node, NodeId, TypeConfig};

const CF_ENTRIES: &str = "entries";
const CF_META: &str = "meta";

const KEY_VOTE: &[u8] = b"vote";
const KEY_PURGED: &[u8] = b"last_purged";
const KEY_APPLIED: &[u8] = b"applied";
const KEY_SNAPSHOT: &[u8] = b"snapshot";

/// Applied position plus the membership in force at that position.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppliedState {
    pub last_applied: Option<LogId<NodeId>>,
    pub membership: StoredMembership<NodeId, Node>,
}

/// rocksdb-backed storage handed to openraft through [`Adaptor`]
#[derive(Debug, Clone)]
pub struct EngineLogStore {
    db: Arc<DB>,
    applied: AppliedState,
}

// Big-endian keys keep rocksdb's byte order equal to log index order.
fn index_key(index: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, index);
    buf
}

fn key_index(buf: &[u8]) -> Option<u64> {
    buf.get(0..8).map(BigEndian::read_u64)
}

fn read_err(e: &(impl std::error::Error + 'static)) -> StorageError<NodeId> {
    StorageIOError::<NodeId>::read(e).into()
}

fn write_err(e: &(impl std::error::Error + 'static)) -> StorageError<NodeId> {
    StorageIOError::<NodeId>::write(e).into()
}

impl EngineLogStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError<NodeId>> {
        let mut db_opts = Options::default();
        db_opts.create_missing_column_families(true);
        db_opts.create_if_missing(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_ENTRIES, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];
        let db = DB::open_cf_descriptors(&db_opts, path.as_ref(), cfs).map_err(|e| write_err(&e))?;

        let mut store = Self {
            db: Arc::new(db),
            applied: AppliedState::default(),
        };
        if let Some(applied) = store.read_meta::<AppliedState>(KEY_APPLIED)? {
            debug!(last_applied = ?applied.last_applied, "Restored applied state");
            store.applied = applied;
        }

        info!(path = %path.as_ref().display(), "Opened engine log");
        Ok(store)
    }

    pub fn applied_state(&self) -> &AppliedState {
        &self.applied
    }

    fn entries(&self) -> &ColumnFamily {
        self.db
            .cf_handle(CF_ENTRIES)
            .expect("entries column family is created on open")
    }

    fn meta(&self) -> &ColumnFamily {
        self.db
            .cf_handle(CF_META)
            .expect("meta column family is created on open")
    }

    #[allow(clippy::result_large_err)]
    fn read_meta<T: for<'de> Deserialize<'de>>(
        &self,
        key: &[u8],
    ) -> Result<Option<T>, StorageError<NodeId>> {
        match self.db.get_cf(self.meta(), key).map_err(|e| read_err(&e))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).map_err(|e| read_err(&e))?)),
            None => Ok(None),
        }
    }

    #[allow(clippy::result_large_err)]
    fn write_meta<T: Serialize>(&self, key: &[u8], value: &T) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(value).map_err(|e| write_err(&e))?;
        self.db
            .put_cf(self.meta(), key, bytes)
            .map_err(|e| write_err(&e))
    }

    #[allow(clippy::result_large_err)]
    fn delete_entries(&self, from: u64, to: u64) -> Result<(), StorageError<NodeId>> {
        self.db
            .delete_range_cf(self.entries(), index_key(from), index_key(to))
            .map_err(|e| write_err(&e))
    }
}

impl RaftLogReader<TypeConfig> for EngineLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(x) => *x,
            std::ops::Bound::Excluded(x) => *x + 1,
            std::ops::Bound::Unbounded => 0,
        };
        let start = index_key(start);

        let mut out = Vec::new();
        for item in self
            .db
            .iterator_cf(self.entries(), IteratorMode::From(&start, Direction::Forward))
        {
            let (key, value) = item.map_err(|e| read_err(&e))?;
            let Some(index) = key_index(&key) else {
                warn!("Skipping malformed engine log key");
                continue;
            };
            if !range.contains(&index) {
                break;
            }
            let entry: Entry<TypeConfig> =
                serde_json::from_slice(&value).map_err(|e| read_err(&e))?;
            out.push(entry);
        }
        Ok(out)
    }
}

pub struct EngineSnapshotBuilder {
    store: EngineLogStore,
}

impl RaftSnapshotBuilder<TypeConfig> for EngineSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let applied = self.store.applied.clone();
        let data = serde_json::to_vec(&applied)
            .map_err(|e| StorageIOError::<NodeId>::read_state_machine(&e))?;

        let snapshot_id = match applied.last_applied {
            Some(last) => format!("{}-{}", last.leader_id, last.index),
            None => "empty".to_string(),
        };
        let meta = SnapshotMeta {
            last_log_id: applied.last_applied,
            last_membership: applied.membership.clone(),
            snapshot_id,
        };

        self.store.write_meta(KEY_SNAPSHOT, &(meta.clone(), data.clone()))?;
        debug!(snapshot_id = %meta.snapshot_id, "Built engine snapshot");

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl RaftStorage<TypeConfig> for EngineLogStore {
    type LogReader = Self;
    type SnapshotBuilder = EngineSnapshotBuilder;

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(vote).map_err(|e| StorageIOError::<NodeId>::write_vote(&e))?;
        self.db
            .put_cf(self.meta(), KEY_VOTE, bytes)
            .map_err(|e| StorageIOError::<NodeId>::write_vote(&e).into())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        match self
            .db
            .get_cf(self.meta(), KEY_VOTE)
            .map_err(|e| StorageIOError::<NodeId>::read_vote(&e))?
        {
            Some(bytes) => Ok(Some(
                serde_json::from_slice(&bytes).map_err(|e| StorageIOError::<NodeId>::read_vote(&e))?,
            )),
            None => Ok(None),
        }
    }

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged_log_id: Option<LogId<NodeId>> = self.read_meta(KEY_PURGED)?;

        let last = match self.db.iterator_cf(self.entries(), IteratorMode::End).next() {
            Some(item) => {
                let (_, value) = item.map_err(|e| read_err(&e))?;
                let entry: Entry<TypeConfig> =
                    serde_json::from_slice(&value).map_err(|e| read_err(&e))?;
                Some(entry.log_id)
            }
            None => None,
        };

        Ok(LogState {
            last_purged_log_id,
            last_log_id: last.or(last_purged_log_id),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        for entry in entries {
            let value = serde_json::to_vec(&entry).map_err(|e| write_err(&e))?;
            self.db
                .put_cf(self.entries(), index_key(entry.log_id.index), value)
                .map_err(|e| write_err(&e))?;
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        debug!("delete_conflict_logs_since: [{:?}, +oo)", log_id);
        self.delete_entries(log_id.index, u64::MAX)
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        debug!("purge_logs_upto: [0, {:?}]", log_id);
        self.write_meta(KEY_PURGED, &log_id)?;
        self.delete_entries(0, log_id.index + 1)
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, Node>), StorageError<NodeId>> {
        Ok((self.applied.last_applied, self.applied.membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<()>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            self.applied.last_applied = Some(entry.log_id);
            match &entry.payload {
                EntryPayload::Blank => {}
                EntryPayload::Normal(record) => {
                    // Client data is broadcast, not proposed; nothing to apply here.
                    warn!(key = %record.key, "Ignoring data record found in engine log");
                }
                EntryPayload::Membership(membership) => {
                    info!(log_id = %entry.log_id, "Applying membership change");
                    self.applied.membership =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                }
            }
            responses.push(());
        }

        self.write_meta(KEY_APPLIED, &self.applied)?;
        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        EngineSnapshotBuilder {
            store: self.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, Node>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        info!("Installing engine snapshot: {:?}", meta);

        self.applied = AppliedState {
            last_applied: meta.last_log_id,
            membership: meta.last_membership.clone(),
        };
        self.write_meta(KEY_APPLIED, &self.applied)?;
        self.write_meta(KEY_SNAPSHOT, &(meta.clone(), snapshot.into_inner()))?;
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let stored: Option<(SnapshotMeta<NodeId, Node>, Vec<u8>)> = self.read_meta(KEY_SNAPSHOT)?;
        Ok(stored.map(|(meta, data)| Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}

pub type LogStore = Adaptor<TypeConfig, EngineLogStore>;
pub type StateMachineStore = Adaptor<TypeConfig, EngineLogStore>;

/// Open the engine log and split it into the log/state-machine pair openraft expects
pub fn open_engine_storage<P: AsRef<Path>>(
    path: P,
) -> Result<(LogStore, StateMachineStore), StorageError<NodeId>> {
    let store = EngineLogStore::open(path)?;
    Ok(Adaptor::new(store))
}
