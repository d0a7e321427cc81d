use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::packet::{DataRecord, PacketReply};
use crate::store::KvStore;

const OBSERVER_CAPACITY: usize = 256;

/// Local notification that a data record arrived and was applied
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataReceived {
    pub record: DataRecord,
}

/// Applies every inbound data record to the local store, then tells observers.
///
/// No ordering or idempotence bookkeeping: the last record to arrive for a key
/// wins on this node.
#[derive(Debug)]
pub struct WriteThroughBridge {
    store: Arc<KvStore>,
    observers: broadcast::Sender<DataReceived>,
}

impl WriteThroughBridge {
    pub fn new(store: Arc<KvStore>) -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CAPACITY);
        Self { store, observers }
    }

    pub fn store(&self) -> &Arc<KvStore> {
        &self.store
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DataReceived> {
        self.observers.subscribe()
    }

    /// Write the record through and produce the reply for the sender.
    pub fn apply(&self, record: DataRecord) -> PacketReply {
        debug!(key = %record.key, "Data received");

        if let Err(e) = self.store.set(&record.key, &record.value) {
            warn!(key = %record.key, "Failed to apply data record: {}", e);
            return PacketReply::Rejected {
                reason: e.to_string(),
            };
        }

        // Nobody listening is fine.
        let _ = self.observers.send(DataReceived { record });
        PacketReply::Applied
    }
}
