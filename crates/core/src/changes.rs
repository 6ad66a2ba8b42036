//! Replayable queue of detected per-replica changes.
//!
//! Watchers push `(sequence id, operation)` items; the consolidation
//! pipeline consumes them one at a time and acknowledges each only after it
//! has been durably folded into the Update Tree. Items pushed with a
//! sequence id at or below the persisted watermark are dropped, so a
//! restarted producer can replay its log and the queue resumes from the
//! oldest unacknowledged item.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::errors::StoreError;
use crate::models::{FsNodeModel, NodeKey, Operation};
use crate::store::PropertyStore;

/// One detected change with its producer-assigned sequence id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedChange<Id> {
    pub sequence_id: u64,
    pub operation: Operation<FsNodeModel<Id>>,
}

struct QueueInner<Id> {
    items: VecDeque<DetectedChange<Id>>,
    next_sequence_id: u64,
    watermark: u64,
}

/// Ordered, acknowledge-consumed change queue for one replica.
pub struct ChangeQueue<Id> {
    inner: Mutex<QueueInner<Id>>,
    notify: Notify,
    watermark_key: String,
    watermark_store: Option<Arc<dyn PropertyStore>>,
}

impl<Id: NodeKey> ChangeQueue<Id> {
    /// An ephemeral queue starting at sequence id 1.
    pub fn new(name: &str) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                next_sequence_id: 1,
                watermark: 0,
            }),
            notify: Notify::new(),
            watermark_key: format!("last_consumed_{name}"),
            watermark_store: None,
        }
    }

    /// A queue whose consumption watermark survives restarts through the
    /// given property store.
    pub fn with_watermark_store(
        name: &str,
        store: Arc<dyn PropertyStore>,
    ) -> Result<Self, StoreError> {
        let queue = Self {
            watermark_store: Some(Arc::clone(&store)),
            ..Self::new(name)
        };

        if let Some(value) = store.get(&queue.watermark_key)? {
            let watermark: u64 = value.parse().unwrap_or(0);
            let mut inner = queue.inner.lock().unwrap();
            inner.watermark = watermark;
            inner.next_sequence_id = watermark + 1;
        }

        Ok(queue)
    }

    /// Append an operation, assigning the next sequence id.
    pub fn push(&self, operation: Operation<FsNodeModel<Id>>) -> u64 {
        let mut inner = self.inner.lock().unwrap();
        let sequence_id = inner.next_sequence_id;
        inner.next_sequence_id += 1;
        inner.items.push_back(DetectedChange {
            sequence_id,
            operation,
        });
        drop(inner);

        self.notify.notify_waiters();
        sequence_id
    }

    /// Append an operation replayed by the producer. Items at or below the
    /// watermark have already been consumed and are dropped.
    pub fn push_replayed(&self, sequence_id: u64, operation: Operation<FsNodeModel<Id>>) -> bool {
        let mut inner = self.inner.lock().unwrap();

        if sequence_id <= inner.watermark {
            debug!(sequence_id, watermark = inner.watermark, "dropping replayed change");
            return false;
        }

        inner.next_sequence_id = inner.next_sequence_id.max(sequence_id + 1);
        inner.items.push_back(DetectedChange {
            sequence_id,
            operation,
        });
        drop(inner);

        self.notify.notify_waiters();
        true
    }

    /// The oldest unacknowledged item, if any.
    pub fn front(&self) -> Option<DetectedChange<Id>> {
        self.inner.lock().unwrap().items.front().cloned()
    }

    /// Acknowledge the item returned by [`ChangeQueue::front`]. The item is
    /// removed and the watermark advanced (and persisted, when a store is
    /// attached).
    pub fn acknowledge(&self, change: &DetectedChange<Id>) -> Result<(), StoreError> {
        {
            let mut inner = self.inner.lock().unwrap();

            match inner.items.front() {
                Some(front) if front.sequence_id == change.sequence_id => {}
                _ => panic!("acknowledged item is not the current front of the queue"),
            }

            inner.items.pop_front();
            inner.watermark = change.sequence_id;
        }

        if let Some(store) = &self.watermark_store {
            store.set(&self.watermark_key, &change.sequence_id.to_string())?;
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    /// Wait until at least one item has been added after this call.
    pub async fn added(&self) {
        self.notify.notified().await;
    }
}
