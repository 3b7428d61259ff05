//! Bounded local alert queues.
//!
//! Each queue is a newest-first JSON array stored under one key of the
//! key-value store. Every change is a read-modify-write of the whole list
//! done through [`KeyValueStore::update`], so writers in other processes
//! sharing the same database cannot drop each other's entries.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::alert::{AlertRecord, LocationUpdate};
use crate::storage::KeyValueStore;
use crate::{Error, Result};

/// Storage key of the queue of alerts that failed remote delivery.
pub const PENDING_KEY: &str = "@alerts_pending";

/// Storage key of the queue of delivered alerts.
pub const SENT_KEY: &str = "@alerts_sent";

/// Storage key of the queue of location updates that failed remote delivery.
pub const UPDATES_KEY: &str = "@location_updates_pending";

/// Default number of entries kept per queue.
pub const DEFAULT_CAPACITY: usize = 50;

/// A value that can be kept in a [`LocalQueue`].
pub trait Queued: Clone + Serialize + DeserializeOwned {
    /// Id under which the value is updated in place.
    fn queue_id(&self) -> &str;
}

impl Queued for AlertRecord {
    fn queue_id(&self) -> &str {
        &self.alert_id
    }
}

impl Queued for LocationUpdate {
    fn queue_id(&self) -> &str {
        &self.update_id
    }
}

/// One value in a local queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry<T = AlertRecord> {
    /// The queued value.
    #[serde(flatten)]
    pub record: T,
    /// When the entry was first saved locally.
    pub saved_at: DateTime<Utc>,
    /// Number of failed re-delivery attempts.
    pub retry_count: u32,
}

impl<T> QueueEntry<T> {
    /// Wrap a value saved now.
    #[must_use]
    pub fn new(record: T) -> Self {
        Self {
            record,
            saved_at: Utc::now(),
            retry_count: 0,
        }
    }
}

/// What [`LocalQueue::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// A new entry was added at the front.
    Inserted {
        /// Number of old entries evicted to stay within capacity.
        evicted: usize,
    },
    /// An entry with the same alert id was updated in place.
    Updated {
        /// Its retry count after the update.
        retry_count: u32,
    },
}

/// A bounded newest-first queue of [`QueueEntry`] values.
#[derive(Debug)]
pub struct LocalQueue<T = AlertRecord> {
    store: Arc<dyn KeyValueStore>,
    key: &'static str,
    capacity: usize,
    item: PhantomData<fn() -> T>,
}

impl<T: Queued> LocalQueue<T> {
    /// Create a queue stored under `key`.
    #[must_use]
    pub fn new(store: Arc<dyn KeyValueStore>, key: &'static str, capacity: usize) -> Self {
        Self {
            store,
            key,
            capacity: capacity.max(1),
            item: PhantomData,
        }
    }

    /// Storage key of this queue.
    #[must_use]
    pub fn key(&self) -> &'static str {
        self.key
    }

    /// Maximum number of entries kept.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// All entries, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the stored list is
    /// not a valid queue.
    pub fn entries(&self) -> Result<Vec<QueueEntry<T>>> {
        match self.store.get(self.key)? {
            None => Ok(Vec::new()),
            Some(raw) => self.decode(&raw),
        }
    }

    /// Number of entries.
    ///
    /// # Errors
    ///
    /// Same as [`LocalQueue::entries`].
    pub fn len(&self) -> Result<usize> {
        Ok(self.entries()?.len())
    }

    /// Whether the queue holds no entries.
    ///
    /// # Errors
    ///
    /// Same as [`LocalQueue::entries`].
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Find the entry for an id.
    ///
    /// # Errors
    ///
    /// Same as [`LocalQueue::entries`].
    pub fn find(&self, id: &str) -> Result<Option<QueueEntry<T>>> {
        Ok(self.entries()?.into_iter().find(|e| e.record.queue_id() == id))
    }

    /// Add `record` at the front, or update its existing entry in place.
    ///
    /// An update replaces the stored value and increments `retry_count`,
    /// keeping the original `saved_at`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn upsert(&self, record: &T) -> Result<Upsert> {
        self.modify(|entries| {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| e.record.queue_id() == record.queue_id())
            {
                entry.record = record.clone();
                entry.retry_count += 1;
                return Upsert::Updated {
                    retry_count: entry.retry_count,
                };
            }

            entries.insert(0, QueueEntry::new(record.clone()));
            Upsert::Inserted { evicted: 0 }
        })
        .map(|(outcome, evicted)| match outcome {
            Upsert::Inserted { .. } => Upsert::Inserted { evicted },
            updated @ Upsert::Updated { .. } => updated,
        })
    }

    /// Remove the entry for an id, returning it.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn remove(&self, id: &str) -> Result<Option<QueueEntry<T>>> {
        self.modify(|entries| {
            let index = entries.iter().position(|e| e.record.queue_id() == id)?;
            Some(entries.remove(index))
        })
        .map(|(removed, _)| removed)
    }

    /// Remove every entry. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn clear(&self) -> Result<usize> {
        self.modify(std::mem::take)
            .map(|(removed, _)| removed.len())
    }

    fn decode(&self, raw: &str) -> Result<Vec<QueueEntry<T>>> {
        serde_json::from_str(raw).map_err(|e| Error::queue_corrupt(self.key, e.to_string()))
    }

    /// Atomic read-modify-write of the stored list, then enforce capacity.
    ///
    /// A stored list that cannot be decoded is replaced with an empty list,
    /// so new alerts can still be saved, and its raw value is copied to
    /// `{key}:corrupt:{millis}`.
    fn modify<R>(&self, f: impl FnOnce(&mut Vec<QueueEntry<T>>) -> R) -> Result<(R, usize)> {
        let mut outcome = None;
        let mut corrupt = None;

        self.store.update(
            self.key,
            Box::new(|current: Option<String>| {
                let mut entries = match current {
                    None => Vec::new(),
                    Some(raw) => match self.decode(&raw) {
                        Ok(entries) => entries,
                        Err(e) => {
                            warn!(key = self.key, error = %e, "local queue unreadable, starting empty");
                            corrupt = Some(raw);
                            Vec::new()
                        }
                    },
                };

                let result = f(&mut entries);
                let evicted = entries.len().saturating_sub(self.capacity);
                if evicted > 0 {
                    entries.truncate(self.capacity);
                    debug!(key = self.key, evicted, "evicted oldest queue entries");
                }
                outcome = Some((result, evicted));
                Ok(serde_json::to_string(&entries)?)
            }),
        )?;

        if let Some(raw) = corrupt {
            let backup = format!("{}:corrupt:{}", self.key, Utc::now().timestamp_millis());
            match self.store.set(&backup, &raw) {
                Ok(()) => warn!(key = self.key, %backup, "unreadable queue value moved aside"),
                Err(e) => warn!(key = self.key, error = %e, "could not keep unreadable queue value"),
            }
        }

        outcome.ok_or_else(|| Error::internal(format!("queue '{}' update did not run", self.key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{sample_record, AlertKind};
    use crate::storage::Storage;

    fn queue(capacity: usize) -> (Arc<Storage>, LocalQueue) {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let queue = LocalQueue::new(storage.clone(), PENDING_KEY, capacity);
        (storage, queue)
    }

    #[test]
    fn test_empty_queue() {
        let (_, queue) = queue(DEFAULT_CAPACITY);
        assert!(queue.is_empty().unwrap());
        assert!(queue.find("SOS-1").unwrap().is_none());
    }

    #[test]
    fn test_upsert_newest_first() {
        let (_, queue) = queue(DEFAULT_CAPACITY);
        queue.upsert(&sample_record("SOS-1", AlertKind::Sos)).unwrap();
        queue.upsert(&sample_record("SOS-2", AlertKind::Sos)).unwrap();

        let ids: Vec<_> = queue
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.record.alert_id)
            .collect();
        assert_eq!(ids, vec!["SOS-2", "SOS-1"]);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let (_, queue) = queue(50);
        for i in 0..51 {
            let outcome = queue
                .upsert(&sample_record(&format!("CRASH-{i}"), AlertKind::Crash))
                .unwrap();
            if i == 50 {
                assert_eq!(outcome, Upsert::Inserted { evicted: 1 });
            }
        }

        let entries = queue.entries().unwrap();
        assert_eq!(entries.len(), 50);
        assert_eq!(entries[0].record.alert_id, "CRASH-50");
        assert!(entries.iter().all(|e| e.record.alert_id != "CRASH-0"));
    }

    #[test]
    fn test_upsert_existing_updates_in_place() {
        let (_, queue) = queue(DEFAULT_CAPACITY);
        queue.upsert(&sample_record("SOS-1", AlertKind::Sos)).unwrap();
        queue.upsert(&sample_record("SOS-2", AlertKind::Sos)).unwrap();
        let saved_at = queue.find("SOS-1").unwrap().unwrap().saved_at;

        let outcome = queue.upsert(&sample_record("SOS-1", AlertKind::Sos)).unwrap();
        assert_eq!(outcome, Upsert::Updated { retry_count: 1 });

        let entries = queue.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].record.alert_id, "SOS-1");
        assert_eq!(entries[1].retry_count, 1);
        assert_eq!(entries[1].saved_at, saved_at);
    }

    #[test]
    fn test_remove() {
        let (_, queue) = queue(DEFAULT_CAPACITY);
        queue.upsert(&sample_record("SOS-1", AlertKind::Sos)).unwrap();

        let removed = queue.remove("SOS-1").unwrap();
        assert_eq!(removed.unwrap().record.alert_id, "SOS-1");
        assert!(queue.remove("SOS-1").unwrap().is_none());
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_clear() {
        let (_, queue) = queue(DEFAULT_CAPACITY);
        queue.upsert(&sample_record("SOS-1", AlertKind::Sos)).unwrap();
        queue.upsert(&sample_record("SOS-2", AlertKind::Sos)).unwrap();
        assert_eq!(queue.clear().unwrap(), 2);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_entry_serialization_is_flat() {
        let (storage, queue) = queue(DEFAULT_CAPACITY);
        queue.upsert(&sample_record("SOS-1", AlertKind::Sos)).unwrap();

        let raw = storage.get(PENDING_KEY).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json[0]["alertId"], "SOS-1");
        assert_eq!(json[0]["retryCount"], 0);
        assert!(json[0]["savedAt"].is_string());
    }

    #[test]
    fn test_corrupt_queue_read_errors() {
        let (storage, queue) = queue(DEFAULT_CAPACITY);
        storage.set(PENDING_KEY, "{not json").unwrap();
        let err = queue.entries().unwrap_err();
        assert!(matches!(err, Error::QueueCorrupt { .. }));
    }

    #[test]
    fn test_corrupt_queue_moved_aside_on_write() {
        let (storage, queue) = queue(DEFAULT_CAPACITY);
        storage.set(PENDING_KEY, "{not json").unwrap();

        queue.upsert(&sample_record("SOS-1", AlertKind::Sos)).unwrap();

        assert_eq!(queue.len().unwrap(), 1);
        let keys = storage.keys().unwrap();
        assert!(keys.iter().any(|k| k.starts_with("@alerts_pending:corrupt:")));
    }

    #[test]
    fn test_concurrent_upserts_are_not_lost() {
        let (_, queue) = queue(DEFAULT_CAPACITY);
        let queue = Arc::new(queue);

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    queue
                        .upsert(&sample_record(&format!("SOS-{i}"), AlertKind::Sos))
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(queue.len().unwrap(), 8);
    }

    #[test]
    fn test_upserts_from_two_database_handles_are_not_lost() {
        let dir = std::env::temp_dir().join(format!("rescuelink-queue-{}", std::process::id()));
        let path = dir.join("alerts.db");
        let handles: Vec<Arc<dyn KeyValueStore>> = vec![
            Arc::new(Storage::open(&path).unwrap()),
            Arc::new(Storage::open(&path).unwrap()),
        ];

        let workers: Vec<_> = handles
            .iter()
            .enumerate()
            .map(|(n, store)| {
                let queue = LocalQueue::new(store.clone(), PENDING_KEY, 500);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        queue
                            .upsert(&sample_record(&format!("SOS-{n}-{i}"), AlertKind::Sos))
                            .unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        let queue: LocalQueue = LocalQueue::new(handles[0].clone(), PENDING_KEY, 500);
        assert_eq!(queue.len().unwrap(), 200);
        drop((queue, handles));
        std::fs::remove_dir_all(&dir).ok();
    }
}
