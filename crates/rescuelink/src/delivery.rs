//! Local-first alert delivery.
//!
//! [`DeliveryManager::deliver`] walks the destination chain for the alert's
//! kind, stopping at the first collection that accepts the write. Whatever
//! happens remotely, the alert is also kept in a local queue: the sent queue
//! on success, the pending queue otherwise.
//!
//! Location updates sent after an alert follow the same rule with a single
//! destination and their own pending queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::alert::{AlertKind, AlertRecord, DeliveryState, LocationUpdate};
use crate::queue::{
    LocalQueue, QueueEntry, Upsert, DEFAULT_CAPACITY, PENDING_KEY, SENT_KEY, UPDATES_KEY,
};
use crate::remote::{RemoteError, RemoteStore};
use crate::storage::KeyValueStore;
use crate::Result;

/// Tuning for a [`DeliveryManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryConfig {
    /// Destination chain for SOS alerts.
    pub sos_collections: Vec<String>,
    /// Destination chain for crash alerts.
    pub crash_collections: Vec<String>,
    /// Destination of location updates.
    pub updates_collection: String,
    /// Upper bound on each remote write attempt.
    pub write_timeout: Duration,
    /// Entries kept per local queue.
    pub queue_capacity: usize,
    /// Send a missing location as zero coordinates.
    pub zero_fill_location: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            sos_collections: vec![
                "sos_alerts".to_string(),
                "emergency_alerts".to_string(),
                "alerts".to_string(),
            ],
            crash_collections: vec![
                "crashes".to_string(),
                "emergency_alerts".to_string(),
                "alerts".to_string(),
            ],
            updates_collection: "sos_updates".to_string(),
            write_timeout: Duration::from_secs(10),
            queue_capacity: DEFAULT_CAPACITY,
            zero_fill_location: true,
        }
    }
}

impl DeliveryConfig {
    /// The destination chain for `kind`, in attempt order.
    #[must_use]
    pub fn chain(&self, kind: AlertKind) -> &[String] {
        match kind {
            AlertKind::Sos => &self.sos_collections,
            AlertKind::Crash => &self.crash_collections,
        }
    }

    /// Every collection of both chains, without repeats.
    #[must_use]
    pub fn all_collections(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for name in self.sos_collections.iter().chain(&self.crash_collections) {
            if !seen.contains(&name.as_str()) {
                seen.push(name.as_str());
            }
        }
        seen
    }
}

/// Outcome of one delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResult {
    /// The alert that was delivered.
    pub alert_id: String,
    /// Whether a remote collection accepted the alert.
    pub delivered: bool,
    /// Delivery state after this attempt.
    pub state: DeliveryState,
    /// Collection that accepted the alert.
    pub collection: Option<String>,
    /// Document id recorded by the remote store.
    pub document_id: Option<String>,
    /// Why remote delivery failed.
    pub reason: Option<String>,
    /// Whether the local queue write succeeded.
    pub locally_saved: bool,
    /// Failed attempts for this alert so far.
    pub retry_count: u32,
}

impl DeliveryResult {
    /// A one-line message suitable for showing to the user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match (self.delivered, self.locally_saved) {
            (true, _) => "Emergency alert sent.".to_string(),
            (false, true) => {
                "Alert saved locally. It will be sent when the connection is restored.".to_string()
            }
            (false, false) => "Alert could not be sent or saved on this device.".to_string(),
        }
    }
}

/// Outcome of [`DeliveryManager::send_update`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    /// The update that was sent.
    pub update_id: String,
    /// The alert it follows.
    pub alert_id: String,
    /// Whether the updates collection accepted it.
    pub delivered: bool,
    /// Collection that accepted it.
    pub collection: Option<String>,
    /// Why remote delivery failed.
    pub reason: Option<String>,
    /// Whether the update is waiting in the local queue for a retry.
    pub locally_saved: bool,
}

impl UpdateResult {
    /// A one-line message suitable for showing to the user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match (self.delivered, self.locally_saved) {
            (true, _) => "Location update sent.".to_string(),
            (false, true) => {
                "Location update saved locally. It will be sent when the connection is restored."
                    .to_string()
            }
            (false, false) => "Location update could not be sent or saved.".to_string(),
        }
    }
}

/// Outcome of [`DeliveryManager::retry_pending`].
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryReport {
    /// Entries that were re-attempted.
    pub attempted: usize,
    /// Entries that reached the remote store.
    pub delivered: usize,
    /// Entries still pending afterwards.
    pub still_pending: usize,
    /// Per-entry results, oldest entry first.
    pub results: Vec<DeliveryResult>,
    /// Location updates that were re-attempted.
    pub updates_attempted: usize,
    /// Location updates that reached the remote store.
    pub updates_delivered: usize,
}

/// All local queues at one point in time.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    /// Alerts waiting for retry, newest first.
    pub pending: Vec<QueueEntry>,
    /// Delivered alerts, newest first.
    pub sent: Vec<QueueEntry>,
    /// Location updates waiting for retry, newest first.
    pub updates: Vec<QueueEntry<LocationUpdate>>,
}

/// Persists alerts remotely, falling back to the local pending queue.
#[derive(Debug)]
pub struct DeliveryManager {
    remote: Arc<dyn RemoteStore>,
    pending: LocalQueue,
    sent: LocalQueue,
    updates: LocalQueue<LocationUpdate>,
    config: DeliveryConfig,
}

impl DeliveryManager {
    /// Create a manager writing to `remote` and keeping queues in `store`.
    #[must_use]
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        store: Arc<dyn KeyValueStore>,
        config: DeliveryConfig,
    ) -> Self {
        Self {
            remote,
            pending: LocalQueue::new(store.clone(), PENDING_KEY, config.queue_capacity),
            sent: LocalQueue::new(store.clone(), SENT_KEY, config.queue_capacity),
            updates: LocalQueue::new(store, UPDATES_KEY, config.queue_capacity),
            config,
        }
    }

    /// The configuration in use.
    #[must_use]
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// The queue of alerts waiting for retry.
    #[must_use]
    pub fn pending(&self) -> &LocalQueue {
        &self.pending
    }

    /// The queue of delivered alerts.
    #[must_use]
    pub fn sent(&self) -> &LocalQueue {
        &self.sent
    }

    /// The queue of location updates waiting for retry.
    #[must_use]
    pub fn updates(&self) -> &LocalQueue<LocationUpdate> {
        &self.updates
    }

    /// All queues.
    ///
    /// # Errors
    ///
    /// Returns an error if any queue cannot be read.
    pub fn snapshot(&self) -> Result<QueueSnapshot> {
        Ok(QueueSnapshot {
            pending: self.pending.entries()?,
            sent: self.sent.entries()?,
            updates: self.updates.entries()?,
        })
    }

    /// Deliver on a spawned task, so dropping the caller cannot interrupt it.
    pub fn spawn_deliver(self: &Arc<Self>, record: AlertRecord) -> JoinHandle<DeliveryResult> {
        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.deliver(record).await })
    }

    /// Deliver one alert. Never fails; problems are reported in the result.
    pub async fn deliver(&self, mut record: AlertRecord) -> DeliveryResult {
        let alert_id = record.alert_id.clone();

        match self.sent.find(&alert_id) {
            Ok(Some(entry)) => {
                debug!(alert_id, "alert already delivered, skipping remote write");
                return DeliveryResult {
                    alert_id,
                    delivered: true,
                    state: DeliveryState::Sent,
                    collection: None,
                    document_id: Some(entry.record.alert_id),
                    reason: None,
                    locally_saved: true,
                    retry_count: entry.retry_count,
                };
            }
            Ok(None) => {}
            Err(e) => warn!(alert_id, error = %e, "could not read sent queue"),
        }

        // Delivered earlier, but its sent-queue entry has since been evicted
        if record.delivery_state == DeliveryState::Sent {
            debug!(alert_id, "alert already marked sent, skipping remote write");
            if let Err(e) = self.pending.remove(&alert_id) {
                warn!(alert_id, error = %e, "could not clear pending entry");
            }
            return DeliveryResult {
                document_id: Some(alert_id.clone()),
                alert_id,
                delivered: true,
                state: DeliveryState::Sent,
                collection: None,
                reason: None,
                locally_saved: false,
                retry_count: 0,
            };
        }

        match self.write_remote(&record).await {
            Ok((collection, document_id)) => {
                record.transition(DeliveryState::Sent);
                info!(alert_id, kind = %record.kind, collection, "alert delivered");

                let retry_count = match self.pending.remove(&alert_id) {
                    Ok(previous) => previous.map_or(0, |entry| entry.retry_count),
                    Err(e) => {
                        warn!(alert_id, error = %e, "could not clear pending entry");
                        0
                    }
                };
                let locally_saved = match self.sent.upsert(&record) {
                    Ok(_) => true,
                    Err(e) => {
                        warn!(alert_id, error = %e, "failed to save alert to sent queue");
                        false
                    }
                };

                DeliveryResult {
                    alert_id,
                    delivered: true,
                    state: record.delivery_state,
                    collection: Some(collection),
                    document_id: Some(document_id),
                    reason: None,
                    locally_saved,
                    retry_count,
                }
            }
            Err(reason) => {
                record.transition(DeliveryState::FailedLocal);
                warn!(alert_id, kind = %record.kind, %reason, "remote delivery failed, saving locally");

                let (locally_saved, retry_count) = match self.pending.upsert(&record) {
                    Ok(Upsert::Inserted { evicted }) => {
                        if evicted > 0 {
                            warn!(evicted, "pending queue full, dropped oldest alerts");
                        }
                        (true, 0)
                    }
                    Ok(Upsert::Updated { retry_count }) => (true, retry_count),
                    Err(e) => {
                        warn!(alert_id, error = %e, "failed to save alert to pending queue");
                        (false, 0)
                    }
                };

                DeliveryResult {
                    alert_id,
                    delivered: false,
                    state: record.delivery_state,
                    collection: None,
                    document_id: None,
                    reason: Some(reason),
                    locally_saved,
                    retry_count,
                }
            }
        }
    }

    /// Send a location update to the updates collection, keeping it in the
    /// updates queue if that fails. Never fails; problems are reported in
    /// the result.
    pub async fn send_update(&self, update: LocationUpdate) -> UpdateResult {
        let update_id = update.update_id.clone();
        let chain = std::slice::from_ref(&self.config.updates_collection);
        let outcome = match serde_json::to_value(update.to_wire()) {
            Ok(document) => self.write_chain(chain, &update_id, &document).await,
            Err(e) => Err(format!("could not encode location update: {e}")),
        };

        match outcome {
            Ok((collection, _)) => {
                info!(update_id, alert_id = %update.alert_id, collection, "location update delivered");
                if let Err(e) = self.updates.remove(&update_id) {
                    warn!(update_id, error = %e, "could not clear pending location update");
                }
                UpdateResult {
                    update_id,
                    alert_id: update.alert_id,
                    delivered: true,
                    collection: Some(collection),
                    reason: None,
                    locally_saved: false,
                }
            }
            Err(reason) => {
                warn!(update_id, %reason, "location update failed, saving locally");
                let locally_saved = match self.updates.upsert(&update) {
                    Ok(Upsert::Inserted { evicted }) => {
                        if evicted > 0 {
                            warn!(evicted, "updates queue full, dropped oldest updates");
                        }
                        true
                    }
                    Ok(Upsert::Updated { .. }) => true,
                    Err(e) => {
                        warn!(update_id, error = %e, "failed to save location update locally");
                        false
                    }
                };
                UpdateResult {
                    update_id,
                    alert_id: update.alert_id,
                    delivered: false,
                    collection: None,
                    reason: Some(reason),
                    locally_saved,
                }
            }
        }
    }

    /// Write the alert along its kind's destination chain.
    async fn write_remote(&self, record: &AlertRecord) -> std::result::Result<(String, String), String> {
        let chain = self.config.chain(record.kind);
        if chain.is_empty() {
            return Err(format!("no destination collections configured for {}", record.kind));
        }

        let mut wire_record = record.clone();
        wire_record.transition(DeliveryState::Sent);
        let document = serde_json::to_value(wire_record.to_wire(self.config.zero_fill_location))
            .map_err(|e| format!("could not encode alert: {e}"))?;

        self.write_chain(chain, &record.alert_id, &document).await
    }

    /// Try each collection of the chain in order.
    ///
    /// Returns the accepting collection and document id, or a reason that
    /// names every failed attempt.
    async fn write_chain(
        &self,
        chain: &[String],
        document_id: &str,
        document: &serde_json::Value,
    ) -> std::result::Result<(String, String), String> {
        let mut failures = Vec::with_capacity(chain.len());
        for collection in chain {
            let attempt = self.remote.append(collection, document_id, document);
            let error = match tokio::time::timeout(self.config.write_timeout, attempt).await {
                Ok(Ok(document_id)) => return Ok((collection.clone(), document_id)),
                Ok(Err(e)) => e,
                Err(_) => RemoteError::Timeout {
                    collection: collection.clone(),
                },
            };

            if error.is_permission_denied() {
                debug!(collection, "collection refused, trying next destination");
            } else {
                debug!(collection, %error, "remote write failed, trying next destination");
            }
            failures.push(error.to_string());
        }

        Err(failures.join("; "))
    }

    /// Re-deliver every pending alert, oldest first, then every pending
    /// location update.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pending alert queue cannot be read.
    /// Individual delivery failures are reported in the [`RetryReport`].
    pub async fn retry_pending(&self) -> Result<RetryReport> {
        let entries = self.pending.entries()?;
        let mut report = RetryReport::default();

        for entry in entries.into_iter().rev() {
            let result = self.deliver(entry.record).await;
            report.attempted += 1;
            if result.delivered {
                report.delivered += 1;
            }
            report.results.push(result);
        }

        report.still_pending = self.pending.len().unwrap_or(report.attempted - report.delivered);

        match self.updates.entries() {
            Ok(updates) => {
                for entry in updates.into_iter().rev() {
                    report.updates_attempted += 1;
                    if self.send_update(entry.record).await.delivered {
                        report.updates_delivered += 1;
                    }
                }
            }
            Err(e) => warn!(error = %e, "could not read pending location updates"),
        }

        if report.attempted + report.updates_attempted > 0 {
            info!(
                attempted = report.attempted,
                delivered = report.delivered,
                still_pending = report.still_pending,
                updates_delivered = report.updates_delivered,
                "retry finished"
            );
        }
        Ok(report)
    }

    /// Recent alerts from the remote store and both local queues.
    ///
    /// Each alert id appears once. The remote copy wins over the sent queue,
    /// which wins over the pending queue. Remote failures degrade to the
    /// local view; newest first.
    pub async fn history(&self, limit: usize) -> Vec<AlertRecord> {
        let mut merged: HashMap<String, AlertRecord> = HashMap::new();

        for collection in self.config.all_collections() {
            let listing = tokio::time::timeout(
                self.config.write_timeout,
                self.remote.list(collection, limit),
            )
            .await;

            let documents = match listing {
                Ok(Ok(documents)) => documents,
                Ok(Err(e)) => {
                    debug!(collection, error = %e, "remote history unavailable");
                    continue;
                }
                Err(_) => {
                    debug!(collection, "remote history timed out");
                    continue;
                }
            };

            for document in documents {
                match AlertRecord::from_wire(document) {
                    Ok(record) => {
                        merged.entry(record.alert_id.clone()).or_insert(record);
                    }
                    Err(e) => debug!(collection, error = %e, "skipping foreign document"),
                }
            }
        }

        for queue in [&self.sent, &self.pending] {
            match queue.entries() {
                Ok(entries) => {
                    for entry in entries {
                        merged
                            .entry(entry.record.alert_id.clone())
                            .or_insert(entry.record);
                    }
                }
                Err(e) => warn!(queue = queue.key(), error = %e, "could not read local queue"),
            }
        }

        let mut records: Vec<_> = merged.into_values().collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.alert_id.cmp(&a.alert_id))
        });
        records.truncate(limit);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::{sample_record, AlertKind, AlertSeverity};
    use crate::remote::mock::ScriptedStore;
    use crate::remote::OfflineStore;
    use crate::storage::mock::FlakyStore;
    use crate::storage::Storage;
    use chrono::{Duration as ChronoDuration, Utc};

    fn manager(remote: Arc<ScriptedStore>) -> DeliveryManager {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        DeliveryManager::new(remote, storage, DeliveryConfig::default())
    }

    #[test]
    fn test_default_chains() {
        let config = DeliveryConfig::default();
        assert_eq!(
            config.chain(AlertKind::Sos),
            ["sos_alerts", "emergency_alerts", "alerts"]
        );
        assert_eq!(
            config.chain(AlertKind::Crash),
            ["crashes", "emergency_alerts", "alerts"]
        );
        assert_eq!(
            config.all_collections(),
            vec!["sos_alerts", "emergency_alerts", "alerts", "crashes"]
        );
    }

    #[tokio::test]
    async fn test_deliver_to_first_collection() {
        let remote = Arc::new(ScriptedStore::new());
        let manager = manager(remote.clone());

        let result = manager.deliver(sample_record("SOS-1", AlertKind::Sos)).await;

        assert!(result.delivered);
        assert_eq!(result.state, DeliveryState::Sent);
        assert_eq!(result.collection.as_deref(), Some("sos_alerts"));
        assert_eq!(result.document_id.as_deref(), Some("SOS-1"));
        assert!(result.locally_saved);
        assert_eq!(remote.attempts(), vec!["sos_alerts"]);

        let sent = manager.sent().entries().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].record.delivery_state, DeliveryState::Sent);
        assert!(manager.pending().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_wire_copy_is_marked_sent() {
        let remote = Arc::new(ScriptedStore::new());
        let manager = manager(remote.clone());
        manager.deliver(sample_record("SOS-1", AlertKind::Sos)).await;

        let stored = remote.stored("sos_alerts");
        assert_eq!(stored[0].1["deliveryState"], "SENT");
        assert_eq!(stored[0].1["location"]["latitude"], 0.0);
    }

    #[tokio::test]
    async fn test_fallback_to_next_collection() {
        let remote = Arc::new(ScriptedStore::new());
        remote.deny("crashes");
        let manager = manager(remote.clone());

        let result = manager.deliver(sample_record("CRASH-1", AlertKind::Crash)).await;

        assert!(result.delivered);
        assert_eq!(result.collection.as_deref(), Some("emergency_alerts"));
        assert_eq!(remote.attempts(), vec!["crashes", "emergency_alerts"]);
    }

    #[tokio::test]
    async fn test_all_collections_fail_saves_locally() {
        let remote = Arc::new(ScriptedStore::new());
        for collection in ["sos_alerts", "emergency_alerts", "alerts"] {
            remote.fail(collection);
        }
        let manager = manager(remote.clone());

        let result = manager.deliver(sample_record("SOS-1", AlertKind::Sos)).await;

        assert!(!result.delivered);
        assert_eq!(result.state, DeliveryState::FailedLocal);
        assert!(result.locally_saved);
        assert!(result.reason.as_deref().unwrap().contains("connection reset"));
        assert_eq!(remote.attempts().len(), 3);
        assert!(result.user_message().contains("saved locally"));

        let pending = manager.pending().entries().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].record.delivery_state, DeliveryState::FailedLocal);
        assert!(manager.sent().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_offline_store_saves_locally() {
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let manager = DeliveryManager::new(Arc::new(OfflineStore), storage, DeliveryConfig::default());

        let result = manager.deliver(sample_record("CRASH-1", AlertKind::Crash)).await;
        assert!(!result.delivered);
        assert!(result.reason.unwrap().contains("unavailable"));
        assert_eq!(manager.pending().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_each_attempt_has_own_timeout() {
        let remote = Arc::new(ScriptedStore::new());
        remote.set_delay(Duration::from_millis(200));
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let config = DeliveryConfig {
            write_timeout: Duration::from_millis(20),
            ..DeliveryConfig::default()
        };
        let manager = DeliveryManager::new(remote.clone(), storage, config);

        let result = manager.deliver(sample_record("SOS-1", AlertKind::Sos)).await;

        assert!(!result.delivered);
        assert_eq!(remote.attempts().len(), 3);
        assert!(result.reason.unwrap().contains("timed out"));
        assert_eq!(remote.total_stored(), 0);
    }

    #[tokio::test]
    async fn test_already_sent_is_not_rewritten() {
        let remote = Arc::new(ScriptedStore::new());
        let manager = manager(remote.clone());
        let record = sample_record("SOS-1", AlertKind::Sos);

        manager.deliver(record.clone()).await;
        let again = manager.deliver(record).await;

        assert!(again.delivered);
        assert_eq!(remote.attempts().len(), 1);
        assert_eq!(manager.sent().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_redelivering_pending_updates_in_place() {
        let remote = Arc::new(ScriptedStore::new());
        remote.fail("crashes");
        remote.fail("emergency_alerts");
        remote.fail("alerts");
        let manager = manager(remote.clone());
        let record = sample_record("CRASH-1", AlertKind::Crash);

        manager.deliver(record.clone()).await;
        let second = manager.deliver(record).await;

        assert!(!second.delivered);
        assert_eq!(second.retry_count, 1);
        let pending = manager.pending().entries().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_sent_record_evicted_from_sent_queue_is_not_queued_again() {
        let remote = Arc::new(ScriptedStore::new());
        let storage = Arc::new(Storage::open_in_memory().unwrap());
        let config = DeliveryConfig {
            queue_capacity: 1,
            ..DeliveryConfig::default()
        };
        let manager = DeliveryManager::new(remote.clone(), storage, config);

        let mut first = sample_record("SOS-1", AlertKind::Sos);
        manager.deliver(first.clone()).await;
        manager.deliver(sample_record("SOS-2", AlertKind::Sos)).await;
        assert!(manager.sent().find("SOS-1").unwrap().is_none());

        for collection in ["sos_alerts", "emergency_alerts", "alerts"] {
            remote.fail(collection);
        }
        first.transition(DeliveryState::Sent);
        let attempts_before = remote.attempts().len();
        let result = manager.deliver(first).await;

        assert!(result.delivered);
        assert_eq!(result.state, DeliveryState::Sent);
        assert_eq!(remote.attempts().len(), attempts_before);
        assert!(manager.pending().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_failed_then_delivered_alert_appears_once_in_history() {
        let remote = Arc::new(ScriptedStore::new());
        for collection in ["sos_alerts", "emergency_alerts", "alerts"] {
            remote.fail(collection);
        }
        let manager = manager(remote.clone());
        let record = sample_record("SOS-1", AlertKind::Sos);

        let first = manager.deliver(record.clone()).await;
        assert!(!first.delivered);
        remote.heal();
        let second = manager.deliver(record).await;
        assert!(second.delivered);

        let history = manager.history(10).await;
        let matching: Vec<_> = history.iter().filter(|r| r.alert_id == "SOS-1").collect();
        assert_eq!(matching.len(), 1);
        assert_eq!(matching[0].delivery_state, DeliveryState::Sent);
    }

    fn sample_update(alert_id: &str) -> LocationUpdate {
        let point = crate::alert::GeoPoint {
            latitude: 14.5995,
            longitude: 120.9842,
            accuracy_meters: 10.0,
        };
        LocationUpdate::new(alert_id, "u-1", point, Utc::now())
    }

    #[tokio::test]
    async fn test_send_update_writes_updates_collection() {
        let remote = Arc::new(ScriptedStore::new());
        let manager = manager(remote.clone());
        let update = sample_update("SOS-1");
        let update_id = update.update_id.clone();

        let result = manager.send_update(update).await;

        assert!(result.delivered);
        assert_eq!(result.collection.as_deref(), Some("sos_updates"));
        assert_eq!(remote.attempts(), vec!["sos_updates"]);
        let stored = remote.stored("sos_updates");
        assert_eq!(stored[0].0, update_id);
        assert_eq!(stored[0].1["alertId"], "SOS-1");
        assert_eq!(stored[0].1["status"], "UPDATE");
        assert!(manager.updates().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_failed_update_is_queued_and_retried() {
        let remote = Arc::new(ScriptedStore::new());
        remote.fail("sos_updates");
        let manager = manager(remote.clone());

        let result = manager.send_update(sample_update("SOS-1")).await;
        assert!(!result.delivered);
        assert!(result.locally_saved);
        assert!(result.user_message().contains("saved locally"));
        assert_eq!(manager.updates().len().unwrap(), 1);
        assert!(manager.pending().is_empty().unwrap());

        remote.heal();
        let report = manager.retry_pending().await.unwrap();

        assert_eq!(report.attempted, 0);
        assert_eq!(report.updates_attempted, 1);
        assert_eq!(report.updates_delivered, 1);
        assert!(manager.updates().is_empty().unwrap());
        assert_eq!(remote.stored("sos_updates").len(), 1);
    }

    #[tokio::test]
    async fn test_local_storage_failure_is_reported_not_raised() {
        let remote = Arc::new(ScriptedStore::new());
        remote.fail("sos_alerts");
        remote.fail("emergency_alerts");
        remote.fail("alerts");
        let store = Arc::new(FlakyStore::new());
        store.set_broken(true);
        let manager = DeliveryManager::new(remote, store, DeliveryConfig::default());

        let result = manager.deliver(sample_record("SOS-1", AlertKind::Sos)).await;

        assert!(!result.delivered);
        assert!(!result.locally_saved);
        assert!(result.user_message().contains("could not be sent or saved"));
    }

    #[tokio::test]
    async fn test_retry_moves_pending_to_sent() {
        let remote = Arc::new(ScriptedStore::new());
        remote.fail("sos_alerts");
        remote.fail("emergency_alerts");
        remote.fail("alerts");
        let manager = manager(remote.clone());

        manager.deliver(sample_record("SOS-1", AlertKind::Sos)).await;
        manager.deliver(sample_record("SOS-2", AlertKind::Sos)).await;
        assert_eq!(manager.pending().len().unwrap(), 2);

        remote.heal();
        let report = manager.retry_pending().await.unwrap();

        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.still_pending, 0);
        assert_eq!(report.results[0].alert_id, "SOS-1");
        assert!(manager.pending().is_empty().unwrap());
        assert_eq!(manager.sent().len().unwrap(), 2);
        assert_eq!(remote.stored("sos_alerts").len(), 2);

        let again = manager.retry_pending().await.unwrap();
        assert_eq!(again.attempted, 0);
        assert_eq!(manager.sent().len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_retry_failure_increments_retry_count() {
        let remote = Arc::new(ScriptedStore::new());
        remote.fail("crashes");
        remote.fail("emergency_alerts");
        remote.fail("alerts");
        let manager = manager(remote.clone());
        manager.deliver(sample_record("CRASH-1", AlertKind::Crash)).await;

        let report = manager.retry_pending().await.unwrap();

        assert_eq!(report.delivered, 0);
        assert_eq!(report.still_pending, 1);
        assert_eq!(manager.pending().entries().unwrap()[0].retry_count, 1);
    }

    #[tokio::test]
    async fn test_history_dedupes_and_prefers_remote() {
        let remote = Arc::new(ScriptedStore::new());
        let manager = manager(remote.clone());

        let mut older = sample_record("SOS-1", AlertKind::Sos);
        older.created_at = Utc::now() - ChronoDuration::minutes(5);
        manager.deliver(older).await;

        remote.fail("crashes");
        remote.fail("emergency_alerts");
        remote.fail("alerts");
        manager.deliver(sample_record("CRASH-1", AlertKind::Crash)).await;

        let history = manager.history(10).await;
        let ids: Vec<_> = history.iter().map(|r| r.alert_id.as_str()).collect();
        assert_eq!(ids, vec!["CRASH-1", "SOS-1"]);
        assert_eq!(history[0].delivery_state, DeliveryState::FailedLocal);
        assert_eq!(history[1].delivery_state, DeliveryState::Sent);
        assert_eq!(history[1].location, None);
    }

    #[tokio::test]
    async fn test_history_limit() {
        let remote = Arc::new(ScriptedStore::new());
        let manager = manager(remote);
        for i in 0..5 {
            let mut record = sample_record(&format!("SOS-{i}"), AlertKind::Sos);
            record.created_at = Utc::now() + ChronoDuration::seconds(i);
            record.severity = AlertSeverity::Critical;
            manager.deliver(record).await;
        }

        let history = manager.history(3).await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].alert_id, "SOS-4");
    }

    #[tokio::test]
    async fn test_spawned_delivery_completes_without_caller() {
        let remote = Arc::new(ScriptedStore::new());
        remote.set_delay(Duration::from_millis(30));
        let manager = Arc::new(manager(remote.clone()));

        let handle = manager.spawn_deliver(sample_record("SOS-1", AlertKind::Sos));
        let result = handle.await.unwrap();
        assert!(result.delivered);
        assert_eq!(manager.sent().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_deliveries() {
        let remote = Arc::new(ScriptedStore::new());
        let manager = Arc::new(manager(remote.clone()));

        let sos = manager.spawn_deliver(sample_record("SOS-1", AlertKind::Sos));
        let crash = manager.spawn_deliver(sample_record("CRASH-1", AlertKind::Crash));
        assert!(sos.await.unwrap().delivered);
        assert!(crash.await.unwrap().delivered);
        assert_eq!(manager.sent().len().unwrap(), 2);
    }

    #[test]
    fn test_user_messages() {
        let mut result = DeliveryResult {
            alert_id: "SOS-1".to_string(),
            delivered: true,
            state: DeliveryState::Sent,
            collection: Some("sos_alerts".to_string()),
            document_id: Some("SOS-1".to_string()),
            reason: None,
            locally_saved: true,
            retry_count: 0,
        };
        assert_eq!(result.user_message(), "Emergency alert sent.");
        result.delivered = false;
        assert!(result.user_message().contains("saved locally"));
    }
}
