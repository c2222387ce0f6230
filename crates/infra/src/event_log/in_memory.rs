use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use stockflow_core::TenantId;
use stockflow_events::EventRecord;

use super::r#trait::{ChangeFeed, EventLog, EventLogError, StoredSnapshot};

type Partitions = Arc<RwLock<HashMap<TenantId, Vec<EventRecord>>>>;

const FEED_CAPACITY: usize = 1024;

/// In-memory append-only event log.
///
/// Intended for tests/dev. Not optimized for performance.
#[derive(Debug)]
pub struct InMemoryEventLog {
    partitions: Partitions,
    snapshots: RwLock<HashMap<TenantId, Vec<StoredSnapshot>>>,
    marker: RwLock<Option<TenantId>>,
    feed: broadcast::Sender<EventRecord>,
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            partitions: Arc::default(),
            snapshots: RwLock::default(),
            marker: RwLock::default(),
            feed,
        }
    }
}

impl InMemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience for tests: a log whose tenant marker is already set.
    pub fn with_tenant(tenant: TenantId) -> Self {
        let log = Self::default();
        if let Ok(mut marker) = log.marker.write() {
            *marker = Some(tenant);
        }
        log
    }

    fn poisoned() -> EventLogError {
        EventLogError::Storage("lock poisoned".to_string())
    }

    fn records_after(partitions: &Partitions, tenant: TenantId, after: u64) -> Result<Vec<EventRecord>, EventLogError> {
        let partitions = partitions.read().map_err(|_| Self::poisoned())?;
        Ok(partitions
            .get(&tenant)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| r.sequence > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, record: &EventRecord) -> Result<(), EventLogError> {
        {
            let mut partitions = self.partitions.write().map_err(|_| Self::poisoned())?;
            let stream = partitions.entry(record.partition_key).or_default();
            let current = stream.last().map(|r| r.sequence).unwrap_or(0);

            if record.sequence != current + 1 {
                return Err(EventLogError::Conflict(format!(
                    "expected sequence {}, got {}",
                    current + 1,
                    record.sequence
                )));
            }

            stream.push(record.clone());
        }

        // No live subscribers is fine.
        let _ = self.feed.send(record.clone());
        Ok(())
    }

    async fn load_after(&self, tenant: TenantId, after: u64) -> Result<Vec<EventRecord>, EventLogError> {
        Self::records_after(&self.partitions, tenant, after)
    }

    async fn latest_sequence(&self, tenant: TenantId) -> Result<u64, EventLogError> {
        let partitions = self.partitions.read().map_err(|_| Self::poisoned())?;
        Ok(partitions
            .get(&tenant)
            .and_then(|records| records.last())
            .map(|r| r.sequence)
            .unwrap_or(0))
    }

    async fn subscribe(&self, tenant: TenantId, after: u64) -> Result<ChangeFeed, EventLogError> {
        // Subscribe before reading the backlog so nothing falls in between.
        let mut live = self.feed.subscribe();
        let backlog = Self::records_after(&self.partitions, tenant, after)?;
        let partitions = Arc::clone(&self.partitions);
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);

        let reader = tokio::spawn(async move {
            let mut last = after;
            for record in backlog {
                last = record.sequence;
                if tx.send(record).await.is_err() {
                    return;
                }
            }

            loop {
                let pending = match live.recv().await {
                    Ok(record) if record.partition_key == tenant && record.sequence > last => vec![record],
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(%tenant, skipped, "change feed lagged; reloading from log");
                        match InMemoryEventLog::records_after(&partitions, tenant, last) {
                            Ok(records) => records,
                            Err(_) => return,
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                };

                for record in pending {
                    last = record.sequence;
                    if tx.send(record).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(ChangeFeed::new(rx, reader))
    }

    async fn tenant_marker(&self) -> Result<Option<TenantId>, EventLogError> {
        let marker = self.marker.read().map_err(|_| Self::poisoned())?;
        Ok(*marker)
    }

    async fn set_tenant_marker(&self, tenant: TenantId) -> Result<(), EventLogError> {
        let mut marker = self.marker.write().map_err(|_| Self::poisoned())?;
        *marker = Some(tenant);
        Ok(())
    }

    async fn purge_partition(&self, tenant: TenantId) -> Result<u64, EventLogError> {
        let removed = {
            let mut partitions = self.partitions.write().map_err(|_| Self::poisoned())?;
            partitions.remove(&tenant).map(|r| r.len() as u64).unwrap_or(0)
        };
        let mut snapshots = self.snapshots.write().map_err(|_| Self::poisoned())?;
        snapshots.remove(&tenant);
        Ok(removed)
    }

    async fn store_snapshot(&self, snapshot: &StoredSnapshot) -> Result<(), EventLogError> {
        let mut snapshots = self.snapshots.write().map_err(|_| Self::poisoned())?;
        snapshots
            .entry(snapshot.metadata.tenant)
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn load_latest_snapshot(&self, tenant: TenantId) -> Result<Option<StoredSnapshot>, EventLogError> {
        let snapshots = self.snapshots.read().map_err(|_| Self::poisoned())?;
        Ok(snapshots
            .get(&tenant)
            .and_then(|s| s.iter().max_by_key(|s| s.metadata.event_seq))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use stockflow_events::SnapshotMetadata;

    fn record(tenant: TenantId, sequence: u64) -> EventRecord {
        EventRecord::new(tenant, sequence)
    }

    #[tokio::test]
    async fn append_rejects_out_of_order_sequences() {
        let tenant = TenantId::new();
        let log = InMemoryEventLog::new();

        log.append(&record(tenant, 1)).await.unwrap();
        let err = log.append(&record(tenant, 3)).await.unwrap_err();
        assert!(matches!(err, EventLogError::Conflict(_)));
        let err = log.append(&record(tenant, 1)).await.unwrap_err();
        assert!(matches!(err, EventLogError::Conflict(_)));

        assert_eq!(log.latest_sequence(tenant).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn partitions_are_isolated() {
        let a = TenantId::new();
        let b = TenantId::new();
        let log = InMemoryEventLog::new();

        log.append(&record(a, 1)).await.unwrap();
        log.append(&record(b, 1)).await.unwrap();
        log.append(&record(a, 2)).await.unwrap();

        let loaded = log.load_after(a, 0).await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.iter().all(|r| r.partition_key == a));

        assert_eq!(log.purge_partition(a).await.unwrap(), 2);
        assert!(log.load_after(a, 0).await.unwrap().is_empty());
        assert_eq!(log.latest_sequence(b).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn feed_delivers_backlog_then_live_records() {
        let tenant = TenantId::new();
        let other = TenantId::new();
        let log = InMemoryEventLog::new();

        log.append(&record(tenant, 1)).await.unwrap();
        log.append(&record(tenant, 2)).await.unwrap();

        let mut feed = log.subscribe(tenant, 1).await.unwrap();
        log.append(&record(other, 1)).await.unwrap();
        log.append(&record(tenant, 3)).await.unwrap();

        assert_eq!(feed.next().await.unwrap().sequence, 2);
        assert_eq!(feed.next().await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn latest_snapshot_wins() {
        let tenant = TenantId::new();
        let log = InMemoryEventLog::new();
        for seq in [5, 20, 10] {
            log.store_snapshot(&StoredSnapshot {
                metadata: SnapshotMetadata::new(tenant, seq, Utc::now()),
                body: json!({}),
            })
            .await
            .unwrap();
        }

        let latest = log.load_latest_snapshot(tenant).await.unwrap().unwrap();
        assert_eq!(latest.metadata.event_seq, 20);
    }
}
