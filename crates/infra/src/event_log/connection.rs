//! One process's attachment to a tenant partition of the event log.
//!
//! The connection owns three things:
//! - the tenant (partition key) resolved at attach time
//! - the replay position: the sequence of the last record this process applied
//! - the dispatch mutex that serializes every write for this partition
//!
//! Log sequence numbers are assigned in exactly the order dispatches acquire
//! the mutex. Callers race for the mutex, never for sequence numbers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use stockflow_core::TenantId;
use stockflow_events::EventRecord;

use super::r#trait::{EventLog, EventLogError};
use crate::workers::WorkerHandle;
use crate::workers::tenant_guard::TenantGuard;

/// Something replay can feed records into (a state store, a processor's checkpoints).
///
/// `apply_record` must ignore records it has already applied.
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    fn name(&self) -> &str;

    async fn apply_record(&self, record: &EventRecord) -> Result<(), EventLogError>;
}

/// How to resolve the tenant when attaching.
#[derive(Debug, Clone)]
pub struct AttachOptions {
    /// Use this tenant (writing the marker if needed) instead of waiting for one.
    pub tenant: Option<TenantId>,
    /// Delete the partition's existing records and snapshots.
    pub purge: bool,
    /// Marker polling interval while waiting.
    pub tenant_poll: Duration,
}

impl Default for AttachOptions {
    fn default() -> Self {
        Self {
            tenant: None,
            purge: false,
            tenant_poll: Duration::from_secs(5),
        }
    }
}

impl AttachOptions {
    pub fn with_tenant(mut self, tenant: TenantId) -> Self {
        self.tenant = Some(tenant);
        self
    }

    pub fn with_purge(mut self, purge: bool) -> Self {
        self.purge = purge;
        self
    }

    pub fn with_tenant_poll(mut self, poll: Duration) -> Self {
        self.tenant_poll = poll;
        self
    }
}

/// Exclusive right to write to the partition. Released on drop.
#[derive(Debug)]
pub struct DispatchLock<'a> {
    guard: MutexGuard<'a, u64>,
}

impl DispatchLock<'_> {
    /// Sequence of the last record applied by this process.
    pub fn sequence(&self) -> u64 {
        *self.guard
    }

    pub fn next_sequence(&self) -> u64 {
        *self.guard + 1
    }

    pub(crate) fn advance(&mut self, sequence: u64) {
        debug_assert!(sequence > *self.guard, "sequence must never regress");
        if sequence > *self.guard {
            *self.guard = sequence;
        }
    }
}

pub struct EventLogConnection {
    log: Arc<dyn EventLog>,
    tenant: TenantId,
    sequence: Mutex<u64>,
}

impl core::fmt::Debug for EventLogConnection {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("EventLogConnection")
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

impl EventLogConnection {
    /// Resolve the tenant and attach.
    ///
    /// Without an explicit tenant this polls the marker every
    /// `options.tenant_poll` until one appears.
    pub async fn attach(log: Arc<dyn EventLog>, options: AttachOptions) -> Result<Self, EventLogError> {
        let tenant = match options.tenant {
            Some(tenant) => {
                match log.tenant_marker().await? {
                    Some(existing) if existing == tenant => {}
                    Some(existing) => {
                        warn!(%existing, %tenant, "replacing tenant marker");
                        log.set_tenant_marker(tenant).await?;
                    }
                    None => {
                        info!(%tenant, "writing tenant marker");
                        log.set_tenant_marker(tenant).await?;
                    }
                }
                tenant
            }
            None => loop {
                if let Some(tenant) = log.tenant_marker().await? {
                    break tenant;
                }
                info!(poll_ms = options.tenant_poll.as_millis() as u64, "waiting for tenant marker");
                tokio::time::sleep(options.tenant_poll).await;
            },
        };

        if options.purge {
            let removed = log.purge_partition(tenant).await?;
            warn!(%tenant, removed, "purged partition on attach");
        }

        info!(%tenant, "attached to event log");
        Ok(Self {
            log,
            tenant,
            sequence: Mutex::new(0),
        })
    }

    pub fn tenant(&self) -> TenantId {
        self.tenant
    }

    pub fn log(&self) -> &Arc<dyn EventLog> {
        &self.log
    }

    /// Take the dispatch mutex.
    pub async fn acquire(&self) -> DispatchLock<'_> {
        DispatchLock {
            guard: self.sequence.lock().await,
        }
    }

    /// Current replay position (briefly takes the mutex).
    pub async fn sequence(&self) -> u64 {
        *self.sequence.lock().await
    }

    /// Apply every record after the current position to `targets`, in order.
    ///
    /// Safe to call repeatedly: already-seen sequences are never re-applied.
    /// Returns the new position.
    pub async fn roll_forward_state<F>(&self, targets: &[&dyn ReplayTarget], on_each: F) -> Result<u64, EventLogError>
    where
        F: FnMut(&EventRecord) + Send,
    {
        let mut lock = self.acquire().await;
        self.roll_forward_locked(&mut lock, targets, on_each).await
    }

    pub(crate) async fn roll_forward_locked<F>(
        &self,
        lock: &mut DispatchLock<'_>,
        targets: &[&dyn ReplayTarget],
        mut on_each: F,
    ) -> Result<u64, EventLogError>
    where
        F: FnMut(&EventRecord) + Send,
    {
        let start = lock.sequence();
        let records = self.log.load_after(self.tenant, start).await?;

        for record in &records {
            self.apply_next(lock, targets, record).await?;
            on_each(record);
        }

        if !records.is_empty() {
            info!(
                tenant = %self.tenant,
                from = start,
                to = lock.sequence(),
                applied = records.len(),
                "rolled forward"
            );
        }
        Ok(lock.sequence())
    }

    /// Apply one live record, catching up from the log if the feed skipped ahead.
    pub(crate) async fn apply_live(&self, record: &EventRecord, targets: &[&dyn ReplayTarget]) -> Result<(), EventLogError> {
        let mut lock = self.acquire().await;
        if record.sequence <= lock.sequence() {
            debug!(sequence = record.sequence, "ignoring already applied record");
            return Ok(());
        }
        if record.sequence == lock.next_sequence() {
            return self.apply_next(&mut lock, targets, record).await;
        }
        warn!(
            expected = lock.next_sequence(),
            found = record.sequence,
            "change feed skipped ahead; catching up from log"
        );
        self.roll_forward_locked(&mut lock, targets, |_| {}).await.map(|_| ())
    }

    async fn apply_next(
        &self,
        lock: &mut DispatchLock<'_>,
        targets: &[&dyn ReplayTarget],
        record: &EventRecord,
    ) -> Result<(), EventLogError> {
        if record.partition_key != self.tenant {
            return Err(EventLogError::TenantIsolation(format!(
                "record {} belongs to tenant {}",
                record.sequence, record.partition_key
            )));
        }
        let expected = lock.next_sequence();
        if record.sequence != expected {
            return Err(EventLogError::SequenceGap {
                expected,
                found: record.sequence,
            });
        }

        for target in targets {
            target.apply_record(record).await?;
        }
        lock.advance(record.sequence);
        Ok(())
    }

    /// Follow the change feed, applying new records to `targets` as they arrive.
    pub fn subscribe(self: &Arc<Self>, targets: Vec<Arc<dyn ReplayTarget>>) -> WorkerHandle {
        crate::workers::follower::spawn(Arc::clone(self), targets)
    }

    /// Watch the tenant marker; resolves when it points elsewhere.
    pub fn spawn_tenant_guard(self: &Arc<Self>, interval: Duration) -> TenantGuard {
        crate::workers::tenant_guard::spawn(Arc::clone(self), interval)
    }
}
