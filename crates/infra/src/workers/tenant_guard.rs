use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{error, warn};

use stockflow_core::TenantId;

use crate::event_log::EventLogConnection;

use super::WorkerHandle;

/// The tenant marker no longer names the tenant this process attached to.
///
/// Everything in memory belongs to `previous`; the only safe move is a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("tenant changed from {previous} to {current}")]
pub struct TenantChanged {
    pub previous: TenantId,
    pub current: TenantId,
}

/// Periodic tenant-marker watch.
#[derive(Debug)]
pub struct TenantGuard {
    worker: WorkerHandle,
    changed: oneshot::Receiver<TenantChanged>,
}

impl TenantGuard {
    /// Resolves once the marker moved (and the stale partition was purged).
    ///
    /// Pends forever if the guard was shut down first.
    pub async fn changed(&mut self) -> TenantChanged {
        match (&mut self.changed).await {
            Ok(change) => change,
            Err(_) => std::future::pending().await,
        }
    }

    pub async fn shutdown(self) {
        self.worker.shutdown().await;
    }
}

pub(crate) fn spawn(connection: Arc<EventLogConnection>, interval: Duration) -> TenantGuard {
    let (tx, rx) = oneshot::channel();
    let previous = connection.tenant();

    let worker = WorkerHandle::spawn(format!("tenant-guard-{previous}"), move |mut shutdown| async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
        loop {
            tokio::select! {
                _ = shutdown.wait() => return,
                _ = ticker.tick() => {}
            }

            let current = match connection.log().tenant_marker().await {
                Ok(Some(current)) if current != previous => current,
                Ok(_) => continue,
                Err(err) => {
                    warn!(tenant = %previous, error = %err, "tenant marker check failed");
                    continue;
                }
            };

            // Hold the dispatch mutex so no write lands in the stale partition.
            let _lock = connection.acquire().await;
            match connection.log().purge_partition(previous).await {
                Ok(removed) => warn!(%previous, %current, removed, "tenant changed; purged stale partition"),
                Err(err) => error!(%previous, %current, error = %err, "tenant changed; purge failed"),
            }
            let _ = tx.send(TenantChanged { previous, current });
            return;
        }
    });

    TenantGuard { worker, changed: rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{AttachOptions, EventLog, InMemoryEventLog};
    use stockflow_events::EventRecord;

    #[tokio::test]
    async fn guard_fires_and_purges_on_marker_change() {
        let tenant = TenantId::new();
        let log = Arc::new(InMemoryEventLog::with_tenant(tenant));
        log.append(&EventRecord::new(tenant, 1)).await.unwrap();
        let connection = Arc::new(EventLogConnection::attach(log.clone(), AttachOptions::default()).await.unwrap());

        let mut guard = connection.spawn_tenant_guard(Duration::from_millis(5));
        let next = TenantId::new();
        log.set_tenant_marker(next).await.unwrap();

        let change = tokio::time::timeout(Duration::from_secs(2), guard.changed())
            .await
            .expect("guard did not fire");
        assert_eq!(change, TenantChanged { previous: tenant, current: next });
        assert_eq!(log.latest_sequence(tenant).await.unwrap(), 0);
        guard.shutdown().await;
    }
}
