use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use stockflow_events::TenantScoped;

use crate::event_log::{EventLogConnection, ReplayTarget};

use super::WorkerHandle;

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(500);

/// Generic follower loop.
///
/// - Subscribes to the connection's change feed from its current position
/// - Applies each new record to every target (targets skip what they have seen)
/// - Re-subscribes if the feed ends or a record fails to apply
/// - Supports graceful shutdown
pub(crate) fn spawn(connection: Arc<EventLogConnection>, targets: Vec<Arc<dyn ReplayTarget>>) -> WorkerHandle {
    let name = format!("follower-{}", connection.tenant());
    let worker = name.clone();

    WorkerHandle::spawn(name, move |mut shutdown| async move {
        let refs: Vec<&dyn ReplayTarget> = targets.iter().map(|t| t.as_ref()).collect();

        loop {
            let after = connection.sequence().await;
            let mut feed = match connection.log().subscribe(connection.tenant(), after).await {
                Ok(feed) => feed,
                Err(err) => {
                    warn!(worker = %worker, error = %err, "change feed subscribe failed");
                    tokio::select! {
                        _ = shutdown.wait() => return,
                        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => continue,
                    }
                }
            };
            info!(worker = %worker, after, "following change feed");

            loop {
                let record = tokio::select! {
                    _ = shutdown.wait() => return,
                    next = feed.next() => next,
                };
                let Some(record) = record else {
                    warn!(worker = %worker, "change feed closed");
                    break;
                };
                if record.tenant_id() != connection.tenant() {
                    warn!(worker = %worker, sequence = record.sequence, "dropping record from foreign partition");
                    continue;
                }
                if let Err(err) = connection.apply_live(&record, &refs).await {
                    warn!(worker = %worker, sequence = record.sequence, error = %err, "follower failed to apply record");
                    break;
                }
            }

            tokio::select! {
                _ = shutdown.wait() => return,
                _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => {}
            }
        }
    })
}
