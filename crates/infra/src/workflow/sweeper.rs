use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::processor::WorkflowProcessor;
use super::step::WakeCheck;
use crate::workers::WorkerHandle;

/// Periodically resume parked workflows whose wake condition now holds.
pub fn spawn_restart_sweeper(
    processor: Arc<WorkflowProcessor>,
    check: Arc<dyn WakeCheck>,
    interval: Duration,
) -> WorkerHandle {
    let name = format!("restart-sweeper-{}", processor.name());
    WorkerHandle::every(name, interval, move || {
        let processor = Arc::clone(&processor);
        let check = Arc::clone(&check);
        async move {
            let report = processor.restart_processors(check.as_ref(), None).await;
            if report.resumed + report.retried + report.failed > 0 {
                info!(
                    processor = %processor.name(),
                    resumed = report.resumed,
                    retried = report.retried,
                    failed = report.failed,
                    "restart sweep finished"
                );
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{AttachOptions, EventLogConnection, InMemoryEventLog};
    use crate::state_manager::StateManager;
    use crate::state_store::{StateStore, StoreHandle};
    use crate::workflow::{InMemoryTriggerFeed, SharedContext, Step, StepContext, StepOutcome, Trigger, spawn_feed_worker};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use stockflow_core::{PathSchema, SchemaDefinition, TenantId};
    use stockflow_events::{WakeCondition, combine_reducers};

    struct Park;

    #[async_trait]
    impl Step for Park {
        async fn run(&self, _ctx: &mut StepContext) -> anyhow::Result<StepOutcome> {
            Ok(StepOutcome::sleep_until(None, WakeCondition::stage("go")))
        }
    }

    struct Done;

    #[async_trait]
    impl Step for Done {
        async fn run(&self, _ctx: &mut StepContext) -> anyhow::Result<StepOutcome> {
            Ok(StepOutcome::finish(None))
        }
    }

    struct Gate(AtomicBool);

    #[async_trait]
    impl WakeCheck for Gate {
        async fn stage_reached(&self, _doc_id: &str, _stage: &str) -> anyhow::Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    async fn wait_until<F, Fut>(mut condition: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if condition().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        false
    }

    #[tokio::test]
    async fn triggers_start_runs_and_the_sweeper_wakes_them() {
        let log = Arc::new(InMemoryEventLog::with_tenant(TenantId::new()));
        let connection = Arc::new(EventLogConnection::attach(log, AttachOptions::default()).await.unwrap());
        let schema = Arc::new(
            SchemaDefinition::builder()
                .path("stats", "hits", PathSchema::counter())
                .build()
                .unwrap(),
        );
        let store = StoreHandle::new(StateStore::in_memory("main", schema));
        let reducer = combine_reducers(vec![], vec![]).unwrap();
        let manager = Arc::new(StateManager::new("main", Arc::clone(&connection), store, reducer).unwrap());
        let processor = Arc::new(
            WorkflowProcessor::new("flow", manager, SharedContext::new(connection))
                .unwrap()
                .use_step(Park)
                .use_step(Done),
        );

        let inbox = Arc::new(InMemoryTriggerFeed::new());
        let worker = spawn_feed_worker(Arc::clone(&processor), inbox.clone(), None);
        let gate = Arc::new(Gate(AtomicBool::new(false)));
        let sweeper = spawn_restart_sweeper(Arc::clone(&processor), gate.clone(), Duration::from_millis(5));

        inbox.submit(Trigger::inline(json!({"id": "w-1"})));
        assert!(wait_until(|| async { processor.processing().get("w-1").await.is_some() }).await);

        gate.0.store(true, Ordering::SeqCst);
        assert!(wait_until(|| async { processor.processing().get("w-1").await.is_none() }).await);

        worker.shutdown().await;
        sweeper.shutdown().await;
    }
}
