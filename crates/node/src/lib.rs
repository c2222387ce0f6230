//! Process wiring: config → event log → state manager → workflow → workers.
//!
//! ```text
//! boot:  attach ─► restore snapshot ─► roll forward ─► restart parked workflows
//! run:   inbox ─► order_to_shipment           sweeper ─► restart_processors
//!        tenant guard ─► exit                 snapshotter ─► snapshot when due
//! ```

use std::sync::Arc;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use stockflow_core::TenantId;
use stockflow_events::{Action, EventBus, OutboundEvent};
use stockflow_infra::state_store::{PostgresStoreBackend, StoreBackend};
use stockflow_infra::{
    EngineConfig, EventLog, EventLogConnection, InMemoryEventLog, InMemoryTriggerFeed, PostgresEventLog,
    ReplayTarget, StateManager, Snapshotter, TenantChanged, Trigger, WorkerHandle, WorkflowProcessor,
    spawn_feed_worker, spawn_restart_sweeper, spawn_snapshotter,
};
use stockflow_processes::{FactoryStageWatch, operations_manager, operations_store, order_to_shipment};

/// Channel name for outbound change notifications.
pub const EVENTS_CHANNEL: &str = "stockflow.events";

/// Why [`Node::run`] returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exit {
    Interrupted,
    /// The process must restart; it exits non-zero.
    TenantChanged(TenantChanged),
}

/// One line of operator input.
///
/// `{"trigger": {...}}` starts a workflow, `{"action": {...}}` dispatches
/// straight to the operations manager.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Command {
    Dispatch { action: Action },
    Trigger(Trigger),
}

pub struct Node {
    config: EngineConfig,
    connection: Arc<EventLogConnection>,
    operations: Arc<StateManager>,
    processor: Arc<WorkflowProcessor>,
    snapshotter: Arc<Snapshotter>,
    inbox: Arc<InMemoryTriggerFeed>,
    /// Token of the last trigger a committed run started from.
    resume_after: Option<String>,
}

impl core::fmt::Debug for Node {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Node")
            .field("tenant", &self.connection.tenant())
            .field("processor", &self.processor.name())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Attach, rebuild state and resume interrupted workflows.
    pub async fn boot(config: EngineConfig) -> anyhow::Result<Self> {
        let (log, pool) = open_log(&config).await?;
        let connection = Arc::new(
            EventLogConnection::attach(log, config.attach_options())
                .await
                .context("attaching to the event log")?,
        );
        let tenant = connection.tenant();
        info!(%tenant, "attached");

        let backend: Option<Arc<dyn StoreBackend>> = match pool {
            Some(pool) => {
                let postgres = PostgresStoreBackend::new(pool, tenant);
                postgres.ensure_schema().await?;
                let backend: Arc<dyn StoreBackend> = Arc::new(postgres);
                Some(backend)
            }
            None => None,
        };

        let publisher = outbound_publisher(&config)?;
        let mut operations = operations_manager(Arc::clone(&connection), operations_store(backend).await?)?;
        if let Some(publisher) = &publisher {
            operations = operations.with_publisher(Arc::clone(publisher));
        }
        let operations = Arc::new(operations);

        let processor = Arc::new(order_to_shipment(Arc::clone(&operations))?.with_retry_poll(config.retry_poll));

        let mut snapshotter = Snapshotter::new(Arc::clone(&connection))
            .with_store(operations.store().clone())
            .with_processor(processor.processing().clone());
        if let Some(publisher) = publisher {
            snapshotter = snapshotter.with_publisher(publisher);
        }

        if let Some(restored) = snapshotter.restore_latest().await? {
            info!(event_seq = restored.event_seq, name = %restored.name, "state restored from snapshot");
        }
        let targets: [&dyn ReplayTarget; 2] = [operations.store(), processor.processing()];
        let sequence = connection
            .roll_forward_state(&targets, |record| debug!(seq = record.sequence, "replayed"))
            .await
            .context("rolling the event log forward")?;
        info!(sequence, "state rebuilt");

        let seed = processor.processing().snapshot().await;
        let resume_after = seed.last_trigger.clone();
        let watch = FactoryStageWatch::new(Arc::clone(&operations));
        let report = processor.restart_processors(&watch, Some(seed)).await;
        info!(
            resumed = report.resumed,
            retried = report.retried,
            failed = report.failed,
            "interrupted workflows restarted"
        );

        Ok(Self {
            config,
            connection,
            operations,
            processor,
            snapshotter: Arc::new(snapshotter),
            inbox: Arc::new(InMemoryTriggerFeed::new()),
            resume_after,
        })
    }

    pub fn tenant(&self) -> TenantId {
        self.connection.tenant()
    }

    pub fn operations(&self) -> &Arc<StateManager> {
        &self.operations
    }

    pub fn processor(&self) -> &Arc<WorkflowProcessor> {
        &self.processor
    }

    /// Where workflow triggers are submitted.
    pub fn inbox(&self) -> &Arc<InMemoryTriggerFeed> {
        &self.inbox
    }

    pub fn resume_after(&self) -> Option<&str> {
        self.resume_after.as_deref()
    }

    /// Serve the inbox until ctrl-c or a tenant change, then stop every worker.
    pub async fn run(self) -> anyhow::Result<Exit> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = %err, "ctrl-c handler unavailable");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// [`Node::run`] with an arbitrary stop signal.
    pub async fn run_until(self, stop: impl Future<Output = ()>) -> anyhow::Result<Exit> {
        let watch = Arc::new(FactoryStageWatch::new(Arc::clone(&self.operations)));
        let mut workers: Vec<WorkerHandle> = vec![
            spawn_restart_sweeper(Arc::clone(&self.processor), watch, self.config.sweep_interval),
            spawn_feed_worker(
                Arc::clone(&self.processor),
                self.inbox.clone(),
                self.resume_after.clone(),
            ),
        ];
        let policy = self.config.snapshot_policy();
        if policy.every > 0 {
            workers.push(spawn_snapshotter(
                Arc::clone(&self.snapshotter),
                policy,
                self.config.sweep_interval,
            ));
        }
        let mut guard = self.connection.spawn_tenant_guard(self.config.tenant_poll);

        let exit = tokio::select! {
            _ = stop => Exit::Interrupted,
            changed = guard.changed() => Exit::TenantChanged(changed),
        };
        info!(?exit, "shutting down");

        guard.shutdown().await;
        for worker in workers {
            worker.shutdown().await;
        }
        Ok(exit)
    }
}

async fn open_log(config: &EngineConfig) -> anyhow::Result<(Arc<dyn EventLog>, Option<sqlx::PgPool>)> {
    match &config.database_url {
        Some(url) => {
            let pool = sqlx::PgPool::connect(url).await.context("connecting to Postgres")?;
            let postgres = PostgresEventLog::new(pool.clone()).with_feed_poll(config.feed_poll);
            postgres.ensure_schema().await?;
            let log: Arc<dyn EventLog> = Arc::new(postgres);
            Ok((log, Some(pool)))
        }
        None => {
            // Nothing else can write the marker of a private in-memory log.
            let tenant = config.tenant.unwrap_or_else(|| {
                let tenant = TenantId::new();
                warn!(%tenant, "no tenant configured; using a fresh one");
                tenant
            });
            let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::with_tenant(tenant));
            Ok((log, None))
        }
    }
}

#[cfg(feature = "redis")]
fn outbound_publisher(config: &EngineConfig) -> anyhow::Result<Option<Arc<dyn EventBus<OutboundEvent>>>> {
    use stockflow_infra::event_bus::RedisPubSubEventBus;

    match &config.redis_url {
        Some(url) => {
            let bus: Arc<dyn EventBus<OutboundEvent>> = Arc::new(RedisPubSubEventBus::new(url, EVENTS_CHANNEL)?);
            info!(channel = EVENTS_CHANNEL, "publishing outbound events to redis");
            Ok(Some(bus))
        }
        None => Ok(None),
    }
}

#[cfg(not(feature = "redis"))]
fn outbound_publisher(config: &EngineConfig) -> anyhow::Result<Option<Arc<dyn EventBus<OutboundEvent>>>> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but this build has no redis support");
    }
    Ok(None)
}

/// Read JSON commands line by line until EOF.
///
/// Triggers go to `inbox`; actions are dispatched directly. Bad lines are
/// logged and skipped.
pub async fn forward_commands<R>(reader: R, operations: Arc<StateManager>, inbox: Arc<InMemoryTriggerFeed>)
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "failed to read command");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<Command>(&line) {
            Ok(Command::Trigger(trigger)) => {
                let token = inbox.submit(trigger);
                debug!(%token, "trigger queued");
            }
            Ok(Command::Dispatch { action }) => match operations.dispatch(&action).await {
                Ok(out) => info!(sequence = out.sequence, action = %action.action_type(), "dispatched"),
                Err(err) => warn!(action = %action.action_type(), error = %err, "dispatch rejected"),
            },
            Err(err) => warn!(error = %err, "unrecognised command"),
        }
    }
}
