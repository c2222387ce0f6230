//! Durable multi-step workflow driver.
//!
//! A workflow is an ordered list of [`Step`]s run per triggering document.
//! The driver is a loop over a step index, never a chain of callbacks: at
//! every step boundary it commits one record holding the previous step's
//! action (through the target state manager) and the checkpoint for the
//! next index. A parked workflow is therefore plain data in the checkpoint
//! map and resumes after a restart from the log alone.
//!
//! ```text
//! boundary(i):  commit { action_{i-1}, procMap[doc] = {functionIndex: i, options} }
//!               i == N          -> complete (entry removed)
//!               options parked  -> stop
//!               otherwise       -> run step[i] -> boundary(i + 1)
//! ```

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use stockflow_events::{Action, ProcessingState, ProcessorInfo, SliceInfos, StepOptions, WakeCondition};

use super::context::{SharedContext, StepContext};
use super::progress::ProcessingHandle;
use super::step::{DocumentSource, Step, StepOutcome, Trigger, TriggerSource, WakeCheck, inline_doc_id};
use crate::event_log::EventLogConnection;
use crate::state_manager::{DispatchError, Participant, ProcessorCheckpoint, StateManager, commit_cycle};

const DEFAULT_RETRY_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("no document source configured to resolve '{0}'")]
    NoDocumentSource(String),

    #[error("document '{0}' not found")]
    UnknownDocument(String),

    #[error("trigger document has no usable id")]
    MissingDocId,

    #[error("document source failed for '{doc_id}': {source}")]
    Source {
        doc_id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Another run for the same document is in progress.
    #[error("workflow for '{0}' is already running")]
    AlreadyRunning(String),

    #[error("restart index {index} is past the last step ({steps} steps)")]
    IndexOutOfRange { index: usize, steps: usize },

    #[error("workflow '{processor}' and its target manager use different connections")]
    ForeignConnection { processor: String },

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// How one run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Waiting on a park condition at `function_index`.
    Parked { function_index: usize },
    /// A step failed; the checkpoint stays at `function_index`.
    Failed { function_index: usize, message: String },
    /// The trigger did not start anything (workflow already parked).
    Skipped,
}

/// What a restart sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestartReport {
    /// Entries whose park condition held (or, at boot, had none).
    pub resumed: usize,
    /// Entries whose retry period elapsed and re-ran their step.
    pub retried: usize,
    /// Runs that ended in a failed step or dispatch error.
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    Stay,
    Resume(usize),
    Retry(usize),
}

/// Removes a doc id from the running set on drop.
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    doc_id: String,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.doc_id);
    }
}

pub struct WorkflowProcessor {
    name: String,
    target: Arc<StateManager>,
    processing: ProcessingHandle,
    steps: Vec<Arc<dyn Step>>,
    shared: Arc<SharedContext>,
    documents: Option<Arc<dyn DocumentSource>>,
    retry_poll: Duration,
    running: Mutex<HashSet<String>>,
}

impl core::fmt::Debug for WorkflowProcessor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("WorkflowProcessor")
            .field("name", &self.name)
            .field("target", &self.target.name())
            .field("steps", &self.steps.len())
            .finish_non_exhaustive()
    }
}

impl WorkflowProcessor {
    /// `target` receives every action a step produces, in the same record as
    /// the checkpoint.
    pub fn new(
        name: impl Into<String>,
        target: Arc<StateManager>,
        shared: SharedContext,
    ) -> Result<Self, WorkflowError> {
        let name = name.into();
        if !Arc::ptr_eq(target.connection(), shared.connection()) {
            return Err(WorkflowError::ForeignConnection { processor: name });
        }
        Ok(Self {
            processing: ProcessingHandle::new(name.clone()),
            name,
            target,
            steps: Vec::new(),
            shared: Arc::new(shared),
            documents: None,
            retry_poll: DEFAULT_RETRY_POLL,
            running: Mutex::new(HashSet::new()),
        })
    }

    /// Append a step.
    pub fn use_step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    pub fn with_documents(mut self, documents: Arc<dyn DocumentSource>) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Period between re-runs of a step parked with `retry_until`.
    pub fn with_retry_poll(mut self, poll: Duration) -> Self {
        self.retry_poll = poll;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn processing(&self) -> &ProcessingHandle {
        &self.processing
    }

    pub fn connection(&self) -> &Arc<EventLogConnection> {
        self.target.connection()
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Start (or continue) the workflow for a trigger.
    ///
    /// A document with a parked entry is left alone; one whose entry has no
    /// park condition (a failed or interrupted run) continues at its saved
    /// index with its saved trigger.
    pub async fn handle(&self, trigger: Trigger) -> Result<RunOutcome, WorkflowError> {
        let (doc_id, doc) = self.resolve(&trigger.trigger).await?;

        if let Some(existing) = self.processing.get(&doc_id).await {
            if existing.options.is_parked() {
                debug!(processor = %self.name, %doc_id, "trigger ignored; workflow is parked");
                return Ok(RunOutcome::Skipped);
            }
            let payload = existing.trigger_full.unwrap_or(doc);
            return self
                .handler(doc_id, payload, existing.function_index, trigger.continuation)
                .await;
        }

        self.handler(doc_id, doc, 0, trigger.continuation).await
    }

    async fn resolve(&self, source: &TriggerSource) -> Result<(String, JsonValue), WorkflowError> {
        match source {
            TriggerSource::Doc { doc } => {
                let doc_id = inline_doc_id(doc).ok_or(WorkflowError::MissingDocId)?;
                Ok((doc_id, doc.clone()))
            }
            TriggerSource::DocId { doc_id } => {
                let documents = self
                    .documents
                    .as_ref()
                    .ok_or_else(|| WorkflowError::NoDocumentSource(doc_id.clone()))?;
                let doc = documents
                    .fetch(doc_id)
                    .await
                    .map_err(|source| WorkflowError::Source {
                        doc_id: doc_id.clone(),
                        source,
                    })?
                    .ok_or_else(|| WorkflowError::UnknownDocument(doc_id.clone()))?;
                Ok((doc_id.clone(), doc))
            }
        }
    }

    fn claim(&self, doc_id: &str) -> Result<RunningGuard<'_>, WorkflowError> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if !running.insert(doc_id.to_string()) {
            return Err(WorkflowError::AlreadyRunning(doc_id.to_string()));
        }
        Ok(RunningGuard {
            running: &self.running,
            doc_id: doc_id.to_string(),
        })
    }

    fn is_running(&self, doc_id: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(doc_id)
    }

    /// Run the workflow for `doc_id` starting at `restart_index`.
    ///
    /// Steps before `restart_index` are not executed again.
    pub async fn handler(
        &self,
        doc_id: String,
        trigger: JsonValue,
        restart_index: usize,
        continuation: Option<String>,
    ) -> Result<RunOutcome, WorkflowError> {
        if restart_index > self.steps.len() {
            return Err(WorkflowError::IndexOutOfRange {
                index: restart_index,
                steps: self.steps.len(),
            });
        }
        let _running = self.claim(&doc_id)?;

        let mut save_trigger = self.processing.get(&doc_id).await.is_none();
        let mut continuation = continuation;
        let mut ctx = StepContext::new(Arc::clone(&self.shared), doc_id.clone(), trigger.clone());
        let mut index = restart_index;
        let mut action: Option<Action> = None;
        let mut options = StepOptions::default();

        info!(processor = %self.name, %doc_id, step = index, "workflow run started");

        loop {
            let complete = index >= self.steps.len();
            let checkpoint = ProcessorInfo {
                trigger_doc_id: doc_id.clone(),
                function_index: index,
                trigger_full: save_trigger.then(|| trigger.clone()),
                complete,
                options: options.clone(),
                continuation: continuation.take(),
            };
            save_trigger = false;

            let info = self.commit_boundary(action.take(), checkpoint).await?;
            ctx.set_last_info(info);

            if complete {
                info!(processor = %self.name, %doc_id, "workflow complete");
                return Ok(RunOutcome::Completed);
            }
            if options.is_parked() {
                info!(processor = %self.name, %doc_id, step = index, "workflow parked");
                return Ok(RunOutcome::Parked { function_index: index });
            }

            ctx.set_function_index(index);
            match self.steps[index].run(&mut ctx).await {
                Ok(StepOutcome::Next {
                    action: next_action,
                    options: next_options,
                    label,
                }) => {
                    action = next_action;
                    options = next_options;
                    if label.is_some() {
                        options.label = label;
                    }
                    index += 1;
                }
                Ok(StepOutcome::Retry { until }) => {
                    debug!(processor = %self.name, %doc_id, step = index, "step asked to retry");
                    action = None;
                    options = StepOptions {
                        retry_until: Some(until),
                        retry_at: Some(Utc::now() + self.retry_period()),
                        ..StepOptions::default()
                    };
                }
                Ok(StepOutcome::Finish { action: last }) => {
                    action = last;
                    options = StepOptions::default();
                    index = self.steps.len();
                }
                Err(err) => {
                    error!(processor = %self.name, %doc_id, step = index, error = %format!("{err:#}"), "workflow step failed");
                    return Ok(RunOutcome::Failed {
                        function_index: index,
                        message: format!("{err:#}"),
                    });
                }
            }
        }
    }

    fn retry_period(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.retry_poll).unwrap_or_else(|_| chrono::Duration::seconds(5))
    }

    async fn commit_boundary(
        &self,
        action: Option<Action>,
        info: ProcessorInfo,
    ) -> Result<Option<SliceInfos>, WorkflowError> {
        let dispatched = action.is_some();
        // The target always takes part so the record bumps `_control`.
        let action = action.unwrap_or_else(Action::checkpoint);
        let participants = [Participant {
            manager: &self.target,
            action: &action,
        }];
        let checkpoint = ProcessorCheckpoint {
            processing: &self.processing,
            info,
        };
        let out = commit_cycle(self.connection(), &participants, Some(checkpoint)).await?;
        Ok(out.infos.into_iter().next().filter(|_| dispatched))
    }

    /// Resume every pending entry whose park condition now holds.
    ///
    /// With `seed` (boot), entries come from the rehydrated map and in-flight
    /// entries without a park condition are resumed too. Without it, the live
    /// map is swept and only wake conditions count.
    pub async fn restart_processors(&self, check: &dyn WakeCheck, seed: Option<ProcessingState>) -> RestartReport {
        let booting = seed.is_some();
        let state = match seed {
            Some(seed) => seed,
            None => self.processing.snapshot().await,
        };

        let mut report = RestartReport::default();
        for entry in state.pending() {
            let wake = self.wake_for(entry, check, booting).await;
            let index = match wake {
                Wake::Stay => continue,
                Wake::Resume(index) | Wake::Retry(index) => index,
            };
            if self.is_running(&entry.trigger_doc_id) {
                continue;
            }
            let Some(trigger) = entry.trigger_full.clone() else {
                warn!(processor = %self.name, doc_id = %entry.trigger_doc_id, "no saved trigger; cannot resume");
                report.failed += 1;
                continue;
            };

            info!(processor = %self.name, doc_id = %entry.trigger_doc_id, step = index, ?wake, "resuming workflow");
            match self.handler(entry.trigger_doc_id.clone(), trigger, index, None).await {
                Ok(RunOutcome::Failed { .. }) => report.failed += 1,
                Ok(_) => match wake {
                    Wake::Retry(_) => report.retried += 1,
                    _ => report.resumed += 1,
                },
                Err(WorkflowError::AlreadyRunning(_)) => {}
                Err(err) => {
                    warn!(processor = %self.name, doc_id = %entry.trigger_doc_id, error = %err, "resume failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    async fn wake_for(&self, entry: &ProcessorInfo, check: &dyn WakeCheck, booting: bool) -> Wake {
        let options = &entry.options;
        if let Some(condition) = &options.sleep_until {
            return if self.holds(condition, entry, check).await {
                Wake::Resume(entry.function_index)
            } else {
                Wake::Stay
            };
        }
        if let Some(condition) = &options.retry_until {
            if self.holds(condition, entry, check).await {
                return Wake::Resume(entry.function_index + 1);
            }
            let due = options.retry_at.is_none_or(|at| at <= Utc::now());
            return if due {
                Wake::Retry(entry.function_index)
            } else {
                Wake::Stay
            };
        }
        if booting {
            Wake::Resume(entry.function_index)
        } else {
            Wake::Stay
        }
    }

    async fn holds(&self, condition: &WakeCondition, entry: &ProcessorInfo, check: &dyn WakeCheck) -> bool {
        if condition.time_elapsed(Utc::now()) {
            return true;
        }
        let Some(stage) = &condition.stage else {
            return false;
        };
        let doc_id = condition.doc_id.as_deref().unwrap_or(&entry.trigger_doc_id);
        match check.stage_reached(doc_id, stage).await {
            Ok(reached) => reached,
            Err(err) => {
                warn!(processor = %self.name, %doc_id, %stage, error = %format!("{err:#}"), "wake check failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{AttachOptions, EventLog, InMemoryEventLog, ReplayTarget};
    use crate::state_store::{StateStore, StoreHandle};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use stockflow_core::{CHANGE_COUNT, CONTROL_SLICE, LOG_SEQUENCE, PathSchema, SchemaDefinition, SliceState, StateUpdate, TenantId};
    use stockflow_events::{Reducer, Reduction, combine_reducers};

    /// Counts runs and returns a fixed outcome.
    struct Counting {
        runs: Arc<AtomicUsize>,
        outcome: StepOutcome,
    }

    #[async_trait]
    impl Step for Counting {
        async fn run(&self, _ctx: &mut StepContext) -> anyhow::Result<StepOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome.clone())
        }
    }

    /// Records the trigger it saw.
    struct Capture(Arc<Mutex<Option<JsonValue>>>);

    #[async_trait]
    impl Step for Capture {
        async fn run(&self, ctx: &mut StepContext) -> anyhow::Result<StepOutcome> {
            *self.0.lock().unwrap() = Some(ctx.trigger().clone());
            Ok(StepOutcome::act(Action::new("HIT")))
        }
    }

    struct Failing;

    #[async_trait]
    impl Step for Failing {
        async fn run(&self, _ctx: &mut StepContext) -> anyhow::Result<StepOutcome> {
            anyhow::bail!("boom")
        }
    }

    struct Flag(AtomicBool);

    #[async_trait]
    impl WakeCheck for Flag {
        async fn stage_reached(&self, _doc_id: &str, _stage: &str) -> anyhow::Result<bool> {
            Ok(self.0.load(Ordering::SeqCst))
        }
    }

    fn hits_reducer() -> Arc<dyn Reducer> {
        Arc::new(|_: &SliceState, action: &Action| {
            if action.is("HIT") {
                Reduction::update(StateUpdate::inc("hits"))
            } else {
                Reduction::none()
            }
        })
    }

    fn main_manager(connection: &Arc<EventLogConnection>) -> Arc<StateManager> {
        let schema = Arc::new(
            SchemaDefinition::builder()
                .path("stats", "hits", PathSchema::counter())
                .build()
                .unwrap(),
        );
        let store = StoreHandle::new(StateStore::in_memory("main", schema));
        let reducer = combine_reducers(vec![("stats".into(), hits_reducer())], vec![]).unwrap();
        Arc::new(StateManager::new("main", Arc::clone(connection), store, reducer).unwrap())
    }

    async fn attach(log: &Arc<InMemoryEventLog>) -> Arc<EventLogConnection> {
        Arc::new(EventLogConnection::attach(log.clone(), AttachOptions::default()).await.unwrap())
    }

    async fn setup() -> (Arc<InMemoryEventLog>, Arc<EventLogConnection>, Arc<StateManager>) {
        let log = Arc::new(InMemoryEventLog::with_tenant(TenantId::new()));
        let connection = attach(&log).await;
        let manager = main_manager(&connection);
        (log, connection, manager)
    }

    fn counting(runs: &Arc<AtomicUsize>, outcome: StepOutcome) -> Counting {
        Counting {
            runs: Arc::clone(runs),
            outcome,
        }
    }

    #[tokio::test]
    async fn straight_run_commits_one_record_per_boundary() {
        let (log, connection, manager) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let processor = WorkflowProcessor::new("flow", Arc::clone(&manager), SharedContext::new(Arc::clone(&connection)))
            .unwrap()
            .use_step(counting(&runs, StepOutcome::act(Action::new("HIT"))))
            .use_step(counting(&runs, StepOutcome::act(Action::new("HIT"))));

        let out = processor.handle(Trigger::inline(json!({"id": "d-1"}))).await.unwrap();
        assert_eq!(out, RunOutcome::Completed);
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        let records = log.load_after(connection.tenant(), 0).await.unwrap();
        assert_eq!(records.len(), 3);
        let opening = records[0].changes_for("main").unwrap();
        assert_eq!(opening.slices().collect::<Vec<_>>(), vec![CONTROL_SLICE]);
        assert_eq!(records[0].processor_for("flow").unwrap().trigger_full, Some(json!({"id": "d-1"})));
        assert!(records[2].processor_for("flow").unwrap().complete);
        assert!(processor.processing().snapshot().await.is_empty());
        assert_eq!(manager.get_value("stats", "hits", None).await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn checkpoint_only_records_still_count_as_changes() {
        let (log, connection, manager) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let processor = WorkflowProcessor::new("flow", Arc::clone(&manager), SharedContext::new(Arc::clone(&connection)))
            .unwrap()
            .use_step(counting(&runs, StepOutcome::next()))
            .use_step(counting(&runs, StepOutcome::next()));

        let out = processor.handle(Trigger::inline(json!({"id": "quiet"}))).await.unwrap();
        assert_eq!(out, RunOutcome::Completed);

        let records = log.load_after(connection.tenant(), 0).await.unwrap();
        assert_eq!(records.len(), 3);
        for record in &records {
            let changes = record.changes_for("main").unwrap();
            assert_eq!(changes.get(CONTROL_SLICE).unwrap().len(), 1);
            assert!(changes.get("stats").is_none());
        }
        assert_eq!(manager.get_value(CONTROL_SLICE, CHANGE_COUNT, None).await.unwrap(), Some(json!(3)));
        assert_eq!(manager.get_value(CONTROL_SLICE, LOG_SEQUENCE, None).await.unwrap(), Some(json!(3)));
        assert_eq!(manager.get_value("stats", "hits", None).await.unwrap(), Some(json!(0)));
    }

    #[tokio::test]
    async fn restart_resumes_at_the_saved_index_with_the_saved_trigger() {
        let (log, connection, manager) = setup().await;
        let before = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(None));
        let past = WakeCondition::at(Utc::now() - chrono::Duration::seconds(1));

        // First process: parks at index 2 with an already elapsed time condition.
        {
            let processor = WorkflowProcessor::new("flow", Arc::clone(&manager), SharedContext::new(Arc::clone(&connection)))
                .unwrap()
                .use_step(counting(&before, StepOutcome::next()))
                .use_step(counting(&before, StepOutcome::sleep_until(None, past.clone())))
                .use_step(Capture(Arc::clone(&seen)));
            let out = processor.handle(Trigger::inline(json!({"id": "d-1", "qty": 4}))).await.unwrap();
            assert_eq!(out, RunOutcome::Parked { function_index: 2 });
        }
        assert_eq!(before.load(Ordering::SeqCst), 2);

        // Second process: rehydrate from the log, then restart.
        let connection2 = attach(&log).await;
        let manager2 = main_manager(&connection2);
        let after = Arc::new(AtomicUsize::new(0));
        let processor = WorkflowProcessor::new("flow", Arc::clone(&manager2), SharedContext::new(Arc::clone(&connection2)))
            .unwrap()
            .use_step(counting(&after, StepOutcome::next()))
            .use_step(counting(&after, StepOutcome::sleep_until(None, past)))
            .use_step(Capture(Arc::clone(&seen)));

        connection2
            .roll_forward_state(&[manager2.store() as &dyn ReplayTarget, processor.processing()], |_| {})
            .await
            .unwrap();
        let seed = processor.processing().snapshot().await;
        assert_eq!(seed.get("d-1").unwrap().function_index, 2);

        let check = Flag(AtomicBool::new(false));
        let report = processor.restart_processors(&check, Some(seed)).await;
        assert_eq!(report.resumed, 1);
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(*seen.lock().unwrap(), Some(json!({"id": "d-1", "qty": 4})));
        assert!(processor.processing().snapshot().await.is_empty());
        assert_eq!(manager2.get_value("stats", "hits", None).await.unwrap(), Some(json!(1)));
    }

    #[tokio::test]
    async fn stage_parked_workflow_waits_for_the_check() {
        let (_log, connection, manager) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let processor = WorkflowProcessor::new("flow", manager, SharedContext::new(connection))
            .unwrap()
            .use_step(counting(&runs, StepOutcome::sleep_until(None, WakeCondition::stage("done"))))
            .use_step(counting(&runs, StepOutcome::next()));

        processor.handle(Trigger::inline(json!({"id": 1}))).await.unwrap();
        let check = Flag(AtomicBool::new(false));

        assert_eq!(processor.restart_processors(&check, None).await, RestartReport::default());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        // Re-triggering a parked doc does nothing.
        let again = processor.handle(Trigger::inline(json!({"id": 1}))).await.unwrap();
        assert_eq!(again, RunOutcome::Skipped);

        check.0.store(true, Ordering::SeqCst);
        let report = processor.restart_processors(&check, None).await;
        assert_eq!(report.resumed, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(processor.processing().get("1").await.is_none());
    }

    #[tokio::test]
    async fn retry_reruns_the_same_step_until_the_condition_holds() {
        let (_log, connection, manager) = setup().await;
        let retrying = Arc::new(AtomicUsize::new(0));
        let after = Arc::new(AtomicUsize::new(0));
        let processor = WorkflowProcessor::new("flow", manager, SharedContext::new(connection))
            .unwrap()
            .with_retry_poll(Duration::ZERO)
            .use_step(counting(&retrying, StepOutcome::retry_until(WakeCondition::stage("ready"))))
            .use_step(counting(&after, StepOutcome::next()));

        let out = processor.handle(Trigger::inline(json!({"id": "r"}))).await.unwrap();
        assert_eq!(out, RunOutcome::Parked { function_index: 0 });

        let check = Flag(AtomicBool::new(false));
        let report = processor.restart_processors(&check, None).await;
        assert_eq!(report.retried, 1);
        assert_eq!(retrying.load(Ordering::SeqCst), 2);
        assert_eq!(after.load(Ordering::SeqCst), 0);

        check.0.store(true, Ordering::SeqCst);
        let report = processor.restart_processors(&check, None).await;
        assert_eq!(report.resumed, 1);
        assert_eq!(retrying.load(Ordering::SeqCst), 2);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert!(processor.processing().snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn failed_step_stays_at_its_checkpoint() {
        let (_log, connection, manager) = setup().await;
        let runs = Arc::new(AtomicUsize::new(0));
        let processor = WorkflowProcessor::new("flow", manager, SharedContext::new(connection))
            .unwrap()
            .use_step(counting(&runs, StepOutcome::next()))
            .use_step(Failing);

        let out = processor.handle(Trigger::inline(json!({"id": "f"}))).await.unwrap();
        assert!(matches!(out, RunOutcome::Failed { function_index: 1, .. }));
        assert_eq!(processor.processing().get("f").await.unwrap().function_index, 1);

        // Sweeps leave it alone; only a boot seed or a re-trigger resumes it.
        let check = Flag(AtomicBool::new(false));
        assert_eq!(processor.restart_processors(&check, None).await, RestartReport::default());
        let seed = processor.processing().snapshot().await;
        assert_eq!(processor.restart_processors(&check, Some(seed)).await.failed, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_running_document_is_not_started_twice() {
        let (_log, connection, manager) = setup().await;
        let processor = WorkflowProcessor::new("flow", manager, SharedContext::new(connection)).unwrap();

        let _held = processor.claim("busy").unwrap();
        let err = processor
            .handler("busy".into(), json!({"id": "busy"}), 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::AlreadyRunning(_)));
    }

    #[tokio::test]
    async fn doc_id_triggers_need_a_source() {
        let (_log, connection, manager) = setup().await;
        let processor = WorkflowProcessor::new("flow", manager, SharedContext::new(connection)).unwrap();
        assert!(matches!(
            processor.handle(Trigger::doc_id("x")).await,
            Err(WorkflowError::NoDocumentSource(_))
        ));
        assert!(matches!(
            processor.handle(Trigger::inline(json!({"name": "no id"}))).await,
            Err(WorkflowError::MissingDocId)
        ));
    }
}
