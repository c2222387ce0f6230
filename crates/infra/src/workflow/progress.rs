use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use stockflow_events::{EventRecord, ProcessingState, ProcessorInfo};

use crate::event_log::{EventLogError, ReplayTarget};

#[derive(Debug, Default)]
struct Progress {
    state: ProcessingState,
    /// Sequence of the last record folded in.
    position: u64,
}

/// Shared checkpoint map of one workflow processor.
///
/// Mutated only in the same critical section as the record carrying the
/// checkpoint (live), or by replay.
#[derive(Debug, Clone)]
pub struct ProcessingHandle {
    name: String,
    inner: Arc<Mutex<Progress>>,
}

impl ProcessingHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Arc::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self, doc_id: &str) -> Option<ProcessorInfo> {
        self.inner.lock().await.state.get(doc_id).cloned()
    }

    /// Copy of the whole checkpoint map.
    pub async fn snapshot(&self) -> ProcessingState {
        self.inner.lock().await.state.clone()
    }

    pub async fn position(&self) -> u64 {
        self.inner.lock().await.position
    }

    /// Replace the map with one captured at `position`.
    pub async fn restore(&self, state: ProcessingState, position: u64) {
        let mut progress = self.inner.lock().await;
        progress.state = state;
        progress.position = position;
    }

    pub(crate) async fn commit(&self, sequence: u64, info: ProcessorInfo) {
        let mut progress = self.inner.lock().await;
        progress.state.record(info);
        progress.position = progress.position.max(sequence);
    }
}

#[async_trait]
impl ReplayTarget for ProcessingHandle {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply_record(&self, record: &EventRecord) -> Result<(), EventLogError> {
        let mut progress = self.inner.lock().await;
        if record.sequence <= progress.position {
            return Ok(());
        }
        if let Some(info) = record.processor_for(&self.name) {
            debug!(processor = %self.name, sequence = record.sequence, doc_id = %info.trigger_doc_id, "replaying checkpoint");
            progress.state.record(info.clone());
        }
        progress.position = record.sequence;
        Ok(())
    }
}
