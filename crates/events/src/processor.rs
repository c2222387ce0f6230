//! Workflow progress records (mechanics only, no business rules).
//!
//! - One [`ProcessorInfo`] per triggering document
//! - Created on the first step, replaced on every step, removed on completion
//! - Persisted inside the same event record as the business change it accompanies
//! - A parked workflow is plain data: step index + saved trigger + wake condition
//!
//! Infra is responsible for running steps and for deciding when a park
//! condition holds; this module only defines the shapes and the bookkeeping.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Condition under which a parked workflow may continue.
///
/// Either a point in time, or a target stage that a document (by default the
/// triggering document) must reach in some other slice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WakeCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
}

impl WakeCondition {
    pub fn at(time: DateTime<Utc>) -> Self {
        Self {
            time: Some(time),
            ..Self::default()
        }
    }

    /// Wait until the triggering document reaches `stage`.
    pub fn stage(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            ..Self::default()
        }
    }

    /// Wait until `doc_id` reaches `stage`.
    pub fn stage_of(doc_id: impl Into<String>, stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            doc_id: Some(doc_id.into()),
            ..Self::default()
        }
    }

    /// True once a time condition has elapsed. Stage-only conditions return false.
    pub fn time_elapsed(&self, now: DateTime<Utc>) -> bool {
        matches!(self.time, Some(t) if t <= now)
    }
}

/// Options attached to a step boundary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sleep_until: Option<WakeCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_until: Option<WakeCondition>,
    /// Earliest time the next retry may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// Label of the event that moved the workflow here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl StepOptions {
    pub fn sleep_until(condition: WakeCondition) -> Self {
        Self {
            sleep_until: Some(condition),
            ..Self::default()
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn is_parked(&self) -> bool {
        self.sleep_until.is_some() || self.retry_until.is_some()
    }
}

/// Progress of one workflow, keyed by its triggering document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorInfo {
    pub trigger_doc_id: String,
    /// Index of the step that runs next (or is running).
    pub function_index: usize,
    /// Full trigger payload; only written on the first step of a workflow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_full: Option<JsonValue>,
    pub complete: bool,
    #[serde(default)]
    pub options: StepOptions,
    /// Change-feed continuation token of the trigger that started this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

/// Checkpoint map of one workflow processor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingState {
    #[serde(default)]
    pub last_trigger: Option<String>,
    #[serde(default)]
    pub proc_map: BTreeMap<String, ProcessorInfo>,
}

impl ProcessingState {
    pub fn get(&self, doc_id: &str) -> Option<&ProcessorInfo> {
        self.proc_map.get(doc_id)
    }

    /// Saved trigger payload for `doc_id`, if any.
    pub fn trigger(&self, doc_id: &str) -> Option<&JsonValue> {
        self.proc_map.get(doc_id)?.trigger_full.as_ref()
    }

    /// Record a step boundary.
    ///
    /// Completed workflows leave the map; otherwise the entry is replaced,
    /// inheriting the saved trigger when the new record does not repeat it.
    pub fn record(&mut self, info: ProcessorInfo) {
        if let Some(token) = &info.continuation {
            self.last_trigger = Some(token.clone());
        }

        if info.complete {
            self.proc_map.remove(&info.trigger_doc_id);
            return;
        }

        let mut info = info;
        if info.trigger_full.is_none() {
            info.trigger_full = self
                .proc_map
                .get(&info.trigger_doc_id)
                .and_then(|prev| prev.trigger_full.clone());
        }
        self.proc_map.insert(info.trigger_doc_id.clone(), info);
    }

    /// Entries still in progress, in document-id order.
    pub fn pending(&self) -> impl Iterator<Item = &ProcessorInfo> {
        self.proc_map.values().filter(|i| !i.complete)
    }

    pub fn len(&self) -> usize {
        self.proc_map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proc_map.is_empty()
    }
}
