use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockflow_events::{Action, StepOptions, WakeCondition};

use super::context::StepContext;

/// What a step asks the driver to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Commit `action` (if any) with the checkpoint for the following step.
    /// With a park condition in `options`, stop there.
    Next {
        action: Option<Action>,
        options: StepOptions,
        label: Option<String>,
    },
    /// Park on this step; run it again every retry period until `until` holds,
    /// then continue with the following step.
    Retry { until: WakeCondition },
    /// Commit `action` (if any) and complete the workflow.
    Finish { action: Option<Action> },
}

impl StepOutcome {
    pub fn next() -> Self {
        Self::Next {
            action: None,
            options: StepOptions::default(),
            label: None,
        }
    }

    pub fn act(action: Action) -> Self {
        Self::Next {
            action: Some(action),
            options: StepOptions::default(),
            label: None,
        }
    }

    /// Commit `action` and park the following step until `condition` holds.
    pub fn sleep_until(action: Option<Action>, condition: WakeCondition) -> Self {
        Self::Next {
            action,
            options: StepOptions::sleep_until(condition),
            label: None,
        }
    }

    pub fn retry_until(until: WakeCondition) -> Self {
        Self::Retry { until }
    }

    pub fn finish(action: Option<Action>) -> Self {
        Self::Finish { action }
    }

    /// Label the transition; ignored for `Retry` and `Finish`.
    pub fn labelled(mut self, text: impl Into<String>) -> Self {
        if let Self::Next { label, .. } = &mut self {
            *label = Some(text.into());
        }
        self
    }
}

/// One middleware step of a workflow.
///
/// Must be safe to re-run from its recorded checkpoint.
#[async_trait]
pub trait Step: Send + Sync {
    async fn run(&self, ctx: &mut StepContext) -> anyhow::Result<StepOutcome>;
}

/// Decides stage-based wake conditions.
#[async_trait]
pub trait WakeCheck: Send + Sync {
    /// Has `doc_id` reached `stage`?
    async fn stage_reached(&self, doc_id: &str, stage: &str) -> anyhow::Result<bool>;
}

/// Resolves `{docId}` triggers to full documents.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch(&self, doc_id: &str) -> anyhow::Result<Option<JsonValue>>;
}

/// A request to run the workflow for one document.
///
/// Wire shape: `{"trigger": {"docId": "..."} | {"doc": {...}}, "continuation"?: "..."}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub trigger: TriggerSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub continuation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TriggerSource {
    DocId {
        #[serde(rename = "docId")]
        doc_id: String,
    },
    Doc {
        doc: JsonValue,
    },
}

impl Trigger {
    pub fn doc_id(doc_id: impl Into<String>) -> Self {
        Self {
            trigger: TriggerSource::DocId { doc_id: doc_id.into() },
            continuation: None,
        }
    }

    pub fn inline(doc: JsonValue) -> Self {
        Self {
            trigger: TriggerSource::Doc { doc },
            continuation: None,
        }
    }

    pub fn with_continuation(mut self, token: impl Into<String>) -> Self {
        self.continuation = Some(token.into());
        self
    }
}

/// Id of an inline trigger document: its `id` field, string or number.
pub fn inline_doc_id(doc: &JsonValue) -> Option<String> {
    match doc.get("id")? {
        JsonValue::String(s) if !s.is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Document source backed by a map. Intended for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryDocuments {
    docs: RwLock<HashMap<String, JsonValue>>,
}

impl InMemoryDocuments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc_id: impl Into<String>, doc: JsonValue) {
        if let Ok(mut docs) = self.docs.write() {
            docs.insert(doc_id.into(), doc);
        }
    }
}

#[async_trait]
impl DocumentSource for InMemoryDocuments {
    async fn fetch(&self, doc_id: &str) -> anyhow::Result<Option<JsonValue>> {
        let docs = self
            .docs
            .read()
            .map_err(|_| anyhow::anyhow!("document map lock poisoned"))?;
        Ok(docs.get(doc_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn trigger_wire_shapes() {
        let by_id: Trigger = serde_json::from_value(json!({"trigger": {"docId": "o-1"}, "continuation": "t-9"})).unwrap();
        assert_eq!(by_id, Trigger::doc_id("o-1").with_continuation("t-9"));

        let inline: Trigger = serde_json::from_value(json!({"trigger": {"doc": {"id": 7, "qty": 2}}})).unwrap();
        match &inline.trigger {
            TriggerSource::Doc { doc } => assert_eq!(inline_doc_id(doc).as_deref(), Some("7")),
            other => panic!("unexpected source {other:?}"),
        }

        assert_eq!(
            serde_json::to_value(Trigger::doc_id("o-2")).unwrap(),
            json!({"trigger": {"docId": "o-2"}})
        );
    }

    #[test]
    fn inline_doc_id_requires_a_usable_id() {
        assert_eq!(inline_doc_id(&json!({"id": "r-1"})).as_deref(), Some("r-1"));
        assert_eq!(inline_doc_id(&json!({"id": ""})), None);
        assert_eq!(inline_doc_id(&json!({"id": null})), None);
        assert_eq!(inline_doc_id(&json!({"name": "x"})), None);
    }

    #[test]
    fn labels_only_apply_to_next() {
        let next = StepOutcome::next().labelled("created");
        assert!(matches!(next, StepOutcome::Next { label: Some(ref l), .. } if l == "created"));
        assert_eq!(StepOutcome::finish(None).labelled("x"), StepOutcome::finish(None));
    }
}
