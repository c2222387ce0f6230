//! Observable outcomes of a dispatch.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Outcome of applying one slice's updates to the store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApplyInfo {
    /// Document produced by the last ADD.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<JsonValue>,
    /// Document produced by the last UPDATE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<JsonValue>,
    /// Counter value after the last INC.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inc: Option<i64>,
}

impl ApplyInfo {
    pub fn is_empty(&self) -> bool {
        self.added.is_none() && self.merged.is_none() && self.inc.is_none()
    }
}

/// Outcome of one reducer invocation, later merged with [`ApplyInfo`].
///
/// A business-rule failure is reported here (`failed = true` plus a message)
/// rather than as an error, so the failed attempt is still recorded.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReducerInfo {
    #[serde(default)]
    pub failed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub added: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inc: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ReducerInfo {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            failed: true,
            message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Fold applied-state outcomes in. Applied values win over reducer guesses.
    pub fn absorb(&mut self, apply: &ApplyInfo) {
        if apply.added.is_some() {
            self.added = apply.added.clone();
        }
        if apply.merged.is_some() {
            self.merged = apply.merged.clone();
        }
        if apply.inc.is_some() {
            self.inc = apply.inc;
        }
    }

    /// Combine two reducer outcomes for the same slice (pass-in + ordinary).
    pub fn merge(&mut self, other: ReducerInfo) {
        self.failed |= other.failed;
        if other.added.is_some() {
            self.added = other.added;
        }
        if other.merged.is_some() {
            self.merged = other.merged;
        }
        if other.inc.is_some() {
            self.inc = other.inc;
        }
        if self.message.is_none() {
            self.message = other.message;
        }
    }
}

/// Per-slice reducer outcomes of one dispatch.
pub type SliceInfos = BTreeMap<String, ReducerInfo>;

/// Merge per-slice apply outcomes into reducer outcomes.
pub fn absorb_apply(infos: &mut SliceInfos, applied: &BTreeMap<String, ApplyInfo>) {
    for (slice, apply) in applied {
        if apply.is_empty() && !infos.contains_key(slice) {
            continue;
        }
        infos.entry(slice.clone()).or_default().absorb(apply);
    }
}
