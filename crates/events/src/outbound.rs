//! Events emitted to consumers outside the engine.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use stockflow_core::{StateChanges, TenantId};

/// Identifies one snapshot artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMetadata {
    pub tenant: TenantId,
    pub event_seq: u64,
    /// `<timestamp>-<sequence>`.
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl SnapshotMetadata {
    pub fn new(tenant: TenantId, event_seq: u64, created_at: DateTime<Utc>) -> Self {
        Self {
            tenant,
            event_seq,
            name: format!("{}-{}", created_at.format("%Y%m%dT%H%M%S%.3fZ"), event_seq),
            created_at,
        }
    }
}

/// Message published after a successful commit or snapshot.
///
/// Wire shape: `{"type": "events", ...}` or `{"type": "snapshot", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundEvent {
    Events {
        tenant: TenantId,
        sequence: u64,
        /// Changes per state manager name.
        statechanges: BTreeMap<String, StateChanges>,
    },
    Snapshot {
        metadata: SnapshotMetadata,
        snapshot: JsonValue,
    },
}

impl OutboundEvent {
    pub fn sequence(&self) -> u64 {
        match self {
            OutboundEvent::Events { sequence, .. } => *sequence,
            OutboundEvent::Snapshot { metadata, .. } => metadata.event_seq,
        }
    }
}
