use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stockflow_core::{StateChanges, TenantId};

use crate::processor::ProcessorInfo;

/// Field names an event record uses for itself; state managers may not take them.
pub const RESERVED_RECORD_KEYS: [&str; 4] = ["sequence", "timestamp", "partitionKey", "processor"];

/// One immutable entry of the event log.
///
/// This is the unit appended once per dispatch.
///
/// Notes:
/// - **Multi-tenancy** is enforced via `partition_key`.
/// - **Append-only**: `sequence` increases by exactly one per record within a partition.
/// - `state` maps a state manager name to the changes it applied; a record may
///   carry a business manager and a linked one side by side.
/// - `processor` carries workflow checkpoints committed with the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub partition_key: TenantId,
    #[serde(flatten)]
    pub state: BTreeMap<String, StateChanges>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processor: Option<BTreeMap<String, ProcessorInfo>>,
}

impl EventRecord {
    pub fn new(partition_key: TenantId, sequence: u64) -> Self {
        Self {
            sequence,
            timestamp: Utc::now(),
            partition_key,
            state: BTreeMap::new(),
            processor: None,
        }
    }

    pub fn with_changes(mut self, manager: impl Into<String>, changes: StateChanges) -> Self {
        if !changes.is_empty() {
            self.state.insert(manager.into(), changes);
        }
        self
    }

    pub fn with_processor(mut self, name: impl Into<String>, info: ProcessorInfo) -> Self {
        self.processor
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), info);
        self
    }

    pub fn changes_for(&self, manager: &str) -> Option<&StateChanges> {
        self.state.get(manager)
    }

    pub fn processor_for(&self, name: &str) -> Option<&ProcessorInfo> {
        self.processor.as_ref()?.get(name)
    }

    /// True when the record would carry neither state changes nor checkpoints.
    pub fn is_empty(&self) -> bool {
        self.state.values().all(StateChanges::is_empty)
            && self.processor.as_ref().is_none_or(BTreeMap::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::StepOptions;
    use serde_json::json;
    use stockflow_core::StateUpdate;

    #[test]
    fn wire_shape_puts_manager_changes_at_top_level() {
        let tenant = TenantId::new();
        let mut changes = StateChanges::new();
        changes.extend("_control", [StateUpdate::inc("change_count")]);

        let record = EventRecord::new(tenant, 7)
            .with_changes("orders", changes)
            .with_processor(
                "fulfilment",
                ProcessorInfo {
                    trigger_doc_id: "o-1".into(),
                    function_index: 1,
                    trigger_full: None,
                    complete: false,
                    options: StepOptions::default(),
                    continuation: None,
                },
            );

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["sequence"], json!(7));
        assert_eq!(value["partitionKey"], json!(tenant.to_string()));
        assert_eq!(value["orders"][0]["slice"], json!("_control"));
        assert_eq!(value["processor"]["fulfilment"]["functionIndex"], json!(1));

        let back: EventRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn empty_changes_are_not_embedded() {
        let record = EventRecord::new(TenantId::new(), 1).with_changes("orders", StateChanges::new());
        assert!(record.is_empty());
        assert!(record.changes_for("orders").is_none());
    }
}
