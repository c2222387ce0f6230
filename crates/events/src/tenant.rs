use stockflow_core::TenantId;

use crate::{EventRecord, OutboundEvent};

/// Messages that belong to exactly one tenant partition.
///
/// Followers and publishers use this to drop anything that crossed a
/// partition boundary.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl TenantScoped for EventRecord {
    fn tenant_id(&self) -> TenantId {
        self.partition_key
    }
}

impl TenantScoped for OutboundEvent {
    fn tenant_id(&self) -> TenantId {
        match self {
            OutboundEvent::Events { tenant, .. } => *tenant,
            OutboundEvent::Snapshot { metadata, .. } => metadata.tenant,
        }
    }
}
