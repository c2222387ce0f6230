//! Crash-resumable workflows driven through a state manager.

pub mod context;
pub mod feed;
pub mod processor;
pub mod progress;
pub mod step;
pub mod sweeper;

pub use context::{SharedContext, StepContext};
pub use feed::{InMemoryTriggerFeed, TriggerFeed, spawn_feed_worker};
pub use processor::{RestartReport, RunOutcome, WorkflowError, WorkflowProcessor};
pub use progress::ProcessingHandle;
pub use step::{DocumentSource, InMemoryDocuments, Step, StepOutcome, Trigger, TriggerSource, WakeCheck, inline_doc_id};
pub use sweeper::spawn_restart_sweeper;
