//! Trigger feeds: where workflow runs come from.
//!
//! Each trigger carries a position token. The processor commits the token
//! with the first checkpoint of the run it starts, so after a restart the
//! processing map's `last_trigger` says where to pick the feed up again.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::processor::{RunOutcome, WorkflowProcessor};
use super::step::Trigger;
use crate::workers::WorkerHandle;

/// Ordered source of triggers that can be resumed from a token.
#[async_trait]
pub trait TriggerFeed: Send + Sync {
    /// Next trigger after `after` (from the start when `None`) with its
    /// token. Waits until one is available.
    async fn next_after(&self, after: Option<&str>) -> anyhow::Result<(String, Trigger)>;
}

/// Process-local trigger inbox.
///
/// Tokens are `<feed id>:<position>`. A token minted by another inbox (an
/// earlier process) restarts from the beginning of this one.
#[derive(Debug)]
pub struct InMemoryTriggerFeed {
    id: Uuid,
    items: Mutex<Vec<Trigger>>,
    len: watch::Sender<usize>,
}

impl Default for InMemoryTriggerFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTriggerFeed {
    pub fn new() -> Self {
        let (len, _) = watch::channel(0);
        Self {
            id: Uuid::now_v7(),
            items: Mutex::default(),
            len,
        }
    }

    /// Queue `trigger`; returns its token.
    pub fn submit(&self, trigger: Trigger) -> String {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.push(trigger);
        let position = items.len();
        self.len.send_replace(position);
        self.token(position)
    }

    pub fn len(&self) -> usize {
        *self.len.borrow()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn token(&self, position: usize) -> String {
        format!("{}:{position}", self.id)
    }

    fn position(&self, token: &str) -> anyhow::Result<usize> {
        let (feed, position) = token
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed trigger token '{token}'"))?;
        if feed != self.id.to_string() {
            debug!(%token, "token from another inbox; reading from the start");
            return Ok(0);
        }
        position
            .parse()
            .map_err(|_| anyhow!("malformed trigger token '{token}'"))
    }
}

#[async_trait]
impl TriggerFeed for InMemoryTriggerFeed {
    async fn next_after(&self, after: Option<&str>) -> anyhow::Result<(String, Trigger)> {
        let seen = match after {
            Some(token) => self.position(token)?,
            None => 0,
        };
        let mut len = self.len.subscribe();
        len.wait_for(|len| *len > seen)
            .await
            .map_err(|_| anyhow!("trigger inbox closed"))?;

        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let trigger = items
            .get(seen)
            .cloned()
            .ok_or_else(|| anyhow!("trigger {} missing from inbox", seen + 1))?;
        Ok((self.token(seen + 1), trigger))
    }
}

/// Run every trigger from `feed` after `resume_after` through the processor,
/// one at a time.
pub fn spawn_feed_worker(
    processor: Arc<WorkflowProcessor>,
    feed: Arc<dyn TriggerFeed>,
    resume_after: Option<String>,
) -> WorkerHandle {
    let name = format!("triggers-{}", processor.name());
    WorkerHandle::spawn(name, move |mut shutdown| async move {
        let mut position = resume_after;
        if let Some(token) = &position {
            info!(processor = %processor.name(), %token, "resuming trigger feed");
        }
        loop {
            let next = tokio::select! {
                _ = shutdown.wait() => break,
                next = feed.next_after(position.as_deref()) => next,
            };
            let (token, trigger) = match next {
                Ok(next) => next,
                Err(err) => {
                    warn!(processor = %processor.name(), error = %err, "trigger feed read failed");
                    tokio::select! {
                        _ = shutdown.wait() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                    }
                }
            };

            match processor.handle(trigger.with_continuation(token.clone())).await {
                Ok(RunOutcome::Failed { function_index, message }) => {
                    warn!(processor = %processor.name(), step = function_index, %message, "triggered run failed");
                }
                Ok(outcome) => info!(processor = %processor.name(), ?outcome, "trigger handled"),
                Err(err) => warn!(processor = %processor.name(), error = %err, "trigger rejected"),
            }
            position = Some(token);
        }
    })
}
