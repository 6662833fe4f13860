//! Per-subject recompute slots.
//!
//! At most one pass runs per subject. Scopes that arrive while a pass is
//! running are queued and drained by the same worker once the pass finishes,
//! so a newer observation re-triggers work instead of aborting a write.
//! Unrelated subjects run in parallel.

use crate::engine::Engine;
use crate::error::{Error, Result};

use tokio::sync::oneshot;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

/// A unit of derived state. Ordered so a pass clears before it recomputes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Scope {
    /// Drop derived rows for the whole subject (`None`) or one definition.
    Clear(Option<String>),
    Routine(String),
    Goal(String),
    Behavior,
    QualityOfLife,
    Patterns,
}

type Waiter = oneshot::Sender<std::result::Result<(), String>>;

#[derive(Default)]
struct Slot {
    running: bool,
    pending: BTreeSet<Scope>,
    waiters: Vec<Waiter>,
}

#[derive(Default)]
pub(crate) struct Scheduler {
    slots: Mutex<HashMap<String, Slot>>,
}

impl Scheduler {
    /// Queue scopes. Returns true when the caller must start a worker.
    fn enqueue(
        &self,
        subject_id: &str,
        scopes: impl IntoIterator<Item = Scope>,
        waiter: Option<Waiter>,
    ) -> bool {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.entry(subject_id.to_string()).or_default();
        slot.pending.extend(scopes);
        slot.waiters.extend(waiter);
        if slot.running {
            false
        } else {
            slot.running = true;
            true
        }
    }

    /// Take the next batch, or release the slot when nothing is pending.
    fn next_batch(&self, subject_id: &str) -> Option<(BTreeSet<Scope>, Vec<Waiter>)> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = slots.get_mut(subject_id)?;
        if slot.pending.is_empty() {
            slots.remove(subject_id);
            return None;
        }
        Some((
            std::mem::take(&mut slot.pending),
            std::mem::take(&mut slot.waiters),
        ))
    }

    /// Subjects with a pass running or queued.
    pub(crate) fn busy_subjects(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Engine {
    /// Queue a recompute for a subject. Returns immediately.
    pub fn schedule(self: &Arc<Self>, subject_id: &str, scopes: impl IntoIterator<Item = Scope>) {
        self.enqueue(subject_id, scopes, None);
    }

    /// Subjects with a recompute pass running or queued.
    pub fn recomputes_in_flight(&self) -> usize {
        self.scheduler.busy_subjects()
    }

    /// Queue a recompute and wait for the pass that covers it.
    pub async fn schedule_and_wait(
        self: &Arc<Self>,
        subject_id: &str,
        scopes: impl IntoIterator<Item = Scope>,
    ) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.enqueue(subject_id, scopes, Some(tx));
        let outcome = rx
            .await
            .map_err(|_| anyhow::anyhow!("recompute worker for {subject_id} went away"))?;
        outcome.map_err(|reason| Error::RecomputationFailure {
            subject_id: subject_id.to_string(),
            reason,
        })
    }

    fn enqueue(
        self: &Arc<Self>,
        subject_id: &str,
        scopes: impl IntoIterator<Item = Scope>,
        waiter: Option<Waiter>,
    ) {
        if self.scheduler.enqueue(subject_id, scopes, waiter) {
            let engine = Arc::clone(self);
            let subject_id = subject_id.to_string();
            tokio::spawn(async move { engine.drain(subject_id).await });
        }
    }

    async fn drain(self: Arc<Self>, subject_id: String) {
        while let Some((scopes, waiters)) = self.scheduler.next_batch(&subject_id) {
            let outcome = self.recompute_with_retry(&subject_id, &scopes).await;
            for waiter in waiters {
                let _ = waiter.send(outcome.clone());
            }
        }
    }

    /// Run a pass, retrying transient failures with exponential backoff.
    /// After the last attempt the failure is logged and recorded; it never
    /// reaches an ingestion caller.
    async fn recompute_with_retry(
        &self,
        subject_id: &str,
        scopes: &BTreeSet<Scope>,
    ) -> std::result::Result<(), String> {
        let max_attempts = self.config.retry_max_attempts.max(1);
        let mut delay = std::time::Duration::from_millis(self.config.retry_base_delay_ms);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.recompute(subject_id, scopes).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            if attempt < max_attempts && error.is_transient() {
                tracing::warn!(%error, subject_id, attempt, "recompute failed, retrying");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2);
                continue;
            }

            let failure = Error::RecomputationFailure {
                subject_id: subject_id.to_string(),
                reason: error.to_string(),
            };
            tracing::error!(%failure, attempts = attempt, "giving up on recompute");
            if let Err(error) = self
                .snapshots
                .mark_failed(subject_id, &error.to_string(), crate::db::now())
                .await
            {
                tracing::warn!(%error, subject_id, "failed to record recompute failure");
            }
            return Err(error.to_string());
        }
    }
}
