//! Batched statement commit.
//!
//! Producers push statement text onto a FIFO queue. A committer drains at
//! most `batch_size` entries at a time, hands them to a [`BatchDispatcher`]
//! and classifies the per-statement status codes it returns.
//!
//! ```text
//! enqueue ─▶ pending (FIFO) ─▶ drain ─▶ dispatch ─▶ classify ─▶ BatchResult
//!                                └────── drain lock held ──────┘
//! ```
//!
//! Entries are claimed by the drainer but only leave the queue once the
//! dispatch attempt has concluded, successfully or not. A failed dispatch
//! drops the claimed entries; nothing is resubmitted.
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, error, warn};

use tokio::sync::OwnedMutexGuard;

use super::connection::ConnectionManager;
use super::query::StructuredError;
use crate::error::{StoreError, StoreResult};

/// Statement ran but the driver reported no row count.
pub const SUCCESS_NO_INFO: i64 = -2;
/// Statement failed; the rest of the batch still ran.
pub const EXECUTE_FAILED: i64 = -3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementOutcome {
    /// Rows affected.
    Success(u64),
    SuccessUnknown,
    Failed,
}

impl StatementOutcome {
    pub fn from_code(code: i64) -> Self {
        match code {
            n if n >= 0 => StatementOutcome::Success(n.unsigned_abs()),
            SUCCESS_NO_INFO => StatementOutcome::SuccessUnknown,
            _ => StatementOutcome::Failed,
        }
    }
}

/// Outcome of one or more dispatched batches, in submission order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    pub outcomes: Vec<StatementOutcome>,
    pub success: usize,
    pub success_unknown: usize,
    pub failed: usize,
}

impl BatchResult {
    /// Classify the status codes of a batch of `entries` statements.
    ///
    /// Never fails: a code missing for an entry counts as success-unknown,
    /// extra codes are ignored.
    pub fn classify(entries: usize, codes: &[i64]) -> Self {
        if codes.len() != entries {
            warn!(
                entries,
                codes = codes.len(),
                "status code count does not match batch size"
            );
        }

        let mut result = BatchResult::default();
        for i in 0..entries {
            let outcome = match codes.get(i) {
                Some(&code) => {
                    let outcome = StatementOutcome::from_code(code);
                    if outcome == StatementOutcome::Failed && code != EXECUTE_FAILED {
                        warn!(entry = i, code, "unexpected status code, counted as failed");
                    }
                    outcome
                }
                None => StatementOutcome::SuccessUnknown,
            };
            result.push(outcome);
        }
        result
    }

    fn push(&mut self, outcome: StatementOutcome) {
        match outcome {
            StatementOutcome::Success(_) => self.success += 1,
            StatementOutcome::SuccessUnknown => self.success_unknown += 1,
            StatementOutcome::Failed => self.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    pub fn merge(&mut self, other: BatchResult) {
        self.success += other.success;
        self.success_unknown += other.success_unknown;
        self.failed += other.failed;
        self.outcomes.extend(other.outcomes);
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    /// Rows affected by the statements that reported a count.
    pub fn rows_affected(&self) -> u64 {
        self.outcomes
            .iter()
            .map(|o| match o {
                StatementOutcome::Success(n) => *n,
                _ => 0,
            })
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Idle,
    Accumulating,
    Draining,
    Executing,
    Classifying,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Maximum statements sent in one dispatch.
    pub batch_size: usize,
    /// Pending entries needed before `try_commit` drains anything.
    pub commit_threshold: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            commit_threshold: 100,
        }
    }
}

/// Executes one batch of statements as a unit.
#[async_trait]
pub trait BatchDispatcher: Send + Sync {
    /// Returns one status code per statement, in order. An `Err` means the
    /// batch as a whole did not apply and has been rolled back.
    async fn dispatch(&self, statements: &[String]) -> StoreResult<Vec<i64>>;
}

/// Runs each batch in one transaction on a pooled connection.
///
/// Every statement executes under its own savepoint, so a failing statement
/// is rolled back alone and reported as [`EXECUTE_FAILED`].
pub struct PoolDispatcher {
    manager: Arc<ConnectionManager>,
}

impl PoolDispatcher {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }
}

#[async_trait]
impl BatchDispatcher for PoolDispatcher {
    async fn dispatch(&self, statements: &[String]) -> StoreResult<Vec<i64>> {
        let mut client = self.manager.get().await?;
        let mut tx = client
            .transaction()
            .await
            .map_err(|e| StoreError::execution(&e, "BEGIN"))?;

        match execute_entries(&mut tx, statements).await {
            Ok(codes) => {
                tx.commit()
                    .await
                    .map_err(|e| StoreError::execution(&e, "COMMIT"))?;
                Ok(codes)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "rollback after failed batch also failed");
                }
                Err(e)
            }
        }
    }
}

async fn execute_entries(
    tx: &mut deadpool_postgres::Transaction<'_>,
    statements: &[String],
) -> StoreResult<Vec<i64>> {
    let mut codes = Vec::with_capacity(statements.len());
    for (i, sql) in statements.iter().enumerate() {
        let savepoint = tx
            .savepoint("batch_entry")
            .await
            .map_err(|e| StoreError::execution(&e, "SAVEPOINT batch_entry"))?;
        match savepoint.execute(sql.as_str(), &[]).await {
            Ok(rows) => {
                savepoint
                    .commit()
                    .await
                    .map_err(|e| StoreError::execution(&e, "RELEASE SAVEPOINT batch_entry"))?;
                codes.push(i64::try_from(rows).unwrap_or(i64::MAX));
            }
            Err(e) => {
                warn!(entry = i, error = %e, "batch statement failed");
                savepoint
                    .rollback()
                    .await
                    .map_err(|e| StoreError::execution(&e, "ROLLBACK TO SAVEPOINT batch_entry"))?;
                codes.push(EXECUTE_FAILED);
            }
        }
    }
    Ok(codes)
}

/// FIFO queue of pending statements with serialized draining.
///
/// Shared between producers through an `Arc`. Enqueueing never waits on a
/// commit in progress. Each dispatch runs on its own task holding the drain
/// lock, so dropping a committer (for example under `tokio::time::timeout`)
/// never cancels a batch that is already on its way to the server.
pub struct BatchManager<D> {
    shared: Arc<Shared<D>>,
    config: BatchConfig,
    drain_lock: Arc<tokio::sync::Mutex<()>>,
}

struct Shared<D> {
    dispatcher: D,
    queue: Mutex<Queue>,
}

/// Pending entries and the session state, guarded together.
struct Queue {
    entries: VecDeque<String>,
    state: BatchState,
}

impl Queue {
    fn settle(&mut self) {
        self.state = if self.entries.is_empty() {
            BatchState::Idle
        } else {
            BatchState::Accumulating
        };
    }
}

impl<D> Shared<D> {
    /// Copy the FIFO prefix of at most `limit` entries. They stay queued
    /// until [`conclude`](Self::conclude).
    fn claim(&self, limit: usize) -> Vec<String> {
        let mut queue = self.queue.lock();
        queue.state = BatchState::Draining;
        let batch = queue.entries.iter().take(limit).cloned().collect();
        queue.state = BatchState::Executing;
        batch
    }

    /// Remove the claimed entries and classify the codes.
    fn conclude(&self, claimed: usize, dispatched: StoreResult<Vec<i64>>) -> StoreResult<BatchResult> {
        let codes = match dispatched {
            Ok(codes) => codes,
            Err(e) => return Err(self.abandon(claimed, e)),
        };
        let mut queue = self.queue.lock();
        // only the drain lock holder removes from the front
        queue.entries.drain(..claimed).for_each(drop);
        queue.state = BatchState::Classifying;
        let result = BatchResult::classify(claimed, &codes);
        debug!(
            entries = claimed,
            success = result.success,
            success_unknown = result.success_unknown,
            failed = result.failed,
            "batch committed"
        );
        queue.settle();
        Ok(result)
    }

    /// Drop the claimed entries after a failed dispatch.
    fn abandon(&self, claimed: usize, err: StoreError) -> StoreError {
        error!(entries = claimed, error = %err, "batch dispatch failed, entries dropped");
        self.discard(claimed);
        err
    }

    fn discard(&self, claimed: usize) {
        let mut queue = self.queue.lock();
        queue.entries.drain(..claimed).for_each(drop);
        queue.settle();
    }
}

/// One claimed batch in flight. Owns the drain lock; if the dispatch task
/// ends without concluding, the claimed entries are dropped before the lock
/// is released.
struct Claim<D> {
    shared: Arc<Shared<D>>,
    claimed: usize,
    concluded: bool,
    _guard: OwnedMutexGuard<()>,
}

impl<D> Drop for Claim<D> {
    fn drop(&mut self) {
        if !self.concluded {
            error!(entries = self.claimed, "batch task ended early, entries dropped");
            self.shared.discard(self.claimed);
        }
    }
}

impl<D: BatchDispatcher + 'static> BatchManager<D> {
    pub fn new(dispatcher: D, config: BatchConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                dispatcher,
                queue: Mutex::new(Queue {
                    entries: VecDeque::new(),
                    state: BatchState::Idle,
                }),
            }),
            config: BatchConfig {
                batch_size: config.batch_size.max(1),
                ..config
            },
            drain_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn enqueue(&self, statement: impl Into<String>) {
        let mut queue = self.shared.queue.lock();
        queue.entries.push_back(statement.into());
        if queue.state == BatchState::Idle {
            queue.state = BatchState::Accumulating;
        }
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().entries.len()
    }

    pub fn state(&self) -> BatchState {
        self.shared.queue.lock().state
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &D {
        &self.shared.dispatcher
    }

    fn below_threshold(&self) -> bool {
        self.pending() < self.config.commit_threshold.max(1)
    }

    /// Drain and run one batch once enough entries are pending.
    ///
    /// `Ok(None)` when the queue is below the commit threshold or another
    /// committer is already draining.
    pub async fn try_commit(&self) -> StoreResult<Option<BatchResult>> {
        if self.below_threshold() {
            return Ok(None);
        }
        let Ok(guard) = Arc::clone(&self.drain_lock).try_lock_owned() else {
            return Ok(None);
        };
        // another committer may have drained in between
        if self.below_threshold() {
            return Ok(None);
        }
        self.drain_one(guard).await.map(Some)
    }

    /// Drain the whole queue, batch by batch. Waits for a commit in
    /// progress and stops at the first failed dispatch.
    pub async fn flush(&self) -> StoreResult<BatchResult> {
        let mut total = BatchResult::default();
        loop {
            let guard = Arc::clone(&self.drain_lock).lock_owned().await;
            if self.pending() == 0 {
                return Ok(total);
            }
            total.merge(self.drain_one(guard).await?);
        }
    }

    /// Claim one batch and dispatch it on a detached task that holds the
    /// drain lock until the claimed entries are removed.
    async fn drain_one(&self, guard: OwnedMutexGuard<()>) -> StoreResult<BatchResult> {
        let batch = self.shared.claim(self.config.batch_size);
        let mut claim = Claim {
            shared: Arc::clone(&self.shared),
            claimed: batch.len(),
            concluded: false,
            _guard: guard,
        };

        let task = tokio::spawn(async move {
            let dispatched = claim.shared.dispatcher.dispatch(&batch).await;
            claim.concluded = true;
            claim.shared.conclude(claim.claimed, dispatched)
        });

        task.await.map_err(|e| {
            StoreError::Execution(StructuredError::from_string(format!(
                "batch task did not complete: {}",
                e
            )))
        })?
    }
}
