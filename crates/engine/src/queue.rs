//! Per-entity FIFO execution of operations against an injected executor.
//!
//! Every entity key owns an independent queue. At most one executor call is
//! in flight per key, and the head of a queue is only removed once the
//! ledger says it is done (confirmed, failed, merged or skipped). Queues for
//! different keys progress concurrently on the tokio runtime.
//!
//! Retries are explicit scheduled tasks: a failed head parks its queue and a
//! timer task resumes it after the backoff. The timer's abort handle lives in
//! the queue so merges, `cleanup` and `shutdown` can cancel it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tandem_core::{EntityKey, OpId, Operation};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;

use crate::config::PipelineConfig;
use crate::error::{EngineError, ExecutionError};

pub type ExecutionFuture = Pin<Box<dyn Future<Output = Result<bool, ExecutionError>> + Send>>;

/// Performs one operation against the authoritative store.
///
/// `Ok(true)` is success. `Ok(false)` and `Err(_)` are both failures and go
/// through the retry path.
pub trait OperationExecutor: Send + Sync {
    fn execute(&self, operation: Operation) -> ExecutionFuture;
}

impl<F, Fut> OperationExecutor for F
where
    F: Fn(Operation) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool, ExecutionError>> + Send + 'static,
{
    fn execute(&self, operation: Operation) -> ExecutionFuture {
        Box::pin(self(operation))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Failed(ExecutionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// The head is done; move on to the next queued operation.
    Advance,
    /// Keep the head and run it again after `delay`.
    Retry { delay: Duration },
}

/// Record keeper consulted by the queue around each executor call.
pub trait OperationLedger: Send + Sync {
    /// Returns the current version of the record to execute, or `None` if it
    /// no longer needs executing (merged away while queued).
    fn begin_attempt(&self, op_id: OpId) -> Option<Operation>;

    fn finish_attempt(&self, op_id: OpId, outcome: AttemptOutcome) -> Disposition;

    /// Whether the record is still pending or retrying.
    fn is_live(&self, op_id: OpId) -> bool;

    /// Drop settled records older than `retention`; returns how many went.
    fn prune_settled(&self, retention: Duration) -> usize;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub total_queued: usize,
    /// Entities with an executor call currently in flight.
    pub processing_items: usize,
    pub queues_by_item: BTreeMap<EntityKey, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub pruned_records: usize,
    pub dropped_queues: usize,
    pub cancelled_retries: usize,
}

struct ScheduledRetry {
    op_id: OpId,
    timer: AbortHandle,
}

#[derive(Default)]
struct EntityQueue {
    ops: VecDeque<OpId>,
    in_flight: Option<OpId>,
    worker: Option<AbortHandle>,
    retry: Option<ScheduledRetry>,
    /// The in-flight record was merged away or cancelled while its worker
    /// still held it. It is dropped instead of parked if its attempt fails.
    superseded: Option<OpId>,
}

impl EntityQueue {
    fn is_idle(&self) -> bool {
        self.ops.is_empty() && self.worker.is_none() && self.retry.is_none()
    }

    fn cancel_retry(&mut self) -> bool {
        match self.retry.take() {
            Some(retry) => {
                retry.timer.abort();
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct QueueState {
    queues: HashMap<EntityKey, EntityQueue>,
}

impl QueueState {
    fn total_queued(&self) -> usize {
        self.queues.values().map(|q| q.ops.len()).sum()
    }
}

struct QueueShared {
    state: Mutex<QueueState>,
    executor: RwLock<Option<Arc<dyn OperationExecutor>>>,
    ledger: Arc<dyn OperationLedger>,
    config: PipelineConfig,
    runtime: Handle,
    queued_tx: watch::Sender<usize>,
}

#[derive(Clone)]
pub struct OperationQueueManager {
    shared: Arc<QueueShared>,
}

impl OperationQueueManager {
    /// Builds a queue bound to the current tokio runtime.
    pub fn new(config: PipelineConfig, ledger: Arc<dyn OperationLedger>) -> Result<Self, EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        Ok(Self::with_runtime(config, ledger, runtime))
    }

    pub fn with_runtime(config: PipelineConfig, ledger: Arc<dyn OperationLedger>, runtime: Handle) -> Self {
        let (queued_tx, _) = watch::channel(0);
        Self {
            shared: Arc::new(QueueShared {
                state: Mutex::new(QueueState::default()),
                executor: RwLock::new(None),
                ledger,
                config,
                runtime,
                queued_tx,
            }),
        }
    }

    pub fn set_operation_executor(&self, executor: impl OperationExecutor + 'static) {
        *self.shared.executor.write() = Some(Arc::new(executor));
    }

    pub fn has_executor(&self) -> bool {
        self.shared.executor.read().is_some()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.shared.runtime
    }

    /// Append to the entity's queue, starting its worker if it was idle.
    pub fn enqueue(&self, operation: &Operation) -> Result<(), EngineError> {
        if !self.has_executor() {
            return Err(EngineError::ExecutorNotConfigured);
        }
        let mut state = self.shared.state.lock();
        state
            .queues
            .entry(operation.entity.clone())
            .or_default()
            .ops
            .push_back(operation.id);
        tracing::debug!(op_id = %operation.id, entity = %operation.entity, "enqueued");
        self.shared.ensure_worker(&mut state, &operation.entity);
        self.shared.publish(&state);
        Ok(())
    }

    /// Swap a queued, not-in-flight record for its successor in place.
    /// Returns `false` when `old` is in flight or no longer queued. An
    /// in-flight `old` is marked superseded and never parked for retry.
    pub fn replace_queued(&self, key: &EntityKey, old: OpId, new: OpId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(queue) = state.queues.get_mut(key) else {
            return false;
        };
        if queue.in_flight == Some(old) {
            queue.superseded = Some(old);
            return false;
        }
        let Some(slot) = queue.ops.iter_mut().find(|id| **id == old) else {
            return false;
        };
        *slot = new;
        // A parked retry for the old record is void; the successor starts fresh
        if queue.retry.as_ref().is_some_and(|r| r.op_id == old) {
            queue.cancel_retry();
            tracing::debug!(entity = %key, "retry cancelled by merge");
        }
        self.shared.ensure_worker(&mut state, key);
        true
    }

    /// Drop a queued, not-in-flight record. Returns `false` when it is in
    /// flight or no longer queued; an in-flight record is marked superseded.
    pub fn remove_queued(&self, key: &EntityKey, op_id: OpId) -> bool {
        let mut state = self.shared.state.lock();
        let Some(queue) = state.queues.get_mut(key) else {
            return false;
        };
        if queue.in_flight == Some(op_id) {
            queue.superseded = Some(op_id);
            return false;
        }
        let before = queue.ops.len();
        queue.ops.retain(|id| *id != op_id);
        let removed = queue.ops.len() != before;
        if queue.retry.as_ref().is_some_and(|r| r.op_id == op_id) {
            queue.cancel_retry();
        }
        if queue.is_idle() {
            state.queues.remove(key);
        } else {
            self.shared.ensure_worker(&mut state, key);
        }
        self.shared.publish(&state);
        removed
    }

    pub fn in_flight(&self, key: &EntityKey) -> Option<OpId> {
        self.shared
            .state
            .lock()
            .queues
            .get(key)
            .and_then(|q| q.in_flight)
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        let state = self.shared.state.lock();
        let queues_by_item: BTreeMap<EntityKey, usize> = state
            .queues
            .iter()
            .filter(|(_, q)| !q.ops.is_empty())
            .map(|(key, q)| (key.clone(), q.ops.len()))
            .collect();
        QueueStatus {
            total_queued: queues_by_item.values().sum(),
            processing_items: state.queues.values().filter(|q| q.in_flight.is_some()).count(),
            queues_by_item,
        }
    }

    /// Prune settled records past retention, cancel retries whose record is no
    /// longer live, and drop empty queues.
    pub fn cleanup(&self) -> CleanupReport {
        let pruned_records = self.shared.ledger.prune_settled(self.shared.config.retention);

        let parked: Vec<(EntityKey, OpId)> = {
            let state = self.shared.state.lock();
            state
                .queues
                .iter()
                .filter_map(|(key, q)| q.retry.as_ref().map(|r| (key.clone(), r.op_id)))
                .collect()
        };
        // Ledger lookups happen outside the queue lock
        let orphaned: Vec<(EntityKey, OpId)> = parked
            .into_iter()
            .filter(|(_, op_id)| !self.shared.ledger.is_live(*op_id))
            .collect();

        let mut state = self.shared.state.lock();
        let mut cancelled_retries = 0;
        for (key, op_id) in orphaned {
            let Some(queue) = state.queues.get_mut(&key) else {
                continue;
            };
            if queue.retry.as_ref().is_some_and(|r| r.op_id == op_id) {
                queue.cancel_retry();
                queue.ops.retain(|id| *id != op_id);
                cancelled_retries += 1;
                self.shared.ensure_worker(&mut state, &key);
            }
        }

        let before = state.queues.len();
        state.queues.retain(|_, q| !q.is_idle());
        let dropped_queues = before - state.queues.len();
        self.shared.publish(&state);

        let report = CleanupReport {
            pruned_records,
            dropped_queues,
            cancelled_retries,
        };
        tracing::debug!(?report, "queue cleanup");
        report
    }

    /// Resolves once every queue has drained, parked retries included.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.shared.queued_tx.subscribe();
        // The sender lives as long as `self`, so this only ends on the predicate
        let _ = rx.wait_for(|queued| *queued == 0).await;
    }

    /// Abort every worker and pending retry and forget all queued work.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        for (_, mut queue) in state.queues.drain() {
            queue.cancel_retry();
            if let Some(worker) = queue.worker.take() {
                worker.abort();
            }
        }
        self.shared.publish(&state);
        tracing::debug!("queue shut down");
    }
}

impl QueueShared {
    fn publish(&self, state: &QueueState) {
        self.queued_tx.send_replace(state.total_queued());
    }

    fn ensure_worker(self: &Arc<Self>, state: &mut QueueState, key: &EntityKey) {
        let Some(queue) = state.queues.get_mut(key) else {
            return;
        };
        if queue.worker.is_some() || queue.retry.is_some() || queue.ops.is_empty() {
            return;
        }
        let shared = Arc::clone(self);
        let worker_key = key.clone();
        let task = self.runtime.spawn(async move { shared.run_worker(worker_key).await });
        queue.worker = Some(task.abort_handle());
    }

    async fn run_worker(self: Arc<Self>, key: EntityKey) {
        loop {
            let op_id = {
                let mut state = self.state.lock();
                let Some(queue) = state.queues.get_mut(&key) else {
                    return;
                };
                match queue.ops.front().copied() {
                    Some(op_id) if queue.retry.is_none() => {
                        queue.in_flight = Some(op_id);
                        op_id
                    }
                    _ => {
                        queue.worker = None;
                        if queue.is_idle() {
                            state.queues.remove(&key);
                        }
                        self.publish(&state);
                        return;
                    }
                }
            };

            let Some(operation) = self.ledger.begin_attempt(op_id) else {
                tracing::debug!(%op_id, entity = %key, "skipping settled operation");
                self.advance(&key, op_id);
                continue;
            };

            let outcome = self.execute(operation).await;
            match self.ledger.finish_attempt(op_id, outcome) {
                Disposition::Advance => self.advance(&key, op_id),
                Disposition::Retry { delay } => {
                    self.park(&key, op_id, delay);
                    return;
                }
            }
        }
    }

    async fn execute(&self, operation: Operation) -> AttemptOutcome {
        let Some(executor) = self.executor.read().clone() else {
            return AttemptOutcome::Failed(ExecutionError::Failed(
                EngineError::ExecutorNotConfigured.to_string(),
            ));
        };
        let timeout = self.config.execution_timeout;
        // Own task per call: a panicking executor only fails this attempt
        let call = self
            .runtime
            .spawn(async move { executor.execute(operation).await });
        let abort = call.abort_handle();

        match tokio::time::timeout(timeout, call).await {
            Ok(Ok(Ok(true))) => AttemptOutcome::Succeeded,
            Ok(Ok(Ok(false))) => AttemptOutcome::Failed(ExecutionError::Rejected),
            Ok(Ok(Err(e))) => AttemptOutcome::Failed(e),
            Ok(Err(join_error)) => AttemptOutcome::Failed(ExecutionError::Panicked(join_error.to_string())),
            Err(_) => {
                abort.abort();
                AttemptOutcome::Failed(ExecutionError::TimedOut(timeout))
            }
        }
    }

    fn advance(&self, key: &EntityKey, op_id: OpId) {
        let mut state = self.state.lock();
        if let Some(queue) = state.queues.get_mut(key) {
            queue.in_flight = None;
            if queue.superseded == Some(op_id) {
                queue.superseded = None;
            }
            if queue.ops.front() == Some(&op_id) {
                queue.ops.pop_front();
            } else {
                queue.ops.retain(|id| *id != op_id);
            }
        }
        self.publish(&state);
    }

    fn park(self: &Arc<Self>, key: &EntityKey, op_id: OpId, delay: Duration) {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(key) else {
            return;
        };
        queue.in_flight = None;
        queue.worker = None;

        if queue.superseded == Some(op_id) {
            queue.superseded = None;
            queue.ops.retain(|id| *id != op_id);
            if queue.is_idle() {
                state.queues.remove(key);
            } else {
                self.ensure_worker(&mut state, key);
            }
            self.publish(&state);
            tracing::debug!(%op_id, entity = %key, "superseded operation dropped instead of retried");
            return;
        }

        let shared = Arc::clone(self);
        let timer_key = key.clone();
        let timer = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            shared.resume(&timer_key, op_id);
        });
        queue.retry = Some(ScheduledRetry {
            op_id,
            timer: timer.abort_handle(),
        });
        tracing::debug!(%op_id, entity = %key, delay_ms = delay.as_millis() as u64, "retry scheduled");
    }

    fn resume(self: &Arc<Self>, key: &EntityKey, op_id: OpId) {
        let mut state = self.state.lock();
        let Some(queue) = state.queues.get_mut(key) else {
            return;
        };
        if queue.retry.as_ref().is_some_and(|r| r.op_id == op_id) {
            queue.retry = None;
            self.ensure_worker(&mut state, key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tandem_core::{EntityState, Hlc, Intent, OperationStatus};

    /// Minimal ledger: executes records as stored, gives up after one retry.
    #[derive(Default)]
    struct RecordingLedger {
        records: Mutex<HashMap<OpId, Operation>>,
        finished: Mutex<Vec<(OpId, AttemptOutcome)>>,
    }

    impl RecordingLedger {
        fn track(&self, key: &EntityKey, rating: i64) -> Operation {
            let op = Operation::from_intent(
                Intent::update(key.clone(), EntityState::new().with_field("rating", rating), None),
                Hlc::new(1, 0),
            );
            self.records.lock().insert(op.id, op.clone());
            op
        }
    }

    impl OperationLedger for RecordingLedger {
        fn begin_attempt(&self, op_id: OpId) -> Option<Operation> {
            let mut records = self.records.lock();
            let op = records.get_mut(&op_id)?;
            if !op.status.is_active() {
                return None;
            }
            op.attempts += 1;
            Some(op.clone())
        }

        fn finish_attempt(&self, op_id: OpId, outcome: AttemptOutcome) -> Disposition {
            self.finished.lock().push((op_id, outcome.clone()));
            let mut records = self.records.lock();
            let Some(op) = records.get_mut(&op_id) else {
                return Disposition::Advance;
            };
            match outcome {
                AttemptOutcome::Succeeded => {
                    op.status = OperationStatus::Confirmed;
                    Disposition::Advance
                }
                AttemptOutcome::Failed(_) if op.attempts < 2 => {
                    op.status = OperationStatus::Retrying;
                    Disposition::Retry {
                        delay: Duration::from_millis(50),
                    }
                }
                AttemptOutcome::Failed(_) => {
                    op.status = OperationStatus::Failed;
                    Disposition::Advance
                }
            }
        }

        fn is_live(&self, op_id: OpId) -> bool {
            self.records
                .lock()
                .get(&op_id)
                .is_some_and(|op| op.status.is_active())
        }

        fn prune_settled(&self, _retention: Duration) -> usize {
            let mut records = self.records.lock();
            let before = records.len();
            records.retain(|_, op| op.status.is_active());
            before - records.len()
        }
    }

    fn queue_with(ledger: &Arc<RecordingLedger>) -> OperationQueueManager {
        let ledger: Arc<dyn OperationLedger> = ledger.clone();
        OperationQueueManager::new(PipelineConfig::default(), ledger).unwrap()
    }

    #[tokio::test]
    async fn enqueue_without_executor_fails_fast() {
        let ledger = Arc::new(RecordingLedger::default());
        let queue = queue_with(&ledger);
        let op = ledger.track(&EntityKey::item("X").unwrap(), 1);

        assert!(matches!(queue.enqueue(&op), Err(EngineError::ExecutorNotConfigured)));
        assert_eq!(queue.get_queue_status().total_queued, 0);
    }

    #[tokio::test]
    async fn same_entity_runs_in_submission_order() {
        let ledger = Arc::new(RecordingLedger::default());
        let queue = queue_with(&ledger);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        queue.set_operation_executor(move |op: Operation| {
            let sink = sink.clone();
            async move {
                tokio::task::yield_now().await;
                sink.lock().push(op.payload.and_then(|p| p.get("rating").and_then(|v| v.as_integer())));
                Ok::<_, ExecutionError>(true)
            }
        });

        let key = EntityKey::item("X").unwrap();
        for rating in 1..=4 {
            queue.enqueue(&ledger.track(&key, rating)).unwrap();
        }
        assert_eq!(queue.get_queue_status().queues_by_item[&key], 4);

        queue.wait_until_idle().await;
        assert_eq!(*seen.lock(), vec![Some(1), Some(2), Some(3), Some(4)]);
        assert_eq!(queue.get_queue_status(), QueueStatus::default());
    }

    #[tokio::test]
    async fn panicking_executor_is_contained_to_its_entity() {
        let ledger = Arc::new(RecordingLedger::default());
        let queue = queue_with(&ledger);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        queue.set_operation_executor(move |op: Operation| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if op.entity.id.as_str() == "boom" {
                    panic!("executor exploded");
                }
                Ok::<_, ExecutionError>(true)
            }
        });

        let boom = ledger.track(&EntityKey::item("boom").unwrap(), 1);
        let fine = ledger.track(&EntityKey::item("fine").unwrap(), 2);
        queue.enqueue(&boom).unwrap();
        queue.enqueue(&fine).unwrap();
        queue.wait_until_idle().await;

        let finished = ledger.finished.lock().clone();
        assert!(finished.contains(&(fine.id, AttemptOutcome::Succeeded)));
        assert!(finished
            .iter()
            .any(|(id, outcome)| *id == boom.id && matches!(outcome, AttemptOutcome::Failed(ExecutionError::Panicked(_)))));
        // one retry for the panicking record, one call for the healthy one
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_executor_times_out() {
        let ledger = Arc::new(RecordingLedger::default());
        let ledger_dyn: Arc<dyn OperationLedger> = ledger.clone();
        let config = PipelineConfig::default().with_execution_timeout(Duration::from_millis(100));
        let queue = OperationQueueManager::new(config, ledger_dyn).unwrap();
        queue.set_operation_executor(|_op: Operation| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<_, ExecutionError>(true)
        });

        let op = ledger.track(&EntityKey::item("slow").unwrap(), 1);
        queue.enqueue(&op).unwrap();
        queue.wait_until_idle().await;

        let finished = ledger.finished.lock().clone();
        assert_eq!(finished.len(), 2);
        assert!(finished
            .iter()
            .all(|(_, outcome)| *outcome == AttemptOutcome::Failed(ExecutionError::TimedOut(Duration::from_millis(100)))));
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_cancels_retries_of_dead_records() {
        let ledger = Arc::new(RecordingLedger::default());
        let queue = queue_with(&ledger);
        queue.set_operation_executor(|_op: Operation| async { Ok::<_, ExecutionError>(false) });

        let key = EntityKey::item("parked").unwrap();
        let op = ledger.track(&key, 1);
        queue.enqueue(&op).unwrap();

        // let the first attempt fail and park the queue
        while ledger.finished.lock().is_empty() {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.get_queue_status().processing_items, 0);
        assert_eq!(queue.get_queue_status().total_queued, 1);

        ledger.records.lock().get_mut(&op.id).unwrap().status = OperationStatus::Merged;
        let report = queue.cleanup();
        assert_eq!(report.cancelled_retries, 1);
        assert_eq!(report.pruned_records, 1);
        assert_eq!(report.dropped_queues, 1);
        assert_eq!(queue.get_queue_status().total_queued, 0);
    }

    /// Merges a successor over the failing record between its failed attempt
    /// and the park, the way a submit racing the worker would.
    #[derive(Default)]
    struct MergingLedger {
        inner: RecordingLedger,
        queue: Mutex<Option<OperationQueueManager>>,
        successor: Mutex<Option<Operation>>,
    }

    impl OperationLedger for MergingLedger {
        fn begin_attempt(&self, op_id: OpId) -> Option<Operation> {
            self.inner.begin_attempt(op_id)
        }

        fn finish_attempt(&self, op_id: OpId, outcome: AttemptOutcome) -> Disposition {
            let failed = matches!(outcome, AttemptOutcome::Failed(_));
            let disposition = self.inner.finish_attempt(op_id, outcome);
            let successor = if failed { self.successor.lock().take() } else { None };
            if let Some(successor) = successor {
                let queue = self.queue.lock().clone().unwrap();
                self.inner.records.lock().get_mut(&op_id).unwrap().status = OperationStatus::Merged;
                if !queue.replace_queued(&successor.entity, op_id, successor.id) {
                    queue.enqueue(&successor).unwrap();
                }
                return Disposition::Retry {
                    delay: Duration::from_secs(60),
                };
            }
            disposition
        }

        fn is_live(&self, op_id: OpId) -> bool {
            self.inner.is_live(op_id)
        }

        fn prune_settled(&self, retention: Duration) -> usize {
            self.inner.prune_settled(retention)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn record_merged_away_after_a_failed_attempt_is_not_retried() {
        let ledger = Arc::new(MergingLedger::default());
        let ledger_dyn: Arc<dyn OperationLedger> = ledger.clone();
        let queue = OperationQueueManager::new(PipelineConfig::default(), ledger_dyn).unwrap();
        *ledger.queue.lock() = Some(queue.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        queue.set_operation_executor(move |op: Operation| {
            let sink = sink.clone();
            async move {
                let rating = op.payload.and_then(|p| p.get("rating").and_then(|v| v.as_integer()));
                sink.lock().push(op.id);
                if rating == Some(1) {
                    Err(ExecutionError::Failed("rejected by remote".to_string()))
                } else {
                    Ok(true)
                }
            }
        });

        let key = EntityKey::item("X").unwrap();
        let first = ledger.inner.track(&key, 1);
        let second = ledger.inner.track(&key, 2);
        *ledger.successor.lock() = Some(second.clone());
        queue.enqueue(&first).unwrap();

        tokio::time::timeout(Duration::from_secs(1), queue.wait_until_idle())
            .await
            .expect("successor waited out the superseded record's backoff");

        assert_eq!(*seen.lock(), vec![first.id, second.id]);
        assert_eq!(ledger.inner.records.lock()[&second.id].status, OperationStatus::Confirmed);
        assert_eq!(queue.get_queue_status(), QueueStatus::default());
    }
}
