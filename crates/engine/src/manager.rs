//! Public submission API: merges intents, keeps the overlay current and
//! tracks every operation through its lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tandem_core::{
    hlc::{physical_now, Hlc, HlcClock},
    merge_policy, rebase_on_failure, EntityKey, EntityState, Intent, MergeOutcome, OpId, Operation,
    OperationKind, OperationStatus,
};
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::config::PipelineConfig;
use crate::error::{EngineError, ExecutionError};
use crate::overlay::{Overlay, OverlayEntry, OverlayValue};
use crate::queue::{
    AttemptOutcome, CleanupReport, Disposition, OperationExecutor, OperationLedger,
    OperationQueueManager, QueueStatus,
};

/// A status transition, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationEvent {
    pub op_id: OpId,
    pub entity: EntityKey,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub attempts: u32,
}

impl OperationEvent {
    fn of(op: &Operation) -> Self {
        Self {
            op_id: op.id,
            entity: op.entity.clone(),
            kind: op.kind,
            status: op.status,
            attempts: op.attempts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub submitted: u64,
    pub merged_count: u64,
    pub confirmed: u64,
    pub failed: u64,
    pub retries: u64,
    pub concurrency_violations: u64,
}

/// What the validator sees for one tracked entity.
#[derive(Debug, Clone)]
pub(crate) struct LocalEntity {
    pub key: EntityKey,
    pub overlay: Option<OverlayEntry>,
    pub confirmed: Option<EntityState>,
    pub live_op: Option<OpId>,
    /// Local change counter for the entity when this view was taken.
    pub revision: u64,
}

struct UpdateState {
    clock: HlcClock,
    records: HashMap<OpId, Operation>,
    /// The single pending/retrying record per entity.
    active: HashMap<EntityKey, OpId>,
    overlay: Overlay,
    /// Last authoritative value known locally.
    confirmed: HashMap<EntityKey, EntityState>,
    /// Records whose executor call is running right now.
    executing: HashSet<OpId>,
    /// Records per entity that may still be live; settled ids are dropped lazily.
    entity_ops: HashMap<EntityKey, Vec<OpId>>,
    /// Bumped on every local change to an entity's overlay, confirmed value
    /// or live operation.
    revisions: HashMap<EntityKey, u64>,
    stats: UpdateStats,
}

impl UpdateState {
    fn insert_record(&mut self, op: Operation) {
        self.entity_ops.entry(op.entity.clone()).or_default().push(op.id);
        self.records.insert(op.id, op);
    }

    fn touch(&mut self, key: &EntityKey) {
        *self.revisions.entry(key.clone()).or_insert(0) += 1;
    }

    fn revision(&self, key: &EntityKey) -> u64 {
        self.revisions.get(key).copied().unwrap_or(0)
    }

    /// No local change and no live operation since `observed` was taken.
    fn unchanged_since(&self, observed: &LocalEntity) -> bool {
        !self.active.contains_key(&observed.key) && self.revision(&observed.key) == observed.revision
    }
}

struct LedgerCore {
    state: Mutex<UpdateState>,
    config: PipelineConfig,
    events: broadcast::Sender<OperationEvent>,
}

#[derive(Clone)]
pub struct OptimisticUpdateManager {
    core: Arc<LedgerCore>,
    queue: OperationQueueManager,
}

impl OptimisticUpdateManager {
    /// Builds a manager bound to the current tokio runtime.
    pub fn new(config: PipelineConfig) -> Result<Self, EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        Ok(Self::with_runtime(config, runtime))
    }

    pub fn with_runtime(config: PipelineConfig, runtime: Handle) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let core = Arc::new(LedgerCore {
            state: Mutex::new(UpdateState {
                clock: HlcClock::new(),
                records: HashMap::new(),
                active: HashMap::new(),
                overlay: Overlay::new(),
                confirmed: HashMap::new(),
                executing: HashSet::new(),
                entity_ops: HashMap::new(),
                revisions: HashMap::new(),
                stats: UpdateStats::default(),
            }),
            config: config.clone(),
            events,
        });
        let ledger: Arc<dyn OperationLedger> = core.clone();
        let queue = OperationQueueManager::with_runtime(config, ledger, runtime);
        Self { core, queue }
    }

    pub fn set_operation_executor(&self, executor: impl OperationExecutor + 'static) {
        self.queue.set_operation_executor(executor);
    }

    pub fn queue(&self) -> &OperationQueueManager {
        &self.queue
    }

    pub fn subscribe(&self) -> broadcast::Receiver<OperationEvent> {
        self.core.events.subscribe()
    }

    /// Record a mutation intent and return the id of the operation now
    /// carrying it. Never waits on the executor; the overlay reflects the
    /// intent before this returns.
    pub fn submit(&self, intent: Intent) -> Result<OpId, EngineError> {
        intent.validate().map_err(EngineError::from_core_validation)?;
        if !self.queue.has_executor() {
            return Err(EngineError::ExecutorNotConfigured);
        }
        let mut events = Vec::new();
        let result = self.submit_locked(&mut self.core.state.lock(), intent, &mut events);
        self.core.emit(events);
        result
    }

    /// `submit`, unless the entity changed locally since `observed` was
    /// taken. Returns `Ok(None)` without touching anything in that case.
    pub(crate) fn submit_if_unchanged(
        &self,
        observed: &LocalEntity,
        intent: Intent,
    ) -> Result<Option<OpId>, EngineError> {
        intent.validate().map_err(EngineError::from_core_validation)?;
        if !self.queue.has_executor() {
            return Err(EngineError::ExecutorNotConfigured);
        }
        let mut events = Vec::new();
        let result = {
            let mut state = self.core.state.lock();
            if !state.unchanged_since(observed) {
                return Ok(None);
            }
            self.submit_locked(&mut state, intent, &mut events).map(Some)
        };
        self.core.emit(events);
        result
    }

    fn submit_locked(
        &self,
        state: &mut UpdateState,
        intent: Intent,
        events: &mut Vec<OperationEvent>,
    ) -> Result<OpId, EngineError> {
        let key = intent.entity.clone();
        let now = state.clock.advance();
        self.core.enforce_single_active(state, &key, now, events);

        let existing = state
            .active
            .get(&key)
            .and_then(|id| state.records.get(id))
            .cloned();
        let op_id = match existing {
            Some(existing) => self.merge_into(state, existing, intent, now, events)?,
            None => self.track_new(state, intent, now, events)?,
        };
        state.stats.submitted += 1;
        state.touch(&key);
        Ok(op_id)
    }

    fn track_new(
        &self,
        state: &mut UpdateState,
        intent: Intent,
        now: Hlc,
        events: &mut Vec<OperationEvent>,
    ) -> Result<OpId, EngineError> {
        let op = Operation::from_intent(intent, now);
        self.queue.enqueue(&op)?;
        apply_to_overlay(&mut state.overlay, &op, now);
        tracing::debug!(op_id = %op.id, entity = %op.entity, kind = op.kind.as_str(), "operation submitted");
        events.push(OperationEvent::of(&op));
        let id = op.id;
        state.active.insert(op.entity.clone(), id);
        state.insert_record(op);
        Ok(id)
    }

    fn merge_into(
        &self,
        state: &mut UpdateState,
        existing: Operation,
        intent: Intent,
        now: Hlc,
        events: &mut Vec<OperationEvent>,
    ) -> Result<OpId, EngineError> {
        let key = intent.entity.clone();
        // Only a call the ledger has started and not yet finished counts. A
        // record between a failed attempt and its parked retry is not in flight.
        let in_flight = state.executing.contains(&existing.id);

        match merge_policy(&existing, &intent, in_flight) {
            MergeOutcome::Replace(merged) => {
                let successor = Operation::from_intent(
                    Intent {
                        kind: merged.kind,
                        entity: key.clone(),
                        payload: merged.payload,
                        original_payload: merged.original_payload,
                    },
                    now,
                );
                // In flight: the old write still lands, so the successor queues behind it
                if in_flight || !self.queue.replace_queued(&key, existing.id, successor.id) {
                    self.queue.enqueue(&successor)?;
                }
                if let Some(old) = state.records.get_mut(&existing.id) {
                    old.status = OperationStatus::Merged;
                    old.superseded_by = Some(successor.id);
                    old.updated_at = now;
                    events.push(OperationEvent::of(old));
                }
                apply_to_overlay(&mut state.overlay, &successor, now);
                state.stats.merged_count += 1;
                tracing::debug!(
                    superseded = %existing.id,
                    op_id = %successor.id,
                    entity = %key,
                    kind = successor.kind.as_str(),
                    in_flight,
                    "intent merged"
                );
                events.push(OperationEvent::of(&successor));
                let id = successor.id;
                state.active.insert(key, id);
                state.insert_record(successor);
                Ok(id)
            }
            MergeOutcome::Absorbed => {
                state.stats.merged_count += 1;
                tracing::debug!(op_id = %existing.id, entity = %key, "intent absorbed");
                Ok(existing.id)
            }
            MergeOutcome::Cancelled => {
                self.queue.remove_queued(&key, existing.id);
                if let Some(old) = state.records.get_mut(&existing.id) {
                    old.status = OperationStatus::Merged;
                    old.updated_at = now;
                    events.push(OperationEvent::of(old));
                }
                state.active.remove(&key);
                state.overlay.remove(&key);
                state.stats.merged_count += 1;
                tracing::debug!(op_id = %existing.id, entity = %key, "intent cancelled out");
                Ok(existing.id)
            }
            MergeOutcome::Rejected(reason) => Err(EngineError::Validation(reason)),
        }
    }

    /// Snapshot of every pending or retrying operation, oldest first.
    pub fn get_pending_operations(&self) -> Vec<Operation> {
        let state = self.core.state.lock();
        let mut pending: Vec<Operation> = state
            .records
            .values()
            .filter(|op| op.status.is_active())
            .cloned()
            .collect();
        pending.sort_by_key(|op| op.created_at);
        pending
    }

    pub fn get_operation(&self, op_id: OpId) -> Option<Operation> {
        self.core.state.lock().records.get(&op_id).cloned()
    }

    pub fn get_queue_status(&self) -> QueueStatus {
        self.queue.get_queue_status()
    }

    /// Optimistic read: overlay first, then the confirmed view.
    pub fn read(&self, key: &EntityKey) -> Option<EntityState> {
        let state = self.core.state.lock();
        match state.overlay.get(key) {
            Some(entry) => entry.value.state().cloned(),
            None => state.confirmed.get(key).cloned(),
        }
    }

    pub fn overlay_entry(&self, key: &EntityKey) -> Option<OverlayEntry> {
        self.core.state.lock().overlay.get(key).cloned()
    }

    pub fn confirmed_state(&self, key: &EntityKey) -> Option<EntityState> {
        self.core.state.lock().confirmed.get(key).cloned()
    }

    /// Seed the confirmed view from an authoritative load.
    pub fn hydrate(&self, key: EntityKey, entity: EntityState) {
        let mut state = self.core.state.lock();
        state.touch(&key);
        state.confirmed.insert(key, entity);
    }

    /// Reinstate optimistic values saved by a previous session. No operation
    /// backs them until the consistency validator reconciles them.
    pub fn restore_overlay(&self, key: EntityKey, value: OverlayValue) {
        let mut state = self.core.state.lock();
        let now = state.clock.advance();
        let restored = OpId::new();
        state.touch(&key);
        match value {
            OverlayValue::Present(entity) => state.overlay.put(key, entity, restored, now),
            OverlayValue::Removed => state.overlay.mark_removed(key, restored, now),
        }
    }

    pub fn stats(&self) -> UpdateStats {
        self.core.state.lock().stats.clone()
    }

    pub fn cleanup(&self) -> CleanupReport {
        self.queue.cleanup()
    }

    pub async fn wait_until_idle(&self) {
        self.queue.wait_until_idle().await
    }

    pub fn shutdown(&self) {
        self.queue.shutdown()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        self.queue.runtime()
    }

    pub(crate) fn local_view(&self) -> Vec<LocalEntity> {
        let state = self.core.state.lock();
        let mut keys: Vec<&EntityKey> = state.overlay.keys().chain(state.confirmed.keys()).collect();
        keys.sort();
        keys.dedup();
        keys.into_iter()
            .map(|key| LocalEntity {
                key: key.clone(),
                overlay: state.overlay.get(key).cloned(),
                confirmed: state.confirmed.get(key).cloned(),
                live_op: state.active.get(key).copied(),
                revision: state.revision(key),
            })
            .collect()
    }

    /// Drop an unbacked overlay entry and adopt the remote value. Returns
    /// `false` without touching anything if the entity changed since
    /// `observed` was taken.
    pub(crate) fn discard_orphan(&self, observed: &LocalEntity, remote: Option<&EntityState>) -> bool {
        let mut state = self.core.state.lock();
        if !state.unchanged_since(observed) {
            return false;
        }
        state.overlay.remove(&observed.key);
        set_confirmed(&mut state.confirmed, &observed.key, remote.cloned());
        state.touch(&observed.key);
        true
    }

    /// Replace the confirmed value with the remote one. Returns `false`
    /// without touching anything if the entity changed since `observed` was
    /// taken.
    pub(crate) fn adopt_remote(&self, observed: &LocalEntity, remote: Option<&EntityState>) -> bool {
        let mut state = self.core.state.lock();
        if !state.unchanged_since(observed) || state.overlay.get(&observed.key).is_some() {
            return false;
        }
        set_confirmed(&mut state.confirmed, &observed.key, remote.cloned());
        state.touch(&observed.key);
        true
    }
}

fn apply_to_overlay(overlay: &mut Overlay, op: &Operation, now: Hlc) {
    match (op.kind, &op.payload) {
        (OperationKind::Delete, _) => overlay.mark_removed(op.entity.clone(), op.id, now),
        (OperationKind::Add | OperationKind::Update, Some(payload)) => {
            overlay.put(op.entity.clone(), payload.clone(), op.id, now)
        }
        (OperationKind::Add | OperationKind::Update, None) => {}
    }
}

fn set_confirmed(confirmed: &mut HashMap<EntityKey, EntityState>, key: &EntityKey, value: Option<EntityState>) {
    match value {
        Some(value) => {
            confirmed.insert(key.clone(), value);
        }
        None => {
            confirmed.remove(key);
        }
    }
}

/// The value the store holds after `op` succeeded.
fn confirmed_value(op: &Operation) -> Option<EntityState> {
    match op.kind {
        OperationKind::Delete => None,
        OperationKind::Add | OperationKind::Update => op.payload.clone(),
    }
}

impl LedgerCore {
    fn emit(&self, events: Vec<OperationEvent>) {
        for event in events {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    /// Follow `superseded_by` links to the record that currently carries the chain.
    fn live_successor(state: &UpdateState, op: &Operation) -> Option<OpId> {
        let mut next = op.superseded_by;
        while let Some(id) = next {
            let record = state.records.get(&id)?;
            if record.status.is_active() {
                return Some(id);
            }
            next = record.superseded_by;
        }
        None
    }

    /// More than one live record for an entity should be unreachable. If it
    /// happens, keep the newest and merge the rest into it.
    fn enforce_single_active(
        &self,
        state: &mut UpdateState,
        key: &EntityKey,
        now: Hlc,
        events: &mut Vec<OperationEvent>,
    ) {
        let records = &state.records;
        let mut live: Vec<(Hlc, OpId)> = match state.entity_ops.get_mut(key) {
            Some(ids) => {
                ids.retain(|id| records.get(id).is_some_and(|op| op.status.is_active()));
                ids.iter()
                    .filter_map(|id| records.get(id))
                    .map(|op| (op.created_at, op.id))
                    .collect()
            }
            None => Vec::new(),
        };

        if live.is_empty() {
            state.active.remove(key);
            state.entity_ops.remove(key);
            return;
        }
        live.sort();
        let Some(&(_, survivor)) = live.last() else {
            return;
        };
        if live.len() > 1 {
            tracing::error!(entity = %key, live = live.len(), "concurrency violation: multiple live operations");
            state.stats.concurrency_violations += 1;
            for (_, id) in &live[..live.len() - 1] {
                if let Some(op) = state.records.get_mut(id) {
                    op.status = OperationStatus::Merged;
                    op.superseded_by = Some(survivor);
                    op.updated_at = now;
                    events.push(OperationEvent::of(op));
                }
            }
        }
        state.active.insert(key.clone(), survivor);
    }

    fn succeed(&self, state: &mut UpdateState, op_id: OpId, now: Hlc, events: &mut Vec<OperationEvent>) {
        let Some(op) = state.records.get_mut(&op_id) else {
            return;
        };
        op.updated_at = now;

        if op.status == OperationStatus::Merged {
            // Superseded while in flight: the store has this write, the successor governs the overlay
            let op = op.clone();
            let value = confirmed_value(&op);
            set_confirmed(&mut state.confirmed, &op.entity, value.clone());
            if let Some(successor) = Self::live_successor(state, &op)
                && let Some(next) = state.records.get_mut(&successor)
            {
                next.original_payload = value;
            }
            tracing::debug!(%op_id, entity = %op.entity, "superseded operation landed");
            return;
        }

        op.status = OperationStatus::Confirmed;
        op.last_error = None;
        let op = op.clone();
        if state.active.get(&op.entity) == Some(&op_id) {
            state.active.remove(&op.entity);
        }
        if state.overlay.get(&op.entity).is_some_and(|e| e.written_by == op_id) {
            state.overlay.remove(&op.entity);
        }
        set_confirmed(&mut state.confirmed, &op.entity, confirmed_value(&op));
        state.stats.confirmed += 1;
        tracing::info!(%op_id, entity = %op.entity, attempts = op.attempts, "operation confirmed");
        events.push(OperationEvent::of(&op));
    }

    fn fail(
        &self,
        state: &mut UpdateState,
        op_id: OpId,
        error: ExecutionError,
        now: Hlc,
        events: &mut Vec<OperationEvent>,
    ) -> Disposition {
        let max_attempts = self.config.max_attempts();
        let Some(op) = state.records.get_mut(&op_id) else {
            return Disposition::Advance;
        };
        op.updated_at = now;

        if op.status == OperationStatus::Merged {
            op.last_error = Some(error.to_string());
            let op = op.clone();
            tracing::warn!(%op_id, entity = %op.entity, %error, "superseded operation failed");
            self.rebase_successor(state, &op, now, events);
            return Disposition::Advance;
        }

        if op.attempts < max_attempts {
            op.status = OperationStatus::Retrying;
            op.last_error = Some(error.to_string());
            let delay = self.config.backoff(op.attempts);
            tracing::warn!(
                %op_id,
                entity = %op.entity,
                attempts = op.attempts,
                delay_ms = delay.as_millis() as u64,
                %error,
                "operation failed, retrying"
            );
            events.push(OperationEvent::of(op));
            state.stats.retries += 1;
            return Disposition::Retry { delay };
        }

        let exhausted = EngineError::Exhausted {
            attempts: op.attempts,
            last: error,
        };
        op.status = OperationStatus::Failed;
        op.last_error = Some(exhausted.to_string());
        let op = op.clone();
        tracing::error!(%op_id, entity = %op.entity, error = %exhausted, "operation failed permanently");

        if state.active.get(&op.entity) == Some(&op_id) {
            state.active.remove(&op.entity);
        }
        if state.overlay.get(&op.entity).is_some_and(|e| e.written_by == op_id) {
            state.overlay.remove(&op.entity);
        }
        match (&op.original_payload, op.kind) {
            (Some(original), _) => {
                state.confirmed.insert(op.entity.clone(), original.clone());
            }
            (None, OperationKind::Add) => {
                state.confirmed.remove(&op.entity);
            }
            (None, _) => {}
        }
        state.stats.failed += 1;
        events.push(OperationEvent::of(&op));
        Disposition::Advance
    }

    /// The in-flight record `failed` was superseded and its write never
    /// landed; re-derive what its successor still has to do.
    fn rebase_successor(
        &self,
        state: &mut UpdateState,
        failed: &Operation,
        now: Hlc,
        events: &mut Vec<OperationEvent>,
    ) {
        let Some(successor_id) = Self::live_successor(state, failed) else {
            return;
        };
        let Some(successor) = state.records.get_mut(&successor_id) else {
            return;
        };
        match rebase_on_failure(failed.kind, successor.kind) {
            Some(kind) => {
                successor.kind = kind;
                successor.updated_at = now;
            }
            None => {
                successor.status = OperationStatus::Merged;
                successor.updated_at = now;
                let entity = successor.entity.clone();
                events.push(OperationEvent::of(successor));
                if state.active.get(&entity) == Some(&successor_id) {
                    state.active.remove(&entity);
                }
                if state.overlay.get(&entity).is_some_and(|e| e.written_by == successor_id) {
                    state.overlay.remove(&entity);
                }
                tracing::debug!(op_id = %successor_id, %entity, "successor has nothing left to do");
            }
        }
    }
}

impl OperationLedger for LedgerCore {
    fn begin_attempt(&self, op_id: OpId) -> Option<Operation> {
        let mut state = self.state.lock();
        let now = state.clock.advance();
        let op = state.records.get_mut(&op_id)?;
        if !op.status.is_active() {
            return None;
        }
        op.attempts += 1;
        op.last_attempt_at = Some(now);
        op.updated_at = now;
        tracing::debug!(%op_id, entity = %op.entity, attempt = op.attempts, "dispatching");
        let op = op.clone();
        state.executing.insert(op_id);
        Some(op)
    }

    fn finish_attempt(&self, op_id: OpId, outcome: AttemptOutcome) -> Disposition {
        let mut events = Vec::new();
        let disposition = {
            let mut state = self.state.lock();
            let now = state.clock.advance();
            state.executing.remove(&op_id);
            let disposition = match outcome {
                AttemptOutcome::Succeeded => {
                    self.succeed(&mut state, op_id, now, &mut events);
                    Disposition::Advance
                }
                AttemptOutcome::Failed(error) => self.fail(&mut state, op_id, error, now, &mut events),
            };
            if let Some(entity) = state.records.get(&op_id).map(|op| op.entity.clone()) {
                state.touch(&entity);
            }
            disposition
        };
        self.emit(events);
        disposition
    }

    fn is_live(&self, op_id: OpId) -> bool {
        self.state
            .lock()
            .records
            .get(&op_id)
            .is_some_and(|op| op.status.is_active())
    }

    fn prune_settled(&self, retention: Duration) -> usize {
        let mut state = self.state.lock();
        let now_ms = physical_now().unwrap_or_else(|_| state.clock.advance().wall_ms());
        let retention_ms = retention.as_millis() as u64;
        let before = state.records.len();
        state
            .records
            .retain(|_, op| op.status.is_active() || op.updated_at.age_ms(now_ms) < retention_ms);
        let pruned = before - state.records.len();
        let UpdateState { records, entity_ops, .. } = &mut *state;
        entity_ops.retain(|_, ids| {
            ids.retain(|id| records.contains_key(id));
            !ids.is_empty()
        });
        if pruned > 0 {
            tracing::debug!(pruned, "pruned settled operations");
        }
        pruned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::FieldValue;
    use tokio::sync::Semaphore;

    fn key(id: &str) -> EntityKey {
        EntityKey::item(id).unwrap()
    }

    fn episodes(n: i64) -> EntityState {
        EntityState::new().with_field("watched_episodes", n)
    }

    fn episodes_of(state: &Option<EntityState>) -> Option<i64> {
        state
            .as_ref()
            .and_then(|s| s.get("watched_episodes"))
            .and_then(FieldValue::as_integer)
    }

    type CallLog = Arc<Mutex<Vec<(OperationKind, Option<i64>)>>>;

    /// Executor that records every call and answers from `script` in order,
    /// succeeding once the script runs out.
    fn scripted(manager: &OptimisticUpdateManager, script: Vec<bool>) -> CallLog {
        let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
        let script = Arc::new(Mutex::new(script.into_iter()));
        let log = calls.clone();
        manager.set_operation_executor(move |op: Operation| {
            let log = log.clone();
            let answer = script.lock().next().unwrap_or(true);
            async move {
                log.lock().push((op.kind, episodes_of(&op.payload)));
                Ok::<_, ExecutionError>(answer)
            }
        });
        calls
    }

    #[tokio::test]
    async fn submit_requires_an_executor() {
        let manager = OptimisticUpdateManager::new(PipelineConfig::default()).unwrap();
        let result = manager.submit(Intent::add(key("A"), episodes(1)));
        assert!(matches!(result, Err(EngineError::ExecutorNotConfigured)));
        assert!(manager.overlay_entry(&key("A")).is_none());
    }

    #[tokio::test]
    async fn rapid_updates_collapse_into_one_record() {
        let manager = OptimisticUpdateManager::new(PipelineConfig::default()).unwrap();
        let calls = scripted(&manager, vec![]);
        manager.hydrate(key("X"), episodes(0));

        let mut last = None;
        for n in 1..=5 {
            last = Some(
                manager
                    .submit(Intent::update(key("X"), episodes(n), Some(episodes(n - 1))))
                    .unwrap(),
            );
        }
        let status = manager.get_queue_status();
        assert_eq!(status.total_queued, 1);
        assert_eq!(status.queues_by_item[&key("X")], 1);

        let pending = manager.get_pending_operations();
        assert_eq!(pending.len(), 1);
        assert_eq!(Some(pending[0].id), last);
        assert_eq!(episodes_of(&pending[0].original_payload), Some(0));
        assert_eq!(episodes_of(&manager.read(&key("X"))), Some(5));
        assert_eq!(manager.stats().merged_count, 4);

        manager.wait_until_idle().await;
        assert_eq!(*calls.lock(), vec![(OperationKind::Update, Some(5))]);
        assert_eq!(episodes_of(&manager.confirmed_state(&key("X"))), Some(5));
        assert!(manager.overlay_entry(&key("X")).is_none());
    }

    #[tokio::test]
    async fn duplicate_live_records_collapse_to_the_newest() {
        let manager = OptimisticUpdateManager::new(PipelineConfig::default()).unwrap();
        let calls = scripted(&manager, vec![]);
        manager.hydrate(key("X"), episodes(0));
        manager.hydrate(key("Y"), episodes(0));
        manager.submit(Intent::update(key("Y"), episodes(9), Some(episodes(0)))).unwrap();

        let older = Operation::from_intent(Intent::update(key("X"), episodes(1), Some(episodes(0))), Hlc::new(1, 0));
        let newer = Operation::from_intent(Intent::update(key("X"), episodes(2), Some(episodes(0))), Hlc::new(2, 0));
        {
            let mut state = manager.core.state.lock();
            state.insert_record(older.clone());
            state.insert_record(newer.clone());
            state.active.insert(key("X"), older.id);
        }
        manager.queue().enqueue(&older).unwrap();
        manager.queue().enqueue(&newer).unwrap();

        let id = manager.submit(Intent::update(key("X"), episodes(3), Some(episodes(2)))).unwrap();

        assert_eq!(manager.stats().concurrency_violations, 1);
        let older = manager.get_operation(older.id).unwrap();
        assert_eq!(older.status, OperationStatus::Merged);
        assert_eq!(older.superseded_by, Some(newer.id));
        assert_eq!(manager.get_operation(newer.id).unwrap().superseded_by, Some(id));

        let live: Vec<OpId> = manager
            .get_pending_operations()
            .into_iter()
            .filter(|op| op.entity == key("X"))
            .map(|op| op.id)
            .collect();
        assert_eq!(live, vec![id]);
        // the other entity's record is untouched
        assert_eq!(manager.get_pending_operations().len(), 2);

        manager.wait_until_idle().await;
        let x_calls: Vec<_> = calls.lock().iter().filter(|(_, n)| *n != Some(9)).cloned().collect();
        assert_eq!(x_calls, vec![(OperationKind::Update, Some(3))]);
        assert_eq!(episodes_of(&manager.confirmed_state(&key("X"))), Some(3));
        assert_eq!(manager.stats().concurrency_violations, 1);
    }

    #[tokio::test]
    async fn add_then_delete_leaves_nothing_behind() {
        let manager = OptimisticUpdateManager::new(PipelineConfig::default()).unwrap();
        let calls = scripted(&manager, vec![]);

        let add = manager.submit(Intent::add(key("N"), episodes(1))).unwrap();
        let delete = manager.submit(Intent::delete(key("N"), None)).unwrap();
        assert_eq!(add, delete);

        assert_eq!(manager.get_queue_status().total_queued, 0);
        assert!(manager.overlay_entry(&key("N")).is_none());
        assert!(manager.read(&key("N")).is_none());
        assert_eq!(manager.get_operation(add).unwrap().status, OperationStatus::Merged);

        manager.wait_until_idle().await;
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn update_after_pending_delete_is_rejected() {
        let manager = OptimisticUpdateManager::new(PipelineConfig::default()).unwrap();
        scripted(&manager, vec![]);
        manager.hydrate(key("D"), episodes(2));

        manager.submit(Intent::delete(key("D"), Some(episodes(2)))).unwrap();
        let result = manager.submit(Intent::update(key("D"), episodes(3), Some(episodes(2))));
        assert!(matches!(result, Err(EngineError::Validation(_))));
        assert_eq!(
            manager.overlay_entry(&key("D")).map(|e| e.value),
            Some(OverlayValue::Removed)
        );
    }

    #[tokio::test]
    async fn merge_behind_an_in_flight_call_queues_a_follow_up() {
        let manager = OptimisticUpdateManager::new(PipelineConfig::default()).unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(Semaphore::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let (gate, started, seen) = (gate.clone(), started.clone(), seen.clone());
            manager.set_operation_executor(move |op: Operation| {
                let (gate, started, seen) = (gate.clone(), started.clone(), seen.clone());
                async move {
                    started.add_permits(1);
                    let _permit = gate.acquire().await;
                    seen.lock().push(episodes_of(&op.payload));
                    Ok::<_, ExecutionError>(true)
                }
            });
        }
        manager.hydrate(key("X"), episodes(0));

        let first = manager
            .submit(Intent::update(key("X"), episodes(1), Some(episodes(0))))
            .unwrap();
        started.acquire().await.unwrap().forget();
        assert_eq!(manager.queue().in_flight(&key("X")), Some(first));

        let second = manager
            .submit(Intent::update(key("X"), episodes(2), Some(episodes(1))))
            .unwrap();
        assert_ne!(first, second);
        assert_eq!(manager.get_queue_status().queues_by_item[&key("X")], 2);
        assert_eq!(manager.get_operation(first).unwrap().superseded_by, Some(second));

        gate.add_permits(2);
        manager.wait_until_idle().await;

        assert_eq!(*seen.lock(), vec![Some(1), Some(2)]);
        assert_eq!(episodes_of(&manager.confirmed_state(&key("X"))), Some(2));
        assert_eq!(manager.get_operation(second).unwrap().status, OperationStatus::Confirmed);
        // the landed first write became the follow-up's rollback point
        assert_eq!(episodes_of(&manager.get_operation(second).unwrap().original_payload), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_operation_rolls_back() {
        let config = PipelineConfig::default().with_max_attempts(3);
        let manager = OptimisticUpdateManager::new(config).unwrap();
        let calls = scripted(&manager, vec![false; 10]);
        manager.hydrate(key("X"), episodes(4));
        let mut events = manager.subscribe();

        let op_id = manager
            .submit(Intent::update(key("X"), episodes(9), Some(episodes(4))))
            .unwrap();
        assert_eq!(episodes_of(&manager.read(&key("X"))), Some(9));
        manager.wait_until_idle().await;

        assert_eq!(calls.lock().len(), 3);
        let op = manager.get_operation(op_id).unwrap();
        assert_eq!(op.status, OperationStatus::Failed);
        assert_eq!(op.attempts, 3);
        assert!(op.last_error.unwrap().contains("3 attempts"));
        assert!(manager.overlay_entry(&key("X")).is_none());
        assert_eq!(episodes_of(&manager.read(&key("X"))), Some(4));

        let stats = manager.stats();
        assert_eq!((stats.failed, stats.retries), (1, 2));

        let mut statuses = Vec::new();
        while let Ok(event) = events.try_recv() {
            statuses.push(event.status);
        }
        assert_eq!(
            statuses,
            vec![
                OperationStatus::Pending,
                OperationStatus::Retrying,
                OperationStatus::Retrying,
                OperationStatus::Failed
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn failed_add_turns_its_follow_up_into_an_add() {
        let config = PipelineConfig::default().with_max_attempts(1);
        let manager = OptimisticUpdateManager::new(config).unwrap();
        let gate = Arc::new(Semaphore::new(0));
        let started = Arc::new(Semaphore::new(0));
        let seen: CallLog = Arc::new(Mutex::new(Vec::new()));
        {
            let (gate, started, seen) = (gate.clone(), started.clone(), seen.clone());
            manager.set_operation_executor(move |op: Operation| {
                let (gate, started, seen) = (gate.clone(), started.clone(), seen.clone());
                async move {
                    started.add_permits(1);
                    let _permit = gate.acquire().await;
                    let mut seen = seen.lock();
                    seen.push((op.kind, episodes_of(&op.payload)));
                    Ok::<_, ExecutionError>(seen.len() > 1)
                }
            });
        }

        manager.submit(Intent::add(key("A"), episodes(1))).unwrap();
        started.acquire().await.unwrap().forget();
        let follow_up = manager
            .submit(Intent::update(key("A"), episodes(2), None))
            .unwrap();
        assert_eq!(manager.get_operation(follow_up).unwrap().kind, OperationKind::Update);

        gate.add_permits(2);
        manager.wait_until_idle().await;

        assert_eq!(
            *seen.lock(),
            vec![(OperationKind::Add, Some(1)), (OperationKind::Add, Some(2))]
        );
        assert_eq!(manager.get_operation(follow_up).unwrap().status, OperationStatus::Confirmed);
        assert_eq!(episodes_of(&manager.read(&key("A"))), Some(2));
    }

    #[tokio::test]
    async fn cleanup_prunes_settled_records_past_retention() {
        let config = PipelineConfig::default().with_retention(Duration::ZERO);
        let manager = OptimisticUpdateManager::new(config).unwrap();
        scripted(&manager, vec![]);

        let op_id = manager.submit(Intent::add(key("C"), episodes(1))).unwrap();
        manager.wait_until_idle().await;
        assert!(manager.get_operation(op_id).is_some());

        let report = manager.cleanup();
        assert_eq!(report.pruned_records, 1);
        assert!(manager.get_operation(op_id).is_none());
        assert_eq!(episodes_of(&manager.read(&key("C"))), Some(1));
    }
}
