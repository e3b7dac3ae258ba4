use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tandem_core::{EntityKey, OpId, Operation, OperationKind};
use tandem_engine::{ExecutionError, ExecutionFuture, OperationExecutor, StoreHandle};
use tandem_storage::SqliteStorage;
use tokio::sync::{watch, Semaphore};

/// Scripted misbehaviour for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The next `n` calls return `Err`.
    FailTimes(u32),
    /// The next `n` calls return `Ok(false)`.
    RejectTimes(u32),
    AlwaysFail,
    Panic,
    /// Never completes.
    Hang,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallEvent {
    Started {
        op_id: OpId,
        entity: EntityKey,
        kind: OperationKind,
        attempt: u32,
    },
    Finished {
        op_id: OpId,
        entity: EntityKey,
        succeeded: bool,
    },
}

#[derive(Default)]
struct Tracking {
    log: Vec<CallEvent>,
    running: HashMap<EntityKey, usize>,
    max_overlap: HashMap<EntityKey, usize>,
}

struct ExecutorInner {
    store: StoreHandle<SqliteStorage>,
    faults: Mutex<HashMap<EntityKey, Fault>>,
    gates: Mutex<HashMap<EntityKey, Arc<Semaphore>>>,
    tracking: Mutex<Tracking>,
    started_tx: watch::Sender<usize>,
}

/// Executor that applies operations to a sqlite-backed store, with per-entity
/// faults, gates that hold calls until released, and a call log.
#[derive(Clone)]
pub struct ScriptedExecutor {
    inner: Arc<ExecutorInner>,
}

/// Tracks one running call; dropped on completion, panic or abort.
struct Running {
    inner: Arc<ExecutorInner>,
    entity: EntityKey,
}

impl Drop for Running {
    fn drop(&mut self) {
        let mut tracking = self.inner.tracking.lock();
        if let Some(count) = tracking.running.get_mut(&self.entity) {
            *count = count.saturating_sub(1);
        }
    }
}

impl ScriptedExecutor {
    pub fn new(store: StoreHandle<SqliteStorage>) -> Self {
        let (started_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(ExecutorInner {
                store,
                faults: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                tracking: Mutex::new(Tracking::default()),
                started_tx,
            }),
        }
    }

    pub fn store(&self) -> &StoreHandle<SqliteStorage> {
        &self.inner.store
    }

    pub fn set_fault(&self, entity: &EntityKey, fault: Fault) {
        self.inner.faults.lock().insert(entity.clone(), fault);
    }

    pub fn clear_fault(&self, entity: &EntityKey) {
        self.inner.faults.lock().remove(entity);
    }

    /// Calls for `entity` block until `release` lets them through.
    pub fn hold(&self, entity: &EntityKey) {
        self.inner
            .gates
            .lock()
            .entry(entity.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(0)));
    }

    /// Let `calls` held calls for `entity` proceed.
    pub fn release(&self, entity: &EntityKey, calls: usize) {
        if let Some(gate) = self.inner.gates.lock().get(entity) {
            gate.add_permits(calls);
        }
    }

    /// Remove the gate for `entity`, freeing every held call.
    pub fn open(&self, entity: &EntityKey) {
        if let Some(gate) = self.inner.gates.lock().remove(entity) {
            gate.close();
        }
    }

    pub fn calls(&self) -> Vec<CallEvent> {
        self.inner.tracking.lock().log.clone()
    }

    /// Operations whose call started for `entity`, in start order.
    pub fn started_for(&self, entity: &EntityKey) -> Vec<(OpId, OperationKind)> {
        self.inner
            .tracking
            .lock()
            .log
            .iter()
            .filter_map(|event| match event {
                CallEvent::Started { op_id, entity: e, kind, .. } if e == entity => Some((*op_id, *kind)),
                _ => None,
            })
            .collect()
    }

    pub fn started_count(&self) -> usize {
        *self.inner.started_tx.borrow()
    }

    /// Highest number of simultaneous calls ever observed for `entity`.
    pub fn max_overlap(&self, entity: &EntityKey) -> usize {
        self.inner
            .tracking
            .lock()
            .max_overlap
            .get(entity)
            .copied()
            .unwrap_or(0)
    }

    /// Resolves once at least `count` calls have started.
    pub async fn wait_for_calls(&self, count: usize) {
        let mut rx = self.inner.started_tx.subscribe();
        let _ = rx.wait_for(|started| *started >= count).await;
    }
}

impl ExecutorInner {
    fn start(self: &Arc<Self>, operation: &Operation) -> Running {
        let entity = operation.entity.clone();
        {
            let mut tracking = self.tracking.lock();
            let running = tracking.running.entry(entity.clone()).or_insert(0);
            *running += 1;
            let running = *running;
            let overlap = tracking.max_overlap.entry(entity.clone()).or_insert(0);
            *overlap = (*overlap).max(running);
            tracking.log.push(CallEvent::Started {
                op_id: operation.id,
                entity: entity.clone(),
                kind: operation.kind,
                attempt: operation.attempts,
            });
        }
        self.started_tx.send_modify(|started| *started += 1);
        Running {
            inner: Arc::clone(self),
            entity,
        }
    }

    fn next_fault(&self, entity: &EntityKey) -> Option<Fault> {
        let mut faults = self.faults.lock();
        let fault = faults.get(entity).copied()?;
        match fault {
            Fault::FailTimes(n) | Fault::RejectTimes(n) if n <= 1 => {
                faults.remove(entity);
            }
            Fault::FailTimes(n) => {
                faults.insert(entity.clone(), Fault::FailTimes(n - 1));
            }
            Fault::RejectTimes(n) => {
                faults.insert(entity.clone(), Fault::RejectTimes(n - 1));
            }
            Fault::AlwaysFail | Fault::Panic | Fault::Hang => {}
        }
        match fault {
            Fault::FailTimes(0) | Fault::RejectTimes(0) => None,
            other => Some(other),
        }
    }

    async fn call(self: Arc<Self>, operation: Operation) -> Result<bool, ExecutionError> {
        let _running = self.start(&operation);

        let gate = self.gates.lock().get(&operation.entity).cloned();
        if let Some(gate) = gate {
            // A closed gate lets everything through
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }

        let result = match self.next_fault(&operation.entity) {
            Some(Fault::FailTimes(_) | Fault::AlwaysFail) => {
                Err(ExecutionError::Failed(format!("scripted failure for {}", operation.entity)))
            }
            Some(Fault::RejectTimes(_)) => Ok(false),
            Some(Fault::Panic) => panic!("scripted panic for {}", operation.entity),
            Some(Fault::Hang) => std::future::pending().await,
            None => self.store.apply(&operation).await,
        };

        self.tracking.lock().log.push(CallEvent::Finished {
            op_id: operation.id,
            entity: operation.entity.clone(),
            succeeded: matches!(result, Ok(true)),
        });
        result
    }
}

impl OperationExecutor for ScriptedExecutor {
    fn execute(&self, operation: Operation) -> ExecutionFuture {
        Box::pin(Arc::clone(&self.inner).call(operation))
    }
}
