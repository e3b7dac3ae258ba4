//! Reconciliation of the local overlay and confirmed view against an
//! authoritative snapshot.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tandem_core::{EntityKey, EntityState, FieldDiff, Hlc, HlcClock, Intent};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{OrphanPolicy, ValidatorConfig};
use crate::error::EngineError;
use crate::manager::{LocalEntity, OptimisticUpdateManager};
use crate::overlay::{OverlayEntry, OverlayValue};

pub type Snapshot = BTreeMap<EntityKey, EntityState>;
pub type SnapshotFuture = Pin<Box<dyn Future<Output = Result<Snapshot, EngineError>> + Send>>;

/// Produces the authoritative view of every entity.
pub trait SnapshotSource: Send + Sync {
    fn fetch_snapshot(&self) -> SnapshotFuture;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceKind {
    /// An overlay entry that no pending or retrying operation backs.
    OrphanedOverlay,
    /// Confirmed local state differs from the store.
    RemoteDrift,
}

impl DivergenceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OrphanedOverlay => "orphaned_overlay",
            Self::RemoteDrift => "remote_drift",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub entity: EntityKey,
    pub kind: DivergenceKind,
    pub description: String,
    pub fields: Vec<FieldDiff>,
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.entity, self.kind.as_str(), self.description)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyReport {
    pub timestamp: Hlc,
    pub total_checked: usize,
    pub inconsistent_items: Vec<Divergence>,
    pub fixed_count: usize,
    pub errors: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.inconsistent_items.is_empty()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.inconsistent_items.iter().any(|d| d.entity == *key)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValidationStats {
    pub total_validations: u64,
    pub average_inconsistencies: f64,
    pub total_fixed: u64,
    pub last_validation_time: Option<Hlc>,
    pub is_validating: bool,
}

#[derive(Default)]
struct Totals {
    validations: u64,
    inconsistencies: u64,
    fixed: u64,
    last: Option<Hlc>,
}

/// Result of one repair attempt.
enum Repair {
    Fixed,
    /// The entity changed locally after the pass observed it.
    Stale,
    Failed(String),
}

struct ValidatorInner {
    manager: OptimisticUpdateManager,
    source: Arc<dyn SnapshotSource>,
    config: ValidatorConfig,
    validating: AtomicBool,
    totals: Mutex<Totals>,
    clock: Mutex<HlcClock>,
}

/// Clears the single-flight flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[derive(Clone)]
pub struct DataConsistencyValidator {
    inner: Arc<ValidatorInner>,
}

impl DataConsistencyValidator {
    pub fn new(
        manager: OptimisticUpdateManager,
        source: impl SnapshotSource + 'static,
        config: ValidatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(ValidatorInner {
                manager,
                source: Arc::new(source),
                config,
                validating: AtomicBool::new(false),
                totals: Mutex::new(Totals::default()),
                clock: Mutex::new(HlcClock::new()),
            }),
        }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.inner.config
    }

    /// Run one reconciliation pass.
    ///
    /// Entities with a live operation are skipped; their divergence is
    /// expected until the operation settles. The local view is taken before
    /// the snapshot is fetched, and an entity that changes locally in the
    /// meantime is skipped as well. Repair failures are collected
    /// into the report and do not stop the pass. Fails with
    /// `ValidationInProgress` if another pass is running, or with the
    /// source's error if the snapshot cannot be fetched.
    pub async fn validate_consistency(&self) -> Result<ConsistencyReport, EngineError> {
        let inner = &self.inner;
        if inner
            .validating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(EngineError::ValidationInProgress);
        }
        let _guard = PassGuard(&inner.validating);

        let locals = inner.manager.local_view();
        let snapshot = inner.source.fetch_snapshot().await?;
        let timestamp = inner.clock.lock().advance();

        let mut report = ConsistencyReport {
            timestamp,
            total_checked: 0,
            inconsistent_items: Vec::new(),
            fixed_count: 0,
            errors: Vec::new(),
        };

        for local in locals {
            if local.live_op.is_some() {
                continue;
            }
            report.total_checked += 1;
            let remote = snapshot.get(&local.key);
            match &local.overlay {
                Some(entry) => self.reconcile_orphan(&local, entry, remote, &mut report),
                None => self.reconcile_confirmed(&local, remote, &mut report),
            }
        }

        {
            let mut totals = inner.totals.lock();
            totals.validations += 1;
            totals.inconsistencies += report.inconsistent_items.len() as u64;
            totals.fixed += report.fixed_count as u64;
            totals.last = Some(report.timestamp);
        }
        tracing::info!(
            checked = report.total_checked,
            inconsistent = report.inconsistent_items.len(),
            fixed = report.fixed_count,
            errors = report.errors.len(),
            "consistency validation finished"
        );
        Ok(report)
    }

    fn reconcile_orphan(
        &self,
        local: &LocalEntity,
        entry: &OverlayEntry,
        remote: Option<&EntityState>,
        report: &mut ConsistencyReport,
    ) {
        let fields = match (entry.value.state(), remote) {
            (Some(local_state), Some(remote)) => local_state.diff(remote),
            _ => Vec::new(),
        };
        let divergence = Divergence {
            entity: local.key.clone(),
            kind: DivergenceKind::OrphanedOverlay,
            description: format!(
                "overlay value {} has no live operation (remote {})",
                entry.value.as_str(),
                if remote.is_some() { "present" } else { "absent" }
            ),
            fields,
        };

        let agrees = match (&entry.value, remote) {
            (OverlayValue::Present(state), Some(remote)) => state == remote,
            (OverlayValue::Removed, None) => true,
            _ => false,
        };
        let repair = match self.inner.config.orphan_policy {
            OrphanPolicy::TrustLocal if !agrees => self.resubmit(local, &entry.value, remote),
            _ if self.inner.manager.discard_orphan(local, remote) => Repair::Fixed,
            _ => Repair::Stale,
        };
        self.record(divergence, repair, report);
    }

    fn reconcile_confirmed(
        &self,
        local: &LocalEntity,
        remote: Option<&EntityState>,
        report: &mut ConsistencyReport,
    ) {
        let Some(confirmed) = &local.confirmed else {
            return;
        };
        let divergence = match remote {
            None => Divergence {
                entity: local.key.clone(),
                kind: DivergenceKind::RemoteDrift,
                description: "deleted remotely".to_string(),
                fields: Vec::new(),
            },
            Some(remote) => {
                let fields = confirmed.diff(remote);
                if fields.is_empty() {
                    return;
                }
                Divergence {
                    entity: local.key.clone(),
                    kind: DivergenceKind::RemoteDrift,
                    description: format!("{} field(s) changed remotely", fields.len()),
                    fields,
                }
            }
        };
        let repair = if self.inner.manager.adopt_remote(local, remote) {
            Repair::Fixed
        } else {
            Repair::Stale
        };
        self.record(divergence, repair, report);
    }

    /// Push the local value back through the normal submit path, unless the
    /// entity changed since it was observed.
    fn resubmit(&self, local: &LocalEntity, value: &OverlayValue, remote: Option<&EntityState>) -> Repair {
        let key = &local.key;
        let intent = match (value, remote) {
            (OverlayValue::Present(state), Some(remote)) => {
                Intent::update(key.clone(), state.clone(), Some(remote.clone()))
            }
            (OverlayValue::Present(state), None) => Intent::add(key.clone(), state.clone()),
            (OverlayValue::Removed, remote) => Intent::delete(key.clone(), remote.cloned()),
        };
        match self.inner.manager.submit_if_unchanged(local, intent) {
            Ok(Some(op_id)) => {
                tracing::debug!(entity = %key, %op_id, "orphaned overlay resubmitted");
                Repair::Fixed
            }
            Ok(None) => Repair::Stale,
            Err(e) => Repair::Failed(format!("{key}: {e}")),
        }
    }

    fn record(&self, divergence: Divergence, repair: Repair, report: &mut ConsistencyReport) {
        match repair {
            Repair::Fixed => report.fixed_count += 1,
            Repair::Stale => {
                tracing::debug!(entity = %divergence.entity, "changed locally during validation, skipped");
                return;
            }
            Repair::Failed(error) => {
                tracing::warn!(entity = %divergence.entity, %error, "repair failed");
                report.errors.push(error);
            }
        }
        tracing::warn!(%divergence, fields = divergence.fields.len(), "divergence found");
        report.inconsistent_items.push(divergence);
    }

    pub fn get_validation_stats(&self) -> ValidationStats {
        let totals = self.inner.totals.lock();
        let average_inconsistencies = if totals.validations == 0 {
            0.0
        } else {
            totals.inconsistencies as f64 / totals.validations as f64
        };
        ValidationStats {
            total_validations: totals.validations,
            average_inconsistencies,
            total_fixed: totals.fixed,
            last_validation_time: totals.last,
            is_validating: self.inner.validating.load(Ordering::Acquire),
        }
    }

    /// Run passes every `interval` on the manager's runtime until the
    /// returned handle is stopped or dropped. The first pass runs after one
    /// full interval.
    pub fn spawn_schedule(&self, interval: Duration) -> ValidationSchedule {
        let trigger = Arc::new(Notify::new());
        let validator = self.clone();
        let wake = trigger.clone();
        let task = self.inner.manager.runtime().spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                match validator.validate_consistency().await {
                    Ok(_) => {}
                    Err(EngineError::ValidationInProgress) => {
                        tracing::debug!("validation already running, pass skipped");
                    }
                    Err(error) => tracing::warn!(%error, "scheduled validation failed"),
                }
            }
        });
        ValidationSchedule { trigger, task }
    }

    /// `spawn_schedule` with the configured interval.
    pub fn start(&self) -> ValidationSchedule {
        self.spawn_schedule(self.inner.config.interval)
    }
}

/// Handle to a running validation schedule. Dropping it stops the loop.
pub struct ValidationSchedule {
    trigger: Arc<Notify>,
    task: JoinHandle<()>,
}

impl ValidationSchedule {
    /// Request a pass now instead of waiting for the next tick.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ValidationSchedule {
    fn drop(&mut self) {
        self.task.abort();
    }
}
