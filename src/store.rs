//! Request store
//!
//! Holds every data request with the state its reconciler owns: status, plan,
//! decision snapshot, recorded deployments and retry counters. Reconciles
//! work on a cloned view and write back through `commit`, which rejects the
//! write if the request changed underneath them.

use crate::controller::backoff::RetryState;
use crate::controller::diff::DeploymentRecord;
use crate::error::{conflict_error, not_found_error, ApiResult, ControlError, ControlResult};
use crate::models::{
    AssetId, DataRequest, DatasetRequest, DecisionSnapshot, Plan, RequestKey, RequestPhase,
    RequestStatus,
};
use crate::modules::ModuleHandle;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::info;

/// Snapshot of one request and its controller-owned state
#[derive(Debug, Clone)]
pub struct RequestEntry {
    pub request: DataRequest,
    pub status: RequestStatus,
    pub plan: Option<Plan>,
    pub decisions: Option<DecisionSnapshot>,
    /// Bumped whenever decisions are invalidated
    pub decision_epoch: u64,
    /// `decision_epoch` the stored snapshot was fetched under
    pub decisions_fetched_epoch: u64,
    pub deployments: BTreeMap<AssetId, DeploymentRecord>,
    /// Releases whose deploy call was issued but not yet recorded
    pub pending_releases: BTreeSet<ModuleHandle>,
    pub retry: RetryState,
    pub deletion_requested: bool,
}

impl RequestEntry {
    fn new(request: DataRequest) -> Self {
        Self {
            request,
            status: RequestStatus::initializing(),
            plan: None,
            decisions: None,
            decision_epoch: 0,
            decisions_fetched_epoch: 0,
            deployments: BTreeMap::new(),
            pending_releases: BTreeSet::new(),
            retry: RetryState::default(),
            deletion_requested: false,
        }
    }

    pub fn key(&self) -> RequestKey {
        self.request.key()
    }
}

/// Result of one reconcile, written back atomically
#[derive(Debug, Clone)]
pub struct ReconcileCommit {
    pub status: RequestStatus,
    pub plan: Option<Plan>,
    pub decisions: Option<DecisionSnapshot>,
    pub decisions_fetched_epoch: u64,
    pub retry: RetryState,
}

struct Slot {
    entry: RequestEntry,
    cancel: watch::Sender<bool>,
}

#[derive(Clone, Default)]
pub struct RequestStore {
    slots: Arc<RwLock<HashMap<RequestKey, Slot>>>,
}

impl RequestStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create(&self, request: DataRequest) -> ApiResult<RequestEntry> {
        let key = request.key();
        let mut slots = self.slots.write().await;
        if slots.contains_key(&key) {
            return Err(conflict_error(format!("Data request {} already exists", key)));
        }

        let entry = RequestEntry::new(request);
        let (cancel, _) = watch::channel(false);
        slots.insert(
            key.clone(),
            Slot {
                entry: entry.clone(),
                cancel,
            },
        );

        info!(request = %key, uid = %entry.request.uid, "Data request created");
        Ok(entry)
    }

    pub async fn get(&self, key: &RequestKey) -> Option<RequestEntry> {
        self.slots.read().await.get(key).map(|s| s.entry.clone())
    }

    /// All requests, ordered by namespace then name
    pub async fn list(&self) -> Vec<RequestEntry> {
        let slots = self.slots.read().await;
        let mut entries: Vec<RequestEntry> = slots.values().map(|s| s.entry.clone()).collect();
        entries.sort_by_key(|e| e.key());
        entries
    }

    pub async fn keys(&self) -> Vec<RequestKey> {
        let mut keys: Vec<RequestKey> = self.slots.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Replace the datasets of a request. Bumps the generation and drops the
    /// current plan so the next reconcile recompiles from fresh decisions.
    pub async fn update_spec(
        &self,
        key: &RequestKey,
        datasets: Vec<DatasetRequest>,
    ) -> ApiResult<RequestEntry> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| not_found_error(format!("Data request {} not found", key)))?;
        if slot.entry.deletion_requested {
            return Err(conflict_error(format!("Data request {} is terminating", key)));
        }

        let entry = &mut slot.entry;
        entry.request.datasets = datasets;
        entry.request.generation += 1;
        entry.plan = None;

        info!(request = %key, generation = entry.request.generation, "Data request datasets replaced");
        Ok(entry.clone())
    }

    /// Mark a request for deletion and cancel its in-flight reconcile
    pub async fn request_deletion(&self, key: &RequestKey) -> ApiResult<RequestEntry> {
        let mut slots = self.slots.write().await;
        let slot = slots
            .get_mut(key)
            .ok_or_else(|| not_found_error(format!("Data request {} not found", key)))?;

        slot.entry.deletion_requested = true;
        slot.entry.status.transition(RequestPhase::Terminating);
        slot.cancel.send_replace(true);

        info!(request = %key, "Data request deletion requested");
        Ok(slot.entry.clone())
    }

    /// Receiver that flips to `true` once deletion is requested
    pub async fn cancellation(&self, key: &RequestKey) -> Option<watch::Receiver<bool>> {
        self.slots.read().await.get(key).map(|s| s.cancel.subscribe())
    }

    /// Mark every decision snapshot stale. Returns the affected keys.
    pub async fn invalidate_decisions(&self) -> Vec<RequestKey> {
        let mut slots = self.slots.write().await;
        let mut keys = Vec::with_capacity(slots.len());
        for (key, slot) in slots.iter_mut() {
            slot.entry.decision_epoch += 1;
            keys.push(key.clone());
        }
        keys.sort();
        keys
    }

    /// Note a release about to be deployed. Must happen before the deploy
    /// call so finalization sees it even if the reconcile is dropped mid-call.
    pub async fn note_pending_release(&self, key: &RequestKey, handle: ModuleHandle) {
        if let Some(slot) = self.slots.write().await.get_mut(key) {
            slot.entry.pending_releases.insert(handle);
        }
    }

    pub async fn clear_pending_release(&self, key: &RequestKey, handle: &ModuleHandle) {
        if let Some(slot) = self.slots.write().await.get_mut(key) {
            slot.entry.pending_releases.remove(handle);
        }
    }

    /// Record a live deployment. Written through immediately so teardown can
    /// find it even if the surrounding reconcile is later rejected.
    pub async fn record_deployment(&self, key: &RequestKey, asset_id: AssetId, record: DeploymentRecord) {
        if let Some(slot) = self.slots.write().await.get_mut(key) {
            slot.entry.pending_releases.remove(&record.handle);
            slot.entry.deployments.insert(asset_id, record);
        }
    }

    pub async fn forget_deployment(&self, key: &RequestKey, asset_id: &AssetId) {
        if let Some(slot) = self.slots.write().await.get_mut(key) {
            slot.entry.deployments.remove(asset_id);
        }
    }

    /// Write back a reconcile computed for `generation`
    pub async fn commit(
        &self,
        key: &RequestKey,
        generation: u64,
        commit: ReconcileCommit,
    ) -> ControlResult<()> {
        let mut slots = self.slots.write().await;
        let slot = slots.get_mut(key).ok_or_else(|| {
            ControlError::DeploymentConflict(format!("request {} was removed", key))
        })?;

        let entry = &mut slot.entry;
        if entry.deletion_requested {
            return Err(ControlError::DeploymentConflict(format!(
                "request {} is terminating",
                key
            )));
        }
        if entry.request.generation != generation {
            return Err(ControlError::DeploymentConflict(format!(
                "request {} moved to generation {} while generation {} was reconciled",
                key, entry.request.generation, generation
            )));
        }

        let mut status = commit.status;
        status.observed_generation = generation;
        entry.status = status;
        entry.plan = commit.plan;
        entry.decisions = commit.decisions;
        entry.decisions_fetched_epoch = commit.decisions_fetched_epoch;
        entry.retry = commit.retry;
        Ok(())
    }

    pub async fn remove(&self, key: &RequestKey) -> Option<RequestEntry> {
        let removed = self.slots.write().await.remove(key).map(|s| s.entry);
        if removed.is_some() {
            info!(request = %key, "Data request removed");
        }
        removed
    }
}
