//! Per-request reconcile tick
//!
//! One tick: fetch the full decision snapshot if stale, compile, diff the plan
//! against recorded deployments and apply the difference, poll module health,
//! rebuild asset states and the request phase, then commit. Every step is
//! desired-state diffing, so a tick with unchanged inputs changes nothing.

use crate::compiler::{AssetVerdict, CompileOutcome, CompilePolicy, PlanCompiler};
use crate::controller::backoff::{Backoff, RetryState};
use crate::controller::diff::{DeploymentChange, DeploymentRecord, DiffEngine};
use crate::error::{ControlError, ControlResult};
use crate::governance::DecisionClient;
use crate::models::{
    AssetId, AssetPhase, AssetState, DecisionSnapshot, Endpoint, FlowStep, Plan, RequestKey,
    RequestPhase, RequestStatus,
};
use crate::modules::{ModuleHandle, ModuleRuntime};
use crate::status::{aggregate_phase, summarize};
use crate::store::{ReconcileCommit, RequestEntry, RequestStore};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub backoff: Backoff,
    /// Consecutive incomplete decision snapshots before the request fails
    pub retry_budget: u32,
    /// Consecutive unhealthy polls before an asset fails
    pub module_ready_budget: u32,
    /// Snapshot age after which decisions are fetched again
    pub decision_refresh: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Requeue(Duration),
    /// Nothing pending; the periodic resync will look again
    Settled,
    Removed,
}

pub struct Reconciler {
    store: RequestStore,
    decisions: DecisionClient,
    compiler: PlanCompiler,
    runtime: Arc<dyn ModuleRuntime>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        store: RequestStore,
        decisions: DecisionClient,
        compiler: PlanCompiler,
        runtime: Arc<dyn ModuleRuntime>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            decisions,
            compiler,
            runtime,
            config,
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn reconcile(&self, key: &RequestKey) -> ControlResult<TickOutcome> {
        let Some(entry) = self.store.get(key).await else {
            debug!("Request no longer exists");
            return Ok(TickOutcome::Removed);
        };
        if entry.deletion_requested {
            return self.finalize(key, &entry).await;
        }

        let generation = entry.request.generation;
        let mut deployed = entry.deployments.clone();
        let mut teardown_pending = self.prune_removed_assets(key, &entry, &mut deployed).await;

        let mut status = entry.status.clone();
        let mut retry = entry.retry.clone();
        status.transition(match status.phase {
            RequestPhase::Initializing => RequestPhase::PlanPending,
            phase => phase,
        });

        let mut decisions = entry.decisions.clone();
        let mut fetched_epoch = entry.decisions_fetched_epoch;
        let mut refresh_failure: Option<(ControlError, u32)> = None;

        if self.decisions_stale(&entry) {
            let snapshot = self.decisions.snapshot(&entry.request).await;
            match snapshot.transient_error().cloned() {
                None => {
                    retry.decisions_recovered();
                    decisions = Some(snapshot);
                    fetched_epoch = entry.decision_epoch;
                }
                Some(err) => {
                    let attempts = retry.note_decision_failure();
                    warn!(attempts, budget = self.config.retry_budget, "Decision snapshot incomplete: {}", err);

                    if attempts > self.config.retry_budget {
                        status.transition(RequestPhase::Failed);
                        status.message = Some(format!(
                            "Retry budget exhausted after {} attempts: {}",
                            attempts, err
                        ));
                        self.commit(key, generation, status, entry.plan.clone(), decisions, fetched_epoch, retry)
                            .await?;
                        return Ok(TickOutcome::Settled);
                    }

                    if entry.plan.is_none() {
                        status.transition(RequestPhase::PlanPending);
                        status.asset_states = pending_states(&entry, &snapshot);
                        status.message = Some(format!("Waiting for governance decisions: {}", err));
                        self.commit(key, generation, status, None, decisions, fetched_epoch, retry)
                            .await?;
                        return Ok(TickOutcome::Requeue(self.config.backoff.delay(attempts)));
                    }

                    refresh_failure = Some((err, attempts));
                }
            }
        }

        let Some(snapshot) = decisions.as_ref() else {
            return Err(ControlError::DecisionUnavailable(
                "no decision snapshot available".to_string(),
            ));
        };

        let outcome = self.compiler.compile(&entry.request, snapshot)?;
        status.generated_plan_ref = Some(outcome.plan.reference());
        if status.phase == RequestPhase::PlanPending {
            status.transition(RequestPhase::Deploying);
        }

        let (apply_errors, apply_teardown_pending) = self
            .apply(key, &outcome.plan, &entry.pending_releases, &mut deployed)
            .await;
        teardown_pending |= apply_teardown_pending;

        let mut states = BTreeMap::new();
        for dataset in &entry.request.datasets {
            let asset_id = &dataset.asset_id;
            let state = self
                .observe(asset_id, &outcome, &deployed, &apply_errors, &mut retry)
                .await;
            states.insert(asset_id.clone(), state);
        }
        retry
            .unhealthy_polls
            .retain(|asset_id, _| outcome.plan.step(asset_id).is_some());
        status.asset_states = states;

        let all_or_nothing = self.compiler.options().policy == CompilePolicy::AllOrNothing;
        let phase = if outcome.request_failure.is_some() {
            RequestPhase::Failed
        } else {
            aggregate_phase(status.asset_states.values(), all_or_nothing)
        };
        status.transition(phase);
        status.message = Some(match (&outcome.request_failure, &refresh_failure) {
            (Some(failure), _) => failure.clone(),
            (None, Some((err, _))) => format!("Decision refresh failed, serving current plan: {}", err),
            (None, None) => summarize(&status),
        });

        let waiting = status
            .asset_states
            .values()
            .any(|a| a.phase.in_progress() && outcome.plan.step(&a.asset_id).is_some());
        let requeue = match refresh_failure {
            Some((_, attempts)) => Some(self.config.backoff.delay(attempts)),
            None if waiting || teardown_pending => {
                Some(self.config.backoff.delay(retry.worst_streak().max(1)))
            }
            None => None,
        };

        info!(
            phase = ?status.phase,
            generation,
            plan_digest = %outcome.plan.digest,
            "Reconciled"
        );

        self.commit(key, generation, status, Some(outcome.plan), decisions, fetched_epoch, retry)
            .await?;
        Ok(requeue.map_or(TickOutcome::Settled, TickOutcome::Requeue))
    }

    fn decisions_stale(&self, entry: &RequestEntry) -> bool {
        match &entry.decisions {
            None => true,
            Some(snapshot) => {
                snapshot.generation != entry.request.generation
                    || entry.decisions_fetched_epoch != entry.decision_epoch
                    || !snapshot.is_complete()
                    || snapshot.age().to_std().unwrap_or_default() >= self.config.decision_refresh
            }
        }
    }

    /// Tear down deployments of assets no longer in the request. Needs no
    /// decisions, so it runs even while the governance engine is down.
    async fn prune_removed_assets(
        &self,
        key: &RequestKey,
        entry: &RequestEntry,
        deployed: &mut BTreeMap<AssetId, DeploymentRecord>,
    ) -> bool {
        let requested: BTreeSet<&AssetId> = entry.request.asset_ids().collect();
        let removed: Vec<(AssetId, ModuleHandle)> = deployed
            .iter()
            .filter(|(asset_id, _)| !requested.contains(asset_id))
            .map(|(asset_id, record)| (asset_id.clone(), record.handle.clone()))
            .collect();

        let mut teardown_pending = false;
        for (asset_id, handle) in removed {
            match self.runtime.teardown(&handle).await {
                Ok(()) => {
                    info!(asset = %asset_id, release = %handle, "Removed asset torn down");
                    deployed.remove(&asset_id);
                    self.store.forget_deployment(key, &asset_id).await;
                }
                Err(e) => {
                    warn!(release = %handle, "Teardown of removed asset failed: {}", e);
                    teardown_pending = true;
                }
            }
        }
        teardown_pending
    }

    /// Apply the plan/deployment diff. Returns per-asset deploy failures and
    /// whether any obsolete release is still waiting to be torn down.
    async fn apply(
        &self,
        key: &RequestKey,
        plan: &Plan,
        pending: &BTreeSet<ModuleHandle>,
        deployed: &mut BTreeMap<AssetId, DeploymentRecord>,
    ) -> (BTreeMap<AssetId, ControlError>, bool) {
        let diff = DiffEngine::diff(plan, deployed);
        let mut errors = BTreeMap::new();
        let mut teardown_pending = false;

        if !diff.is_noop() {
            info!(
                created = diff.summary.created,
                updated = diff.summary.updated,
                deleted = diff.summary.deleted,
                "Applying deployment diff"
            );
        }

        for change in diff.changes {
            match change {
                DeploymentChange::Unchanged(_) => {}
                DeploymentChange::Create(step) => {
                    if let Err(e) = self.deploy(key, &step, None, deployed).await {
                        errors.insert(step.asset_id.clone(), e);
                    }
                }
                DeploymentChange::Update { step, previous } => {
                    if let Err(e) = self.deploy(key, &step, Some(previous), deployed).await {
                        errors.insert(step.asset_id.clone(), e);
                    }
                }
                DeploymentChange::Delete { asset_id, handle } => {
                    match self.runtime.teardown(&handle).await {
                        Ok(()) => {
                            deployed.remove(&asset_id);
                            self.store.forget_deployment(key, &asset_id).await;
                        }
                        Err(e) => {
                            warn!(release = %handle, "Teardown of obsolete release failed: {}", e);
                            teardown_pending = true;
                        }
                    }
                }
            }
        }

        // Deploys that never got recorded and are no longer wanted
        let wanted: BTreeSet<ModuleHandle> = plan
            .flow_steps
            .iter()
            .map(ModuleHandle::for_step)
            .chain(deployed.values().map(|r| r.handle.clone()))
            .collect();
        for handle in pending.difference(&wanted) {
            match self.runtime.teardown(handle).await {
                Ok(()) => self.store.clear_pending_release(key, handle).await,
                Err(e) => {
                    warn!(release = %handle, "Teardown of unrecorded release failed: {}", e);
                    teardown_pending = true;
                }
            }
        }

        (errors, teardown_pending)
    }

    async fn deploy(
        &self,
        key: &RequestKey,
        step: &FlowStep,
        previous: Option<ModuleHandle>,
        deployed: &mut BTreeMap<AssetId, DeploymentRecord>,
    ) -> ControlResult<()> {
        let intended = ModuleHandle::for_step(step);
        self.store.note_pending_release(key, intended.clone()).await;

        let handle = self.runtime.deploy(step).await?;
        if handle != intended {
            self.store.clear_pending_release(key, &intended).await;
        }
        let record = DeploymentRecord::new(handle.clone(), step);
        deployed.insert(step.asset_id.clone(), record.clone());
        self.store
            .record_deployment(key, step.asset_id.clone(), record)
            .await;

        if let Some(previous) = previous.filter(|p| *p != handle) {
            if let Err(e) = self.runtime.teardown(&previous).await {
                warn!(release = %previous, "Teardown of replaced release failed: {}", e);
            }
        }
        Ok(())
    }

    async fn observe(
        &self,
        asset_id: &AssetId,
        outcome: &CompileOutcome,
        deployed: &BTreeMap<AssetId, DeploymentRecord>,
        apply_errors: &BTreeMap<AssetId, ControlError>,
        retry: &mut RetryState,
    ) -> AssetState {
        match outcome.verdict(asset_id) {
            None => return AssetState::pending(asset_id),
            Some(AssetVerdict::Denied { decision_id }) => {
                return AssetState::denied(asset_id, decision_id)
            }
            Some(AssetVerdict::Failed { error }) => return AssetState::failed(asset_id, error),
            Some(AssetVerdict::Planned { .. }) => {}
        }

        if outcome.plan.step(asset_id).is_none() {
            let message = outcome
                .request_failure
                .as_deref()
                .unwrap_or("request failed");
            return AssetState::blocked(asset_id, message);
        }

        let health = match (apply_errors.get(asset_id), deployed.get(asset_id)) {
            (Some(err), _) => Err(err.clone()),
            (None, None) => Err(ControlError::ModuleRuntime(format!(
                "no deployment recorded for {}",
                asset_id
            ))),
            (None, Some(record)) => self.poll(&record.handle).await,
        };

        match health {
            Ok(endpoint) => {
                retry.note_healthy(asset_id);
                AssetState::ready(asset_id, endpoint)
            }
            Err(err) => {
                let streak = retry.note_unhealthy(asset_id);
                if streak > self.config.module_ready_budget {
                    warn!(asset = %asset_id, streak, "Module did not become ready: {}", err);
                    AssetState::failed(asset_id, &err)
                } else {
                    AssetState::waiting(asset_id, AssetPhase::Deploying, &err)
                }
            }
        }
    }

    async fn poll(&self, handle: &ModuleHandle) -> ControlResult<Endpoint> {
        let health = self.runtime.health(handle).await?;
        if !health.healthy {
            return Err(ControlError::ModuleUnhealthy(
                health
                    .message
                    .unwrap_or_else(|| format!("release {} is not ready", handle)),
            ));
        }
        health.endpoint.ok_or_else(|| {
            ControlError::ModuleUnhealthy(format!("release {} exposes no endpoint", handle))
        })
    }

    /// Tear down everything the request deployed, then drop its state
    async fn finalize(&self, key: &RequestKey, entry: &RequestEntry) -> ControlResult<TickOutcome> {
        let mut handles: BTreeMap<ModuleHandle, Option<AssetId>> = BTreeMap::new();
        for (asset_id, record) in &entry.deployments {
            handles.insert(record.handle.clone(), Some(asset_id.clone()));
        }
        if let Some(plan) = &entry.plan {
            for step in &plan.flow_steps {
                handles.entry(ModuleHandle::for_step(step)).or_insert(None);
            }
        }
        for handle in &entry.pending_releases {
            handles.entry(handle.clone()).or_insert(None);
        }

        let mut first_error = None;
        for (handle, asset_id) in handles {
            match self.runtime.teardown(&handle).await {
                Ok(()) => {
                    if let Some(asset_id) = asset_id {
                        self.store.forget_deployment(key, &asset_id).await;
                    }
                }
                Err(e) => {
                    warn!(release = %handle, "Teardown failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        self.store.remove(key).await;
        Ok(TickOutcome::Removed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn commit(
        &self,
        key: &RequestKey,
        generation: u64,
        status: RequestStatus,
        plan: Option<Plan>,
        decisions: Option<DecisionSnapshot>,
        decisions_fetched_epoch: u64,
        retry: RetryState,
    ) -> ControlResult<()> {
        self.store
            .commit(
                key,
                generation,
                ReconcileCommit {
                    status,
                    plan,
                    decisions,
                    decisions_fetched_epoch,
                    retry,
                },
            )
            .await
    }
}

/// Asset states while the decision snapshot is incomplete
fn pending_states(entry: &RequestEntry, snapshot: &DecisionSnapshot) -> BTreeMap<AssetId, AssetState> {
    entry
        .request
        .datasets
        .iter()
        .map(|d| {
            let state = match snapshot.outcomes.get(&d.asset_id) {
                Some(Err(e)) if e.is_retryable() => {
                    AssetState::waiting(&d.asset_id, AssetPhase::Pending, e)
                }
                _ => AssetState::pending(&d.asset_id),
            };
            (d.asset_id.clone(), state)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::CompileOptions;
    use crate::governance::MockPolicyManager;
    use crate::models::{
        ActionType, ConditionStatus, CreateDataRequest, DataRequest, DatasetRequest,
        READY_CONDITION_INDEX,
    };
    use crate::modules::local::REDACTED_PLACEHOLDER;
    use crate::modules::{LocalModuleRuntime, ModuleCatalog};
    use crate::status::StatusReporter;
    use serde_json::json;

    struct Harness {
        store: RequestStore,
        mock: Arc<MockPolicyManager>,
        runtime: Arc<LocalModuleRuntime>,
        reconciler: Reconciler,
    }

    fn config() -> ReconcileConfig {
        ReconcileConfig {
            backoff: Backoff::new(Duration::from_millis(10), Duration::from_millis(100)),
            retry_budget: 3,
            module_ready_budget: 2,
            decision_refresh: Duration::from_secs(60),
        }
    }

    fn harness(policy: CompilePolicy, ready_after: u32) -> Harness {
        let catalog = Arc::new(ModuleCatalog::builtin());
        let store = RequestStore::new();
        let mock = Arc::new(MockPolicyManager::new());
        let runtime = Arc::new(LocalModuleRuntime::new(Arc::clone(&catalog), ready_after));
        let reconciler = Reconciler::new(
            store.clone(),
            DecisionClient::new(mock.clone(), Duration::from_secs(1)),
            PlanCompiler::new(
                catalog,
                CompileOptions {
                    policy,
                    fail_on_deny: false,
                    modules_namespace: "fybrik-blueprints".into(),
                },
            ),
            runtime.clone(),
            config(),
        );
        Harness {
            store,
            mock,
            runtime,
            reconciler,
        }
    }

    fn datasets(assets: &[(&str, ActionType)]) -> Vec<DatasetRequest> {
        assets
            .iter()
            .map(|(id, action)| DatasetRequest {
                asset_id: AssetId::new(*id),
                requested_action_type: *action,
                destination: "theshire".into(),
                processing_location: "theshire".into(),
            })
            .collect()
    }

    async fn create(h: &Harness, name: &str, assets: &[(&str, ActionType)]) -> RequestKey {
        let request = DataRequest::from_create(CreateDataRequest {
            name: name.into(),
            namespace: "default".into(),
            credentials: None,
            datasets: datasets(assets),
        });
        h.store.create(request).await.unwrap().key()
    }

    async fn tick(h: &Harness, key: &RequestKey) -> TickOutcome {
        h.reconciler.reconcile(key).await.unwrap()
    }

    async fn phase(h: &Harness, key: &RequestKey) -> RequestPhase {
        h.store.get(key).await.unwrap().status.phase
    }

    async fn asset_phase(h: &Harness, key: &RequestKey, asset: &str) -> AssetPhase {
        h.store.get(key).await.unwrap().status.asset_states[&AssetId::new(asset)].phase
    }

    #[tokio::test]
    async fn test_reaches_ready_within_bounded_ticks() {
        let h = harness(CompilePolicy::Partial, 1);
        let key = create(&h, "nb", &[("s3/allow-dataset", ActionType::Read)]).await;

        assert!(matches!(tick(&h, &key).await, TickOutcome::Requeue(_)));
        assert_eq!(phase(&h, &key).await, RequestPhase::Deploying);

        assert_eq!(tick(&h, &key).await, TickOutcome::Settled);
        let entry = h.store.get(&key).await.unwrap();
        assert_eq!(entry.status.phase, RequestPhase::Ready);
        assert_eq!(entry.status.observed_generation, 1);

        let state = &entry.status.asset_states[&AssetId::new("s3/allow-dataset")];
        assert_eq!(state.conditions[READY_CONDITION_INDEX].status, ConditionStatus::True);
        let step = entry.plan.as_ref().unwrap().step(&state.asset_id).unwrap();
        assert!(step.module_config.is_passthrough());
        assert_eq!(
            state.endpoint.as_ref().unwrap().hostname,
            format!("{}.fybrik-blueprints", step.endpoint_ref.name)
        );
        assert!(StatusReporter::report(&entry.status).ready);
    }

    #[tokio::test]
    async fn test_denied_asset_gives_partially_ready() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(
            &h,
            "nb",
            &[("s3/allow-dataset", ActionType::Read), ("s3/deny-dataset", ActionType::Read)],
        )
        .await;

        assert_eq!(tick(&h, &key).await, TickOutcome::Settled);
        let entry = h.store.get(&key).await.unwrap();
        assert_eq!(entry.status.phase, RequestPhase::PartiallyReady);
        assert_eq!(asset_phase(&h, &key, "s3/deny-dataset").await, AssetPhase::Denied);
        assert!(entry.plan.unwrap().step(&AssetId::new("s3/deny-dataset")).is_none());
        assert_eq!(h.runtime.release_count().await, 1);
        assert!(StatusReporter::report(&entry.status).ready);
    }

    #[tokio::test]
    async fn test_redacted_stream_masks_ssn() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(&h, "nb", &[("s3/customers", ActionType::Read)]).await;
        tick(&h, &key).await;

        let entry = h.store.get(&key).await.unwrap();
        assert_eq!(entry.status.phase, RequestPhase::Ready);
        let step = entry.plan.unwrap().flow_steps[0].clone();
        assert_eq!(
            step.module_config.redacted_columns().into_iter().collect::<Vec<_>>(),
            vec!["SSN".to_string()]
        );

        let rows = vec![json!({"SSN": "123", "name": "bilbo"}).as_object().cloned().unwrap()];
        let out = h
            .runtime
            .read_through(&ModuleHandle::for_step(&step), rows)
            .await
            .unwrap();
        assert_eq!(out[0]["SSN"], REDACTED_PLACEHOLDER);
        assert_eq!(out[0]["name"], "bilbo");
    }

    #[tokio::test]
    async fn test_write_only_deny() {
        let h = harness(CompilePolicy::Partial, 0);
        let writer = create(&h, "writer", &[("s3/deny-write", ActionType::Write)]).await;
        let reader = create(&h, "reader", &[("s3/deny-write", ActionType::Read)]).await;
        tick(&h, &writer).await;
        tick(&h, &reader).await;

        assert_eq!(asset_phase(&h, &writer, "s3/deny-write").await, AssetPhase::Denied);
        assert_eq!(asset_phase(&h, &reader, "s3/deny-write").await, AssetPhase::Ready);
        assert_eq!(phase(&h, &reader).await, RequestPhase::Ready);
    }

    #[tokio::test]
    async fn test_recovers_when_governance_returns() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(&h, "nb", &[("s3/allow-dataset", ActionType::Read)]).await;

        h.mock.set_unreachable(true);
        assert!(matches!(tick(&h, &key).await, TickOutcome::Requeue(_)));
        assert!(matches!(tick(&h, &key).await, TickOutcome::Requeue(_)));
        assert_eq!(phase(&h, &key).await, RequestPhase::PlanPending);
        assert_eq!(h.runtime.deploy_count(), 0);
        assert_eq!(asset_phase(&h, &key, "s3/allow-dataset").await, AssetPhase::Pending);

        h.mock.set_unreachable(false);
        tick(&h, &key).await;
        let entry = h.store.get(&key).await.unwrap();
        assert_eq!(entry.status.phase, RequestPhase::Ready);
        assert_eq!(entry.retry.decision_failures, 0);
    }

    #[tokio::test]
    async fn test_retry_budget_exhaustion_fails_request() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(&h, "nb", &[("s3/allow-dataset", ActionType::Read)]).await;
        h.mock.set_unreachable(true);

        for _ in 0..3 {
            assert!(matches!(tick(&h, &key).await, TickOutcome::Requeue(_)));
        }
        assert_eq!(tick(&h, &key).await, TickOutcome::Settled);
        assert_eq!(phase(&h, &key).await, RequestPhase::Failed);

        h.mock.set_unreachable(false);
        tick(&h, &key).await;
        assert_eq!(phase(&h, &key).await, RequestPhase::Ready);
    }

    #[tokio::test]
    async fn test_retick_is_idempotent() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(
            &h,
            "nb",
            &[("s3/allow-dataset", ActionType::Read), ("s3/customers", ActionType::Read)],
        )
        .await;
        tick(&h, &key).await;
        let before = h.store.get(&key).await.unwrap();
        let deploys = h.runtime.deploy_count();
        let queries = h.mock.calls();

        assert_eq!(tick(&h, &key).await, TickOutcome::Settled);
        let after = h.store.get(&key).await.unwrap();

        assert_eq!(h.runtime.deploy_count(), deploys);
        assert_eq!(h.mock.calls(), queries);
        assert_eq!(before.status, after.status);
        assert_eq!(before.plan, after.plan);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_current_plan() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(&h, "nb", &[("s3/allow-dataset", ActionType::Read)]).await;
        tick(&h, &key).await;
        let deploys = h.runtime.deploy_count();

        h.store.invalidate_decisions().await;
        h.mock.set_unreachable(true);
        assert!(matches!(tick(&h, &key).await, TickOutcome::Requeue(_)));

        let entry = h.store.get(&key).await.unwrap();
        assert_eq!(entry.status.phase, RequestPhase::Ready);
        assert!(entry.status.message.unwrap().contains("refresh"));
        assert_eq!(h.runtime.deploy_count(), deploys);
        assert_eq!(h.runtime.release_count().await, 1);

        h.mock.set_unreachable(false);
        assert_eq!(tick(&h, &key).await, TickOutcome::Settled);
    }

    #[tokio::test]
    async fn test_policy_change_redeploys_with_new_config() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(&h, "nb", &[("s3/allow-dataset", ActionType::Read)]).await;
        tick(&h, &key).await;

        h.mock
            .set_override("allow-dataset", json!([{"action": {"type": "Redact", "columns": ["email"]}}]))
            .await;
        h.store.invalidate_decisions().await;
        tick(&h, &key).await;

        let entry = h.store.get(&key).await.unwrap();
        let step = &entry.plan.unwrap().flow_steps[0];
        let deployed = h.runtime.deployed_step(&ModuleHandle::for_step(step)).await.unwrap();
        assert_eq!(deployed.module_config.redacted_columns().len(), 1);
        assert_eq!(h.runtime.deploy_count(), 2);
        assert_eq!(h.runtime.release_count().await, 1);
    }

    #[tokio::test]
    async fn test_spec_edit_replaces_deployments() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(&h, "nb", &[("s3/allow-dataset", ActionType::Read)]).await;
        tick(&h, &key).await;

        h.store
            .update_spec(&key, datasets(&[("s3/customers", ActionType::Read)]))
            .await
            .unwrap();
        tick(&h, &key).await;

        let entry = h.store.get(&key).await.unwrap();
        assert_eq!(entry.status.observed_generation, 2);
        assert_eq!(entry.status.phase, RequestPhase::Ready);
        assert_eq!(entry.deployments.len(), 1);
        assert!(entry.deployments.contains_key(&AssetId::new("s3/customers")));
        assert_eq!(h.runtime.teardown_count(), 1);
        assert_eq!(h.runtime.release_count().await, 1);
    }

    #[tokio::test]
    async fn test_removed_asset_torn_down_while_governance_is_down() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(&h, "nb", &[("s3/allow-dataset", ActionType::Read)]).await;
        tick(&h, &key).await;
        assert_eq!(phase(&h, &key).await, RequestPhase::Ready);

        h.store
            .update_spec(&key, datasets(&[("s3/customers", ActionType::Read)]))
            .await
            .unwrap();
        h.mock.set_unreachable(true);

        assert!(matches!(tick(&h, &key).await, TickOutcome::Requeue(_)));
        assert_eq!(h.runtime.release_count().await, 0);
        for _ in 0..4 {
            tick(&h, &key).await;
        }

        let entry = h.store.get(&key).await.unwrap();
        assert_eq!(entry.status.phase, RequestPhase::Failed);
        assert!(entry.deployments.is_empty());
        assert_eq!(h.runtime.release_count().await, 0);
    }

    #[tokio::test]
    async fn test_recorded_deploy_clears_pending_release() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(&h, "nb", &[("s3/allow-dataset", ActionType::Read)]).await;
        tick(&h, &key).await;

        let entry = h.store.get(&key).await.unwrap();
        assert_eq!(entry.deployments.len(), 1);
        assert!(entry.pending_releases.is_empty());
    }

    #[tokio::test]
    async fn test_deletion_tears_down_and_removes() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(
            &h,
            "nb",
            &[("s3/allow-dataset", ActionType::Read), ("s3/customers", ActionType::Read)],
        )
        .await;
        tick(&h, &key).await;
        assert_eq!(h.runtime.release_count().await, 2);

        h.store.request_deletion(&key).await.unwrap();
        assert_eq!(tick(&h, &key).await, TickOutcome::Removed);
        assert!(h.store.get(&key).await.is_none());
        assert_eq!(h.runtime.release_count().await, 0);
        assert_eq!(tick(&h, &key).await, TickOutcome::Removed);
    }

    #[tokio::test]
    async fn test_unhealthy_module_fails_then_recovers() {
        let h = harness(CompilePolicy::Partial, 0);
        let key = create(&h, "nb", &[("s3/allow-dataset", ActionType::Read)]).await;
        tick(&h, &key).await;
        let release = h.store.get(&key).await.unwrap().plan.unwrap().flow_steps[0]
            .endpoint_ref
            .name
            .clone();

        h.runtime.set_failing(&release, true).await;
        assert!(matches!(tick(&h, &key).await, TickOutcome::Requeue(_)));
        assert_eq!(phase(&h, &key).await, RequestPhase::Deploying);
        tick(&h, &key).await;
        assert_eq!(tick(&h, &key).await, TickOutcome::Settled);
        assert_eq!(asset_phase(&h, &key, "s3/allow-dataset").await, AssetPhase::Failed);
        assert_eq!(phase(&h, &key).await, RequestPhase::Failed);

        h.runtime.set_failing(&release, false).await;
        tick(&h, &key).await;
        assert_eq!(phase(&h, &key).await, RequestPhase::Ready);
    }

    #[tokio::test]
    async fn test_unserviceable_asset_does_not_block_others() {
        let h = harness(CompilePolicy::Partial, 0);
        h.mock
            .set_override("vault", json!([{"action": {"type": "Custom", "name": "encrypt"}}]))
            .await;
        let key = create(
            &h,
            "nb",
            &[("s3/vault", ActionType::Read), ("s3/allow-dataset", ActionType::Read)],
        )
        .await;
        tick(&h, &key).await;

        let entry = h.store.get(&key).await.unwrap();
        assert_eq!(entry.status.phase, RequestPhase::PartiallyReady);
        let vault = &entry.status.asset_states[&AssetId::new("s3/vault")];
        assert_eq!(vault.phase, AssetPhase::Failed);
        assert!(vault.reason().unwrap().starts_with("NoCapableModule"));
        assert_eq!(asset_phase(&h, &key, "s3/allow-dataset").await, AssetPhase::Ready);
    }

    #[tokio::test]
    async fn test_all_or_nothing_fails_whole_request() {
        let h = harness(CompilePolicy::AllOrNothing, 0);
        h.mock.set_raw_response("broken", json!({"result": []})).await;
        let key = create(
            &h,
            "nb",
            &[("s3/broken", ActionType::Read), ("s3/allow-dataset", ActionType::Read)],
        )
        .await;

        assert_eq!(tick(&h, &key).await, TickOutcome::Settled);
        let entry = h.store.get(&key).await.unwrap();
        assert_eq!(entry.status.phase, RequestPhase::Failed);
        assert!(entry.plan.unwrap().is_empty());
        assert_eq!(h.runtime.deploy_count(), 0);
        assert_eq!(
            entry.status.asset_states[&AssetId::new("s3/broken")].phase,
            AssetPhase::Failed
        );
    }
}
