//! Bosun public API façade (in-process).
//!
//! One entry point drives a whole run: guard the target cluster, make sure
//! the control-plane baseline exists, reconcile the manifest batch in
//! stages, and confirm every baseline component is still available.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::Arc;

use bosun_apply::StagedApplier;
use bosun_core::{
    BosunError, BosunResult, ChangeSet, InstallOptions, ManifestSource, ObjectStore,
    ReadinessTarget, ResourceObject, StatusPoller, WaitOutcome,
};
use bosun_status::WaitConfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use bosun_core::prelude::*;
pub use bosun_kubehub::ClusterIdentity;

/// Progression of one run. No state is re-entrant; a retry starts over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    GuardChecked,
    BaselineVerified,
    StagedApplyComplete,
    Done,
    Failed,
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunPhase::Init => write!(f, "init"),
            RunPhase::GuardChecked => write!(f, "guard-checked"),
            RunPhase::BaselineVerified => write!(f, "baseline-verified"),
            RunPhase::StagedApplyComplete => write!(f, "staged-apply-complete"),
            RunPhase::Done => write!(f, "done"),
            RunPhase::Failed => write!(f, "failed"),
        }
    }
}

/// Everything a run needs, passed in explicitly. No process-global state.
#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    /// Context name allowed to receive mutations even when the guard's
    /// local-cluster heuristics do not recognize it.
    pub allow_context: Option<String>,
    pub install: InstallOptions,
}

pub struct Orchestrator {
    store: Arc<dyn ObjectStore>,
    poller: Arc<dyn StatusPoller>,
    manifests: Arc<dyn ManifestSource>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        poller: Arc<dyn StatusPoller>,
        manifests: Arc<dyn ManifestSource>,
        config: OrchestratorConfig,
    ) -> Self {
        Self { store, poller, manifests, config }
    }

    /// Standalone pre-check: would `run` accept this cluster?
    pub fn is_safe(&self, identity: &ClusterIdentity) -> bool {
        bosun_kubehub::is_safe_context(&identity.context, self.config.allow_context.as_deref())
    }

    /// Drive one full run against the cluster. Halts at the first fatal
    /// error; change-set progress already applied is not undone.
    pub async fn run(
        &self,
        identity: &ClusterIdentity,
        batch: Vec<ResourceObject>,
        cancel: &CancellationToken,
    ) -> BosunResult<ChangeSet> {
        match self.run_inner(identity, batch, cancel).await {
            Ok(cs) => Ok(cs),
            Err(e) => {
                error!(phase = %RunPhase::Failed, context = %identity, error = %e, "run failed");
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        identity: &ClusterIdentity,
        batch: Vec<ResourceObject>,
        cancel: &CancellationToken,
    ) -> BosunResult<ChangeSet> {
        let mut phase = RunPhase::Init;
        info!(phase = %phase, context = %identity, "starting run");

        if !self.is_safe(identity) {
            return Err(BosunError::UnsafeCluster { context: identity.context.clone() });
        }
        phase = RunPhase::GuardChecked;
        info!(phase = %phase, context = %identity, "cluster allowed");
        ensure_live(cancel, phase)?;

        match bosun_bootstrap::detect(self.store.as_ref()).await? {
            Some(version) => {
                info!(phase = %phase, version = %version, "baseline already present");
            }
            None => {
                info!(phase = %phase, "baseline not found, installing");
                bosun_bootstrap::install(
                    self.store.clone(),
                    self.poller.clone(),
                    self.manifests.as_ref(),
                    &self.config.install,
                    cancel,
                )
                .await?;
            }
        }
        phase = RunPhase::BaselineVerified;
        info!(phase = %phase, "baseline verified");
        ensure_live(cancel, phase)?;

        let applier = StagedApplier::new(self.store.clone(), self.poller.clone());
        let change_set = applier.apply(batch, cancel).await?;

        // Each known component checked in turn; the first failure halts the
        // run and names the component.
        let wait_cfg = WaitConfig { timeout: self.config.install.timeout, ..WaitConfig::from_env() };
        for component in self.config.install.all_components() {
            ensure_live(cancel, phase)?;
            let target = ReadinessTarget::Workload {
                namespace: self.config.install.namespace.clone(),
                name: component.clone(),
            };
            info!(phase = %phase, component = %component, "checking component availability");
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(BosunError::Cancelled { phase: phase.to_string() })
                }
                outcome = bosun_status::wait(self.poller.as_ref(), &target, wait_cfg) => outcome,
            };
            match outcome {
                WaitOutcome::Ready => {}
                WaitOutcome::TimedOut => {
                    return Err(BosunError::ReadinessTimedOut {
                        target: target.to_string(),
                        timeout: wait_cfg.timeout,
                    })
                }
                WaitOutcome::Error(reason) => {
                    return Err(BosunError::ReadinessError {
                        target: target.to_string(),
                        reason,
                    })
                }
            }
        }
        phase = RunPhase::StagedApplyComplete;
        info!(phase = %phase, entries = change_set.len(), "batch reconciled");

        phase = RunPhase::Done;
        info!(phase = %phase, "run complete");
        Ok(change_set)
    }
}

fn ensure_live(cancel: &CancellationToken, phase: RunPhase) -> BosunResult<()> {
    if cancel.is_cancelled() {
        Err(BosunError::Cancelled { phase: phase.to_string() })
    } else {
        Ok(())
    }
}
