//! Bosun status: a bounded, fixed-cadence readiness wait over either a set
//! of applied objects or a single workload.

#![forbid(unsafe_code)]

use std::time::Duration;

use anyhow::Result;
use bosun_core::{ObjectRef, PollStatus, ReadinessTarget, StatusPoller, WaitOutcome};
use kube::{
    api::Api,
    core::{DynamicObject, GroupVersionKind},
    Client,
};
use serde_json::Value as Json;
use tracing::debug;

/// Cadence and bound for one wait call. Fixed interval, no backoff.
#[derive(Debug, Clone, Copy)]
pub struct WaitConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self { interval: Duration::from_secs(2), timeout: Duration::from_secs(60) }
    }
}

impl WaitConfig {
    /// Defaults with `BOSUN_WAIT_INTERVAL_SECS` / `BOSUN_WAIT_TIMEOUT_SECS`
    /// overrides for operators.
    pub fn from_env() -> Self {
        let interval = std::env::var("BOSUN_WAIT_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(2);
        let timeout = std::env::var("BOSUN_WAIT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(60);
        Self {
            interval: Duration::from_secs(interval),
            timeout: Duration::from_secs(timeout),
        }
    }
}

/// Poll `target` at `cfg.interval` until it is ready, permanently failed, or
/// `cfg.timeout` elapses. A timeout is an outcome, not an error: the target
/// may still converge later.
pub async fn wait(poller: &dyn StatusPoller, target: &ReadinessTarget, cfg: WaitConfig) -> WaitOutcome {
    let deadline = tokio::time::Instant::now() + cfg.timeout;
    loop {
        match poller.check(target).await {
            Ok(PollStatus::Ready) => return WaitOutcome::Ready,
            Ok(PollStatus::Failed(reason)) => return WaitOutcome::Error(reason),
            Ok(PollStatus::Pending) => {
                debug!(target = %target, "readiness poll pending");
            }
            Err(e) => return WaitOutcome::Error(e.to_string()),
        }
        if tokio::time::Instant::now() >= deadline {
            return WaitOutcome::TimedOut;
        }
        tokio::time::sleep(cfg.interval).await;
    }
}

/// Kube-backed poller. Object-set readiness is judged per kind (namespace
/// phase, CRD conditions, workload replica counts, generic Ready condition);
/// workload targets are Deployments judged by their rollout conditions.
pub struct KubeStatusPoller {
    client: Client,
}

impl KubeStatusPoller {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn check_objects(&self, refs: &[ObjectRef]) -> Result<PollStatus> {
        for id in refs {
            let gvk = GroupVersionKind {
                group: id.group.clone(),
                version: id.version.clone(),
                kind: id.kind.clone(),
            };
            let (ar, namespaced) =
                bosun_kubehub::find_api_resource(self.client.clone(), &gvk).await?;
            let api: Api<DynamicObject> = if namespaced {
                match id.namespace.as_deref() {
                    Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                    None => Api::all_with(self.client.clone(), &ar),
                }
            } else {
                Api::all_with(self.client.clone(), &ar)
            };
            let obj = match api.get_opt(&id.name).await? {
                Some(o) => o,
                // Applied but not yet visible through the API
                None => return Ok(PollStatus::Pending),
            };
            let raw = serde_json::to_value(&obj)?;
            match object_status(id, &raw) {
                PollStatus::Ready => {}
                other => return Ok(other),
            }
        }
        Ok(PollStatus::Ready)
    }

    async fn check_workload(&self, namespace: &str, name: &str) -> Result<PollStatus> {
        use k8s_openapi::api::apps::v1::Deployment;

        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let dep = match api.get_opt(name).await? {
            Some(d) => d,
            None => return Ok(PollStatus::Pending),
        };
        let generation = dep.metadata.generation.unwrap_or_default();
        let status = dep.status.unwrap_or_default();
        if status.observed_generation.unwrap_or_default() < generation {
            return Ok(PollStatus::Pending);
        }
        if let Some(conds) = &status.conditions {
            for c in conds {
                if c.type_ == "Progressing"
                    && c.status == "False"
                    && c.reason.as_deref() == Some("ProgressDeadlineExceeded")
                {
                    return Ok(PollStatus::Failed(format!(
                        "deployment {}/{} exceeded its progress deadline",
                        namespace, name
                    )));
                }
            }
            if conds.iter().any(|c| c.type_ == "Available" && c.status == "True") {
                return Ok(PollStatus::Ready);
            }
        }
        Ok(PollStatus::Pending)
    }
}

#[async_trait::async_trait]
impl StatusPoller for KubeStatusPoller {
    async fn check(&self, target: &ReadinessTarget) -> Result<PollStatus> {
        match target {
            ReadinessTarget::Objects(refs) => self.check_objects(refs).await,
            ReadinessTarget::Workload { namespace, name } => {
                self.check_workload(namespace, name).await
            }
        }
    }
}

fn get_i64(v: &Json, path: &[&str]) -> Option<i64> {
    let mut cur = v;
    for seg in path {
        cur = cur.get(seg)?;
    }
    cur.as_i64()
}

fn condition<'a>(v: &'a Json, type_: &str) -> Option<&'a Json> {
    v.get("status")?
        .get("conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_))
}

fn condition_is(v: &Json, type_: &str, expected: &str) -> bool {
    condition(v, type_)
        .and_then(|c| c.get("status"))
        .and_then(|s| s.as_str())
        == Some(expected)
}

/// Reconciliation status of one live object, judged from its raw JSON.
fn object_status(id: &ObjectRef, raw: &Json) -> PollStatus {
    match (id.group.as_str(), id.kind.as_str()) {
        ("", "Namespace") => {
            let phase = raw
                .get("status")
                .and_then(|s| s.get("phase"))
                .and_then(|p| p.as_str());
            if phase == Some("Active") {
                PollStatus::Ready
            } else {
                PollStatus::Pending
            }
        }
        ("apiextensions.k8s.io", "CustomResourceDefinition") => {
            if let Some(c) = condition(raw, "NamesAccepted") {
                if c.get("status").and_then(|s| s.as_str()) == Some("False") {
                    let reason = c
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or("NamesNotAccepted");
                    return PollStatus::Failed(format!("{}: {}", id, reason));
                }
            }
            if condition_is(raw, "Established", "True") {
                PollStatus::Ready
            } else {
                PollStatus::Pending
            }
        }
        ("apps", "Deployment") | ("apps", "StatefulSet") | ("apps", "ReplicaSet") => {
            let want = get_i64(raw, &["spec", "replicas"]).unwrap_or(1);
            let ready = get_i64(raw, &["status", "readyReplicas"]).unwrap_or(0);
            let generation = get_i64(raw, &["metadata", "generation"]).unwrap_or(0);
            let observed = get_i64(raw, &["status", "observedGeneration"]).unwrap_or(0);
            if observed >= generation && ready >= want {
                PollStatus::Ready
            } else {
                PollStatus::Pending
            }
        }
        ("apps", "DaemonSet") => {
            let want = get_i64(raw, &["status", "desiredNumberScheduled"]).unwrap_or(0);
            let ready = get_i64(raw, &["status", "numberReady"]).unwrap_or(0);
            if ready >= want {
                PollStatus::Ready
            } else {
                PollStatus::Pending
            }
        }
        ("batch", "Job") => {
            if let Some(c) = condition(raw, "Failed") {
                if c.get("status").and_then(|s| s.as_str()) == Some("True") {
                    let reason = c.get("reason").and_then(|r| r.as_str()).unwrap_or("JobFailed");
                    return PollStatus::Failed(format!("{}: {}", id, reason));
                }
            }
            if condition_is(raw, "Complete", "True") {
                PollStatus::Ready
            } else {
                PollStatus::Pending
            }
        }
        _ => {
            // Custom resources following the Ready/Stalled convention; plain
            // config objects without status are done once they exist.
            if condition_is(raw, "Stalled", "True") {
                return PollStatus::Failed(format!("{}: stalled", id));
            }
            match condition(raw, "Ready") {
                Some(c) => {
                    if c.get("status").and_then(|s| s.as_str()) == Some("True") {
                        PollStatus::Ready
                    } else {
                        PollStatus::Pending
                    }
                }
                None => PollStatus::Ready,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn obj_ref(group: &str, kind: &str, name: &str) -> ObjectRef {
        ObjectRef {
            group: group.to_string(),
            version: "v1".to_string(),
            kind: kind.to_string(),
            namespace: None,
            name: name.to_string(),
        }
    }

    struct ScriptedPoller {
        polls: AtomicUsize,
        ready_after: Option<usize>,
        fail_with: Option<String>,
    }

    impl ScriptedPoller {
        fn never_ready() -> Self {
            Self { polls: AtomicUsize::new(0), ready_after: None, fail_with: None }
        }
        fn ready_after(n: usize) -> Self {
            Self { polls: AtomicUsize::new(0), ready_after: Some(n), fail_with: None }
        }
        fn failing(reason: &str) -> Self {
            Self {
                polls: AtomicUsize::new(0),
                ready_after: None,
                fail_with: Some(reason.to_string()),
            }
        }
    }

    #[async_trait::async_trait]
    impl StatusPoller for ScriptedPoller {
        async fn check(&self, _target: &ReadinessTarget) -> Result<PollStatus> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst);
            if let Some(reason) = &self.fail_with {
                return Ok(PollStatus::Failed(reason.clone()));
            }
            match self.ready_after {
                Some(limit) if n >= limit => Ok(PollStatus::Ready),
                _ => Ok(PollStatus::Pending),
            }
        }
    }

    fn target() -> ReadinessTarget {
        ReadinessTarget::Objects(vec![obj_ref("", "Namespace", "flux-system")])
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_after_roughly_timeout_over_interval_ticks() {
        let poller = ScriptedPoller::never_ready();
        let cfg = WaitConfig { interval: Duration::from_secs(1), timeout: Duration::from_secs(5) };
        let started = tokio::time::Instant::now();
        let outcome = wait(&poller, &target(), cfg).await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(5), "returned early: {:?}", elapsed);
        let polls = poller.polls.load(Ordering::SeqCst);
        assert!((5..=7).contains(&polls), "polled {} times", polls);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_returns_ready_once_target_converges() {
        let poller = ScriptedPoller::ready_after(3);
        let cfg = WaitConfig { interval: Duration::from_secs(1), timeout: Duration::from_secs(60) };
        assert_eq!(wait(&poller, &target(), cfg).await, WaitOutcome::Ready);
        assert_eq!(poller.polls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_surfaces_permanent_failure_as_error_not_timeout() {
        let poller = ScriptedPoller::failing("crd names rejected");
        let cfg = WaitConfig::default();
        assert_eq!(
            wait(&poller, &target(), cfg).await,
            WaitOutcome::Error("crd names rejected".to_string())
        );
        assert_eq!(poller.polls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn namespace_status_follows_phase() {
        let id = obj_ref("", "Namespace", "flux-system");
        let active = serde_json::json!({"status": {"phase": "Active"}});
        let terminating = serde_json::json!({"status": {"phase": "Terminating"}});
        assert_eq!(object_status(&id, &active), PollStatus::Ready);
        assert_eq!(object_status(&id, &terminating), PollStatus::Pending);
    }

    #[test]
    fn crd_status_follows_established_and_names_accepted() {
        let id = obj_ref("apiextensions.k8s.io", "CustomResourceDefinition", "widgets.example.io");
        let established = serde_json::json!({
            "status": {"conditions": [{"type": "Established", "status": "True"}]}
        });
        let rejected = serde_json::json!({
            "status": {"conditions": [
                {"type": "NamesAccepted", "status": "False", "reason": "Conflict"}
            ]}
        });
        assert_eq!(object_status(&id, &established), PollStatus::Ready);
        assert!(matches!(object_status(&id, &rejected), PollStatus::Failed(_)));
    }

    #[test]
    fn workload_status_counts_ready_replicas() {
        let id = ObjectRef {
            group: "apps".to_string(),
            version: "v1".to_string(),
            kind: "Deployment".to_string(),
            namespace: Some("flux-system".to_string()),
            name: "source-controller".to_string(),
        };
        let rolling = serde_json::json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 2, "readyReplicas": 1}
        });
        let done = serde_json::json!({
            "metadata": {"generation": 2},
            "spec": {"replicas": 2},
            "status": {"observedGeneration": 2, "readyReplicas": 2}
        });
        assert_eq!(object_status(&id, &rolling), PollStatus::Pending);
        assert_eq!(object_status(&id, &done), PollStatus::Ready);
    }

    #[test]
    fn statusless_objects_are_ready_once_present() {
        let id = obj_ref("", "ConfigMap", "app-config");
        let raw = serde_json::json!({"data": {"k": "v"}});
        assert_eq!(object_status(&id, &raw), PollStatus::Ready);
    }
}
