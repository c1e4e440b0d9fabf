#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use bosun_apply::StagedApplier;
use bosun_core::{
    Action, BosunError, ChangeSetEntry, ObjectClass, ObjectStore, PollStatus, ReadinessTarget,
    ResourceObject, Selector, StatusPoller,
};
use bosun_status::WaitConfig;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
struct Recorder {
    events: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    fn push(&self, event: impl Into<String>) {
        self.events.lock().unwrap().push(event.into());
    }

    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

struct FakeStore {
    rec: Recorder,
    action: Action,
    fail_stage: Option<ObjectClass>,
}

impl FakeStore {
    fn new(rec: Recorder) -> Self {
        Self { rec, action: Action::Created, fail_stage: None }
    }

    fn reporting(rec: Recorder, action: Action) -> Self {
        Self { rec, action, fail_stage: None }
    }

    fn failing_on(rec: Recorder, stage: ObjectClass) -> Self {
        Self { rec, action: Action::Created, fail_stage: Some(stage) }
    }
}

#[async_trait::async_trait]
impl ObjectStore for FakeStore {
    async fn list(&self, _selector: &Selector) -> Result<Vec<ResourceObject>> {
        self.rec.push("list");
        Ok(Vec::new())
    }

    async fn set_defaults(&self, _batch: &mut [ResourceObject]) -> Result<()> {
        self.rec.push("defaults");
        Ok(())
    }

    async fn apply(&self, batch: &[ResourceObject]) -> Result<Vec<ChangeSetEntry>> {
        // Stage batches are homogeneous by construction
        let stage = batch[0].class();
        self.rec.push(format!("apply:{}", stage));
        if self.fail_stage == Some(stage) {
            return Err(anyhow!("injected {} failure", stage));
        }
        Ok(batch
            .iter()
            .map(|o| ChangeSetEntry { subject: o.id.clone(), action: self.action, class: o.class() })
            .collect())
    }
}

struct FakePoller {
    rec: Recorder,
    pending_polls: usize,
    polls: AtomicUsize,
    cancel_on_first_poll: Option<CancellationToken>,
}

impl FakePoller {
    fn ready_after(rec: Recorder, pending_polls: usize) -> Self {
        Self { rec, pending_polls, polls: AtomicUsize::new(0), cancel_on_first_poll: None }
    }

    fn never_ready(rec: Recorder) -> Self {
        Self::ready_after(rec, usize::MAX)
    }
}

#[async_trait::async_trait]
impl StatusPoller for FakePoller {
    async fn check(&self, _target: &ReadinessTarget) -> Result<PollStatus> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = &self.cancel_on_first_poll {
            token.cancel();
        }
        if n < self.pending_polls {
            self.rec.push("poll:pending");
            Ok(PollStatus::Pending)
        } else {
            self.rec.push("poll:ready");
            Ok(PollStatus::Ready)
        }
    }
}

fn obj(json: serde_json::Value) -> ResourceObject {
    ResourceObject::from_value(json).unwrap()
}

fn namespace(name: &str) -> ResourceObject {
    obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {"name": name},
    }))
}

fn config_map(name: &str) -> ResourceObject {
    obj(serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": name, "namespace": "flux-system"},
        "data": {"k": "v"},
    }))
}

fn deployment(name: &str) -> ResourceObject {
    obj(serde_json::json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {"name": name, "namespace": "flux-system"},
        "spec": {"replicas": 1},
    }))
}

fn applier(store: FakeStore, poller: FakePoller) -> StagedApplier {
    StagedApplier::new(Arc::new(store), Arc::new(poller))
}

#[tokio::test]
async fn empty_batch_is_malformed_and_touches_nothing() {
    let rec = Recorder::default();
    let applier = applier(FakeStore::new(rec.clone()), FakePoller::ready_after(rec.clone(), 0));

    let err = applier.apply(Vec::new(), &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, BosunError::MalformedInput(_)), "got {:?}", err);
    assert!(rec.events().is_empty(), "store was touched: {:?}", rec.events());
}

#[tokio::test]
async fn duplicate_identities_are_rejected_before_any_store_call() {
    let rec = Recorder::default();
    let applier = applier(FakeStore::new(rec.clone()), FakePoller::ready_after(rec.clone(), 0));

    let batch = vec![config_map("app-config"), config_map("app-config")];
    let err = applier.apply(batch, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, BosunError::MalformedInput(_)), "got {:?}", err);
    assert!(rec.events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dependent_stage_never_starts_before_barrier_reports_ready() {
    let rec = Recorder::default();
    let applier = applier(FakeStore::new(rec.clone()), FakePoller::ready_after(rec.clone(), 3));

    let batch = vec![config_map("app-config"), namespace("flux-system"), deployment("web")];
    let cs = applier.apply(batch, &CancellationToken::new()).await.unwrap();

    assert_eq!(cs.len(), 3);
    // Stage one entries come first regardless of input order
    assert_eq!(cs.entries[0].subject.kind, "Namespace");
    assert_eq!(cs.entries[0].class, ObjectClass::Definitional);

    let events = rec.events();
    assert_eq!(events[0], "defaults");
    assert_eq!(events[1], "apply:definitional");
    let ready = rec.position("poll:ready").expect("barrier never became ready");
    let dependent = rec.position("apply:dependent").expect("stage two never ran");
    assert!(ready < dependent, "stage two ran before readiness: {:?}", events);
    assert_eq!(events.iter().filter(|e| *e == "poll:pending").count(), 3);
}

#[tokio::test(start_paused = true)]
async fn barrier_runs_even_without_definitional_objects() {
    let rec = Recorder::default();
    let applier = applier(FakeStore::new(rec.clone()), FakePoller::ready_after(rec.clone(), 0));

    let cs = applier
        .apply(vec![config_map("app-config")], &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(cs.len(), 1);

    let events = rec.events();
    assert_eq!(events, vec!["defaults", "poll:ready", "apply:dependent"]);
}

#[tokio::test]
async fn converged_batch_yields_only_unchanged_entries() {
    let rec = Recorder::default();
    let store = FakeStore::reporting(rec.clone(), Action::Unchanged);
    let applier = applier(store, FakePoller::ready_after(rec.clone(), 0));

    let batch = vec![namespace("flux-system"), config_map("app-config")];
    let cs = applier.apply(batch, &CancellationToken::new()).await.unwrap();
    assert_eq!(cs.len(), 2);
    assert!(cs.iter().all(|e| e.action == Action::Unchanged));
}

#[tokio::test(start_paused = true)]
async fn barrier_timeout_aborts_before_stage_two() {
    let rec = Recorder::default();
    let applier = applier(FakeStore::new(rec.clone()), FakePoller::never_ready(rec.clone()))
        .with_wait_config(WaitConfig {
            interval: Duration::from_secs(1),
            timeout: Duration::from_secs(3),
        });

    let batch = vec![namespace("flux-system"), config_map("app-config")];
    let err = applier.apply(batch, &CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, BosunError::ReadinessTimedOut { .. }), "got {:?}", err);
    assert!(rec.position("apply:dependent").is_none(), "stage two ran: {:?}", rec.events());
}

#[tokio::test]
async fn stage_two_failure_reports_stage_and_keeps_stage_one_applied() {
    let rec = Recorder::default();
    let store = FakeStore::failing_on(rec.clone(), ObjectClass::Dependent);
    let applier = applier(store, FakePoller::ready_after(rec.clone(), 0));

    let batch = vec![namespace("flux-system"), config_map("app-config")];
    let err = applier.apply(batch, &CancellationToken::new()).await.unwrap_err();
    match err {
        BosunError::ApplyFailed { stage, .. } => assert_eq!(stage, ObjectClass::Dependent),
        other => panic!("got {:?}", other),
    }
    // Stage one went through and nothing tried to undo it
    assert_eq!(rec.position("apply:definitional"), Some(1));
}

#[tokio::test]
async fn pre_cancelled_token_fails_without_applying() {
    let rec = Recorder::default();
    let applier = applier(FakeStore::new(rec.clone()), FakePoller::ready_after(rec.clone(), 0));

    let token = CancellationToken::new();
    token.cancel();
    let err = applier.apply(vec![namespace("flux-system")], &token).await.unwrap_err();
    assert!(matches!(err, BosunError::Cancelled { .. }), "got {:?}", err);
    assert!(rec.position("apply:definitional").is_none());
}

#[tokio::test(start_paused = true)]
async fn cancellation_during_barrier_is_an_error_not_success() {
    let rec = Recorder::default();
    let token = CancellationToken::new();
    let mut poller = FakePoller::never_ready(rec.clone());
    poller.cancel_on_first_poll = Some(token.clone());
    let applier = applier(FakeStore::new(rec.clone()), poller);

    let batch = vec![namespace("flux-system"), config_map("app-config")];
    let err = applier.apply(batch, &token).await.unwrap_err();
    assert!(matches!(err, BosunError::Cancelled { .. }), "got {:?}", err);
    assert!(rec.position("apply:dependent").is_none());
}
