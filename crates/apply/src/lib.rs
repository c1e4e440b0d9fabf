//! Bosun apply layer: manifest reading, native-kind defaulting, server-side
//! apply, and the two-stage orchestration core with its readiness barrier.

#![forbid(unsafe_code)]

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use bosun_core::{
    Action, BosunError, BosunResult, ChangeSet, ChangeSetEntry, ObjectClass, ObjectStore,
    ReadinessTarget, ResourceObject, Selector, StatusPoller, WaitOutcome,
};
use bosun_status::WaitConfig;
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::Value as Json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Field manager name stamped on every server-side apply.
pub const FIELD_MANAGER: &str = "bosun";

fn max_manifest_bytes() -> usize {
    std::env::var("BOSUN_MAX_MANIFEST_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(2_000_000) // 2 MiB default
}

/// Read a multi-document YAML payload into resource objects. Empty and null
/// documents are skipped; anything else must carry apiVersion/kind/name.
pub fn read_objects(manifests: &str) -> Result<Vec<ResourceObject>> {
    if manifests.len() > max_manifest_bytes() {
        return Err(anyhow!("manifest payload too large (>{} bytes)", max_manifest_bytes()));
    }
    let mut out = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(manifests) {
        let value = serde_yaml::Value::deserialize(doc).context("parsing YAML document")?;
        if matches!(value, serde_yaml::Value::Null) {
            continue;
        }
        let json = serde_json::to_value(value).context("converting YAML to JSON")?;
        out.push(ResourceObject::from_value(json)?);
    }
    Ok(out)
}

fn default_port_protocols(ports: Option<&mut Json>) {
    let Some(arr) = ports.and_then(|p| p.as_array_mut()) else {
        return;
    };
    for port in arr {
        if let Some(obj) = port.as_object_mut() {
            obj.entry("protocol").or_insert(Json::String("TCP".to_string()));
        }
    }
}

fn default_container_protocols(spec: Option<&mut Json>) {
    let Some(spec) = spec else { return };
    for key in ["containers", "initContainers"] {
        if let Some(list) = spec.get_mut(key).and_then(|c| c.as_array_mut()) {
            for container in list {
                default_port_protocols(container.get_mut("ports"));
            }
        }
    }
}

/// Fill in the defaults the API server would add anyway, so they do not
/// register as drift when the same batch is applied again.
pub fn set_native_defaults(batch: &mut [ResourceObject]) {
    for obj in batch.iter_mut() {
        match (obj.id.group.as_str(), obj.id.kind.as_str()) {
            ("", "Service") => {
                default_port_protocols(obj.raw.pointer_mut("/spec/ports"));
            }
            ("", "Pod") => {
                default_container_protocols(obj.raw.pointer_mut("/spec"));
            }
            ("apps", "Deployment")
            | ("apps", "StatefulSet")
            | ("apps", "DaemonSet")
            | ("apps", "ReplicaSet")
            | ("batch", "Job") => {
                default_container_protocols(obj.raw.pointer_mut("/spec/template/spec"));
            }
            ("batch", "CronJob") => {
                default_container_protocols(
                    obj.raw.pointer_mut("/spec/jobTemplate/spec/template/spec"),
                );
            }
            _ => {}
        }
    }
}

/// Kube-backed object store: dynamic discovery plus server-side apply, with
/// create/update/unchanged judged from resourceVersion movement.
pub struct KubeObjectStore {
    client: Client,
}

impl KubeObjectStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn lookup(
        discovery: &Discovery,
        gvk: &GroupVersionKind,
    ) -> Result<(kube::core::ApiResource, bool)> {
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    return Ok((ar.clone(), namespaced));
                }
            }
        }
        Err(anyhow!("GVK not served: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }

    async fn apply_one(
        &self,
        discovery: &Discovery,
        obj: &ResourceObject,
    ) -> Result<ChangeSetEntry> {
        let gvk = GroupVersionKind {
            group: obj.id.group.clone(),
            version: obj.id.version.clone(),
            kind: obj.id.kind.clone(),
        };
        let (ar, namespaced) = Self::lookup(discovery, &gvk)?;
        let api: Api<DynamicObject> = if namespaced {
            match obj.id.namespace.as_deref() {
                Some(ns) => Api::namespaced_with(self.client.clone(), ns, &ar),
                None => return Err(anyhow!("namespace required for namespaced kind {}", obj.id)),
            }
        } else {
            Api::all_with(self.client.clone(), &ar)
        };

        let live_rv = api
            .get_opt(&obj.id.name)
            .await?
            .and_then(|o| o.metadata.resource_version);

        // Force re-owns fields previously applied under another manager, so
        // a repeated bootstrap converges instead of conflicting.
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api
            .patch(&obj.id.name, &pp, &Patch::Apply(&obj.raw))
            .await
            .map_err(|e| anyhow!("server-side apply of {} failed: {}", obj.id, e))?;
        let new_rv = applied.metadata.resource_version;

        let action = match (live_rv, new_rv) {
            (None, _) => Action::Created,
            (Some(old), Some(new)) if old == new => Action::Unchanged,
            _ => Action::Updated,
        };
        debug!(subject = %obj.id, action = %action, "applied object");
        Ok(ChangeSetEntry { subject: obj.id.clone(), action, class: obj.class() })
    }
}

#[async_trait::async_trait]
impl ObjectStore for KubeObjectStore {
    async fn list(&self, selector: &Selector) -> Result<Vec<ResourceObject>> {
        let gvk = GroupVersionKind {
            group: selector.group.clone(),
            version: selector.version.clone(),
            kind: selector.kind.clone(),
        };
        let (ar, _namespaced) =
            bosun_kubehub::find_api_resource(self.client.clone(), &gvk).await?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let mut lp = ListParams::default();
        if !selector.labels.is_empty() {
            lp = lp.labels(&selector.label_selector());
        }
        let list = api.list(&lp).await?;
        let mut out = Vec::with_capacity(list.items.len());
        for item in list.items {
            let raw = serde_json::to_value(&item).context("serializing listed object")?;
            out.push(ResourceObject::from_value(raw)?);
        }
        Ok(out)
    }

    async fn set_defaults(&self, batch: &mut [ResourceObject]) -> Result<()> {
        set_native_defaults(batch);
        Ok(())
    }

    async fn apply(&self, batch: &[ResourceObject]) -> Result<Vec<ChangeSetEntry>> {
        let t0 = std::time::Instant::now();
        counter!("apply_attempts", 1u64);
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut entries = Vec::with_capacity(batch.len());
        for obj in batch {
            match self.apply_one(&discovery, obj).await {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    counter!("apply_err", 1u64);
                    return Err(e);
                }
            }
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        counter!("apply_ok", 1u64);
        Ok(entries)
    }
}

/// The orchestration core: partition a batch into definitional and dependent
/// stages, apply stage one, hold at the readiness barrier, apply stage two.
///
/// No dependent object is ever sent before every definitional object in the
/// batch is confirmed reconciled, because dependents routinely assume the
/// schemas and namespaces stage one establishes.
pub struct StagedApplier {
    store: Arc<dyn ObjectStore>,
    poller: Arc<dyn StatusPoller>,
    wait: WaitConfig,
}

impl StagedApplier {
    pub fn new(store: Arc<dyn ObjectStore>, poller: Arc<dyn StatusPoller>) -> Self {
        Self { store, poller, wait: WaitConfig::default() }
    }

    pub fn with_wait_config(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    pub async fn apply(
        &self,
        mut objects: Vec<ResourceObject>,
        cancel: &CancellationToken,
    ) -> BosunResult<ChangeSet> {
        if objects.is_empty() {
            return Err(BosunError::MalformedInput("no objects to apply".to_string()));
        }
        let mut seen = HashSet::with_capacity(objects.len());
        for obj in &objects {
            if !seen.insert(obj.id.clone()) {
                return Err(BosunError::MalformedInput(format!(
                    "duplicate object {} in batch",
                    obj.id
                )));
            }
        }

        // Defaults must land before classification and before the apply
        // layer diffs, or default-filled fields read as updates on re-runs.
        self.store
            .set_defaults(&mut objects)
            .await
            .map_err(|e| BosunError::MalformedInput(format!("defaulting batch: {}", e)))?;

        let (stage_one, stage_two): (Vec<_>, Vec<_>) = objects
            .into_iter()
            .partition(|o| o.class() == ObjectClass::Definitional);
        info!(
            definitional = stage_one.len(),
            dependent = stage_two.len(),
            "partitioned batch"
        );

        let mut change_set = ChangeSet::new();

        if !stage_one.is_empty() {
            let entries = self.apply_stage(ObjectClass::Definitional, &stage_one, cancel).await?;
            change_set.append(entries);
        }

        self.barrier(&change_set, cancel).await?;

        if !stage_two.is_empty() {
            let entries = self.apply_stage(ObjectClass::Dependent, &stage_two, cancel).await?;
            change_set.append(entries);
        }

        Ok(change_set)
    }

    async fn apply_stage(
        &self,
        stage: ObjectClass,
        batch: &[ResourceObject],
        cancel: &CancellationToken,
    ) -> BosunResult<Vec<ChangeSetEntry>> {
        debug!(stage = %stage, objects = batch.len(), "applying stage");
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BosunError::Cancelled { phase: format!("{} stage", stage) }),
            res = self.store.apply(batch) => {
                res.map_err(|source| BosunError::ApplyFailed { stage, source })
            }
        }
    }

    /// Block until everything recorded so far is reconciled. Runs even when
    /// stage one was empty; an empty object set is trivially ready.
    async fn barrier(&self, change_set: &ChangeSet, cancel: &CancellationToken) -> BosunResult<()> {
        let target = ReadinessTarget::Objects(change_set.object_refs());
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(BosunError::Cancelled { phase: "readiness barrier".to_string() })
            }
            outcome = bosun_status::wait(self.poller.as_ref(), &target, self.wait) => outcome,
        };
        match outcome {
            WaitOutcome::Ready => Ok(()),
            WaitOutcome::TimedOut => Err(BosunError::ReadinessTimedOut {
                target: target.to_string(),
                timeout: self.wait.timeout,
            }),
            WaitOutcome::Error(reason) => {
                Err(BosunError::ReadinessError { target: target.to_string(), reason })
            }
        }
    }
}
