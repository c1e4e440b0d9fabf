//! Bosun core types: object identities, change sets, wait outcomes, and the
//! collaborator traits the orchestration layers are written against.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Identity of a declarative object: type descriptor plus namespace/name.
///
/// Two objects with the same `ObjectRef` are the same object as far as a
/// single apply batch is concerned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.namespace.as_deref() {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A declarative object as read from a manifest: identity plus raw payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceObject {
    pub id: ObjectRef,
    pub raw: serde_json::Value,
}

impl ResourceObject {
    /// Build from a raw JSON object, validating the fields every apply call
    /// needs up front so later stages can rely on them.
    pub fn from_value(raw: serde_json::Value) -> Result<Self> {
        let api_version = raw
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("object missing apiVersion"))?;
        let kind = raw
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("object missing kind"))?
            .to_string();
        let (group, version) = match api_version.split_once('/') {
            Some((g, v)) => (g.to_string(), v.to_string()),
            None => (String::new(), api_version.to_string()),
        };
        let meta = raw
            .get("metadata")
            .ok_or_else(|| anyhow!("object missing metadata"))?;
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("object missing metadata.name"))?
            .to_string();
        let namespace = meta
            .get("namespace")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(Self {
            id: ObjectRef { group, version, kind, namespace, name },
            raw,
        })
    }

    pub fn class(&self) -> ObjectClass {
        ObjectClass::of(&self.id)
    }

    /// Metadata labels, empty when absent. Non-string values are skipped.
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("labels"))
            .and_then(|l| l.as_object())
            .map(|obj| {
                obj.iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Stage classification. Definitional objects establish schemas or
/// namespaces that dependent objects assume already exist; they must be
/// applied and confirmed reconciled first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ObjectClass {
    Definitional,
    Dependent,
}

impl ObjectClass {
    /// Pure function of the type descriptor: CRDs and namespaces are
    /// definitional, everything else is dependent.
    pub fn of(id: &ObjectRef) -> Self {
        let is_crd = id.group == "apiextensions.k8s.io" && id.kind == "CustomResourceDefinition";
        let is_namespace = id.group.is_empty() && id.kind == "Namespace";
        if is_crd || is_namespace {
            ObjectClass::Definitional
        } else {
            ObjectClass::Dependent
        }
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectClass::Definitional => write!(f, "definitional"),
            ObjectClass::Dependent => write!(f, "dependent"),
        }
    }
}

/// Outcome of applying a single object.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Unchanged,
    Deleted,
    Failed,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Created => write!(f, "created"),
            Action::Updated => write!(f, "updated"),
            Action::Unchanged => write!(f, "unchanged"),
            Action::Deleted => write!(f, "deleted"),
            Action::Failed => write!(f, "failed"),
        }
    }
}

/// One recorded apply decision. Immutable once appended to a change set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeSetEntry {
    pub subject: ObjectRef,
    pub action: Action,
    pub class: ObjectClass,
}

impl fmt::Display for ChangeSetEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.subject, self.action)
    }
}

/// Ordered, append-only record of every apply decision in one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entries: Vec<ChangeSetEntry>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ChangeSetEntry) {
        self.entries.push(entry);
    }

    /// Append a partial change set in the order the apply layer returned it.
    pub fn append(&mut self, mut entries: Vec<ChangeSetEntry>) {
        self.entries.append(&mut entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChangeSetEntry> {
        self.entries.iter()
    }

    /// Identities of everything recorded so far, in application order.
    pub fn object_refs(&self) -> Vec<ObjectRef> {
        self.entries.iter().map(|e| e.subject.clone()).collect()
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}

/// Label-scoped list selector for one kind across the cluster scope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Selector {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub labels: BTreeMap<String, String>,
}

impl Selector {
    /// Render labels as a `k=v,k2=v2` selector string.
    pub fn label_selector(&self) -> String {
        self.labels
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// What a readiness wait is about: a set of applied objects, or a single
/// workload that must become available. Built per wait call, then dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessTarget {
    Objects(Vec<ObjectRef>),
    Workload { namespace: String, name: String },
}

impl fmt::Display for ReadinessTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessTarget::Objects(refs) => write!(f, "{} object(s)", refs.len()),
            ReadinessTarget::Workload { namespace, name } => {
                write!(f, "workload {}/{}", namespace, name)
            }
        }
    }
}

/// One observation of a readiness target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Ready,
    Pending,
    /// Will not converge without intervention.
    Failed(String),
}

/// Terminal result of a bounded wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Ready,
    TimedOut,
    Error(String),
}

pub const DEFAULT_BASELINE_VERSION: &str = "v2.1.0";
pub const DEFAULT_BASELINE_NAMESPACE: &str = "flux-system";
pub const DEFAULT_MANIFEST_FILE: &str = "flux-system.yaml";
pub const DEFAULT_COMPONENTS: [&str; 4] = [
    "source-controller",
    "kustomize-controller",
    "helm-controller",
    "notification-controller",
];

/// Options for installing the control-plane baseline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallOptions {
    pub version: String,
    pub namespace: String,
    pub components: Vec<String>,
    pub components_extra: Vec<String>,
    pub manifest_file: String,
    pub timeout: Duration,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            version: DEFAULT_BASELINE_VERSION.to_string(),
            namespace: DEFAULT_BASELINE_NAMESPACE.to_string(),
            components: DEFAULT_COMPONENTS.iter().map(|s| s.to_string()).collect(),
            components_extra: Vec::new(),
            manifest_file: DEFAULT_MANIFEST_FILE.to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

impl InstallOptions {
    /// Base components followed by extras, in declaration order.
    pub fn all_components(&self) -> Vec<String> {
        self.components
            .iter()
            .chain(self.components_extra.iter())
            .cloned()
            .collect()
    }
}

/// Errors surfaced by the orchestration layers. Each variant carries enough
/// context to tell which phase or stage gave up.
#[derive(Debug, thiserror::Error)]
pub enum BosunError {
    #[error("cluster context {context:?} is not a known local cluster and was not explicitly allowed")]
    UnsafeCluster { context: String },

    #[error("baseline detection failed: {source}")]
    DetectionAmbiguous { source: anyhow::Error },

    #[error("baseline install failed: {source}")]
    InstallFailed { source: anyhow::Error },

    #[error("apply failed during {stage} stage: {source}")]
    ApplyFailed {
        stage: ObjectClass,
        source: anyhow::Error,
    },

    #[error("readiness wait for {target} timed out after {timeout:?}")]
    ReadinessTimedOut { target: String, timeout: Duration },

    #[error("readiness wait for {target} failed: {reason}")]
    ReadinessError { target: String, reason: String },

    #[error("cancelled during {phase}")]
    Cancelled { phase: String },

    #[error("malformed input: {0}")]
    MalformedInput(String),
}

pub type BosunResult<T> = Result<T, BosunError>;

/// Object store client: CRUD surface of the target cluster, consumed by the
/// staged applier and the baseline detector.
#[async_trait::async_trait]
pub trait ObjectStore: Send + Sync {
    /// List objects of one kind matching the selector, cluster-wide.
    async fn list(&self, selector: &Selector) -> Result<Vec<ResourceObject>>;

    /// Fill in native defaults so default-valued fields do not register as
    /// drift on a later re-run.
    async fn set_defaults(&self, batch: &mut [ResourceObject]) -> Result<()>;

    /// Apply the batch as a single request, returning one entry per object
    /// in application order.
    async fn apply(&self, batch: &[ResourceObject]) -> Result<Vec<ChangeSetEntry>>;
}

/// Status poller: one observation per call; cadence and deadline belong to
/// the wait loop, not the poller.
#[async_trait::async_trait]
pub trait StatusPoller: Send + Sync {
    async fn check(&self, target: &ReadinessTarget) -> Result<PollStatus>;
}

/// Produces the apply-ready manifest bundle for a requested baseline.
#[async_trait::async_trait]
pub trait ManifestSource: Send + Sync {
    async fn render(&self, opts: &InstallOptions) -> Result<Vec<u8>>;
}

pub mod prelude {
    pub use super::{
        Action, BosunError, BosunResult, ChangeSet, ChangeSetEntry, ObjectClass, ObjectRef,
        ResourceObject,
    };
}
