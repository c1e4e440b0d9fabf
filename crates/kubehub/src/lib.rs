//! Bosun kube integration: kubeconfig context resolution, the local-cluster
//! guard, and API discovery helpers shared by the apply and status layers.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    core::GroupVersionKind,
    discovery::{Discovery, Scope},
    Client, Config,
};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Resolved target cluster. Every mutating call upstream is tied to exactly
/// one of these.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub context: String,
}

impl std::fmt::Display for ClusterIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.context)
    }
}

// Context prefixes and names of well-known local development cluster
// tooling. Closed, case-sensitive list; see https://skaffold.dev/docs/environment/local-cluster/
const KIND_PREFIX: &str = "kind-";
const K3D_PREFIX: &str = "k3d-";
const MINIKUBE: &str = "minikube";
const DOCKER_FOR_DESKTOP: &str = "docker-for-desktop";
const DOCKER_DESKTOP: &str = "docker-desktop";

/// Whether the context may receive mutations. An operator-declared override
/// matches first and wins unconditionally; otherwise only the known local
/// cluster names pass. Never errors: an unknown context is just `false`.
pub fn is_safe_context(context: &str, allow_override: Option<&str>) -> bool {
    if let Some(allowed) = allow_override {
        if context == allowed {
            return true;
        }
    }
    context.starts_with(KIND_PREFIX)
        || context.starts_with(K3D_PREFIX)
        || context == MINIKUBE
        || context == DOCKER_FOR_DESKTOP
        || context == DOCKER_DESKTOP
}

fn read_kubeconfig(kubeconfig_path: Option<&str>) -> Result<Kubeconfig> {
    match kubeconfig_path {
        Some(path) => {
            Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig at {}", path))
        }
        None => Kubeconfig::read().context("reading kubeconfig"),
    }
}

fn context_name(kubeconfig: &Kubeconfig, context: Option<&str>) -> Result<String> {
    match context {
        Some(c) => Ok(c.to_string()),
        None => kubeconfig
            .current_context
            .clone()
            .ok_or_else(|| anyhow!("kubeconfig has no current context; pass one explicitly")),
    }
}

/// Resolve just the target context name, without touching the cluster.
pub fn resolve_context(
    kubeconfig_path: Option<&str>,
    context: Option<&str>,
) -> Result<ClusterIdentity> {
    let kubeconfig = read_kubeconfig(kubeconfig_path)?;
    let context = context_name(&kubeconfig, context)?;
    Ok(ClusterIdentity { context })
}

/// Resolve a kubeconfig (default chain or explicit path) plus optional
/// context name into a connected client and the identity it belongs to.
pub async fn resolve_client(
    kubeconfig_path: Option<&str>,
    context: Option<&str>,
) -> Result<(Client, ClusterIdentity)> {
    let kubeconfig = read_kubeconfig(kubeconfig_path)?;
    let context_name = context_name(&kubeconfig, context)?;

    let opts = KubeConfigOptions {
        context: Some(context_name.clone()),
        ..Default::default()
    };
    let config = Config::from_custom_kubeconfig(kubeconfig, &opts)
        .await
        .with_context(|| format!("building client config for context {}", context_name))?;
    let client = Client::try_from(config).context("initializing kube client")?;
    info!(context = %context_name, "resolved cluster context");

    Ok((client, ClusterIdentity { context: context_name }))
}

/// Look up the served API resource for a GVK via discovery.
pub async fn find_api_resource(
    client: Client,
    gvk: &GroupVersionKind,
) -> Result<(kube::core::ApiResource, bool)> {
    let discovery = Discovery::new(client).run().await?;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                return Ok((ar.clone(), namespaced));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}
