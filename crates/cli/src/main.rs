use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bosun_api::{Orchestrator, OrchestratorConfig};
use bosun_apply::KubeObjectStore;
use bosun_bootstrap::StagedBundle;
use bosun_core::{ChangeSet, InstallOptions, ResourceObject};
use bosun_status::KubeStatusPoller;
use clap::{Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Parser, Debug)]
#[command(name = "bosunctl", version, about = "Bosun: bootstrap a GitOps baseline and sync manifests")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Path to a kubeconfig file (default: standard lookup)
    #[arg(long = "kubeconfig", global = true)]
    kubeconfig: Option<String>,

    /// Kubeconfig context to target (default: current context)
    #[arg(long = "context", global = true)]
    context: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install the baseline if needed, then apply a manifest batch
    Run {
        /// Manifest file or directory of manifests to sync
        path: String,
        /// Context name to allow explicitly, bypassing the local-cluster check
        #[arg(long = "allow-context")]
        allow_context: Option<String>,
        /// Baseline version to install when none is found
        #[arg(long = "baseline-version", default_value = bosun_core::DEFAULT_BASELINE_VERSION)]
        baseline_version: String,
        /// Namespace the baseline lives in
        #[arg(long = "namespace", default_value = bosun_core::DEFAULT_BASELINE_NAMESPACE)]
        namespace: String,
        /// Baseline components to install, comma separated
        #[arg(long = "components", value_delimiter = ',',
              default_values_t = bosun_core::DEFAULT_COMPONENTS.iter().map(|s| s.to_string()))]
        components: Vec<String>,
        /// Additional baseline components, comma separated
        #[arg(long = "components-extra", value_delimiter = ',')]
        components_extra: Vec<String>,
        /// Seconds to wait for each baseline component
        #[arg(long = "timeout", default_value_t = 60)]
        timeout: u64,
        /// Directory holding the pre-rendered baseline bundle
        #[arg(long = "bundle-dir", default_value = ".")]
        bundle_dir: String,
    },
    /// Check whether the target context would be allowed to receive mutations
    Guard {
        #[arg(long = "allow-context")]
        allow_context: Option<String>,
    },
    /// Print the installed baseline version, if any
    Detect,
}

fn init_tracing() {
    let env = std::env::var("BOSUN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BOSUN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid BOSUN_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_batch(path: &str) -> Result<Vec<ResourceObject>> {
    let meta = std::fs::metadata(path).with_context(|| format!("reading {}", path))?;
    if !meta.is_dir() {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        return bosun_apply::read_objects(&text);
    }
    let mut files: Vec<_> = std::fs::read_dir(path)
        .with_context(|| format!("reading {}", path))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
        .collect();
    files.sort();
    if files.is_empty() {
        bail!("no YAML manifests under {}", path);
    }
    let mut out = Vec::new();
    for file in files {
        let text =
            std::fs::read_to_string(&file).with_context(|| format!("reading {}", file.display()))?;
        out.extend(bosun_apply::read_objects(&text)?);
    }
    Ok(out)
}

fn print_change_set(output: Output, cs: &ChangeSet) -> Result<()> {
    match output {
        Output::Human => {
            if cs.is_empty() {
                println!("nothing to apply");
            } else {
                println!("{}", cs);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(cs)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            path,
            allow_context,
            baseline_version,
            namespace,
            components,
            components_extra,
            timeout,
            bundle_dir,
        } => {
            let batch = load_batch(&path)?;
            let (client, identity) =
                bosun_kubehub::resolve_client(cli.kubeconfig.as_deref(), cli.context.as_deref())
                    .await?;

            let store = Arc::new(KubeObjectStore::new(client.clone()));
            let poller = Arc::new(KubeStatusPoller::new(client));
            let bundle = Arc::new(StagedBundle::new(bundle_dir));
            let config = OrchestratorConfig {
                allow_context,
                install: InstallOptions {
                    version: baseline_version,
                    namespace,
                    components,
                    components_extra,
                    timeout: Duration::from_secs(timeout),
                    ..InstallOptions::default()
                },
            };
            let orchestrator = Orchestrator::new(store, poller, bundle, config);

            let cancel = CancellationToken::new();
            let signal_cancel = cancel.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received, cancelling run");
                    signal_cancel.cancel();
                }
            });

            match orchestrator.run(&identity, batch, &cancel).await {
                Ok(cs) => print_change_set(cli.output, &cs)?,
                Err(e) => {
                    error!(error = %e, "run failed");
                    eprintln!("run error: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Guard { allow_context } => {
            let identity =
                bosun_kubehub::resolve_context(cli.kubeconfig.as_deref(), cli.context.as_deref())?;
            let safe = bosun_kubehub::is_safe_context(&identity.context, allow_context.as_deref());
            match cli.output {
                Output::Human => {
                    println!("{}: {}", identity, if safe { "allowed" } else { "refused" })
                }
                Output::Json => println!(
                    "{}",
                    serde_json::json!({"context": identity.context, "safe": safe})
                ),
            }
            if !safe {
                std::process::exit(1);
            }
        }
        Commands::Detect => {
            let (client, identity) =
                bosun_kubehub::resolve_client(cli.kubeconfig.as_deref(), cli.context.as_deref())
                    .await?;
            let store = KubeObjectStore::new(client);
            match bosun_bootstrap::detect(&store).await {
                Ok(Some(version)) => match cli.output {
                    Output::Human => println!("baseline {} on {}", version, identity),
                    Output::Json => println!(
                        "{}",
                        serde_json::json!({"context": identity.context, "version": version})
                    ),
                },
                Ok(None) => {
                    println!("no baseline installed on {}", identity);
                    std::process::exit(1);
                }
                Err(e) => {
                    error!(error = %e, "detect failed");
                    eprintln!("detect error: {}", e);
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}
