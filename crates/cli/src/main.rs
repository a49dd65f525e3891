use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use relay_bind::KubeBindingStore;
use relay_controller::{Engine, EngineConfig, Sinks};
use relay_core::ObjectId;
use relay_kubehub::{client_for, control_gvk_key, start_watcher, ApiCatalog, Role, WatchSource, POLICY_KIND, TRANSFORM_KIND};
use relay_resolve::resolve_all;
use relay_status::KubeStatusWriter;
use relay_store::{spawn_ingest, Snapshot};
use relay_wrap::KubeTransport;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod load;
mod report;

#[derive(Parser, Debug)]
#[command(name = "relayctl", version, about = "Binding policy resolution engine")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Raise log verbosity when RELAY_LOG is unset (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch the workload and transport clusters and run the engine until Ctrl-C
    Run {
        /// kubeconfig context holding policies and workload objects
        #[arg(long = "wds-context", env = "RELAY_WDS_CONTEXT")]
        wds_context: Option<String>,
        /// kubeconfig context holding clusters and wrapped workloads
        #[arg(long = "transport-context", env = "RELAY_TRANSPORT_CONTEXT")]
        transport_context: Option<String>,
        /// Workload GVK key to watch, e.g. "apps/v1/Deployment" (repeatable)
        #[arg(long = "workload-kind")]
        workload_kinds: Vec<String>,
        /// GVK key of the cluster inventory
        #[arg(long = "cluster-kind")]
        cluster_kind: Option<String>,
        #[arg(long = "workers")]
        workers: Option<usize>,
        #[arg(long = "max-wrapped-bytes")]
        max_wrapped_bytes: Option<usize>,
    },
    /// Resolve every policy in a YAML file and print the bindings
    Resolve {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
    },
    /// Preview the shards one cluster would receive
    Shard {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        #[arg(long = "cluster")]
        cluster: String,
        #[arg(long = "max-bytes")]
        max_bytes: Option<usize>,
    },
    /// Show which policies select an object, where it goes and its singleton state
    Explain {
        #[arg(short = 'f', long = "file")]
        file: PathBuf,
        /// Object id as group/kind/namespace/name ("core" and "-" for empty parts)
        #[arg(long = "object")]
        object: String,
    },
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let env = std::env::var("RELAY_LOG").unwrap_or_else(|_| default.to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("RELAY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid RELAY_METRICS_ADDR; expected host:port");
        }
    }
}

/// Kind part of a GVK key such as "cluster.open-cluster-management.io/v1/ManagedCluster".
fn kind_of(gvk_key: &str) -> &str { gvk_key.rsplit('/').next().unwrap_or(gvk_key) }

fn read_snapshot(file: &PathBuf, cfg: &EngineConfig) -> Result<Snapshot> {
    let yaml = std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let items = load::load_items(&yaml, kind_of(&cfg.cluster_kind))?;
    info!(file = %file.display(), items = items.len(), "input loaded");
    Ok(Snapshot::from_items(items))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    init_metrics();
    let mut cfg = EngineConfig::from_env()?;
    cfg.verbosity = cfg.verbosity.max(cli.verbose);

    match cli.command {
        Commands::Run { wds_context, transport_context, workload_kinds, cluster_kind, workers, max_wrapped_bytes } => {
            if wds_context.is_some() { cfg.wds_context = wds_context; }
            if transport_context.is_some() { cfg.transport_context = transport_context; }
            if !workload_kinds.is_empty() { cfg.workload_kinds = workload_kinds; }
            if let Some(k) = cluster_kind { cfg.cluster_kind = k; }
            if let Some(w) = workers { cfg.workers = w; }
            if let Some(m) = max_wrapped_bytes { cfg.max_wrapped_bytes = m; }
            cfg.validate()?;
            run(cfg).await?;
        }
        Commands::Resolve { file } => {
            let snap = read_snapshot(&file, &cfg)?;
            let results = resolve_all(&snap);
            match cli.output {
                Output::Human => {
                    println!("POLICY               OBJECTS  CLUSTERS  SINGLETON");
                    for (name, r) in &results {
                        match r {
                            Ok(r) => {
                                println!("{:<20} {:<8} {:<9} {}", name, r.objects.len(), r.clusters.len(), r.want_singleton);
                                for (o, c) in r.binding().pairs() {
                                    println!("  {} -> {}", o, c);
                                }
                            }
                            Err(e) => println!("{:<20} error: {}", name, e),
                        }
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report::resolve_json(&results))?),
            }
        }
        Commands::Shard { file, cluster, max_bytes } => {
            let snap = read_snapshot(&file, &cfg)?;
            let plan = report::shard_preview(&snap, &cluster, max_bytes.unwrap_or(cfg.max_wrapped_bytes))?;
            match cli.output {
                Output::Human => {
                    println!("SHARD  OBJECTS  BYTES     DIGEST");
                    for s in &plan.shards {
                        println!("{:<6} {:<8} {:<9} {}", s.index, s.objects.len(), s.body.len(), s.digest());
                    }
                    for r in &plan.rejected {
                        println!("rejected {} ({} bytes > {})", r.id, r.size, plan.max_bytes);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&report::shard_json(&plan))?),
            }
        }
        Commands::Explain { file, object } => {
            let id = ObjectId::from_str(&object)?;
            let snap = read_snapshot(&file, &cfg)?;
            if snap.object(&id).is_none() {
                return Err(anyhow!("object {} not found in {}", id, file.display()));
            }
            let ex = report::explain_object(&snap, &id);
            match cli.output {
                Output::Human => {
                    println!("object: {}", ex.id);
                    for m in &ex.matches {
                        let tests: Vec<String> = m.tests.iter().map(ToString::to_string).collect();
                        let clusters: Vec<&str> = m.clusters.iter().map(String::as_str).collect();
                        println!("  policy {} (tests {}) -> [{}] singleton={}", m.policy, tests.join(","), clusters.join(", "), m.want_singleton);
                    }
                    if ex.matches.is_empty() {
                        println!("  no policy selects this object");
                    }
                    println!("destinations: [{}]", ex.destinations.join(", "));
                    println!("singleton: {}", report::render_state(&ex.state));
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&ex.to_json())?),
            }
        }
    }

    Ok(())
}

async fn run(cfg: EngineConfig) -> Result<()> {
    info!(
        wds = ?cfg.wds_context,
        transport = ?cfg.transport_context,
        workers = cfg.workers,
        max_wrapped_bytes = cfg.max_wrapped_bytes,
        "starting engine"
    );
    let wds = client_for(cfg.wds_context.as_deref()).await.context("workload cluster client")?;
    let transport = client_for(cfg.transport_context.as_deref()).await.context("transport cluster client")?;

    let (ingest_tx, index) = spawn_ingest(cfg.queue_cap);
    let mut sources = vec![
        (wds.clone(), WatchSource::new(control_gvk_key(POLICY_KIND), Role::Policy)),
        (wds.clone(), WatchSource::new(control_gvk_key(TRANSFORM_KIND), Role::Transform)),
        (transport.clone(), WatchSource::new(cfg.cluster_kind.clone(), Role::Cluster)),
    ];
    sources.extend(cfg.workload_kinds.iter().map(|k| (wds.clone(), WatchSource::new(k.clone(), Role::Workload))));
    let watchers: Vec<_> = sources
        .into_iter()
        .map(|(client, source)| {
            let tx = ingest_tx.clone();
            tokio::spawn(async move {
                let gvk = source.gvk_key.clone();
                if let Err(e) = start_watcher(client, source, tx).await {
                    error!(gvk = %gvk, error = ?e, "watcher failed");
                }
            })
        })
        .collect();

    let wait_secs = std::env::var("RELAY_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(30);
    if !index.wait_for_epoch(1, Duration::from_secs(wait_secs)).await {
        warn!(wait_secs, "no initial snapshot yet; starting anyway");
    }

    let sinks = Sinks {
        bindings: Arc::new(KubeBindingStore::new(wds.clone())),
        transport: Arc::new(KubeTransport::new(transport)),
        status: Arc::new(KubeStatusWriter::new(ApiCatalog::new(wds))),
    };
    let engine = Engine::new(cfg, index, sinks);
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received; shutting down");
            }
            cancel.cancel();
        }
    });
    let res = engine.run(cancel).await;

    drop(ingest_tx);
    for w in watchers {
        w.abort();
    }
    res.map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_last_gvk_segment() {
        assert_eq!(kind_of("cluster.open-cluster-management.io/v1/ManagedCluster"), "ManagedCluster");
        assert_eq!(kind_of("v1/ConfigMap"), "ConfigMap");
        assert_eq!(kind_of("Cluster"), "Cluster");
    }

    #[test]
    fn cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["relayctl", "-o", "json", "shard", "-f", "in.yaml", "--cluster", "c1", "--max-bytes", "100"]).unwrap();
        assert_eq!(cli.output, Output::Json);
        assert!(matches!(cli.command, Commands::Shard { ref cluster, max_bytes: Some(100), .. } if cluster == "c1"));
        let cli = Cli::try_parse_from(["relayctl", "-vv", "run", "--workload-kind", "v1/ConfigMap", "--workload-kind", "apps/v1/Deployment"]).unwrap();
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Commands::Run { ref workload_kinds, .. } if workload_kinds.len() == 2));
    }
}
