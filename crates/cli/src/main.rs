use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kview_api::{Engine, Report};
use kview_core::{CacheKind, NodeGroup, NodeRecord, PodRecord};
use kview_kubehub::DescribeTarget;
use kview_persist::CacheSettings;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kviewctl", version, about = "Cached Kubernetes node-group and pod viewer")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig context (default: current context)
    #[arg(long = "context", global = true)]
    context: Option<String>,

    /// Cache TTL in seconds
    #[arg(long = "ttl", env = "KVIEW_CACHE_TTL", global = true)]
    ttl: Option<u64>,

    /// Disable the on-disk cache
    #[arg(long = "no-cache", action = ArgAction::SetTrue, global = true)]
    no_cache: bool,

    /// Cache directory
    #[arg(long = "cache-dir", env = "KVIEW_CACHE_DIR", global = true)]
    cache_dir: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Node groups with summed capacity and usage
    Groups,
    /// Nodes in one group, e.g. "eks:pool-a" or "worker"
    Nodes { group: String },
    /// Pods scheduled on a node
    Pods { node: String },
    /// Pods whose name or namespace contains a pattern (case-insensitive)
    Search { pattern: String },
    /// Namespaces and their phase
    Namespaces,
    /// Deployments in a namespace
    Deployments { namespace: String },
    /// Print a node, or a pod when --namespace is given
    Describe {
        name: String,
        #[arg(long = "namespace", short = 'n')]
        namespace: Option<String>,
    },
    /// Kubeconfig contexts
    Contexts,
}

fn init_tracing() {
    let env = std::env::var("KVIEW_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KVIEW_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KVIEW_METRICS_ADDR; expected host:port");
        }
    }
}

fn settings(cli: &Cli) -> CacheSettings {
    let mut s = CacheSettings::from_env();
    if let Some(ttl) = cli.ttl {
        s = s.with_ttl_secs(ttl);
    }
    if let Some(dir) = cli.cache_dir.as_deref() {
        s = s.with_dir(dir);
    }
    if cli.no_cache {
        s = s.with_enabled(false);
    }
    s
}

/// Warnings go to stderr so JSON on stdout stays parseable.
fn print<T: Serialize>(output: Output, report: &Report<T>, human: impl FnOnce(&T)) -> Result<()> {
    for w in &report.warnings {
        eprintln!("warning: {}", w);
    }
    match output {
        Output::Human => human(&report.items),
        Output::Json => println!("{}", serde_json::to_string_pretty(report)?),
    }
    Ok(())
}

fn print_groups(groups: &Vec<NodeGroup>) {
    println!("{:<28} {:>5} {:>6} {:>18} {:>24}", "GROUP", "NODES", "AGE", "CPU used/alloc/tot", "MEM used/alloc/tot");
    for g in groups {
        let cpu = format!("{}/{}/{}", g.cpu.used, g.cpu.allocatable, g.cpu.total);
        let mem = format!("{}/{}/{}", g.memory.used, g.memory.allocatable, g.memory.total);
        println!("{:<28} {:>5} {:>6} {:>18} {:>24}", g.name, g.count, g.age, cpu, mem);
    }
}

fn print_nodes(nodes: &Vec<NodeRecord>) {
    println!("{:<40} {:<9} {:>6} {:<14} {:>18} {:>24}", "NAME", "STATUS", "AGE", "TYPE", "CPU used/alloc/cap", "MEM used/alloc/cap");
    for n in nodes {
        let cpu = format!("{}/{}/{}", n.cpu.used, n.cpu.allocatable, n.cpu.capacity);
        let mem = format!("{}/{}/{}", n.memory.used, n.memory.allocatable, n.memory.capacity);
        println!("{:<40} {:<9} {:>6} {:<14} {:>18} {:>24}", n.name, n.status, n.age, n.instance_type, cpu, mem);
    }
}

fn print_pods(pods: &Vec<PodRecord>) {
    println!("{:<20} {:<40} {:<30} {:<10} {:>6} {:>8} {:>10}", "NAMESPACE", "NAME", "NODE", "PHASE", "AGE", "CPU", "MEMORY");
    for p in pods {
        println!("{:<20} {:<40} {:<30} {:<10} {:>6} {:>8} {:>10}", p.namespace, p.name, p.node, p.phase, p.age, p.cpu, p.memory);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let engine = Engine::connect(cli.context.as_deref(), settings(&cli)).await.context("connecting to cluster")?;
    info!(context = %engine.context(), "kviewctl ready");

    match &cli.command {
        Commands::Groups => print(cli.output, &engine.node_groups().await, print_groups)?,
        Commands::Nodes { group } => {
            let report = engine.nodes(group).await;
            print(cli.output, &report, print_nodes)?;
            if cli.output == Output::Human {
                println!("\nlast updated: {}", engine.last_updated(CacheKind::Nodes, group));
            }
        }
        Commands::Pods { node } => {
            let report = engine.pods(node).await;
            print(cli.output, &report, print_pods)?;
            if cli.output == Output::Human {
                println!("\nlast updated: {}", engine.last_updated(CacheKind::Pods, node));
            }
        }
        Commands::Search { pattern } => print(cli.output, &engine.search_pods(pattern).await, print_pods)?,
        Commands::Namespaces => print(cli.output, &engine.namespaces().await, |items| {
            println!("{:<40} {}", "NAME", "PHASE");
            for ns in items {
                println!("{:<40} {}", ns.name, ns.phase);
            }
        })?,
        Commands::Deployments { namespace } => print(cli.output, &engine.deployments(namespace).await, |items| {
            println!("{:<40} {:>8} {:>10}", "NAME", "READY", "AVAILABLE");
            for d in items {
                println!("{:<40} {:>8} {:>10}", d.name, d.ready, d.available);
            }
        })?,
        Commands::Describe { name, namespace } => {
            let target = match namespace {
                Some(ns) => DescribeTarget::Pod { namespace: ns.clone(), name: name.clone() },
                None => DescribeTarget::Node { name: name.clone() },
            };
            println!("{}", engine.describe(&target).await?);
        }
        Commands::Contexts => {
            let contexts = engine.contexts().context("reading kubeconfig")?;
            match cli.output {
                Output::Human => {
                    for c in &contexts {
                        println!("{} {}", if c.current { "*" } else { " " }, c.name);
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&contexts)?),
            }
        }
    }
    Ok(())
}
