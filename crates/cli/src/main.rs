//! rekon: declarative apply for Kubernetes manifests with dependency
//! ordering, pruning, and status waits.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

mod diff;
mod manifest;
mod render;

use rekon_apply::{Applier, Destroyer, RunOptions};
use rekon_cluster::{ClusterClient, DryRun, KubeCluster, PropagationPolicy};
use rekon_inventory::{
    inventory_template, ConfigMapInventory, InventoryClient, InventoryInfo, InventoryPolicy,
};
use rekon_status::{Collector, StatusPoller};

#[derive(Parser, Debug)]
#[command(
    name = "rekon",
    version,
    about = "Reconcile a directory of manifests against a cluster"
)]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum Output {
    Human,
    Json,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PolicyArg {
    Strict,
    Adopt,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum DryRunArg {
    None,
    Client,
    Server,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum PropagationArg {
    Background,
    Foreground,
    Orphan,
}

#[derive(Args, Debug, Clone)]
struct RunFlags {
    /// Ownership policy for live objects owned by another inventory
    #[arg(long = "inventory-policy", value_enum, default_value_t = PolicyArg::Strict)]
    inventory_policy: PolicyArg,

    /// Use server-side apply
    #[arg(long = "server-side")]
    server_side: bool,

    /// Force ownership on server-side apply conflicts
    #[arg(long = "force-conflicts")]
    force_conflicts: bool,

    /// Field manager recorded on apply patches
    #[arg(long = "field-manager", default_value = "rekon")]
    field_manager: String,

    /// Dry-run strategy
    #[arg(long = "dry-run", value_enum, default_value_t = DryRunArg::None)]
    dry_run: DryRunArg,

    /// Status poll period, e.g. 2s or 500ms
    #[arg(long = "poll-period", value_parser = parse_duration, default_value = "2s")]
    poll_period: Duration,

    /// How long to wait for applied objects to reconcile (0 disables waits)
    #[arg(long = "reconcile-timeout", value_parser = parse_duration, default_value = "1m")]
    reconcile_timeout: Duration,

    /// How long to wait for pruned objects to disappear (0 disables waits)
    #[arg(long = "prune-timeout", value_parser = parse_duration, default_value = "1m")]
    prune_timeout: Duration,

    /// Deletion propagation policy for prunes
    #[arg(long = "prune-propagation-policy", value_enum, default_value_t = PropagationArg::Background)]
    prune_propagation_policy: PropagationArg,
}

impl RunFlags {
    fn to_run_options(&self, output: Output, preview: bool) -> RunOptions {
        let dry_run = match self.dry_run {
            DryRunArg::None if preview => {
                // preview defaults to a dry-run matching the apply path
                if self.server_side {
                    DryRun::Server
                } else {
                    DryRun::Client
                }
            }
            DryRunArg::None => DryRun::None,
            DryRunArg::Client => DryRun::Client,
            DryRunArg::Server => DryRun::Server,
        };
        RunOptions {
            policy: match self.inventory_policy {
                PolicyArg::Strict => InventoryPolicy::Strict,
                PolicyArg::Adopt => InventoryPolicy::Adopt,
            },
            server_side: self.server_side,
            force_conflicts: self.force_conflicts,
            field_manager: self.field_manager.clone(),
            dry_run,
            poll_period: self.poll_period,
            reconcile_timeout: self.reconcile_timeout,
            prune_timeout: self.prune_timeout,
            prune_propagation: match self.prune_propagation_policy {
                PropagationArg::Background => PropagationPolicy::Background,
                PropagationArg::Foreground => PropagationPolicy::Foreground,
                PropagationArg::Orphan => PropagationPolicy::Orphan,
            },
            emit_status_events: output == Output::Json,
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write an inventory template into a package directory
    Init {
        dir: PathBuf,
        /// Stable inventory id (default: the directory name)
        #[arg(long = "inventory-id")]
        inventory_id: Option<String>,
        /// Namespace for the inventory ConfigMap
        #[arg(long = "namespace", default_value = "default")]
        namespace: String,
    },
    /// Apply the package and prune dropped objects
    Apply {
        dir: PathBuf,
        #[command(flatten)]
        flags: RunFlags,
    },
    /// Run the apply flow as a dry-run
    Preview {
        dir: PathBuf,
        #[command(flatten)]
        flags: RunFlags,
    },
    /// Delete everything the package's inventory owns
    Destroy {
        dir: PathBuf,
        #[command(flatten)]
        flags: RunFlags,
    },
    /// Show a local-vs-live diff summary
    Diff { dir: PathBuf },
    /// Poll inventory members until they all reach Current
    Status {
        dir: PathBuf,
        #[command(flatten)]
        flags: RunFlags,
    },
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(pos) => s.split_at(pos),
        None => (s, "s"),
    };
    let n: u64 = digits.parse().map_err(|_| format!("invalid duration {s:?}"))?;
    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(format!("invalid duration unit {unit:?} in {s:?}")),
    }
}

fn init_tracing() {
    let env = std::env::var("REKON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("REKON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid REKON_METRICS_ADDR; expected host:port");
        }
    }
}

fn clients() -> (Arc<dyn ClusterClient>, Arc<dyn InventoryClient>) {
    let cluster: Arc<dyn ClusterClient> = Arc::new(KubeCluster::new());
    let inventory: Arc<dyn InventoryClient> = Arc::new(ConfigMapInventory::new(cluster.clone()));
    (cluster, inventory)
}

/// Cancellation wired to Ctrl-C; the sender side lives in its own task.
fn cancel_on_ctrl_c() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received; cancelling run");
            let _ = tx.send(true);
        }
        // hold the sender so the channel stays open
        std::future::pending::<()>().await;
    });
    rx
}

fn load_package_with_inventory(dir: &Path) -> Result<(manifest::Package, InventoryInfo)> {
    let pkg = manifest::load_dir(dir)?;
    let inv = pkg.inventory.clone().ok_or_else(|| {
        anyhow!(
            "no inventory template found in {}; run `rekon init {}` first",
            dir.display(),
            dir.display()
        )
    })?;
    Ok((pkg, inv))
}

#[tokio::main]
async fn main() {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Init { dir, inventory_id, namespace } => {
            cmd_init(&dir, inventory_id, namespace)
        }
        Commands::Apply { dir, flags } => cmd_apply(&dir, flags, cli.output, false).await,
        Commands::Preview { dir, flags } => cmd_apply(&dir, flags, cli.output, true).await,
        Commands::Destroy { dir, flags } => cmd_destroy(&dir, flags, cli.output).await,
        Commands::Diff { dir } => cmd_diff(&dir, cli.output).await,
        Commands::Status { dir, flags } => cmd_status(&dir, flags, cli.output).await,
    }
}

fn cmd_init(dir: &Path, inventory_id: Option<String>, namespace: String) -> Result<i32> {
    if !dir.is_dir() {
        return Err(anyhow!("{} is not a directory", dir.display()));
    }
    let path = dir.join("inventory-template.yaml");
    if path.exists() {
        return Err(anyhow!("inventory template already exists at {}", path.display()));
    }
    let id = inventory_id.unwrap_or_else(|| {
        dir.file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("inventory")
            .to_string()
    });
    let inv = InventoryInfo { name: "inventory".to_string(), namespace, id };
    let yaml = serde_yaml::to_string(&inventory_template(&inv))
        .context("rendering inventory template")?;
    std::fs::write(&path, yaml)
        .with_context(|| format!("writing {}", path.display()))?;
    println!("wrote {}", path.display());
    Ok(0)
}

async fn cmd_apply(dir: &Path, flags: RunFlags, output: Output, preview: bool) -> Result<i32> {
    let (pkg, inv) = load_package_with_inventory(dir)?;
    info!(objects = pkg.objects.len(), inventory = %inv.id, preview, "apply invoked");
    let (cluster, inventory) = clients();
    let opts = flags.to_run_options(output, preview);
    let cancel = cancel_on_ctrl_c();
    let rx = Applier::new(cluster, inventory).run(inv, pkg.objects, opts, cancel);
    let summary = render::consume(rx, output).await;
    render::print_summary(&summary, output);
    Ok(if summary.failed() { 1 } else { 0 })
}

async fn cmd_destroy(dir: &Path, flags: RunFlags, output: Output) -> Result<i32> {
    let (_pkg, inv) = load_package_with_inventory(dir)?;
    info!(inventory = %inv.id, "destroy invoked");
    let (cluster, inventory) = clients();
    let opts = flags.to_run_options(output, false);
    let cancel = cancel_on_ctrl_c();
    let rx = Destroyer::new(cluster, inventory).run(inv, opts, cancel);
    let summary = render::consume(rx, output).await;
    render::print_summary(&summary, output);
    Ok(if summary.failed() { 1 } else { 0 })
}

async fn cmd_diff(dir: &Path, output: Output) -> Result<i32> {
    let pkg = manifest::load_dir(dir)?;
    let (cluster, _) = clients();
    diff::run(cluster, &pkg.objects, output).await
}

async fn cmd_status(dir: &Path, flags: RunFlags, output: Output) -> Result<i32> {
    let (_pkg, inv) = load_package_with_inventory(dir)?;
    let (cluster, inventory) = clients();
    let members = inventory
        .load(&inv)
        .await?
        .ok_or_else(|| anyhow!("no inventory record {} found in cluster", inv.id))?;
    if members.is_empty() {
        println!("inventory {} is empty", inv.id);
        return Ok(0);
    }
    info!(inventory = %inv.id, members = members.len(), "status invoked");

    let poller = StatusPoller::new(cluster, flags.poll_period);
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let stream = poller.poll(members.clone(), cancel_rx);
    let collector = Collector::new();
    let _done = collector.listen(stream);

    let timeout = if flags.reconcile_timeout.is_zero() {
        Duration::from_secs(3600)
    } else {
        flags.reconcile_timeout
    };
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        tokio::time::sleep(flags.poll_period).await;
        let obs = collector.latest_observation();
        if let Some(err) = &obs.error {
            let _ = cancel_tx.send(true);
            return Err(anyhow!("status poller failed: {err}"));
        }
        for rs in &obs.resource_statuses {
            match output {
                Output::Json => println!("{}", serde_json::to_string(rs)?),
                Output::Human => {
                    println!("{}  {}  {}", rs.id, rs.status, rs.message)
                }
            }
        }
        if obs.all_current(members.as_slice()) {
            println!("all {} object(s) are Current", members.len());
            let _ = cancel_tx.send(true);
            return Ok(0);
        }
        if tokio::time::Instant::now() >= deadline {
            eprintln!("timed out waiting for inventory members to become Current");
            let _ = cancel_tx.send(true);
            return Ok(1);
        }
    }
}
