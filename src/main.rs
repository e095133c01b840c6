//! zonewall - zone firewall agent
//!
//! Programs a two-zone (trust/untrust) nftables firewall directly over
//! netlink, inside any named network namespace, and keeps it converged on a
//! declarative per-region spec.
//!
//! # Usage
//!
//! ```bash
//! zonewall run                                  # Reconcile every configured region
//! zonewall bootstrap --netns ns1                # Reset the table in ns1
//! zonewall show --netns ns1 --zone trust        # Read back live zone state
//! zonewall sync --zone trust -i eth0 -i eth1 \
//!     --policy established-only -p 10.0.0.0/8   # One-off zone sync
//! zonewall plan --region r1                     # Dry run against live state
//! ```
//!
//! Kernel commands need `CAP_NET_ADMIN` (and `CAP_SYS_ADMIN` to enter another
//! namespace).

use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use strum::IntoEnumIterator;
use tracing::{Level, info};
use zonewall::agent::Agent;
use zonewall::config::{self, AgentConfig};
use zonewall::core::engine::Firewall;
use zonewall::core::memory::MemoryRuleset;
use zonewall::core::model::{DesiredZone, ObservedZone, ZoneName, ZonePolicy};
use zonewall::core::reconcile::{BackendDriver, Reconciler};
use zonewall::core::rule::Rule;
use zonewall::core::store::{StateStore, StoreError};
use zonewall::core::topology::Topology;
use zonewall::{Error, Result};

shadow_rs::shadow!(build);

#[derive(Parser)]
#[command(name = "zonewall", version)]
#[command(about = "Zone-based nftables firewall agent", long_about = None)]
struct Cli {
    /// Config file (default: <data dir>/config.json)
    #[arg(short, long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile every configured region until interrupted
    Run,
    /// Delete and recreate the firewall table with the zone topology
    Bootstrap {
        /// Network namespace (default: the current one)
        #[arg(short, long)]
        netns: Option<String>,
    },
    /// Show live zone state read back from the kernel
    Show {
        #[arg(short, long)]
        netns: Option<String>,
        /// Only this zone (trust or untrust)
        #[arg(short, long)]
        zone: Option<ZoneName>,
        /// Print every chain's rules instead of zone state
        #[arg(long)]
        rules: bool,
        #[arg(long)]
        json: bool,
    },
    /// Converge one zone to the given interfaces, policy and prefixes
    Sync {
        #[arg(short, long)]
        zone: ZoneName,
        #[arg(short, long)]
        netns: Option<String>,
        /// Interface bound to the zone (repeatable)
        #[arg(short, long = "interface", value_name = "IFNAME")]
        interfaces: Vec<String>,
        /// established-only or all-permit
        #[arg(long)]
        policy: ZonePolicy,
        /// Source prefix allowed into the zone (repeatable)
        #[arg(short, long = "prefix", value_name = "CIDR")]
        prefixes: Vec<String>,
    },
    /// Print the changes the next pass would commit for a region
    Plan {
        #[arg(short, long)]
        region: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start Tokio runtime: {e}");
            return ExitCode::FAILURE;
        }
    };
    match runtime.block_on(handle_cli(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let translation = e.translate();
            eprintln!("Error: {e}");
            if translation.user_message != e.to_string() {
                eprintln!("  {}", translation.user_message);
            }
            for suggestion in &translation.suggestions {
                eprintln!("  - {suggestion}");
            }
            if let Some(url) = &translation.help_url {
                eprintln!("  See {url}");
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(cli: &Cli) {
    let level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };

    // The agent logs to a file in the state directory; one-shot commands
    // log to stderr.
    if matches!(cli.command, Commands::Run)
        && let Some(mut log_path) = zonewall::utils::get_state_dir()
        && zonewall::utils::ensure_dir(&log_path).is_ok()
    {
        log_path.push("zonewall.log");
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
        {
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(file)
                .init();
            return;
        }
    }
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn warn_if_unprivileged() {
    if !nix::unistd::getuid().is_root() {
        eprintln!("Note: not running as root. Programming nftables needs CAP_NET_ADMIN.");
    }
}

/// Runs synchronous kernel work off the async runtime.
async fn blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| Error::Internal(format!("blocking task: {e}")))?
}

async fn load_config(path: Option<&std::path::Path>) -> Result<AgentConfig> {
    let config = config::load_config(path).await?;
    for warning in config.validate()? {
        tracing::warn!("{}", warning);
    }
    Ok(config)
}

fn firewall(config: &AgentConfig, netns: Option<String>) -> Firewall {
    Firewall::new(netns, config.ip_family).with_icmp_limit(config.icmp_limit)
}

async fn handle_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref()).await?;

    match cli.command {
        Commands::Run => {
            info!(
                "zonewall {} ({}{}, built {})",
                build::PKG_VERSION,
                build::SHORT_COMMIT,
                if build::GIT_CLEAN { "" } else { "-dirty" },
                build::BUILD_TIME
            );
            warn_if_unprivileged();
            Agent::new(config)?.run().await?;
        }
        Commands::Bootstrap { netns } => {
            warn_if_unprivileged();
            let fw = firewall(&config, netns);
            let label = fw.netns.clone().unwrap_or_else(|| "current namespace".into());
            let mutations = blocking(move || fw.bootstrap()).await?;
            println!("✓ Bootstrapped {label} ({mutations} changes)");
        }
        Commands::Show {
            netns,
            zone,
            rules,
            json,
        } => {
            let fw = firewall(&config, netns);
            if rules {
                let chains = blocking(move || fw.dump()).await?;
                if json {
                    let map: serde_json::Map<String, serde_json::Value> = chains
                        .iter()
                        .map(|(chain, rules)| {
                            let lines: Vec<String> = rules.iter().map(format_rule).collect();
                            (chain.to_string(), serde_json::json!(lines))
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&map)?);
                } else {
                    for (chain, rules) in &chains {
                        println!("chain {chain}:");
                        for rule in rules {
                            println!("  {}", format_rule(rule));
                        }
                    }
                }
                return Ok(());
            }

            let zones: Vec<ZoneName> = zone.map_or_else(|| ZoneName::iter().collect(), |z| vec![z]);
            let observed = blocking(move || {
                zones
                    .into_iter()
                    .map(|z| fw.read_zone(z).map(|o| (z, o)))
                    .collect::<Result<Vec<(ZoneName, ObservedZone)>>>()
            })
            .await?;
            if json {
                let map: std::collections::BTreeMap<ZoneName, ObservedZone> =
                    observed.into_iter().collect();
                println!("{}", serde_json::to_string_pretty(&map)?);
            } else {
                for (zone, state) in &observed {
                    print_zone(*zone, state);
                }
            }
        }
        Commands::Sync {
            zone,
            netns,
            interfaces,
            policy,
            prefixes,
        } => {
            warn_if_unprivileged();
            let fw = firewall(&config, netns);
            let desired = DesiredZone::new(interfaces, policy, prefixes);
            let outcome = blocking(move || fw.sync_zone(zone, &desired)).await?;
            for rejected in &outcome.rejected {
                println!("✗ Ignored {:?}: {}", rejected.value, rejected.reason);
            }
            println!(
                "✓ Zone {zone} synced ({} interface, {} policy, {} prefix changes)",
                outcome.changes.interfaces, outcome.changes.policy, outcome.changes.prefixes
            );
            print_zone(zone, &outcome.observed);
        }
        Commands::Plan { region } => {
            let region = config.region(&region).cloned().ok_or_else(|| {
                Error::validation("region", format!("region '{region}' is not configured"))
            })?;
            let root = config.state_dir().ok_or(StoreError::StateDirUnavailable)?;
            let store = StateStore::new(root);
            let spec = store.load_spec(&region.name).await?;
            let mut status = store.load_status(&region.name).await?;
            let catalog = store.load_prefixes().await?;

            let fw = firewall(&config, region.netns.clone());
            let chains = blocking(move || fw.dump()).await?;
            let topology = Topology::standard().with_icmp_limit(config.icmp_limit);
            let mirror =
                MemoryRuleset::mirror(&topology, chains.into_iter().flat_map(|(_, rules)| rules));

            let driver = BackendDriver::new(mirror, config.ip_family);
            let mut reconciler = Reconciler::new(&region.name, driver, &catalog, config.retry_after());
            // A first pass that only initializes status touches nothing.
            if reconciler.reconcile(&spec, &mut status)?.requeue {
                reconciler.reconcile(&spec, &mut status)?;
            }

            let planned = reconciler.into_driver().backend;
            if planned.journal().is_empty() {
                println!("Region {} is converged, nothing to do.", region.name);
            } else {
                println!("Region {} would commit:", region.name);
                for op in planned.journal() {
                    println!("  {}", op.describe());
                }
            }
        }
    }
    Ok(())
}

fn format_rule(rule: &Rule) -> String {
    let exprs: Vec<String> = rule.exprs.iter().map(ToString::to_string).collect();
    let handle = rule.handle.map_or_else(|| "-".to_string(), |h| h.to_string());
    match rule.tag {
        Some(kind) => format!("[{handle}] {} # {kind}", exprs.join(" ")),
        None => format!("[{handle}] {}", exprs.join(" ")),
    }
}

fn print_zone(zone: ZoneName, state: &ObservedZone) {
    let policy = state
        .policy
        .map_or_else(|| "unknown".to_string(), |p| p.to_string());
    println!("zone {zone}:");
    println!("  policy:     {policy}");
    println!(
        "  interfaces: {}",
        state.interfaces.iter().cloned().collect::<Vec<_>>().join(", ")
    );
    println!(
        "  prefixes:   {}",
        state.addresses.iter().cloned().collect::<Vec<_>>().join(", ")
    );
}
