use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use warden_core::coordinator::init_store;
use warden_core::duration::format_duration;
use warden_core::models::{ScheduleKind, Workload};
use warden_core::scheduler::initial_next_fire;
use warden_core::store::{LogFilter, Store};
use warden_core::{Coordinator, DaemonConfig};
use warden_runner::OsRunnerFactory;
use warden_state::SqliteStore;

#[derive(Parser)]
#[command(name = "warden")]
#[command(about = "A daemon that starts, monitors, schedules, and automatically restarts command-line workloads", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, default_value = "sqlite://.warden/warden.db?mode=rwc")]
    database_url: String,

    /// Optional daemon config file (YAML; unknown keys are rejected).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database and seed the built-in restart policies
    Init,

    /// Run the daemon
    Run,

    /// Declare a new workload
    Create {
        /// Unique workload name
        #[arg(short, long)]
        name: String,

        /// Working directory for the command
        #[arg(long)]
        cwd: Option<String>,

        /// Environment overrides as KEY=VALUE (repeatable)
        #[arg(short, long = "env")]
        env: Vec<String>,

        /// Process group label
        #[arg(short, long)]
        group: Option<String>,

        /// Restart policy name
        #[arg(short, long, default_value = "none")]
        policy: String,

        /// Command and arguments (after --)
        #[arg(trailing_var_arg = true, required = true)]
        argv: Vec<String>,
    },

    /// List declared workloads
    List,

    /// Show one workload in full
    Describe {
        /// Workload name
        name: String,
    },

    /// List restart policies
    Policies,

    /// Attach a schedule to a workload
    Schedule {
        /// Workload name
        name: String,

        /// cron | interval | once
        #[arg(short, long)]
        kind: String,

        /// Five-field cron string, duration (e.g. 30s), or RFC 3339 instant
        #[arg(short, long)]
        expression: String,

        /// Create the schedule disabled
        #[arg(long)]
        disabled: bool,
    },

    /// List schedules
    Schedules,

    /// Print captured logs for a workload
    Logs {
        /// Workload name
        name: String,

        /// Only the last N records
        #[arg(short, long)]
        tail: Option<u32>,

        /// stdout | stderr | system
        #[arg(short, long)]
        stream: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => DaemonConfig::from_file(path).map_err(|e| anyhow!(e.to_string()))?,
        None => DaemonConfig::default(),
    };

    let database_url = std::env::var("WARDEN_DATABASE_URL").unwrap_or(cli.database_url);
    let store = Arc::new(SqliteStore::new(&database_url).await?);

    match cli.command {
        Commands::Init => {
            init_store(store.as_ref()).await?;
            println!("✓ Database initialized and built-in policies seeded");
        }

        Commands::Run => {
            info!("starting warden daemon");
            let coordinator = Coordinator::start(config, store, Arc::new(OsRunnerFactory))
                .await
                .map_err(|e| anyhow!(e.to_string()))?;

            tokio::signal::ctrl_c().await?;
            info!("shutdown requested");
            coordinator.shutdown().await;
        }

        Commands::Create {
            name,
            cwd,
            env,
            group,
            policy,
            argv,
        } => {
            init_store(store.as_ref()).await?;
            let policies = store.load_policies().await?;
            if !policies.iter().any(|p| p.name == policy) {
                return Err(anyhow!("unknown policy '{policy}'"));
            }
            if store.load_workloads().await?.iter().any(|w| w.name == name) {
                return Err(anyhow!("workload '{name}' already exists"));
            }

            let now = chrono::Utc::now();
            let workload = Workload {
                id: uuid::Uuid::new_v4(),
                name,
                argv,
                cwd,
                env: parse_env(&env)?,
                group,
                policy,
                created_at: now,
                updated_at: now,
            };
            workload.validate().map_err(|e| anyhow!(e.to_string()))?;
            store.upsert_workload(&workload).await?;

            println!("✓ Created workload: {}", workload.name);
            println!("  ID: {}", workload.id);
            println!("  Command: {}", workload.argv.join(" "));
            println!("  Policy: {}", workload.policy);
        }

        Commands::List => {
            let workloads = store.load_workloads().await?;
            if workloads.is_empty() {
                println!("No workloads declared");
            } else {
                let runtime = store.load_workload_runtime().await?;
                println!(
                    "{:<36} {:<24} {:<12} {:<8} {:<24}",
                    "ID", "Name", "Phase", "PID", "Command"
                );
                println!("{}", "-".repeat(108));
                for w in workloads {
                    let (phase, pid) = runtime
                        .get(&w.id)
                        .map(|(p, pid)| (p.as_str(), *pid))
                        .unwrap_or(("idle", None));
                    println!(
                        "{:<36} {:<24} {:<12} {:<8} {:<24}",
                        w.id,
                        w.name,
                        phase,
                        pid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                        w.argv.join(" ")
                    );
                }
            }
        }

        Commands::Describe { name } => {
            let workload = find_workload(store.as_ref(), &name).await?;
            println!("{}", serde_json::to_string_pretty(&workload)?);
        }

        Commands::Policies => {
            let policies = store.load_policies().await?;
            println!(
                "{:<16} {:<10} {:<10} {:<12} {:<10} {:<8}",
                "Name", "Retries", "Delay", "Multiplier", "MaxDelay", "OnLost"
            );
            println!("{}", "-".repeat(70));
            for p in policies {
                println!(
                    "{:<16} {:<10} {:<10} {:<12} {:<10} {:<8}",
                    p.name,
                    p.max_retries
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unbounded".into()),
                    format_duration(p.initial_delay),
                    p.multiplier,
                    format_duration(p.max_delay),
                    p.restart_on_lost
                );
            }
        }

        Commands::Schedule {
            name,
            kind,
            expression,
            disabled,
        } => {
            let workload = find_workload(store.as_ref(), &name).await?;
            let kind = ScheduleKind::parse(&kind)
                .ok_or_else(|| anyhow!("schedule kind must be cron, interval, or once"))?;
            let tz = config.tz().map_err(|e| anyhow!(e.to_string()))?;
            let now = chrono::Utc::now();
            let next_fire = initial_next_fire(kind, &expression, tz, now)
                .map_err(|e| anyhow!("invalid expression '{expression}': {e}"))?;

            let enabled = !disabled;
            let schedule = warden_core::models::Schedule {
                id: uuid::Uuid::new_v4(),
                workload_id: workload.id,
                kind,
                expression,
                enabled,
                last_fire: None,
                next_fire: if enabled { next_fire } else { None },
                created_at: now,
                updated_at: now,
            };
            store.put_schedule(&schedule).await?;
            println!("✓ Created schedule {} for {}", schedule.id, workload.name);
            if let Some(next) = schedule.next_fire {
                println!("  Next fire: {next}");
            }
        }

        Commands::Schedules => {
            let schedules = store.load_schedules().await?;
            if schedules.is_empty() {
                println!("No schedules declared");
            } else {
                println!(
                    "{:<36} {:<36} {:<10} {:<20} {:<8}",
                    "ID", "Workload", "Kind", "Expression", "Enabled"
                );
                println!("{}", "-".repeat(112));
                for s in schedules {
                    println!(
                        "{:<36} {:<36} {:<10} {:<20} {:<8}",
                        s.id,
                        s.workload_id,
                        s.kind.as_str(),
                        s.expression,
                        s.enabled
                    );
                }
            }
        }

        Commands::Logs { name, tail, stream } => {
            let workload = find_workload(store.as_ref(), &name).await?;
            let stream = match stream {
                Some(raw) => Some(
                    warden_core::models::LogStream::parse(&raw)
                        .ok_or_else(|| anyhow!("stream must be stdout, stderr, or system"))?,
                ),
                None => None,
            };
            let records = store
                .query_logs(
                    workload.id,
                    &LogFilter {
                        tail,
                        stream,
                        ..LogFilter::default()
                    },
                )
                .await?;
            for record in records {
                println!(
                    "{} {:>6} {}",
                    record.at.format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.stream.as_str(),
                    record.display_line()
                );
            }
        }
    }

    Ok(())
}

async fn find_workload(store: &SqliteStore, name: &str) -> Result<Workload> {
    store
        .load_workloads()
        .await?
        .into_iter()
        .find(|w| w.name == name)
        .ok_or_else(|| anyhow!("workload '{name}' not found"))
}

fn parse_env(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("environment entries must be KEY=VALUE, got '{pair}'"))?;
        env.insert(key.to_string(), value.to_string());
    }
    Ok(env)
}
