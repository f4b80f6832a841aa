use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use qqbridge::agent::EchoAgent;
use qqbridge::automation::{admin, AutomationJob, AutomationTarget, ExecutionMode, Schedule, SmartConfig};
use qqbridge::config::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// OneBot v11 gateway bridging QQ conversations to an agent runtime.
#[derive(Parser, Debug)]
#[command(name = "qqbridge")]
#[command(version = "0.1.0")]
#[command(about = "Chat-channel gateway for a conversational agent runtime", long_about = None)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(short, long, default_value = "qqbridge.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the gateway daemon (all accounts, automation, proactive nudge).
    Run,
    /// Validate the config file and print a summary.
    CheckConfig,
    /// Manage automation targets.
    Targets {
        #[command(subcommand)]
        command: TargetCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TargetCommands {
    /// Print a JSON summary of all targets.
    List,
    /// Add or replace a target (upsert by id).
    Add {
        /// Canonical route, e.g. user:12345678.
        #[arg(long)]
        route: String,
        /// Target id; defaults to the route with ':' replaced by '-'.
        #[arg(long)]
        id: Option<String>,
        /// 5-field cron expression.
        #[arg(long)]
        cron: String,
        /// IANA timezone for the cron expression.
        #[arg(long)]
        tz: Option<String>,
        /// Message prompt for the agent turn.
        #[arg(long)]
        message: String,
        #[arg(long, default_value_t = true)]
        enabled: bool,
        #[arg(long, default_value_t = 30)]
        min_silence: u64,
        #[arg(long, default_value_t = 25)]
        active_window: u64,
        #[arg(long, default_value_t = 90)]
        random_min: u64,
        #[arg(long, default_value_t = 240)]
        random_max: u64,
        #[arg(long)]
        max_chars: Option<u32>,
    },
    /// Disable a target by id.
    Disable { id: String },
    /// Remove a target by id.
    Remove { id: String },
    /// Report configuration problems in the target list.
    Audit,
    /// Health-check one target against its persisted automation state.
    Verify {
        /// Select by target id.
        #[arg(long)]
        id: Option<String>,
        /// Select by route when no id is given.
        #[arg(long)]
        route: Option<String>,
    },
    /// Force all targets to agent-only execution.
    MigrateAgentOnly,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run => {
            let config = Config::load(&cli.config)?;
            // The wired agent runtime is provided by the embedding
            // deployment; standalone runs echo for smoke-testing.
            qqbridge::daemon::run(config, Arc::new(EchoAgent)).await
        }
        Commands::CheckConfig => {
            let config = Config::load(&cli.config)?;
            println!(
                "config ok: {} account(s), {} automation target(s), workspace {}",
                config.accounts.len(),
                config.automation.targets.len(),
                config.workspace_dir.display()
            );
            let report = admin::audit_targets(&config.automation.targets);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Commands::Targets { command } => run_targets(&cli.config, command),
    }
}

fn run_targets(config_path: &PathBuf, command: TargetCommands) -> Result<()> {
    let mut config = Config::load(config_path)
        .with_context(|| format!("load config: {}", config_path.display()))?;
    match command {
        TargetCommands::List => {
            let listing = admin::list_targets(&config.automation.targets);
            println!("{}", serde_json::to_string_pretty(&listing)?);
        }
        TargetCommands::Add {
            route,
            id,
            cron,
            tz,
            message,
            enabled,
            min_silence,
            active_window,
            random_min,
            random_max,
            max_chars,
        } => {
            if !qqbridge::route::is_valid_qq_route(&route) {
                anyhow::bail!("invalid route: {route}");
            }
            let target = AutomationTarget {
                id: id.unwrap_or_else(|| AutomationTarget::default_id_for_route(&route)),
                enabled,
                route,
                execution_mode: ExecutionMode::AgentOnly,
                job: AutomationJob {
                    job_type: "cron-agent-turn".to_string(),
                    schedule: Schedule::Cron { expr: cron, tz },
                    message,
                    thinking: None,
                    model: None,
                    timeout_seconds: None,
                    smart: Some(SmartConfig {
                        enabled: true,
                        min_silence_minutes: min_silence,
                        active_conversation_minutes: active_window,
                        random_interval_min_minutes: random_min,
                        random_interval_max_minutes: random_max,
                        max_chars,
                    }),
                },
            };
            let verdict = admin::upsert_target(&mut config.automation.targets, target);
            config.save()?;
            println!("{verdict}");
        }
        TargetCommands::Disable { id } => {
            if !admin::disable_target(&mut config.automation.targets, &id) {
                anyhow::bail!("no target with id: {id}");
            }
            config.save()?;
            println!("disabled");
        }
        TargetCommands::Remove { id } => {
            if !admin::remove_target(&mut config.automation.targets, &id) {
                anyhow::bail!("no target with id: {id}");
            }
            config.save()?;
            println!("removed");
        }
        TargetCommands::Audit => {
            let report = admin::audit_targets(&config.automation.targets);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        TargetCommands::Verify { id, route } => {
            let report = admin::verify_target(
                &config.automation.targets,
                &config.workspace_dir,
                id.as_deref(),
                route.as_deref(),
            );
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        TargetCommands::MigrateAgentOnly => {
            let changed = admin::migrate_agent_only(&mut config.automation.targets);
            config.save()?;
            println!("migrated {changed} target(s)");
        }
    }
    Ok(())
}
