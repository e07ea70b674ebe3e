mod config;
mod database;
mod error;
mod notify;
mod orchestrator;
mod pool;
mod validation;

use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use tracing::info;
use uuid::Uuid;
use vigil::Target;

use crate::config::Config;
use crate::database::{DatabaseImpl, initialize_database};
use crate::error::ServiceError;
use crate::orchestrator::Orchestrator;

/// Scheduled uptime and TLS certificate monitoring
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Config file, defaults to $XDG_CONFIG_HOME/vigil/config.toml
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the monitoring engine until Ctrl-C (default)
    Run,
    /// Add a target to monitor
    AddTarget {
        #[arg(long)]
        name: String,
        url: String,
        /// Add the target without monitoring it yet
        #[arg(long)]
        inactive: bool,
    },
    /// List targets with their last status
    ListTargets,
    /// Enable or disable monitoring of a target
    SetActive {
        id: Uuid,
        #[arg(action = ArgAction::Set)]
        active: bool,
    },
    /// Delete a target with its results and incidents
    RemoveTarget { id: Uuid },
    /// Show recent results and incidents of a target
    History {
        id: Uuid,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// Print the effective configuration
    ShowConfig,
}

#[tokio::main]
async fn main() -> Result<(), ServiceError> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::from_config(cli.config.as_deref())?;
    logger::init_with(&config.logging.level, config.logging.format);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::ShowConfig => {
            println!("{config}");
            Ok(())
        }
        command => manage(&config, command).await,
    }
}

async fn run(config: Config) -> Result<(), ServiceError> {
    info!(database = %config.database.path, "Opening database");
    let pool = pool::open_pool(&config.database.path, config.scheduler.workers * 2).await?;
    Orchestrator::start(config, pool).await?;
    Ok(())
}

async fn open_database(config: &Config) -> Result<DatabaseImpl, ServiceError> {
    let pool = pool::open_pool(&config.database.path, 1).await?;
    let conn = pool.get().await.map_err(anyhow::Error::from)?;
    initialize_database(&conn).await?;
    drop(conn);
    Ok(DatabaseImpl::new_from_pool(pool))
}

/// Target management subcommands
async fn manage(config: &Config, command: Command) -> Result<(), ServiceError> {
    let database = open_database(config).await?;

    match command {
        Command::AddTarget { name, url, inactive } => {
            validation::validate_target_name(&name)
                .map_err(|e| ServiceError::InvalidInput(e.to_string()))?;
            let url = validation::validate_target_url(&url)
                .map_err(|e| ServiceError::InvalidInput(e.to_string()))?;

            let mut target = Target::new(name.trim(), url.as_str());
            target.active = !inactive;
            database.add_target(&target).await?;
            println!("Added target {} ({})", target.id, target.url);
        }
        Command::ListTargets => {
            let records = database.list_targets().await?;
            if records.is_empty() {
                println!("No targets configured");
            }
            for record in records {
                let status = record.status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into());
                let checked = record
                    .last_checked_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "never".into());
                let incident = record
                    .open_incident
                    .map(|id| format!(" [incident #{id} open]"))
                    .unwrap_or_default();
                println!(
                    "{}  {:<8} {:<7} {:<20} {} (checked {}){}",
                    record.target.id,
                    if record.target.active { "active" } else { "paused" },
                    status,
                    record.target.name,
                    record.target.url,
                    checked,
                    incident
                );
            }
        }
        Command::SetActive { id, active } => {
            if !database.set_active(id, active).await? {
                return Err(ServiceError::UnknownTarget(id));
            }
            println!("Target {id} is now {}", if active { "active" } else { "paused" });
        }
        Command::RemoveTarget { id } => {
            if !database.remove_target(id).await? {
                return Err(ServiceError::UnknownTarget(id));
            }
            println!("Removed target {id}");
        }
        Command::History { id, limit } => {
            println!("Uptime results:");
            for result in database.recent_uptime_results(id, limit).await? {
                let detail = match (result.status_code, &result.error_message) {
                    (Some(code), _) => {
                        format!("HTTP {code} in {}ms", result.response_time_ms.unwrap_or_default())
                    }
                    (None, Some(error)) => error.clone(),
                    (None, None) => String::new(),
                };
                let status = result.status.to_string();
                println!("  {}  {:<5} {}", result.timestamp.to_rfc3339(), status, detail);
            }

            println!("Certificate checks:");
            for result in database.recent_tls_results(id, limit).await? {
                match (result.days_remaining, &result.error) {
                    (Some(days), _) => {
                        println!("  {}  expires in {days} days", result.timestamp.to_rfc3339())
                    }
                    (None, Some(error)) => {
                        println!("  {}  failed: {error}", result.timestamp.to_rfc3339())
                    }
                    (None, None) => {}
                }
            }

            println!("Incidents:");
            for incident in database.incidents_for(id, limit).await? {
                let resolved = incident
                    .resolved_at
                    .map(|t| format!("resolved {}", t.to_rfc3339()))
                    .unwrap_or_else(|| "open".into());
                println!(
                    "  #{} opened {} {} {}",
                    incident.id,
                    incident.opened_at.to_rfc3339(),
                    resolved,
                    incident.last_error.as_deref().unwrap_or_default()
                );
            }
        }
        Command::Run | Command::ShowConfig => {}
    }

    Ok(())
}
