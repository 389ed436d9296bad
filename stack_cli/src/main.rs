mod input;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use eyre::WrapErr;
use tokio::sync::mpsc;
use tenantstack::bootstrap::{self, LogTarget};
use tenantstack::config::{BackendConfig, ProvisionerConfig};
use tenantstack::events::{DeploymentProgress, EventEnvelope, EventSink};
use tenantstack::models::{AccountTier, DeploymentStatus, Stage};
use tenantstack::service::ProvisioningService;
use tenantstack::ProvisionError;

/// Exit status for each terminal deployment state.
const EXIT_COMPLETED: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_ROLLED_BACK: u8 = 2;
const EXIT_INVALID_CONFIG: u8 = 3;

#[derive(Parser)]
#[command(name = "tenantstack", about = "Tenant infrastructure provisioning")]
struct Cli {
    /// Use the in-memory simulated cloud even if a gateway is configured
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision a tenant stack from a JSON or YAML tenant config
    Provision {
        #[arg(long)]
        config: PathBuf,
        /// Serve the tenant over plain HTTP without a certificate
        #[arg(long, env = "TS_SSL_BYPASS")]
        bypass_ssl: bool,
    },
    /// Show the deployment record of a tenant
    Status { tenant_id: String },
    /// List every known deployment
    List,
    /// Tear a tenant stack down
    Deprovision { tenant_id: String },
    /// Move a tenant to another paid plan
    Upgrade {
        tenant_id: String,
        #[arg(long)]
        tier: AccountTier,
    },
    /// Generate a new master password for the tenant database
    #[command(name = "rotate-password")]
    RotatePassword { tenant_id: String },
    /// Purge cached paths from the tenant's CDN distribution
    Invalidate {
        tenant_id: String,
        /// Path pattern to purge; repeatable, defaults to every path
        #[arg(long = "path")]
        paths: Vec<String>,
    },
    /// Show the health of the tenant's load balancer targets
    Targets { tenant_id: String },
}

#[tokio::main]
async fn main() -> eyre::Result<ExitCode> {
    color_eyre::install()?;
    bootstrap::init_tracing(LogTarget::Stderr);
    let Cli { simulate, command } = Cli::parse();

    let mut config = ProvisionerConfig::from_env();
    if let Command::Provision { bypass_ssl: true, .. } = &command {
        config.ssl_bypass = true;
    }
    let backend = BackendConfig::from_env();
    let cloud = bootstrap::cloud_provider(&backend, &config, simulate)
        .map_err(|e| eyre::eyre!("{e:#}"))
        .wrap_err("selecting cloud backend")?;
    let store = bootstrap::deployment_store(&backend)
        .await
        .map_err(|e| eyre::eyre!("{e:#}"))
        .wrap_err("opening deployment store")?;
    let (events, rx) = EventSink::channel();
    let progress = tokio::spawn(report_progress(rx));
    let service = bootstrap::provisioning_service(config, &cloud, store, events);

    let code = match command {
        Command::Provision { config, .. } => provision(&service, &config).await?,
        Command::Status { tenant_id } => {
            let record = service.get_status(&tenant_id).await;
            print_or_fail(record)?
        }
        Command::List => print_or_fail(service.list().await)?,
        Command::Deprovision { tenant_id } => {
            let report = service.deprovision(&tenant_id).await;
            let failed = matches!(&report, Ok(r) if r.has_failures());
            match print_or_fail(report)? {
                EXIT_COMPLETED if failed => EXIT_FAILED,
                code => code,
            }
        }
        Command::Upgrade { tenant_id, tier } => {
            print_or_fail(service.upgrade_tier(&tenant_id, tier).await)?
        }
        Command::RotatePassword { tenant_id } => {
            let rotated = service
                .rotate_database_password(&tenant_id)
                .await
                .map(|()| serde_json::json!({ "tenant_id": tenant_id, "rotated": true }));
            print_or_fail(rotated)?
        }
        Command::Invalidate { tenant_id, paths } => {
            print_or_fail(service.invalidate_cache(&tenant_id, paths).await)?
        }
        Command::Targets { tenant_id } => print_or_fail(service.target_health(&tenant_id).await)?,
    };

    // Dropping the service closes the event channel.
    drop(service);
    let _ = progress.await;
    Ok(ExitCode::from(code))
}

/// One stderr line per stage transition; stdout stays reserved for JSON.
async fn report_progress(mut rx: mpsc::UnboundedReceiver<EventEnvelope>) {
    let mut progress = DeploymentProgress::default();
    while let Some(envelope) = rx.recv().await {
        let before = progress.clone();
        progress.apply(&envelope.event);
        if let Some(line) = progress_line(&envelope.tenant_id, &before, &progress) {
            eprintln!("{line}");
        }
    }
}

fn progress_line(
    tenant_id: &str,
    before: &DeploymentProgress,
    after: &DeploymentProgress,
) -> Option<String> {
    if after.finished && !before.finished {
        return Some(format!("[{tenant_id}] finished: {}", after.status));
    }
    if after.failed_stage.is_some() && after.failed_stage != before.failed_stage {
        let stage = after.failed_stage?;
        return Some(format!("[{tenant_id}] {stage} failed"));
    }
    if after.compensated.len() > before.compensated.len() {
        let stage = after.compensated.last()?;
        return Some(format!("[{tenant_id}] {stage} rolled back"));
    }
    match after.current_stage {
        Some(stage) if after.current_stage != before.current_stage => Some(format!(
            "[{tenant_id}] {stage} ({}/{} done)",
            after.succeeded.len(),
            Stage::ALL.len()
        )),
        _ => None,
    }
}

async fn provision(service: &ProvisioningService, path: &Path) -> eyre::Result<u8> {
    let tenant = match input::load_tenant_config(path) {
        Ok(tenant) => tenant,
        Err(e) => {
            eprintln!("invalid tenant config: {e:#}");
            return Ok(EXIT_INVALID_CONFIG);
        }
    };

    match service.provision(tenant).await {
        Ok(result) => {
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(exit_code(result.status))
        }
        Err(e @ ProvisionError::ConfigValidation { .. }) => {
            print_error(&e)?;
            Ok(EXIT_INVALID_CONFIG)
        }
        Err(e) => {
            print_error(&e)?;
            Ok(EXIT_FAILED)
        }
    }
}

fn exit_code(status: DeploymentStatus) -> u8 {
    match status {
        DeploymentStatus::Completed => EXIT_COMPLETED,
        DeploymentStatus::RolledBack => EXIT_ROLLED_BACK,
        _ => EXIT_FAILED,
    }
}

fn print_or_fail<T: serde::Serialize>(result: Result<T, ProvisionError>) -> eyre::Result<u8> {
    match result {
        Ok(value) => {
            let json = serde_json::to_string_pretty(&value).wrap_err("serializing output")?;
            println!("{json}");
            Ok(EXIT_COMPLETED)
        }
        Err(e) => {
            print_error(&e)?;
            Ok(EXIT_FAILED)
        }
    }
}

fn print_error(err: &ProvisionError) -> eyre::Result<()> {
    let summary = tenantstack::models::ErrorSummary::from(err);
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use tenantstack::events::ProvisioningEvent;

    use super::*;

    #[test]
    fn terminal_states_map_to_exit_codes() {
        assert_eq!(exit_code(DeploymentStatus::Completed), 0);
        assert_eq!(exit_code(DeploymentStatus::Failed), 1);
        assert_eq!(exit_code(DeploymentStatus::RolledBack), 2);
    }

    #[test]
    fn progress_prints_stage_transitions() {
        let events = [
            ProvisioningEvent::StageStarted { stage: Stage::Certificate },
            ProvisioningEvent::StageSucceeded { stage: Stage::Certificate, duration_ms: 1200 },
            ProvisioningEvent::StageStarted { stage: Stage::Database },
            ProvisioningEvent::StageFailed { stage: Stage::Database, error: "timed out".into() },
        ];
        let mut progress = DeploymentProgress::default();
        let mut lines = Vec::new();
        for event in &events {
            let before = progress.clone();
            progress.apply(event);
            lines.extend(progress_line("acme-1", &before, &progress));
        }
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("[acme-1] certificate"));
        assert!(lines[1].contains("(1/8 done)"));
        assert_eq!(lines[2], "[acme-1] database failed");
    }

    #[test]
    fn cli_parses_repeated_invalidation_paths() {
        let cli = Cli::parse_from([
            "tenantstack", "invalidate", "acme-1", "--path", "/a/*", "--path", "/b",
        ]);
        match cli.command {
            Command::Invalidate { tenant_id, paths } => {
                assert_eq!(tenant_id, "acme-1");
                assert_eq!(paths, vec!["/a/*", "/b"]);
            }
            _ => panic!("expected invalidate"),
        }
    }

    #[test]
    fn cli_parses_upgrade_tier() {
        let cli = Cli::parse_from(["tenantstack", "upgrade", "acme-1", "--tier", "paid/professional"]);
        match cli.command {
            Command::Upgrade { tenant_id, tier } => {
                assert_eq!(tenant_id, "acme-1");
                assert!(tier.is_professional());
            }
            _ => panic!("expected upgrade"),
        }
    }
}
