//! sealkeepd - sealkeep session daemon
//!
//! Commands:
//! - run: Serve the control channel (default)
//! - enroll: Create an account in the local registry
//! - create-org: Create an organization in the local registry

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use sealkeep_core::registry::AccountRecord;
use sealkeep_core::model::AccountId;
use sealkeep_core::{Config, LocalRegistry, Paths};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "sealkeepd")]
#[command(about = "sealkeep session daemon - holds unlocked key material for local clients")]
#[command(version)]
#[command(after_help = r#"FILES:
    $SEALKEEP_ROOT (default ~/.sealkeep), mode 0700
      daemon.socket   control channel
      daemon.pid      daemon process file
      registry.json   local registry store
      config.json     idle timeout and KDF settings

LOGGING:
    Set RUST_LOG=sealkeepd=debug for request-level logs"#)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the control channel until SIGINT or SIGTERM
    Run,

    /// Create an account (prompts for the password)
    Enroll {
        /// Account email
        #[arg(long)]
        email: String,

        /// Also create this organization
        #[arg(long)]
        org: Option<String>,
    },

    /// Create an organization
    CreateOrg {
        /// Organization name
        name: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = Paths::new();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cmd_run(&paths))
        }
        Commands::Enroll { email, org } => cmd_enroll(&paths, &email, org.as_deref()),
        Commands::CreateOrg { name } => cmd_create_org(&paths, &name),
    }
}

async fn cmd_run(paths: &Paths) -> Result<()> {
    paths.ensure_root()?;
    let config = Config::load(&paths.config)?;
    let registry = Arc::new(LocalRegistry::open(&paths.registry)?);

    sealkeepd::server::run(paths, &config, registry, shutdown_signal()).await?;
    Ok(())
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                _ = term.recv() => info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            info!("Received SIGINT");
        }
    }
}

fn open_registry(paths: &Paths) -> Result<LocalRegistry> {
    paths.ensure_root()?;
    Ok(LocalRegistry::open(&paths.registry)?)
}

fn cmd_enroll(paths: &Paths, email: &str, org: Option<&str>) -> Result<()> {
    let registry = open_registry(paths)?;
    let config = Config::load(&paths.config)?;

    let password = Zeroizing::new(
        rpassword::prompt_password("Password: ").context("Failed to read password")?,
    );
    if password.is_empty() {
        bail!("Empty password not allowed");
    }
    let confirm = Zeroizing::new(
        rpassword::prompt_password("Confirm password: ").context("Failed to read password")?,
    );
    if *password != *confirm {
        bail!("Passwords do not match");
    }

    println!("info: Deriving keys...");
    let enrollment = envelope::enroll(password.as_bytes(), config.kdf)?;
    registry.create_account(AccountRecord {
        id: AccountId::new(),
        email: email.to_string(),
        params: enrollment.params,
        auth_hash: enrollment.auth_hash,
        master_key: enrollment.master_key,
    })?;
    println!("success: Account enrolled: {}", email);

    if let Some(name) = org {
        cmd_create_org_in(&registry, name)?;
    }

    println!();
    println!("Start the daemon with: sealkeepd run");
    println!("Then log in with:      sealkeep login --email {}", email);
    Ok(())
}

fn cmd_create_org(paths: &Paths, name: &str) -> Result<()> {
    let registry = open_registry(paths)?;
    cmd_create_org_in(&registry, name)
}

fn cmd_create_org_in(registry: &LocalRegistry, name: &str) -> Result<()> {
    let org = registry.create_org(name)?;
    println!("success: Org created: {} ({})", org.name, org.id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_command_is_run() {
        let cli = Cli::try_parse_from(["sealkeepd"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_enroll_args() {
        let cli = Cli::try_parse_from(["sealkeepd", "enroll", "--email", "a@b.c", "--org", "acme"])
            .unwrap();
        match cli.command {
            Some(Commands::Enroll { email, org }) => {
                assert_eq!(email, "a@b.c");
                assert_eq!(org.as_deref(), Some("acme"));
            }
            _ => panic!("expected enroll"),
        }
    }

    #[test]
    fn test_enroll_requires_email() {
        assert!(Cli::try_parse_from(["sealkeepd", "enroll"]).is_err());
    }
}
