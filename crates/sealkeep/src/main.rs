//! sealkeep - organization keypairs and sealed secrets
//!
//! Every command talks to the local session daemon (`sealkeepd`), which
//! holds the unlocked keys. This binary never sees private key material.
//!
//! Commands:
//! - keypairs list --org <name>: List an organization's keypairs
//! - keypairs generate [--org <name> | --all]: Generate missing keypairs
//! - keypairs revoke <id>: Revoke a keypair
//! - login / logout / lock / status: Manage the daemon session
//! - seal / open: Store and read secrets

mod client;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client::DaemonClient;
use sealkeep_core::daemon::{check_daemon, DaemonStatus};
use sealkeep_core::encoding::from_base64;
use sealkeep_core::format::{relative_time, truncate};
use sealkeep_core::model::{GenerationOutcome, KeypairId};
use sealkeep_core::protocol::{OrgOutcome, WireError};
use sealkeep_core::Paths;
use std::io::{Read, Write};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "sealkeep")]
#[command(about = "Organization keypairs and sealed secrets, served by the sealkeep daemon")]
#[command(version)]
#[command(after_help = r#"SETUP:
    sealkeepd enroll --email you@example.com --org acme
    sealkeepd run &
    sealkeep login --email you@example.com
    sealkeep keypairs generate --org acme

SECURITY:
    - Secrets are sealed per recipient (X25519 + XChaCha20-Poly1305)
    - Envelopes are signed with the org's Ed25519 signing keypair
    - The daemon locks itself after a period of inactivity"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// View and generate organization keypairs
    Keypairs {
        #[command(subcommand)]
        command: KeypairCommands,
    },

    /// Log in to the daemon session (prompts for the password)
    Login {
        /// Account email (prompted if omitted)
        #[arg(long)]
        email: Option<String>,
    },

    /// Log out, discarding all unlocked keys
    Logout,

    /// Lock the session; log in again to unlock
    Lock,

    /// Show daemon and session status
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Seal a secret for an organization (prompts if value not provided)
    Seal {
        /// Organization name
        #[arg(long)]
        org: String,

        /// Resource path of the secret (e.g. db/password)
        #[arg(long)]
        path: String,

        /// Secret value; use "-" to read stdin
        value: Option<String>,
    },

    /// Open a sealed secret and print it
    Open {
        /// Organization name
        #[arg(long)]
        org: String,

        /// Resource path of the secret
        #[arg(long)]
        path: String,

        /// Don't print trailing newline (useful for piping)
        #[arg(short = 'n')]
        no_newline: bool,
    },
}

#[derive(Subcommand)]
enum KeypairCommands {
    /// List your keypairs for an organization
    List {
        /// Org to show keypairs for
        #[arg(long)]
        org: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Generate missing keypairs (first org if neither flag is given)
    Generate {
        /// Org to generate keypairs for
        #[arg(long, conflicts_with = "all")]
        org: Option<String>,

        /// Perform command for all orgs without valid keypairs
        #[arg(long)]
        all: bool,
    },

    /// Revoke a keypair
    Revoke {
        /// Keypair ID
        id: String,
    },
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = Paths::new();

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run_command(&paths, cli.command))
}

async fn run_command(paths: &Paths, command: Commands) -> Result<()> {
    match command {
        Commands::Status { json } => cmd_status(paths, json).await,
        Commands::Keypairs { command } => {
            let client = connect(paths)?;
            match command {
                KeypairCommands::List { org, json } => {
                    cmd_keypairs_list(&client, &org, json).await
                }
                KeypairCommands::Generate { org, all } => {
                    cmd_keypairs_generate(&client, org.as_deref(), all).await
                }
                KeypairCommands::Revoke { id } => cmd_keypairs_revoke(&client, &id).await,
            }
        }
        Commands::Login { email } => cmd_login(&connect(paths)?, email).await,
        Commands::Logout => {
            connect(paths)?.logout().await?;
            println!("success: Logged out");
            Ok(())
        }
        Commands::Lock => {
            let status = connect(paths)?.lock().await?;
            println!("success: Session {}", status.state.replace('_', " "));
            Ok(())
        }
        Commands::Seal { org, path, value } => cmd_seal(&connect(paths)?, &org, &path, value).await,
        Commands::Open {
            org,
            path,
            no_newline,
        } => cmd_open(&connect(paths)?, &org, &path, no_newline).await,
    }
}

/// Client for a running daemon
fn connect(paths: &Paths) -> Result<DaemonClient> {
    match check_daemon(paths) {
        (DaemonStatus::Running, _) => Ok(DaemonClient::new(paths.socket.clone())),
        _ => bail!("The daemon is not running. Start it with: sealkeepd run"),
    }
}

async fn cmd_status(paths: &Paths, json: bool) -> Result<()> {
    let (daemon, pid) = check_daemon(paths);
    let session = if daemon == DaemonStatus::Running {
        Some(DaemonClient::new(paths.socket.clone()).status().await?)
    } else {
        None
    };

    if json {
        let value = serde_json::json!({
            "daemon": daemon.as_str(),
            "pid": pid,
            "session": session,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    match pid {
        Some(pid) => println!("{} daemon {} (pid {})", daemon.symbol(), daemon.as_str(), pid),
        None => println!("{} daemon {}", daemon.symbol(), daemon.as_str()),
    }
    if let Some(session) = session {
        let state = session.state.replace('_', " ");
        match session.email {
            Some(email) => println!("  session: {} ({})", state, email),
            None => println!("  session: {}", state),
        }
        println!("  version: {}", session.version);
    }
    if daemon == DaemonStatus::Stale {
        println!();
        println!("A stale socket or process file was left behind; sealkeepd run will clean it up.");
    }
    Ok(())
}

async fn cmd_login(client: &DaemonClient, email: Option<String>) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => {
            print!("Email: ");
            std::io::stdout().flush()?;
            let mut line = String::new();
            std::io::stdin().read_line(&mut line)?;
            line.trim().to_string()
        }
    };
    if email.is_empty() {
        bail!("Missing flags: --email.");
    }

    let password =
        Zeroizing::new(rpassword::prompt_password("Password: ").context("Failed to read password")?);
    let status = client.login(&email, &password).await?;
    println!(
        "success: Logged in as {}",
        status.email.as_deref().unwrap_or(&email)
    );
    Ok(())
}

async fn cmd_keypairs_list(client: &DaemonClient, org: &str, json: bool) -> Result<()> {
    let list = client.list_keypairs(org).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&list.keypairs)?);
        return Ok(());
    }

    if list.keypairs.is_empty() {
        println!(
            "No keypairs for org {}. Generate them with: sealkeep keypairs generate --org {}",
            list.org.name, list.org.name
        );
        return Ok(());
    }

    println!();
    println!(
        "{:<36}  {:<16}  {:<10}  {:<5}  {}",
        "ID", "ORG", "KEY TYPE", "VALID", "CREATION DATE"
    );
    println!();
    for keypair in &list.keypairs {
        println!(
            "{:<36}  {:<16}  {:<10}  {:<5}  {} ({})",
            keypair.id,
            truncate(&list.org.name, 16),
            keypair.key_type,
            if keypair.revoked() { "NO" } else { "YES" },
            keypair.created_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            relative_time(keypair.created_at),
        );
    }
    println!();
    Ok(())
}

async fn cmd_keypairs_generate(client: &DaemonClient, org: Option<&str>, all: bool) -> Result<()> {
    match client.generate_keypairs(org, all).await {
        Ok(report) => {
            for result in &report.results {
                print_outcome(result);
            }
            Ok(())
        }
        Err(err) => {
            if let Some(partial) = err.downcast_ref::<WireError>().and_then(|w| w.partial.as_ref()) {
                for result in &partial.succeeded {
                    print_outcome(result);
                }
                for failed in &partial.failed {
                    eprintln!("error: {}: {}", failed.org.name, failed.message);
                }
            }
            Err(err)
        }
    }
}

fn print_outcome(result: &OrgOutcome) {
    match &result.outcome {
        GenerationOutcome::AlreadyComplete => {
            println!("info: Org {} already has valid keypairs", result.org.name)
        }
        GenerationOutcome::Generated { key_types } => {
            let types: Vec<&str> = key_types.iter().map(|t| t.as_str()).collect();
            println!(
                "success: Generated {} keypair(s) for org {}",
                types.join(" and "),
                result.org.name
            );
        }
    }
}

async fn cmd_keypairs_revoke(client: &DaemonClient, id: &str) -> Result<()> {
    let keypair_id: KeypairId = id.parse()?;
    let keypair = client.revoke_keypair(keypair_id).await?;
    println!("success: Revoked {} keypair {}", keypair.key_type, keypair.id);
    println!("Generate a replacement with: sealkeep keypairs generate");
    Ok(())
}

async fn cmd_seal(client: &DaemonClient, org: &str, path: &str, value: Option<String>) -> Result<()> {
    let secret = Zeroizing::new(match value.as_deref() {
        Some("-") => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("Failed to read secret from stdin")?;
            buf
        }
        Some(v) => v.to_string(),
        None => rpassword::prompt_password("Enter secret value: ")
            .context("Failed to read secret value")?,
    });
    if secret.is_empty() {
        bail!("Empty value not allowed");
    }

    let report = client.seal(org, path, secret.as_bytes()).await?;
    println!(
        "success: Sealed {} for {} recipient(s), signed by {}",
        report.path, report.recipients, report.signer
    );
    Ok(())
}

async fn cmd_open(client: &DaemonClient, org: &str, path: &str, no_newline: bool) -> Result<()> {
    let report = client.open(org, path).await?;
    let secret = Zeroizing::new(from_base64(&report.secret)?);

    let mut stdout = std::io::stdout();
    stdout.write_all(&secret)?;
    if !no_newline {
        stdout.write_all(b"\n")?;
    }
    stdout.flush()?;
    Ok(())
}
