use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};
use viewer_api::state::AppState;
use viewer_core::{AccountKey, AccountRecord, Platform};
use viewer_store::AccountStore;
use viewer_terminal::{Supervisor, WorkspaceBuilder};

mod config;
use config::AppConfig;

#[derive(Parser)]
#[command(name = "trading-viewer")]
#[command(about = "Trading account hub — manage MetaTrader terminals and relay their telemetry")]
#[command(version)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Path to the TOML config file
    #[arg(
        short,
        long,
        env = "TRADING_VIEWER_CONFIG",
        default_value = "trading-viewer.toml"
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub: account API, terminal supervisor, and data relay
    Serve {
        /// Bind address (overrides the config file)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Manage stored accounts without running the server
    Accounts {
        #[command(subcommand)]
        command: AccountCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// List stored accounts
    List,

    /// Add an account, overwriting any existing one with the same identity
    Add {
        /// Platform (mt4 or mt5)
        #[arg(long)]
        platform: Platform,

        #[arg(long)]
        login: String,

        #[arg(long)]
        password: String,

        /// Broker server name
        #[arg(long)]
        server: String,

        /// Path to the terminal executable
        #[arg(long)]
        terminal_path: PathBuf,
    },

    /// Remove an account
    Remove {
        /// Platform (mt4 or mt5)
        #[arg(long)]
        platform: Platform,

        #[arg(long)]
        login: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    fmt().with_env_filter(filter).with_target(false).init();

    let config = AppConfig::load(&cli.config)?;

    match cli.command {
        Commands::Serve { bind } => serve(config, bind).await,
        Commands::Accounts { command } => accounts(config, command),
    }
}

async fn serve(config: AppConfig, bind: Option<String>) -> Result<()> {
    let bind = bind.unwrap_or(config.bind);
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address {bind:?}"))?;

    let mut builder = WorkspaceBuilder::new(&config.resources_dir, addr.port());
    if let Some(temp_root) = &config.temp_root {
        builder = builder.with_temp_root(temp_root);
    }
    let supervisor = Supervisor::new(builder);
    let store = AccountStore::new(&config.store_path);
    let state = Arc::new(AppState::new(store, Arc::clone(&supervisor)));

    let server = viewer_api::start_server(state, &bind);
    run_until_shutdown(&supervisor, server).await
}

/// Run the server until it fails or a ctrl-c arrives, then kill and reclaim
/// every terminal we still own before reporting the server's verdict. The
/// cleanup must happen on the error path too; a server that dies early would
/// otherwise orphan already-running terminals and their workspaces.
async fn run_until_shutdown(
    supervisor: &Supervisor,
    server: impl std::future::Future<Output = Result<()>>,
) -> Result<()> {
    let result = tokio::select! {
        result = server => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            Ok(())
        }
    };

    supervisor.shutdown().await;
    result
}

fn accounts(config: AppConfig, command: AccountCommands) -> Result<()> {
    let store = AccountStore::new(&config.store_path);

    match command {
        AccountCommands::List => {
            let accounts = store.load()?;
            if accounts.is_empty() {
                println!("No accounts stored.");
                return Ok(());
            }
            for account in accounts {
                println!(
                    "{:<4} {:<12} {:<24} {}",
                    account.platform,
                    account.login,
                    account.server,
                    account.terminal_path.display()
                );
            }
        }
        AccountCommands::Add {
            platform,
            login,
            password,
            server,
            terminal_path,
        } => {
            let record = AccountRecord {
                platform,
                login,
                password,
                server,
                terminal_path,
                status: Default::default(),
            };
            let key = record.key();
            store.upsert(record)?;
            println!("Stored account {key}.");
        }
        AccountCommands::Remove { platform, login } => {
            let key = AccountKey::new(platform, login);
            store.remove(&key)?;
            println!("Removed account {key}.");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[tokio::test]
    async fn server_failure_still_reclaims_terminals() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("terminal.sh");
        std::fs::write(&script, "#!/bin/sh\nsleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script, perms).unwrap();

        let work_root = tmp.path().join("work");
        let builder = WorkspaceBuilder::new(tmp.path().join("resources"), 3001)
            .with_temp_root(work_root.clone());
        let supervisor = Supervisor::new(builder);

        let record = AccountRecord {
            platform: Platform::Mt4,
            login: "1".to_string(),
            password: "p".to_string(),
            server: "Broker-Demo".to_string(),
            terminal_path: script,
            status: Default::default(),
        };
        supervisor.start(&record).await.unwrap();

        let result =
            run_until_shutdown(&supervisor, async { anyhow::bail!("address in use") }).await;

        assert!(result.is_err());
        assert!(supervisor.running().await.is_empty());
        assert_eq!(std::fs::read_dir(&work_root).unwrap().count(), 0);
    }
}
