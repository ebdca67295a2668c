//! Biff MCP server binary.
//!
//! `serve` runs the MCP server over stdio for the lifetime of one coding
//! session; the remaining subcommands manage host integration (install,
//! status line, diagnostics) and per-repo setup (`init`).

use std::path::PathBuf;
use std::sync::Arc;

use biff::{load_config, relay_for_config, LoadOptions};
use biff_mcp::{awareness, doctor, install, lifecycle, statusline, BiffServer, ServerState};
use clap::{Parser, Subcommand};
use rmcp::ServiceExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Biff: team presence and messaging beside your coding session.
#[derive(Parser, Debug)]
#[command(name = "biff-mcp", version)]
#[command(about = "MCP server for team presence and messaging")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the MCP server on stdio.
    Serve {
        /// Your login. Auto-detected from gh, falling back to $USER.
        #[arg(long)]
        user: Option<String>,
        /// Data directory override. Auto-computed as {prefix}/biff/{repo}.
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Relay URL override. An empty string forces the local relay.
        #[arg(long)]
        relay_url: Option<String>,
        /// Base path for the computed data directory.
        #[arg(long, default_value = "/tmp")]
        prefix: PathBuf,
    },
    /// Register the MCP server with the host.
    Install,
    /// Install the status bar segment, stashing the current one.
    InstallStatusline,
    /// Remove the MCP server registration.
    Uninstall,
    /// Restore the stashed status bar configuration.
    UninstallStatusline,
    /// Check the environment and relay connectivity.
    Doctor,
    /// Write a .biff template into the current repo root.
    Init,
    /// Render the status bar segment (invoked by the host).
    Statusline,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Log to stderr so nothing interferes with MCP stdio.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Serve {
            user,
            data_dir,
            relay_url,
            prefix,
        } => serve(user, data_dir, relay_url, prefix).await,
        Command::Install => {
            let path = install::mcp_config_path()
                .ok_or_else(|| anyhow::anyhow!("could not resolve home directory"))?;
            println!("{}", install::install(&path)?);
            Ok(())
        }
        Command::Uninstall => {
            let path = install::mcp_config_path()
                .ok_or_else(|| anyhow::anyhow!("could not resolve home directory"))?;
            println!("{}", install::uninstall(&path)?);
            Ok(())
        }
        Command::InstallStatusline => {
            let (settings, stash) = statusline_paths()?;
            println!("{}", statusline::install(&settings, &stash)?);
            Ok(())
        }
        Command::UninstallStatusline => {
            let (settings, stash) = statusline_paths()?;
            println!("{}", statusline::uninstall(&settings, &stash)?);
            Ok(())
        }
        Command::Doctor => {
            let checks = doctor::run_checks().await;
            std::process::exit(doctor::report(&checks));
        }
        Command::Init => {
            let cwd = std::env::current_dir()?;
            let root = biff::config::find_git_root(&cwd)
                .ok_or_else(|| anyhow::anyhow!("not inside a git repository"))?;
            println!("{}", install::init(&root)?);
            Ok(())
        }
        Command::Statusline => {
            use tokio::io::AsyncReadExt;
            let mut stdin_data = String::new();
            let _ = tokio::io::stdin().read_to_string(&mut stdin_data).await;
            let stash = statusline::stash_path()
                .ok_or_else(|| anyhow::anyhow!("could not resolve home directory"))?;
            let unread = statusline::unread_dir()
                .ok_or_else(|| anyhow::anyhow!("could not resolve home directory"))?;
            println!("{}", statusline::run(&stash, &unread, &stdin_data).await);
            Ok(())
        }
        Command::Version => {
            println!("biff-mcp {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

fn statusline_paths() -> anyhow::Result<(PathBuf, PathBuf)> {
    let settings = statusline::settings_path()
        .ok_or_else(|| anyhow::anyhow!("could not resolve home directory"))?;
    let stash = statusline::stash_path()
        .ok_or_else(|| anyhow::anyhow!("could not resolve home directory"))?;
    Ok((settings, stash))
}

async fn serve(
    user: Option<String>,
    data_dir: Option<PathBuf>,
    relay_url: Option<String>,
    prefix: PathBuf,
) -> anyhow::Result<()> {
    let resolved = load_config(LoadOptions {
        user_override: user,
        data_dir_override: data_dir,
        relay_url_override: relay_url.map(Some),
        prefix: Some(prefix),
        start: None,
    })?;
    tracing::info!(
        login = %resolved.identity.login,
        repo = %resolved.repo_name,
        relay = resolved.config.relay_url.as_deref().unwrap_or("local"),
        "starting biff"
    );

    let relay = relay_for_config(&resolved).await?;
    let tty = biff::tty::generate_tty();
    let state = Arc::new(ServerState::new(resolved, relay, tty));

    lifecycle::startup(&state).await?;

    let cancel = CancellationToken::new();
    let poller = awareness::spawn_poller(Arc::clone(&state), cancel.clone());

    let server = BiffServer::new(Arc::clone(&state));
    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|err| {
            tracing::error!(error = %err, "failed to start MCP service");
        })?;

    // Runs until the client closes the transport.
    let _ = service.waiting().await;

    cancel.cancel();
    let _ = poller.await;
    lifecycle::shutdown(&state).await;

    Ok(())
}
