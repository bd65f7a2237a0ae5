//! otssh - one-time SSH server
//!
//! Generates a throwaway host key, prints it, serves exactly one interactive
//! shell to an authorized peer and exits with the session's status.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};

use ots_core::config::{self, ServerConfig};
use ots_core::logging::init_logging;
use ots_core::types::FAILURE_EXIT_CODE;

#[derive(Parser)]
#[command(name = "otssh")]
#[command(about = "Serve exactly one SSH session, then exit")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// authorized_keys file; read from stdin when omitted
    #[arg(short, long)]
    authorized_keys: Option<PathBuf>,

    /// Command run with the generated public key as its last argument
    #[arg(long)]
    announce: Option<String>,

    /// Copy the server's environment into the shell
    #[arg(long, action = ArgAction::Set, value_name = "BOOL")]
    copy_env: Option<bool>,

    /// File the session transcript is appended to
    #[arg(short, long)]
    log: Option<PathBuf>,

    /// Seconds to wait for the connection
    #[arg(short, long)]
    timeout: Option<u64>,

    /// Port to listen on (keeps the configured host)
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Shell to run instead of $SHELL
    #[arg(long)]
    shell: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Apply command line overrides on top of the loaded configuration
    fn apply(self, mut config: ServerConfig) -> ServerConfig {
        if let Some(bind) = self.bind {
            config.bind_address = bind;
        }
        if let Some(port) = self.port {
            config.set_port(port);
        }
        if let Some(path) = self.authorized_keys {
            config.authorized_keys = Some(path);
        }
        if let Some(command) = self.announce {
            config.announce = Some(command);
        }
        if let Some(copy_env) = self.copy_env {
            config.copy_env = copy_env;
        }
        if let Some(log) = self.log {
            config.transcript_path = log;
        }
        if let Some(secs) = self.timeout {
            config.timeout = std::time::Duration::from_secs(secs);
        }
        if let Some(shell) = self.shell {
            config.shell = Some(shell);
        }
        config
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<ServerConfig> {
    if let Some(config_path) = path {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            ServerConfig::default()
        }))
    } else {
        tracing::debug!("Using default configuration");
        Ok(ServerConfig::default())
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level, args.foreground);

    let code = match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            FAILURE_EXIT_CODE
        }
    };

    ExitCode::from(u8::try_from(code).unwrap_or(FAILURE_EXIT_CODE as u8))
}

async fn run(args: Args) -> Result<i32> {
    let config = load_config(args.config.as_ref())?;
    let config = args.apply(config);

    let outcome = ots_server::orchestrator::run(config)
        .await
        .context("Server failed")?;

    Ok(match outcome {
        Some(outcome) => {
            tracing::info!("Exiting: {}", outcome);
            outcome.exit_code()
        }
        None => 0,
    })
}
