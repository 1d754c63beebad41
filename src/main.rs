//! buildcache
//!
//! Remote build cache server.
//!
//! ```text
//! buildcache server --config /etc/buildcache.yaml
//! echo -n secret | buildcache password-hash
//! ```

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use buildcache::auth::password;
use buildcache::metrics::run_metrics_server;
use buildcache::{BuildCacheServer, Configuration};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Remote build cache server
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the cache server
    Server {
        /// YAML configuration file
        #[arg(short, long, env = "BUILDCACHE_CONFIG")]
        config: PathBuf,
    },
    /// Print the Argon2 hash of a password for the `users` section
    PasswordHash {
        /// Password to hash; read from stdin when omitted
        password: Option<String>,
    },
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    match args.command {
        Command::Server { config } => run_server(config).await,
        Command::PasswordHash { password } => {
            let password = match password {
                Some(password) => password,
                None => {
                    let mut input = String::new();
                    std::io::stdin()
                        .read_to_string(&mut input)
                        .context("reading password from stdin")?;
                    input.trim_end_matches(['\r', '\n']).to_owned()
                }
            };
            println!("{}", password::hash_password(&password)?);
            Ok(())
        }
    }
}

async fn run_server(config_path: PathBuf) -> Result<()> {
    let config = Configuration::load(&config_path)
        .with_context(|| format!("loading configuration from {}", config_path.display()))?;

    info!("Starting build cache server");
    info!("  Listen address: {}", config.listen_address());
    info!("  Server path: {}", config.server_path.as_deref().unwrap_or("/"));
    info!("  Authentication: {:?}", config.authentication);
    info!("  Max request size: {} bytes", config.connection.max_request_size);

    let metrics_shutdown = CancellationToken::new();
    if let Some(metrics_addr) = config.metrics_addr.clone() {
        let token = metrics_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&metrics_addr, token).await {
                error!("Metrics server error: {}", e);
            }
        });
    }

    let server = BuildCacheServer::new(config)
        .await
        .context("initializing cache backend")?;
    let handle = server.bind().await.context("binding listener")?;

    shutdown_signal().await;

    let report = handle.shutdown().await;
    metrics_shutdown.cancel();
    if report.is_clean() {
        info!("Server shutdown complete");
    } else {
        for problem in &report.errors {
            warn!("Shutdown problem: {}", problem);
        }
        warn!("Server shutdown completed with errors");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "hyper=warn".parse() {
        filter = filter.add_directive(directive);
    }

    // Logs go to stderr so `password-hash` output stays clean
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
