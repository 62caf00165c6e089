use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use indexmap::IndexMap;
use tracing_subscriber::{fmt, EnvFilter};

use postguard::{Config, MainController};

#[derive(Parser)]
#[command(name = "postguard", version, about = "Postfix policy delegation daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the policy daemon until SIGINT; SIGHUP re-reads the configuration
    Start {
        #[arg(long, default_value = "/etc/postguard/postguard.toml")]
        config: PathBuf,
    },
    /// Check the configuration and every plugin's self-test
    Lint {
        #[arg(long, default_value = "/etc/postguard/postguard.toml")]
        config: PathBuf,
    },
    /// Dry-run one policy request without Postfix, e.g.
    /// `postguard test sender=a@b recipient=c@d`
    Test {
        #[arg(long, default_value = "/etc/postguard/postguard.toml")]
        config: PathBuf,
        /// Use the plugin chain configured for this incoming port
        #[arg(long)]
        port: Option<u16>,
        /// Request attributes as key=value pairs
        attributes: Vec<String>,
    },
    /// Process-backend worker entry point (spawned by the daemon)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        config: PathBuf,
    },
}

fn main() -> ExitCode {
    // Structured logging; level comes from RUST_LOG.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let code = match cli.command {
        // Workers run their own current-thread runtime around a blocking
        // queue loop; everything else gets the multi-threaded runtime.
        Command::Worker { config } => match postguard::procpool::run_worker(&config) {
            Ok(()) => 0,
            Err(err) => {
                eprintln!("{err:#}");
                1
            }
        },
        Command::Start { config } => block_on(start(config)),
        Command::Lint { config } => block_on(lint(config)),
        Command::Test {
            config,
            port,
            attributes,
        } => block_on(test(config, port, attributes)),
    };
    ExitCode::from(code)
}

fn block_on(fut: impl std::future::Future<Output = u8>) -> u8 {
    match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime.block_on(fut),
        Err(err) => {
            eprintln!("could not start runtime: {err}");
            1
        }
    }
}

fn load_config(path: &PathBuf) -> Option<Config> {
    match Config::from_file(path) {
        Ok(config) => Some(config),
        Err(err) => {
            eprintln!("{err}");
            None
        }
    }
}

async fn start(path: PathBuf) -> u8 {
    let Some(config) = load_config(&path) else {
        return 1;
    };
    let mut controller = MainController::new(config, Some(path.clone()));
    if let Err(err) = controller.startup().await {
        eprintln!("{err:#}");
        tracing::info!("postguard shut down after fatal error condition");
        return 1;
    }

    let mut hangup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
        Ok(stream) => Some(stream),
        Err(err) => {
            tracing::warn!(%err, "could not install SIGHUP handler, reload disabled");
            None
        }
    };
    loop {
        match hangup.as_mut() {
            Some(hup) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    _ = hup.recv() => {
                        tracing::info!("SIGHUP received, re-reading configuration");
                        match Config::from_file(&path) {
                            Ok(new_config) => controller.reload(new_config).await,
                            Err(err) => {
                                tracing::error!(%err, "could not re-read configuration, keeping current state")
                            }
                        }
                    }
                }
            }
            None => {
                let _ = tokio::signal::ctrl_c().await;
                break;
            }
        }
    }
    tracing::info!("shutdown signal received");
    controller.shutdown().await;
    0
}

async fn lint(path: PathBuf) -> u8 {
    let Some(config) = load_config(&path) else {
        return 1;
    };
    let mut controller = MainController::new(config, Some(path));
    if controller.lint() > 0 {
        1
    } else {
        0
    }
}

async fn test(path: PathBuf, port: Option<u16>, attributes: Vec<String>) -> u8 {
    let mut values = IndexMap::new();
    for attribute in &attributes {
        match attribute.split_once('=') {
            Some((key, value)) => {
                values.insert(key.to_string(), value.to_string());
            }
            None => {
                eprintln!("attributes must be key=value pairs, got '{attribute}'");
                return 1;
            }
        }
    }
    let Some(config) = load_config(&path) else {
        return 1;
    };
    let mut controller = MainController::new(config, Some(path));
    match controller.test_run(values, port).await {
        Ok(verdict) => {
            println!("action={verdict}");
            0
        }
        Err(err) => {
            eprintln!("{err:#}");
            1
        }
    }
}
