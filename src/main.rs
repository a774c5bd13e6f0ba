//! prefork - pre-forking socket supervisor.
//!
//! ```text
//! prefork run [-c prefork.toml] [--daemon] [--pidfile P] [--log-json]
//! prefork check [-c prefork.toml]
//! prefork reload [--pidfile P]
//! prefork stop [--pidfile P]
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use nix::sys::signal::Signal;
use std::path::{Path, PathBuf};
use tracing::info;

use prefork::config::{Config, ConfigFile};
use prefork::daemon::{PidFile, daemonize, signal_pidfile};
use prefork::paths;
use prefork::process::ForkProcess;
use prefork::server::EchoServerFactory;
use prefork::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "prefork", version, about = "Pre-forking socket supervisor with graceful reload")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bind the configured sockets and supervise workers until stopped
    Run {
        #[command(flatten)]
        config: ConfigArg,
        /// Detach from the terminal; output goes to ~/.prefork/logs/prefork.log
        #[arg(long)]
        daemon: bool,
        /// Pidfile to write (overrides supervisor.pidfile)
        #[arg(long)]
        pidfile: Option<PathBuf>,
        /// Emit logs as JSON lines
        #[arg(long)]
        log_json: bool,
    },
    /// Load and validate the configuration without starting anything
    Check {
        #[command(flatten)]
        config: ConfigArg,
    },
    /// Ask a running supervisor to reload its configuration (SIGUSR1)
    Reload {
        #[arg(long)]
        pidfile: Option<PathBuf>,
    },
    /// Ask a running supervisor to shut down (SIGTERM)
    Stop {
        #[arg(long)]
        pidfile: Option<PathBuf>,
    },
}

#[derive(Args)]
struct ConfigArg {
    /// Configuration file
    #[arg(short, long, default_value = paths::DEFAULT_CONFIG_FILE)]
    config: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            daemon,
            pidfile,
            log_json,
        } => run(&config.config, daemon, pidfile, log_json),
        Commands::Check { config } => check(&config.config),
        Commands::Reload { pidfile } => send(pidfile, Signal::SIGUSR1, "reload"),
        Commands::Stop { pidfile } => send(pidfile, Signal::SIGTERM, "stop"),
    }
}

fn run(config_path: &Path, daemon: bool, pidfile: Option<PathBuf>, log_json: bool) -> Result<()> {
    // Relative paths must resolve before daemonizing changes directory.
    let config_path = std::path::absolute(config_path)
        .with_context(|| format!("Failed to resolve {}", config_path.display()))?;
    let config = Config::load_from(&config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;

    let pidfile_path = resolve_pidfile(pidfile, config.supervisor.pidfile.as_deref(), daemon)?;

    if daemon {
        daemonize(Some(&paths::get_log_path()?)).context("Failed to daemonize")?;
    }
    init_logging(log_json, !daemon);

    let _pidfile = pidfile_path
        .map(PidFile::create)
        .transpose()
        .context("Failed to write pidfile")?;

    let mut supervisor = Supervisor::with_validation(
        Box::new(ConfigFile::new(&config_path)),
        config.supervisor.validation,
        ForkProcess::new(EchoServerFactory),
    );
    let _signals = supervisor.install_signal_handlers()?;

    info!(pid = %nix::unistd::Pid::this(), config = %config_path.display(), "prefork starting");
    supervisor.run().context("Supervisor failed to start")?;
    Ok(())
}

/// Pick the pidfile: `--pidfile`, then `supervisor.pidfile`, then the
/// default location when daemonizing.
///
/// Relative paths resolve against the current directory, before
/// daemonizing moves to `/`.
fn resolve_pidfile(cli: Option<PathBuf>, configured: Option<&Path>, daemon: bool) -> Result<Option<PathBuf>> {
    let path = match (cli, configured) {
        (Some(path), _) => path,
        (None, Some(path)) => path.to_path_buf(),
        (None, None) if daemon => return Ok(Some(paths::get_pidfile_path()?)),
        (None, None) => return Ok(None),
    };
    let absolute = std::path::absolute(&path)
        .with_context(|| format!("Failed to resolve pidfile {}", path.display()))?;
    Ok(Some(absolute))
}

fn check(config_path: &Path) -> Result<()> {
    let config = Config::load_from(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    let result = config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", config_path.display()))?;

    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }
    for (name, service) in &config.services {
        println!(
            "{name}: {}://{} x{}",
            service.transport, service.address, service.workers
        );
    }
    println!("{} is valid", config_path.display());
    Ok(())
}

fn send(pidfile: Option<PathBuf>, signal: Signal, action: &str) -> Result<()> {
    let path = match pidfile {
        Some(path) => path,
        None => paths::get_pidfile_path()?,
    };
    let pid = signal_pidfile(&path, signal).with_context(|| format!("Failed to {action} supervisor"))?;
    println!("Sent {signal} to prefork (pid {pid})");
    Ok(())
}

/// Initialize tracing with `RUST_LOG` filtering (default `info`).
fn init_logging(json: bool, ansi: bool) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(|| fmt::layer().with_ansi(ansi)))
        .init();
}
