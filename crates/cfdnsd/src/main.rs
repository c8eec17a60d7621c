// # cfdnsd - Cloudflare DDNS Daemon
//
// Thin integration layer over cfdns-core. All reconciliation logic lives in
// the core crate; this binary only:
// 1. Parses the command line
// 2. Initializes logging (with a reloadable filter)
// 3. Loads the configuration file
// 4. Wires the Cloudflare provider and the HTTP IP source into the engine
// 5. Runs the driver loop until SIGTERM/SIGINT
//
// ## Configuration
//
// A YAML (`.yaml`/`.yml`) or JSON (`.json`) file, `${VAR}` references
// expanded from the environment:
//
// ```yaml
// zone_id: 023e105f4ecef8ad9ca31a8372d0c353
// token: ${CLOUDFLARE_API_TOKEN}
// frequency: 5m
// timeout: 5s
// workers: 10
// ipv4: true
// ipv6: false
// domains:
//   - hostname: home.example.com
//   - hostname: vpn.example.com
//     proxied: false
// ```
//
// Edits to the file are picked up without a restart.
//
// ## Example
//
// ```bash
// export CLOUDFLARE_API_TOKEN=your_token
// cfdnsd --config /etc/cfdns/cfdns.yaml
// ```

use anyhow::{Context, Result};
use cfdns_core::{Config, ConfigStore, ConfigWatcher, Driver, Error, ReconciliationEngine};
use cfdns_ip_http::HttpIpSource;
use cfdns_provider_cloudflare::CloudflareFactory;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, reload};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// Exit codes for different termination scenarios
///
/// These codes follow systemd conventions:
/// - 0: Clean shutdown
/// - 1: Configuration or startup error
/// - 2: Runtime error (unexpected)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CfdnsExitCode {
    /// Clean shutdown (normal exit)
    CleanShutdown = 0,
    /// Configuration error or startup failure
    ConfigError = 1,
    /// Runtime error (unexpected failure)
    RuntimeError = 2,
}

impl From<CfdnsExitCode> for ExitCode {
    fn from(code: CfdnsExitCode) -> Self {
        ExitCode::from(code as u8)
    }
}

/// Keep Cloudflare DNS records pointed at this host's public address
#[derive(Debug, Parser)]
#[command(name = "cfdnsd", version, about)]
struct Cli {
    /// Configuration file (.yaml, .yml or .json)
    #[arg(short, long, env = "CFDNS_CONFIG", default_value = "cfdns.yaml")]
    config: PathBuf,

    /// Validate the zone, run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Log filter (e.g. `debug`, `cfdns_core=trace`); overrides `verbose`
    #[arg(long, env = "CFDNS_LOG_LEVEL")]
    log_level: Option<String>,
}

type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Pick the log filter: explicit flag, then `RUST_LOG`, then `verbose`
fn log_filter(explicit: Option<&str>, verbose: bool) -> Result<EnvFilter> {
    if let Some(directives) = explicit {
        return EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log level '{}'", directives));
    }
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    Ok(EnvFilter::new(if verbose { "debug" } else { "info" }))
}

fn init_logging(explicit: Option<&str>) -> Result<FilterHandle> {
    let (filter, handle) = reload::Layer::new(log_filter(explicit, false)?);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .context("failed to set tracing subscriber")?;
    Ok(handle)
}

/// Re-apply the filter after the configuration changed
fn apply_verbosity(handle: &FilterHandle, explicit: Option<&str>, verbose: bool) {
    if explicit.is_some() {
        return;
    }
    match log_filter(None, verbose) {
        Ok(filter) => {
            if let Err(e) = handle.reload(filter) {
                error!(error = %e, "failed to update log level");
            }
        }
        Err(e) => error!(error = %e, "failed to build log filter"),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match init_logging(cli.log_level.as_deref()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Logging setup error: {:#}", e);
            return CfdnsExitCode::ConfigError.into();
        }
    };

    let config = match Config::load(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))
    {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return CfdnsExitCode::ConfigError.into();
        }
    };
    apply_verbosity(&filter, cli.log_level.as_deref(), config.verbose);

    info!(
        config = %cli.config.display(),
        domains = config.domains.len(),
        workers = config.workers,
        frequency = %humantime::format_duration(config.frequency),
        "starting cfdnsd"
    );

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to create tokio runtime: {}", e);
            return CfdnsExitCode::RuntimeError.into();
        }
    };

    rt.block_on(run_daemon(cli, config, filter)).into()
}

/// Run the daemon until shutdown
async fn run_daemon(cli: Cli, config: Config, filter: FilterHandle) -> CfdnsExitCode {
    let cancel = CancellationToken::new();
    spawn_signal_listener(cancel.clone());

    let store = match ConfigStore::new(config, Arc::new(CloudflareFactory::new())) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to initialise the Cloudflare client");
            return CfdnsExitCode::ConfigError;
        }
    };
    let engine = Arc::new(ReconciliationEngine::new(store, Arc::new(HttpIpSource::new())));

    let path = cli.config.clone();
    let explicit = cli.log_level.clone();
    let on_reload = move |config: &Config| {
        apply_verbosity(&filter, explicit.as_deref(), config.verbose);
        info!(
            domains = config.domains.len(),
            workers = config.workers,
            "configuration reloaded"
        );
    };
    let driver = Driver::new(engine, Box::new(move || Config::load(&path)))
        .with_reload_hook(Box::new(on_reload));

    match driver.startup(&cancel).await {
        Ok(()) => {}
        Err(_) if cancel.is_cancelled() => return CfdnsExitCode::CleanShutdown,
        Err(e @ Error::ZoneRejected(_)) => {
            error!(error = %e, "zone validation failed");
            return CfdnsExitCode::ConfigError;
        }
        Err(e) => {
            error!(error = %e, "could not validate zone at startup");
            return CfdnsExitCode::ConfigError;
        }
    }

    if cli.once {
        return match driver.run_once(&cancel).await {
            Ok(Some(report)) if report.failed() == 0 => CfdnsExitCode::CleanShutdown,
            Ok(Some(report)) => {
                error!(failed = report.failed(), "cycle finished with failures");
                CfdnsExitCode::RuntimeError
            }
            Ok(None) => CfdnsExitCode::RuntimeError,
            Err(_) if cancel.is_cancelled() => CfdnsExitCode::CleanShutdown,
            Err(e) => {
                error!(error = %e, "cycle failed");
                CfdnsExitCode::RuntimeError
            }
        };
    }

    let changes = ConfigWatcher::new(&cli.config).spawn(cancel.clone());

    match driver.run(&cancel, Some(changes)).await {
        Ok(()) => {
            info!("Shutting down cfdnsd");
            CfdnsExitCode::CleanShutdown
        }
        Err(e) => {
            error!(error = %e, "Daemon error");
            CfdnsExitCode::RuntimeError
        }
    }
}

/// Cancel `cancel` on the first SIGTERM/SIGINT
fn spawn_signal_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        match wait_for_shutdown().await {
            Ok(signal) => info!(signal, "Received shutdown signal"),
            Err(e) => error!(error = %e, "signal handling failed, shutting down"),
        }
        cancel.cancel();
    });
}

/// Wait for shutdown signals (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<&'static str> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to setup SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to setup SIGINT handler")?;

    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

/// Wait for shutdown signals (SIGINT only)
///
/// Fallback implementation for non-Unix platforms.
#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<&'static str> {
    tokio::signal::ctrl_c().await.context("Failed to wait for CTRL-C")?;
    Ok("SIGINT")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_defaults() {
        let cli = Cli::try_parse_from(["cfdnsd"]).unwrap();
        assert!(!cli.once);
    }

    #[test]
    fn cli_flags() {
        let args = [
            "cfdnsd",
            "-c",
            "/etc/cfdns.json",
            "--once",
            "--log-level",
            "debug",
        ];
        let cli = Cli::try_parse_from(args).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/cfdns.json"));
        assert!(cli.once);
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn explicit_log_level_must_parse() {
        assert!(log_filter(Some("debug"), false).is_ok());
        assert!(log_filter(Some("cfdns_core=[bad"), false).is_err());
    }

    #[test]
    fn core_errors_convert_into_anyhow() {
        let err = anyhow::Error::from(Error::config("zone_id cannot be empty"))
            .context("failed to load configuration");
        assert_eq!(
            format!("{:#}", err),
            "failed to load configuration: Configuration error: zone_id cannot be empty"
        );
    }

    #[test]
    fn exit_codes() {
        assert_eq!(CfdnsExitCode::CleanShutdown as u8, 0);
        assert_eq!(CfdnsExitCode::ConfigError as u8, 1);
        assert_eq!(CfdnsExitCode::RuntimeError as u8, 2);
    }
}
