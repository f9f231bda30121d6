//! `logpilot-agent`: the node-local discovery/configurer agent (C1-C6).
//! Wiring mirrors `cmd/log-pilot/main.go`: parse flags, build the Configurer
//! then the Discovery Reconciler on top of it, start discovery in the
//! background, and wait for a shutdown signal.

use clap::Clap;
use dotenv::dotenv;
use logpilot::cli::{AgentOpts, LoggingOpts};
use logpilot::config::AgentConfig;
use logpilot::configurer::Configurer;
use logpilot::discovery::Discovery;
use logpilot::docker::DockerRuntime;
use logpilot::kube_cache::{KubePodCache, PodCache};
use slog::{error, info, o, Filter, Level, Logger};
use std::sync::Arc;
use std::time::Duration;

/// Delay between signaling shutdown and process exit, giving in-flight
/// writes and the drain scanner's current tick a chance to finish. Mirrors
/// `cmd/log-pilot/main.go`'s `time.Sleep(5 * time.Second)` after `d.Stop()`.
const GRACEFUL_SHUTDOWN_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    dotenv().ok();

    let opts = AgentOpts::parse();
    let log = build_logger(&opts.logging_opts, &opts.args.log_level, opts.args.log_to_stderr);

    info!(log, "starting up logpilot-agent");

    let result = run(log.clone(), &opts.args).await;

    match result {
        Ok(()) => {
            info!(log, "exiting"; "code" => 0);
            std::process::exit(0);
        }
        Err(e) => {
            error!(log, "unrecoverable error"; "error" => e.to_string());
            std::process::exit(1);
        }
    }
}

async fn run(log: Logger, args: &logpilot::cli::WatcherArgs) -> Result<(), logpilot::errors::agent::Error> {
    use logpilot::errors::agent::ErrorKind;

    let cfg = AgentConfig::from_env_and_opts(args)?;

    let configurer = Arc::new(Configurer::new(
        log.clone(),
        &cfg.base_dir,
        &cfg.template_path,
        &cfg.filebeat_home,
    )?);

    let kube_client = kube::Client::try_default()
        .await
        .map_err(|e| ErrorKind::CommunicationError(e.to_string()))?;
    let pod_cache: Arc<dyn PodCache> = Arc::new(KubePodCache::new(kube_client, cfg.node_name.clone()));

    let docker = DockerRuntime::connect(&cfg.docker_api_version)?;

    let discovery = Arc::new(Discovery::new(
        log.clone(),
        cfg,
        docker,
        pod_cache,
        configurer,
    ));

    let started = discovery.clone();
    let start_logger = log.clone();
    tokio::spawn(async move {
        if let Err(e) = started.start().await {
            error!(start_logger, "discovery exited with an error"; "error" => e.to_string());
            std::process::exit(1);
        }
    });

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| ErrorKind::ConfigError(format!("failed to install signal handler: {}", e)))?;

    info!(log, "received signal, shutting down");
    discovery.stop();
    tokio::time::delay_for(GRACEFUL_SHUTDOWN_DELAY).await;

    Ok(())
}

/// Logging setup mirrors the teacher's `main.rs`: a `slog-term` drain
/// stacked behind level `Filter`s, `slog-scope`/`slog-stdlog` bridging so
/// crates using the `log` facade (e.g. `kube`, `bollard`) funnel through the
/// same drain. `-v`/`-d`/`--error` override `--logLevel` when present.
fn build_logger(logging_opts: &LoggingOpts, log_level: &str, to_stderr: bool) -> Logger {
    use slog::Drain;

    let level = if logging_opts.error {
        Level::Error
    } else if logging_opts.debug {
        Level::Debug
    } else if logging_opts.verbose > 0 {
        Level::Trace
    } else {
        parse_level(log_level)
    };

    let decorator = if to_stderr {
        slog_term::TermDecorator::new().stderr().build()
    } else {
        slog_term::TermDecorator::new().build()
    };
    let drain = std::sync::Mutex::new(slog_term::FullFormat::new(decorator).build()).fuse();
    let drain = Filter(drain, move |record| record.level().is_at_least(level)).fuse();
    let log = Logger::root(
        drain,
        o!("version" => env!("CARGO_PKG_VERSION"), "module" => slog::FnValue(module_and_line)),
    );

    let guard = slog_scope::set_global_logger(log.clone());
    guard.cancel_reset();
    slog_stdlog::init().ok();

    log
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::Trace,
        "debug" => Level::Debug,
        "warning" | "warn" => Level::Warning,
        "error" => Level::Error,
        "critical" => Level::Critical,
        _ => Level::Info,
    }
}

fn module_and_line(record: &slog::Record) -> String {
    format!("{}:{}", record.module(), record.line())
}
