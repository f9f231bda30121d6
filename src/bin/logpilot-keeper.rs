//! `logpilot-keeper`: the sibling supervisor process (C7). Wiring mirrors
//! `cmd/filebeat-keeper/main.go` + `graceful.HandleSignal`: build the
//! Supervisor, hand it a shared stop channel, and drive it until a shutdown
//! signal closes that channel.

use clap::Clap;
use dotenv::dotenv;
use logpilot::cli::KeeperOpts;
use logpilot::config::KeeperConfig;
use logpilot::supervisor::Supervisor;
use slog::{error, info, o, Filter, Level, Logger};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

#[tokio::main]
async fn main() {
    dotenv().ok();

    let opts = KeeperOpts::parse();
    let log = build_logger(&opts.logging_opts);

    info!(log, "starting up logpilot-keeper");

    let cfg = KeeperConfig::from_env(opts.template);
    let supervisor = match Supervisor::new(log.clone(), cfg) {
        Ok(s) => s,
        Err(e) => {
            error!(log, "error creating supervisor"; "error" => e.to_string());
            std::process::exit(1);
        }
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    spawn_signal_handler(log.clone(), stop_tx);

    match supervisor.run(stop_rx, opts.filebeat_args).await {
        Ok(()) => {
            info!(log, "exit the process with 0");
            std::process::exit(0);
        }
        Err(e) => {
            error!(log, "error run keeper"; "error" => e.to_string());
            std::process::exit(1);
        }
    }
}

/// Mirrors `graceful.HandleSignal`: the first of SIGINT/SIGTERM/SIGQUIT
/// closes the shared stop channel; the supervisor then waits for its child
/// to exit before returning.
fn spawn_signal_handler(logger: Logger, stop_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        let mut interrupt = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                error!(logger, "failed to install SIGINT handler"; "error" => %e);
                return;
            }
        };
        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(logger, "failed to install SIGTERM handler"; "error" => %e);
                return;
            }
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(s) => s,
            Err(e) => {
                error!(logger, "failed to install SIGQUIT handler"; "error" => %e);
                return;
            }
        };

        tokio::select! {
            _ = interrupt.recv() => {}
            _ = terminate.recv() => {}
            _ = quit.recv() => {}
        }

        info!(logger, "capture system signal, will close \"closing\" channel");
        let _ = stop_tx.send(true);
    });
}

fn build_logger(logging_opts: &logpilot::cli::LoggingOpts) -> Logger {
    use slog::Drain;

    let level = if logging_opts.error {
        Level::Error
    } else if logging_opts.debug {
        Level::Debug
    } else if logging_opts.verbose > 0 {
        Level::Trace
    } else {
        Level::Info
    };

    let decorator = slog_term::TermDecorator::new().build();
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

fn module_and_line(record: &slog::Record) -> String {
    format!("{}:{}", record.module(), record.line())
}
