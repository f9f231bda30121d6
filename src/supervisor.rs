//! Supervisor (C7). An independent pipeline co-located with the shipper:
//! watch the directory `SRC_CONFIG_PATH` lives in, re-render `DST_CONFIG_PATH`
//! from a template whenever the orchestrator's `..data` symlink-rename lands,
//! and keep exactly one shipper child process running against the latest
//! config. Grounded in `cmd/filebeat-keeper/main.go` and `graceful.go`.

use crate::config::KeeperConfig;
use crate::errors::keeper::{Error, ErrorKind};
use handlebars::Handlebars;
use notify::{watcher, DebouncedEvent, RecursiveMode, Watcher};
use slog::{error, info, o, warn, Logger};
use std::ffi::OsStr;
use std::path::Path;
use std::sync::mpsc as std_mpsc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

const TEMPLATE_NAME: &str = "filebeat";
/// `notify` 4's poll-based fallback interval; also doubles as its internal
/// debounce window, same order of magnitude as the original `fsnotify` loop.
const WATCH_INTERVAL: Duration = Duration::from_secs(2);

pub struct Supervisor {
    cfg: KeeperConfig,
    template: Handlebars<'static>,
    logger: Logger,
}

impl Supervisor {
    pub fn new(logger: Logger, cfg: KeeperConfig) -> Result<Self, Error> {
        let mut template = Handlebars::new();
        template
            .register_template_file(TEMPLATE_NAME, &cfg.template_path)
            .map_err(|e| ErrorKind::Msg(format!("error parse filebeat template: {}", e)))?;

        Ok(Self {
            cfg,
            template,
            logger: logger.new(o!("component" => "supervisor")),
        })
    }

    /// Reads `SRC_CONFIG_PATH` as YAML, renders the template against it, and
    /// writes `DST_CONFIG_PATH` (section 4.7 "Behavior" / Go's `applyChange`).
    fn apply_change(&self) -> Result<(), Error> {
        let raw = std::fs::read_to_string(&self.cfg.src_config_path)?;
        let parsed: serde_yaml::Value = serde_yaml::from_str(&raw)?;
        let rendered = self.template.render(TEMPLATE_NAME, &parsed)?;
        std::fs::write(&self.cfg.dst_config_path, rendered)?;
        Ok(())
    }

    fn new_command(&self, extra_args: &[String]) -> Command {
        info!(self.logger, "will run filebeat"; "path" => &self.cfg.filebeat_exe_path, "args" => extra_args.join(" "));
        let mut cmd = Command::new(&self.cfg.filebeat_exe_path);
        cmd.args(extra_args);
        cmd
    }

    /// Drives the watch -> render -> (re)start loop until `stop_rx` fires,
    /// per section 4.7's child-process lifecycle.
    pub async fn run(
        &self,
        mut stop_rx: watch::Receiver<bool>,
        extra_args: Vec<String>,
    ) -> Result<(), Error> {
        let (reload_tx, mut reload_rx) = mpsc::channel::<()>(1);
        watch_file_change(
            self.logger.clone(),
            Path::new(&self.cfg.src_config_path)
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .to_path_buf(),
            reload_tx.clone(),
        );

        let mut child: Option<Child> = None;

        match self.apply_change() {
            Ok(()) => {
                let _ = reload_tx.send(()).await;
            }
            Err(e) => {
                error!(self.logger, "error generating config file"; "error" => %e);
                info!(self.logger, "filebeat will not start until configmap is updated");
            }
        }

        loop {
            tokio::select! {
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    if !*stop_rx.borrow() {
                        continue;
                    }
                    info!(self.logger, "waiting for filebeat to shut down");
                    if let Some(mut child) = child.take() {
                        let status = child.wait().await?;
                        if !status.success() {
                            return Err(ErrorKind::ChildExited(status.to_string()).into());
                        }
                    }
                    return Ok(());
                }
                Some(()) = reload_rx.recv() => {
                    info!(self.logger, "reload");
                    if let Err(e) = self.apply_change() {
                        error!(self.logger, "error applying change"; "error" => %e);
                        continue;
                    }

                    match child.take() {
                        None => {
                            let started = self.new_command(&extra_args).spawn()?;
                            info!(self.logger, "filebeat start");
                            child = Some(started);
                        }
                        Some(mut running) => {
                            info!(self.logger, "send TERM signal");
                            send_sigterm(&running)?;
                            let status = running.wait().await?;
                            if !status.success() {
                                return Err(ErrorKind::ChildExited(status.to_string()).into());
                            }
                            info!(self.logger, "filebeat quit");
                            child = Some(self.new_command(&extra_args).spawn()?);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_sigterm(child: &Child) -> Result<(), Error> {
    let pid = match child.id() {
        Some(pid) => pid,
        None => return Ok(()),
    };
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGTERM,
    )
    .map_err(|e| ErrorKind::Msg(format!("error sending SIGTERM: {}", e)))?;
    Ok(())
}

/// Watches the directory containing `SRC_CONFIG_PATH` for the orchestrator's
/// atomic `..data` symlink rename and signals a reload. Reacting only to a
/// `CREATE` of basename `..data` (not every event fsnotify reports) mirrors
/// the documented event sequence in the original `filebeat-keeper/main.go`.
fn watch_file_change(logger: Logger, dir: std::path::PathBuf, reload_tx: mpsc::Sender<()>) {
    std::thread::spawn(move || {
        let (tx, rx) = std_mpsc::channel();
        let mut watcher = match watcher(tx, WATCH_INTERVAL) {
            Ok(w) => w,
            Err(e) => {
                error!(logger, "failed to create file watcher"; "error" => %e);
                return;
            }
        };

        if let Err(e) = watcher.watch(&dir, RecursiveMode::NonRecursive) {
            error!(logger, "failed to watch config directory"; "dir" => %dir.display(), "error" => %e);
            return;
        }

        loop {
            match rx.recv() {
                Ok(DebouncedEvent::Create(path)) => {
                    info!(logger, "event"; "kind" => "create", "path" => %path.display());
                    if path.file_name() == Some(OsStr::new("..data")) {
                        info!(logger, "configmap updated");
                        if reload_tx.blocking_send(()).is_err() {
                            return;
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(logger, "watch error, stopping watcher"; "error" => %e);
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_change_renders_template_from_yaml_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("filebeat-output.yml");
        let dst = dir.path().join("filebeat.yml");
        let template_path = dir.path().join("filebeat.yml.tpl");

        std::fs::write(&src, "name: prod\n").unwrap();
        std::fs::write(&template_path, "cluster: {{name}}").unwrap();

        let cfg = KeeperConfig {
            filebeat_exe_path: "filebeat".to_string(),
            src_config_path: src.to_string_lossy().to_string(),
            dst_config_path: dst.to_string_lossy().to_string(),
            template_path: template_path.to_string_lossy().to_string(),
        };

        let supervisor = Supervisor::new(crate::test_support::null_logger(), cfg).unwrap();
        supervisor.apply_change().unwrap();

        let rendered = std::fs::read_to_string(&dst).unwrap();
        assert_eq!(rendered, "cluster: prod");
    }
}
