//! Configurer (C5). Owns `inputs.d/` under the shipper home, renders
//! per-container input files, and runs the deferred-deletion drain scanner.
//! Grounded in `pilot/configurer/filebeat/filebeat.go`.

use crate::errors::agent::{Error, ErrorKind};
use crate::model::{
    parse_input_file_name, ContainerIdentity, InputConfigFile, LogConfig, RegistryState,
    CURRENT_INPUT_CONFIG_VERSION,
};
use crate::registry::RegistryReader;
use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde_json::json;
use slog::{debug, error, info, o, Logger};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::delay_for;

const DRAIN_SCAN_INTERVAL: Duration = Duration::from_secs(60);
const TEMPLATE_NAME: &str = "input";

/// `PendingDeletion`: a container whose destroy event has been observed but
/// whose input file has not yet been confirmed drained (section 3).
#[derive(Debug, Clone)]
struct PendingDeletion {
    container: ContainerIdentity,
    last_states: Vec<RegistryState>,
    last_check_timestamp: Option<DateTime<Utc>>,
}

pub struct Configurer {
    inputs_dir: PathBuf,
    base_dir: String,
    template: Handlebars<'static>,
    pending: Mutex<HashMap<String, PendingDeletion>>,
    registry: RegistryReader,
    logger: Logger,
    stop_tx: watch::Sender<bool>,
    stop_rx: Mutex<Option<watch::Receiver<bool>>>,
}

impl Configurer {
    pub fn new(
        logger: Logger,
        base_dir: &str,
        template_path: &str,
        filebeat_home: &str,
    ) -> Result<Self, Error> {
        let mut template = Handlebars::new();
        template
            .register_template_file(TEMPLATE_NAME, template_path)
            .map_err(|e| ErrorKind::ConfigError(format!("error parse log template: {}", e)))?;

        let inputs_dir = Path::new(filebeat_home).join("inputs.d");
        std::fs::create_dir_all(&inputs_dir)?;

        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Self {
            inputs_dir,
            base_dir: base_dir.to_string(),
            template,
            pending: Mutex::new(HashMap::new()),
            registry: RegistryReader::new(filebeat_home),
            logger: logger.new(o!("component" => "configurer")),
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
        })
    }

    fn container_config_path(&self, identity: &ContainerIdentity) -> PathBuf {
        let file = InputConfigFile {
            namespace: identity.namespace.clone(),
            pod: identity.pod_name.clone(),
            container_name: identity.name.clone(),
            container_id: identity.id.clone(),
            version: CURRENT_INPUT_CONFIG_VERSION.to_string(),
        };
        self.inputs_dir.join(file.file_name())
    }

    /// Launches the periodic drain scanner as a background task.
    pub fn start(self: &std::sync::Arc<Self>) {
        let this = self.clone();
        let mut stop_rx = this
            .stop_rx
            .lock()
            .unwrap()
            .take()
            .expect("configurer started twice");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = delay_for(DRAIN_SCAN_INTERVAL) => {
                        this.scan_tick().await;
                    }
                    _ = stop_rx.changed() => {
                        info!(this.logger, "drain scanner stopping");
                        return;
                    }
                }
            }
        });
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Reads `inputs.d/`, removing corrupt or stale-version files, returning
    /// the survivors keyed by container id (section 4.5, P3).
    pub fn bootstrap_check(&self) -> Result<HashMap<String, InputConfigFile>, Error> {
        let mut ret = HashMap::new();
        let mut to_remove = Vec::new();

        for entry in std::fs::read_dir(&self.inputs_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            match parse_input_file_name(&name) {
                Some(parsed) if parsed.version == CURRENT_INPUT_CONFIG_VERSION => {
                    ret.insert(parsed.container_id.clone(), parsed);
                }
                Some(_) => {
                    info!(self.logger, "removing old version input file"; "file" => &name);
                    to_remove.push(name);
                }
                None => {
                    debug!(self.logger, "removing corrupt input file"; "file" => &name);
                    to_remove.push(name);
                }
            }
        }

        // Fatal per section 7: a failed unlink here would poison I3 for every
        // later invocation, so we propagate instead of logging and continuing.
        for name in to_remove {
            std::fs::remove_file(self.inputs_dir.join(&name))?;
        }

        Ok(ret)
    }

    /// Renders the template and atomically overwrites the container's input
    /// file. Writes to a `.tmp` sibling and renames over the target so the
    /// drain scanner never observes a partially written file.
    pub fn on_add(&self, container: &ContainerIdentity, configs: &[LogConfig]) -> Result<(), Error> {
        let content = self.render(container, configs)?;
        let path = self.container_config_path(container);
        let tmp_path = PathBuf::from(format!("{}.tmp", path.display()));

        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &path)?;

        info!(self.logger, "configuration updated successfully"; "container_id" => &container.id);
        Ok(())
    }

    fn render(&self, container: &ContainerIdentity, configs: &[LogConfig]) -> Result<String, Error> {
        let context = json!({
            "containerId": container.id,
            "configList": configs,
        });
        Ok(self.template.render(TEMPLATE_NAME, &context)?)
    }

    /// Marks a container for deferred deletion. Does not unlink immediately;
    /// the drain scanner decides when the file may be removed.
    pub fn on_destroy(&self, container: &ContainerIdentity) {
        let mut pending = self.pending.lock().unwrap();
        pending.entry(container.id.clone()).or_insert_with(|| PendingDeletion {
            container: container.clone(),
            last_states: Vec::new(),
            last_check_timestamp: None,
        });
    }

    async fn scan_tick(&self) {
        let registry = match self.registry.snapshot() {
            Ok(r) => r,
            Err(e) => {
                debug!(self.logger, "skipping drain scan tick, registry unreadable"; "error" => %e);
                return;
            }
        };

        let mut pending = self.pending.lock().unwrap();
        let mut to_drop = Vec::new();

        for (id, entry) in pending.iter_mut() {
            let path = self.container_config_path(&entry.container);
            if !path.exists() {
                to_drop.push(id.clone());
                continue;
            }

            if can_remove_conf(entry, &registry, &self.base_dir) {
                match std::fs::remove_file(&path) {
                    Ok(()) => {
                        info!(self.logger, "removed drained input file"; "container_id" => id);
                        to_drop.push(id.clone());
                    }
                    Err(e) => {
                        error!(self.logger, "failed to remove input file, retrying next tick"; "container_id" => id, "error" => %e);
                    }
                }
            }
        }

        for id in to_drop {
            pending.remove(&id);
        }
    }
}

fn empty_dir_prefix(base_dir: &str, pod_id: &str) -> String {
    format!(
        "{}/var/lib/kubelet/pods/{}/volumes/kubernetes.io~empty-dir",
        base_dir.trim_end_matches('/'),
        pod_id
    )
}

/// The central drain check (section 4.5). Returns `true` once the pod's
/// empty-dir registry entries have held the same fingerprints across two
/// consecutive scan ticks (or never had any entries at all).
fn can_remove_conf(
    entry: &mut PendingDeletion,
    registry: &HashMap<String, RegistryState>,
    base_dir: &str,
) -> bool {
    let prefix = empty_dir_prefix(base_dir, &entry.container.pod_id);

    let mut current: Vec<RegistryState> = registry
        .values()
        .filter(|s| s.source.starts_with(&prefix))
        .cloned()
        .collect();
    current.sort_by(|a, b| a.source.cmp(&b.source));

    if entry.last_check_timestamp.is_none() {
        let was_empty = current.is_empty();
        entry.last_states = current;
        entry.last_check_timestamp = Some(Utc::now());
        return was_empty;
    }

    let changed = current.len() != entry.last_states.len()
        || current
            .iter()
            .zip(entry.last_states.iter())
            .any(|(a, b)| a.fingerprint() != b.fingerprint());

    if changed {
        entry.last_states = current;
        entry.last_check_timestamp = Some(Utc::now());
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FileStateOs;

    fn identity(id: &str, pod_id: &str) -> ContainerIdentity {
        ContainerIdentity {
            id: id.to_string(),
            name: "c".to_string(),
            namespace: "n".to_string(),
            pod_name: "p".to_string(),
            pod_id: pod_id.to_string(),
        }
    }

    fn state(source: &str, offset: i64) -> RegistryState {
        RegistryState {
            source: source.to_string(),
            offset,
            timestamp: Utc::now(),
            ttl: 0,
            type_: "log".to_string(),
            file_state_os: FileStateOs {
                inode: 1,
                device: 2,
            },
        }
    }

    fn pending(pod_id: &str) -> PendingDeletion {
        PendingDeletion {
            container: identity("abc", pod_id),
            last_states: Vec::new(),
            last_check_timestamp: None,
        }
    }

    #[test]
    fn first_visit_with_no_matching_states_allows_removal() {
        let mut entry = pending("P");
        let registry = HashMap::new();
        assert!(can_remove_conf(&mut entry, &registry, "/host"));
    }

    #[test]
    fn first_visit_with_states_denies_removal() {
        let mut entry = pending("P");
        let mut registry = HashMap::new();
        let prefix = empty_dir_prefix("/host", "P");
        registry.insert(
            format!("{}/a.log", prefix),
            state(&format!("{}/a.log", prefix), 100),
        );
        assert!(!can_remove_conf(&mut entry, &registry, "/host"));
        assert_eq!(entry.last_states.len(), 1);
    }

    #[test]
    fn drain_retain_then_release_matches_scenario_5() {
        let mut entry = pending("P");
        let prefix = empty_dir_prefix("/host", "P");
        let src_a = format!("{}/a.log", prefix);
        let src_b = format!("{}/b.log", prefix);

        let mut tick1 = HashMap::new();
        tick1.insert(src_a.clone(), state(&src_a, 100));
        tick1.insert(src_b.clone(), state(&src_b, 200));
        assert!(!can_remove_conf(&mut entry, &tick1, "/host"));

        let mut tick2 = HashMap::new();
        tick2.insert(src_a.clone(), state(&src_a, 105));
        tick2.insert(src_b.clone(), state(&src_b, 200));
        assert!(!can_remove_conf(&mut entry, &tick2, "/host"));

        let mut tick3 = HashMap::new();
        tick3.insert(src_a.clone(), state(&src_a, 105));
        tick3.insert(src_b.clone(), state(&src_b, 200));
        assert!(can_remove_conf(&mut entry, &tick3, "/host"));
    }

    #[test]
    fn bootstrap_cleans_stale_and_corrupt_files() {
        let logger = crate::test_support::null_logger();
        let dir = tempfile::tempdir().unwrap();
        let inputs_dir = dir.path().join("inputs.d");
        std::fs::create_dir_all(&inputs_dir).unwrap();
        std::fs::write(inputs_dir.join("n_p_c_id1_v1.yml"), "x").unwrap();
        std::fs::write(inputs_dir.join("n_p_c_id2_v0.yml"), "x").unwrap();
        std::fs::write(inputs_dir.join("garbage.yml"), "x").unwrap();

        let template_path = dir.path().join("template.hbs");
        std::fs::write(&template_path, "{{containerId}}").unwrap();

        let configurer = Configurer::new(
            logger,
            "/host",
            template_path.to_str().unwrap(),
            dir.path().to_str().unwrap(),
        )
        .unwrap();

        let result = configurer.bootstrap_check().unwrap();
        assert_eq!(result.len(), 1);
        assert!(result.contains_key("id1"));

        let remaining: Vec<_> = std::fs::read_dir(&inputs_dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(remaining, vec!["n_p_c_id1_v1.yml".to_string()]);
    }

    #[test]
    fn on_add_then_bootstrap_round_trips_the_file() {
        let logger = crate::test_support::null_logger();
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("template.hbs");
        std::fs::write(&template_path, "id={{containerId}}").unwrap();

        let configurer = Configurer::new(
            logger,
            "/host",
            template_path.to_str().unwrap(),
            dir.path().to_str().unwrap(),
        )
        .unwrap();

        let identity = identity("abc123", "podid");
        configurer.on_add(&identity, &[]).unwrap();

        let result = configurer.bootstrap_check().unwrap();
        assert!(result.contains_key("abc123"));
    }
}
