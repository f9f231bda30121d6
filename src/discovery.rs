//! Discovery Reconciler (C4). Owns the set of known live containers, reacts
//! to runtime events and full-state scans, and drives the Configurer.
//! Grounded in `pilot/discovery/discovery.go`.

use crate::config::AgentConfig;
use crate::configurer::Configurer;
use crate::docker::{ContainerEvent, DockerRuntime, InspectedContainer};
use crate::kube_cache::PodCache;
use crate::model::{ContainerIdentity, LogConfig};
use crate::mount::{mount_map, resolve, stdout_source_path, with_base};
use crate::parse::{build_log_options, LogOptions};
use futures::StreamExt;
use slog::{debug, error, info, o, warn, Logger};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const LABEL_POD_NAME: &str = "io.kubernetes.pod.name";
const LABEL_POD_ID: &str = "io.kubernetes.pod.uid";
const LABEL_POD_NAMESPACE: &str = "io.kubernetes.pod.namespace";
const LABEL_CONTAINER_NAME: &str = "io.kubernetes.container.name";

const TAG_POD_NAME: &str = "kubernetes.pod_name";
const TAG_POD_NAMESPACE: &str = "kubernetes.namespace_name";
const TAG_CONTAINER_NAME: &str = "kubernetes.container_name";
const TAG_NODE_NAME: &str = "node_name";

pub struct Discovery {
    cfg: AgentConfig,
    docker: DockerRuntime,
    pod_cache: Arc<dyn PodCache>,
    configurer: Arc<Configurer>,
    live_set: Mutex<HashMap<String, ContainerIdentity>>,
    logger: Logger,
    stop_tx: watch::Sender<bool>,
    stop_rx: Mutex<Option<watch::Receiver<bool>>>,
}

impl Discovery {
    pub fn new(
        logger: Logger,
        cfg: AgentConfig,
        docker: DockerRuntime,
        pod_cache: Arc<dyn PodCache>,
        configurer: Arc<Configurer>,
    ) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        Self {
            cfg,
            docker,
            pod_cache,
            configurer,
            live_set: Mutex::new(HashMap::new()),
            logger: logger.new(o!("component" => "discovery")),
            stop_tx,
            stop_rx: Mutex::new(Some(stop_rx)),
        }
    }

    /// Section 4.4 lifecycle step 1: sync the pod cache, start the
    /// configurer, bootstrap from disk, scan every running container, then
    /// reconcile disk state against the live-set before entering the event
    /// loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), crate::errors::agent::Error> {
        info!(self.logger, "starting discovery");

        self.pod_cache.start(&self.logger).await?;
        info!(self.logger, "pod cache synced");

        self.configurer.start();
        info!(self.logger, "configurer started");

        let on_disk = self.configurer.bootstrap_check()?;
        info!(self.logger, "bootstrap check complete"; "files" => on_disk.len());

        self.process_all_containers().await?;

        for (container_id, file) in on_disk {
            if !self.exists(&container_id) {
                let identity = ContainerIdentity {
                    id: container_id,
                    name: file.container_name,
                    namespace: file.namespace,
                    pod_name: file.pod,
                    pod_id: String::new(),
                };
                self.configurer.on_destroy(&identity);
            }
        }

        self.event_loop().await
    }

    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.configurer.stop();
    }

    fn exists(&self, id: &str) -> bool {
        self.live_set.lock().unwrap().contains_key(id)
    }

    async fn process_all_containers(&self) -> Result<(), crate::errors::agent::Error> {
        let ids = self.docker.list_container_ids().await?;
        for id in ids {
            let inspected = match self.docker.inspect(&id).await {
                Ok(c) => c,
                Err(e) => {
                    error!(self.logger, "failed to inspect container"; "container_id" => &id, "error" => %e);
                    continue;
                }
            };
            if let Err(e) = self.new_container(inspected).await {
                error!(self.logger, "failed to process container"; "error" => %e);
            }
        }
        Ok(())
    }

    async fn event_loop(&self) -> Result<(), crate::errors::agent::Error> {
        let mut stop_rx = self
            .stop_rx
            .lock()
            .unwrap()
            .take()
            .expect("discovery started twice");

        let mut events = Box::pin(self.docker.events());

        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    info!(self.logger, "discovery watch stopped");
                    return Ok(());
                }
                next = events.next() => {
                    match next {
                        Some(Ok(event)) => self.process_event(event).await,
                        Some(Err(e)) => {
                            warn!(self.logger, "event stream error"; "error" => %e);
                            if is_eof(&e) {
                                return Ok(());
                            }
                            events = Box::pin(self.docker.events());
                        }
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    async fn process_event(&self, event: ContainerEvent) {
        match event.action.as_str() {
            "start" | "restart" => {
                if self.exists(&event.container_id) {
                    debug!(self.logger, "container already known, ignoring"; "container_id" => &event.container_id);
                    return;
                }
                let inspected = match self.docker.inspect(&event.container_id).await {
                    Ok(c) => c,
                    Err(e) => {
                        error!(self.logger, "failed to inspect container on start event"; "container_id" => &event.container_id, "error" => %e);
                        return;
                    }
                };
                if let Err(e) = self.new_container(inspected).await {
                    error!(self.logger, "failed to process start event"; "error" => %e);
                }
            }
            "destroy" => {
                self.del_container(&event.container_id);
            }
            _ => {}
        }
    }

    async fn new_container(&self, container: InspectedContainer) -> Result<(), crate::errors::agent::Error> {
        let (identity, log_configs) = self.translate(&container).await;

        if !is_responsible(&identity, &log_configs, &self.cfg.namespace_whitelist, &self.cfg.namespace_blacklist) {
            debug!(self.logger, "container is not responsible, skipping"; "container_id" => &container.id);
            return Ok(());
        }

        self.configurer.on_add(&identity, &log_configs)?;
        self.live_set.lock().unwrap().insert(identity.id.clone(), identity);
        Ok(())
    }

    fn del_container(&self, id: &str) {
        let removed = self.live_set.lock().unwrap().remove(id);
        if let Some(identity) = removed {
            self.configurer.on_destroy(&identity);
        }
    }

    /// Translation pass (section 4.4): labels -> identity, Pod Cache ->
    /// release meta / legacy sources, env -> `LogOptions`, mounts -> host
    /// paths.
    async fn translate(&self, container: &InspectedContainer) -> (ContainerIdentity, Vec<LogConfig>) {
        let pod_name = container.labels.get(LABEL_POD_NAME).cloned().unwrap_or_default();
        let namespace = container
            .labels
            .get(LABEL_POD_NAMESPACE)
            .cloned()
            .unwrap_or_default();
        let pod_id = container.labels.get(LABEL_POD_ID).cloned().unwrap_or_default();
        let container_name = container
            .labels
            .get(LABEL_CONTAINER_NAME)
            .cloned()
            .unwrap_or_default();

        let identity = ContainerIdentity {
            id: container.id.clone(),
            name: container_name.clone(),
            namespace: namespace.clone(),
            pod_name: pod_name.clone(),
            pod_id,
        };

        let (release_meta, legacy_sources) = if !pod_name.is_empty() && !namespace.is_empty() {
            let release_meta = self
                .pod_cache
                .get_release_meta(&self.logger, &namespace, &pod_name)
                .await;
            let legacy_sources = self
                .pod_cache
                .get_legacy_log_sources(&self.logger, &namespace, &pod_name, &container_name)
                .await;
            (release_meta, legacy_sources)
        } else {
            (BTreeMap::new(), Vec::new())
        };

        let options = build_log_options(&self.cfg.log_prefixes, &container.env, &legacy_sources);
        let mounts = mount_map(&container.mounts);

        let mut log_configs = Vec::new();
        for opts in options.values() {
            match build_log_config(&self.cfg, &container.id, &identity, &release_meta, opts, &mounts) {
                Some(cfg) => log_configs.push(cfg),
                None => {
                    warn!(self.logger, "error parsing log source, skipping"; "source" => &opts.source, "image" => &container.image);
                }
            }
        }

        (identity, log_configs)
    }
}

fn is_eof(e: &bollard::errors::Error) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("eof")
}

/// Section 4.4 "Responsibility filter".
fn is_responsible(
    identity: &ContainerIdentity,
    log_configs: &[LogConfig],
    whitelist: &[String],
    blacklist: &[String],
) -> bool {
    if identity.pod_name.is_empty() || identity.namespace.is_empty() || identity.pod_id.is_empty() {
        return false;
    }
    if identity.name == "POD" {
        return false;
    }
    if !namespace_allowed(&identity.namespace, whitelist, blacklist) {
        return false;
    }
    !log_configs.is_empty()
}

fn namespace_allowed(namespace: &str, whitelist: &[String], blacklist: &[String]) -> bool {
    if blacklist.iter().any(|ns| ns == namespace) {
        return false;
    }
    if !whitelist.is_empty() && !whitelist.iter().any(|ns| ns == namespace) {
        return false;
    }
    true
}

fn container_tags(identity: &ContainerIdentity, node_name: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    put_if_not_empty(&mut tags, TAG_POD_NAME, &identity.pod_name);
    put_if_not_empty(&mut tags, TAG_POD_NAMESPACE, &identity.namespace);
    put_if_not_empty(&mut tags, TAG_CONTAINER_NAME, &identity.name);
    put_if_not_empty(&mut tags, TAG_NODE_NAME, node_name);
    tags
}

fn put_if_not_empty(store: &mut BTreeMap<String, String>, key: &str, value: &str) {
    if key.is_empty() || value.is_empty() {
        return;
    }
    store.insert(key.to_string(), value.to_string());
}

fn build_log_config(
    cfg: &AgentConfig,
    container_id: &str,
    identity: &ContainerIdentity,
    release_meta: &BTreeMap<String, String>,
    opts: &LogOptions,
    mounts: &crate::mount::MountMap,
) -> Option<LogConfig> {
    let is_stdout = opts.name == "stdout";

    if !is_stdout && !opts.source.starts_with('/') {
        return None;
    }

    let host_path = if is_stdout {
        stdout_source_path(container_id)
    } else {
        resolve(&opts.source, mounts)?
    };
    let log_file = with_base(&cfg.base_dir, &host_path);

    let mut tags = container_tags(identity, &cfg.node_name);
    if !is_stdout {
        tags.insert("filePath".to_string(), opts.source.clone());
    }
    for (k, v) in release_meta {
        tags.insert(k.clone(), v.clone());
    }

    Some(LogConfig {
        name: opts.name.clone(),
        log_file,
        format: opts.format,
        tags,
        input_options: opts.input_options.clone(),
        is_stdout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LogFormat;

    fn agent_cfg() -> AgentConfig {
        AgentConfig {
            node_name: "node-1".to_string(),
            docker_api_version: "1.23".to_string(),
            base_dir: "/host".to_string(),
            template_path: String::new(),
            filebeat_home: String::new(),
            log_prefixes: vec!["log_".to_string()],
            namespace_whitelist: Vec::new(),
            namespace_blacklist: Vec::new(),
        }
    }

    fn identity() -> ContainerIdentity {
        ContainerIdentity {
            id: "abc".to_string(),
            name: "app".to_string(),
            namespace: "n".to_string(),
            pod_name: "p".to_string(),
            pod_id: "pid".to_string(),
        }
    }

    #[test]
    fn stdout_default_scenario() {
        let cfg = agent_cfg();
        let opts = LogOptions {
            name: "stdout".to_string(),
            source: "true".to_string(),
            format: LogFormat::Json,
            input_options: BTreeMap::new(),
        };
        let log_config =
            build_log_config(&cfg, "abc", &identity(), &BTreeMap::new(), &opts, &HashMap::new()).unwrap();

        assert_eq!(log_config.name, "stdout");
        assert_eq!(log_config.format, LogFormat::Json);
        assert_eq!(
            log_config.log_file,
            "/host/var/lib/docker/containers/abc/abc-json.log"
        );
        assert!(log_config.is_stdout);
        assert_eq!(log_config.tags.get("kubernetes.pod_name"), Some(&"p".to_string()));
        assert_eq!(
            log_config.tags.get("kubernetes.namespace_name"),
            Some(&"n".to_string())
        );
        assert_eq!(
            log_config.tags.get("kubernetes.container_name"),
            Some(&"app".to_string())
        );
    }

    #[test]
    fn responsibility_filter_rejects_pod_sandbox_container() {
        let mut pod_sandbox = identity();
        pod_sandbox.name = "POD".to_string();
        assert!(!is_responsible(&pod_sandbox, &[], &[], &[]));
    }

    #[test]
    fn responsibility_filter_honors_whitelist_and_blacklist() {
        let id = identity();
        let log_configs = vec![LogConfig {
            name: "stdout".to_string(),
            log_file: "x".to_string(),
            format: LogFormat::Json,
            tags: BTreeMap::new(),
            input_options: BTreeMap::new(),
            is_stdout: true,
        }];

        assert!(is_responsible(&id, &log_configs, &[], &[]));
        assert!(!is_responsible(&id, &log_configs, &[], &["n".to_string()]));
        assert!(!is_responsible(&id, &log_configs, &["other".to_string()], &[]));
        assert!(is_responsible(&id, &log_configs, &["n".to_string()], &[]));
    }

    #[test]
    fn responsibility_filter_requires_at_least_one_log_config() {
        assert!(!is_responsible(&identity(), &[], &[], &[]));
    }
}
