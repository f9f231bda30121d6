//! Pod Cache (C1). Grounded in `pilot/kube/cache.go` and `listwatch.go`:
//! list-then-watch restricted to this node, exposing a synchronous lookup of
//! pod annotations/labels plus the legacy "log files" annotation.
//!
//! Modeled behind a capability trait (per the "Pod cache behind an interface"
//! design note) so the Discovery Reconciler can be exercised against a fake
//! in tests.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, Meta};
use kube::Client;
use kube_runtime::reflector::{reflector, store, ObjectRef, Store};
use kube_runtime::watcher;
use futures::StreamExt;
use serde::Deserialize;
use slog::{error, o, Logger};
use std::collections::BTreeMap;
use tokio::sync::watch as tokio_watch;

const ANNOTATION_LOG_FILES: &str = "logging.caicloud.io/logfiles";

const RELEASE_ANNOTATION_KEYS: &[(&str, &str)] = &[
    ("helm.sh/namespace", "kubernetes.annotations.helm_sh/namespace"),
    ("helm.sh/release", "kubernetes.annotations.helm_sh/release"),
];
const RELEASE_LABEL_KEYS: &[(&str, &str)] = &[(
    "controller.caicloud.io/chart",
    "kubernetes.labels.controller_caicloud_io/chart",
)];

#[derive(Debug, Deserialize)]
struct LegacyLogFiles {
    files: Vec<LegacyLogFile>,
}

#[derive(Debug, Deserialize)]
struct LegacyLogFile {
    container: String,
    #[serde(rename = "realPath")]
    real_path: String,
}

#[async_trait]
pub trait PodCache: Send + Sync {
    async fn start(&self, logger: &Logger) -> Result<(), crate::errors::agent::Error>;
    async fn get_release_meta(
        &self,
        logger: &Logger,
        namespace: &str,
        pod: &str,
    ) -> BTreeMap<String, String>;
    async fn get_legacy_log_sources(
        &self,
        logger: &Logger,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Vec<String>;
}

/// `kube_runtime::reflector`-backed cache of every `Pod` scheduled to this
/// node. `start` drives the reflector to its first `Restarted` event (the
/// analogue of `ListWatchCache.Run`'s `WaitForCacheSync`), then hands the
/// ongoing watch to a background task — callers never block on it again.
pub struct KubePodCache {
    client: Client,
    node_name: String,
    store: Store<Pod>,
    writer: std::sync::Mutex<Option<store::Writer<Pod>>>,
}

impl KubePodCache {
    pub fn new(client: Client, node_name: String) -> Self {
        let writer = store::Writer::<Pod>::default();
        let store = writer.as_reader();
        Self {
            client,
            node_name,
            store,
            writer: std::sync::Mutex::new(Some(writer)),
        }
    }

    fn pods_api(&self) -> Api<Pod> {
        Api::all(self.client.clone())
    }

    fn list_params(&self) -> ListParams {
        ListParams::default().fields(&format!("spec.nodeName={}", self.node_name))
    }
}

#[async_trait]
impl PodCache for KubePodCache {
    async fn start(&self, logger: &Logger) -> Result<(), crate::errors::agent::Error> {
        let writer = self
            .writer
            .lock()
            .unwrap()
            .take()
            .expect("pod cache started twice");

        let stream = watcher(self.pods_api(), self.list_params());
        let (ready_tx, mut ready_rx) = tokio_watch::channel(false);

        let task_logger = logger.new(o!("component" => "pod-cache"));
        tokio::spawn(async move {
            let mut reflected = reflector(writer, stream).boxed();
            let mut synced = false;
            while let Some(event) = reflected.next().await {
                match event {
                    Ok(watcher::Event::Restarted(_)) if !synced => {
                        synced = true;
                        let _ = ready_tx.send(true);
                    }
                    Ok(_) => {}
                    Err(e) => error!(task_logger, "pod cache watch error"; "error" => %e),
                }
            }
        });

        // Block the caller until the initial list has been applied (I4).
        while !*ready_rx.borrow() {
            if ready_rx.changed().await.is_err() {
                break;
            }
        }

        Ok(())
    }

    async fn get_release_meta(
        &self,
        logger: &Logger,
        namespace: &str,
        pod: &str,
    ) -> BTreeMap<String, String> {
        let resolved = self.lookup(logger, namespace, pod).await;
        match resolved {
            Some(pod) => release_meta(&pod),
            None => BTreeMap::new(),
        }
    }

    async fn get_legacy_log_sources(
        &self,
        logger: &Logger,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Vec<String> {
        let resolved = match self.lookup(logger, namespace, pod).await {
            Some(pod) => pod,
            None => return Vec::new(),
        };

        let annotations = resolved.meta().annotations.clone().unwrap_or_default();
        let raw = match annotations.get(ANNOTATION_LOG_FILES) {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Vec::new(),
        };

        match serde_json::from_str::<LegacyLogFiles>(raw) {
            Ok(parsed) => parsed
                .files
                .into_iter()
                .filter(|f| f.container == container)
                .map(|f| f.real_path)
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl KubePodCache {
    /// Looks the pod up in the reflector store; on a miss, falls back to a
    /// direct `Api::get` fetch (section 4.1's documented failure semantics,
    /// `cache.go`'s `podsCache.Get`). Any further error is logged and an
    /// empty result returned to the caller — this component never surfaces
    /// an error up through `Discovery`.
    async fn lookup(&self, logger: &Logger, namespace: &str, pod: &str) -> Option<Pod> {
        let key = ObjectRef::new(pod).within(namespace);
        if let Some(found) = self.store.get(&key) {
            return Some(found);
        }

        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.get(pod).await {
            Ok(found) => Some(found),
            Err(e) => {
                error!(logger, "error get pod from cache"; "namespace" => namespace, "pod" => pod, "error" => %e);
                None
            }
        }
    }
}

fn release_meta(pod: &Pod) -> BTreeMap<String, String> {
    let mut ret = BTreeMap::new();
    let annotations = pod.meta().annotations.clone().unwrap_or_default();
    let labels = pod.meta().labels.clone().unwrap_or_default();

    for (key, doc_key) in RELEASE_ANNOTATION_KEYS {
        if let Some(v) = annotations.get(*key) {
            if !v.is_empty() {
                ret.insert(doc_key.to_string(), v.clone());
            }
        }
    }
    for (key, doc_key) in RELEASE_LABEL_KEYS {
        if let Some(v) = labels.get(*key) {
            if !v.is_empty() {
                ret.insert(doc_key.to_string(), v.clone());
            }
        }
    }
    ret
}
