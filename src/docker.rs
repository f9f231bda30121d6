//! Container Runtime Client — the thin collaborator the Discovery Reconciler
//! (C4) depends on. Out of scope per section 1; we specify and implement only
//! the calls the core consumes: list, inspect, and a filtered event stream.
//! Backed by `bollard`, grounded in `pilot/discovery/discovery.go`'s use of
//! `client.ContainerList` / `client.ContainerInspect` / `client.Events`.

use crate::errors::agent::Error;
use crate::model::MountPoint;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::stream::{Stream, StreamExt};
use std::collections::HashMap;

/// A container as reported by `ContainerInspect`, reduced to the fields the
/// translation pass (section 4.4) needs.
#[derive(Debug, Clone)]
pub struct InspectedContainer {
    pub id: String,
    pub image: String,
    pub labels: HashMap<String, String>,
    pub env: Vec<String>,
    pub mounts: Vec<MountPoint>,
}

/// A single `start` / `restart` / `destroy` notification from the runtime
/// event stream (section 4.4 step 2).
#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub action: String,
    pub container_id: String,
}

pub struct DockerRuntime {
    client: Docker,
}

impl DockerRuntime {
    /// Connects using the ambient Docker environment, reading
    /// `DOCKER_API_VERSION` (defaulted to `"1.23"`, per section 6) once.
    pub fn connect(docker_api_version: &str) -> Result<Self, Error> {
        if std::env::var("DOCKER_API_VERSION").is_err() {
            std::env::set_var("DOCKER_API_VERSION", docker_api_version);
        }
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self { client })
    }

    /// Lists every running, non-`removing` container id on the host. `all`
    /// stays at its default `false` so stopped/exited/created containers
    /// never enter the bootstrap scan (section 4.4 step 1) — matching
    /// `discovery.go`'s `ContainerList` call, which uses a zero-value
    /// `types.ContainerListOptions{}`. The `removing` check is a second
    /// filter on top of that already-running set, not a substitute for it.
    pub async fn list_container_ids(&self) -> Result<Vec<String>, Error> {
        let options = Some(ListContainersOptions::<String>::default());
        let containers = self.client.list_containers(options).await?;
        Ok(containers
            .into_iter()
            .filter(|c| c.state.as_deref() != Some("removing"))
            .filter_map(|c| c.id)
            .collect())
    }

    pub async fn inspect(&self, id: &str) -> Result<InspectedContainer, Error> {
        let response = self
            .client
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let config = response.config.unwrap_or_default();
        let labels = config.labels.unwrap_or_default();
        let env = config.env.unwrap_or_default();
        let mounts = response
            .mounts
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| match (m.destination, m.source) {
                (Some(destination), Some(source)) => Some(MountPoint { destination, source }),
                _ => None,
            })
            .collect();

        Ok(InspectedContainer {
            id: response.id.unwrap_or_else(|| id.to_string()),
            image: config.image.unwrap_or_default(),
            labels,
            env,
            mounts,
        })
    }

    /// Subscribes to the `type=container` event stream (section 4.4 step 3).
    pub fn events(&self) -> impl Stream<Item = Result<ContainerEvent, bollard::errors::Error>> {
        let mut filters = HashMap::new();
        filters.insert("type".to_string(), vec!["container".to_string()]);
        let options = Some(EventsOptions::<String> {
            filters,
            ..Default::default()
        });

        self.client.events(options).map(|res| {
            res.map(|msg| {
                let action = msg.action.unwrap_or_default();
                let container_id = msg
                    .actor
                    .and_then(|actor| actor.id)
                    .unwrap_or_default();
                ContainerEvent { action, container_id }
            })
        })
    }
}
