//! Data model shared by the Discovery Reconciler (C4), Configurer (C5) and
//! Registry Reader (C6). See spec section 3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Identity of a single observed container (section 3, `Container`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerIdentity {
    pub id: String,
    pub name: String,
    pub namespace: String,
    pub pod_name: String,
    pub pod_id: String,
}

/// Everything the translation pass needs about a container beyond its identity:
/// release metadata and legacy log sources pulled from the Pod Cache.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub identity: Option<ContainerIdentity>,
    pub release_meta: BTreeMap<String, String>,
    pub legacy_log_sources: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Plain,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Plain
    }
}

/// One collected stream from one container (section 3, `LogConfig`).
/// Field names mirror the original `configurer.LogConfig` struct
/// (`Name`, `LogFile`, `Format`, `Tags`, `InOpts`, `Stdout`) so operator
/// templates written against the original implementation keep working.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogConfig {
    pub name: String,
    pub log_file: String,
    pub format: LogFormat,
    pub tags: BTreeMap<String, String>,
    #[serde(rename = "InOpts")]
    pub input_options: BTreeMap<String, String>,
    #[serde(rename = "Stdout")]
    pub is_stdout: bool,
}

/// An on-disk mount table entry exposed by the container runtime, reduced to
/// what the Mount Resolver (C3) needs.
#[derive(Debug, Clone)]
pub struct MountPoint {
    pub destination: String,
    pub source: String,
}

pub const CURRENT_INPUT_CONFIG_VERSION: &str = "v1";

/// One per-container input file on disk (section 3, `InputConfigFile`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputConfigFile {
    pub namespace: String,
    pub pod: String,
    pub container_name: String,
    pub container_id: String,
    pub version: String,
}

impl InputConfigFile {
    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_{}_{}_{}.yml",
            self.namespace, self.pod, self.container_name, self.container_id, self.version
        )
    }
}

/// Parses the `<namespace>_<pod>_<containerName>_<containerId>_<version>.yml`
/// grammar from section 6. Filenames whose split does not produce exactly 5
/// parts are corrupt.
pub fn parse_input_file_name(file_name: &str) -> Option<InputConfigFile> {
    let stem = file_name.strip_suffix(".yml")?;
    let parts: Vec<&str> = stem.split('_').collect();
    if parts.len() != 5 {
        return None;
    }
    Some(InputConfigFile {
        namespace: parts[0].to_string(),
        pod: parts[1].to_string(),
        container_name: parts[2].to_string(),
        container_id: parts[3].to_string(),
        version: parts[4].to_string(),
    })
}

/// On-disk registry produced by the shipper (section 3, `RegistryState`).
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryState {
    pub source: String,
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
    /// Nanoseconds, matching Go's `time.Duration` JSON encoding.
    pub ttl: i64,
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(rename = "FileStateOS")]
    pub file_state_os: FileStateOs,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileStateOs {
    pub inode: u64,
    pub device: u64,
}

impl RegistryState {
    /// The drain fingerprint: `(source, inode, device, offset)`.
    pub fn fingerprint(&self) -> (String, u64, u64, i64) {
        (
            self.source.clone(),
            self.file_state_os.inode,
            self.file_state_os.device,
            self.offset,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_when_no_component_contains_underscore_or_slash() {
        let f = InputConfigFile {
            namespace: "ns".into(),
            pod: "pod".into(),
            container_name: "cname".into(),
            container_id: "cid".into(),
            version: "v1".into(),
        };
        let parsed = parse_input_file_name(&f.file_name()).unwrap();
        assert_eq!(parsed, f);
    }

    #[test]
    fn rejects_filenames_with_wrong_part_count() {
        assert!(parse_input_file_name("garbage.yml").is_none());
        assert!(parse_input_file_name("a_b_c.yml").is_none());
        assert!(parse_input_file_name("a_b_c_d_e_f.yml").is_none());
    }

    #[test]
    fn rejects_non_yml_suffix() {
        assert!(parse_input_file_name("n_p_c_id_v1.json").is_none());
    }
}
