//! Mount Resolver (C3). Grounded in `pilot/discovery/parse.go`'s `hostDirOf`.

use crate::model::MountPoint;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// `destination -> mount` map as built from a container's mount table.
pub type MountMap = HashMap<String, MountPoint>;

pub fn mount_map(mounts: &[MountPoint]) -> MountMap {
    mounts
        .iter()
        .map(|m| (m.destination.clone(), m.clone()))
        .collect()
}

/// Resolves an in-container absolute path to its host-visible counterpart.
///
/// Walks ancestors of `container_path` starting at the path itself: at each
/// step, if `path` is a mount destination, returns `mount.source` joined with
/// the path's position relative to the original container path. Stops when
/// the walk reaches `/` or `.` without a match. If two mounts nest, the
/// innermost wins because the walk starts at the leaf and ascends (the
/// "Mount-map shadowing" design note).
pub fn resolve(container_path: &str, mounts: &MountMap) -> Option<String> {
    if !container_path.starts_with('/') {
        return None;
    }

    let original = Path::new(container_path);
    let mut path: PathBuf = original.to_path_buf();

    loop {
        let key = path.to_string_lossy().to_string();
        if let Some(mount) = mounts.get(&key) {
            if path == original {
                return Some(mount.source.clone());
            }
            let rel = original.strip_prefix(&path).ok()?;
            return Some(format!("{}/{}", mount.source, rel.to_string_lossy()));
        }

        let key_str = key.as_str();
        if key_str == "/" || key_str == "." {
            return None;
        }

        match path.parent() {
            Some(parent) if parent != path => path = parent.to_path_buf(),
            _ => return None,
        }
    }
}

/// Synthesizes the stdout stream's host path per section 4.3, before the
/// `--path.base` prefix is applied.
pub fn stdout_source_path(container_id: &str) -> String {
    format!(
        "/var/lib/docker/containers/{}/{}-json.log",
        container_id, container_id
    )
}

/// Joins a resolved host path (or the synthesized stdout path) with
/// `--path.base`, the host root mounted into the agent's own filesystem.
pub fn with_base(base: &str, host_path: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return host_path.to_string();
    }
    format!("{}/{}", base, host_path.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mount(dest: &str, source: &str) -> MountPoint {
        MountPoint {
            destination: dest.to_string(),
            source: source.to_string(),
        }
    }

    #[test]
    fn resolves_exact_mount_match() {
        let mounts = mount_map(&[mount("/opt/tomcat", "/var/lib/kubelet/pods/p/vol1")]);
        assert_eq!(
            resolve("/opt/tomcat", &mounts),
            Some("/var/lib/kubelet/pods/p/vol1".to_string())
        );
    }

    #[test]
    fn resolves_nested_path_under_a_mount() {
        let mounts = mount_map(&[mount("/opt/tomcat", "/var/lib/kubelet/pods/p/vol1")]);
        assert_eq!(
            resolve("/opt/tomcat/access.log", &mounts),
            Some("/var/lib/kubelet/pods/p/vol1/access.log".to_string())
        );
    }

    #[test]
    fn returns_none_when_no_ancestor_mounted() {
        let mounts = mount_map(&[mount("/opt/other", "/host/other")]);
        assert_eq!(resolve("/opt/tomcat/access.log", &mounts), None);
    }

    #[test]
    fn innermost_mount_wins_when_mounts_nest() {
        let mounts = mount_map(&[
            mount("/opt", "/host/opt"),
            mount("/opt/tomcat", "/host/tomcat"),
        ]);
        assert_eq!(
            resolve("/opt/tomcat/access.log", &mounts),
            Some("/host/tomcat/access.log".to_string())
        );
    }

    #[test]
    fn monotone_in_additional_unrelated_mounts() {
        let mounts_a = mount_map(&[mount("/opt/tomcat", "/host/tomcat")]);
        let mut extended = vec![mount("/opt/tomcat", "/host/tomcat")];
        extended.push(mount("/var/other", "/host/other"));
        let mounts_b = mount_map(&extended);

        assert_eq!(
            resolve("/opt/tomcat/access.log", &mounts_a),
            resolve("/opt/tomcat/access.log", &mounts_b)
        );
    }

    #[test]
    fn with_base_joins_host_root() {
        assert_eq!(with_base("/host", "/var/log/a.log"), "/host/var/log/a.log");
        assert_eq!(with_base("/", "/var/log/a.log"), "/var/log/a.log");
    }
}
