//! Registry Reader (C6). Grounded in `filebeat.go`'s `getRegsitryState`: a
//! JSON array at `<shipperHome>/data/registry`, first-wins de-duplication by
//! `source`.

use crate::model::RegistryState;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub struct RegistryReader {
    registry_path: PathBuf,
}

impl RegistryReader {
    pub fn new(filebeat_home: &str) -> Self {
        Self {
            registry_path: Path::new(filebeat_home).join("data").join("registry"),
        }
    }

    /// Reads and parses the registry snapshot. A missing or malformed file is
    /// an error; the drain scanner (C5) treats that as "skip this tick".
    pub fn snapshot(&self) -> Result<HashMap<String, RegistryState>, crate::errors::agent::Error> {
        let raw = std::fs::read_to_string(&self.registry_path)?;
        let states: Vec<RegistryState> = serde_json::from_str(&raw)?;
        Ok(dedupe_first_wins(states))
    }
}

fn dedupe_first_wins(states: Vec<RegistryState>) -> HashMap<String, RegistryState> {
    let mut map = HashMap::with_capacity(states.len());
    for state in states {
        map.entry(state.source.clone()).or_insert(state);
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_entry(source: &str, offset: i64) -> String {
        format!(
            r#"{{"source":"{}","offset":{},"timestamp":"2020-01-01T00:00:00Z","ttl":0,"type":"log","FileStateOS":{{"inode":1,"device":2}}}}"#,
            source, offset
        )
    }

    #[test]
    fn parses_registry_array_and_dedupes_first_wins() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("data")).unwrap();
        let registry_path = dir.path().join("data").join("registry");
        let mut f = std::fs::File::create(&registry_path).unwrap();
        write!(
            f,
            "[{},{}]",
            sample_entry("/a.log", 10),
            sample_entry("/a.log", 99)
        )
        .unwrap();

        let reader = RegistryReader::new(dir.path().to_str().unwrap());
        let snapshot = reader.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot["/a.log"].offset, 10);
    }

    #[test]
    fn missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let reader = RegistryReader::new(dir.path().to_str().unwrap());
        assert!(reader.snapshot().is_err());
    }
}
