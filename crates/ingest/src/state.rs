use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

/// Usage counters for one remote storage unit. The unit id is its key in
/// [`AllocatorState::units`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageUnit {
    #[serde(alias = "size")]
    pub used_bytes: u64,
    #[serde(alias = "files")]
    pub file_count: u64,
}

impl StorageUnit {
    pub fn is_empty(&self) -> bool {
        self.used_bytes == 0 && self.file_count == 0
    }
}

/// Process-wide allocation record, persisted between passes and restarts.
/// The aliases read state files written by the earlier ingest script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocatorState {
    #[serde(alias = "currentRepo")]
    pub current_unit_id: String,
    #[serde(alias = "repos")]
    pub units: BTreeMap<String, StorageUnit>,
    #[serde(alias = "nextRepoIndex")]
    pub next_unit_ordinal: u64,
    /// Job key -> unit it was last published to. Lets a replayed publish
    /// be recognised so its bytes are not credited twice.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub published: BTreeMap<String, String>,
}

/// A detected inconsistency between the counters and what they should hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateViolation {
    CurrentUnitMissing(String),
    OverCeiling { unit: String, used_bytes: u64, ceiling: u64 },
    OrdinalBehind { unit: String, next_unit_ordinal: u64 },
}

impl std::fmt::Display for StateViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateViolation::CurrentUnitMissing(id) => {
                write!(f, "current unit {} is not registered", id)
            }
            StateViolation::OverCeiling { unit, used_bytes, ceiling } => {
                write!(f, "unit {} holds {} bytes, above the {} byte ceiling", unit, used_bytes, ceiling)
            }
            StateViolation::OrdinalBehind { unit, next_unit_ordinal } => {
                write!(f, "unit {} already exists but next ordinal is {}", unit, next_unit_ordinal)
            }
        }
    }
}

impl AllocatorState {
    /// Fresh state with a single pre-existing, empty unit
    pub fn initial(initial_unit_id: &str) -> Self {
        let mut units = BTreeMap::new();
        units.insert(initial_unit_id.to_string(), StorageUnit::default());
        Self {
            current_unit_id: initial_unit_id.to_string(),
            units,
            next_unit_ordinal: 2,
            published: BTreeMap::new(),
        }
    }

    pub fn current_unit(&self) -> Option<&StorageUnit> {
        self.units.get(&self.current_unit_id)
    }

    pub fn total_files(&self) -> u64 {
        self.units.values().map(|u| u.file_count).sum()
    }

    /// Check the counters for drift. Local counters are the only source of
    /// truth for capacity, so anything odd here is worth an operator's look.
    pub fn check_invariants(&self, ceiling: u64, prefix: &str) -> Vec<StateViolation> {
        let mut violations = Vec::new();

        if !self.units.contains_key(&self.current_unit_id) {
            violations.push(StateViolation::CurrentUnitMissing(self.current_unit_id.clone()));
        }

        for (id, unit) in &self.units {
            // A lone oversized artifact is allowed into an empty unit
            if unit.used_bytes > ceiling && unit.file_count > 1 {
                violations.push(StateViolation::OverCeiling {
                    unit: id.clone(),
                    used_bytes: unit.used_bytes,
                    ceiling,
                });
            }

            let ordinal = id.strip_prefix(prefix).and_then(|n| n.parse::<u64>().ok());
            if let Some(ordinal) = ordinal {
                if ordinal >= self.next_unit_ordinal {
                    violations.push(StateViolation::OrdinalBehind {
                        unit: id.clone(),
                        next_unit_ordinal: self.next_unit_ordinal,
                    });
                }
            }
        }

        violations
    }
}

/// Whether a load failed because the stored state could not be parsed,
/// as opposed to not being readable at all
pub fn is_corrupt(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<serde_json::Error>())
}

/// Durable home of the allocator state
pub trait StateStore: Send + Sync {
    /// Load the persisted state, or the initial state if none was ever saved
    fn load(&self) -> Result<AllocatorState>;

    /// Persist the state so that a crash leaves either the old or the new copy
    fn save(&self, state: &AllocatorState) -> Result<()>;
}

/// Pretty JSON file replaced atomically on every save
#[derive(Debug, Clone)]
pub struct JsonStateStore {
    path: PathBuf,
    initial_unit_id: String,
}

impl JsonStateStore {
    pub fn new(path: impl Into<PathBuf>, initial_unit_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            initial_unit_id: initial_unit_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonStateStore {
    fn load(&self) -> Result<AllocatorState> {
        if !self.path.exists() {
            log::info!(
                "No state file at {}, starting from unit {}",
                self.path.display(),
                self.initial_unit_id
            );
            return Ok(AllocatorState::initial(&self.initial_unit_id));
        }

        let content = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read state file: {}", self.path.display()))?;
        // A corrupt file is an error, never a reset: the counters would be lost
        let state: AllocatorState = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))?;
        Ok(state)
    }

    fn save(&self, state: &AllocatorState) -> Result<()> {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&parent)
            .with_context(|| format!("Failed to create state directory: {}", parent.display()))?;

        let json = serde_json::to_vec_pretty(state).context("Failed to serialize state")?;

        let mut temp = NamedTempFile::new_in(&parent)
            .with_context(|| format!("Failed to create temp state file in {}", parent.display()))?;
        temp.write_all(&json).context("Failed to write temp state file")?;
        temp.as_file().sync_all().context("Failed to sync temp state file")?;
        temp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace state file: {}", self.path.display()))?;

        log::debug!("Saved state to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_loads_initial_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("state.json"), "miraEp1");

        let state = store.load().unwrap();
        assert_eq!(state, AllocatorState::initial("miraEp1"));
        assert_eq!(state.next_unit_ordinal, 2);
        assert!(state.current_unit().unwrap().is_empty());
        // Loading never writes
        assert!(!store.path().exists());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStateStore::new(dir.path().join("nested/state.json"), "miraEp1");

        let mut state = AllocatorState::initial("miraEp1");
        state.units.insert(
            "miraEp2".to_string(),
            StorageUnit { used_bytes: 1234, file_count: 3 },
        );
        state.current_unit_id = "miraEp2".to_string();
        state.next_unit_ordinal = 3;

        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), state);

        // No temp files left next to the state file
        let entries: Vec<_> = std::fs::read_dir(dir.path().join("nested")).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_file_uses_camel_case_keys() {
        let state = AllocatorState::initial("u1");
        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"currentUnitId\":\"u1\""));
        assert!(json.contains("\"usedBytes\":0"));
        assert!(json.contains("\"fileCount\":0"));
        assert!(json.contains("\"nextUnitOrdinal\":2"));
        assert!(!json.contains("published"));
    }

    #[test]
    fn test_reads_legacy_state_file() {
        let legacy = r#"{
            "currentRepo": "miraEp3",
            "repos": {
                "miraEp1": { "size": 4800000000, "files": 20 },
                "miraEp3": { "size": 1000, "files": 1 }
            },
            "nextRepoIndex": 4
        }"#;
        let state: AllocatorState = serde_json::from_str(legacy).unwrap();
        assert_eq!(state.current_unit_id, "miraEp3");
        assert_eq!(state.units["miraEp1"].file_count, 20);
        assert_eq!(state.units["miraEp3"].used_bytes, 1000);
        assert_eq!(state.next_unit_ordinal, 4);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonStateStore::new(&path, "miraEp1");
        assert!(store.load().is_err());
        // The corrupt file is left untouched for inspection
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{ not json");
    }

    #[test]
    fn test_single_oversized_artifact_is_not_drift() {
        let mut state = AllocatorState::initial("ep1");
        state.units.insert("ep1".to_string(), StorageUnit { used_bytes: 500, file_count: 1 });
        assert!(state.check_invariants(100, "ep").is_empty());

        state.units.insert("ep1".to_string(), StorageUnit { used_bytes: 500, file_count: 2 });
        assert_eq!(state.check_invariants(100, "ep").len(), 1);
    }

    #[test]
    fn test_load_errors_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonStateStore::new(&path, "ep1").load().unwrap_err();
        assert!(is_corrupt(&err));

        // A directory in place of the file cannot be read at all
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();
        let err = JsonStateStore::new(&path, "ep1").load().unwrap_err();
        assert!(!is_corrupt(&err));
    }

    #[test]
    fn test_invariant_checks() {
        let mut state = AllocatorState::initial("ep1");
        assert!(state.check_invariants(100, "ep").is_empty());

        *state.units.get_mut("ep1").unwrap() = StorageUnit { used_bytes: 150, file_count: 3 };
        state.units.insert("ep2".to_string(), StorageUnit::default());
        state.current_unit_id = "ep9".to_string();

        let violations = state.check_invariants(100, "ep");
        assert!(violations.contains(&StateViolation::CurrentUnitMissing("ep9".to_string())));
        assert!(violations.contains(&StateViolation::OverCeiling {
            unit: "ep1".to_string(),
            used_bytes: 150,
            ceiling: 100,
        }));
        assert!(violations.contains(&StateViolation::OrdinalBehind {
            unit: "ep2".to_string(),
            next_unit_ordinal: 2,
        }));
    }
}
