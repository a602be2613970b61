use crate::error::StatsError;
use crate::identity::Identity;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::PathBuf;

/// On-disk stats document.
///
/// Every top-level key is an identity mapped to whole seconds, except
/// `_ignored` which lists the opted-out identities:
///
/// ```json
/// { "1234": 3600, "5678": 42, "_ignored": ["9999"] }
/// ```
///
/// Files written by older trackers may hold fractional seconds; those are
/// floored on load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StoredSnapshot")]
pub struct Snapshot {
    #[serde(flatten)]
    pub totals: BTreeMap<Identity, u64>,
    #[serde(rename = "_ignored", default)]
    pub ignored: BTreeSet<Identity>,
}

#[derive(Deserialize)]
struct StoredSnapshot {
    #[serde(flatten)]
    totals: BTreeMap<Identity, f64>,
    #[serde(rename = "_ignored", default)]
    ignored: BTreeSet<Identity>,
}

impl From<StoredSnapshot> for Snapshot {
    fn from(stored: StoredSnapshot) -> Self {
        Self {
            totals: stored
                .totals
                .into_iter()
                .map(|(id, secs)| (id, secs.max(0.0).floor() as u64))
                .collect(),
            ignored: stored.ignored,
        }
    }
}

/// Where snapshots live. Implementations are called off the async runtime.
pub trait SnapshotPort: Send + Sync + 'static {
    /// `Ok(None)` when nothing has been saved yet.
    fn load(&self) -> Result<Option<Snapshot>, StatsError>;

    /// Full rewrite, never an append.
    fn save(&self, snapshot: &Snapshot) -> Result<(), StatsError>;
}

/// Pretty-printed JSON file, replaced atomically on every save.
pub struct JsonFile {
    path: PathBuf,
}

impl JsonFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SnapshotPort for JsonFile {
    fn load(&self) -> Result<Option<Snapshot>, StatsError> {
        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        let snapshot: Snapshot = serde_json::from_str(&content)?;
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &Snapshot) -> Result<(), StatsError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }

        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
