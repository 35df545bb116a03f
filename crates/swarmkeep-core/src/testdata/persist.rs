//! Snapshot of generator state, written once at test stop.
//!
//! Layout on disk: `{scenario: {source: initial_value}}`. A later run reads
//! it back so persistent generators continue where this one stopped.
//!
//! Writes are atomic:
//! 1. Serialize to a temp file with a PID+TID suffix
//! 2. Flush and sync to disk
//! 3. Rename onto the target path

use super::VariableTable;
use crate::config::PersistSettings;
use crate::{Result, SwarmError};
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::Path;
use std::{process, thread};
use tracing::{debug, info};

/// Scenario → source name → persisted initial value.
pub type Snapshot = BTreeMap<String, BTreeMap<String, Value>>;

/// Collect the initial values of all persistent sources.
///
/// Scenarios without any persistent source are left out.
pub fn collect_snapshot(testdata: &HashMap<String, VariableTable>) -> Snapshot {
    let mut snapshot = Snapshot::new();

    for (scenario, table) in testdata {
        let values = table
            .sources()
            .filter_map(|(name, source)| source.initial_value().map(|v| (name.clone(), v)))
            .collect::<BTreeMap<_, _>>();

        if !values.is_empty() {
            snapshot.insert(scenario.clone(), values);
        }
    }

    snapshot
}

/// Writes the snapshot at most once per run.
#[derive(Debug, Default)]
pub struct Persister {
    settings: Option<PersistSettings>,
    has_persisted: bool,
}

impl Persister {
    pub fn new(settings: Option<PersistSettings>) -> Self {
        Self {
            settings,
            has_persisted: false,
        }
    }

    /// Persistence disabled.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn has_persisted(&self) -> bool {
        self.has_persisted
    }

    pub fn settings(&self) -> Option<&PersistSettings> {
        self.settings.as_ref()
    }

    /// Read the snapshot a previous run left behind, if any.
    pub fn load(&self) -> Result<Option<Snapshot>> {
        match &self.settings {
            Some(settings) => read_snapshot(&settings.persist_file),
            None => Ok(None),
        }
    }

    /// Write `snapshot` unless it is empty or this run already persisted.
    ///
    /// Returns whether a file was written.
    pub fn persist(&mut self, snapshot: &Snapshot) -> Result<bool> {
        if self.has_persisted || snapshot.is_empty() {
            return Ok(false);
        }

        let Some(settings) = &self.settings else {
            debug!("persistence disabled, dropping snapshot of {} scenarios", snapshot.len());
            return Ok(false);
        };

        write_snapshot(&settings.persist_file, snapshot)?;
        self.has_persisted = true;

        info!(
            "variable state persisted to {}",
            settings.persist_file.display()
        );
        Ok(true)
    }
}

/// Read a snapshot file. Returns `None` if it doesn't exist.
pub fn read_snapshot(path: &Path) -> Result<Option<Snapshot>> {
    if !path.exists() {
        return Ok(None);
    }

    let contents = fs::read_to_string(path).map_err(|e| SwarmError::io_with_path(e, path))?;
    let snapshot = serde_json::from_str(&contents).map_err(|e| SwarmError::Json {
        message: format!("Failed to parse {}: {}", path.display(), e),
        source: Some(e),
    })?;

    Ok(Some(snapshot))
}

/// Atomically write a snapshot file, creating parent directories.
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| SwarmError::io_with_path(e, parent))?;
        }
    }

    let temp_path = path.with_extension(format!("json.{}.{}.tmp", process::id(), thread_id()));

    let serialized = serde_json::to_string_pretty(snapshot).map_err(|e| SwarmError::Json {
        message: format!("Failed to serialize snapshot: {}", e),
        source: Some(e),
    })?;

    {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| SwarmError::io_with_path(e, &temp_path))?;

        file.write_all(serialized.as_bytes())
            .and_then(|_| file.flush())
            .and_then(|_| file.sync_all())
            .map_err(|e| SwarmError::io_with_path(e, &temp_path))?;
    }

    fs::rename(&temp_path, path).map_err(|e| SwarmError::io_with_path(e, path))?;

    debug!("Atomically wrote {}", path.display());
    Ok(())
}

fn thread_id() -> u64 {
    let mut hasher = DefaultHasher::new();
    format!("{:?}", thread::current().id()).hash(&mut hasher);
    hasher.finish()
}
