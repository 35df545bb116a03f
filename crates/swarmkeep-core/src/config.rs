//! Centralized configuration for swarmkeep.
//!
//! This module provides the protocol constants shared by coordinator and
//! workers, plus the environment-derived location of the persisted
//! variable snapshot.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Request/response protocol configuration.
pub struct CommunicationConfig;

impl CommunicationConfig {
    /// Upper bound on a single consumer wait, independent of operation kind.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
    /// Sleep between retries of a polling `keystore_pop`.
    pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_CONNECTIONS: usize = 1024;
    pub const INBOX_CAPACITY: usize = 4096;
}

/// Persistence configuration.
pub struct PersistConfig;

impl PersistConfig {
    pub const FEATURE_FILE_ENV: &'static str = "SWARMKEEP_FEATURE_FILE";
    pub const CONTEXT_ROOT_ENV: &'static str = "SWARMKEEP_CONTEXT_ROOT";
    pub const PERSIST_DIR_NAME: &'static str = "persistent";
}

/// Options for a worker-side consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            request_timeout: CommunicationConfig::REQUEST_TIMEOUT,
            poll_interval: CommunicationConfig::POLL_INTERVAL,
        }
    }
}

/// Where the variable snapshot is written at test stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistSettings {
    pub persist_file: PathBuf,
}

impl PersistSettings {
    /// Derive `<context_root>/persistent/<feature stem>.json`.
    pub fn new(context_root: impl AsRef<Path>, feature_file: impl AsRef<Path>) -> Self {
        let stem = feature_file
            .as_ref()
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            persist_file: context_root
                .as_ref()
                .join(PersistConfig::PERSIST_DIR_NAME)
                .join(format!("{}.json", stem)),
        }
    }

    /// Read the feature file and context root from the environment.
    ///
    /// Returns `None` (persistence disabled) if either variable is unset.
    pub fn from_env() -> Option<Self> {
        let feature_file = std::env::var_os(PersistConfig::FEATURE_FILE_ENV);
        let context_root = std::env::var_os(PersistConfig::CONTEXT_ROOT_ENV);

        match (feature_file, context_root) {
            (Some(feature_file), Some(context_root)) => {
                Some(Self::new(PathBuf::from(context_root), PathBuf::from(feature_file)))
            }
            _ => {
                warn!(
                    "{} or {} not set, variable state will not be persisted",
                    PersistConfig::FEATURE_FILE_ENV,
                    PersistConfig::CONTEXT_ROOT_ENV
                );
                None
            }
        }
    }
}
