//! Engine configuration.

use std::path::PathBuf;

/// Everything the engine needs to come up. Service-level options (update
/// period, tag filter, …) live in the service registry instead; these are
/// process-wide knobs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base directory holding `server.redb` and `server_files/`.
    pub db_dir: PathBuf,
    /// Session lifetime, seconds.
    pub session_ttl_secs: u64,
    /// How often the deferred-delete worker pops one blob pair.
    pub deferred_delete_period_secs: u64,
    /// How often the bundler checks for due update windows.
    pub bundler_check_period_secs: u64,
    /// How often the nullifier starts a cycle.
    pub nullifier_check_period_secs: u64,
    /// How often dirty in-memory service records are persisted.
    pub registry_flush_period_secs: u64,
    /// Database compaction cadence on the serializer thread.
    pub db_maintenance_period_secs: u64,
    /// Whether to start the background workers. Tests drive the engine
    /// manually and turn this off.
    pub start_workers: bool,
}

impl EngineConfig {
    pub fn new(db_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_dir: db_dir.into(),
            session_ttl_secs: 86_400,
            deferred_delete_period_secs: 5,
            bundler_check_period_secs: 60,
            nullifier_check_period_secs: 60,
            registry_flush_period_secs: 30,
            db_maintenance_period_secs: 15 * 60,
            start_workers: true,
        }
    }
}
