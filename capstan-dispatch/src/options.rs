use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Per-build options forwarded to the worker. The worker enforces the
/// timeouts; the local side imposes none of its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildOptions {
    /// Seconds without output before the worker kills the build.
    pub max_silent_time: u64,
    /// Overall build timeout in seconds.
    pub build_timeout: u64,
    /// Build log ceiling in bytes (worker side, serve minor >= 2).
    pub max_log_size: u64,
    /// Extra build rounds for determinism checking (serve minor >= 3).
    pub repeats: u64,
    /// Fail the build when rounds differ (serve minor >= 3).
    pub enforce_determinism: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            max_silent_time: 7200,
            build_timeout: 36000,
            max_log_size: 64 << 20,
            repeats: 0,
            enforce_determinism: false,
        }
    }
}

/// Dispatch-wide configuration, handed in as a value by the embedding
/// queue runner.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Root of the per-step build log tree.
    pub log_dir: PathBuf,
    /// Ceiling on the summed NAR size of a step's outputs.
    pub max_output_size: u64,
    /// Base machine-disable interval in seconds.
    pub retry_interval: u64,
    /// Exponential factor applied per consecutive failure.
    pub retry_backoff: f64,
}

impl DispatchConfig {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/var/lib/capstan/logs"),
            max_output_size: 2 << 30,
            retry_interval: 60,
            retry_backoff: 3.0,
        }
    }
}
