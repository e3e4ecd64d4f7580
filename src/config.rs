//! Engine configuration.

use serde::{Deserialize, Serialize};

/// Tunables consumed by [`crate::Engine::start`]. Page size and skip-list
/// height are compile-time constants and must stay consistent across runs
/// on the same files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of frames in the buffer pool.
    pub buffer_pool_pages: u32,
    /// Path of the write-ahead log file.
    pub log_filename: String,
    /// Size of the in-memory log buffer, in megabytes.
    pub log_buffer_mb: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            buffer_pool_pages: 128,
            log_filename: "granite.log".to_string(),
            log_buffer_mb: 1,
        }
    }
}
