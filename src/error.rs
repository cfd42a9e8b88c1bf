//! dbt error taxonomy
//!
//! SPDX-License-Identifier: GPL-3.0-or-later
//!
//! Every fatal condition the launcher can hit maps to exactly one of these
//! variants so `main.rs` can pick an exit code and, for `NetworkError`, hint
//! at `--offline` without re-parsing an opaque message string.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbtError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("network error fetching {url}: {detail}")]
    Network { url: String, detail: String },

    #[error("authentication error: {0}")]
    Auth(String),

    #[error("checksum mismatch for {what}: expected {expected}, got {got}")]
    ChecksumMismatch {
        what: String,
        expected: String,
        got: String,
    },

    #[error("signature invalid for {what}: {detail}")]
    SignatureInvalid { what: String, detail: String },

    #[error("tool not found: {name} {version}")]
    ToolNotFound { name: String, version: String },

    #[error("tool not available offline: {name} {version}")]
    ToolNotAvailable { name: String, version: String },

    #[error("self-upgrade failed: {0}")]
    Upgrade(String),

    #[error("exec failed for {path}: {detail}")]
    Exec { path: String, detail: String },
}

impl DbtError {
    /// Exit code the CLI should use for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            DbtError::Config(_) => 2,
            DbtError::Network { .. } => 3,
            DbtError::Auth(_) => 4,
            DbtError::ChecksumMismatch { .. } => 5,
            DbtError::SignatureInvalid { .. } => 6,
            DbtError::ToolNotFound { .. } => 7,
            DbtError::ToolNotAvailable { .. } => 8,
            DbtError::Upgrade(_) => 9,
            DbtError::Exec { .. } => 10,
        }
    }

    /// Whether the offline hint should be appended when printing this error.
    pub fn suggest_offline(&self) -> bool {
        matches!(self, DbtError::Network { .. })
    }
}
