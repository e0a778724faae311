// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for drydock-core.

use thiserror::Error;

/// Result type using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the engine itself, as opposed to errors raised inside
/// step bodies (those are `anyhow::Error` and halt the process in place).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// Process was not found in the database.
    #[error("Process '{process_id}' not found")]
    ProcessNotFound {
        /// The process ID that was not found.
        process_id: String,
    },

    /// No program is registered under this name.
    #[error("No program registered as '{program}'")]
    UnknownProgram {
        /// The program name stored on the process.
        program: String,
    },

    /// A transition could not be applied to the process state.
    #[error("Invalid transition for process '{process_id}': {reason}")]
    InvalidTransition {
        /// The process ID.
        process_id: String,
        /// Why the transition was rejected.
        reason: String,
    },

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Stack or value (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Schema migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl EngineError {
    /// Get the stable error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ProcessNotFound { .. } => "PROCESS_NOT_FOUND",
            Self::UnknownProgram { .. } => "UNKNOWN_PROGRAM",
            Self::InvalidTransition { .. } => "INVALID_TRANSITION",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Migration(_) => "MIGRATION_ERROR",
        }
    }
}
