// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for drydock-fleet.

use std::collections::BTreeMap;
use std::fmt;

use drydock_core::EngineError;
use thiserror::Error;

use crate::collab::CollabError;
use crate::config::ConfigError;

/// Result type using FleetError
pub type FleetResult<T> = std::result::Result<T, FleetError>;

/// Errors returned by management operations and the store.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum FleetError {
    /// Input rejected before any process was created.
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),

    /// Entity does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// Entity kind (resource, node, ...).
        kind: &'static str,
        /// Entity id.
        id: String,
    },

    /// Operation does not apply to the entity in its current state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Engine operation failed.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON (de)serialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A collaborator call failed.
    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollabError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl FleetError {
    /// Shorthand for [`FleetError::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Stable error code, in the style of the engine's codes.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Engine(e) => e.error_code(),
            Self::Database(_) => "DATABASE_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Collaborator(_) => "COLLABORATOR_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
        }
    }
}

/// Field → message map collected while validating a request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(BTreeMap<String, String>);

impl ValidationErrors {
    /// Empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a problem with `field`. The first message per field wins.
    pub fn add(&mut self, field: &str, message: impl Into<String>) {
        self.0
            .entry(field.to_string())
            .or_insert_with(|| message.into());
    }

    /// True when nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Message for a field, if any.
    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    /// Iterate fields in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `Ok(())` when empty, otherwise [`FleetError::Validation`].
    pub fn into_result(self) -> FleetResult<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(FleetError::Validation(self))
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, message) in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            write!(f, "{field}: {message}")?;
            first = false;
        }
        Ok(())
    }
}
