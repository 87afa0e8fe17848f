//! Error taxonomy shared by every twin-core component

use thiserror::Error;

use crate::dispatch::DispatchError;

/// Record kinds addressable through the metadata store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Twin,
    Entity,
    Model,
    Prediction,
    Scenario,
    Action,
    Task,
    Ontology,
    Storage,
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RecordKind::Twin => "digital twin",
            RecordKind::Entity => "entity",
            RecordKind::Model => "model",
            RecordKind::Prediction => "prediction",
            RecordKind::Scenario => "scenario",
            RecordKind::Action => "action",
            RecordKind::Task => "task",
            RecordKind::Ontology => "ontology",
            RecordKind::Storage => "storage",
        };
        f.write_str(name)
    }
}

/// Coarse classification used by API layers to pick a response status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Validation,
    Capability,
    Dependency,
}

#[derive(Debug, Error)]
pub enum TwinError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: RecordKind, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("capability disabled: {0}")]
    Capability(String),

    #[error("dependency failure: {0}")]
    Dependency(String),

    #[error("invalid status transition for {kind} {id}: {from} -> {to}")]
    InvalidTransition {
        kind: RecordKind,
        id: String,
        from: String,
        to: String,
    },
}

impl TwinError {
    pub fn not_found(kind: RecordKind, id: impl Into<String>) -> Self {
        TwinError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        TwinError::Validation(message.into())
    }

    pub fn capability(message: impl Into<String>) -> Self {
        TwinError::Capability(message.into())
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        TwinError::Dependency(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TwinError::NotFound { .. } => ErrorKind::NotFound,
            TwinError::Validation(_) | TwinError::InvalidTransition { .. } => {
                ErrorKind::Validation
            }
            TwinError::Capability(_) => ErrorKind::Capability,
            TwinError::Dependency(_) => ErrorKind::Dependency,
        }
    }
}

impl From<DispatchError> for TwinError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::NotFound(id) => TwinError::not_found(RecordKind::Task, id),
            DispatchError::InvalidPriority(p) => {
                TwinError::validation(format!("task priority must be >= 0, got {p}"))
            }
            DispatchError::InvalidTransition { id, from, to } => TwinError::InvalidTransition {
                kind: RecordKind::Task,
                id,
                from: from.to_string(),
                to: to.to_string(),
            },
            DispatchError::LockPoisoned => TwinError::dependency("dispatcher lock poisoned"),
        }
    }
}

pub type Result<T> = std::result::Result<T, TwinError>;
