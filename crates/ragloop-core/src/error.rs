use std::path::PathBuf;

use thiserror::Error;

use crate::action::ActionKind;

/// Core error type for configuration and collaborator wiring.
#[derive(Debug, Error)]
pub enum RagLoopError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl RagLoopError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Reasons a decision reply is rejected at the decision boundary.
///
/// None of these leave the evaluation loop: each one is turned into the
/// `ReturnAnswer` fallback plus a warning.
#[derive(Debug, Error, PartialEq)]
pub enum DecisionError {
    #[error("decision reply contained no JSON object")]
    MissingJson,
    #[error("decision reply is malformed: {0}")]
    Malformed(String),
    #[error("unknown action type '{0}'")]
    UnknownAction(String),
    #[error("action '{0}' is not available at this step")]
    UnavailableAction(ActionKind),
    #[error("action '{0}' requires at least one query")]
    EmptyQueries(ActionKind),
}
