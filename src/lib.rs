pub mod admin;
pub mod cli;
pub mod config;
pub mod db;
pub mod events;
pub mod fragment;
pub mod fragment_store;
pub mod gate;
pub mod metrics;
pub mod orchestrator;
pub mod play;
pub mod progress;
pub mod rewards;
pub mod schema;
pub mod status;

use std::time::Duration;
use thiserror::Error;

pub use fragment::{Choice, Fragment, FragmentKind, TriggerPayload};
pub use fragment_store::{FragmentStore, GraphIssue, GraphReport};
pub use gate::{Access, AccessGate, DenyReason};
pub use orchestrator::{
    EngineSettings, FragmentView, NarrativeOrchestrator, NarrativeState, ProgressSummary,
    Transition,
};
pub use progress::{UserProgressState, UserProgressTracker};
pub use rewards::{GrantResult, RewardCategory, RewardGrantEngine};

#[derive(Debug, Error)]
pub enum NarrativeError {
    #[error("fragment not found: {0}")]
    NotFound(String),

    #[error("invalid choice {index} for fragment {fragment_id} ({available} available)")]
    InvalidChoice {
        fragment_id: String,
        index: usize,
        available: usize,
    },

    #[error("access denied, missing clues: {}", .missing_clues.join(", "))]
    AccessDenied { missing_clues: Vec<String> },

    #[error("user {0} has not started a story")]
    NoActiveFragment(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("reward grant failed ({category}): {message}")]
    GrantPartialFailure {
        category: RewardCategory,
        message: String,
    },

    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),

    #[error("transition exceeded its {0:?} deadline")]
    Timeout(Duration),

    #[error("transition abandoned by its caller before commit")]
    Cancelled,

    #[error("graph integrity: {0}")]
    Integrity(String),

    #[error("database: {0}")]
    Database(rusqlite::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config: {0}")]
    Config(String),

    #[error("internal: {0}")]
    Internal(String),
}

impl NarrativeError {
    /// Text safe to show an end user. Never leaks storage details.
    pub fn user_message(&self) -> &'static str {
        match self {
            NarrativeError::NotFound(_) => "This content is currently unavailable.",
            NarrativeError::InvalidChoice { .. } => "That option is no longer available.",
            NarrativeError::AccessDenied { .. } => "You need more clues to go this way.",
            NarrativeError::NoActiveFragment(_) => "Your story has not started yet.",
            NarrativeError::InvalidTransition(_) => "That step was already taken.",
            _ => "Something went wrong, please try again.",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NarrativeError::ConcurrencyConflict(_) | NarrativeError::Timeout(_)
        )
    }

    /// Expected outcomes log quietly; integration faults log loudly.
    pub fn severity(&self) -> log::Level {
        match self {
            NarrativeError::AccessDenied { .. }
            | NarrativeError::InvalidChoice { .. }
            | NarrativeError::NotFound(_)
            | NarrativeError::NoActiveFragment(_) => log::Level::Debug,
            NarrativeError::InvalidTransition(_)
            | NarrativeError::ConcurrencyConflict(_)
            | NarrativeError::Timeout(_)
            | NarrativeError::Cancelled => log::Level::Warn,
            _ => log::Level::Error,
        }
    }

    /// Short label used as a metrics attribute.
    pub fn kind(&self) -> &'static str {
        match self {
            NarrativeError::NotFound(_) => "not_found",
            NarrativeError::InvalidChoice { .. } => "invalid_choice",
            NarrativeError::AccessDenied { .. } => "access_denied",
            NarrativeError::NoActiveFragment(_) => "no_active_fragment",
            NarrativeError::InvalidTransition(_) => "invalid_transition",
            NarrativeError::GrantPartialFailure { .. } => "grant_failure",
            NarrativeError::ConcurrencyConflict(_) => "conflict",
            NarrativeError::Timeout(_) => "timeout",
            NarrativeError::Cancelled => "cancelled",
            NarrativeError::Integrity(_) => "integrity",
            NarrativeError::Database(_) => "database",
            NarrativeError::Io(_) => "io",
            NarrativeError::Json(_) => "json",
            NarrativeError::Config(_) => "config",
            NarrativeError::Internal(_) => "internal",
        }
    }
}

impl From<rusqlite::Error> for NarrativeError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref err, _) = e
            && matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
        {
            return NarrativeError::ConcurrencyConflict(format!("database busy: {e}"));
        }
        NarrativeError::Database(e)
    }
}

impl From<rusqlite_migration::Error> for NarrativeError {
    fn from(e: rusqlite_migration::Error) -> Self {
        match e {
            rusqlite_migration::Error::RusqliteError { query: _, err } => err.into(),
            other => NarrativeError::Config(format!("migration: {other}")),
        }
    }
}
