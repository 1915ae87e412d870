use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TechnicError {
    #[error("not initialized: run 'technic init'")]
    NotInitialized,

    #[error("request not found: {0}")]
    RequestNotFound(Uuid),

    #[error("'{owner}' is not an owner of request {request}")]
    OwnerNotFound { request: Uuid, owner: String },

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("request {id} was modified concurrently (expected version {expected}, found {found})")]
    Conflict { id: Uuid, expected: u64, found: u64 },

    #[error("a request needs at least one owner")]
    EmptyOwners,

    #[error("invalid {field} '{value}': must be non-empty and contain no whitespace")]
    InvalidIdentity { field: &'static str, value: String },

    #[error("invalid action kind: {0}")]
    InvalidActionKind(String),

    #[error("invalid status: {0}")]
    InvalidStatus(String),

    #[error("invalid decision: {0}")]
    InvalidDecision(String),

    #[error("request store error: {0}")]
    Store(String),

    #[error("request store {0} is locked by another process")]
    StoreBusy(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl TechnicError {
    /// True for the errors that mean "re-read and try again".
    pub fn is_conflict(&self) -> bool {
        matches!(self, TechnicError::Conflict { .. })
    }
}

pub type Result<T> = std::result::Result<T, TechnicError>;
