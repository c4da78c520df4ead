/// Real-time collaborative editing core.
/// Operational transform engine, block locks, presence and per-session actors.
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod config;
pub use config::*;

mod operations;
pub use operations::*;

mod document;
pub use document::*;

pub mod transform;
pub use transform::{
    ConflictDetector, OperationalTransformEngine, TransformMetadata, TransformResult,
};

mod conflict;
pub use conflict::*;

mod locks;
pub use locks::*;

mod presence;
pub use presence::*;

mod events;
pub use events::*;

mod analytics;
pub use analytics::*;

mod session;
pub use session::*;

mod manager;
pub use manager::*;

#[derive(Debug, Error)]
pub enum CollaborationError {
    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("cannot compose operations: {0}")]
    Compose(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CollaborationError>;

/// User identifier, compared lexicographically when a total order is needed
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for UserId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of the document a session edits
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Session identifier for collaborative editing session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub uuid::Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}
