//! Line protocol: one JSON command in, one JSON reply or event out
use collab_core::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    /// Start a session on a document with initial content
    #[serde(rename_all = "camelCase")]
    Open {
        document_id: DocumentId,
        #[serde(default)]
        text: String,
        #[serde(default)]
        blocks: Vec<String>,
    },

    #[serde(rename_all = "camelCase")]
    Join {
        document_id: DocumentId,
        #[serde(flatten)]
        user: User,
    },

    #[serde(rename_all = "camelCase")]
    Leave {
        document_id: DocumentId,
        user_id: UserId,
    },

    #[serde(rename_all = "camelCase")]
    Apply {
        session_id: SessionId,
        operation: Operation,
    },

    #[serde(rename_all = "camelCase")]
    Enqueue {
        session_id: SessionId,
        operation: Operation,
    },

    /// Report the latest session version a client has seen
    #[serde(rename_all = "camelCase")]
    Ack {
        session_id: SessionId,
        user_id: UserId,
        version: u64,
    },

    #[serde(rename_all = "camelCase")]
    Cursor {
        session_id: SessionId,
        user_id: UserId,
        position: usize,
        #[serde(default)]
        block_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Selection {
        session_id: SessionId,
        user_id: UserId,
        start: usize,
        end: usize,
        #[serde(default)]
        block_id: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Lock {
        session_id: SessionId,
        #[serde(flatten)]
        request: LockRequest,
    },

    #[serde(rename_all = "camelCase")]
    Unlock {
        session_id: SessionId,
        lock_id: LockId,
        user_id: UserId,
    },

    #[serde(rename_all = "camelCase")]
    Resolve {
        session_id: SessionId,
        conflict_id: ConflictId,
        resolution: ManualResolution,
    },

    #[serde(rename_all = "camelCase")]
    Session { session_id: SessionId },

    #[serde(rename_all = "camelCase")]
    Document { session_id: SessionId },

    #[serde(rename_all = "camelCase")]
    Cursors { session_id: SessionId },

    #[serde(rename_all = "camelCase")]
    Analytics { session_id: SessionId },

    List,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum Reply {
    #[serde(rename_all = "camelCase")]
    Opened { session_id: SessionId },

    Joined { session: Box<SessionSnapshot> },

    Left,

    Applied { result: Box<OperationResult> },

    Enqueued { pending: usize },

    Acknowledged { version: u64 },

    Cursor { cursor: Cursor },

    Selection { selection: Selection },

    /// `lock` is null when another participant holds it
    Lock { lock: Option<ContentLock> },

    Unlock { lock: Option<ContentLock> },

    Resolved { resolution: ResolutionOutcome },

    Session { session: Box<SessionSnapshot> },

    Document { document: Box<CollaborativeDocument> },

    Cursors { cursors: Vec<Cursor> },

    Analytics { analytics: SessionAnalytics },

    Sessions { sessions: Vec<SessionSnapshot> },

    Error { message: String },
}

/// Everything written to stdout
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Output {
    Reply(Reply),
    Event(CollaborationEvent),
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Open { .. } => "open",
            Command::Join { .. } => "join",
            Command::Leave { .. } => "leave",
            Command::Apply { .. } => "apply",
            Command::Enqueue { .. } => "enqueue",
            Command::Ack { .. } => "ack",
            Command::Cursor { .. } => "cursor",
            Command::Selection { .. } => "selection",
            Command::Lock { .. } => "lock",
            Command::Unlock { .. } => "unlock",
            Command::Resolve { .. } => "resolve",
            Command::Session { .. } => "session",
            Command::Document { .. } => "document",
            Command::Cursors { .. } => "cursors",
            Command::Analytics { .. } => "analytics",
            Command::List => "list",
        }
    }

    /// Run the command against the registry
    pub async fn execute(self, manager: &CollaborationManager) -> Result<Reply> {
        let reply = match self {
            Command::Open {
                document_id,
                text,
                blocks,
            } => {
                let document = CollaborativeDocument::from_text(text).with_blocks(blocks);
                let session_id = manager.open_document(document_id, document).await?;
                Reply::Opened { session_id }
            }
            Command::Join { document_id, user } => {
                let session = manager.join_session(document_id, user).await?;
                Reply::Joined {
                    session: Box::new(session),
                }
            }
            Command::Leave {
                document_id,
                user_id,
            } => {
                manager.leave_session(&document_id, user_id).await?;
                Reply::Left
            }
            Command::Apply {
                session_id,
                operation,
            } => {
                let result = manager.apply_operation(session_id, operation).await?;
                Reply::Applied {
                    result: Box::new(result),
                }
            }
            Command::Enqueue {
                session_id,
                operation,
            } => Reply::Enqueued {
                pending: manager.enqueue_operation(session_id, operation).await?,
            },
            Command::Ack {
                session_id,
                user_id,
                version,
            } => Reply::Acknowledged {
                version: manager.acknowledge(session_id, user_id, version).await?,
            },
            Command::Cursor {
                session_id,
                user_id,
                position,
                block_id,
            } => Reply::Cursor {
                cursor: manager
                    .update_cursor(session_id, user_id, position, block_id)
                    .await?,
            },
            Command::Selection {
                session_id,
                user_id,
                start,
                end,
                block_id,
            } => Reply::Selection {
                selection: manager
                    .update_selection(session_id, user_id, start, end, block_id)
                    .await?,
            },
            Command::Lock {
                session_id,
                request,
            } => Reply::Lock {
                lock: manager.acquire_lock(session_id, request).await?,
            },
            Command::Unlock {
                session_id,
                lock_id,
                user_id,
            } => Reply::Unlock {
                lock: manager.release_lock(session_id, lock_id, user_id).await?,
            },
            Command::Resolve {
                session_id,
                conflict_id,
                resolution,
            } => Reply::Resolved {
                resolution: manager
                    .resolve_conflict(session_id, conflict_id, resolution)
                    .await?,
            },
            Command::Session { session_id } => Reply::Session {
                session: Box::new(manager.get_session(session_id).await?),
            },
            Command::Document { session_id } => Reply::Document {
                document: Box::new(manager.get_document(session_id).await?),
            },
            Command::Cursors { session_id } => Reply::Cursors {
                cursors: manager.get_cursors(session_id).await?,
            },
            Command::Analytics { session_id } => Reply::Analytics {
                analytics: manager.get_analytics(session_id).await?,
            },
            Command::List => Reply::Sessions {
                sessions: manager.list_sessions().await,
            },
        };
        Ok(reply)
    }
}
