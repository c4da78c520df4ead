/// Session registry.
/// Every session runs as its own actor task; the registry only routes commands to it.
use chrono::Utc;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::{
    CollaborationConfig, CollaborationError, CollaborationEvent, CollaborationSession,
    CollaborativeDocument, ConflictId, ContentLock, Cursor, DocumentId, LockId, LockRequest,
    ManualResolution, Operation, OperationResult, OperationalTransformEngine, Participant,
    ResolutionOutcome, Result, Selection, SessionAnalytics, SessionId, SessionSnapshot, User,
    UserId,
};

/// Joins retried when they land on an actor that has just stopped
const JOIN_ATTEMPTS: usize = 3;

/// Requests handled by a session actor
enum SessionCommand {
    Join {
        user: User,
        reply: oneshot::Sender<(Participant, SessionSnapshot)>,
    },
    Leave {
        user_id: UserId,
        reply: oneshot::Sender<Result<usize>>,
    },
    Apply {
        operation: Operation,
        reply: oneshot::Sender<OperationResult>,
    },
    Enqueue {
        operation: Operation,
        reply: oneshot::Sender<usize>,
    },
    Acknowledge {
        user_id: UserId,
        version: u64,
        reply: oneshot::Sender<Result<u64>>,
    },
    UpdateCursor {
        user_id: UserId,
        position: usize,
        block_id: Option<String>,
        reply: oneshot::Sender<Result<Cursor>>,
    },
    UpdateSelection {
        user_id: UserId,
        start: usize,
        end: usize,
        block_id: Option<String>,
        reply: oneshot::Sender<Result<Selection>>,
    },
    AcquireLock {
        request: LockRequest,
        reply: oneshot::Sender<Option<ContentLock>>,
    },
    ReleaseLock {
        lock_id: LockId,
        user_id: UserId,
        reply: oneshot::Sender<Option<ContentLock>>,
    },
    ResolveConflict {
        conflict_id: ConflictId,
        resolution: ManualResolution,
        reply: oneshot::Sender<Result<ResolutionOutcome>>,
    },
    Cursors {
        reply: oneshot::Sender<Vec<Cursor>>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    Analytics {
        reply: oneshot::Sender<SessionAnalytics>,
    },
    Shutdown,
}

struct SessionHandle {
    document_id: DocumentId,
    commands: mpsc::Sender<SessionCommand>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, SessionHandle>,
    by_document: HashMap<DocumentId, SessionId>,
}

/// Owns every live session. Construct one per process (or per test).
pub struct CollaborationManager {
    config: CollaborationConfig,
    engine: Arc<OperationalTransformEngine>,
    events: broadcast::Sender<CollaborationEvent>,
    registry: RwLock<Registry>,
}

impl CollaborationManager {
    pub fn new(config: CollaborationConfig) -> Self {
        let engine = OperationalTransformEngine::new().with_compose_window(config.compose_window());
        Self::with_engine(config, engine)
    }

    /// Registry using a custom engine (extra rules or detectors)
    pub fn with_engine(config: CollaborationConfig, engine: OperationalTransformEngine) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer);
        Self {
            config,
            engine: Arc::new(engine),
            events,
            registry: RwLock::new(Registry::default()),
        }
    }

    pub fn config(&self) -> &CollaborationConfig {
        &self.config
    }

    /// Receive every event from every session
    pub fn subscribe(&self) -> broadcast::Receiver<CollaborationEvent> {
        self.events.subscribe()
    }

    fn spawn_session(
        &self,
        registry: &mut Registry,
        document_id: DocumentId,
        document: CollaborativeDocument,
    ) -> (SessionId, mpsc::Sender<SessionCommand>) {
        let session = CollaborationSession::new(
            document_id.clone(),
            document,
            self.config.clone(),
            self.engine.clone(),
            Utc::now(),
        );
        let session_id = session.id();

        let (commands, inbox) = mpsc::channel(self.config.command_buffer);
        let task = tokio::spawn(run_session(
            session,
            inbox,
            self.events.clone(),
            self.config.tick_interval(),
        ));

        info!("Created session {} for document {}", session_id, document_id);
        registry.by_document.insert(document_id.clone(), session_id);
        registry.sessions.insert(
            session_id,
            SessionHandle {
                document_id,
                commands: commands.clone(),
                task,
            },
        );
        (session_id, commands)
    }

    /// Start a session on an existing document before anyone joins
    pub async fn open_document(
        &self,
        document_id: DocumentId,
        document: CollaborativeDocument,
    ) -> Result<SessionId> {
        let mut registry = self.registry.write().await;
        if let Some(existing) = registry.by_document.get(&document_id) {
            return Err(CollaborationError::InvalidOperation(format!(
                "document {} already has session {}",
                document_id, existing
            )));
        }
        Ok(self.spawn_session(&mut registry, document_id, document).0)
    }

    /// Join the session editing `document_id`, creating it on first join
    pub async fn join_session(
        &self,
        document_id: DocumentId,
        user: User,
    ) -> Result<SessionSnapshot> {
        let mut attempt = 1;
        loop {
            let (session_id, commands) = self.live_session(&document_id).await;
            let joined = send(session_id, &commands, |reply| SessionCommand::Join {
                user: user.clone(),
                reply,
            })
            .await;

            match joined {
                Ok((_participant, snapshot)) => return Ok(snapshot),
                Err(CollaborationError::SessionClosed(_)) if attempt < JOIN_ATTEMPTS => {
                    debug!(
                        "Session {} stopped while {} was joining, retrying",
                        session_id, user.id
                    );
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Session for `document_id`, spawned when there is none or its actor has stopped
    async fn live_session(
        &self,
        document_id: &DocumentId,
    ) -> (SessionId, mpsc::Sender<SessionCommand>) {
        let mut registry = self.registry.write().await;

        if let Some(session_id) = registry.by_document.get(document_id).copied() {
            let live = registry
                .sessions
                .get(&session_id)
                .filter(|handle| !handle.commands.is_closed())
                .map(|handle| handle.commands.clone());
            if let Some(commands) = live {
                return (session_id, commands);
            }

            // Actor already stopped; dropping the handle detaches its task
            registry.by_document.remove(document_id);
            registry.sessions.remove(&session_id);
        }

        self.spawn_session(&mut registry, document_id.clone(), CollaborativeDocument::new())
    }

    /// Leave a session; the last participant out destroys it
    pub async fn leave_session(&self, document_id: &DocumentId, user_id: UserId) -> Result<()> {
        let session_id = self
            .session_for_document(document_id)
            .await
            .ok_or_else(|| CollaborationError::SessionNotFound(document_id.to_string()))?;
        let commands = self.commands(session_id).await?;

        let remaining =
            send(session_id, &commands, |reply| SessionCommand::Leave { user_id, reply }).await??;
        if remaining > 0 {
            return Ok(());
        }

        let handle = {
            let mut registry = self.registry.write().await;
            let handle = registry.sessions.remove(&session_id);
            if let Some(handle) = &handle {
                if registry.by_document.get(&handle.document_id) == Some(&session_id) {
                    registry.by_document.remove(&handle.document_id);
                }
            }
            handle
        };

        if let Some(handle) = handle {
            if let Err(err) = handle.task.await {
                warn!("Session {} actor ended abnormally: {}", session_id, err);
            }
        }
        info!("Destroyed session {} for document {}", session_id, document_id);
        Ok(())
    }

    async fn commands(&self, session_id: SessionId) -> Result<mpsc::Sender<SessionCommand>> {
        let registry = self.registry.read().await;
        registry
            .sessions
            .get(&session_id)
            .map(|handle| handle.commands.clone())
            .ok_or_else(|| CollaborationError::SessionNotFound(session_id.to_string()))
    }

    async fn request<T>(
        &self,
        session_id: SessionId,
        command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Result<T> {
        let commands = self.commands(session_id).await?;
        send(session_id, &commands, command).await
    }

    pub async fn session_for_document(&self, document_id: &DocumentId) -> Option<SessionId> {
        self.registry.read().await.by_document.get(document_id).copied()
    }

    /// Transform and apply an operation right away
    pub async fn apply_operation(
        &self,
        session_id: SessionId,
        operation: Operation,
    ) -> Result<OperationResult> {
        self.request(session_id, |reply| SessionCommand::Apply { operation, reply })
            .await
    }

    /// Queue an operation for the session's next tick; returns the number of pending entries
    pub async fn enqueue_operation(
        &self,
        session_id: SessionId,
        operation: Operation,
    ) -> Result<usize> {
        self.request(session_id, |reply| SessionCommand::Enqueue { operation, reply })
            .await
    }

    /// Record that `user_id` has seen the session up to `version`; returns the stored version
    pub async fn acknowledge(
        &self,
        session_id: SessionId,
        user_id: UserId,
        version: u64,
    ) -> Result<u64> {
        self.request(session_id, |reply| SessionCommand::Acknowledge {
            user_id,
            version,
            reply,
        })
        .await?
    }

    pub async fn update_cursor(
        &self,
        session_id: SessionId,
        user_id: UserId,
        position: usize,
        block_id: Option<String>,
    ) -> Result<Cursor> {
        self.request(session_id, |reply| SessionCommand::UpdateCursor {
            user_id,
            position,
            block_id,
            reply,
        })
        .await?
    }

    pub async fn update_selection(
        &self,
        session_id: SessionId,
        user_id: UserId,
        start: usize,
        end: usize,
        block_id: Option<String>,
    ) -> Result<Selection> {
        self.request(session_id, |reply| SessionCommand::UpdateSelection {
            user_id,
            start,
            end,
            block_id,
            reply,
        })
        .await?
    }

    /// `Ok(None)` when the lock is held by someone else
    pub async fn acquire_lock(
        &self,
        session_id: SessionId,
        request: LockRequest,
    ) -> Result<Option<ContentLock>> {
        self.request(session_id, |reply| SessionCommand::AcquireLock { request, reply })
            .await
    }

    pub async fn release_lock(
        &self,
        session_id: SessionId,
        lock_id: LockId,
        user_id: UserId,
    ) -> Result<Option<ContentLock>> {
        self.request(session_id, |reply| SessionCommand::ReleaseLock {
            lock_id,
            user_id,
            reply,
        })
        .await
    }

    pub async fn resolve_conflict(
        &self,
        session_id: SessionId,
        conflict_id: ConflictId,
        resolution: ManualResolution,
    ) -> Result<ResolutionOutcome> {
        self.request(session_id, |reply| SessionCommand::ResolveConflict {
            conflict_id,
            resolution,
            reply,
        })
        .await?
    }

    pub async fn get_session(&self, session_id: SessionId) -> Result<SessionSnapshot> {
        self.request(session_id, |reply| SessionCommand::Snapshot { reply })
            .await
    }

    pub async fn get_participants(&self, session_id: SessionId) -> Result<Vec<Participant>> {
        Ok(self.get_session(session_id).await?.participants)
    }

    pub async fn get_cursors(&self, session_id: SessionId) -> Result<Vec<Cursor>> {
        self.request(session_id, |reply| SessionCommand::Cursors { reply })
            .await
    }

    pub async fn get_document(&self, session_id: SessionId) -> Result<CollaborativeDocument> {
        Ok(self.get_session(session_id).await?.document)
    }

    pub async fn get_analytics(&self, session_id: SessionId) -> Result<SessionAnalytics> {
        self.request(session_id, |reply| SessionCommand::Analytics { reply })
            .await
    }

    /// Snapshots of every live session
    pub async fn list_sessions(&self) -> Vec<SessionSnapshot> {
        let targets: Vec<(SessionId, mpsc::Sender<SessionCommand>)> = {
            let registry = self.registry.read().await;
            registry
                .sessions
                .iter()
                .map(|(id, handle)| (*id, handle.commands.clone()))
                .collect()
        };

        join_all(targets.iter().map(|(id, commands)| {
            send(*id, commands, |reply| SessionCommand::Snapshot { reply })
        }))
        .await
        .into_iter()
        .filter_map(|snapshot| snapshot.ok())
        .collect()
    }

    /// Stop every session actor and wait for them to finish
    pub async fn shutdown(&self) {
        let handles: Vec<(SessionId, SessionHandle)> = {
            let mut registry = self.registry.write().await;
            registry.by_document.clear();
            registry.sessions.drain().collect()
        };

        info!("Shutting down {} sessions", handles.len());
        let tasks = handles.into_iter().map(|(id, handle)| async move {
            if handle.commands.send(SessionCommand::Shutdown).await.is_err() {
                debug!("Session {} already stopped", id);
            }
            if let Err(err) = handle.task.await {
                warn!("Session {} actor ended abnormally: {}", id, err);
            }
        });
        join_all(tasks).await;
    }
}

async fn send<T>(
    session_id: SessionId,
    commands: &mpsc::Sender<SessionCommand>,
    command: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
) -> Result<T> {
    let (reply, response) = oneshot::channel();
    commands
        .send(command(reply))
        .await
        .map_err(|_| CollaborationError::SessionClosed(session_id.to_string()))?;
    response
        .await
        .map_err(|_| CollaborationError::SessionClosed(session_id.to_string()))
}

/// Session actor: serialises commands and ticks against one session's state
async fn run_session(
    mut session: CollaborationSession,
    mut inbox: mpsc::Receiver<SessionCommand>,
    events: broadcast::Sender<CollaborationEvent>,
    tick_every: Duration,
) {
    let mut ticker = tokio::time::interval(tick_every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let keep_running = tokio::select! {
            command = inbox.recv() => match command {
                Some(command) => handle_command(&mut session, command),
                None => false,
            },
            _ = ticker.tick() => {
                let summary = session.tick(Utc::now());
                if summary.applied + summary.rejected > 0 {
                    debug!(
                        "Session {} tick applied {} and rejected {} queued operations",
                        session.id(),
                        summary.applied,
                        summary.rejected
                    );
                }
                true
            }
        };

        for event in session.drain_events() {
            // No subscribers is not an error
            let _ = events.send(event);
        }

        if !keep_running {
            break;
        }
    }

    debug!("Session {} actor stopped", session.id());
}

/// Returns false once the actor should stop
fn handle_command(session: &mut CollaborationSession, command: SessionCommand) -> bool {
    let now = Utc::now();

    match command {
        SessionCommand::Join { user, reply } => {
            let participant = session.join(&user, now);
            let _ = reply.send((participant, session.snapshot()));
        }
        SessionCommand::Leave { user_id, reply } => {
            let result = session.leave(&user_id).map(|_| session.participants().len());
            let emptied = matches!(result, Ok(0));
            let _ = reply.send(result);
            if emptied {
                return false;
            }
        }
        SessionCommand::Apply { operation, reply } => {
            let _ = reply.send(session.apply_operation(operation, now));
        }
        SessionCommand::Enqueue { operation, reply } => {
            let _ = reply.send(session.enqueue_operation(operation));
        }
        SessionCommand::Acknowledge {
            user_id,
            version,
            reply,
        } => {
            let _ = reply.send(session.acknowledge(&user_id, version, now));
        }
        SessionCommand::UpdateCursor {
            user_id,
            position,
            block_id,
            reply,
        } => {
            let _ = reply.send(session.update_cursor(&user_id, position, block_id, now));
        }
        SessionCommand::UpdateSelection {
            user_id,
            start,
            end,
            block_id,
            reply,
        } => {
            let _ = reply.send(session.update_selection(&user_id, start, end, block_id, now));
        }
        SessionCommand::AcquireLock { request, reply } => {
            let _ = reply.send(session.acquire_lock(&request, now));
        }
        SessionCommand::ReleaseLock {
            lock_id,
            user_id,
            reply,
        } => {
            let _ = reply.send(session.release_lock(lock_id, &user_id, now));
        }
        SessionCommand::ResolveConflict {
            conflict_id,
            resolution,
            reply,
        } => {
            let _ = reply.send(session.resolve_conflict(conflict_id, resolution, now));
        }
        SessionCommand::Cursors { reply } => {
            let _ = reply.send(session.cursors());
        }
        SessionCommand::Snapshot { reply } => {
            let _ = reply.send(session.snapshot());
        }
        SessionCommand::Analytics { reply } => {
            let _ = reply.send(session.analytics(now));
        }
        SessionCommand::Shutdown => return false,
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_join_creates_session() {
        let manager = CollaborationManager::new(CollaborationConfig::default());
        let doc = DocumentId::from("doc-1");

        let first = manager
            .join_session(doc.clone(), User::new("alice", "Alice"))
            .await
            .unwrap();
        let second = manager
            .join_session(doc.clone(), User::new("bob", "Bob"))
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.participants.len(), 2);
        assert_eq!(manager.session_for_document(&doc).await, Some(first.id));
    }

    #[tokio::test]
    async fn test_last_leave_destroys_session() {
        let manager = CollaborationManager::new(CollaborationConfig::default());
        let doc = DocumentId::from("doc-2");

        let session = manager
            .join_session(doc.clone(), User::new("alice", "Alice"))
            .await
            .unwrap();
        manager
            .leave_session(&doc, UserId::from("alice"))
            .await
            .unwrap();

        assert!(manager.session_for_document(&doc).await.is_none());
        assert!(matches!(
            manager.get_session(session.id).await,
            Err(CollaborationError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_join_and_leave_settle() {
        let manager = CollaborationManager::new(CollaborationConfig::default());
        let doc = DocumentId::from("doc-3");

        let visits = (0..16).map(|i| {
            let manager = &manager;
            let doc = doc.clone();
            async move {
                let name = format!("user-{}", i);
                manager
                    .join_session(doc.clone(), User::new(name.clone(), name.clone()))
                    .await?;
                manager.leave_session(&doc, UserId::from(name)).await
            }
        });
        for result in join_all(visits).await {
            assert!(result.is_ok(), "{:?}", result);
        }

        assert!(manager.session_for_document(&doc).await.is_none());
        assert!(manager.list_sessions().await.is_empty());
    }

    #[tokio::test]
    async fn test_registry_stays_usable_during_leave() {
        let manager = CollaborationManager::new(CollaborationConfig::default());
        let busy = DocumentId::from("busy");
        let other = DocumentId::from("other");

        manager
            .join_session(busy.clone(), User::new("alice", "Alice"))
            .await
            .unwrap();
        let (left, joined) = tokio::join!(
            manager.leave_session(&busy, UserId::from("alice")),
            manager.join_session(other.clone(), User::new("bob", "Bob")),
        );
        left.unwrap();
        assert_eq!(joined.unwrap().participants.len(), 1);

        let sessions = manager.list_sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].document_id, other);
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let manager = CollaborationManager::new(CollaborationConfig::default());
        let result = manager
            .apply_operation(SessionId::new(), Operation::insert("a", 0, "x"))
            .await;
        assert!(matches!(result, Err(CollaborationError::SessionNotFound(_))));
    }
}
