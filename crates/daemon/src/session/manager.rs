//! Session lifecycle management.
//!
//! [`SessionManager`] binds network connections to terminal processes. It
//! owns the [`SessionRegistry`] and performs the two coordinated
//! operations of the system: `connect` (spawn, subscribe, register, start
//! output) and `disconnect` (remove, release subscription, kill).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use super::multiplexer::{OutputSubscription, SubscriberId};
use super::pty::{ConnectionId, PtyTerminal, SessionError, SpawnOptions, Terminal};
use super::registry::{Session, SessionMode, SessionRegistry, SHARED_SESSION_KEY};
use crate::config::SessionConfig;

/// Default upper bound on concurrently registered sessions.
pub const DEFAULT_MAX_SESSIONS: usize = 100;

/// A connection bound to a session.
///
/// Holds the connection's own output subscription. Dropping the
/// attachment releases the subscription but does not tear down the
/// session; call [`SessionManager::disconnect`] for that.
pub struct Attachment<T: Terminal> {
    /// The connection this attachment belongs to.
    pub connection_id: ConnectionId,
    /// The bound session.
    pub session: Arc<Session<T>>,
    /// Output of the bound session, for this connection only.
    pub output: OutputSubscription,
}

impl<T: Terminal> std::fmt::Debug for Attachment<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("connection_id", &self.connection_id)
            .field("session", &self.session)
            .field("subscriber", &self.output.id())
            .finish()
    }
}

/// Creates, tracks and tears down sessions for connections.
pub struct SessionManager<T: Terminal = PtyTerminal> {
    mode: SessionMode,
    spawn_options: SpawnOptions,
    max_sessions: usize,
    /// Dedicated sessions spawned or being spawned, bounded by `max_sessions`.
    reserved: AtomicUsize,
    registry: Arc<SessionRegistry<T>>,
    /// Session and output subscription held by each connected client.
    attachments: DashMap<ConnectionId, (Arc<Session<T>>, SubscriberId)>,
    /// Serializes creation of the shared session.
    shared_init: Mutex<()>,
}

impl<T: Terminal> SessionManager<T> {
    /// Creates a manager.
    pub fn new(mode: SessionMode, spawn_options: SpawnOptions, max_sessions: usize) -> Self {
        Self {
            mode,
            spawn_options,
            max_sessions: max_sessions.max(1),
            reserved: AtomicUsize::new(0),
            registry: Arc::new(SessionRegistry::new()),
            attachments: DashMap::new(),
            shared_init: Mutex::new(()),
        }
    }

    /// Creates a manager from the `[session]` config section.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.mode, config.spawn_options(), config.max_sessions)
    }

    /// The mode this manager runs in.
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// Options used for every spawned process.
    pub fn spawn_options(&self) -> &SpawnOptions {
        &self.spawn_options
    }

    /// The underlying registry.
    pub fn registry(&self) -> &Arc<SessionRegistry<T>> {
        &self.registry
    }

    /// Registry key that a connection's session is stored under.
    pub fn session_key<'a>(&self, connection_id: &'a str) -> &'a str {
        match self.mode {
            SessionMode::Dedicated => connection_id,
            SessionMode::Shared => SHARED_SESSION_KEY,
        }
    }

    /// Resolves the session a connection talks to.
    ///
    /// A shared-mode client stays bound to the process it attached to, even
    /// after that process was replaced; other IDs resolve to the current
    /// shared session.
    pub fn lookup(&self, connection_id: &str) -> Option<Arc<Session<T>>> {
        if self.mode == SessionMode::Shared {
            if let Some(entry) = self.attachments.get(connection_id) {
                return Some(Arc::clone(&entry.value().0));
            }
        }
        self.registry.lookup(self.session_key(connection_id))
    }

    /// Number of connected clients.
    pub fn connection_count(&self) -> usize {
        self.attachments.len()
    }

    /// Number of live sessions (processes).
    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    /// Whether the connection is currently attached.
    pub fn is_connected(&self, connection_id: &str) -> bool {
        self.attachments.contains_key(connection_id)
    }

    /// Prepares the manager for serving.
    ///
    /// In shared mode this spawns the shared process so that a broken
    /// shell configuration fails startup instead of the first client.
    pub async fn start(&self) -> Result<(), SessionError> {
        if self.mode == SessionMode::Shared {
            let session = self.shared_session().await?;
            tracing::info!(pid = ?session.terminal().pid(), "Shared session ready");
        }
        Ok(())
    }

    /// Binds a new connection to a session.
    ///
    /// Dedicated mode spawns a process for the connection; shared mode
    /// attaches to the shared process, creating it if needed. The returned
    /// attachment's subscription is in place before any output is read.
    pub async fn connect(&self, connection_id: &str) -> Result<Attachment<T>, SessionError> {
        if self.attachments.contains_key(connection_id) {
            tracing::error!(connection_id = %connection_id, "Connection already attached");
            return Err(SessionError::DuplicateSession(connection_id.to_string()));
        }

        let attachment = match self.mode {
            SessionMode::Dedicated => self.connect_dedicated(connection_id).await?,
            SessionMode::Shared => self.connect_shared(connection_id).await?,
        };

        self.attachments.insert(
            connection_id.to_string(),
            (Arc::clone(&attachment.session), attachment.output.id()),
        );

        tracing::info!(
            connection_id = %connection_id,
            mode = %self.mode,
            pid = ?attachment.session.terminal().pid(),
            sessions = self.registry.len(),
            "Client connected to session"
        );

        Ok(attachment)
    }

    async fn connect_dedicated(&self, connection_id: &str) -> Result<Attachment<T>, SessionError> {
        if self.registry.contains(connection_id) {
            tracing::error!(connection_id = %connection_id, "Session already registered");
            return Err(SessionError::DuplicateSession(connection_id.to_string()));
        }
        self.reserve_slot(connection_id)?;

        let terminal = match self.spawn_terminal().await {
            Ok(terminal) => terminal,
            Err(e) => {
                self.release_slots(1);
                return Err(e);
            }
        };
        let session = Arc::new(Session::new(connection_id, SessionMode::Dedicated, terminal));
        let output = session.terminal().output().subscribe(connection_id);

        if let Err(e) = self.registry.register(connection_id, Arc::clone(&session)) {
            self.release_slots(1);
            if let Err(kill_err) = session.terminal().kill().await {
                tracing::warn!(error = %kill_err, "Failed to kill orphaned process");
            }
            return Err(e);
        }

        session.terminal().start_output();

        Ok(Attachment {
            connection_id: connection_id.to_string(),
            session,
            output,
        })
    }

    /// Claims one of the `max_sessions` slots before spawning.
    fn reserve_slot(&self, connection_id: &str) -> Result<(), SessionError> {
        let max = self.max_sessions;
        self.reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| (n < max).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| {
                tracing::warn!(
                    connection_id = %connection_id,
                    max_sessions = max,
                    "Session limit reached"
                );
                SessionError::CapacityReached(max)
            })
    }

    fn release_slots(&self, count: usize) {
        let _ = self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                Some(n.saturating_sub(count))
            });
    }

    async fn connect_shared(&self, connection_id: &str) -> Result<Attachment<T>, SessionError> {
        let session = self.shared_session().await?;
        let output = session.terminal().output().subscribe(connection_id);
        session.terminal().start_output();

        Ok(Attachment {
            connection_id: connection_id.to_string(),
            session,
            output,
        })
    }

    /// Returns the live shared session, spawning a new one if there is none
    /// or the previous process has exited.
    async fn shared_session(&self) -> Result<Arc<Session<T>>, SessionError> {
        let _guard = self.shared_init.lock().await;

        if let Some(session) = self.registry.lookup(SHARED_SESSION_KEY) {
            if session.terminal().is_running() {
                return Ok(session);
            }
            tracing::info!("Shared process exited, replacing it");
            if let Some(stale) = self.registry.remove(SHARED_SESSION_KEY) {
                if let Err(e) = stale.terminal().kill().await {
                    tracing::warn!(error = %e, "Failed to kill exited shared process");
                }
            }
        }

        let terminal = self.spawn_terminal().await?;
        let session = Arc::new(Session::new(SHARED_SESSION_KEY, SessionMode::Shared, terminal));
        self.registry
            .register(SHARED_SESSION_KEY, Arc::clone(&session))?;

        Ok(session)
    }

    async fn spawn_terminal(&self) -> Result<T, SessionError> {
        let options = self.spawn_options.clone();
        tokio::task::spawn_blocking(move || T::spawn(&options))
            .await
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?
    }

    /// Tears down a connection.
    ///
    /// In dedicated mode the session is removed from the registry and its
    /// process killed; in shared mode only the connection's subscription is
    /// released. Returns `false` if the connection was not attached, which
    /// makes repeated calls harmless.
    pub async fn disconnect(&self, connection_id: &str) -> bool {
        let attached = self.attachments.remove(connection_id).map(|(_, entry)| entry);

        match self.mode {
            SessionMode::Dedicated => {
                let Some(session) = self.registry.remove(connection_id) else {
                    return false;
                };
                self.release_slots(1);
                if let Some((_, id)) = attached {
                    session.terminal().output().unsubscribe(id);
                }
                match session.terminal().kill().await {
                    Ok(status) => tracing::info!(
                        connection_id = %connection_id,
                        status = ?status,
                        "Session closed"
                    ),
                    Err(e) => tracing::warn!(
                        connection_id = %connection_id,
                        error = %e,
                        "Failed to kill session process"
                    ),
                }
                true
            }
            SessionMode::Shared => {
                let Some((session, id)) = attached else {
                    return false;
                };
                session.terminal().output().unsubscribe(id);
                tracing::info!(
                    connection_id = %connection_id,
                    remaining = self.attachments.len(),
                    "Client detached from shared session"
                );
                true
            }
        }
    }

    /// Kills every process and forgets every connection.
    ///
    /// Returns the number of sessions terminated.
    pub async fn shutdown(&self) -> usize {
        self.attachments.clear();

        let sessions = self.registry.drain();
        let count = sessions.len();
        if self.mode == SessionMode::Dedicated {
            self.release_slots(count);
        }
        for session in sessions {
            if let Err(e) = session.terminal().kill().await {
                tracing::warn!(key = %session.key(), error = %e, "Failed to kill session process");
            }
        }

        if count > 0 {
            tracing::info!(count = count, "Terminated all sessions");
        }
        count
    }
}
