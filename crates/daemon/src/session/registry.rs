//! Session registry.
//!
//! The registry maps connection identifiers to live sessions. It is the
//! only structure mutated by many connection tasks, and every mutation goes
//! through a single atomic DashMap operation.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use clap::ValueEnum;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::pty::{SessionError, Terminal};

/// Registry key of the single session in [`SessionMode::Shared`].
pub const SHARED_SESSION_KEY: &str = "__shared__";

/// How connections map onto terminal processes.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SessionMode {
    /// One process per connection, killed when the connection closes.
    #[default]
    Dedicated,
    /// One process for the whole server, shared by every connection.
    Shared,
}

impl SessionMode {
    /// Lowercase name, as used in config files and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionMode::Dedicated => "dedicated",
            SessionMode::Shared => "shared",
        }
    }
}

impl fmt::Display for SessionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "dedicated" => Ok(SessionMode::Dedicated),
            "shared" => Ok(SessionMode::Shared),
            other => Err(format!(
                "unknown session mode '{}', expected dedicated or shared",
                other
            )),
        }
    }
}

/// A live binding between a registry key and one terminal process.
pub struct Session<T: Terminal> {
    key: String,
    mode: SessionMode,
    terminal: T,
    created_at: Instant,
}

impl<T: Terminal> Session<T> {
    /// Wraps a freshly spawned terminal.
    pub fn new(key: impl Into<String>, mode: SessionMode, terminal: T) -> Self {
        Self {
            key: key.into(),
            mode,
            terminal,
            created_at: Instant::now(),
        }
    }

    /// Registry key: the connection ID, or [`SHARED_SESSION_KEY`].
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Mode the session was created in.
    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    /// The owned terminal process.
    pub fn terminal(&self) -> &T {
        &self.terminal
    }

    /// Time since the session was created.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

impl<T: Terminal> fmt::Debug for Session<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("pid", &self.terminal.pid())
            .field("running", &self.terminal.is_running())
            .finish()
    }
}

/// Concurrent map from registry key to session.
pub struct SessionRegistry<T: Terminal> {
    sessions: DashMap<String, Arc<Session<T>>>,
}

impl<T: Terminal> SessionRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Inserts a session.
    ///
    /// Fails with [`SessionError::DuplicateSession`] if the key is taken;
    /// the existing entry is left untouched.
    pub fn register(&self, key: &str, session: Arc<Session<T>>) -> Result<(), SessionError> {
        match self.sessions.entry(key.to_string()) {
            Entry::Occupied(_) => {
                tracing::error!(
                    connection_id = %key,
                    "Duplicate session registration; connection events delivered twice"
                );
                Err(SessionError::DuplicateSession(key.to_string()))
            }
            Entry::Vacant(entry) => {
                entry.insert(session);
                Ok(())
            }
        }
    }

    /// Returns the session for a key, if any.
    pub fn lookup(&self, key: &str) -> Option<Arc<Session<T>>> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Removes and returns the session for a key.
    ///
    /// Returns `None` if it was already removed.
    pub fn remove(&self, key: &str) -> Option<Arc<Session<T>>> {
        self.sessions.remove(key).map(|(_, session)| session)
    }

    /// Whether a session is registered under the key.
    pub fn contains(&self, key: &str) -> bool {
        self.sessions.contains_key(key)
    }

    /// Returns the number of registered sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Returns all registered keys.
    pub fn connection_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Removes and returns every session.
    pub fn drain(&self) -> Vec<Arc<Session<T>>> {
        self.connection_ids()
            .into_iter()
            .filter_map(|key| self.remove(&key))
            .collect()
    }
}

impl<T: Terminal> Default for SessionRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::mock::MockTerminal;
    use crate::session::SpawnOptions;

    fn session(key: &str) -> Arc<Session<MockTerminal>> {
        let terminal = MockTerminal::spawn(&SpawnOptions::default()).unwrap();
        Arc::new(Session::new(key, SessionMode::Dedicated, terminal))
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = SessionRegistry::new();
        registry.register("c1", session("c1")).unwrap();

        assert_eq!(registry.len(), 1);
        assert!(registry.contains("c1"));
        let found = registry.lookup("c1").unwrap();
        assert_eq!(found.key(), "c1");
        assert!(registry.lookup("c2").is_none());
    }

    #[test]
    fn test_register_duplicate_rejected() {
        let registry = SessionRegistry::new();
        let first = session("c1");
        registry.register("c1", Arc::clone(&first)).unwrap();

        let result = registry.register("c1", session("c1"));
        assert!(matches!(result, Err(SessionError::DuplicateSession(ref k)) if k == "c1"));

        // The original entry survives.
        assert!(Arc::ptr_eq(&registry.lookup("c1").unwrap(), &first));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = SessionRegistry::new();
        registry.register("c1", session("c1")).unwrap();

        assert!(registry.remove("c1").is_some());
        assert!(registry.remove("c1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_drain() {
        let registry = SessionRegistry::new();
        registry.register("a", session("a")).unwrap();
        registry.register("b", session("b")).unwrap();

        let mut keys: Vec<_> = registry.drain().iter().map(|s| s.key().to_string()).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_concurrent_register_one_winner() {
        let registry = Arc::new(SessionRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.register("same", session("same")).is_ok())
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_remove_one_winner() {
        let registry = Arc::new(SessionRegistry::new());
        registry.register("c1", session("c1")).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || registry.remove("c1").is_some())
            })
            .collect();

        let removed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(removed, 1);
    }

    #[test]
    fn test_session_mode_parse() {
        assert_eq!("dedicated".parse::<SessionMode>(), Ok(SessionMode::Dedicated));
        assert_eq!(" Shared ".parse::<SessionMode>(), Ok(SessionMode::Shared));
        assert!("global".parse::<SessionMode>().is_err());
        assert_eq!(SessionMode::default(), SessionMode::Dedicated);
        assert_eq!(SessionMode::Shared.to_string(), "shared");
    }
}
