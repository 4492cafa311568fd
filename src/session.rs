//! Client-facing session tracking.
//!
//! Sessions are continuity tokens for one external client's connection
//! lifetime. There is no closing handshake in this protocol — sessions end
//! by silence: a session idles into expiry and is garbage-collected lazily
//! by [`SessionManager::sweep`], never by a dedicated timer.

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use uuid::Uuid;

/// Default idle timeout before a session expires (one hour).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(3600);

/// State for a single client session.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    /// Opaque unique session token
    pub session_id: String,
    /// Challenge the session last talked to, if any
    pub challenge_id: Option<String>,
    /// When the session was created
    pub created_at: DateTime<Utc>,
    /// Last time the client was heard from
    pub last_active: DateTime<Utc>,
    /// Number of messages exchanged on this session
    pub message_count: u64,
}

/// Tracks client sessions and their liveness.
///
/// Backed by a sharded concurrent map, so every mutation is linearizable per
/// session id: concurrent touches from out-of-order network deliveries can
/// neither lose a `message_count` increment nor regress `last_active`.
#[derive(Debug)]
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    timeout: TimeDelta,
}

impl SessionManager {
    /// Create a manager with the given idle timeout.
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            timeout: TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX),
        }
    }

    /// Create a new session and return its token.
    ///
    /// Tokens are fresh UUIDs and never reused.
    pub fn create(&self) -> String {
        let session_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        self.sessions.insert(
            session_id.clone(),
            Session {
                session_id: session_id.clone(),
                challenge_id: None,
                created_at: now,
                last_active: now,
                message_count: 0,
            },
        );
        session_id
    }

    /// Look up a session by token.
    ///
    /// Returns `None` for unknown sessions and for sessions that have idled
    /// past the timeout — expiry is observed lazily here; the entry itself
    /// is only removed by [`sweep`](Self::sweep).
    pub fn get(&self, session_id: &str) -> Option<Session> {
        let entry = self.sessions.get(session_id)?;
        if Utc::now() - entry.last_active > self.timeout {
            return None;
        }
        Some(entry.clone())
    }

    /// Mark a session as active: bump `message_count` and advance
    /// `last_active`.
    ///
    /// `last_active` is set to the max of its current value and now, so a
    /// late-delivered touch can never move the clock backwards.
    pub fn touch(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                let now = Utc::now();
                entry.last_active = entry.last_active.max(now);
                entry.message_count += 1;
                true
            }
            None => false,
        }
    }

    /// Refresh `last_active` without counting a message.
    ///
    /// Used by the streaming endpoint's keep-alive loop: an open stream is
    /// activity, but heartbeat frames are not messages.
    pub fn keep_alive(&self, session_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.last_active = entry.last_active.max(Utc::now());
                true
            }
            None => false,
        }
    }

    /// Associate a session with the challenge it is talking to.
    pub fn set_challenge(&self, session_id: &str, challenge_id: &str) -> bool {
        match self.sessions.get_mut(session_id) {
            Some(mut entry) => {
                entry.challenge_id = Some(challenge_id.to_string());
                true
            }
            None => false,
        }
    }

    /// Remove sessions idle longer than the timeout.
    ///
    /// Invoked opportunistically (the status endpoint calls it), not by a
    /// timer. Returns how many sessions were removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> usize {
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| now - session.last_active <= self.timeout);
        before - self.sessions.len()
    }

    /// Number of tracked (not yet swept) sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    /// Snapshot of all tracked sessions, for diagnostics.
    pub fn snapshot(&self) -> Vec<Session> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_create_and_get() {
        let manager = SessionManager::default();
        let id = manager.create();
        let session = manager.get(&id).expect("session should exist");
        assert_eq!(session.session_id, id);
        assert_eq!(session.message_count, 0);
        assert!(session.challenge_id.is_none());
    }

    #[test]
    fn test_session_ids_unique() {
        let manager = SessionManager::default();
        let a = manager.create();
        let b = manager.create();
        assert_ne!(a, b);
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn test_get_unknown_session() {
        let manager = SessionManager::default();
        assert!(manager.get("no-such-session").is_none());
    }

    #[test]
    fn test_touch_increments_count() {
        let manager = SessionManager::default();
        let id = manager.create();
        assert!(manager.touch(&id));
        assert!(manager.touch(&id));
        let session = manager.get(&id).expect("session should exist");
        assert_eq!(session.message_count, 2);
    }

    #[test]
    fn test_touch_unknown_session() {
        let manager = SessionManager::default();
        assert!(!manager.touch("no-such-session"));
    }

    #[test]
    fn test_touch_never_regresses_last_active() {
        let manager = SessionManager::default();
        let id = manager.create();
        manager.touch(&id);
        let first = manager.get(&id).expect("exists").last_active;
        manager.touch(&id);
        let second = manager.get(&id).expect("exists").last_active;
        assert!(second >= first);
    }

    /// N concurrent touches leave message_count exactly N.
    #[test]
    fn test_concurrent_touches_exact_count() {
        let manager = Arc::new(SessionManager::default());
        let id = manager.create();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let id = id.clone();
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        manager.touch(&id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("touch thread should not panic");
        }

        let session = manager.get(&id).expect("session should exist");
        assert_eq!(session.message_count, 400);
    }

    #[test]
    fn test_keep_alive_does_not_count_messages() {
        let manager = SessionManager::default();
        let id = manager.create();
        assert!(manager.keep_alive(&id));
        let session = manager.get(&id).expect("session should exist");
        assert_eq!(session.message_count, 0);
        assert!(!manager.keep_alive("no-such-session"));
    }

    #[test]
    fn test_expired_session_not_returned() {
        let manager = SessionManager::new(Duration::from_secs(0));
        let id = manager.create();
        std::thread::sleep(std::time::Duration::from_millis(5));
        // Idled past the zero timeout: lazily treated as expired
        assert!(manager.get(&id).is_none());
        // ...but the entry is still tracked until swept
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_sweep_removes_only_stale() {
        let manager = SessionManager::new(Duration::from_secs(3600));
        let fresh = manager.create();
        let stale = manager.create();
        // Backdate the stale session past the timeout
        if let Some(mut entry) = manager.sessions.get_mut(&stale) {
            entry.last_active = Utc::now() - TimeDelta::seconds(7200);
        }

        let removed = manager.sweep(Utc::now());
        assert_eq!(removed, 1);
        assert!(manager.get(&fresh).is_some());
        assert!(manager.get(&stale).is_none());
        assert_eq!(manager.active_count(), 1);
    }

    #[test]
    fn test_sweep_on_empty_manager() {
        let manager = SessionManager::default();
        assert_eq!(manager.sweep(Utc::now()), 0);
    }

    #[test]
    fn test_set_challenge() {
        let manager = SessionManager::default();
        let id = manager.create();
        assert!(manager.set_challenge(&id, "level-01-token-exposure"));
        let session = manager.get(&id).expect("session should exist");
        assert_eq!(
            session.challenge_id.as_deref(),
            Some("level-01-token-exposure")
        );
        assert!(!manager.set_challenge("no-such-session", "x"));
    }
}
