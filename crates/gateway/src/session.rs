//! Logical client sessions that outlive individual connections.
//!
//! A session keeps a bounded log of the events sent while it was active so
//! a client that reconnects can ask for everything after the last
//! correlation id it saw. Sessions refer to connections by id only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub last_correlation_id: Option<String>,
    pub agent_running: bool,
    pub pending_count: usize,
}

#[derive(Debug)]
struct Session {
    session_id: String,
    last_correlation_id: Option<String>,
    agent_running: bool,
    log: VecDeque<Value>,
    connections: HashSet<String>,
    created_at: DateTime<Utc>,
    last_seen: Instant,
}

impl Session {
    fn new(session_id: &str) -> Self {
        Self {
            session_id: session_id.to_string(),
            last_correlation_id: None,
            agent_running: false,
            log: VecDeque::new(),
            connections: HashSet::new(),
            created_at: Utc::now(),
            last_seen: Instant::now(),
        }
    }

    fn state(&self) -> SessionState {
        SessionState {
            session_id: self.session_id.clone(),
            last_correlation_id: self.last_correlation_id.clone(),
            agent_running: self.agent_running,
            pending_count: self.log.len(),
        }
    }
}

pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Session>>,
    /// Events retained per session
    log_capacity: usize,
}

impl SessionRegistry {
    pub fn new(log_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            log_capacity: log_capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Look a session up, creating it if needed. The flag is `true` when the
    /// session did not exist before.
    pub fn get_or_create_session(&self, session_id: &str) -> (SessionState, bool) {
        let mut sessions = self.lock();
        let is_new = !sessions.contains_key(session_id);
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id));
        session.last_seen = Instant::now();
        if is_new {
            info!(session_id, "Session created");
        } else {
            debug!(session_id, "Session resumed");
        }
        (session.state(), is_new)
    }

    /// Attach a connection to a session, detaching it from any other.
    /// Returns `false` if the session does not exist.
    pub fn link_connection_to_session(&self, session_id: &str, connection_id: &str) -> bool {
        let mut sessions = self.lock();
        if !sessions.contains_key(session_id) {
            return false;
        }
        for session in sessions.values_mut() {
            session.connections.remove(connection_id);
        }
        if let Some(session) = sessions.get_mut(session_id) {
            session.connections.insert(connection_id.to_string());
            session.last_seen = Instant::now();
        }
        debug!(session_id, connection_id, "Connection linked to session");
        true
    }

    pub fn unlink_connection(&self, connection_id: &str) {
        for session in self.lock().values_mut() {
            if session.connections.remove(connection_id) {
                session.last_seen = Instant::now();
            }
        }
    }

    pub fn session_for_connection(&self, connection_id: &str) -> Option<String> {
        self.lock()
            .values()
            .find(|s| s.connections.contains(connection_id))
            .map(|s| s.session_id.clone())
    }

    /// Append an event to a session's log, trimming the oldest beyond
    /// capacity. Unknown sessions are ignored.
    pub fn record_message(&self, session_id: &str, event: Value) {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };
        session.log.push_back(event);
        while session.log.len() > self.log_capacity {
            session.log.pop_front();
        }
        session.last_seen = Instant::now();
    }

    /// Events logged after the last one carrying `since_correlation_id`, in
    /// their original order.
    ///
    /// With no id, or one the log no longer holds, the whole log is returned.
    pub fn get_pending_messages(
        &self,
        session_id: &str,
        since_correlation_id: Option<&str>,
    ) -> Vec<Value> {
        let sessions = self.lock();
        let Some(session) = sessions.get(session_id) else {
            return Vec::new();
        };
        let start = since_correlation_id
            .and_then(|cid| {
                session
                    .log
                    .iter()
                    .rposition(|e| e.get("correlation_id").and_then(Value::as_str) == Some(cid))
            })
            .map_or(0, |i| i + 1);
        session.log.iter().skip(start).cloned().collect()
    }

    /// Update the running flag and/or the last correlation id.
    pub fn update_session_state(
        &self,
        session_id: &str,
        agent_running: Option<bool>,
        last_correlation_id: Option<&str>,
    ) {
        let mut sessions = self.lock();
        let Some(session) = sessions.get_mut(session_id) else {
            return;
        };
        if let Some(running) = agent_running {
            session.agent_running = running;
        }
        if let Some(cid) = last_correlation_id {
            session.last_correlation_id = Some(cid.to_string());
        }
        session.last_seen = Instant::now();
    }

    /// Drop sessions with no attached connection that have been idle longer
    /// than `max_idle`. Returns how many were removed.
    pub fn remove_idle_sessions(&self, max_idle: Duration) -> usize {
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| !s.connections.is_empty() || s.last_seen.elapsed() <= max_idle);
        let removed = before - sessions.len();
        if removed > 0 {
            info!(removed, remaining = sessions.len(), "Idle sessions removed");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Every session, oldest first.
    pub fn snapshots(&self) -> Vec<SessionState> {
        let sessions = self.lock();
        let mut all: Vec<&Session> = sessions.values().collect();
        all.sort_by_key(|s| s.created_at);
        all.into_iter().map(Session::state).collect()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(cid: &str, n: u32) -> Value {
        json!({"type": "step", "step_number": n, "correlation_id": cid})
    }

    fn registry_with_log() -> SessionRegistry {
        let registry = SessionRegistry::new(100);
        registry.get_or_create_session("s1");
        registry.record_message("s1", event("req_a", 1));
        registry.record_message("s1", event("req_a", 2));
        registry.record_message("s1", event("req_b", 1));
        registry.record_message("s1", event("req_c", 1));
        registry
    }

    #[test]
    fn first_lookup_creates() {
        let registry = SessionRegistry::default();
        let (state, is_new) = registry.get_or_create_session("s1");
        assert!(is_new);
        assert!(!state.agent_running);
        let (_, is_new) = registry.get_or_create_session("s1");
        assert!(!is_new);
    }

    #[test]
    fn pending_messages_follow_the_given_correlation_id() {
        let registry = registry_with_log();
        let pending = registry.get_pending_messages("s1", Some("req_a"));
        assert_eq!(pending, vec![event("req_b", 1), event("req_c", 1)]);
    }

    #[test]
    fn pending_messages_empty_when_id_is_latest() {
        let registry = registry_with_log();
        assert!(registry.get_pending_messages("s1", Some("req_c")).is_empty());
    }

    #[test]
    fn unknown_or_missing_id_replays_everything() {
        let registry = registry_with_log();
        assert_eq!(registry.get_pending_messages("s1", None).len(), 4);
        assert_eq!(registry.get_pending_messages("s1", Some("req_zzz")).len(), 4);
        assert!(registry.get_pending_messages("nope", None).is_empty());
    }

    #[test]
    fn log_is_bounded() {
        let registry = SessionRegistry::new(2);
        registry.get_or_create_session("s1");
        for n in 0..5 {
            registry.record_message("s1", event("req", n));
        }
        let log = registry.get_pending_messages("s1", None);
        assert_eq!(log, vec![event("req", 3), event("req", 4)]);
    }

    #[test]
    fn link_moves_connection_between_sessions() {
        let registry = SessionRegistry::default();
        registry.get_or_create_session("s1");
        registry.get_or_create_session("s2");
        assert!(registry.link_connection_to_session("s1", "c1"));
        assert!(registry.link_connection_to_session("s2", "c1"));
        assert_eq!(registry.session_for_connection("c1").as_deref(), Some("s2"));
        assert!(!registry.link_connection_to_session("missing", "c1"));
    }

    #[test]
    fn state_updates_are_visible() {
        let registry = SessionRegistry::default();
        registry.get_or_create_session("s1");
        registry.update_session_state("s1", Some(true), Some("req_9"));
        let (state, _) = registry.get_or_create_session("s1");
        assert!(state.agent_running);
        assert_eq!(state.last_correlation_id.as_deref(), Some("req_9"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_sessions_without_connections_are_removed() {
        let registry = SessionRegistry::default();
        registry.get_or_create_session("idle");
        registry.get_or_create_session("linked");
        registry.link_connection_to_session("linked", "c1");

        tokio::time::advance(Duration::from_secs(120)).await;
        assert_eq!(registry.remove_idle_sessions(Duration::from_secs(60)), 1);
        assert_eq!(registry.snapshots().len(), 1);

        registry.unlink_connection("c1");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(registry.remove_idle_sessions(Duration::from_secs(60)), 1);
        assert!(registry.is_empty());
    }
}
