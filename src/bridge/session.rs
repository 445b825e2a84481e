// ABOUTME: Session registry tracking logical client contexts independent of workers
//
// Sessions are created implicitly on first use, ended explicitly or reaped
// when idle. The registry only remembers which worker last served a session so
// the supervisor can dispatch a best-effort `cleanup_session` there.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use super::worker::WorkerId;

/// Bookkeeping for one session
#[derive(Debug, Clone)]
struct SessionRecord {
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    last_activity: Instant,
    operation_count: u64,
    last_worker: Option<WorkerId>,
}

impl SessionRecord {
    fn new() -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_activity_at: now,
            last_activity: Instant::now(),
            operation_count: 0,
            last_worker: None,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Instant::now();
        self.last_activity_at = Utc::now();
    }

    fn idle_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }
}

/// Public view of a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session id
    pub session_id: String,
    /// First use
    pub created_at: DateTime<Utc>,
    /// Most recent use
    pub last_activity_at: DateTime<Utc>,
    /// Requests issued under this session
    pub operation_count: u64,
    /// Worker that served the latest request
    pub last_worker: Option<WorkerId>,
}

/// Where to send `cleanup_session` for an ended session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupHint {
    /// Session that ended
    pub session_id: String,
    /// Worker known to hold its state, if any
    pub worker_id: Option<WorkerId>,
}

/// Registry of live sessions
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionRecord>>,
}

impl SessionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh session id
    #[must_use]
    pub fn generate_session_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Record activity, creating the session on first use
    ///
    /// Returns the session's operation count including this one.
    pub fn touch(&self, session_id: &str) -> u64 {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let record = sessions
            .entry(session_id.to_string())
            .or_insert_with(SessionRecord::new);
        record.touch();
        record.operation_count += 1;
        record.operation_count
    }

    /// Remember which worker served the session last
    pub fn record_worker(&self, session_id: &str, worker_id: WorkerId) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = sessions.get_mut(session_id) {
            record.last_worker = Some(worker_id);
            record.touch();
        }
    }

    /// End a session
    ///
    /// Returns `None` for unknown sessions; otherwise the hint says which
    /// worker (if any) should receive `cleanup_session`.
    pub fn end_session(&self, session_id: &str) -> Option<CleanupHint> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.remove(session_id).map(|record| CleanupHint {
            session_id: session_id.to_string(),
            worker_id: record.last_worker,
        })
    }

    /// Remove every session idle longer than `max_idle`
    pub fn reap_stale(&self, max_idle: Duration) -> Vec<CleanupHint> {
        self.reap_stale_at(Instant::now(), max_idle)
    }

    fn reap_stale_at(&self, now: Instant, max_idle: Duration) -> Vec<CleanupHint> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let stale: Vec<String> = sessions
            .iter()
            .filter(|(_, record)| record.idle_duration(now) > max_idle)
            .map(|(id, _)| id.clone())
            .collect();

        let mut hints: Vec<CleanupHint> = stale
            .into_iter()
            .filter_map(|id| {
                sessions.remove(&id).map(|record| CleanupHint {
                    session_id: id,
                    worker_id: record.last_worker,
                })
            })
            .collect();
        hints.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        hints
    }

    /// Number of live sessions
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Look up a session
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SessionInfo> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions.get(session_id).map(|record| SessionInfo {
            session_id: session_id.to_string(),
            created_at: record.created_at,
            last_activity_at: record.last_activity_at,
            operation_count: record.operation_count,
            last_worker: record.last_worker,
        })
    }

    /// Ids of all live sessions, sorted
    #[must_use]
    pub fn session_ids(&self) -> Vec<String> {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = sessions.keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_touch_creates_and_counts() {
        let registry = SessionRegistry::new();
        assert_eq!(registry.touch("s1"), 1);
        assert_eq!(registry.touch("s1"), 2);
        assert_eq!(registry.touch("s2"), 1);
        assert_eq!(registry.active_count(), 2);

        let info = registry.get("s1").unwrap();
        assert_eq!(info.operation_count, 2);
        assert!(info.last_activity_at >= info.created_at);
    }

    #[test]
    fn test_end_session_returns_worker_hint() {
        let registry = SessionRegistry::new();
        registry.touch("s1");
        registry.record_worker("s1", WorkerId::from_raw(2));

        let hint = registry.end_session("s1").unwrap();
        assert_eq!(
            hint,
            CleanupHint {
                session_id: "s1".to_string(),
                worker_id: Some(WorkerId::from_raw(2)),
            }
        );
        assert!(registry.get("s1").is_none());
        assert!(registry.end_session("s1").is_none());
    }

    #[test]
    fn test_record_worker_ignores_unknown_session() {
        let registry = SessionRegistry::new();
        registry.record_worker("ghost", WorkerId::from_raw(1));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_end_session_without_worker() {
        let registry = SessionRegistry::new();
        registry.touch("s1");
        assert_eq!(registry.end_session("s1").unwrap().worker_id, None);
    }

    #[test]
    fn test_reap_stale_only_removes_idle() {
        let registry = SessionRegistry::new();
        registry.touch("old");
        registry.record_worker("old", WorkerId::from_raw(9));
        registry.touch("fresh");

        let later = Instant::now() + Duration::from_secs(120);
        // Refresh "fresh" relative to the simulated clock
        {
            let mut sessions = registry.sessions.write().unwrap();
            sessions.get_mut("fresh").unwrap().last_activity = later;
        }

        let reaped = registry.reap_stale_at(later, Duration::from_secs(60));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].session_id, "old");
        assert_eq!(reaped[0].worker_id, Some(WorkerId::from_raw(9)));
        assert_eq!(registry.session_ids(), vec!["fresh".to_string()]);
    }

    #[test]
    fn test_reap_stale_with_real_clock() {
        let registry = SessionRegistry::new();
        registry.touch("s1");
        assert!(registry.reap_stale(Duration::from_secs(60)).is_empty());
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(registry.reap_stale(Duration::from_millis(5)).len(), 1);
    }

    #[test]
    fn test_generated_ids_are_unique() {
        let a = SessionRegistry::generate_session_id();
        let b = SessionRegistry::generate_session_id();
        assert_ne!(a, b);
        assert_eq!(a.len(), 36);
    }
}
