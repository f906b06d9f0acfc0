//! In-memory session registry.
//!
//! Sessions tie submitted jobs and vault credentials to a caller. Entries
//! expire lazily on access and in bulk during maintenance sweeps; none of
//! the operations suspend.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

/// A tracked session.
#[derive(Debug, Clone)]
struct Session {
    id: String,
    user_id: Option<String>,
    authenticated: bool,
    created_at: DateTime<Utc>,
    last_activity: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    active_jobs: HashSet<Uuid>,
}

/// Owned read model of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionView {
    pub session_id: String,
    pub user_id: Option<String>,
    pub authenticated: bool,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub active_job_count: usize,
}

impl SessionView {
    fn from_session(session: &Session) -> Self {
        Self {
            session_id: session.id.clone(),
            user_id: session.user_id.clone(),
            authenticated: session.authenticated,
            created_at: session.created_at,
            last_activity: session.last_activity,
            expires_at: session.expires_at,
            active_job_count: session.active_jobs.len(),
        }
    }
}

/// Partial update applied by [`SessionRegistry::update`].
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    /// Attach or replace the owning user.
    pub user_id: Option<String>,
    /// Override the authenticated flag.
    pub authenticated: Option<bool>,
    /// Restart the TTL clock from now.
    pub renew_ttl: Option<Duration>,
}

/// Registry of live sessions keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Create a session and return its id.
    ///
    /// The session starts authenticated iff an owning user is supplied.
    pub fn create(&self, user_id: Option<String>, ttl: Duration) -> String {
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4().to_string(),
            authenticated: user_id.is_some(),
            user_id,
            created_at: now,
            last_activity: now,
            expires_at: expiry_from(now, ttl),
            active_jobs: HashSet::new(),
        };
        let session_id = session.id.clone();
        debug!(session_id = %session_id, authenticated = session.authenticated, "Session created");
        self.sessions.insert(session_id.clone(), session);
        session_id
    }

    /// Entry guard for a live session. Expired entries are deleted on the
    /// way through and report as absent.
    fn live(&self, session_id: &str) -> Option<dashmap::mapref::one::RefMut<'_, String, Session>> {
        let expired = match self.sessions.get(session_id) {
            Some(session) => Utc::now() >= session.expires_at,
            None => return None,
        };
        if expired {
            // Drop the read guard before removing to avoid self-deadlock.
            self.sessions.remove(session_id);
            debug!(session_id, "Session expired");
            return None;
        }
        self.sessions.get_mut(session_id)
    }

    /// Fetch a session view, touching its activity timestamp.
    pub fn get(&self, session_id: &str) -> Option<SessionView> {
        let mut session = self.live(session_id)?;
        session.last_activity = Utc::now();
        Some(SessionView::from_session(&session))
    }

    /// Apply a partial update. Returns false for unknown or expired ids.
    pub fn update(&self, session_id: &str, patch: SessionUpdate) -> bool {
        let Some(mut session) = self.live(session_id) else {
            return false;
        };
        if let Some(user_id) = patch.user_id {
            session.user_id = Some(user_id);
            session.authenticated = true;
        }
        if let Some(authenticated) = patch.authenticated {
            session.authenticated = authenticated;
        }
        if let Some(ttl) = patch.renew_ttl {
            session.expires_at = expiry_from(Utc::now(), ttl);
        }
        session.last_activity = Utc::now();
        true
    }

    pub fn delete(&self, session_id: &str) -> bool {
        self.sessions.remove(session_id).is_some()
    }

    /// Whether the session exists, is unexpired, and is authenticated.
    pub fn is_authenticated(&self, session_id: &str) -> bool {
        self.live(session_id)
            .map(|session| session.authenticated)
            .unwrap_or(false)
    }

    /// Attach a job to the session's active set.
    ///
    /// Membership is idempotent; the return value reports whether the
    /// session was live, not whether the job was new.
    pub fn add_job(&self, session_id: &str, job_id: Uuid) -> bool {
        let Some(mut session) = self.live(session_id) else {
            return false;
        };
        session.active_jobs.insert(job_id);
        true
    }

    /// Detach a job from the session's active set.
    pub fn remove_job(&self, session_id: &str, job_id: Uuid) -> bool {
        let Some(mut session) = self.live(session_id) else {
            return false;
        };
        session.active_jobs.remove(&job_id);
        true
    }

    /// Number of active jobs held by the session. 0 for unknown/expired.
    pub fn active_job_count(&self, session_id: &str) -> usize {
        self.live(session_id)
            .map(|session| session.active_jobs.len())
            .unwrap_or(0)
    }

    /// Remove every expired session. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut removed = 0;
        self.sessions.retain(|_, session| {
            let keep = now < session.expires_at;
            if !keep {
                removed += 1;
            }
            keep
        });
        if removed > 0 {
            debug!(count = removed, "Swept expired sessions");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        Err(_) => DateTime::<Utc>::MAX_UTC,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn test_create_anonymous_session() {
        let registry = SessionRegistry::new();
        let id = registry.create(None, TTL);

        let view = registry.get(&id).unwrap();
        assert!(!view.authenticated);
        assert!(view.user_id.is_none());
        assert_eq!(view.active_job_count, 0);
        assert!(!registry.is_authenticated(&id));
    }

    #[test]
    fn test_create_owned_session_is_authenticated() {
        let registry = SessionRegistry::new();
        let id = registry.create(Some("user-1".to_string()), TTL);

        let view = registry.get(&id).unwrap();
        assert!(view.authenticated);
        assert_eq!(view.user_id.as_deref(), Some("user-1"));
        assert!(registry.is_authenticated(&id));
    }

    #[test]
    fn test_get_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(registry.get("nope").is_none());
        assert!(!registry.is_authenticated("nope"));
        assert_eq!(registry.active_job_count("nope"), 0);
    }

    #[test]
    fn test_expired_session_removed_lazily() {
        let registry = SessionRegistry::new();
        let id = registry.create(None, Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));

        assert!(registry.get(&id).is_none());
        assert_eq!(registry.session_count(), 0);
    }

    #[test]
    fn test_get_touches_last_activity() {
        let registry = SessionRegistry::new();
        let id = registry.create(None, TTL);
        let first = registry.get(&id).unwrap().last_activity;
        std::thread::sleep(Duration::from_millis(5));
        let second = registry.get(&id).unwrap().last_activity;
        assert!(second > first);
    }

    #[test]
    fn test_update_promotes_to_authenticated() {
        let registry = SessionRegistry::new();
        let id = registry.create(None, TTL);

        let updated = registry.update(
            &id,
            SessionUpdate {
                user_id: Some("user-9".to_string()),
                ..SessionUpdate::default()
            },
        );
        assert!(updated);

        let view = registry.get(&id).unwrap();
        assert!(view.authenticated);
        assert_eq!(view.user_id.as_deref(), Some("user-9"));
    }

    #[test]
    fn test_update_renews_ttl() {
        let registry = SessionRegistry::new();
        let id = registry.create(None, Duration::from_secs(1));
        let before = registry.get(&id).unwrap().expires_at;

        assert!(registry.update(
            &id,
            SessionUpdate {
                renew_ttl: Some(Duration::from_secs(3600)),
                ..SessionUpdate::default()
            },
        ));
        let after = registry.get(&id).unwrap().expires_at;
        assert!(after > before);
    }

    #[test]
    fn test_update_unknown_session() {
        let registry = SessionRegistry::new();
        assert!(!registry.update("nope", SessionUpdate::default()));
    }

    #[test]
    fn test_job_membership_is_idempotent() {
        let registry = SessionRegistry::new();
        let id = registry.create(None, TTL);
        let job = Uuid::new_v4();

        assert!(registry.add_job(&id, job));
        assert!(registry.add_job(&id, job));
        assert_eq!(registry.active_job_count(&id), 1);

        assert!(registry.remove_job(&id, job));
        assert!(registry.remove_job(&id, job));
        assert_eq!(registry.active_job_count(&id), 0);

        assert!(!registry.add_job("nope", job));
        assert!(!registry.remove_job("nope", job));
    }

    #[test]
    fn test_delete_session() {
        let registry = SessionRegistry::new();
        let id = registry.create(None, TTL);
        assert!(registry.delete(&id));
        assert!(!registry.delete(&id));
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let registry = SessionRegistry::new();
        let expired = registry.create(None, Duration::ZERO);
        let live = registry.create(None, TTL);
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(registry.sweep_expired(), 1);
        assert!(registry.get(&expired).is_none());
        assert!(registry.get(&live).is_some());
    }
}
