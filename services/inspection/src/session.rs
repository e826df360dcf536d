//! Explicit session context.
//!
//! The auth provider authenticates users and signs their access tokens; the
//! service keeps one session per verified user. A session is acquired the
//! first time a user's identity is established, reused while that user stays
//! signed in, and torn down on sign-out. The admin flag is looked up once per
//! session and cached with it, together with the user's expanded shippers.

use crate::error::AuthError;
use crate::models::{Role, UserIdentity};
use crate::record_store::RecordStore;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use uuid::Uuid;

/// An authenticated session with its cached admin flag
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub user: UserIdentity,
    pub is_admin: bool,
    pub established_at: DateTime<Utc>,
}

impl Session {
    /// Fails unless the cached admin flag is set
    pub fn require_admin(&self) -> Result<(), AuthError> {
        if self.is_admin {
            Ok(())
        } else {
            Err(AuthError::AdminRequired)
        }
    }
}

struct ActiveSession {
    session: Arc<Session>,
    expanded: HashSet<Uuid>,
}

/// Sessions of every signed-in user, keyed by user id.
///
/// The number of active sessions is broadcast over `watch` so the refresh
/// loop can react to the first sign-in and the last sign-out.
pub struct SessionManager {
    records: Arc<dyn RecordStore>,
    sessions: RwLock<HashMap<Uuid, ActiveSession>>,
    active: watch::Sender<usize>,
}

impl SessionManager {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            records,
            sessions: RwLock::new(HashMap::new()),
            active,
        }
    }

    /// Session for `user`, establishing it on first sight.
    ///
    /// A user who is already signed in keeps the existing session and its
    /// cached admin flag. A failed role lookup yields a non-admin session.
    pub async fn establish(&self, user: UserIdentity) -> Arc<Session> {
        if let Some(existing) = self.get(user.id) {
            return existing;
        }

        let is_admin = match self.records.has_role(user.id, Role::Admin).await {
            Ok(is_admin) => is_admin,
            Err(e) => {
                warn!(user_id = %user.id, error = %e, "Admin role lookup failed");
                false
            }
        };

        let candidate = Arc::new(Session {
            user,
            is_admin,
            established_at: Utc::now(),
        });

        let mut sessions = self.sessions.write();
        // a concurrent establish for the same user may have won the race
        let session = sessions
            .entry(candidate.user.id)
            .or_insert_with(|| ActiveSession {
                session: candidate.clone(),
                expanded: HashSet::new(),
            })
            .session
            .clone();
        let count = sessions.len();
        drop(sessions);

        if Arc::ptr_eq(&session, &candidate) {
            info!(user_id = %session.user.id, is_admin, "Session established");
            metrics::gauge!("inspection.sessions.active").set(count as f64);
            self.active.send_replace(count);
        }
        session
    }

    /// Tear down `user_id`'s session; false when none was active
    pub fn sign_out(&self, user_id: Uuid) -> bool {
        let mut sessions = self.sessions.write();
        let removed = sessions.remove(&user_id).is_some();
        let count = sessions.len();
        drop(sessions);

        if removed {
            info!(user_id = %user_id, "Signed out");
            metrics::gauge!("inspection.sessions.active").set(count as f64);
            self.active.send_replace(count);
        }
        removed
    }

    pub fn get(&self, user_id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .get(&user_id)
            .map(|active| active.session.clone())
    }

    pub fn current_user(&self, user_id: Uuid) -> Option<UserIdentity> {
        self.get(user_id).map(|s| s.user.clone())
    }

    /// The session of `user_id`, or `AuthError::NoSession`
    pub fn require(&self, user_id: Uuid) -> Result<Arc<Session>, AuthError> {
        self.get(user_id).ok_or(AuthError::NoSession)
    }

    pub fn active_count(&self) -> usize {
        *self.active.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<usize> {
        self.active.subscribe()
    }

    /// Flip a shipper between expanded and collapsed for one user; returns
    /// the new state
    pub fn toggle_shipper(&self, user_id: Uuid, shipper_id: Uuid) -> Result<bool, AuthError> {
        let mut sessions = self.sessions.write();
        let active = sessions.get_mut(&user_id).ok_or(AuthError::NoSession)?;

        if active.expanded.remove(&shipper_id) {
            Ok(false)
        } else {
            active.expanded.insert(shipper_id);
            Ok(true)
        }
    }

    pub fn is_expanded(&self, user_id: Uuid, shipper_id: Uuid) -> bool {
        self.sessions
            .read()
            .get(&user_id)
            .is_some_and(|active| active.expanded.contains(&shipper_id))
    }

    pub fn expanded_shippers(&self, user_id: Uuid) -> Vec<Uuid> {
        self.sessions
            .read()
            .get(&user_id)
            .map(|active| active.expanded.iter().copied().collect())
            .unwrap_or_default()
    }
}
