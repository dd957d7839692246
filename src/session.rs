use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

/// Interface of the login collaborator. Everything in this crate reads the
/// session through this trait and only ever writes to it through `touch`
/// and `invalidate`.
pub trait AuthProvider: Send + Sync {
    /// Current bearer token, if any.
    fn token(&self) -> Option<String>;

    /// Id of the logged-in user, echoed back by the media endpoint.
    fn user_id(&self) -> Option<i64>;

    /// Non-empty token and activity within the session timeout.
    fn is_valid(&self) -> bool;

    /// Record a successful network exchange.
    fn touch(&self);

    /// Drop the token. Callers must not hit the network again until re-login.
    fn invalidate(&self);
}

/// Credentials and activity timestamps of a logged-in user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user_id: i64,
    pub login_timestamp: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub remember: bool,
}

impl Session {
    pub fn new(token: &str, user_id: i64, remember: bool) -> Self {
        let now = Utc::now();
        Self {
            token: token.to_string(),
            user_id,
            login_timestamp: now,
            last_activity: now,
            remember,
        }
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.token.is_empty() {
            return false;
        }
        let idle = now.signed_duration_since(self.last_activity);
        match chrono::Duration::from_std(timeout) {
            Ok(limit) => idle <= limit,
            // Timeouts too large for chrono never expire.
            Err(_) => true,
        }
    }
}

/// Default in-memory [`AuthProvider`], shareable between the host's login
/// flow and the agent.
#[derive(Clone)]
pub struct SessionStore {
    current: Arc<RwLock<Option<Session>>>,
    timeout: Duration,
}

impl SessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            timeout,
        }
    }

    pub fn login(&self, token: &str, user_id: i64, remember: bool) {
        info!(user_id, "Session established");
        self.restore(Session::new(token, user_id, remember));
    }

    /// Install a previously persisted session as-is (timestamps included).
    pub fn restore(&self, session: Session) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(session);
    }

    /// Clear the session entirely (user-initiated logout).
    pub fn logout(&self) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = None;
    }

    pub fn snapshot(&self) -> Option<Session> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AuthProvider for SessionStore {
    fn token(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|s| !s.token.is_empty())
            .map(|s| s.token.clone())
    }

    fn user_id(&self) -> Option<i64> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|s| s.user_id)
    }

    fn is_valid(&self) -> bool {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|s| s.is_valid_at(Utc::now(), self.timeout))
    }

    fn touch(&self) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = guard.as_mut() {
            session.last_activity = Utc::now();
        }
    }

    fn invalidate(&self) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(session) = guard.as_mut() {
            debug!(user_id = session.user_id, "Invalidating session token");
            // The user id is kept so a re-login can be matched to the same account.
            session.token.clear();
        }
    }
}
