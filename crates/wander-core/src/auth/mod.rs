//! Session boundary consumed by the sync engine.
//!
//! Sign-in and token refresh live in the application; the engine only asks
//! whether a usable session exists right now.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::util::now_utc;

const EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthUser {
    pub id: String,
    pub email: Option<String>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub access_token: String,
    pub expires_at: i64,
    pub user: AuthUser,
}

impl AuthSession {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at <= now_utc().timestamp() + EXPIRY_SKEW_SECONDS
    }
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AuthSession")
            .field("access_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("user", &self.user)
            .finish()
    }
}

/// Supplies the current session, refreshing it if the implementation can.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Returns `None` when nobody is signed in or the session cannot be renewed.
    async fn current_session(&self) -> Option<AuthSession>;
}

/// Session holder the application updates after sign-in, refresh and sign-out.
#[derive(Clone, Default)]
pub struct SharedSession {
    session: Arc<RwLock<Option<AuthSession>>>,
}

impl SharedSession {
    pub fn new(session: Option<AuthSession>) -> Self {
        Self {
            session: Arc::new(RwLock::new(session)),
        }
    }

    pub async fn set(&self, session: Option<AuthSession>) {
        *self.session.write().await = session;
    }
}

#[async_trait]
impl SessionProvider for SharedSession {
    async fn current_session(&self) -> Option<AuthSession> {
        self.session
            .read()
            .await
            .clone()
            .filter(|session| !session.is_expired())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(expires_at: i64) -> AuthSession {
        AuthSession {
            access_token: "secret".to_string(),
            expires_at,
            user: AuthUser {
                id: "user-1".to_string(),
                email: None,
            },
        }
    }

    #[test]
    fn auth_session_debug_redacts_token() {
        let debug = format!("{:?}", session(123));
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn shared_session_hides_expired_sessions() {
        let shared = SharedSession::new(Some(session(0)));
        assert!(shared.current_session().await.is_none());

        let fresh = session(now_utc().timestamp() + 3_600);
        shared.set(Some(fresh.clone())).await;
        assert_eq!(shared.current_session().await, Some(fresh));

        shared.set(None).await;
        assert!(shared.current_session().await.is_none());
    }
}
