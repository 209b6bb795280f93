//! Authentication provider interface

use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

/// Source of the current session's identity
#[async_trait]
pub trait AuthProvider: Send + Sync + 'static {
    /// Bearer token of the signed-in user, if any
    async fn access_token(&self) -> Option<String>;

    /// Id of the signed-in user, if any
    fn user_id(&self) -> Option<String>;
}

/// No session; requests go out without credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct Anonymous;

#[async_trait]
impl AuthProvider for Anonymous {
    async fn access_token(&self) -> Option<String> {
        None
    }

    fn user_id(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
struct Session {
    user_id: String,
    token: String,
}

/// Session held in memory, set by whoever performs the sign-in
#[derive(Debug, Default)]
pub struct StaticSession {
    session: RwLock<Option<Session>>,
}

impl StaticSession {
    pub fn signed_in(user_id: impl Into<String>, token: impl Into<String>) -> Self {
        let session = Self::default();
        session.sign_in(user_id, token);
        session
    }

    pub fn sign_in(&self, user_id: impl Into<String>, token: impl Into<String>) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = Some(Session {
            user_id: user_id.into(),
            token: token.into(),
        });
    }

    pub fn sign_out(&self) {
        *self.session.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn current(&self) -> Option<Session> {
        self.session
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl AuthProvider for StaticSession {
    async fn access_token(&self) -> Option<String> {
        self.current().map(|s| s.token)
    }

    fn user_id(&self) -> Option<String> {
        self.current().map(|s| s.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn session_lifecycle() {
        let session = StaticSession::signed_in("u1", "tok");
        assert_eq!(session.access_token().await.as_deref(), Some("tok"));
        assert_eq!(session.user_id().as_deref(), Some("u1"));

        session.sign_out();
        assert_eq!(session.access_token().await, None);
        assert_eq!(Anonymous.user_id(), None);
    }
}
