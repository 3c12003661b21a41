//! Caller identity resolution. Session issuance belongs to the proxy's
//! auth layer; the monitoring edge only consumes already-resolved
//! sessions.

use std::collections::HashMap;
use std::sync::RwLock;

use axum::http::header::COOKIE;
use axum::http::HeaderMap;

pub const SESSION_COOKIE: &str = "session_token";

/// A resolved caller.
#[derive(Debug, Clone)]
pub struct Session {
    pub account_id: String,
    pub is_admin: bool,
}

/// In-process view of active sessions, populated by the auth collaborator.
#[derive(Default)]
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, token: &str, session: Session) {
        self.sessions
            .write()
            .unwrap()
            .insert(token.to_string(), session);
    }

    pub fn get(&self, token: &str) -> Option<Session> {
        self.sessions.read().unwrap().get(token).cloned()
    }
}

/// Resolve the session cookie from request headers.
pub fn session_from_headers(sessions: &SessionManager, headers: &HeaderMap) -> Option<Session> {
    let cookie = headers.get(COOKIE)?.to_str().ok()?;
    let token = cookie.split(';').find_map(|part| {
        let (name, value) = part.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })?;
    sessions.get(&token)
}
