//! WebSocket endpoint for live monitor events.
//!
//! Accepts either a session cookie or a share token; after the upgrade a
//! writer pump drains the hub queue while a reader pump keeps the socket
//! alive. Whichever side ends first unregisters the client exactly once.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;

use super::auth::session_from_headers;
use super::AppState;
use crate::store::StoreError;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// GET /api/monitor/ws?token=
pub async fn handle_monitor_ws(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let (account_id, is_share) =
        match authenticate_ws(&state, &headers, params.token.as_deref()) {
            Ok(resolved) => resolved,
            Err(_) => return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
        };

    ws.on_upgrade(move |socket| client_session(state, socket, account_id, is_share))
}

/// A session cookie wins; otherwise the share token is resolved through
/// the store to its owning account.
fn authenticate_ws(
    state: &AppState,
    headers: &HeaderMap,
    token: Option<&str>,
) -> Result<(String, bool), StoreError> {
    if let Some(session) = session_from_headers(&state.sessions, headers) {
        return Ok((session.account_id, false));
    }
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        let share = state.store.get_share_by_token(token)?;
        return Ok((share.account_id, true));
    }
    Err(StoreError::NotFound)
}

async fn client_session(state: AppState, socket: WebSocket, account_id: String, is_share: bool) {
    let mut registration = state.hub.register(&account_id, is_share).await;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            frame = registration.outbound.recv() => match frame {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                // Queue closed: the hub evicted this client.
                None => break,
            },
            inbound = stream.next() => match inbound {
                // Inbound payloads are not interpreted; they only prove
                // the peer is alive.
                Some(Ok(_)) => {}
                Some(Err(_)) | None => break,
            },
        }
    }

    state.hub.unregister(&account_id, registration.id).await;
    tracing::debug!(account = %account_id, "ws client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::SettingsCache;
    use crate::config::ServerConfig;
    use crate::hub::Hub;
    use crate::store::test_store;
    use crate::web::SessionManager;
    use axum::http::header::COOKIE;
    use axum::http::HeaderValue;
    use std::sync::Arc;

    fn test_state() -> (AppState, tempfile::NamedTempFile) {
        let (store, tmp) = test_store();
        let state = AppState {
            config: ServerConfig::default(),
            cache: Arc::new(SettingsCache::new(store.clone())),
            hub: Hub::new(),
            sessions: Arc::new(SessionManager::new()),
            store,
        };
        (state, tmp)
    }

    #[tokio::test]
    async fn test_authenticate_ws_share_token() {
        let (state, _tmp) = test_state();
        state.store.insert_monitor_share("share-1", "a9").unwrap();

        let (account, is_share) =
            authenticate_ws(&state, &HeaderMap::new(), Some("share-1")).unwrap();
        assert_eq!(account, "a9");
        assert!(is_share);

        assert!(authenticate_ws(&state, &HeaderMap::new(), Some("bad")).is_err());
        assert!(authenticate_ws(&state, &HeaderMap::new(), None).is_err());
        assert!(authenticate_ws(&state, &HeaderMap::new(), Some("")).is_err());
    }

    #[tokio::test]
    async fn test_authenticate_ws_session_cookie_wins() {
        let (state, _tmp) = test_state();
        state.sessions.put(
            "sess-1",
            crate::web::Session {
                account_id: "a1".to_string(),
                is_admin: false,
            },
        );
        state.store.insert_monitor_share("share-1", "a9").unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_static("session_token=sess-1"));
        let (account, is_share) = authenticate_ws(&state, &headers, Some("share-1")).unwrap();
        assert_eq!(account, "a1", "cookie takes precedence over the token");
        assert!(!is_share);
    }
}
