//! Settings management API. Admin only; secret values are masked at this
//! boundary so internal consumers keep seeing the real values.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde::Deserialize;
use serde_json::{json, Value};

use super::auth::session_from_headers;
use super::{error_response, AppState};
use crate::store::{Setting, StoreError};

const SECRET_MASK: &str = "******";

#[derive(Debug, Default, Deserialize)]
pub struct SettingsParams {
    pub scope: Option<String>,
    pub category: Option<String>,
    pub account_id: Option<String>,
}

/// GET /api/settings?scope=&category=&account_id=
pub async fn handle_list_settings(
    State(state): State<AppState>,
    Query(params): Query<SettingsParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }

    let mut settings = match state.store.list_settings(
        params.scope.as_deref(),
        params.category.as_deref(),
        params.account_id.as_deref(),
    ) {
        Ok(settings) => settings,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    for setting in &mut settings {
        redact_secret(setting);
    }

    Json(json!({ "data": settings, "version": global_version(&state) })).into_response()
}

/// GET /api/settings/{key}
pub async fn handle_get_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<SettingsParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }

    match state.store.get_setting(
        &key,
        params.scope.as_deref().unwrap_or(""),
        params.account_id.as_deref(),
    ) {
        Ok(mut setting) => {
            redact_secret(&mut setting);
            Json(json!({ "data": setting, "version": global_version(&state) })).into_response()
        }
        Err(StoreError::NotFound) => error_response(StatusCode::NOT_FOUND, "not found"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct UpdateSettingRequest {
    #[serde(default)]
    pub value: Value,
    pub scope: Option<String>,
    pub account_id: Option<String>,
    pub data_type: Option<String>,
    pub category: Option<String>,
    pub description: Option<String>,
    pub is_secret: Option<bool>,
    #[serde(default)]
    pub version: i64,
    pub updated_by: Option<String>,
}

/// PUT /api/settings/{key}
///
/// Creating a missing key needs no version; replacing an existing one
/// requires the caller's version to match, otherwise 409 with the current
/// version so the client can refresh and retry.
pub async fn handle_put_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    payload: Result<Json<UpdateSettingRequest>, JsonRejection>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let Ok(Json(req)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "invalid json");
    };
    let scope = req
        .scope
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "system".to_string());

    let existing = match state
        .store
        .get_setting(&key, &scope, req.account_id.as_deref())
    {
        Ok(setting) => Some(setting),
        Err(StoreError::NotFound) => None,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    let Some(existing) = existing else {
        // Create: no version check.
        let mut setting = Setting {
            key: key.clone(),
            scope,
            account_id: req.account_id,
            value: req.value,
            data_type: req.data_type.unwrap_or_default(),
            category: req.category.unwrap_or_default(),
            description: req.description,
            is_secret: req.is_secret.unwrap_or(false),
            updated_by: req.updated_by,
            ..Default::default()
        };
        if let Err(err) = state.store.upsert_setting(&mut setting) {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
        sync_cache(&state, &setting);
        return Json(json!({ "success": true, "new_version": setting.version })).into_response();
    };

    if req.version == 0 {
        return error_response(StatusCode::BAD_REQUEST, "version required");
    }
    if req.version != existing.version {
        return version_conflict(existing.version);
    }

    let mut setting = Setting {
        key: key.clone(),
        scope,
        account_id: req.account_id,
        value: req.value,
        data_type: req
            .data_type
            .filter(|s| !s.is_empty())
            .unwrap_or(existing.data_type),
        category: req
            .category
            .filter(|s| !s.is_empty())
            .unwrap_or(existing.category),
        description: req.description.or(existing.description),
        is_secret: req.is_secret.unwrap_or(existing.is_secret),
        version: req.version,
        updated_by: req.updated_by,
        ..Default::default()
    };
    match state.store.update_setting(&mut setting) {
        Ok(()) => {
            sync_cache(&state, &setting);
            Json(json!({ "success": true, "new_version": setting.version })).into_response()
        }
        Err(StoreError::VersionConflict { current }) => version_conflict(current),
        Err(StoreError::NotFound) => error_response(StatusCode::NOT_FOUND, "not found"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchUpdateRequest {
    #[serde(default)]
    pub settings: Vec<Setting>,
}

/// POST /api/settings/batch — all-or-nothing.
pub async fn handle_batch_update(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<BatchUpdateRequest>, JsonRejection>,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    let Ok(Json(mut req)) = payload else {
        return error_response(StatusCode::BAD_REQUEST, "invalid json");
    };
    for setting in &mut req.settings {
        setting.key = setting.key.trim().to_string();
        if setting.key.is_empty() {
            return error_response(StatusCode::BAD_REQUEST, "key required");
        }
        if setting.scope.is_empty() {
            setting.scope = "system".to_string();
        }
    }

    match state.store.batch_update_settings(&mut req.settings) {
        Ok(()) => {
            for setting in &req.settings {
                sync_cache(&state, setting);
            }
            Json(json!({ "success": true, "version": global_version(&state) })).into_response()
        }
        Err(StoreError::VersionConflict { .. }) => {
            (StatusCode::CONFLICT, Json(json!({ "error": "version_conflict" }))).into_response()
        }
        Err(StoreError::NotFound) => error_response(StatusCode::NOT_FOUND, "not found"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// DELETE /api/settings/{key}?scope=&account_id=
pub async fn handle_delete_setting(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(params): Query<SettingsParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }

    match state.store.delete_setting(
        &key,
        params.scope.as_deref().unwrap_or(""),
        params.account_id.as_deref(),
    ) {
        Ok(()) => Json(json!({ "deleted": key })).into_response(),
        Err(StoreError::NotFound) => error_response(StatusCode::NOT_FOUND, "not found"),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// GET /api/settings/version
pub async fn handle_settings_version(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = require_admin(&state, &headers) {
        return resp;
    }
    Json(json!({ "version": global_version(&state) })).into_response()
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    match session_from_headers(&state.sessions, headers) {
        None => Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized")),
        Some(session) if !session.is_admin => {
            Err(error_response(StatusCode::FORBIDDEN, "forbidden"))
        }
        Some(_) => Ok(()),
    }
}

fn version_conflict(current: i64) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({ "error": "version_conflict", "current_version": current })),
    )
        .into_response()
}

fn global_version(state: &AppState) -> i64 {
    state.store.get_global_version().unwrap_or(0)
}

/// Keep the in-process cache current for system-scope changes the edge
/// just persisted; other scopes are picked up by the refresh loop.
fn sync_cache(state: &AppState, setting: &Setting) {
    if setting.scope == "system" {
        state
            .cache
            .update_local(&setting.key, setting.value.clone(), setting.version);
    }
}

fn redact_secret(setting: &mut Setting) {
    if setting.is_secret {
        setting.value = Value::String(SECRET_MASK.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_redact_secret_masks_value_only_when_secret() {
        let mut open = Setting {
            key: "endpoint".to_string(),
            value: json!("https://api.example.com"),
            ..Default::default()
        };
        redact_secret(&mut open);
        assert_eq!(open.value, json!("https://api.example.com"));

        let mut secret = Setting {
            key: "api_key".to_string(),
            value: json!("sk-live-123"),
            is_secret: true,
            ..Default::default()
        };
        redact_secret(&mut secret);
        assert_eq!(secret.value, json!(SECRET_MASK));
    }

    #[test]
    fn test_update_request_defaults() {
        let req: UpdateSettingRequest = serde_json::from_str(r#"{"value": 5}"#).unwrap();
        assert_eq!(req.value, json!(5));
        assert_eq!(req.version, 0, "missing version reads as zero");
        assert!(req.scope.is_none());
        assert!(req.is_secret.is_none());
    }
}
