//! Node history endpoints: health-check history and metrics.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use serde::Deserialize;
use serde_json::json;

use super::auth::session_from_headers;
use super::{error_response, AppState};
use crate::store::{Granularity, HealthCheckQuery, MetricsQuery, NodeRecord, StoreError};

const DEFAULT_HISTORY_LIMIT: i64 = 300;
const MAX_HISTORY_LIMIT: i64 = 2000;

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub granularity: Option<String>,
}

/// GET /api/nodes/{node_id}/health-history
pub async fn handle_health_history(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(params): Query<HistoryParams>,
    headers: HeaderMap,
) -> Response {
    let node = match authorize_node_access(&state, &headers, &node_id) {
        Ok(node) => node,
        Err(resp) => return resp,
    };

    let to = match parse_time(params.to.as_deref()) {
        Ok(t) => t.unwrap_or_else(Utc::now),
        Err(()) => return error_response(StatusCode::BAD_REQUEST, "invalid to time"),
    };
    let from = match parse_time(params.from.as_deref()) {
        Ok(t) => t.unwrap_or_else(|| to - ChronoDuration::hours(24)),
        Err(()) => return error_response(StatusCode::BAD_REQUEST, "invalid from time"),
    };
    if from > to {
        return error_response(StatusCode::BAD_REQUEST, "from must be before to");
    }

    let query = HealthCheckQuery {
        account_id: node.account_id,
        node_id: node_id.clone(),
        from,
        to,
        limit: clamp_limit(params.limit),
        offset: params.offset.unwrap_or(0).max(0),
    };

    let records = match state.store.query_health_checks(&query) {
        Ok(records) => records,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };
    let total = match state.store.count_health_checks(&query) {
        Ok(total) => total,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    let checks: Vec<_> = records
        .iter()
        .map(|rec| {
            json!({
                "check_time": rec.check_time.map(rfc3339),
                "success": rec.success,
                "response_time_ms": rec.response_time_ms,
                "error_message": rec.error_message,
                "check_method": rec.check_method,
            })
        })
        .collect();

    Json(json!({
        "node_id": node_id,
        "from": rfc3339(from),
        "to": rfc3339(to),
        "total": total,
        "checks": checks,
    }))
    .into_response()
}

/// GET /api/nodes/{node_id}/metrics
pub async fn handle_node_metrics(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(params): Query<HistoryParams>,
    headers: HeaderMap,
) -> Response {
    let node = match authorize_node_access(&state, &headers, &node_id) {
        Ok(node) => node,
        Err(resp) => return resp,
    };

    let gran = match Granularity::parse(params.granularity.as_deref().unwrap_or("")) {
        Some(gran) => gran,
        None => return error_response(StatusCode::BAD_REQUEST, "invalid granularity"),
    };
    let to = match parse_time(params.to.as_deref()) {
        Ok(t) => t.unwrap_or_else(Utc::now),
        Err(()) => return error_response(StatusCode::BAD_REQUEST, "invalid to time"),
    };
    let from = match parse_time(params.from.as_deref()) {
        Ok(t) => t.unwrap_or_else(|| gran.default_window_from(to)),
        Err(()) => return error_response(StatusCode::BAD_REQUEST, "invalid from time"),
    };
    if from > to {
        return error_response(StatusCode::BAD_REQUEST, "from must be before to");
    }

    let query = MetricsQuery {
        account_id: node.account_id,
        node_id: Some(node_id.clone()),
        from: Some(from),
        to: Some(to),
        granularity: Some(gran),
        limit: params.limit.filter(|l| *l > 0).unwrap_or(0).min(MAX_HISTORY_LIMIT),
        offset: params.offset.unwrap_or(0).max(0),
    };

    let records = match state.store.query_metrics(&query) {
        Ok(records) => records,
        Err(err) => return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    };

    let metrics: Vec<_> = records
        .iter()
        .map(|r| {
            json!({
                "ts": r.timestamp.map(rfc3339),
                "requests_total": r.requests_total,
                "requests_success": r.requests_success,
                "requests_failed": r.requests_failed,
                "response_time_sum_ms": r.response_time_sum_ms,
                "response_time_count": r.response_time_count,
                "bytes_total": r.bytes_total,
                "input_tokens_total": r.input_tokens_total,
                "output_tokens_total": r.output_tokens_total,
                "first_byte_time_sum_ms": r.first_byte_time_sum_ms,
                "stream_duration_sum_ms": r.stream_duration_sum_ms,
            })
        })
        .collect();

    Json(json!({
        "node_id": node_id,
        "granularity": gran.as_str(),
        "from": rfc3339(from),
        "to": rfc3339(to),
        "metrics": metrics,
    }))
    .into_response()
}

/// A caller may read a node's history iff it is admin or owns the node.
fn authorize_node_access(
    state: &AppState,
    headers: &HeaderMap,
    node_id: &str,
) -> Result<NodeRecord, Response> {
    let caller = match session_from_headers(&state.sessions, headers) {
        Some(caller) => caller,
        None => return Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized")),
    };
    let node = match state.store.get_node(node_id) {
        Ok(node) => node,
        Err(StoreError::NotFound) => {
            return Err(error_response(StatusCode::NOT_FOUND, "node not found"))
        }
        Err(err) => return Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())),
    };
    if !caller.is_admin && node.account_id != caller.account_id {
        return Err(error_response(StatusCode::FORBIDDEN, "forbidden"));
    }
    Ok(node)
}

pub(super) fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Missing or empty time parameters are allowed; malformed ones are not.
fn parse_time(s: Option<&str>) -> Result<Option<DateTime<Utc>>, ()> {
    match s {
        None | Some("") => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| ()),
    }
}

fn clamp_limit(limit: Option<i64>) -> i64 {
    limit
        .filter(|l| *l > 0)
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time(None), Ok(None));
        assert_eq!(parse_time(Some("")), Ok(None));
        assert_eq!(
            parse_time(Some("2025-11-25T10:00:00Z")),
            Ok(Some(Utc.with_ymd_and_hms(2025, 11, 25, 10, 0, 0).unwrap()))
        );
        assert_eq!(
            parse_time(Some("2025-11-25T18:00:00+08:00")),
            Ok(Some(Utc.with_ymd_and_hms(2025, 11, 25, 10, 0, 0).unwrap())),
            "offsets are normalized to UTC"
        );
        assert!(parse_time(Some("yesterday")).is_err());
    }

    #[test]
    fn test_clamp_limit() {
        assert_eq!(clamp_limit(None), 300);
        assert_eq!(clamp_limit(Some(0)), 300);
        assert_eq!(clamp_limit(Some(-5)), 300);
        assert_eq!(clamp_limit(Some(50)), 50);
        assert_eq!(clamp_limit(Some(9999)), 2000);
    }

    #[test]
    fn test_rfc3339_is_utc() {
        let t = Utc.with_ymd_and_hms(2025, 11, 25, 10, 0, 0).unwrap();
        assert_eq!(rfc3339(t), "2025-11-25T10:00:00Z");
    }
}
