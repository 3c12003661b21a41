//! Storage model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Time bucket size of a metrics row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Raw,
    Hourly,
    Daily,
    Monthly,
}

impl Granularity {
    /// Parse the wire name used by the metrics API. An empty string means
    /// raw.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "raw" => Some(Self::Raw),
            "hour" | "hourly" => Some(Self::Hourly),
            "day" | "daily" => Some(Self::Daily),
            "month" | "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Hourly => "hour",
            Self::Daily => "day",
            Self::Monthly => "month",
        }
    }

    /// Default query window: how far back from `to` a query reaches when
    /// the caller omits `from`.
    pub fn default_window_from(&self, to: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Raw => to - chrono::Duration::hours(24),
            Self::Hourly => to - chrono::Duration::days(7),
            Self::Daily => to - chrono::Duration::days(30),
            Self::Monthly => to - chrono::Months::new(12),
        }
    }

    /// Table, time column and created_at column (real column for the raw
    /// table, NULL elsewhere) backing this granularity.
    pub(crate) fn table_info(&self) -> (&'static str, &'static str, &'static str) {
        match self {
            Self::Raw => ("node_metrics_raw", "ts", "created_at"),
            Self::Hourly => ("node_metrics_hourly", "bucket_start", "NULL"),
            Self::Daily => ("node_metrics_daily", "bucket_start", "NULL"),
            Self::Monthly => ("node_metrics_monthly", "bucket_start", "NULL"),
        }
    }
}

/// A time-bucketed counter row for one `(account, node)` pair. For raw rows
/// `timestamp` is the ingest time; for aggregated rows it is the bucket's
/// UTC start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub account_id: String,
    pub node_id: String,
    /// None on ingest means "now".
    pub timestamp: Option<DateTime<Utc>>,
    pub requests_total: i64,
    pub requests_success: i64,
    pub requests_failed: i64,
    pub response_time_sum_ms: i64,
    pub response_time_count: i64,
    pub bytes_total: i64,
    pub input_tokens_total: i64,
    pub output_tokens_total: i64,
    pub first_byte_time_sum_ms: i64,
    pub stream_duration_sum_ms: i64,
    /// Populated on raw rows only.
    pub created_at: Option<DateTime<Utc>>,
}

/// Filter for [`crate::store::Store::query_metrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsQuery {
    pub account_id: String,
    pub node_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub granularity: Option<Granularity>,
    /// 0 means no limit (unless offset forces the default of 500).
    pub limit: i64,
    pub offset: i64,
}

/// Outcome of one health probe of one node. Append-only.
#[derive(Debug, Clone, Default)]
pub struct HealthCheckRecord {
    pub account_id: String,
    pub node_id: String,
    pub check_time: Option<DateTime<Utc>>,
    pub success: bool,
    pub response_time_ms: i64,
    pub error_message: String,
    pub check_method: String,
}

/// Range filter for health history queries.
#[derive(Debug, Clone)]
pub struct HealthCheckQuery {
    pub account_id: String,
    pub node_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub limit: i64,
    pub offset: i64,
}

/// A configuration entry keyed by `(key, scope, account_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Setting {
    #[serde(default)]
    pub id: i64,
    pub key: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub data_type: String,
    #[serde(default)]
    pub category: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub is_secret: bool,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Default for Setting {
    fn default() -> Self {
        Self {
            id: 0,
            key: String::new(),
            scope: "system".to_string(),
            account_id: None,
            value: Value::Null,
            data_type: String::new(),
            category: String::new(),
            description: None,
            is_secret: false,
            version: 0,
            updated_by: None,
            updated_at: None,
            created_at: None,
        }
    }
}

/// Identity of a proxied upstream node. Owned by the proxy core; the
/// monitoring side only reads it for access control.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeRecord {
    pub id: String,
    pub name: String,
    pub account_id: String,
    pub base_url: String,
    pub health_check_method: String,
    pub disabled: bool,
    pub created_at: Option<DateTime<Utc>>,
}

/// A long-lived read-only credential granting WebSocket access to one
/// account's monitor stream.
#[derive(Debug, Clone)]
pub struct MonitorShare {
    pub token: String,
    pub account_id: String,
    pub created_at: Option<DateTime<Utc>>,
}
