//! Time-series ingest, query, rollup and retention.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, Months, NaiveTime, Utc};
use rusqlite::{params, types::ToSql, Result as SqlResult};

use super::{fmt_ts, normalize_account, parse_db_time, Granularity, MetricsQuery, MetricsRecord,
    Store, StoreError};

const RETENTION_RAW: i64 = 7;
const RETENTION_HOURLY: i64 = 30;
const RETENTION_DAILY: i64 = 365;

const METRIC_COUNTERS: [&str; 10] = [
    "requests_total",
    "requests_success",
    "requests_failed",
    "response_time_sum_ms",
    "response_time_count",
    "bytes_total",
    "input_tokens_total",
    "output_tokens_total",
    "first_byte_time_sum_ms",
    "stream_duration_sum_ms",
];

impl Store {
    /// Write one raw metrics row. Partial counters are derived: a zero
    /// total becomes success+failed, a zero success becomes total-failed,
    /// a zero response-time count falls back to the request total.
    pub fn insert_metrics(&self, mut rec: MetricsRecord) -> Result<(), StoreError> {
        rec.account_id = normalize_account(&rec.account_id);
        let ts = rec.timestamp.unwrap_or_else(Utc::now);
        if rec.requests_total == 0 {
            rec.requests_total = rec.requests_success + rec.requests_failed;
        }
        if rec.requests_success == 0 && rec.requests_total > 0 {
            rec.requests_success = rec.requests_total - rec.requests_failed;
        }
        if rec.response_time_count == 0 && rec.requests_total > 0 {
            rec.response_time_count = rec.requests_total;
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO node_metrics_raw (
                account_id, node_id, ts, requests_total, requests_success, requests_failed,
                response_time_sum_ms, response_time_count, bytes_total,
                input_tokens_total, output_tokens_total, first_byte_time_sum_ms, stream_duration_sum_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                rec.account_id,
                rec.node_id,
                fmt_ts(ts),
                rec.requests_total,
                rec.requests_success,
                rec.requests_failed,
                rec.response_time_sum_ms,
                rec.response_time_count,
                rec.bytes_total,
                rec.input_tokens_total,
                rec.output_tokens_total,
                rec.first_byte_time_sum_ms,
                rec.stream_duration_sum_ms,
            ],
        )?;
        Ok(())
    }

    /// Query metrics at the requested granularity over the half-open
    /// window `[from, to)`, ascending by bucket time. A missing `from`
    /// defaults to 24h / 7d / 30d / 12m depending on granularity.
    pub fn query_metrics(&self, q: &MetricsQuery) -> Result<Vec<MetricsRecord>, StoreError> {
        let gran = q.granularity.unwrap_or(Granularity::Raw);
        let (table, time_col, created_col) = gran.table_info();
        let to = q.to.unwrap_or_else(Utc::now);
        let from = q.from.unwrap_or_else(|| gran.default_window_from(to));
        let mut limit = q.limit;
        if q.offset > 0 && limit == 0 {
            limit = 500;
        }

        let mut sql = format!(
            "SELECT account_id, node_id, {time_col} AS ts, requests_total, requests_success,
                requests_failed, response_time_sum_ms, response_time_count, bytes_total,
                input_tokens_total, output_tokens_total, first_byte_time_sum_ms,
                stream_duration_sum_ms, {created_col} AS created_at
             FROM {table} WHERE account_id = ?"
        );
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(normalize_account(&q.account_id))];
        if let Some(node_id) = &q.node_id {
            sql.push_str(" AND node_id = ?");
            args.push(Box::new(node_id.clone()));
        }
        sql.push_str(&format!(" AND {time_col} >= ?"));
        args.push(Box::new(fmt_ts(from)));
        sql.push_str(&format!(" AND {time_col} < ?"));
        args.push(Box::new(fmt_ts(to)));
        sql.push_str(&format!(" ORDER BY {time_col} ASC"));
        if limit > 0 {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit));
        }
        if q.offset > 0 {
            sql.push_str(" OFFSET ?");
            args.push(Box::new(q.offset));
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let params: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        let records = stmt
            .query_map(&params[..], |row| {
                let ts: String = row.get(2)?;
                let created: Option<String> = row.get(13)?;
                Ok(MetricsRecord {
                    account_id: row.get(0)?,
                    node_id: row.get(1)?,
                    timestamp: parse_db_time(&ts),
                    requests_total: row.get(3)?,
                    requests_success: row.get(4)?,
                    requests_failed: row.get(5)?,
                    response_time_sum_ms: row.get(6)?,
                    response_time_count: row.get(7)?,
                    bytes_total: row.get(8)?,
                    input_tokens_total: row.get(9)?,
                    output_tokens_total: row.get(10)?,
                    first_byte_time_sum_ms: row.get(11)?,
                    stream_duration_sum_ms: row.get(12)?,
                    created_at: created.as_deref().and_then(parse_db_time),
                })
            })?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    /// Roll source rows in `[from, to)` up into the target granularity.
    /// Destination buckets matching the same `(account, node, bucket)` key
    /// are overwritten with the freshly summed values, so re-running over
    /// the same window is idempotent.
    pub fn aggregate_metrics(
        &self,
        account_id: Option<&str>,
        target: Granularity,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let (src_table, src_time_col, dst_table, bucket_expr) = aggregation_plan(target)?;
        let to = to.unwrap_or_else(Utc::now);
        let from = from.unwrap_or_else(|| default_aggregate_from(target, to));

        let sum_cols = METRIC_COUNTERS
            .iter()
            .map(|c| format!("SUM({c})"))
            .collect::<Vec<_>>()
            .join(", ");
        let set_cols = METRIC_COUNTERS
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");

        let mut sql = format!(
            "INSERT INTO {dst_table} (account_id, node_id, bucket_start, {})
             SELECT account_id, node_id, {bucket_expr} AS bucket, {sum_cols}
             FROM {src_table} WHERE {src_time_col} >= ? AND {src_time_col} < ?",
            METRIC_COUNTERS.join(", "),
        );
        let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(fmt_ts(from)), Box::new(fmt_ts(to))];
        if let Some(account) = account_id {
            sql.push_str(" AND account_id = ?");
            args.push(Box::new(normalize_account(account)));
        }
        sql.push_str(" GROUP BY account_id, node_id, bucket");
        sql.push_str(&format!(
            " ON CONFLICT (account_id, node_id, bucket_start) DO UPDATE SET {set_cols}"
        ));

        let conn = self.conn.lock().unwrap();
        let params: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
        conn.execute(&sql, &params[..])?;
        Ok(())
    }

    /// Delete rows past their retention window: raw after 7 days, hourly
    /// after 30, daily after 365. Monthly rows are kept indefinitely.
    pub fn cleanup_metrics(
        &self,
        account_id: Option<&str>,
        now: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let now = now.unwrap_or_else(Utc::now);
        let cuts = [
            ("node_metrics_raw", "ts", RETENTION_RAW),
            ("node_metrics_hourly", "bucket_start", RETENTION_HOURLY),
            ("node_metrics_daily", "bucket_start", RETENTION_DAILY),
        ];

        let conn = self.conn.lock().unwrap();
        for (table, col, keep_days) in cuts {
            let cutoff = now - ChronoDuration::days(keep_days);
            let mut sql = format!("DELETE FROM {table} WHERE {col} < ?");
            let mut args: Vec<Box<dyn ToSql>> = vec![Box::new(fmt_ts(cutoff))];
            if let Some(account) = account_id {
                sql.push_str(" AND account_id = ?");
                args.push(Box::new(normalize_account(account)));
            }
            let params: Vec<&dyn ToSql> = args.iter().map(|a| a.as_ref()).collect();
            conn.execute(&sql, &params[..])?;
        }
        Ok(())
    }
}

fn default_aggregate_from(target: Granularity, to: DateTime<Utc>) -> DateTime<Utc> {
    match target {
        Granularity::Raw | Granularity::Hourly => to - ChronoDuration::hours(24),
        Granularity::Daily => to - ChronoDuration::days(7),
        Granularity::Monthly => to - Months::new(1),
    }
}

/// Source table, source time column, destination table and bucket
/// expression for each aggregation target.
fn aggregation_plan(
    target: Granularity,
) -> Result<(&'static str, &'static str, &'static str, &'static str), StoreError> {
    match target {
        Granularity::Hourly => Ok((
            "node_metrics_raw",
            "ts",
            "node_metrics_hourly",
            "strftime('%Y-%m-%d %H:00:00', ts)",
        )),
        Granularity::Daily => Ok((
            "node_metrics_hourly",
            "bucket_start",
            "node_metrics_daily",
            "strftime('%Y-%m-%d 00:00:00', bucket_start)",
        )),
        Granularity::Monthly => Ok((
            "node_metrics_daily",
            "bucket_start",
            "node_metrics_monthly",
            "strftime('%Y-%m-01 00:00:00', bucket_start)",
        )),
        Granularity::Raw => Err(StoreError::InvalidAggregationTarget),
    }
}

/// Start of the UTC day containing `t`.
pub fn start_of_day(t: DateTime<Utc>) -> DateTime<Utc> {
    t.date_naive().and_time(NaiveTime::MIN).and_utc()
}

/// Start of the UTC month containing `t`.
pub fn start_of_month(t: DateTime<Utc>) -> DateTime<Utc> {
    let first = t.date_naive().with_day0(0).unwrap_or(t.date_naive());
    first.and_time(NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use chrono::TimeZone;

    fn raw(account: &str, node: &str, ts: DateTime<Utc>, total: i64) -> MetricsRecord {
        MetricsRecord {
            account_id: account.to_string(),
            node_id: node.to_string(),
            timestamp: Some(ts),
            requests_total: total,
            requests_success: total,
            response_time_sum_ms: total * 100,
            response_time_count: total,
            bytes_total: total * 10,
            ..Default::default()
        }
    }

    #[test]
    fn test_ingest_normalization() {
        let (store, _tmp) = test_store();
        store
            .insert_metrics(MetricsRecord {
                account_id: String::new(),
                node_id: "n1".to_string(),
                requests_success: 3,
                requests_failed: 2,
                ..Default::default()
            })
            .unwrap();

        let rows = store
            .query_metrics(&MetricsQuery {
                account_id: String::new(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        let r = &rows[0];
        assert_eq!(r.account_id, "default");
        assert_eq!(r.requests_total, 5);
        assert!(r.requests_total >= r.requests_success + r.requests_failed);
        assert_eq!(r.response_time_count, 5);
        assert!(r.created_at.is_some());
    }

    #[test]
    fn test_ingest_derives_success_from_total() {
        let (store, _tmp) = test_store();
        store
            .insert_metrics(MetricsRecord {
                account_id: "a1".to_string(),
                node_id: "n1".to_string(),
                requests_total: 10,
                requests_failed: 4,
                ..Default::default()
            })
            .unwrap();

        let rows = store
            .query_metrics(&MetricsQuery {
                account_id: "a1".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows[0].requests_success, 6);
        assert!(rows[0].requests_total >= rows[0].requests_success + rows[0].requests_failed);
    }

    #[test]
    fn test_query_window_and_order() {
        let (store, _tmp) = test_store();
        let base = Utc.with_ymd_and_hms(2025, 11, 25, 10, 0, 0).unwrap();
        store.insert_metrics(raw("a1", "n1", base + ChronoDuration::minutes(30), 7)).unwrap();
        store.insert_metrics(raw("a1", "n1", base, 5)).unwrap();
        store.insert_metrics(raw("a1", "n1", base + ChronoDuration::hours(1), 9)).unwrap();
        store.insert_metrics(raw("a2", "n1", base, 100)).unwrap();

        let rows = store
            .query_metrics(&MetricsQuery {
                account_id: "a1".to_string(),
                node_id: Some("n1".to_string()),
                from: Some(base),
                to: Some(base + ChronoDuration::hours(1)),
                ..Default::default()
            })
            .unwrap();

        assert_eq!(rows.len(), 2, "to is exclusive and other tenants are filtered");
        assert_eq!(rows[0].requests_total, 5);
        assert_eq!(rows[1].requests_total, 7);
        assert_eq!(rows.iter().map(|r| r.requests_total).sum::<i64>(), 12);
    }

    #[test]
    fn test_limit_defaults_with_offset() {
        let (store, _tmp) = test_store();
        let base = Utc.with_ymd_and_hms(2025, 11, 25, 10, 0, 0).unwrap();
        for i in 0..5 {
            store.insert_metrics(raw("a1", "n1", base + ChronoDuration::minutes(i), 1)).unwrap();
        }
        let rows = store
            .query_metrics(&MetricsQuery {
                account_id: "a1".to_string(),
                from: Some(base),
                to: Some(base + ChronoDuration::hours(1)),
                offset: 2,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 3, "offset applied with the default limit");
    }

    #[test]
    fn test_rollup_to_hourly() {
        let (store, _tmp) = test_store();
        let h = Utc.with_ymd_and_hms(2025, 11, 25, 10, 0, 0).unwrap();
        store.insert_metrics(raw("a1", "n1", h, 5)).unwrap();
        store.insert_metrics(raw("a1", "n1", h + ChronoDuration::minutes(30), 7)).unwrap();

        store
            .aggregate_metrics(None, Granularity::Hourly, Some(h), Some(h + ChronoDuration::hours(1)))
            .unwrap();

        let rows = store
            .query_metrics(&MetricsQuery {
                account_id: "a1".to_string(),
                granularity: Some(Granularity::Hourly),
                from: Some(h),
                to: Some(h + ChronoDuration::hours(1)),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].timestamp, Some(h));
        assert_eq!(rows[0].requests_total, 12);
        assert_eq!(rows[0].response_time_sum_ms, 1200);
    }

    #[test]
    fn test_rollup_idempotence() {
        let (store, _tmp) = test_store();
        let h = Utc.with_ymd_and_hms(2025, 11, 25, 10, 0, 0).unwrap();
        let window = (Some(h), Some(h + ChronoDuration::hours(1)));
        store.insert_metrics(raw("a1", "n1", h, 5)).unwrap();
        store.insert_metrics(raw("a1", "n1", h + ChronoDuration::minutes(30), 7)).unwrap();

        store.aggregate_metrics(None, Granularity::Hourly, window.0, window.1).unwrap();
        store.aggregate_metrics(None, Granularity::Hourly, window.0, window.1).unwrap();

        let rows = store
            .query_metrics(&MetricsQuery {
                account_id: "a1".to_string(),
                granularity: Some(Granularity::Hourly),
                from: window.0,
                to: window.1,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1, "re-running must not double the bucket");
        assert_eq!(rows[0].requests_total, 12);
    }

    #[test]
    fn test_rollup_conservation_across_chain() {
        let (store, _tmp) = test_store();
        let day = Utc.with_ymd_and_hms(2025, 11, 24, 0, 0, 0).unwrap();
        let mut src_total = 0;
        for hour in [1, 5, 13, 22] {
            let ts = day + ChronoDuration::hours(hour);
            store.insert_metrics(raw("a1", "n1", ts, hour)).unwrap();
            src_total += hour;
        }

        let next_day = day + ChronoDuration::days(1);
        store.aggregate_metrics(None, Granularity::Hourly, Some(day), Some(next_day)).unwrap();
        store.aggregate_metrics(None, Granularity::Daily, Some(day), Some(next_day)).unwrap();
        store
            .aggregate_metrics(
                None,
                Granularity::Monthly,
                Some(Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap()),
                Some(Utc.with_ymd_and_hms(2025, 12, 1, 0, 0, 0).unwrap()),
            )
            .unwrap();

        for gran in [Granularity::Hourly, Granularity::Daily, Granularity::Monthly] {
            let rows = store
                .query_metrics(&MetricsQuery {
                    account_id: "a1".to_string(),
                    granularity: Some(gran),
                    from: Some(day - ChronoDuration::days(40)),
                    to: Some(next_day),
                    ..Default::default()
                })
                .unwrap();
            let total: i64 = rows.iter().map(|r| r.requests_total).sum();
            assert_eq!(total, src_total, "counters conserved at {:?}", gran);
        }

        let monthly = store
            .query_metrics(&MetricsQuery {
                account_id: "a1".to_string(),
                granularity: Some(Granularity::Monthly),
                from: Some(day - ChronoDuration::days(40)),
                to: Some(next_day),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            monthly[0].timestamp,
            Some(Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_cleanup_retention() {
        let (store, _tmp) = test_store();
        let now = Utc.with_ymd_and_hms(2025, 11, 25, 12, 0, 0).unwrap();
        store.insert_metrics(raw("a1", "n1", now - ChronoDuration::days(8), 1)).unwrap();
        store.insert_metrics(raw("a1", "n1", now - ChronoDuration::days(6), 2)).unwrap();

        store.cleanup_metrics(None, Some(now)).unwrap();

        let rows = store
            .query_metrics(&MetricsQuery {
                account_id: "a1".to_string(),
                from: Some(now - ChronoDuration::days(30)),
                to: Some(now),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1, "only the row inside the 7d window survives");
        assert_eq!(rows[0].requests_total, 2);
    }

    #[test]
    fn test_cleanup_scoped_to_account() {
        let (store, _tmp) = test_store();
        let now = Utc.with_ymd_and_hms(2025, 11, 25, 12, 0, 0).unwrap();
        let old = now - ChronoDuration::days(8);
        store.insert_metrics(raw("a1", "n1", old, 1)).unwrap();
        store.insert_metrics(raw("a2", "n2", old, 1)).unwrap();

        store.cleanup_metrics(Some("a1"), Some(now)).unwrap();

        let window = (Some(now - ChronoDuration::days(30)), Some(now));
        let a1 = store
            .query_metrics(&MetricsQuery {
                account_id: "a1".to_string(),
                from: window.0,
                to: window.1,
                ..Default::default()
            })
            .unwrap();
        let a2 = store
            .query_metrics(&MetricsQuery {
                account_id: "a2".to_string(),
                from: window.0,
                to: window.1,
                ..Default::default()
            })
            .unwrap();
        assert!(a1.is_empty());
        assert_eq!(a2.len(), 1);
    }

    #[test]
    fn test_start_of_boundaries() {
        let t = Utc.with_ymd_and_hms(2025, 11, 25, 13, 45, 9).unwrap();
        assert_eq!(start_of_day(t), Utc.with_ymd_and_hms(2025, 11, 25, 0, 0, 0).unwrap());
        assert_eq!(start_of_month(t), Utc.with_ymd_and_hms(2025, 11, 1, 0, 0, 0).unwrap());
    }
}
