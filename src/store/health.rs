//! Health-check history: append-only probe outcomes with range queries.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::{params, Result as SqlResult};

use super::{fmt_ts, normalize_account, parse_db_time, HealthCheckQuery, HealthCheckRecord, Store,
    StoreError};

const HEALTH_RETENTION_DAYS: i64 = 30;

impl Store {
    /// Append one probe outcome. The proxy's health-probe loop is the
    /// writer; rows are never mutated afterwards.
    pub fn insert_health_check(&self, mut rec: HealthCheckRecord) -> Result<(), StoreError> {
        rec.account_id = normalize_account(&rec.account_id);
        if rec.check_method.is_empty() {
            rec.check_method = "api".to_string();
        }
        let check_time = rec.check_time.unwrap_or_else(Utc::now);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO node_health_checks
                (account_id, node_id, check_time, success, response_time_ms, error_message, check_method)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                rec.account_id,
                rec.node_id,
                fmt_ts(check_time),
                rec.success,
                rec.response_time_ms,
                rec.error_message,
                rec.check_method,
            ],
        )?;
        Ok(())
    }

    /// Range scan in chronological order over `[from, to)`.
    pub fn query_health_checks(
        &self,
        q: &HealthCheckQuery,
    ) -> Result<Vec<HealthCheckRecord>, StoreError> {
        let limit = if q.limit > 0 { q.limit } else { -1 };

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT account_id, node_id, check_time, success, response_time_ms, error_message, check_method
             FROM node_health_checks
             WHERE account_id = ?1 AND node_id = ?2 AND check_time >= ?3 AND check_time < ?4
             ORDER BY check_time ASC LIMIT ?5 OFFSET ?6",
        )?;
        let records = stmt
            .query_map(
                params![
                    normalize_account(&q.account_id),
                    q.node_id,
                    fmt_ts(q.from),
                    fmt_ts(q.to),
                    limit,
                    q.offset.max(0),
                ],
                |row| {
                    let check_time: String = row.get(2)?;
                    Ok(HealthCheckRecord {
                        account_id: row.get(0)?,
                        node_id: row.get(1)?,
                        check_time: parse_db_time(&check_time),
                        success: row.get(3)?,
                        response_time_ms: row.get(4)?,
                        error_message: row.get(5)?,
                        check_method: row.get(6)?,
                    })
                },
            )?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(records)
    }

    /// Total rows matching the query's range, ignoring limit and offset.
    pub fn count_health_checks(&self, q: &HealthCheckQuery) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let total = conn.query_row(
            "SELECT COUNT(*) FROM node_health_checks
             WHERE account_id = ?1 AND node_id = ?2 AND check_time >= ?3 AND check_time < ?4",
            params![
                normalize_account(&q.account_id),
                q.node_id,
                fmt_ts(q.from),
                fmt_ts(q.to),
            ],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Delete history older than the cutoff; a missing cutoff keeps the
    /// last 30 days.
    pub fn cleanup_health_checks(&self, before: Option<DateTime<Utc>>) -> Result<(), StoreError> {
        let cutoff = before.unwrap_or_else(|| Utc::now() - ChronoDuration::days(HEALTH_RETENTION_DAYS));
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM node_health_checks WHERE check_time < ?1",
            params![fmt_ts(cutoff)],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use chrono::TimeZone;

    fn check(node: &str, t: DateTime<Utc>, success: bool) -> HealthCheckRecord {
        HealthCheckRecord {
            account_id: "a1".to_string(),
            node_id: node.to_string(),
            check_time: Some(t),
            success,
            response_time_ms: 42,
            error_message: if success { String::new() } else { "timeout".to_string() },
            check_method: String::new(),
        }
    }

    #[test]
    fn test_query_and_count() {
        let (store, _tmp) = test_store();
        let base = Utc.with_ymd_and_hms(2025, 11, 25, 8, 0, 0).unwrap();
        for i in 0..4 {
            store.insert_health_check(check("n1", base + ChronoDuration::minutes(i * 10), i % 2 == 0)).unwrap();
        }
        store.insert_health_check(check("n2", base, true)).unwrap();

        let q = HealthCheckQuery {
            account_id: "a1".to_string(),
            node_id: "n1".to_string(),
            from: base,
            to: base + ChronoDuration::hours(1),
            limit: 2,
            offset: 1,
        };
        let rows = store.query_health_checks(&q).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].check_time, Some(base + ChronoDuration::minutes(10)));
        assert!(!rows[0].success);
        assert_eq!(rows[0].error_message, "timeout");
        assert_eq!(rows[0].check_method, "api", "missing method defaults to api");

        assert_eq!(store.count_health_checks(&q).unwrap(), 4);
    }

    #[test]
    fn test_cleanup_default_retention() {
        let (store, _tmp) = test_store();
        let now = Utc::now();
        store.insert_health_check(check("n1", now - ChronoDuration::days(31), true)).unwrap();
        store.insert_health_check(check("n1", now - ChronoDuration::days(1), true)).unwrap();

        store.cleanup_health_checks(None).unwrap();

        let q = HealthCheckQuery {
            account_id: "a1".to_string(),
            node_id: "n1".to_string(),
            from: now - ChronoDuration::days(60),
            to: now + ChronoDuration::hours(1),
            limit: 0,
            offset: 0,
        };
        assert_eq!(store.count_health_checks(&q).unwrap(), 1);
    }
}
