//! Node identities and monitor share tokens. Both are owned by the proxy
//! core; the monitoring side reads them for access control.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{fmt_ts, normalize_account, parse_db_time, MonitorShare, NodeRecord, Store, StoreError};

impl Store {
    /// Create or update a node identity.
    pub fn upsert_node(&self, mut rec: NodeRecord) -> Result<(), StoreError> {
        rec.account_id = normalize_account(&rec.account_id);
        if rec.health_check_method.is_empty() {
            rec.health_check_method = "api".to_string();
        }
        let created_at = rec.created_at.unwrap_or_else(Utc::now);

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO nodes (id, name, account_id, base_url, health_check_method, disabled, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (id) DO UPDATE SET
                name = excluded.name, account_id = excluded.account_id,
                base_url = excluded.base_url, health_check_method = excluded.health_check_method,
                disabled = excluded.disabled",
            params![
                rec.id,
                rec.name,
                rec.account_id,
                rec.base_url,
                rec.health_check_method,
                rec.disabled,
                fmt_ts(created_at),
            ],
        )?;
        Ok(())
    }

    pub fn get_node(&self, id: &str) -> Result<NodeRecord, StoreError> {
        let conn = self.conn.lock().unwrap();
        let node = conn
            .query_row(
                "SELECT id, name, account_id, base_url, health_check_method, disabled, created_at
                 FROM nodes WHERE id = ?1",
                params![id],
                |row| {
                    let created: String = row.get(6)?;
                    Ok(NodeRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        account_id: row.get(2)?,
                        base_url: row.get(3)?,
                        health_check_method: row.get(4)?,
                        disabled: row.get(5)?,
                        created_at: parse_db_time(&created),
                    })
                },
            )
            .optional()?;
        node.ok_or(StoreError::NotFound)
    }

    /// Record a share token issued by the proxy.
    pub fn insert_monitor_share(&self, token: &str, account_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO monitor_shares (token, account_id, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (token) DO UPDATE SET account_id = excluded.account_id",
            params![token, normalize_account(account_id), fmt_ts(Utc::now())],
        )?;
        Ok(())
    }

    /// Resolve a share token to its account for read-only WebSocket access.
    pub fn get_share_by_token(&self, token: &str) -> Result<MonitorShare, StoreError> {
        let conn = self.conn.lock().unwrap();
        let share = conn
            .query_row(
                "SELECT token, account_id, created_at FROM monitor_shares WHERE token = ?1",
                params![token],
                |row| {
                    let created: String = row.get(2)?;
                    Ok(MonitorShare {
                        token: row.get(0)?,
                        account_id: row.get(1)?,
                        created_at: parse_db_time(&created),
                    })
                },
            )
            .optional()?;
        share.ok_or(StoreError::NotFound)
    }
}
