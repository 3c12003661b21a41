//! Versioned key/value configuration with optimistic concurrency.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use serde_json::Value;

use super::{fmt_ts, parse_db_time, Setting, Store, StoreError};

const SETTING_COLS: &str = "id, key, scope, account_id, value, data_type, category, description,
    is_secret, version, updated_by, updated_at, created_at";

fn row_to_setting(row: &Row<'_>) -> SqlResult<Setting> {
    let account: String = row.get(3)?;
    let value_text: String = row.get(4)?;
    let updated_at: Option<String> = row.get(11)?;
    let created_at: Option<String> = row.get(12)?;
    Ok(Setting {
        id: row.get(0)?,
        key: row.get(1)?,
        scope: row.get(2)?,
        account_id: if account.is_empty() { None } else { Some(account) },
        value: serde_json::from_str(&value_text).unwrap_or(Value::Null),
        data_type: row.get(5)?,
        category: row.get(6)?,
        description: row.get(7)?,
        is_secret: row.get(8)?,
        version: row.get(9)?,
        updated_by: row.get(10)?,
        updated_at: updated_at.as_deref().and_then(parse_db_time),
        created_at: created_at.as_deref().and_then(parse_db_time),
    })
}

fn scope_or_default(scope: &str) -> String {
    if scope.is_empty() {
        "system".to_string()
    } else {
        scope.to_string()
    }
}

fn account_column(account_id: &Option<String>) -> String {
    account_id.clone().unwrap_or_default()
}

impl Store {
    /// Filtered scan over settings. Empty filters match everything.
    pub fn list_settings(
        &self,
        scope: Option<&str>,
        category: Option<&str>,
        account_id: Option<&str>,
    ) -> Result<Vec<Setting>, StoreError> {
        let mut sql = format!("SELECT {SETTING_COLS} FROM settings WHERE 1=1");
        let mut args: Vec<String> = Vec::new();
        if let Some(scope) = scope.filter(|s| !s.is_empty()) {
            sql.push_str(" AND scope = ?");
            args.push(scope.to_string());
        }
        if let Some(category) = category.filter(|c| !c.is_empty()) {
            sql.push_str(" AND category = ?");
            args.push(category.to_string());
        }
        if let Some(account) = account_id.filter(|a| !a.is_empty()) {
            sql.push_str(" AND account_id = ?");
            args.push(account.to_string());
        }
        sql.push_str(" ORDER BY key ASC");

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let settings = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), row_to_setting)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(settings)
    }

    /// Single lookup by `(key, scope, account_id)`.
    pub fn get_setting(
        &self,
        key: &str,
        scope: &str,
        account_id: Option<&str>,
    ) -> Result<Setting, StoreError> {
        let conn = self.conn.lock().unwrap();
        let setting = conn
            .query_row(
                &format!(
                    "SELECT {SETTING_COLS} FROM settings WHERE key = ?1 AND scope = ?2 AND account_id = ?3"
                ),
                params![key, scope_or_default(scope), account_id.unwrap_or_default()],
                row_to_setting,
            )
            .optional()?;
        setting.ok_or(StoreError::NotFound)
    }

    /// Create or blind-replace a setting. The stored version becomes
    /// current+1 (or 1 for a new row) and is written back to `s`.
    pub fn upsert_setting(&self, s: &mut Setting) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        upsert_in(&tx, s)?;
        tx.commit()?;
        Ok(())
    }

    /// Conditional update: succeeds only when the row's stored version
    /// matches `s.version`, bumping it by one. Reports the current version
    /// on conflict.
    pub fn update_setting(&self, s: &mut Setting) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        update_in(&conn, s)
    }

    pub fn delete_setting(
        &self,
        key: &str,
        scope: &str,
        account_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "DELETE FROM settings WHERE key = ?1 AND scope = ?2 AND account_id = ?3",
            params![key, scope_or_default(scope), account_id.unwrap_or_default()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    /// All-or-nothing batch: entries carrying a version are CAS-updated,
    /// the rest are upserted. The first failure rolls back everything.
    pub fn batch_update_settings(&self, settings: &mut [Setting]) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        for s in settings.iter_mut() {
            if s.version > 0 {
                update_in(&tx, s)?;
            } else {
                upsert_in(&tx, s)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Max version across all settings, or 0 when the table is empty. Used
    /// as a coarse "something changed" cursor.
    pub fn get_global_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        let version = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM settings",
            [],
            |row| row.get(0),
        )?;
        Ok(version)
    }
}

fn upsert_in(conn: &Connection, s: &mut Setting) -> Result<(), StoreError> {
    s.scope = scope_or_default(&s.scope);
    if s.data_type.is_empty() {
        s.data_type = "string".to_string();
    }
    let account = account_column(&s.account_id);
    let current: Option<i64> = conn
        .query_row(
            "SELECT version FROM settings WHERE key = ?1 AND scope = ?2 AND account_id = ?3",
            params![s.key, s.scope, account],
            |row| row.get(0),
        )
        .optional()?;
    let next = current.unwrap_or(0) + 1;
    let now = fmt_ts(Utc::now());

    conn.execute(
        "INSERT INTO settings
            (key, scope, account_id, value, data_type, category, description, is_secret,
             version, updated_by, updated_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
         ON CONFLICT (key, scope, account_id) DO UPDATE SET
            value = excluded.value, data_type = excluded.data_type,
            category = excluded.category, description = excluded.description,
            is_secret = excluded.is_secret, version = excluded.version,
            updated_by = excluded.updated_by, updated_at = excluded.updated_at",
        params![
            s.key,
            s.scope,
            account,
            serde_json::to_string(&s.value)?,
            s.data_type,
            s.category,
            s.description,
            s.is_secret,
            next,
            s.updated_by,
            now,
        ],
    )?;
    s.version = next;
    Ok(())
}

fn update_in(conn: &Connection, s: &mut Setting) -> Result<(), StoreError> {
    s.scope = scope_or_default(&s.scope);
    let account = account_column(&s.account_id);
    let changed = conn.execute(
        "UPDATE settings SET
            value = ?1, data_type = ?2, category = ?3, description = ?4, is_secret = ?5,
            updated_by = ?6, version = version + 1, updated_at = ?7
         WHERE key = ?8 AND scope = ?9 AND account_id = ?10 AND version = ?11",
        params![
            serde_json::to_string(&s.value)?,
            s.data_type,
            s.category,
            s.description,
            s.is_secret,
            s.updated_by,
            fmt_ts(Utc::now()),
            s.key,
            s.scope,
            account,
            s.version,
        ],
    )?;
    if changed == 0 {
        let current: Option<i64> = conn
            .query_row(
                "SELECT version FROM settings WHERE key = ?1 AND scope = ?2 AND account_id = ?3",
                params![s.key, s.scope, account],
                |row| row.get(0),
            )
            .optional()?;
        return Err(match current {
            Some(current) => StoreError::VersionConflict { current },
            None => StoreError::NotFound,
        });
    }
    s.version += 1;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_store;
    use serde_json::json;

    fn setting(key: &str, value: Value) -> Setting {
        Setting {
            key: key.to_string(),
            value,
            category: "monitor".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_upsert_assigns_versions() {
        let (store, _tmp) = test_store();
        let mut s = setting("poll_interval", json!(30));
        store.upsert_setting(&mut s).unwrap();
        assert_eq!(s.version, 1);

        s.value = json!(60);
        store.upsert_setting(&mut s).unwrap();
        assert_eq!(s.version, 2, "blind replace still bumps the version");

        let fetched = store.get_setting("poll_interval", "system", None).unwrap();
        assert_eq!(fetched.value, json!(60));
        assert_eq!(fetched.version, 2);
        assert_eq!(fetched.data_type, "string");
    }

    #[test]
    fn test_update_version_cas() {
        let (store, _tmp) = test_store();
        let mut s = setting("rate_limit", json!(100));
        store.upsert_setting(&mut s).unwrap();

        // Two writers both start from version 1; only the first wins.
        let mut first = store.get_setting("rate_limit", "system", None).unwrap();
        let mut second = first.clone();

        first.value = json!(200);
        store.update_setting(&mut first).unwrap();
        assert_eq!(first.version, 2);

        second.value = json!(300);
        match store.update_setting(&mut second) {
            Err(StoreError::VersionConflict { current }) => assert_eq!(current, 2),
            other => panic!("expected version conflict, got {:?}", other),
        }
        let stored = store.get_setting("rate_limit", "system", None).unwrap();
        assert_eq!(stored.value, json!(200));
    }

    #[test]
    fn test_update_missing_is_not_found() {
        let (store, _tmp) = test_store();
        let mut s = setting("ghost", json!(1));
        s.version = 3;
        assert!(matches!(store.update_setting(&mut s), Err(StoreError::NotFound)));
    }

    #[test]
    fn test_delete_and_not_found() {
        let (store, _tmp) = test_store();
        let mut s = setting("ephemeral", json!(true));
        store.upsert_setting(&mut s).unwrap();
        store.delete_setting("ephemeral", "system", None).unwrap();
        assert!(matches!(
            store.delete_setting("ephemeral", "system", None),
            Err(StoreError::NotFound)
        ));
        assert!(matches!(
            store.get_setting("ephemeral", "system", None),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_batch_is_atomic() {
        let (store, _tmp) = test_store();
        let mut a = setting("a", json!(1));
        store.upsert_setting(&mut a).unwrap();

        let mut batch = vec![
            Setting {
                key: "a".to_string(),
                value: json!(2),
                version: 99, // stale
                ..Default::default()
            },
            setting("b", json!("new")),
        ];
        let err = store.batch_update_settings(&mut batch).unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        assert_eq!(store.get_setting("a", "system", None).unwrap().value, json!(1));
        assert!(matches!(
            store.get_setting("b", "system", None),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_scope_account_isolation() {
        let (store, _tmp) = test_store();
        let mut sys = setting("theme", json!("dark"));
        store.upsert_setting(&mut sys).unwrap();

        let mut acct = Setting {
            key: "theme".to_string(),
            scope: "account".to_string(),
            account_id: Some("a1".to_string()),
            value: json!("light"),
            ..Default::default()
        };
        store.upsert_setting(&mut acct).unwrap();

        assert_eq!(
            store.get_setting("theme", "system", None).unwrap().value,
            json!("dark")
        );
        assert_eq!(
            store.get_setting("theme", "account", Some("a1")).unwrap().value,
            json!("light")
        );
    }

    #[test]
    fn test_global_version() {
        let (store, _tmp) = test_store();
        assert_eq!(store.get_global_version().unwrap(), 0);

        let mut a = setting("a", json!(1));
        store.upsert_setting(&mut a).unwrap();
        let mut b = setting("b", json!(2));
        store.upsert_setting(&mut b).unwrap();
        store.upsert_setting(&mut b).unwrap();

        assert_eq!(store.get_global_version().unwrap(), 2);
    }
}
