//! Durable store backing the usage log, the platform-user table, and the
//! hosted-image registry.
//!
//! One embedded SQLite database behind a mutex. All migrations are
//! idempotent (`CREATE TABLE IF NOT EXISTS`), batch inserts run inside a
//! single transaction, and the only path to free-form SQL is
//! `execute_readonly`, which enforces the read-only statement gate.

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One row of the append-only usage log. Immutable once appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageLogEntry {
    /// Assigned by the store on insert; None while buffered.
    pub id: Option<i64>,
    /// Wall-clock at request start, milliseconds since the epoch.
    pub ts_ms: i64,
    pub user_id: String,
    pub app_id: Option<String>,
    pub endpoint: String,
    pub method: String,
    pub provider: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Estimated cost in integer cents; zero for non-2xx outcomes.
    pub cost_cents: i64,
    pub duration_ms: u64,
    pub status: u16,
    pub error: Option<String>,
}

/// Filter for usage queries; results are ordered by timestamp descending.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageFilter {
    pub app_id: Option<String>,
    pub user_id: Option<String>,
    pub provider: Option<String>,
    pub endpoint: Option<String>,
    /// Inclusive window start, ms since epoch.
    pub start: Option<i64>,
    /// Exclusive window end, ms since epoch.
    pub end: Option<i64>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Platform-verified user row (Sign in with Apple).
#[derive(Debug, Clone, Serialize)]
pub struct PlatformUser {
    pub id: String,
    pub email: Option<String>,
    pub is_active: bool,
    pub login_count: u32,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    /// True when this upsert created the row.
    pub is_new: bool,
}

/// Hosted-image registry row.
#[derive(Debug, Clone, Serialize)]
pub struct HostedImageRow {
    pub id: String,
    pub user_id: String,
    pub prediction_id: String,
    pub path: String,
    pub size: u64,
    pub content_type: String,
    pub created_ms: i64,
    pub accessed_ms: Option<i64>,
    pub expires_ms: Option<i64>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS usage_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ts_ms INTEGER NOT NULL,
    user_id TEXT NOT NULL,
    app_id TEXT,
    endpoint TEXT NOT NULL,
    method TEXT NOT NULL,
    provider TEXT NOT NULL,
    model TEXT NOT NULL,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cost_cents INTEGER NOT NULL DEFAULT 0,
    duration_ms INTEGER NOT NULL DEFAULT 0,
    status INTEGER NOT NULL,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_usage_ts ON usage_log(ts_ms);
CREATE INDEX IF NOT EXISTS idx_usage_app ON usage_log(app_id);
CREATE INDEX IF NOT EXISTS idx_usage_user ON usage_log(user_id);
CREATE INDEX IF NOT EXISTS idx_usage_provider ON usage_log(provider);
CREATE INDEX IF NOT EXISTS idx_usage_endpoint ON usage_log(endpoint);
CREATE INDEX IF NOT EXISTS idx_usage_status ON usage_log(status);

CREATE TABLE IF NOT EXISTS users (
    id TEXT PRIMARY KEY,
    email TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    login_count INTEGER NOT NULL DEFAULT 0,
    first_seen_ms INTEGER NOT NULL,
    last_seen_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS hosted_images (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    prediction_id TEXT NOT NULL,
    path TEXT NOT NULL,
    size INTEGER NOT NULL,
    content_type TEXT NOT NULL,
    created_ms INTEGER NOT NULL,
    accessed_ms INTEGER,
    expires_ms INTEGER
);
CREATE INDEX IF NOT EXISTS idx_hosted_user ON hosted_images(user_id);
";

#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {}", path))?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("store lock poisoned")
    }

    // -- usage log ----------------------------------------------------------

    /// Append a batch of entries in one transaction.
    pub fn insert_usage_batch(&self, entries: &[UsageLogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO usage_log
                 (ts_ms, user_id, app_id, endpoint, method, provider, model,
                  input_tokens, output_tokens, cost_cents, duration_ms, status, error)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            )?;
            for e in entries {
                stmt.execute(params![
                    e.ts_ms,
                    e.user_id,
                    e.app_id,
                    e.endpoint,
                    e.method,
                    e.provider,
                    e.model,
                    e.input_tokens,
                    e.output_tokens,
                    e.cost_cents,
                    e.duration_ms as i64,
                    e.status,
                    e.error,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn query_usage(&self, filter: &UsageFilter) -> Result<Vec<UsageLogEntry>> {
        let mut sql = String::from(
            "SELECT id, ts_ms, user_id, app_id, endpoint, method, provider, model,
                    input_tokens, output_tokens, cost_cents, duration_ms, status, error
             FROM usage_log WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(app_id) = &filter.app_id {
            sql.push_str(" AND app_id = ?");
            args.push(Box::new(app_id.clone()));
        }
        if let Some(user_id) = &filter.user_id {
            sql.push_str(" AND user_id = ?");
            args.push(Box::new(user_id.clone()));
        }
        if let Some(provider) = &filter.provider {
            sql.push_str(" AND provider = ?");
            args.push(Box::new(provider.clone()));
        }
        if let Some(endpoint) = &filter.endpoint {
            sql.push_str(" AND endpoint = ?");
            args.push(Box::new(endpoint.clone()));
        }
        if let Some(start) = filter.start {
            sql.push_str(" AND ts_ms >= ?");
            args.push(Box::new(start));
        }
        if let Some(end) = filter.end {
            sql.push_str(" AND ts_ms < ?");
            args.push(Box::new(end));
        }

        sql.push_str(" ORDER BY ts_ms DESC LIMIT ? OFFSET ?");
        args.push(Box::new(filter.limit.unwrap_or(100)));
        args.push(Box::new(filter.offset.unwrap_or(0)));

        let conn = self.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(rusqlite::params_from_iter(args.iter().map(|v| v.as_ref())), |row| {
            Ok(UsageLogEntry {
                id: row.get(0)?,
                ts_ms: row.get(1)?,
                user_id: row.get(2)?,
                app_id: row.get(3)?,
                endpoint: row.get(4)?,
                method: row.get(5)?,
                provider: row.get(6)?,
                model: row.get(7)?,
                input_tokens: row.get(8)?,
                output_tokens: row.get(9)?,
                cost_cents: row.get(10)?,
                duration_ms: row.get::<_, i64>(11)? as u64,
                status: row.get(12)?,
                error: row.get(13)?,
            })
        })?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Sum of `cost_cents` for one user over `[start, end)`.
    pub fn sum_cost_cents(&self, user_id: &str, start_ms: i64, end_ms: i64) -> Result<i64> {
        let conn = self.lock();
        let sum: i64 = conn.query_row(
            "SELECT COALESCE(SUM(cost_cents), 0) FROM usage_log
             WHERE user_id = ?1 AND ts_ms >= ?2 AND ts_ms < ?3",
            params![user_id, start_ms, end_ms],
            |row| row.get(0),
        )?;
        Ok(sum)
    }

    pub fn count_usage(&self) -> Result<i64> {
        let conn = self.lock();
        Ok(conn.query_row("SELECT COUNT(*) FROM usage_log", [], |row| row.get(0))?)
    }

    /// Drop every usage row. The only mutation the log permits besides
    /// appends.
    pub fn clear_all_logs(&self) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM usage_log", [])?;
        Ok(())
    }

    // -- platform users -----------------------------------------------------

    /// Look up or create the user row for a platform-verified subject,
    /// incrementing its login counter and refreshing last-seen.
    pub fn upsert_platform_user(&self, sub: &str, email: Option<&str>) -> Result<PlatformUser> {
        let now_ms = Utc::now().timestamp_millis();
        let conn = self.lock();

        let existing: Option<(Option<String>, bool, u32, i64)> = conn
            .query_row(
                "SELECT email, is_active, login_count, first_seen_ms FROM users WHERE id = ?1",
                params![sub],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get::<_, i64>(1)? != 0,
                        row.get(2)?,
                        row.get(3)?,
                    ))
                },
            )
            .optional()?;

        match existing {
            Some((stored_email, is_active, login_count, first_seen_ms)) => {
                let email = email.map(str::to_string).or(stored_email);
                conn.execute(
                    "UPDATE users SET email = ?1, login_count = login_count + 1,
                     last_seen_ms = ?2 WHERE id = ?3",
                    params![email, now_ms, sub],
                )?;
                Ok(PlatformUser {
                    id: sub.to_string(),
                    email,
                    is_active,
                    login_count: login_count + 1,
                    first_seen_ms,
                    last_seen_ms: now_ms,
                    is_new: false,
                })
            }
            None => {
                conn.execute(
                    "INSERT INTO users (id, email, is_active, login_count, first_seen_ms, last_seen_ms)
                     VALUES (?1, ?2, 1, 1, ?3, ?3)",
                    params![sub, email, now_ms],
                )?;
                Ok(PlatformUser {
                    id: sub.to_string(),
                    email: email.map(str::to_string),
                    is_active: true,
                    login_count: 1,
                    first_seen_ms: now_ms,
                    last_seen_ms: now_ms,
                    is_new: true,
                })
            }
        }
    }

    // -- hosted images ------------------------------------------------------

    pub fn insert_hosted_image(&self, row: &HostedImageRow) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO hosted_images
             (id, user_id, prediction_id, path, size, content_type, created_ms, accessed_ms, expires_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                row.id,
                row.user_id,
                row.prediction_id,
                row.path,
                row.size as i64,
                row.content_type,
                row.created_ms,
                row.accessed_ms,
                row.expires_ms,
            ],
        )?;
        Ok(())
    }

    pub fn get_hosted_image(&self, user_id: &str, id: &str) -> Result<Option<HostedImageRow>> {
        let conn = self.lock();
        Ok(conn
            .query_row(
                "SELECT id, user_id, prediction_id, path, size, content_type,
                        created_ms, accessed_ms, expires_ms
                 FROM hosted_images WHERE user_id = ?1 AND id = ?2",
                params![user_id, id],
                |row| {
                    Ok(HostedImageRow {
                        id: row.get(0)?,
                        user_id: row.get(1)?,
                        prediction_id: row.get(2)?,
                        path: row.get(3)?,
                        size: row.get::<_, i64>(4)? as u64,
                        content_type: row.get(5)?,
                        created_ms: row.get(6)?,
                        accessed_ms: row.get(7)?,
                        expires_ms: row.get(8)?,
                    })
                },
            )
            .optional()?)
    }

    /// Record an access-time touch on a hosted image.
    pub fn touch_hosted_image(&self, id: &str) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE hosted_images SET accessed_ms = ?1 WHERE id = ?2",
            params![Utc::now().timestamp_millis(), id],
        )?;
        Ok(())
    }

    /// Remove expired and over-count rows; returns the paths of the
    /// files the caller should delete.
    pub fn cull_hosted_images(&self, max_per_user: u32, max_age_ms: i64) -> Result<Vec<String>> {
        let now_ms = Utc::now().timestamp_millis();
        let cutoff = now_ms - max_age_ms;
        let conn = self.lock();

        let mut doomed: Vec<(String, String)> = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT id, path FROM hosted_images
                 WHERE created_ms < ?1 OR (expires_ms IS NOT NULL AND expires_ms < ?2)",
            )?;
            let rows = stmt.query_map(params![cutoff, now_ms], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                doomed.push(row?);
            }
        }
        {
            // Oldest rows beyond the per-user ceiling.
            let mut stmt = conn.prepare(
                "SELECT id, path FROM hosted_images h
                 WHERE (SELECT COUNT(*) FROM hosted_images h2
                        WHERE h2.user_id = h.user_id AND h2.created_ms > h.created_ms) >= ?1",
            )?;
            let rows = stmt.query_map(params![max_per_user], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                doomed.push(row?);
            }
        }

        for (id, _) in &doomed {
            conn.execute("DELETE FROM hosted_images WHERE id = ?1", params![id])?;
        }
        Ok(doomed.into_iter().map(|(_, path)| path).collect())
    }

    // -- analytics SQL gate -------------------------------------------------

    /// Run a read-only statement and return rows as JSON objects.
    ///
    /// The only free-form SQL entry point; every statement passes
    /// [`ensure_readonly_sql`] first.
    pub fn execute_readonly(&self, sql: &str) -> Result<Vec<Value>> {
        ensure_readonly_sql(sql)?;

        let conn = self.lock();
        let mut stmt = conn.prepare(sql)?;
        let column_names: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        let mut rows_out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let mut obj = serde_json::Map::new();
            for (i, name) in column_names.iter().enumerate() {
                let value = match row.get_ref(i)? {
                    rusqlite::types::ValueRef::Null => Value::Null,
                    rusqlite::types::ValueRef::Integer(n) => json!(n),
                    rusqlite::types::ValueRef::Real(f) => json!(f),
                    rusqlite::types::ValueRef::Text(t) => {
                        json!(String::from_utf8_lossy(t).to_string())
                    }
                    rusqlite::types::ValueRef::Blob(_) => json!("<blob>"),
                };
                obj.insert(name.clone(), value);
            }
            rows_out.push(Value::Object(obj));
        }
        Ok(rows_out)
    }
}

/// Reject any statement that is not a plain read.
///
/// Accepted statements begin with `SELECT` or `WITH`; the mutation
/// keywords are rejected anywhere in the text, subqueries included.
pub fn ensure_readonly_sql(sql: &str) -> Result<()> {
    let trimmed = sql.trim();
    let upper = trimmed.to_uppercase();

    if !(upper.starts_with("SELECT") || upper.starts_with("WITH")) {
        return Err(anyhow!("only SELECT/WITH statements are allowed"));
    }

    let forbidden =
        Regex::new(r"\b(INSERT|UPDATE|DELETE|DROP|ALTER|CREATE|TRUNCATE|REPLACE)\b").unwrap();
    if let Some(hit) = forbidden.find(&upper) {
        return Err(anyhow!(
            "statement contains forbidden token: {}",
            hit.as_str()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(user: &str, ts_ms: i64, cost_cents: i64) -> UsageLogEntry {
        UsageLogEntry {
            id: None,
            ts_ms,
            user_id: user.to_string(),
            app_id: Some("app".to_string()),
            endpoint: "/v1/chat".to_string(),
            method: "POST".to_string(),
            provider: "openai".to_string(),
            model: "gpt-4o-mini".to_string(),
            input_tokens: 10,
            output_tokens: 20,
            cost_cents,
            duration_ms: 120,
            status: 200,
            error: None,
        }
    }

    #[test]
    fn test_insert_and_query_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let ts = Utc::now().timestamp_millis();
        store.insert_usage_batch(&[entry("u1", ts, 5)]).unwrap();

        let results = store
            .query_usage(&UsageFilter {
                user_id: Some("u1".to_string()),
                start: Some(ts),
                end: Some(ts + 1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].cost_cents, 5);
        assert!(results[0].id.is_some());
    }

    #[test]
    fn test_query_ordering_and_pagination() {
        let store = Store::open_in_memory().unwrap();
        let base = 1_700_000_000_000;
        let entries: Vec<_> = (0..5).map(|i| entry("u1", base + i, 1)).collect();
        store.insert_usage_batch(&entries).unwrap();

        let page = store
            .query_usage(&UsageFilter {
                user_id: Some("u1".to_string()),
                limit: Some(2),
                offset: Some(1),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(page.len(), 2);
        // Descending by timestamp: offset 1 skips the newest.
        assert_eq!(page[0].ts_ms, base + 3);
        assert_eq!(page[1].ts_ms, base + 2);
    }

    #[test]
    fn test_sum_cost_window_boundaries() {
        let store = Store::open_in_memory().unwrap();
        let midnight = 1_700_000_000_000;
        // One ms before the boundary belongs to the previous window.
        store
            .insert_usage_batch(&[entry("u1", midnight - 1, 3), entry("u1", midnight, 7)])
            .unwrap();

        assert_eq!(
            store.sum_cost_cents("u1", midnight, midnight + 1000).unwrap(),
            7
        );
        assert_eq!(
            store.sum_cost_cents("u1", midnight - 1000, midnight).unwrap(),
            3
        );
    }

    #[test]
    fn test_count_and_clear() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_usage_batch(&[entry("u1", 1, 0), entry("u2", 2, 0)])
            .unwrap();
        assert_eq!(store.count_usage().unwrap(), 2);
        store.clear_all_logs().unwrap();
        assert_eq!(store.count_usage().unwrap(), 0);
    }

    #[test]
    fn test_upsert_platform_user() {
        let store = Store::open_in_memory().unwrap();

        let first = store
            .upsert_platform_user("apple-sub-1", Some("a@example.com"))
            .unwrap();
        assert!(first.is_new);
        assert_eq!(first.login_count, 1);

        let second = store.upsert_platform_user("apple-sub-1", None).unwrap();
        assert!(!second.is_new);
        assert_eq!(second.login_count, 2);
        // Email survives logins that omit it.
        assert_eq!(second.email.as_deref(), Some("a@example.com"));
        assert_eq!(second.first_seen_ms, first.first_seen_ms);
    }

    #[test]
    fn test_hosted_image_roundtrip() {
        let store = Store::open_in_memory().unwrap();
        let row = HostedImageRow {
            id: "img1".to_string(),
            user_id: "u1".to_string(),
            prediction_id: "pred1".to_string(),
            path: "/tmp/u1/img1.png".to_string(),
            size: 1234,
            content_type: "image/png".to_string(),
            created_ms: Utc::now().timestamp_millis(),
            accessed_ms: None,
            expires_ms: None,
        };
        store.insert_hosted_image(&row).unwrap();

        let fetched = store.get_hosted_image("u1", "img1").unwrap().unwrap();
        assert_eq!(fetched.path, row.path);
        assert!(fetched.accessed_ms.is_none());

        store.touch_hosted_image("img1").unwrap();
        let touched = store.get_hosted_image("u1", "img1").unwrap().unwrap();
        assert!(touched.accessed_ms.is_some());
    }

    #[test]
    fn test_cull_hosted_images_by_age() {
        let store = Store::open_in_memory().unwrap();
        let old = HostedImageRow {
            id: "old".to_string(),
            user_id: "u1".to_string(),
            prediction_id: "p".to_string(),
            path: "/tmp/old.png".to_string(),
            size: 1,
            content_type: "image/png".to_string(),
            created_ms: Utc::now().timestamp_millis() - 10_000,
            accessed_ms: None,
            expires_ms: None,
        };
        store.insert_hosted_image(&old).unwrap();

        let removed = store.cull_hosted_images(100, 5_000).unwrap();
        assert_eq!(removed, vec!["/tmp/old.png".to_string()]);
        assert!(store.get_hosted_image("u1", "old").unwrap().is_none());
    }

    #[test]
    fn test_readonly_gate_accepts_selects() {
        assert!(ensure_readonly_sql("SELECT * FROM usage_log").is_ok());
        assert!(ensure_readonly_sql("  with t as (select 1) select * from t").is_ok());
    }

    #[test]
    fn test_readonly_gate_rejects_mutations() {
        assert!(ensure_readonly_sql("DELETE FROM usage_log").is_err());
        assert!(ensure_readonly_sql("INSERT INTO usage_log VALUES (1)").is_err());
        // Forbidden tokens are rejected even inside subqueries.
        assert!(ensure_readonly_sql(
            "SELECT * FROM usage_log WHERE id IN (DELETE FROM usage_log)"
        )
        .is_err());
        assert!(ensure_readonly_sql("WITH t AS (SELECT 1) UPDATE users SET email = 'x'").is_err());
        assert!(ensure_readonly_sql("DROP TABLE usage_log").is_err());
    }

    #[test]
    fn test_execute_readonly_returns_rows() {
        let store = Store::open_in_memory().unwrap();
        store.insert_usage_batch(&[entry("u1", 42, 9)]).unwrap();

        let rows = store
            .execute_readonly("SELECT user_id, cost_cents FROM usage_log")
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["user_id"], "u1");
        assert_eq!(rows[0]["cost_cents"], 9);

        assert!(store.execute_readonly("DELETE FROM usage_log").is_err());
    }
}
