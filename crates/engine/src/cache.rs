use anyhow::Context;
use crowntap_protocol::UserIdentity;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::now_ms;

const DEVICE_IDENTITY_KEY: &str = "device_identity";

fn points_key(id: &UserIdentity) -> String {
    format!("points_{id}")
}

fn pending_key(id: &UserIdentity) -> String {
    format!("pending_{id}")
}

/// Durable per-user balance mirror, plus the device identity and a sync ledger.
///
/// Values are numeric strings in a single `kv` table, one row per key,
/// overwritten in place.
#[derive(Debug, Clone)]
pub struct BalanceCache {
    db_path: PathBuf,
}

impl BalanceCache {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn open(&self) -> anyhow::Result<Connection> {
        let path = self.db_path.clone();
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("create cache dir: {}", dir.display()))?;
        }

        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("open sqlite db: {}", path.display()))?;

        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        migrate(&conn)?;
        Ok(conn)
    }

    /// Last confirmed balance for `id`, if one was ever saved.
    pub fn load(&self, id: &UserIdentity) -> anyhow::Result<Option<f64>> {
        self.get_number(&points_key(id))
    }

    pub fn save(&self, id: &UserIdentity, confirmed: f64) -> anyhow::Result<()> {
        self.put(&points_key(id), &confirmed.to_string())
    }

    pub fn load_pending(&self, id: &UserIdentity) -> anyhow::Result<Option<f64>> {
        self.get_number(&pending_key(id))
    }

    pub fn save_pending(&self, id: &UserIdentity, pending: f64) -> anyhow::Result<()> {
        self.put(&pending_key(id), &pending.to_string())
    }

    /// Both halves of the balance in one transaction.
    pub fn save_balance(&self, id: &UserIdentity, confirmed: f64, pending: f64) -> anyhow::Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        let ts = now_ms();
        put_tx(&tx, &points_key(id), &confirmed.to_string(), ts)?;
        put_tx(&tx, &pending_key(id), &pending.to_string(), ts)?;
        tx.commit()?;
        Ok(())
    }

    pub fn load_identity(&self) -> anyhow::Result<Option<UserIdentity>> {
        Ok(self.get(DEVICE_IDENTITY_KEY)?.map(UserIdentity::new))
    }

    pub fn save_identity(&self, id: &UserIdentity) -> anyhow::Result<()> {
        self.put(DEVICE_IDENTITY_KEY, id.as_str())
    }

    pub fn record_sync(&self, entry: &SyncLogEntry) -> anyhow::Result<i64> {
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO sync_log (ts_ms, user_id, outcome, points_sent, authority_total, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            (
                entry.ts_ms,
                &entry.user_id,
                entry.outcome.as_str(),
                entry.points_sent,
                entry.authority_total,
                &entry.error,
            ),
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Newest first.
    pub fn recent_sync_log(&self, id: &UserIdentity, limit: usize) -> anyhow::Result<Vec<SyncLogEntry>> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(
            "SELECT ts_ms, user_id, outcome, points_sent, authority_total, error
             FROM sync_log WHERE user_id = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map((id.as_str(), limit), |row| {
            let outcome: String = row.get(2)?;
            Ok(SyncLogEntry {
                ts_ms: row.get(0)?,
                user_id: row.get(1)?,
                outcome: SyncOutcome::parse(&outcome),
                points_sent: row.get(3)?,
                authority_total: row.get(4)?,
                error: row.get(5)?,
            })
        })?;
        Ok(rows.filter_map(Result::ok).collect())
    }

    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let conn = self.open()?;
        let v = conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(v)
    }

    fn get_number(&self, key: &str) -> anyhow::Result<Option<f64>> {
        let Some(raw) = self.get(key)? else {
            return Ok(None);
        };
        let v: f64 = raw
            .trim()
            .parse()
            .with_context(|| format!("cached value for {key} is not a number: {raw:?}"))?;
        Ok(v.is_finite().then_some(v))
    }

    fn put(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        put_tx(&tx, key, value, now_ms())?;
        tx.commit()?;
        Ok(())
    }
}

fn put_tx(tx: &rusqlite::Transaction<'_>, key: &str, value: &str, ts: i64) -> anyhow::Result<()> {
    tx.execute(
        "INSERT INTO kv (key, value, updated_at_ms) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at_ms = excluded.updated_at_ms",
        (key, value, ts),
    )
    .with_context(|| format!("write {key}"))?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Acked,
    Failed,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Acked => "acked",
            Self::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "acked" {
            Self::Acked
        } else {
            Self::Failed
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLogEntry {
    pub ts_ms: i64,
    pub user_id: String,
    pub outcome: SyncOutcome,
    pub points_sent: f64,
    pub authority_total: Option<f64>,
    pub error: Option<String>,
}

fn migrate(conn: &Connection) -> anyhow::Result<()> {
    let v: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if v < 1 {
        conn.execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS kv (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  updated_at_ms INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_log (
  seq INTEGER PRIMARY KEY AUTOINCREMENT,
  ts_ms INTEGER NOT NULL,
  user_id TEXT NOT NULL,
  outcome TEXT NOT NULL,
  points_sent REAL NOT NULL,
  authority_total REAL,
  error TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_log_user ON sync_log(user_id, seq);
"#,
        )?;

        conn.pragma_update(None, "user_version", 1_i64)?;
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn temp_cache(tag: &str) -> BalanceCache {
    let p = std::env::temp_dir().join(format!(
        "crowntap-{tag}-{}.db",
        time::OffsetDateTime::now_utc().unix_timestamp_nanos()
    ));
    BalanceCache::new(p)
}
