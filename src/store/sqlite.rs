// =============================================================================
// SQLite persistent store
// =============================================================================
//
// WAL-mode SQLite behind a lock-guarded connection. Write volume here is a
// handful of rows per hour (alerts + settings), so a single connection is
// plenty. Schema ships with the binary and is applied idempotently on open.
// =============================================================================

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::settings::UserSettings;
use crate::store::PersistentStore;
use crate::types::AlertRecord;

const SCHEMA: &str = include_str!("../../migrations/001_init.sql");

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and apply the schema.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create data directory {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("cannot open database at {}", path.display()))?;
        Self::init(&conn)?;

        info!(path = %path.display(), "sqlite store opened");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database (tests, ephemeral runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("cannot open in-memory database")?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )
        .context("failed to set pragmas")?;
        conn.execute_batch(SCHEMA).context("failed to apply schema")?;
        Ok(())
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn insert_alert(&self, record: &AlertRecord) -> Result<String> {
        let details =
            serde_json::to_string(&record.details).context("details serialisation failed")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO alerts (
                id, exchange_id, symbol, timeframe, alert_type, triggered_at,
                price, trigger_value, trigger_label, previous_label, details,
                chart_generated, notification_sent, notification_error
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            rusqlite::params![
                record.id,
                record.exchange_id,
                record.symbol,
                record.timeframe.as_str(),
                record.alert_type,
                record.triggered_at.to_rfc3339(),
                record.price,
                record.trigger_value,
                record.trigger_label,
                record.previous_label,
                details,
                record.chart_generated,
                record.notification_sent,
                record.notification_error,
            ],
        )
        .context("alert insert failed")?;
        Ok(record.id.clone())
    }

    async fn load_settings(&self, identity_sub: &str) -> Result<Option<UserSettings>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT settings_json FROM user_settings WHERE identity_sub = ?1")
            .context("settings select prepare failed")?;
        let mut rows = stmt
            .query(rusqlite::params![identity_sub])
            .context("settings select failed")?;

        match rows.next().context("settings row read failed")? {
            Some(row) => {
                let raw: String = row.get(0).context("settings column read failed")?;
                let settings = serde_json::from_str(&raw).context("settings blob is corrupt")?;
                Ok(Some(settings))
            }
            None => Ok(None),
        }
    }

    async fn save_settings(&self, identity_sub: &str, settings: &UserSettings) -> Result<()> {
        let raw = serde_json::to_string(settings).context("settings serialisation failed")?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO user_settings (identity_sub, settings_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(identity_sub)
             DO UPDATE SET settings_json = excluded.settings_json,
                           updated_at   = excluded.updated_at",
            rusqlite::params![identity_sub, raw, Utc::now().to_rfc3339()],
        )
        .context("settings upsert failed")?;
        Ok(())
    }
}
