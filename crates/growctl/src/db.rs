use anyhow::{Context, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Row, Sqlite};
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;

use crate::events::AuditEvent;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// One row of the audit trail as read back for the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct StoredEvent {
    pub id: i64,
    pub ts_utc: String,
    pub event_type: String,
    pub reason_code: Option<String>,
    pub message: String,
    pub profile_id: Option<String>,
    pub actor: Option<String>,
    pub payload: Option<serde_json::Value>,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS events (
      id           INTEGER PRIMARY KEY AUTOINCREMENT,
      ts_utc       TEXT NOT NULL,
      event_type   TEXT NOT NULL,
      reason_code  TEXT,
      message      TEXT NOT NULL,
      profile_id   TEXT,
      actor        TEXT,
      payload_json TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_events_ts ON events (ts_utc)",
    "CREATE INDEX IF NOT EXISTS idx_events_type ON events (event_type)",
];

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/growctl/events.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to an in-memory database is a separate database.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Creates the audit schema if it does not exist yet.
    pub async fn migrate(&self) -> Result<()> {
        for stmt in SCHEMA {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("failed to create schema")?;
        }
        Ok(())
    }

    // ----------------------------
    // Audit events
    // ----------------------------

    /// Insert a batch of events in one transaction.
    pub async fn insert_events(&self, events: &[AuditEvent]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("insert_events: begin failed")?;

        for ev in events {
            let ts = ev.ts.format(&Rfc3339).unwrap_or_default();
            let payload = ev.payload.as_ref().map(|p| p.to_string());
            sqlx::query(
                r#"
                INSERT INTO events (
                  ts_utc, event_type, reason_code, message, profile_id, actor, payload_json
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(ts)
            .bind(&ev.kind)
            .bind(&ev.reason_code)
            .bind(&ev.message)
            .bind(&ev.profile_id)
            .bind(&ev.actor)
            .bind(payload)
            .execute(&mut *tx)
            .await
            .context("insert_events failed")?;
        }

        tx.commit().await.context("insert_events: commit failed")?;
        Ok(())
    }

    /// Most recent events first.
    pub async fn recent_events(&self, limit: i64) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, ts_utc, event_type, reason_code, message, profile_id, actor, payload_json
            FROM events
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_events failed")?;

        rows.into_iter()
            .map(|r| {
                let payload: Option<String> = r.try_get("payload_json")?;
                Ok(StoredEvent {
                    id: r.try_get("id")?,
                    ts_utc: r.try_get("ts_utc")?,
                    event_type: r.try_get("event_type")?,
                    reason_code: r.try_get("reason_code")?,
                    message: r.try_get("message")?,
                    profile_id: r.try_get("profile_id")?,
                    actor: r.try_get("actor")?,
                    payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
                })
            })
            .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
            .context("recent_events: bad row")
    }

    /// Number of events of one type.
    pub async fn count_events(&self, event_type: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM events WHERE event_type = ?")
            .bind(event_type)
            .fetch_one(&self.pool)
            .await
            .context("count_events failed")?;
        row.try_get("n").context("count_events: bad row")
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    #[tokio::test]
    async fn migrate_is_idempotent() {
        let db = test_db().await;
        db.migrate().await.unwrap();
        assert_eq!(db.count_events("alert").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn insert_and_read_back_batch() {
        let db = test_db().await;
        let batch = vec![
            AuditEvent::new("alert", "Temperature 41.0°C above hard maximum 40°C")
                .reason("temp_hard_high:breach")
                .actor("safety")
                .profile(Some("basil"))
                .payload(serde_json::json!({"temp_c": 41.0})),
            AuditEvent::new("actuator", "fan ON"),
        ];
        db.insert_events(&batch).await.unwrap();

        let rows = db.recent_events(10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].event_type, "actuator");
        assert_eq!(rows[1].reason_code.as_deref(), Some("temp_hard_high:breach"));
        assert_eq!(rows[1].actor.as_deref(), Some("safety"));
        assert_eq!(rows[1].payload.as_ref().unwrap()["temp_c"], 41.0);
        assert!(rows[0].payload.is_none());
        assert_eq!(db.count_events("alert").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn recent_events_honours_limit() {
        let db = test_db().await;
        let batch: Vec<_> = (0..5)
            .map(|i| AuditEvent::new("actuator", format!("event {i}")))
            .collect();
        db.insert_events(&batch).await.unwrap();

        let rows = db.recent_events(2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].message, "event 4");
    }
}
