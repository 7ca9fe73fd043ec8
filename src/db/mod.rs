//! SQLite persistence for the broker's collaborator seams.
//!
//! Backs three concerns: the account allow-list checked at hello, per-EA
//! settings blobs, and the append-only activity log. Copy state itself is
//! deliberately not persisted; the tracker rebuilds from live traffic.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};

use crate::collaborators::{AccountRecord, AccountsProvider, AuditEntry, AuditSink, SettingsStore};

/// Database connection pool implementing the collaborator traits.
pub struct Database {
    pool: SqlitePool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct AccountRow {
    user_id: String,
    display_name: Option<String>,
    blocked: bool,
}

impl Database {
    /// Connect and bring the schema up to date.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    async fn run_migrations(&self) -> Result<()> {
        // Account allow-list
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                user_id TEXT PRIMARY KEY,
                display_name TEXT,
                blocked INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Per-EA settings blobs
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ea_settings (
                user_id TEXT NOT NULL,
                ea_id TEXT NOT NULL,
                settings TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (user_id, ea_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Activity log
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                kind TEXT NOT NULL,
                user_id TEXT NOT NULL,
                detail TEXT NOT NULL,
                at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert or unblock a user (operator provisioning path).
    pub async fn upsert_account(&self, user_id: &str, display_name: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO accounts (user_id, display_name, blocked)
            VALUES (?, ?, 0)
            ON CONFLICT(user_id) DO UPDATE SET
                display_name = excluded.display_name,
                blocked = 0
            "#,
        )
        .bind(user_id)
        .bind(display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Recent activity, newest first.
    pub async fn recent_activity(&self, limit: i64) -> Result<Vec<(String, String, String)>> {
        let rows = sqlx::query(
            "SELECT kind, user_id, detail FROM activity_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("kind"), r.get("user_id"), r.get("detail")))
            .collect())
    }
}

#[async_trait]
impl AccountsProvider for Database {
    async fn lookup(&self, user_id: &str) -> Result<Option<AccountRecord>> {
        let row = sqlx::query_as::<_, AccountRow>(
            "SELECT user_id, display_name, blocked FROM accounts WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| AccountRecord {
            user_id: r.user_id,
            display_name: r.display_name,
            blocked: r.blocked,
        }))
    }
}

#[async_trait]
impl SettingsStore for Database {
    async fn load(&self, user_id: &str, ea_id: &str) -> Result<Option<Value>> {
        let blob: Option<String> = sqlx::query_scalar(
            "SELECT settings FROM ea_settings WHERE user_id = ? AND ea_id = ?",
        )
        .bind(user_id)
        .bind(ea_id)
        .fetch_optional(&self.pool)
        .await?;
        match blob {
            Some(text) => Ok(Some(
                serde_json::from_str(&text).context("Corrupt settings blob")?,
            )),
            None => Ok(None),
        }
    }

    async fn save(&self, user_id: &str, ea_id: &str, settings: &Value) -> Result<()> {
        let blob = serde_json::to_string(settings)?;
        sqlx::query(
            r#"
            INSERT INTO ea_settings (user_id, ea_id, settings, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(user_id, ea_id) DO UPDATE SET
                settings = excluded.settings,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(user_id)
        .bind(ea_id)
        .bind(blob)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for Database {
    async fn record(&self, entry: AuditEntry) -> Result<()> {
        sqlx::query("INSERT INTO activity_log (kind, user_id, detail, at) VALUES (?, ?, ?, ?)")
            .bind(entry.kind.as_str())
            .bind(&entry.user_id)
            .bind(&entry.detail)
            .bind(entry.at.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn test_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn lookup_unknown_user_is_none() {
        let db = test_db().await;
        assert!(db.lookup("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_then_lookup() {
        let db = test_db().await;
        db.upsert_account("user-1", Some("Alice")).await.unwrap();
        let account = db.lookup("user-1").await.unwrap().unwrap();
        assert_eq!(account.display_name.as_deref(), Some("Alice"));
        assert!(!account.blocked);
    }

    #[tokio::test]
    async fn settings_blob_round_trip() {
        let db = test_db().await;
        assert!(db.load("u", "ea").await.unwrap().is_none());

        db.save("u", "ea", &json!({"offset": 10, "jitter": 1.5}))
            .await
            .unwrap();
        let loaded = db.load("u", "ea").await.unwrap().unwrap();
        assert_eq!(loaded["offset"], 10);

        // Upsert replaces in place.
        db.save("u", "ea", &json!({"offset": 20})).await.unwrap();
        let loaded = db.load("u", "ea").await.unwrap().unwrap();
        assert_eq!(loaded["offset"], 20);
    }

    #[tokio::test]
    async fn activity_log_appends() {
        let db = test_db().await;
        db.record(AuditEntry::warning("u1", "first".into())).await.unwrap();
        db.record(AuditEntry::warning("u1", "second".into())).await.unwrap();

        let recent = db.recent_activity(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].2, "second");
    }
}
