//! Durable session state
//!
//! Persists each device's last acknowledged desired version so a session
//! reopened after a restart resumes from its watermark instead of 0.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::{Result, TwinError};

/// Persisted watermark for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "lastAckedDesiredVersion")]
    pub last_acked_desired_version: u64,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Storage seam for session watermarks
#[async_trait]
pub trait SessionStateStore: Send + Sync {
    async fn load(&self, device_id: &str) -> Result<Option<SessionRecord>>;

    async fn save(&self, device_id: &str, last_acked_desired_version: u64) -> Result<()>;

    async fn remove(&self, device_id: &str) -> Result<()>;
}

/// SQLite-backed session state
#[derive(Clone)]
pub struct SqliteSessionStore {
    pool: SqlitePool,
}

impl SqliteSessionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionStateStore for SqliteSessionStore {
    async fn load(&self, device_id: &str) -> Result<Option<SessionRecord>> {
        let row = sqlx::query_as::<_, SessionRow>(
            r#"
            SELECT device_id, last_acked_desired_version, updated_at
            FROM device_sessions
            WHERE device_id = ?
            "#,
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| r.into_record()).transpose()
    }

    async fn save(&self, device_id: &str, last_acked_desired_version: u64) -> Result<()> {
        let version = i64::try_from(last_acked_desired_version).map_err(|_| {
            TwinError::Internal(format!(
                "watermark {} out of range for storage",
                last_acked_desired_version
            ))
        })?;

        sqlx::query(
            r#"
            INSERT INTO device_sessions (device_id, last_acked_desired_version, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(device_id) DO UPDATE SET
                last_acked_desired_version = excluded.last_acked_desired_version,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(device_id)
        .bind(version)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove(&self, device_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM device_sessions WHERE device_id = ?")
            .bind(device_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    device_id: String,
    last_acked_desired_version: i64,
    updated_at: String,
}

impl SessionRow {
    fn into_record(self) -> Result<SessionRecord> {
        let updated_at = DateTime::parse_from_rfc3339(&self.updated_at)
            .map_err(|e| TwinError::Internal(format!("bad session timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(SessionRecord {
            device_id: self.device_id,
            last_acked_desired_version: self.last_acked_desired_version.max(0) as u64,
            updated_at,
        })
    }
}

/// Process-local session state, lost on restart
#[derive(Default)]
pub struct MemorySessionStore {
    records: parking_lot::Mutex<HashMap<String, SessionRecord>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStateStore for MemorySessionStore {
    async fn load(&self, device_id: &str) -> Result<Option<SessionRecord>> {
        Ok(self.records.lock().get(device_id).cloned())
    }

    async fn save(&self, device_id: &str, last_acked_desired_version: u64) -> Result<()> {
        self.records.lock().insert(
            device_id.to_string(),
            SessionRecord {
                device_id: device_id.to_string(),
                last_acked_desired_version,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn remove(&self, device_id: &str) -> Result<()> {
        self.records.lock().remove(device_id);
        Ok(())
    }
}
