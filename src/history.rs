use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

use crate::{error::HistoryError, format::MediaFormat};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryRecord {
    pub id: i64,
    pub url: String,
    pub file_format: MediaFormat,
    pub quality: String,
    #[serde(serialize_with = "serialize_utc")]
    pub timestamp: DateTime<Utc>,
}

fn serialize_utc<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Append-only log of served downloads.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    async fn append(
        &self,
        url: &str,
        format: MediaFormat,
        quality: &str,
    ) -> Result<HistoryRecord, HistoryError>;

    /// Every record, newest first.
    async fn list_all(&self) -> Result<Vec<HistoryRecord>, HistoryError>;
}

pub struct SqliteHistoryStore {
    pool: SqlitePool,
}

impl SqliteHistoryStore {
    pub async fn connect(database_url: &str) -> Result<Self, HistoryError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new().connect_with(options).await?;
        Self::init(&pool).await?;
        Ok(Self { pool })
    }

    /// Single-connection pool; the database lives as long as that connection.
    pub async fn in_memory() -> Result<Self, HistoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Self::init(&pool).await?;
        Ok(Self { pool })
    }

    async fn init(pool: &SqlitePool) -> Result<(), HistoryError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS download_history (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                url         TEXT    NOT NULL,
                file_format TEXT    NOT NULL,
                quality     TEXT,
                timestamp   INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_download_history_timestamp
             ON download_history (timestamp DESC)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl HistoryStore for SqliteHistoryStore {
    async fn append(
        &self,
        url: &str,
        format: MediaFormat,
        quality: &str,
    ) -> Result<HistoryRecord, HistoryError> {
        let now = Utc::now();
        let micros = now.timestamp_micros();

        let result = sqlx::query(
            "INSERT INTO download_history (url, file_format, quality, timestamp)
             VALUES (?, ?, ?, ?)",
        )
        .bind(url)
        .bind(format.extension())
        .bind(quality)
        .bind(micros)
        .execute(&self.pool)
        .await?;

        Ok(HistoryRecord {
            id: result.last_insert_rowid(),
            url: url.to_string(),
            file_format: format,
            quality: quality.to_string(),
            timestamp: from_micros(micros)?,
        })
    }

    async fn list_all(&self) -> Result<Vec<HistoryRecord>, HistoryError> {
        let rows = sqlx::query_as::<_, (i64, String, String, Option<String>, i64)>(
            "SELECT id, url, file_format, quality, timestamp
             FROM download_history
             ORDER BY timestamp DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .filter_map(|(id, url, file_format, quality, timestamp)| {
                let file_format = file_format.parse::<MediaFormat>().ok()?;
                Some(from_micros(timestamp).map(|timestamp| HistoryRecord {
                    id,
                    url,
                    file_format,
                    quality: quality.unwrap_or_default(),
                    timestamp,
                }))
            })
            .collect()
    }
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, HistoryError> {
    DateTime::from_timestamp_micros(micros).ok_or(HistoryError::InvalidTimestamp(micros))
}
