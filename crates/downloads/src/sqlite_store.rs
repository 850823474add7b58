//! Durable download job store over SQLite.

use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};

use mediasync_jobs::{JobId, JobRecord, JobStore, JobStoreError};

use crate::job::{AttachmentDownloadJob, DownloadJobQuery};

/// Download jobs in the `attachment_download_jobs` table.
///
/// Columns used for selection are stored next to the JSON payload.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open `url` and create the table if needed.
    pub async fn connect(url: &str) -> Result<Self, JobStoreError> {
        let pool = SqlitePool::connect(url).await.map_err(storage)?;
        let store = Self::from_pool(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS attachment_download_jobs (
                id                   TEXT PRIMARY KEY,
                message_id           TEXT NOT NULL,
                attachment_type      TEXT NOT NULL,
                attachment_signature TEXT NOT NULL,
                source               TEXT NOT NULL,
                received_at          INTEGER NOT NULL,
                attempts             INTEGER NOT NULL DEFAULT 0,
                active               INTEGER NOT NULL DEFAULT 0,
                retry_after          INTEGER NULL,
                last_attempt_at      INTEGER NULL,
                data                 TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS attachment_download_jobs_next
                ON attachment_download_jobs (active, retry_after, received_at)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        Ok(())
    }
}

fn storage(err: impl Display) -> JobStoreError {
    JobStoreError::Storage(err.to_string())
}

fn to_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(|at| at.timestamp_millis())
}

fn from_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, JobStoreError> {
    ms.map(|ms| {
        DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| storage(format!("timestamp out of range: {ms}")))
    })
    .transpose()
}

/// Map a database row into a job record.
fn row_to_record(row: &SqliteRow) -> Result<JobRecord<AttachmentDownloadJob>, JobStoreError> {
    let id: String = row.try_get("id").map_err(storage)?;
    let attempts: i64 = row.try_get("attempts").map_err(storage)?;
    let active: bool = row.try_get("active").map_err(storage)?;
    let retry_after: Option<i64> = row.try_get("retry_after").map_err(storage)?;
    let last_attempt_at: Option<i64> = row.try_get("last_attempt_at").map_err(storage)?;
    let data: String = row.try_get("data").map_err(storage)?;

    Ok(JobRecord {
        id: JobId::new(id),
        attempts: u32::try_from(attempts).map_err(storage)?,
        active,
        retry_after: from_millis(retry_after)?,
        last_attempt_at: from_millis(last_attempt_at)?,
        data: serde_json::from_str(&data).map_err(storage)?,
    })
}

const SELECT_COLUMNS: &str =
    "SELECT id, attempts, active, retry_after, last_attempt_at, data FROM attachment_download_jobs";

#[async_trait]
impl JobStore<AttachmentDownloadJob, DownloadJobQuery> for SqliteJobStore {
    async fn mark_all_inactive(&self) -> Result<(), JobStoreError> {
        sqlx::query("UPDATE attachment_download_jobs SET active = 0 WHERE active = 1")
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn insert(
        &self,
        records: Vec<JobRecord<AttachmentDownloadJob>>,
    ) -> Result<(), JobStoreError> {
        let mut tx = self.pool.begin().await.map_err(storage)?;
        for record in &records {
            let data = serde_json::to_string(&record.data).map_err(storage)?;
            sqlx::query(
                r#"
                INSERT INTO attachment_download_jobs
                    (id, message_id, attachment_type, attachment_signature, source,
                     received_at, attempts, active, retry_after, last_attempt_at, data)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    source = excluded.source,
                    received_at = excluded.received_at,
                    data = excluded.data
                "#,
            )
            .bind(record.id.as_str())
            .bind(record.data.message_id.as_str())
            .bind(record.data.attachment_type.as_str())
            .bind(record.data.attachment_signature.as_str())
            .bind(record.data.source.as_str())
            .bind(record.data.received_at)
            .bind(i64::from(record.attempts))
            .bind(record.active)
            .bind(to_millis(record.retry_after))
            .bind(to_millis(record.last_attempt_at))
            .bind(data)
            .execute(&mut *tx)
            .await
            .map_err(storage)?;
        }
        tx.commit().await.map_err(storage)?;
        Ok(())
    }

    async fn update(&self, record: &JobRecord<AttachmentDownloadJob>) -> Result<(), JobStoreError> {
        let data = serde_json::to_string(&record.data).map_err(storage)?;
        let result = sqlx::query(
            r#"
            UPDATE attachment_download_jobs
            SET source = ?, received_at = ?, attempts = ?, active = ?,
                retry_after = ?, last_attempt_at = ?, data = ?
            WHERE id = ?
            "#,
        )
        .bind(record.data.source.as_str())
        .bind(record.data.received_at)
        .bind(i64::from(record.attempts))
        .bind(record.active)
        .bind(to_millis(record.retry_after))
        .bind(to_millis(record.last_attempt_at))
        .bind(data)
        .bind(record.id.as_str())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(record.id.clone()));
        }
        Ok(())
    }

    async fn get(
        &self,
        id: &JobId,
    ) -> Result<Option<JobRecord<AttachmentDownloadJob>>, JobStoreError> {
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = ?"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(storage)?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn remove(&self, id: &JobId) -> Result<(), JobStoreError> {
        sqlx::query("DELETE FROM attachment_download_jobs WHERE id = ?")
            .bind(id.as_str())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    async fn jobs(&self) -> Result<Vec<JobRecord<AttachmentDownloadJob>>, JobStoreError> {
        let rows = sqlx::query(SELECT_COLUMNS)
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(row_to_record).collect()
    }

    async fn next_jobs(
        &self,
        query: DownloadJobQuery,
    ) -> Result<Vec<JobRecord<AttachmentDownloadJob>>, JobStoreError> {
        if query.sources.as_ref().is_some_and(Vec::is_empty) {
            return Ok(Vec::new());
        }

        let mut builder = QueryBuilder::<Sqlite>::new(SELECT_COLUMNS);
        builder.push(" WHERE active = 0 AND (retry_after IS NULL OR retry_after <= ");
        builder.push_bind(query.now.timestamp_millis());
        builder.push(")");

        if let Some(sources) = &query.sources {
            builder.push(" AND source IN (");
            let mut separated = builder.separated(", ");
            for source in sources {
                separated.push_bind(source.as_str());
            }
            separated.push_unseparated(")");
        }

        builder.push(" ORDER BY ");
        if !query.prioritize.is_empty() {
            builder.push("CASE WHEN message_id IN (");
            let mut separated = builder.separated(", ");
            for message_id in &query.prioritize {
                separated.push_bind(message_id.as_str().to_string());
            }
            separated.push_unseparated(") THEN 0 ELSE 1 END, ");
        }
        builder.push("received_at DESC, id ASC LIMIT ");
        builder.push_bind(i64::try_from(query.limit).unwrap_or(i64::MAX));

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(storage)?;
        rows.iter().map(row_to_record).collect()
    }
}
