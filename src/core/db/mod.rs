mod state;

use std::{future::Future, path::Path, sync::Arc};

use state::DbState;
use time::format_description::well_known::Rfc3339;
use uuid::Uuid;

use crate::{core::StoreError, models::PredictionSummary};

/// Insert-only store of finished prediction summaries.
pub trait RecordStore: Send + Sync + 'static {
    fn insert(
        &self,
        summary: &PredictionSummary,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;
}

/// Summaries kept as JSON documents in a SQLite table, one row per run.
#[derive(Debug, Clone)]
pub struct SqliteRecordStore {
    state: Arc<DbState>,
}

impl SqliteRecordStore {
    pub async fn new<P: AsRef<Path>>(db_file: P) -> anyhow::Result<Self> {
        Ok(Self {
            state: Arc::new(DbState::new(db_file).await?),
        })
    }

    /// Number of stored summaries.
    pub async fn count(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn("prediction_summary").await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM prediction_summary")
            .fetch_one(&mut **conn)
            .await
            .map_err(|err| StoreError::backend("prediction_summary", err))?;
        Ok(count as u64)
    }

    /// Raw stored document for one run, as written by [`RecordStore::insert`].
    pub async fn fetch_document(
        &self,
        prediction_id: Uuid,
    ) -> Result<Option<serde_json::Value>, StoreError> {
        let target = prediction_id.to_string();
        let mut conn = self.conn(&target).await?;
        let document: Option<String> =
            sqlx::query_scalar("SELECT document FROM prediction_summary WHERE prediction_id = $1")
                .bind(&target)
                .fetch_optional(&mut **conn)
                .await
                .map_err(|err| StoreError::backend(&target, err))?;
        document
            .map(|doc| serde_json::from_str(&doc).map_err(|err| StoreError::backend(&target, err)))
            .transpose()
    }

    /// Flush and close the pool. Further calls fail.
    pub async fn close(&self) -> anyhow::Result<()> {
        self.state.close().await
    }

    async fn conn(&self, target: &str) -> Result<state::DbConnGuard<'_>, StoreError> {
        self.state
            .conn()
            .await
            .map_err(|err| StoreError::backend(target, err))
    }
}

impl RecordStore for SqliteRecordStore {
    async fn insert(&self, summary: &PredictionSummary) -> Result<(), StoreError> {
        let target = summary.prediction_id.to_string();
        let document =
            serde_json::to_string(summary).map_err(|err| StoreError::backend(&target, err))?;
        let created_at = summary
            .created_at
            .format(&Rfc3339)
            .map_err(|err| StoreError::backend(&target, err))?;

        let mut conn = self.conn(&target).await?;
        sqlx::query(
            "INSERT INTO prediction_summary (prediction_id, created_at, document) VALUES ($1, $2, $3)",
        )
        .bind(&target)
        .bind(created_at)
        .bind(document)
        .execute(&mut **conn)
        .await
        .map_err(|err| StoreError::backend(&target, err))?;
        Ok(())
    }
}
