use crate::config::StorageConfig;
use crate::log_store::{
    retention_cutoff, LogEntry, LogStorage, StorageError, StorageResult, StoredLogEntry,
};
use crate::query_filter::{QueryArg, QueryFilter};
use crate::request_context::RequestContext;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Connection, FromRow, Postgres, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Idempotent schema: table plus indexes for every supported predicate
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS logs (
        id BIGSERIAL PRIMARY KEY,
        timestamp TIMESTAMPTZ NOT NULL,
        service TEXT NOT NULL,
        level TEXT NOT NULL,
        message TEXT NOT NULL,
        fields JSONB,
        created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_logs_service ON logs(service)",
    "CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level)",
    "CREATE INDEX IF NOT EXISTS idx_logs_service_level ON logs(service, level)",
    "CREATE INDEX IF NOT EXISTS idx_logs_created_at ON logs(created_at)",
    "CREATE INDEX IF NOT EXISTS idx_logs_fields ON logs USING gin(fields)",
];

const INSERT_LOG: &str = r#"
    INSERT INTO logs (timestamp, service, level, message, fields)
    VALUES ($1, $2, $3, $4, $5)
"#;

// `created_at` is stamped by the database, so its age is measured against the
// database clock too.
const DELETE_OLD_LOGS: &str =
    "DELETE FROM logs WHERE created_at < NOW() - make_interval(secs => $1)";

/// Row shape of the logs table
#[derive(Debug, FromRow)]
struct LogRow {
    id: i64,
    timestamp: DateTime<Utc>,
    service: String,
    level: String,
    message: String,
    fields: Option<Json<HashMap<String, String>>>,
    created_at: DateTime<Utc>,
}

impl From<LogRow> for StoredLogEntry {
    fn from(row: LogRow) -> Self {
        Self {
            id: row.id,
            timestamp: row.timestamp,
            service: row.service,
            level: row.level,
            message: row.message,
            fields: row.fields.map(|Json(fields)| fields).unwrap_or_default(),
            created_at: row.created_at,
        }
    }
}

/// Log storage backed by PostgreSQL
pub struct PostgresLogStore {
    pool: PgPool,
}

impl PostgresLogStore {
    /// Connect with a bounded pool, verify reachability and initialize the
    /// schema. Fails fast when the database cannot be reached within the
    /// configured connect timeout.
    pub async fn connect(config: &StorageConfig) -> Result<Self> {
        let options = config
            .connect_options()
            .context("Invalid PostgreSQL connection settings")?;
        let pool_config = &config.pool;

        let pool = PgPoolOptions::new()
            .max_connections(pool_config.max_connections)
            .min_connections(pool_config.max_idle_connections)
            .max_lifetime(Some(pool_config.max_lifetime()))
            .idle_timeout(Some(pool_config.idle_timeout()))
            .acquire_timeout(pool_config.connect_timeout())
            .connect_lazy_with(options);

        let store = Self { pool };

        if let Err(e) = store.ping(pool_config.connect_timeout()).await {
            store.pool.close().await;
            return Err(e).context("Failed to ping PostgreSQL");
        }

        info!(
            max_connections = pool_config.max_connections,
            max_idle_connections = pool_config.max_idle_connections,
            "Connected to PostgreSQL database"
        );

        if let Err(e) = store.init_schema().await {
            store.pool.close().await;
            return Err(e).context("Failed to initialize schema");
        }

        Ok(store)
    }

    async fn ping(&self, timeout: Duration) -> StorageResult<()> {
        let ctx = RequestContext::with_timeout(timeout);
        ctx.run("ping", async {
            let mut conn = self.pool.acquire().await?;
            conn.ping().await?;
            Ok(())
        })
        .await
    }

    /// Create the logs table and its indexes if absent
    pub async fn init_schema(&self) -> StorageResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        info!("Log schema initialized");
        Ok(())
    }

    fn ensure_open(&self) -> StorageResult<()> {
        if self.pool.is_closed() {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    async fn insert_row(
        tx: &mut Transaction<'static, Postgres>,
        entry: &LogEntry,
    ) -> StorageResult<()> {
        let fields = serde_json::to_value(&entry.fields)?;

        sqlx::query(INSERT_LOG)
            .bind(entry.timestamp)
            .bind(&entry.service)
            .bind(&entry.level)
            .bind(&entry.message)
            .bind(fields)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    async fn insert_batch(&self, entries: &[LogEntry]) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;

        for entry in entries {
            if let Err(e) = Self::insert_row(&mut tx, entry).await {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Rollback after failed insert also failed");
                }
                return Err(e);
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl LogStorage for PostgresLogStore {
    #[instrument(skip(self, ctx, entry), fields(service = %entry.service))]
    async fn insert_log(&self, ctx: &RequestContext, entry: LogEntry) -> StorageResult<()> {
        self.ensure_open()?;

        ctx.run("insert_log", async {
            let fields = serde_json::to_value(&entry.fields)?;

            sqlx::query(INSERT_LOG)
                .bind(entry.timestamp)
                .bind(&entry.service)
                .bind(&entry.level)
                .bind(&entry.message)
                .bind(fields)
                .execute(&self.pool)
                .await?;

            Ok(())
        })
        .await
    }

    #[instrument(skip(self, ctx, entries), fields(count = entries.len()))]
    async fn insert_logs(
        &self,
        ctx: &RequestContext,
        entries: Vec<LogEntry>,
    ) -> StorageResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.ensure_open()?;

        // Dropping the in-flight transaction on timeout or cancellation rolls
        // it back, so no partial batch becomes visible.
        ctx.run("insert_logs", self.insert_batch(&entries)).await?;

        debug!("Batch committed");
        Ok(())
    }

    #[instrument(skip(self, ctx))]
    async fn query_logs(
        &self,
        ctx: &RequestContext,
        filter: &QueryFilter,
    ) -> StorageResult<Vec<StoredLogEntry>> {
        self.ensure_open()?;

        let (sql, args) = filter.to_query().into_parts();

        ctx.run("query_logs", async {
            let mut query = sqlx::query_as::<_, LogRow>(&sql);
            for arg in args {
                query = match arg {
                    QueryArg::Text(value) => query.bind(value),
                    QueryArg::Timestamp(value) => query.bind(value),
                    QueryArg::Int(value) => query.bind(value),
                };
            }

            let rows = query.fetch_all(&self.pool).await?;
            Ok(rows.into_iter().map(StoredLogEntry::from).collect())
        })
        .await
    }

    #[instrument(skip(self, ctx))]
    async fn delete_old_logs(
        &self,
        ctx: &RequestContext,
        older_than: Duration,
    ) -> StorageResult<u64> {
        self.ensure_open()?;

        // Older than any timestamptz; nothing can have been ingested then
        if retention_cutoff(older_than).year() < 1 {
            return Ok(0);
        }

        let deleted = ctx
            .run("delete_old_logs", async {
                let result = sqlx::query(DELETE_OLD_LOGS)
                    .bind(older_than.as_secs_f64())
                    .execute(&self.pool)
                    .await?;
                Ok(result.rows_affected())
            })
            .await?;

        info!(
            deleted = deleted,
            older_than_secs = older_than.as_secs(),
            "Deleted old logs"
        );
        Ok(deleted)
    }

    async fn health_check(&self, ctx: &RequestContext) -> StorageResult<()> {
        self.ensure_open()?;

        ctx.run("health_check", async {
            let mut conn = self.pool.acquire().await?;
            conn.ping().await?;
            Ok(())
        })
        .await
    }

    async fn close(&self) -> StorageResult<()> {
        if !self.pool.is_closed() {
            self.pool.close().await;
            info!("PostgreSQL pool closed");
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
