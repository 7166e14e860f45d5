//! Postgres-backed alert store for deployments that run from several hosts.
//!
//! Runs sharing one database serialize on a session-level advisory lock, so
//! the read-decide-write sequence of a run never interleaves with another.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dealscout_core::AlertRecord;
use sqlx::pool::PoolConnection;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};

use crate::{AlertStore, RunClaim, StoreError};

/// Advisory lock key shared by every DealScout run against one database.
const RUN_LOCK_KEY: i64 = 0x6465_616c_7363_6f75;

/// Holds the advisory lock for as long as it lives.
///
/// The lock belongs to the database session, so dropping the claim closes its
/// connection instead of returning it to the pool still locked.
pub struct PgRunClaim {
    conn: Option<PoolConnection<Postgres>>,
}

impl fmt::Debug for PgRunClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PgRunClaim")
            .field("held", &self.conn.is_some())
            .finish()
    }
}

impl Drop for PgRunClaim {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}

#[derive(Debug, Clone)]
pub struct PgAlertStore {
    pool: PgPool,
}

impl PgAlertStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn into_records(rows: Vec<(String, DateTime<Utc>)>) -> Vec<AlertRecord> {
    rows.into_iter()
        .map(|(source_id, alerted_at)| AlertRecord::new(source_id, alerted_at))
        .collect()
}

#[async_trait]
impl AlertStore for PgAlertStore {
    async fn get(&self, source_id: &str) -> Result<Option<AlertRecord>, StoreError> {
        let row: Option<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT source_id, alerted_at FROM alert_records WHERE source_id = $1",
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|(id, at)| AlertRecord::new(id, at)))
    }

    async fn put_many(&self, records: &[AlertRecord]) -> Result<usize, StoreError> {
        if records.is_empty() {
            return Ok(0);
        }
        // a record only ever moves forward in time
        let mut tx = self.pool.begin().await?;
        let mut written = 0usize;
        for record in records {
            let result = sqlx::query(
                "INSERT INTO alert_records (source_id, alerted_at) VALUES ($1, $2) \
                 ON CONFLICT (source_id) DO UPDATE SET alerted_at = EXCLUDED.alerted_at \
                 WHERE alert_records.alerted_at < EXCLUDED.alerted_at",
            )
            .bind(&record.source_id)
            .bind(record.alerted_at)
            .execute(&mut *tx)
            .await?;
            written += usize::try_from(result.rows_affected()).unwrap_or(usize::MAX);
        }
        tx.commit().await?;
        Ok(written)
    }

    async fn load_all(&self) -> Result<Vec<AlertRecord>, StoreError> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT source_id, alerted_at FROM alert_records ORDER BY source_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(into_records(rows))
    }

    async fn list_older_than(&self, cutoff: DateTime<Utc>) -> Result<Vec<AlertRecord>, StoreError> {
        let rows: Vec<(String, DateTime<Utc>)> = sqlx::query_as(
            "SELECT source_id, alerted_at FROM alert_records WHERE alerted_at < $1 ORDER BY source_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(into_records(rows))
    }

    async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let result = sqlx::query("DELETE FROM alert_records WHERE alerted_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
    }

    async fn claim_run(&self) -> Result<Option<RunClaim>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let locked: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(RUN_LOCK_KEY)
            .fetch_one(&mut *conn)
            .await?;
        Ok(locked.then(|| RunClaim::Postgres(PgRunClaim { conn: Some(conn) })))
    }
}
