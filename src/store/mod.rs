//! PostgreSQL store: the authoritative record of jobs, sessions, users, and
//! task-configuration documents.

pub mod jobs;
pub mod scans;
pub mod task_config;
pub mod users;

use deadpool_postgres::{Config as PoolConfig, Pool, Runtime};
use tokio_postgres::NoTls;

use crate::config::DatabaseConfig;
use crate::error::DatabaseError;

pub use jobs::{JobReport, JobReportError};
pub use scans::{ExpiredScanLease, ScanFailOutcome};

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Connection pool wrapper; all queries go through here.
pub struct Store {
    pool: Pool,
}

impl Store {
    /// Create the pool and verify a connection can be established.
    pub async fn new(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let mut cfg = PoolConfig::new();
        cfg.url = Some(config.url().to_string());
        cfg.pool = Some(deadpool_postgres::PoolConfig {
            max_size: config.pool_size,
            ..Default::default()
        });

        let pool = cfg
            .create_pool(Some(Runtime::Tokio1), NoTls)
            .map_err(|e| DatabaseError::Pool(e.to_string()))?;

        // Test connection
        let _ = pool.get().await?;

        Ok(Self { pool })
    }

    /// Apply embedded schema migrations.
    pub async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let mut conn = self.pool.get().await?;
        let report = embedded::migrations::runner()
            .run_async(&mut **conn)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        for migration in report.applied_migrations() {
            tracing::info!("applied migration {}", migration);
        }
        Ok(())
    }

    /// Get a connection from the pool.
    pub(crate) async fn conn(&self) -> Result<deadpool_postgres::Object, DatabaseError> {
        Ok(self.pool.get().await?)
    }

    /// Cheap liveness probe for the health endpoint.
    pub async fn ping(&self) -> Result<(), DatabaseError> {
        let conn = self.conn().await?;
        conn.query_one("SELECT 1", &[]).await?;
        Ok(())
    }
}
