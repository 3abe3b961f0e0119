//! Database connection pool, migrations, health check and the `work_ready`
//! notification listener.
//!
//! [`Db`] is the Postgres [`QueueStore`](crate::store::QueueStore); the
//! queries live in [`work`].

pub mod work;

use crate::engine::Waker;
use crate::error::Result;
use sqlx::PgPool;
use sqlx::postgres::{PgListener, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Channel used by `pg_notify` on insert.
pub const WORK_READY_CHANNEL: &str = "work_ready";

/// Database handle. Owns the connection pool.
pub struct Db {
    pool: PgPool,
}

impl Db {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| crate::error::Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    /// Simple health check: run a SELECT 1.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Relay `NOTIFY work_ready` to a dispatcher until the task is dropped.
    ///
    /// Listener errors are logged and retried; the dispatcher's poll interval
    /// covers anything missed meanwhile.
    pub async fn forward_notifications(&self, waker: Waker) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(WORK_READY_CHANNEL).await?;
        info!(channel = WORK_READY_CHANNEL, "listening for work notifications");

        loop {
            match listener.recv().await {
                Ok(n) => {
                    debug!(work_type = n.payload(), "notified of new work");
                    waker.wake();
                }
                Err(e) => {
                    warn!("PgListener error: {e}, falling back to poll");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}
