//! PostgreSQL driver.
//!
//! [`PostgresDatabase`] serves both sides of a migration: the legacy schema as
//! a [`SourceReader`](crate::core::traits::SourceReader) and the new schema as
//! a [`TargetWriter`](crate::core::traits::TargetWriter).
//!
//! - [`reader`]: introspection, counting and ordered paging
//! - [`writer`]: per-table transactions with multi-row inserts
//! - [`tls`]: rustls connector per `ssl_mode`

mod reader;
mod tls;
mod writer;

pub use tls::{SslMode, TlsBuilder};
pub use writer::PostgresTransaction;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::Config as PgConfig;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::core::identifier::qualify_pg;
use crate::error::{MigrateError, Result};

/// Connection pool timeout.
const POOL_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A PostgreSQL database reached through a connection pool.
pub struct PostgresDatabase {
    pool: Pool,
    schema: String,
    endpoint: String,
    /// Table -> column -> udt name, filled by the first page read of a table.
    column_types: Mutex<HashMap<String, Arc<HashMap<String, String>>>>,
}

impl PostgresDatabase {
    /// Build the pool and check that a connection can be made.
    pub async fn connect(config: &DatabaseConfig, max_conns: usize) -> Result<Self> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&config.host);
        pg_config.port(config.port);
        pg_config.dbname(&config.database);
        pg_config.user(&config.user);
        pg_config.password(&config.password);
        pg_config.application_name("hotelops-migrate");

        // Connection options for reliability
        pg_config.keepalives(true);
        pg_config.keepalives_idle(Duration::from_secs(30));
        pg_config.connect_timeout(POOL_CONNECTION_TIMEOUT);

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let endpoint = config.endpoint();
        let ssl_mode = SslMode::parse(&config.ssl_mode)?;
        let mgr = match TlsBuilder::new(ssl_mode).connector(&endpoint)? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, tokio_postgres::NoTls, mgr_config),
        };
        let pool = Pool::builder(mgr)
            .max_size(max_conns)
            .build()
            .map_err(|e| MigrateError::pool(e, format!("creating pool for {}", endpoint)))?;

        let db = Self {
            pool,
            schema: config.schema.clone(),
            endpoint,
            column_types: Mutex::new(HashMap::new()),
        };
        db.test_connection().await?;
        info!("Connected to PostgreSQL {} (schema {})", db.endpoint, db.schema);
        Ok(db)
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Test the database connection.
    pub async fn test_connection(&self) -> Result<()> {
        let client = self.client("testing connection").await?;
        client.simple_query("SELECT 1").await?;
        Ok(())
    }

    async fn client(&self, context: &str) -> Result<Object> {
        self.pool
            .get()
            .await
            .map_err(|e| MigrateError::pool(e, format!("{} on {}", context, self.endpoint)))
    }

    fn qualify(&self, table: &str) -> Result<String> {
        qualify_pg(&self.schema, table)
    }

    fn type_cache(&self) -> MutexGuard<'_, HashMap<String, Arc<HashMap<String, String>>>> {
        self.column_types
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
