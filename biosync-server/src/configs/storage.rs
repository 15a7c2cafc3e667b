use std::future::Future;
use std::path::Path;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::migrate::Migrator;
use sqlx::sqlite::SqlitePoolOptions;

use crate::configs::schema::SchemaManager;
use crate::configs::settings::Database;
use crate::errors::PersistenceError;

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
    timeout: Duration,
}

impl Storage {
    pub async fn new(database: Database, schema_manager: SchemaManager) -> Result<Self, PersistenceError> {
        let options = SqlitePoolOptions::new().min_connections(1);

        // every connection to an in-memory url opens a separate database
        let options = if database.url.contains(":memory:") {
            options
                .max_connections(1)
                .idle_timeout(None::<Duration>)
                .max_lifetime(None::<Duration>)
        } else {
            options.max_connections(10)
        };

        let pool = options.connect(&database.url).await?;

        Self::create_schema(&pool, &schema_manager, &database).await?;

        Ok(Self {
            pool,
            timeout: database.timeout(),
        })
    }

    pub fn get_pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs a store operation, failing it once the configured timeout elapses.
    pub async fn run<T, F>(&self, operation: F) -> Result<T, PersistenceError>
    where
        F: Future<Output = Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.timeout, operation).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(PersistenceError::Timeout(self.timeout)),
        }
    }

    pub async fn close(&self) {
        self.pool.close().await;

        tracing::info!("database connection closed");
    }

    async fn create_schema(pool: &SqlitePool, schema: &SchemaManager, database: &Database) -> Result<(), PersistenceError> {
        if database.clean_start {
            sqlx::query("DROP TABLE IF EXISTS _sqlx_migrations")
                .execute(pool)
                .await?;

            sqlx::query(&schema.dispose_schema().join("\n"))
                .execute(pool)
                .await?;

            tracing::warn!("perform a clean boot: clean and recreate schema");
        }

        sqlx::query(&schema.create_schema().join("\n"))
            .execute(pool)
            .await?;

        if let Some(migration_path) = database.migration_path.clone() {
            let mut pool_connection = pool.acquire().await?;
            let migrator = Migrator::new(Path::new(&migration_path)).await?;
            migrator.run(&mut pool_connection).await?;

            tracing::info!("database migration success");
        }

        Ok(())
    }
}
