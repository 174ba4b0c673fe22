//! Database Module
//!
//! PostgreSQL connection pool management and schema bootstrap.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::config::AppConfig;

/// Statements applied at startup. Idempotent, so a restart against an
/// existing database is a no-op.
const SCHEMA: &[&str] = &[
    r#"DO $$ BEGIN
        CREATE TYPE order_status AS ENUM ('OPEN', 'EXECUTED', 'CANCELED');
    EXCEPTION WHEN duplicate_object THEN NULL;
    END $$"#,
    r#"CREATE TABLE IF NOT EXISTS accounts (
        account_id TEXT PRIMARY KEY,
        balance NUMERIC NOT NULL CHECK (balance >= 0)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS positions (
        account_id TEXT NOT NULL REFERENCES accounts (account_id),
        symbol TEXT NOT NULL,
        quantity NUMERIC NOT NULL CHECK (quantity >= 0),
        PRIMARY KEY (account_id, symbol)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS orders (
        order_id BIGSERIAL PRIMARY KEY,
        account_id TEXT NOT NULL REFERENCES accounts (account_id),
        symbol TEXT NOT NULL,
        amount NUMERIC NOT NULL CHECK (amount <> 0),
        limit_price NUMERIC NOT NULL CHECK (limit_price > 0),
        status order_status NOT NULL,
        creation_time BIGINT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_orders_book
        ON orders (symbol, status)"#,
    r#"CREATE TABLE IF NOT EXISTS executions (
        exec_id BIGSERIAL PRIMARY KEY,
        order_id BIGINT NOT NULL REFERENCES orders (order_id),
        shares NUMERIC NOT NULL CHECK (shares > 0),
        price NUMERIC NOT NULL CHECK (price > 0),
        exec_time BIGINT NOT NULL
    )"#,
    r#"CREATE INDEX IF NOT EXISTS idx_executions_order
        ON executions (order_id)"#,
];

/// Database connection wrapper
pub struct Database {
    pub pool: PgPool,
}

impl Database {
    /// Connect using the configured pool settings.
    pub async fn connect(config: &AppConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            "connecting to {}:{}/{} (pool max={}, min={})",
            config.db_host,
            config.db_port,
            config.db_name,
            config.db_max_connections,
            config.db_min_connections
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.db_max_connections)
            .min_connections(config.db_min_connections)
            .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
            .test_before_acquire(true)
            .connect(&config.database_url())
            .await?;

        Ok(Self { pool })
    }

    /// Create the schema when it does not exist yet.
    pub async fn init_schema(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn health_check(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }
}
