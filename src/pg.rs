//! Postgres gateway over a small sqlx admin pool.

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Row};

use crate::db::ConnectionParams;
use crate::error::{Error, Result};
use crate::gateway::{Connector, Gateway};
use crate::naming::quote_identifier;

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::gateway_from(err)
    }
}

/// [`Gateway`] implementation backed by a Postgres admin connection pool.
///
/// DDL statements interpolate quoted identifiers (Postgres does not accept
/// bind parameters in `CREATE`/`DROP DATABASE`); catalog queries bind
/// normally.
#[derive(Debug, Clone)]
pub struct PgGateway {
    pool: PgPool,
}

impl PgGateway {
    /// Wrap an existing admin pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Gateway for PgGateway {
    async fn create_database(&self, name: &str, owner: &str, template: &str) -> Result<()> {
        let sql = format!(
            "CREATE DATABASE {} WITH OWNER {} TEMPLATE {}",
            quote_identifier(name),
            quote_identifier(owner),
            quote_identifier(template)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        let sql = format!("DROP DATABASE IF EXISTS {}", quote_identifier(name));
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM pg_database WHERE datname = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn list_databases(&self, prefix: &str) -> Result<Vec<String>> {
        // Escape LIKE wildcards so underscores in the prefix match literally.
        let pattern = format!("{}%", prefix.replace('\\', "\\\\").replace('_', "\\_"));
        let rows = sqlx::query("SELECT datname FROM pg_database WHERE datname LIKE $1")
            .bind(pattern)
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>(0).map_err(Error::from))
            .collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}

/// Opens [`PgGateway`]s from connection parameters.
#[derive(Debug, Clone)]
pub struct PgConnector {
    max_connections: u32,
}

impl PgConnector {
    /// Connector with a custom admin-pool connection cap.
    pub fn new(max_connections: u32) -> Self {
        Self { max_connections }
    }
}

impl Default for PgConnector {
    fn default() -> Self {
        // The manager issues short catalog queries and serialized DDL; a
        // handful of connections is plenty.
        Self::new(4)
    }
}

#[async_trait]
impl Connector for PgConnector {
    type Gateway = PgGateway;

    async fn open(&self, params: &ConnectionParams) -> Result<PgGateway> {
        let options = PgConnectOptions::new()
            .host(&params.host)
            .port(params.port)
            .username(&params.username)
            .password(params.password.expose())
            .database(&params.database);
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .connect_with(options)
            .await?;
        Ok(PgGateway::new(pool))
    }
}
