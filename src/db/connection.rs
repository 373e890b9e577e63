//! Database connection management using sqlx

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions, PgSslMode};
use sqlx::Executor;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use crate::error::{PipelineError, Result};

pub type DbPool = PgPool;

/// Connection settings for the relational backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub host: String,
    pub port: u16,
    pub database: String,
    /// Applied as `search_path` on every pooled connection.
    #[serde(default)]
    pub schema: Option<String>,
    #[serde(default)]
    pub enable_ssl: bool,
    /// A full connection URL; takes precedence over the individual fields.
    #[serde(default, skip_serializing)]
    pub url: Option<String>,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            username: "postgres".to_string(),
            password: String::new(),
            host: "localhost".to_string(),
            port: 5432,
            database: "postgres".to_string(),
            schema: None,
            enable_ssl: false,
            url: None,
        }
    }
}

impl PostgresConfig {
    /// Read `DATABASE_URL` or the libpq `PG*` variables, plus `PGSCHEMA` and `PGSSL`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let port = match std::env::var("PGPORT") {
            Ok(raw) => raw
                .parse()
                .map_err(|_| PipelineError::Config(format!("PGPORT has an invalid value: {}", raw)))?,
            Err(_) => defaults.port,
        };
        let enable_ssl = std::env::var("PGSSL")
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "require"))
            .unwrap_or(false);

        Ok(Self {
            username: std::env::var("PGUSER").unwrap_or(defaults.username),
            password: std::env::var("PGPASSWORD").unwrap_or(defaults.password),
            host: std::env::var("PGHOST").unwrap_or(defaults.host),
            port,
            database: std::env::var("PGDATABASE").unwrap_or(defaults.database),
            schema: std::env::var("PGSCHEMA").ok().filter(|s| !s.is_empty()),
            enable_ssl,
            url: std::env::var("DATABASE_URL").ok().filter(|s| !s.is_empty()),
        })
    }

    pub fn connect_options(&self) -> Result<PgConnectOptions> {
        let options = match &self.url {
            Some(url) => PgConnectOptions::from_str(url)
                .map_err(|e| PipelineError::Config(format!("Invalid DATABASE_URL: {}", e)))?,
            None => PgConnectOptions::new()
                .host(&self.host)
                .port(self.port)
                .username(&self.username)
                .password(&self.password)
                .database(&self.database),
        };

        let ssl_mode = if self.enable_ssl {
            PgSslMode::Require
        } else {
            PgSslMode::Prefer
        };
        Ok(options.ssl_mode(ssl_mode))
    }
}

/// Quote an identifier for use in a statement.
fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Initialize the database connection pool
pub async fn init_pool(config: &PostgresConfig) -> Result<PgPool> {
    let mut options = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(30));

    if let Some(schema) = &config.schema {
        let statement = format!("SET search_path TO {}", quote_ident(schema));
        options = options.after_connect(move |conn, _meta| {
            let statement = statement.clone();
            Box::pin(async move {
                conn.execute(statement.as_str()).await?;
                Ok(())
            })
        });
    }

    let pool = options.connect_with(config.connect_options()?).await?;

    // Test the connection
    sqlx::query("SELECT 1").execute(&pool).await?;

    info!("Connected to Postgres database {}", config.database);
    Ok(pool)
}
