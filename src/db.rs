use anyhow::{Context, Result};
use directories::ProjectDirs;
use sqlx::any::{AnyConnectOptions, AnyPoolOptions};
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{AnyPool, ConnectOptions};
use std::str::FromStr;
use std::sync::Once;
use tracing::{debug, warn};

use crate::storage::Storage;

static INSTALL_DRIVERS: Once = Once::new();

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const DB_FILE: &str = "dmcommons.db";

/// SQLite store for the response cache, fetched artifacts, upload jobs and OAuth tokens.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
}

impl Database {
    /// Open `database_url`, or `dmcommons.db` in the user data directory when unset or blank.
    pub async fn connect(database_url: Option<&str>) -> Result<Self> {
        INSTALL_DRIVERS.call_once(sqlx::any::install_default_drivers);

        let url = match database_url.map(str::trim).filter(|u| !u.is_empty()) {
            Some(u) => u.to_string(),
            None => default_sqlite_url()?,
        };
        let opts = AnyConnectOptions::from_str(&url)
            .with_context(|| format!("invalid database URL: {url}"))?
            .disable_statement_logging();
        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .with_context(|| format!("cannot open database {url}"))?;

        debug!(%url, "database open");
        Ok(Self { pool })
    }

    /// Apply the embedded schema. A ledger left behind by an edited migration is
    /// dropped and the (idempotent) migrations are replayed.
    pub async fn run_migrations(&self) -> Result<()> {
        let Err(e) = MIGRATOR.run(&self.pool).await else { return Ok(()) };
        if !is_stale_ledger(&e) {
            return Err(e).context("running migrations");
        }
        warn!(error = %e, "migration ledger out of date; replaying schema");
        sqlx::query("DELETE FROM _sqlx_migrations")
            .execute(&self.pool)
            .await
            .context("clearing migration ledger")?;
        MIGRATOR.run(&self.pool).await.context("replaying migrations")
    }

    pub fn pool(&self) -> &AnyPool { &self.pool }

    /// Drop cached DiMu responses. With a prefix (`dimu|media|`) only matching keys go.
    pub async fn clear_cache_prefix(&self, prefix: Option<&str>) -> Result<u64> {
        let query = match prefix {
            Some(p) => sqlx::query("DELETE FROM http_cache WHERE key LIKE ?").bind(format!("{p}%")),
            None => sqlx::query("DELETE FROM http_cache"),
        };
        Ok(query.execute(&self.pool).await?.rows_affected())
    }

    pub async fn vacuum(&self) -> Result<()> {
        sqlx::query("VACUUM").execute(&self.pool).await.context("vacuum")?;
        Ok(())
    }
}

fn is_stale_ledger(e: &MigrateError) -> bool {
    match e {
        MigrateError::VersionMismatch(_) => true,
        other => other.to_string().contains("UNIQUE constraint failed: _sqlx_migrations.version"),
    }
}

#[async_trait::async_trait]
impl Storage for Database {
    async fn get_cache(&self, key: &str, now: i64) -> Result<Option<String>> {
        Ok(sqlx::query_scalar::<_, String>("SELECT payload FROM http_cache WHERE key = ? AND expires_at > ?")
            .bind(key)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn put_cache(&self, key: &str, payload: &str, expires_at: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO http_cache(key, payload, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET payload = excluded.payload, expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(payload)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Entries whose `expires_at` is at or before `now`; returns how many were removed.
    async fn purge_expired_cache(&self, now: i64) -> Result<u64> {
        Ok(sqlx::query("DELETE FROM http_cache WHERE expires_at <= ?")
            .bind(now)
            .execute(&self.pool)
            .await?
            .rows_affected())
    }
}

fn default_sqlite_url() -> Result<String> {
    let dirs = ProjectDirs::from("org", "dmcommons", "dmcommons").context("no user data directory for the database")?;
    let dir = dirs.data_dir();
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(DB_FILE).to_string_lossy().replace(' ', "%20");
    Ok(format!("sqlite://{path}?mode=rwc"))
}

#[cfg(test)]
pub(crate) async fn temp_database() -> (Database, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
    let db = Database::connect(Some(&url)).await.unwrap();
    db.run_migrations().await.unwrap();
    (db, dir)
}
