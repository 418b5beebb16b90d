use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use shared::domain::TokenPair;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use tokio::sync::RwLock;
use tracing::warn;
use zeroize::Zeroize;

pub const ACCESS_TOKEN_KEY: &str = "auth.access_token";
pub const REFRESH_TOKEN_KEY: &str = "auth.refresh_token";

/// Durable home of the token pair. Implementations must write both halves
/// as one unit: a reader never observes a pair with only one token updated.
#[async_trait]
pub trait CredentialBackend: Send + Sync {
    async fn load(&self) -> Result<Option<TokenPair>>;
    async fn store(&self, pair: &TokenPair) -> Result<()>;
    async fn erase(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteCredentialStore {
    pool: Pool<Sqlite>,
}

impl SqliteCredentialStore {
    pub async fn open(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("invalid credentials database url '{database_url}'"))?
            .create_if_missing(true);
        // A single long-lived connection keeps `sqlite::memory:` databases
        // alive and serializes writers.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open credentials database '{database_url}'"))?;

        let store = Self { pool };
        store.ensure_credentials_table().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_credentials_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS credentials (
                key        TEXT PRIMARY KEY NOT NULL,
                value      TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure credentials table exists")?;
        Ok(())
    }
}

#[async_trait]
impl CredentialBackend for SqliteCredentialStore {
    async fn load(&self) -> Result<Option<TokenPair>> {
        let rows = sqlx::query("SELECT key, value FROM credentials WHERE key IN (?, ?)")
            .bind(ACCESS_TOKEN_KEY)
            .bind(REFRESH_TOKEN_KEY)
            .fetch_all(&self.pool)
            .await
            .context("failed to read credentials")?;

        let mut access_token = None;
        let mut refresh_token = None;
        for row in rows {
            let key: String = row.try_get("key")?;
            let value: String = row.try_get("value")?;
            match key.as_str() {
                ACCESS_TOKEN_KEY => access_token = Some(value),
                REFRESH_TOKEN_KEY => refresh_token = Some(value),
                _ => {}
            }
        }

        match (access_token, refresh_token) {
            (Some(access), Some(refresh)) => Ok(Some(TokenPair::new(access, refresh))),
            (None, None) => Ok(None),
            _ => {
                warn!("credentials: found a partial token pair, treating it as absent");
                Ok(None)
            }
        }
    }

    async fn store(&self, pair: &TokenPair) -> Result<()> {
        let updated_at = Utc::now().to_rfc3339();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin credentials transaction")?;
        for (key, value) in [
            (ACCESS_TOKEN_KEY, pair.access_token.as_str()),
            (REFRESH_TOKEN_KEY, pair.refresh_token.as_str()),
        ] {
            sqlx::query(
                "INSERT INTO credentials (key, value, updated_at) VALUES (?, ?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            )
            .bind(key)
            .bind(value)
            .bind(&updated_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to write credential '{key}'"))?;
        }
        tx.commit()
            .await
            .context("failed to commit credentials transaction")?;
        Ok(())
    }

    async fn erase(&self) -> Result<()> {
        sqlx::query("DELETE FROM credentials WHERE key IN (?, ?)")
            .bind(ACCESS_TOKEN_KEY)
            .bind(REFRESH_TOKEN_KEY)
            .execute(&self.pool)
            .await
            .context("failed to erase credentials")?;
        Ok(())
    }
}

/// Process-local backend; tokens are wiped from memory when replaced or
/// erased.
#[derive(Default)]
pub struct MemoryCredentialStore {
    slot: RwLock<Option<TokenPair>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: TokenPair) -> Self {
        Self {
            slot: RwLock::new(Some(pair)),
        }
    }
}

fn wipe(pair: Option<TokenPair>) {
    if let Some(mut pair) = pair {
        pair.access_token.zeroize();
        pair.refresh_token.zeroize();
    }
}

#[async_trait]
impl CredentialBackend for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<TokenPair>> {
        Ok(self.slot.read().await.clone())
    }

    async fn store(&self, pair: &TokenPair) -> Result<()> {
        let previous = self.slot.write().await.replace(pair.clone());
        wipe(previous);
        Ok(())
    }

    async fn erase(&self) -> Result<()> {
        let previous = self.slot.write().await.take();
        wipe(previous);
        Ok(())
    }
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
