use std::{env, path::Path, sync::Arc};

use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Builder, Connection, Database as LibSqlDatabase};
use thiserror::Error;

/// Cloneable handle to the jobhound store. Every repository holds one.
#[derive(Clone)]
pub struct Database {
    inner: Arc<LibSqlDatabase>,
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("failed to build database: {0}")]
    Build(libsql::Error),
    #[error("failed to open connection: {0}")]
    Connect(libsql::Error),
    #[error("failed to execute statement: {0}")]
    Statement(libsql::Error),
    #[error("missing required LIBSQL_AUTH_TOKEN for remote database")]
    MissingAuthToken,
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self, DbError> {
        let location = database_path.to_string_lossy().to_string();
        let remote = is_remote(&location);
        let built = if remote {
            let auth_token = env::var("LIBSQL_AUTH_TOKEN")
                .ok()
                .filter(|token| !token.is_empty())
                .ok_or(DbError::MissingAuthToken)?;
            Builder::new_remote(location, auth_token).build().await
        } else {
            Builder::new_local(location).build().await
        };
        let db = Self {
            inner: Arc::new(built.map_err(DbError::Build)?),
        };

        if !remote {
            // Readers keep working while a sync batch holds the write lock.
            let conn = db.inner.connect().map_err(DbError::Connect)?;
            conn.query("PRAGMA journal_mode = WAL", ())
                .await
                .map_err(DbError::Statement)?;
        }
        Ok(db)
    }

    /// Opens a connection with foreign keys on and a 5s busy timeout. Local
/// files run in WAL mode, set once in [`Database::new`].
    pub async fn connection(&self) -> Result<Connection, DbError> {
        let conn = self.inner.connect().map_err(DbError::Connect)?;
        conn.execute("PRAGMA foreign_keys = ON", ())
            .await
            .map_err(DbError::Statement)?;
        // The pragma echoes the new value back as a row.
        conn.query("PRAGMA busy_timeout = 5000", ())
            .await
            .map_err(DbError::Statement)?;
        Ok(conn)
    }

    pub async fn health_check(&self) -> Result<(), DbError> {
        let conn = self.connection().await?;
        let mut rows = conn
            .query("SELECT 1", ())
            .await
            .map_err(DbError::Statement)?;
        let _ = rows.next().await.map_err(DbError::Statement)?;
        Ok(())
    }
}

fn is_remote(path: &str) -> bool {
    path.starts_with("libsql://") || path.starts_with("http://") || path.starts_with("https://")
}

pub(crate) fn now_rfc3339() -> String {
    to_rfc3339(Utc::now())
}

/// Millisecond precision keeps lexical and chronological order identical.
pub(crate) fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_rfc3339(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

pub(crate) fn is_unique_violation(err: &libsql::Error) -> bool {
    err.to_string()
        .to_ascii_lowercase()
        .contains("unique constraint failed")
}
