use chrono::{DateTime, Utc};
use libsql::{Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339};
use crate::error::ErrorKind;

const COMPANY_COLUMNS: &str = "id, name, created_at";

/// A tracked employer. Only what classification and reminders need lives here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum CompanyError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("company not found: {0}")]
    NotFound(String),
    #[error("invalid company: {0}")]
    Invalid(String),
}

impl CompanyError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompanyError::NotFound(_) => ErrorKind::NotFound,
            CompanyError::Invalid(_) => ErrorKind::Validation,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Clone)]
pub struct CompanyRepository {
    db: Database,
}

impl CompanyRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, name: impl Into<String>) -> Result<Company, CompanyError> {
        self.create_with_id(Uuid::new_v4().to_string(), name).await
    }

    /// Ids order companies during classification, so callers that care about
    /// precedence may choose them.
    pub async fn create_with_id(
        &self,
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Company, CompanyError> {
        let id = id.into();
        let name = name.into();
        if id.trim().is_empty() || name.trim().is_empty() {
            return Err(CompanyError::Invalid("id and name are required".into()));
        }

        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO companies (id, name, created_at) VALUES (?1, ?2, ?3)
                     RETURNING {COMPANY_COLUMNS}"
                ),
                params![id.clone(), name, now_rfc3339()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_company(row),
            None => Err(CompanyError::NotFound(id)),
        }
    }

    pub async fn get(&self, id: &str) -> Result<Company, CompanyError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {COMPANY_COLUMNS} FROM companies WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_company(row),
            None => Err(CompanyError::NotFound(id.to_string())),
        }
    }

    pub async fn exists(&self, id: &str) -> Result<bool, CompanyError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query("SELECT 1 FROM companies WHERE id = ?1", params![id])
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// All companies by id ascending, the order classification walks them in.
    pub async fn list(&self) -> Result<Vec<Company>, CompanyError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {COMPANY_COLUMNS} FROM companies ORDER BY id"),
                (),
            )
            .await?;

        let mut companies = Vec::new();
        while let Some(row) = rows.next().await? {
            companies.push(row_to_company(row)?);
        }
        Ok(companies)
    }
}

fn row_to_company(row: Row) -> Result<Company, CompanyError> {
    let created_at: String = row.get(2)?;
    Ok(Company {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: parse_rfc3339(&created_at)?,
    })
}
