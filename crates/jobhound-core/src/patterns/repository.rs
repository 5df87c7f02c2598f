use libsql::{Row, params};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, now_rfc3339, parse_rfc3339};
use crate::error::ErrorKind;

use super::types::{CompanyPattern, NewCompanyPattern, PatternSet, RuleValidationError};

const PATTERN_COLUMNS: &str = "id, company_id, priority, rules_json, created_at";

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("invalid pattern: {0}")]
    Invalid(#[from] RuleValidationError),
    #[error("company not found: {0}")]
    CompanyNotFound(String),
    #[error("pattern not found: {0}")]
    NotFound(String),
}

impl PatternError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PatternError::Invalid(_) => ErrorKind::Validation,
            PatternError::CompanyNotFound(_) | PatternError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Clone)]
pub struct PatternRepository {
    db: Database,
}

impl PatternRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Validates and stores a pattern. Rule order is persisted exactly as given.
    pub async fn add_pattern(
        &self,
        company_id: &str,
        pattern: NewCompanyPattern,
    ) -> Result<CompanyPattern, PatternError> {
        pattern.validate()?;
        let rules_json = serde_json::to_string(&pattern.rules)?;

        let conn = self.db.connection().await?;
        let mut exists = conn
            .query("SELECT 1 FROM companies WHERE id = ?1", params![company_id])
            .await?;
        if exists.next().await?.is_none() {
            return Err(PatternError::CompanyNotFound(company_id.to_string()));
        }

        let id = Uuid::new_v4().to_string();
        let mut rows = conn
            .query(
                &format!(
                    "INSERT INTO company_patterns (id, company_id, priority, rules_json, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     RETURNING {PATTERN_COLUMNS}"
                ),
                params![id.clone(), company_id, pattern.priority, rules_json, now_rfc3339()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_pattern(row),
            None => Err(PatternError::NotFound(id)),
        }
    }

    pub async fn remove_pattern(&self, id: &str) -> Result<(), PatternError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                "DELETE FROM company_patterns WHERE id = ?1 RETURNING id",
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(PatternError::NotFound(id.to_string())),
        }
    }

    pub async fn get(&self, id: &str) -> Result<CompanyPattern, PatternError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {PATTERN_COLUMNS} FROM company_patterns WHERE id = ?1"),
                params![id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => row_to_pattern(row),
            None => Err(PatternError::NotFound(id.to_string())),
        }
    }

    pub async fn list_for_company(
        &self,
        company_id: &str,
    ) -> Result<Vec<CompanyPattern>, PatternError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {PATTERN_COLUMNS} FROM company_patterns
                     WHERE company_id = ?1
                     ORDER BY priority, created_at, id"
                ),
                params![company_id],
            )
            .await?;

        let mut patterns = Vec::new();
        while let Some(row) = rows.next().await? {
            patterns.push(row_to_pattern(row)?);
        }
        Ok(patterns)
    }

    /// Snapshot of the current patterns of every company.
    pub async fn load_pattern_set(&self) -> Result<PatternSet, PatternError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {PATTERN_COLUMNS} FROM company_patterns
                     ORDER BY company_id, priority, created_at, id"
                ),
                (),
            )
            .await?;

        let mut patterns = Vec::new();
        while let Some(row) = rows.next().await? {
            patterns.push(row_to_pattern(row)?);
        }
        Ok(PatternSet::new(patterns))
    }
}

fn row_to_pattern(row: Row) -> Result<CompanyPattern, PatternError> {
    let rules_json: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(CompanyPattern {
        id: row.get(0)?,
        company_id: row.get(1)?,
        priority: row.get(2)?,
        rules: serde_json::from_str(&rules_json)?,
        created_at: parse_rfc3339(&created_at)?,
    })
}
