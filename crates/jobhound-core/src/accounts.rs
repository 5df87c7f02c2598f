use chrono::{DateTime, Utc};
use libsql::{Connection, Row, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::db::{Database, DbError, is_unique_violation, now_rfc3339, parse_rfc3339, to_rfc3339};
use crate::error::ErrorKind;
use crate::gmail::OAuthTokens;
use crate::sync::SyncState;

const ACCOUNT_COLUMNS: &str =
    "id, provider, email, display_name, enabled, config_json, state_json, created_at, updated_at";

/// Provider credentials, tagged by provider so the stored JSON is self-describing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum AccountConfig {
    Gmail {
        client_id: String,
        client_secret: String,
        oauth: OAuthTokens,
    },
    /// Served from memory; used for demos and tests.
    Static,
}

impl AccountConfig {
    pub fn provider(&self) -> &'static str {
        match self {
            AccountConfig::Gmail { .. } => "gmail",
            AccountConfig::Static => "static",
        }
    }
}

/// Sync bookkeeping. Only the sync worker writes `cursor`, and only inside the
/// transaction that commits the batch it covers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct AccountState {
    pub cursor: Option<String>,
    pub last_sync_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sync_state: SyncState,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Account {
    pub id: String,
    pub provider: String,
    pub email: String,
    pub display_name: Option<String>,
    pub enabled: bool,
    #[serde(skip)]
    pub config: AccountConfig,
    pub state: AccountState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("database error: {0}")]
    Database(#[from] DbError),
    #[error("sql error: {0}")]
    Sql(#[from] libsql::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("account not found: {0}")]
    NotFound(String),
    #[error("account already exists for {0}")]
    Duplicate(String),
    #[error("optimistic locking conflict for account {0}")]
    Conflict(String),
    #[error("account {0} still owns messages; disable it instead")]
    HasMessages(String),
}

impl AccountError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AccountError::NotFound(_) => ErrorKind::NotFound,
            AccountError::Duplicate(_) => ErrorKind::Validation,
            AccountError::Conflict(_) | AccountError::HasMessages(_) => ErrorKind::Conflict,
            _ => ErrorKind::Internal,
        }
    }
}

#[derive(Clone)]
pub struct AccountRepository {
    db: Database,
}

impl AccountRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        email: impl Into<String>,
        display_name: Option<String>,
        config: AccountConfig,
    ) -> Result<Account, AccountError> {
        let id = Uuid::new_v4().to_string();
        let email = email.into();
        let config_json = serde_json::to_string(&config)?;
        let state_json = serde_json::to_string(&AccountState::default())?;

        let conn = self.db.connection().await?;
        let result = conn
            .query(
                &format!(
                    "INSERT INTO accounts (id, provider, email, display_name, enabled, config_json, state_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6, ?7, ?7)
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![
                    id.clone(),
                    config.provider(),
                    email.clone(),
                    display_name,
                    config_json,
                    state_json,
                    now_rfc3339()
                ],
            )
            .await;

        let mut rows = match result {
            Ok(rows) => rows,
            Err(err) if is_unique_violation(&err) => return Err(AccountError::Duplicate(email)),
            Err(err) => return Err(err.into()),
        };

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(id)),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = ?1"),
                params![id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    pub async fn list_all(&self) -> Result<Vec<Account>, AccountError> {
        self.list_where("1 = 1").await
    }

    /// Accounts the scheduler should sync, in creation order.
    pub async fn list_enabled(&self) -> Result<Vec<Account>, AccountError> {
        self.list_where("enabled = 1").await
    }

    async fn list_where(&self, predicate: &str) -> Result<Vec<Account>, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE {predicate} ORDER BY created_at, id"
                ),
                (),
            )
            .await?;

        let mut accounts = Vec::new();
        while let Some(row) = rows.next().await? {
            accounts.push(row_to_account(row)?);
        }
        Ok(accounts)
    }

    /// Soft-disable or re-enable an account. Disabled accounts keep their
    /// messages but are skipped by scheduled syncs.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query(
                &format!(
                    "UPDATE accounts SET enabled = ?1, updated_at = ?2 WHERE id = ?3
                     RETURNING {ACCOUNT_COLUMNS}"
                ),
                params![enabled as i64, now_rfc3339(), id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    /// Replaces provider credentials. With `expected_updated_at` the write only
    /// lands if nobody touched the row since it was read.
    pub async fn update_config(
        &self,
        id: &str,
        config: &AccountConfig,
        expected_updated_at: Option<DateTime<Utc>>,
    ) -> Result<Account, AccountError> {
        let config_json = serde_json::to_string(config)?;
        let conn = self.db.connection().await?;

        let mut rows = match expected_updated_at {
            Some(expected) => {
                conn.query(
                    &format!(
                        "UPDATE accounts SET config_json = ?1, updated_at = ?2
                         WHERE id = ?3 AND updated_at = ?4
                         RETURNING {ACCOUNT_COLUMNS}"
                    ),
                    params![config_json, now_rfc3339(), id, to_rfc3339(expected)],
                )
                .await?
            }
            None => {
                conn.query(
                    &format!(
                        "UPDATE accounts SET config_json = ?1, updated_at = ?2
                         WHERE id = ?3
                         RETURNING {ACCOUNT_COLUMNS}"
                    ),
                    params![config_json, now_rfc3339(), id],
                )
                .await?
            }
        };

        match rows.next().await? {
            Some(row) => row_to_account(row),
            None => match expected_updated_at {
                Some(_) if self.exists(id).await? => Err(AccountError::Conflict(id.to_string())),
                _ => Err(AccountError::NotFound(id.to_string())),
            },
        }
    }

    pub async fn update_state(
        &self,
        id: &str,
        state: &AccountState,
    ) -> Result<Account, AccountError> {
        let conn = self.db.connection().await?;
        write_state(&conn, id, state).await?;
        self.get_by_id(id).await
    }

    /// Deletes an account that never received mail. Accounts with messages
    /// must be disabled instead.
    pub async fn delete(&self, id: &str) -> Result<(), AccountError> {
        let conn = self.db.connection().await?;
        let mut owned = conn
            .query(
                "SELECT 1 FROM messages WHERE account_id = ?1 LIMIT 1",
                params![id],
            )
            .await?;
        if owned.next().await?.is_some() {
            return Err(AccountError::HasMessages(id.to_string()));
        }

        let mut rows = conn
            .query("DELETE FROM accounts WHERE id = ?1 RETURNING id", params![id])
            .await?;
        match rows.next().await? {
            Some(_) => Ok(()),
            None => Err(AccountError::NotFound(id.to_string())),
        }
    }

    async fn exists(&self, id: &str) -> Result<bool, AccountError> {
        let conn = self.db.connection().await?;
        let mut rows = conn
            .query("SELECT 1 FROM accounts WHERE id = ?1", params![id])
            .await?;
        Ok(rows.next().await?.is_some())
    }
}

/// Writes sync state through an existing connection so the sync worker can
/// advance the cursor inside its batch transaction.
pub(crate) async fn write_state(
    conn: &Connection,
    id: &str,
    state: &AccountState,
) -> Result<(), AccountError> {
    let state_json = serde_json::to_string(state)?;
    let changed = conn
        .execute(
            "UPDATE accounts SET state_json = ?1, updated_at = ?2 WHERE id = ?3",
            params![state_json, now_rfc3339(), id],
        )
        .await?;
    if changed == 0 {
        return Err(AccountError::NotFound(id.to_string()));
    }
    Ok(())
}

fn row_to_account(row: Row) -> Result<Account, AccountError> {
    let enabled: i64 = row.get(4)?;
    let config_json: String = row.get(5)?;
    let state_json: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;

    Ok(Account {
        id: row.get(0)?,
        provider: row.get(1)?,
        email: row.get(2)?,
        display_name: row.get(3)?,
        enabled: enabled != 0,
        config: serde_json::from_str(&config_json)?,
        state: serde_json::from_str(&state_json)?,
        created_at: parse_rfc3339(&created_at)?,
        updated_at: parse_rfc3339(&updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::run_migrations;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn setup_repo() -> (AccountRepository, Database, TempDir) {
        let dir = TempDir::new().expect("temp dir");
        let db = Database::new(&dir.path().join("db.sqlite"))
            .await
            .expect("create db");
        run_migrations(&db).await.expect("migrations");
        (AccountRepository::new(db.clone()), db, dir)
    }

    fn gmail_config() -> AccountConfig {
        AccountConfig::Gmail {
            client_id: "client".into(),
            client_secret: "secret".into(),
            oauth: OAuthTokens {
                access_token: "access".into(),
                refresh_token: "refresh".into(),
                expires_at: Utc::now() + Duration::hours(1),
            },
        }
    }

    #[tokio::test]
    async fn create_and_lookup_account() {
        let (repo, _db, _dir) = setup_repo().await;
        let account = repo
            .create("me@example.com", Some("Me".into()), gmail_config())
            .await
            .expect("create account");

        assert_eq!(account.provider, "gmail");
        assert!(account.enabled);
        assert!(account.state.cursor.is_none());
        assert_eq!(account.state.sync_state, SyncState::Idle);

        let loaded = repo.get_by_id(&account.id).await.expect("get");
        assert_eq!(loaded, account);

        let err = repo
            .create("me@example.com", None, AccountConfig::Static)
            .await
            .expect_err("duplicate email");
        assert!(matches!(err, AccountError::Duplicate(_)));
    }

    #[tokio::test]
    async fn disabled_accounts_are_not_listed_for_sync() {
        let (repo, _db, _dir) = setup_repo().await;
        let first = repo
            .create("a@example.com", None, AccountConfig::Static)
            .await
            .expect("create");
        let second = repo
            .create("b@example.com", None, AccountConfig::Static)
            .await
            .expect("create");

        repo.set_enabled(&first.id, false).await.expect("disable");

        let enabled: Vec<String> = repo
            .list_enabled()
            .await
            .expect("list")
            .into_iter()
            .map(|a| a.id)
            .collect();
        assert_eq!(enabled, vec![second.id]);
        assert_eq!(repo.list_all().await.expect("list all").len(), 2);
    }

    #[tokio::test]
    async fn stale_config_update_conflicts() {
        let (repo, _db, _dir) = setup_repo().await;
        let account = repo
            .create("me@example.com", None, gmail_config())
            .await
            .expect("create");

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        repo.update_config(&account.id, &gmail_config(), None)
            .await
            .expect("unconditional update");

        let err = repo
            .update_config(&account.id, &gmail_config(), Some(account.updated_at))
            .await
            .expect_err("stale write");
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err = repo
            .update_config("missing", &gmail_config(), Some(account.updated_at))
            .await
            .expect_err("missing account");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn state_round_trips_through_json() {
        let (repo, _db, _dir) = setup_repo().await;
        let account = repo
            .create("me@example.com", None, AccountConfig::Static)
            .await
            .expect("create");

        let state = AccountState {
            cursor: Some("2026-01-02T03:04:05.000Z".into()),
            last_sync_at: Some(Utc::now()),
            sync_state: SyncState::Error,
            last_error: Some("provider unavailable".into()),
        };
        let updated = repo.update_state(&account.id, &state).await.expect("update");
        assert_eq!(updated.state.cursor, state.cursor);
        assert_eq!(updated.state.sync_state, SyncState::Error);
    }

    #[tokio::test]
    async fn accounts_with_messages_cannot_be_deleted() {
        let (repo, db, _dir) = setup_repo().await;
        let account = repo
            .create("me@example.com", None, AccountConfig::Static)
            .await
            .expect("create");
        let conn = db.connection().await.expect("conn");
        conn.execute(
            "INSERT INTO messages (id, account_id, remote_id, received_at, created_at, updated_at)
             VALUES ('m1', ?1, 'r1', '2026-01-01T00:00:00.000Z', '2026-01-01T00:00:00.000Z', '2026-01-01T00:00:00.000Z')",
            params![account.id.clone()],
        )
        .await
        .expect("insert message");

        let err = repo.delete(&account.id).await.expect_err("has messages");
        assert!(matches!(err, AccountError::HasMessages(_)));

        let empty = repo
            .create("empty@example.com", None, AccountConfig::Static)
            .await
            .expect("create");
        repo.delete(&empty.id).await.expect("delete empty account");
        assert_eq!(
            repo.get_by_id(&empty.id).await.expect_err("gone").kind(),
            ErrorKind::NotFound
        );
    }
}
