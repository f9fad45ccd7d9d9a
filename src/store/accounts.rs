use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Row, params};
use serenity::async_trait;
use tracing::debug;

use super::SqliteStore;
use crate::errors::StoreError;
use crate::models::account::{Account, Credential, NewAccount, ProviderKind, RotatedToken};

#[async_trait]
pub trait AccountStore: Send + Sync {
    /// Users owning at least one linked account.
    async fn list_users(&self) -> Result<Vec<String>, StoreError>;
    async fn list_accounts_by_kind(&self, kind: ProviderKind) -> Result<Vec<Account>, StoreError>;
    async fn list_accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>, StoreError>;
    /// Persists a refreshed access token and its expiry.
    async fn update_credentials(&self, account_id: i64, rotated: &RotatedToken) -> Result<(), StoreError>;
    /// Creates the account, or replaces the credential of the existing
    /// (user, kind, address) row. Creates the user row on first link.
    async fn upsert_account(&self, account: NewAccount) -> Result<Account, StoreError>;
    async fn remove_account(
        &self,
        user_id: &str,
        kind: ProviderKind,
        address: &str,
    ) -> Result<bool, StoreError>;
}

const ACCOUNT_COLUMNS: &str =
    "id, user_id, kind, address, access_token, refresh_token, token_expires_at";

fn account_from_row(row: &Row<'_>) -> rusqlite::Result<Account> {
    let kind: String = row.get(2)?;
    let kind = kind.parse::<ProviderKind>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(Account {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind,
        address: row.get(3)?,
        credential: Credential {
            access_token: row.get(4)?,
            refresh_token: row.get(5)?,
            expires_at: row.get::<_, Option<DateTime<Utc>>>(6)?,
        },
    })
}

#[async_trait]
impl AccountStore for SqliteStore {
    async fn list_users(&self) -> Result<Vec<String>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT DISTINCT u.user_id FROM users u
                 JOIN accounts a ON a.user_id = u.user_id
                 ORDER BY u.user_id",
            )?;
            let users = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(users)
        })
        .await
    }

    async fn list_accounts_by_kind(&self, kind: ProviderKind) -> Result<Vec<Account>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM accounts WHERE kind = ?1 ORDER BY id",
                ACCOUNT_COLUMNS
            ))?;
            let accounts = stmt
                .query_map(params![kind.as_str()], account_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(accounts)
        })
        .await
    }

    async fn list_accounts_for_user(&self, user_id: &str) -> Result<Vec<Account>, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM accounts WHERE user_id = ?1 ORDER BY id",
                ACCOUNT_COLUMNS
            ))?;
            let accounts = stmt
                .query_map(params![user_id], account_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(accounts)
        })
        .await
    }

    async fn update_credentials(&self, account_id: i64, rotated: &RotatedToken) -> Result<(), StoreError> {
        let rotated = rotated.clone();
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE accounts SET access_token = ?1, token_expires_at = ?2 WHERE id = ?3",
                params![rotated.access_token, rotated.expires_at, account_id],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("account {}", account_id)));
            }
            debug!(account_id, "stored rotated access token");
            Ok(())
        })
        .await
    }

    async fn upsert_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        self.call(move |conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO users (user_id, created_at) VALUES (?1, ?2)",
                params![account.user_id, now],
            )?;
            // A relink without a refresh token keeps the stored one.
            tx.execute(
                "INSERT INTO accounts
                    (user_id, kind, address, access_token, refresh_token, token_expires_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(user_id, kind, address) DO UPDATE SET
                    access_token = excluded.access_token,
                    refresh_token = COALESCE(excluded.refresh_token, accounts.refresh_token),
                    token_expires_at = excluded.token_expires_at",
                params![
                    account.user_id,
                    account.kind.as_str(),
                    account.address,
                    account.credential.access_token,
                    account.credential.refresh_token,
                    account.credential.expires_at,
                    now
                ],
            )?;
            let stored = tx.query_row(
                &format!(
                    "SELECT {} FROM accounts WHERE user_id = ?1 AND kind = ?2 AND address = ?3",
                    ACCOUNT_COLUMNS
                ),
                params![account.user_id, account.kind.as_str(), account.address],
                account_from_row,
            )?;
            tx.commit()?;
            Ok(stored)
        })
        .await
    }

    async fn remove_account(
        &self,
        user_id: &str,
        kind: ProviderKind,
        address: &str,
    ) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        let address = address.to_string();
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM accounts WHERE user_id = ?1 AND kind = ?2 AND address = ?3",
                params![user_id, kind.as_str(), address],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}

impl SqliteStore {
    pub async fn find_account(&self, account_id: i64) -> Result<Option<Account>, StoreError> {
        self.call(move |conn| {
            let account = conn
                .query_row(
                    &format!("SELECT {} FROM accounts WHERE id = ?1", ACCOUNT_COLUMNS),
                    params![account_id],
                    account_from_row,
                )
                .optional()?;
            Ok(account)
        })
        .await
    }
}
