use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use serenity::async_trait;

use super::SqliteStore;
use crate::errors::StoreError;
use crate::models::ledger::{LedgerEntry, ReminderKind};

/// Append-only record of delivered reminders.
#[async_trait]
pub trait NotificationLedger: Send + Sync {
    async fn exists(&self, user_id: &str, kind: ReminderKind, dedup_key: &str) -> Result<bool, StoreError>;

    /// Inserts the entry. Returns `StoreError::Conflict` when the same
    /// (user, kind, key) is already present.
    async fn record(
        &self,
        user_id: &str,
        kind: ReminderKind,
        dedup_key: &str,
        scheduled_time: Option<DateTime<Utc>>,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Deletes entries delivered before `cutoff`. Returns the number removed.
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

#[async_trait]
impl NotificationLedger for SqliteStore {
    async fn exists(&self, user_id: &str, kind: ReminderKind, dedup_key: &str) -> Result<bool, StoreError> {
        let user_id = user_id.to_string();
        let dedup_key = dedup_key.to_string();
        self.call(move |conn| {
            let found = conn
                .query_row(
                    "SELECT 1 FROM sent_reminders
                     WHERE user_id = ?1 AND reminder_kind = ?2 AND dedup_key = ?3",
                    params![user_id, kind.as_str(), dedup_key],
                    |_| Ok(()),
                )
                .optional()?;
            Ok(found.is_some())
        })
        .await
    }

    async fn record(
        &self,
        user_id: &str,
        kind: ReminderKind,
        dedup_key: &str,
        scheduled_time: Option<DateTime<Utc>>,
        sent_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let user_id = user_id.to_string();
        let dedup_key = dedup_key.to_string();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT OR IGNORE INTO users (user_id, created_at) VALUES (?1, ?2)",
                params![user_id, sent_at],
            )?;
            tx.execute(
                "INSERT INTO sent_reminders (user_id, reminder_kind, dedup_key, scheduled_time, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![user_id, kind.as_str(), dedup_key, scheduled_time, sent_at],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        self.call(move |conn| {
            let removed = conn.execute("DELETE FROM sent_reminders WHERE sent_at < ?1", params![cutoff])?;
            Ok(removed)
        })
        .await
    }
}

impl SqliteStore {
    /// Ledger rows of one user, newest first.
    pub async fn ledger_entries(&self, user_id: &str) -> Result<Vec<LedgerEntry>, StoreError> {
        let user_id = user_id.to_string();
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT user_id, reminder_kind, dedup_key, scheduled_time, sent_at
                 FROM sent_reminders WHERE user_id = ?1 ORDER BY sent_at DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![user_id], |row| {
                    let kind: String = row.get(1)?;
                    Ok((
                        row.get::<_, String>(0)?,
                        kind,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<DateTime<Utc>>>(3)?,
                        row.get::<_, DateTime<Utc>>(4)?,
                    ))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            let entries = rows
                .into_iter()
                .filter_map(|(user_id, kind, dedup_key, scheduled_time, sent_at)| {
                    let kind = kind.parse::<ReminderKind>().ok()?;
                    Some(LedgerEntry {
                        user_id,
                        kind,
                        dedup_key,
                        scheduled_time,
                        sent_at,
                    })
                })
                .collect();
            Ok(entries)
        })
        .await
    }
}
