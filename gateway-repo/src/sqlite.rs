//! SQLite repository adapter.
#![allow(clippy::collapsible_if)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool};
use std::str::FromStr;

use gateway_types::{
    AccountBalance, AccountId, Currency, IdempotencyRecord, IdempotencyStore, LedgerEntry,
    LedgerReader, LedgerStore, OutboxMessage, OutboxMessageId, OutboxStore, RepoError,
    ReserveOutcome, Transaction, TransactionId, TransactionReader, TransactionStore,
    TransactionWrite, UnitOfWork, domain::ensure_balanced,
};

use crate::types::sqlite_rows::{
    DbAccountBalance, DbIdempotencyRecord, DbLedgerEntry, DbOutboxMessage, DbTransaction,
};
use crate::types::{DbBalance, balance_deltas, format_timestamp, map_write_error};

const TRANSACTION_COLUMNS: &str = "id, idempotency_key, amount, currency, source_account, destination_account, status, version, external_reference, failure_reason, created_at, updated_at";
const LEDGER_COLUMNS: &str =
    "sequence, id, transaction_id, account_id, direction, amount, currency, created_at";
const OUTBOX_COLUMNS: &str = "id, transaction_id, intent, sequence, payload, status, attempts, last_error, created_at, next_attempt_at, published_at, consumed_at";
const IDEMPOTENCY_COLUMNS: &str =
    "idempotency_key, fingerprint, transaction_id, locked_until, expires_at, created_at";

// ─────────────────────────────────────────────────────────────────────────────
// SQLite Repository
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite repository implementation.
///
/// SQLite has a single writer, so the pool holds one connection and every
/// unit of work runs on it in turn.
#[derive(Clone)]
pub struct SqliteRepo {
    pool: SqlitePool,
}

impl SqliteRepo {
    /// Creates a new SQLite repository with automatic migration.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        // Ensure on-disk SQLite target directory exists (no-op for in-memory).
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.split('?').next().unwrap_or(path);
            if path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    if !parent.as_os_str().is_empty() {
                        tokio::fs::create_dir_all(parent).await?;
                    }
                }
            }
        }

        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // An in-memory database lives only as long as its connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let repo = Self { pool };
        repo.create_schema().await?;
        Ok(repo)
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Creates the database schema (idempotent).
    pub async fn create_schema(&self) -> Result<(), RepoError> {
        let ddl = include_str!("../migrations/0001_create_tables.sql");
        sqlx::query(ddl)
            .execute(&self.pool)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))?;
        Ok(())
    }
}

/// Appends a balanced batch inside an open database transaction and folds it
/// into the running balances.
async fn append_in(
    db_tx: &mut sqlx::Transaction<'_, Sqlite>,
    entries: Vec<LedgerEntry>,
) -> Result<Vec<LedgerEntry>, RepoError> {
    let mut stored = Vec::with_capacity(entries.len());
    for mut entry in entries {
        let sequence: i64 = sqlx::query_scalar(
            r#"INSERT INTO ledger_entries (id, transaction_id, account_id, direction, amount, currency, created_at)
               VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING sequence"#,
        )
        .bind(entry.id.to_string())
        .bind(entry.transaction_id.to_string())
        .bind(entry.account_id.expose())
        .bind(entry.direction.as_str())
        .bind(entry.amount.amount())
        .bind(entry.amount.currency().as_str())
        .bind(format_timestamp(entry.created_at))
        .fetch_one(&mut **db_tx)
        .await
        .map_err(map_write_error)?;
        entry.sequence = Some(sequence);
        stored.push(entry);
    }

    for ((account, currency), (delta, last_sequence)) in balance_deltas(&stored) {
        sqlx::query(
            r#"INSERT INTO account_balances (account_id, currency, balance, last_sequence)
               VALUES (?, ?, ?, ?)
               ON CONFLICT (account_id, currency) DO UPDATE
               SET balance = account_balances.balance + excluded.balance,
                   last_sequence = excluded.last_sequence"#,
        )
        .bind(&account)
        .bind(&currency)
        .bind(delta)
        .bind(last_sequence)
        .execute(&mut **db_tx)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;
    }

    Ok(stored)
}

// ─────────────────────────────────────────────────────────────────────────────
// Transactions
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl TransactionReader for SqliteRepo {
    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, RepoError> {
        let row: Option<DbTransaction> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        row.map(DbTransaction::into_domain).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>, RepoError> {
        let row: Option<DbTransaction> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE idempotency_key = ?"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        row.map(DbTransaction::into_domain).transpose()
    }

    async fn list_stale_transactions(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, RepoError> {
        let rows: Vec<DbTransaction> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions
             WHERE status IN ('pending', 'authorized', 'captured') AND updated_at < ?
             ORDER BY updated_at ASC LIMIT ?"
        ))
        .bind(format_timestamp(updated_before))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        rows.into_iter().map(DbTransaction::into_domain).collect()
    }
}

#[async_trait]
impl TransactionStore for SqliteRepo {
    async fn commit(&self, unit: UnitOfWork) -> Result<Transaction, RepoError> {
        if !unit.ledger_entries.is_empty() {
            ensure_balanced(&unit.ledger_entries)?;
        }

        let mut db_tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepoError::Transaction(e.to_string()))?;

        let stored = match unit.write {
            TransactionWrite::Insert(tx) => {
                sqlx::query(
                    r#"INSERT INTO transactions (id, idempotency_key, amount, currency, source_account, destination_account, status, version, external_reference, failure_reason, created_at, updated_at)
                       VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
                )
                .bind(tx.id.to_string())
                .bind(&tx.idempotency_key)
                .bind(tx.amount.amount())
                .bind(tx.amount.currency().as_str())
                .bind(tx.source_account.expose())
                .bind(tx.destination_account.expose())
                .bind(tx.status.as_str())
                .bind(tx.version)
                .bind(&tx.external_reference)
                .bind(&tx.failure_reason)
                .bind(format_timestamp(tx.created_at))
                .bind(format_timestamp(tx.updated_at))
                .execute(&mut *db_tx)
                .await
                .map_err(map_write_error)?;
                tx
            }
            TransactionWrite::Update {
                next,
                expected_version,
            } => {
                let result = sqlx::query(
                    r#"UPDATE transactions
                       SET status = ?, version = ?, external_reference = ?, failure_reason = ?, updated_at = ?
                       WHERE id = ? AND version = ?"#,
                )
                .bind(next.status.as_str())
                .bind(next.version)
                .bind(&next.external_reference)
                .bind(&next.failure_reason)
                .bind(format_timestamp(next.updated_at))
                .bind(next.id.to_string())
                .bind(expected_version)
                .execute(&mut *db_tx)
                .await
                .map_err(|e| RepoError::Database(e.to_string()))?;

                if result.rows_affected() == 0 {
                    let exists: Option<i64> =
                        sqlx::query_scalar(r#"SELECT version FROM transactions WHERE id = ?"#)
                            .bind(next.id.to_string())
                            .fetch_optional(&mut *db_tx)
                            .await
                            .map_err(|e| RepoError::Database(e.to_string()))?;
                    return Err(match exists {
                        Some(_) => RepoError::VersionConflict {
                            transaction_id: next.id,
                            expected: expected_version,
                        },
                        None => RepoError::NotFound,
                    });
                }
                next
            }
        };

        if !unit.ledger_entries.is_empty() {
            append_in(&mut db_tx, unit.ledger_entries).await?;
        }

        if let Some(message) = unit.outbox {
            sqlx::query(
                r#"INSERT INTO outbox_messages (id, transaction_id, intent, sequence, payload, status, attempts, last_error, created_at, next_attempt_at)
                   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
            )
            .bind(message.id.to_string())
            .bind(message.transaction_id.to_string())
            .bind(message.intent.as_str())
            .bind(message.sequence)
            .bind(message.payload.to_string())
            .bind(message.status.to_string())
            .bind(message.attempts)
            .bind(&message.last_error)
            .bind(format_timestamp(message.created_at))
            .bind(format_timestamp(message.next_attempt_at))
            .execute(&mut *db_tx)
            .await
            .map_err(map_write_error)?;
        }

        if let Some(message_id) = unit.consumes {
            sqlx::query(
                r#"UPDATE outbox_messages SET status = 'consumed', consumed_at = ?
                   WHERE id = ? AND status != 'consumed'"#,
            )
            .bind(format_timestamp(stored.updated_at))
            .bind(message_id.to_string())
            .execute(&mut *db_tx)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))?;
        }

        if let Some(key) = unit.resolves_idempotency {
            sqlx::query(
                r#"UPDATE idempotency_records SET transaction_id = ? WHERE idempotency_key = ?"#,
            )
            .bind(stored.id.to_string())
            .bind(&key)
            .execute(&mut *db_tx)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))?;
        }

        db_tx
            .commit()
            .await
            .map_err(|e| RepoError::Transaction(e.to_string()))?;

        Ok(stored)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Ledger
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl LedgerReader for SqliteRepo {
    async fn entries_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, RepoError> {
        let rows: Vec<DbLedgerEntry> = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE transaction_id = ? ORDER BY sequence ASC"
        ))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        rows.into_iter().map(DbLedgerEntry::into_domain).collect()
    }

    async fn entries_for_account(
        &self,
        account: &AccountId,
        currency: Currency,
    ) -> Result<Vec<LedgerEntry>, RepoError> {
        let rows: Vec<DbLedgerEntry> = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries
             WHERE account_id = ? AND currency = ? ORDER BY sequence ASC"
        ))
        .bind(account.expose())
        .bind(currency.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        rows.into_iter().map(DbLedgerEntry::into_domain).collect()
    }

    async fn account_balance(
        &self,
        account: &AccountId,
        currency: Currency,
    ) -> Result<i64, RepoError> {
        let row: Option<DbBalance> = sqlx::query_as(
            r#"SELECT balance FROM account_balances WHERE account_id = ? AND currency = ?"#,
        )
        .bind(account.expose())
        .bind(currency.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        Ok(row.map(|r| r.balance).unwrap_or(0))
    }

    async fn list_account_balances(&self) -> Result<Vec<AccountBalance>, RepoError> {
        let rows: Vec<DbAccountBalance> = sqlx::query_as(
            r#"SELECT account_id, currency, balance, last_sequence FROM account_balances
               ORDER BY account_id, currency"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        rows.into_iter().map(DbAccountBalance::into_domain).collect()
    }
}

#[async_trait]
impl LedgerStore for SqliteRepo {
    async fn append_entries(
        &self,
        entries: Vec<LedgerEntry>,
    ) -> Result<Vec<LedgerEntry>, RepoError> {
        ensure_balanced(&entries)?;

        let mut db_tx = self
            .pool
            .begin()
            .await
            .map_err(|e| RepoError::Transaction(e.to_string()))?;

        let stored = append_in(&mut db_tx, entries).await?;

        db_tx
            .commit()
            .await
            .map_err(|e| RepoError::Transaction(e.to_string()))?;

        Ok(stored)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbox
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl OutboxStore for SqliteRepo {
    async fn claim_due_messages(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, RepoError> {
        // The single pooled connection serializes claimers, so a plain
        // UPDATE ... RETURNING is enough to lease rows exclusively.
        let rows: Vec<DbOutboxMessage> = sqlx::query_as(&format!(
            "UPDATE outbox_messages SET next_attempt_at = ?
             WHERE id IN (
                 SELECT id FROM outbox_messages
                 WHERE status IN ('pending', 'published') AND next_attempt_at <= ?
                 ORDER BY created_at ASC, sequence ASC
                 LIMIT ?
             )
             RETURNING {OUTBOX_COLUMNS}"
        ))
        .bind(format_timestamp(lease_until))
        .bind(format_timestamp(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        let mut messages = rows
            .into_iter()
            .map(DbOutboxMessage::into_domain)
            .collect::<Result<Vec<_>, _>>()?;
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.sequence.cmp(&b.sequence))
        });
        Ok(messages)
    }

    async fn mark_published(
        &self,
        id: OutboxMessageId,
        at: DateTime<Utc>,
        redeliver_at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"UPDATE outbox_messages
               SET status = 'published', published_at = ?, next_attempt_at = ?,
                   attempts = attempts + 1, last_error = NULL
               WHERE id = ? AND status IN ('pending', 'published')"#,
        )
        .bind(format_timestamp(at))
        .bind(format_timestamp(redeliver_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;
        Ok(())
    }

    async fn record_publish_failure(
        &self,
        id: OutboxMessageId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        sqlx::query(
            r#"UPDATE outbox_messages
               SET attempts = attempts + 1, last_error = ?, next_attempt_at = ?
               WHERE id = ? AND status IN ('pending', 'published')"#,
        )
        .bind(error)
        .bind(format_timestamp(next_attempt_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_outbox_message(
        &self,
        id: OutboxMessageId,
    ) -> Result<Option<OutboxMessage>, RepoError> {
        let row: Option<DbOutboxMessage> = sqlx::query_as(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        row.map(DbOutboxMessage::into_domain).transpose()
    }

    async fn mark_consumed(
        &self,
        id: OutboxMessageId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let result = sqlx::query(
            r#"UPDATE outbox_messages SET status = 'consumed', consumed_at = ?
               WHERE id = ? AND status != 'consumed'"#,
        )
        .bind(format_timestamp(at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_outbox_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<OutboxMessage>, RepoError> {
        let rows: Vec<DbOutboxMessage> = sqlx::query_as(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE transaction_id = ? ORDER BY sequence ASC"
        ))
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        rows.into_iter().map(DbOutboxMessage::into_domain).collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Idempotency records
// ─────────────────────────────────────────────────────────────────────────────

#[async_trait]
impl IdempotencyStore for SqliteRepo {
    async fn reserve_key(&self, record: &IdempotencyRecord) -> Result<ReserveOutcome, RepoError> {
        let result = sqlx::query(
            r#"INSERT INTO idempotency_records (idempotency_key, fingerprint, transaction_id, locked_until, expires_at, created_at)
               VALUES (?, ?, NULL, ?, ?, ?)
               ON CONFLICT (idempotency_key) DO NOTHING"#,
        )
        .bind(&record.key)
        .bind(record.fingerprint.as_str())
        .bind(format_timestamp(record.locked_until))
        .bind(format_timestamp(record.expires_at))
        .bind(format_timestamp(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        if result.rows_affected() == 1 {
            return Ok(ReserveOutcome::Reserved);
        }

        match self.get_idempotency_record(&record.key).await? {
            Some(existing) => Ok(ReserveOutcome::Existing(existing)),
            None => Err(RepoError::Transaction(
                "Idempotency record removed during reservation".into(),
            )),
        }
    }

    async fn get_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, RepoError> {
        let row: Option<DbIdempotencyRecord> = sqlx::query_as(&format!(
            "SELECT {IDEMPOTENCY_COLUMNS} FROM idempotency_records WHERE idempotency_key = ?"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        row.map(DbIdempotencyRecord::into_domain).transpose()
    }

    async fn take_over_key(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let now = format_timestamp(now);
        let result = sqlx::query(
            r#"UPDATE idempotency_records
               SET fingerprint = ?, transaction_id = NULL, locked_until = ?, expires_at = ?, created_at = ?
               WHERE idempotency_key = ?
                 AND ((transaction_id IS NULL AND locked_until <= ?) OR expires_at <= ?)"#,
        )
        .bind(record.fingerprint.as_str())
        .bind(format_timestamp(record.locked_until))
        .bind(format_timestamp(record.expires_at))
        .bind(format_timestamp(record.created_at))
        .bind(&record.key)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_key(&self, key: &str) -> Result<(), RepoError> {
        sqlx::query(
            r#"DELETE FROM idempotency_records WHERE idempotency_key = ? AND transaction_id IS NULL"#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;
        Ok(())
    }

    async fn purge_expired_keys(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query(r#"DELETE FROM idempotency_records WHERE expires_at <= ?"#)
            .bind(format_timestamp(now))
            .execute(&self.pool)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
