//! PostgreSQL repository adapter.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres};

use gateway_types::{
    AccountBalance, AccountId, Currency, IdempotencyRecord, IdempotencyStore, LedgerEntry,
    LedgerReader, LedgerStore, OutboxMessage, OutboxMessageId, OutboxStore, RepoError,
    ReserveOutcome, Transaction, TransactionId, TransactionReader, TransactionStore,
    TransactionWrite, UnitOfWork, domain::ensure_balanced,
};

use crate::types::pg_rows::{
    DbAccountBalance, DbIdempotencyRecord, DbLedgerEntry, DbOutboxMessage, DbTransaction,
};
use crate::types::{DbBalance, balance_deltas, map_write_error};

const TRANSACTION_COLUMNS: &str = "id, idempotency_key, amount, currency, source_account, destination_account, status, version, external_reference, failure_reason, created_at, updated_at";
const LEDGER_COLUMNS: &str =
    "sequence, id, transaction_id, account_id, direction, amount, currency, created_at";
const OUTBOX_COLUMNS: &str = "id, transaction_id, intent, sequence, payload, status, attempts, last_error, created_at, next_attempt_at, published_at, consumed_at";
const IDEMPOTENCY_COLUMNS: &str =
    "idempotency_key, fingerprint, transaction_id, locked_until, expires_at, created_at";

// ─────────────────────────────────────────────────────────────────────────────
// PostgreSQL Repository
// ─────────────────────────────────────────────────────────────────────────────

/// PostgreSQL repository with row-level locking.
#[derive(Clone)]
pub struct PostgresRepo {
    pool: PgPool,
}

/// Runs all database migrations.
///
/// The migration contains a PL/pgSQL body, so it is sent as one simple-query
/// batch instead of being split on semicolons.
async fn run_migrations(pool: &PgPool) -> Result<(), anyhow::Error> {
    sqlx::raw_sql(include_str!("../migrations/0001_create_tables_pg.sql"))
        .execute(pool)
        .await
        .map_err(|e| anyhow::anyhow!("Migration 0001 failed: {}", e))?;
    Ok(())
}

impl PostgresRepo {
    /// Creates a new PostgreSQL repository with automatic migration.
    pub async fn new(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// Returns a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the database schema (for testing with existing pool).
    pub async fn create_schema(&self) -> Result<(), RepoError> {
        run_migrations(&self.pool)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))
    }
}

/// Appends a balanced batch inside an open database transaction and folds it
/// into the running balances. Balance rows are upserted in key order.
async fn append_in(
    db_tx: &mut sqlx::Transaction<'_, Postgres>,
    entries: Vec<LedgerEntry>,
) -> Result<Vec<LedgerEntry>, RepoError> {
    let mut stored = Vec::with_capacity(entries.len());
    for mut entry in entries {
        let sequence: i64 = sqlx::query_scalar(
            r#"INSERT INTO ledger_entries (id, transaction_id, account_id, direction, amount, currency, created_at)
               VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING sequence"#,
        )
        .bind(*entry.id.as_uuid())
        .bind(*entry.transaction_id.as_uuid())
        .bind(entry.account_id.expose())
        .bind(entry.direction.as_str())
        .bind(entry.amount.amount())
        .bind(entry.amount.currency().as_str())
        .bind(entry.created_at)
        .fetch_one(&mut **db_tx)
        .await
        .map_err(map_write_error)?;
        entry.sequence = Some(sequence);
        stored.push(entry);
    }

    for ((account, currency), (delta, last_sequence)) in balance_deltas(&stored) {
        sqlx::query(
            r#"INSERT INTO account_balances (account_id, currency, balance, last_sequence)
               VALUES ($1, $2, $3, $4)
               ON CONFLICT (account_id, currency) DO UPDATE
               SET balance = account_balances.balance + EXCLUDED.balance,
                   last_sequence = GREATEST(account_balances.last_sequence, EXCLUDED.last_sequence)"#,
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
impl TransactionReader for PostgresRepo {
    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, RepoError> {
        let row: Option<DbTransaction> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1"
        ))
        .bind(id.into_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        row.map(DbTransaction::into_domain).transpose()
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>, RepoError> {
        let row: Option<DbTransaction> = sqlx::query_as(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE idempotency_key = $1"
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
             WHERE status IN ('pending', 'authorized', 'captured') AND updated_at < $1
             ORDER BY updated_at ASC LIMIT $2"
        ))
        .bind(updated_before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        rows.into_iter().map(DbTransaction::into_domain).collect()
    }
}

#[async_trait]
impl TransactionStore for PostgresRepo {
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
                       VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
                )
                .bind(tx.id.into_uuid())
                .bind(&tx.idempotency_key)
                .bind(tx.amount.amount())
                .bind(tx.amount.currency().as_str())
                .bind(tx.source_account.expose())
                .bind(tx.destination_account.expose())
                .bind(tx.status.as_str())
                .bind(tx.version)
                .bind(&tx.external_reference)
                .bind(&tx.failure_reason)
                .bind(tx.created_at)
                .bind(tx.updated_at)
                .execute(&mut *db_tx)
                .await
                .map_err(map_write_error)?;
                tx
            }
            TransactionWrite::Update {
                next,
                expected_version,
            } => {
                // Compare-and-set on version; the row lock taken by UPDATE
                // serializes concurrent transitions of the same transaction.
                let result = sqlx::query(
                    r#"UPDATE transactions
                       SET status = $1, version = $2, external_reference = $3, failure_reason = $4, updated_at = $5
                       WHERE id = $6 AND version = $7"#,
                )
                .bind(next.status.as_str())
                .bind(next.version)
                .bind(&next.external_reference)
                .bind(&next.failure_reason)
                .bind(next.updated_at)
                .bind(next.id.into_uuid())
                .bind(expected_version)
                .execute(&mut *db_tx)
                .await
                .map_err(|e| RepoError::Database(e.to_string()))?;

                if result.rows_affected() == 0 {
                    let exists: Option<i64> =
                        sqlx::query_scalar(r#"SELECT version FROM transactions WHERE id = $1"#)
                            .bind(next.id.into_uuid())
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
                   VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
            )
            .bind(*message.id.as_uuid())
            .bind(message.transaction_id.into_uuid())
            .bind(message.intent.as_str())
            .bind(message.sequence)
            .bind(&message.payload)
            .bind(message.status.to_string())
            .bind(message.attempts)
            .bind(&message.last_error)
            .bind(message.created_at)
            .bind(message.next_attempt_at)
            .execute(&mut *db_tx)
            .await
            .map_err(map_write_error)?;
        }

        if let Some(message_id) = unit.consumes {
            sqlx::query(
                r#"UPDATE outbox_messages SET status = 'consumed', consumed_at = $1
                   WHERE id = $2 AND status <> 'consumed'"#,
            )
            .bind(stored.updated_at)
            .bind(*message_id.as_uuid())
            .execute(&mut *db_tx)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))?;
        }

        if let Some(key) = unit.resolves_idempotency {
            sqlx::query(
                r#"UPDATE idempotency_records SET transaction_id = $1 WHERE idempotency_key = $2"#,
            )
            .bind(stored.id.into_uuid())
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
impl LedgerReader for PostgresRepo {
    async fn entries_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, RepoError> {
        let rows: Vec<DbLedgerEntry> = sqlx::query_as(&format!(
            "SELECT {LEDGER_COLUMNS} FROM ledger_entries WHERE transaction_id = $1 ORDER BY sequence ASC"
        ))
        .bind(id.into_uuid())
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
             WHERE account_id = $1 AND currency = $2 ORDER BY sequence ASC"
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
            r#"SELECT balance FROM account_balances WHERE account_id = $1 AND currency = $2"#,
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
impl LedgerStore for PostgresRepo {
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
impl OutboxStore for PostgresRepo {
    async fn claim_due_messages(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, RepoError> {
        // SKIP LOCKED lets several dispatchers claim disjoint batches.
        let rows: Vec<DbOutboxMessage> = sqlx::query_as(&format!(
            "UPDATE outbox_messages SET next_attempt_at = $1
             WHERE id IN (
                 SELECT id FROM outbox_messages
                 WHERE status IN ('pending', 'published') AND next_attempt_at <= $2
                 ORDER BY created_at ASC, sequence ASC
                 LIMIT $3
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING {OUTBOX_COLUMNS}"
        ))
        .bind(lease_until)
        .bind(now)
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
               SET status = 'published', published_at = $1, next_attempt_at = $2,
                   attempts = attempts + 1, last_error = NULL
               WHERE id = $3 AND status IN ('pending', 'published')"#,
        )
        .bind(at)
        .bind(redeliver_at)
        .bind(*id.as_uuid())
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
               SET attempts = attempts + 1, last_error = $1, next_attempt_at = $2
               WHERE id = $3 AND status IN ('pending', 'published')"#,
        )
        .bind(error)
        .bind(next_attempt_at)
        .bind(*id.as_uuid())
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
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE id = $1"
        ))
        .bind(*id.as_uuid())
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
            r#"UPDATE outbox_messages SET status = 'consumed', consumed_at = $1
               WHERE id = $2 AND status <> 'consumed'"#,
        )
        .bind(at)
        .bind(*id.as_uuid())
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
            "SELECT {OUTBOX_COLUMNS} FROM outbox_messages WHERE transaction_id = $1 ORDER BY sequence ASC"
        ))
        .bind(id.into_uuid())
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
impl IdempotencyStore for PostgresRepo {
    async fn reserve_key(&self, record: &IdempotencyRecord) -> Result<ReserveOutcome, RepoError> {
        let result = sqlx::query(
            r#"INSERT INTO idempotency_records (idempotency_key, fingerprint, transaction_id, locked_until, expires_at, created_at)
               VALUES ($1, $2, NULL, $3, $4, $5)
               ON CONFLICT (idempotency_key) DO NOTHING"#,
        )
        .bind(&record.key)
        .bind(record.fingerprint.as_str())
        .bind(record.locked_until)
        .bind(record.expires_at)
        .bind(record.created_at)
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
            "SELECT {IDEMPOTENCY_COLUMNS} FROM idempotency_records WHERE idempotency_key = $1"
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
        let result = sqlx::query(
            r#"UPDATE idempotency_records
               SET fingerprint = $1, transaction_id = NULL, locked_until = $2, expires_at = $3, created_at = $4
               WHERE idempotency_key = $5
                 AND ((transaction_id IS NULL AND locked_until <= $6) OR expires_at <= $6)"#,
        )
        .bind(record.fingerprint.as_str())
        .bind(record.locked_until)
        .bind(record.expires_at)
        .bind(record.created_at)
        .bind(&record.key)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_key(&self, key: &str) -> Result<(), RepoError> {
        sqlx::query(
            r#"DELETE FROM idempotency_records WHERE idempotency_key = $1 AND transaction_id IS NULL"#,
        )
        .bind(key)
        .execute(&self.pool)
        .await
        .map_err(|e| RepoError::Database(e.to_string()))?;
        Ok(())
    }

    async fn purge_expired_keys(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let result = sqlx::query(r#"DELETE FROM idempotency_records WHERE expires_at <= $1"#)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| RepoError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
