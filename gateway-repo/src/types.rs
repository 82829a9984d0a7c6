//! Database row types and conversions.
//!
//! SQLite stores UUIDs and timestamps as TEXT, PostgreSQL natively; each
//! backend gets its own row structs and both funnel into the shared builders
//! below.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use gateway_types::{
    AccountBalance, AccountId, Currency, Direction, Fingerprint, IdempotencyRecord, LedgerEntry,
    LedgerEntryId, Money, OutboxMessage, OutboxMessageId, OutboxStatus, RepoError, Transaction,
    TransactionId, TransactionStatus, TransitionIntent,
};

// ─────────────────────────────────────────────────────────────────────────────
// Parsing helpers
// ─────────────────────────────────────────────────────────────────────────────

pub fn parse_currency(s: &str) -> Result<Currency, RepoError> {
    Currency::parse(s.trim()).map_err(|_| RepoError::Database(format!("Unknown currency: {}", s)))
}

pub fn parse_account(s: String) -> Result<AccountId, RepoError> {
    AccountId::new(s).map_err(RepoError::Domain)
}

pub fn parse_status(s: &str) -> Result<TransactionStatus, RepoError> {
    s.parse().map_err(RepoError::Domain)
}

#[cfg(feature = "sqlite")]
pub fn parse_uuid(s: &str) -> Result<Uuid, RepoError> {
    Uuid::parse_str(s).map_err(|e| RepoError::Database(e.to_string()))
}

#[cfg(feature = "sqlite")]
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, RepoError> {
    Ok(DateTime::parse_from_rfc3339(s)
        .map_err(|e| RepoError::Database(e.to_string()))?
        .with_timezone(&Utc))
}

#[cfg(feature = "sqlite")]
pub fn parse_optional_timestamp(s: Option<String>) -> Result<Option<DateTime<Utc>>, RepoError> {
    s.as_deref().map(parse_timestamp).transpose()
}

/// Fixed-width RFC 3339 so that TEXT comparison in SQL orders like time.
#[cfg(feature = "sqlite")]
pub fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared builders
// ─────────────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn build_transaction(
    id: Uuid,
    idempotency_key: String,
    amount: i64,
    currency: &str,
    source_account: String,
    destination_account: String,
    status: &str,
    version: i64,
    external_reference: Option<String>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
) -> Result<Transaction, RepoError> {
    let money = Money::new(amount, parse_currency(currency)?).map_err(RepoError::Domain)?;
    Ok(Transaction::from_parts(
        TransactionId::from_uuid(id),
        idempotency_key,
        money,
        parse_account(source_account)?,
        parse_account(destination_account)?,
        parse_status(status)?,
        version,
        external_reference,
        failure_reason,
        created_at,
        updated_at,
    ))
}

#[allow(clippy::too_many_arguments)]
fn build_ledger_entry(
    id: Uuid,
    transaction_id: Uuid,
    account_id: String,
    direction: &str,
    amount: i64,
    currency: &str,
    sequence: i64,
    created_at: DateTime<Utc>,
) -> Result<LedgerEntry, RepoError> {
    let direction: Direction = direction.parse().map_err(RepoError::Domain)?;
    let money = Money::new(amount, parse_currency(currency)?).map_err(RepoError::Domain)?;
    Ok(LedgerEntry::from_parts(
        LedgerEntryId::from_uuid(id),
        TransactionId::from_uuid(transaction_id),
        parse_account(account_id)?,
        direction,
        money,
        sequence,
        created_at,
    ))
}

fn build_balance(
    account_id: String,
    currency: &str,
    balance: i64,
    last_sequence: i64,
) -> Result<AccountBalance, RepoError> {
    Ok(AccountBalance {
        account_id: parse_account(account_id)?,
        currency: parse_currency(currency)?,
        balance,
        last_sequence,
    })
}

#[allow(clippy::too_many_arguments)]
fn build_outbox_message(
    id: Uuid,
    transaction_id: Uuid,
    intent: &str,
    sequence: i64,
    payload: serde_json::Value,
    status: &str,
    attempts: i32,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    next_attempt_at: DateTime<Utc>,
    published_at: Option<DateTime<Utc>>,
    consumed_at: Option<DateTime<Utc>>,
) -> Result<OutboxMessage, RepoError> {
    let intent: TransitionIntent = intent.parse().map_err(RepoError::Domain)?;
    let status: OutboxStatus = status.parse().map_err(RepoError::Domain)?;
    Ok(OutboxMessage {
        id: OutboxMessageId::from_uuid(id),
        transaction_id: TransactionId::from_uuid(transaction_id),
        intent,
        sequence,
        payload,
        status,
        attempts,
        last_error,
        created_at,
        next_attempt_at,
        published_at,
        consumed_at,
    })
}

fn build_idempotency_record(
    key: String,
    fingerprint: String,
    transaction_id: Option<Uuid>,
    locked_until: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    created_at: DateTime<Utc>,
) -> IdempotencyRecord {
    IdempotencyRecord {
        key,
        fingerprint: Fingerprint::from_hex(fingerprint.trim().to_string()),
        transaction_id: transaction_id.map(TransactionId::from_uuid),
        locked_until,
        expires_at,
        created_at,
    }
}

/// Balance-only row for queries.
#[derive(sqlx::FromRow)]
pub struct DbBalance {
    pub balance: i64,
}

// ─────────────────────────────────────────────────────────────────────────────
// SQLite rows
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "sqlite")]
pub mod sqlite_rows {
    use sqlx::FromRow;

    use super::*;

    /// Transaction row from SQLite.
    #[derive(FromRow)]
    pub struct DbTransaction {
        pub id: String,
        pub idempotency_key: String,
        pub amount: i64,
        pub currency: String,
        pub source_account: String,
        pub destination_account: String,
        pub status: String,
        pub version: i64,
        pub external_reference: Option<String>,
        pub failure_reason: Option<String>,
        pub created_at: String,
        pub updated_at: String,
    }

    impl DbTransaction {
        pub fn into_domain(self) -> Result<Transaction, RepoError> {
            build_transaction(
                parse_uuid(&self.id)?,
                self.idempotency_key,
                self.amount,
                &self.currency,
                self.source_account,
                self.destination_account,
                &self.status,
                self.version,
                self.external_reference,
                self.failure_reason,
                parse_timestamp(&self.created_at)?,
                parse_timestamp(&self.updated_at)?,
            )
        }
    }

    /// Ledger entry row from SQLite.
    #[derive(FromRow)]
    pub struct DbLedgerEntry {
        pub sequence: i64,
        pub id: String,
        pub transaction_id: String,
        pub account_id: String,
        pub direction: String,
        pub amount: i64,
        pub currency: String,
        pub created_at: String,
    }

    impl DbLedgerEntry {
        pub fn into_domain(self) -> Result<LedgerEntry, RepoError> {
            build_ledger_entry(
                parse_uuid(&self.id)?,
                parse_uuid(&self.transaction_id)?,
                self.account_id,
                &self.direction,
                self.amount,
                &self.currency,
                self.sequence,
                parse_timestamp(&self.created_at)?,
            )
        }
    }

    /// Running balance row from SQLite.
    #[derive(FromRow)]
    pub struct DbAccountBalance {
        pub account_id: String,
        pub currency: String,
        pub balance: i64,
        pub last_sequence: i64,
    }

    impl DbAccountBalance {
        pub fn into_domain(self) -> Result<AccountBalance, RepoError> {
            build_balance(self.account_id, &self.currency, self.balance, self.last_sequence)
        }
    }

    /// Outbox row from SQLite.
    #[derive(FromRow)]
    pub struct DbOutboxMessage {
        pub id: String,
        pub transaction_id: String,
        pub intent: String,
        pub sequence: i64,
        pub payload: String,
        pub status: String,
        pub attempts: i32,
        pub last_error: Option<String>,
        pub created_at: String,
        pub next_attempt_at: String,
        pub published_at: Option<String>,
        pub consumed_at: Option<String>,
    }

    impl DbOutboxMessage {
        pub fn into_domain(self) -> Result<OutboxMessage, RepoError> {
            let payload: serde_json::Value = serde_json::from_str(&self.payload)
                .map_err(|e| RepoError::Database(e.to_string()))?;
            build_outbox_message(
                parse_uuid(&self.id)?,
                parse_uuid(&self.transaction_id)?,
                &self.intent,
                self.sequence,
                payload,
                &self.status,
                self.attempts,
                self.last_error,
                parse_timestamp(&self.created_at)?,
                parse_timestamp(&self.next_attempt_at)?,
                parse_optional_timestamp(self.published_at)?,
                parse_optional_timestamp(self.consumed_at)?,
            )
        }
    }

    /// Idempotency record row from SQLite.
    #[derive(FromRow)]
    pub struct DbIdempotencyRecord {
        pub idempotency_key: String,
        pub fingerprint: String,
        pub transaction_id: Option<String>,
        pub locked_until: String,
        pub expires_at: String,
        pub created_at: String,
    }

    impl DbIdempotencyRecord {
        pub fn into_domain(self) -> Result<IdempotencyRecord, RepoError> {
            let transaction_id = self.transaction_id.as_deref().map(parse_uuid).transpose()?;
            Ok(build_idempotency_record(
                self.idempotency_key,
                self.fingerprint,
                transaction_id,
                parse_timestamp(&self.locked_until)?,
                parse_timestamp(&self.expires_at)?,
                parse_timestamp(&self.created_at)?,
            ))
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PostgreSQL rows
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(feature = "postgres")]
pub mod pg_rows {
    use sqlx::FromRow;

    use super::*;

    /// Transaction row from PostgreSQL.
    #[derive(FromRow)]
    pub struct DbTransaction {
        pub id: Uuid,
        pub idempotency_key: String,
        pub amount: i64,
        pub currency: String,
        pub source_account: String,
        pub destination_account: String,
        pub status: String,
        pub version: i64,
        pub external_reference: Option<String>,
        pub failure_reason: Option<String>,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    impl DbTransaction {
        pub fn into_domain(self) -> Result<Transaction, RepoError> {
            build_transaction(
                self.id,
                self.idempotency_key,
                self.amount,
                &self.currency,
                self.source_account,
                self.destination_account,
                &self.status,
                self.version,
                self.external_reference,
                self.failure_reason,
                self.created_at,
                self.updated_at,
            )
        }
    }

    /// Ledger entry row from PostgreSQL.
    #[derive(FromRow)]
    pub struct DbLedgerEntry {
        pub sequence: i64,
        pub id: Uuid,
        pub transaction_id: Uuid,
        pub account_id: String,
        pub direction: String,
        pub amount: i64,
        pub currency: String,
        pub created_at: DateTime<Utc>,
    }

    impl DbLedgerEntry {
        pub fn into_domain(self) -> Result<LedgerEntry, RepoError> {
            build_ledger_entry(
                self.id,
                self.transaction_id,
                self.account_id,
                &self.direction,
                self.amount,
                &self.currency,
                self.sequence,
                self.created_at,
            )
        }
    }

    /// Running balance row from PostgreSQL.
    #[derive(FromRow)]
    pub struct DbAccountBalance {
        pub account_id: String,
        pub currency: String,
        pub balance: i64,
        pub last_sequence: i64,
    }

    impl DbAccountBalance {
        pub fn into_domain(self) -> Result<AccountBalance, RepoError> {
            build_balance(self.account_id, &self.currency, self.balance, self.last_sequence)
        }
    }

    /// Outbox row from PostgreSQL.
    #[derive(FromRow)]
    pub struct DbOutboxMessage {
        pub id: Uuid,
        pub transaction_id: Uuid,
        pub intent: String,
        pub sequence: i64,
        pub payload: serde_json::Value,
        pub status: String,
        pub attempts: i32,
        pub last_error: Option<String>,
        pub created_at: DateTime<Utc>,
        pub next_attempt_at: DateTime<Utc>,
        pub published_at: Option<DateTime<Utc>>,
        pub consumed_at: Option<DateTime<Utc>>,
    }

    impl DbOutboxMessage {
        pub fn into_domain(self) -> Result<OutboxMessage, RepoError> {
            build_outbox_message(
                self.id,
                self.transaction_id,
                &self.intent,
                self.sequence,
                self.payload,
                &self.status,
                self.attempts,
                self.last_error,
                self.created_at,
                self.next_attempt_at,
                self.published_at,
                self.consumed_at,
            )
        }
    }

    /// Idempotency record row from PostgreSQL.
    #[derive(FromRow)]
    pub struct DbIdempotencyRecord {
        pub idempotency_key: String,
        pub fingerprint: String,
        pub transaction_id: Option<Uuid>,
        pub locked_until: DateTime<Utc>,
        pub expires_at: DateTime<Utc>,
        pub created_at: DateTime<Utc>,
    }

    impl DbIdempotencyRecord {
        pub fn into_domain(self) -> Result<IdempotencyRecord, RepoError> {
            Ok(build_idempotency_record(
                self.idempotency_key,
                self.fingerprint,
                self.transaction_id,
                self.locked_until,
                self.expires_at,
                self.created_at,
            ))
        }
    }
}

/// Net balance change per (account, currency) for a batch, in key order so
/// that concurrent writers lock balance rows in the same order.
pub fn balance_deltas(
    entries: &[LedgerEntry],
) -> std::collections::BTreeMap<(String, String), (i64, i64)> {
    let mut deltas = std::collections::BTreeMap::new();
    for entry in entries {
        let (delta, last_sequence) = deltas
            .entry((
                entry.account_id.expose().to_string(),
                entry.amount.currency().as_str().to_string(),
            ))
            .or_insert((0i64, 0i64));
        *delta += entry.signed_amount();
        *last_sequence = (*last_sequence).max(entry.sequence.unwrap_or_default());
    }
    deltas
}

/// Maps a unique-constraint violation to `RepoError::Conflict`.
pub fn map_write_error(err: sqlx::Error) -> RepoError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            RepoError::Conflict(db.message().to_string())
        }
        _ => RepoError::Database(err.to_string()),
    }
}
