//! Store port traits.
//!
//! These are the primary ports in our hexagonal architecture.
//! Adapters (Postgres, SQLite, in-memory) implement them.

use chrono::{DateTime, Utc};

use crate::domain::{
    AccountBalance, AccountId, Currency, IdempotencyRecord, LedgerEntry, OutboxMessage,
    OutboxMessageId, Transaction, TransactionId,
};
use crate::error::RepoError;

/// How a unit of work writes its transaction row.
#[derive(Debug, Clone)]
pub enum TransactionWrite {
    /// Insert a brand-new transaction.
    Insert(Transaction),
    /// Replace the row, but only if it is still at `expected_version`.
    Update {
        next: Transaction,
        expected_version: i64,
    },
}

/// Everything one transition persists. Adapters MUST commit it atomically:
/// all of it or none of it.
#[derive(Debug, Clone)]
pub struct UnitOfWork {
    pub write: TransactionWrite,
    pub ledger_entries: Vec<LedgerEntry>,
    pub outbox: Option<OutboxMessage>,
    /// Outbox message acknowledged by this transition.
    pub consumes: Option<OutboxMessageId>,
    /// Idempotency key resolved to this transaction.
    pub resolves_idempotency: Option<String>,
}

impl UnitOfWork {
    pub fn insert(tx: Transaction) -> Self {
        Self::with_write(TransactionWrite::Insert(tx))
    }

    pub fn update(next: Transaction, expected_version: i64) -> Self {
        Self::with_write(TransactionWrite::Update {
            next,
            expected_version,
        })
    }

    fn with_write(write: TransactionWrite) -> Self {
        Self {
            write,
            ledger_entries: Vec::new(),
            outbox: None,
            consumes: None,
            resolves_idempotency: None,
        }
    }

    pub fn with_ledger_entries(mut self, entries: Vec<LedgerEntry>) -> Self {
        self.ledger_entries = entries;
        self
    }

    pub fn with_outbox(mut self, message: Option<OutboxMessage>) -> Self {
        self.outbox = message;
        self
    }

    pub fn consuming(mut self, message_id: Option<OutboxMessageId>) -> Self {
        self.consumes = message_id;
        self
    }

    pub fn resolving_idempotency(mut self, key: impl Into<String>) -> Self {
        self.resolves_idempotency = Some(key.into());
        self
    }

    /// The transaction as it will be stored.
    pub fn transaction(&self) -> &Transaction {
        match &self.write {
            TransactionWrite::Insert(tx) => tx,
            TransactionWrite::Update { next, .. } => next,
        }
    }
}

/// Read access to transactions.
#[async_trait::async_trait]
pub trait TransactionReader: Send + Sync + 'static {
    /// Gets a transaction by ID.
    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>, RepoError>;

    /// Finds a transaction by its idempotency key.
    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Transaction>, RepoError>;

    /// Lists in-flight (pending, authorized, captured) transactions last
    /// updated before `updated_before`, oldest first.
    async fn list_stale_transactions(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, RepoError>;
}

/// Transaction writes. Every write goes through a [`UnitOfWork`].
#[async_trait::async_trait]
pub trait TransactionStore: TransactionReader {
    /// Commits a unit of work atomically and returns the stored transaction.
    ///
    /// Fails with `RepoError::VersionConflict` when an update finds a
    /// different version, and with `DomainError::LedgerImbalance` when the
    /// ledger entries do not net to zero. Nothing is written in either case.
    async fn commit(&self, unit: UnitOfWork) -> Result<Transaction, RepoError>;
}

/// Read access to the ledger.
#[async_trait::async_trait]
pub trait LedgerReader: Send + Sync + 'static {
    /// Entries of one transaction in sequence order.
    async fn entries_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, RepoError>;

    /// Entries of one account and currency in sequence order.
    async fn entries_for_account(
        &self,
        account: &AccountId,
        currency: Currency,
    ) -> Result<Vec<LedgerEntry>, RepoError>;

    /// Running balance (credits minus debits); zero for unknown accounts.
    async fn account_balance(&self, account: &AccountId, currency: Currency)
    -> Result<i64, RepoError>;

    /// All running balances.
    async fn list_account_balances(&self) -> Result<Vec<AccountBalance>, RepoError>;
}

/// Append-only ledger writes. There is no update or delete.
#[async_trait::async_trait]
pub trait LedgerStore: LedgerReader {
    /// Appends a balanced batch and returns it with sequences assigned.
    async fn append_entries(&self, entries: Vec<LedgerEntry>)
    -> Result<Vec<LedgerEntry>, RepoError>;
}

/// Outbox access for the dispatcher and the consumer.
#[async_trait::async_trait]
pub trait OutboxStore: Send + Sync + 'static {
    /// Leases up to `limit` messages due at `now` by pushing their
    /// `next_attempt_at` to `lease_until`, and returns them oldest first.
    ///
    /// Due means pending and past its backoff, or published and past its
    /// redelivery deadline without having been consumed.
    async fn claim_due_messages(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, RepoError>;

    /// Marks a message published after broker acknowledgment. It becomes
    /// due again at `redeliver_at` unless consumed first.
    async fn mark_published(
        &self,
        id: OutboxMessageId,
        at: DateTime<Utc>,
        redeliver_at: DateTime<Utc>,
    ) -> Result<(), RepoError>;

    /// Records a failed publish; the message is not due before `next_attempt_at`.
    async fn record_publish_failure(
        &self,
        id: OutboxMessageId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), RepoError>;

    async fn get_outbox_message(
        &self,
        id: OutboxMessageId,
    ) -> Result<Option<OutboxMessage>, RepoError>;

    /// Marks a message consumed. Returns false when it already was.
    async fn mark_consumed(&self, id: OutboxMessageId, at: DateTime<Utc>)
    -> Result<bool, RepoError>;

    async fn list_outbox_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<OutboxMessage>, RepoError>;
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// The caller now owns the key.
    Reserved,
    /// The key was already present.
    Existing(IdempotencyRecord),
}

/// Idempotency record persistence. `key` is unique.
#[async_trait::async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Inserts the record unless the key exists, atomically.
    async fn reserve_key(&self, record: &IdempotencyRecord) -> Result<ReserveOutcome, RepoError>;

    async fn get_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, RepoError>;

    /// Replaces an abandoned in-flight or expired record with `record`.
    /// Returns true for exactly one contender.
    async fn take_over_key(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError>;

    /// Drops an in-flight reservation. Resolved records are left untouched.
    async fn release_key(&self, key: &str) -> Result<(), RepoError>;

    /// Deletes records expired at `now`. Returns how many were removed.
    async fn purge_expired_keys(&self, now: DateTime<Utc>) -> Result<u64, RepoError>;
}

/// Everything the engine needs from one store.
pub trait GatewayStore: TransactionStore + LedgerStore + OutboxStore + IdempotencyStore {}

impl<T> GatewayStore for T where T: TransactionStore + LedgerStore + OutboxStore + IdempotencyStore {}
