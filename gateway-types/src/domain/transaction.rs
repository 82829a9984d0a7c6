//! Transaction domain model and lifecycle rules.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::AccountId;
use super::money::Money;
use crate::error::DomainError;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;

/// Unique identifier for a Transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransactionId(Uuid);

impl TransactionId {
    /// Creates a new random TransactionId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a TransactionId from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Returns the UUID value.
    pub fn into_uuid(self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TransactionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle status of a payment transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Authorized,
    Captured,
    Settled,
    Failed,
    Voided,
    Refunded,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 7] = [
        TransactionStatus::Pending,
        TransactionStatus::Authorized,
        TransactionStatus::Captured,
        TransactionStatus::Settled,
        TransactionStatus::Failed,
        TransactionStatus::Voided,
        TransactionStatus::Refunded,
    ];

    /// The statuses reachable from this one in a single transition.
    pub fn allowed_targets(self) -> &'static [TransactionStatus] {
        use TransactionStatus::*;
        match self {
            Pending => &[Authorized, Failed],
            Authorized => &[Captured, Voided],
            Captured => &[Settled, Failed],
            Settled => &[Refunded],
            Failed | Voided | Refunded => &[],
        }
    }

    /// Checks if a transition is valid.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        self.allowed_targets().contains(&next)
    }

    /// True when no further transition exists.
    pub fn is_terminal(self) -> bool {
        self.allowed_targets().is_empty()
    }

    /// True while money movement is still in progress and the transaction
    /// is expected to advance without operator action.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            TransactionStatus::Pending | TransactionStatus::Authorized | TransactionStatus::Captured
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Authorized => "authorized",
            TransactionStatus::Captured => "captured",
            TransactionStatus::Settled => "settled",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Voided => "voided",
            TransactionStatus::Refunded => "refunded",
        }
    }
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransactionStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransactionStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::ValidationError(format!("Unknown status: {}", s)))
    }
}

/// Financial effect a transition has on the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEffect {
    /// No ledger rows are written.
    None,
    /// Debit the source account and credit the destination.
    Hold,
    /// Offset a previously posted hold.
    ReverseHold,
}

impl LedgerEffect {
    /// Ledger effect of moving from `from` to `to`. Only meaningful for allowed edges.
    pub fn of(from: TransactionStatus, to: TransactionStatus) -> Self {
        use TransactionStatus::*;
        match (from, to) {
            (Pending, Authorized) => LedgerEffect::Hold,
            (Authorized, Voided) | (Captured, Failed) | (Settled, Refunded) => {
                LedgerEffect::ReverseHold
            }
            _ => LedgerEffect::None,
        }
    }
}

/// A payment transaction.
///
/// Only the state machine mutates a transaction, and only through
/// [`Transaction::plan_transition`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique identifier
    pub id: TransactionId,
    /// Client-supplied idempotency key (unique)
    pub idempotency_key: String,
    /// Amount and currency
    pub amount: Money,
    /// Account debited by the authorization hold
    pub source_account: AccountId,
    /// Account credited by the authorization hold
    pub destination_account: AccountId,
    /// Current lifecycle status
    pub status: TransactionStatus,
    /// Optimistic concurrency version, incremented by every transition
    pub version: i64,
    /// Reference shared with the settlement processor, set once settlement begins
    pub external_reference: Option<String>,
    /// Error kind recorded when the transaction fails
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The next snapshot of a transaction plus the ledger effect of getting there.
#[derive(Debug, Clone)]
pub struct PlannedTransition {
    pub from: TransactionStatus,
    pub next: Transaction,
    pub effect: LedgerEffect,
}

impl Transaction {
    /// Creates a new transaction in `pending` at version 0.
    ///
    /// # Validation
    /// - Idempotency key cannot be empty or longer than 255 characters
    /// - Amount must be positive
    /// - Source and destination must differ
    pub fn new(
        idempotency_key: String,
        amount: Money,
        source_account: AccountId,
        destination_account: AccountId,
    ) -> Result<Self, DomainError> {
        if idempotency_key.trim().is_empty() || idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(DomainError::ValidationError(
                "Idempotency key must be 1-255 characters".into(),
            ));
        }
        if amount.amount() <= 0 {
            return Err(DomainError::ValidationError(
                "Amount must be positive".into(),
            ));
        }
        if source_account == destination_account {
            return Err(DomainError::ValidationError(
                "Source and destination accounts must differ".into(),
            ));
        }

        let now = Utc::now();
        Ok(Self {
            id: TransactionId::new(),
            idempotency_key,
            amount,
            source_account,
            destination_account,
            status: TransactionStatus::Pending,
            version: 0,
            external_reference: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Reconstructs a transaction from database fields.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        id: TransactionId,
        idempotency_key: String,
        amount: Money,
        source_account: AccountId,
        destination_account: AccountId,
        status: TransactionStatus,
        version: i64,
        external_reference: Option<String>,
        failure_reason: Option<String>,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            idempotency_key,
            amount,
            source_account,
            destination_account,
            status,
            version,
            external_reference,
            failure_reason,
            created_at,
            updated_at,
        }
    }

    /// Plans a move to `to`, returning the next snapshot (status changed,
    /// version incremented) without touching `self`.
    pub fn plan_transition(
        &self,
        to: TransactionStatus,
        now: DateTime<Utc>,
    ) -> Result<PlannedTransition, DomainError> {
        if !self.status.can_transition_to(to) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to,
            });
        }

        let mut next = self.clone();
        next.status = to;
        next.version = self.version + 1;
        next.updated_at = now;

        Ok(PlannedTransition {
            from: self.status,
            next,
            effect: LedgerEffect::of(self.status, to),
        })
    }

    /// Plans the request for a refund. The status stays put and only the
    /// version moves, so that the refund intent queued with it is ordered
    /// after every earlier message. `settled -> refunded` is applied once the
    /// processor confirms.
    pub fn plan_refund_request(&self, now: DateTime<Utc>) -> Result<Transaction, DomainError> {
        if !self.status.can_transition_to(TransactionStatus::Refunded) {
            return Err(DomainError::InvalidTransition {
                from: self.status,
                to: TransactionStatus::Refunded,
            });
        }

        let mut next = self.clone();
        next.version = self.version + 1;
        next.updated_at = now;
        Ok(next)
    }
}
