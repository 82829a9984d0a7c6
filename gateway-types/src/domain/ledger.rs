//! Double-entry ledger model.
//!
//! Entries are immutable. Every batch written for a transaction must net to
//! zero per currency; corrections are new offsetting entries.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::AccountId;
use super::money::{Currency, Money};
use super::transaction::{LedgerEffect, Transaction, TransactionId};
use crate::error::DomainError;

/// Unique identifier for a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerEntryId(Uuid);

impl LedgerEntryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for LedgerEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LedgerEntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Side of a double-entry posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Direction::Debit => Direction::Credit,
            Direction::Credit => Direction::Debit,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Direction {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debit" => Ok(Direction::Debit),
            "credit" => Ok(Direction::Credit),
            _ => Err(DomainError::ValidationError(format!(
                "Unknown direction: {}",
                s
            ))),
        }
    }
}

/// A single immutable ledger posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: LedgerEntryId,
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub direction: Direction,
    pub amount: Money,
    /// Position in the ledger, assigned by the store on append.
    pub sequence: Option<i64>,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Creates an unsequenced entry.
    pub fn new(
        transaction_id: TransactionId,
        account_id: AccountId,
        direction: Direction,
        amount: Money,
    ) -> Self {
        Self {
            id: LedgerEntryId::new(),
            transaction_id,
            account_id,
            direction,
            amount,
            sequence: None,
            created_at: Utc::now(),
        }
    }

    /// Reconstructs an entry from database fields.
    pub fn from_parts(
        id: LedgerEntryId,
        transaction_id: TransactionId,
        account_id: AccountId,
        direction: Direction,
        amount: Money,
        sequence: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            transaction_id,
            account_id,
            direction,
            amount,
            sequence: Some(sequence),
            created_at,
        }
    }

    /// Contribution to the account balance: credits add, debits subtract.
    pub fn signed_amount(&self) -> i64 {
        match self.direction {
            Direction::Credit => self.amount.amount(),
            Direction::Debit => -self.amount.amount(),
        }
    }

    /// Entry that exactly offsets this one.
    pub fn offsetting(&self) -> LedgerEntry {
        LedgerEntry::new(
            self.transaction_id,
            self.account_id.clone(),
            self.direction.opposite(),
            self.amount,
        )
    }
}

/// Running balance of one account in one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    pub account_id: AccountId,
    pub currency: Currency,
    /// Sum of credits minus sum of debits.
    pub balance: i64,
    /// Sequence of the last entry folded into `balance`.
    pub last_sequence: i64,
}

/// Entries a transition posts for `tx`, given its ledger effect.
pub fn entries_for_effect(effect: LedgerEffect, tx: &Transaction) -> Vec<LedgerEntry> {
    let hold = || {
        [
            LedgerEntry::new(tx.id, tx.source_account.clone(), Direction::Debit, tx.amount),
            LedgerEntry::new(
                tx.id,
                tx.destination_account.clone(),
                Direction::Credit,
                tx.amount,
            ),
        ]
    };

    match effect {
        LedgerEffect::None => Vec::new(),
        LedgerEffect::Hold => hold().to_vec(),
        LedgerEffect::ReverseHold => hold().iter().map(LedgerEntry::offsetting).collect(),
    }
}

/// Verifies that a batch nets to zero for every (transaction, currency) pair.
///
/// # Validation
/// - Batch cannot be empty
/// - Every amount must be positive
/// - Debits must equal credits per transaction and currency
pub fn ensure_balanced(entries: &[LedgerEntry]) -> Result<(), DomainError> {
    if entries.is_empty() {
        return Err(DomainError::ValidationError(
            "Ledger batch cannot be empty".into(),
        ));
    }

    let mut totals: BTreeMap<(TransactionId, Currency), (i64, i64)> = BTreeMap::new();
    for entry in entries {
        if entry.amount.amount() <= 0 {
            return Err(DomainError::ValidationError(
                "Ledger entry amount must be positive".into(),
            ));
        }
        let (debits, credits) = totals
            .entry((entry.transaction_id, entry.amount.currency()))
            .or_insert((0, 0));
        let side = match entry.direction {
            Direction::Debit => debits,
            Direction::Credit => credits,
        };
        *side = side
            .checked_add(entry.amount.amount())
            .ok_or_else(|| DomainError::ValidationError("Amount overflow".into()))?;
    }

    for ((transaction_id, currency), (debits, credits)) in totals {
        if debits != credits {
            return Err(DomainError::LedgerImbalance {
                transaction_id,
                currency,
                debits,
                credits,
            });
        }
    }
    Ok(())
}

/// Replays entries into the balance of `account` in `currency`.
pub fn fold_balance<'a>(
    entries: impl IntoIterator<Item = &'a LedgerEntry>,
    account: &AccountId,
    currency: Currency,
) -> i64 {
    entries
        .into_iter()
        .filter(|e| &e.account_id == account && e.amount.currency() == currency)
        .fold(0i64, |acc, e| acc.saturating_add(e.signed_amount()))
}
