//! Outbox messages and the broker envelope they are published as.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::account::AccountId;
use super::money::Money;
use super::transaction::{Transaction, TransactionId};
use crate::error::DomainError;

/// Unique identifier for an outbox message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxMessageId(Uuid);

impl OutboxMessageId {
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

impl Default for OutboxMessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutboxMessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The asynchronous action a message asks the settlement consumer to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionIntent {
    /// Move an authorized transaction to captured.
    Capture,
    /// Settle a captured transaction with the external processor.
    Settle,
    /// Return settled funds through the external processor.
    Refund,
}

impl TransitionIntent {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionIntent::Capture => "capture",
            TransitionIntent::Settle => "settle",
            TransitionIntent::Refund => "refund",
        }
    }
}

impl std::fmt::Display for TransitionIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TransitionIntent {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "capture" => Ok(TransitionIntent::Capture),
            "settle" => Ok(TransitionIntent::Settle),
            "refund" => Ok(TransitionIntent::Refund),
            _ => Err(DomainError::ValidationError(format!(
                "Unknown intent: {}",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Published,
    Consumed,
}

impl AsRef<str> for OutboxStatus {
    fn as_ref(&self) -> &str {
        match self {
            Self::Pending => "pending",
            Self::Published => "published",
            Self::Consumed => "consumed",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl std::str::FromStr for OutboxStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "published" => Ok(Self::Published),
            "consumed" => Ok(Self::Consumed),
            _ => Err(DomainError::ValidationError(format!(
                "Unknown outbox status: {}",
                s
            ))),
        }
    }
}

/// Settlement instruction carried as the message payload.
///
/// Opaque to the broker; only the consumer and the processor adapter read it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementInstruction {
    pub transaction_id: TransactionId,
    pub external_reference: Option<String>,
    pub amount: Money,
    pub source_account: AccountId,
    pub destination_account: AccountId,
}

impl SettlementInstruction {
    pub fn for_transaction(tx: &Transaction) -> Self {
        Self {
            transaction_id: tx.id,
            external_reference: tx.external_reference.clone(),
            amount: tx.amount,
            source_account: tx.source_account.clone(),
            destination_account: tx.destination_account.clone(),
        }
    }
}

/// A message persisted alongside the transition that requires it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: OutboxMessageId,
    pub transaction_id: TransactionId,
    pub intent: TransitionIntent,
    /// Transaction version produced by the transition that emitted this message.
    pub sequence: i64,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub next_attempt_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
    pub consumed_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    /// Creates a pending message for `tx` as it will look after the transition.
    pub fn for_transition(tx: &Transaction, intent: TransitionIntent) -> Self {
        let now = Utc::now();
        let payload = serde_json::to_value(SettlementInstruction::for_transaction(tx))
            .unwrap_or(serde_json::Value::Null);
        Self {
            id: OutboxMessageId::new(),
            transaction_id: tx.id,
            intent,
            sequence: tx.version,
            payload,
            status: OutboxStatus::Pending,
            attempts: 0,
            last_error: None,
            created_at: now,
            next_attempt_at: now,
            published_at: None,
            consumed_at: None,
        }
    }

    /// Envelope handed to the broker.
    pub fn to_broker_message(&self) -> BrokerMessage {
        BrokerMessage {
            message_id: self.id,
            transaction_id: self.transaction_id,
            intent: self.intent,
            sequence: self.sequence,
            payload: self.payload.clone(),
        }
    }
}

/// Message as it travels through the broker. `sequence` is the dedup key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerMessage {
    pub message_id: OutboxMessageId,
    pub transaction_id: TransactionId,
    pub intent: TransitionIntent,
    pub sequence: i64,
    pub payload: serde_json::Value,
}

impl BrokerMessage {
    /// Decodes the settlement instruction payload.
    pub fn instruction(&self) -> Result<SettlementInstruction, DomainError> {
        serde_json::from_value(self.payload.clone()).map_err(|_| {
            DomainError::ValidationError("Malformed settlement instruction".into())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Currency, TransactionStatus};

    fn authorized_tx() -> Transaction {
        let tx = Transaction::new(
            "key".into(),
            Money::new(2500, Currency::EUR).unwrap(),
            AccountId::new("acct-src").unwrap(),
            AccountId::new("acct-dst").unwrap(),
        )
        .unwrap();
        tx.plan_transition(TransactionStatus::Authorized, Utc::now())
            .unwrap()
            .next
    }

    #[test]
    fn test_message_sequence_is_transaction_version() {
        let tx = authorized_tx();
        let msg = OutboxMessage::for_transition(&tx, TransitionIntent::Capture);
        assert_eq!(msg.sequence, 1);
        assert_eq!(msg.status, OutboxStatus::Pending);
        assert_eq!(msg.attempts, 0);
    }

    #[test]
    fn test_broker_message_carries_instruction() {
        let tx = authorized_tx();
        let msg = OutboxMessage::for_transition(&tx, TransitionIntent::Settle).to_broker_message();
        let instruction = msg.instruction().unwrap();
        assert_eq!(instruction.transaction_id, tx.id);
        assert_eq!(instruction.amount.amount(), 2500);
        assert_eq!(instruction.source_account.expose(), "acct-src");
    }

    #[test]
    fn test_malformed_payload_is_rejected() {
        let mut msg = OutboxMessage::for_transition(&authorized_tx(), TransitionIntent::Settle)
            .to_broker_message();
        msg.payload = serde_json::json!({ "unexpected": true });
        assert!(msg.instruction().is_err());
    }

    #[test]
    fn test_intent_and_status_parse() {
        assert_eq!("settle".parse::<TransitionIntent>().unwrap(), TransitionIntent::Settle);
        assert_eq!("consumed".parse::<OutboxStatus>().unwrap(), OutboxStatus::Consumed);
        assert!("SETTLE".parse::<TransitionIntent>().is_err());
    }
}
