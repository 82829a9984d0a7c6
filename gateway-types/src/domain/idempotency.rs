//! Idempotency records and request fingerprints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::account::AccountId;
use super::money::Money;
use super::transaction::TransactionId;

/// SHA-256 digest of the payload fields that must match for a retry to count
/// as the same request (amount, currency, source and destination accounts).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn of(amount: &Money, source: &AccountId, destination: &AccountId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(amount.amount().to_be_bytes());
        hasher.update(amount.currency().as_str().as_bytes());
        // Length prefixes keep ("ab", "c") and ("a", "bc") apart.
        for account in [source, destination] {
            let value = account.expose().as_bytes();
            hasher.update((value.len() as u32).to_be_bytes());
            hasher.update(value);
        }
        Self(hex::encode(hasher.finalize()))
    }

    /// Rebuilds a fingerprint read back from storage.
    pub fn from_hex(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// First-sight record of an idempotency key.
///
/// While `transaction_id` is unset the record is in flight: its owner holds a
/// lease until `locked_until`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub fingerprint: Fingerprint,
    pub transaction_id: Option<TransactionId>,
    pub locked_until: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    /// Creates an in-flight reservation.
    pub fn reserve(
        key: String,
        fingerprint: Fingerprint,
        now: DateTime<Utc>,
        locked_until: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            fingerprint,
            transaction_id: None,
            locked_until,
            expires_at,
            created_at: now,
        }
    }

    pub fn is_in_flight(&self) -> bool {
        self.transaction_id.is_none()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// An in-flight record whose owner stopped renewing it.
    pub fn is_abandoned(&self, now: DateTime<Utc>) -> bool {
        self.is_in_flight() && self.locked_until <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Currency;
    use chrono::Duration;

    fn money(amount: i64) -> Money {
        Money::new(amount, Currency::USD).unwrap()
    }

    fn account(name: &str) -> AccountId {
        AccountId::new(name).unwrap()
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = Fingerprint::of(&money(1000), &account("A"), &account("B"));
        let b = Fingerprint::of(&money(1000), &account("A"), &account("B"));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn test_fingerprint_covers_every_field() {
        let base = Fingerprint::of(&money(1000), &account("A"), &account("B"));
        assert_ne!(base, Fingerprint::of(&money(1001), &account("A"), &account("B")));
        assert_ne!(
            base,
            Fingerprint::of(
                &Money::new(1000, Currency::EUR).unwrap(),
                &account("A"),
                &account("B")
            )
        );
        assert_ne!(base, Fingerprint::of(&money(1000), &account("B"), &account("A")));
        assert_ne!(
            Fingerprint::of(&money(1), &account("ab"), &account("c")),
            Fingerprint::of(&money(1), &account("a"), &account("bc"))
        );
    }

    #[test]
    fn test_record_lease_and_expiry() {
        let now = Utc::now();
        let record = IdempotencyRecord::reserve(
            "key".into(),
            Fingerprint::of(&money(1), &account("A"), &account("B")),
            now,
            now + Duration::seconds(30),
            now + Duration::hours(24),
        );
        assert!(record.is_in_flight());
        assert!(!record.is_abandoned(now));
        assert!(record.is_abandoned(now + Duration::seconds(31)));
        assert!(!record.is_expired(now + Duration::hours(1)));
        assert!(record.is_expired(now + Duration::hours(24)));
    }
}
