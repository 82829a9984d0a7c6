//! Idempotency guard.
//!
//! Admits each idempotency key exactly once. A retry with the same payload
//! is resolved to the transaction the first request created; a retry with a
//! different payload is rejected. A caller that arrives while the first
//! request is still in flight waits for it, bounded by the configured wait.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use gateway_types::{
    AppError, Fingerprint, IdempotencyRecord, IdempotencyStore, ReserveOutcome, TransactionId,
};

use crate::config::IdempotencyConfig;
use crate::retry::{bounded, chrono_duration};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Outcome of admitting a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First sight: the caller owns the key and must resolve or release it.
    New,
    /// Same payload seen before; resolved to this transaction.
    Duplicate(TransactionId),
    /// Same key, different payload.
    Conflict,
}

pub struct IdempotencyGuard<S: IdempotencyStore> {
    store: Arc<S>,
    config: IdempotencyConfig,
    db_timeout: Duration,
}

impl<S: IdempotencyStore> Clone for IdempotencyGuard<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config.clone(),
            db_timeout: self.db_timeout,
        }
    }
}

impl<S: IdempotencyStore> IdempotencyGuard<S> {
    pub fn new(store: Arc<S>, config: IdempotencyConfig, db_timeout: Duration) -> Self {
        Self {
            store,
            config,
            db_timeout,
        }
    }

    /// Admits `key` for a request with `fingerprint`.
    ///
    /// Fails with `TransientDependency` when an in-flight original does not
    /// resolve within the configured wait.
    #[tracing::instrument(skip(self, key, fingerprint))]
    pub async fn admit(&self, key: &str, fingerprint: &Fingerprint) -> Result<Admission, AppError> {
        let deadline = tokio::time::Instant::now() + self.config.wait;

        loop {
            let now = Utc::now();
            let record = IdempotencyRecord::reserve(
                key.to_string(),
                fingerprint.clone(),
                now,
                now + chrono_duration(self.config.lease),
                now + chrono_duration(self.config.ttl),
            );

            let existing = match bounded(
                self.db_timeout,
                "reserve_key",
                self.store.reserve_key(&record),
            )
            .await?
            {
                ReserveOutcome::Reserved => {
                    tracing::debug!("Idempotency key reserved");
                    return Ok(Admission::New);
                }
                ReserveOutcome::Existing(existing) => existing,
            };

            if existing.is_expired(now) || existing.is_abandoned(now) {
                let taken = bounded(
                    self.db_timeout,
                    "take_over_key",
                    self.store.take_over_key(&record, now),
                )
                .await?;
                if taken {
                    tracing::info!("Took over stale idempotency reservation");
                    return Ok(Admission::New);
                }
                continue;
            }

            if &existing.fingerprint != fingerprint {
                tracing::warn!("Idempotency key reused with a different payload");
                return Ok(Admission::Conflict);
            }

            if let Some(transaction_id) = existing.transaction_id {
                tracing::debug!(%transaction_id, "Duplicate request resolved");
                return Ok(Admission::Duplicate(transaction_id));
            }

            if tokio::time::Instant::now() >= deadline {
                tracing::warn!("Timed out waiting for in-flight request with the same key");
                return Err(AppError::TransientDependency(
                    "request with the same idempotency key is still in flight".into(),
                ));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Drops an unresolved reservation so that a retry can start over.
    pub async fn release(&self, key: &str) -> Result<(), AppError> {
        bounded(self.db_timeout, "release_key", self.store.release_key(key)).await
    }

    /// Deletes expired records. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64, AppError> {
        let purged = bounded(
            self.db_timeout,
            "purge_expired_keys",
            self.store.purge_expired_keys(Utc::now()),
        )
        .await?;
        if purged > 0 {
            tracing::info!(purged, "Purged expired idempotency keys");
        }
        Ok(purged)
    }
}
