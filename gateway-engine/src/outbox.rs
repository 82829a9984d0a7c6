//! Outbox dispatcher.
//!
//! Publishes messages that transitions persisted in the outbox. A row is
//! marked published only after the broker acknowledged it; any failure
//! leaves it due again after a backoff. A published row that nobody consumed
//! within the redelivery timeout is published again, which covers deliveries
//! lost with a broker or a process. The broker may see a message more than
//! once but never loses one.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;

use gateway_types::{
    AppError, BrokerError, MessageBroker, OutboxMessage, OutboxStatus, OutboxStore,
};

use crate::config::OutboxConfig;
use crate::retry::{Backoff, bounded, chrono_duration};

/// Result of one dispatch pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

pub struct OutboxDispatcher<S, B> {
    store: Arc<S>,
    broker: Arc<B>,
    config: OutboxConfig,
    backoff: Backoff,
    db_timeout: std::time::Duration,
}

impl<S, B> OutboxDispatcher<S, B>
where
    S: OutboxStore,
    B: MessageBroker,
{
    pub fn new(
        store: Arc<S>,
        broker: Arc<B>,
        config: OutboxConfig,
        backoff: Backoff,
        db_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            broker,
            config,
            backoff,
            db_timeout,
        }
    }

    /// Claims due rows and publishes each one.
    pub async fn dispatch_once(&self) -> Result<DispatchSummary, AppError> {
        let now = Utc::now();
        let lease_until = now + chrono_duration(self.config.lease);
        let claimed = bounded(
            self.db_timeout,
            "claim_due_messages",
            self.store
                .claim_due_messages(self.config.batch_size, now, lease_until),
        )
        .await?;

        let mut summary = DispatchSummary {
            claimed: claimed.len(),
            ..DispatchSummary::default()
        };
        for message in claimed {
            if self.publish(&message).await? {
                summary.published += 1;
            } else {
                summary.failed += 1;
            }
        }

        if summary.claimed > 0 {
            tracing::debug!(
                claimed = summary.claimed,
                published = summary.published,
                failed = summary.failed,
                "Outbox pass finished"
            );
        }
        Ok(summary)
    }

    /// Publishes one message and records the outcome. Returns whether the
    /// broker accepted it.
    #[tracing::instrument(
        skip(self, message),
        fields(
            message_id = %message.id,
            transaction_id = %message.transaction_id,
            intent = %message.intent,
            sequence = message.sequence
        )
    )]
    async fn publish(&self, message: &OutboxMessage) -> Result<bool, AppError> {
        let outcome = tokio::time::timeout(
            self.config.broker_timeout,
            self.broker.publish(message.to_broker_message()),
        )
        .await;

        let kind = match outcome {
            Ok(Ok(())) => {
                let now = Utc::now();
                bounded(
                    self.db_timeout,
                    "mark_published",
                    self.store.mark_published(
                        message.id,
                        now,
                        now + chrono_duration(self.config.redelivery_timeout),
                    ),
                )
                .await?;
                if message.status == OutboxStatus::Published {
                    tracing::warn!(attempts = message.attempts, "Republished unconsumed outbox message");
                } else {
                    tracing::debug!("Outbox message published");
                }
                return Ok(true);
            }
            Ok(Err(BrokerError::Closed)) => "broker_closed",
            Ok(Err(_)) => "broker_unavailable",
            Err(_) => "broker_timeout",
        };

        let attempt = u32::try_from(message.attempts.max(0)).unwrap_or(u32::MAX) + 1;
        let next_attempt_at = Utc::now() + self.backoff.delay_chrono(attempt);
        bounded(
            self.db_timeout,
            "record_publish_failure",
            self.store
                .record_publish_failure(message.id, kind, next_attempt_at),
        )
        .await?;
        tracing::warn!(kind, attempt, "Outbox publish failed, will retry");
        Ok(false)
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.config.poll_interval.as_millis() as u64,
            "Outbox dispatcher started"
        );
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.dispatch_once().await {
                        tracing::warn!(kind = err.kind(), "Outbox pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("Outbox dispatcher stopped");
    }
}
