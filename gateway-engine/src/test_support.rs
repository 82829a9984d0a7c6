//! In-memory store and scripted collaborators for engine unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use gateway_types::domain::ensure_balanced;
use gateway_types::{
    AccountBalance, AccountId, Currency, IdempotencyRecord, IdempotencyStore, LedgerEntry,
    LedgerReader, LedgerStore, OutboxMessage, OutboxMessageId, OutboxStatus, OutboxStore,
    ProcessorReport, ProcessorReportSource, RepoError, ReportError, ReserveOutcome,
    SettlementError, SettlementInstruction, SettlementProcessor, SettlementReceipt,
    Transaction, TransactionId, TransactionReader, TransactionStore, TransactionWrite,
    UnitOfWork,
};

#[derive(Default)]
struct State {
    transactions: HashMap<TransactionId, Transaction>,
    ledger: Vec<LedgerEntry>,
    balances: HashMap<(AccountId, Currency), AccountBalance>,
    outbox: Vec<OutboxMessage>,
    idempotency: HashMap<String, IdempotencyRecord>,
    next_sequence: i64,
}

impl State {
    fn append(&mut self, entries: Vec<LedgerEntry>) -> Vec<LedgerEntry> {
        let mut stored = Vec::with_capacity(entries.len());
        for mut entry in entries {
            self.next_sequence += 1;
            entry.sequence = Some(self.next_sequence);
            let balance = self
                .balances
                .entry((entry.account_id.clone(), entry.amount.currency()))
                .or_insert_with(|| AccountBalance {
                    account_id: entry.account_id.clone(),
                    currency: entry.amount.currency(),
                    balance: 0,
                    last_sequence: 0,
                });
            balance.balance += entry.signed_amount();
            balance.last_sequence = self.next_sequence;
            self.ledger.push(entry.clone());
            stored.push(entry);
        }
        stored
    }
}

/// Store that commits every unit under one lock.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    commits: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes commits, ledger appends and outbox claims fail with a database
    /// error until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn ledger_len(&self) -> usize {
        self.state.lock().unwrap().ledger.len()
    }

    pub fn outbox(&self) -> Vec<OutboxMessage> {
        self.state.lock().unwrap().outbox.clone()
    }

    /// Overwrites a running balance without a ledger entry, simulating drift.
    pub fn corrupt_balance(&self, account: &AccountId, currency: Currency, balance: i64) {
        let mut state = self.state.lock().unwrap();
        if let Some(row) = state.balances.get_mut(&(account.clone(), currency)) {
            row.balance = balance;
        }
    }

    /// Ages a transaction so that it looks stuck.
    pub fn backdate(&self, id: TransactionId, updated_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        if let Some(tx) = state.transactions.get_mut(&id) {
            tx.updated_at = updated_at;
        }
    }

    fn check_available(&self) -> Result<(), RepoError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RepoError::Database("store unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl TransactionReader for InMemoryStore {
    async fn get_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<Transaction>, RepoError> {
        Ok(self.state.lock().unwrap().transactions.get(&id).cloned())
    }

    async fn find_by_idempotency_key(
        &self,
        key: &str,
    ) -> Result<Option<Transaction>, RepoError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .transactions
            .values()
            .find(|tx| tx.idempotency_key == key)
            .cloned())
    }

    async fn list_stale_transactions(
        &self,
        updated_before: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Transaction>, RepoError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<Transaction> = state
            .transactions
            .values()
            .filter(|tx| tx.status.is_in_flight() && tx.updated_at < updated_before)
            .cloned()
            .collect();
        rows.sort_by_key(|tx| tx.updated_at);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }
}

#[async_trait]
impl TransactionStore for InMemoryStore {
    async fn commit(&self, unit: UnitOfWork) -> Result<Transaction, RepoError> {
        self.check_available()?;
        if !unit.ledger_entries.is_empty() {
            ensure_balanced(&unit.ledger_entries)?;
        }

        let mut state = self.state.lock().unwrap();
        let stored = match unit.write {
            TransactionWrite::Insert(tx) => {
                if state
                    .transactions
                    .values()
                    .any(|t| t.idempotency_key == tx.idempotency_key)
                {
                    return Err(RepoError::Conflict("idempotency_key".into()));
                }
                tx
            }
            TransactionWrite::Update {
                next,
                expected_version,
            } => match state.transactions.get(&next.id) {
                None => return Err(RepoError::NotFound),
                Some(current) if current.version != expected_version => {
                    return Err(RepoError::VersionConflict {
                        transaction_id: next.id,
                        expected: expected_version,
                    });
                }
                Some(_) => next,
            },
        };

        state.transactions.insert(stored.id, stored.clone());
        if !unit.ledger_entries.is_empty() {
            state.append(unit.ledger_entries);
        }
        if let Some(message) = unit.outbox {
            state.outbox.push(message);
        }
        if let Some(id) = unit.consumes {
            if let Some(message) = state.outbox.iter_mut().find(|m| m.id == id) {
                message.status = OutboxStatus::Consumed;
                message.consumed_at = Some(stored.updated_at);
            }
        }
        if let Some(key) = unit.resolves_idempotency {
            if let Some(record) = state.idempotency.get_mut(&key) {
                record.transaction_id = Some(stored.id);
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(stored)
    }
}

#[async_trait]
impl LedgerReader for InMemoryStore {
    async fn entries_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<LedgerEntry>, RepoError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .ledger
            .iter()
            .filter(|e| e.transaction_id == id)
            .cloned()
            .collect())
    }

    async fn entries_for_account(
        &self,
        account: &AccountId,
        currency: Currency,
    ) -> Result<Vec<LedgerEntry>, RepoError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .ledger
            .iter()
            .filter(|e| &e.account_id == account && e.amount.currency() == currency)
            .cloned()
            .collect())
    }

    async fn account_balance(
        &self,
        account: &AccountId,
        currency: Currency,
    ) -> Result<i64, RepoError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(&(account.clone(), currency))
            .map(|b| b.balance)
            .unwrap_or(0))
    }

    async fn list_account_balances(&self) -> Result<Vec<AccountBalance>, RepoError> {
        let mut rows: Vec<AccountBalance> =
            self.state.lock().unwrap().balances.values().cloned().collect();
        rows.sort_by(|a, b| {
            (a.account_id.expose(), a.currency).cmp(&(b.account_id.expose(), b.currency))
        });
        Ok(rows)
    }
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn append_entries(
        &self,
        entries: Vec<LedgerEntry>,
    ) -> Result<Vec<LedgerEntry>, RepoError> {
        self.check_available()?;
        ensure_balanced(&entries)?;
        Ok(self.state.lock().unwrap().append(entries))
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn claim_due_messages(
        &self,
        limit: i64,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<OutboxMessage>, RepoError> {
        self.check_available()?;
        let mut state = self.state.lock().unwrap();
        let mut claimed = Vec::new();
        for message in state.outbox.iter_mut() {
            if claimed.len() as i64 >= limit {
                break;
            }
            let due = matches!(message.status, OutboxStatus::Pending | OutboxStatus::Published)
                && message.next_attempt_at <= now;
            if due {
                message.next_attempt_at = lease_until;
                claimed.push(message.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_published(
        &self,
        id: OutboxMessageId,
        at: DateTime<Utc>,
        redeliver_at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state
            .outbox
            .iter_mut()
            .find(|m| m.id == id && m.status != OutboxStatus::Consumed)
        {
            message.status = OutboxStatus::Published;
            message.published_at = Some(at);
            message.next_attempt_at = redeliver_at;
            message.attempts += 1;
            message.last_error = None;
        }
        Ok(())
    }

    async fn record_publish_failure(
        &self,
        id: OutboxMessageId,
        error: &str,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state
            .outbox
            .iter_mut()
            .find(|m| m.id == id && m.status != OutboxStatus::Consumed)
        {
            message.attempts += 1;
            message.last_error = Some(error.to_string());
            message.next_attempt_at = next_attempt_at;
        }
        Ok(())
    }

    async fn get_outbox_message(
        &self,
        id: OutboxMessageId,
    ) -> Result<Option<OutboxMessage>, RepoError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .outbox
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn mark_consumed(
        &self,
        id: OutboxMessageId,
        at: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let mut state = self.state.lock().unwrap();
        match state
            .outbox
            .iter_mut()
            .find(|m| m.id == id && m.status != OutboxStatus::Consumed)
        {
            Some(message) => {
                message.status = OutboxStatus::Consumed;
                message.consumed_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_outbox_for_transaction(
        &self,
        id: TransactionId,
    ) -> Result<Vec<OutboxMessage>, RepoError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .outbox
            .iter()
            .filter(|m| m.transaction_id == id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryStore {
    async fn reserve_key(
        &self,
        record: &IdempotencyRecord,
    ) -> Result<ReserveOutcome, RepoError> {
        let mut state = self.state.lock().unwrap();
        match state.idempotency.get(&record.key) {
            Some(existing) => Ok(ReserveOutcome::Existing(existing.clone())),
            None => {
                state.idempotency.insert(record.key.clone(), record.clone());
                Ok(ReserveOutcome::Reserved)
            }
        }
    }

    async fn get_idempotency_record(
        &self,
        key: &str,
    ) -> Result<Option<IdempotencyRecord>, RepoError> {
        Ok(self.state.lock().unwrap().idempotency.get(key).cloned())
    }

    async fn take_over_key(
        &self,
        record: &IdempotencyRecord,
        now: DateTime<Utc>,
    ) -> Result<bool, RepoError> {
        let mut state = self.state.lock().unwrap();
        match state.idempotency.get_mut(&record.key) {
            Some(existing) if existing.is_abandoned(now) || existing.is_expired(now) => {
                *existing = record.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_key(&self, key: &str) -> Result<(), RepoError> {
        let mut state = self.state.lock().unwrap();
        if state
            .idempotency
            .get(key)
            .is_some_and(IdempotencyRecord::is_in_flight)
        {
            state.idempotency.remove(key);
        }
        Ok(())
    }

    async fn purge_expired_keys(&self, now: DateTime<Utc>) -> Result<u64, RepoError> {
        let mut state = self.state.lock().unwrap();
        let before = state.idempotency.len();
        state.idempotency.retain(|_, r| !r.is_expired(now));
        Ok((before - state.idempotency.len()) as u64)
    }
}

// ─────────────────────────────────────────────────────────────────────────
// Settlement processor and report source
// ─────────────────────────────────────────────────────────────────────────

/// Processor that replays queued outcomes, then succeeds.
#[derive(Default)]
pub struct ScriptedProcessor {
    outcomes: Mutex<VecDeque<Result<(), SettlementError>>>,
    settle_calls: AtomicUsize,
    refund_calls: AtomicUsize,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(times: usize, error: SettlementError) -> Self {
        let processor = Self::new();
        for _ in 0..times {
            processor.push(Err(error.clone()));
        }
        processor
    }

    pub fn push(&self, outcome: Result<(), SettlementError>) {
        self.outcomes.lock().unwrap().push_back(outcome);
    }

    pub fn settle_calls(&self) -> usize {
        self.settle_calls.load(Ordering::SeqCst)
    }

    pub fn refund_calls(&self) -> usize {
        self.refund_calls.load(Ordering::SeqCst)
    }

    fn next(&self, instruction: &SettlementInstruction) -> Result<SettlementReceipt, SettlementError> {
        let outcome = self.outcomes.lock().unwrap().pop_front().unwrap_or(Ok(()));
        outcome.map(|_| SettlementReceipt {
            processor_reference: format!("proc-{}", instruction.transaction_id),
        })
    }
}

#[async_trait]
impl SettlementProcessor for ScriptedProcessor {
    async fn settle(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, SettlementError> {
        self.settle_calls.fetch_add(1, Ordering::SeqCst);
        self.next(instruction)
    }

    async fn refund(
        &self,
        instruction: &SettlementInstruction,
    ) -> Result<SettlementReceipt, SettlementError> {
        self.refund_calls.fetch_add(1, Ordering::SeqCst);
        self.next(instruction)
    }
}

/// Report source returning a fixed report.
pub struct StaticReport(pub ProcessorReport);

#[async_trait]
impl ProcessorReportSource for StaticReport {
    async fn fetch_report(&self) -> Result<ProcessorReport, ReportError> {
        Ok(self.0.clone())
    }
}
