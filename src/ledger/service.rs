//! Ledger service
//!
//! The only writer of ledger entries. Creation is idempotent: the global
//! unique index on `idempotency_key` turns duplicate inserts into reads of
//! the winning entry.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core_types::{AccountType, BalanceState, new_id, now};
use crate::error::PointsError;
use crate::events::bus::{EventBus, PublishMode};
use crate::events::{EventPayload, PointsEvent};
use crate::ledger::entry::{CreateEntryRequest, LedgerEntry};
use crate::ledger::query::{BalanceSnapshot, LedgerFilter, LedgerPage};
use crate::ledger::reconciliation::ReconciliationReport;
use crate::store::LedgerEntryStore;

pub struct LedgerService {
    store: Arc<dyn LedgerEntryStore>,
    currency: String,
    bus: Option<Arc<EventBus>>,
}

impl LedgerService {
    pub fn new(store: Arc<dyn LedgerEntryStore>, currency: String) -> Self {
        Self {
            store,
            currency,
            bus: None,
        }
    }

    /// Announce entry creation on the bus (fire-and-forget).
    pub fn with_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Create one immutable entry.
    ///
    /// Validates the balance law and sign law, then appends. A duplicate
    /// `idempotency_key` is not an error: the stored entry is returned.
    pub async fn create_entry(
        &self,
        request: CreateEntryRequest,
    ) -> Result<LedgerEntry, PointsError> {
        request.validate()?;

        let entry = LedgerEntry {
            entry_id: new_id("led"),
            transaction_id: request
                .transaction_id
                .unwrap_or_else(|| new_id("txn")),
            account_id: request.account_id,
            account_type: request.account_type,
            amount: request.amount,
            entry_type: request.entry_type,
            balance_state: request.balance_state,
            state_transition: request.state_transition,
            reason: request.reason,
            idempotency_key: request.idempotency_key,
            request_id: request.request_id,
            balance_before: request.balance_before,
            balance_after: request.balance_after,
            timestamp: now(),
            currency: self.currency.clone(),
            escrow_id: request.escrow_id,
            queue_item_id: request.queue_item_id,
            feature_type: request.feature_type,
            correlation_id: request.correlation_id,
            metadata: request.metadata,
        };

        let outcome = self.store.insert_entry(entry).await?;
        let was_duplicate = outcome.is_duplicate();
        if was_duplicate {
            debug!("ledger entry insert deduplicated on idempotency key");
        }
        let entry = outcome.into_record();
        info!(
            entry_id = %entry.entry_id,
            tx_id = %entry.transaction_id,
            account_id = %entry.account_id,
            amount = entry.amount,
            state = %entry.balance_state,
            "ledger entry recorded"
        );

        if let Some(bus) = &self.bus
            && !was_duplicate
        {
            bus.publish_with_mode(
                PointsEvent::new(
                    "ledger_service",
                    format!("{}_ledger", entry.idempotency_key),
                    EventPayload::LedgerEntryCreated {
                        entry_id: entry.entry_id.clone(),
                        transaction_id: entry.transaction_id.clone(),
                        account_id: entry.account_id.clone(),
                        amount: entry.amount,
                    },
                ),
                PublishMode::Spawn,
            )
            .await;
        }

        Ok(entry)
    }

    pub async fn get_entry(&self, entry_id: &str) -> Result<Option<LedgerEntry>, PointsError> {
        self.store.get_entry(entry_id).await
    }

    pub async fn query_entries(&self, filter: &LedgerFilter) -> Result<LedgerPage, PointsError> {
        self.store.query_entries(filter).await
    }

    /// Entries grouped by transaction, in time order.
    pub async fn get_audit_trail(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<LedgerEntry>, PointsError> {
        self.store.entries_by_transaction(transaction_id).await
    }

    /// Entries sharing a correlation id, in time order.
    pub async fn get_correlated_entries(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<LedgerEntry>, PointsError> {
        let filter = LedgerFilter {
            correlation_id: Some(correlation_id.to_string()),
            sort_order: crate::ledger::query::SortOrder::Asc,
            ..Default::default()
        };
        Ok(self.store.query_entries(&filter).await?.entries)
    }

    /// Balance read-model at `as_of` (now if omitted), computed by scanning
    /// the account's entries in time order and keeping the last
    /// `balance_after` per bucket relevant to the account type.
    pub async fn get_balance_snapshot(
        &self,
        account_id: &str,
        account_type: AccountType,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<BalanceSnapshot, PointsError> {
        let as_of_ts = as_of.unwrap_or_else(now);
        let entries = self.store.entries_for_account(account_id, as_of).await?;

        let mut available = None;
        let mut escrow = None;
        let mut earned = None;
        for e in &entries {
            match e.balance_state {
                BalanceState::Available => available = Some(e.balance_after),
                BalanceState::Escrow => escrow = Some(e.balance_after),
                BalanceState::Earned => earned = Some(e.balance_after),
            }
        }

        Ok(match account_type {
            AccountType::User => BalanceSnapshot {
                account_id: account_id.to_string(),
                account_type,
                available: Some(available.unwrap_or(0)),
                escrow: Some(escrow.unwrap_or(0)),
                earned: None,
                as_of: as_of_ts,
                currency: self.currency.clone(),
            },
            AccountType::Model => BalanceSnapshot {
                account_id: account_id.to_string(),
                account_type,
                available: None,
                escrow: None,
                earned: Some(earned.unwrap_or(0)),
                as_of: as_of_ts,
                currency: self.currency.clone(),
            },
        })
    }

    /// Compare ledger-derived balance movement over a range against the
    /// actual closing balance. A non-reconciled report is a hard alert and
    /// is never corrected silently.
    pub async fn generate_reconciliation_report(
        &self,
        account_id: &str,
        account_type: AccountType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<ReconciliationReport, PointsError> {
        let entries = self.store.entries_for_account(account_id, Some(to)).await?;
        Ok(ReconciliationReport::compute(
            account_id,
            account_type,
            from,
            to,
            &entries,
        ))
    }
}
