//! Reconciliation reports
//!
//! Sums credits and debits over a range and checks the derived closing
//! balance against the last recorded one. Balances are integers, so
//! reconciled means a difference of exactly zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{AccountType, SignedPoints};
use crate::ledger::entry::LedgerEntry;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconciliationReport {
    pub account_id: String,
    pub account_type: AccountType,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    /// Net balance across buckets at the start of the range.
    pub starting_balance: SignedPoints,
    pub total_credits: SignedPoints,
    pub total_debits: SignedPoints,
    pub calculated_balance: SignedPoints,
    pub actual_balance: SignedPoints,
    pub difference: SignedPoints,
    pub reconciled: bool,
    pub entry_count: u64,
}

impl ReconciliationReport {
    /// Compute a report from the account's entries up to `to`, in time
    /// order. Entries strictly before `from` establish the starting
    /// balance.
    pub fn compute(
        account_id: &str,
        account_type: AccountType,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        entries: &[LedgerEntry],
    ) -> Self {
        // Per-bucket last balance_after before the window opens.
        let mut start_buckets = std::collections::HashMap::new();
        let mut end_buckets = std::collections::HashMap::new();
        let mut total_credits: SignedPoints = 0;
        let mut total_debits: SignedPoints = 0;
        let mut entry_count = 0u64;

        for e in entries {
            if e.timestamp > to {
                continue;
            }
            if e.timestamp < from {
                start_buckets.insert(e.balance_state, e.balance_after as SignedPoints);
            } else {
                entry_count += 1;
                if e.amount > 0 {
                    total_credits += e.amount;
                } else {
                    total_debits += -e.amount;
                }
            }
            end_buckets.insert(e.balance_state, e.balance_after as SignedPoints);
        }

        let starting_balance: SignedPoints = start_buckets.values().sum();
        let actual_balance: SignedPoints = end_buckets.values().sum();
        let calculated_balance = starting_balance + total_credits - total_debits;
        let difference = actual_balance - calculated_balance;

        Self {
            account_id: account_id.to_string(),
            account_type,
            from,
            to,
            starting_balance,
            total_credits,
            total_debits,
            calculated_balance,
            actual_balance,
            difference,
            reconciled: difference == 0,
            entry_count,
        }
    }
}
