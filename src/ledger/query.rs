//! Ledger query types
//!
//! Filters compose into explicit equality predicates only; untrusted input
//! never shapes a query.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{AccountType, BalanceState, EntryType, Points};
use crate::ledger::entry::LedgerEntry;

/// Hard cap on page size; larger requests are silently clamped.
pub const MAX_PAGE_SIZE: u32 = 1000;

pub const DEFAULT_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortField {
    #[default]
    Timestamp,
    Amount,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Entry filter. All fields are optional equality predicates except the
/// date range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LedgerFilter {
    pub account_id: Option<String>,
    pub account_type: Option<AccountType>,
    pub entry_type: Option<EntryType>,
    pub reason: Option<String>,
    pub balance_state: Option<BalanceState>,
    pub transaction_id: Option<String>,
    pub escrow_id: Option<String>,
    pub queue_item_id: Option<String>,
    pub feature_type: Option<String>,
    pub correlation_id: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
    pub sort_field: SortField,
    pub sort_order: SortOrder,
}

impl LedgerFilter {
    /// Effective page size after clamping.
    pub fn effective_limit(&self) -> u32 {
        self.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE)
    }

    pub fn effective_offset(&self) -> u32 {
        self.offset.unwrap_or(0)
    }

    /// In-memory predicate; the Postgres store compiles the same filter to
    /// SQL. Both must agree.
    pub fn matches(&self, e: &LedgerEntry) -> bool {
        if let Some(ref v) = self.account_id
            && &e.account_id != v
        {
            return false;
        }
        if let Some(v) = self.account_type
            && e.account_type != v
        {
            return false;
        }
        if let Some(v) = self.entry_type
            && e.entry_type != v
        {
            return false;
        }
        if let Some(ref v) = self.reason
            && &e.reason != v
        {
            return false;
        }
        if let Some(v) = self.balance_state
            && e.balance_state != v
        {
            return false;
        }
        if let Some(ref v) = self.transaction_id
            && &e.transaction_id != v
        {
            return false;
        }
        if let Some(ref v) = self.escrow_id
            && e.escrow_id.as_ref() != Some(v)
        {
            return false;
        }
        if let Some(ref v) = self.queue_item_id
            && e.queue_item_id.as_ref() != Some(v)
        {
            return false;
        }
        if let Some(ref v) = self.feature_type
            && e.feature_type.as_ref() != Some(v)
        {
            return false;
        }
        if let Some(ref v) = self.correlation_id
            && e.correlation_id.as_ref() != Some(v)
        {
            return false;
        }
        if let Some(from) = self.from
            && e.timestamp < from
        {
            return false;
        }
        if let Some(to) = self.to
            && e.timestamp > to
        {
            return false;
        }
        true
    }
}

/// One page of entries plus total match count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerPage {
    pub entries: Vec<LedgerEntry>,
    pub total_count: u64,
    pub has_more: bool,
}

/// Balance read-model computed from the ledger, per bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceSnapshot {
    pub account_id: String,
    pub account_type: AccountType,
    pub available: Option<Points>,
    pub escrow: Option<Points>,
    pub earned: Option<Points>,
    pub as_of: DateTime<Utc>,
    pub currency: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_clamped() {
        let filter = LedgerFilter {
            limit: Some(5000),
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), MAX_PAGE_SIZE);

        let filter = LedgerFilter {
            limit: Some(10),
            ..Default::default()
        };
        assert_eq!(filter.effective_limit(), 10);

        let filter = LedgerFilter::default();
        assert_eq!(filter.effective_limit(), DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_default_sort() {
        let filter = LedgerFilter::default();
        assert_eq!(filter.sort_field, SortField::Timestamp);
        assert_eq!(filter.sort_order, SortOrder::Desc);
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let json = r#"{"account_id": "u1", "$where": "1==1"}"#;
        assert!(serde_json::from_str::<LedgerFilter>(json).is_err());
    }
}
