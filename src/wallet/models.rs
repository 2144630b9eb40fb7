//! Wallet records
//!
//! Balance fields are private. Every mutation is a validated method with
//! checked arithmetic, and every mutation bumps `version`, which is the
//! compare-and-set token for conditional store updates.
//!
//! # Invariants (enforced by private fields)
//! - `available + escrow` is conserved across any hold or release
//! - balances never go negative and never overflow
//! - a model wallet's `earned` only increases

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core_types::{ModelId, Points, UserId};

/// Dual-balance user wallet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Wallet {
    pub user_id: UserId,
    available_balance: Points,
    escrow_balance: Points,
    version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// Fresh zero-balance wallet. Wallets are created lazily on first
    /// mutation and never destroyed.
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            user_id,
            available_balance: 0,
            escrow_balance: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Rebuild a wallet from persisted state. Only stores call this.
    pub fn restore(
        user_id: UserId,
        available_balance: Points,
        escrow_balance: Points,
        version: u64,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            user_id,
            available_balance,
            escrow_balance,
            version,
            created_at,
            updated_at,
        }
    }

    #[inline]
    pub fn available(&self) -> Points {
        self.available_balance
    }

    #[inline]
    pub fn escrow(&self) -> Points {
        self.escrow_balance
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Total balance. None on overflow, which indicates data corruption.
    #[inline]
    pub fn total(&self) -> Option<Points> {
        self.available_balance.checked_add(self.escrow_balance)
    }

    fn touch(&mut self) {
        self.version = self.version.wrapping_add(1);
        self.updated_at = Utc::now();
    }

    /// Move funds from available into escrow. Conserves the total.
    pub fn hold(&mut self, amount: Points) -> Result<(), &'static str> {
        if self.available_balance < amount {
            return Err("Insufficient available balance");
        }
        self.available_balance = self
            .available_balance
            .checked_sub(amount)
            .ok_or("Hold available underflow")?;
        self.escrow_balance = self
            .escrow_balance
            .checked_add(amount)
            .ok_or("Hold escrow overflow")?;
        self.touch();
        Ok(())
    }

    /// Move funds from escrow back to available (refund path).
    pub fn release(&mut self, amount: Points) -> Result<(), &'static str> {
        if self.escrow_balance < amount {
            return Err("Insufficient escrow balance");
        }
        self.escrow_balance = self
            .escrow_balance
            .checked_sub(amount)
            .ok_or("Release escrow underflow")?;
        self.available_balance = self
            .available_balance
            .checked_add(amount)
            .ok_or("Release available overflow")?;
        self.touch();
        Ok(())
    }

    /// Remove funds from escrow without returning them (settlement path;
    /// the counterparty is credited separately).
    pub fn consume_escrow(&mut self, amount: Points) -> Result<(), &'static str> {
        if self.escrow_balance < amount {
            return Err("Insufficient escrow balance");
        }
        self.escrow_balance = self
            .escrow_balance
            .checked_sub(amount)
            .ok_or("Consume escrow underflow")?;
        self.touch();
        Ok(())
    }

    /// Partial settlement: one escrow bucket resolves into a refund leg and
    /// a consumed leg in a single version bump.
    pub fn split_escrow(&mut self, refund: Points, consume: Points) -> Result<(), &'static str> {
        let total = refund.checked_add(consume).ok_or("Split overflow")?;
        if self.escrow_balance < total {
            return Err("Insufficient escrow balance");
        }
        self.escrow_balance = self
            .escrow_balance
            .checked_sub(total)
            .ok_or("Split escrow underflow")?;
        self.available_balance = self
            .available_balance
            .checked_add(refund)
            .ok_or("Split available overflow")?;
        self.touch();
        Ok(())
    }

    /// Direct credit to available (award path).
    pub fn credit(&mut self, amount: Points) -> Result<(), &'static str> {
        self.available_balance = self
            .available_balance
            .checked_add(amount)
            .ok_or("Credit overflow")?;
        self.touch();
        Ok(())
    }

    /// Direct debit from available (deduct path).
    pub fn debit(&mut self, amount: Points) -> Result<(), &'static str> {
        if self.available_balance < amount {
            return Err("Insufficient available balance");
        }
        self.available_balance = self
            .available_balance
            .checked_sub(amount)
            .ok_or("Debit underflow")?;
        self.touch();
        Ok(())
    }
}

/// Counterparty wallet class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelWalletType {
    Promotional,
    Earnings,
}

impl ModelWalletType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelWalletType::Promotional => "promotional",
            ModelWalletType::Earnings => "earnings",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "promotional" => Some(ModelWalletType::Promotional),
            "earnings" => Some(ModelWalletType::Earnings),
            _ => None,
        }
    }
}

/// Counterparty ("model") earnings wallet. `earned` is a monotone
/// accumulator: settlement credits it, nothing debits it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelWallet {
    pub model_id: ModelId,
    earned_balance: Points,
    version: u64,
    pub wallet_type: ModelWalletType,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelWallet {
    pub fn new(model_id: ModelId, wallet_type: ModelWalletType) -> Self {
        let now = Utc::now();
        Self {
            model_id,
            earned_balance: 0,
            version: 0,
            wallet_type,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn restore(
        model_id: ModelId,
        earned_balance: Points,
        version: u64,
        wallet_type: ModelWalletType,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            model_id,
            earned_balance,
            version,
            wallet_type,
            created_at,
            updated_at,
        }
    }

    #[inline]
    pub fn earned(&self) -> Points {
        self.earned_balance
    }

    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Credit settled earnings. The only mutation this wallet has.
    pub fn credit_earned(&mut self, amount: Points) -> Result<(), &'static str> {
        self.earned_balance = self
            .earned_balance
            .checked_add(amount)
            .ok_or("Earned overflow")?;
        self.version = self.version.wrapping_add(1);
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Read-model snapshot returned by balance queries. Missing wallets read as
/// zeros.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserBalance {
    pub user_id: UserId,
    pub available_balance: Points,
    pub escrow_balance: Points,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wallet_with(available: Points) -> Wallet {
        let mut w = Wallet::new("u1".to_string());
        w.credit(available).unwrap();
        w
    }

    #[test]
    fn test_hold_conserves_total() {
        let mut w = wallet_with(1000);
        let total_before = w.total().unwrap();
        w.hold(400).unwrap();
        assert_eq!(w.available(), 600);
        assert_eq!(w.escrow(), 400);
        assert_eq!(w.total().unwrap(), total_before);
    }

    #[test]
    fn test_hold_insufficient() {
        let mut w = wallet_with(100);
        assert!(w.hold(101).is_err());
        assert_eq!(w.available(), 100);
        assert_eq!(w.escrow(), 0);
    }

    #[test]
    fn test_release_conserves_total() {
        let mut w = wallet_with(1000);
        w.hold(400).unwrap();
        let total_before = w.total().unwrap();
        w.release(400).unwrap();
        assert_eq!(w.available(), 1000);
        assert_eq!(w.escrow(), 0);
        assert_eq!(w.total().unwrap(), total_before);
    }

    #[test]
    fn test_consume_escrow() {
        let mut w = wallet_with(1000);
        w.hold(400).unwrap();
        w.consume_escrow(400).unwrap();
        assert_eq!(w.available(), 600);
        assert_eq!(w.escrow(), 0);
        assert_eq!(w.total().unwrap(), 600);
    }

    #[test]
    fn test_consume_more_than_escrow() {
        let mut w = wallet_with(1000);
        w.hold(100).unwrap();
        assert!(w.consume_escrow(200).is_err());
        assert_eq!(w.escrow(), 100);
    }

    #[test]
    fn test_split_escrow() {
        let mut w = wallet_with(1000);
        w.hold(300).unwrap();
        // 100 refunded, 200 consumed, single version bump
        let v = w.version();
        w.split_escrow(100, 200).unwrap();
        assert_eq!(w.available(), 800);
        assert_eq!(w.escrow(), 0);
        assert_eq!(w.version(), v + 1);
    }

    #[test]
    fn test_split_escrow_insufficient() {
        let mut w = wallet_with(1000);
        w.hold(100).unwrap();
        assert!(w.split_escrow(60, 60).is_err());
    }

    #[test]
    fn test_credit_overflow() {
        let mut w = Wallet::new("u1".to_string());
        w.credit(u64::MAX).unwrap();
        assert!(w.credit(1).is_err());
    }

    #[test]
    fn test_debit() {
        let mut w = wallet_with(50);
        assert!(w.debit(100).is_err());
        w.debit(50).unwrap();
        assert_eq!(w.available(), 0);
    }

    #[test]
    fn test_version_increments() {
        let mut w = Wallet::new("u1".to_string());
        assert_eq!(w.version(), 0);
        w.credit(100).unwrap();
        assert_eq!(w.version(), 1);
        w.hold(50).unwrap();
        assert_eq!(w.version(), 2);
        w.release(10).unwrap();
        assert_eq!(w.version(), 3);
    }

    #[test]
    fn test_model_wallet_monotone() {
        let mut m = ModelWallet::new("m1".to_string(), ModelWalletType::Earnings);
        m.credit_earned(100).unwrap();
        m.credit_earned(50).unwrap();
        assert_eq!(m.earned(), 150);
        assert_eq!(m.version(), 2);
    }
}
