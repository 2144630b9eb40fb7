//! Wallets and the escrow lifecycle
//!
//! The engine in this module is the only writer of wallet state. All
//! mutations go through optimistic concurrency control: read a row with its
//! current version, compute the new state, and write conditionally on the
//! version being unchanged.

pub mod engine;
pub mod escrow;
pub mod models;
pub mod occ;

pub use engine::{
    AwardRequest, DeductRequest, HoldRequest, HoldResult, PartialSettleRequest,
    PartialSettleResult, RefundRequest, RefundResult, SettleRequest, SettleResult, WalletEngine,
};
pub use escrow::{EscrowItem, EscrowStatus};
pub use models::{ModelWallet, ModelWalletType, UserBalance, Wallet};
