//! End-to-end escrow lifecycle scenarios against the in-memory store.

use std::sync::Arc;

use chrono::Utc;
use pointflow::app::PointsCore;
use pointflow::authz::capability::{CapabilityClaims, CapabilityType};
use pointflow::config::AppConfig;
use pointflow::core_types::{BalanceState, EntryType};
use pointflow::error::PointsError;
use pointflow::ledger::LedgerFilter;
use pointflow::wallet::engine::{
    AwardRequest, HoldRequest, PartialSettleRequest, RefundRequest, SettleRequest,
};
use pointflow::wallet::EscrowStatus;

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.wallet.retry_backoff_ms = 1;
    config.events.handler_retry_delay_ms = 1;
    config
}

fn uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

async fn core_with_user(user_id: &str, balance: i64) -> PointsCore {
    let core = PointsCore::in_memory(fast_config()).await;
    core.engine
        .award_points(AwardRequest {
            user_id: user_id.into(),
            amount: balance,
            reason: "initial_grant".into(),
            idempotency_key: uuid(),
            request_id: "req-seed".into(),
        })
        .await
        .unwrap();
    core
}

fn hold(user_id: &str, amount: i64, key: &str, queue_item: &str) -> HoldRequest {
    HoldRequest {
        user_id: user_id.into(),
        amount,
        reason: "spin_wager".into(),
        queue_item_id: queue_item.into(),
        feature_type: "slot_machine".into(),
        idempotency_key: key.into(),
        request_id: "req-hold".into(),
        metadata: None,
    }
}

fn settlement_token(core: &PointsCore, queue_item: &str, escrow_id: &str, amount: u64) -> String {
    token(
        core,
        CapabilityType::QueueSettlement,
        queue_item,
        escrow_id,
        Some(amount),
        None,
        None,
    )
}

fn refund_token(core: &PointsCore, queue_item: &str, escrow_id: &str, amount: u64) -> String {
    token(
        core,
        CapabilityType::QueueRefund,
        queue_item,
        escrow_id,
        Some(amount),
        None,
        None,
    )
}

fn token(
    core: &PointsCore,
    token_type: CapabilityType,
    queue_item: &str,
    escrow_id: &str,
    amount: Option<u64>,
    refund_amount: Option<u64>,
    settle_amount: Option<u64>,
) -> String {
    let now = Utc::now().timestamp();
    core.authorizer
        .issue(&CapabilityClaims {
            iss: "queue-service".into(),
            sub: "queue-worker-1".into(),
            token_type,
            queue_item_id: queue_item.into(),
            escrow_id: escrow_id.into(),
            amount,
            refund_amount,
            settle_amount,
            reason: None,
            iat: now,
            exp: now + 60,
        })
        .unwrap()
}

/// Scenario: hold then settle. Balances route available -> escrow ->
/// model earned, with the expected ledger shape at each step.
#[tokio::test]
async fn hold_then_settle_routes_to_model() {
    let core = core_with_user("U", 1000).await;

    let held = core
        .engine
        .hold_in_escrow(hold("U", 100, &uuid(), "q1"))
        .await
        .unwrap();
    assert_eq!(held.new_available_balance, 900);
    assert_eq!(held.escrow_balance, 100);

    let trail = core.ledger.get_audit_trail(&held.transaction_id).await.unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[0].entry_type, EntryType::Debit);
    assert_eq!(trail[1].entry_type, EntryType::Credit);
    assert_eq!(trail[1].balance_state, BalanceState::Escrow);

    let escrow = core.engine.get_escrow(&held.escrow_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Held);

    let token = settlement_token(&core, "q1", &held.escrow_id, 100);
    let settled = core
        .engine
        .settle_escrow(
            SettleRequest {
                escrow_id: held.escrow_id.clone(),
                queue_item_id: "q1".into(),
                model_id: "M".into(),
                amount: 100,
                idempotency_key: uuid(),
                request_id: "req-settle".into(),
            },
            &token,
        )
        .await
        .unwrap();
    assert_eq!(settled.settled_amount, 100);
    assert_eq!(settled.model_earned_balance, 100);

    let user = core.engine.get_user_balance("U").await.unwrap();
    assert_eq!(user.available_balance, 900);
    assert_eq!(user.escrow_balance, 0);
    assert_eq!(core.engine.get_model_balance("M").await.unwrap(), 100);

    // exactly one settlement entry, on the model, escrow->earned
    let trail = core
        .ledger
        .get_audit_trail(&settled.transaction_id)
        .await
        .unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].account_id, "M");
    assert_eq!(trail[0].balance_state, BalanceState::Earned);
    assert_eq!(trail[0].state_transition, "escrow->earned");
    assert_eq!(trail[0].amount, 100);
}

/// Scenario: hold then refund returns available to its pre-hold value.
#[tokio::test]
async fn hold_then_refund_is_identity_on_available() {
    let core = core_with_user("U", 1000).await;

    let held = core
        .engine
        .hold_in_escrow(hold("U", 100, &uuid(), "q1"))
        .await
        .unwrap();

    let token = refund_token(&core, "q1", &held.escrow_id, 100);
    let refunded = core
        .engine
        .refund_escrow(
            RefundRequest {
                escrow_id: held.escrow_id.clone(),
                queue_item_id: "q1".into(),
                amount: 100,
                idempotency_key: uuid(),
                request_id: "req-refund".into(),
            },
            &token,
        )
        .await
        .unwrap();
    assert_eq!(refunded.user_available_balance, 1000);

    let user = core.engine.get_user_balance("U").await.unwrap();
    assert_eq!(user.available_balance, 1000);
    assert_eq!(user.escrow_balance, 0);

    let escrow = core.engine.get_escrow(&held.escrow_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Refunded);

    let trail = core
        .ledger
        .get_audit_trail(&refunded.transaction_id)
        .await
        .unwrap();
    assert_eq!(trail.len(), 1);
    assert_eq!(trail[0].account_id, "U");
    assert_eq!(trail[0].state_transition, "escrow->available");
    assert_eq!(trail[0].amount, 100);
}

/// Scenario: a repeated hold with the same key replays the stored result
/// and leaves exactly one escrow item.
#[tokio::test]
async fn idempotent_hold_replays_identically() {
    let core = core_with_user("U", 1000).await;
    let key = uuid();

    let first = core
        .engine
        .hold_in_escrow(hold("U", 100, &key, "q1"))
        .await
        .unwrap();
    let second = core
        .engine
        .hold_in_escrow(hold("U", 100, &key, "q1"))
        .await
        .unwrap();
    assert_eq!(first, second);

    let user = core.engine.get_user_balance("U").await.unwrap();
    assert_eq!(user.available_balance, 900);
    assert_eq!(user.escrow_balance, 100);
    assert_eq!(
        core.engine.list_escrows("U", None, 10, 0).await.unwrap().len(),
        1
    );
}

/// Scenario: concurrent holds against a balance that cannot satisfy all
/// of them. The wallet never goes negative and every failure is a
/// retryable conflict or a precondition failure.
#[tokio::test]
async fn concurrent_holds_conserve_balance() {
    let core = Arc::new(core_with_user("U", 500).await);

    let mut handles = Vec::new();
    for i in 0..3 {
        let core = core.clone();
        handles.push(tokio::spawn(async move {
            core.engine
                .hold_in_escrow(hold("U", 200, &uuid(), &format!("q{i}")))
                .await
        }));
    }

    let mut successes: u64 = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => successes += 1,
            Err(e) => assert!(
                matches!(
                    e,
                    PointsError::InsufficientBalance | PointsError::OptimisticLockConflict
                ),
                "unexpected failure kind: {e}"
            ),
        }
    }

    let user = core.engine.get_user_balance("U").await.unwrap();
    assert_eq!(user.available_balance, 500 - 200 * successes);
    assert_eq!(user.escrow_balance, 200 * successes);
    assert!((1..=2).contains(&successes));
}

/// Scenario: partial settlement splits the held amount between the user
/// and the model under one transaction id.
#[tokio::test]
async fn partial_settle_splits_both_ways() {
    let core = core_with_user("U", 1000).await;

    let held = core
        .engine
        .hold_in_escrow(hold("U", 300, &uuid(), "q1"))
        .await
        .unwrap();

    let token = token(
        &core,
        CapabilityType::QueuePartialSettlement,
        "q1",
        &held.escrow_id,
        None,
        Some(120),
        Some(180),
    );
    let result = core
        .engine
        .partial_settle_escrow(
            PartialSettleRequest {
                escrow_id: held.escrow_id.clone(),
                queue_item_id: "q1".into(),
                model_id: "M".into(),
                refund_amount: 120,
                settle_amount: 180,
                idempotency_key: uuid(),
                request_id: "req-partial".into(),
            },
            &token,
        )
        .await
        .unwrap();
    assert_eq!(result.user_available_balance, 820);
    assert_eq!(result.model_earned_balance, 180);

    let trail = core
        .ledger
        .get_audit_trail(&result.transaction_id)
        .await
        .unwrap();
    assert_eq!(trail.len(), 2);
    // user refund leg written before the model settle leg
    assert_eq!(trail[0].account_id, "U");
    assert_eq!(trail[1].account_id, "M");

    let escrow = core.engine.get_escrow(&held.escrow_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Settled);
}

/// Boundary: mismatched split totals are rejected before any mutation.
#[tokio::test]
async fn partial_settle_mismatch_rejected() {
    let core = core_with_user("U", 1000).await;
    let held = core
        .engine
        .hold_in_escrow(hold("U", 300, &uuid(), "q1"))
        .await
        .unwrap();

    let token = token(
        &core,
        CapabilityType::QueuePartialSettlement,
        "q1",
        &held.escrow_id,
        None,
        None,
        None,
    );
    let err = core
        .engine
        .partial_settle_escrow(
            PartialSettleRequest {
                escrow_id: held.escrow_id,
                queue_item_id: "q1".into(),
                model_id: "M".into(),
                refund_amount: 100,
                settle_amount: 150,
                idempotency_key: uuid(),
                request_id: "req-partial".into(),
            },
            &token,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    let user = core.engine.get_user_balance("U").await.unwrap();
    assert_eq!(user.escrow_balance, 300);
}

/// Property: every ledger entry obeys the balance law, and every escrow
/// operation's entries share a transaction id with the expected count.
#[tokio::test]
async fn ledger_entries_obey_balance_law() {
    let core = core_with_user("U", 1000).await;

    let held = core
        .engine
        .hold_in_escrow(hold("U", 250, &uuid(), "q1"))
        .await
        .unwrap();
    let token = settlement_token(&core, "q1", &held.escrow_id, 250);
    core.engine
        .settle_escrow(
            SettleRequest {
                escrow_id: held.escrow_id,
                queue_item_id: "q1".into(),
                model_id: "M".into(),
                amount: 250,
                idempotency_key: uuid(),
                request_id: "req-settle".into(),
            },
            &token,
        )
        .await
        .unwrap();

    let page = core
        .ledger
        .query_entries(&LedgerFilter::default())
        .await
        .unwrap();
    assert!(page.total_count >= 4); // award + 2 hold legs + settle
    for entry in &page.entries {
        assert_eq!(
            entry.balance_after as i64 - entry.balance_before as i64,
            entry.amount,
            "balance law violated by {}",
            entry.entry_id
        );
        match entry.entry_type {
            EntryType::Credit => assert!(entry.amount > 0),
            EntryType::Debit => assert!(entry.amount < 0),
        }
    }
}

/// Boundary: a settlement token whose escrow id does not match, or which
/// has expired, never authorizes anything.
#[tokio::test]
async fn settlement_requires_exact_scope() {
    let core = core_with_user("U", 1000).await;
    let held = core
        .engine
        .hold_in_escrow(hold("U", 100, &uuid(), "q1"))
        .await
        .unwrap();

    // token minted for a different escrow
    let wrong = settlement_token(&core, "q1", "esc_other", 100);
    let err = core
        .engine
        .settle_escrow(
            SettleRequest {
                escrow_id: held.escrow_id.clone(),
                queue_item_id: "q1".into(),
                model_id: "M".into(),
                amount: 100,
                idempotency_key: uuid(),
                request_id: "req".into(),
            },
            &wrong,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_AUTHORIZATION");

    // escrow untouched
    let escrow = core.engine.get_escrow(&held.escrow_id).await.unwrap().unwrap();
    assert_eq!(escrow.status, EscrowStatus::Held);
}
