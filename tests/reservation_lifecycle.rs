//! Reservation lifecycle scenarios: reserve/commit/release, expiry sweep,
//! and the sweeper-vs-commit race.

use pointflow::app::PointsCore;
use pointflow::config::AppConfig;
use pointflow::reservation::ReservationStatus;
use pointflow::wallet::engine::AwardRequest;

fn fast_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.wallet.retry_backoff_ms = 1;
    config.reservations.sweep_interval_ms = 5;
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

#[tokio::test]
async fn reserve_release_is_identity() {
    let core = core_with_user("U", 1000).await;

    let reserved = core
        .reservations
        .reserve("U", 100, None, &uuid())
        .await
        .unwrap();
    assert_eq!(reserved.new_available_balance, 900);

    core.reservations
        .release(&reserved.reservation_id, &uuid())
        .await
        .unwrap();

    let user = core.engine.get_user_balance("U").await.unwrap();
    assert_eq!(user.available_balance, 1000);
    assert_eq!(user.escrow_balance, 0);
}

#[tokio::test]
async fn commit_settles_to_recipient() {
    let core = core_with_user("U", 1000).await;

    let reserved = core
        .reservations
        .reserve("U", 100, None, &uuid())
        .await
        .unwrap();
    let committed = core
        .reservations
        .commit(&reserved.reservation_id, &uuid(), Some("M"))
        .await
        .unwrap();
    assert_eq!(committed.amount, 100);

    assert_eq!(core.engine.get_model_balance("M").await.unwrap(), 100);
    let user = core.engine.get_user_balance("U").await.unwrap();
    assert_eq!(user.available_balance, 900);
}

#[tokio::test]
async fn resolve_twice_conflicts() {
    let core = core_with_user("U", 1000).await;

    let reserved = core
        .reservations
        .reserve("U", 100, None, &uuid())
        .await
        .unwrap();
    core.reservations
        .commit(&reserved.reservation_id, &uuid(), None)
        .await
        .unwrap();

    let err = core
        .reservations
        .release(&reserved.reservation_id, &uuid())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RESERVATION_ALREADY_PROCESSED");
    assert_eq!(err.http_status(), 409);
}

#[tokio::test]
async fn overdue_reservation_reports_expired() {
    let core = core_with_user("U", 1000).await;

    let reserved = core
        .reservations
        .reserve("U", 100, Some(0), &uuid())
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    // the clock rules even though the store row still says active
    let err = core
        .reservations
        .commit(&reserved.reservation_id, &uuid(), None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "RESERVATION_EXPIRED");
    assert_eq!(err.http_status(), 410);
}

#[tokio::test]
async fn sweep_restores_overdue_reservations() {
    let core = core_with_user("U", 1000).await;

    let reserved = core
        .reservations
        .reserve("U", 150, Some(0), &uuid())
        .await
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let expired = core.sweeper.sweep_once().await.unwrap();
    assert_eq!(expired, 1);

    let user = core.engine.get_user_balance("U").await.unwrap();
    assert_eq!(user.available_balance, 1000);

    let reservation = core
        .reservations
        .get(&reserved.reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::Expired);
}

/// The sweeper only ever transitions from `active`; a reservation the
/// caller resolved first is left alone.
#[tokio::test]
async fn sweeper_never_touches_terminal_rows() {
    let core = core_with_user("U", 1000).await;

    let reserved = core
        .reservations
        .reserve("U", 100, Some(0), &uuid())
        .await
        .unwrap();
    // resolved before the sweep reaches it (commit ignores the deadline
    // race here by going through release on a fresh row)
    core.store
        .transition_reservation(
            &reserved.reservation_id,
            ReservationStatus::Committed,
            chrono::Utc::now(),
            None,
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let expired = core.sweeper.sweep_once().await.unwrap();
    assert_eq!(expired, 0);

    let reservation = core
        .reservations
        .get(&reserved.reservation_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reservation.status, ReservationStatus::Committed);
    // no restoring credit was issued
    let user = core.engine.get_user_balance("U").await.unwrap();
    assert_eq!(user.available_balance, 900);
}

#[tokio::test]
async fn zero_and_negative_amounts_rejected() {
    let core = core_with_user("U", 1000).await;
    for amount in [0, -10] {
        let err = core
            .reservations
            .reserve("U", amount, None, &uuid())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_INPUT");
    }
}
