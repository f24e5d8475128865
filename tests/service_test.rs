mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{reopen, test_service};
use credit_ledger::application::{DeductionRequest, LedgerError};
use credit_ledger::domain::{PricingRequest, TransactionFilter, TransactionType};
use credit_ledger::io::Exporter;
use credit_ledger::remote::RemoteError;

fn deduction(amount: i64) -> DeductionRequest {
    DeductionRequest {
        amount,
        description: "Vessel tracking".to_string(),
        service_id: "svc-1".to_string(),
        service_type: "vessel_tracking".to_string(),
    }
}

#[tokio::test]
async fn test_deduct_without_credits_fails_before_remote_call() -> Result<()> {
    let (service, api, _temp) = test_service(100).await?;

    let err = service.deduct_credits(deduction(450)).await.unwrap_err();

    assert!(matches!(
        err,
        LedgerError::InsufficientCredits {
            required: 450,
            available: 100
        }
    ));
    assert!(err.needs_credits());
    assert_eq!(api.calls("deduct"), 0);
    assert_eq!(service.store().available(), 100);
    Ok(())
}

#[tokio::test]
async fn test_deduct_settles_balance_and_records_transaction() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;

    let receipt = service.deduct_credits(deduction(450)).await?;

    assert_eq!(receipt.new_balance, 550);
    assert_eq!(receipt.available, 550);
    assert_eq!(api.settled(), 550);

    let snapshot = service.store().snapshot();
    assert_eq!(snapshot.pending, 0);
    assert!(!snapshot.updating);

    let recent = service.recent_transactions();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].tx_type, TransactionType::Deduction);
    assert_eq!(recent[0].amount, 450);
    assert_eq!(recent[0].service_type.as_deref(), Some("vessel_tracking"));
    Ok(())
}

#[tokio::test]
async fn test_failed_deduct_rolls_back_optimistic_update() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;
    api.fail_next("deduct", RemoteError::Unavailable("timeout".into()));

    let err = service.deduct_credits(deduction(450)).await.unwrap_err();

    assert!(err.is_retryable());
    assert!(err.to_string().contains("amount 450, service svc-1"));
    let snapshot = service.store().snapshot();
    assert_eq!(snapshot.available, 1000);
    assert_eq!(snapshot.pending, 0);
    assert!(snapshot.transactions.is_empty());
    assert_eq!(api.settled(), 1000);
    Ok(())
}

#[tokio::test]
async fn test_server_side_insufficient_credits_is_reported_as_such() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;
    api.fail_next("deduct", RemoteError::InsufficientCredits("low".into()));

    let err = service.deduct_credits(deduction(450)).await.unwrap_err();

    assert!(err.needs_credits());
    assert_eq!(service.store().available(), 1000);
    Ok(())
}

#[tokio::test]
async fn test_server_rejection_is_not_retryable() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;
    api.fail_next("deduct", RemoteError::Unauthorized);

    let err = service.deduct_credits(deduction(450)).await.unwrap_err();

    assert!(matches!(err, LedgerError::Rejected { .. }));
    assert!(!err.is_retryable());
    assert_eq!(service.store().available(), 1000);
    Ok(())
}

#[tokio::test]
async fn test_invalid_deduction_is_rejected_locally() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;

    let err = service.deduct_credits(deduction(0)).await.unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    let mut request = deduction(10);
    request.service_id = "  ".to_string();
    let err = service.deduct_credits(request).await.unwrap_err();
    assert!(matches!(err, LedgerError::Validation(_)));

    assert_eq!(api.calls("fetch_balance"), 0);
    assert_eq!(api.calls("deduct"), 0);
    Ok(())
}

#[tokio::test]
async fn test_reserve_and_confirm_round_trip() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;

    let reservation = service.reserve_credits(300, "svc-7").await?;
    let snapshot = service.store().snapshot();
    assert_eq!(snapshot.available, 700);
    assert_eq!(snapshot.held, 300);
    assert_eq!(api.held(), 300);

    let receipt = service.confirm_reservation(&reservation.id).await?;
    assert_eq!(receipt.amount, 300);
    assert_eq!(receipt.new_balance, 700);

    let snapshot = service.store().snapshot();
    assert_eq!(snapshot.available, 700);
    assert_eq!(snapshot.held, 0);
    assert!(snapshot.reservations.is_empty());
    assert_eq!(snapshot.transactions[0].tx_type, TransactionType::Deduction);
    assert_eq!(api.settled(), 700);
    Ok(())
}

#[tokio::test]
async fn test_reservation_terminates_exactly_once() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;
    let reservation = service.reserve_credits(300, "svc-7").await?;
    service.confirm_reservation(&reservation.id).await?;

    let err = service.confirm_reservation(&reservation.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::ReservationNotFound(_)));

    let err = service.cancel_reservation(&reservation.id).await.unwrap_err();
    assert!(matches!(err, LedgerError::ReservationNotFound(_)));

    assert_eq!(service.store().available(), 700);
    assert_eq!(api.calls("confirm"), 1);
    assert_eq!(api.calls("cancel"), 0);
    Ok(())
}

#[tokio::test]
async fn test_cancel_restores_held_credits() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;
    let reservation = service.reserve_credits(400, "svc-2").await?;

    let released = service.cancel_reservation(&reservation.id).await?;

    assert_eq!(released.amount, 400);
    assert_eq!(service.store().available(), 1000);
    assert_eq!(api.held(), 0);
    assert_eq!(api.settled(), 1000);
    Ok(())
}

#[tokio::test]
async fn test_failed_confirm_keeps_the_hold() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;
    let reservation = service.reserve_credits(250, "svc-3").await?;
    api.fail_next(
        "confirm",
        RemoteError::Server {
            status: 503,
            message: "busy".into(),
        },
    );

    let err = service.confirm_reservation(&reservation.id).await.unwrap_err();
    assert!(err.is_retryable());
    let snapshot = service.store().snapshot();
    assert_eq!(snapshot.held, 250);
    assert!(!snapshot.updating);

    service.confirm_reservation(&reservation.id).await?;
    assert_eq!(service.store().available(), 750);
    Ok(())
}

#[tokio::test]
async fn test_hold_unknown_to_server_is_released_locally() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;
    let reservation = service.reserve_credits(250, "svc-3").await?;
    api.expire_hold(&reservation.id);

    let err = service.confirm_reservation(&reservation.id).await.unwrap_err();

    assert!(matches!(err, LedgerError::ReservationNotFound(_)));
    let snapshot = service.store().snapshot();
    assert_eq!(snapshot.available, 1000);
    assert_eq!(snapshot.held, 0);
    Ok(())
}

#[tokio::test]
async fn test_reserve_beyond_available_is_refused() -> Result<()> {
    let (service, api, _temp) = test_service(500).await?;
    service.reserve_credits(400, "svc-1").await?;

    let err = service.reserve_credits(200, "svc-2").await.unwrap_err();

    assert!(err.needs_credits());
    assert_eq!(api.calls("reserve"), 1);
    assert_eq!(service.store().available(), 100);
    Ok(())
}

#[tokio::test]
async fn test_local_refusal_cancels_remote_reservation() -> Result<()> {
    let (service, api, _temp) = test_service(500).await?;
    let service = Arc::new(service);
    let gate = api.park_next("reserve");

    let reserving = tokio::spawn({
        let service = service.clone();
        async move { service.reserve_credits(400, "svc-1").await }
    });
    gate.applied().await;
    assert_eq!(api.held(), 400);

    // a push lowers the balance while the server's answer is still on its way
    service.store().update_balance(300)?;
    gate.release();
    let err = reserving.await?.unwrap_err();

    assert!(err.needs_credits());
    assert_eq!(api.calls("cancel"), 1);
    assert_eq!(api.held(), 0);
    assert_eq!(service.store().available(), 300);
    assert!(service.store().snapshot().reservations.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_out_of_order_settlements_keep_credits_spent() -> Result<()> {
    let (service, api, _temp) = test_service(300).await?;
    let service = Arc::new(service);
    let reservation = service.reserve_credits(100, "svc-hold").await?;
    let gate = api.park_next("deduct");

    let deducting = tokio::spawn({
        let service = service.clone();
        async move { service.deduct_credits(deduction(200)).await }
    });
    gate.applied().await;

    // the server applied the deduction first, so the confirm reports the later balance
    let receipt = service.confirm_reservation(&reservation.id).await?;
    assert_eq!(receipt.new_balance, 0);
    assert_eq!(service.store().available(), 0);

    gate.release();
    let deducted = deducting.await??;
    assert_eq!(deducted.new_balance, 100);

    let snapshot = service.store().snapshot();
    assert_eq!(snapshot.available, 0);
    assert_eq!(snapshot.held, 0);
    assert_eq!(snapshot.pending, 0);
    assert_eq!(api.settled(), 0);
    Ok(())
}

#[tokio::test]
async fn test_purchase_adds_credits() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;

    let receipt = service.purchase_credits("standard", "pm_card_visa").await?;

    assert_eq!(receipt.credits_added, 500);
    assert_eq!(receipt.new_balance, 1500);
    let snapshot = service.store().snapshot();
    assert_eq!(snapshot.available, 1500);
    assert_eq!(snapshot.lifetime, 500);
    assert_eq!(snapshot.transactions[0].tx_type, TransactionType::Purchase);
    assert_eq!(api.settled(), 1500);
    Ok(())
}

#[tokio::test]
async fn test_purchase_of_unknown_package_never_reaches_server() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;

    let err = service
        .purchase_credits("platinum-plus", "pm_card_visa")
        .await
        .unwrap_err();

    assert!(matches!(err, LedgerError::Validation(_)));
    assert_eq!(api.calls("purchase"), 0);
    Ok(())
}

#[tokio::test]
async fn test_sufficiency_check_falls_back_to_cache() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;
    service.get_balance(true).await?;
    api.set_offline(true);

    assert!(service.check_sufficient_credits(600).await);
    assert!(!service.check_sufficient_credits(1200).await);
    Ok(())
}

#[tokio::test]
async fn test_get_balance_uses_cache_once_synced() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;

    service.get_balance(false).await?;
    service.get_balance(false).await?;
    assert_eq!(api.calls("fetch_balance"), 1);

    api.set_settled(1200);
    let snapshot = service.get_balance(true).await?;
    assert_eq!(snapshot.available, 1200);
    assert_eq!(api.calls("fetch_balance"), 2);
    Ok(())
}

#[tokio::test]
async fn test_refresh_keeps_holds_subtracted() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;
    service.reserve_credits(300, "svc-1").await?;

    api.set_settled(1100);
    let snapshot = service.refresh_balance().await?;

    assert_eq!(snapshot.available, 800);
    assert_eq!(snapshot.held, 300);
    assert_eq!(snapshot.balance().available, 1100);
    Ok(())
}

#[tokio::test]
async fn test_list_transactions_refreshes_recent_window() -> Result<()> {
    let (service, _api, _temp) = test_service(1000).await?;
    service.deduct_credits(deduction(100)).await?;
    service.purchase_credits("starter", "pm_card_visa").await?;

    let all = service.list_transactions(&TransactionFilter::default()).await?;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].tx_type, TransactionType::Purchase);
    assert_eq!(service.recent_transactions().len(), 2);

    let purchases = service
        .list_transactions(&TransactionFilter {
            tx_type: Some(TransactionType::Purchase),
            ..Default::default()
        })
        .await?;
    assert_eq!(purchases.len(), 1);
    // a filtered page must not replace the recent window
    assert_eq!(service.recent_transactions().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_concurrent_deductions_never_overspend() -> Result<()> {
    let (service, api, _temp) = test_service(1000).await?;
    let service = Arc::new(service);

    let (a, b, c, d, e) = tokio::join!(
        service.deduct_credits(deduction(300)),
        service.deduct_credits(deduction(300)),
        service.deduct_credits(deduction(300)),
        service.deduct_credits(deduction(300)),
        service.deduct_credits(deduction(300)),
    );
    let results = [a, b, c, d, e];
    let succeeded = results.iter().filter(|r| r.is_ok()).count();

    assert_eq!(succeeded, 3);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(LedgerError::needs_credits)
    );
    assert_eq!(service.store().available(), 100);
    assert_eq!(api.settled(), 100);
    Ok(())
}

#[tokio::test]
async fn test_balance_survives_restart() -> Result<()> {
    let (service, api, temp) = test_service(1000).await?;
    service.deduct_credits(deduction(450)).await?;
    service.close(false).await?;

    api.set_offline(true);
    let service = reopen(&temp, &api).await?;

    let snapshot = service.store().snapshot();
    assert_eq!(snapshot.available, 550);
    assert!(snapshot.synced_at.is_none());
    Ok(())
}

#[tokio::test]
async fn test_forgotten_session_starts_empty() -> Result<()> {
    let (service, api, temp) = test_service(1000).await?;
    service.get_balance(true).await?;
    service.close(true).await?;

    let service = reopen(&temp, &api).await?;
    assert_eq!(service.store().available(), 0);
    Ok(())
}

#[tokio::test]
async fn test_quote_for_unknown_service_type() -> Result<()> {
    let (service, _api, _temp) = test_service(1000).await?;
    let request = PricingRequest {
        service_type: "weather_routing".to_string(),
        ..Default::default()
    };

    let err = service.calculate_service_cost(&request).unwrap_err();
    assert!(matches!(err, LedgerError::InvalidServiceType(ref key) if key == "weather_routing"));

    let quote = service.calculate_service_cost(&PricingRequest::vessel_tracking(3, 30.0))?;
    assert_eq!(quote.total_credits, 428);
    Ok(())
}

#[tokio::test]
async fn test_csv_export_lists_server_history() -> Result<()> {
    let (service, _api, _temp) = test_service(1000).await?;
    service.deduct_credits(deduction(120)).await?;
    service.purchase_credits("starter", "pm_1").await?;

    let mut out = Vec::new();
    let count = Exporter::new(&service)
        .export_transactions_csv(&TransactionFilter::default(), &mut out)
        .await?;

    let text = String::from_utf8(out)?;
    assert_eq!(count, 2);
    assert_eq!(text.lines().count(), 3);
    assert!(text.contains(",-120,"));
    Ok(())
}
