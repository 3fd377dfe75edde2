mod common;

use chrono::{DateTime, TimeZone, Utc};
use common::TestServer;
use futures::future::join_all;
use sealdrop::{
    models::account::{NewAccount, SubscriptionUpdate},
    services::{
        ledger::LedgerError,
        membership::{ReconcileReport, month_marker},
    },
};

const GIB: i64 = 1024 * 1024 * 1024;

fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
}

fn new_account(email: Option<&str>) -> NewAccount {
    NewAccount {
        email: email.map(str::to_string),
        login_key: b"login-key".to_vec(),
        protected_key: b"protected".to_vec(),
        public_key: b"public".to_vec(),
        password_hint: None,
    }
}

async fn metered() -> TestServer {
    TestServer::with_config(|cfg| {
        cfg.default_user_storage = 1_000;
        cfg.default_user_send = 500;
    })
    .await
}

#[tokio::test]
async fn test_concurrent_charges_never_exceed_quota() {
    let server = metered().await;
    let ledger = &server.state.ledger;
    let account = ledger.create_account(new_account(None)).await.unwrap();

    let results = join_all((0..25).map(|_| ledger.charge_storage(&account.id, 100))).await;
    let granted = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(granted, 10);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, LedgerError::StorageExceeded))
    );

    let usage = ledger.usage(&account.id).await.unwrap();
    assert_eq!(usage.storage_used, 1_000);
    assert_eq!(usage.storage_available, 1_000);
}

#[tokio::test]
async fn test_usage_never_goes_negative() {
    let server = metered().await;
    let ledger = &server.state.ledger;
    let account = ledger.create_account(new_account(None)).await.unwrap();

    assert_eq!(ledger.charge_send(&account.id, 200).await.unwrap(), 200);
    assert_eq!(ledger.charge_send(&account.id, -500).await.unwrap(), 0);
    assert_eq!(ledger.charge_storage(&account.id, -1).await.unwrap(), 0);
    assert!(matches!(
        ledger.charge_send(&account.id, 501).await,
        Err(LedgerError::SendExceeded)
    ));
    assert_eq!(ledger.usage(&account.id).await.unwrap().send_used, 0);
}

#[tokio::test]
async fn test_unknown_account_is_reported() {
    let server = metered().await;
    let err = server
        .state
        .ledger
        .charge_storage("9999999999999999", 10)
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::AccountNotFound(_)));
}

#[tokio::test]
async fn test_unmetered_accounts_accept_any_charge() {
    let server = TestServer::new().await;
    let ledger = &server.state.ledger;
    let account = ledger.create_account(new_account(None)).await.unwrap();
    assert!(account.is_unmetered());

    assert_eq!(ledger.charge_storage(&account.id, 50 * GIB).await.unwrap(), 50 * GIB);
    assert_eq!(ledger.charge_send(&account.id, 50 * GIB).await.unwrap(), 50 * GIB);
    // Default storage of zero still tracks bandwidth.
    assert_eq!(ledger.charge_bandwidth(&account.id, 10).await.unwrap(), Some(-10));
}

#[tokio::test]
async fn test_negative_default_disables_bandwidth() {
    let server = TestServer::with_config(|cfg| cfg.default_user_storage = -1).await;
    let ledger = &server.state.ledger;
    let account = ledger.create_account(new_account(None)).await.unwrap();
    assert_eq!(ledger.charge_bandwidth(&account.id, 10).await.unwrap(), None);
}

#[tokio::test]
async fn test_account_limit_and_duplicate_email() {
    let server = TestServer::with_config(|cfg| cfg.max_accounts = Some(2)).await;
    let ledger = &server.state.ledger;

    let first = ledger
        .create_account(new_account(Some("Someone@Example.com")))
        .await
        .unwrap();
    assert_eq!(first.id.len(), 16);
    assert_eq!(first.email.as_deref(), Some("someone@example.com"));

    assert!(matches!(
        ledger.create_account(new_account(Some("someone@example.com"))).await,
        Err(LedgerError::AccountExists)
    ));

    ledger.create_account(new_account(None)).await.unwrap();
    assert!(matches!(
        ledger.create_account(new_account(None)).await,
        Err(LedgerError::AccountLimitReached)
    ));
}

#[tokio::test]
async fn test_login_and_credentials() {
    let server = TestServer::new().await;
    let ledger = &server.state.ledger;
    let account = ledger
        .create_account(new_account(Some("user@example.com")))
        .await
        .unwrap();

    let by_email = ledger.verify_login("USER@example.com", b"login-key").await.unwrap();
    assert_eq!(by_email.id, account.id);
    let by_id = ledger.verify_login(&account.id, b"login-key").await.unwrap();
    assert_eq!(by_id.id, account.id);
    assert!(matches!(
        ledger.verify_login(&account.id, b"wrong").await,
        Err(LedgerError::InvalidCredentials)
    ));

    ledger.set_password_hint(&account.id, b"hint").await.unwrap();
    let anonymous = ledger.create_account(new_account(None)).await.unwrap();
    assert!(matches!(
        ledger.set_password_hint(&anonymous.id, b"hint").await,
        Err(LedgerError::HintRequiresEmail)
    ));
}

#[tokio::test]
async fn test_subscription_and_payment_id() {
    let server = TestServer::new().await;
    let ledger = &server.state.ledger;
    let account = ledger.create_account(new_account(None)).await.unwrap();
    let now = at(2025, 3, 10);

    let recycled = ledger.recycle_payment_id(&account.id, now).await.unwrap();
    assert_ne!(recycled, account.payment_id);

    let update = SubscriptionUpdate {
        payment_id: recycled.clone(),
        tag: "regular-monthly".into(),
        method: "card".into(),
        expiration: at(2025, 4, 10),
        storage: 500 * GIB,
        send: 250 * GIB,
    };
    ledger.set_subscription(&update, now).await.unwrap();

    let updated = ledger.get_account(&account.id).await.unwrap();
    assert_eq!(updated.storage_available, 500 * GIB);
    assert_eq!(updated.sub_tag.as_deref(), Some("regular-monthly"));
    assert_eq!(updated.last_upgraded_month, month_marker(now));

    // An active paid membership keeps its payment id.
    assert!(matches!(
        ledger.recycle_payment_id(&account.id, now).await,
        Err(LedgerError::SubscriptionActive)
    ));

    let unknown = SubscriptionUpdate {
        tag: "platinum-monthly".into(),
        ..update
    };
    assert!(matches!(
        ledger.set_subscription(&unknown, now).await,
        Err(LedgerError::UnknownTier(_))
    ));
}

#[tokio::test]
async fn test_lapsed_membership_reverts_to_default() {
    let server = metered().await;
    let ledger = &server.state.ledger;
    let account = ledger.create_account(new_account(None)).await.unwrap();

    ledger
        .set_subscription(
            &SubscriptionUpdate {
                payment_id: account.payment_id.clone(),
                tag: "novice-monthly".into(),
                method: "card".into(),
                expiration: at(2025, 3, 15),
                storage: 100 * GIB,
                send: 50 * GIB,
            },
            at(2025, 3, 1),
        )
        .await
        .unwrap();
    ledger.charge_send(&account.id, 4_000).await.unwrap();

    let report = ledger.reconcile_memberships(at(2025, 4, 20)).await.unwrap();
    assert_eq!(report.reverted, 1);

    let usage = ledger.usage(&account.id).await.unwrap();
    assert_eq!(usage.storage_available, 1_000);
    assert_eq!(usage.send_available, 500);
    assert_eq!(usage.send_used, 0);
}

#[tokio::test]
async fn test_renewal_day_refreshes_and_is_idempotent() {
    let server = metered().await;
    let ledger = &server.state.ledger;
    let account = ledger.create_account(new_account(None)).await.unwrap();

    ledger
        .set_subscription(
            &SubscriptionUpdate {
                payment_id: account.payment_id.clone(),
                tag: "advanced-yearly".into(),
                method: "card".into(),
                expiration: at(2026, 1, 31),
                storage: 2000 * GIB,
                send: 1000 * GIB,
            },
            at(2025, 5, 2),
        )
        .await
        .unwrap();
    ledger.charge_send(&account.id, 10 * GIB).await.unwrap();

    // June has no 31st, so the renewal falls on the 30th.
    let quiet = ledger.reconcile_memberships(at(2025, 6, 29)).await.unwrap();
    assert_eq!(quiet, ReconcileReport::default());
    assert_eq!(ledger.usage(&account.id).await.unwrap().send_used, 10 * GIB);

    let report = ledger.reconcile_memberships(at(2025, 6, 30)).await.unwrap();
    assert_eq!(report.refreshed, 1);
    let usage = ledger.usage(&account.id).await.unwrap();
    assert_eq!(usage.send_used, 0);
    assert_eq!(usage.storage_available, 2000 * GIB);

    ledger.charge_send(&account.id, GIB).await.unwrap();
    let again = ledger.reconcile_memberships(at(2025, 6, 30)).await.unwrap();
    assert_eq!(again, ReconcileReport::default());
    assert_eq!(ledger.usage(&account.id).await.unwrap().send_used, GIB);
}

#[tokio::test]
async fn test_bandwidth_window_reset() {
    let server = metered().await;
    let ledger = &server.state.ledger;
    let account = ledger.create_account(new_account(None)).await.unwrap();
    let window = ledger.policy().bandwidth_window(1_000);
    assert_eq!(account.bandwidth, window);

    ledger.charge_bandwidth(&account.id, window + 5).await.unwrap();
    assert_eq!(ledger.usage(&account.id).await.unwrap().bandwidth, -5);

    assert_eq!(ledger.reset_bandwidth_window().await.unwrap(), 1);
    assert_eq!(ledger.usage(&account.id).await.unwrap().bandwidth, window);
}

#[tokio::test]
async fn test_credential_rotation_and_second_factor() {
    let server = TestServer::new().await;
    let ledger = &server.state.ledger;
    let account = ledger
        .create_account(new_account(Some("rotate@example.com")))
        .await
        .unwrap();

    ledger
        .update_login(&account.id, b"new-login-key", b"new-protected")
        .await
        .unwrap();
    assert!(matches!(
        ledger.verify_login(&account.id, b"login-key").await,
        Err(LedgerError::InvalidCredentials)
    ));
    let rotated = ledger.verify_login(&account.id, b"new-login-key").await.unwrap();
    assert_eq!(rotated.protected_key, b"new-protected");

    let codes = vec!["alpha-1".to_string(), "bravo-2".to_string()];
    ledger
        .set_second_factor(&account.id, b"totp-secret", &codes)
        .await
        .unwrap();
    let enabled = ledger.get_account(&account.id).await.unwrap();
    assert_eq!(enabled.second_factor.as_deref(), Some(&b"totp-secret"[..]));
    let hashes: Vec<String> =
        serde_json::from_str(enabled.recovery_hashes.as_deref().unwrap()).unwrap();
    assert_eq!(hashes.len(), 2);
    assert!(hashes.iter().all(|h| !h.contains("alpha-1")));

    ledger.remove_second_factor(&account.id).await.unwrap();
    let disabled = ledger.get_account(&account.id).await.unwrap();
    assert!(disabled.second_factor.is_none());
    assert!(disabled.recovery_hashes.is_none());

    ledger.delete_account(&account.id).await.unwrap();
    assert!(matches!(
        ledger.get_account(&account.id).await,
        Err(LedgerError::AccountNotFound(_))
    ));
}
