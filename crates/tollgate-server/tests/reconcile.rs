//! Reconciliation and session lifecycle.

mod common;

use http::StatusCode;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use tollgate_core::invoice::Invoice;
use tollgate_server::config::Policy;
use tollgate_server::context::now_ms;
use tollgate_server::routes;
use tollgate_server::tasks::reconcile_once;

use common::{open_site, request_json};

const HOUR_MS: i64 = 3_600_000;

#[tokio::test]
async fn reconciler_folds_paid_invoices_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open_site(&dir, vec![], Policy::default());
    let router = routes::router(ctx.clone());

    let active = Invoice::new_reference();
    let stale = Invoice::new_reference();
    let mut refs = Vec::new();

    for (session, path) in [(&active, "/posts/one"), (&stale, "/posts/two")] {
        let (status, issued) = request_json(
            &router,
            "POST",
            "/invoice",
            Some(json!({ "sessionId": session, "urlPath": path })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let reference = issued["ref"].as_str().unwrap().to_string();

        let store = ctx.session(session, false).unwrap();
        assert!(
            store
                .mark_paid(&reference, now_ms(), "devpay", None, None)
                .unwrap()
        );
        refs.push(reference);
    }

    // The stale visitor was last seen nine hours ago; the active one is
    // within the purge window.
    let now = now_ms();
    ctx.session(&stale, false)
        .unwrap()
        .set_check_in(now - 9 * HOUR_MS)
        .unwrap();
    ctx.session(&active, false)
        .unwrap()
        .set_check_in(now - HOUR_MS)
        .unwrap();

    let cancel = CancellationToken::new();
    let report = reconcile_once(&ctx, &cancel).unwrap();
    assert_eq!(report.sessions, 2);
    assert_eq!(report.copied, 2);
    assert_eq!(report.purged, 1);

    assert!(!ctx.paths.session_db(&stale).exists());
    assert!(ctx.paths.session_db(&active).exists());

    let invoices = ctx.site.list_invoices().unwrap();
    assert_eq!(invoices.len(), 2);
    for invoice in &invoices {
        assert!(refs.contains(&invoice.reference));
        assert!(invoice.copied);
        assert!(invoice.paid_at.is_some());
    }

    // Second sweep over identical state changes nothing.
    let report = reconcile_once(&ctx, &cancel).unwrap();
    assert_eq!(report.sessions, 1);
    assert_eq!(report.copied, 0);
    assert_eq!(report.purged, 0);
    assert_eq!(ctx.site.list_invoices().unwrap().len(), 2);
}

#[tokio::test]
async fn open_fresh_invoices_are_not_reconciled() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open_site(&dir, vec![], Policy::default());
    let router = routes::router(ctx.clone());
    let session = Invoice::new_reference();

    let (_, issued) = request_json(
        &router,
        "POST",
        "/invoice",
        Some(json!({ "sessionId": session, "urlPath": "/posts/one" })),
    )
    .await;
    assert!(issued["ref"].is_string());

    // Unpaid and well inside the payment window: the session still owns it.
    let report = reconcile_once(&ctx, &CancellationToken::new()).unwrap();
    assert_eq!(report.sessions, 1);
    assert_eq!(report.copied, 0);
    assert!(ctx.site.list_invoices().unwrap().is_empty());
}

#[tokio::test]
async fn expired_unpaid_invoices_are_reconciled_for_reporting() {
    let dir = tempfile::tempdir().unwrap();
    // Everything expires immediately.
    let policy = Policy::builder().payment_window_secs(0).build();
    let ctx = open_site(&dir, vec![], policy);
    let router = routes::router(ctx.clone());
    let session = Invoice::new_reference();

    let (_, issued) = request_json(
        &router,
        "POST",
        "/invoice",
        Some(json!({ "sessionId": session, "urlPath": "/posts/one" })),
    )
    .await;
    let reference = issued["ref"].as_str().unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let report = reconcile_once(&ctx, &CancellationToken::new()).unwrap();
    assert_eq!(report.copied, 1);

    let copy = ctx.site.invoice_by_ref(reference).unwrap().unwrap();
    assert!(copy.paid_at.is_none());
    assert!(copy.copied);
}

#[tokio::test]
async fn idle_session_handles_are_evicted_from_the_cache() {
    let dir = tempfile::tempdir().unwrap();
    let ctx = open_site(&dir, vec![], Policy::default());

    let first = Invoice::new_reference();
    let second = Invoice::new_reference();
    ctx.session(&first, true).unwrap();
    ctx.session(&second, true).unwrap();
    assert_eq!(ctx.cached_sessions(), 2);

    // Nothing is idle yet at a generous threshold.
    assert_eq!(ctx.evict_idle_sessions(10_000), 0);

    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    assert_eq!(ctx.evict_idle_sessions(1), 2);
    assert_eq!(ctx.cached_sessions(), 0);

    // Eviction only dropped handles; the ledgers reopen on demand.
    assert!(ctx.session(&first, false).is_ok());
}
