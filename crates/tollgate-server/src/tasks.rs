//! Background maintenance loops.
//!
//! Reconciliation, session-cache eviction, and config/index reload each run
//! as an independently spawned task. All of them watch one cancellation
//! token and check it between discrete units of work (one session, one
//! batch), so shutdown never interrupts a unit halfway.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::context::{AppContext, now_ms};
use crate::error::Result;
use crate::store::{SessionStore, SiteStore};

pub fn spawn_all(ctx: &Arc<AppContext>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    vec![
        tokio::spawn(run_reconciler(Arc::clone(ctx), cancel.clone())),
        tokio::spawn(run_evictor(Arc::clone(ctx), cancel.clone())),
        tokio::spawn(run_reloader(Arc::clone(ctx), cancel.clone())),
        tokio::spawn(run_forwarder(Arc::clone(ctx), cancel.clone())),
    ]
}

fn ticker(period_secs: u64) -> time::Interval {
    let mut ticker = time::interval(Duration::from_secs(period_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The immediate first tick is not wanted for maintenance work.
    ticker.reset();
    ticker
}

async fn run_reconciler(ctx: Arc<AppContext>, cancel: CancellationToken) {
    let mut ticker = ticker(ctx.config.policy.reconcile_interval_secs);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let ctx = Arc::clone(&ctx);
                let cancel = cancel.clone();
                let swept =
                    tokio::task::spawn_blocking(move || reconcile_once(&ctx, &cancel)).await;
                match swept {
                    Ok(Ok(report)) if report.copied > 0 || report.purged > 0 => {
                        tracing::info!(
                            "reconciled {} invoice(s) across {} session(s), purged {}",
                            report.copied,
                            report.sessions,
                            report.purged
                        );
                    }
                    Ok(Ok(_)) => {}
                    Ok(Err(err)) => tracing::error!("reconciliation sweep failed: {err}"),
                    Err(err) => tracing::error!("reconciliation task panicked: {err}"),
                }
            }
        }
    }
}

async fn run_evictor(ctx: Arc<AppContext>, cancel: CancellationToken) {
    let mut ticker = ticker(ctx.config.policy.evict_interval_secs);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let evicted = ctx.evict_idle_sessions(ctx.config.policy.evict_idle_ms());
                if evicted > 0 {
                    tracing::debug!("evicted {evicted} idle session handle(s)");
                }
            }
        }
    }
}

async fn run_reloader(ctx: Arc<AppContext>, cancel: CancellationToken) {
    let mut ticker = ticker(ctx.config.policy.reload_interval_secs);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                // A broken document keeps the previous index/key in place.
                if let Err(err) = ctx.reload_paywalls() {
                    tracing::warn!("paywall rules reload failed: {err}");
                }
                if let Err(err) = ctx.reload_master_key() {
                    tracing::warn!("master key reload failed: {err}");
                }
            }
        }
    }
}

async fn run_forwarder(ctx: Arc<AppContext>, cancel: CancellationToken) {
    ctx.hub.forward(cancel).await;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileReport {
    /// Session files visited.
    pub sessions: usize,
    /// Invoices newly copied into the site ledger.
    pub copied: usize,
    /// Session files deleted for inactivity.
    pub purged: usize,
}

/// One reconciliation sweep over every session file.
///
/// Failures are contained per session; the sweep itself only fails when the
/// sessions directory cannot be read at all.
pub fn reconcile_once(ctx: &AppContext, cancel: &CancellationToken) -> Result<ReconcileReport> {
    let now = now_ms();
    let mut report = ReconcileReport::default();

    for entry in std::fs::read_dir(ctx.paths.sessions_dir())? {
        if cancel.is_cancelled() {
            break;
        }

        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("db") {
            continue;
        }

        report.sessions += 1;
        match reconcile_session(ctx, &path, now) {
            Ok((copied, purged)) => {
                report.copied += copied;
                if purged {
                    report.purged += 1;
                }
            }
            Err(err) => {
                tracing::error!("reconciliation of {} failed: {err}", path.display());
            }
        }
    }

    Ok(report)
}

fn reconcile_session(ctx: &AppContext, path: &Path, now: i64) -> Result<(usize, bool)> {
    // Fresh handles every time: the request path or the evictor may have
    // closed (or be about to close) their own, and the only coordination
    // with them is SQLite's file locking.
    let session = SessionStore::open_existing(path)?;
    let site = SiteStore::open(&ctx.paths.site_db())?;

    let expiry_cutoff = now - ctx.config.policy.payment_window_ms();
    let batch_size = ctx.config.policy.reconcile_batch;
    let mut copied = 0;

    loop {
        let batch = session.uncopied(expiry_cutoff, batch_size)?;
        if batch.is_empty() {
            break;
        }

        for invoice in &batch {
            site.insert_invoice(invoice)?;
        }
        let refs: Vec<String> = batch.iter().map(|inv| inv.reference.clone()).collect();
        if session.mark_copied(&refs)? == 0 {
            break;
        }
        copied += batch.len();
    }

    let purge = session.check_in()? < now - ctx.config.policy.purge_idle_ms();
    if purge {
        drop(session);
        std::fs::remove_file(path)?;
        let _ = std::fs::remove_file(sibling(path, "-wal"));
        let _ = std::fs::remove_file(sibling(path, "-shm"));
    }

    Ok((copied, purge))
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}
