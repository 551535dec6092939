//! Periodic maintenance tasks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use lexbill_core::Result;

use crate::state::AppState;

/// Run `job` every `period` until `shutdown` fires. Failures are logged and
/// the next tick runs as usual.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        info!(job = name, period = ?period, "Starting background job");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!(job = name, "Background job shutting down");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = job().await {
                        error!(job = name, error = %e, "Background job failed");
                    } else {
                        debug!(job = name, "Background job tick finished");
                    }
                }
            }
        }
    })
}

/// Start every maintenance job the configured components need.
pub fn spawn_all(state: &AppState, shutdown: &CancellationToken) -> Vec<JoinHandle<()>> {
    let config = &state.config.billing;
    let mut handles = Vec::new();

    let reservations = Arc::clone(&state.reservations);
    let store = Arc::clone(&state.store);
    handles.push(spawn_periodic(
        "reservation_sweep",
        config.reservation_sweep_interval,
        shutdown.clone(),
        move || {
            let reservations = Arc::clone(&reservations);
            let store = Arc::clone(&store);
            async move {
                let swept = reservations.sweep_expired(Utc::now()).map(|_| ());
                let pruned = store.prune_locks();
                if pruned > 0 {
                    debug!(pruned, "Idle row locks dropped");
                }
                swept
            }
        },
    ));

    let idempotency = Arc::clone(&state.idempotency);
    handles.push(spawn_periodic(
        "idempotency_sweep",
        config.idempotency_sweep_interval,
        shutdown.clone(),
        move || {
            let idempotency = Arc::clone(&idempotency);
            async move { idempotency.sweep_expired(Utc::now()).map(|_| ()) }
        },
    ));

    let Some(settlement) = state.settlement.clone() else {
        info!("Payments disabled, settlement jobs not started");
        return handles;
    };

    let reconcile = Arc::clone(&settlement);
    handles.push(spawn_periodic(
        "payment_reconcile",
        config.reconcile_interval,
        shutdown.clone(),
        move || {
            let settlement = Arc::clone(&reconcile);
            async move { settlement.reconcile(Utc::now()).await.map(|_| ()) }
        },
    ));

    let retry = Arc::clone(&settlement);
    handles.push(spawn_periodic(
        "credit_retry",
        config.credit_retry_interval,
        shutdown.clone(),
        move || {
            let settlement = Arc::clone(&retry);
            async move { settlement.retry_credits(Utc::now()).map(|_| ()) }
        },
    ));

    handles.push(spawn_periodic(
        "payment_purge",
        config.purge_interval,
        shutdown.clone(),
        move || {
            let settlement = Arc::clone(&settlement);
            async move { settlement.purge(Utc::now()).map(|_| ()) }
        },
    ));

    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use lexbill_core::{BillingError, UserId};
    use lexbill_store::{MemoryStore, Store};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn periodic_job_ticks_until_cancelled() {
        let shutdown = CancellationToken::new();
        let ticks = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&ticks);
        let handle = spawn_periodic("test", Duration::from_secs(10), shutdown.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                // Failing ticks must not stop the loop.
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(BillingError::Storage("disk full".into()));
                }
                Ok(())
            }
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert_eq!(ticks.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_tick_drops_idle_row_locks() {
        let store = Arc::new(MemoryStore::new());
        for _ in 0..3 {
            drop(store.lock_user(&UserId::generate()));
        }
        let state = AppState::new(store.clone(), ServiceConfig::default());
        let shutdown = CancellationToken::new();

        let handles = spawn_all(&state, &shutdown);
        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.cancel();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.prune_locks(), 0);
    }
}
