use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::routes::AppState;

/// Run the reconciliation sweep at startup and then every `interval`.
///
/// A failed sweep is logged and retried at the next tick.
pub fn spawn(state: AppState, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            interval_secs = interval.as_secs(),
            "Starting reconciliation sweeper"
        );
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            run_once(&state).await;
        }
    })
}

async fn run_once(state: &AppState) {
    let ctx = match state.session().await {
        Ok(ctx) => ctx,
        Err(error) => {
            tracing::error!(error = %error, "Sweep skipped: no session");
            return;
        }
    };
    if let Err(error) = state.engine.sweep(&ctx).await {
        tracing::error!(error = %error, "Reconciliation sweep failed");
    }
}
