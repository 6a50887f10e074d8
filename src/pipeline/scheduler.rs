//! Background reconciliation on a cron schedule.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::pipeline::dispatcher::Dispatcher;

/// Parse a cron expression (seconds field first, e.g. `0 */15 * * * *`).
pub fn parse_schedule(expr: &str) -> Result<Schedule, ConfigError> {
    Schedule::from_str(expr.trim()).map_err(|e| ConfigError::InvalidValue {
        key: "MAIL_ASSIST_RECONCILE_CRON".to_string(),
        message: format!("'{expr}': {e}"),
    })
}

/// Spawn a task that reconciles every account at each scheduled instant.
///
/// Returns a `JoinHandle` and shutdown flag. The flag is checked after each
/// wake-up, so shutdown takes effect at the next scheduled tick.
pub fn spawn_reconciler(
    dispatcher: Dispatcher,
    schedule: Schedule,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(schedule = %schedule, "Reconciler started");

        loop {
            let Some(next) = schedule.upcoming(Utc).next() else {
                warn!("Reconcile schedule has no upcoming instants, stopping");
                return;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(wait).await;

            if shutdown.load(Ordering::Relaxed) {
                info!("Reconciler shutting down");
                return;
            }

            let processed = dispatcher.reconcile_all().await;
            info!(processed, "Scheduled reconciliation finished");
        }
    });

    (handle, shutdown_flag)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::store::traits::Database;
    use crate::testing::{StubClassifier, fixture, raw_message};

    #[test]
    fn rejects_invalid_expression() {
        let err = parse_schedule("every five minutes").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key, .. } if key == "MAIL_ASSIST_RECONCILE_CRON"));
    }

    #[test]
    fn accepts_six_field_expression() {
        let schedule = parse_schedule("0 */15 * * * *").unwrap();
        assert!(schedule.upcoming(Utc).next().is_some());
    }

    #[tokio::test]
    async fn ticker_reconciles_and_shuts_down() {
        let f = fixture(StubClassifier::ok()).await;
        f.mailbox.add_message(raw_message("m-1", "alice@example.com"));

        let (handle, shutdown) = spawn_reconciler(
            Dispatcher::new(f.pipeline.clone()),
            parse_schedule("* * * * * *").unwrap(),
        );

        tokio::time::sleep(Duration::from_millis(2200)).await;
        assert_eq!(f.db.count_records(&f.account.id).await.unwrap(), 1);

        shutdown.store(true, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
