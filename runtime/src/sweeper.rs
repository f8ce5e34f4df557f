use std::sync::Arc;
use std::time::Duration;

use marshal_core::kill_switch::KillSwitchRegistry;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Periodically lift kill switches whose scheduled end has passed.
///
/// Until the sweep runs, an expired switch still blocks.
pub fn spawn_sweeper(
    registry: Arc<KillSwitchRegistry>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let lifted = registry.process_scheduled_deactivations(registry.now());
                    if !lifted.is_empty() {
                        tracing::info!(count = lifted.len(), "scheduled kill switch deactivations applied");
                    }
                }
            }
        }
        tracing::debug!("kill switch sweeper stopped");
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};
    use marshal_core::clock::{Clock, ManualClock};
    use marshal_core::kill_switch::{ActivateInput, KillSwitchScope, Severity};
    use marshal_core::notify::MemoryNotifier;

    use super::*;

    #[tokio::test]
    async fn lifts_expired_switches_and_stops_on_cancel() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(KillSwitchRegistry::new(Arc::new(MemoryNotifier::new()), clock.clone()));
        let ends_at = clock.now() + ChronoDuration::minutes(5);
        registry
            .activate(
                KillSwitchScope::Client,
                Some("client_42"),
                ActivateInput::new("fraud review", "ops", Severity::High).with_scheduled_end(ends_at),
            )
            .unwrap();
        clock.advance(ChronoDuration::minutes(6));
        assert!(registry.is_active(KillSwitchScope::Client, Some("client_42")));

        let cancel = CancellationToken::new();
        let handle = spawn_sweeper(registry.clone(), Duration::from_millis(5), cancel.clone());
        for _ in 0..200 {
            if !registry.is_active(KillSwitchScope::Client, Some("client_42")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!registry.is_active(KillSwitchScope::Client, Some("client_42")));

        cancel.cancel();
        handle.await.unwrap();
    }
}
