use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::metrics::UPTIME_SECONDS;

/// Publish process uptime every `interval` until `cancel` fires
pub fn spawn_uptime_monitor(
    started: Instant,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let period = interval.max(Duration::from_millis(10));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let uptime = started.elapsed().as_secs();
                    UPTIME_SECONDS.set(uptime as i64);
                    debug!(uptime_secs = uptime, "Uptime");
                }
            }
        }
        info!("Uptime monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = spawn_uptime_monitor(Instant::now(), Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor ignored cancel")
            .unwrap();
    }
}
