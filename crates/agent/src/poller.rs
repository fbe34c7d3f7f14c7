//! Fixed-interval probe loop.
//!
//! Real work is event driven; the poll loop only asks the queue whether
//! there is anything pending, so that jobs queued while a notification
//! was missed (e.g. during a reconnect) are still picked up.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::processor::JobProcessor;

/// Call [`JobProcessor::process`] every `interval` until `cancel` fires.
///
/// The first probe happens immediately. Ticks missed while the runtime
/// was busy are delayed rather than burst.
pub async fn run_poll_loop(
    processor: Arc<JobProcessor>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(interval_secs = interval.as_secs(), "Starting poll loop");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                tracing::debug!(
                    status = ?processor.status(),
                    done = processor.is_done(),
                    in_flight = ?processor.in_flight(),
                    "Probing job queue",
                );
                processor.process();
            }
        }
    }

    tracing::info!("Poll loop stopped");
}
