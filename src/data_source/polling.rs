//! The polling update processor: a periodic full-dataset fetch.

use std::sync::Arc;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tokio::sync::watch;

use crate::store::DataStore;

use super::{resolve_init, FeatureRequestor, InitState, UpdateProcessor};

/// Fetches `GET /sdk/latest-all` on a fixed interval and re-initializes the
/// store with each successful response.
///
/// Recoverable errors are logged and retried on the next tick; permanent
/// errors stop the loop and fail the init signal. The store keeps its last
/// good contents either way.
pub(crate) struct PollingUpdateProcessor {
    requestor: FeatureRequestor,
    poll_interval: Duration,
}

impl PollingUpdateProcessor {
    pub(crate) fn new(requestor: FeatureRequestor, poll_interval: Duration) -> Self {
        PollingUpdateProcessor {
            requestor,
            poll_interval,
        }
    }
}

impl UpdateProcessor for PollingUpdateProcessor {
    fn start(
        self: Box<Self>,
        store: Arc<dyn DataStore>,
        init_tx: watch::Sender<InitState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            log::info!(target: "darklaunch",
                interval_secs = self.poll_interval.as_secs();
                "starting polling update processor");

            loop {
                match self.requestor.get_all().await {
                    Ok(data) => {
                        store.init(data);
                        resolve_init(&init_tx, Ok(()));
                    }
                    Err(err) if err.is_recoverable() => {
                        log::warn!(target: "darklaunch",
                            "transient error fetching flag data, will retry next tick: {err}");
                    }
                    Err(err) => {
                        log::error!(target: "darklaunch",
                            "permanent error fetching flag data, stopping polling: {err}");
                        resolve_init(&init_tx, Err(err));
                        return;
                    }
                }

                let timeout = jitter(self.poll_interval);
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {}
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            log::debug!(target: "darklaunch", "polling update processor shutting down");
                            return;
                        }
                    }
                }
            }
        });
    }
}

/// Spreads poll times with a random jitter of up to a tenth of the interval.
fn jitter(interval: Duration) -> Duration {
    let jitter = interval / 10;
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}
