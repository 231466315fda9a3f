//! The data-source pipeline: background consumers that keep the data store
//! synchronized with the control plane.
//!
//! Two interchangeable update processors exist: a long-lived streaming
//! consumer and a periodic polling consumer. Both write into the store and
//! signal readiness through a watch channel once the first full dataset has
//! been stored — or signal failure when a permanent error (bad SDK key) makes
//! initialization impossible.

mod polling;
mod requestor;
mod streaming;

pub(crate) use polling::PollingUpdateProcessor;
pub(crate) use requestor::FeatureRequestor;
pub(crate) use streaming::StreamingUpdateProcessor;

use std::sync::Arc;

use tokio::sync::watch;

use crate::store::DataStore;
use crate::Error;

/// Initialization state published by an update processor: `None` until the
/// outcome is known, then `Some(Ok(()))` or `Some(Err(..))` exactly once.
pub(crate) type InitState = Option<Result<(), Error>>;

/// A background consumer feeding the data store.
pub(crate) trait UpdateProcessor: Send + 'static {
    /// Spawns the processor's long-lived task and returns immediately.
    ///
    /// The task runs until `shutdown_rx` observes `true` or a permanent
    /// error occurs. Must be called from within a tokio runtime.
    fn start(
        self: Box<Self>,
        store: Arc<dyn DataStore>,
        init_tx: watch::Sender<InitState>,
        shutdown_rx: watch::Receiver<bool>,
    );
}

/// Publishes the processor's first and only init outcome; later calls are
/// ignored.
pub(crate) fn resolve_init(init_tx: &watch::Sender<InitState>, outcome: Result<(), Error>) {
    init_tx.send_if_modified(|state| {
        if state.is_none() {
            *state = Some(outcome.clone());
            true
        } else {
            false
        }
    });
}
