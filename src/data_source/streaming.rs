//! The streaming update processor: a long-lived server-sent-events consumer.

use std::sync::Arc;
use std::time::Duration;

use eventsource_client as es;
use es::Client as _;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::watch;

use crate::store::{AllData, DataKind, DataStore, PatchTarget};
use crate::{Error, Result};

use super::{resolve_init, FeatureRequestor, InitState, UpdateProcessor};

const STREAM_ENDPOINT: &str = "/all";

// The server heartbeats with SSE comments; silence longer than this forces a
// reconnect.
const READ_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Consumes the `/all` SSE stream and applies `put`/`patch`/`delete` events
/// to the store. `indirect/put` and `indirect/patch` events carry no data and
/// are resolved through the feature requestor with caching bypassed, so
/// stream-initiated reads are never stale.
///
/// Reconnects (with exponential backoff and jitter) are delegated to the
/// eventsource client; this processor decides which failures are permanent:
/// 401/403 shut it down and fail the init signal, everything else keeps the
/// stream alive.
pub(crate) struct StreamingUpdateProcessor {
    stream_base_uri: String,
    sdk_key: String,
    initial_reconnect_delay: Duration,
    requestor: FeatureRequestor,
}

impl StreamingUpdateProcessor {
    pub(crate) fn new(
        stream_base_uri: String,
        sdk_key: String,
        initial_reconnect_delay: Duration,
        requestor: FeatureRequestor,
    ) -> Self {
        StreamingUpdateProcessor {
            stream_base_uri,
            sdk_key,
            initial_reconnect_delay,
            requestor,
        }
    }

    fn build_client(&self) -> Result<impl es::Client> {
        let url = format!(
            "{}{}",
            self.stream_base_uri.trim_end_matches('/'),
            STREAM_ENDPOINT
        );
        let builder = es::ClientBuilder::for_url(&url)
            .and_then(|builder| builder.header("Authorization", &self.sdk_key))
            .and_then(|builder| builder.header("User-Agent", crate::config::SDK_USER_AGENT))
            .map_err(|_| {
                Error::ParseError(format!("cannot build stream connection to {url}"))
            })?;

        Ok(builder
            .reconnect(
                es::ReconnectOptions::reconnect(true)
                    .retry_initial(true)
                    .delay(self.initial_reconnect_delay)
                    .backoff_factor(2)
                    .delay_max(MAX_RECONNECT_DELAY)
                    .build(),
            )
            .read_timeout(READ_TIMEOUT)
            .build())
    }

    /// Applies one stream event. `Err` means a permanent failure that must
    /// stop the processor; everything recoverable is handled here.
    async fn handle_event(
        &self,
        event: es::Event,
        store: &dyn DataStore,
        init_tx: &watch::Sender<InitState>,
    ) -> Result<()> {
        match event.event_type.as_str() {
            "put" => match parse_put(&event.data) {
                Ok(data) => {
                    log::debug!(target: "darklaunch",
                        flags = data.flags.len(), segments = data.segments.len();
                        "applying full dataset from stream");
                    store.init(data);
                    resolve_init(init_tx, Ok(()));
                }
                Err(err) => {
                    log::warn!(target: "darklaunch", "dropping unparseable put event: {err}");
                }
            },
            "patch" => match parse_patch(&event.data) {
                Ok((key, item)) => store.upsert(&key, item),
                Err(err) => {
                    log::warn!(target: "darklaunch", "dropping unparseable patch event: {err}");
                }
            },
            "delete" => match parse_delete(&event.data) {
                Ok((kind, key, version)) => store.delete(kind, &key, version),
                Err(err) => {
                    log::warn!(target: "darklaunch", "dropping unparseable delete event: {err}");
                }
            },
            "indirect/put" => match self.requestor.get_all().await {
                Ok(data) => {
                    store.init(data);
                    resolve_init(init_tx, Ok(()));
                }
                Err(err) if err.is_recoverable() => {
                    log::warn!(target: "darklaunch",
                        "failed to fetch dataset for indirect put: {err}");
                }
                Err(err) => return Err(err),
            },
            "indirect/patch" => {
                if let Err(err) = self.apply_indirect_patch(event.data.trim(), store).await {
                    if !err.is_recoverable() {
                        return Err(err);
                    }
                    log::warn!(target: "darklaunch",
                        "failed to fetch item for indirect patch: {err}");
                }
            }
            other => {
                log::warn!(target: "darklaunch", event_type = other; "ignoring unknown stream event");
            }
        }
        Ok(())
    }

    /// An indirect patch names a path; the item itself is fetched fresh.
    async fn apply_indirect_patch(&self, path: &str, store: &dyn DataStore) -> Result<()> {
        let (kind, key) = parse_path(path)?;
        match kind {
            DataKind::Flag => {
                let flag = self.requestor.get_flag(key).await?;
                store.upsert(key, PatchTarget::Flag(flag.into()));
            }
            DataKind::Segment => {
                let segment = self.requestor.get_segment(key).await?;
                store.upsert(key, PatchTarget::Segment(segment.into()));
            }
        }
        Ok(())
    }
}

impl UpdateProcessor for StreamingUpdateProcessor {
    fn start(
        self: Box<Self>,
        store: Arc<dyn DataStore>,
        init_tx: watch::Sender<InitState>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            log::info!(target: "darklaunch", "starting streaming update processor");
            let client = match self.build_client() {
                Ok(client) => client,
                Err(err) => {
                    resolve_init(&init_tx, Err(err));
                    return;
                }
            };
            let mut stream = client.stream();

            loop {
                tokio::select! {
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            log::debug!(target: "darklaunch", "streaming update processor shutting down");
                            return;
                        }
                    }
                    item = stream.next() => match item {
                        Some(Ok(es::SSE::Event(event))) => {
                            if let Err(err) = self.handle_event(event, store.as_ref(), &init_tx).await {
                                log::error!(target: "darklaunch",
                                    "stream processing failed permanently, stopping: {err}");
                                resolve_init(&init_tx, Err(err));
                                return;
                            }
                        }
                        // Heartbeats only reset the read timeout.
                        Some(Ok(es::SSE::Comment(_))) => {}
                        Some(Err(es::Error::UnexpectedResponse(status))) => {
                            let err = Error::from_http_status(status.as_u16());
                            if err.is_recoverable() {
                                log::warn!(target: "darklaunch",
                                    "stream request failed, will reconnect: {err}");
                            } else {
                                log::error!(target: "darklaunch",
                                    "stream request failed permanently, stopping: {err}");
                                resolve_init(&init_tx, Err(err));
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            // Includes read timeouts; the client reconnects
                            // with backoff on the next poll.
                            log::warn!(target: "darklaunch",
                                "error reading stream, will reconnect: {err}");
                        }
                        None => {
                            log::warn!(target: "darklaunch", "stream ended unexpectedly");
                            return;
                        }
                    }
                }
            }
        });
    }
}

#[derive(Deserialize)]
struct PutData {
    #[allow(dead_code)]
    #[serde(default)]
    path: String,
    data: AllData,
}

#[derive(Deserialize)]
struct PatchData {
    path: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct DeleteData {
    path: String,
    version: u64,
}

fn parse_path(path: &str) -> Result<(DataKind, &str)> {
    if let Some(key) = path.strip_prefix("/flags/") {
        Ok((DataKind::Flag, key))
    } else if let Some(key) = path.strip_prefix("/segments/") {
        Ok((DataKind::Segment, key))
    } else {
        Err(Error::ParseError(format!("unrecognized data path {path:?}")))
    }
}

fn parse_put(data: &str) -> Result<AllData> {
    let put: PutData =
        serde_json::from_str(data).map_err(|err| Error::ParseError(err.to_string()))?;
    Ok(put.data)
}

fn parse_patch(data: &str) -> Result<(String, PatchTarget)> {
    let patch: PatchData =
        serde_json::from_str(data).map_err(|err| Error::ParseError(err.to_string()))?;
    let (kind, key) = parse_path(&patch.path)?;
    let item = match kind {
        DataKind::Flag => PatchTarget::Flag(
            serde_json::from_value::<crate::model::FeatureFlag>(patch.data)
                .map_err(|err| Error::ParseError(err.to_string()))?
                .into(),
        ),
        DataKind::Segment => PatchTarget::Segment(
            serde_json::from_value::<crate::model::Segment>(patch.data)
                .map_err(|err| Error::ParseError(err.to_string()))?
                .into(),
        ),
    };
    Ok((key.to_owned(), item))
}

fn parse_delete(data: &str) -> Result<(DataKind, String, u64)> {
    let delete: DeleteData =
        serde_json::from_str(data).map_err(|err| Error::ParseError(err.to_string()))?;
    let (kind, key) = parse_path(&delete.path)?;
    Ok((kind, key.to_owned(), delete.version))
}
