//! Delivery of event batches to the control plane.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Url};

use crate::{Error, Result};

use super::output::OutputEvent;

const BULK_ENDPOINT: &str = "/bulk";
const EVENT_SCHEMA_HEADER: &str = "X-LaunchDarkly-Event-Schema";
const EVENT_SCHEMA_VERSION: &str = "3";
const PAYLOAD_ID_HEADER: &str = "X-LaunchDarkly-Payload-ID";

/// The outcome of delivering one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SenderOutcome {
    /// The batch was accepted.
    Delivered,
    /// The batch was dropped after the retry also failed; the pipeline keeps
    /// running.
    GaveUp,
    /// The server rejected the batch permanently; the pipeline must stop
    /// accepting events.
    PermanentFailure,
}

/// Serializes batches and POSTs them to `/bulk`, retrying a failed delivery
/// exactly once after a fixed delay.
///
/// Successful responses expose the server's `Date` header, which the
/// processor uses to clamp debug-mode deadlines against clock skew.
#[derive(Clone)]
pub(crate) struct EventSender {
    http: reqwest::Client,
    events_base_uri: String,
    sdk_key: String,
    retry_delay: Duration,
    last_known_server_time: Arc<AtomicU64>,
}

impl EventSender {
    pub(crate) fn new(
        http: reqwest::Client,
        events_base_uri: String,
        sdk_key: String,
        retry_delay: Duration,
    ) -> Self {
        EventSender {
            http,
            events_base_uri,
            sdk_key,
            retry_delay,
            last_known_server_time: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Epoch milliseconds of the most recent server `Date` header, or 0.
    pub(crate) fn last_known_server_time(&self) -> u64 {
        self.last_known_server_time.load(Ordering::Relaxed)
    }

    /// Delivers one batch. Each delivery gets a fresh payload ID that is
    /// reused for the retry, so the server can deduplicate.
    pub(crate) async fn send(&self, batch: &[OutputEvent]) -> SenderOutcome {
        let payload_id = uuid::Uuid::new_v4().to_string();

        for attempt in 0..2 {
            if attempt > 0 {
                tokio::time::sleep(self.retry_delay).await;
                log::debug!(target: "darklaunch", "retrying event delivery");
            }
            match self.try_send(batch, &payload_id).await {
                Ok(()) => {
                    log::debug!(target: "darklaunch",
                        events = batch.len();
                        "delivered event batch");
                    return SenderOutcome::Delivered;
                }
                Err(err) if err.is_recoverable() => {
                    log::warn!(target: "darklaunch", "failed to deliver events: {err}");
                }
                Err(err) => {
                    log::error!(target: "darklaunch",
                        "failed to deliver events permanently, disabling event pipeline: {err}");
                    return SenderOutcome::PermanentFailure;
                }
            }
        }

        log::warn!(target: "darklaunch",
            events = batch.len();
            "dropping event batch after failed retry");
        SenderOutcome::GaveUp
    }

    async fn try_send(&self, batch: &[OutputEvent], payload_id: &str) -> Result<()> {
        let url = Url::parse(&format!(
            "{}{}",
            self.events_base_uri.trim_end_matches('/'),
            BULK_ENDPOINT
        ))
        .map_err(Error::InvalidBaseUri)?;

        let response = self
            .http
            .post(url)
            .header(header::AUTHORIZATION, &self.sdk_key)
            .header(header::USER_AGENT, crate::config::SDK_USER_AGENT)
            .header(EVENT_SCHEMA_HEADER, EVENT_SCHEMA_VERSION)
            .header(PAYLOAD_ID_HEADER, payload_id)
            .json(batch)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            if let Some(server_time) = response
                .headers()
                .get(header::DATE)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| chrono::DateTime::parse_from_rfc2822(v).ok())
            {
                self.last_known_server_time
                    .store(server_time.timestamp_millis() as u64, Ordering::Relaxed);
            }
            return Ok(());
        }

        Err(Error::from_http_status(status.as_u16()))
    }
}
