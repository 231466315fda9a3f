//! HTTP retrieval of flag data from the polling endpoints.

use std::sync::Mutex;

use reqwest::{header, StatusCode, Url};

use crate::model::{FeatureFlag, Segment};
use crate::store::AllData;
use crate::{Error, Result};

const LATEST_ALL_ENDPOINT: &str = "/sdk/latest-all";
const LATEST_FLAGS_ENDPOINT: &str = "/sdk/latest-flags";
const LATEST_SEGMENTS_ENDPOINT: &str = "/sdk/latest-segments";

struct CachedAll {
    etag: String,
    data: AllData,
}

/// Fetches flag data over HTTP.
///
/// Full-dataset polls honor HTTP caching: the last `ETag` is replayed via
/// `If-None-Match` and a 304 response is answered from the cached parse.
/// By-key fetches (used on behalf of the streaming path) always go to the
/// network so that stream-initiated reads are never stale.
pub(crate) struct FeatureRequestor {
    // reqwest::Client holds a connection pool, so it is shared across requests.
    http: reqwest::Client,
    base_uri: String,
    sdk_key: String,
    cache: Mutex<Option<CachedAll>>,
}

impl FeatureRequestor {
    pub(crate) fn new(http: reqwest::Client, base_uri: String, sdk_key: String) -> Self {
        FeatureRequestor {
            http,
            base_uri,
            sdk_key,
            cache: Mutex::new(None),
        }
    }

    /// Fetches the full dataset, honoring the ETag cache.
    pub(crate) async fn get_all(&self) -> Result<AllData> {
        let url = self.endpoint(LATEST_ALL_ENDPOINT, None)?;

        let mut request = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, &self.sdk_key)
            .header(header::USER_AGENT, crate::config::SDK_USER_AGENT);
        let cached_etag = {
            let cache = self.cache.lock().expect("requestor cache lock poisoned");
            cache.as_ref().map(|c| c.etag.clone())
        };
        if let Some(etag) = &cached_etag {
            request = request.header(header::IF_NONE_MATCH, etag);
        }

        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_MODIFIED {
            let cache = self.cache.lock().expect("requestor cache lock poisoned");
            if let Some(cached) = cache.as_ref() {
                log::debug!(target: "darklaunch", "flag data not modified, using cached dataset");
                return Ok(cached.data.clone());
            }
            // A 304 without a prior body should not happen; treat as transient.
            return Err(Error::TransientFailure(status.as_u16()));
        }
        if !status.is_success() {
            return Err(Error::from_http_status(status.as_u16()));
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.bytes().await?;
        let data: AllData = serde_json::from_slice(&body)
            .map_err(|err| Error::ParseError(err.to_string()))?;

        if let Some(etag) = etag {
            let mut cache = self.cache.lock().expect("requestor cache lock poisoned");
            *cache = Some(CachedAll {
                etag,
                data: data.clone(),
            });
        }

        log::debug!(target: "darklaunch",
            flags = data.flags.len(), segments = data.segments.len();
            "fetched full dataset");
        Ok(data)
    }

    /// Fetches a single flag, bypassing the cache.
    pub(crate) async fn get_flag(&self, key: &str) -> Result<FeatureFlag> {
        self.get_one(LATEST_FLAGS_ENDPOINT, key).await
    }

    /// Fetches a single segment, bypassing the cache.
    pub(crate) async fn get_segment(&self, key: &str) -> Result<Segment> {
        self.get_one(LATEST_SEGMENTS_ENDPOINT, key).await
    }

    async fn get_one<T: serde::de::DeserializeOwned>(&self, endpoint: &str, key: &str) -> Result<T> {
        let url = self.endpoint(endpoint, Some(key))?;
        let response = self
            .http
            .get(url)
            .header(header::AUTHORIZATION, &self.sdk_key)
            .header(header::USER_AGENT, crate::config::SDK_USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_http_status(status.as_u16()));
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| Error::ParseError(err.to_string()))
    }

    fn endpoint(&self, path: &str, key: Option<&str>) -> Result<Url> {
        let mut url = format!("{}{}", self.base_uri.trim_end_matches('/'), path);
        if let Some(key) = key {
            url.push('/');
            url.push_str(key);
        }
        Url::parse(&url).map_err(Error::InvalidBaseUri)
    }
}
