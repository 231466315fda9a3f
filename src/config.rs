//! Client configuration.

use std::time::Duration;

use crate::events::EventsConfiguration;

/// `User-Agent` sent on every request.
pub(crate) const SDK_USER_AGENT: &str =
    concat!("RustServerSDK/", env!("CARGO_PKG_VERSION"));

/// Base URIs of the three services the SDK talks to. The defaults point at
/// the production control plane; override them for relay proxies or tests.
#[derive(Debug, Clone)]
pub struct ServiceEndpoints {
    /// Base URI for polling and by-key flag requests.
    pub base_uri: String,
    /// Base URI of the streaming service.
    pub streaming_base_uri: String,
    /// Base URI of the events service.
    pub events_base_uri: String,
}

impl Default for ServiceEndpoints {
    fn default() -> Self {
        ServiceEndpoints {
            base_uri: "https://sdk.launchdarkly.com".to_owned(),
            streaming_base_uri: "https://stream.launchdarkly.com".to_owned(),
            events_base_uri: "https://events.launchdarkly.com".to_owned(),
        }
    }
}

/// Configuration for [`crate::Client`].
///
/// # Examples
/// ```
/// # use darklaunch::Config;
/// let config = Config::builder("sdk-key")
///     .poll_interval(std::time::Duration::from_secs(60))
///     .streaming(false)
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    pub(crate) sdk_key: String,
    pub(crate) endpoints: ServiceEndpoints,
    pub(crate) streaming: bool,
    pub(crate) poll_interval: Duration,
    pub(crate) initial_reconnect_delay: Duration,
    pub(crate) offline: bool,
    pub(crate) events_enabled: bool,
    pub(crate) events: EventsConfiguration,
}

impl Config {
    /// Starts building a configuration with the given SDK key.
    pub fn builder(sdk_key: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder {
            config: Config {
                sdk_key: sdk_key.into(),
                endpoints: ServiceEndpoints::default(),
                streaming: true,
                poll_interval: Duration::from_secs(30),
                initial_reconnect_delay: Duration::from_secs(1),
                offline: false,
                events_enabled: true,
                events: EventsConfiguration::default(),
            },
        }
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Overrides the service base URIs.
    pub fn endpoints(mut self, endpoints: ServiceEndpoints) -> Self {
        self.config.endpoints = endpoints;
        self
    }

    /// Selects streaming (default) or polling as the update mechanism.
    pub fn streaming(mut self, streaming: bool) -> Self {
        self.config.streaming = streaming;
        self
    }

    /// Interval between polls in polling mode. Default 30 seconds.
    pub fn poll_interval(mut self, poll_interval: Duration) -> Self {
        self.config.poll_interval = poll_interval;
        self
    }

    /// Base delay for stream reconnect backoff. Default 1 second.
    pub fn initial_reconnect_delay(mut self, delay: Duration) -> Self {
        self.config.initial_reconnect_delay = delay;
        self
    }

    /// Offline mode: no network tasks run and every evaluation serves its
    /// default value.
    pub fn offline(mut self, offline: bool) -> Self {
        self.config.offline = offline;
        self
    }

    /// Disables the analytics event pipeline entirely.
    pub fn events_enabled(mut self, enabled: bool) -> Self {
        self.config.events_enabled = enabled;
        self
    }

    /// Overrides event pipeline settings.
    pub fn events(mut self, events: EventsConfiguration) -> Self {
        self.config.events = events;
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::Config;

    #[test]
    fn builder_applies_defaults_and_overrides() {
        let config = Config::builder("key").build();
        assert!(config.streaming);
        assert!(!config.offline);
        assert!(config.events_enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.endpoints.base_uri, "https://sdk.launchdarkly.com");

        let config = Config::builder("key")
            .streaming(false)
            .poll_interval(Duration::from_secs(5))
            .offline(true)
            .events_enabled(false)
            .build();
        assert!(!config.streaming);
        assert!(config.offline);
        assert!(!config.events_enabled);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
    }
}
