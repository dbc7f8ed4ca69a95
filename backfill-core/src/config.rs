//! Configuration types

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of items requested from the remote source per fetch.
pub const DEFAULT_NETWORK_PAGE_SIZE: usize = 10;

/// Runtime configuration for a repository instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Items requested per remote fetch unless a listing overrides it.
    pub network_page_size: usize,
    /// How close (in items) the read cursor may get to either edge of the
    /// cached window before a boundary is signalled.
    pub prefetch_distance: usize,
    /// Upper bound on background tasks running at once.
    pub max_concurrent_tasks: usize,
    /// Buffered transitions per load-state subscriber before it lags.
    pub state_channel_capacity: usize,
    /// Request timeout for the HTTP fetcher. `None` defers to the transport.
    #[serde(with = "duration_millis_opt")]
    pub http_timeout: Option<Duration>,
    /// User agent sent by the HTTP fetcher.
    pub user_agent: String,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            network_page_size: DEFAULT_NETWORK_PAGE_SIZE,
            prefetch_distance: 3,
            max_concurrent_tasks: 4,
            state_channel_capacity: 32,
            http_timeout: None,
            user_agent: concat!("backfill/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl BackfillConfig {
    /// Create a new config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default remote page size.
    pub fn with_network_page_size(mut self, size: usize) -> Self {
        self.network_page_size = size;
        self
    }

    /// Set the prefetch distance.
    pub fn with_prefetch_distance(mut self, distance: usize) -> Self {
        self.prefetch_distance = distance;
        self
    }

    /// Set the background concurrency limit.
    pub fn with_max_concurrent_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_tasks = max;
        self
    }

    /// Set the per-subscriber load-state buffer.
    pub fn with_state_channel_capacity(mut self, capacity: usize) -> Self {
        self.state_channel_capacity = capacity;
        self
    }

    /// Set the HTTP request timeout.
    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self
    }

    /// Set the HTTP user agent.
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Build a config from `BACKFILL_*` environment variables, falling back
    /// to defaults for anything unset. Set-but-unparseable values are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = lookup("BACKFILL_NETWORK_PAGE_SIZE") {
            config.network_page_size = parse_usize("network_page_size", &v)?;
        }
        if let Some(v) = lookup("BACKFILL_PREFETCH_DISTANCE") {
            config.prefetch_distance = parse_usize("prefetch_distance", &v)?;
        }
        if let Some(v) = lookup("BACKFILL_MAX_CONCURRENT_TASKS") {
            config.max_concurrent_tasks = parse_usize("max_concurrent_tasks", &v)?;
        }
        if let Some(v) = lookup("BACKFILL_STATE_CHANNEL_CAPACITY") {
            config.state_channel_capacity = parse_usize("state_channel_capacity", &v)?;
        }
        if let Some(v) = lookup("BACKFILL_HTTP_TIMEOUT_MS") {
            let millis = parse_usize("http_timeout", &v)?;
            config.http_timeout = Some(Duration::from_millis(millis as u64));
        }
        if let Some(v) = lookup("BACKFILL_USER_AGENT") {
            config.user_agent = v;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that every value is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.network_page_size == 0 {
            return Err(positive("network_page_size", self.network_page_size));
        }
        if self.max_concurrent_tasks == 0 {
            return Err(positive("max_concurrent_tasks", self.max_concurrent_tasks));
        }
        if self.state_channel_capacity == 0 {
            return Err(positive(
                "state_channel_capacity",
                self.state_channel_capacity,
            ));
        }
        if self.http_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                field: "http_timeout".to_string(),
                value: "0ms".to_string(),
                reason: "must be positive when set".to_string(),
            });
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "user_agent".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_usize(field: &str, value: &str) -> Result<usize, ConfigError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

fn positive(field: &str, value: usize) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        value: value.to_string(),
        reason: "must be positive".to_string(),
    }
}

mod duration_millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_page_size_is_ten() {
        let config = BackfillConfig::default();
        assert_eq!(config.network_page_size, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = BackfillConfig::new()
            .with_network_page_size(25)
            .with_prefetch_distance(5)
            .with_max_concurrent_tasks(2)
            .with_state_channel_capacity(8)
            .with_http_timeout(Duration::from_secs(5))
            .with_user_agent("test-agent");

        assert_eq!(config.network_page_size, 25);
        assert_eq!(config.prefetch_distance, 5);
        assert_eq!(config.max_concurrent_tasks, 2);
        assert_eq!(config.state_channel_capacity, 8);
        assert_eq!(config.http_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.user_agent, "test-agent");
    }

    #[test]
    fn test_from_lookup_overrides_defaults() {
        let config = BackfillConfig::from_lookup(lookup(&[
            ("BACKFILL_NETWORK_PAGE_SIZE", "50"),
            ("BACKFILL_HTTP_TIMEOUT_MS", "1500"),
        ]))
        .expect("config should parse");

        assert_eq!(config.network_page_size, 50);
        assert_eq!(config.http_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(config.prefetch_distance, 3);
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let err = BackfillConfig::from_lookup(lookup(&[("BACKFILL_PREFETCH_DISTANCE", "lots")]))
            .expect_err("garbage should not parse");
        assert!(matches!(err, ConfigError::InvalidValue { ref field, .. } if field == "prefetch_distance"));
    }

    #[test]
    fn test_validate_rejects_zero_page_size() {
        let err = BackfillConfig::new()
            .with_network_page_size(0)
            .validate()
            .expect_err("zero page size is invalid");
        assert!(err.to_string().contains("network_page_size"));
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: BackfillConfig =
            serde_json::from_str(r#"{"network_page_size": 20, "http_timeout": 250}"#)
                .expect("partial config should deserialize");
        assert_eq!(config.network_page_size, 20);
        assert_eq!(config.http_timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.max_concurrent_tasks, 4);
    }
}
