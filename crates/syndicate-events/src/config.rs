//! Configuration sections and dispatch tunables.
//!
//! Configuration reaches the engine as string key-value sections parsed by
//! the surrounding process; this module provides the section model plugins
//! declare their keys against ([`ConfigSection`], [`ConfigKeySpec`]) and
//! the engine's own dispatch tunables ([`DispatchConfig`]).

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use crate::error::EventsError;

/// In-flight window size (events) a dispatcher may run ahead of the
/// committed offset.
pub const KEY_MAX_READ_AHEAD: &str = "readahead.max";

/// Maximum events grouped into one batch delivery.
pub const KEY_MAX_BATCH_SIZE: &str = "batch.size";

/// How long to hold a partial batch open before flushing it (ms).
pub const KEY_BATCH_TIMEOUT_MS: &str = "batch.timeout.ms";

/// Initial delay before retrying a failed delivery request (ms).
pub const KEY_RETRY_INITIAL_MS: &str = "retry.initial.ms";

/// Ceiling for the delivery retry backoff (ms).
pub const KEY_RETRY_MAX_MS: &str = "retry.max.ms";

/// Idle delay between event-source polls when no events are available (ms).
pub const KEY_POLL_INTERVAL_MS: &str = "poll.interval.ms";

/// A string key-value configuration section.
///
/// Plugins declare the keys they recognize (with defaults) during
/// `init_config`; the engine reads its own tunables from a section the
/// same way. Parsing the underlying file/env format is the surrounding
/// process's concern.
#[derive(Debug, Clone, Default)]
pub struct ConfigSection {
    /// Section name (e.g. the plugin name it configures).
    name: String,

    /// Configuration properties.
    properties: HashMap<String, String>,

    /// Keys declared against this section.
    specs: Vec<ConfigKeySpec>,
}

impl ConfigSection {
    /// Creates an empty section with the given name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: HashMap::new(),
            specs: Vec::new(),
        }
    }

    /// Creates a section from existing properties.
    #[must_use]
    pub fn with_properties(name: impl Into<String>, properties: HashMap<String, String>) -> Self {
        Self {
            name: name.into(),
            properties,
            specs: Vec::new(),
        }
    }

    /// Returns the section name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets a property.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Gets a property.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Gets a required property.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::MissingConfig`] if the key is not set.
    pub fn require(&self, key: &str) -> Result<&str, EventsError> {
        self.get(key)
            .ok_or_else(|| EventsError::MissingConfig(format!("{}.{key}", self.name)))
    }

    /// Gets a property parsed as the given type.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::Config`] if the value cannot be parsed.
    pub fn get_parsed<T: std::str::FromStr>(&self, key: &str) -> Result<Option<T>, EventsError>
    where
        T::Err: fmt::Display,
    {
        match self.get(key) {
            Some(v) => v.parse::<T>().map(Some).map_err(|e| {
                EventsError::Config(format!("invalid value for '{}.{key}': {e}", self.name))
            }),
            None => Ok(None),
        }
    }

    /// Declares a key this section recognizes.
    ///
    /// Declared defaults are applied by [`apply_defaults`](Self::apply_defaults).
    pub fn declare(&mut self, spec: ConfigKeySpec) {
        self.specs.push(spec);
    }

    /// Returns the keys declared against this section.
    #[must_use]
    pub fn specs(&self) -> &[ConfigKeySpec] {
        &self.specs
    }

    /// Fills unset properties from declared defaults.
    pub fn apply_defaults(&mut self) {
        for spec in &self.specs {
            if let Some(ref default) = spec.default {
                if !self.properties.contains_key(&spec.key) {
                    self.properties.insert(spec.key.clone(), default.clone());
                }
            }
        }
    }

    /// Validates that all declared required keys are present.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::MissingConfig`] for the first missing key.
    pub fn validate(&self) -> Result<(), EventsError> {
        for spec in &self.specs {
            if spec.required && spec.default.is_none() && self.get(&spec.key).is_none() {
                return Err(EventsError::MissingConfig(format!(
                    "{}.{}",
                    self.name, spec.key
                )));
            }
        }
        Ok(())
    }

    /// Returns a child section holding the properties under `prefix.`,
    /// with the prefix stripped.
    #[must_use]
    pub fn sub_section(&self, prefix: &str) -> ConfigSection {
        let dotted = format!("{prefix}.");
        let properties = self
            .properties
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&dotted)
                    .map(|stripped| (stripped.to_string(), v.clone()))
            })
            .collect();
        ConfigSection::with_properties(prefix, properties)
    }
}

/// Specification for a configuration key, declared by its consumer.
#[derive(Debug, Clone)]
pub struct ConfigKeySpec {
    /// The key name.
    pub key: String,

    /// Human-readable description.
    pub description: String,

    /// Whether the key must be set (or defaulted).
    pub required: bool,

    /// Default value applied when the key is unset.
    pub default: Option<String>,
}

impl ConfigKeySpec {
    /// Creates a required key spec with no default.
    #[must_use]
    pub fn required(key: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            required: true,
            default: None,
        }
    }

    /// Creates an optional key spec with a default value.
    #[must_use]
    pub fn optional(
        key: impl Into<String>,
        description: impl Into<String>,
        default: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            description: description.into(),
            required: false,
            default: Some(default.into()),
        }
    }
}

/// Operator-tunable dispatch parameters.
///
/// The defaults are placeholders with no semantic weight; deployments
/// tune these through the engine's config section.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// In-flight window: how many events a dispatcher may have delivered
    /// but not yet committed. Full window blocks further pulls.
    pub max_read_ahead: usize,

    /// Maximum events grouped into one batch delivery.
    pub max_batch_size: usize,

    /// How long a partial batch waits for more events before flushing.
    pub batch_timeout: Duration,

    /// Initial delivery retry delay; doubles per attempt.
    pub retry_initial_delay: Duration,

    /// Ceiling for the delivery retry backoff.
    pub retry_max_delay: Duration,

    /// Idle delay between event-source polls.
    pub poll_interval: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_read_ahead: 16,
            max_batch_size: 16,
            batch_timeout: Duration::from_millis(250),
            retry_initial_delay: Duration::from_millis(250),
            retry_max_delay: Duration::from_secs(30),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl DispatchConfig {
    /// Declares the engine's tunable keys (with defaults) on a section.
    pub fn declare_keys(section: &mut ConfigSection) {
        let d = DispatchConfig::default();
        section.declare(ConfigKeySpec::optional(
            KEY_MAX_READ_AHEAD,
            "In-flight window size in events",
            d.max_read_ahead.to_string(),
        ));
        section.declare(ConfigKeySpec::optional(
            KEY_MAX_BATCH_SIZE,
            "Maximum events per batch delivery",
            d.max_batch_size.to_string(),
        ));
        section.declare(ConfigKeySpec::optional(
            KEY_BATCH_TIMEOUT_MS,
            "Partial batch flush deadline in milliseconds",
            d.batch_timeout.as_millis().to_string(),
        ));
        section.declare(ConfigKeySpec::optional(
            KEY_RETRY_INITIAL_MS,
            "Initial delivery retry delay in milliseconds",
            d.retry_initial_delay.as_millis().to_string(),
        ));
        section.declare(ConfigKeySpec::optional(
            KEY_RETRY_MAX_MS,
            "Maximum delivery retry delay in milliseconds",
            d.retry_max_delay.as_millis().to_string(),
        ));
        section.declare(ConfigKeySpec::optional(
            KEY_POLL_INTERVAL_MS,
            "Idle event-source poll delay in milliseconds",
            d.poll_interval.as_millis().to_string(),
        ));
    }

    /// Builds a config from a section, falling back to defaults for
    /// unset keys.
    ///
    /// # Errors
    ///
    /// Returns [`EventsError::Config`] if a set value cannot be parsed,
    /// or if the window or batch size parse to zero.
    pub fn from_section(section: &ConfigSection) -> Result<Self, EventsError> {
        let d = DispatchConfig::default();
        let ms = |v: u64| Duration::from_millis(v);

        let config = Self {
            max_read_ahead: section
                .get_parsed(KEY_MAX_READ_AHEAD)?
                .unwrap_or(d.max_read_ahead),
            max_batch_size: section
                .get_parsed(KEY_MAX_BATCH_SIZE)?
                .unwrap_or(d.max_batch_size),
            batch_timeout: section
                .get_parsed(KEY_BATCH_TIMEOUT_MS)?
                .map_or(d.batch_timeout, ms),
            retry_initial_delay: section
                .get_parsed(KEY_RETRY_INITIAL_MS)?
                .map_or(d.retry_initial_delay, ms),
            retry_max_delay: section
                .get_parsed(KEY_RETRY_MAX_MS)?
                .map_or(d.retry_max_delay, ms),
            poll_interval: section
                .get_parsed(KEY_POLL_INTERVAL_MS)?
                .map_or(d.poll_interval, ms),
        };

        if config.max_read_ahead == 0 {
            return Err(EventsError::Config(format!(
                "'{KEY_MAX_READ_AHEAD}' must be at least 1"
            )));
        }
        if config.max_batch_size == 0 {
            return Err(EventsError::Config(format!(
                "'{KEY_MAX_BATCH_SIZE}' must be at least 1"
            )));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- Section tests ---

    #[test]
    fn test_section_basic_operations() {
        let mut section = ConfigSection::new("websockets");
        section.set("listen.port", "8080");

        assert_eq!(section.name(), "websockets");
        assert_eq!(section.get("listen.port"), Some("8080"));
        assert_eq!(section.get("missing"), None);
    }

    #[test]
    fn test_section_require() {
        let mut section = ConfigSection::new("webhooks");
        section.set("url", "http://localhost");

        assert!(section.require("url").is_ok());
        let err = section.require("missing").unwrap_err();
        assert!(err.to_string().contains("webhooks.missing"));
    }

    #[test]
    fn test_section_parsed() {
        let mut section = ConfigSection::new("test");
        section.set("size", "1000");
        section.set("bad", "not_a_number");

        let size: Option<usize> = section.get_parsed("size").unwrap();
        assert_eq!(size, Some(1000));

        let missing: Option<usize> = section.get_parsed("missing").unwrap();
        assert_eq!(missing, None);

        let bad: Result<Option<usize>, _> = section.get_parsed("bad");
        assert!(bad.is_err());
    }

    #[test]
    fn test_section_declare_and_defaults() {
        let mut section = ConfigSection::new("test");
        section.declare(ConfigKeySpec::optional("a", "first", "1"));
        section.declare(ConfigKeySpec::required("b", "second"));
        section.set("b", "set");

        section.apply_defaults();
        assert_eq!(section.get("a"), Some("1"));
        assert_eq!(section.get("b"), Some("set"));
        assert!(section.validate().is_ok());
        assert_eq!(section.specs().len(), 2);
    }

    #[test]
    fn test_section_validate_missing_required() {
        let mut section = ConfigSection::new("test");
        section.declare(ConfigKeySpec::required("url", "endpoint"));
        assert!(section.validate().is_err());
    }

    #[test]
    fn test_section_sub_section() {
        let mut section = ConfigSection::new("events");
        section.set("websockets.listen.port", "8080");
        section.set("websockets.path", "/ws");
        section.set("webhooks.url", "http://localhost");

        let ws = section.sub_section("websockets");
        assert_eq!(ws.name(), "websockets");
        assert_eq!(ws.get("listen.port"), Some("8080"));
        assert_eq!(ws.get("path"), Some("/ws"));
        assert_eq!(ws.get("url"), None);
    }

    // --- DispatchConfig tests ---

    #[test]
    fn test_dispatch_config_default() {
        let config = DispatchConfig::default();
        assert_eq!(config.max_read_ahead, 16);
        assert_eq!(config.max_batch_size, 16);
        assert_eq!(config.batch_timeout, Duration::from_millis(250));
        assert_eq!(config.retry_initial_delay, Duration::from_millis(250));
        assert_eq!(config.retry_max_delay, Duration::from_secs(30));
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_dispatch_config_from_section() {
        let mut section = ConfigSection::new("dispatch");
        section.set(KEY_MAX_READ_AHEAD, "4");
        section.set(KEY_RETRY_INITIAL_MS, "10");

        let config = DispatchConfig::from_section(&section).unwrap();
        assert_eq!(config.max_read_ahead, 4);
        assert_eq!(config.retry_initial_delay, Duration::from_millis(10));
        // Unset keys fall back to defaults
        assert_eq!(config.max_batch_size, 16);
    }

    #[test]
    fn test_dispatch_config_rejects_zero_window() {
        let mut section = ConfigSection::new("dispatch");
        section.set(KEY_MAX_READ_AHEAD, "0");
        assert!(DispatchConfig::from_section(&section).is_err());

        let mut section = ConfigSection::new("dispatch");
        section.set(KEY_MAX_BATCH_SIZE, "0");
        assert!(DispatchConfig::from_section(&section).is_err());
    }

    #[test]
    fn test_dispatch_config_declare_keys() {
        let mut section = ConfigSection::new("dispatch");
        DispatchConfig::declare_keys(&mut section);
        section.apply_defaults();

        let config = DispatchConfig::from_section(&section).unwrap();
        assert_eq!(config.max_read_ahead, DispatchConfig::default().max_read_ahead);
    }
}
