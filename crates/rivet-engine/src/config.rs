//! Opaque engine configuration and the options extracted from it.
//!
//! Upper layers hand the engine an [`EndpointConfig`], a key→value map the
//! engine consults for the handful of keys it recognizes. Unknown keys are
//! ignored so channel stacks can share one map across layers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::quota::MemoryQuota;

/// Key: memory quota handle for this engine.
pub const KEY_RESOURCE_QUOTA: &str = "resource_quota";
/// Key: enable zero-copy send when supported.
pub const KEY_TCP_TX_ZEROCOPY_ENABLED: &str = "tcp_tx_zerocopy_enabled";
/// Key: minimum write size, in bytes, at which zero-copy send activates.
pub const KEY_TCP_TX_ZEROCOPY_THRESHOLD: &str = "tcp_tx_zerocopy_send_bytes_threshold";
/// Key: client idle timeout in milliseconds.
pub const KEY_CLIENT_IDLE_TIMEOUT_MS: &str = "client_idle_timeout_ms";
/// Key: poller backend selector.
pub const KEY_POLL_STRATEGY: &str = "poll_strategy";

/// Smallest idle timeout the engine will honor; lower values are clamped.
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_millis(1000);

const DEFAULT_READ_CHUNK: usize = 8 * 1024;
const DEFAULT_ZEROCOPY_THRESHOLD: usize = 16 * 1024;
const DEFAULT_BACKLOG: u32 = 128;

/// A single configuration value.
#[derive(Clone, Debug)]
pub enum ConfigValue {
    /// Integer-valued setting.
    Integer(i64),
    /// Boolean-valued setting.
    Bool(bool),
    /// String-valued setting.
    Str(String),
    /// A shared memory-quota handle.
    Quota(Arc<MemoryQuota>),
}

/// Opaque key→value configuration consumed by the engine.
#[derive(Clone, Debug, Default)]
pub struct EndpointConfig {
    map: HashMap<String, ConfigValue>,
}

impl EndpointConfig {
    /// Creates an empty configuration.
    pub fn new() -> Self {
        EndpointConfig::default()
    }

    /// Sets an integer value, returning `self` for chaining.
    pub fn set_int(mut self, key: impl Into<String>, value: i64) -> Self {
        self.map.insert(key.into(), ConfigValue::Integer(value));
        self
    }

    /// Sets a boolean value, returning `self` for chaining.
    pub fn set_bool(mut self, key: impl Into<String>, value: bool) -> Self {
        self.map.insert(key.into(), ConfigValue::Bool(value));
        self
    }

    /// Sets a string value, returning `self` for chaining.
    pub fn set_str(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.map.insert(key.into(), ConfigValue::Str(value.into()));
        self
    }

    /// Sets a quota handle, returning `self` for chaining.
    pub fn set_quota(mut self, key: impl Into<String>, quota: Arc<MemoryQuota>) -> Self {
        self.map.insert(key.into(), ConfigValue::Quota(quota));
        self
    }

    /// Looks up an integer value.
    pub fn get_int(&self, key: &str) -> Option<i64> {
        match self.map.get(key) {
            Some(ConfigValue::Integer(v)) => Some(*v),
            _ => None,
        }
    }

    /// Looks up a boolean value.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.map.get(key) {
            Some(ConfigValue::Bool(v)) => Some(*v),
            _ => None,
        }
    }

    /// Looks up a string value.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.map.get(key) {
            Some(ConfigValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    /// Looks up a quota handle.
    pub fn get_quota(&self, key: &str) -> Option<Arc<MemoryQuota>> {
        match self.map.get(key) {
            Some(ConfigValue::Quota(q)) => Some(Arc::clone(q)),
            _ => None,
        }
    }

    /// True when no keys are set.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Transport options distilled from an [`EndpointConfig`].
#[derive(Clone, Debug)]
pub struct TcpOptions {
    /// Disable Nagle's algorithm on new sockets.
    pub nodelay: bool,
    /// Target size for each quota-backed read allocation.
    pub read_chunk_size: usize,
    /// Use the vectored zero-copy send path for large writes.
    pub zerocopy_enabled: bool,
    /// Minimum write size at which the zero-copy path activates.
    pub zerocopy_threshold: usize,
    /// Listen backlog for new listeners.
    pub backlog: u32,
    /// Poller backend selector; the runtime decides when unset.
    pub poll_strategy: Option<String>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        TcpOptions {
            nodelay: true,
            read_chunk_size: DEFAULT_READ_CHUNK,
            zerocopy_enabled: false,
            zerocopy_threshold: DEFAULT_ZEROCOPY_THRESHOLD,
            backlog: DEFAULT_BACKLOG,
            poll_strategy: None,
        }
    }
}

impl TcpOptions {
    /// Extracts the recognized transport keys from `config`.
    pub fn from_config(config: &EndpointConfig) -> Self {
        let defaults = TcpOptions::default();
        TcpOptions {
            nodelay: defaults.nodelay,
            read_chunk_size: defaults.read_chunk_size,
            zerocopy_enabled: config
                .get_bool(KEY_TCP_TX_ZEROCOPY_ENABLED)
                .unwrap_or(defaults.zerocopy_enabled),
            zerocopy_threshold: config
                .get_int(KEY_TCP_TX_ZEROCOPY_THRESHOLD)
                .and_then(|v| usize::try_from(v).ok())
                .unwrap_or(defaults.zerocopy_threshold),
            backlog: defaults.backlog,
            poll_strategy: config.get_str(KEY_POLL_STRATEGY).map(str::to_string),
        }
    }
}

/// Reads the idle timeout from `config`.
///
/// Absent or non-positive means the channel never idles out. Values below
/// [`MIN_IDLE_TIMEOUT`] are clamped up to it.
pub fn idle_timeout_from_config(config: &EndpointConfig) -> Option<Duration> {
    let ms = config.get_int(KEY_CLIENT_IDLE_TIMEOUT_MS)?;
    if ms <= 0 {
        return None;
    }
    Some(Duration::from_millis(ms as u64).max(MIN_IDLE_TIMEOUT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let quota = MemoryQuota::unlimited("test");
        let config = EndpointConfig::new()
            .set_int("answer", 42)
            .set_bool("flag", true)
            .set_str("label", "abc")
            .set_quota(KEY_RESOURCE_QUOTA, Arc::clone(&quota));
        assert_eq!(config.get_int("answer"), Some(42));
        assert_eq!(config.get_bool("flag"), Some(true));
        assert_eq!(config.get_str("label"), Some("abc"));
        assert!(config.get_quota(KEY_RESOURCE_QUOTA).is_some());
    }

    #[test]
    fn test_type_mismatch_returns_none() {
        let config = EndpointConfig::new().set_int("key", 1);
        assert_eq!(config.get_bool("key"), None);
        assert_eq!(config.get_str("key"), None);
    }

    #[test]
    fn test_missing_key_returns_none() {
        let config = EndpointConfig::new();
        assert_eq!(config.get_int("nope"), None);
    }

    #[test]
    fn test_tcp_options_defaults() {
        let opts = TcpOptions::from_config(&EndpointConfig::new());
        assert!(opts.nodelay);
        assert_eq!(opts.read_chunk_size, DEFAULT_READ_CHUNK);
        assert!(!opts.zerocopy_enabled);
        assert_eq!(opts.zerocopy_threshold, DEFAULT_ZEROCOPY_THRESHOLD);
    }

    #[test]
    fn test_tcp_options_zerocopy_keys() {
        let config = EndpointConfig::new()
            .set_bool(KEY_TCP_TX_ZEROCOPY_ENABLED, true)
            .set_int(KEY_TCP_TX_ZEROCOPY_THRESHOLD, 4096);
        let opts = TcpOptions::from_config(&config);
        assert!(opts.zerocopy_enabled);
        assert_eq!(opts.zerocopy_threshold, 4096);
    }

    #[test]
    fn test_idle_timeout_clamped_to_minimum() {
        let config = EndpointConfig::new().set_int(KEY_CLIENT_IDLE_TIMEOUT_MS, 50);
        assert_eq!(idle_timeout_from_config(&config), Some(MIN_IDLE_TIMEOUT));
    }

    #[test]
    fn test_idle_timeout_default_is_disabled() {
        assert_eq!(idle_timeout_from_config(&EndpointConfig::new()), None);
        let zero = EndpointConfig::new().set_int(KEY_CLIENT_IDLE_TIMEOUT_MS, 0);
        assert_eq!(idle_timeout_from_config(&zero), None);
    }

    #[test]
    fn test_idle_timeout_above_minimum_kept() {
        let config = EndpointConfig::new().set_int(KEY_CLIENT_IDLE_TIMEOUT_MS, 30_000);
        assert_eq!(
            idle_timeout_from_config(&config),
            Some(Duration::from_secs(30))
        );
    }
}
