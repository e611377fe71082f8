//! Layered configuration: built-in defaults, an optional TOML file, then
//! environment variable overrides. Mirrors the rest of this crate's policy of
//! never failing a caller's process over a bad or missing config file.

use std::path::PathBuf;

#[cfg(feature = "config")]
use serde::Deserialize;

const DEFAULT_CONFIG_PATH: &str = "/etc/oxibpf/oxibpf.toml";
const ENV_CONFIG_PATH: &str = "OXIBPF_CONFIG";
const ENV_PIN_ROOT: &str = "OXIBPF_PIN_ROOT";
const ENV_RETRY_MAX_ATTEMPTS: &str = "OXIBPF_RETRY_MAX_ATTEMPTS";

#[cfg_attr(feature = "config", derive(Deserialize))]
#[derive(Debug, Clone)]
pub struct Config {
    #[cfg_attr(feature = "config", serde(default))]
    pub retry: RetryConfig,
    #[cfg_attr(feature = "config", serde(default))]
    pub ringbuf: RingbufConfig,
    #[cfg_attr(feature = "config", serde(default))]
    pub perfbuf: PerfbufConfig,
    #[cfg_attr(feature = "config", serde(default = "default_pin_root"))]
    pub pin_root: PathBuf,
    #[cfg_attr(feature = "config", serde(default = "default_log_verifier_on_failure"))]
    pub log_verifier_on_failure: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            ringbuf: RingbufConfig::default(),
            perfbuf: PerfbufConfig::default(),
            pin_root: default_pin_root(),
            log_verifier_on_failure: default_log_verifier_on_failure(),
        }
    }
}

impl Config {
    /// Load configuration from `OXIBPF_CONFIG` (default
    /// `/etc/oxibpf/oxibpf.toml`), then apply environment overrides. A
    /// missing or unparsable file silently falls back to defaults.
    #[cfg(feature = "config")]
    pub fn load() -> Self {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut cfg: Config = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                log::warn!("failed to parse config at {path}: {e}, using defaults");
                Config::default()
            }),
            Err(_) => Config::default(),
        };
        cfg.apply_env_overrides();
        cfg
    }

    #[cfg(not(feature = "config"))]
    pub fn load() -> Self {
        let mut cfg = Config::default();
        cfg.apply_env_overrides();
        cfg
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(root) = std::env::var(ENV_PIN_ROOT) {
            self.pin_root = PathBuf::from(root);
        }
        if let Ok(n) = std::env::var(ENV_RETRY_MAX_ATTEMPTS) {
            if let Ok(n) = n.parse() {
                self.retry.max_attempts = n;
            }
        }
    }
}

#[cfg_attr(feature = "config", derive(Deserialize))]
#[derive(Debug, Clone)]
pub struct RetryConfig {
    #[cfg_attr(feature = "config", serde(default = "default_retry_max_attempts"))]
    pub max_attempts: u32,
    #[cfg_attr(feature = "config", serde(default = "default_retry_base_delay_ms"))]
    pub base_delay_ms: u64,
    #[cfg_attr(feature = "config", serde(default = "default_retry_backoff_factor"))]
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            base_delay_ms: default_retry_base_delay_ms(),
            backoff_factor: default_retry_backoff_factor(),
        }
    }
}

fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay_ms() -> u64 {
    100
}
fn default_retry_backoff_factor() -> f64 {
    2.0
}

#[cfg_attr(feature = "config", derive(Deserialize))]
#[derive(Debug, Clone)]
pub struct RingbufConfig {
    #[cfg_attr(feature = "config", serde(default = "default_epoll_timeout_ms"))]
    pub default_epoll_timeout_ms: i32,
}

impl Default for RingbufConfig {
    fn default() -> Self {
        Self {
            default_epoll_timeout_ms: default_epoll_timeout_ms(),
        }
    }
}

fn default_epoll_timeout_ms() -> i32 {
    100
}

#[cfg_attr(feature = "config", derive(Deserialize))]
#[derive(Debug, Clone)]
pub struct PerfbufConfig {
    #[cfg_attr(feature = "config", serde(default = "default_poll_interval_ms"))]
    pub default_poll_interval_ms: u64,
    #[cfg_attr(feature = "config", serde(default = "default_perfbuf_pages"))]
    pub default_pages: u32,
}

impl Default for PerfbufConfig {
    fn default() -> Self {
        Self {
            default_poll_interval_ms: default_poll_interval_ms(),
            default_pages: default_perfbuf_pages(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    100
}
fn default_perfbuf_pages() -> u32 {
    64
}

fn default_pin_root() -> PathBuf {
    PathBuf::from("/sys/fs/bpf")
}

fn default_log_verifier_on_failure() -> bool {
    true
}

#[cfg(all(test, feature = "config"))]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"[retry]
max_attempts = 5
[ringbuf]
default_epoll_timeout_ms = 250
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_delay_ms, 100);
        assert_eq!(cfg.ringbuf.default_epoll_timeout_ms, 250);
        assert_eq!(cfg.perfbuf.default_pages, 64);
        assert_eq!(cfg.pin_root, PathBuf::from("/sys/fs/bpf"));
    }

    #[test]
    fn env_override() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[retry]\nmax_attempts = 1").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
            std::env::set_var(ENV_PIN_ROOT, "/tmp/bpf-pins");
        }
        let cfg = Config::load();
        assert_eq!(cfg.pin_root, PathBuf::from("/tmp/bpf-pins"));
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
            std::env::remove_var(ENV_PIN_ROOT);
        }
    }
}
