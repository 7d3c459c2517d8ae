use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::time::Duration;

// Dispatch and anycast tuning sourced from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
    // Default concurrency limit for new consumer sets (0 means unbounded).
    pub consumer_set_max_active: usize,
    // Warn when a consumer stays blocked on its active-message limit this long.
    pub active_msg_block_interval_ms: Option<u64>,
    // Idle time after which a remote consumer point with no requests closes.
    pub remote_idle_timeout_ms: u64,
    // Upper bound on speculative remote get requests per key.
    pub prefetch_max_window: u32,
    // Consumption intervals above this disable prefetch entirely.
    pub prefetch_interval_ceiling_ms: u64,
    // Minimum shortfall, as a fraction of the window, before topping up.
    pub prefetch_min_fraction: f64,
    // Fixed resend interval for durable-subscription control requests.
    pub durable_retry_interval_ms: u64,
    // Number of sends before a durable-subscription request gives up.
    pub durable_max_attempts: u32,
}

const DEFAULT_CONSUMER_SET_MAX_ACTIVE: usize = 0;
const DEFAULT_REMOTE_IDLE_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_PREFETCH_MAX_WINDOW: u32 = 10;
const DEFAULT_PREFETCH_INTERVAL_CEILING_MS: u64 = 5_000;
const DEFAULT_PREFETCH_MIN_FRACTION: f64 = 0.25;
const DEFAULT_DURABLE_RETRY_INTERVAL_MS: u64 = 3_000;
const DEFAULT_DURABLE_MAX_ATTEMPTS: u32 = 10;

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            consumer_set_max_active: DEFAULT_CONSUMER_SET_MAX_ACTIVE,
            active_msg_block_interval_ms: None,
            remote_idle_timeout_ms: DEFAULT_REMOTE_IDLE_TIMEOUT_MS,
            prefetch_max_window: DEFAULT_PREFETCH_MAX_WINDOW,
            prefetch_interval_ceiling_ms: DEFAULT_PREFETCH_INTERVAL_CEILING_MS,
            prefetch_min_fraction: DEFAULT_PREFETCH_MIN_FRACTION,
            durable_retry_interval_ms: DEFAULT_DURABLE_RETRY_INTERVAL_MS,
            durable_max_attempts: DEFAULT_DURABLE_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DispatchConfigOverride {
    consumer_set_max_active: Option<usize>,
    active_msg_block_interval_ms: Option<u64>,
    remote_idle_timeout_ms: Option<u64>,
    prefetch_max_window: Option<u32>,
    prefetch_interval_ceiling_ms: Option<u64>,
    prefetch_min_fraction: Option<f64>,
    durable_retry_interval_ms: Option<u64>,
    durable_max_attempts: Option<u32>,
}

impl DispatchConfig {
    pub fn from_env() -> Result<Self> {
        let consumer_set_max_active = std::env::var("FELIX_CONSUMER_SET_MAX_ACTIVE")
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .unwrap_or(DEFAULT_CONSUMER_SET_MAX_ACTIVE);
        let active_msg_block_interval_ms = std::env::var("FELIX_ACTIVE_MSG_BLOCK_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0);
        let remote_idle_timeout_ms = std::env::var("FELIX_REMOTE_IDLE_TIMEOUT_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_REMOTE_IDLE_TIMEOUT_MS);
        let prefetch_max_window = std::env::var("FELIX_PREFETCH_MAX_WINDOW")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_PREFETCH_MAX_WINDOW);
        let prefetch_interval_ceiling_ms = std::env::var("FELIX_PREFETCH_INTERVAL_CEILING_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_PREFETCH_INTERVAL_CEILING_MS);
        let prefetch_min_fraction = std::env::var("FELIX_PREFETCH_MIN_FRACTION")
            .ok()
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| (0.0..1.0).contains(value))
            .unwrap_or(DEFAULT_PREFETCH_MIN_FRACTION);
        let durable_retry_interval_ms = std::env::var("FELIX_DURABLE_RETRY_INTERVAL_MS")
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_DURABLE_RETRY_INTERVAL_MS);
        let durable_max_attempts = std::env::var("FELIX_DURABLE_MAX_ATTEMPTS")
            .ok()
            .and_then(|value| value.parse::<u32>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_DURABLE_MAX_ATTEMPTS);
        Ok(Self {
            consumer_set_max_active,
            active_msg_block_interval_ms,
            remote_idle_timeout_ms,
            prefetch_max_window,
            prefetch_interval_ceiling_ms,
            prefetch_min_fraction,
            durable_retry_interval_ms,
            durable_max_attempts,
        })
    }

    pub fn from_env_or_yaml() -> Result<Self> {
        let mut config = Self::from_env()?;
        if let Ok(path) = std::env::var("FELIX_DISPATCH_CONFIG") {
            // YAML overrides allow ops-friendly config files.
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("read FELIX_DISPATCH_CONFIG: {path}"))?;
            config.apply_yaml(&contents)?;
        }
        Ok(config)
    }

    fn apply_yaml(&mut self, contents: &str) -> Result<()> {
        let override_cfg: DispatchConfigOverride =
            serde_yaml::from_str(contents).with_context(|| "parse dispatch config yaml")?;
        if let Some(value) = override_cfg.consumer_set_max_active {
            self.consumer_set_max_active = value;
        }
        if let Some(value) = override_cfg.active_msg_block_interval_ms {
            self.active_msg_block_interval_ms = (value > 0).then_some(value);
        }
        if let Some(value) = override_cfg.remote_idle_timeout_ms
            && value > 0
        {
            self.remote_idle_timeout_ms = value;
        }
        if let Some(value) = override_cfg.prefetch_max_window
            && value > 0
        {
            self.prefetch_max_window = value;
        }
        if let Some(value) = override_cfg.prefetch_interval_ceiling_ms
            && value > 0
        {
            self.prefetch_interval_ceiling_ms = value;
        }
        if let Some(value) = override_cfg.prefetch_min_fraction
            && (0.0..1.0).contains(&value)
        {
            self.prefetch_min_fraction = value;
        }
        if let Some(value) = override_cfg.durable_retry_interval_ms
            && value > 0
        {
            self.durable_retry_interval_ms = value;
        }
        if let Some(value) = override_cfg.durable_max_attempts
            && value > 0
        {
            self.durable_max_attempts = value;
        }
        Ok(())
    }

    pub fn active_msg_block_interval(&self) -> Option<Duration> {
        self.active_msg_block_interval_ms.map(Duration::from_millis)
    }

    pub fn remote_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_idle_timeout_ms)
    }

    pub fn prefetch_interval_ceiling(&self) -> Duration {
        Duration::from_millis(self.prefetch_interval_ceiling_ms)
    }

    pub fn durable_retry_interval(&self) -> Duration {
        Duration::from_millis(self.durable_retry_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    const VARS: [&str; 9] = [
        "FELIX_CONSUMER_SET_MAX_ACTIVE",
        "FELIX_ACTIVE_MSG_BLOCK_INTERVAL_MS",
        "FELIX_REMOTE_IDLE_TIMEOUT_MS",
        "FELIX_PREFETCH_MAX_WINDOW",
        "FELIX_PREFETCH_INTERVAL_CEILING_MS",
        "FELIX_PREFETCH_MIN_FRACTION",
        "FELIX_DURABLE_RETRY_INTERVAL_MS",
        "FELIX_DURABLE_MAX_ATTEMPTS",
        "FELIX_DISPATCH_CONFIG",
    ];

    fn clear_env() {
        for var in VARS {
            // SAFETY: tests touching the environment are serialized.
            unsafe { std::env::remove_var(var) };
        }
    }

    #[test]
    #[serial]
    fn defaults_apply_without_env() {
        clear_env();
        let config = DispatchConfig::from_env().expect("config");
        assert_eq!(config, DispatchConfig::default());
        assert_eq!(config.remote_idle_timeout(), Duration::from_secs(60));
        assert!(config.active_msg_block_interval().is_none());
    }

    #[test]
    #[serial]
    fn env_values_override_defaults_and_invalid_values_fall_back() {
        clear_env();
        unsafe {
            std::env::set_var("FELIX_CONSUMER_SET_MAX_ACTIVE", "25");
            std::env::set_var("FELIX_PREFETCH_MAX_WINDOW", "0");
            std::env::set_var("FELIX_PREFETCH_MIN_FRACTION", "1.5");
            std::env::set_var("FELIX_DURABLE_MAX_ATTEMPTS", "nope");
            std::env::set_var("FELIX_ACTIVE_MSG_BLOCK_INTERVAL_MS", "750");
        }
        let config = DispatchConfig::from_env().expect("config");
        assert_eq!(config.consumer_set_max_active, 25);
        assert_eq!(config.prefetch_max_window, DEFAULT_PREFETCH_MAX_WINDOW);
        assert_eq!(config.prefetch_min_fraction, DEFAULT_PREFETCH_MIN_FRACTION);
        assert_eq!(config.durable_max_attempts, DEFAULT_DURABLE_MAX_ATTEMPTS);
        assert_eq!(
            config.active_msg_block_interval(),
            Some(Duration::from_millis(750))
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn yaml_file_overrides_env() {
        clear_env();
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(
            file,
            "remote_idle_timeout_ms: 100\nprefetch_max_window: 4\ndurable_retry_interval_ms: 0"
        )
        .expect("write");
        unsafe {
            std::env::set_var("FELIX_REMOTE_IDLE_TIMEOUT_MS", "5000");
            std::env::set_var("FELIX_DISPATCH_CONFIG", file.path());
        }
        let config = DispatchConfig::from_env_or_yaml().expect("config");
        assert_eq!(config.remote_idle_timeout_ms, 100);
        assert_eq!(config.prefetch_max_window, 4);
        assert_eq!(
            config.durable_retry_interval_ms,
            DEFAULT_DURABLE_RETRY_INTERVAL_MS
        );
        clear_env();
    }

    #[test]
    #[serial]
    fn unreadable_yaml_path_is_an_error() {
        clear_env();
        unsafe { std::env::set_var("FELIX_DISPATCH_CONFIG", "/nonexistent/felix.yaml") };
        let err = DispatchConfig::from_env_or_yaml().expect_err("missing file");
        assert!(err.to_string().contains("FELIX_DISPATCH_CONFIG"));
        clear_env();
    }
}
