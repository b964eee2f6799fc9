use crate::discovery::ResolvedAddressTypes;
use crate::error::{LoadBalancerError, Result};
use rand::Rng;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_LINEAR_SEARCH_SPACE: usize = 16;
pub const DEFAULT_HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_CHECK_JITTER: Duration = Duration::from_secs(3);
pub const DEFAULT_RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RESUBSCRIBE_JITTER: Duration = Duration::from_secs(3);
pub const DEFAULT_FAILED_CONNECTIONS_THRESHOLD: i32 = 5;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub linear_search_space: usize,
    pub health_check: HealthCheckConfig,
    pub resubscribe: ResubscribeConfig,
    /// `host:port` entries resolved once by the demo binary.
    pub hosts: Vec<String>,
    pub address_types: ResolvedAddressTypes,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub interval_ms: u64,
    /// Derived from the interval when absent.
    pub jitter_ms: Option<u64>,
    /// Negative disables background health checking, zero is rejected.
    pub failed_connections_threshold: i32,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ResubscribeConfig {
    pub interval_ms: u64,
    pub jitter_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            linear_search_space: DEFAULT_LINEAR_SEARCH_SPACE,
            health_check: HealthCheckConfig::default(),
            resubscribe: ResubscribeConfig::default(),
            hosts: Vec::new(),
            address_types: ResolvedAddressTypes::default(),
        }
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HEALTH_CHECK_INTERVAL.as_millis() as u64,
            jitter_ms: None,
            failed_connections_threshold: DEFAULT_FAILED_CONNECTIONS_THRESHOLD,
        }
    }
}

impl Default for ResubscribeConfig {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_RESUBSCRIBE_INTERVAL.as_millis() as u64,
            jitter_ms: DEFAULT_RESUBSCRIBE_JITTER.as_millis() as u64,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_threshold(self.health_check.failed_connections_threshold)?;
        self.health_check.window()?;
        self.resubscribe.window()?;
        Ok(())
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn jitter(&self) -> Duration {
        match self.jitter_ms {
            Some(ms) => Duration::from_millis(ms),
            None => default_jitter_for(self.interval()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.failed_connections_threshold > 0
    }

    pub fn window(&self) -> Result<JitterWindow> {
        JitterWindow::new(self.interval(), self.jitter())
    }
}

impl ResubscribeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn jitter(&self) -> Duration {
        Duration::from_millis(self.jitter_ms)
    }

    pub fn window(&self) -> Result<JitterWindow> {
        JitterWindow::new(self.interval(), self.jitter())
    }
}

/// Jitter used when only a health check interval is given: half the interval
/// for intervals shorter than the default, the default jitter otherwise.
pub fn default_jitter_for(interval: Duration) -> Duration {
    if interval < DEFAULT_HEALTH_CHECK_INTERVAL {
        interval / 2
    } else {
        DEFAULT_HEALTH_CHECK_JITTER
    }
}

pub(crate) fn validate_threshold(threshold: i32) -> Result<()> {
    if threshold == 0 {
        return Err(LoadBalancerError::ConfigError(
            "health check failed connections threshold should not be 0".to_string(),
        ));
    }
    Ok(())
}

/// Validated `[interval - jitter, interval + jitter]` bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterWindow {
    lower: Duration,
    upper: Duration,
}

impl JitterWindow {
    pub fn new(interval: Duration, jitter: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(LoadBalancerError::ConfigError(format!(
                "interval ({:?}) must be positive",
                interval
            )));
        }
        let lower = match interval.checked_sub(jitter) {
            Some(lower) if !lower.is_zero() => lower,
            _ => {
                return Err(LoadBalancerError::ConfigError(format!(
                    "interval ({:?}) minus jitter ({:?}) must be greater than 0",
                    interval, jitter
                )))
            }
        };
        let upper = interval
            .checked_add(jitter)
            .filter(|upper| upper.as_nanos() <= u64::MAX as u128)
            .ok_or_else(|| {
                LoadBalancerError::ConfigError(format!(
                    "interval ({:?}) plus jitter ({:?}) must not overflow",
                    interval, jitter
                ))
            })?;
        Ok(Self { lower, upper })
    }

    pub fn lower(&self) -> Duration {
        self.lower
    }

    pub fn upper(&self) -> Duration {
        self.upper
    }

    /// Draws a delay uniformly from the inclusive window.
    pub fn next_delay(&self) -> Duration {
        // Both bounds fit in u64 nanoseconds, checked in `new`.
        let lower = self.lower.as_nanos() as u64;
        let upper = self.upper.as_nanos() as u64;
        Duration::from_nanos(rand::thread_rng().gen_range(lower..=upper))
    }
}
