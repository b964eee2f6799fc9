use crate::config::{
    default_jitter_for, validate_threshold, Config, JitterWindow,
    DEFAULT_FAILED_CONNECTIONS_THRESHOLD, DEFAULT_HEALTH_CHECK_INTERVAL,
    DEFAULT_HEALTH_CHECK_JITTER, DEFAULT_LINEAR_SEARCH_SPACE, DEFAULT_RESUBSCRIBE_INTERVAL,
    DEFAULT_RESUBSCRIBE_JITTER,
};
use crate::connection::{Address, ConnectionFactory, LoadBalancedConnection};
use crate::discovery::ServiceDiscoverer;
use crate::error::Result;
use crate::executor::{shared_executor, Executor};
use crate::health::HealthCheckSettings;
use crate::resubscribe::ResubscribeSettings;
use crate::LoadBalancer;
use std::sync::Arc;
use std::time::Duration;

/// Creates round-robin load balancers sharing one validated configuration.
///
/// - Round robin happens at the host level; connections are reused when the
///   caller's selector accepts them.
/// - Connections are created lazily without coordination, so a burst of
///   requests may open more connections than strictly needed.
/// - Hosts that repeatedly fail to connect are health checked in the
///   background and skipped for new connections until a check succeeds.
#[derive(Debug, Clone)]
pub struct RoundRobinLoadBalancerFactory {
    linear_search_space: usize,
    health_check: Option<HealthCheckSettings>,
    resubscribe: ResubscribeSettings,
}

impl RoundRobinLoadBalancerFactory {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Builder::from_config(config).build()
    }

    pub fn linear_search_space(&self) -> usize {
        self.linear_search_space
    }

    /// `None` when health checking was disabled with a negative threshold.
    pub fn health_check(&self) -> Option<&HealthCheckSettings> {
        self.health_check.as_ref()
    }

    pub fn resubscribe(&self) -> &ResubscribeSettings {
        &self.resubscribe
    }

    /// Subscribes to `discoverer` and starts reconciling its events. Must be
    /// called from within a tokio runtime.
    pub fn new_load_balancer<A, C>(
        &self,
        target: impl Into<String>,
        discoverer: Arc<dyn ServiceDiscoverer<A>>,
        connection_factory: Arc<dyn ConnectionFactory<A, C>>,
    ) -> LoadBalancer<A, C>
    where
        A: Address,
        C: LoadBalancedConnection,
    {
        LoadBalancer::start(
            target.into(),
            discoverer,
            connection_factory,
            self.linear_search_space,
            self.health_check.clone(),
            self.resubscribe.clone(),
        )
    }
}

pub struct Builder {
    linear_search_space: usize,
    background_executor: Option<Arc<dyn Executor>>,
    health_check_interval: Duration,
    health_check_jitter: Duration,
    failed_connections_threshold: i32,
    resubscribe_interval: Duration,
    resubscribe_jitter: Duration,
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

impl Builder {
    pub fn new() -> Self {
        Self {
            linear_search_space: DEFAULT_LINEAR_SEARCH_SPACE,
            background_executor: None,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL,
            health_check_jitter: DEFAULT_HEALTH_CHECK_JITTER,
            failed_connections_threshold: DEFAULT_FAILED_CONNECTIONS_THRESHOLD,
            resubscribe_interval: DEFAULT_RESUBSCRIBE_INTERVAL,
            resubscribe_jitter: DEFAULT_RESUBSCRIBE_JITTER,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let health = &config.health_check;
        let resubscribe = &config.resubscribe;
        Self::new()
            .linear_search_space(config.linear_search_space)
            .health_check_interval(health.interval(), health.jitter())
            .health_check_failed_connections_threshold(health.failed_connections_threshold)
            .health_check_resubscribe_interval(resubscribe.interval(), resubscribe.jitter())
    }

    /// Number of connections scanned in order before random probing; `0`
    /// always samples randomly.
    pub fn linear_search_space(mut self, linear_search_space: usize) -> Self {
        self.linear_search_space = linear_search_space;
        self
    }

    /// Executor for health checks and resubscribes. Defaults to a process-wide
    /// shared one.
    pub fn background_executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.background_executor = Some(executor);
        self
    }

    pub fn health_check_interval(mut self, interval: Duration, jitter: Duration) -> Self {
        self.health_check_interval = interval;
        self.health_check_jitter = jitter;
        self
    }

    /// Same as [`Builder::health_check_interval`] with a jitter derived from
    /// the interval.
    pub fn health_check_interval_default_jitter(self, interval: Duration) -> Self {
        let jitter = default_jitter_for(interval);
        self.health_check_interval(interval, jitter)
    }

    /// Consecutive connect failures after which a host is health checked in
    /// the background. Negative disables health checking; zero is invalid.
    pub fn health_check_failed_connections_threshold(mut self, threshold: i32) -> Self {
        self.failed_connections_threshold = threshold;
        self
    }

    pub fn health_check_resubscribe_interval(
        mut self,
        interval: Duration,
        jitter: Duration,
    ) -> Self {
        self.resubscribe_interval = interval;
        self.resubscribe_jitter = jitter;
        self
    }

    pub fn build(self) -> Result<RoundRobinLoadBalancerFactory> {
        validate_threshold(self.failed_connections_threshold)?;
        let health_window =
            JitterWindow::new(self.health_check_interval, self.health_check_jitter)?;
        let resubscribe_window =
            JitterWindow::new(self.resubscribe_interval, self.resubscribe_jitter)?;

        let executor = self.background_executor.unwrap_or_else(shared_executor);
        let health_check = u32::try_from(self.failed_connections_threshold)
            .ok()
            .map(|threshold| HealthCheckSettings::new(executor.clone(), health_window, threshold));

        Ok(RoundRobinLoadBalancerFactory {
            linear_search_space: self.linear_search_space,
            health_check,
            resubscribe: ResubscribeSettings::new(executor, resubscribe_window),
        })
    }
}
