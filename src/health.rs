//! Background health checks for hosts that keep failing to connect.
//!
//! A host enters the unhealthy state after `failed_connections_threshold`
//! consecutive connect failures on the request path. From then on it is left
//! out of new-connection creation and a single task per host retries a
//! connect every `interval ± jitter` until one succeeds, the host is removed,
//! or the load balancer closes.

use crate::config::JitterWindow;
use crate::connection::{Address, ConnectionFactory, LoadBalancedConnection};
use crate::executor::Executor;
use crate::host::{AddOutcome, Host, HostStatus};
use crate::metrics::Metrics;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Clone)]
pub struct HealthCheckSettings {
    executor: Arc<dyn Executor>,
    window: JitterWindow,
    failed_connections_threshold: u32,
}

impl HealthCheckSettings {
    pub fn new(
        executor: Arc<dyn Executor>,
        window: JitterWindow,
        failed_connections_threshold: u32,
    ) -> Self {
        Self {
            executor,
            window,
            failed_connections_threshold,
        }
    }

    pub fn window(&self) -> JitterWindow {
        self.window
    }

    pub fn failed_connections_threshold(&self) -> u32 {
        self.failed_connections_threshold
    }
}

impl fmt::Debug for HealthCheckSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HealthCheckSettings")
            .field("window", &self.window)
            .field("failed_connections_threshold", &self.failed_connections_threshold)
            .finish()
    }
}

/// Called after a health check brought a host back.
pub(crate) type RestoreHook = Box<dyn Fn() + Send + Sync>;

pub(crate) struct HealthChecker<A: Address, C: LoadBalancedConnection> {
    settings: HealthCheckSettings,
    connection_factory: Arc<dyn ConnectionFactory<A, C>>,
    target: String,
    metrics: Metrics,
    on_restored: RestoreHook,
}

impl<A: Address, C: LoadBalancedConnection> HealthChecker<A, C> {
    pub(crate) fn new(
        settings: HealthCheckSettings,
        connection_factory: Arc<dyn ConnectionFactory<A, C>>,
        target: String,
        metrics: Metrics,
        on_restored: RestoreHook,
    ) -> Self {
        Self {
            settings,
            connection_factory,
            target,
            metrics,
            on_restored,
        }
    }

    pub(crate) fn threshold(&self) -> u32 {
        self.settings.failed_connections_threshold
    }

    /// Starts the retry loop for a host that just became unhealthy.
    pub(crate) fn start(self: &Arc<Self>, host: Arc<Host<A, C>>) {
        info!(
            resource = %self.target,
            address = ?host.address(),
            lower = ?self.settings.window.lower(),
            upper = ?self.settings.window.upper(),
            "Starting background health check"
        );
        self.schedule_attempt(host);
    }

    fn schedule_attempt(self: &Arc<Self>, host: Arc<Host<A, C>>) {
        let delay = self.settings.window.next_delay();
        let checker = Arc::clone(self);
        let task_host = Arc::clone(&host);
        let handle = self.settings.executor.schedule(
            delay,
            Box::pin(async move {
                checker.attempt(task_host).await;
            }),
        );
        if host.install_health_check(handle) {
            debug!(
                resource = %self.target,
                address = ?host.address(),
                ?delay,
                "Health check scheduled"
            );
        }
    }

    async fn attempt(self: Arc<Self>, host: Arc<Host<A, C>>) {
        if host.status() != HostStatus::Unhealthy {
            return;
        }
        match self.connection_factory.new_connection(host.address()).await {
            Ok(connection) => match host.add_connection(connection.clone()) {
                AddOutcome::Restored => {
                    host.clear_health_check();
                    self.metrics.increment_connections_created();
                    (self.on_restored)();
                    info!(
                        resource = %self.target,
                        address = ?host.address(),
                        "Health check passed, host is active again"
                    );
                }
                AddOutcome::Added => {
                    // Restored concurrently by an event or a request; keep the connection.
                    host.clear_health_check();
                    self.metrics.increment_connections_created();
                }
                AddOutcome::HostClosed => {
                    if let Err(err) = connection.close().await {
                        warn!(
                            resource = %self.target,
                            error = %err,
                            "Failed to close connection"
                        );
                    }
                }
            },
            Err(err) => {
                debug!(
                    resource = %self.target,
                    address = ?host.address(),
                    error = %err,
                    "Health check failed, rescheduling"
                );
                self.schedule_attempt(host);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::executor::TokioExecutor;
    use crate::test_support::TestConnection;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct FlakyFactory {
        failures_left: AtomicUsize,
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionFactory<String, TestConnection> for FlakyFactory {
        async fn new_connection(&self, _address: &String) -> Result<TestConnection, BoxError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err("connection refused".into());
            }
            Ok(TestConnection::new(attempt))
        }
    }

    fn checker(
        factory: Arc<FlakyFactory>,
        restored: Arc<AtomicUsize>,
    ) -> Arc<HealthChecker<String, TestConnection>> {
        let window = JitterWindow::new(Duration::from_secs(5), Duration::from_secs(3)).unwrap();
        let settings = HealthCheckSettings::new(Arc::new(TokioExecutor), window, 1);
        Arc::new(HealthChecker::new(
            settings,
            factory,
            "test".to_string(),
            Metrics::new("test"),
            Box::new(move || {
                restored.fetch_add(1, Ordering::SeqCst);
            }),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_connect_succeeds() {
        let factory = Arc::new(FlakyFactory {
            failures_left: AtomicUsize::new(2),
            attempts: AtomicUsize::new(0),
        });
        let restored = Arc::new(AtomicUsize::new(0));
        let checker = checker(factory.clone(), restored.clone());
        let host = Arc::new(Host::<String, TestConnection>::new("10.0.0.1:80".to_string()));
        assert!(host.record_connect_failure(Some(1)));
        checker.start(host.clone());
        assert!(host.has_health_check());

        // Nothing happens before the lower bound of the window.
        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 0);

        // Three attempts fit in three upper bounds.
        tokio::time::sleep(Duration::from_secs(3 * 8)).await;
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 3);
        assert_eq!(host.status(), HostStatus::Active);
        assert_eq!(host.connection_count(), 1);
        assert!(!host.has_health_check());
        assert_eq!(restored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_host_stops_retries() {
        let factory = Arc::new(FlakyFactory {
            failures_left: AtomicUsize::new(usize::MAX),
            attempts: AtomicUsize::new(0),
        });
        let restored = Arc::new(AtomicUsize::new(0));
        let checker = checker(factory.clone(), restored.clone());
        let host = Arc::new(Host::<String, TestConnection>::new("10.0.0.1:80".to_string()));
        host.record_connect_failure(Some(1));
        checker.start(host.clone());

        tokio::time::sleep(Duration::from_secs(20)).await;
        let attempts = factory.attempts.load(Ordering::SeqCst);
        assert!(attempts >= 2);

        host.mark_closed();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(factory.attempts.load(Ordering::SeqCst), attempts);
        assert_eq!(restored.load(Ordering::SeqCst), 0);
    }
}
