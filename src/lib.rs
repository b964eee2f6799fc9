pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod executor;
pub mod factory;
pub mod health;
pub mod host;
pub mod lb;
pub mod metrics;
mod reconciler;
mod resubscribe;
mod state;

pub use config::{Config, JitterWindow};
pub use connection::{Address, ConnectionFactory, LoadBalancedConnection};
pub use discovery::{
    DiscoveryStatus, EventBatch, EventStream, ResolvedAddressTypes, ServiceDiscoverer,
    ServiceDiscovererEvent, StaticDiscoverer,
};
pub use error::{BoxError, LoadBalancerError, Result};
pub use executor::{shared_executor, Executor, TaskHandle, TokioExecutor};
pub use factory::{Builder, RoundRobinLoadBalancerFactory};
pub use health::HealthCheckSettings;
pub use host::{HostStatus, HostSummary};
pub use metrics::Metrics;
pub use resubscribe::ResubscribeSettings;

use arc_swap::ArcSwap;
use health::HealthChecker;
use lb::RoundRobin;
use reconciler::EventReconciler;
use resubscribe::ResubscribeMonitor;
use state::{close_connections, HostTable, SharedState};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, Instrument};

/// Caller attributes attached to a selection, recorded on its tracing span.
#[derive(Debug, Clone, Default)]
pub struct SelectionContext {
    attributes: Vec<(String, String)>,
}

impl SelectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    pub fn attributes(&self) -> &[(String, String)] {
        &self.attributes
    }
}

/// Client-side round-robin load balancer bound to one discovery subscription.
pub struct LoadBalancer<A: Address, C: LoadBalancedConnection> {
    state: Arc<SharedState<A, C>>,
    reconciler: Mutex<Option<JoinHandle<()>>>,
}

impl<A: Address, C: LoadBalancedConnection> LoadBalancer<A, C> {
    pub(crate) fn start(
        target: String,
        discoverer: Arc<dyn ServiceDiscoverer<A>>,
        connection_factory: Arc<dyn ConnectionFactory<A, C>>,
        linear_search_space: usize,
        health_check: Option<HealthCheckSettings>,
        resubscribe: ResubscribeSettings,
    ) -> Self {
        let metrics = Metrics::new(&target);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        let hosts: Arc<ArcSwap<HostTable<A, C>>> = Arc::new(ArcSwap::from_pointee(Vec::new()));

        let health = health_check.map(|settings| {
            let table = hosts.clone();
            let gauges = metrics.clone();
            Arc::new(HealthChecker::new(
                settings,
                connection_factory.clone(),
                target.clone(),
                metrics.clone(),
                Box::new(move || gauges.record_hosts(table.load().as_slice())),
            ))
        });

        let state = Arc::new(SharedState {
            target: target.clone(),
            hosts,
            writer: Mutex::new(()),
            connection_factory,
            selector: RoundRobin::new(linear_search_space),
            health,
            resubscribe: ResubscribeMonitor::new(
                resubscribe,
                commands_tx.clone(),
                target.clone(),
            ),
            commands: commands_tx,
            closed: AtomicBool::new(false),
            metrics,
        });

        let reconciler = EventReconciler::new(state.clone(), discoverer, commands_rx);
        let handle = tokio::spawn(reconciler.run());
        info!(resource = %target, linear_search_space, "Load balancer started");

        Self {
            state,
            reconciler: Mutex::new(Some(handle)),
        }
    }

    pub fn target(&self) -> &str {
        &self.state.target
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Hosts in rotation order.
    pub fn hosts(&self) -> Vec<HostSummary<A>> {
        self.state
            .hosts
            .load()
            .iter()
            .map(|host| host.summary())
            .collect()
    }

    /// Picks a connection accepted by `selector`, opening a new one when no
    /// pooled connection qualifies. Fails fast with a rejection error when no
    /// host can serve the request; retrying is up to the caller.
    pub async fn select_connection<F>(&self, selector: F) -> Result<C>
    where
        F: Fn(&C) -> bool + Send + Sync,
    {
        self.select_connection_with(selector, &SelectionContext::default())
            .await
    }

    pub async fn select_connection_with<F>(
        &self,
        selector: F,
        context: &SelectionContext,
    ) -> Result<C>
    where
        F: Fn(&C) -> bool + Send + Sync,
    {
        if self.state.is_closed() {
            return Err(LoadBalancerError::Closed(self.state.target.clone()));
        }
        self.state.metrics.increment_selections();

        let span = tracing::debug_span!(
            "select_connection",
            resource = %self.state.target,
            context = ?context.attributes()
        );
        let result = lb::select_connection(&self.state, &selector)
            .instrument(span)
            .await;
        if let Err(err) = &result {
            if err.is_rejection() {
                self.state.metrics.increment_rejections();
                debug!(resource = %self.state.target, error = %err, "Selection rejected");
            }
        }
        result
    }

    /// Cancels background tasks, stops consuming discovery events and closes
    /// every pooled connection once. Later calls return immediately.
    pub async fn close(&self) -> Result<()> {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(resource = %self.state.target, "Closing load balancer");
        self.stop_background();

        let hosts = self.state.take_hosts();
        let connections: Vec<C> = hosts.iter().flat_map(|host| host.mark_closed()).collect();
        let total = connections.len();
        let failed = close_connections(&self.state.target, connections).await;
        self.state.metrics.record_hosts::<A, C>(&[]);

        if failed > 0 {
            return Err(LoadBalancerError::CloseFailed { failed, total });
        }
        debug!(resource = %self.state.target, total, "Load balancer closed");
        Ok(())
    }

    fn stop_background(&self) {
        let handle = self
            .reconciler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
        self.state.resubscribe.shutdown();
    }
}

impl<A: Address, C: LoadBalancedConnection> Drop for LoadBalancer<A, C> {
    fn drop(&mut self) {
        if self.state.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.stop_background();
        let hosts = self.state.take_hosts();
        let connections: Vec<C> = hosts.iter().flat_map(|host| host.mark_closed()).collect();
        if connections.is_empty() {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let target = self.state.target.clone();
            runtime.spawn(async move {
                close_connections(&target, connections).await;
            });
        }
    }
}
