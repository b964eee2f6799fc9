use crate::connection::{Address, ConnectionFactory, LoadBalancedConnection};
use crate::error::{BoxError, LoadBalancerError, Result};
use crate::health::HealthChecker;
use crate::host::{AddOutcome, Host};
use crate::lb::RoundRobin;
use crate::metrics::Metrics;
use crate::reconciler::Command;
use crate::resubscribe::ResubscribeMonitor;
use arc_swap::ArcSwap;
use futures::future::join_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub(crate) type HostTable<A, C> = Vec<Arc<Host<A, C>>>;

/// Everything the facade, the reconciler and the background tasks share.
pub(crate) struct SharedState<A: Address, C: LoadBalancedConnection> {
    pub(crate) target: String,
    /// Rotation order. Replaced wholesale, never mutated in place.
    pub(crate) hosts: Arc<ArcSwap<HostTable<A, C>>>,
    /// Serializes table writers (reconciler and close); readers never take it.
    pub(crate) writer: Mutex<()>,
    pub(crate) connection_factory: Arc<dyn ConnectionFactory<A, C>>,
    pub(crate) selector: RoundRobin,
    pub(crate) health: Option<Arc<HealthChecker<A, C>>>,
    pub(crate) resubscribe: ResubscribeMonitor<A>,
    pub(crate) commands: mpsc::UnboundedSender<Command<A>>,
    pub(crate) closed: AtomicBool,
    pub(crate) metrics: Metrics,
}

impl<A: Address, C: LoadBalancedConnection> SharedState<A, C> {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Drops a connection found closed during a scan.
    pub(crate) fn prune(&self, host: &Arc<Host<A, C>>, connection: &C) {
        debug!(resource = %self.target, address = ?host.address(), "Pruning closed connection");
        if host.remove_connection(connection) {
            // Expired and empty: let the table writer remove it.
            let _ = self
                .commands
                .send(Command::HostDrained(host.address().clone()));
        }
    }

    pub(crate) fn record_connect_failure(&self, host: &Arc<Host<A, C>>, err: &BoxError) {
        self.metrics.increment_connect_failures();
        let threshold = self.health.as_ref().map(|health| health.threshold());
        warn!(
            resource = %self.target,
            address = ?host.address(),
            error = %err,
            "Failed to open connection"
        );
        if host.record_connect_failure(threshold) {
            info!(
                resource = %self.target,
                address = ?host.address(),
                failures = host.consecutive_failures(),
                "Host marked unhealthy"
            );
            if let Some(health) = &self.health {
                health.start(host.clone());
            }
            self.observe_table();
        }
    }

    /// Pools a freshly created connection and hands it out if the selector
    /// accepts it.
    pub(crate) async fn admit<F>(
        &self,
        host: &Arc<Host<A, C>>,
        connection: C,
        selector: &F,
    ) -> Result<C>
    where
        F: Fn(&C) -> bool + Sync + ?Sized,
    {
        match host.add_connection(connection.clone()) {
            AddOutcome::HostClosed => {
                debug!(
                    resource = %self.target,
                    address = ?host.address(),
                    "Host closed while connecting"
                );
                if let Err(err) = connection.close().await {
                    warn!(resource = %self.target, error = %err, "Failed to close connection");
                }
                return Err(LoadBalancerError::rejected(
                    &self.target,
                    "host was removed while connecting",
                ));
            }
            AddOutcome::Restored => {
                host.cancel_health_check();
                info!(
                    resource = %self.target,
                    address = ?host.address(),
                    "Host restored by new connection"
                );
                self.metrics.record_hosts(self.hosts.load().as_slice());
            }
            AddOutcome::Added => {}
        }
        self.metrics.increment_connections_created();

        if selector(&connection) {
            Ok(connection)
        } else {
            Err(LoadBalancerError::rejected(
                &self.target,
                "newly created connection was rejected by the selector",
            ))
        }
    }

    /// Refreshes gauges and lets the resubscribe monitor inspect the table.
    /// Starvation only triggers a resubscribe while health checking is on.
    pub(crate) fn observe_table(&self) {
        let hosts = self.hosts.load();
        self.metrics.record_hosts(hosts.as_slice());
        if self.health.is_some() && !self.is_closed() {
            self.resubscribe.observe(hosts.as_slice());
        }
    }

    /// Empties the table, returning what it held.
    pub(crate) fn take_hosts(&self) -> Arc<HostTable<A, C>> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        self.hosts.swap(Arc::new(Vec::new()))
    }
}

/// Closes every connection, returning how many failed to close.
pub(crate) async fn close_connections<C: LoadBalancedConnection>(
    target: &str,
    connections: Vec<C>,
) -> usize {
    let results = join_all(connections.iter().map(|connection| connection.close())).await;
    let mut failed = 0;
    for err in results.into_iter().filter_map(|result| result.err()) {
        failed += 1;
        warn!(resource = %target, error = %err, "Failed to close connection");
    }
    failed
}
