use crate::connection::{Address, LoadBalancedConnection};
use crate::error::{BoxError, LoadBalancerError, Result};
use crate::host::HostStatus;
use crate::state::SharedState;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// Below this many unscanned connections the random phase tries all of them.
const MIN_RANDOM_SEARCH_SPACE: usize = 64;
/// Share of a larger remainder tried before giving up on the host.
const RANDOM_SEARCH_FACTOR: f64 = 0.75;

/// Round-robin over hosts, linear-then-random scan over each host's pool.
#[derive(Debug)]
pub struct RoundRobin {
    current: AtomicUsize,
    linear_search_space: usize,
}

impl RoundRobin {
    pub fn new(linear_search_space: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            linear_search_space,
        }
    }

    pub fn linear_search_space(&self) -> usize {
        self.linear_search_space
    }

    /// Advances the shared rotation and returns the host index to start from.
    pub fn next_start(&self, hosts: usize) -> usize {
        let current = self.current.fetch_add(1, Ordering::Relaxed);
        current % hosts
    }

    /// Finds a connection accepted by `selector`. The first
    /// `linear_search_space` connections are tried in insertion order, the
    /// remainder in uniformly random order without repeats. Closed connections
    /// are skipped and pushed to `closed` for pruning.
    pub fn find_connection<C, F>(
        &self,
        connections: &[C],
        selector: &F,
        closed: &mut Vec<C>,
    ) -> Option<C>
    where
        C: LoadBalancedConnection,
        F: Fn(&C) -> bool + ?Sized,
    {
        let linear = connections.len().min(self.linear_search_space);
        for connection in &connections[..linear] {
            if connection.is_closed() {
                closed.push(connection.clone());
            } else if selector(connection) {
                return Some(connection.clone());
            }
        }

        let remainder = connections.len() - linear;
        if remainder == 0 {
            return None;
        }
        let attempts = if remainder < MIN_RANDOM_SEARCH_SPACE {
            remainder
        } else {
            (remainder as f64 * RANDOM_SEARCH_FACTOR) as usize
        };
        let mut rng = rand::thread_rng();
        for offset in rand::seq::index::sample(&mut rng, remainder, attempts) {
            let connection = &connections[linear + offset];
            if connection.is_closed() {
                closed.push(connection.clone());
            } else if selector(connection) {
                return Some(connection.clone());
            }
        }
        None
    }
}

/// One pass over the host table starting at the next rotation index.
///
/// Existing connections of active and expired hosts are reused first. An
/// active host without a usable connection gets a new one; if that connect
/// fails the pass moves on to the following hosts.
pub(crate) async fn select_connection<A, C, F>(state: &SharedState<A, C>, selector: &F) -> Result<C>
where
    A: Address,
    C: LoadBalancedConnection,
    F: Fn(&C) -> bool + Sync + ?Sized,
{
    let hosts = state.hosts.load_full();
    if hosts.is_empty() {
        return Err(LoadBalancerError::NoAvailableHost {
            target: state.target.clone(),
        });
    }

    let start = state.selector.next_start(hosts.len());
    let mut attempted = 0usize;
    let mut last_error: Option<BoxError> = None;

    for offset in 0..hosts.len() {
        let host = &hosts[(start + offset) % hosts.len()];
        let snapshot = host.snapshot();
        if matches!(snapshot.status, HostStatus::Closed | HostStatus::Unhealthy) {
            continue;
        }

        let mut closed = Vec::new();
        let found = state
            .selector
            .find_connection(&snapshot.connections, selector, &mut closed);
        for connection in &closed {
            state.prune(host, connection);
        }
        if let Some(connection) = found {
            return Ok(connection);
        }

        if snapshot.status != HostStatus::Active {
            continue;
        }
        attempted += 1;
        match state.connection_factory.new_connection(host.address()).await {
            Ok(connection) => return state.admit(host, connection, selector).await,
            Err(err) => {
                state.record_connect_failure(host, &err);
                let err: BoxError = Box::new(LoadBalancerError::ConnectFailed {
                    address: format!("{:?}", host.address()),
                    source: err,
                });
                last_error = Some(err);
            }
        }
    }

    if attempted == 0 {
        debug!(
            resource = %state.target,
            hosts = hosts.len(),
            "No active host to open a connection to"
        );
        state.observe_table();
        return Err(LoadBalancerError::NoActiveHost {
            target: state.target.clone(),
            hosts: hosts.len(),
        });
    }
    Err(LoadBalancerError::ConnectionRejected {
        target: state.target.clone(),
        reason: format!("failed to open a connection to any of {} active hosts", attempted),
        source: last_error,
    })
}
