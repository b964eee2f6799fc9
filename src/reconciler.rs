//! Applies discovery events to the host table.
//!
//! The reconciler task is the only writer of the table during normal
//! operation. Each batch is applied to a private copy which is then published
//! with a single swap, so selectors see either the old or the new table.

use crate::connection::{Address, LoadBalancedConnection};
use crate::discovery::{DiscoveryStatus, EventBatch, EventStream, ServiceDiscoverer};
use crate::host::{Host, HostStatus};
use crate::state::{close_connections, SharedState};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command<A> {
    Resubscribe,
    /// An expired host lost its last connection.
    HostDrained(A),
}

pub(crate) struct EventReconciler<A: Address, C: LoadBalancedConnection> {
    state: Arc<SharedState<A, C>>,
    discoverer: Arc<dyn ServiceDiscoverer<A>>,
    commands: mpsc::UnboundedReceiver<Command<A>>,
}

impl<A: Address, C: LoadBalancedConnection> EventReconciler<A, C> {
    pub(crate) fn new(
        state: Arc<SharedState<A, C>>,
        discoverer: Arc<dyn ServiceDiscoverer<A>>,
        commands: mpsc::UnboundedReceiver<Command<A>>,
    ) -> Self {
        Self {
            state,
            discoverer,
            commands,
        }
    }

    pub(crate) async fn run(mut self) {
        let mut events = self.discoverer.discover();
        loop {
            tokio::select! {
                next = events.next() => match next {
                    Some(Ok(batch)) => apply_batch(&self.state, batch),
                    Some(Err(err)) => {
                        warn!(
                            resource = %self.state.target,
                            error = %err,
                            "Discovery stream failed"
                        );
                        events = idle();
                        self.state.resubscribe.schedule("discovery stream failed");
                    }
                    None => {
                        warn!(resource = %self.state.target, "Discovery stream completed");
                        events = idle();
                        self.state.resubscribe.schedule("discovery stream completed");
                    }
                },
                command = self.commands.recv() => match command {
                    Some(Command::Resubscribe) => {
                        self.state.resubscribe.completed();
                        self.state.metrics.increment_resubscribes();
                        info!(resource = %self.state.target, "Resubscribing to discovery");
                        events = self.discoverer.discover();
                    }
                    Some(Command::HostDrained(address)) => remove_drained(&self.state, &address),
                    None => break,
                },
            }
        }
    }
}

fn idle<A: Address>() -> EventStream<A> {
    stream::pending().boxed()
}

/// Keeps only the last event per address, in the order those last events
/// appeared.
pub(crate) fn coalesce<A: Address>(batch: EventBatch<A>) -> EventBatch<A> {
    let mut last = HashMap::with_capacity(batch.len());
    for (index, event) in batch.iter().enumerate() {
        last.insert(event.address.clone(), index);
    }
    batch
        .into_iter()
        .enumerate()
        .filter(|(index, event)| last.get(&event.address) == Some(index))
        .map(|(_, event)| event)
        .collect()
}

pub(crate) fn apply_batch<A, C>(state: &SharedState<A, C>, batch: EventBatch<A>)
where
    A: Address,
    C: LoadBalancedConnection,
{
    let events = coalesce(batch);
    if events.is_empty() {
        return;
    }

    let removed = {
        let _writer = state.writer.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_closed() {
            return;
        }
        let mut table: Vec<Arc<Host<A, C>>> = state.hosts.load_full().as_ref().clone();
        let mut removed = Vec::new();
        let mut changed = false;

        for event in events {
            let position = table.iter().position(|host| host.address() == &event.address);
            match (event.status, position) {
                (DiscoveryStatus::Available, None) => {
                    info!(resource = %state.target, address = ?event.address, "Host added");
                    table.push(Arc::new(Host::new(event.address)));
                    changed = true;
                }
                (DiscoveryStatus::Available, Some(index)) => {
                    let previous = table[index].mark_active();
                    if matches!(previous, HostStatus::Expired | HostStatus::Unhealthy) {
                        info!(
                            resource = %state.target,
                            address = ?event.address,
                            ?previous,
                            "Host active again"
                        );
                    }
                }
                (DiscoveryStatus::Expired, Some(index)) => {
                    if table[index].mark_expired() {
                        info!(
                            resource = %state.target,
                            address = ?event.address,
                            "Expired host has no connections, removing"
                        );
                        removed.push(table.remove(index));
                        changed = true;
                    } else {
                        info!(resource = %state.target, address = ?event.address, "Host expired");
                    }
                }
                (DiscoveryStatus::Unavailable, Some(index)) => {
                    info!(resource = %state.target, address = ?event.address, "Host removed");
                    removed.push(table.remove(index));
                    changed = true;
                }
                (status, None) => {
                    debug!(
                        resource = %state.target,
                        address = ?event.address,
                        ?status,
                        "Event for unknown host ignored"
                    );
                }
            }
        }

        if changed {
            state.hosts.store(Arc::new(table));
        }
        removed
    };

    close_removed(state, removed);
    state.observe_table();
}

fn remove_drained<A: Address, C: LoadBalancedConnection>(state: &SharedState<A, C>, address: &A) {
    let removed = {
        let _writer = state.writer.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_closed() {
            return;
        }
        let current = state.hosts.load_full();
        let Some(index) = current.iter().position(|host| {
            host.address() == address
                && host.status() == HostStatus::Expired
                && host.connection_count() == 0
        }) else {
            return;
        };
        let mut table = current.as_ref().clone();
        let host = table.remove(index);
        state.hosts.store(Arc::new(table));
        host
    };
    info!(resource = %state.target, address = ?address, "Expired host drained, removing");
    close_removed(state, vec![removed]);
    state.observe_table();
}

/// Marks removed hosts closed and closes their connections in the background.
fn close_removed<A, C>(state: &SharedState<A, C>, removed: Vec<Arc<Host<A, C>>>)
where
    A: Address,
    C: LoadBalancedConnection,
{
    for host in removed {
        let connections = host.mark_closed();
        if connections.is_empty() {
            continue;
        }
        let target = state.target.clone();
        tokio::spawn(async move {
            let total = connections.len();
            let failed = close_connections(&target, connections).await;
            debug!(resource = %target, total, failed, "Closed connections of removed host");
        });
    }
}
