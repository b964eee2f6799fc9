//! Per-address host entry: connection pool plus health state.
//!
//! Pool and status live together in one immutable [`ConnState`] published
//! through an [`ArcSwap`]. Every transition is a compare-and-swap of a fresh
//! snapshot, so readers never lock and concurrent appends/removals retry
//! instead of blocking each other.

use crate::connection::{Address, LoadBalancedConnection};
use crate::executor::TaskHandle;
use arc_swap::ArcSwap;
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostStatus {
    Active,
    Expired,
    Unhealthy,
    Closed,
}

#[derive(Debug, Clone)]
pub(crate) struct ConnState<C> {
    pub(crate) connections: Vec<C>,
    pub(crate) status: HostStatus,
    pub(crate) consecutive_failures: u32,
}

/// Point-in-time view of a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSummary<A> {
    pub address: A,
    pub status: HostStatus,
    pub connections: usize,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AddOutcome {
    Added,
    /// The host was unhealthy and is active again.
    Restored,
    HostClosed,
}

enum Step<C, R> {
    Swap(ConnState<C>, R),
    Keep(R),
}

pub struct Host<A, C> {
    address: A,
    state: ArcSwap<ConnState<C>>,
    health_check: Mutex<Option<TaskHandle>>,
}

impl<A: Address, C: LoadBalancedConnection> Host<A, C> {
    pub fn new(address: A) -> Self {
        Self {
            address,
            state: ArcSwap::from_pointee(ConnState {
                connections: Vec::new(),
                status: HostStatus::Active,
                consecutive_failures: 0,
            }),
            health_check: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &A {
        &self.address
    }

    pub fn status(&self) -> HostStatus {
        self.state.load().status
    }

    pub fn connection_count(&self) -> usize {
        self.state.load().connections.len()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.state.load().consecutive_failures
    }

    pub fn summary(&self) -> HostSummary<A> {
        let state = self.state.load();
        HostSummary {
            address: self.address.clone(),
            status: state.status,
            connections: state.connections.len(),
            consecutive_failures: state.consecutive_failures,
        }
    }

    pub(crate) fn snapshot(&self) -> Arc<ConnState<C>> {
        self.state.load_full()
    }

    fn transition<R>(&self, mut f: impl FnMut(&ConnState<C>) -> Step<C, R>) -> R {
        let mut current = self.state.load_full();
        loop {
            let (next, out) = match f(current.as_ref()) {
                Step::Swap(next, out) => (next, out),
                Step::Keep(out) => return out,
            };
            let prev = self.state.compare_and_swap(&current, Arc::new(next));
            if Arc::ptr_eq(&*prev, &current) {
                return out;
            }
            current = arc_swap::Guard::into_inner(prev);
        }
    }

    /// Appends a freshly established connection. Resets the failure counter
    /// and brings an unhealthy host back to active.
    pub(crate) fn add_connection(&self, connection: C) -> AddOutcome {
        self.transition(|state| {
            if state.status == HostStatus::Closed {
                return Step::Keep(AddOutcome::HostClosed);
            }
            let mut next = state.clone();
            if !next.connections.contains(&connection) {
                next.connections.push(connection.clone());
            }
            next.consecutive_failures = 0;
            if state.status == HostStatus::Unhealthy {
                next.status = HostStatus::Active;
                Step::Swap(next, AddOutcome::Restored)
            } else {
                Step::Swap(next, AddOutcome::Added)
            }
        })
    }

    /// Prunes a connection. Returns true when this left an expired host with
    /// no connections.
    pub(crate) fn remove_connection(&self, connection: &C) -> bool {
        self.transition(|state| {
            let Some(index) = state.connections.iter().position(|c| c == connection) else {
                return Step::Keep(false);
            };
            let mut next = state.clone();
            next.connections.remove(index);
            let drained = next.status == HostStatus::Expired && next.connections.is_empty();
            Step::Swap(next, drained)
        })
    }

    /// Counts a failed connect. Returns true when this failure moved the host
    /// from active to unhealthy; `threshold` is `None` when health checking is
    /// disabled.
    pub(crate) fn record_connect_failure(&self, threshold: Option<u32>) -> bool {
        self.transition(|state| {
            if state.status != HostStatus::Active {
                return Step::Keep(false);
            }
            let mut next = state.clone();
            next.consecutive_failures = next.consecutive_failures.saturating_add(1);
            let crossed = threshold.is_some_and(|t| next.consecutive_failures >= t);
            if crossed {
                next.status = HostStatus::Unhealthy;
            }
            Step::Swap(next, crossed)
        })
    }

    /// Returns the previous status. Cancels any running health check.
    pub(crate) fn mark_active(&self) -> HostStatus {
        let previous = self.transition(|state| match state.status {
            HostStatus::Active | HostStatus::Closed => Step::Keep(state.status),
            HostStatus::Expired | HostStatus::Unhealthy => {
                let mut next = state.clone();
                next.status = HostStatus::Active;
                next.consecutive_failures = 0;
                Step::Swap(next, state.status)
            }
        });
        if previous == HostStatus::Unhealthy {
            self.cancel_health_check();
        }
        previous
    }

    /// Returns true when the host has no connections left and should be
    /// removed right away.
    pub(crate) fn mark_expired(&self) -> bool {
        let drained = self.transition(|state| match state.status {
            HostStatus::Closed => Step::Keep(false),
            HostStatus::Expired => Step::Keep(state.connections.is_empty()),
            HostStatus::Active | HostStatus::Unhealthy => {
                let mut next = state.clone();
                next.status = HostStatus::Expired;
                let drained = next.connections.is_empty();
                Step::Swap(next, drained)
            }
        });
        self.cancel_health_check();
        drained
    }

    /// Terminal transition. Only the first caller receives the pooled
    /// connections, so each one is closed exactly once.
    pub(crate) fn mark_closed(&self) -> Vec<C> {
        let drained = self.transition(|state| {
            if state.status == HostStatus::Closed {
                return Step::Keep(Vec::new());
            }
            let next = ConnState {
                connections: Vec::new(),
                status: HostStatus::Closed,
                consecutive_failures: state.consecutive_failures,
            };
            Step::Swap(next, state.connections.clone())
        });
        self.cancel_health_check();
        drained
    }

    /// Stores the handle of the pending health check attempt, cancelling the
    /// one it replaces. The handle is cancelled instead when the host already
    /// left the unhealthy state.
    ///
    /// A retry task rescheduling itself displaces its own handle; it finishes
    /// right after without yielding, so the abort has no effect on it.
    pub(crate) fn install_health_check(&self, handle: TaskHandle) -> bool {
        let mut slot = self.health_check.lock().unwrap_or_else(|e| e.into_inner());
        if self.status() == HostStatus::Unhealthy {
            let displaced = slot.replace(handle);
            drop(slot);
            if let Some(displaced) = displaced {
                displaced.cancel();
            }
            true
        } else {
            drop(slot);
            handle.cancel();
            false
        }
    }

    pub(crate) fn cancel_health_check(&self) {
        let handle = self
            .health_check
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Forgets the handle without cancelling it; used by the task that owns it.
    pub(crate) fn clear_health_check(&self) {
        self.health_check
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    #[cfg(test)]
    pub(crate) fn has_health_check(&self) -> bool {
        self.health_check
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl<A: Address, C: LoadBalancedConnection> fmt::Debug for Host<A, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.load();
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("status", &state.status)
            .field("connections", &state.connections.len())
            .field("consecutive_failures", &state.consecutive_failures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestConnection;

    fn host() -> Host<String, TestConnection> {
        Host::new("10.0.0.1:80".to_string())
    }

    #[test]
    fn failures_escalate_at_threshold() {
        let host = host();
        for _ in 0..4 {
            assert!(!host.record_connect_failure(Some(5)));
        }
        assert_eq!(host.status(), HostStatus::Active);
        assert!(host.record_connect_failure(Some(5)));
        assert_eq!(host.status(), HostStatus::Unhealthy);
        // Already unhealthy: no second transition, counter frozen.
        assert!(!host.record_connect_failure(Some(5)));
        assert_eq!(host.consecutive_failures(), 5);
    }

    #[test]
    fn disabled_threshold_never_escalates() {
        let host = host();
        for _ in 0..100 {
            assert!(!host.record_connect_failure(None));
        }
        assert_eq!(host.status(), HostStatus::Active);
        assert_eq!(host.consecutive_failures(), 100);
    }

    #[test]
    fn connection_resets_failures_and_restores() {
        let host = host();
        host.record_connect_failure(Some(1));
        assert_eq!(host.status(), HostStatus::Unhealthy);

        assert_eq!(host.add_connection(TestConnection::new(1)), AddOutcome::Restored);
        assert_eq!(host.status(), HostStatus::Active);
        assert_eq!(host.consecutive_failures(), 0);
        assert_eq!(host.add_connection(TestConnection::new(2)), AddOutcome::Added);
        assert_eq!(host.connection_count(), 2);
    }

    #[test]
    fn expired_host_drains_on_last_removal() {
        let host = host();
        let first = TestConnection::new(1);
        let second = TestConnection::new(2);
        host.add_connection(first.clone());
        host.add_connection(second.clone());

        assert!(!host.mark_expired());
        assert_eq!(host.status(), HostStatus::Expired);
        assert!(!host.remove_connection(&first));
        assert!(host.remove_connection(&second));
        assert!(!host.remove_connection(&second));
    }

    #[test]
    fn expiring_empty_host_reports_drained() {
        let host = host();
        assert!(host.mark_expired());
    }

    #[test]
    fn closed_is_terminal_and_drains_once() {
        let host = host();
        host.add_connection(TestConnection::new(1));
        host.add_connection(TestConnection::new(2));

        assert_eq!(host.mark_closed().len(), 2);
        assert!(host.mark_closed().is_empty());
        assert_eq!(host.status(), HostStatus::Closed);
        assert_eq!(host.add_connection(TestConnection::new(3)), AddOutcome::HostClosed);
        assert_eq!(host.mark_active(), HostStatus::Closed);
        assert_eq!(host.connection_count(), 0);
    }

    #[test]
    fn health_check_handle_only_kept_while_unhealthy() {
        let host = host();
        let handle = TaskHandle::detached();
        assert!(!host.install_health_check(handle.clone()));
        assert!(handle.is_cancelled());

        host.record_connect_failure(Some(1));
        let handle = TaskHandle::detached();
        assert!(host.install_health_check(handle.clone()));
        assert!(host.has_health_check());

        assert_eq!(host.mark_active(), HostStatus::Unhealthy);
        assert!(handle.is_cancelled());
        assert!(!host.has_health_check());
    }

    #[test]
    fn replacing_health_check_cancels_previous() {
        let host = host();
        host.record_connect_failure(Some(1));
        let first = TaskHandle::detached();
        let second = TaskHandle::detached();
        assert!(host.install_health_check(first.clone()));
        assert!(host.install_health_check(second.clone()));
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        host.mark_closed();
        assert!(second.is_cancelled());
    }
}
