//! Re-subscribes to discovery when no host is active any more, or when the
//! event stream fails. The first trigger needs health checking enabled.
//!
//! Caching layers between the discoverer and its source can keep reporting
//! hosts that are all down while the source already moved on. A fresh
//! subscription after a randomized delay gets the balancer out of that state.
//! Existing hosts are kept; the new stream's events supersede them.

use crate::config::JitterWindow;
use crate::connection::{Address, LoadBalancedConnection};
use crate::executor::{Executor, TaskHandle};
use crate::host::{Host, HostStatus};
use crate::reconciler::Command;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

#[derive(Clone)]
pub struct ResubscribeSettings {
    executor: Arc<dyn Executor>,
    window: JitterWindow,
}

impl ResubscribeSettings {
    pub fn new(executor: Arc<dyn Executor>, window: JitterWindow) -> Self {
        Self { executor, window }
    }

    pub fn window(&self) -> JitterWindow {
        self.window
    }
}

impl fmt::Debug for ResubscribeSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResubscribeSettings")
            .field("window", &self.window)
            .finish()
    }
}

#[derive(Default)]
struct Slot {
    pending: Option<TaskHandle>,
    shut_down: bool,
}

pub(crate) struct ResubscribeMonitor<A> {
    settings: ResubscribeSettings,
    commands: mpsc::UnboundedSender<Command<A>>,
    target: String,
    slot: Mutex<Slot>,
}

impl<A: Address> ResubscribeMonitor<A> {
    pub(crate) fn new(
        settings: ResubscribeSettings,
        commands: mpsc::UnboundedSender<Command<A>>,
        target: String,
    ) -> Self {
        Self {
            settings,
            commands,
            target,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Schedules a resubscribe when every known host is unhealthy or expired.
    pub(crate) fn observe<C: LoadBalancedConnection>(&self, hosts: &[Arc<Host<A, C>>]) -> bool {
        let starved = !hosts.is_empty()
            && hosts
                .iter()
                .all(|host| matches!(host.status(), HostStatus::Unhealthy | HostStatus::Expired));
        starved && self.schedule("no active hosts left").is_some()
    }

    /// One-shot: returns `None` when a resubscribe is already pending or the
    /// monitor was shut down.
    pub(crate) fn schedule(&self, reason: &str) -> Option<Duration> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.shut_down || slot.pending.is_some() {
            return None;
        }
        let delay = self.settings.window.next_delay();
        let commands = self.commands.clone();
        let handle = self.settings.executor.schedule(
            delay,
            Box::pin(async move {
                let _ = commands.send(Command::Resubscribe);
            }),
        );
        slot.pending = Some(handle);
        info!(resource = %self.target, reason, ?delay, "Scheduled discovery resubscribe");
        Some(delay)
    }

    /// Called once the resubscribe went through.
    pub(crate) fn completed(&self) {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).pending = None;
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending
            .is_some()
    }

    /// Cancels a pending resubscribe and refuses new ones.
    pub(crate) fn shutdown(&self) {
        let pending = {
            let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
            slot.shut_down = true;
            slot.pending.take()
        };
        if let Some(handle) = pending {
            handle.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::TokioExecutor;
    use crate::test_support::TestConnection;

    fn monitor() -> (ResubscribeMonitor<String>, mpsc::UnboundedReceiver<Command<String>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let window = JitterWindow::new(Duration::from_secs(10), Duration::from_secs(3)).unwrap();
        let settings = ResubscribeSettings::new(Arc::new(TokioExecutor), window);
        (ResubscribeMonitor::new(settings, tx, "test".to_string()), rx)
    }

    fn host(address: &str) -> Arc<Host<String, TestConnection>> {
        Arc::new(Host::new(address.to_string()))
    }

    #[tokio::test(start_paused = true)]
    async fn ignores_table_with_active_host() {
        let (monitor, _rx) = monitor();
        let down = host("a");
        down.record_connect_failure(Some(1));
        let hosts = vec![down, host("b")];
        assert!(!monitor.observe(&hosts));
        assert!(!monitor.observe::<TestConnection>(&[]));
        assert!(!monitor.is_pending());
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_within_window() {
        let (monitor, mut rx) = monitor();
        let unhealthy = host("a");
        unhealthy.record_connect_failure(Some(1));
        let expired = host("b");
        expired.mark_expired();
        let hosts = vec![unhealthy, expired];

        assert!(monitor.observe(&hosts));
        assert!(!monitor.observe(&hosts), "second observation must not reschedule");

        tokio::time::sleep(Duration::from_millis(6_900)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(7)).await;
        assert_eq!(rx.try_recv().ok(), Some(Command::Resubscribe));

        monitor.completed();
        assert!(monitor.observe(&hosts));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending() {
        let (monitor, mut rx) = monitor();
        assert!(monitor.schedule("test").is_some());
        monitor.shutdown();
        monitor.shutdown();
        assert!(monitor.schedule("test").is_none());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }
}
