#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use rr_balancer::{
    BoxError, ConnectionFactory, EventBatch, EventStream, Executor, LoadBalancedConnection,
    ServiceDiscoverer, ServiceDiscovererEvent, TaskHandle, TokioExecutor,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct MockConnection {
    pub id: usize,
    pub address: String,
    closed: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
}

impl MockConnection {
    /// Claims the connection for one request; fails while it is claimed.
    pub fn try_reserve(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn release(&self) {
        self.busy.store(false, Ordering::SeqCst);
    }

    pub fn close_now(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl PartialEq for MockConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for MockConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockConnection")
            .field("id", &self.id)
            .field("address", &self.address)
            .finish()
    }
}

#[async_trait]
impl LoadBalancedConnection for MockConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.close_now();
        Ok(())
    }
}

/// Connection factory with a per-address up/down switch.
#[derive(Default)]
pub struct MockConnectionFactory {
    down: DashMap<String, bool>,
    attempts: DashMap<String, usize>,
    opened: Mutex<Vec<MockConnection>>,
    next_id: AtomicUsize,
}

impl MockConnectionFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, address: &str, down: bool) {
        self.down.insert(address.to_string(), down);
    }

    pub fn attempts(&self, address: &str) -> usize {
        self.attempts.get(address).map(|count| *count).unwrap_or(0)
    }

    pub fn opened(&self) -> Vec<MockConnection> {
        self.opened.lock().unwrap().clone()
    }

    pub fn opened_for(&self, address: &str) -> usize {
        self.opened().iter().filter(|c| c.address == address).count()
    }

    pub fn open_connections(&self) -> usize {
        self.opened().iter().filter(|c| !c.is_closed()).count()
    }
}

#[async_trait]
impl ConnectionFactory<String, MockConnection> for MockConnectionFactory {
    async fn new_connection(&self, address: &String) -> Result<MockConnection, BoxError> {
        *self.attempts.entry(address.clone()).or_insert(0) += 1;
        if self.down.get(address).map(|down| *down).unwrap_or(false) {
            return Err(format!("connection refused by {}", address).into());
        }
        let connection = MockConnection {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            address: address.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            busy: Arc::new(AtomicBool::new(false)),
        };
        self.opened.lock().unwrap().push(connection.clone());
        Ok(connection)
    }
}

/// Discoverer driven by the test. Every subscription gets its own channel;
/// events go to the latest one.
#[derive(Default)]
pub struct ChannelDiscoverer {
    senders: Mutex<Vec<mpsc::UnboundedSender<Result<EventBatch<String>, BoxError>>>>,
}

impl ChannelDiscoverer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscriptions(&self) -> usize {
        self.senders.lock().unwrap().len()
    }

    pub fn publish(&self, batch: EventBatch<String>) {
        if let Some(sender) = self.senders.lock().unwrap().last() {
            let _ = sender.send(Ok(batch));
        }
    }

    pub fn fail(&self, reason: &str) {
        if let Some(sender) = self.senders.lock().unwrap().last() {
            let _ = sender.send(Err(reason.to_string().into()));
        }
    }
}

impl ServiceDiscoverer<String> for ChannelDiscoverer {
    fn discover(&self) -> EventStream<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.senders.lock().unwrap().push(tx);
        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
    }
}

/// Tokio executor that remembers every delay and handle it was given.
#[derive(Default)]
pub struct RecordingExecutor {
    scheduled: Mutex<Vec<(Duration, TaskHandle)>>,
}

impl RecordingExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .map(|(delay, _)| *delay)
            .collect()
    }

    pub fn handles(&self) -> Vec<TaskHandle> {
        self.scheduled
            .lock()
            .unwrap()
            .iter()
            .map(|(_, handle)| handle.clone())
            .collect()
    }
}

impl Executor for RecordingExecutor {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) -> TaskHandle {
        let handle = TokioExecutor.schedule(delay, task);
        self.scheduled.lock().unwrap().push((delay, handle.clone()));
        handle
    }
}

pub fn available(addresses: &[&str]) -> EventBatch<String> {
    addresses
        .iter()
        .map(|address| ServiceDiscovererEvent::available(address.to_string()))
        .collect()
}

/// Yields to background tasks until `condition` holds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..1_000 {
        if condition() {
            return true;
        }
        tokio::task::yield_now().await;
    }
    condition()
}

/// Polls `condition` in real time; for multi-threaded runtimes where yielding
/// does not guarantee progress of other workers.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
