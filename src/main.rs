use async_trait::async_trait;
use rr_balancer::{
    BoxError, Config, ConnectionFactory, LoadBalancedConnection, RoundRobinLoadBalancerFactory,
    StaticDiscoverer,
};
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_CONFIG_PATH: &str = "config/lb.yaml";
const DEFAULT_SELECTIONS: usize = 12;

fn setup_logging() {
    fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_target(false)
        .with_thread_names(true)
        .with_ansi(true)
        .init();
}

/// Plain TCP connection; this binary never writes to it.
#[derive(Clone)]
struct TcpConnection {
    id: usize,
    peer: SocketAddr,
    stream: Arc<Mutex<Option<TcpStream>>>,
    closed: Arc<AtomicBool>,
}

impl PartialEq for TcpConnection {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl LoadBalancedConnection for TcpConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<(), BoxError> {
        self.closed.store(true, Ordering::Release);
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream.shutdown().await?;
        }
        Ok(())
    }
}

struct TcpConnectionFactory {
    next_id: AtomicUsize,
    connect_timeout: Duration,
}

#[async_trait]
impl ConnectionFactory<SocketAddr, TcpConnection> for TcpConnectionFactory {
    async fn new_connection(&self, address: &SocketAddr) -> Result<TcpConnection, BoxError> {
        let connect = TcpStream::connect(address);
        let stream = tokio::time::timeout(self.connect_timeout, connect).await??;
        Ok(TcpConnection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            peer: *address,
            stream: Arc::new(Mutex::new(Some(stream))),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_logging();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let selections = match args.next() {
        Some(count) => count.parse()?,
        None => DEFAULT_SELECTIONS,
    };

    info!(path = %config_path, "Loading configuration");
    let config = Config::from_file(&config_path)?;
    if config.hosts.is_empty() {
        anyhow::bail!("no hosts configured in {}", config_path);
    }

    let discoverer = StaticDiscoverer::resolve(&config.hosts, config.address_types).await?;
    info!(addresses = ?discoverer.addresses(), "Resolved hosts");

    let factory = RoundRobinLoadBalancerFactory::from_config(&config)?;
    let load_balancer = factory.new_load_balancer(
        "lb-demo",
        Arc::new(discoverer),
        Arc::new(TcpConnectionFactory {
            next_id: AtomicUsize::new(0),
            connect_timeout: Duration::from_secs(2),
        }),
    );

    // Discovery runs in the background; give it a moment to publish hosts.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut tally: BTreeMap<SocketAddr, usize> = BTreeMap::new();
    for attempt in 0..selections {
        match load_balancer.select_connection(|_: &TcpConnection| true).await {
            Ok(connection) => *tally.entry(connection.peer).or_default() += 1,
            Err(err) => warn!(attempt, error = %err, "Selection failed"),
        }
    }

    for (address, count) in &tally {
        info!(%address, count, "Selections per host");
    }
    for host in load_balancer.hosts() {
        info!(
            address = %host.address,
            status = ?host.status,
            connections = host.connections,
            failures = host.consecutive_failures,
            "Host state"
        );
    }

    load_balancer.close().await?;
    info!("Load balancer closed");
    Ok(())
}
