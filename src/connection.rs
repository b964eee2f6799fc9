use crate::error::BoxError;
use async_trait::async_trait;
use std::fmt::Debug;
use std::hash::Hash;

/// Resolved address of a host. Identity key of the host table.
pub trait Address: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

impl<T> Address for T where T: Clone + Eq + Hash + Debug + Send + Sync + 'static {}

/// A connection the load balancer can pool and hand out.
///
/// Equality identifies a pooled connection when it is pruned, so cheap
/// handles (an `Arc` around the transport) should compare by identity.
#[async_trait]
pub trait LoadBalancedConnection: Clone + PartialEq + Debug + Send + Sync + 'static {
    fn is_closed(&self) -> bool;

    async fn close(&self) -> Result<(), BoxError>;
}

/// Establishes connections to resolved addresses.
#[async_trait]
pub trait ConnectionFactory<A, C>: Send + Sync + 'static
where
    A: Address,
    C: LoadBalancedConnection,
{
    async fn new_connection(&self, address: &A) -> Result<C, BoxError>;
}
