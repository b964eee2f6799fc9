use crate::connection::Address;
use crate::error::{BoxError, Result};
use futures::stream::{self, BoxStream, StreamExt};
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoveryStatus {
    Available,
    Expired,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDiscovererEvent<A> {
    pub address: A,
    pub status: DiscoveryStatus,
}

impl<A> ServiceDiscovererEvent<A> {
    pub fn available(address: A) -> Self {
        Self {
            address,
            status: DiscoveryStatus::Available,
        }
    }

    pub fn expired(address: A) -> Self {
        Self {
            address,
            status: DiscoveryStatus::Expired,
        }
    }

    pub fn unavailable(address: A) -> Self {
        Self {
            address,
            status: DiscoveryStatus::Unavailable,
        }
    }
}

pub type EventBatch<A> = Vec<ServiceDiscovererEvent<A>>;

pub type EventStream<A> = BoxStream<'static, std::result::Result<EventBatch<A>, BoxError>>;

/// Source of host events. Every call to `discover` is a fresh subscription.
pub trait ServiceDiscoverer<A: Address>: Send + Sync + 'static {
    fn discover(&self) -> EventStream<A>;
}

/// Announces a fixed set of addresses once per subscription and never
/// completes.
#[derive(Debug, Clone)]
pub struct StaticDiscoverer<A> {
    addresses: Vec<A>,
}

impl<A: Address> StaticDiscoverer<A> {
    pub fn new(addresses: Vec<A>) -> Self {
        Self { addresses }
    }

    pub fn addresses(&self) -> &[A] {
        &self.addresses
    }
}

impl StaticDiscoverer<SocketAddr> {
    /// Resolves `host:port` entries once.
    pub async fn resolve(hosts: &[String], types: ResolvedAddressTypes) -> Result<Self> {
        let mut addresses = Vec::new();
        for host in hosts {
            let resolved: Vec<SocketAddr> = tokio::net::lookup_host(host.as_str()).await?.collect();
            let selected = types.select(resolved);
            debug!(host = %host, addresses = ?selected, "Resolved static host");
            for address in selected {
                if !addresses.contains(&address) {
                    addresses.push(address);
                }
            }
        }
        Ok(Self::new(addresses))
    }
}

impl<A: Address> ServiceDiscoverer<A> for StaticDiscoverer<A> {
    fn discover(&self) -> EventStream<A> {
        let batch: EventBatch<A> = self
            .addresses
            .iter()
            .cloned()
            .map(ServiceDiscovererEvent::available)
            .collect();
        stream::once(async move { Ok(batch) })
            .chain(stream::pending())
            .boxed()
    }
}

/// Which IP families a resolution keeps, and in which order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedAddressTypes {
    Ipv4Only,
    Ipv6Only,
    /// IPv4 when any resolved, IPv6 otherwise.
    #[default]
    Ipv4Preferred,
    /// IPv6 when any resolved, IPv4 otherwise.
    Ipv6Preferred,
    /// Everything, IPv4 first.
    Ipv4PreferredReturnAll,
    /// Everything, IPv6 first.
    Ipv6PreferredReturnAll,
}

impl ResolvedAddressTypes {
    pub fn select(self, resolved: Vec<SocketAddr>) -> Vec<SocketAddr> {
        let (v4, v6): (Vec<SocketAddr>, Vec<SocketAddr>) =
            resolved.into_iter().partition(SocketAddr::is_ipv4);
        match self {
            ResolvedAddressTypes::Ipv4Only => v4,
            ResolvedAddressTypes::Ipv6Only => v6,
            ResolvedAddressTypes::Ipv4Preferred => {
                if v4.is_empty() {
                    v6
                } else {
                    v4
                }
            }
            ResolvedAddressTypes::Ipv6Preferred => {
                if v6.is_empty() {
                    v4
                } else {
                    v6
                }
            }
            ResolvedAddressTypes::Ipv4PreferredReturnAll => v4.into_iter().chain(v6).collect(),
            ResolvedAddressTypes::Ipv6PreferredReturnAll => v6.into_iter().chain(v4).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mixed() -> Vec<SocketAddr> {
        vec![
            "[::1]:80".parse().unwrap(),
            "10.0.0.1:80".parse().unwrap(),
            "[::2]:80".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        ]
    }

    #[test]
    fn preferred_family_falls_back() {
        let only_v6: Vec<SocketAddr> = vec!["[::1]:80".parse().unwrap()];
        assert_eq!(
            ResolvedAddressTypes::Ipv4Preferred.select(only_v6.clone()),
            only_v6
        );
        let picked = ResolvedAddressTypes::Ipv4Preferred.select(mixed());
        assert_eq!(picked.len(), 2);
        assert!(picked.iter().all(SocketAddr::is_ipv4));
        assert!(ResolvedAddressTypes::Ipv4Only
            .select(only_v6)
            .is_empty());
    }

    #[test]
    fn return_all_orders_preferred_family_first() {
        let all = ResolvedAddressTypes::Ipv6PreferredReturnAll.select(mixed());
        assert_eq!(all.len(), 4);
        assert!(all[0].is_ipv6() && all[1].is_ipv6());
        assert!(all[2].is_ipv4() && all[3].is_ipv4());
    }

    #[test]
    fn address_types_deserialize_snake_case() {
        let types: ResolvedAddressTypes =
            serde_yaml::from_str("ipv6_preferred_return_all").unwrap();
        assert_eq!(types, ResolvedAddressTypes::Ipv6PreferredReturnAll);
    }

    #[tokio::test]
    async fn static_discoverer_announces_every_subscription() {
        let discoverer = StaticDiscoverer::new(vec!["a".to_string(), "b".to_string()]);
        for _ in 0..2 {
            let mut events = discoverer.discover();
            let batch = events.next().await.unwrap().unwrap();
            assert_eq!(
                batch,
                vec![
                    ServiceDiscovererEvent::available("a".to_string()),
                    ServiceDiscovererEvent::available("b".to_string()),
                ]
            );
        }
    }
}
