use crate::connection::{Address, LoadBalancedConnection};
use crate::host::{Host, HostStatus};
use metrics::{register_counter, register_gauge, Counter, Gauge};
use std::sync::Arc;

#[derive(Clone)]
pub struct Metrics {
    selections_total: Counter,
    rejections_total: Counter,
    connections_created_total: Counter,
    connect_failures_total: Counter,
    resubscribes_total: Counter,
    hosts: Gauge,
    unhealthy_hosts: Gauge,
}

impl Metrics {
    pub fn new(target: &str) -> Self {
        let target = target.to_string();
        Self {
            selections_total: register_counter!(
                "rr_lb_selections_total",
                "target" => target.clone()
            ),
            rejections_total: register_counter!(
                "rr_lb_rejections_total",
                "target" => target.clone()
            ),
            connections_created_total: register_counter!(
                "rr_lb_connections_created_total",
                "target" => target.clone()
            ),
            connect_failures_total: register_counter!(
                "rr_lb_connect_failures_total",
                "target" => target.clone()
            ),
            resubscribes_total: register_counter!(
                "rr_lb_resubscribes_total",
                "target" => target.clone()
            ),
            hosts: register_gauge!("rr_lb_hosts", "target" => target.clone()),
            unhealthy_hosts: register_gauge!("rr_lb_unhealthy_hosts", "target" => target),
        }
    }

    pub fn increment_selections(&self) {
        self.selections_total.increment(1);
    }

    pub fn increment_rejections(&self) {
        self.rejections_total.increment(1);
    }

    pub fn increment_connections_created(&self) {
        self.connections_created_total.increment(1);
    }

    pub fn increment_connect_failures(&self) {
        self.connect_failures_total.increment(1);
    }

    pub fn increment_resubscribes(&self) {
        self.resubscribes_total.increment(1);
    }

    pub fn record_hosts<A, C>(&self, hosts: &[Arc<Host<A, C>>])
    where
        A: Address,
        C: LoadBalancedConnection,
    {
        let unhealthy = hosts
            .iter()
            .filter(|host| host.status() == HostStatus::Unhealthy)
            .count();
        self.hosts.set(hosts.len() as f64);
        self.unhealthy_hosts.set(unhealthy as f64);
    }
}
