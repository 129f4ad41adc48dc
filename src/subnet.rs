//! Subnet lease contract consumed by the tunnel network.
//!
//! Cluster-wide lease acquisition lives outside this crate; the datapath
//! only depends on the [`LeaseSource`] trait. [`StaticLeaseSource`] is the
//! in-tree implementation `weftd` wires by default: the self lease plus a
//! fixed peer table from the config file, delivered as one initial batch.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// A host's claim on a slice of the overlay address space, together with
/// the underlay address the slice is reachable at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub subnet: Ipv4Net,
    pub public_ip: Ipv4Addr,
}

/// Attributes attached to a lease request.
#[derive(Debug, Clone)]
pub struct LeaseAttrs {
    pub public_ip: Ipv4Addr,
}

/// A change in the cluster's lease set. Events arrive in batches; batch
/// order and in-batch order are both meaningful.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetEvent {
    Added(Lease),
    Removed(Lease),
}

#[derive(Error, Debug)]
pub enum LeaseError {
    /// The caller cancelled the acquisition; propagated unchanged.
    #[error("lease acquisition canceled")]
    Canceled,

    /// The acquisition deadline passed; propagated unchanged.
    #[error("lease acquisition deadline exceeded")]
    DeadlineExceeded,

    #[error("lease acquisition failed: {0}")]
    Other(String),
}

/// Provider of the self lease and the cluster lease event stream.
#[async_trait]
pub trait LeaseSource: Send + Sync {
    /// Acquire this host's lease for `netname`.
    async fn acquire_lease(&self, netname: &str, attrs: &LeaseAttrs) -> Result<Lease, LeaseError>;

    /// Deliver batches of lease events on `events` until the token fires.
    /// The self lease is excluded from the stream.
    async fn watch_leases(
        &self,
        netname: &str,
        own_lease: &Lease,
        events: mpsc::Sender<Vec<SubnetEvent>>,
        token: CancellationToken,
    );
}

/// A peer entry in the static lease table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticPeer {
    #[serde(rename = "Subnet")]
    pub subnet: Ipv4Net,
    #[serde(rename = "PublicIP")]
    pub public_ip: Ipv4Addr,
}

/// Lease source backed entirely by configuration: no cluster store, no
/// churn. Peers show up as a single `Added` batch and never go away.
pub struct StaticLeaseSource {
    self_subnet: Ipv4Net,
    peers: Vec<StaticPeer>,
}

impl StaticLeaseSource {
    pub fn new(self_subnet: Ipv4Net, peers: Vec<StaticPeer>) -> Self {
        Self { self_subnet, peers }
    }
}

#[async_trait]
impl LeaseSource for StaticLeaseSource {
    async fn acquire_lease(&self, netname: &str, attrs: &LeaseAttrs) -> Result<Lease, LeaseError> {
        info!(netname, subnet = %self.self_subnet, "acquired static lease");
        Ok(Lease {
            subnet: self.self_subnet,
            public_ip: attrs.public_ip,
        })
    }

    async fn watch_leases(
        &self,
        _netname: &str,
        own_lease: &Lease,
        events: mpsc::Sender<Vec<SubnetEvent>>,
        token: CancellationToken,
    ) {
        let batch: Vec<SubnetEvent> = self
            .peers
            .iter()
            .filter(|p| p.subnet.trunc() != own_lease.subnet.trunc())
            .map(|p| {
                SubnetEvent::Added(Lease {
                    subnet: p.subnet,
                    public_ip: p.public_ip,
                })
            })
            .collect();

        if !batch.is_empty() {
            info!(peers = batch.len(), "announcing static peer leases");
            if events.send(batch).await.is_err() {
                return;
            }
        }

        token.cancelled().await;
    }
}
