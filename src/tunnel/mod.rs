//! The tunnel network: a TUN device and a UDP socket bridged in both
//! directions, plus the reactor that keeps the forwarding database in
//! step with the cluster's subnet leases.
//!
//! Three workers run until the cancellation token fires: egress
//! (tun → udp), ingress (udp → tun), and the lease watcher. The reactor
//! itself runs on [`TunnelNetwork::run`]'s own loop. Transient I/O errors
//! are logged and the packet dropped; nothing on the hot path exits.

mod tun;

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use tun::TunDevice;

use crate::backend::ExternalInterface;
use crate::fdb::ForwardingDb;
use crate::packet;
use crate::subnet::{Lease, LeaseSource, SubnetEvent};

/// Naming template for tunnel interfaces; the kernel fills in the index.
const TUN_NAME_TEMPLATE: &str = "weft%d";

pub struct TunnelNetwork {
    netname: String,
    port: u16,
    mtu: usize,
    tun: Arc<TunDevice>,
    udp: Arc<UdpSocket>,
    lease: Lease,
    lease_source: Arc<dyn LeaseSource>,
    fdb: Arc<ForwardingDb>,
}

impl TunnelNetwork {
    /// Open and configure the TUN device, bind the UDP socket.
    ///
    /// `tun_net` is the host subnet's address carried with the
    /// overlay-wide prefix length (the address assigned to the interface
    /// doubles as the tunnel endpoint IP). Failures here are fatal: a
    /// tunnel that cannot reach the kernel cannot carry traffic.
    pub async fn new(
        netname: String,
        lease_source: Arc<dyn LeaseSource>,
        ext_iface: &ExternalInterface,
        port: u16,
        tun_net: Ipv4Net,
        lease: Lease,
    ) -> Result<Self> {
        let mtu = packet::tunnel_mtu(ext_iface.mtu);

        let tun = TunDevice::open(TUN_NAME_TEMPLATE).context("opening tun device")?;
        tun::configure_iface(tun.name(), tun_net.addr(), tun_net, mtu)
            .with_context(|| format!("configuring {}", tun.name()))?;

        let bind_addr = SocketAddrV4::new(ext_iface.iface_addr, port);
        let udp = UdpSocket::bind(bind_addr)
            .await
            .with_context(|| format!("binding overlay udp socket to {bind_addr}"))?;

        info!(netname = %netname, tun = tun.name(), %bind_addr, mtu, "created tunnel network");

        Ok(Self {
            netname,
            port,
            mtu,
            tun: Arc::new(tun),
            udp: Arc::new(udp),
            lease,
            lease_source,
            fdb: Arc::new(ForwardingDb::new()),
        })
    }

    /// Run the datapath until the token fires, then join every worker.
    /// Dropping `self` afterwards closes the TUN fd (destroying the
    /// interface) and the UDP socket.
    pub async fn run(self, token: CancellationToken) {
        let egress = {
            let (tun, udp, fdb) = (Arc::clone(&self.tun), Arc::clone(&self.udp), Arc::clone(&self.fdb));
            let token = token.clone();
            let mtu = self.mtu;
            tokio::spawn(async move { egress_loop(&tun, &udp, &fdb, mtu, token).await })
        };

        let ingress = {
            let (tun, udp) = (Arc::clone(&self.tun), Arc::clone(&self.udp));
            let token = token.clone();
            let mtu = self.mtu;
            tokio::spawn(async move { ingress_loop(&tun, &udp, mtu, token).await })
        };

        // Capacity 1: the watcher stays at most one batch ahead of the
        // reactor, and batch order is preserved.
        let (event_tx, mut event_rx) = mpsc::channel::<Vec<SubnetEvent>>(1);
        let watcher = {
            let source = Arc::clone(&self.lease_source);
            let netname = self.netname.clone();
            let lease = self.lease.clone();
            let token = token.clone();
            tokio::spawn(async move {
                info!("watching for subnet leases");
                source.watch_leases(&netname, &lease, event_tx, token).await;
                info!("done watching for subnet leases");
            })
        };

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    info!("received done signal, shutting down");
                    break;
                }
                batch = event_rx.recv() => match batch {
                    Some(batch) => apply_subnet_events(&self.fdb, self.port, batch),
                    None => {
                        // Watcher ended early; keep forwarding until told to stop.
                        token.cancelled().await;
                        info!("received done signal, shutting down");
                        break;
                    }
                }
            }
        }

        for (name, handle) in [("egress", egress), ("ingress", ingress), ("lease watcher", watcher)] {
            if let Err(err) = handle.await {
                error!(worker = name, error = %err, "worker terminated abnormally");
            }
        }
        info!("tunnel network stopped");
    }
}

/// Apply one ordered batch of lease events to the forwarding database.
/// Per-event failures are logged and never abort the rest of the batch.
fn apply_subnet_events(fdb: &ForwardingDb, port: u16, batch: Vec<SubnetEvent>) {
    for event in batch {
        match event {
            SubnetEvent::Added(lease) => {
                let endpoint = SocketAddrV4::new(lease.public_ip, port);
                info!(subnet = %lease.subnet, %endpoint, "subnet added");
                if let Err(err) = fdb.add(lease.subnet, endpoint) {
                    error!(error = %err, "adding forwarding entry");
                }
            }
            SubnetEvent::Removed(lease) => {
                info!(subnet = %lease.subnet, "subnet removed");
                if let Err(err) = fdb.remove(lease.subnet) {
                    error!(error = %err, "removing forwarding entry");
                }
            }
        }
    }
}

/// Resolve where an outbound packet read from the TUN should be sent.
/// Returns `None` (after logging) for malformed packets and lookup
/// misses; the packet is dropped, which is fine at L3.
fn egress_destination(fdb: &ForwardingDb, pkt: &[u8]) -> Option<SocketAddrV4> {
    let dst: Ipv4Addr = match packet::ipv4_destination(pkt) {
        Some(dst) => dst,
        None => {
            warn!(len = pkt.len(), "dropping malformed packet from tun");
            return None;
        }
    };
    match fdb.find_underlay_endpoint(dst) {
        Ok(endpoint) => Some(endpoint),
        Err(err) => {
            error!(error = %err, "find dest");
            None
        }
    }
}

async fn egress_loop(
    tun: &TunDevice,
    udp: &UdpSocket,
    fdb: &ForwardingDb,
    mtu: usize,
    token: CancellationToken,
) {
    info!("starting tun -> udp");
    let mut buf = vec![0u8; mtu];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = tun.read(&mut buf) => {
                let n = match result {
                    Err(err) => {
                        error!(error = %err, "tun read");
                        continue;
                    }
                    Ok(0) => {
                        info!("tun empty read");
                        continue;
                    }
                    Ok(n) => n,
                };
                let pkt = &buf[..n];
                let Some(endpoint) = egress_destination(fdb, pkt) else {
                    continue;
                };
                // The read slice goes out verbatim: the overlay adds no
                // header of its own.
                if let Err(err) = udp.send_to(pkt, SocketAddr::V4(endpoint)).await {
                    error!(error = %err, "send udp");
                }
            }
        }
    }
    info!("done with tun -> udp");
}

async fn ingress_loop(tun: &TunDevice, udp: &UdpSocket, mtu: usize, token: CancellationToken) {
    info!("starting udp -> tun");
    let mut buf = vec![0u8; mtu];
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            result = udp.recv_from(&mut buf) => {
                let n = match result {
                    Err(err) => {
                        error!(error = %err, "udp read");
                        continue;
                    }
                    Ok((0, _)) => {
                        info!("udp empty read");
                        continue;
                    }
                    Ok((n, _)) => n,
                };
                // TODO: consult LocalPolicy::is_allowed here once the
                // wire format carries a source tag.
                if let Err(err) = tun.write(&buf[..n]).await {
                    error!(error = %err, "write to tun");
                }
            }
        }
    }
    info!("done with udp -> tun");
}
