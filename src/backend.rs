//! Backend wiring: turn a parsed config and a lease source into a running
//! tunnel network plus its control-plane workers.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ipnet::Ipv4Net;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::BackendConfig;
use crate::policy::{DynamicPolicy, HttpPolicyClient, Poller, Registrar, Tag};
use crate::subnet::{LeaseAttrs, LeaseError, LeaseSource};
use crate::tunnel::TunnelNetwork;

/// Tag length shared by every host in the fabric.
const TAG_LENGTH: usize = 4;

/// Reserved tag admitted unconditionally; stamped on control-plane
/// traffic sourced from the tunnel interface itself.
const CONTROL_TAG: &[u8; 4] = b"ctrl";

/// Overall timeout for a policy-server request.
const POLICY_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The already-discovered external interface. Discovery itself happens
/// outside this crate; the datapath only needs the facts.
#[derive(Debug, Clone, Copy)]
pub struct ExternalInterface {
    /// Address the overlay UDP socket binds to.
    pub iface_addr: Ipv4Addr,
    /// Address peers reach this host at (advertised in the lease).
    pub public_addr: Ipv4Addr,
    /// Physical MTU; the tunnel MTU is derived from it.
    pub mtu: usize,
}

pub struct Backend {
    lease_source: Arc<dyn LeaseSource>,
    ext_iface: ExternalInterface,
}

impl Backend {
    pub fn new(lease_source: Arc<dyn LeaseSource>, ext_iface: ExternalInterface) -> Self {
        Self {
            lease_source,
            ext_iface,
        }
    }

    /// Acquire the self lease, stand up the policy control plane, and
    /// build the tunnel network for `netname`.
    ///
    /// `overlay` is the tunnel-wide network of which the acquired lease is
    /// a host-sized slice. Returned handles are the spawned control-plane
    /// workers; they stop when `token` fires.
    pub async fn register_network(
        &self,
        netname: &str,
        overlay: Ipv4Net,
        config: &BackendConfig,
        token: &CancellationToken,
    ) -> Result<(TunnelNetwork, Vec<JoinHandle<()>>)> {
        info!(netname, ?config, "registering udp overlay network");

        let attrs = LeaseAttrs {
            public_ip: self.ext_iface.public_addr,
        };
        let lease = match self.lease_source.acquire_lease(netname, &attrs).await {
            Ok(lease) => lease,
            // Cancellation and deadline pass through untouched so the
            // caller can tell an orderly shutdown from a failure.
            Err(err @ (LeaseError::Canceled | LeaseError::DeadlineExceeded)) => {
                return Err(err.into());
            }
            Err(err) => return Err(err).context("failed to acquire lease"),
        };

        // The tunnel interface carries the host subnet's address with the
        // overlay-wide prefix, so the whole overlay is on-link at the tun.
        let tun_net = Ipv4Net::new(lease.subnet.addr(), overlay.prefix_len())
            .context("deriving tunnel network")?;

        let engine = Arc::new(DynamicPolicy::new(
            TAG_LENGTH,
            tun_net.addr(),
            Tag::new(*CONTROL_TAG),
        ));

        let mut handles = Vec::new();

        let registrar = Registrar::new(config.local_listen_addr.clone(), Arc::clone(&engine));
        let registrar_token = token.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = registrar.run(registrar_token).await {
                error!(error = %err, "endpoint registrar failed");
            }
        }));

        if config.policy_url.is_empty() {
            info!("no policy url configured, whitelist polling disabled");
        } else {
            let client = HttpPolicyClient::new(config.policy_url.clone(), POLICY_REQUEST_TIMEOUT)
                .context("building policy-server client")?;
            let poller = Poller::new(
                crate::policy::DEFAULT_POLL_INTERVAL,
                Arc::clone(&engine),
                Arc::new(client),
            );
            let poller_token = token.clone();
            handles.push(tokio::spawn(async move {
                poller.run(poller_token).await;
            }));
        }

        let network = TunnelNetwork::new(
            netname.to_string(),
            Arc::clone(&self.lease_source),
            &self.ext_iface,
            config.port,
            tun_net,
            lease,
        )
        .await?;

        Ok((network, handles))
    }
}
