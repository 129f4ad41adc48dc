//! Endpoint registrar: the HTTP surface through which the container
//! runtime announces endpoint setup and teardown.
//!
//! The body of both routes is the CNI result envelope the runtime already
//! has in hand; only the container id, the address from `Result.IP4.IP`,
//! and the `app_id` property buried in `Config.Bytes` are consumed.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::Router;
use base64::Engine;
use ipnet::Ipv4Net;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::dynamic::DynamicPolicy;
use super::models::Endpoint;

#[derive(Deserialize, Default)]
struct CniEnvelope {
    #[serde(rename = "ContainerID", default)]
    container_id: String,
    #[serde(rename = "Result", default)]
    result: CniResult,
    #[serde(rename = "Config", default)]
    config: CniConfig,
}

#[derive(Deserialize, Default)]
struct CniResult {
    #[serde(rename = "IP4", default)]
    ip4: CniIp4,
}

#[derive(Deserialize, Default)]
struct CniIp4 {
    #[serde(rename = "IP", default)]
    ip: String,
}

#[derive(Deserialize, Default)]
struct CniConfig {
    /// Base64 blob of the nested container-network config JSON.
    #[serde(rename = "Bytes", default)]
    bytes: String,
}

#[derive(Deserialize)]
struct NetworkConfig {
    #[serde(rename = "Network")]
    network: NetworkSection,
}

#[derive(Deserialize)]
struct NetworkSection {
    #[serde(rename = "Properties")]
    properties: NetworkProperties,
}

#[derive(Deserialize)]
struct NetworkProperties {
    app_id: String,
}

/// Parse the CNI envelope into an [`Endpoint`].
///
/// An empty `Result.IP4.IP` is accepted and yields an endpoint without an
/// address; a malformed CIDR is a payload error.
fn parse_payload(body: &[u8]) -> Result<Endpoint> {
    let envelope: CniEnvelope =
        serde_json::from_slice(body).context("decoding cni result envelope")?;

    let overlay_ip: Option<Ipv4Addr> = if envelope.result.ip4.ip.is_empty() {
        None
    } else {
        let net: Ipv4Net = envelope
            .result
            .ip4
            .ip
            .parse()
            .context("parsing Result.IP4.IP")?;
        // Keep the host part; the prefix belongs to the network config.
        Some(net.addr())
    };

    let config_bytes = base64::engine::general_purpose::STANDARD
        .decode(envelope.config.bytes.as_bytes())
        .context("decoding Config.Bytes")?;
    let network: NetworkConfig =
        serde_json::from_slice(&config_bytes).context("decoding network properties")?;

    Ok(Endpoint {
        container_id: envelope.container_id,
        group_id: network.network.properties.app_id,
        overlay_ip,
    })
}

async fn add_result(State(engine): State<Arc<DynamicPolicy>>, body: Bytes) -> StatusCode {
    let endpoint = match parse_payload(&body) {
        Ok(ep) => ep,
        Err(err) => {
            warn!(error = %err, "add: bad payload");
            return StatusCode::BAD_REQUEST;
        }
    };
    engine.register(endpoint);
    StatusCode::OK
}

async fn del_result(State(engine): State<Arc<DynamicPolicy>>, body: Bytes) -> StatusCode {
    let endpoint = match parse_payload(&body) {
        Ok(ep) => ep,
        Err(err) => {
            warn!(error = %err, "del: bad payload");
            return StatusCode::BAD_REQUEST;
        }
    };
    if let Err(err) = engine.deregister(&endpoint) {
        warn!(error = %err, "del: deregister failed");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

/// The registrar HTTP server. One per host, bound to a loopback address
/// the container runtime is configured to notify.
pub struct Registrar {
    listen_addr: String,
    engine: Arc<DynamicPolicy>,
}

impl Registrar {
    pub fn new(listen_addr: impl Into<String>, engine: Arc<DynamicPolicy>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            engine,
        }
    }

    /// Serve until the token fires. Endpoint-level failures surface as
    /// status codes; only bind errors terminate the server.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.listen_addr)
            .await
            .with_context(|| format!("binding registrar to {}", self.listen_addr))?;
        info!(addr = %self.listen_addr, "endpoint registrar listening");

        axum::serve(listener, router(self.engine))
            .with_graceful_shutdown(token.cancelled_owned())
            .await
            .context("registrar server")
    }
}

fn router(engine: Arc<DynamicPolicy>) -> Router {
    Router::new()
        .route("/cni-result/add", post(add_result))
        .route("/cni-result/del", post(del_result))
        .with_state(engine)
}
