//! Source tagging and ingress admission.
//!
//! Every local source gets a short opaque tag; remote traffic is admitted
//! against tag-keyed whitelists fetched from an external policy server.
//! [`DynamicPolicy`] is the full engine; [`FixedPolicy`] serves deployments
//! where one shared tag is enough.

mod client;
mod dynamic;
mod fixed;
mod models;
mod poller;
mod registrar;

use std::net::Ipv4Addr;

use thiserror::Error;

pub use client::{HttpPolicyClient, PolicyServerClient};
pub use dynamic::DynamicPolicy;
pub use fixed::FixedPolicy;
pub use models::{Endpoint, IngressWhitelist, Tag, TaggedGroup};
pub use poller::{Poller, DEFAULT_POLL_INTERVAL};
pub use registrar::Registrar;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PolicyError {
    /// The source address is neither the tunnel endpoint nor a registered,
    /// whitelisted endpoint.
    #[error("unknown local source {0}")]
    UnknownLocalSource(Ipv4Addr),

    /// A tag of the wrong length can never match; reject it outright
    /// rather than defaulting to deny so senders see the misconfiguration.
    #[error("bad tag length: got {got}, expected {expected}")]
    BadTagLength { got: usize, expected: usize },

    /// Deregistration named a container id with no registered endpoints.
    #[error("no endpoint found to remove, missing container id {0}")]
    UnknownContainer(String),
}

/// Admission-control surface consumed by the datapath.
pub trait LocalPolicy: Send + Sync {
    /// Length every tag on this host must have.
    fn tag_length(&self) -> usize;

    /// Tag to stamp on traffic originating from `local_source`.
    fn get_source_tag(&self, local_source: Ipv4Addr) -> Result<Tag, PolicyError>;

    /// Whether a packet carrying `remote_source_tag` may be delivered to
    /// `local_dest`.
    fn is_allowed(&self, remote_source_tag: &[u8], local_dest: Ipv4Addr) -> Result<bool, PolicyError>;
}
