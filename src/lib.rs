//! weft - a host-resident datapath for a UDP-encapsulated L3 overlay.
//!
//! Each host in the fabric runs one `weftd`. Containers get addresses out of
//! a per-host subnet carved from a shared overlay network; packets leaving a
//! container are read from a local TUN device, resolved against the
//! forwarding database, and shipped to the owning host inside a single UDP
//! datagram. Inbound datagrams are written back to the TUN verbatim.
//!
//! The crate is organized around the datapath and its control surfaces:
//!
//! - [`fdb`] - the overlay-subnet → underlay-endpoint forwarding database
//! - [`tunnel`] - the TUN device plus the egress/ingress forwarding workers
//!   and the subnet-lease reactor
//! - [`policy`] - source tagging and ingress admission, the endpoint
//!   registrar HTTP surface, and the whitelist poller
//! - [`subnet`] - the lease source contract the reactor consumes
//! - [`backend`] - wiring: config → lease → running network

pub mod backend;
pub mod config;
pub mod fdb;
pub mod packet;
pub mod policy;
pub mod subnet;
pub mod tunnel;

pub use backend::{Backend, ExternalInterface};
pub use config::BackendConfig;
pub use fdb::{FdbError, ForwardingDb};
