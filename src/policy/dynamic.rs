//! The dynamic policy engine: registered endpoints plus a whitelist index
//! rebuilt from the policy server's answers.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use tracing::{debug, info};

use super::models::{Endpoint, IngressWhitelist, Tag};
use super::{LocalPolicy, PolicyError};

/// Overlay address → whitelist governing that destination.
///
/// Materialized wholesale from the cross product of the endpoint set and
/// the whitelist set; never mutated in place, so a reader sees either the
/// previous index or the next one, never a half-built one.
type WhitelistIndex = HashMap<Ipv4Addr, IngressWhitelist>;

#[derive(Default)]
struct State {
    endpoints: Vec<Endpoint>,
    index: WhitelistIndex,
}

/// Tag issuance and ingress admission backed by runtime-announced
/// endpoints and poller-installed whitelists.
pub struct DynamicPolicy {
    tag_length: usize,
    tunnel_endpoint_ip: Ipv4Addr,
    control_tag: Tag,
    state: Mutex<State>,
}

impl DynamicPolicy {
    pub fn new(tag_length: usize, tunnel_endpoint_ip: Ipv4Addr, control_tag: Tag) -> Self {
        Self {
            tag_length,
            tunnel_endpoint_ip,
            control_tag,
            state: Mutex::new(State::default()),
        }
    }

    /// Record a local endpoint.
    ///
    /// The whitelist index is not rebuilt here: endpoint churn is frequent
    /// and whitelists may not have been fetched yet. The next
    /// [`set_whitelists`](Self::set_whitelists) folds the endpoint in.
    pub fn register(&self, endpoint: Endpoint) {
        let mut state = self.state.lock().expect("policy lock poisoned");
        debug!(container_id = %endpoint.container_id, group_id = %endpoint.group_id, "register endpoint");
        state.endpoints.push(endpoint);
    }

    /// Remove every endpoint with the given container id.
    pub fn deregister(&self, endpoint: &Endpoint) -> Result<(), PolicyError> {
        let mut state = self.state.lock().expect("policy lock poisoned");
        let before = state.endpoints.len();
        state
            .endpoints
            .retain(|e| e.container_id != endpoint.container_id);
        if state.endpoints.len() == before {
            return Err(PolicyError::UnknownContainer(endpoint.container_id.clone()));
        }
        debug!(container_id = %endpoint.container_id, removed = before - state.endpoints.len(), "deregister endpoint");
        Ok(())
    }

    /// Group ids of the current endpoints, in insertion order, duplicates
    /// preserved. This is what the poller sends to the policy server.
    pub fn get_groups(&self) -> Vec<String> {
        let state = self.state.lock().expect("policy lock poisoned");
        state.endpoints.iter().map(|e| e.group_id.clone()).collect()
    }

    /// Build a fresh index from `whitelists` and swap it in.
    pub fn set_whitelists(&self, whitelists: Vec<IngressWhitelist>) {
        let mut state = self.state.lock().expect("policy lock poisoned");

        let mut new_index = WhitelistIndex::new();
        for wl in whitelists {
            for ep in &state.endpoints {
                if ep.group_id != wl.destination.id {
                    continue;
                }
                if let Some(ip) = ep.overlay_ip {
                    new_index.insert(ip, wl.clone());
                }
            }
        }

        info!(entries = new_index.len(), "installed whitelist index");
        state.index = new_index;
    }
}

impl LocalPolicy for DynamicPolicy {
    fn tag_length(&self) -> usize {
        self.tag_length
    }

    fn get_source_tag(&self, local_source: Ipv4Addr) -> Result<Tag, PolicyError> {
        // Traffic sourced from the tunnel interface itself (ICMP liveness
        // and friends) is control-plane traffic.
        if local_source == self.tunnel_endpoint_ip {
            return Ok(self.control_tag.clone());
        }

        let state = self.state.lock().expect("policy lock poisoned");
        match state.index.get(&local_source) {
            Some(wl) => Ok(wl.destination.tag.clone()),
            None => {
                debug!(source = %local_source, "unknown local source");
                Err(PolicyError::UnknownLocalSource(local_source))
            }
        }
    }

    fn is_allowed(&self, remote_source_tag: &[u8], local_dest: Ipv4Addr) -> Result<bool, PolicyError> {
        if remote_source_tag.len() != self.tag_length {
            return Err(PolicyError::BadTagLength {
                got: remote_source_tag.len(),
                expected: self.tag_length,
            });
        }

        if remote_source_tag == self.control_tag.as_bytes() {
            debug!(dest = %local_dest, "allowed: control tag");
            return Ok(true);
        }

        if local_dest == self.tunnel_endpoint_ip {
            debug!("allowed: destination is the tunnel endpoint");
            return Ok(true);
        }

        let state = self.state.lock().expect("policy lock poisoned");
        let Some(whitelist) = state.index.get(&local_dest) else {
            // Default deny: a destination nobody whitelisted gets nothing.
            debug!(dest = %local_dest, "denied: unknown destination");
            return Ok(false);
        };

        let allowed = whitelist
            .allowed_sources
            .iter()
            .any(|src| src.tag.as_bytes() == remote_source_tag);
        debug!(dest = %local_dest, allowed, "admission decision");
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::models::TaggedGroup;

    fn engine() -> DynamicPolicy {
        DynamicPolicy::new(4, Ipv4Addr::new(1, 1, 1, 0), Tag::new(*b"MGMT"))
    }

    fn endpoint(container: &str, group: &str, ip: [u8; 4]) -> Endpoint {
        Endpoint {
            container_id: container.into(),
            group_id: group.into(),
            overlay_ip: Some(ip.into()),
        }
    }

    fn whitelist(dest: (&str, &[u8; 4]), sources: &[(&str, &[u8; 4])]) -> IngressWhitelist {
        IngressWhitelist {
            destination: TaggedGroup {
                id: dest.0.into(),
                tag: Tag::new(*dest.1),
            },
            allowed_sources: sources
                .iter()
                .map(|(id, tag)| TaggedGroup {
                    id: (*id).into(),
                    tag: Tag::new(**tag),
                })
                .collect(),
        }
    }

    /// S3 fixture: two endpoints, one whitelist covering group1.
    fn populated_engine() -> DynamicPolicy {
        let pol = engine();
        pol.register(endpoint("container1", "group1", [1, 1, 1, 1]));
        pol.register(endpoint("container2", "group2", [2, 2, 2, 2]));
        pol.set_whitelists(vec![whitelist(("group1", b"atag"), &[("group3", b"ctag")])]);
        pol
    }

    #[test]
    fn reports_configured_tag_length() {
        assert_eq!(engine().tag_length(), 4);
    }

    #[test]
    fn default_deny_with_no_state() {
        let pol = engine();
        assert_eq!(pol.is_allowed(b"fail", Ipv4Addr::new(2, 2, 2, 2)), Ok(false));
    }

    #[test]
    fn refuses_tag_for_unregistered_source() {
        let pol = engine();
        assert_eq!(
            pol.get_source_tag(Ipv4Addr::new(1, 1, 1, 1)),
            Err(PolicyError::UnknownLocalSource(Ipv4Addr::new(1, 1, 1, 1)))
        );
    }

    #[test]
    fn tunnel_endpoint_source_gets_the_control_tag() {
        let pol = engine();
        assert_eq!(
            pol.get_source_tag(Ipv4Addr::new(1, 1, 1, 0)).unwrap(),
            Tag::new(*b"MGMT")
        );
    }

    #[test]
    fn tunnel_endpoint_destination_is_always_allowed() {
        let pol = engine();
        assert_eq!(pol.is_allowed(b"????", Ipv4Addr::new(1, 1, 1, 0)), Ok(true));
    }

    #[test]
    fn control_tag_is_always_allowed() {
        let pol = populated_engine();
        assert_eq!(pol.is_allowed(b"MGMT", Ipv4Addr::new(4, 4, 4, 4)), Ok(true));
    }

    #[test]
    fn wrong_length_tag_is_an_error() {
        let pol = populated_engine();
        assert_eq!(
            pol.is_allowed(b"xxxxx", Ipv4Addr::new(1, 1, 1, 1)),
            Err(PolicyError::BadTagLength { got: 5, expected: 4 })
        );
    }

    #[test]
    fn whitelisted_source_reaches_its_destination_only() {
        let pol = populated_engine();
        // group3's tag may reach group1's endpoint...
        assert_eq!(pol.is_allowed(b"ctag", Ipv4Addr::new(1, 1, 1, 1)), Ok(true));
        // ...but not group2's, which has no whitelist.
        assert_eq!(pol.is_allowed(b"ctag", Ipv4Addr::new(2, 2, 2, 2)), Ok(false));
        // A tag outside the allowed set is denied even for group1.
        assert_eq!(pol.is_allowed(b"fail", Ipv4Addr::new(1, 1, 1, 1)), Ok(false));
    }

    #[test]
    fn source_tag_comes_from_the_destination_side_of_the_whitelist() {
        let pol = populated_engine();
        assert_eq!(
            pol.get_source_tag(Ipv4Addr::new(1, 1, 1, 1)).unwrap(),
            Tag::new(*b"atag")
        );
    }

    #[test]
    fn registration_alone_does_not_tag() {
        // Until whitelists arrive, registered endpoints have no tag.
        let pol = engine();
        pol.register(endpoint("container1", "group1", [1, 1, 1, 1]));
        assert_eq!(
            pol.get_source_tag(Ipv4Addr::new(1, 1, 1, 1)),
            Err(PolicyError::UnknownLocalSource(Ipv4Addr::new(1, 1, 1, 1)))
        );
    }

    #[test]
    fn groups_preserve_insertion_order_and_duplicates() {
        let pol = engine();
        pol.register(endpoint("a", "group1", [1, 1, 1, 1]));
        pol.register(endpoint("b", "group2", [2, 2, 2, 2]));
        pol.register(endpoint("c", "group1", [3, 3, 3, 3]));
        assert_eq!(pol.get_groups(), vec!["group1", "group2", "group1"]);
    }

    #[test]
    fn deregister_removes_all_endpoints_for_the_container() {
        let pol = populated_engine();
        pol.deregister(&Endpoint {
            container_id: "container1".into(),
            group_id: String::new(),
            overlay_ip: None,
        })
        .unwrap();
        assert_eq!(pol.get_groups(), vec!["group2"]);

        // A second deregistration of the same id has nothing to remove.
        let err = pol
            .deregister(&Endpoint {
                container_id: "container1".into(),
                group_id: String::new(),
                overlay_ip: None,
            })
            .unwrap_err();
        assert_eq!(err, PolicyError::UnknownContainer("container1".into()));
    }

    #[test]
    fn set_whitelists_replaces_rather_than_merges() {
        let pol = populated_engine();
        assert_eq!(pol.is_allowed(b"ctag", Ipv4Addr::new(1, 1, 1, 1)), Ok(true));

        // Install a whitelist set that no longer covers group1.
        pol.set_whitelists(vec![whitelist(("group2", b"btag"), &[("group3", b"ctag")])]);

        assert_eq!(pol.is_allowed(b"ctag", Ipv4Addr::new(1, 1, 1, 1)), Ok(false));
        assert_eq!(pol.is_allowed(b"ctag", Ipv4Addr::new(2, 2, 2, 2)), Ok(true));
    }

    #[test]
    fn concurrent_install_and_admission_never_tear() {
        use std::sync::Arc;

        let pol = Arc::new(populated_engine());
        let full = vec![
            whitelist(("group1", b"atag"), &[("group3", b"ctag")]),
            whitelist(("group2", b"btag"), &[("group3", b"ctag")]),
        ];

        std::thread::scope(|scope| {
            let writer = Arc::clone(&pol);
            let wl = full.clone();
            scope.spawn(move || {
                for _ in 0..500 {
                    writer.set_whitelists(wl.clone());
                    writer.set_whitelists(Vec::new());
                }
            });

            let reader = Arc::clone(&pol);
            scope.spawn(move || {
                for _ in 0..500 {
                    // Every call resolves against a complete index: a
                    // clean bool, never a panic or partial state.
                    reader.is_allowed(b"ctag", Ipv4Addr::new(1, 1, 1, 1)).unwrap();
                    // A tag outside every allowed set is denied no matter
                    // which index generation the call lands on.
                    let denied = reader.is_allowed(b"fail", Ipv4Addr::new(1, 1, 1, 1)).unwrap();
                    assert!(!denied, "an unlisted tag must never be admitted");
                }
            });
        });
    }
}
