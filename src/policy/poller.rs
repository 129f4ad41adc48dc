//! Periodic whitelist refresh from the policy server.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::client::PolicyServerClient;
use super::dynamic::DynamicPolicy;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Pulls whitelists for the currently registered groups and installs them
/// in the policy engine. A failed cycle is logged and the next tick tries
/// again; the poller only exits on cancellation.
pub struct Poller {
    poll_interval: Duration,
    engine: Arc<DynamicPolicy>,
    client: Arc<dyn PolicyServerClient>,
}

impl Poller {
    pub fn new(
        poll_interval: Duration,
        engine: Arc<DynamicPolicy>,
        client: Arc<dyn PolicyServerClient>,
    ) -> Self {
        Self {
            poll_interval,
            engine,
            client,
        }
    }

    pub async fn run(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(err) = self.sync_once().await {
                        warn!(error = %err, "whitelist poll failed");
                    }
                }
            }
        }
    }

    /// One poll cycle. Skips the round trip entirely while no endpoints
    /// are registered: the policy server has nothing to say about an
    /// empty host.
    pub async fn sync_once(&self) -> Result<()> {
        let groups = self.engine.get_groups();
        if groups.is_empty() {
            debug!("no registered groups, skipping poll");
            return Ok(());
        }

        let whitelists = self
            .client
            .get_whitelists(&groups)
            .await
            .context("fetching whitelists")?;
        debug!(groups = groups.len(), whitelists = whitelists.len(), "fetched whitelists");

        self.engine.set_whitelists(whitelists);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::models::{IngressWhitelist, Tag, TaggedGroup};
    use crate::policy::{Endpoint, LocalPolicy};
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    /// Records calls and replays a canned answer.
    struct FakeClient {
        calls: Mutex<Vec<Vec<String>>>,
        reply: Vec<IngressWhitelist>,
        fail: bool,
    }

    #[async_trait]
    impl PolicyServerClient for FakeClient {
        async fn get_whitelists(&self, group_ids: &[String]) -> anyhow::Result<Vec<IngressWhitelist>> {
            self.calls.lock().unwrap().push(group_ids.to_vec());
            if self.fail {
                anyhow::bail!("policy server unavailable");
            }
            Ok(self.reply.clone())
        }
    }

    fn engine_with_endpoint() -> Arc<DynamicPolicy> {
        let engine = Arc::new(DynamicPolicy::new(
            4,
            Ipv4Addr::new(10, 255, 0, 0),
            Tag::new(*b"ctrl"),
        ));
        engine.register(Endpoint {
            container_id: "container1".into(),
            group_id: "group1".into(),
            overlay_ip: Some(Ipv4Addr::new(10, 255, 32, 5)),
        });
        engine
    }

    #[tokio::test]
    async fn skips_the_server_when_no_groups_are_registered() {
        let engine = Arc::new(DynamicPolicy::new(
            4,
            Ipv4Addr::new(10, 255, 0, 0),
            Tag::new(*b"ctrl"),
        ));
        let client = Arc::new(FakeClient {
            calls: Mutex::new(Vec::new()),
            reply: Vec::new(),
            fail: false,
        });
        let trait_client: Arc<dyn PolicyServerClient> = Arc::clone(&client) as Arc<dyn PolicyServerClient>;
        let poller = Poller::new(DEFAULT_POLL_INTERVAL, engine, trait_client);

        poller.sync_once().await.unwrap();
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn installs_fetched_whitelists() {
        let engine = engine_with_endpoint();
        let client = Arc::new(FakeClient {
            calls: Mutex::new(Vec::new()),
            reply: vec![IngressWhitelist {
                destination: TaggedGroup {
                    id: "group1".into(),
                    tag: Tag::new(*b"atag"),
                },
                allowed_sources: vec![TaggedGroup {
                    id: "group3".into(),
                    tag: Tag::new(*b"ctag"),
                }],
            }],
            fail: false,
        });
        let trait_client: Arc<dyn PolicyServerClient> = Arc::clone(&client) as Arc<dyn PolicyServerClient>;
        let poller = Poller::new(
            DEFAULT_POLL_INTERVAL,
            Arc::clone(&engine),
            trait_client,
        );

        poller.sync_once().await.unwrap();

        assert_eq!(
            client.calls.lock().unwrap().as_slice(),
            &[vec!["group1".to_string()]]
        );
        assert_eq!(
            engine.get_source_tag(Ipv4Addr::new(10, 255, 32, 5)).unwrap(),
            Tag::new(*b"atag")
        );
        assert_eq!(
            engine.is_allowed(b"ctag", Ipv4Addr::new(10, 255, 32, 5)),
            Ok(true)
        );
    }

    #[tokio::test]
    async fn a_failed_fetch_leaves_the_index_alone() {
        let engine = engine_with_endpoint();
        engine.set_whitelists(vec![IngressWhitelist {
            destination: TaggedGroup {
                id: "group1".into(),
                tag: Tag::new(*b"atag"),
            },
            allowed_sources: Vec::new(),
        }]);

        let client = Arc::new(FakeClient {
            calls: Mutex::new(Vec::new()),
            reply: Vec::new(),
            fail: true,
        });
        let trait_client: Arc<dyn PolicyServerClient> = Arc::clone(&client) as Arc<dyn PolicyServerClient>;
        let poller = Poller::new(
            DEFAULT_POLL_INTERVAL,
            Arc::clone(&engine),
            trait_client,
        );

        assert!(poller.sync_once().await.is_err());
        // The previously installed index still answers.
        assert_eq!(
            engine.get_source_tag(Ipv4Addr::new(10, 255, 32, 5)).unwrap(),
            Tag::new(*b"atag")
        );
    }
}
