//! Client for the external policy server.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use super::models::IngressWhitelist;

/// What the poller needs from a policy server: the ingress whitelists for
/// a set of destination groups. Errors propagate transparently; the poller
/// decides what to do with them.
#[async_trait]
pub trait PolicyServerClient: Send + Sync {
    async fn get_whitelists(&self, group_ids: &[String]) -> Result<Vec<IngressWhitelist>>;
}

#[derive(Deserialize)]
struct WhitelistsResponse {
    whitelists: Vec<IngressWhitelist>,
}

/// HTTP implementation speaking to `GET {base}/whitelists?groups=a,b`.
pub struct HttpPolicyClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpPolicyClient {
    /// `timeout` bounds the whole request, connect included, so a stalled
    /// policy server can never wedge a poll cycle.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::ClientBuilder::new()
            .connect_timeout(timeout)
            .timeout(timeout)
            .build()
            .context("building policy-server http client")?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }
}

#[async_trait]
impl PolicyServerClient for HttpPolicyClient {
    async fn get_whitelists(&self, group_ids: &[String]) -> Result<Vec<IngressWhitelist>> {
        let url = format!("{}/whitelists", self.base_url.trim_end_matches('/'));
        let response = self
            .http
            .get(&url)
            .query(&[("groups", group_ids.join(","))])
            .send()
            .await
            .with_context(|| format!("requesting whitelists from {url}"))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("policy server returned {status} for {url}");
        }

        let body: WhitelistsResponse = response
            .json()
            .await
            .context("decoding whitelists response")?;
        Ok(body.whitelists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::models::{Tag, TaggedGroup};

    #[test]
    fn response_body_decodes() {
        let wl = IngressWhitelist {
            destination: TaggedGroup {
                id: "group1".into(),
                tag: Tag::new(*b"atag"),
            },
            allowed_sources: vec![TaggedGroup {
                id: "group3".into(),
                tag: Tag::new(*b"ctag"),
            }],
        };
        let body = serde_json::json!({ "whitelists": [wl.clone()] }).to_string();
        let decoded: WhitelistsResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(decoded.whitelists, vec![wl]);
    }
}
