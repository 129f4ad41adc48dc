//! Wire and in-memory models shared between the policy engine, the
//! endpoint registrar, and the policy-server client.

use std::fmt;
use std::net::Ipv4Addr;

use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Opaque fixed-length byte string identifying a group on the wire.
///
/// Tags travel through the policy-server JSON API base64-encoded; logs show
/// them as hex since the bytes are not guaranteed printable.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Tag(Vec<u8>);

impl Tag {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&[u8]> for Tag {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tag(")?;
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        write!(f, ")")
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Serialize for Tag {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Tag {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// A group with the tag the policy server assigned to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaggedGroup {
    pub id: String,
    pub tag: Tag,
}

/// Per-destination-group admission list: sources allowed to send to
/// members of `destination`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressWhitelist {
    pub destination: TaggedGroup,
    pub allowed_sources: Vec<TaggedGroup>,
}

/// A local container endpoint announced by the runtime.
///
/// `container_id` is the identity used for deregistration; `overlay_ip` can
/// be absent when the CNI result carried no address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub container_id: String,
    pub group_id: String,
    pub overlay_ip: Option<Ipv4Addr>,
}
