//! Single-tag policy for deployments without a policy server: every local
//! source carries the one configured tag and only that tag is admitted.

use std::net::Ipv4Addr;

use super::models::Tag;
use super::{LocalPolicy, PolicyError};

pub struct FixedPolicy {
    tag: Tag,
}

impl FixedPolicy {
    pub fn new(tag: Tag) -> Self {
        Self { tag }
    }
}

impl LocalPolicy for FixedPolicy {
    fn tag_length(&self) -> usize {
        self.tag.len()
    }

    fn get_source_tag(&self, _local_source: Ipv4Addr) -> Result<Tag, PolicyError> {
        Ok(self.tag.clone())
    }

    fn is_allowed(&self, remote_source_tag: &[u8], _local_dest: Ipv4Addr) -> Result<bool, PolicyError> {
        if remote_source_tag.len() != self.tag.len() {
            return Err(PolicyError::BadTagLength {
                got: remote_source_tag.len(),
                expected: self.tag.len(),
            });
        }
        Ok(remote_source_tag == self.tag.as_bytes())
    }
}
