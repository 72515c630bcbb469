//! Resource documents kept in the datastore.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::tags::{deserialize_lenient, Tags};

/// A document the reservation logic can claim and release.
pub trait Resource: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name of the field that uniquely identifies the resource.
    const KEY_FIELD: &'static str;

    /// Value of the identity field.
    fn key(&self) -> &str;

    /// Capability tags used for request filtering.
    fn tags(&self) -> &Tags;

    /// Body sent on conditional updates.
    ///
    /// Only the fields reservation logic owns are written back so that
    /// curated data (nested tags, notes) survives a claim or release.
    fn patch(&self) -> serde_json::Value;
}

/// A resource as stored, with the datastore's identity and version token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record<R> {
    /// Datastore document ID.
    #[serde(rename = "_id")]
    pub id: String,
    /// Version token for conditional updates.
    #[serde(rename = "_etag")]
    pub etag: String,
    /// The document itself.
    #[serde(flatten)]
    pub resource: R,
}

/// Lifecycle state of a host.
///
/// Wire names are the ones the datastore schema allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostState {
    /// Free for reservation.
    #[serde(rename = "idle")]
    Idle,
    /// Claimed and network-booting.
    #[serde(rename = "pxe")]
    Booting,
    /// Verified installed and handed to its owner.
    #[serde(rename = "in_use")]
    InUse,
    /// Reachable or not, the installation did not happen.
    #[serde(rename = "pxe_failed")]
    BootFailed,
    /// Unreachable before the install could even be triggered.
    #[serde(rename = "needs_repair")]
    NeedsRepair,
}

impl HostState {
    /// Wire name of the state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Booting => "pxe",
            Self::InUse => "in_use",
            Self::BootFailed => "pxe_failed",
            Self::NeedsRepair => "needs_repair",
        }
    }

    /// Whether a requester holds the host in this state.
    #[must_use]
    pub fn is_held(self) -> bool {
        matches!(self, Self::Booting | Self::InUse)
    }

    /// Whether the host is out of the pool until someone repairs it.
    #[must_use]
    pub fn is_quarantined(self) -> bool {
        matches!(self, Self::BootFailed | Self::NeedsRepair)
    }
}

impl fmt::Display for HostState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A bare metal (or VM) host in the pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostResource {
    /// Stable identity.
    pub hostname: String,
    /// Requester holding the host; empty when nobody does.
    #[serde(default)]
    pub owner: String,
    /// Current lifecycle state.
    pub state: HostState,
    /// Job the host is reserved for; empty when nobody holds it.
    #[serde(default)]
    pub job_id: String,
    /// Capability tags.
    #[serde(
        default,
        deserialize_with = "deserialize_lenient",
        skip_serializing_if = "Tags::is_empty"
    )]
    pub tags: Tags,
}

impl HostResource {
    /// Create an idle, untagged host.
    #[must_use]
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            owner: String::new(),
            state: HostState::Idle,
            job_id: String::new(),
            tags: Tags::new(),
        }
    }

    /// Attach tags.
    #[must_use]
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags = tags;
        self
    }

    /// Claim the host for a requester and mark it booting.
    pub fn claim(&mut self, owner: &str, job_id: &str) {
        self.owner = owner.to_string();
        self.job_id = job_id.to_string();
        self.state = HostState::Booting;
    }

    /// Return the host to the pool.
    pub fn release(&mut self) {
        self.owner.clear();
        self.job_id.clear();
        self.state = HostState::Idle;
    }

    /// Take the host out of the pool in a failure state.
    ///
    /// The requester lets go of it, so a later release of the job does not
    /// put a broken host back into circulation.
    pub fn quarantine(&mut self, state: HostState) {
        self.owner.clear();
        self.job_id.clear();
        self.state = state;
    }

    /// Whether the host is held by the given job.
    #[must_use]
    pub fn is_held_by(&self, job_id: &str) -> bool {
        self.state.is_held() && self.job_id == job_id
    }
}

impl Resource for HostResource {
    const KEY_FIELD: &'static str = "hostname";

    fn key(&self) -> &str {
        &self.hostname
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn patch(&self) -> serde_json::Value {
        json!({
            "owner": self.owner,
            "state": self.state,
            "job_id": self.job_id,
        })
    }
}

/// A public or private IP address in a pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddressResource {
    /// Stable identity.
    pub address: String,
    /// Requester holding the address; empty when unowned.
    #[serde(default)]
    pub owner: String,
    /// Capability tags (network, VLAN, ...).
    #[serde(
        default,
        deserialize_with = "deserialize_lenient",
        skip_serializing_if = "Tags::is_empty"
    )]
    pub tags: Tags,
}

impl AddressResource {
    /// Create an unowned address.
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            owner: String::new(),
            tags: Tags::new(),
        }
    }

    /// Whether anybody owns the address.
    #[must_use]
    pub fn is_owned(&self) -> bool {
        !self.owner.is_empty()
    }
}

impl Resource for AddressResource {
    const KEY_FIELD: &'static str = "address";

    fn key(&self) -> &str {
        &self.address
    }

    fn tags(&self) -> &Tags {
        &self.tags
    }

    fn patch(&self) -> serde_json::Value {
        json!({ "owner": self.owner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_state_wire_names() {
        assert_eq!(serde_json::to_string(&HostState::Booting).unwrap(), "\"pxe\"");
        assert_eq!(
            serde_json::from_str::<HostState>("\"needs_repair\"").unwrap(),
            HostState::NeedsRepair
        );
        assert_eq!(HostState::BootFailed.to_string(), "pxe_failed");
    }

    #[test]
    fn test_claim_release_cycle() {
        let mut host = HostResource::new("a-01.qa");
        host.claim("qa", "job-1");
        assert_eq!(host.state, HostState::Booting);
        assert!(host.is_held_by("job-1"));
        assert!(!host.is_held_by("job-2"));

        host.release();
        assert_eq!(host.state, HostState::Idle);
        assert!(host.owner.is_empty());
        assert!(host.job_id.is_empty());
    }

    #[test]
    fn test_quarantine_drops_owner() {
        let mut host = HostResource::new("a-01.qa");
        host.claim("qa", "job-1");
        host.quarantine(HostState::BootFailed);
        assert_eq!(host.state, HostState::BootFailed);
        assert!(host.owner.is_empty());
        assert!(!host.is_held_by("job-1"));
    }

    #[test]
    fn test_record_decodes_eve_document() {
        let record: Record<HostResource> = serde_json::from_str(
            r#"{"_id": "5f1", "_etag": "abc", "_updated": "Thu, 01 Jan 1970 00:00:00 GMT",
                "hostname": "g-01-02.qa", "state": "idle",
                "tags": {"memory": 8589934592, "interfaces": [{"ratembps": 1000}]}}"#,
        )
        .unwrap();
        assert_eq!(record.id, "5f1");
        assert_eq!(record.etag, "abc");
        assert_eq!(record.resource.hostname, "g-01-02.qa");
        assert!(record.resource.owner.is_empty());
        assert_eq!(record.resource.tags.len(), 1);
    }

    #[test]
    fn test_patch_only_carries_owned_fields() {
        let mut host = HostResource::new("a-01.qa");
        host.claim("qa", "job-1");
        let patch = host.patch();
        assert_eq!(patch["state"], "pxe");
        assert_eq!(patch["owner"], "qa");
        assert!(patch.get("tags").is_none());
        assert!(patch.get("hostname").is_none());
    }
}
