//! Data model: data-plane instances, capability tags and transfer requests

use crate::error::{Result, SelectorError};
use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Property holding the secret-store key of an instance's auth token
pub const PROPERTY_AUTH_KEY: &str = "auth_key";

/// A capability tag: a source type, destination type or transfer type
/// (e.g. `HttpData`, `AmazonS3`, `HttpData-PUSH`).
///
/// Tags are compared by exact string equality after trimming surrounding
/// whitespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TypeTag(String);

impl TypeTag {
    /// Create a new tag, trimming surrounding whitespace
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_string())
    }

    /// The tag as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the tag is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TypeTag {
    fn from(value: &str) -> Self {
        TypeTag::new(value)
    }
}

impl From<String> for TypeTag {
    fn from(value: String) -> Self {
        TypeTag::new(value)
    }
}

/// Unique identifier of a data-plane instance
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(value: &str) -> Self {
        InstanceId(value.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(value: String) -> Self {
        InstanceId(value)
    }
}

/// Unique identifier of a tracked transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generate a fresh random transfer id
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TransferId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A registered data-plane runtime and its declared capabilities.
///
/// The registry owns the authoritative copy; every other component works on
/// cloned snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPlaneInstance {
    /// Unique identifier
    pub id: InstanceId,

    /// Endpoint of the runtime (informational; never contacted by the selector)
    #[serde(default)]
    pub url: Option<String>,

    /// Source types this instance can read from
    #[serde(default)]
    pub source_types: BTreeSet<TypeTag>,

    /// Destination types this instance can write to
    #[serde(default)]
    pub destination_types: BTreeSet<TypeTag>,

    /// Transfer types (flow variants) this instance supports
    #[serde(default)]
    pub transfer_types: BTreeSet<TypeTag>,

    /// Named properties: capacity hints, allowed destinations, auth key
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    /// Most recent heartbeat
    pub last_heartbeat: DateTime<Utc>,

    /// How many times this instance has been selected
    #[serde(default)]
    pub turn_count: u64,

    /// When this instance was last selected
    #[serde(default)]
    pub last_selected: Option<DateTime<Utc>>,
}

impl DataPlaneInstance {
    /// Create an instance with no capabilities.
    ///
    /// The heartbeat is stamped again by the registry on registration.
    pub fn new(id: impl Into<InstanceId>) -> Self {
        Self {
            id: id.into(),
            url: None,
            source_types: BTreeSet::new(),
            destination_types: BTreeSet::new(),
            transfer_types: BTreeSet::new(),
            properties: BTreeMap::new(),
            last_heartbeat: DateTime::<Utc>::UNIX_EPOCH,
            turn_count: 0,
            last_selected: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_source_type(mut self, tag: impl Into<TypeTag>) -> Self {
        self.source_types.insert(tag.into());
        self
    }

    pub fn with_destination_type(mut self, tag: impl Into<TypeTag>) -> Self {
        self.destination_types.insert(tag.into());
        self
    }

    pub fn with_transfer_type(mut self, tag: impl Into<TypeTag>) -> Self {
        self.transfer_types.insert(tag.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Whether all three capability dimensions contain the requested tags
    pub fn can_handle(
        &self,
        source_type: &TypeTag,
        destination_type: &TypeTag,
        transfer_type: &TypeTag,
    ) -> bool {
        self.source_types.contains(source_type)
            && self.destination_types.contains(destination_type)
            && self.transfer_types.contains(transfer_type)
    }

    /// Liveness at `now`: the last heartbeat is at most `window` old.
    ///
    /// A heartbeat stamped in the future counts as live.
    pub fn is_live(&self, now: DateTime<Utc>, window: Duration) -> bool {
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.last_heartbeat) <= window
    }

    /// Look up a named property
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Key under which per-route state (e.g. the round-robin cursor) is kept
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SelectionKey {
    pub source_type: TypeTag,
    pub destination_type: TypeTag,
    pub transfer_type: TypeTag,
}

impl fmt::Display for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}->{}/{}",
            self.source_type, self.destination_type, self.transfer_type
        )
    }
}

/// A request to move data, submitted to the selector.
///
/// Immutable once submitted: the tracker stores its own copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_type: TypeTag,
    pub destination_type: TypeTag,
    pub transfer_type: TypeTag,

    /// Explicit target instance; bypasses the selection strategy
    #[serde(default)]
    pub instance_hint: Option<InstanceId>,

    /// Name of the selection strategy to use instead of the default
    #[serde(default)]
    pub strategy: Option<String>,
}

impl TransferRequest {
    pub fn new(
        source_type: impl Into<TypeTag>,
        destination_type: impl Into<TypeTag>,
        transfer_type: impl Into<TypeTag>,
    ) -> Self {
        Self {
            source_type: source_type.into(),
            destination_type: destination_type.into(),
            transfer_type: transfer_type.into(),
            instance_hint: None,
            strategy: None,
        }
    }

    pub fn with_hint(mut self, instance: impl Into<InstanceId>) -> Self {
        self.instance_hint = Some(instance.into());
        self
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    /// Reject requests with empty fields
    pub fn validate(&self) -> Result<()> {
        if self.source_type.is_empty() {
            return Err(SelectorError::invalid_request("source type is empty"));
        }
        if self.destination_type.is_empty() {
            return Err(SelectorError::invalid_request("destination type is empty"));
        }
        if self.transfer_type.is_empty() {
            return Err(SelectorError::invalid_request("transfer type is empty"));
        }
        if matches!(&self.instance_hint, Some(hint) if hint.is_empty()) {
            return Err(SelectorError::invalid_request("instance hint is empty"));
        }
        if matches!(&self.strategy, Some(name) if name.trim().is_empty()) {
            return Err(SelectorError::invalid_request("strategy name is empty"));
        }
        Ok(())
    }

    /// The routing key of this request
    pub fn key(&self) -> SelectionKey {
        SelectionKey {
            source_type: self.source_type.clone(),
            destination_type: self.destination_type.clone(),
            transfer_type: self.transfer_type.clone(),
        }
    }
}
