//! Syncable record model

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Entity payload as an opaque field map.
///
/// The sync core never interprets values; conflict detection works on field
/// names plus the per-entity policies declared by the caller.
pub type FieldMap = BTreeMap<String, serde_json::Value>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Build an identifier, trimming whitespace and rejecting empty values.
            pub fn new(value: impl Into<String>) -> Result<Self> {
                let value = value.into();
                let value = value.trim();
                if value.is_empty() {
                    return Err(Error::InvalidInput(concat!($label, " must not be empty").into()));
                }
                Ok(Self(value.to_string()))
            }

            /// Rebuild an identifier read back from local storage
            #[allow(dead_code)]
            pub(crate) const fn from_storage(value: String) -> Self {
                Self(value)
            }

            /// Get the string representation of this identifier
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_id!(
    /// Tenant (restaurant account) identifier
    TenantId,
    "tenant id"
);
string_id!(
    /// Device identifier, used to key the per-device sync cursor
    DeviceId,
    "device id"
);
string_id!(
    /// Opaque actor (device or user) that produced a write
    ActorId,
    "actor id"
);

const MAX_ENTITY_TYPE_LEN: usize = 64;

/// `snake_case` ASCII: a lowercase letter, then lowercase letters, digits or `_`
fn is_valid_entity_type(value: &str) -> bool {
    let mut chars = value.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    value.len() <= MAX_ENTITY_TYPE_LEN
        && first.is_ascii_lowercase()
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Composite identity of a record: `(tenant_id, entity_type, entity_id)`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub tenant_id: TenantId,
    pub entity_type: String,
    pub entity_id: String,
}

impl RecordKey {
    /// Build a key, validating the entity type (`snake_case`) and entity id.
    pub fn new(
        tenant_id: TenantId,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
    ) -> Result<Self> {
        let entity_type = entity_type.into().trim().to_string();
        if !is_valid_entity_type(&entity_type) {
            return Err(Error::InvalidInput(format!(
                "entity type must be snake_case, got {entity_type:?}"
            )));
        }
        let entity_id = entity_id.into().trim().to_string();
        if entity_id.is_empty() {
            return Err(Error::InvalidInput("entity id must not be empty".into()));
        }
        Ok(Self {
            tenant_id,
            entity_type,
            entity_id,
        })
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.entity_type, self.entity_id)
    }
}

/// Record version.
///
/// Server-assigned versions start at 1; [`Version::PROVISIONAL`] marks a record
/// created locally that has never been acknowledged by the server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(pub i64);

impl Version {
    /// Sentinel for records that exist only locally
    pub const PROVISIONAL: Self = Self(0);

    /// The version following this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    /// Whether the server has ever acknowledged this version
    #[must_use]
    pub const fn is_provisional(self) -> bool {
        self.0 <= 0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// A versioned snapshot of one business entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub version: Version,
    /// Local-only: last version the server itself confirmed for this record.
    ///
    /// Differs from `version` after a local merge, which numbers the merged
    /// state ahead of the server. New operations are based on this version.
    #[serde(default)]
    pub server_version: Version,
    pub updated_by: ActorId,
    pub payload: FieldMap,
    /// Tombstone flag; deleted records are kept until garbage collection
    pub deleted: bool,
    /// False while a multi-writer conflict on this record awaits manual review
    pub conflict_resolved: bool,
    /// Local-only: unconfirmed local operations exist for this record
    #[serde(default)]
    pub dirty: bool,
    /// Local-only: when the tombstone was first stored (unix ms)
    #[serde(default)]
    pub tombstoned_at: Option<i64>,
    /// Local-only: last local write (unix ms)
    #[serde(default)]
    pub updated_at: i64,
}

impl Record {
    /// Create a live, clean record
    #[must_use]
    pub fn new(key: RecordKey, version: Version, updated_by: ActorId, payload: FieldMap) -> Self {
        Self {
            key,
            version,
            server_version: version,
            updated_by,
            payload,
            deleted: false,
            conflict_resolved: true,
            dirty: false,
            tombstoned_at: None,
            updated_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Mark this record as a tombstone
    #[must_use]
    pub fn into_tombstone(mut self) -> Self {
        self.deleted = true;
        self
    }

    /// Apply a field-level patch on top of the current payload
    pub fn apply_delta(&mut self, delta: &FieldMap) {
        for (field, value) in delta {
            self.payload.insert(field.clone(), value.clone());
        }
    }
}

/// Names of fields whose values differ between `before` and `after`,
/// including fields present on only one side.
#[must_use]
pub fn changed_fields(before: &FieldMap, after: &FieldMap) -> Vec<String> {
    let mut changed: Vec<String> = after
        .iter()
        .filter(|(field, value)| before.get(*field) != Some(*value))
        .map(|(field, _)| field.clone())
        .collect();
    changed.extend(
        before
            .keys()
            .filter(|field| !after.contains_key(*field))
            .cloned(),
    );
    changed.sort();
    changed
}
