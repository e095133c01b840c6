//! Declarative firewall documents
//!
//! A [`FirewallSpec`] is what the operator wants; a [`FirewallStatus`] is the
//! last state confirmed from the kernel. Both serialize with the camelCase
//! field names the rest of the control plane uses.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One of the two security domains
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ZoneName {
    Trust,
    Untrust,
}

impl ZoneName {
    /// The zone on the other side of the pair
    pub const fn peer(self) -> Self {
        match self {
            ZoneName::Trust => ZoneName::Untrust,
            ZoneName::Untrust => ZoneName::Trust,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            ZoneName::Trust => "trust",
            ZoneName::Untrust => "untrust",
        }
    }
}

/// Default treatment of cross-zone traffic entering a zone
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum ZonePolicy {
    /// Only return traffic of flows opened from the other side
    #[serde(rename = "established-only")]
    #[strum(serialize = "established-only")]
    EstablishedOnly,
    #[serde(rename = "all-permit")]
    #[strum(serialize = "all-permit")]
    AllPermit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
    pub zone_policy: ZonePolicy,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_prefix_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interfaces: Vec<String>,
    /// `None` when the kernel policy could not be read back
    #[serde(default)]
    pub zone_policy: Option<ZonePolicy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allow_prefix_names: Vec<String>,
    #[serde(default)]
    pub created: bool,
}

impl ZoneStatus {
    /// Initial status mirrored from the spec before any kernel work.
    pub fn from_spec(spec: &ZoneSpec) -> Self {
        Self {
            interfaces: spec.interfaces.clone(),
            zone_policy: Some(spec.zone_policy),
            allow_prefix_names: spec.allow_prefix_names.clone(),
            created: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallSpec {
    #[serde(default)]
    pub zones: BTreeMap<ZoneName, ZoneSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallStatus {
    #[serde(default)]
    pub zones: BTreeMap<ZoneName, ZoneStatus>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extensions: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Named CIDR lists referenced by `allowPrefixNames`.
///
/// Names are matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixCatalog {
    #[serde(default)]
    pub lists: BTreeMap<String, Vec<String>>,
}

impl PrefixCatalog {
    pub fn insert(&mut self, name: &str, prefixes: Vec<String>) {
        self.lists.insert(name.to_lowercase(), prefixes);
    }

    pub fn get(&self, name: &str) -> Option<&[String]> {
        let key = name.to_lowercase();
        self.lists
            .get(&key)
            .or_else(|| {
                self.lists
                    .iter()
                    .find(|(k, _)| k.to_lowercase() == key)
                    .map(|(_, v)| v)
            })
            .map(Vec::as_slice)
    }
}

/// Desired kernel state for one zone, with prefix names already resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredZone {
    pub interfaces: BTreeSet<String>,
    pub policy: ZonePolicy,
    pub addresses: BTreeSet<String>,
}

impl DesiredZone {
    pub fn new(
        interfaces: impl IntoIterator<Item = impl Into<String>>,
        policy: ZonePolicy,
        addresses: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            interfaces: interfaces.into_iter().map(Into::into).collect(),
            policy,
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }
}

/// Kernel state for one zone as read back from the ruleset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ObservedZone {
    pub interfaces: BTreeSet<String>,
    pub policy: Option<ZonePolicy>,
    pub addresses: BTreeSet<String>,
}
