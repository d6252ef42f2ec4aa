// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decides what a cluster compatibility version allows: which descriptor
//! dialect its hosts understand and which version-gated features may be used.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmbroker_api_types::ClusterVersion;

/// The format a host agent consumes VM descriptors in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Dialect {
    /// A single structured document.
    Unified,
    /// A flat attribute map.
    Legacy,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Dialect::Unified => "unified",
            Dialect::Legacy => "legacy",
        })
    }
}

/// Capabilities that only some cluster versions provide.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Deserialize,
    Serialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    UnifiedDescriptor,
    GuestNuma,
    HostDevicePassthrough,
    VnicPassthrough,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("cluster compatibility version {0} is not supported")]
pub struct UnsupportedVersionError(pub ClusterVersion);

/// Answers feature questions for cluster versions.
///
/// Implementations must be pure: the same version and feature always get the
/// same answer for the lifetime of the implementation.
pub trait FeatureSupport: Send + Sync {
    fn is_supported_version(&self, version: ClusterVersion) -> bool;

    /// Returns true if `feature` is usable at `version`. Unsupported versions
    /// support nothing.
    fn supports(&self, version: ClusterVersion, feature: Feature) -> bool;
}

/// A table of supported versions and the minimum version of each feature.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct FeatureMatrix {
    pub supported_versions: BTreeSet<ClusterVersion>,

    /// Features missing from this map are not available at any version.
    pub minimum_versions: BTreeMap<Feature, ClusterVersion>,
}

impl Default for FeatureMatrix {
    fn default() -> Self {
        Self {
            supported_versions: (0..=7)
                .map(|minor| ClusterVersion::new(4, minor))
                .collect(),
            minimum_versions: [
                (Feature::UnifiedDescriptor, ClusterVersion::new(4, 2)),
                (Feature::GuestNuma, ClusterVersion::new(4, 0)),
                (Feature::HostDevicePassthrough, ClusterVersion::new(4, 1)),
                (Feature::VnicPassthrough, ClusterVersion::new(4, 1)),
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl FeatureSupport for FeatureMatrix {
    fn is_supported_version(&self, version: ClusterVersion) -> bool {
        self.supported_versions.contains(&version)
    }

    fn supports(&self, version: ClusterVersion, feature: Feature) -> bool {
        self.is_supported_version(version)
            && self
                .minimum_versions
                .get(&feature)
                .is_some_and(|min| version >= *min)
    }
}

/// Picks the descriptor dialect for hosts of a cluster at `version`.
pub fn resolve_dialect(
    features: &dyn FeatureSupport,
    version: ClusterVersion,
) -> Result<Dialect, UnsupportedVersionError> {
    if !features.is_supported_version(version) {
        return Err(UnsupportedVersionError(version));
    }

    if features.supports(version, Feature::UnifiedDescriptor) {
        Ok(Dialect::Unified)
    } else {
        Ok(Dialect::Legacy)
    }
}
