// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fundamental types shared by the vmbroker crates.
//!
//! These types appear both in the broker's internal VM model and on the wire
//! to host agents, so they live in their own crate to let the core library,
//! the API types, the client, and the mock agent share them without any
//! layering oddities.

use std::fmt::Display;
use std::str::FromStr;

use schemars::{gen::SchemaGenerator, schema::Schema, JsonSchema};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

const PCI_DEVICES_PER_BUS: u8 = 32;
const PCI_FUNCTIONS_PER_DEVICE: u8 = 8;

/// Errors produced when parsing or constructing the types in this crate.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("PCI device {0} outside range of 0-31")]
    PciDeviceOutOfRange(u8),

    #[error("PCI function {0} outside range of 0-7")]
    PciFunctionOutOfRange(u8),

    #[error("expected {expected} dot-separated fields in {input:?}")]
    FieldCount { input: String, expected: usize },

    #[error("invalid numeric field {field:?} in {input:?}")]
    InvalidField { input: String, field: String },
}

/// Splits `s` on '.' and parses exactly `N` numeric fields out of it.
fn parse_fields<T: FromStr + Copy + Default, const N: usize>(
    s: &str,
) -> Result<[T; N], ParseError> {
    let mut out = [T::default(); N];
    let mut count = 0;
    for field in s.split('.') {
        if count == N {
            return Err(ParseError::FieldCount {
                input: s.to_owned(),
                expected: N,
            });
        }

        out[count] = field.parse().map_err(|_| ParseError::InvalidField {
            input: s.to_owned(),
            field: field.to_owned(),
        })?;
        count += 1;
    }

    if count != N {
        return Err(ParseError::FieldCount { input: s.to_owned(), expected: N });
    }

    Ok(out)
}

/// Implements string (de)serialization and a string JSON schema for a type
/// that already implements `Display` and `FromStr`.
macro_rules! string_encoded {
    ($ty:ident) => {
        impl Serialize for $ty {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.collect_str(self)
            }
        }

        impl<'d> Deserialize<'d> for $ty {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: Deserializer<'d>,
            {
                let s = String::deserialize(deserializer)?;
                FromStr::from_str(&s).map_err(de::Error::custom)
            }
        }

        impl JsonSchema for $ty {
            fn schema_name() -> String {
                stringify!($ty).to_string()
            }

            fn json_schema(gen: &mut SchemaGenerator) -> Schema {
                String::json_schema(gen)
            }
        }
    };
}

/// A PCI bus/device/function tuple. Supports conversion from a string formatted
/// as "B.D.F", e.g. "0.7.0".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PciPath {
    bus: u8,
    device: u8,
    function: u8,
}

impl PciPath {
    pub fn new(bus: u8, device: u8, function: u8) -> Result<Self, ParseError> {
        if device >= PCI_DEVICES_PER_BUS {
            return Err(ParseError::PciDeviceOutOfRange(device));
        }

        if function >= PCI_FUNCTIONS_PER_DEVICE {
            return Err(ParseError::PciFunctionOutOfRange(function));
        }

        Ok(Self { bus, device, function })
    }

    #[inline]
    pub fn bus(&self) -> u8 {
        self.bus
    }

    #[inline]
    pub fn device(&self) -> u8 {
        self.device
    }

    #[inline]
    pub fn function(&self) -> u8 {
        self.function
    }
}

impl FromStr for PciPath {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [bus, device, function] = parse_fields::<u8, 3>(s)?;
        Self::new(bus, device, function)
    }
}

impl Display for PciPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.bus, self.device, self.function)
    }
}

string_encoded!(PciPath);

/// The compatibility level of the cluster a VM belongs to, e.g. "4.2".
///
/// Versions order lexicographically by (major, minor). Any pair of numbers is
/// representable; whether a given version is actually supported is decided by
/// the broker's feature compatibility resolver, not by this type.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ClusterVersion {
    pub major: u16,
    pub minor: u16,
}

impl ClusterVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

impl FromStr for ClusterVersion {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let [major, minor] = parse_fields::<u16, 2>(s)?;
        Ok(Self { major, minor })
    }
}

impl Display for ClusterVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

string_encoded!(ClusterVersion);

/// A controller bus that addresses drives by unit number rather than by PCI
/// path.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Debug,
    Deserialize,
    Serialize,
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum DriveBus {
    Ide,
    Sata,
    Scsi,
    Fdc,
}

impl DriveBus {
    /// The number of drive units a single controller of this kind exposes.
    pub const fn units(&self) -> u8 {
        match self {
            // Two channels with a master and a slave each.
            DriveBus::Ide => 4,
            DriveBus::Sata => 6,
            DriveBus::Scsi => 255,
            DriveBus::Fdc => 2,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            DriveBus::Ide => "ide",
            DriveBus::Sata => "sata",
            DriveBus::Scsi => "scsi",
            DriveBus::Fdc => "fdc",
        }
    }
}

impl Display for DriveBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
