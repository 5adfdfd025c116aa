//! Package kinds and identities.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UpdateError;

/// Kind of installable unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageKind {
    /// The core platform
    Core,
    /// An extension (plugin)
    Extension,
    /// A theme
    Theme,
}

impl PackageKind {
    pub const ALL: [PackageKind; 3] = [PackageKind::Core, PackageKind::Extension, PackageKind::Theme];

    /// Name used in channel requests, the transparency log, and the
    /// installation-state table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "core",
            Self::Extension => "extension",
            Self::Theme => "theme",
        }
    }

    /// File extension of downloaded packages of this kind.
    pub fn file_extension(&self) -> &'static str {
        match self {
            Self::Core => "zip",
            Self::Extension => "pkg",
            Self::Theme => "zip",
        }
    }
}

impl fmt::Display for PackageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageKind {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "core" => Ok(Self::Core),
            "extension" => Ok(Self::Extension),
            "theme" => Ok(Self::Theme),
            other => Err(UpdateError::ConfigError(format!("unknown package kind: {}", other))),
        }
    }
}

/// The (kind, supplier, name) triple identifying an installable unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageIdentity {
    pub kind: PackageKind,
    pub supplier: String,
    pub name: String,
}

impl PackageIdentity {
    pub fn new(kind: PackageKind, supplier: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            supplier: supplier.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PackageIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.kind, self.supplier, self.name)
    }
}
