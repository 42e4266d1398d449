//! Tenant identity carried by every record, message and operation.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Unique identifier of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(Uuid);

impl TenantId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tenant: one game region running one client version.
///
/// Equality is by all four fields. The header text form is
/// `UUID|region|major|minor`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    id: TenantId,
    region: String,
    major_version: u16,
    minor_version: u16,
}

/// Errors from parsing the tenant header text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TenantParseError {
    #[error("tenant header must have 4 '|'-separated fields, found {0}")]
    FieldCount(usize),

    #[error("invalid tenant id: {0}")]
    Id(String),

    #[error("tenant region must not be empty")]
    EmptyRegion,

    #[error("invalid {field} version: {value}")]
    Version { field: &'static str, value: String },
}

impl Tenant {
    pub fn new(
        id: TenantId,
        region: impl Into<String>,
        major_version: u16,
        minor_version: u16,
    ) -> Self {
        Self {
            id,
            region: region.into(),
            major_version,
            minor_version,
        }
    }

    pub fn id(&self) -> TenantId {
        self.id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn major_version(&self) -> u16 {
        self.major_version
    }

    pub fn minor_version(&self) -> u16 {
        self.minor_version
    }

    /// Encodes the tenant as header text.
    pub fn to_header(&self) -> String {
        self.to_string()
    }

    /// Decodes the tenant from header text.
    pub fn from_header(value: &str) -> Result<Self, TenantParseError> {
        value.parse()
    }
}

impl std::fmt::Display for Tenant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{}|{}",
            self.id, self.region, self.major_version, self.minor_version
        )
    }
}

impl FromStr for Tenant {
    type Err = TenantParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('|').collect();
        if parts.len() != 4 {
            return Err(TenantParseError::FieldCount(parts.len()));
        }

        let id = Uuid::parse_str(parts[0])
            .map(TenantId::from_uuid)
            .map_err(|_| TenantParseError::Id(parts[0].to_string()))?;

        if parts[1].is_empty() {
            return Err(TenantParseError::EmptyRegion);
        }

        let major = parts[2]
            .parse()
            .map_err(|_| TenantParseError::Version {
                field: "major",
                value: parts[2].to_string(),
            })?;
        let minor = parts[3]
            .parse()
            .map_err(|_| TenantParseError::Version {
                field: "minor",
                value: parts[3].to_string(),
            })?;

        Ok(Tenant::new(id, parts[1], major, minor))
    }
}
