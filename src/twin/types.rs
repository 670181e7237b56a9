//! Twin data types
//!
//! Defines the twin document, section patches and the events fanned out
//! to connected devices:
//! - `Twin` with independently versioned reported/desired sections
//! - `Patch` targeting one section, where JSON `null` is the delete-marker
//! - `ExpectedVersion` for optimistic concurrency on desired updates

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, TwinError};

/// Property bag of one twin section
pub type Properties = Map<String, Value>;

/// Which half of the twin a patch targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Section {
    /// Authored by the device
    Reported,
    /// Authored by the service
    Desired,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Reported => f.write_str("reported"),
            Section::Desired => f.write_str("desired"),
        }
    }
}

/// Authoritative twin document for one device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Twin {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    #[serde(rename = "reportedVersion")]
    pub reported_version: u64,
    #[serde(rename = "desiredVersion")]
    pub desired_version: u64,
    pub reported: Properties,
    pub desired: Properties,
    #[serde(rename = "reportedUpdatedAt", skip_serializing_if = "Option::is_none")]
    pub reported_updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "desiredUpdatedAt", skip_serializing_if = "Option::is_none")]
    pub desired_updated_at: Option<DateTime<Utc>>,
}

impl Twin {
    /// Empty twin at version 0 for both sections
    pub fn new(device_id: &str) -> Self {
        Self {
            device_id: device_id.to_string(),
            reported_version: 0,
            desired_version: 0,
            reported: Properties::new(),
            desired: Properties::new(),
            reported_updated_at: None,
            desired_updated_at: None,
        }
    }

    pub fn version(&self, section: Section) -> u64 {
        match section {
            Section::Reported => self.reported_version,
            Section::Desired => self.desired_version,
        }
    }

    pub fn properties(&self, section: Section) -> &Properties {
        match section {
            Section::Reported => &self.reported,
            Section::Desired => &self.desired,
        }
    }
}

/// Partial update to one twin section, applied atomically
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(rename = "targetSection")]
    pub section: Section,
    pub entries: Properties,
}

impl Patch {
    pub fn new(section: Section) -> Self {
        Self {
            section,
            entries: Properties::new(),
        }
    }

    pub fn reported() -> Self {
        Self::new(Section::Reported)
    }

    pub fn desired() -> Self {
        Self::new(Section::Desired)
    }

    /// Build a patch from a wire document, which must be a JSON object
    pub fn from_value(section: Section, value: Value) -> Result<Self> {
        match value {
            Value::Object(entries) => Ok(Self { section, entries }),
            other => Err(TwinError::BadRequest(format!(
                "{} patch must be a JSON object, got {}",
                section,
                json_kind(&other)
            ))),
        }
    }

    /// Set or overwrite a key
    pub fn set(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Remove a key when applied
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.entries.insert(key.into(), Value::Null);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn expect_section(&self, section: Section) -> Result<()> {
        if self.section == section {
            Ok(())
        } else {
            Err(TwinError::BadRequest(format!(
                "expected a {} patch, got a {} patch",
                section, self.section
            )))
        }
    }
}

/// Optimistic concurrency guard for desired updates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedVersion {
    /// `*`: apply unconditionally
    Any,
    /// Apply only if the desired version still matches
    Exact(u64),
}

impl FromStr for ExpectedVersion {
    type Err = TwinError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim().trim_start_matches("W/").trim_matches('"');
        if trimmed == "*" {
            return Ok(ExpectedVersion::Any);
        }
        trimmed
            .parse::<u64>()
            .map(ExpectedVersion::Exact)
            .map_err(|_| TwinError::BadRequest(format!("invalid expected version: {}", s)))
    }
}

impl fmt::Display for ExpectedVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpectedVersion::Any => f.write_str("*"),
            ExpectedVersion::Exact(v) => write!(f, "{}", v),
        }
    }
}

/// Desired-property change fanned out to connected sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DesiredPush {
    /// Desired version produced by this change
    pub version: u64,
    /// The patch as applied, delete-markers included
    pub patch: Properties,
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
