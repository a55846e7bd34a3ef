// SPDX-License-Identifier: MIT OR Apache-2.0
//! Event and reading DTOs carried through pipelines.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// API version stamped on request wrappers.
pub const API_VERSION: &str = "v3";

/// A single sampled value from a device resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reading {
    /// Unique reading id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Nanosecond epoch timestamp at which the value was sampled.
    #[serde(default)]
    pub origin: i64,
    /// Name of the device that produced the value.
    #[serde(default)]
    pub device_name: String,
    /// Device resource the value was read from.
    #[serde(default)]
    pub resource_name: String,
    /// Device profile the resource belongs to.
    #[serde(default)]
    pub profile_name: String,
    /// Declared type of `value` (e.g. `Int64`, `Float32`, `String`).
    #[serde(default)]
    pub value_type: String,
    /// Stringified sampled value.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// Raw bytes for binary readings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_value: Option<Vec<u8>>,
    /// Structured value for object readings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_value: Option<serde_json::Value>,
    /// Unit of measure, when known.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub units: String,
    /// Arbitrary annotation tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Reading {
    /// Build a simple string-typed reading.
    pub fn simple(
        device_name: impl Into<String>,
        resource_name: impl Into<String>,
        value_type: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            origin: now_nanos(),
            device_name: device_name.into(),
            resource_name: resource_name.into(),
            value_type: value_type.into(),
            value: value.into(),
            ..Self::default()
        }
    }
}

/// A collection of readings sampled together from one device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique event id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Name of the originating device.
    #[serde(default)]
    pub device_name: String,
    /// Device profile of the originating device.
    #[serde(default)]
    pub profile_name: String,
    /// Source (command or resource) that produced the event.
    #[serde(default)]
    pub source_name: String,
    /// Nanosecond epoch timestamp of event creation.
    #[serde(default)]
    pub origin: i64,
    /// The sampled readings.
    #[serde(default)]
    pub readings: Vec<Reading>,
    /// Arbitrary annotation tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Event {
    /// Build an event with a fresh id and origin timestamp.
    pub fn new(
        device_name: impl Into<String>,
        profile_name: impl Into<String>,
        source_name: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            device_name: device_name.into(),
            profile_name: profile_name.into(),
            source_name: source_name.into(),
            origin: now_nanos(),
            readings: Vec::new(),
            tags: None,
        }
    }

    /// Append a reading, stamping it with this event's device and profile.
    pub fn add_reading(&mut self, mut reading: Reading) {
        reading.device_name = self.device_name.clone();
        reading.profile_name = self.profile_name.clone();
        self.readings.push(reading);
    }
}

/// Request wrapper enclosing an [`Event`] on the wire.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddEventRequest {
    /// API version of the request shape.
    #[serde(default)]
    pub api_version: String,
    /// Optional caller-supplied request id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,
    /// The enclosed event.
    pub event: Event,
}

impl AddEventRequest {
    /// Wrap an event in a request with the current API version.
    pub fn new(event: Event) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            request_id: Uuid::new_v4().to_string(),
            event,
        }
    }
}

fn now_nanos() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}
