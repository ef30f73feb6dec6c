//! Shared domain records for the SmartAnom live telemetry stack.
//!
//! Every other crate in the workspace speaks in these types: the store
//! produces [`Reading`]s and [`DeviceStatusEvent`]s, the hub routes them by
//! [`TopicKey`], and every fallible boundary reports a [`SmartanomError`].

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Primary key of a device record.
pub type DeviceId = i64;
/// Primary key of a sensor record.
pub type SensorId = i64;
/// Primary key of a reading record.
pub type ReadingId = i64;

/// A broadcast scope. Identity is the tag plus the embedded id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum TopicKey {
    /// Every reading produced anywhere.
    Global,
    /// Readings and status changes of one device.
    Device(DeviceId),
    /// Readings of one sensor.
    Sensor(SensorId),
}

impl TopicKey {
    /// The three topics a reading is delivered to.
    pub fn for_reading(reading: &Reading) -> [TopicKey; 3] {
        [
            TopicKey::Global,
            TopicKey::Device(reading.device_id),
            TopicKey::Sensor(reading.sensor_id),
        ]
    }
}

impl fmt::Display for TopicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TopicKey::Global => write!(f, "global"),
            TopicKey::Device(id) => write!(f, "device/{id}"),
            TopicKey::Sensor(id) => write!(f, "sensor/{id}"),
        }
    }
}

/// An IoT device owning zero or more sensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub device_id: DeviceId,
    pub device_name: String,
    pub user_email: String,
    /// Free-form lifecycle label, e.g. `"active"`, `"inactive"`, `"maintenance"`.
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A sensor attached to a device, denormalized with its device name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sensor {
    pub sensor_id: SensorId,
    pub device_id: DeviceId,
    pub device_name: String,
    /// e.g. `"temperature"`, `"ph"`, `"water_level"`.
    pub sensor_type: String,
    /// e.g. `"celsius"`, `"percent"`, `"cm"`.
    pub unit: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One persisted measurement. Immutable once the store has produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub id: ReadingId,
    pub sensor_id: SensorId,
    pub sensor_type: String,
    pub device_id: DeviceId,
    pub device_name: String,
    pub value: f64,
    pub unit: String,
    pub created_at: DateTime<Utc>,
}

/// Emitted after a device's status field has been written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatusEvent {
    pub device_id: DeviceId,
    pub status: String,
}

/// Error taxonomy shared by the store, the hub and the gateway.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SmartanomError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Invalid value: {0}")]
    Invalid(String),

    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Delivery to {handle} dropped: {reason}")]
    DeliveryDrop { handle: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SmartanomError {
    pub fn sensor_not_found(id: SensorId) -> Self {
        SmartanomError::NotFound { entity: "sensor", id }
    }

    pub fn device_not_found(id: DeviceId) -> Self {
        SmartanomError::NotFound { entity: "device", id }
    }
}
