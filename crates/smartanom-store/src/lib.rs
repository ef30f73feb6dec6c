//! `smartanom-store` – the persistence collaborator.
//!
//! Owns the canonical device, sensor and reading records in a local SQLite
//! database and announces every committed write to registered hooks.
//!
//! # Modules
//!
//! - [`sqlite`] – [`SqliteStore`][sqlite::SqliteStore]: schema, queries, and
//!   the post-commit hook fan-out.
//! - [`seed`] – sample hydroponic devices, sensors and a week of readings.
//!
//! # Hooks
//!
//! A [`StoreHook`] runs after the write it describes has committed and after
//! the database lock has been released. The live broadcaster registers itself
//! as a hook, which makes the store the single trigger point for fan-out no
//! matter which surface performed the write.

pub mod seed;
pub mod sqlite;

use async_trait::async_trait;
use smartanom_types::{
    Device, DeviceId, DeviceStatusEvent, Reading, Sensor, SensorId, SmartanomError,
};
use thiserror::Error;

pub use sqlite::{Batch, SqliteStore};

/// Errors raised by store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },

    #[error("Invalid value: {0}")]
    Invalid(String),

    #[error("store connection lock poisoned")]
    Poisoned,

    #[error("store task failed: {0}")]
    Task(String),
}

impl From<StoreError> for SmartanomError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => SmartanomError::NotFound { entity, id },
            StoreError::Invalid(msg) => SmartanomError::Invalid(msg),
            other => SmartanomError::Storage(other.to_string()),
        }
    }
}

/// The narrow interface the live subsystem consumes.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn get_sensor(&self, id: SensorId) -> Result<Option<Sensor>, StoreError>;

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError>;

    /// Persist one reading for `sensor_id`.
    ///
    /// Fails with [`StoreError::NotFound`] for an unknown sensor and
    /// [`StoreError::Invalid`] for a non-finite value; nothing is written in
    /// either case.
    async fn create_reading(&self, sensor_id: SensorId, value: f64) -> Result<Reading, StoreError>;

    /// Returns `false` when the device does not exist.
    async fn set_device_status(&self, id: DeviceId, status: &str) -> Result<bool, StoreError>;

    async fn latest_reading(&self, sensor_id: SensorId) -> Result<Option<Reading>, StoreError>;
}

/// Post-commit observer of store writes.
pub trait StoreHook: Send + Sync {
    fn reading_created(&self, reading: &Reading);

    fn device_status_changed(&self, event: &DeviceStatusEvent);
}
