//! Validation and persistence of client-submitted readings.
//!
//! The gateway only writes; fan-out happens when the store's post-commit hook
//! reaches the [`Broadcaster`][crate::broadcaster::Broadcaster].

use std::sync::Arc;

use serde_json::Value;
use smartanom_store::Persistence;
use smartanom_types::{Reading, SensorId, SmartanomError};
use tracing::debug;

pub struct IngestionGateway {
    store: Arc<dyn Persistence>,
}

impl IngestionGateway {
    pub fn new(store: Arc<dyn Persistence>) -> Self {
        Self { store }
    }

    /// Validate and persist one reading for `sensor_id`.
    ///
    /// # Errors
    ///
    /// - [`SmartanomError::NotFound`] if the sensor does not exist.
    /// - [`SmartanomError::Invalid`] if `raw_value` is not a finite number or
    ///   a string that parses as one.
    /// - [`SmartanomError::Storage`] if the write fails.
    pub async fn submit(
        &self,
        sensor_id: SensorId,
        raw_value: &Value,
    ) -> Result<Reading, SmartanomError> {
        if self.store.get_sensor(sensor_id).await?.is_none() {
            return Err(SmartanomError::sensor_not_found(sensor_id));
        }
        let value = parse_value(raw_value)?;
        let reading = self.store.create_reading(sensor_id, value).await?;
        debug!(reading_id = reading.id, sensor_id, value, "reading ingested");
        Ok(reading)
    }
}

/// Coerce a JSON number or numeric string into a finite `f64`.
pub fn parse_value(raw: &Value) -> Result<f64, SmartanomError> {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match parsed {
        Some(v) if v.is_finite() => Ok(v),
        _ => Err(SmartanomError::Invalid(format!(
            "expected a finite number, got {raw}"
        ))),
    }
}
