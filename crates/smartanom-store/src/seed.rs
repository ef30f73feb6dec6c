//! Sample data for demos and manual testing.
//!
//! Creates three hydroponic devices, five sensors per device and one reading
//! every two hours over the past seven days. Seeding is idempotent per device
//! name: a device that already exists is left untouched.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::{Batch, SqliteStore, StoreError};

const DEVICE_COUNT: usize = 3;
const HISTORY_DAYS: i64 = 7;
const SAMPLE_EVERY_HOURS: i64 = 2;

/// `(sensor_type, unit, low, high)` for every seeded sensor.
const SENSOR_PROFILES: [(&str, &str, f64, f64); 5] = [
    ("temperature", "celsius", 20.0, 30.0),
    ("humidity", "percent", 60.0, 80.0),
    ("ph", "ph_units", 5.5, 7.5),
    ("ec", "ec_units", 1.0, 2.5),
    ("water_level", "cm", 10.0, 50.0),
];

/// Counts of what a [`seed`] call created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeedSummary {
    pub devices: usize,
    pub sensors: usize,
    pub readings: usize,
}

/// Deterministic value inside `[low, high]`, rounded to two decimals.
fn sample_value(low: f64, high: f64, sensor_id: i64, step: i64) -> f64 {
    let phase = (sensor_id * 7 + step) as f64 * 0.37;
    let value = low + (high - low) * (0.5 + 0.5 * phase.sin());
    (value * 100.0).round() / 100.0
}

/// Populate `store` with sample devices, sensors and readings ending at `now`.
pub fn seed(store: &SqliteStore, now: DateTime<Utc>) -> Result<SeedSummary, StoreError> {
    let mut summary = SeedSummary::default();

    for i in 1..=DEVICE_COUNT {
        let device_name = format!("Hydroponic System {i}");
        if store.device_by_name(&device_name)?.is_some() {
            continue;
        }
        // One transaction per device: a failure part-way leaves no trace, so
        // the next run seeds the device from scratch.
        let seeded = store.batch(|batch| seed_device(batch, i, &device_name, now))?;
        summary.devices += seeded.devices;
        summary.sensors += seeded.sensors;
        summary.readings += seeded.readings;
    }

    info!(
        devices = summary.devices,
        sensors = summary.sensors,
        readings = summary.readings,
        "seed complete"
    );
    Ok(summary)
}

fn seed_device(
    batch: &mut Batch<'_>,
    index: usize,
    device_name: &str,
    now: DateTime<Utc>,
) -> Result<SeedSummary, StoreError> {
    let mut summary = SeedSummary::default();
    let device =
        batch.create_device(device_name, &format!("user{index}@smartanom.com"), "active")?;
    summary.devices += 1;

    for (sensor_type, unit, low, high) in SENSOR_PROFILES {
        let sensor = batch.create_sensor(device.device_id, sensor_type, unit)?;
        summary.sensors += 1;

        let steps = HISTORY_DAYS * 24 / SAMPLE_EVERY_HOURS;
        for step in (0..steps).rev() {
            let at = now - Duration::hours(step * SAMPLE_EVERY_HOURS);
            let value = sample_value(low, high, sensor.sensor_id, step);
            batch.insert_reading_at(sensor.sensor_id, value, at)?;
            summary.readings += 1;
        }
    }
    Ok(summary)
}
