//! SQLite-backed record store.
//!
//! # Storage layout
//!
//! | table         | columns                                                           |
//! |---------------|-------------------------------------------------------------------|
//! | `devices`     | device_id, device_name, user_email, status, created_at, updated_at |
//! | `sensors`     | sensor_id, device_id → devices, sensor_type, unit, created_at, updated_at |
//! | `sensor_data` | data_id, sensor_id → sensors, value, created_at, updated_at        |
//!
//! Timestamps are RFC-3339 UTC strings with microsecond precision so that
//! lexical order equals chronological order.
//!
//! # Example
//!
//! ```rust
//! use smartanom_store::SqliteStore;
//!
//! let store = SqliteStore::open_in_memory().unwrap();
//! let device = store.create_device("Greenhouse A", "grower@smartanom.com", "active").unwrap();
//! let sensor = store.create_sensor(device.device_id, "ph", "ph_units").unwrap();
//! let reading = store.insert_reading(sensor.sensor_id, 6.4).unwrap();
//! assert_eq!(reading.device_name, "Greenhouse A");
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use smartanom_types::{
    Device, DeviceId, DeviceStatusEvent, Reading, Sensor, SensorId,
};
use tracing::debug;

use crate::{Persistence, StoreError, StoreHook};

const SENSOR_SELECT: &str = "SELECT s.sensor_id, s.device_id, d.device_name, s.sensor_type,
        s.unit, s.created_at, s.updated_at
     FROM sensors s
     JOIN devices d ON d.device_id = s.device_id";

const READING_SELECT: &str = "SELECT r.data_id, r.sensor_id, s.sensor_type, s.device_id,
        d.device_name, r.value, s.unit, r.created_at
     FROM sensor_data r
     JOIN sensors s ON s.sensor_id = r.sensor_id
     JOIN devices d ON d.device_id = s.device_id";

// ─────────────────────────────────────────────────────────────────────────────
// Row mapping helpers
// ─────────────────────────────────────────────────────────────────────────────

fn to_db_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    raw.parse::<DateTime<Utc>>().map_err(|e| {
        rusqlite::Error::InvalidColumnType(idx, e.to_string(), rusqlite::types::Type::Text)
    })
}

fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        device_id: row.get(0)?,
        device_name: row.get(1)?,
        user_email: row.get(2)?,
        status: row.get(3)?,
        created_at: ts_column(row, 4)?,
        updated_at: ts_column(row, 5)?,
    })
}

fn sensor_from_row(row: &Row<'_>) -> rusqlite::Result<Sensor> {
    Ok(Sensor {
        sensor_id: row.get(0)?,
        device_id: row.get(1)?,
        device_name: row.get(2)?,
        sensor_type: row.get(3)?,
        unit: row.get(4)?,
        created_at: ts_column(row, 5)?,
        updated_at: ts_column(row, 6)?,
    })
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        id: row.get(0)?,
        sensor_id: row.get(1)?,
        sensor_type: row.get(2)?,
        device_id: row.get(3)?,
        device_name: row.get(4)?,
        value: row.get(5)?,
        unit: row.get(6)?,
        created_at: ts_column(row, 7)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// SqliteStore
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite record store with post-commit [`StoreHook`] notification.
///
/// Clones share the same connection and hook list.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    hooks: Arc<RwLock<Vec<Arc<dyn StoreHook>>>>,
}

impl SqliteStore {
    /// Open (or create) a persistent database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            hooks: Arc::new(RwLock::new(Vec::new())),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "PRAGMA foreign_keys = ON;
             CREATE TABLE IF NOT EXISTS devices (
                device_id   INTEGER PRIMARY KEY AUTOINCREMENT,
                device_name TEXT NOT NULL,
                user_email  TEXT NOT NULL,
                status      TEXT NOT NULL DEFAULT 'inactive',
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS sensors (
                sensor_id   INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id   INTEGER NOT NULL REFERENCES devices(device_id) ON DELETE CASCADE,
                sensor_type TEXT NOT NULL,
                unit        TEXT NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS sensor_data (
                data_id     INTEGER PRIMARY KEY AUTOINCREMENT,
                sensor_id   INTEGER NOT NULL REFERENCES sensors(sensor_id) ON DELETE CASCADE,
                value       REAL NOT NULL,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_sensor_data_sensor_created
                ON sensor_data (sensor_id, created_at DESC);",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Register a hook that observes every committed reading insert and
    /// device status write.
    pub fn add_hook(&self, hook: Arc<dyn StoreHook>) {
        let mut hooks = match self.hooks.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        hooks.push(hook);
    }

    fn hooks_snapshot(&self) -> Vec<Arc<dyn StoreHook>> {
        match self.hooks.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    // ── Devices ──────────────────────────────────────────────────────────────

    pub fn create_device(
        &self,
        device_name: &str,
        user_email: &str,
        status: &str,
    ) -> Result<Device, StoreError> {
        insert_device(&*self.conn()?, device_name, user_email, status)
    }

    pub fn device(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        let conn = self.conn()?;
        let device = conn
            .query_row(
                "SELECT device_id, device_name, user_email, status, created_at, updated_at
                 FROM devices WHERE device_id = ?1",
                params![id],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    pub fn device_by_name(&self, device_name: &str) -> Result<Option<Device>, StoreError> {
        let conn = self.conn()?;
        let device = conn
            .query_row(
                "SELECT device_id, device_name, user_email, status, created_at, updated_at
                 FROM devices WHERE device_name = ?1
                 ORDER BY device_id LIMIT 1",
                params![device_name],
                device_from_row,
            )
            .optional()?;
        Ok(device)
    }

    /// Write a device's status and notify hooks.
    ///
    /// Returns `false` (and notifies nobody) when the device does not exist.
    pub fn update_device_status(&self, id: DeviceId, status: &str) -> Result<bool, StoreError> {
        let now = Utc::now().trunc_subsecs(6);
        let changed = {
            let conn = self.conn()?;
            conn.execute(
                "UPDATE devices SET status = ?1, updated_at = ?2 WHERE device_id = ?3",
                params![status, to_db_ts(&now), id],
            )?
        };
        if changed == 0 {
            return Ok(false);
        }

        let event = DeviceStatusEvent {
            device_id: id,
            status: status.to_string(),
        };
        debug!(device_id = id, status, "device status committed");
        for hook in self.hooks_snapshot() {
            hook.device_status_changed(&event);
        }
        Ok(true)
    }

    // ── Sensors ──────────────────────────────────────────────────────────────

    pub fn create_sensor(
        &self,
        device_id: DeviceId,
        sensor_type: &str,
        unit: &str,
    ) -> Result<Sensor, StoreError> {
        insert_sensor(&*self.conn()?, device_id, sensor_type, unit)
    }

    pub fn sensor(&self, id: SensorId) -> Result<Option<Sensor>, StoreError> {
        let conn = self.conn()?;
        let sensor = conn
            .query_row(
                &format!("{SENSOR_SELECT} WHERE s.sensor_id = ?1"),
                params![id],
                sensor_from_row,
            )
            .optional()?;
        Ok(sensor)
    }

    pub fn sensors_for_device(&self, device_id: DeviceId) -> Result<Vec<Sensor>, StoreError> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare(&format!("{SENSOR_SELECT} WHERE s.device_id = ?1 ORDER BY s.sensor_id"))?;
        let sensors = stmt
            .query_map(params![device_id], sensor_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(sensors)
    }

    // ── Readings ─────────────────────────────────────────────────────────────

    /// Persist a reading stamped with the current time.
    pub fn insert_reading(&self, sensor_id: SensorId, value: f64) -> Result<Reading, StoreError> {
        self.insert_reading_at(sensor_id, value, Utc::now())
    }

    /// Persist a reading with an explicit creation time and notify hooks.
    ///
    /// The sensor lookup and the insert happen under one lock, so either
    /// exactly one row is written or nothing is.
    pub fn insert_reading_at(
        &self,
        sensor_id: SensorId,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<Reading, StoreError> {
        let reading = insert_reading_row(&*self.conn()?, sensor_id, value, at)?;

        debug!(reading_id = reading.id, sensor_id, "reading committed");
        for hook in self.hooks_snapshot() {
            hook.reading_created(&reading);
        }
        Ok(reading)
    }

    /// Run `f` inside one SQLite transaction.
    ///
    /// If `f` fails nothing it wrote is kept and no hook runs. Otherwise the
    /// transaction commits and hooks are told about every reading inserted
    /// through the [`Batch`], in insert order.
    pub fn batch<T>(
        &self,
        f: impl FnOnce(&mut Batch<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let (value, readings) = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;
            let mut batch = Batch {
                conn: &*tx,
                readings: Vec::new(),
            };
            let value = f(&mut batch)?;
            let Batch { readings, .. } = batch;
            tx.commit()?;
            (value, readings)
        };

        debug!(readings = readings.len(), "batch committed");
        let hooks = self.hooks_snapshot();
        for reading in &readings {
            for hook in &hooks {
                hook.reading_created(reading);
            }
        }
        Ok(value)
    }

    pub fn latest_reading(&self, sensor_id: SensorId) -> Result<Option<Reading>, StoreError> {
        Ok(self.readings_for_sensor(sensor_id, Some(1))?.into_iter().next())
    }

    /// Readings of one sensor, newest first.
    pub fn readings_for_sensor(
        &self,
        sensor_id: SensorId,
        limit: Option<usize>,
    ) -> Result<Vec<Reading>, StoreError> {
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map_or(-1, |n| i64::try_from(n).unwrap_or(i64::MAX));
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "{READING_SELECT} WHERE r.sensor_id = ?1
             ORDER BY r.created_at DESC, r.data_id DESC
             LIMIT ?2"
        ))?;
        let readings = stmt
            .query_map(params![sensor_id, limit], reading_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(readings)
    }

    pub fn reading_count(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sensor_data", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Batched writes
// ─────────────────────────────────────────────────────────────────────────────

/// Writes staged inside a [`SqliteStore::batch`] transaction.
pub struct Batch<'a> {
    conn: &'a Connection,
    readings: Vec<Reading>,
}

impl Batch<'_> {
    pub fn create_device(
        &mut self,
        device_name: &str,
        user_email: &str,
        status: &str,
    ) -> Result<Device, StoreError> {
        insert_device(self.conn, device_name, user_email, status)
    }

    pub fn create_sensor(
        &mut self,
        device_id: DeviceId,
        sensor_type: &str,
        unit: &str,
    ) -> Result<Sensor, StoreError> {
        insert_sensor(self.conn, device_id, sensor_type, unit)
    }

    pub fn insert_reading_at(
        &mut self,
        sensor_id: SensorId,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<Reading, StoreError> {
        let reading = insert_reading_row(self.conn, sensor_id, value, at)?;
        self.readings.push(reading.clone());
        Ok(reading)
    }
}

fn insert_device(
    conn: &Connection,
    device_name: &str,
    user_email: &str,
    status: &str,
) -> Result<Device, StoreError> {
    let now = Utc::now().trunc_subsecs(6);
    conn.execute(
        "INSERT INTO devices (device_name, user_email, status, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![device_name, user_email, status, to_db_ts(&now)],
    )?;
    Ok(Device {
        device_id: conn.last_insert_rowid(),
        device_name: device_name.to_string(),
        user_email: user_email.to_string(),
        status: status.to_string(),
        created_at: now,
        updated_at: now,
    })
}

fn insert_sensor(
    conn: &Connection,
    device_id: DeviceId,
    sensor_type: &str,
    unit: &str,
) -> Result<Sensor, StoreError> {
    let now = Utc::now().trunc_subsecs(6);
    let device_name: Option<String> = conn
        .query_row(
            "SELECT device_name FROM devices WHERE device_id = ?1",
            params![device_id],
            |row| row.get(0),
        )
        .optional()?;
    let device_name = device_name.ok_or(StoreError::NotFound {
        entity: "device",
        id: device_id,
    })?;

    conn.execute(
        "INSERT INTO sensors (device_id, sensor_type, unit, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        params![device_id, sensor_type, unit, to_db_ts(&now)],
    )?;
    Ok(Sensor {
        sensor_id: conn.last_insert_rowid(),
        device_id,
        device_name,
        sensor_type: sensor_type.to_string(),
        unit: unit.to_string(),
        created_at: now,
        updated_at: now,
    })
}

fn insert_reading_row(
    conn: &Connection,
    sensor_id: SensorId,
    value: f64,
    at: DateTime<Utc>,
) -> Result<Reading, StoreError> {
    if !value.is_finite() {
        return Err(StoreError::Invalid(format!("{value} is not a finite number")));
    }
    let at = at.trunc_subsecs(6);

    let sensor = conn
        .query_row(
            &format!("{SENSOR_SELECT} WHERE s.sensor_id = ?1"),
            params![sensor_id],
            sensor_from_row,
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            entity: "sensor",
            id: sensor_id,
        })?;

    conn.execute(
        "INSERT INTO sensor_data (sensor_id, value, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?3)",
        params![sensor_id, value, to_db_ts(&at)],
    )?;

    Ok(Reading {
        id: conn.last_insert_rowid(),
        sensor_id,
        sensor_type: sensor.sensor_type,
        device_id: sensor.device_id,
        device_name: sensor.device_name,
        value,
        unit: sensor.unit,
        created_at: at,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Persistence
// ─────────────────────────────────────────────────────────────────────────────

impl SqliteStore {
    /// Run `f` against a clone of this store on the blocking thread pool.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = self.clone();
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|e| StoreError::Task(format!("spawn_blocking join error: {e}")))?
    }
}

#[async_trait]
impl Persistence for SqliteStore {
    async fn get_sensor(&self, id: SensorId) -> Result<Option<Sensor>, StoreError> {
        self.blocking(move |store| store.sensor(id)).await
    }

    async fn get_device(&self, id: DeviceId) -> Result<Option<Device>, StoreError> {
        self.blocking(move |store| store.device(id)).await
    }

    async fn create_reading(&self, sensor_id: SensorId, value: f64) -> Result<Reading, StoreError> {
        self.blocking(move |store| store.insert_reading(sensor_id, value))
            .await
    }

    async fn set_device_status(&self, id: DeviceId, status: &str) -> Result<bool, StoreError> {
        let status = status.to_string();
        self.blocking(move |store| store.update_device_status(id, &status))
            .await
    }

    async fn latest_reading(&self, sensor_id: SensorId) -> Result<Option<Reading>, StoreError> {
        self.blocking(move |store| SqliteStore::latest_reading(store, sensor_id))
            .await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
