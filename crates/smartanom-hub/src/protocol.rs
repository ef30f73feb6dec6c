//! Wire frames exchanged over a live connection.
//!
//! Every frame is a JSON object discriminated by its `type` field.
//!
//! Inbound (client → server):
//!
//! | `type`          | fields                         |
//! |-----------------|--------------------------------|
//! | `ping`          | `timestamp` (echoed verbatim)  |
//! | `sensor_data`   | `sensor_id`, `value`           |
//! | `sensor_reading`| `value` (sensor-scoped alias)  |
//! | `device_status` | `status`                       |
//!
//! Outbound frames are built by [`OutboundFrame`]; readings are carried in a
//! full shape ([`ReadingPayload`]) on global and device topics and a reduced
//! shape ([`SensorReadingPayload`]) on sensor topics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, de};
use serde_json::Value;
use smartanom_types::{
    Device, DeviceId, Reading, ReadingId, Sensor, SensorId, SmartanomError,
};

/// Message sent to a client on the global topic right after it connects.
pub const GLOBAL_WELCOME: &str = "Connected to sensor data stream";

const INBOUND_TYPES: [&str; 4] = ["ping", "sensor_data", "sensor_reading", "device_status"];

// ─────────────────────────────────────────────────────────────────────────────
// Inbound
// ─────────────────────────────────────────────────────────────────────────────

/// A frame received from a client.
///
/// Unknown fields are ignored; missing optional fields decode as `null` /
/// `None` and are validated by the dispatcher, not here.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Ping {
        #[serde(default)]
        timestamp: Value,
    },
    SensorData {
        #[serde(default, deserialize_with = "lenient_sensor_id")]
        sensor_id: Option<SensorId>,
        #[serde(default)]
        value: Value,
    },
    SensorReading {
        #[serde(default)]
        value: Value,
    },
    DeviceStatus {
        #[serde(default)]
        status: Option<String>,
    },
}

/// Integer ids, integral floats (`5.0`) and numeric strings (`"5"`) are all
/// accepted; anything else is a malformed frame.
fn lenient_sensor_id<'de, D: Deserializer<'de>>(de: D) -> Result<Option<SensorId>, D::Error> {
    // Larger floats lose integer precision.
    const MAX_EXACT: f64 = 9_007_199_254_740_992.0;

    let id = match Option::<Value>::deserialize(de)? {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_i64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && f.abs() <= MAX_EXACT)
                .map(|f| f as SensorId)
        }),
        Some(Value::String(s)) => s.trim().parse::<SensorId>().ok(),
        Some(_) => None,
    };
    id.map(Some)
        .ok_or_else(|| de::Error::custom("sensor_id must be an integer"))
}

/// Decode one text frame.
///
/// # Errors
///
/// [`SmartanomError::MalformedFrame`] when the text is not JSON, is not an
/// object, lacks a string `type`, names an unknown type, or has fields of the
/// wrong shape.
pub fn decode(text: &str) -> Result<InboundFrame, SmartanomError> {
    let value: Value = serde_json::from_str(text)
        .map_err(|_| SmartanomError::MalformedFrame("Invalid JSON format".to_string()))?;

    let Some(object) = value.as_object() else {
        return Err(SmartanomError::MalformedFrame(
            "Frame must be a JSON object".to_string(),
        ));
    };

    let kind = match object.get("type") {
        None | Some(Value::Null) => {
            return Err(SmartanomError::MalformedFrame(
                "Missing message type".to_string(),
            ));
        }
        Some(Value::String(kind)) => kind.clone(),
        Some(_) => {
            return Err(SmartanomError::MalformedFrame(
                "Message type must be a string".to_string(),
            ));
        }
    };

    if !INBOUND_TYPES.contains(&kind.as_str()) {
        return Err(SmartanomError::MalformedFrame(format!(
            "Unknown message type: {kind}"
        )));
    }

    serde_json::from_value(value)
        .map_err(|e| SmartanomError::MalformedFrame(format!("Invalid {kind} frame: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound payloads
// ─────────────────────────────────────────────────────────────────────────────

/// Full reading shape delivered on global and device topics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingPayload {
    pub id: ReadingId,
    pub sensor_id: SensorId,
    pub sensor_type: String,
    pub device_id: DeviceId,
    pub device_name: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Reading> for ReadingPayload {
    fn from(r: &Reading) -> Self {
        Self {
            id: r.id,
            sensor_id: r.sensor_id,
            sensor_type: r.sensor_type.clone(),
            device_id: r.device_id,
            device_name: r.device_name.clone(),
            value: r.value,
            unit: r.unit.clone(),
            timestamp: r.created_at,
        }
    }
}

/// Reduced reading shape delivered on sensor topics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReadingPayload {
    pub id: ReadingId,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub sensor_type: String,
    pub unit: String,
}

impl From<&Reading> for SensorReadingPayload {
    fn from(r: &Reading) -> Self {
        Self {
            id: r.id,
            value: r.value,
            timestamp: r.created_at,
            sensor_type: r.sensor_type.clone(),
            unit: r.unit.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub device_id: DeviceId,
    pub device_name: String,
    pub status: String,
    pub user_email: String,
}

impl From<&Device> for DeviceInfo {
    fn from(d: &Device) -> Self {
        Self {
            device_id: d.device_id,
            device_name: d.device_name.clone(),
            status: d.status.clone(),
            user_email: d.user_email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LatestReading {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorInfo {
    pub sensor_id: SensorId,
    pub sensor_type: String,
    pub unit: String,
    pub device_id: DeviceId,
    pub device_name: String,
    /// `null` when the sensor has never reported.
    pub latest_reading: Option<LatestReading>,
}

impl SensorInfo {
    pub fn new(sensor: &Sensor, latest: Option<&Reading>) -> Self {
        Self {
            sensor_id: sensor.sensor_id,
            sensor_type: sensor.sensor_type.clone(),
            unit: sensor.unit.clone(),
            device_id: sensor.device_id,
            device_name: sensor.device_name.clone(),
            latest_reading: latest.map(|r| LatestReading {
                value: r.value,
                timestamp: r.created_at,
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outbound
// ─────────────────────────────────────────────────────────────────────────────

/// A frame sent to a client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    ConnectionEstablished { message: String },
    DeviceConnected { device: DeviceInfo },
    SensorConnected { sensor: SensorInfo },
    Pong { timestamp: Value },
    SensorData { data: ReadingPayload },
    SensorReading { data: SensorReadingPayload },
    DeviceStatus { device_id: DeviceId, status: String },
    Error { message: String },
}

impl OutboundFrame {
    pub fn error(message: impl Into<String>) -> Self {
        OutboundFrame::Error {
            message: message.into(),
        }
    }

    /// Serialize to the JSON text sent on the wire.
    pub fn to_json(&self) -> Result<String, SmartanomError> {
        serde_json::to_string(self).map_err(|e| SmartanomError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn reading() -> Reading {
        Reading {
            id: 40,
            sensor_id: 5,
            sensor_type: "ph".to_string(),
            device_id: 2,
            device_name: "Hydroponic System 2".to_string(),
            value: 6.4,
            unit: "ph_units".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn decode_ping_keeps_timestamp_verbatim() {
        let frame = decode(r#"{"type":"ping","timestamp":{"client":17}}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::Ping {
                timestamp: json!({"client": 17})
            }
        );
    }

    #[test]
    fn decode_ping_without_timestamp_is_null() {
        let frame = decode(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(frame, InboundFrame::Ping { timestamp: Value::Null });
    }

    #[test]
    fn decode_sensor_data_accepts_string_value() {
        let frame = decode(r#"{"type":"sensor_data","sensor_id":5,"value":"23.5"}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::SensorData {
                sensor_id: Some(5),
                value: json!("23.5")
            }
        );
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        let frame = decode(r#"{"type":"device_status","status":"maintenance","extra":1}"#).unwrap();
        assert_eq!(
            frame,
            InboundFrame::DeviceStatus {
                status: Some("maintenance".to_string())
            }
        );
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let err = decode("{not json").unwrap_err();
        assert_eq!(
            err,
            SmartanomError::MalformedFrame("Invalid JSON format".to_string())
        );
    }

    #[test]
    fn decode_rejects_missing_and_unknown_type() {
        let missing = decode(r#"{"value":1}"#).unwrap_err();
        assert!(missing.to_string().contains("Missing message type"));

        let unknown = decode(r#"{"type":"subscribe"}"#).unwrap_err();
        assert!(unknown.to_string().contains("Unknown message type: subscribe"));

        let not_object = decode("[1,2]").unwrap_err();
        assert!(matches!(not_object, SmartanomError::MalformedFrame(_)));
    }

    #[test]
    fn decode_rejects_wrongly_typed_sensor_id() {
        for frame in [
            r#"{"type":"sensor_data","sensor_id":"five","value":1}"#,
            r#"{"type":"sensor_data","sensor_id":5.5,"value":1}"#,
            r#"{"type":"sensor_data","sensor_id":[5],"value":1}"#,
        ] {
            let err = decode(frame).unwrap_err();
            assert!(err.to_string().contains("Invalid sensor_data frame"), "{frame}");
        }
    }

    #[test]
    fn decode_coerces_numeric_sensor_ids() {
        for frame in [
            r#"{"type":"sensor_data","sensor_id":5,"value":1}"#,
            r#"{"type":"sensor_data","sensor_id":5.0,"value":1}"#,
            r#"{"type":"sensor_data","sensor_id":"5","value":1}"#,
            r#"{"type":"sensor_data","sensor_id":" 5 ","value":1}"#,
        ] {
            match decode(frame).unwrap() {
                InboundFrame::SensorData { sensor_id, .. } => assert_eq!(sensor_id, Some(5), "{frame}"),
                other => panic!("unexpected frame: {other:?}"),
            }
        }
        match decode(r#"{"type":"sensor_data","sensor_id":null,"value":1}"#).unwrap() {
            InboundFrame::SensorData { sensor_id, .. } => assert_eq!(sensor_id, None),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn full_payload_shape() {
        let frame = OutboundFrame::SensorData {
            data: (&reading()).into(),
        };
        let json: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "sensor_data");
        assert_eq!(json["data"]["id"], 40);
        assert_eq!(json["data"]["sensor_id"], 5);
        assert_eq!(json["data"]["device_id"], 2);
        assert_eq!(json["data"]["device_name"], "Hydroponic System 2");
        assert_eq!(json["data"]["value"], 6.4);
        assert!(json["data"]["timestamp"].is_string());
    }

    #[test]
    fn reduced_payload_shape() {
        let frame = OutboundFrame::SensorReading {
            data: (&reading()).into(),
        };
        let json: Value = serde_json::from_str(&frame.to_json().unwrap()).unwrap();
        assert_eq!(json["type"], "sensor_reading");
        let data = json["data"].as_object().unwrap();
        let mut keys: Vec<&str> = data.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(keys, ["id", "sensor_type", "timestamp", "unit", "value"]);
    }

    #[test]
    fn sensor_welcome_without_history_has_null_latest() {
        let sensor = Sensor {
            sensor_id: 5,
            device_id: 2,
            device_name: "Hydroponic System 2".to_string(),
            sensor_type: "ph".to_string(),
            unit: "ph_units".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let frame = OutboundFrame::SensorConnected {
            sensor: SensorInfo::new(&sensor, None),
        };
        let json: Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "sensor_connected");
        assert!(json["sensor"]["latest_reading"].is_null());
    }

    #[test]
    fn error_frame_shape() {
        let json = serde_json::to_value(OutboundFrame::error("boom")).unwrap();
        assert_eq!(json, json!({"type": "error", "message": "boom"}));
    }
}
