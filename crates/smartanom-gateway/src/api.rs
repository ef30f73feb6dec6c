//! JSON endpoints over the store.
//!
//! These are the external write path: a reading posted here goes through the
//! same store insert as a live `sensor_data` frame, so the store hook fans it
//! out exactly once. Store calls run on the blocking pool.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use smartanom_hub::ingest::parse_value;
use smartanom_store::{SqliteStore, StoreError};
use smartanom_types::{Device, Reading, ReadingId, SensorId};
use thiserror::Error;
use tracing::{debug, error};

use crate::server::{AppState, with_slash};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Every non-2xx answer of the gateway.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    NotFound(String),

    #[error("No data available")]
    NoData,

    #[error("{0}")]
    BadRequest(String),

    /// An extractor refused the request body.
    #[error("{detail}")]
    Rejected { status: StatusCode, detail: String },

    #[error("{0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn not_found() -> Self {
        Self::NotFound("Not found.".to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::NotFound(detail) => (StatusCode::NOT_FOUND, json!({"detail": detail})),
            Self::NoData => (StatusCode::NOT_FOUND, json!({"message": "No data available"})),
            Self::BadRequest(detail) => (StatusCode::BAD_REQUEST, json!({"detail": detail})),
            Self::Rejected { status, detail } => (status, json!({"detail": detail})),
            Self::Unavailable(detail) => {
                (StatusCode::SERVICE_UNAVAILABLE, json!({"detail": detail}))
            }
            Self::Internal(e) => {
                error!(error = %e, "api request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"detail": "Internal server error"}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{entity} {id} not found")),
            StoreError::Invalid(msg) => Self::BadRequest(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Rejected {
            status: rejection.status(),
            detail: rejection.body_text(),
        }
    }
}

/// Fallback for every unrouted path.
pub(crate) async fn not_found() -> ApiError {
    ApiError::not_found()
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub(crate) fn routes() -> Router<AppState> {
    let api = Router::new();
    let api = with_slash(api, "/api/sensor-data", post(create_reading));
    let api = with_slash(api, "/api/sensor-data/websocket_info", get(websocket_info));
    let api = with_slash(api, "/api/devices/{device_id}", patch(update_device));
    let api = with_slash(api, "/api/sensors/{sensor_id}/latest_data", get(latest_data));
    with_slash(api, "/api/sensors/{sensor_id}/data_history", get(data_history))
}

/// Run `f` against the store on the blocking pool.
async fn blocking<T, F>(store: &Arc<SqliteStore>, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&SqliteStore) -> Result<T, ApiError> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || f(&store))
        .await
        .map_err(|e| ApiError::Internal(format!("spawn_blocking join error: {e}")))?
}

fn parse_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse().map_err(|_| ApiError::not_found())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// A reading as rendered by the REST API.
#[derive(Debug, Serialize)]
pub struct ReadingRecord {
    pub data_id: ReadingId,
    pub sensor: SensorId,
    pub sensor_type: String,
    pub device_name: String,
    pub value: f64,
    pub unit: String,
    pub created_at: DateTime<Utc>,
}

impl From<Reading> for ReadingRecord {
    fn from(r: Reading) -> Self {
        Self {
            data_id: r.id,
            sensor: r.sensor_id,
            sensor_type: r.sensor_type,
            device_name: r.device_name,
            value: r.value,
            unit: r.unit,
            created_at: r.created_at,
        }
    }
}

/// `POST /api/sensor-data/`
async fn create_reading(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ReadingRecord>), ApiError> {
    let Json(body) = body?;
    let sensor_id = body
        .get("sensor")
        .and_then(Value::as_i64)
        .ok_or_else(|| ApiError::BadRequest("sensor: a sensor id is required".to_string()))?;
    let value = parse_value(body.get("value").unwrap_or(&Value::Null))
        .map_err(|e| ApiError::BadRequest(format!("value: {e}")))?;

    let reading = blocking(&state.store, move |store| {
        Ok(store.insert_reading(sensor_id, value)?)
    })
    .await?;
    debug!(reading_id = reading.id, sensor_id, "reading created over http");
    Ok((StatusCode::CREATED, Json(reading.into())))
}

/// `PATCH /api/devices/{id}/`
async fn update_device(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Device>, ApiError> {
    let id = parse_id(&device_id)?;
    let Json(body) = body?;
    let status = body
        .get("status")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ApiError::BadRequest("status: a non-empty string is required".to_string()))?
        .to_string();

    let device = blocking(&state.store, move |store| {
        if !store.update_device_status(id, &status)? {
            return Err(ApiError::not_found());
        }
        store.device(id)?.ok_or_else(ApiError::not_found)
    })
    .await?;
    Ok(Json(device))
}

/// `GET /api/sensors/{id}/latest_data/`
async fn latest_data(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
) -> Result<Json<ReadingRecord>, ApiError> {
    let id = parse_id(&sensor_id)?;
    let reading = blocking(&state.store, move |store| {
        if store.sensor(id)?.is_none() {
            return Err(ApiError::not_found());
        }
        store.latest_reading(id)?.ok_or(ApiError::NoData)
    })
    .await?;
    Ok(Json(reading.into()))
}

#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<String>,
}

/// `GET /api/sensors/{id}/data_history/?limit=N`, newest first.
async fn data_history(
    State(state): State<AppState>,
    Path(sensor_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<ReadingRecord>>, ApiError> {
    let id = parse_id(&sensor_id)?;
    let limit = match query.limit.as_deref().filter(|s| !s.is_empty()) {
        Some(raw) => Some(raw.parse::<usize>().map_err(|_| {
            ApiError::BadRequest("limit must be a non-negative integer".to_string())
        })?),
        None => None,
    };

    let readings = blocking(&state.store, move |store| {
        if store.sensor(id)?.is_none() {
            return Err(ApiError::not_found());
        }
        Ok(store.readings_for_sensor(id, limit)?)
    })
    .await?;
    Ok(Json(readings.into_iter().map(ReadingRecord::from).collect()))
}

/// `GET /api/sensor-data/websocket_info/`
async fn websocket_info(headers: HeaderMap) -> Json<Value> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("localhost:8000");
    Json(json!({
        "websocket_endpoints": {
            "all_sensor_data": format!("ws://{host}/ws/sensor-data/"),
            "device_specific": format!("ws://{host}/ws/device/<device_id>/"),
            "sensor_specific": format!("ws://{host}/ws/sensor/<sensor_id>/"),
        },
        "message_types": {
            "sensor_data": {
                "description": "Send new sensor data",
                "format": {"type": "sensor_data", "sensor_id": "integer", "value": "float"},
            },
            "ping": {
                "description": "Ping the server",
                "format": {"type": "ping", "timestamp": "ISO string"},
            },
            "device_status": {
                "description": "Update device status (device connections only)",
                "format": {"type": "device_status", "status": "string"},
            },
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use axum::http::HeaderValue;
    use smartanom_hub::{Hub, HubSettings};
    use smartanom_store::StoreHook;
    use smartanom_types::{DeviceId, DeviceStatusEvent};
    use tokio_util::sync::CancellationToken;
    use tokio_util::task::TaskTracker;

    #[derive(Default)]
    struct Counter {
        readings: Mutex<usize>,
        statuses: Mutex<usize>,
    }

    impl StoreHook for Counter {
        fn reading_created(&self, _reading: &Reading) {
            *self.readings.lock().unwrap() += 1;
        }

        fn device_status_changed(&self, _event: &DeviceStatusEvent) {
            *self.statuses.lock().unwrap() += 1;
        }
    }

    struct Fixture {
        state: AppState,
        store: Arc<SqliteStore>,
        sensor_id: SensorId,
        device_id: DeviceId,
        counter: Arc<Counter>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let device = store
            .create_device("Hydroponic System 1", "user1@smartanom.com", "active")
            .unwrap();
        let sensor = store
            .create_sensor(device.device_id, "ph", "ph_units")
            .unwrap();
        let counter = Arc::new(Counter::default());
        store.add_hook(counter.clone());

        let state = AppState {
            hub: Hub::from_sqlite(Arc::clone(&store), HubSettings::default()),
            store: Arc::clone(&store),
            sessions: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        };
        Fixture {
            state,
            store,
            sensor_id: sensor.sensor_id,
            device_id: device.device_id,
            counter,
        }
    }

    async fn respond(response: impl IntoResponse) -> (StatusCode, Value) {
        let response = response.into_response();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn json_body(value: Value) -> Result<Json<Value>, JsonRejection> {
        Ok(Json(value))
    }

    #[tokio::test]
    async fn post_reading_creates_and_notifies_once() {
        let fx = fixture();
        let (status, body) = respond(
            create_reading(
                State(fx.state.clone()),
                json_body(json!({"sensor": fx.sensor_id, "value": 6.2})),
            )
            .await,
        )
        .await;

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["sensor"], fx.sensor_id);
        assert_eq!(body["value"], 6.2);
        assert_eq!(body["sensor_type"], "ph");
        assert_eq!(body["device_name"], "Hydroponic System 1");
        assert_eq!(*fx.counter.readings.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn post_reading_validation() {
        let fx = fixture();

        let (status, _) = respond(
            create_reading(
                State(fx.state.clone()),
                json_body(json!({"sensor": fx.sensor_id, "value": "abc"})),
            )
            .await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = respond(
            create_reading(State(fx.state.clone()), json_body(json!({"value": 1}))).await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = respond(
            create_reading(
                State(fx.state.clone()),
                json_body(json!({"sensor": 999, "value": 1})),
            )
            .await,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "sensor 999 not found");
        assert_eq!(fx.store.reading_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn patch_device_status() {
        let fx = fixture();
        let (status, body) = respond(
            update_device(
                State(fx.state.clone()),
                Path(fx.device_id.to_string()),
                json_body(json!({"status": "inactive"})),
            )
            .await,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "inactive");
        assert_eq!(*fx.counter.statuses.lock().unwrap(), 1);

        for id in ["999", "seven"] {
            let (status, _) = respond(
                update_device(
                    State(fx.state.clone()),
                    Path(id.to_string()),
                    json_body(json!({"status": "inactive"})),
                )
                .await,
            )
            .await;
            assert_eq!(status, StatusCode::NOT_FOUND, "{id}");
        }

        let (status, _) = respond(
            update_device(
                State(fx.state.clone()),
                Path(fx.device_id.to_string()),
                json_body(json!({"status": ""})),
            )
            .await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn latest_data_without_readings() {
        let fx = fixture();
        let (status, body) = respond(
            latest_data(State(fx.state.clone()), Path(fx.sensor_id.to_string())).await,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"message": "No data available"}));

        fx.store.insert_reading(fx.sensor_id, 6.5).unwrap();
        let (status, body) = respond(
            latest_data(State(fx.state.clone()), Path(fx.sensor_id.to_string())).await,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["value"], 6.5);
    }

    #[tokio::test]
    async fn data_history_honours_limit() {
        let fx = fixture();
        for v in [6.0, 6.1, 6.2] {
            fx.store.insert_reading(fx.sensor_id, v).unwrap();
        }

        let query = |limit: &str| {
            Query(HistoryQuery {
                limit: Some(limit.to_string()),
            })
        };

        let (status, body) = respond(
            data_history(
                State(fx.state.clone()),
                Path(fx.sensor_id.to_string()),
                query("2"),
            )
            .await,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let rows = body.as_array().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["value"], 6.2);

        let (status, _) = respond(
            data_history(
                State(fx.state.clone()),
                Path(fx.sensor_id.to_string()),
                query("x"),
            )
            .await,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = respond(
            data_history(
                State(fx.state.clone()),
                Path("999".to_string()),
                Query(HistoryQuery::default()),
            )
            .await,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn websocket_info_uses_host_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("telemetry.local:9000"));
        let (_, body) = respond(websocket_info(headers).await).await;
        assert_eq!(
            body["websocket_endpoints"]["all_sensor_data"],
            "ws://telemetry.local:9000/ws/sensor-data/"
        );
    }

    #[tokio::test]
    async fn api_errors_render_their_bodies() {
        let (status, body) = respond(ApiError::not_found()).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"detail": "Not found."}));

        let (status, body) = respond(ApiError::Unavailable("Too many connections".into())).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["detail"], "Too many connections");

        let (status, body) = respond(ApiError::Internal("disk on fire".into())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["detail"], "Internal server error");
    }
}
