//! One live client session and its inbound frame dispatcher.
//!
//! A [`Connection`] is bound to exactly one topic for its whole life. It is
//! registered in the [`TopicRegistry`] only while open, and frames from the
//! client are handled strictly in arrival order: the transport awaits
//! [`Connection::dispatch`] before reading the next frame.

use std::sync::Arc;

use serde_json::Value;
use smartanom_store::Persistence;
use smartanom_types::{SensorId, SmartanomError, TopicKey};
use tokio::sync::{OwnedSemaphorePermit, mpsc};
use tracing::{debug, info, warn};

use crate::Hub;
use crate::ingest::IngestionGateway;
use crate::protocol::{
    self, DeviceInfo, GLOBAL_WELCOME, InboundFrame, OutboundFrame, SensorInfo,
};
use crate::registry::{ConnectionHandle, ConnectionState, HandleId, TopicRegistry};

/// A freshly opened connection plus what the transport needs to drive it.
pub struct OpenedConnection {
    pub connection: Connection,
    /// Broadcast payloads queued for this client, already serialized.
    pub outbound: mpsc::Receiver<Arc<str>>,
    /// The first frame to send.
    pub welcome: OutboundFrame,
}

pub struct Connection {
    handle: ConnectionHandle,
    registry: Arc<TopicRegistry>,
    store: Arc<dyn Persistence>,
    ingest: Arc<IngestionGateway>,
    /// Held while open; returned to the hub on close.
    slot: Option<OwnedSemaphorePermit>,
}

impl Connection {
    /// Validate `topic`, build the welcome frame and join the registry.
    ///
    /// # Errors
    ///
    /// - [`SmartanomError::NotFound`] when a device or sensor topic names a
    ///   record that does not exist.
    /// - [`SmartanomError::Transport`] when the connection limit is reached.
    /// - [`SmartanomError::Storage`] when the lookup fails.
    ///
    /// On error the connection is never registered.
    pub(crate) async fn open(hub: &Hub, topic: TopicKey) -> Result<OpenedConnection, SmartanomError> {
        let settings = hub.settings();
        // Reserve the slot before any await so concurrent opens cannot
        // overshoot the limit. A failed validation drops it again.
        let slot = Arc::clone(hub.slots()).try_acquire_owned().map_err(|_| {
            warn!(%topic, limit = settings.max_connections, "connection refused: limit reached");
            SmartanomError::Transport(format!(
                "connection limit of {} reached",
                settings.max_connections
            ))
        })?;

        let welcome = welcome_for(hub.store().as_ref(), topic).await?;

        let (handle, outbound) = ConnectionHandle::new(topic, settings.outbound_buffer);
        handle.set_state(ConnectionState::Open);
        hub.registry().join(handle.clone());
        info!(handle = %handle.id(), %topic, "connection open");

        let connection = Connection {
            handle,
            registry: Arc::clone(hub.registry()),
            store: Arc::clone(hub.store()),
            ingest: hub.ingest(),
            slot: Some(slot),
        };
        Ok(OpenedConnection {
            connection,
            outbound,
            welcome,
        })
    }

    pub fn id(&self) -> HandleId {
        self.handle.id()
    }

    pub fn topic(&self) -> TopicKey {
        self.handle.topic()
    }

    pub fn state(&self) -> ConnectionState {
        self.handle.state()
    }

    /// Handle one inbound text frame.
    ///
    /// Returns the private reply for this client, if any. Successful writes
    /// produce no reply; the client sees its reading through the normal
    /// broadcast like everyone else.
    pub async fn dispatch(&self, text: &str) -> Option<OutboundFrame> {
        if self.state() != ConnectionState::Open {
            return None;
        }

        let frame = match protocol::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(handle = %self.id(), error = %e, "rejected inbound frame");
                let message = match e {
                    SmartanomError::MalformedFrame(msg) => msg,
                    other => other.to_string(),
                };
                return Some(OutboundFrame::error(message));
            }
        };

        match frame {
            InboundFrame::Ping { timestamp } => Some(OutboundFrame::Pong { timestamp }),
            InboundFrame::SensorData { sensor_id, value } => self.submit(sensor_id, value).await,
            InboundFrame::SensorReading { value } => self.submit(None, value).await,
            InboundFrame::DeviceStatus { status } => self.update_status(status).await,
        }
    }

    async fn submit(&self, frame_sensor: Option<SensorId>, value: Value) -> Option<OutboundFrame> {
        let sensor_id = match self.topic() {
            TopicKey::Global => match frame_sensor {
                Some(id) => id,
                None => return Some(OutboundFrame::error("sensor_id is required")),
            },
            // The bound sensor wins over whatever the frame claims.
            TopicKey::Sensor(id) => id,
            TopicKey::Device(_) => {
                debug!(handle = %self.id(), "ignoring reading on device-scoped connection");
                return None;
            }
        };

        match self.ingest.submit(sensor_id, &value).await {
            Ok(_) => None,
            Err(e) => {
                debug!(handle = %self.id(), sensor_id, error = %e, "reading rejected");
                Some(OutboundFrame::error(format!("Error processing sensor data: {e}")))
            }
        }
    }

    async fn update_status(&self, status: Option<String>) -> Option<OutboundFrame> {
        let TopicKey::Device(device_id) = self.topic() else {
            debug!(handle = %self.id(), "ignoring device_status outside a device scope");
            return None;
        };
        let status = status.filter(|s| !s.is_empty())?;

        match self.store.set_device_status(device_id, &status).await {
            Ok(true) => None,
            Ok(false) => Some(OutboundFrame::error(
                SmartanomError::device_not_found(device_id).to_string(),
            )),
            Err(e) => {
                warn!(device_id, error = %e, "device status update failed");
                Some(OutboundFrame::error(format!("Error updating device status: {e}")))
            }
        }
    }

    /// Leave the registry and mark the connection closed. Idempotent.
    pub fn close(&mut self) {
        if self.state() == ConnectionState::Closed {
            return;
        }
        self.registry.leave(self.topic(), self.id());
        self.handle.set_state(ConnectionState::Closed);
        self.slot.take();
        info!(handle = %self.id(), topic = %self.topic(), "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn welcome_for(
    store: &dyn Persistence,
    topic: TopicKey,
) -> Result<OutboundFrame, SmartanomError> {
    let frame = match topic {
        TopicKey::Global => OutboundFrame::ConnectionEstablished {
            message: GLOBAL_WELCOME.to_string(),
        },
        TopicKey::Device(id) => {
            let device = store
                .get_device(id)
                .await?
                .ok_or_else(|| SmartanomError::device_not_found(id))?;
            OutboundFrame::DeviceConnected {
                device: DeviceInfo::from(&device),
            }
        }
        TopicKey::Sensor(id) => {
            let sensor = store
                .get_sensor(id)
                .await?
                .ok_or_else(|| SmartanomError::sensor_not_found(id))?;
            let latest = store.latest_reading(id).await?;
            OutboundFrame::SensorConnected {
                sensor: SensorInfo::new(&sensor, latest.as_ref()),
            }
        }
    };
    Ok(frame)
}
