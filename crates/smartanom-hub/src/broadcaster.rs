//! Fan-out of committed readings and device status changes.
//!
//! A reading goes to exactly three topics: global and its device receive the
//! full [`ReadingPayload`][crate::protocol::ReadingPayload] as a
//! `sensor_data` frame, its sensor receives the reduced shape as a
//! `sensor_reading` frame. Each payload is serialized once and shared by every
//! recipient.
//!
//! Delivery never waits. A handle whose queue is full, or that has left the
//! open state, is skipped and the drop is logged; other recipients are not
//! affected.

use std::ops::AddAssign;
use std::sync::Arc;

use smartanom_store::StoreHook;
use smartanom_types::{DeviceStatusEvent, Reading, SmartanomError, TopicKey};
use tracing::{debug, error, warn};

use crate::protocol::OutboundFrame;
use crate::registry::TopicRegistry;

/// Outcome of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub dropped: usize,
}

impl AddAssign for FanoutReport {
    fn add_assign(&mut self, rhs: Self) {
        self.delivered += rhs.delivered;
        self.dropped += rhs.dropped;
    }
}

pub struct Broadcaster {
    registry: Arc<TopicRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<TopicRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `reading` to the global, device and sensor topics.
    pub fn broadcast(&self, reading: &Reading) -> FanoutReport {
        let full = encode(&OutboundFrame::SensorData {
            data: reading.into(),
        });
        let reduced = encode(&OutboundFrame::SensorReading {
            data: reading.into(),
        });
        let (Some(full), Some(reduced)) = (full, reduced) else {
            return FanoutReport::default();
        };

        let mut report = FanoutReport::default();
        for topic in TopicKey::for_reading(reading) {
            let payload = match topic {
                TopicKey::Sensor(_) => &reduced,
                TopicKey::Global | TopicKey::Device(_) => &full,
            };
            report += self.push_topic(topic, payload);
        }

        debug!(
            reading_id = reading.id,
            sensor_id = reading.sensor_id,
            delivered = report.delivered,
            dropped = report.dropped,
            "reading broadcast"
        );
        report
    }

    /// Deliver a `device_status` frame to the device topic only.
    pub fn broadcast_status(&self, event: &DeviceStatusEvent) -> FanoutReport {
        let Some(payload) = encode(&OutboundFrame::DeviceStatus {
            device_id: event.device_id,
            status: event.status.clone(),
        }) else {
            return FanoutReport::default();
        };

        let report = self.push_topic(TopicKey::Device(event.device_id), &payload);
        debug!(
            device_id = event.device_id,
            status = %event.status,
            delivered = report.delivered,
            dropped = report.dropped,
            "device status broadcast"
        );
        report
    }

    fn push_topic(&self, topic: TopicKey, payload: &Arc<str>) -> FanoutReport {
        let mut report = FanoutReport::default();
        for handle in self.registry.snapshot(topic) {
            // A handle that closed after the snapshot is skipped without a log.
            if !handle.is_open() {
                continue;
            }
            match handle.push(Arc::clone(payload)) {
                Ok(()) => report.delivered += 1,
                Err(SmartanomError::DeliveryDrop { handle, reason }) => {
                    report.dropped += 1;
                    warn!(%topic, %handle, %reason, "delivery dropped");
                }
                Err(e) => {
                    report.dropped += 1;
                    warn!(%topic, error = %e, "delivery failed");
                }
            }
        }
        report
    }
}

impl StoreHook for Broadcaster {
    fn reading_created(&self, reading: &Reading) {
        self.broadcast(reading);
    }

    fn device_status_changed(&self, event: &DeviceStatusEvent) {
        self.broadcast_status(event);
    }
}

fn encode(frame: &OutboundFrame) -> Option<Arc<str>> {
    match frame.to_json() {
        Ok(text) => Some(Arc::from(text)),
        Err(e) => {
            error!(error = %e, "failed to serialize outbound frame");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ConnectionHandle, ConnectionState};
    use chrono::Utc;
    use serde_json::Value;
    use tokio::sync::mpsc;

    fn reading(sensor_id: i64, device_id: i64) -> Reading {
        Reading {
            id: 1,
            sensor_id,
            sensor_type: "temperature".to_string(),
            device_id,
            device_name: format!("Hydroponic System {device_id}"),
            value: 24.5,
            unit: "celsius".to_string(),
            created_at: Utc::now(),
        }
    }

    fn subscribe(
        registry: &TopicRegistry,
        topic: TopicKey,
        buffer: usize,
    ) -> (ConnectionHandle, mpsc::Receiver<Arc<str>>) {
        let (handle, rx) = ConnectionHandle::new(topic, buffer);
        handle.set_state(ConnectionState::Open);
        registry.join(handle.clone());
        (handle, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<str>>) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = rx.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    #[test]
    fn reading_reaches_global_device_and_sensor_once_each() {
        let registry = Arc::new(TopicRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let (_g1, mut global_a) = subscribe(&registry, TopicKey::Global, 8);
        let (_g2, mut global_b) = subscribe(&registry, TopicKey::Global, 8);
        let (_d, mut device) = subscribe(&registry, TopicKey::Device(2), 8);
        let (_s, mut sensor) = subscribe(&registry, TopicKey::Sensor(5), 8);

        let report = broadcaster.broadcast(&reading(5, 2));
        assert_eq!(report, FanoutReport { delivered: 4, dropped: 0 });

        for rx in [&mut global_a, &mut global_b, &mut device] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0]["type"], "sensor_data");
            assert_eq!(frames[0]["data"]["device_name"], "Hydroponic System 2");
        }
        let frames = drain(&mut sensor);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "sensor_reading");
        assert!(frames[0]["data"].get("device_name").is_none());
    }

    #[test]
    fn unrelated_topics_receive_nothing() {
        let registry = Arc::new(TopicRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let (_other_device, mut other_device) = subscribe(&registry, TopicKey::Device(9), 8);
        let (_other_sensor, mut other_sensor) = subscribe(&registry, TopicKey::Sensor(2), 8);

        broadcaster.broadcast(&reading(5, 2));
        assert!(drain(&mut other_device).is_empty());
        assert!(drain(&mut other_sensor).is_empty());
    }

    #[test]
    fn broadcast_without_subscribers_is_a_no_op() {
        let broadcaster = Broadcaster::new(Arc::new(TopicRegistry::new()));
        assert_eq!(broadcaster.broadcast(&reading(1, 1)), FanoutReport::default());
    }

    #[test]
    fn full_queue_drops_only_for_the_slow_handle() {
        let registry = Arc::new(TopicRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let (_slow, mut slow) = subscribe(&registry, TopicKey::Global, 1);
        let (_fast, mut fast) = subscribe(&registry, TopicKey::Global, 8);

        broadcaster.broadcast(&reading(5, 2));
        let second = broadcaster.broadcast(&reading(5, 2));
        assert_eq!(second, FanoutReport { delivered: 1, dropped: 1 });

        assert_eq!(drain(&mut slow).len(), 1);
        assert_eq!(drain(&mut fast).len(), 2);
    }

    #[test]
    fn closed_handle_in_snapshot_is_skipped() {
        let registry = Arc::new(TopicRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let (handle, mut rx) = subscribe(&registry, TopicKey::Sensor(5), 8);

        // Closed but still registered: the window between state change and leave.
        handle.set_state(ConnectionState::Closed);
        let report = broadcaster.broadcast(&reading(5, 2));
        assert_eq!(report, FanoutReport::default());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn status_goes_to_device_topic_only() {
        let registry = Arc::new(TopicRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let (_d, mut device) = subscribe(&registry, TopicKey::Device(3), 8);
        let (_g, mut global) = subscribe(&registry, TopicKey::Global, 8);
        let (_s, mut sensor) = subscribe(&registry, TopicKey::Sensor(3), 8);

        let report = broadcaster.broadcast_status(&DeviceStatusEvent {
            device_id: 3,
            status: "maintenance".to_string(),
        });
        assert_eq!(report.delivered, 1);

        let frames = drain(&mut device);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["type"], "device_status");
        assert_eq!(frames[0]["device_id"], 3);
        assert_eq!(frames[0]["status"], "maintenance");
        assert!(drain(&mut global).is_empty());
        assert!(drain(&mut sensor).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn close_during_broadcasts_stops_later_deliveries() {
        use crate::{Hub, HubSettings, OpenedConnection};
        use smartanom_store::SqliteStore;
        use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

        async fn wait_for_round(rounds: &AtomicUsize, target: usize) {
            while rounds.load(Ordering::Acquire) < target {
                tokio::task::yield_now().await;
            }
        }

        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let device = store
            .create_device("Hydroponic System 1", "user1@smartanom.com", "active")
            .unwrap();
        let sensor = store
            .create_sensor(device.device_id, "temperature", "celsius")
            .unwrap();
        let hub = Hub::from_sqlite(store, HubSettings::default());

        let stop = Arc::new(AtomicBool::new(false));
        let rounds = Arc::new(AtomicUsize::new(0));
        let pump = tokio::spawn({
            let broadcaster = hub.broadcaster();
            let stop = Arc::clone(&stop);
            let rounds = Arc::clone(&rounds);
            let reading = reading(sensor.sensor_id, device.device_id);
            async move {
                while !stop.load(Ordering::Acquire) {
                    broadcaster.broadcast(&reading);
                    rounds.fetch_add(1, Ordering::AcqRel);
                    tokio::task::yield_now().await;
                }
            }
        });

        let topics = [
            TopicKey::Global,
            TopicKey::Device(device.device_id),
            TopicKey::Sensor(sensor.sensor_id),
        ];
        let workers: Vec<_> = (0..6)
            .map(|i| {
                let hub = hub.clone();
                let rounds = Arc::clone(&rounds);
                let topic = topics[i % topics.len()];
                tokio::spawn(async move {
                    for _ in 0..40 {
                        let OpenedConnection {
                            mut connection,
                            mut outbound,
                            ..
                        } = hub.open(topic).await.unwrap();
                        tokio::task::yield_now().await;
                        connection.close();

                        // A round already running when close returned may
                        // still land; let it finish, then discard the queue.
                        let closed_at = rounds.load(Ordering::Acquire);
                        wait_for_round(&rounds, closed_at + 2).await;
                        while outbound.try_recv().is_ok() {}

                        let settled = rounds.load(Ordering::Acquire);
                        wait_for_round(&rounds, settled + 3).await;
                        assert!(outbound.try_recv().is_err());
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.await.unwrap();
        }
        stop.store(true, Ordering::Release);
        pump.await.unwrap();

        assert_eq!(hub.registry().connection_count(), 0);
        let report = hub.broadcaster().broadcast(&reading(sensor.sensor_id, device.device_id));
        assert_eq!(report, FanoutReport::default());
    }
}
