//! `smartanom-gateway` – network surface of the live telemetry stack.
//!
//! One axum server (default `127.0.0.1:8000`) that:
//!
//! 1. **Upgrades** requests on the live paths to WebSocket sessions:
//!    - `/ws/sensor-data/` → every reading
//!    - `/ws/device/{device_id}/` → one device's readings and status changes
//!    - `/ws/sensor/{sensor_id}/` → one sensor's readings
//!
//!    The target is checked before the handshake; an unknown device or
//!    sensor gets a plain `404` and no socket.
//!
//! 2. **Serves** a small JSON API whose writes feed the same store hook as
//!    live frames, so HTTP-created readings are pushed to live clients too.
//!
//! 3. **Serves** an embedded WebSocket test page at `/` and `/websocket-test/`.
//!
//! Trailing slashes are optional on every path.

pub mod api;
pub mod server;

pub use server::{DEFAULT_HOST, DEFAULT_PORT, GatewayServer};
