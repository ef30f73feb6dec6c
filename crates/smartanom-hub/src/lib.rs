//! `smartanom-hub` – real-time fan-out of sensor telemetry.
//!
//! # Architecture
//!
//! ```text
//!   client frame ──► Connection::dispatch ──► IngestionGateway ──► store write
//!                                                                     │
//!                                                        post-commit StoreHook
//!                                                                     ▼
//!   client ◄── outbound queue ◄── TopicRegistry snapshot ◄── Broadcaster
//! ```
//!
//! Writes from any surface (live frames, HTTP, seeding) converge on the
//! store, and the store notifies the [`Broadcaster`] once per committed write.
//! Nothing else triggers a broadcast.
//!
//! # Modules
//!
//! - [`registry`] – [`TopicRegistry`] and [`ConnectionHandle`].
//! - [`protocol`] – inbound/outbound frame types and decoding.
//! - [`ingest`] – [`IngestionGateway`]: validate, then persist.
//! - [`broadcaster`] – [`Broadcaster`]: per-topic payload shaping and delivery.
//! - [`connection`] – [`Connection`]: lifecycle and inbound dispatch.

pub mod broadcaster;
pub mod connection;
pub mod ingest;
pub mod protocol;
pub mod registry;

use std::sync::Arc;

use smartanom_store::{Persistence, SqliteStore};
use smartanom_types::{SmartanomError, TopicKey};
use tokio::sync::Semaphore;

pub use broadcaster::{Broadcaster, FanoutReport};
pub use connection::{Connection, OpenedConnection};
pub use ingest::IngestionGateway;
pub use protocol::{InboundFrame, OutboundFrame};
pub use registry::{ConnectionHandle, ConnectionState, HandleId, TopicRegistry};

/// Tunables for the live subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubSettings {
    /// Capacity of each connection's outbound queue.
    pub outbound_buffer: usize,
    /// Open connections accepted before new ones are refused.
    pub max_connections: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbound_buffer: 64,
            max_connections: 10_000,
        }
    }
}

/// Shared state of the live subsystem. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    store: Arc<dyn Persistence>,
    registry: Arc<TopicRegistry>,
    broadcaster: Arc<Broadcaster>,
    ingest: Arc<IngestionGateway>,
    /// One permit per open connection.
    slots: Arc<Semaphore>,
    settings: HubSettings,
}

impl Hub {
    /// Build a hub over `store`.
    ///
    /// The caller must register [`Hub::broadcaster`] as a post-commit hook on
    /// the store, otherwise nothing is ever delivered. [`Hub::from_sqlite`]
    /// does both.
    pub fn new(store: Arc<dyn Persistence>, settings: HubSettings) -> Self {
        let registry = Arc::new(TopicRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));
        let ingest = Arc::new(IngestionGateway::new(Arc::clone(&store)));
        let slots = Arc::new(Semaphore::new(
            settings.max_connections.min(Semaphore::MAX_PERMITS),
        ));
        Self {
            store,
            registry,
            broadcaster,
            ingest,
            slots,
            settings,
        }
    }

    /// Build a hub over a SQLite store and register its broadcaster as the
    /// store's fan-out hook.
    pub fn from_sqlite(store: Arc<SqliteStore>, settings: HubSettings) -> Self {
        let hub = Self::new(Arc::clone(&store) as Arc<dyn Persistence>, settings);
        store.add_hook(hub.broadcaster());
        hub
    }

    /// Open a connection bound to `topic`.
    pub async fn open(&self, topic: TopicKey) -> Result<OpenedConnection, SmartanomError> {
        Connection::open(self, topic).await
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        Arc::clone(&self.broadcaster)
    }

    pub fn ingest(&self) -> Arc<IngestionGateway> {
        Arc::clone(&self.ingest)
    }

    pub fn store(&self) -> &Arc<dyn Persistence> {
        &self.store
    }

    pub(crate) fn slots(&self) -> &Arc<Semaphore> {
        &self.slots
    }

    pub fn settings(&self) -> HubSettings {
        self.settings
    }
}
