//! # snowtor
//!
//! A Tor onion-proxy engine for environments that cannot open TCP
//! sockets: all link traffic rides a WebSocket tunnel to a Snowflake
//! bridge. The engine speaks the full client side of the Tor protocols
//! (link TLS and certificate chain, ntor key agreement per hop, signed
//! consensus retrieval with ed-style diffs, weighted path selection,
//! RELAY-cell stream multiplexing) and exposes an HTTP fetch surface on
//! top.
//!
//! ## Architecture
//!
//! ```text
//! TorClient::fetch
//!   ↓
//! Circuit manager (pool, per-host binding, rotation, backoff)
//!   ↓
//! Circuit builder (consensus → microdescs → ntor extensions)
//!   ↓
//! Channel (cells over link TLS)
//!   ↓
//! WebSocket tunnel to the Snowflake bridge
//! ```
//!
//! The engine is single-threaded cooperative: every capability it needs
//! from the outside (the bridge connector, storage, the clock, a local
//! task spawner) is injected at construction, which is also what makes
//! the whole lifecycle testable under a virtual clock.

pub mod circmgr;
pub mod config;
pub mod directory;
mod error;
pub mod fetch;
pub mod http;
pub mod protocol;
pub mod runtime;
pub mod storage;
pub mod transport;

pub use circmgr::{CircuitBuilder, CircuitManager, ManagerStatus};
pub use config::{Ipv6Policy, TorClientConfig};
pub use error::{destroy_reason_name, Result, TorError};
pub use fetch::{FetchRequest, FetchResponse};
pub use runtime::{CancelToken, Clock, SharedClock, SharedSpawner, Spawner, SystemClock, VirtualClock};
pub use storage::{FsStorage, MemoryStorage, SharedStorage, Storage};
pub use transport::{BoxStream, BridgeConnector, ByteStream, IoStream, SharedConnector};

use std::rc::Rc;

/// Main client handle.
pub struct TorClient {
    config: TorClientConfig,
    clock: SharedClock,
    manager: CircuitManager,
    builder: Rc<CircuitBuilder>,
}

impl TorClient {
    /// Assemble a client from its injected capabilities and start
    /// warming the circuit pool.
    pub fn new(
        config: TorClientConfig,
        connector: SharedConnector,
        storage: SharedStorage,
        clock: SharedClock,
        spawner: SharedSpawner,
    ) -> Self {
        let directory = Rc::new(directory::DirectoryClient::new(
            Rc::clone(&storage),
            Rc::clone(&clock),
        ));
        let builder = Rc::new(CircuitBuilder::new(
            connector,
            config.snowflake_url.clone(),
            Rc::clone(&clock),
            Rc::clone(&spawner),
            directory,
            config.connection_timeout_ms,
            config.circuit_timeout_ms,
        ));
        let manager = CircuitManager::new(
            circmgr::ManagerConfig::from(&config),
            Rc::clone(&clock),
            spawner,
            Rc::clone(&builder) as Rc<dyn circmgr::CircuitSource>,
        );
        manager.start();
        log::info!("snowtor client created (buffer {})", config.circuit_buffer);
        Self {
            config,
            clock,
            manager,
            builder,
        }
    }

    /// Fetch a URL through the tunnel.
    pub async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse> {
        self.fetch_with_cancel(request, &CancelToken::new()).await
    }

    /// Fetch with an external cancellation token.
    pub async fn fetch_with_cancel(
        &self,
        request: &FetchRequest,
        cancel: &CancelToken,
    ) -> Result<FetchResponse> {
        fetch::run_fetch(
            &self.manager,
            &self.clock,
            request,
            self.config.circuit_timeout_ms,
            cancel,
        )
        .await
    }

    /// Resolve once a circuit is warm and ready for allocation.
    pub async fn wait_for_circuit(&self) -> Result<()> {
        self.manager
            .wait_for_circuit_ready(&CancelToken::new())
            .await
    }

    /// Snapshot of pool depth, bindings, and backoff state.
    pub fn circuit_state(&self) -> ManagerStatus {
        self.manager.status()
    }

    /// The same snapshot as JSON, for embedders surfacing diagnostics.
    pub fn circuit_state_json(&self) -> String {
        serde_json::to_string(&self.manager.status()).unwrap_or_else(|_| "{}".into())
    }

    /// Shut down: dispose circuits, drop the link.
    pub fn close(&self) {
        self.manager.close();
        self.builder.close();
    }
}
