//! Async SeedLink v3 server for real-time seismic data distribution.
//!
//! Sample batches fed to the [`MessageManager`] are encoded as 512-byte
//! miniSEED records, kept in a time-ordered [`MessageCache`] and streamed
//! to every connected client whose selection matches.
//!
//! # Example
//!
//! ```no_run
//! # async fn example() -> seedlink_hub_server::Result<()> {
//! use seedlink_hub_server::{SampleBatch, Scnl, SeedLinkServer};
//!
//! let server = SeedLinkServer::bind("0.0.0.0:18000").await?;
//! let manager = server.manager().clone();
//!
//! tokio::spawn(server.run());
//!
//! // Feed samples from any source
//! let batch = SampleBatch {
//!     start_time: 1_705_314_645_000,
//!     sample_rate: 100.0,
//!     samples: vec![0; 100],
//! };
//! manager.process(&Scnl::new("SLH", "BHZ", "XX", "00"), &batch);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod encoder;
pub mod error;
pub mod manager;
pub(crate) mod queue;
pub mod record;
pub(crate) mod registry;
pub(crate) mod select;
pub(crate) mod session;
pub(crate) mod time;

pub use cache::MessageCache;
pub use encoder::{Int32Encoder, RecordEncoder, SampleBatch, log_record};
pub use error::{Result, ServerError};
pub use manager::{ChannelDirectory, InfoResponder, MessageManager};
pub use record::{BinaryRecord, MessageNumberGenerator, Scnl};
pub use time::now_ms;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use registry::ConnectionRegistry;
use session::{Session, SessionContext};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Configuration for [`SeedLinkServer`].
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// First line of the HELLO reply. Default: `"SeedLink v3.0 (2009.260)"`.
    pub software: String,
    /// Second line of the HELLO reply. Default: `"SeedLinkHub_v0.1 SLH"`.
    pub organization: String,
    /// The one station this server serves. Default: `"SLH"`.
    pub station: String,
    /// Network code of that station. Default: `"XX"`.
    pub network: String,
    /// Connections beyond this are closed on accept. Default: `100`.
    pub max_connections: usize,
    /// Per-session outbound queue capacity; 0 = unlimited. Default: `10_000`.
    pub max_queue_size: usize,
    /// Pause after a failed frame write. Zero waits for the next record
    /// instead. Default: 1 s.
    pub message_retry_delay: Duration,
    /// Cache age limit; zero = unlimited. Default: 1 h.
    pub max_cache_age: Duration,
    /// Cache count limit; 0 = unlimited. Default: `10_000`.
    pub max_cache_size: usize,
    /// Idle wake-up of the cache writer. Default: 60 s.
    pub cache_wait_time: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            software: "SeedLink v3.0 (2009.260)".to_owned(),
            organization: "SeedLinkHub_v0.1 SLH".to_owned(),
            station: "SLH".to_owned(),
            network: "XX".to_owned(),
            max_connections: 100,
            max_queue_size: 10_000,
            message_retry_delay: Duration::from_secs(1),
            max_cache_age: Duration::from_secs(3600),
            max_cache_size: 10_000,
            cache_wait_time: cache::DEFAULT_WAIT_TIME,
        }
    }
}

/// Handle for triggering graceful server shutdown.
///
/// Obtained via [`SeedLinkServer::shutdown_handle()`]. Calling [`shutdown()`](Self::shutdown)
/// stops the accept loop, closes every session and stops the cache writer.
pub struct ShutdownHandle {
    tx: watch::Sender<bool>,
}

impl ShutdownHandle {
    /// Signal the server to shut down gracefully.
    pub fn shutdown(&self) {
        let _ = self.tx.send(true);
    }
}

/// Async SeedLink v3 server.
///
/// Binds to a TCP port, accepts client connections, and streams records
/// published through its [`MessageManager`].
pub struct SeedLinkServer {
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    manager: MessageManager,
    registry: ConnectionRegistry,
    cache_writer: Option<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl SeedLinkServer {
    /// Bind to the given address with default configuration.
    pub async fn bind(addr: &str) -> Result<Self> {
        Self::bind_with_config(addr, ServerConfig::default()).await
    }

    /// Bind to the given address with custom configuration.
    ///
    /// Also starts the cache writer task.
    pub async fn bind_with_config(addr: &str, config: ServerConfig) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.map_err(ServerError::Bind)?;

        let cache = MessageCache::new(
            config.max_cache_age,
            config.max_cache_size,
            config.cache_wait_time,
        );
        let cache_writer = cache.start();
        let registry = ConnectionRegistry::new();
        let manager = MessageManager::new(
            &config,
            cache.clone(),
            registry.clone(),
            Arc::new(MessageNumberGenerator::new()),
            time::now_ms(),
        );
        let ctx = Arc::new(SessionContext {
            config,
            cache,
            directory: Arc::new(manager.clone()),
            info: Arc::new(manager.clone()),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(addr, "server bound");
        Ok(Self {
            listener,
            ctx,
            manager,
            registry,
            cache_writer: Some(cache_writer),
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Returns the local address this server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(ServerError::Io)
    }

    /// Returns the handle used to publish data.
    pub fn manager(&self) -> &MessageManager {
        &self.manager
    }

    /// Returns the shared record cache.
    pub fn cache(&self) -> &MessageCache {
        &self.ctx.cache
    }

    /// Returns a handle that can be used to trigger graceful shutdown.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Run the accept loop. Spawns a task per client connection.
    ///
    /// Returns once shutdown is signalled and the cache writer has drained.
    pub async fn run(mut self) {
        loop {
            let (stream, addr) = tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "accept error");
                            continue;
                        }
                    }
                }
                _ = self.shutdown_rx.changed() => {
                    info!("shutdown signal received, stopping accept loop");
                    break;
                }
            };

            stream.set_nodelay(true).ok();

            let session = Arc::new(Session::new(self.registry.next_id(), addr, self.ctx.clone()));
            if !self
                .registry
                .try_register(session.clone(), self.ctx.config.max_connections)
            {
                warn!(
                    %addr,
                    limit = self.ctx.config.max_connections,
                    "connection limit reached, rejecting client"
                );
                drop(stream);
                continue;
            }
            debug!(%addr, session = session.id(), connections = self.registry.count(), "accepted connection");

            let registry = self.registry.clone();
            tokio::spawn(session.run(stream, registry));
        }

        drop(self.listener);
        self.registry.close_all();
        self.ctx.cache.stop();
        if let Some(writer) = self.cache_writer.take() {
            if let Err(e) = writer.await {
                warn!(error = %e, "cache writer failed");
            }
        }
        info!("server stopped");
    }
}
