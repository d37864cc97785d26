//! Collector: accepts agent connections, persists their events and
//! acknowledges them.
//!
//! ```text
//! Collector::bind ──> Dispatcher (reactor task)
//!                        ├── per-socket reader/writer tasks
//!                        └── WorkerPool (rayon) ──> Store
//! ```
//!
//! The store must already be connected (see
//! [`crate::store::connect_with_backoff`]); the collector does not serve
//! until it is.

pub mod channel;
pub mod dispatcher;
pub mod session;
pub mod worker;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;

use self::channel::{reactor_channel, ReactorEvent, ReactorSender};
use self::dispatcher::Dispatcher;
use self::worker::WorkerPool;
use crate::config::CollectorConfig;
use crate::error::Result;
use crate::identity::Identity;
use crate::store::Store;

pub use session::{SessionState, REASON_DB_DISCONNECTED, REASON_DB_EXCEPTION};

/// Control handle for a running collector. Cheap to clone.
#[derive(Clone)]
pub struct CollectorHandle {
    local_addr: SocketAddr,
    events: ReactorSender,
}

impl CollectorHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Request a graceful stop. Returns false if the collector already exited.
    pub fn shutdown(&self) -> bool {
        self.events.send(ReactorEvent::Shutdown).is_ok()
    }

    /// Re-check store connectivity; the collector stops if it cannot reconnect.
    pub fn check_store(&self) -> bool {
        self.events.send(ReactorEvent::CheckStore).is_ok()
    }
}

pub struct Collector {
    dispatcher: Dispatcher,
    handle: CollectorHandle,
}

impl Collector {
    /// Bind the listener and start the worker pool.
    pub async fn bind(config: &CollectorConfig, store: Arc<dyn Store>) -> Result<Self> {
        let addr = config.listen_addr()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;

        let (tx, rx) = reactor_channel();
        let pool = WorkerPool::new(config.workers.threads, store, tx.clone())?;
        let identity = Identity::local(Some("logship-collector"));

        tracing::info!(addr = %local_addr, "collector listening");

        Ok(Self {
            dispatcher: Dispatcher::new(listener, identity, pool, tx.clone(), rx),
            handle: CollectorHandle {
                local_addr,
                events: tx,
            },
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr
    }

    pub fn handle(&self) -> CollectorHandle {
        self.handle.clone()
    }

    pub async fn run(self) -> Result<()> {
        self.dispatcher.run().await
    }
}

/// Route process signals to the collector: SIGINT/SIGTERM stop it, SIGPIPE
/// triggers a store connectivity check.
pub fn spawn_signal_handlers(handle: CollectorHandle) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        let mut pipe = signal(SignalKind::pipe())?;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        tracing::info!("received SIGINT");
                        handle.shutdown();
                        return;
                    }
                    _ = term.recv() => {
                        tracing::info!("received SIGTERM");
                        handle.shutdown();
                        return;
                    }
                    _ = pipe.recv() => {
                        tracing::warn!("received SIGPIPE");
                        if !handle.check_store() {
                            return;
                        }
                    }
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("received Ctrl-C");
                handle.shutdown();
            }
        });
    }

    Ok(())
}
