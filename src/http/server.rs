//! HTTP server setup.
//!
//! # Responsibilities
//! - Compile the configuration into the shared server context
//! - Bind one listener per configured port
//! - Run an accept loop per listener, one task per connection
//! - Drain open connections on shutdown, bounded by a deadline

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;

use crate::config::{HttpdConfig, ValidationError};
use crate::http::context::{Connection, ServerContext};
use crate::lifecycle::Shutdown;
use crate::net::connection::ConnectionTracker;
use crate::net::listener::{Listener, ListenerError};

/// Pause after a failed accept (e.g. file descriptor exhaustion).
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// The HTTP server.
pub struct HttpServer {
    ctx: Arc<ServerContext>,
    listen: Vec<(u16, String)>,
    connection_limit: Arc<Semaphore>,
    shutdown_timeout: Duration,
}

impl HttpServer {
    /// Create a new HTTP server with the given configuration.
    pub fn new(config: &HttpdConfig) -> Result<Self, ValidationError> {
        let ctx = ServerContext::from_config(config)?;
        let listen = ctx.router.listen_addresses();
        Ok(Self {
            ctx: Arc::new(ctx),
            listen,
            connection_limit: Arc::new(Semaphore::new(config.listener.max_connections)),
            shutdown_timeout: Duration::from_secs(config.listener.shutdown_timeout_secs),
        })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.ctx
    }

    /// Bind every configured port. The first failure aborts.
    pub async fn bind(&self) -> Result<Vec<Listener>, ListenerError> {
        let mut listeners = Vec::with_capacity(self.listen.len());
        for (port, bind) in &self.listen {
            listeners.push(Listener::bind(bind, *port, Arc::clone(&self.connection_limit)).await?);
        }
        Ok(listeners)
    }

    /// Serve virtual hosts configured under `port` on an already bound socket.
    pub fn listener(&self, inner: TcpListener, port: u16) -> Listener {
        Listener::new(inner, port, Arc::clone(&self.connection_limit))
    }

    /// Accept connections until `signal` resolves, then drain.
    pub async fn run<F>(self, listeners: Vec<Listener>, signal: F)
    where
        F: Future<Output = ()>,
    {
        let shutdown = Shutdown::new();
        let tracker = ConnectionTracker::new();

        let accepts: Vec<_> = listeners
            .into_iter()
            .map(|listener| {
                tokio::spawn(accept_loop(
                    listener,
                    Arc::clone(&self.ctx),
                    shutdown.clone(),
                    tracker.clone(),
                ))
            })
            .collect();

        signal.await;
        tracing::info!(active_connections = tracker.active_count(), "Shutdown requested");
        shutdown.trigger();
        for task in accepts {
            let _ = task.await;
        }

        if tracker.wait_for_shutdown(self.shutdown_timeout).await {
            tracing::info!("All connections drained");
        } else {
            tracing::warn!(
                remaining = tracker.active_count(),
                "Shutdown deadline reached with connections still open"
            );
        }
    }
}

async fn accept_loop(listener: Listener, ctx: Arc<ServerContext>, shutdown: Shutdown, tracker: ConnectionTracker) {
    let mut signal = shutdown.subscribe();
    loop {
        let accepted = tokio::select! {
            _ = signal.recv() => break,
            accepted = listener.accept() => accepted,
        };
        let (stream, peer, permit) = match accepted {
            Ok(accepted) => accepted,
            Err(ListenerError::Closed) => break,
            Err(e) => {
                tracing::warn!(port = listener.port(), error = %e, "Accept failed");
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };
        let local = match stream.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                tracing::debug!(peer_addr = %peer, error = %e, "Connection gone before setup");
                continue;
            }
        };
        let _ = stream.set_nodelay(true);

        let guard = tracker.track();
        let conn = Connection::new(stream, peer, local, listener.port(), Arc::clone(&ctx), guard.id());
        let conn_signal = shutdown.subscribe();
        tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            conn.serve(conn_signal).await;
        });
    }
    tracing::debug!(port = listener.port(), "Accept loop stopped");
}
