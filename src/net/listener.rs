//! Listening sockets.
//!
//! Every listener shares one semaphore, so `listener.max_connections`
//! bounds the whole server rather than each port. Accepting waits for a
//! free slot before taking the next connection off the backlog.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("cannot listen on {0}: {1}")]
    Bind(String, #[source] io::Error),

    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),

    /// The shared connection limit was shut.
    #[error("connection limit closed")]
    Closed,
}

/// Socket serving the virtual hosts of one configured port.
#[derive(Debug)]
pub struct Listener {
    socket: TcpListener,
    port: u16,
    slots: Arc<Semaphore>,
}

impl Listener {
    /// Bind `address:port`; IPv6 literals are bracketed.
    pub async fn bind(address: &str, port: u16, slots: Arc<Semaphore>) -> Result<Self, ListenerError> {
        let endpoint = if address.contains(':') {
            format!("[{}]:{}", address, port)
        } else {
            format!("{}:{}", address, port)
        };
        match TcpListener::bind(&endpoint).await {
            Ok(socket) => Ok(Self::new(socket, port, slots)),
            Err(e) => Err(ListenerError::Bind(endpoint, e)),
        }
    }

    /// Use a socket bound elsewhere. `port` selects the virtual hosts and
    /// need not equal the socket's own port.
    pub fn new(socket: TcpListener, port: u16, slots: Arc<Semaphore>) -> Self {
        match socket.local_addr() {
            Ok(addr) => tracing::info!(address = %addr, port, "Listening"),
            Err(e) => tracing::warn!(port, error = %e, "Listening on a socket without a local address"),
        }
        Self { socket, port, slots }
    }

    /// Next client, together with the slot it occupies.
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr, ConnectionPermit), ListenerError> {
        let slot = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| ListenerError::Closed)?;
        let (stream, peer) = self.socket.accept().await.map_err(ListenerError::Accept)?;
        tracing::debug!(
            peer_addr = %peer,
            port = self.port,
            free_slots = self.slots.available_permits(),
            "Accepted"
        );
        Ok((stream, peer, ConnectionPermit { _slot: slot }))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

/// One occupied connection slot; dropping it frees the slot.
#[derive(Debug)]
pub struct ConnectionPermit {
    _slot: OwnedSemaphorePermit,
}
