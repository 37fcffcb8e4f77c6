//! UDP socket handling for probe exchange.
//!
//! One transponder owns the probe socket of one tunnel interface. Socket
//! errors outside of a deliberate shutdown cause the socket to be recreated
//! and the failed operation to be retried once.

use crate::probe::Probe;
use crate::types::{ProbeError, TransponderError};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Receive buffer size; anything longer than a probe is rejected by the codec
const RECV_BUFFER_SIZE: usize = 2048;

/// Receiver of decoded probes
#[async_trait]
pub trait ProbeHandler: Send + Sync {
    /// Handle a probe received from `from`
    async fn handle_probe(&self, transponder: &Arc<Transponder>, from: SocketAddr, probe: Probe);

    /// Called for datagrams that do not decode as a probe; they are dropped either way
    async fn handle_malformed(&self, _transponder: &Arc<Transponder>, _from: SocketAddr, _error: ProbeError) {}
}

/// Probe socket of a single tunnel interface
pub struct Transponder {
    interface: String,
    addr: SocketAddr,
    socket: RwLock<Option<Arc<UdpSocket>>>,
    going_down: AtomicBool,
}

impl Transponder {
    /// Create a new transponder
    ///
    /// # Arguments
    /// * `interface` - Tunnel interface name (e.g., "wg0")
    /// * `addr` - Local address the probe socket binds to
    pub fn new(interface: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            interface: interface.into(),
            addr,
            socket: RwLock::new(None),
            going_down: AtomicBool::new(false),
        }
    }

    /// Tunnel interface name
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Address the socket is actually bound to
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        let socket = self.socket.read().await;
        socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Bind the probe socket
    pub async fn connect(&self) -> Result<(), TransponderError> {
        let socket = Arc::new(Self::bind(self.addr)?);
        info!(
            interface = %self.interface,
            addr = %self.addr,
            "Probe socket bound"
        );
        *self.socket.write().await = Some(socket);
        Ok(())
    }

    /// Send a probe, reconnecting and retrying once on socket error
    pub async fn send(&self, probe: &Probe, to: SocketAddr) -> Result<(), TransponderError> {
        if self.is_going_down() {
            return Err(TransponderError::ShuttingDown);
        }

        let bytes = probe.to_bytes();
        let socket = self.current().await?;

        match socket.send_to(&bytes, to).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if self.is_going_down() {
                    return Err(TransponderError::ShuttingDown);
                }
                warn!(
                    interface = %self.interface,
                    to = %to,
                    sequence = probe.sequence,
                    error = %e,
                    "Failed to send probe, reconnecting"
                );

                let socket = self.reconnect(&socket).await?;
                socket.send_to(&bytes, to).await?;
                Ok(())
            }
        }
    }

    /// Receive probes until cancelled or stopped
    ///
    /// Undecodable datagrams are skipped. Returns an error only if the
    /// socket could not be recreated after a receive failure.
    pub async fn run(
        self: Arc<Self>,
        handler: Arc<dyn ProbeHandler>,
        cancel: CancellationToken,
    ) -> Result<(), TransponderError> {
        info!(interface = %self.interface, "Transponder receive loop started");

        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let socket = match self.current().await {
                Ok(socket) => socket,
                Err(_) if self.is_going_down() => break,
                Err(e) => return Err(e),
            };

            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };

            match received {
                Ok((len, from)) => match Probe::parse(&buf[..len]) {
                    Ok(probe) => {
                        debug!(
                            interface = %self.interface,
                            from = %from,
                            sequence = probe.sequence,
                            "Received probe"
                        );
                        handler.handle_probe(&self, from, probe).await;
                    }
                    Err(e) => {
                        warn!(
                            interface = %self.interface,
                            from = %from,
                            error = %e,
                            "Failed to decode probe, skipping"
                        );
                        handler.handle_malformed(&self, from, e).await;
                    }
                },
                Err(_) if self.is_going_down() => break,
                Err(e) => {
                    warn!(
                        interface = %self.interface,
                        error = %e,
                        "Failed to receive probe, reconnecting"
                    );
                    self.reconnect(&socket).await?;
                }
            }
        }

        info!(interface = %self.interface, "Transponder receive loop stopped");
        Ok(())
    }

    /// Stop the transponder
    ///
    /// Sends issued after this point are no-ops reported as
    /// [`TransponderError::ShuttingDown`].
    pub async fn stop(&self) {
        self.going_down.store(true, Ordering::SeqCst);
        self.socket.write().await.take();
        info!(interface = %self.interface, "Transponder stopped");
    }

    /// Whether [`Transponder::stop`] was called
    pub fn is_going_down(&self) -> bool {
        self.going_down.load(Ordering::SeqCst)
    }

    async fn current(&self) -> Result<Arc<UdpSocket>, TransponderError> {
        let socket = self.socket.read().await;
        socket.clone().ok_or(TransponderError::NotConnected)
    }

    /// Replace `failed` with a freshly bound socket.
    ///
    /// If another task already replaced it, the newer socket is returned.
    async fn reconnect(&self, failed: &Arc<UdpSocket>) -> Result<Arc<UdpSocket>, TransponderError> {
        let mut current = self.socket.write().await;

        if self.is_going_down() {
            return Err(TransponderError::ShuttingDown);
        }

        if let Some(socket) = current.as_ref() {
            if !Arc::ptr_eq(socket, failed) {
                return Ok(socket.clone());
            }
        }

        current.take();
        let socket = Arc::new(Self::bind(self.addr)?);
        *current = Some(socket.clone());

        info!(interface = %self.interface, addr = %self.addr, "Probe socket reconnected");
        Ok(socket)
    }

    fn bind(addr: SocketAddr) -> Result<UdpSocket, TransponderError> {
        let map_err = |source| TransponderError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(map_err)?;

        // Allow rebinding while a previous socket is still draining
        socket.set_reuse_address(true).map_err(map_err)?;
        socket.set_nonblocking(true).map_err(map_err)?;
        socket.bind(&addr.into()).map_err(map_err)?;

        UdpSocket::from_std(socket.into()).map_err(map_err)
    }
}
