use std::fmt::{Display, Formatter};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use rustc_hash::FxHashSet;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::FmtpError;

/// Stable identifier of a connected receiver's recovery socket.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ReceiverId(u32);

impl ReceiverId {
    pub fn from_raw(value: u32) -> ReceiverId {
        ReceiverId(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

impl Display for ReceiverId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Listens for recovery connections from receivers and tracks which receivers
/// are currently connected. Binding happens here, in `bind()`, which the
/// supervisor calls from `start()` - constructors never touch sockets.
pub struct RetxListener {
    listener: TcpListener,
    local_port: u16,
    next_receiver: AtomicU32,
    connected: RwLock<FxHashSet<ReceiverId>>,
}

impl RetxListener {
    /// Binds the recovery listener. Port 0 lets the operating system choose;
    /// the effective port is available through `local_port()`.
    pub async fn bind(addr: Ipv4Addr, port: u16) -> Result<RetxListener, FmtpError> {
        let listener = TcpListener::bind(SocketAddr::from(SocketAddrV4::new(addr, port)))
            .await
            .map_err(|e| FmtpError::ConfigFailed(format!("binding recovery listener to {addr}:{port}: {e}")))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| FmtpError::ConfigFailed(format!("querying recovery listener address: {e}")))?
            .port();

        info!("recovery listener bound to {addr}:{local_port}");
        Ok(RetxListener {
            listener,
            local_port,
            next_receiver: AtomicU32::new(0),
            connected: RwLock::new(FxHashSet::default()),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Accepts the next receiver connection, enables keep-alive on it and
    /// registers the new id in the connected set.
    pub async fn accept(&self) -> Result<(ReceiverId, TcpStream), FmtpError> {
        let (stream, peer_addr) = self
            .listener
            .accept()
            .await
            .map_err(|e| FmtpError::EgressFailed(format!("accepting recovery connection: {e}")))?;
        set_keep_alive(&stream)?;

        let receiver_id = ReceiverId(self.next_receiver.fetch_add(1, Ordering::Relaxed));
        self.connected.write().await.insert(receiver_id);
        debug!("receiver {receiver_id} connected from {peer_addr}");
        Ok((receiver_id, stream))
    }

    /// Snapshot of the currently connected receivers.
    pub async fn connected_receivers(&self) -> FxHashSet<ReceiverId> {
        self.connected.read().await.clone()
    }

    /// Unregisters a receiver whose worker has exited.
    pub async fn remove(&self, receiver_id: ReceiverId) {
        self.connected.write().await.remove(&receiver_id);
        debug!("receiver {receiver_id} unregistered");
    }
}

/// Keep-alive makes a vanished receiver surface as a read error on its worker
/// (60s idle, 30s probe interval, 5 probes).
fn set_keep_alive(stream: &TcpStream) -> Result<(), FmtpError> {
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(30))
        .with_retries(5);
    SockRef::from(stream)
        .set_tcp_keepalive(&keepalive)
        .map_err(|e| FmtpError::ConfigFailed(format!("enabling TCP keep-alive: {e}")))
}
