use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{info, trace};

use crate::config::FmtpSenderConfig;
use crate::error::FmtpError;
use crate::packet_header::{BopMessage, FmtpHeader, FMTP_DATA_LEN, FMTP_HEADER_LEN};

/// This is an abstraction for sending one datagram on the multicast socket,
/// introduced to facilitate mocking the I/O part away for testing
#[cfg_attr(test, automock)]
#[async_trait]
pub trait McastSocket: Send + Sync + 'static {
    async fn send_packet(&self, packet_buf: &[u8]) -> std::io::Result<()>;
}

#[async_trait]
impl McastSocket for UdpSocket {
    async fn send_packet(&self, packet_buf: &[u8]) -> std::io::Result<()> {
        trace!("UDP socket: sending {} bytes to the multicast group", packet_buf.len());
        self.send(packet_buf).await.map(|_| ())
    }
}

/// Opens the multicast UDP socket: TTL and (optionally) the outbound
/// interface are applied, then the socket is connected to the group address
/// so that plain `send` reaches the group.
pub fn open_mcast_socket(
    config: &FmtpSenderConfig,
    interface: Option<Ipv4Addr>,
) -> Result<UdpSocket, FmtpError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| FmtpError::ConfigFailed(format!("creating multicast socket: {e}")))?;
    socket
        .set_multicast_ttl_v4(config.ttl)
        .map_err(|e| FmtpError::ConfigFailed(format!("setting multicast TTL {}: {e}", config.ttl)))?;
    if let Some(interface) = interface {
        socket
            .set_multicast_if_v4(&interface)
            .map_err(|e| FmtpError::ConfigFailed(format!("setting {interface} as default interface: {e}")))?;
    }
    socket
        .set_nonblocking(true)
        .map_err(|e| FmtpError::ConfigFailed(format!("setting multicast socket non-blocking: {e}")))?;
    socket
        .bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())
        .map_err(|e| FmtpError::ConfigFailed(format!("binding multicast socket: {e}")))?;

    let group = SocketAddrV4::new(config.mcast_addr, config.mcast_port);
    socket
        .connect(&group.into())
        .map_err(|e| FmtpError::ConfigFailed(format!("connecting multicast socket to {group}: {e}")))?;

    info!("multicast socket sending to {group} with TTL {}", config.ttl);
    UdpSocket::from_std(socket.into())
        .map_err(|e| FmtpError::ConfigFailed(format!("registering multicast socket: {e}")))
}

/// Routes subsequent multicast traffic through the interface with the given
/// address.
pub fn set_outbound_interface(socket: &UdpSocket, interface: Ipv4Addr) -> Result<(), FmtpError> {
    SockRef::from(socket)
        .set_multicast_if_v4(&interface)
        .map_err(|e| FmtpError::ConfigFailed(format!("setting {interface} as default interface: {e}")))
}

/// Frames and sends the multicast side of the protocol.
///
/// The send buffer is reused across datagrams; callers serialize sends (the
/// product pipeline is the only multicast writer).
pub struct McastPipeline {
    socket: Arc<dyn McastSocket>,
    send_buf: BytesMut,
}

impl McastPipeline {
    pub fn new(socket: Arc<dyn McastSocket>) -> McastPipeline {
        McastPipeline {
            socket,
            send_buf: BytesMut::with_capacity(FMTP_HEADER_LEN + FMTP_DATA_LEN + 6),
        }
    }

    /// Sends one BOP datagram: header followed by the BOP body.
    pub async fn send_bop(&mut self, header: &FmtpHeader, bop: &BopMessage) -> Result<(), FmtpError> {
        self.send_buf.clear();
        header.ser(&mut self.send_buf);
        bop.ser(&mut self.send_buf);
        self.flush().await
    }

    /// Sends one datagram of `header` followed by `payload` (which may be
    /// empty for control frames).
    pub async fn send_frame(&mut self, header: &FmtpHeader, payload: &[u8]) -> Result<(), FmtpError> {
        debug_assert!(payload.len() <= FMTP_DATA_LEN);
        debug_assert_eq!(usize::from(header.payload_len), payload.len());

        self.send_buf.clear();
        header.ser(&mut self.send_buf);
        self.send_buf.put_slice(payload);
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), FmtpError> {
        self.socket
            .send_packet(&self.send_buf)
            .await
            .map_err(|e| FmtpError::EgressFailed(format!("multicast send of {} bytes: {e}", self.send_buf.len())))
    }
}
