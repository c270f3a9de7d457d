//! Socket plumbing.
//!
//! Each accepted TCP connection is split into a reader task (frames bytes
//! into complete W3GS packets and forwards them as events) and a writer task
//! (drains a channel of outgoing packets). The session owns a [`Connection`]
//! handle per peer and never touches the sockets directly, so every state
//! mutation stays on the session task.

use anyhow::{bail, Result};
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use crate::protocol::W3GS_HEADER_CONSTANT;

/// The game's registered LAN discovery port.
pub const LAN_PORT: u16 = 6112;

pub type ConnId = u32;

/// Events delivered to the session task.
#[derive(Debug)]
pub enum NetEvent {
    /// One complete framed packet from a TCP peer.
    Frame { conn: ConnId, data: Vec<u8> },
    /// The peer disconnected or the stream errored.
    Closed { conn: ConnId },
}

/// Reads one complete W3GS-framed packet from the stream, header included.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;
    if header[0] != W3GS_HEADER_CONSTANT {
        bail!("expected 0xF7 header, got {:02X}", header[0]);
    }
    let total = u16::from_le_bytes([header[2], header[3]]) as usize;
    if total < 4 {
        bail!("declared packet length {} is shorter than the header", total);
    }
    let mut buf = vec![0u8; total];
    buf[..4].copy_from_slice(&header);
    stream.read_exact(&mut buf[4..]).await?;
    Ok(buf)
}

/// Send handle for one TCP peer, owned by the session.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub peer: SocketAddr,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl Connection {
    /// Splits the stream into reader/writer tasks and returns the send
    /// handle. Dropping the handle closes the writer, which shuts the
    /// socket down.
    pub fn spawn(id: ConnId, stream: TcpStream, peer: SocketAddr, events: mpsc::UnboundedSender<NetEvent>) -> Self {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

        tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half).await {
                    Ok(data) => {
                        if events.send(NetEvent::Frame { conn: id, data }).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        tracing::debug!("[net] [read_end] conn={} err={}", id, err);
                        let _ = events.send(NetEvent::Closed { conn: id });
                        break;
                    }
                }
            }
        });

        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
            let _ = write_half.shutdown().await;
        });

        Self { id, peer, tx }
    }

    /// Queues a packet for the writer task. Failures mean the peer is gone;
    /// the reader task reports that separately, so they are ignored here.
    pub fn send(&self, data: Vec<u8>) {
        let _ = self.tx.send(data);
    }

    /// A connection backed by a bare channel instead of a socket, so session
    /// logic can be exercised without network I/O.
    #[cfg(test)]
    pub fn test_pair(id: ConnId) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = SocketAddr::from(([127, 0, 0, 1], 40000 + id as u16));
        (Self { id, peer, tx }, rx)
    }
}

/// Datagrams the session asks the announcer to put on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UdpOut {
    /// Broadcast to the LAN discovery port.
    Broadcast(Vec<u8>),
    /// Unicast reply, e.g. to a `SEARCHGAME` probe.
    To(SocketAddr, Vec<u8>),
}

/// The UDP side of the host: receives discovery probes and carries the
/// session's announcements.
pub struct Announcer {
    pub socket: UdpSocket,
    broadcast_addr: SocketAddr,
}

impl Announcer {
    pub async fn bind(port: u16) -> Result<Self> {
        let socket = UdpSocket::bind(("0.0.0.0", port)).await?;
        socket.set_broadcast(true)?;
        tracing::info!("[udp] [ready] port={}", port);
        Ok(Self {
            socket,
            broadcast_addr: SocketAddr::from((Ipv4Addr::BROADCAST, LAN_PORT)),
        })
    }

    /// Sends best-effort: a full socket buffer drops the datagram rather
    /// than stalling the session.
    pub fn dispatch(&self, out: &[UdpOut]) {
        for datagram in out {
            let (addr, data) = match datagram {
                UdpOut::Broadcast(data) => (self.broadcast_addr, data),
                UdpOut::To(addr, data) => (*addr, data),
            };
            if let Err(err) = self.socket.try_send_to(data, addr) {
                tracing::debug!("[udp] [send_dropped] to={} err={}", addr, err);
            }
        }
    }
}
