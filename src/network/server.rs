//! TCP server and connection pump
//!
//! Accepts inbound connections, dials outbound ones, and runs the framed
//! read/write loop for each peer. All protocol decisions live in the node;
//! this layer only moves typed messages and reports connection lifecycle
//! events upstream.

use crate::network::codec::MessageCodec;
use crate::network::message::{Message, NetAddr, ServiceFlags};
use crate::network::peer::{PeerError, PeerId, PeerManager};
use crate::network::unix_time;
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

/// Per-peer outbound queue depth
const PEER_CHANNEL_SIZE: usize = 100;

/// Connection lifecycle and traffic, as seen by the node's dispatch loop
#[derive(Debug)]
pub enum PeerEvent {
    /// Registered and pumping; for outbound peers the node now opens the
    /// handshake by sending `version`
    Connected(PeerId),
    Message(PeerId, Message),
    Disconnected(PeerId),
}

/// TCP listener wrapper
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    /// Bind to a port on all interfaces
    pub async fn bind(port: u16) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_addr = listener.local_addr()?;
        log::info!("listening on {local_addr}");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), std::io::Error> {
        self.listener.accept().await
    }
}

/// Dial a peer
pub async fn connect_to_peer(addr: SocketAddr) -> Result<TcpStream, PeerError> {
    TcpStream::connect(addr)
        .await
        .map_err(|err| PeerError::ConnectionFailed(err.to_string()))
}

/// Run one connection until either side goes away.
///
/// Registers the peer, then pumps: frames from the socket are forwarded as
/// events, messages queued on the peer handle are written out. Dropping
/// the handle (see `PeerManager::close_connection`) ends the loop, which
/// closes the socket. Exactly one `Disconnected` event is emitted.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    magic: u32,
    peer_manager: Arc<PeerManager>,
    event_tx: mpsc::Sender<PeerEvent>,
    outbound: bool,
) -> Result<(), PeerError> {
    let framed = Framed::new(stream, MessageCodec::new(magic));
    let (mut writer, mut reader) = framed.split();

    let (tx, mut rx) = mpsc::channel::<Message>(PEER_CHANNEL_SIZE);
    let net_addr = NetAddr::from_socket_addr(addr, ServiceFlags::empty());
    let id = peer_manager
        .add_peer(net_addr, tx, outbound, unix_time())
        .await?;

    if event_tx.send(PeerEvent::Connected(id)).await.is_err() {
        peer_manager.remove_peer(id).await;
        return Ok(());
    }

    loop {
        tokio::select! {
            outgoing = rx.recv() => {
                match outgoing {
                    Some(msg) => {
                        log::debug!("-> {} to peer {id}", msg.command());
                        if let Err(err) = writer.send(msg).await {
                            log::warn!("write to {addr} failed: {err}");
                            break;
                        }
                        peer_manager.update(id, |p| p.last_send = unix_time()).await;
                    }
                    // Handle dropped: forced disconnect
                    None => break,
                }
            }
            incoming = reader.next() => {
                match incoming {
                    Some(Ok(msg)) => {
                        peer_manager.update(id, |p| p.last_recv = unix_time()).await;
                        if event_tx.send(PeerEvent::Message(id, msg)).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(err)) => {
                        // Malformed framing tears the connection down
                        log::warn!("bad frame from {addr}: {err}");
                        break;
                    }
                    None => {
                        log::info!("peer {addr} closed the connection");
                        break;
                    }
                }
            }
        }
    }

    peer_manager.remove_peer(id).await;
    let _ = event_tx.send(PeerEvent::Disconnected(id)).await;
    Ok(())
}
