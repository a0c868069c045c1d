use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::message::Message;
use crate::transport::{
    Dispatch, DispatchSender, EndPoint, NetError, TransportType,
};

struct UdpInner {
    destination: EndPoint,
    events: DispatchSender,
    socket: std::sync::RwLock<Option<Arc<UdpSocket>>>,
    peer: std::sync::RwLock<Option<SocketAddr>>,
    // Set when the socket is the shared listener socket: sends go through
    // send_to and no per-channel receive loop runs.
    shared: bool,
    connected: AtomicBool,
    closed: AtomicBool,
    reader: std::sync::RwLock<Option<JoinHandle<()>>>,
}

/// A datagram channel to one destination. Outbound channels own an
/// ephemeral connected socket; channels minted for listener peers borrow
/// the listener socket.
#[derive(Clone)]
pub struct UdpChannel {
    inner: Arc<UdpInner>,
}

impl fmt::Debug for UdpChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UdpChannel")
            .field("destination", &self.inner.destination)
            .finish()
    }
}

impl UdpChannel {
    pub fn new(destination: EndPoint, events: DispatchSender) -> UdpChannel {
        UdpChannel {
            inner: Arc::new(UdpInner {
                destination,
                events,
                socket: std::sync::RwLock::new(None),
                peer: std::sync::RwLock::new(None),
                shared: false,
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reader: std::sync::RwLock::new(None),
            }),
        }
    }

    /// Wraps the listener socket as a channel to the peer a datagram just
    /// arrived from.
    pub fn for_peer(
        destination: EndPoint,
        peer: SocketAddr,
        socket: Arc<UdpSocket>,
        events: DispatchSender,
    ) -> UdpChannel {
        UdpChannel {
            inner: Arc::new(UdpInner {
                destination,
                events,
                socket: std::sync::RwLock::new(Some(socket)),
                peer: std::sync::RwLock::new(Some(peer)),
                shared: true,
                connected: AtomicBool::new(true),
                closed: AtomicBool::new(false),
                reader: std::sync::RwLock::new(None),
            }),
        }
    }

    pub fn destination(&self) -> &EndPoint {
        &self.inner.destination
    }

    pub fn origin(&self) -> Result<EndPoint, NetError> {
        if !self.is_connected() {
            return Err(NetError::SocketNotConnected);
        }
        let socket = self
            .inner
            .socket
            .read()
            .expect("socket lock")
            .clone()
            .ok_or(NetError::SocketNotConnected)?;
        let local = socket.local_addr()?;
        Ok(EndPoint::new(
            local.ip().to_string(),
            local.port(),
            TransportType::Udp,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn connect(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let endpoint = inner.destination.clone();
            let result = async {
                let mut addrs = lookup_host(endpoint.addr()).await?;
                let peer = addrs.next().ok_or_else(|| {
                    NetError::Transport("destination did not resolve".into())
                })?;
                let bind_addr = if peer.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind_addr).await?;
                socket.connect(peer).await?;
                Ok::<_, NetError>((Arc::new(socket), peer))
            }
            .await;

            let result = match result {
                Ok((socket, peer)) => {
                    *inner.socket.write().expect("socket lock") =
                        Some(socket.clone());
                    *inner.peer.write().expect("peer lock") = Some(peer);
                    inner.connected.store(true, Ordering::SeqCst);
                    let reader =
                        tokio::spawn(run(inner.clone(), socket, peer));
                    *inner.reader.write().expect("reader lock") = Some(reader);
                    Ok(())
                }
                Err(e) => Err(e),
            };
            let _ = inner
                .events
                .send(Dispatch::Connected { endpoint, result })
                .await;
        });
    }

    pub async fn send(&self, message: &Message) -> Result<(), NetError> {
        if !self.is_connected() {
            return Err(NetError::SocketNotConnected);
        }
        let socket = self
            .inner
            .socket
            .read()
            .expect("socket lock")
            .clone()
            .ok_or(NetError::SocketNotConnected)?;
        let text = message.to_string();
        if self.inner.shared {
            let peer = self
                .inner
                .peer
                .read()
                .expect("peer lock")
                .ok_or(NetError::SocketNotConnected)?;
            socket.send_to(text.as_bytes(), peer).await?;
        } else {
            socket.send(text.as_bytes()).await?;
        }
        Ok(())
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.inner.reader.write().expect("reader lock").take()
        {
            reader.abort();
        }
        *self.inner.socket.write().expect("socket lock") = None;
    }
}

async fn run(inner: Arc<UdpInner>, socket: Arc<UdpSocket>, peer: SocketAddr) {
    let mut buf = [0; 4096];
    loop {
        match socket.recv(&mut buf).await {
            Ok(n) => {
                if inner.closed.load(Ordering::SeqCst) {
                    return;
                }
                let text = match std::str::from_utf8(&buf[..n]) {
                    Ok(t) => t,
                    Err(_) => {
                        warn!("udp datagram from {peer} is not utf-8, dropped");
                        continue;
                    }
                };
                match Message::from_wire(text) {
                    Ok(message) => {
                        let _ = inner
                            .events
                            .send(Dispatch::Incoming {
                                endpoint: inner.destination.clone(),
                                peer,
                                message,
                            })
                            .await;
                    }
                    Err(e) => {
                        warn!("dropped malformed datagram from {peer}: {e}")
                    }
                }
            }
            Err(e) => {
                if !inner.closed.load(Ordering::SeqCst) {
                    warn!("udp socket receive error {e}");
                }
                return;
            }
        }
    }
}

/// Receive loop of the listening socket: one datagram is one message, keyed
/// by the peer it came from.
pub(crate) async fn serve_listener(
    socket: Arc<UdpSocket>,
    events: DispatchSender,
) {
    let mut buf = [0; 4096];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, peer)) => {
                let text = match std::str::from_utf8(&buf[..n]) {
                    Ok(t) => t,
                    Err(_) => {
                        warn!("udp datagram from {peer} is not utf-8, dropped");
                        continue;
                    }
                };
                match Message::from_wire(text) {
                    Ok(message) => {
                        let endpoint = EndPoint::new(
                            peer.ip().to_string(),
                            peer.port(),
                            TransportType::Udp,
                        );
                        let _ = events
                            .send(Dispatch::Incoming {
                                endpoint,
                                peer,
                                message,
                            })
                            .await;
                    }
                    Err(e) => {
                        warn!("dropped malformed datagram from {peer}: {e}")
                    }
                }
            }
            Err(e) => {
                warn!("udp listener receive error {e}");
                return;
            }
        }
    }
}
