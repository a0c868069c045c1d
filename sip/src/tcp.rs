use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message::Message;
use crate::transport::{
    Channel, Dispatch, DispatchSender, EndPoint, NetError, TransportType,
};

struct TcpInner {
    destination: EndPoint,
    events: DispatchSender,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    origin: std::sync::RwLock<Option<SocketAddr>>,
    connected: AtomicBool,
    closed: AtomicBool,
    reader: std::sync::RwLock<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TcpChannel {
    inner: Arc<TcpInner>,
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("destination", &self.inner.destination)
            .finish()
    }
}

impl TcpChannel {
    pub fn new(destination: EndPoint, events: DispatchSender) -> TcpChannel {
        TcpChannel {
            inner: Arc::new(TcpInner {
                destination,
                events,
                writer: tokio::sync::Mutex::new(None),
                origin: std::sync::RwLock::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reader: std::sync::RwLock::new(None),
            }),
        }
    }

    /// Adopts a connection taken off the listener; the channel is keyed by
    /// the peer address so responses route back over it.
    pub fn from_accepted(
        stream: TcpStream,
        events: DispatchSender,
    ) -> std::io::Result<TcpChannel> {
        let peer = stream.peer_addr()?;
        let local = stream.local_addr()?;
        let destination =
            EndPoint::new(peer.ip().to_string(), peer.port(), TransportType::Tcp);
        let channel = TcpChannel::new(destination, events);
        let (recv, send) = stream.into_split();
        channel.adopt(recv, send, local, peer);
        Ok(channel)
    }

    fn adopt(
        &self,
        recv: OwnedReadHalf,
        send: OwnedWriteHalf,
        local: SocketAddr,
        peer: SocketAddr,
    ) {
        *self
            .inner
            .writer
            .try_lock()
            .expect("writer uncontended at adopt") = Some(send);
        *self.inner.origin.write().expect("origin lock") = Some(local);
        self.inner.connected.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(serve_stream(self.inner.clone(), recv, peer));
        *self.inner.reader.write().expect("reader lock") = Some(reader);
    }

    pub fn destination(&self) -> &EndPoint {
        &self.inner.destination
    }

    pub fn origin(&self) -> Result<EndPoint, NetError> {
        if !self.is_connected() {
            return Err(NetError::SocketNotConnected);
        }
        let local = self
            .inner
            .origin
            .read()
            .expect("origin lock")
            .ok_or(NetError::SocketNotConnected)?;
        Ok(EndPoint::new(
            local.ip().to_string(),
            local.port(),
            TransportType::Tcp,
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
                let stream =
                    TcpStream::connect(endpoint.addr().as_str()).await?;
                let local = stream.local_addr()?;
                let peer = stream.peer_addr()?;
                Ok::<_, NetError>((stream, local, peer))
            }
            .await;

            let result = match result {
                Ok((stream, local, peer)) => {
                    let (recv, send) = stream.into_split();
                    *inner.writer.lock().await = Some(send);
                    *inner.origin.write().expect("origin lock") = Some(local);
                    inner.connected.store(true, Ordering::SeqCst);
                    let reader =
                        tokio::spawn(serve_stream(inner.clone(), recv, peer));
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
        let mut writer = self.inner.writer.lock().await;
        let conn = writer.as_mut().ok_or(NetError::SocketNotConnected)?;
        conn.write_all(message.to_string().as_bytes()).await?;
        conn.flush().await?;
        Ok(())
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.inner.reader.write().expect("reader lock").take()
        {
            reader.abort();
        }
        if let Ok(mut writer) = self.inner.writer.try_lock() {
            writer.take();
        }
    }
}

async fn serve_stream(
    inner: Arc<TcpInner>,
    recv: OwnedReadHalf,
    peer: SocketAddr,
) {
    let mut reader = BufReader::new(recv);
    loop {
        match Message::read_from(&mut reader).await {
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
                if !inner.closed.load(Ordering::SeqCst) {
                    debug!("tcp connection {peer} ended: {e}");
                    let _ = inner
                        .events
                        .send(Dispatch::Closed {
                            endpoint: inner.destination.clone(),
                            error: NetError::ConnectionClosed,
                        })
                        .await;
                }
                return;
            }
        }
    }
}

/// Accept loop: every inbound connection becomes a registered channel.
pub(crate) async fn serve_listener(
    listener: TcpListener,
    events: DispatchSender,
) {
    loop {
        match listener.accept().await {
            Ok((stream, _peer)) => {
                match TcpChannel::from_accepted(stream, events.clone()) {
                    Ok(channel) => {
                        let _ = events
                            .send(Dispatch::Accepted {
                                channel: Channel::Tcp(channel),
                            })
                            .await;
                    }
                    Err(e) => warn!("failed to adopt tcp connection: {e}"),
                }
            }
            Err(e) => {
                warn!("tcp accept error {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn connect_send_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (tx, rx) = async_channel::unbounded();
        let endpoint =
            EndPoint::new("127.0.0.1", addr.port(), TransportType::Tcp);
        let channel = TcpChannel::new(endpoint, tx);
        channel.connect();

        let (mut server, _) = tokio::time::timeout(
            Duration::from_secs(5),
            listener.accept(),
        )
        .await
        .unwrap()
        .unwrap();

        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Dispatch::Connected { result, .. } => assert!(result.is_ok()),
            other => panic!("unexpected event {other:?}"),
        }
        assert!(channel.is_connected());

        let msg = Message::from_wire(
            "OPTIONS sip:a@example.com SIP/2.0\r\nCall-ID: t1\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        channel.send(&msg).await.unwrap();

        let mut buf = vec![0u8; 4096];
        let n = tokio::time::timeout(
            Duration::from_secs(5),
            server.read(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(std::str::from_utf8(&buf[..n])
            .unwrap()
            .starts_with("OPTIONS sip:a@example.com SIP/2.0\r\n"));

        // Peer hangup surfaces as a Closed dispatch.
        drop(server);
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Dispatch::Closed { error, .. } => {
                assert_eq!(NetError::ConnectionClosed, error)
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn accepted_connection_frames_messages() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = async_channel::unbounded();
        tokio::spawn(serve_listener(listener, tx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let channel = match tokio::time::timeout(
            Duration::from_secs(5),
            rx.recv(),
        )
        .await
        .unwrap()
        .unwrap()
        {
            Dispatch::Accepted { channel } => channel,
            other => panic!("unexpected event {other:?}"),
        };
        assert!(channel.is_connected());
        assert_eq!(TransportType::Tcp, channel.destination().transport);

        let wire = "OPTIONS sip:a@b SIP/2.0\r\nCall-ID: t2\r\nContent-Length: 2\r\n\r\nok";
        client.write_all(wire.as_bytes()).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Dispatch::Incoming { message, .. } => {
                assert_eq!("t2", message.call_id().unwrap());
                assert_eq!("ok", message.body().unwrap());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
