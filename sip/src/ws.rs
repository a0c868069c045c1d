use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::Stream;
use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::{accept_hdr_async, client_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::message::Message;
use crate::tls::{client_config, is_cert_error};
use crate::transport::{
    Channel, Dispatch, DispatchSender, EndPoint, NetError, TransportType,
};

type WsSink =
    Box<dyn Sink<tungstenite::Message, Error = tungstenite::Error> + Send + Unpin>;

struct WsInner {
    destination: EndPoint,
    events: DispatchSender,
    sink: tokio::sync::Mutex<Option<WsSink>>,
    origin: std::sync::RwLock<Option<SocketAddr>>,
    connected: AtomicBool,
    closed: AtomicBool,
    reader: std::sync::RwLock<Option<JoinHandle<()>>>,
}

/// A WebSocket channel (RFC 7118): one text frame carries one SIP message.
/// Serves both `ws` and `wss` destinations, the latter running over the
/// shared rustls connector.
#[derive(Clone)]
pub struct WsChannel {
    inner: Arc<WsInner>,
}

impl fmt::Debug for WsChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WsChannel")
            .field("destination", &self.inner.destination)
            .finish()
    }
}

impl WsChannel {
    pub fn new(destination: EndPoint, events: DispatchSender) -> WsChannel {
        WsChannel {
            inner: Arc::new(WsInner {
                destination,
                events,
                sink: tokio::sync::Mutex::new(None),
                origin: std::sync::RwLock::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reader: std::sync::RwLock::new(None),
            }),
        }
    }

    /// Adopts a stream the listener accepted and upgraded.
    pub(crate) fn from_accepted<S>(
        ws: WebSocketStream<S>,
        transport: TransportType,
        local: SocketAddr,
        peer: SocketAddr,
        events: DispatchSender,
    ) -> WsChannel
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let destination =
            EndPoint::new(peer.ip().to_string(), peer.port(), transport);
        let channel = WsChannel::new(destination, events);
        let (sink, stream) = ws.split();
        channel.adopt(Box::new(sink), stream, local, peer);
        channel
    }

    fn adopt<S>(
        &self,
        sink: WsSink,
        stream: S,
        local: SocketAddr,
        peer: SocketAddr,
    ) where
        S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
            + Send
            + Unpin
            + 'static,
    {
        *self
            .inner
            .sink
            .try_lock()
            .expect("sink uncontended at adopt") = Some(sink);
        *self.inner.origin.write().expect("origin lock") = Some(local);
        self.inner.connected.store(true, Ordering::SeqCst);
        let reader = tokio::spawn(serve_stream(self.inner.clone(), stream, peer));
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
            self.inner.destination.transport,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn connect(&self) {
        let channel = self.clone();
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let endpoint = inner.destination.clone();
            let secure = endpoint.transport == TransportType::Wss;
            let url = format!(
                "{}://{}:{}/",
                if secure { "wss" } else { "ws" },
                endpoint.host,
                endpoint.port
            );

            let tcp = match TcpStream::connect(endpoint.addr().as_str()).await {
                Ok(s) => s,
                Err(e) => {
                    let _ = inner
                        .events
                        .send(Dispatch::Connected {
                            endpoint,
                            result: Err(e.into()),
                        })
                        .await;
                    return;
                }
            };
            let local = tcp.local_addr().ok();
            let peer = tcp.peer_addr().ok();

            let stream = if secure {
                let server_name =
                    match ServerName::try_from(endpoint.host.as_str()) {
                        Ok(n) => n,
                        Err(_) => {
                            let _ = inner
                                .events
                                .send(Dispatch::Connected {
                                    endpoint,
                                    result: Err(NetError::Transport(
                                        "invalid tls server name".into(),
                                    )),
                                })
                                .await;
                            return;
                        }
                    };
                let connector = TlsConnector::from(client_config());
                match connector.connect(server_name, tcp).await {
                    Ok(tls) => MaybeTlsStream::Rustls(tls),
                    Err(e) => {
                        if is_cert_error(&e) {
                            let _ = inner
                                .events
                                .send(Dispatch::SslCertError {
                                    endpoint,
                                    error: e.to_string(),
                                    fatal: false,
                                })
                                .await;
                        } else {
                            let _ = inner
                                .events
                                .send(Dispatch::Connected {
                                    endpoint,
                                    result: Err(e.into()),
                                })
                                .await;
                        }
                        return;
                    }
                }
            } else {
                MaybeTlsStream::Plain(tcp)
            };

            match client_async(url.as_str(), stream).await {
                Ok((ws, _response)) => {
                    let (local, peer) = match (local, peer) {
                        (Some(l), Some(p)) => (l, p),
                        _ => {
                            let _ = inner
                                .events
                                .send(Dispatch::Connected {
                                    endpoint,
                                    result: Err(NetError::Transport(
                                        "no socket address".into(),
                                    )),
                                })
                                .await;
                            return;
                        }
                    };
                    let (sink, stream) = ws.split();
                    channel.adopt(Box::new(sink), stream, local, peer);
                    let _ = inner
                        .events
                        .send(Dispatch::Connected {
                            endpoint,
                            result: Ok(()),
                        })
                        .await;
                }
                Err(e) => {
                    let _ = inner
                        .events
                        .send(Dispatch::Connected {
                            endpoint,
                            result: Err(NetError::Transport(e.to_string())),
                        })
                        .await;
                }
            }
        });
    }

    pub async fn send(&self, message: &Message) -> Result<(), NetError> {
        let mut sink = self.inner.sink.lock().await;
        let conn = sink.as_mut().ok_or(NetError::SocketNotConnected)?;
        conn.send(tungstenite::Message::Text(message.to_string()))
            .await
            .map_err(|e| NetError::Transport(e.to_string()))?;
        Ok(())
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(reader) = self.inner.reader.write().expect("reader lock").take()
        {
            reader.abort();
        }
        if let Ok(mut sink) = self.inner.sink.try_lock() {
            sink.take();
        }
    }
}

async fn serve_stream<S>(inner: Arc<WsInner>, mut stream: S, peer: SocketAddr)
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame {
            Ok(frame) if frame.is_text() => {
                let text = match frame.to_text() {
                    Ok(t) => t,
                    Err(_) => continue,
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
                    Err(e) => warn!("dropped malformed ws frame from {peer}: {e}"),
                }
            }
            Ok(frame) if frame.is_close() => break,
            Ok(_) => {}
            Err(e) => {
                debug!("ws connection {peer} errored: {e}");
                break;
            }
        }
    }
    if !inner.closed.load(Ordering::SeqCst) {
        let _ = inner
            .events
            .send(Dispatch::Closed {
                endpoint: inner.destination.clone(),
                error: NetError::ConnectionClosed,
            })
            .await;
    }
}

fn subprotocol_echo(
    request: &Request,
    mut response: Response,
) -> Result<Response, tungstenite::handshake::server::ErrorResponse> {
    if let Some(protocol) = request.headers().get("Sec-WebSocket-Protocol") {
        response
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", protocol.clone());
    }
    Ok(response)
}

pub(crate) async fn serve_listener(
    listener: TcpListener,
    events: DispatchSender,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let events = events.clone();
                tokio::spawn(async move {
                    let local = match stream.local_addr() {
                        Ok(l) => l,
                        Err(_) => return,
                    };
                    match accept_hdr_async(stream, subprotocol_echo).await {
                        Ok(ws) => {
                            let channel = WsChannel::from_accepted(
                                ws,
                                TransportType::Ws,
                                local,
                                peer,
                                events.clone(),
                            );
                            let _ = events
                                .send(Dispatch::Accepted {
                                    channel: Channel::Ws(channel),
                                })
                                .await;
                        }
                        Err(e) => {
                            debug!("ws handshake with {peer} failed: {e}")
                        }
                    }
                });
            }
            Err(e) => {
                warn!("ws accept error {e}");
                return;
            }
        }
    }
}

pub(crate) async fn serve_tls_listener(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    events: DispatchSender,
) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let acceptor = acceptor.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let local = match stream.local_addr() {
                        Ok(l) => l,
                        Err(_) => return,
                    };
                    let tls = match acceptor.accept(stream).await {
                        Ok(t) => t,
                        Err(e) => {
                            debug!("tls handshake with {peer} failed: {e}");
                            return;
                        }
                    };
                    match accept_hdr_async(tls, subprotocol_echo).await {
                        Ok(ws) => {
                            let channel = WsChannel::from_accepted(
                                ws,
                                TransportType::Wss,
                                local,
                                peer,
                                events.clone(),
                            );
                            let _ = events
                                .send(Dispatch::Accepted {
                                    channel: Channel::Ws(channel),
                                })
                                .await;
                        }
                        Err(e) => {
                            debug!("wss handshake with {peer} failed: {e}")
                        }
                    }
                });
            }
            Err(e) => {
                warn!("wss accept error {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn ws_round_trip_through_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = async_channel::unbounded();
        tokio::spawn(serve_listener(listener, tx.clone()));

        let endpoint =
            EndPoint::new("127.0.0.1", addr.port(), TransportType::Ws);
        let client = WsChannel::new(endpoint, tx);
        client.connect();

        let mut accepted = None;
        for _ in 0..2 {
            match tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                Dispatch::Connected { result, .. } => assert!(result.is_ok()),
                Dispatch::Accepted { channel } => accepted = Some(channel),
                other => panic!("unexpected event {other:?}"),
            }
        }
        let accepted = accepted.expect("accepted channel");
        assert!(client.is_connected());

        let msg = Message::from_wire(
            "OPTIONS sip:a@example.com SIP/2.0\r\nCall-ID: w1\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        client.send(&msg).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Dispatch::Incoming { message, .. } => {
                assert_eq!("w1", message.call_id().unwrap())
            }
            other => panic!("unexpected event {other:?}"),
        }

        // And server-to-client over the accepted channel.
        let reply = Message::from_wire(
            "SIP/2.0 200 OK\r\nCall-ID: w1\r\nContent-Length: 0\r\n\r\n",
        )
        .unwrap();
        accepted.send(&reply).await.unwrap();
        match tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            Dispatch::Incoming { message, .. } => {
                assert_eq!(Some(200), message.response_code())
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
}
