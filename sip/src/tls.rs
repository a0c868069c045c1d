use std::fmt;
use std::fs::File;
use std::io::BufReader as StdBufReader;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Result};
use lazy_static::lazy_static;
use tokio::io::{split, AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::rustls::{
    self, Certificate, ClientConfig, PrivateKey, RootCertStore, ServerConfig,
    ServerName,
};
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};
use tracing::{debug, warn};

use crate::message::Message;
use crate::transport::{
    Channel, Dispatch, DispatchSender, EndPoint, NetError, TransportType,
};

lazy_static! {
    static ref CLIENT_CONFIG: Arc<ClientConfig> =
        Arc::new(default_client_config());
}

pub(crate) fn client_config() -> Arc<ClientConfig> {
    CLIENT_CONFIG.clone()
}

fn default_client_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    roots.add_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.iter().map(|ta| {
        rustls::OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));
    ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

// Verifier installed by ReconnectIgnoringLastError: the application has
// already seen and accepted this destination's certificate error.
struct AcceptAnyCert;

impl rustls::client::ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn accept_any_config() -> ClientConfig {
    let mut config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(AcceptAnyCert));
    config
}

pub(crate) fn is_cert_error(e: &std::io::Error) -> bool {
    e.get_ref()
        .and_then(|i| i.downcast_ref::<rustls::Error>())
        .map(|e| matches!(e, rustls::Error::InvalidCertificate(_)))
        .unwrap_or(false)
}

/// Loads a PEM certificate chain and private key into a server config, for
/// the TLS and WSS listeners.
pub fn server_config_from_pem(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Arc<ServerConfig>> {
    let (certs, key) = load_cert_and_key(cert_path, key_path)?;
    Ok(Arc::new(
        ServerConfig::builder()
            .with_safe_defaults()
            .with_no_client_auth()
            .with_single_cert(certs, key)?,
    ))
}

/// Loads a PEM client certificate chain and key, for
/// [`SslCertVerdict::AcceptWithCertificate`](crate::transport::SslCertVerdict).
pub fn client_cert_from_pem(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<(Vec<Certificate>, PrivateKey)> {
    load_cert_and_key(cert_path, key_path)
}

fn load_cert_and_key(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<(Vec<Certificate>, PrivateKey)> {
    let certs = rustls_pemfile::certs(&mut StdBufReader::new(File::open(
        cert_path.as_ref(),
    )?))?
    .into_iter()
    .map(Certificate)
    .collect();

    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut StdBufReader::new(
        File::open(key_path.as_ref())?,
    ))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut StdBufReader::new(
            File::open(key_path.as_ref())?,
        ))?;
    }
    if keys.is_empty() {
        return Err(anyhow!("no private key in {:?}", key_path.as_ref()));
    }
    Ok((certs, PrivateKey(keys.remove(0))))
}

struct TlsInner {
    destination: EndPoint,
    events: DispatchSender,
    config: std::sync::RwLock<Arc<ClientConfig>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<TlsStream<TcpStream>>>>,
    origin: std::sync::RwLock<Option<SocketAddr>>,
    connected: AtomicBool,
    closed: AtomicBool,
    reader: std::sync::RwLock<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct TlsChannel {
    inner: Arc<TlsInner>,
}

impl fmt::Debug for TlsChannel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TlsChannel")
            .field("destination", &self.inner.destination)
            .finish()
    }
}

impl TlsChannel {
    pub fn new(destination: EndPoint, events: DispatchSender) -> TlsChannel {
        TlsChannel {
            inner: Arc::new(TlsInner {
                destination,
                events,
                config: std::sync::RwLock::new(client_config()),
                writer: tokio::sync::Mutex::new(None),
                origin: std::sync::RwLock::new(None),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                reader: std::sync::RwLock::new(None),
            }),
        }
    }

    pub fn from_accepted(
        stream: tokio_rustls::server::TlsStream<TcpStream>,
        events: DispatchSender,
    ) -> std::io::Result<TlsChannel> {
        let peer = stream.get_ref().0.peer_addr()?;
        let local = stream.get_ref().0.local_addr()?;
        let destination =
            EndPoint::new(peer.ip().to_string(), peer.port(), TransportType::Tls);
        let channel = TlsChannel::new(destination, events);
        channel.adopt(TlsStream::from(stream), local, peer);
        Ok(channel)
    }

    fn adopt(
        &self,
        stream: TlsStream<TcpStream>,
        local: SocketAddr,
        peer: SocketAddr,
    ) {
        let (recv, send) = split(stream);
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
            TransportType::Tls,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn connect(&self) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let endpoint = inner.destination.clone();
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
            let config =
                inner.config.read().expect("config lock").clone();
            let connector = TlsConnector::from(config);
            match connector.connect(server_name, tcp).await {
                Ok(stream) => {
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
                    let (recv, send) = split(TlsStream::from(stream));
                    *inner.writer.lock().await = Some(send);
                    *inner.origin.write().expect("origin lock") = Some(local);
                    inner.connected.store(true, Ordering::SeqCst);
                    let reader =
                        tokio::spawn(serve_stream(inner.clone(), recv, peer));
                    *inner.reader.write().expect("reader lock") = Some(reader);
                    let _ = inner
                        .events
                        .send(Dispatch::Connected {
                            endpoint,
                            result: Ok(()),
                        })
                        .await;
                }
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
                }
            }
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

    /// Retry the connection accepting the certificate the application just
    /// waved through.
    pub fn reconnect_ignoring_last_error(&self) {
        *self.inner.config.write().expect("config lock") =
            Arc::new(accept_any_config());
        self.connect();
    }

    /// Retry the connection presenting a client certificate.
    pub fn reconnect_with_certificate(
        &self,
        certs: Vec<Certificate>,
        key: PrivateKey,
    ) {
        let config = ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(RootCertStore::empty())
            .with_client_auth_cert(certs, key);
        match config {
            Ok(mut config) => {
                config
                    .dangerous()
                    .set_certificate_verifier(Arc::new(AcceptAnyCert));
                *self.inner.config.write().expect("config lock") =
                    Arc::new(config);
                self.connect();
            }
            Err(e) => {
                let inner = self.inner.clone();
                tokio::spawn(async move {
                    let _ = inner
                        .events
                        .send(Dispatch::Connected {
                            endpoint: inner.destination.clone(),
                            result: Err(NetError::Transport(e.to_string())),
                        })
                        .await;
                });
            }
        }
    }
}

async fn serve_stream(
    inner: Arc<TlsInner>,
    recv: ReadHalf<TlsStream<TcpStream>>,
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
                    debug!("tls connection {peer} ended: {e}");
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

/// Accept loop for the TLS listener: handshake off the accept task, then
/// register the channel.
pub(crate) async fn serve_listener(
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
                    match acceptor.accept(stream).await {
                        Ok(tls) => match TlsChannel::from_accepted(
                            tls,
                            events.clone(),
                        ) {
                            Ok(channel) => {
                                let _ = events
                                    .send(Dispatch::Accepted {
                                        channel: Channel::Tls(channel),
                                    })
                                    .await;
                            }
                            Err(e) => {
                                warn!("failed to adopt tls connection: {e}")
                            }
                        },
                        Err(e) => debug!("tls handshake with {peer} failed: {e}"),
                    }
                });
            }
            Err(e) => {
                warn!("tls accept error {e}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_any_config_builds() {
        let config = accept_any_config();
        assert!(!config.client_auth_cert_resolver.has_certs());
    }

    #[test]
    fn channel_starts_unconnected() {
        let (tx, _rx) = async_channel::unbounded();
        let endpoint = EndPoint::new("example.com", 5061, TransportType::Tls);
        let channel = TlsChannel::new(endpoint.clone(), tx);
        assert!(!channel.is_connected());
        assert_eq!(NetError::SocketNotConnected, channel.origin().unwrap_err());
        assert_eq!(&endpoint, channel.destination());
    }
}
