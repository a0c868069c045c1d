use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_channel::Sender;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use strum_macros::EnumString;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio_rustls::rustls;

use quasar_timer::OneShot;

use crate::fsm::Input;
use crate::message::Message;
use crate::tcp::TcpChannel;
use crate::tls::TlsChannel;
use crate::udp::UdpChannel;
use crate::ws::WsChannel;

#[derive(
    strum_macros::Display,
    EnumString,
    Debug,
    Eq,
    PartialEq,
    Hash,
    Clone,
    Copy,
    Serialize,
    Deserialize,
)]
#[strum(ascii_case_insensitive)]
pub enum TransportType {
    #[strum(serialize = "udp")]
    Udp,
    #[strum(serialize = "tcp")]
    Tcp,
    #[strum(serialize = "tls")]
    Tls,
    #[strum(serialize = "ws")]
    Ws,
    #[strum(serialize = "wss")]
    Wss,
}

impl Default for TransportType {
    fn default() -> Self {
        TransportType::Udp
    }
}

impl TransportType {
    pub fn default_port(&self) -> u16 {
        match self {
            TransportType::Udp => 5060,
            TransportType::Tcp => 5060,
            TransportType::Tls => 5061,
            TransportType::Ws => 80,
            TransportType::Wss => 443,
        }
    }

    /// Stream transports retransmit in the kernel; the FSM retry timers are
    /// only armed for datagram transports.
    pub fn is_reliable(&self) -> bool {
        !matches!(self, TransportType::Udp)
    }
}

/// The key of the channel registry. Two endpoints are the same destination
/// iff host, port and transport all match.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct EndPoint {
    pub host: String,
    pub port: u16,
    pub transport: TransportType,
}

impl EndPoint {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        transport: TransportType,
    ) -> EndPoint {
        EndPoint {
            host: host.into(),
            port,
            transport,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}:{}", self.transport, self.host, self.port)
    }
}

/// The error taxonomy surfaced at the core boundary.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("no channel factory for {0}")]
    Unreachable(TransportType),
    #[error("aborted")]
    Aborted,
    #[error("socket not connected")]
    SocketNotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error("transaction timed out")]
    TimedOut,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("ssl certificate error: {0}")]
    SslCertError(String),
    #[error("parse failure")]
    ParseFailure,
}

impl From<crate::message::MessageError> for NetError {
    fn from(_: crate::message::MessageError) -> NetError {
        NetError::InvalidArgument
    }
}

impl From<std::io::Error> for NetError {
    fn from(e: std::io::Error) -> NetError {
        NetError::Transport(e.to_string())
    }
}

/// Everything the single dispatch loop consumes: channel callbacks, timer
/// fires and the idle-channel expiry. One queue realizes the one-runner
/// model: no two of these are ever handled concurrently.
#[derive(Debug)]
pub(crate) enum Dispatch {
    Connected {
        endpoint: EndPoint,
        result: Result<(), NetError>,
    },
    Incoming {
        endpoint: EndPoint,
        peer: SocketAddr,
        message: Message,
    },
    Closed {
        endpoint: EndPoint,
        error: NetError,
    },
    SslCertError {
        endpoint: EndPoint,
        error: String,
        fatal: bool,
    },
    Accepted {
        channel: Channel,
    },
    ChannelIdle {
        endpoint: EndPoint,
    },
    TimerFired {
        key: String,
        input: Input,
    },
}

pub(crate) type DispatchSender = Sender<Dispatch>;

/// A transport connection to one destination endpoint.
#[derive(Clone, Debug)]
pub enum Channel {
    Udp(UdpChannel),
    Tcp(TcpChannel),
    Tls(TlsChannel),
    Ws(WsChannel),
    #[cfg(test)]
    Mock(mock::MockChannel),
}

impl Channel {
    pub fn destination(&self) -> &EndPoint {
        match self {
            Channel::Udp(c) => c.destination(),
            Channel::Tcp(c) => c.destination(),
            Channel::Tls(c) => c.destination(),
            Channel::Ws(c) => c.destination(),
            #[cfg(test)]
            Channel::Mock(c) => c.destination(),
        }
    }

    /// The local origin used for Via and Contact stamping. Only available
    /// once the channel is connected.
    pub fn origin(&self) -> Result<EndPoint, NetError> {
        match self {
            Channel::Udp(c) => c.origin(),
            Channel::Tcp(c) => c.origin(),
            Channel::Tls(c) => c.origin(),
            Channel::Ws(c) => c.origin(),
            #[cfg(test)]
            Channel::Mock(c) => c.origin(),
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Channel::Udp(c) => c.is_connected(),
            Channel::Tcp(c) => c.is_connected(),
            Channel::Tls(c) => c.is_connected(),
            Channel::Ws(c) => c.is_connected(),
            #[cfg(test)]
            Channel::Mock(c) => c.is_connected(),
        }
    }

    /// Begins the asynchronous connect; the result arrives as a
    /// `Dispatch::Connected` on the owner's queue.
    pub fn connect(&self) {
        match self {
            Channel::Udp(c) => c.connect(),
            Channel::Tcp(c) => c.connect(),
            Channel::Tls(c) => c.connect(),
            Channel::Ws(c) => c.connect(),
            #[cfg(test)]
            Channel::Mock(c) => c.connect(),
        }
    }

    pub async fn send(&self, message: &Message) -> Result<(), NetError> {
        match self {
            Channel::Udp(c) => c.send(message).await,
            Channel::Tcp(c) => c.send(message).await,
            Channel::Tls(c) => c.send(message).await,
            Channel::Ws(c) => c.send(message).await,
            #[cfg(test)]
            Channel::Mock(c) => c.send(message).await,
        }
    }

    pub fn close(&self) {
        match self {
            Channel::Udp(c) => c.close(),
            Channel::Tcp(c) => c.close(),
            Channel::Tls(c) => c.close(),
            Channel::Ws(c) => c.close(),
            #[cfg(test)]
            Channel::Mock(c) => c.close(),
        }
    }

    /// TLS retry hook: reconnect accepting the certificate that just
    /// failed verification.
    pub fn reconnect_ignoring_last_error(&self) -> Result<(), NetError> {
        match self {
            Channel::Tls(c) => {
                c.reconnect_ignoring_last_error();
                Ok(())
            }
            _ => Err(NetError::InvalidArgument),
        }
    }

    /// TLS retry hook: reconnect presenting a client certificate.
    pub fn reconnect_with_certificate(
        &self,
        certs: Vec<rustls::Certificate>,
        key: rustls::PrivateKey,
    ) -> Result<(), NetError> {
        match self {
            Channel::Tls(c) => {
                c.reconnect_with_certificate(certs, key);
                Ok(())
            }
            _ => Err(NetError::InvalidArgument),
        }
    }
}

/// Owns a channel and its reuse bookkeeping: the number of transactions
/// holding it open, the idle timer armed when that number reaches zero, at
/// most one request queued while the channel is still connecting, and the
/// keys of the transactions bound to it.
pub(crate) struct ChannelContext {
    pub channel: Channel,
    refs: std::sync::Mutex<usize>,
    idle: std::sync::Mutex<Option<OneShot>>,
    pub pending: std::sync::Mutex<Option<Message>>,
    pub transactions: std::sync::Mutex<HashSet<String>>,
}

impl ChannelContext {
    fn new(channel: Channel, pending: Option<Message>) -> ChannelContext {
        ChannelContext {
            channel,
            refs: std::sync::Mutex::new(0),
            idle: std::sync::Mutex::new(None),
            pending: std::sync::Mutex::new(pending),
            transactions: std::sync::Mutex::new(HashSet::new()),
        }
    }

    pub fn refs(&self) -> usize {
        *self.refs.lock().expect("refs lock")
    }
}

pub type ChannelFactory = Arc<
    dyn Fn(&EndPoint) -> Result<Channel, NetError> + Send + Sync,
>;

/// The channel registry: contexts keyed by destination endpoint, created on
/// demand through the per-protocol factories.
pub(crate) struct TransportManager {
    channels: RwLock<HashMap<EndPoint, Arc<ChannelContext>>>,
    factories: std::sync::RwLock<HashMap<TransportType, ChannelFactory>>,
    dispatch: DispatchSender,
    udp_listener: std::sync::RwLock<Option<Arc<UdpSocket>>>,
    reuse_lifetime: Duration,
}

impl TransportManager {
    pub fn new(
        dispatch: DispatchSender,
        reuse_lifetime: Duration,
    ) -> TransportManager {
        let manager = TransportManager {
            channels: RwLock::new(HashMap::new()),
            factories: std::sync::RwLock::new(HashMap::new()),
            dispatch: dispatch.clone(),
            udp_listener: std::sync::RwLock::new(None),
            reuse_lifetime,
        };

        for transport in [
            TransportType::Udp,
            TransportType::Tcp,
            TransportType::Tls,
            TransportType::Ws,
            TransportType::Wss,
        ] {
            let events = dispatch.clone();
            manager.register_factory(
                transport,
                Arc::new(move |endpoint: &EndPoint| {
                    Ok(match endpoint.transport {
                        TransportType::Udp => Channel::Udp(UdpChannel::new(
                            endpoint.clone(),
                            events.clone(),
                        )),
                        TransportType::Tcp => Channel::Tcp(TcpChannel::new(
                            endpoint.clone(),
                            events.clone(),
                        )),
                        TransportType::Tls => Channel::Tls(TlsChannel::new(
                            endpoint.clone(),
                            events.clone(),
                        )),
                        TransportType::Ws | TransportType::Wss => Channel::Ws(
                            WsChannel::new(endpoint.clone(), events.clone()),
                        ),
                    })
                }),
            );
        }
        manager
    }

    pub fn register_factory(
        &self,
        transport: TransportType,
        factory: ChannelFactory,
    ) {
        self.factories
            .write()
            .expect("factories lock")
            .insert(transport, factory);
    }

    pub fn dispatch(&self) -> &DispatchSender {
        &self.dispatch
    }

    pub fn set_udp_listener(&self, socket: Arc<UdpSocket>) {
        *self.udp_listener.write().expect("udp listener lock") = Some(socket);
    }

    pub fn udp_listener(&self) -> Option<Arc<UdpSocket>> {
        self.udp_listener
            .read()
            .expect("udp listener lock")
            .clone()
    }

    pub async fn get(&self, endpoint: &EndPoint) -> Option<Arc<ChannelContext>> {
        self.channels.read().await.get(endpoint).cloned()
    }

    /// Builds a channel through the registered factory without touching the
    /// registry.
    pub fn make_channel(&self, endpoint: &EndPoint) -> Result<Channel, NetError> {
        let factory = self
            .factories
            .read()
            .expect("factories lock")
            .get(&endpoint.transport)
            .cloned()
            .ok_or(NetError::Unreachable(endpoint.transport))?;
        factory(endpoint)
    }

    pub async fn create(
        &self,
        endpoint: EndPoint,
        pending: Option<Message>,
    ) -> Result<Arc<ChannelContext>, NetError> {
        let channel = self.make_channel(&endpoint)?;
        let context = Arc::new(ChannelContext::new(channel, pending));
        self.channels.write().await.insert(endpoint, context.clone());
        Ok(context)
    }

    /// Registers a channel created by a listener. Nothing holds it yet, so
    /// its idle timer starts immediately.
    pub async fn insert_accepted(&self, channel: Channel) -> Arc<ChannelContext> {
        let endpoint = channel.destination().clone();
        let context = Arc::new(ChannelContext::new(channel, None));
        self.arm_idle(&endpoint, &context);
        self.channels
            .write()
            .await
            .insert(endpoint, context.clone());
        context
    }

    pub async fn remove(
        &self,
        endpoint: &EndPoint,
    ) -> Option<Arc<ChannelContext>> {
        self.channels.write().await.remove(endpoint)
    }

    /// Adds a use of the channel, cancelling any running idle timer.
    pub fn request_channel(&self, context: &ChannelContext) {
        let mut refs = context.refs.lock().expect("refs lock");
        *refs += 1;
        if let Some(timer) = context.idle.lock().expect("idle lock").take() {
            timer.stop();
        }
    }

    /// Drops a use of the channel; the last one out arms the idle timer.
    pub fn release_channel(&self, context: &ChannelContext) {
        let mut refs = context.refs.lock().expect("refs lock");
        *refs = refs.saturating_sub(1);
        if *refs == 0 {
            let endpoint = context.channel.destination().clone();
            self.arm_idle(&endpoint, context);
        }
    }

    fn arm_idle(&self, endpoint: &EndPoint, context: &ChannelContext) {
        let dispatch = self.dispatch.clone();
        let endpoint = endpoint.clone();
        let timer = OneShot::start(self.reuse_lifetime, async move {
            let _ = dispatch.send(Dispatch::ChannelIdle { endpoint }).await;
        });
        *context.idle.lock().expect("idle lock") = Some(timer);
    }
}

/// The application's answer to an SSL certificate error.
pub enum SslCertVerdict {
    Deny,
    AcceptOnce,
    AcceptWithCertificate {
        certs: Vec<rustls::Certificate>,
        key: rustls::PrivateKey,
    },
}

/// Arbitrates SSL certificate errors; registered through
/// [`Settings::ssl_cert_error_handler`].
pub trait SslCertErrorHandler: Send + Sync {
    fn handle(
        &self,
        endpoint: &EndPoint,
        error: &str,
        fatal: bool,
    ) -> BoxFuture<'static, SslCertVerdict>;
}

pub type BranchFactory = Arc<dyn Fn() -> String + Send + Sync>;

/// Tunables of the network layer, with the RFC 3261 defaults.
#[derive(Clone)]
pub struct Settings {
    /// Stamped as User-Agent on requests and Server on responses.
    pub software_name: String,
    /// How long an idle channel stays open for reuse.
    pub reuse_lifetime: Duration,
    /// RTT estimate; initial retransmission interval.
    pub t1: Duration,
    /// Retransmission interval cap.
    pub t2: Duration,
    /// Absorption window for spurious retransmissions.
    pub t4: Duration,
    pub branch_factory: BranchFactory,
    pub ssl_cert_error_handler: Option<Arc<dyn SslCertErrorHandler>>,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            software_name: concat!("quasar/", env!("CARGO_PKG_VERSION"))
                .to_string(),
            reuse_lifetime: Duration::from_secs(32),
            t1: Duration::from_millis(500),
            t2: Duration::from_secs(4),
            t4: Duration::from_secs(5),
            branch_factory: Arc::new(|| {
                format!(
                    "{}{}",
                    crate::transaction::MAGIC_COOKIE,
                    quasar_utils::rand_string(20)
                )
            }),
            ssl_cert_error_handler: None,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Settings")
            .field("software_name", &self.software_name)
            .field("reuse_lifetime", &self.reuse_lifetime)
            .field("t1", &self.t1)
            .field("t2", &self.t2)
            .field("t4", &self.t4)
            .finish()
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct MockInner {
        destination: EndPoint,
        origin: EndPoint,
        events: DispatchSender,
        connected: AtomicBool,
        fail_connect: Option<NetError>,
        sent: std::sync::Mutex<Vec<String>>,
        closed: AtomicBool,
    }

    /// A channel that records what it sends and connects on demand,
    /// driving the same dispatch events as a real transport.
    #[derive(Clone)]
    pub struct MockChannel {
        inner: Arc<MockInner>,
    }

    impl fmt::Debug for MockChannel {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.debug_struct("MockChannel")
                .field("destination", &self.inner.destination)
                .finish()
        }
    }

    impl MockChannel {
        pub fn new(
            destination: EndPoint,
            origin: EndPoint,
            events: DispatchSender,
            connected: bool,
            fail_connect: Option<NetError>,
        ) -> MockChannel {
            MockChannel {
                inner: Arc::new(MockInner {
                    destination,
                    origin,
                    events,
                    connected: AtomicBool::new(connected),
                    fail_connect,
                    sent: std::sync::Mutex::new(Vec::new()),
                    closed: AtomicBool::new(false),
                }),
            }
        }

        pub fn destination(&self) -> &EndPoint {
            &self.inner.destination
        }

        pub fn origin(&self) -> Result<EndPoint, NetError> {
            if self.is_connected() {
                Ok(self.inner.origin.clone())
            } else {
                Err(NetError::SocketNotConnected)
            }
        }

        pub fn is_connected(&self) -> bool {
            self.inner.connected.load(Ordering::SeqCst)
        }

        pub fn connect(&self) {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                let result = match &inner.fail_connect {
                    Some(e) => Err(e.clone()),
                    None => {
                        inner.connected.store(true, Ordering::SeqCst);
                        Ok(())
                    }
                };
                let _ = inner
                    .events
                    .send(Dispatch::Connected {
                        endpoint: inner.destination.clone(),
                        result,
                    })
                    .await;
            });
        }

        pub async fn send(&self, message: &Message) -> Result<(), NetError> {
            if !self.is_connected() {
                return Err(NetError::SocketNotConnected);
            }
            self.inner
                .sent
                .lock()
                .expect("sent lock")
                .push(message.to_string());
            Ok(())
        }

        pub fn close(&self) {
            self.inner.closed.store(true, Ordering::SeqCst);
            self.inner.connected.store(false, Ordering::SeqCst);
        }

        pub fn sent(&self) -> Vec<String> {
            self.inner.sent.lock().expect("sent lock").clone()
        }

        pub fn is_closed(&self) -> bool {
            self.inner.closed.load(Ordering::SeqCst)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_equality_needs_all_three() {
        let a = EndPoint::new("10.0.0.1", 5060, TransportType::Udp);
        let b = EndPoint::new("10.0.0.1", 5060, TransportType::Udp);
        let c = EndPoint::new("10.0.0.1", 5060, TransportType::Tcp);
        let d = EndPoint::new("10.0.0.1", 5061, TransportType::Udp);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!("udp:10.0.0.1:5060", a.to_string());
    }

    #[test]
    fn transport_type_parsing() {
        use std::str::FromStr;
        assert_eq!(TransportType::Tls, TransportType::from_str("TLS").unwrap());
        assert_eq!(TransportType::Ws, TransportType::from_str("ws").unwrap());
        assert!(TransportType::from_str("sctp").is_err());
        assert!(!TransportType::Udp.is_reliable());
        assert!(TransportType::Tcp.is_reliable());
    }

    #[test]
    fn settings_defaults() {
        let settings = Settings::default();
        assert_eq!(Duration::from_secs(32), settings.reuse_lifetime);
        assert_eq!(Duration::from_millis(500), settings.t1);
        assert_eq!(Duration::from_secs(4), settings.t2);
        assert_eq!(Duration::from_secs(5), settings.t4);
        let branch = (settings.branch_factory)();
        assert!(branch.starts_with("z9hG4bK"));
        assert!(branch.len() > "z9hG4bK".len());
        assert_ne!(branch, (settings.branch_factory)());
    }
}
