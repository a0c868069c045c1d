use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use async_channel::{Receiver, Sender};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::RwLock;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use quasar_timer::OneShot;

use crate::fsm::{self, input_for_code, Input, State};
use crate::message::{Address, Direction, Message, MessageError, Method};
use crate::transport::{
    Channel, ChannelContext, ChannelFactory, Dispatch, DispatchSender, EndPoint,
    NetError, Settings, SslCertVerdict, TransportManager, TransportType,
};
use crate::udp::UdpChannel;
use crate::{tcp, tls, udp, ws};

/// The RFC 3261 branch prefix separating modern branches from RFC 2543 ones.
pub const MAGIC_COOKIE: &str = "z9hG4bK";

#[derive(Debug)]
pub enum Event {
    ChannelConnected {
        endpoint: EndPoint,
        result: Result<(), NetError>,
    },
    ChannelClosed {
        endpoint: EndPoint,
    },
    IncomingRequest(Message),
    IncomingResponse(Message),
    TimedOut(Message),
    TransportError {
        request: Message,
        error: NetError,
    },
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum SendStatus {
    /// The message went to the channel.
    Sent,
    /// A connection attempt is in flight; delivery or failure will surface
    /// through the event stream.
    Pending,
}

/// Client transaction key: topmost Via branch plus the method (the CSeq
/// method for responses). The "c:" prefix keeps the two keyspaces of the
/// shared map apart.
pub fn client_key(message: &Message) -> Result<String, MessageError> {
    let via = message.topmost_via()?;
    let method = transaction_method(message)?;
    Ok(format!("c:{}:{}", via.branch, method))
}

/// Server transaction key per RFC 3261 §17.2.3, with the RFC 2543 composite
/// fallback when the branch lacks the magic cookie. ACK maps to INVITE so
/// the ACK for a non-2xx response finds the INVITE server transaction.
pub fn server_key(message: &Message) -> Result<String, MessageError> {
    let method = match transaction_method(message)? {
        Method::ACK => Method::INVITE,
        m => m,
    };

    let via = message.topmost_via().ok();
    if let Some(via) = via.as_ref() {
        if via.branch.starts_with(MAGIC_COOKIE) {
            return Ok(format!("s:{}:{}:{}", via.branch, via.sent_by(), method));
        }
    }

    // The Request-URI deliberately stays out of the fallback key: responses
    // carry none, and they still have to match.
    let to_tag = message.get_to().and_then(|a| a.tag).unwrap_or_default();
    let from_tag = message.get_from().and_then(|a| a.tag).unwrap_or_default();
    let call_id = message.call_id().unwrap_or("");
    let cseq = message.get_cseq().ok_or(MessageError::InvalidMessage)?;
    let mut key = format!(
        "s:{}:{}:{}:{}:{}:",
        to_tag, from_tag, call_id, cseq.seq, method
    );
    if let Some(via) = via {
        key.push_str(&via.sent_by());
        key.push(':');
        key.push_str(&via.branch);
    }
    Ok(key)
}

fn transaction_method(message: &Message) -> Result<Method, MessageError> {
    match message.method() {
        Some(m) => Ok(m),
        None => Ok(message
            .get_cseq()
            .ok_or(MessageError::InvalidMessage)?
            .method),
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum TxKind {
    Client,
    Server,
}

/// One transaction: its FSM state, the request it was created for, the last
/// response each side saw, the retransmission counter and the four timer
/// slots. The channel is referenced by endpoint and resolved through the
/// registry, never owned.
pub(crate) struct Transaction {
    pub key: String,
    pub kind: TxKind,
    pub method: Method,
    pub endpoint: EndPoint,
    pub reliable: bool,
    pub request: Message,
    pub lock: tokio::sync::Mutex<()>,
    state: std::sync::Mutex<State>,
    response: std::sync::Mutex<Option<Message>>,
    last_response: std::sync::Mutex<Option<Message>>,
    resend_count: std::sync::Mutex<u32>,
    retry: std::sync::Mutex<Option<OneShot>>,
    timeout: std::sync::Mutex<Option<OneShot>>,
    terminate: std::sync::Mutex<Option<OneShot>>,
    provisional: std::sync::Mutex<Option<OneShot>>,
}

impl Transaction {
    fn new(
        key: String,
        kind: TxKind,
        method: Method,
        endpoint: EndPoint,
        request: Message,
    ) -> Transaction {
        let state = match (method == Method::INVITE, kind) {
            (true, TxKind::Client) => State::Calling,
            (true, TxKind::Server) => State::Proceeding,
            (false, _) => State::Trying,
        };
        let reliable = endpoint.transport.is_reliable();
        Transaction {
            key,
            kind,
            method,
            endpoint,
            reliable,
            request,
            lock: tokio::sync::Mutex::new(()),
            state: std::sync::Mutex::new(state),
            response: std::sync::Mutex::new(None),
            last_response: std::sync::Mutex::new(None),
            resend_count: std::sync::Mutex::new(0),
            retry: std::sync::Mutex::new(None),
            timeout: std::sync::Mutex::new(None),
            terminate: std::sync::Mutex::new(None),
            provisional: std::sync::Mutex::new(None),
        }
    }

    pub fn state(&self) -> State {
        *self.state.lock().expect("state lock")
    }

    pub fn set_state(&self, state: State) {
        *self.state.lock().expect("state lock") = state;
    }

    pub fn response(&self) -> Option<Message> {
        self.response.lock().expect("response lock").clone()
    }

    pub fn set_response(&self, message: Message) {
        *self.response.lock().expect("response lock") = Some(message);
    }

    pub fn last_response(&self) -> Option<Message> {
        self.last_response
            .lock()
            .expect("last response lock")
            .clone()
    }

    pub fn set_last_response(&self, message: Message) {
        *self.last_response.lock().expect("last response lock") = Some(message);
    }

    pub fn incr_resend(&self) -> u32 {
        let mut count = self.resend_count.lock().expect("resend lock");
        *count += 1;
        *count
    }

    fn arm(
        slot: &std::sync::Mutex<Option<OneShot>>,
        dispatch: &DispatchSender,
        key: &str,
        delay: Duration,
        input: Input,
    ) {
        let dispatch = dispatch.clone();
        let key = key.to_string();
        let timer = OneShot::start(delay, async move {
            let _ = dispatch.send(Dispatch::TimerFired { key, input }).await;
        });
        *slot.lock().expect("timer lock") = Some(timer);
    }

    pub fn arm_retry(&self, dispatch: &DispatchSender, delay: Duration, input: Input) {
        Self::arm(&self.retry, dispatch, &self.key, delay, input);
    }

    pub fn arm_timeout(&self, dispatch: &DispatchSender, delay: Duration, input: Input) {
        Self::arm(&self.timeout, dispatch, &self.key, delay, input);
    }

    pub fn arm_terminate(&self, dispatch: &DispatchSender, delay: Duration, input: Input) {
        Self::arm(&self.terminate, dispatch, &self.key, delay, input);
    }

    pub fn arm_provisional(&self, dispatch: &DispatchSender, delay: Duration, input: Input) {
        Self::arm(&self.provisional, dispatch, &self.key, delay, input);
    }

    fn cancel(slot: &std::sync::Mutex<Option<OneShot>>) {
        if let Some(timer) = slot.lock().expect("timer lock").take() {
            timer.stop();
        }
    }

    pub fn cancel_retry(&self) {
        Self::cancel(&self.retry);
    }

    pub fn cancel_timeout(&self) {
        Self::cancel(&self.timeout);
    }

    pub fn cancel_provisional(&self) {
        Self::cancel(&self.provisional);
    }

    pub fn cancel_all(&self) {
        Self::cancel(&self.retry);
        Self::cancel(&self.timeout);
        Self::cancel(&self.terminate);
        Self::cancel(&self.provisional);
    }
}

pub(crate) struct Inner {
    settings: Settings,
    pub(crate) transport: TransportManager,
    transactions: RwLock<HashMap<String, Arc<Transaction>>>,
    events: Sender<Event>,
    weak: Weak<Inner>,
}

/// The network layer: owns the channel registry and the transaction map,
/// stamps outgoing requests, and routes every inbound message to its
/// transaction or up to the application.
pub struct TransactionManager {
    inner: Arc<Inner>,
}

impl TransactionManager {
    /// Builds the manager and the application event stream. A dispatch loop
    /// is spawned to serialize channel callbacks and timer fires; it holds
    /// only a weak reference, so dropping the manager stops the loop.
    pub fn new(settings: Settings) -> (TransactionManager, Receiver<Event>) {
        let (dispatch_tx, dispatch_rx) = async_channel::unbounded();
        let (event_tx, event_rx) = async_channel::unbounded();

        let reuse_lifetime = settings.reuse_lifetime;
        let inner = Arc::new_cyclic(|weak| Inner {
            settings,
            transport: TransportManager::new(dispatch_tx, reuse_lifetime),
            transactions: RwLock::new(HashMap::new()),
            events: event_tx,
            weak: weak.clone(),
        });

        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Ok(dispatch) = dispatch_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                inner.handle_dispatch(dispatch).await;
            }
        });

        (TransactionManager { inner }, event_rx)
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Registers a channel factory for one protocol, replacing the default.
    pub fn register_channel_factory(
        &self,
        transport: TransportType,
        factory: ChannelFactory,
    ) {
        self.inner.transport.register_factory(transport, factory);
    }

    /// Submits an outgoing message.
    pub async fn send(&self, message: &Message) -> Result<SendStatus, NetError> {
        if message.direction() != Direction::Outgoing {
            warn!("attempt to send an incoming message");
            return Err(NetError::InvalidArgument);
        }
        if message.is_request() {
            self.inner.send_request(message.clone()).await
        } else {
            self.inner.send_response(message.clone()).await
        }
    }

    /// Builds and submits the CANCEL for an outstanding INVITE client
    /// transaction. The CANCEL copies the INVITE's topmost Via so it forms
    /// its own transaction under the same branch.
    pub async fn cancel(&self, invite: &Message) -> Result<SendStatus, NetError> {
        if invite.method() != Some(Method::INVITE) {
            return Err(NetError::InvalidArgument);
        }
        let request = self.inner.find_invite_request(invite).await?;

        let uri = request
            .request_uri()
            .ok_or(NetError::InvalidArgument)?
            .to_string();
        let mut cancel = Message::request(Method::CANCEL, &uri)
            .map_err(|_| NetError::InvalidArgument)?;
        let via = request
            .enumerate_header("Via")
            .next()
            .map(str::to_string)
            .ok_or(NetError::InvalidArgument)?;
        cancel.add_header(&format!("Via: {}", via))?;
        let routes: Vec<String> = request
            .enumerate_header("Route")
            .map(str::to_string)
            .collect();
        for route in routes {
            cancel.add_header(&format!("Route: {}", route))?;
        }
        for name in ["To", "From", "Call-ID"] {
            if let Some(value) =
                request.enumerate_header(name).next().map(str::to_string)
            {
                cancel.add_header(&format!("{}: {}", name, value))?;
            }
        }
        let cseq = request.get_cseq().ok_or(NetError::InvalidArgument)?;
        cancel.add_header(&format!("CSeq: {} CANCEL", cseq.seq))?;
        cancel.add_header("Max-Forwards: 70")?;
        cancel.add_header("Content-Length: 0")?;

        self.send(&cancel).await
    }

    pub async fn listen_udp(&self, addr: &str) -> Result<SocketAddr> {
        let socket = Arc::new(UdpSocket::bind(addr).await?);
        let local = socket.local_addr()?;
        self.inner.transport.set_udp_listener(socket.clone());
        tokio::spawn(udp::serve_listener(
            socket,
            self.inner.transport.dispatch().clone(),
        ));
        info!("sip listening on udp {local}");
        Ok(local)
    }

    pub async fn listen_tcp(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tokio::spawn(tcp::serve_listener(
            listener,
            self.inner.transport.dispatch().clone(),
        ));
        info!("sip listening on tcp {local}");
        Ok(local)
    }

    pub async fn listen_tls(
        &self,
        addr: &str,
        config: Arc<ServerConfig>,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tokio::spawn(tls::serve_listener(
            listener,
            TlsAcceptor::from(config),
            self.inner.transport.dispatch().clone(),
        ));
        info!("sip listening on tls {local}");
        Ok(local)
    }

    pub async fn listen_ws(&self, addr: &str) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tokio::spawn(ws::serve_listener(
            listener,
            self.inner.transport.dispatch().clone(),
        ));
        info!("sip listening on ws {local}");
        Ok(local)
    }

    pub async fn listen_wss(
        &self,
        addr: &str,
        config: Arc<ServerConfig>,
    ) -> Result<SocketAddr> {
        let listener = TcpListener::bind(addr).await?;
        let local = listener.local_addr()?;
        tokio::spawn(ws::serve_tls_listener(
            listener,
            TlsAcceptor::from(config),
            self.inner.transport.dispatch().clone(),
        ));
        info!("sip listening on wss {local}");
        Ok(local)
    }

    #[cfg(test)]
    pub(crate) fn dispatch_sender(&self) -> DispatchSender {
        self.inner.transport.dispatch().clone()
    }

    #[cfg(test)]
    pub(crate) async fn transaction_count(&self) -> usize {
        self.inner.transactions.read().await.len()
    }
}

impl Inner {
    pub(crate) fn settings(&self) -> &Settings {
        &self.settings
    }

    pub(crate) fn dispatch(&self) -> &DispatchSender {
        self.transport.dispatch()
    }

    pub(crate) async fn emit(&self, event: Event) {
        let _ = self.events.send(event).await;
    }

    pub(crate) async fn channel_send(
        &self,
        endpoint: &EndPoint,
        message: &Message,
    ) -> Result<(), NetError> {
        let context = self
            .transport
            .get(endpoint)
            .await
            .ok_or(NetError::SocketNotConnected)?;
        context.channel.send(message).await
    }

    async fn send_request(&self, mut message: Message) -> Result<SendStatus, NetError> {
        let endpoint = request_destination(&message)?;
        if !message.has_header("User-Agent") {
            message.add_header(&format!(
                "User-Agent: {}",
                self.settings.software_name
            ))?;
        }
        let method = message.method().ok_or(NetError::InvalidArgument)?;

        match self.transport.get(&endpoint).await {
            Some(context) => {
                if context.channel.is_connected() {
                    self.send_on_channel(message, &context).await?;
                    Ok(SendStatus::Sent)
                } else if method != Method::ACK {
                    let mut pending =
                        context.pending.lock().expect("pending lock");
                    if pending.is_some() {
                        Err(NetError::SocketNotConnected)
                    } else {
                        *pending = Some(message);
                        Ok(SendStatus::Pending)
                    }
                } else {
                    Err(NetError::SocketNotConnected)
                }
            }
            None => {
                if method == Method::ACK {
                    debug!("ack requests cannot open connections");
                    return Err(NetError::Aborted);
                }
                let context =
                    self.transport.create(endpoint, Some(message)).await?;
                context.channel.connect();
                Ok(SendStatus::Pending)
            }
        }
    }

    /// The connected-channel half of request sending: stamp Via and
    /// Contact, create the client transaction, hand the bytes over.
    async fn send_on_channel(
        &self,
        mut message: Message,
        context: &ChannelContext,
    ) -> Result<(), NetError> {
        if message.topmost_via().is_err() {
            let origin = context.channel.origin()?;
            let branch = (self.settings.branch_factory)();
            message.push_front_header(&format!(
                "Via: SIP/2.0/{} {}:{};branch={}",
                origin.transport.to_string().to_uppercase(),
                origin.host,
                origin.port,
                branch
            ))?;
        }
        self.stamp_contact(&mut message, context)?;

        let method = message.method().ok_or(NetError::InvalidArgument)?;
        let mut created = None;
        if method != Method::ACK {
            let key = client_key(&message)?;
            if !self.transactions.read().await.contains_key(&key) {
                let endpoint = context.channel.destination().clone();
                let tx = Arc::new(Transaction::new(
                    key.clone(),
                    TxKind::Client,
                    method,
                    endpoint,
                    message.clone(),
                ));
                self.transactions
                    .write()
                    .await
                    .insert(key.clone(), tx.clone());
                context
                    .transactions
                    .lock()
                    .expect("transactions lock")
                    .insert(key);
                self.transport.request_channel(context);

                if !tx.reliable {
                    let input = if method == Method::INVITE {
                        Input::TimerA
                    } else {
                        Input::TimerE
                    };
                    tx.arm_retry(self.dispatch(), self.settings.t1, input);
                }
                let input = if method == Method::INVITE {
                    Input::TimerB
                } else {
                    Input::TimerF
                };
                tx.arm_timeout(self.dispatch(), 64 * self.settings.t1, input);
                created = Some(tx);
            }
        }

        if let Err(e) = context.channel.send(&message).await {
            if let Some(tx) = created {
                self.finish_transaction(&tx).await;
            }
            return Err(e);
        }
        Ok(())
    }

    async fn send_response(&self, mut message: Message) -> Result<SendStatus, NetError> {
        if !message.has_header("Server") {
            message
                .add_header(&format!("Server: {}", self.settings.software_name))?;
        }

        let key = server_key(&message)?;
        let tx = self.transactions.read().await.get(&key).cloned();
        match tx {
            Some(tx) => {
                let code =
                    message.response_code().ok_or(NetError::InvalidArgument)?;
                tx.set_last_response(message);
                fsm::spin(self, &tx, input_for_code(code))
                    .await
                    .map_err(|_| NetError::InvalidArgument)?;
                Ok(SendStatus::Sent)
            }
            None => {
                // No server transaction to manage retransmissions: try the
                // channel the topmost Via points back at.
                let via = message
                    .topmost_via()
                    .map_err(|_| NetError::InvalidArgument)?;
                let endpoint = via.response_endpoint();
                match self.transport.get(&endpoint).await {
                    Some(context) => {
                        context.channel.send(&message).await?;
                        Ok(SendStatus::Sent)
                    }
                    None => {
                        debug!("no channel can send the response to {endpoint}");
                        Err(NetError::SocketNotConnected)
                    }
                }
            }
        }
    }

    fn stamp_contact(
        &self,
        message: &mut Message,
        context: &ChannelContext,
    ) -> Result<(), NetError> {
        if !message.has_header("Contact") {
            return Ok(());
        }
        let origin = match context.channel.origin() {
            Ok(origin) => origin,
            Err(_) => return Ok(()),
        };
        let transport = context.channel.destination().transport;
        let is_register = message.method() == Some(Method::REGISTER);

        let mut changed = false;
        let entries: Vec<String> = message
            .enumerate_header("Contact")
            .map(str::to_string)
            .collect();
        let rewritten: Vec<String> = entries
            .into_iter()
            .map(|entry| {
                if entry == "*" {
                    return entry;
                }
                let mut address = match entry.parse::<Address>() {
                    Ok(a) => a,
                    Err(_) => return entry,
                };
                let sip = address.uri.scheme == "sip"
                    || address.uri.scheme == "sips";
                if !sip || address.uri.host != "domain.invalid" {
                    return entry;
                }
                address.uri.host = origin.host.clone();
                address.uri.port = Some(origin.port);
                address.uri.transport = transport;
                if !is_register {
                    address.uri.params.insert("ob".to_string(), None);
                }
                changed = true;
                address.to_string()
            })
            .collect();

        if changed {
            message.remove_header("Contact")?;
            message.add_header(&format!("Contact: {}", rewritten.join(", ")))?;
        }
        Ok(())
    }

    async fn handle_dispatch(&self, dispatch: Dispatch) {
        match dispatch {
            Dispatch::Connected {
                endpoint,
                result: Ok(()),
            } => {
                self.emit(Event::ChannelConnected {
                    endpoint: endpoint.clone(),
                    result: Ok(()),
                })
                .await;
                let Some(context) = self.transport.get(&endpoint).await else {
                    return;
                };
                let pending =
                    context.pending.lock().expect("pending lock").take();
                if let Some(request) = pending {
                    if let Err(e) =
                        self.send_on_channel(request.clone(), &context).await
                    {
                        self.emit(Event::TransportError {
                            request,
                            error: e.clone(),
                        })
                        .await;
                        self.teardown_channel(&endpoint, e, true).await;
                    }
                }
            }
            Dispatch::Connected {
                endpoint,
                result: Err(error),
            } => {
                self.emit(Event::ChannelConnected {
                    endpoint: endpoint.clone(),
                    result: Err(error.clone()),
                })
                .await;
                self.teardown_channel(&endpoint, error, false).await;
            }
            Dispatch::Incoming {
                endpoint,
                peer,
                message,
            } => {
                if message.is_request() {
                    self.handle_incoming_request(endpoint, peer, message).await;
                } else {
                    self.handle_incoming_response(message).await;
                }
            }
            Dispatch::Closed { endpoint, error } => {
                self.teardown_channel(&endpoint, error, true).await;
            }
            Dispatch::SslCertError {
                endpoint,
                error,
                fatal,
            } => {
                self.handle_ssl_cert_error(endpoint, error, fatal).await;
            }
            Dispatch::Accepted { channel } => {
                self.transport.insert_accepted(channel).await;
            }
            Dispatch::ChannelIdle { endpoint } => {
                if let Some(context) = self.transport.get(&endpoint).await {
                    if context.refs() == 0 {
                        debug!("closing idle channel to {endpoint}");
                        self.teardown_channel(
                            &endpoint,
                            NetError::ConnectionClosed,
                            true,
                        )
                        .await;
                    }
                }
            }
            Dispatch::TimerFired { key, input } => {
                let tx = self.transactions.read().await.get(&key).cloned();
                if let Some(tx) = tx {
                    let _ = fsm::spin(self, &tx, input).await;
                }
            }
        }
    }

    async fn handle_incoming_request(
        &self,
        endpoint: EndPoint,
        peer: SocketAddr,
        mut request: Message,
    ) {
        let context = match self.transport.get(&endpoint).await {
            Some(context) => Some(context),
            None => self.adopt_inbound(&endpoint, peer).await,
        };
        let Some(context) = context else {
            warn!("no channel for inbound request from {endpoint}, dropped");
            return;
        };

        if let Ok(via) = request.topmost_via() {
            let peer_ip = peer.ip().to_string();
            let received = (via.host != peer_ip).then_some(peer_ip);
            let rport = (via.port.unwrap_or_else(|| via.transport.default_port())
                != peer.port())
            .then_some(peer.port());
            if received.is_some() || rport.is_some() {
                if let Err(e) =
                    request.stamp_via_received(received.as_deref(), rport)
                {
                    warn!("failed to stamp topmost via: {e}");
                }
            }
        }

        let key = match server_key(&request) {
            Ok(key) => key,
            Err(e) => {
                warn!("dropped request without a transaction key: {e}");
                return;
            }
        };
        let existing = self.transactions.read().await.get(&key).cloned();
        if let Some(tx) = existing {
            let input = if request.method() == Some(Method::ACK)
                && tx.method == Method::INVITE
            {
                Input::Ack
            } else {
                Input::Req
            };
            let _ = fsm::spin(self, &tx, input).await;
            return;
        }

        if request.method() == Some(Method::ACK) {
            // The ACK for a 2xx: its INVITE transaction is gone by design,
            // and no response will ever answer it. Straight to the TU.
            self.emit(Event::IncomingRequest(request)).await;
            return;
        }

        let Some(method) = request.method() else { return };
        let tx = Arc::new(Transaction::new(
            key.clone(),
            TxKind::Server,
            method,
            endpoint,
            request.clone(),
        ));
        self.transactions.write().await.insert(key.clone(), tx.clone());
        context
            .transactions
            .lock()
            .expect("transactions lock")
            .insert(key);
        self.transport.request_channel(&context);
        if method == Method::INVITE {
            tx.arm_provisional(
                self.dispatch(),
                Duration::from_millis(200),
                Input::Timer100,
            );
        }
        self.emit(Event::IncomingRequest(request)).await;
    }

    async fn handle_incoming_response(&self, message: Message) {
        let key = match client_key(&message) {
            Ok(key) => key,
            Err(e) => {
                warn!("dropped response without a transaction key: {e}");
                return;
            }
        };
        let tx = self.transactions.read().await.get(&key).cloned();
        match tx {
            Some(tx) => {
                let code = message.response_code().unwrap_or(0);
                tx.set_response(message);
                let _ = fsm::spin(self, &tx, input_for_code(code)).await;
            }
            None => {
                warn!(
                    "discarded inbound response ({} {}), unattached to any request",
                    message.response_code().unwrap_or(0),
                    message.status_text()
                );
            }
        }
    }

    /// Finds or mints the channel context behind an inbound message. UDP
    /// peers get a lightweight channel over the listener socket.
    async fn adopt_inbound(
        &self,
        endpoint: &EndPoint,
        peer: SocketAddr,
    ) -> Option<Arc<ChannelContext>> {
        if endpoint.transport != TransportType::Udp {
            return None;
        }
        let channel = match self.transport.udp_listener() {
            Some(socket) => Channel::Udp(UdpChannel::for_peer(
                endpoint.clone(),
                peer,
                socket,
                self.dispatch().clone(),
            )),
            None => self.transport.make_channel(endpoint).ok()?,
        };
        Some(self.transport.insert_accepted(channel).await)
    }

    async fn handle_ssl_cert_error(
        &self,
        endpoint: EndPoint,
        error: String,
        fatal: bool,
    ) {
        let Some(handler) = self.settings.ssl_cert_error_handler.clone() else {
            debug!("dismissing connection to {endpoint}: {error}");
            self.teardown_channel(
                &endpoint,
                NetError::SslCertError(error),
                true,
            )
            .await;
            return;
        };

        let weak = self.weak.clone();
        tokio::spawn(async move {
            let verdict = handler.handle(&endpoint, &error, fatal).await;
            let Some(inner) = weak.upgrade() else { return };
            match verdict {
                SslCertVerdict::AcceptOnce => {
                    if let Some(context) = inner.transport.get(&endpoint).await {
                        let _ = context.channel.reconnect_ignoring_last_error();
                    }
                }
                SslCertVerdict::AcceptWithCertificate { certs, key } => {
                    if let Some(context) = inner.transport.get(&endpoint).await {
                        let _ =
                            context.channel.reconnect_with_certificate(certs, key);
                    }
                }
                SslCertVerdict::Deny => {
                    inner
                        .teardown_channel(
                            &endpoint,
                            NetError::SslCertError(error),
                            true,
                        )
                        .await;
                }
            }
        });
    }

    /// Removes the context and cascades: every bound transaction terminates
    /// with a single error notification, the queued initial request fails,
    /// the channel closes.
    async fn teardown_channel(
        &self,
        endpoint: &EndPoint,
        error: NetError,
        emit_closed: bool,
    ) {
        let Some(context) = self.transport.remove(endpoint).await else {
            return;
        };
        let keys: Vec<String> = context
            .transactions
            .lock()
            .expect("transactions lock")
            .drain()
            .collect();
        for key in keys {
            let tx = self.transactions.write().await.remove(&key);
            if let Some(tx) = tx {
                tx.set_state(State::Terminated);
                tx.cancel_all();
                self.emit(Event::TransportError {
                    request: tx.request.clone(),
                    error: error.clone(),
                })
                .await;
            }
        }
        let pending = context.pending.lock().expect("pending lock").take();
        if let Some(request) = pending {
            self.emit(Event::TransportError {
                request,
                error: error.clone(),
            })
            .await;
        }
        context.channel.close();
        if emit_closed {
            self.emit(Event::ChannelClosed {
                endpoint: endpoint.clone(),
            })
            .await;
        }
    }

    /// Terminal cleanup: the transaction leaves the map and drops its use
    /// of the channel.
    pub(crate) async fn finish_transaction(&self, tx: &Transaction) {
        tx.set_state(State::Terminated);
        tx.cancel_all();
        self.transactions.write().await.remove(&tx.key);
        if let Some(context) = self.transport.get(&tx.endpoint).await {
            let removed = context
                .transactions
                .lock()
                .expect("transactions lock")
                .remove(&tx.key);
            if removed {
                self.transport.release_channel(&context);
            }
        }
    }

    async fn find_invite_request(
        &self,
        invite: &Message,
    ) -> Result<Message, NetError> {
        if let Ok(key) = client_key(invite) {
            if let Some(tx) = self.transactions.read().await.get(&key) {
                return Ok(tx.request.clone());
            }
        }
        // The caller may hold the request as submitted, before Via
        // stamping: fall back to matching on Call-ID and CSeq.
        let call_id = invite.call_id().map(str::to_string);
        let cseq = invite.get_cseq().map(|c| c.seq);
        for tx in self.transactions.read().await.values() {
            if tx.kind == TxKind::Client
                && tx.method == Method::INVITE
                && tx.request.call_id().map(str::to_string) == call_id
                && tx.request.get_cseq().map(|c| c.seq) == cseq
            {
                return Ok(tx.request.clone());
            }
        }
        Err(NetError::InvalidArgument)
    }
}

fn request_destination(message: &Message) -> Result<EndPoint, NetError> {
    let uri = match message.routes().first() {
        Some(route) => route.uri.clone(),
        None => message
            .request_uri()
            .cloned()
            .ok_or(NetError::InvalidArgument)?,
    };
    if uri.host.is_empty() {
        return Err(NetError::InvalidArgument);
    }
    Ok(uri.endpoint())
}
