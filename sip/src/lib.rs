//! # SIP Transaction and Network Core
//!
//! The transaction and transport layers of a SIP (RFC 3261) user agent:
//! message parsing and serialization, the four transaction state machines
//! with their retransmission timers, and a channel registry multiplexing
//! transactions over UDP, TCP, TLS and WebSocket transports.
//!
//! ## Core Components
//!
//! - **Message Model**: normalized header storage with compact-form
//!   expansion, comma coalescing and address canonicalization
//! - **Transaction Management**: client and server transactions keyed per
//!   RFC 3261 §17, with the RFC 2543 fallback
//! - **Transport Layer**: per-destination channels with connection reuse,
//!   idle expiry and per-protocol factories
//! - **Finite State Machine**: the INVITE/non-INVITE client and server
//!   machines driving retransmission and termination timers
//!
//! ## Usage
//!
//! ```no_run
//! use quasar_sip::message::{Message, Method};
//! use quasar_sip::transaction::TransactionManager;
//! use quasar_sip::transport::Settings;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let (manager, events) = TransactionManager::new(Settings::default());
//! manager.listen_udp("0.0.0.0:5060").await?;
//!
//! let mut options = Message::request(Method::OPTIONS, "sip:alice@example.com")?;
//! options.add_header("To: <sip:alice@example.com>")?;
//! manager.send(&options).await?;
//!
//! while let Ok(event) = events.recv().await {
//!     // route requests, responses and timeouts to the application
//!     let _ = event;
//! }
//! # Ok(())
//! # }
//! ```

pub mod fsm;
pub mod header;
pub mod message;
pub mod tcp;
pub mod tls;
pub mod transaction;
pub mod transport;
pub mod udp;
pub mod ws;

pub use message::{Address, Cseq, Direction, Message, MessageError, Method, Uri, Via};
pub use transaction::{Event, SendStatus, TransactionManager, MAGIC_COOKIE};
pub use transport::{
    Channel, EndPoint, NetError, Settings, SslCertErrorHandler, SslCertVerdict,
    TransportType,
};
