// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the domain-level broker interface used by the
//! connection, client and server layers. It intentionally avoids any
//! reference to concrete client libraries.
//!
//! The broker model is the fanout one: every participant owns an exchange,
//! and opening a session on it yields an exclusive subscription queue bound
//! to that exchange plus a link that can publish to *any* exchange. Higher
//! level semantics such as correlation, timeouts and reconnects are handled
//! elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.
use crate::Result;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Content type placed on every request and reply.
pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Shared base state for all transport implementations.
///
/// Each concrete transport embeds this as a field named `base`:
///
/// ```ignore
/// struct AmqpTransport {
///     base: TransportBase,
///     // ... lapin specific fields
/// }
///
/// impl Transport for AmqpTransport {
///     fn base(&self) -> &TransportBase { &self.base }
/// }
/// ```
#[derive(Clone, Debug)]
pub struct TransportBase {
    /// Identifier for this transport instance, used for logging.
    pub transport_id: String,
    /// Broker URI, if the transport talks to a real broker.
    pub uri: Option<String>,
}

impl TransportBase {
    /// Create a new TransportBase.
    pub fn new(transport_id: impl Into<String>, uri: Option<String>) -> Self {
        Self {
            transport_id: transport_id.into(),
            uri,
        }
    }
}

/// An exchange name.
///
/// Requests are published to the server's exchange; replies to the exchange
/// named in the request's reply address. Cheap to clone.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub Arc<str>);

impl Address {
    /// Borrow the exchange name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Address(Arc::from(value))
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Address(Arc::from(value))
    }
}

impl From<Arc<str>> for Address {
    fn from(value: Arc<str>) -> Self {
        Address(value)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The wire message.
///
/// Maps one-to-one onto broker message properties: `address` is the
/// destination exchange, `kind` the AMQP `type` property, and the remaining
/// fields their namesakes. Bodies are JSON or empty.
///
/// # Examples
///
/// ## Creating a request envelope
///
/// ```
/// # use fanout_rpc::{Envelope, Address, CorrelationId};
/// # use bytes::Bytes;
/// let envelope = Envelope::request(
///     Address::from("rpc_server"),
///     "createNewWallet".into(),
///     Bytes::from_static(br#"{"balance":100}"#),
///     CorrelationId::generate(),
///     Address::from("rpc_client"),
/// );
/// assert_eq!(envelope.method(), Some("createNewWallet"));
/// ```
///
/// ## Creating a reply envelope
///
/// ```
/// # use fanout_rpc::{Envelope, Address, CorrelationId};
/// # use bytes::Bytes;
/// let envelope = Envelope::reply(
///     Address::from("rpc_client"),
///     "success".into(),
///     Bytes::from_static(b"null"),
///     CorrelationId::from("correlation-123"),
/// );
/// assert_eq!(envelope.status(), Some("success"));
/// ```
#[derive(Clone, Debug)]
pub struct Envelope {
    // ---
    /// Destination exchange.
    pub address: Address,

    /// Method name on requests, status token on replies.
    ///
    /// Both travel in the same broker property; which reading applies depends
    /// on which side consumes the envelope.
    pub kind: Option<Arc<str>>,

    /// Opaque payload bytes (JSON, possibly empty).
    pub payload: Bytes,

    /// Correlation identifier echoed from request to reply.
    pub correlation_id: Option<Arc<str>>,

    /// Exchange the reply must be published to. Set on requests only.
    pub reply_to: Option<Address>,

    /// Content type metadata, always `application/json` for this protocol.
    pub content_type: Option<Arc<str>>,
}

impl Envelope {
    // ---
    /// Create a request envelope.
    ///
    /// # Arguments
    ///
    /// * `address` - Server exchange
    /// * `method` - RPC method name
    /// * `payload` - Encoded request (empty for a null request)
    /// * `correlation_id` - Unique identifier for matching the reply
    /// * `reply_to` - Caller's own exchange
    pub fn request(
        address: Address,
        method: Arc<str>,
        payload: Bytes,
        correlation_id: crate::CorrelationId,
        reply_to: Address,
    ) -> Self {
        // ---
        Self {
            address,
            kind: Some(method),
            payload,
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to),
            content_type: Some(Arc::from(CONTENT_TYPE_JSON)),
        }
    }

    /// Create a reply envelope.
    ///
    /// # Arguments
    ///
    /// * `address` - The request's reply address
    /// * `status` - `"success"` or an error token
    /// * `payload` - Encoded response (empty on error)
    /// * `correlation_id` - Correlation ID from the original request
    pub fn reply(
        address: Address,
        status: Arc<str>,
        payload: Bytes,
        correlation_id: crate::CorrelationId,
    ) -> Self {
        // ---
        Self {
            address,
            kind: Some(status),
            payload,
            correlation_id: Some(correlation_id.into()),
            reply_to: None,
            content_type: Some(Arc::from(CONTENT_TYPE_JSON)),
        }
    }

    /// Method name, when read as a request.
    pub fn method(&self) -> Option<&str> {
        self.kind.as_deref()
    }

    /// Status token, when read as a reply.
    pub fn status(&self) -> Option<&str> {
        self.kind.as_deref()
    }
}

/// Acknowledges one delivery back to the broker.
#[async_trait::async_trait]
pub trait Acknowledge: Send + Sync {
    /// Positive acknowledgement of a single message.
    async fn ack(&self) -> Result<()>;
}

/// An envelope received from a subscription queue, pending acknowledgement.
pub struct Delivery {
    // ---
    /// The received message.
    pub envelope: Envelope,

    acker: Option<Box<dyn Acknowledge>>,
}

impl Delivery {
    /// Wrap an envelope with the broker acknowledgement hook.
    pub fn new(envelope: Envelope, acker: Option<Box<dyn Acknowledge>>) -> Self {
        Self { envelope, acker }
    }

    /// Acknowledge receipt. Transports without acknowledgements treat this
    /// as a no-op.
    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("envelope", &self.envelope)
            .finish_non_exhaustive()
    }
}

/// Receiving end of a session's subscription queue.
///
/// The inbox closes when the broker drops the underlying channel or
/// connection; consumers treat `None` from `recv()` as a connection loss.
pub struct SubscriptionHandle {
    // ---
    /// Deliveries from the exclusive queue bound to the session's exchange.
    pub inbox: mpsc::Receiver<Delivery>,
}

/// Publishing side of one broker session.
///
/// Implementations serialize publishes internally; callers may share a
/// link between tasks.
#[async_trait::async_trait]
pub trait Link: Send + Sync {
    /// Publish an envelope to `env.address` with an empty routing key.
    async fn publish(&self, env: Envelope) -> Result<()>;

    /// Close the underlying connection.
    async fn close(&self) -> Result<()>;
}

/// Shared link pointer.
pub type LinkPtr = Arc<dyn Link>;

/// Everything one successful connect produces.
///
/// Sessions are replaced as a whole on reconnect; no field is ever swapped
/// individually.
pub struct Session {
    /// Publisher for this connection.
    pub link: LinkPtr,
    /// Deliveries for the session's exchange.
    pub deliveries: SubscriptionHandle,
}

/// Broker abstraction.
///
/// A `Transport` knows how to reach a broker. Each call to
/// [`open`](Transport::open) performs the full connect sequence for one
/// exchange:
///
/// 1. establish a connection and a channel,
/// 2. declare the exchange as fanout,
/// 3. declare an exclusive, auto-deleting queue,
/// 4. bind it to the exchange with an empty routing key,
/// 5. start consuming it.
///
/// Failure at any step aborts the attempt. Retrying is the caller's concern.
///
/// The in-memory transport serves as the reference implementation of these
/// semantics.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &TransportBase;

    /// Returns the transport_id of the transport.
    ///
    /// Default implementation delegates to `base()`.
    fn transport_id(&self) -> &str {
        &self.base().transport_id
    }

    /// Run the connect sequence for `exchange` and return the new session.
    async fn open(&self, exchange: &str) -> Result<Session>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Used to erase concrete transport types behind a stable domain interface.
pub type TransportPtr = Arc<dyn Transport>;
