//! RPC client implementation.
//!
//! [`RpcClient`] publishes requests to the server's fanout exchange and
//! receives replies on its own exchange. A single background consumer
//! matches replies to in-flight calls by correlation id.
//!
//! # Concurrency
//!
//! Any number of calls may be in flight. Replies may arrive in any order;
//! each one is routed to the caller whose correlation id it carries. Replies
//! for calls that already timed out or were cancelled are dropped.

mod pending;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::connection::{BrokerConnection, LiveSession};
use crate::supervisor::{DeliveryConsumer, Supervisor};
use crate::{
    // ---
    log_debug,
    log_warn,
    Address,
    CorrelationId,
    Delivery,
    Envelope,
    Notify,
    Result,
    RpcConfig,
    RpcError,
    TransportPtr,
    STATUS_SUCCESS,
};

use pending::{CallRegistry, Reply};

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    server_exchange: Address,
    registry: Arc<CallRegistry>,
    supervisor: Arc<Supervisor>,
    timeout: Duration,
}

/// Routes replies arriving on the client's exchange to waiting callers.
struct ReplyRouter {
    registry: Arc<CallRegistry>,
}

#[async_trait::async_trait]
impl DeliveryConsumer for ReplyRouter {
    async fn handle_delivery(&self, delivery: Delivery, _session: &LiveSession) {
        // ---
        if let Err(_err) = delivery.ack().await {
            log_warn!("reply ack failed: {_err}");
        }

        let env = delivery.envelope;
        let Some(correlation_id) = env.correlation_id.clone() else {
            log_debug!("reply without correlation id dropped");
            return;
        };

        let reply = Reply {
            status: env.kind.clone().unwrap_or_else(|| Arc::from("")),
            body: env.payload,
        };

        if !self.registry.complete(&correlation_id, reply) {
            log_debug!("no pending call for reply (correlation_id: {correlation_id})");
        }
    }
}

impl RpcClient {
    // ---
    /// Create a client with an explicitly provided transport.
    ///
    /// Connects to `client_exchange` (retrying within the configured attempt
    /// budget) and starts the reply consumer. Requests go to
    /// `server_exchange`.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionFailed`] if the broker could not be
    /// reached within the attempt budget.
    pub async fn with_transport(
        transport: TransportPtr,
        server_exchange: impl Into<Address>,
        client_exchange: impl Into<Address>,
        config: &RpcConfig,
    ) -> Result<Self> {
        // ---
        let client_exchange: Address = client_exchange.into();
        let registry = CallRegistry::new();

        let connection = BrokerConnection::new(client_exchange.clone(), transport, config.retry.clone());
        let router = Arc::new(ReplyRouter {
            registry: registry.clone(),
        });

        let supervisor = Supervisor::new(
            format!("rpc client {client_exchange}"),
            connection,
            router,
            1,
            config.request_timeout,
        );
        supervisor.connect().await?;
        supervisor.start()?;

        Ok(Self {
            inner: Arc::new(Inner {
                server_exchange: server_exchange.into(),
                registry,
                supervisor,
                timeout: config.request_timeout,
            }),
        })
    }

    /// Convenience constructor that selects the transport from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if transport creation fails or the broker could not
    /// be reached within the attempt budget.
    pub async fn new(
        config: &RpcConfig,
        server_exchange: impl Into<Address>,
        client_exchange: impl Into<Address>,
    ) -> Result<Self> {
        // ---
        let transport = crate::create_transport(config).await?;
        Self::with_transport(transport, server_exchange, client_exchange, config).await
    }

    /// Invoke `method` on the server and wait for its reply.
    ///
    /// A request serializing to JSON `null` (e.g. `&()`) is sent with an
    /// empty body; an empty success body decodes as `null`, so `()` and
    /// `Option<T>` responses work.
    ///
    /// # Errors
    ///
    /// - [`RpcError::ConnectionClosed`]: the client is reconnecting past one
    ///   timeout, shut down, or dead
    /// - [`RpcError::Timeout`]: no reply within the configured timeout
    /// - [`RpcError::Cancelled`]: `ctx` was cancelled first
    /// - [`RpcError::BadHandler`]: the server has no such method
    /// - [`RpcError::NotFound`]: the handler reported a missing entity
    /// - [`RpcError::CallStatus`]: any other non-success status
    /// - [`RpcError::Serialization`]: request encoding or reply decoding failed
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use fanout_rpc::{RpcClient, RpcConfig};
    /// # use serde::{Deserialize, Serialize};
    /// # use tokio_util::sync::CancellationToken;
    /// #[derive(Serialize)]
    /// struct CreateWallet { balance: i64 }
    /// #[derive(Deserialize)]
    /// struct Wallet { id: String, balance: i64 }
    /// # async fn example() -> fanout_rpc::Result<()> {
    /// let config = RpcConfig::memory("client");
    /// let client = RpcClient::new(&config, "rpc_server", "rpc_client").await?;
    ///
    /// let ctx = CancellationToken::new();
    /// let wallet: Wallet = client
    ///     .remote_call(&ctx, "createNewWallet", &CreateWallet { balance: 100 })
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn remote_call<TReq, TResp>(
        &self,
        ctx: &CancellationToken,
        method: &str,
        request: &TReq,
    ) -> Result<TResp>
    where
        TReq: Serialize + ?Sized,
        TResp: DeserializeOwned,
    {
        // ---
        self.ensure_running().await?;

        let body = encode_request(request)?;
        let correlation_id = CorrelationId::generate();

        // Registered before publishing so a fast reply cannot miss its slot.
        let (guard, rx) = self.inner.registry.register(correlation_id.clone());

        let env = Envelope::request(
            self.inner.server_exchange.clone(),
            Arc::from(method),
            body,
            correlation_id,
            Address(Arc::from(self.inner.supervisor.exchange())),
        );
        self.inner.supervisor.publish(env).await?;

        let reply = tokio::select! {
            _ = tokio::time::sleep(self.inner.timeout) => Err(RpcError::Timeout),
            _ = ctx.cancelled() => Err(RpcError::Cancelled),
            reply = rx => reply.map_err(|_| RpcError::ConnectionClosed),
        };
        if let Err(_err) = &reply {
            log_debug!("{method} ({}) gave up: {_err}", guard.correlation_id());
        }
        drop(guard);

        decode_reply(reply?)
    }

    /// Refuse calls while stopping.
    ///
    /// During a reconnect the stop signal is briefly cancelled; wait one
    /// timeout for the new session before giving up.
    async fn ensure_running(&self) -> Result<()> {
        // ---
        let supervisor = &self.inner.supervisor;

        if supervisor.is_terminated() {
            return Err(RpcError::ConnectionClosed);
        }
        if supervisor.is_stopping() {
            tokio::time::sleep(self.inner.timeout).await;
            if supervisor.is_stopping() || supervisor.is_terminated() {
                return Err(RpcError::ConnectionClosed);
            }
        }
        Ok(())
    }

    /// Fatal-error notification; yields at most one error.
    pub fn notify(&self) -> Notify {
        self.inner.supervisor.notify()
    }

    /// Graceful stop.
    ///
    /// Waits one timeout so in-flight replies can land, then closes the
    /// connection. A no-op after a fatal error or a previous shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.supervisor.shutdown().await
    }

    /// Number of calls currently awaiting a reply.
    pub fn pending_calls(&self) -> usize {
        self.inner.registry.len()
    }

    /// Exchange this client receives replies on.
    pub fn exchange(&self) -> &str {
        self.inner.supervisor.exchange()
    }
}

fn encode_request<T: Serialize + ?Sized>(request: &T) -> Result<Bytes> {
    // ---
    let body = serde_json::to_vec(request)?;
    if body == b"null" {
        return Ok(Bytes::new());
    }
    Ok(Bytes::from(body))
}

fn decode_reply<T: DeserializeOwned>(reply: Reply) -> Result<T> {
    // ---
    if &*reply.status != STATUS_SUCCESS {
        return Err(RpcError::from_status(&reply.status));
    }

    let body: &[u8] = if reply.body.is_empty() {
        b"null"
    } else {
        &reply.body
    };
    Ok(serde_json::from_slice(body)?)
}
