//! RPC server implementation.
//!
//! [`RpcServer`] consumes requests from its own fanout exchange with a pool
//! of concurrent consumers, dispatches each one by method name through a
//! [`Router`], and publishes exactly one reply per request to the request's
//! reply address.
//!
//! Handlers run inside the consumer that received the request, so the pool
//! size bounds handler concurrency.

mod handler;

pub use handler::Router;

use std::sync::Arc;

use bytes::Bytes;

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

/// Running RPC server instance.
///
/// Cheap to clone (internally `Arc`-backed).
///
/// # Example
///
/// ```no_run
/// use fanout_rpc::{Router, RpcConfig, RpcServer};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct CreateWallet { balance: i64 }
/// #[derive(Serialize)]
/// struct Wallet { id: String, balance: i64 }
///
/// # async fn example() -> fanout_rpc::Result<()> {
/// let router = Router::new().register("createNewWallet", |req: CreateWallet| async move {
///     Ok(Wallet { id: "w1".into(), balance: req.balance })
/// });
///
/// let config = RpcConfig::memory("server");
/// let server = RpcServer::new(&config, "rpc_server", router).await?;
/// server.run().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

struct Inner {
    supervisor: Arc<Supervisor>,
}

/// Dispatches requests to handlers and publishes the replies.
struct Dispatcher {
    router: Router,
}

impl Dispatcher {
    // ---
    async fn dispatch(&self, env: &Envelope) -> (Arc<str>, Bytes) {
        // ---
        let method = env.method().unwrap_or_default();

        let Some(handler) = self.router.get(method) else {
            log_warn!("no handler for method {method:?}");
            return (Arc::from(RpcError::BadHandler.status()), Bytes::new());
        };

        match handler.call(env).await {
            Ok(body) => (Arc::from(STATUS_SUCCESS), body),
            Err(err) => {
                log_debug!("{method}: handler failed: {err}");
                (Arc::from(err.status()), Bytes::new())
            }
        }
    }
}

#[async_trait::async_trait]
impl DeliveryConsumer for Dispatcher {
    async fn handle_delivery(&self, delivery: Delivery, session: &LiveSession) {
        // ---
        if let Err(_err) = delivery.ack().await {
            log_warn!("request ack failed: {_err}");
        }

        let env = &delivery.envelope;
        let (Some(reply_to), Some(correlation_id)) = (env.reply_to.clone(), env.correlation_id.clone())
        else {
            log_warn!(
                "request {:?} without reply address or correlation id dropped",
                env.method()
            );
            return;
        };

        let (status, body) = self.dispatch(env).await;

        let reply = Envelope::reply(reply_to, status, body, CorrelationId::from(correlation_id));
        if let Err(_err) = session.publish(reply).await {
            log_warn!("failed to publish reply for {:?}: {_err}", env.method());
        }
    }
}

impl RpcServer {
    // ---
    /// Create a server with an explicitly provided transport.
    ///
    /// Connects to `exchange` (retrying within the configured attempt
    /// budget). Consumers do not start until [`start`](Self::start) or
    /// [`run`](Self::run).
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionFailed`] if the broker could not be
    /// reached within the attempt budget.
    pub async fn with_transport(
        transport: TransportPtr,
        exchange: impl Into<Address>,
        router: Router,
        config: &RpcConfig,
    ) -> Result<Self> {
        // ---
        let exchange: Address = exchange.into();
        let connection = BrokerConnection::new(exchange.clone(), transport, config.retry.clone());

        let supervisor = Supervisor::new(
            format!("rpc server {exchange}"),
            connection,
            Arc::new(Dispatcher { router }),
            config.workers,
            config.request_timeout,
        );
        supervisor.connect().await?;

        Ok(Self {
            inner: Arc::new(Inner { supervisor }),
        })
    }

    /// Convenience constructor that selects the transport from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if transport creation fails or the broker could not
    /// be reached within the attempt budget.
    pub async fn new(config: &RpcConfig, exchange: impl Into<Address>, router: Router) -> Result<Self> {
        // ---
        let transport = crate::create_transport(config).await?;
        Self::with_transport(transport, exchange, router, config).await
    }

    /// Launch the consumer pool and return immediately.
    ///
    /// Calling it again, or calling [`run`](Self::run) afterwards, does not
    /// launch a second pool.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionClosed`] after shutdown or a fatal error.
    pub fn start(&self) -> Result<()> {
        self.inner.supervisor.start()
    }

    /// Launch the consumer pool and block until the server stops.
    ///
    /// Returns `Ok(())` after [`shutdown`](Self::shutdown), or the fatal
    /// error if reconnecting failed. If the pool was already started with
    /// [`start`](Self::start), this only waits.
    pub async fn run(&self) -> Result<()> {
        // ---
        self.start()?;
        let mut notify = self.notify();

        // A fatal error is recorded before the closed signal fires.
        self.inner.supervisor.closed().await;
        match notify.try_recv() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Fatal-error notification; yields at most one error.
    pub fn notify(&self) -> Notify {
        self.inner.supervisor.notify()
    }

    /// Graceful stop.
    ///
    /// Stops the consumers, waits one timeout so in-flight replies can be
    /// published, then closes the connection. A no-op after a fatal error or
    /// a previous shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.supervisor.shutdown().await
    }

    /// Exchange this server receives requests on.
    pub fn exchange(&self) -> &str {
        self.inner.supervisor.exchange()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn request(method: &str) -> Envelope {
        Envelope::request(
            Address::from("rpc_server"),
            Arc::from(method),
            Bytes::new(),
            CorrelationId::generate(),
            Address::from("rpc_client"),
        )
    }

    fn dispatcher() -> Dispatcher {
        Dispatcher {
            router: Router::new()
                .register("ping", |_: ()| async { Ok("pong") })
                .register("lookup", |_: ()| async { Err::<(), _>(RpcError::NotFound) })
                .register("fail", |_: ()| async {
                    Err::<(), _>(RpcError::handler("insufficient funds"))
                }),
        }
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        // ---
        let (status, body) = dispatcher().dispatch(&request("ping")).await;
        assert_eq!(&*status, "success");
        assert_eq!(body, Bytes::from_static(b"\"pong\""));
    }

    #[tokio::test]
    async fn test_dispatch_unknown_method() {
        // ---
        let (status, body) = dispatcher().dispatch(&request("transfer")).await;
        assert_eq!(&*status, "unregistered handler");
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_error_statuses() {
        // ---
        let (status, body) = dispatcher().dispatch(&request("lookup")).await;
        assert_eq!(&*status, "not found");
        assert!(body.is_empty());

        let (status, _) = dispatcher().dispatch(&request("fail")).await;
        assert_eq!(&*status, "insufficient funds");
    }
}
