//! Request/response RPC over a pub/sub fanout broker.
//!
//! Clients publish requests to a server's fanout exchange; servers dispatch
//! them by method name and publish one reply to the exchange the request
//! names as its reply address. Replies are matched to callers by correlation
//! id, so any number of calls may be in flight concurrently.
//!
//! The broker connection is supervised: when the delivery stream closes the
//! component reconnects within a bounded attempt budget, and reports a single
//! fatal error through [`Notify`] if that fails.
//!
//! ```no_run
//! use fanout_rpc::{Router, RpcClient, RpcConfig, RpcServer};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> fanout_rpc::Result<()> {
//! let config = RpcConfig::memory("demo");
//!
//! let router = Router::new().register("echo", |msg: String| async move { Ok(msg) });
//! let server = RpcServer::new(&config, "rpc_server", router).await?;
//! server.start()?;
//!
//! let client = RpcClient::new(&config, "rpc_server", "rpc_client").await?;
//! let reply: String = client
//!     .remote_call(&CancellationToken::new(), "echo", "hello")
//!     .await?;
//! assert_eq!(reply, "hello");
//!
//! client.shutdown().await?;
//! server.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod macros;

// Import all sub modules once...
mod client;
mod connection;
mod domain;
mod server;
mod supervisor;
mod transport;

mod retry;
mod rpc_config;

mod correlation;
mod error;

#[allow(unused_imports)]
pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use client::RpcClient;
pub use server::{Router, RpcServer};
pub use supervisor::Notify;

pub use retry::RetryConfig;
pub use rpc_config::{RpcConfig, DEFAULT_TIMEOUT, DEFAULT_WORKERS};

pub use correlation::CorrelationId;
pub use error::{Result, RpcError, STATUS_SUCCESS};

pub use transport::{create_memory_transport, create_memory_transport_with_hub, MemoryHub};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

// --- public re-exports
pub use domain::{
    //
    Acknowledge,
    Address,
    Delivery,
    Envelope,
    Link,
    LinkPtr,
    Session,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportPtr,
    CONTENT_TYPE_JSON,
};

/// Select a transport for `config`.
///
/// A config with a broker URI gets the AMQP transport (requires the
/// `transport_lapin` feature); a config without one gets the process-wide
/// in-memory hub.
///
/// # Errors
///
/// Returns [`RpcError::MissingConfig`] if a broker URI is set but no broker
/// transport was compiled in.
pub async fn create_transport(config: &RpcConfig) -> Result<TransportPtr> {
    // ---
    if config.transport_uri.is_none() {
        return Ok(create_memory_transport(config));
    }

    #[cfg(feature = "transport_lapin")]
    {
        create_lapin_transport(config).await
    }

    #[cfg(not(feature = "transport_lapin"))]
    {
        Err(RpcError::MissingConfig(
            "broker URI set but the transport_lapin feature is disabled".into(),
        ))
    }
}
