//! Broker connection with bounded-retry connect.
//!
//! A [`BrokerConnection`] is owned by exactly one client or server. It knows
//! its own exchange name (fixed for its lifetime) and holds the current
//! [`LiveSession`]: the publishing link plus the subscription inbox produced
//! by one successful connect. Reconnecting builds a brand new session and
//! swaps it in whole; the previous one is closed and never touched again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, Mutex};

use crate::retry::retry_fixed;
use crate::{
    // ---
    log_debug,
    log_info,
    Address,
    Delivery,
    Envelope,
    LinkPtr,
    Result,
    RetryConfig,
    RpcError,
    TransportPtr,
};

/// One connected generation: link and inbox, replaced together.
pub(crate) struct LiveSession {
    // ---
    generation: u64,
    link: LinkPtr,
    inbox: Mutex<mpsc::Receiver<Delivery>>,
    closed_seen: AtomicBool,
}

impl LiveSession {
    /// Wait for the next delivery.
    ///
    /// Several consumers may call this concurrently; the inbox lock hands
    /// each delivery to exactly one of them. `None` means the broker closed
    /// the stream.
    pub(crate) async fn next_delivery(&self) -> Option<Delivery> {
        self.inbox.lock().await.recv().await
    }

    /// Record that the stream was observed closed.
    ///
    /// Returns `true` only for the first caller, which becomes responsible
    /// for reconnecting.
    pub(crate) fn claim_reconnect(&self) -> bool {
        !self.closed_seen.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) async fn publish(&self, env: Envelope) -> Result<()> {
        self.link.publish(env).await
    }
}

/// Connection to the broker for one exchange.
pub(crate) struct BrokerConnection {
    // ---
    exchange: Address,
    transport: TransportPtr,
    retry: RetryConfig,
    current: RwLock<Option<Arc<LiveSession>>>,
    generations: AtomicU64,
}

impl BrokerConnection {
    // ---
    pub(crate) fn new(exchange: impl Into<Address>, transport: TransportPtr, retry: RetryConfig) -> Self {
        // ---
        Self {
            exchange: exchange.into(),
            transport,
            retry,
            current: RwLock::new(None),
            generations: AtomicU64::new(0),
        }
    }

    /// This connection's own exchange.
    pub(crate) fn exchange(&self) -> &Address {
        &self.exchange
    }

    /// Single connect attempt.
    ///
    /// Declares the fanout exchange, an exclusive auto-deleting queue bound
    /// to it, and starts consuming. On success the new session replaces the
    /// current one.
    pub(crate) async fn connect(&self) -> Result<Arc<LiveSession>> {
        // ---
        let session = self.transport.open(self.exchange.as_str()).await?;

        let live = Arc::new(LiveSession {
            generation: self.generations.fetch_add(1, Ordering::SeqCst) + 1,
            link: session.link,
            inbox: Mutex::new(session.deliveries.inbox),
            closed_seen: AtomicBool::new(false),
        });

        let previous = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            current.replace(live.clone())
        };

        if let Some(previous) = previous {
            // The old connection is usually already dead; closing is best effort.
            if let Err(_err) = previous.link.close().await {
                log_debug!("{}: closing stale session failed: {_err}", self.exchange);
            }
        }

        log_info!(
            "{}: connected (generation {})",
            self.exchange,
            live.generation
        );
        Ok(live)
    }

    /// Retry [`connect`](Self::connect) within the attempt budget.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionFailed`] once all attempts failed. The
    /// owner must treat this as fatal.
    pub(crate) async fn attempt_connect(&self) -> Result<Arc<LiveSession>> {
        // ---
        let what = format!("{}", self.exchange);
        retry_fixed(&self.retry, &what, || self.connect()).await
    }

    /// The session installed by the last successful connect.
    pub(crate) fn session(&self) -> Option<Arc<LiveSession>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Publish through the current session.
    pub(crate) async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        let session = self.session().ok_or(RpcError::ConnectionClosed)?;
        session.publish(env).await
    }

    /// Close the current session's connection.
    pub(crate) async fn close(&self) -> Result<()> {
        // ---
        let session = {
            let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
            current.take()
        };

        match session {
            Some(session) => session.link.close().await,
            None => Ok(()),
        }
    }
}
