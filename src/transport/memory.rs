//! In-memory transport implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Transport` trait. It is intended primarily for testing, local execution,
//! and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! - Exchanges are fanout: every queue bound to an exchange receives every
//!   envelope published to it.
//! - Opening a session declares the exchange (idempotent), creates a fresh
//!   exclusive queue and binds it.
//! - Once `open()` returns, envelopes published afterwards are deliverable.
//! - Publishing to an exchange with no bound queue drops the envelope.
//! - A queue disappears when its session is closed or its inbox is dropped.
//!
//! ## Fault injection
//!
//! [`MemoryHub::disconnect`] drops every queue bound to an exchange, which
//! closes the owning sessions' inboxes exactly as a broker-side connection
//! loss would. [`MemoryHub::set_available`] makes subsequent connects fail.
//!
//! ## Non-Goals
//!
//! This transport does not attempt to emulate persistence, redelivery or
//! the channel-level errors a real broker raises.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use tokio::sync::{mpsc, RwLock};

use crate::{
    // ---
    log_debug,
    log_info,
    Acknowledge,
    Delivery,
    Envelope,
    Link,
    Result,
    RpcConfig,
    RpcError,
    Session,
    SubscriptionHandle,
    Transport,
    TransportBase,
    TransportPtr,
};

const QUEUE_CAPACITY: usize = 64;

struct BoundQueue {
    id: u64,
    tx: mpsc::Sender<Delivery>,
}

/// Shared message bus for the in-memory transport.
///
/// Simulates a fanout broker within a single process. All transports sharing
/// a hub can publish to each other's exchanges, exactly as nodes connected to
/// a real broker would.
///
/// # Usage in Integration Tests
///
/// Construct a hub per test for isolation:
///
/// ```
/// # use fanout_rpc::{MemoryHub, RpcConfig};
/// # async fn example() -> fanout_rpc::Result<()> {
/// let hub = MemoryHub::new();
///
/// let _server = fanout_rpc::create_memory_transport_with_hub(&RpcConfig::memory("server"), hub.clone());
/// let _client = fanout_rpc::create_memory_transport_with_hub(&RpcConfig::memory("client"), hub.clone());
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    exchanges: RwLock<HashMap<Arc<str>, Vec<BoundQueue>>>,
    available: AtomicBool,
    next_queue: AtomicU64,
    acked: Arc<AtomicU64>,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self::default())
    }

    /// Allow or refuse new connections.
    ///
    /// Existing sessions are unaffected; combine with
    /// [`disconnect`](Self::disconnect) to simulate a broker outage.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Drop every queue bound to `exchange`, closing the owners' inboxes.
    ///
    /// Returns how many queues were removed.
    pub async fn disconnect(&self, exchange: &str) -> usize {
        // ---
        let mut exchanges = self.exchanges.write().await;
        let removed = exchanges
            .get_mut(exchange)
            .map(|queues| queues.drain(..).count())
            .unwrap_or(0);

        log_info!("memory hub: dropped {removed} queue(s) bound to {exchange}");
        removed
    }

    /// Number of live queues bound to `exchange`.
    pub async fn queue_count(&self, exchange: &str) -> usize {
        // ---
        let exchanges = self.exchanges.read().await;
        exchanges
            .get(exchange)
            .map(|queues| queues.iter().filter(|q| !q.tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Total acknowledgements received by this hub.
    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::SeqCst)
    }

    async fn open(&self, transport_id: &str, exchange: &str) -> Result<(u64, SubscriptionHandle)> {
        // ---
        if !self.available.load(Ordering::SeqCst) {
            return Err(RpcError::Transport("memory hub: broker unavailable".into()));
        }

        let id = self.next_queue.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);

        let mut exchanges = self.exchanges.write().await;
        exchanges
            .entry(Arc::from(exchange))
            .or_default()
            .push(BoundQueue { id, tx });

        log_debug!("{transport_id}: queue {id} bound to {exchange}");

        Ok((id, SubscriptionHandle { inbox: rx }))
    }

    async fn is_bound(&self, exchange: &str, id: u64) -> bool {
        // ---
        let exchanges = self.exchanges.read().await;
        exchanges
            .get(exchange)
            .is_some_and(|queues| queues.iter().any(|q| q.id == id))
    }

    async fn publish(&self, transport_id: &str, env: Envelope) -> Result<()> {
        // ---
        let targets: Vec<mpsc::Sender<Delivery>> = {
            let mut exchanges = self.exchanges.write().await;
            match exchanges.get_mut(env.address.as_str()) {
                Some(queues) => {
                    // Exclusive queues vanish with their consumer.
                    queues.retain(|q| !q.tx.is_closed());
                    queues.iter().map(|q| q.tx.clone()).collect()
                }
                None => Vec::new(),
            }
        };

        log_debug!(
            "{transport_id}: publish to {} ({} queue(s))",
            env.address,
            targets.len()
        );

        for tx in targets {
            let acker = MemoryAcker {
                acked: self.acked.clone(),
            };
            // A closed channel indicates a dropped inbox; ignore.
            let _ = tx
                .send(Delivery::new(env.clone(), Some(Box::new(acker))))
                .await;
        }

        Ok(())
    }

    async fn remove(&self, exchange: &str, id: u64) {
        // ---
        let mut exchanges = self.exchanges.write().await;
        if let Some(queues) = exchanges.get_mut(exchange) {
            queues.retain(|q| q.id != id);
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            exchanges: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            next_queue: AtomicU64::new(1),
            acked: Arc::new(AtomicU64::new(0)),
        }
    }
}

struct MemoryAcker {
    acked: Arc<AtomicU64>,
}

#[async_trait::async_trait]
impl Acknowledge for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Process-global hub used by [`create_memory_transport`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// Publisher of one in-memory session.
///
/// Stops working once its queue is gone, mirroring a dead broker connection.
struct MemoryLink {
    // ---
    transport_id: String,
    hub: Arc<MemoryHub>,
    exchange: Arc<str>,
    queue_id: u64,
    closed: AtomicBool,
}

#[async_trait::async_trait]
impl Link for MemoryLink {
    // ---
    async fn publish(&self, env: Envelope) -> Result<()> {
        // ---
        if self.closed.load(Ordering::SeqCst)
            || !self.hub.is_bound(&self.exchange, self.queue_id).await
        {
            return Err(RpcError::Transport("memory: connection closed".into()));
        }
        self.hub.publish(&self.transport_id, env).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.closed.store(true, Ordering::SeqCst);
        self.hub.remove(&self.exchange, self.queue_id).await;
        log_debug!("{}: closed session on {}", self.transport_id, self.exchange);
        Ok(())
    }
}

/// In-memory transport.
///
/// Routes messages through a shared [`MemoryHub`].
struct MemoryTransport {
    // ---
    base: TransportBase,
    hub: Arc<MemoryHub>,
}

#[async_trait::async_trait]
impl Transport for MemoryTransport {
    // ---
    fn base(&self) -> &TransportBase {
        &self.base
    }

    async fn open(&self, exchange: &str) -> Result<Session> {
        // ---
        let (queue_id, deliveries) = self.hub.open(self.transport_id(), exchange).await?;

        let link = MemoryLink {
            transport_id: self.base.transport_id.clone(),
            hub: self.hub.clone(),
            exchange: Arc::from(exchange),
            queue_id,
            closed: AtomicBool::new(false),
        };

        Ok(Session {
            link: Arc::new(link),
            deliveries,
        })
    }
}

/// Create a new in-memory transport using the process-global hub.
///
/// For isolated parallel testing, use [`create_memory_transport_with_hub`].
pub fn create_memory_transport(config: &RpcConfig) -> TransportPtr {
    // ---
    create_memory_transport_with_hub(config, global_hub())
}

/// Create a new in-memory transport using the provided hub.
pub fn create_memory_transport_with_hub(config: &RpcConfig, hub: Arc<MemoryHub>) -> TransportPtr {
    // ---
    log_debug!("{}: create memory transport", config.transport_id);

    Arc::new(MemoryTransport {
        base: TransportBase::new(config.transport_id.clone(), None),
        hub,
    })
}
