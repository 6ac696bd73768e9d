//! Consumer loops, reconnect and shutdown supervision.
//!
//! The supervisor is the glue between a [`BrokerConnection`] and a protocol
//! role (client reply matching, server dispatch). It is shared by both roles
//! and owns their lifecycle:
//!
//! - **Running**: `workers` consumer loops drain the current session's inbox
//!   and hand every delivery to the role's [`DeliveryConsumer`].
//! - **Stream closed**: the consumer that first observes the closed inbox
//!   cancels the stop signal (siblings exit), makes exactly one
//!   [`attempt_connect`](BrokerConnection::attempt_connect) cycle, and either
//!   installs a fresh stop signal and relaunches the loops, or reports a
//!   fatal error through [`Notify`]. A fatal error is final; nothing retries
//!   after it.
//! - **Shut down**: the stop signal is cancelled, the grace delay elapses so
//!   in-flight replies can land, and the connection is closed. Terminal.
//!
//! Errors raised while handling a single delivery never end a loop; only the
//! loss of the connection does.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{BrokerConnection, LiveSession};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    Delivery,
    Result,
    RpcError,
};

/// A role that consumes deliveries.
///
/// Implementations must not fail the loop: per-delivery problems are logged
/// and swallowed. The session the delivery arrived on is passed along so
/// replies go out over the same connection.
#[async_trait::async_trait]
pub(crate) trait DeliveryConsumer: Send + Sync + 'static {
    /// Handle a single incoming delivery.
    async fn handle_delivery(&self, delivery: Delivery, session: &LiveSession);
}

/// Fatal-error notification for one client or server.
///
/// Yields at most one error: the reason the component died. Receiving it
/// means the component is torn down and the owning process should begin its
/// own shutdown. Obtain one with `notify()` on the client or server.
pub struct Notify {
    // ---
    rx: watch::Receiver<Option<Arc<str>>>,
    done: bool,
}

impl Notify {
    /// Wait for the fatal error.
    ///
    /// Returns `None` if the component was dropped without failing, and on
    /// every call after the error has been delivered once.
    pub async fn recv(&mut self) -> Option<RpcError> {
        // ---
        if self.done {
            return None;
        }

        let reason = match self.rx.wait_for(Option::is_some).await {
            Ok(value) => (*value).clone(),
            Err(_) => None,
        };

        self.done = true;
        reason.map(|r| RpcError::ConnectionFailed(r.to_string()))
    }

    /// Take the fatal error if one was already reported, without waiting.
    pub fn try_recv(&mut self) -> Option<RpcError> {
        // ---
        if self.done {
            return None;
        }
        let reason = self.rx.borrow().clone()?;
        self.done = true;
        Some(RpcError::ConnectionFailed(reason.to_string()))
    }

    /// Non-blocking probe: has a fatal error been reported?
    pub fn is_fatal(&self) -> bool {
        self.rx.borrow().is_some()
    }
}

/// Lifecycle owner shared by client and server.
pub(crate) struct Supervisor {
    // ---
    name: String,
    connection: BrokerConnection,
    consumer: Arc<dyn DeliveryConsumer>,
    workers: usize,
    grace: Duration,

    stop: Mutex<CancellationToken>,
    fatal: watch::Sender<Option<Arc<str>>>,
    started: AtomicBool,
    terminated: AtomicBool,
    closed: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Supervisor {
    // ---
    pub(crate) fn new(
        name: impl Into<String>,
        connection: BrokerConnection,
        consumer: Arc<dyn DeliveryConsumer>,
        workers: usize,
        grace: Duration,
    ) -> Arc<Self> {
        // ---
        let (fatal, _) = watch::channel(None);

        Arc::new(Self {
            name: name.into(),
            connection,
            consumer,
            workers: workers.max(1),
            grace,
            stop: Mutex::new(CancellationToken::new()),
            fatal,
            started: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            closed: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Connect within the attempt budget without starting consumers.
    pub(crate) async fn connect(&self) -> Result<()> {
        self.connection.attempt_connect().await.map(|_| ())
    }

    /// Launch the consumer loops on the current session.
    ///
    /// Only the first call launches; later calls are no-ops so the pool never
    /// exceeds `workers`. Reconnects relaunch internally.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::ConnectionClosed`] if there is no session (never
    /// connected, or shut down).
    pub(crate) fn start(self: &Arc<Self>) -> Result<()> {
        // ---
        if self.is_terminated() {
            return Err(RpcError::ConnectionClosed);
        }
        let session = self.connection.session().ok_or(RpcError::ConnectionClosed)?;
        if self.started.swap(true, Ordering::SeqCst) {
            log_debug!("{}: already started", self.name);
            return Ok(());
        }
        self.launch(session);
        Ok(())
    }

    fn launch(self: &Arc<Self>, session: Arc<LiveSession>) {
        // ---
        let stop = self.stop_token();
        let mut handles = Vec::with_capacity(self.workers);

        for worker in 0..self.workers {
            let this = Arc::clone(self);
            let session = Arc::clone(&session);
            let stop = stop.clone();
            handles.push(tokio::spawn(async move {
                this.consume(worker, session, stop).await;
            }));
        }

        log_debug!(
            "{}: {} consumer(s) running on generation {}",
            self.name,
            self.workers,
            session.generation()
        );

        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|h| !h.is_finished());
        tasks.extend(handles);
    }

    async fn consume(self: Arc<Self>, _worker: usize, session: Arc<LiveSession>, stop: CancellationToken) {
        // ---
        loop {
            let next = tokio::select! {
                _ = stop.cancelled() => {
                    log_debug!("{}: consumer {_worker} stopped", self.name);
                    return;
                }
                next = session.next_delivery() => next,
            };

            match next {
                Some(delivery) => self.consumer.handle_delivery(delivery, &session).await,
                None => {
                    if session.claim_reconnect() {
                        log_warn!(
                            "{}: delivery stream closed (generation {}), reconnecting",
                            self.name,
                            session.generation()
                        );
                        self.reconnect().await;
                    }
                    return;
                }
            }
        }
    }

    async fn reconnect(self: &Arc<Self>) {
        // ---
        self.stop_token().cancel();

        if self.is_terminated() {
            return;
        }

        match self.connection.attempt_connect().await {
            Ok(session) => {
                if self.is_terminated() {
                    let _ = self.connection.close().await;
                    return;
                }
                *self.stop.lock().unwrap_or_else(|e| e.into_inner()) = CancellationToken::new();
                log_info!(
                    "{}: reconnected (generation {})",
                    self.name,
                    session.generation()
                );
                self.launch(session);
            }
            Err(err) => {
                log_error!("{}: reconnect failed: {err}", self.name);
                // Release the dead session before announcing the failure.
                if let Err(_e) = self.connection.close().await {
                    log_debug!("{}: closing dead session failed: {_e}", self.name);
                }
                self.report_fatal(err);
            }
        }
    }

    fn report_fatal(&self, err: RpcError) {
        // ---
        let reason: Arc<str> = match err {
            RpcError::ConnectionFailed(details) => Arc::from(details),
            other => Arc::from(other.to_string()),
        };

        self.fatal.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        });
        self.closed.cancel();
    }

    /// Current stop signal.
    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.stop.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// True while the current stop signal is cancelled: during a reconnect,
    /// after a fatal error, or after shutdown.
    pub(crate) fn is_stopping(&self) -> bool {
        self.stop_token().is_cancelled()
    }

    /// True once `shutdown()` ran or a fatal error was reported.
    pub(crate) fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst) || self.fatal.borrow().is_some()
    }

    /// Resolves once the component is shut down or dead.
    pub(crate) async fn closed(&self) {
        self.closed.cancelled().await
    }

    pub(crate) fn notify(&self) -> Notify {
        Notify {
            rx: self.fatal.subscribe(),
            done: false,
        }
    }

    pub(crate) fn exchange(&self) -> &str {
        self.connection.exchange().as_str()
    }

    /// Publish through the current session.
    pub(crate) async fn publish(&self, env: crate::Envelope) -> Result<()> {
        self.connection.publish(env).await
    }

    /// Graceful stop.
    ///
    /// No-op if a fatal error was already reported or shutdown already ran.
    /// Otherwise stops the consumer loops, waits the grace delay so in-flight
    /// replies can be published, and closes the connection.
    pub(crate) async fn shutdown(&self) -> Result<()> {
        // ---
        if self.fatal.borrow().is_some() {
            return Ok(());
        }
        if self.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        log_info!("{}: shutting down", self.name);

        self.stop_token().cancel();
        tokio::time::sleep(self.grace).await;

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            // Loops exit on the cancelled stop signal; a handler still running
            // past the grace delay is abandoned.
            handle.abort();
        }

        let result = self.connection.close().await;
        self.closed.cancel();

        log_info!("{}: shut down", self.name);
        result
    }
}
