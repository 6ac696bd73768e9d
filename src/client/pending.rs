use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::CorrelationId;

/// Outcome carried by a reply: the status token and the raw body.
#[derive(Debug, Clone)]
pub(crate) struct Reply {
    // ---
    pub status: Arc<str>,
    pub body: Bytes,
}

/// One in-flight call awaiting its reply.
///
/// The completion fires at most once; later replies with the same
/// correlation id find the slot empty and are dropped.
pub(crate) struct PendingCall {
    // ---
    completion: Mutex<Option<oneshot::Sender<Reply>>>,
}

impl PendingCall {
    /// Fill in the reply and wake the caller.
    ///
    /// Returns false if the call was already completed or the caller is gone.
    fn complete(&self, reply: Reply) -> bool {
        // ---
        let tx = self
            .completion
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        match tx {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }
}

/// Tracks in-flight calls by correlation id.
///
/// Callers insert and remove concurrently while the reply consumer performs
/// lookups. The lock is never held across an await point.
pub(crate) struct CallRegistry {
    // ---
    calls: RwLock<HashMap<CorrelationId, Arc<PendingCall>>>,
}

impl CallRegistry {
    // ---
    pub(crate) fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            calls: RwLock::new(HashMap::new()),
        })
    }

    /// Register a new pending call.
    ///
    /// The returned guard removes the entry when dropped, so the registry is
    /// cleaned up on every exit path of the caller: reply, timeout,
    /// cancellation, or a failed publish.
    pub(crate) fn register(
        self: &Arc<Self>,
        correlation_id: CorrelationId,
    ) -> (CallGuard, oneshot::Receiver<Reply>) {
        // ---
        let (tx, rx) = oneshot::channel();
        let call = Arc::new(PendingCall {
            completion: Mutex::new(Some(tx)),
        });

        self.calls
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(correlation_id.clone(), call);

        let guard = CallGuard {
            registry: Arc::clone(self),
            correlation_id,
        };
        (guard, rx)
    }

    /// Deliver a reply to the call registered under `correlation_id`.
    ///
    /// Returns true if a waiting caller received it. Unknown ids (late
    /// replies, replies meant for another client) return false.
    pub(crate) fn complete(&self, correlation_id: &str, reply: Reply) -> bool {
        // ---
        let call = {
            let calls = self.calls.read().unwrap_or_else(|e| e.into_inner());
            calls.get(correlation_id).cloned()
        };

        match call {
            Some(call) => call.complete(reply),
            None => false,
        }
    }

    fn remove(&self, correlation_id: &CorrelationId) -> bool {
        // ---
        self.calls
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(correlation_id)
            .is_some()
    }

    /// Number of calls currently registered.
    pub(crate) fn len(&self) -> usize {
        self.calls.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Removes its registry entry on drop.
pub(crate) struct CallGuard {
    // ---
    registry: Arc<CallRegistry>,
    correlation_id: CorrelationId,
}

impl CallGuard {
    pub(crate) fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.correlation_id);
    }
}
