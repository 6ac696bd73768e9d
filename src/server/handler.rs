//! Method routing and handler type erasure.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::{log_error, Envelope, Result};

pub(crate) type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Type-erased request handler.
///
/// `Ok` carries the encoded success body. `Err` is turned into a reply whose
/// status is the error's message and whose body is empty.
pub(crate) trait CallHandler: Send + Sync {
    fn call(&self, envelope: &Envelope) -> BoxFuture<'static, Result<Bytes>>;
}

// Typed handler: JSON body in, JSON body out.
struct Handler<F, Fut, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TResp>> + Send,
    TReq: DeserializeOwned,
    TResp: Serialize,
{
    func: F,
    _phantom: std::marker::PhantomData<fn(TReq, TResp, Fut)>,
}

impl<F, Fut, TReq, TResp> CallHandler for Handler<F, Fut, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TResp>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    fn call(&self, envelope: &Envelope) -> BoxFuture<'static, Result<Bytes>> {
        // ---
        let req: TReq = match decode_body(&envelope.payload) {
            Ok(r) => r,
            Err(e) => return Box::pin(async move { Err(e) }),
        };

        let fut = (self.func)(req);
        let method = envelope.method().unwrap_or_default().to_string();

        Box::pin(async move {
            let resp = fut.await?;
            Ok(encode_body(&method, &resp))
        })
    }
}

// Raw handler: sees the whole envelope.
struct RawHandler<F, Fut, TResp>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TResp>> + Send,
    TResp: Serialize,
{
    func: F,
    _phantom: std::marker::PhantomData<fn(TResp, Fut)>,
}

impl<F, Fut, TResp> CallHandler for RawHandler<F, Fut, TResp>
where
    F: Fn(Envelope) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TResp>> + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    fn call(&self, envelope: &Envelope) -> BoxFuture<'static, Result<Bytes>> {
        // ---
        let method = envelope.method().unwrap_or_default().to_string();
        let fut = (self.func)(envelope.clone());

        Box::pin(async move {
            let resp = fut.await?;
            Ok(encode_body(&method, &resp))
        })
    }
}

/// An empty body decodes as JSON `null`.
fn decode_body<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    // ---
    let body: &[u8] = if payload.is_empty() { b"null" } else { payload };
    Ok(serde_json::from_slice(body)?)
}

/// Encoding failures are logged and produce an empty body; the reply still
/// goes out with a success status.
fn encode_body<T: Serialize>(method: &str, resp: &T) -> Bytes {
    // ---
    match serde_json::to_vec(resp) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_err) => {
            log_error!("{method}: failed to encode response: {_err}");
            Bytes::new()
        }
    }
}

/// Method name to handler table.
///
/// Built before the server starts and immutable afterwards.
///
/// # Example
///
/// ```
/// use fanout_rpc::{Router, RpcError};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Deserialize)]
/// struct Lookup { id: String }
/// #[derive(Serialize)]
/// struct Wallet { id: String, balance: i64 }
///
/// let router = Router::new()
///     .register("getWalletByID", |req: Lookup| async move {
///         if req.id == "w1" {
///             Ok(Wallet { id: req.id, balance: 100 })
///         } else {
///             Err(RpcError::NotFound)
///         }
///     })
///     .register("ping", |_: ()| async { Ok(()) });
///
/// assert_eq!(router.len(), 2);
/// assert!(router.contains("ping"));
/// ```
#[derive(Default)]
pub struct Router {
    handlers: HashMap<String, Arc<dyn CallHandler>>,
}

impl Router {
    // ---
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `method`.
    ///
    /// The request body is decoded into `TReq` (an empty body decodes as
    /// JSON `null`, so `()` and `Option<T>` work). Returning
    /// [`RpcError::NotFound`](crate::RpcError::NotFound) yields the
    /// `"not found"` status; any other error's message becomes the status
    /// verbatim. Registering a method twice replaces the earlier handler.
    pub fn register<TReq, TResp, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        // ---
        let handler_obj = Handler {
            func: handler,
            _phantom: std::marker::PhantomData,
        };
        self.handlers.insert(method.to_string(), Arc::new(handler_obj));
        self
    }

    /// Register a handler that receives the whole request envelope.
    ///
    /// Useful when the body is not JSON or the handler needs the correlation
    /// id or reply address.
    pub fn register_raw<TResp, F, Fut>(mut self, method: &str, handler: F) -> Self
    where
        TResp: Serialize + Send + 'static,
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        // ---
        let handler_obj = RawHandler {
            func: handler,
            _phantom: std::marker::PhantomData,
        };
        self.handlers.insert(method.to_string(), Arc::new(handler_obj));
        self
    }

    pub(crate) fn get(&self, method: &str) -> Option<Arc<dyn CallHandler>> {
        self.handlers.get(method).cloned()
    }

    /// True if a handler is registered for `method`.
    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    /// Number of registered methods.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{Address, CorrelationId, RpcError};
    use serde::Deserialize;

    #[derive(Deserialize)]
    struct Deposit {
        amount: i64,
    }

    #[derive(Serialize)]
    struct Balance {
        balance: i64,
    }

    fn request(method: &str, body: &'static [u8]) -> Envelope {
        Envelope::request(
            Address::from("rpc_server"),
            Arc::from(method),
            Bytes::from_static(body),
            CorrelationId::generate(),
            Address::from("rpc_client"),
        )
    }

    fn router() -> Router {
        Router::new()
            .register("deposit", |req: Deposit| async move {
                if req.amount < 0 {
                    return Err(RpcError::handler("negative amount"));
                }
                Ok(Balance {
                    balance: 100 + req.amount,
                })
            })
            .register("missing", |_: ()| async { Err::<(), _>(RpcError::NotFound) })
            .register("nothing", |req: Option<Deposit>| async move {
                Ok(req.map(|d| d.amount))
            })
            .register_raw("echo", |env: Envelope| async move {
                Ok(env.correlation_id.map(|c| c.to_string()))
            })
    }

    #[tokio::test]
    async fn test_typed_handler_round_trip() {
        // ---
        let handler = router().get("deposit").unwrap();
        let body = handler.call(&request("deposit", br#"{"amount":5}"#)).await.unwrap();
        assert_eq!(body, Bytes::from_static(br#"{"balance":105}"#));
    }

    #[tokio::test]
    async fn test_handler_error_keeps_message() {
        // ---
        let handler = router().get("deposit").unwrap();
        let err = handler
            .call(&request("deposit", br#"{"amount":-1}"#))
            .await
            .unwrap_err();
        assert_eq!(err.status(), "negative amount");

        let handler = router().get("missing").unwrap();
        let err = handler.call(&request("missing", b"")).await.unwrap_err();
        assert_eq!(err.status(), "not found");
    }

    #[tokio::test]
    async fn test_empty_body_decodes_as_null() {
        // ---
        let handler = router().get("nothing").unwrap();
        let body = handler.call(&request("nothing", b"")).await.unwrap();
        assert_eq!(body, Bytes::from_static(b"null"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_serialization_error() {
        // ---
        let handler = router().get("deposit").unwrap();
        let err = handler.call(&request("deposit", b"{oops")).await.unwrap_err();
        assert!(matches!(err, RpcError::Serialization(_)));
    }

    #[tokio::test]
    async fn test_raw_handler_sees_envelope() {
        // ---
        let env = request("echo", b"");
        let expected = format!("\"{}\"", env.correlation_id.clone().unwrap());

        let handler = router().get("echo").unwrap();
        let body = handler.call(&env).await.unwrap();
        assert_eq!(body, Bytes::from(expected));
    }

    #[test]
    fn test_unknown_method() {
        // ---
        let router = router();
        assert!(router.get("nope").is_none());
        assert!(!router.contains("nope"));
        assert_eq!(router.len(), 4);
        assert!(Router::new().is_empty());
    }
}
