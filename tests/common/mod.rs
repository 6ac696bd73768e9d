#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fanout_rpc::{
    //
    create_memory_transport_with_hub,
    MemoryHub,
    Result,
    Router,
    RpcClient,
    RpcConfig,
    RpcError,
    RpcServer,
};

pub const SERVER_EXCHANGE: &str = "rpc_server";
pub const CLIENT_EXCHANGE: &str = "rpc_client";

pub const TIMEOUT: Duration = Duration::from_millis(300);

// --- wallet protocol

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Wallet {
    pub id: String,
    pub balance: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateWallet {
    pub balance: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SendFunds {
    pub from: String,
    pub to: String,
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletLookup {
    #[serde(rename = "walletId")]
    pub wallet_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub from: String,
    pub to: String,
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Delay {
    pub ms: u64,
    pub tag: u32,
}

// --- in-memory ledger behind the routes

#[derive(Default)]
struct LedgerState {
    next_id: u64,
    wallets: HashMap<String, Wallet>,
    history: Vec<Transaction>,
}

#[derive(Default)]
pub struct Ledger {
    state: Mutex<LedgerState>,
}

impl Ledger {
    fn create(&self, balance: u64) -> Wallet {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let wallet = Wallet {
            id: format!("w{}", state.next_id),
            balance,
        };
        state.wallets.insert(wallet.id.clone(), wallet.clone());
        wallet
    }

    fn wallet(&self, id: &str) -> Result<Wallet> {
        let state = self.state.lock().unwrap();
        state.wallets.get(id).cloned().ok_or(RpcError::NotFound)
    }

    fn send(&self, req: SendFunds) -> Result<()> {
        let mut state = self.state.lock().unwrap();

        if req.from == req.to {
            return Err(RpcError::handler("sender is receiver"));
        }
        if req.amount == 0 {
            return Err(RpcError::handler("wrong amount"));
        }
        if !state.wallets.contains_key(&req.to) {
            return Err(RpcError::NotFound);
        }
        let from = state.wallets.get_mut(&req.from).ok_or(RpcError::NotFound)?;
        if from.balance < req.amount {
            return Err(RpcError::handler("insufficient funds"));
        }
        from.balance -= req.amount;
        if let Some(to) = state.wallets.get_mut(&req.to) {
            to.balance += req.amount;
        }

        state.history.push(Transaction {
            from: req.from,
            to: req.to,
            amount: req.amount,
        });
        Ok(())
    }

    fn history(&self, id: &str) -> Result<Vec<Transaction>> {
        let state = self.state.lock().unwrap();
        if !state.wallets.contains_key(id) {
            return Err(RpcError::NotFound);
        }
        Ok(state
            .history
            .iter()
            .filter(|t| t.from == id || t.to == id)
            .cloned()
            .collect())
    }
}

/// Wallet routes plus a few test-only methods.
pub fn wallet_router(ledger: Arc<Ledger>) -> Router {
    // ---
    let create = ledger.clone();
    let send = ledger.clone();
    let history = ledger.clone();
    let lookup = ledger;

    Router::new()
        .register("createNewWallet", move |req: CreateWallet| {
            let ledger = create.clone();
            async move { Ok(ledger.create(req.balance)) }
        })
        .register("sendFunds", move |req: SendFunds| {
            let ledger = send.clone();
            async move { ledger.send(req) }
        })
        .register("getWalletHistoryByID", move |req: WalletLookup| {
            let ledger = history.clone();
            async move { ledger.history(&req.wallet_id) }
        })
        .register("getWalletByID", move |req: WalletLookup| {
            let ledger = lookup.clone();
            async move { ledger.wallet(&req.wallet_id) }
        })
        .register("ping", |_: ()| async { Ok("pong") })
        .register("delay", |req: Delay| async move {
            tokio::time::sleep(Duration::from_millis(req.ms)).await;
            Ok(req.tag)
        })
}

// --- fixtures

pub fn init_logging() {
    // ---
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub fn config(id: &str) -> RpcConfig {
    RpcConfig::memory(id)
        .with_request_timeout(TIMEOUT)
        .with_connect_attempts(3)
        .with_connect_wait(Duration::from_millis(20))
        .with_workers(8)
}

pub async fn start_server(hub: &Arc<MemoryHub>) -> Result<RpcServer> {
    // ---
    start_server_with(hub, wallet_router(Arc::new(Ledger::default()))).await
}

pub async fn start_server_with(hub: &Arc<MemoryHub>, router: Router) -> Result<RpcServer> {
    // ---
    let config = config("server");
    let transport = create_memory_transport_with_hub(&config, hub.clone());
    let server = RpcServer::with_transport(transport, SERVER_EXCHANGE, router, &config).await?;
    server.start()?;
    Ok(server)
}

pub async fn start_client(hub: &Arc<MemoryHub>) -> Result<RpcClient> {
    // ---
    let config = config("client");
    let transport = create_memory_transport_with_hub(&config, hub.clone());
    RpcClient::with_transport(transport, SERVER_EXCHANGE, CLIENT_EXCHANGE, &config).await
}

/// Poll `cond` until it holds, panicking after two seconds.
pub async fn eventually<F, Fut>(what: &str, cond: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    // ---
    let waited = tokio::time::timeout(Duration::from_secs(2), async {
        while !cond().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    assert!(waited.is_ok(), "timed out waiting for: {what}");
}
