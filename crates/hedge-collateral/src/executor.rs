//! `TxExecutor`: the adapter-at-construction design spec.md §9 calls for
//! ("Collateral operations are polymorphic over the capability set
//! `{sign_eip712, submit_safe_tx, submit_direct_tx, request_relayer_execute}`
//! ... Implement as an adapter selected at construction, not as runtime
//! conditionals scattered through each op"). One adapter per `AUTH_MODE`
//! value from spec.md §6: a plain EOA signs and broadcasts its own legacy
//! transactions (grounded on the teacher's `arbitrage::polygon_tx` +
//! `approvals` flow); `PROXY-direct` wraps the same call in a Gnosis Safe
//! `execTransaction` the operator signs and pays gas for itself
//! (`USE_DIRECT_EXECUTION=true`, `PAY_OWN_GAS=true`); `PROXY-relayer` hands
//! the signed SafeTx to a builder-operated relayer instead.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::safe::{build_exec_transaction, safe_tx_hash, sign_safe_tx_hash, SafeError, SafeTxParams};
use crate::tx::{PolygonRpc, TxError};
use crate::wallet::Wallet;

/// A contract call to execute: a `(to, calldata)` pair.
pub struct ContractCall {
    pub to: [u8; 20],
    pub data: Vec<u8>,
    pub gas_limit: u64,
}

#[derive(Debug, Clone)]
pub struct TxOutcome {
    pub tx_hash: Option<String>,
    pub success: bool,
}

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Safe(#[from] SafeError),
    #[error("relayer request failed: {0}")]
    Relayer(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[async_trait]
pub trait TxExecutor: Send + Sync {
    /// Submits `call`, blocking until a result (or failure) is known.
    async fn execute(&self, call: ContractCall) -> Result<TxOutcome, ExecutorError>;

    /// The address the executed calls act as (the `msg.sender` the target
    /// contract sees): the EOA itself, or the Safe/proxy address.
    fn acting_address(&self) -> [u8; 20];
}

/// `AUTH_MODE=EOA`: `submit_direct_tx` — a bare signed legacy transaction.
pub struct EoaExecutor {
    rpc: PolygonRpc,
    wallet: Wallet,
}

impl EoaExecutor {
    #[must_use]
    pub fn new(rpc: PolygonRpc, wallet: Wallet) -> Self {
        Self { rpc, wallet }
    }
}

#[async_trait]
impl TxExecutor for EoaExecutor {
    async fn execute(&self, call: ContractCall) -> Result<TxOutcome, ExecutorError> {
        let (hash, success) = self
            .rpc
            .send_and_confirm(
                call.to,
                call.data,
                call.gas_limit,
                self.wallet.chain_id(),
                &self.wallet.signer_address_checksummed(),
                self.wallet.expose_private_key(),
                60,
            )
            .await?;
        Ok(TxOutcome { tx_hash: Some(hash), success })
    }

    fn acting_address(&self) -> [u8; 20] {
        self.wallet.funder_address()
    }
}

/// `AUTH_MODE=PROXY`, `USE_DIRECT_EXECUTION=true`: `submit_safe_tx` — the
/// operator's EOA signs a `SafeTx` for its own Safe and submits
/// `execTransaction` directly, paying gas itself (`PAY_OWN_GAS=true`).
pub struct SafeDirectExecutor {
    rpc: PolygonRpc,
    wallet: Wallet,
    safe_nonce: parking_lot::Mutex<u64>,
}

impl SafeDirectExecutor {
    /// `starting_nonce` should be read from the Safe's `nonce()` getter at
    /// startup; this executor tracks it locally afterward rather than
    /// re-reading on every call.
    #[must_use]
    pub fn new(rpc: PolygonRpc, wallet: Wallet, starting_nonce: u64) -> Self {
        Self { rpc, wallet, safe_nonce: parking_lot::Mutex::new(starting_nonce) }
    }
}

#[async_trait]
impl TxExecutor for SafeDirectExecutor {
    async fn execute(&self, call: ContractCall) -> Result<TxOutcome, ExecutorError> {
        let nonce = {
            let mut guard = self.safe_nonce.lock();
            let n = *guard;
            *guard += 1;
            n
        };
        let params = SafeTxParams {
            safe_address: self.wallet.funder_address(),
            chain_id: self.wallet.chain_id(),
            to: call.to,
            data: &call.data,
            safe_tx_gas: 0,
            base_gas: 0,
            gas_price: 0,
            nonce,
        };
        let hash = safe_tx_hash(&params);
        let signature = sign_safe_tx_hash(&hash, self.wallet.expose_private_key())?;
        let exec_calldata = build_exec_transaction(&params, &signature);

        let (tx_hash, success) = self
            .rpc
            .send_and_confirm(
                self.wallet.funder_address(),
                exec_calldata,
                call.gas_limit + 50_000, // Safe's own dispatch overhead
                self.wallet.chain_id(),
                &self.wallet.signer_address_checksummed(),
                self.wallet.expose_private_key(),
                60,
            )
            .await?;
        Ok(TxOutcome { tx_hash: Some(tx_hash), success })
    }

    fn acting_address(&self) -> [u8; 20] {
        self.wallet.funder_address()
    }
}

#[derive(Debug, Deserialize)]
struct RelayerResponse {
    #[serde(default)]
    tx_hash: Option<String>,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
}

/// `AUTH_MODE=PROXY`, `USE_DIRECT_EXECUTION=false`: `request_relayer_execute`
/// — the operator signs the `SafeTx` but hands it to a builder-operated
/// relayer (credentials from environment per spec.md §6) that pays gas and
/// submits on the operator's behalf.
pub struct SafeRelayerExecutor {
    http: Client,
    relayer_url: String,
    relayer_api_key: String,
    wallet: Wallet,
    safe_nonce: parking_lot::Mutex<u64>,
}

impl SafeRelayerExecutor {
    #[must_use]
    pub fn new(relayer_url: impl Into<String>, relayer_api_key: impl Into<String>, wallet: Wallet, starting_nonce: u64) -> Self {
        Self {
            http: Client::new(),
            relayer_url: relayer_url.into(),
            relayer_api_key: relayer_api_key.into(),
            wallet,
            safe_nonce: parking_lot::Mutex::new(starting_nonce),
        }
    }
}

#[async_trait]
impl TxExecutor for SafeRelayerExecutor {
    async fn execute(&self, call: ContractCall) -> Result<TxOutcome, ExecutorError> {
        let nonce = {
            let mut guard = self.safe_nonce.lock();
            let n = *guard;
            *guard += 1;
            n
        };
        let params = SafeTxParams {
            safe_address: self.wallet.funder_address(),
            chain_id: self.wallet.chain_id(),
            to: call.to,
            data: &call.data,
            safe_tx_gas: 0,
            base_gas: 0,
            gas_price: 0,
            nonce,
        };
        let hash = safe_tx_hash(&params);
        let signature = sign_safe_tx_hash(&hash, self.wallet.expose_private_key())?;

        let body = serde_json::json!({
            "safe": crate::wallet::eip55_checksum(&self.wallet.funder_address()),
            "to": crate::wallet::eip55_checksum(&call.to),
            "data": format!("0x{}", hex::encode(&call.data)),
            "nonce": nonce,
            "signature": format!("0x{}", hex::encode(&signature)),
        });

        let response = self
            .http
            .post(&self.relayer_url)
            .header("x-api-key", &self.relayer_api_key)
            .json(&body)
            .send()
            .await?;
        let parsed: RelayerResponse = response.json().await.map_err(|e| ExecutorError::Relayer(e.to_string()))?;
        if let Some(err) = parsed.error {
            return Err(ExecutorError::Relayer(err));
        }
        Ok(TxOutcome { tx_hash: parsed.tx_hash, success: parsed.success })
    }

    fn acting_address(&self) -> [u8; 20] {
        self.wallet.funder_address()
    }
}
