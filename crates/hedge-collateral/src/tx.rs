//! Minimal legacy (EIP-155) transaction construction, signing, and
//! broadcasting over a plain JSON-RPC endpoint. Adapted from the teacher's
//! `arbitrage::polygon_tx`: same hand-rolled RLP encoder and `k256`
//! prehash-recoverable signing (no RLP/ethers crate — k256 and sha3 cover
//! it), generalized into a `PolygonRpc` client that carries its own
//! `reqwest::Client`/URL rather than threading them through every call, and
//! extended with `eth_call` for the allowance/approval reads spec.md §4.10
//! needs that the teacher's approval-only module never performed.

use k256::ecdsa::SigningKey;
use reqwest::Client;
use sha3::{Digest, Keccak256};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum TxError {
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("rpc error: {0}")]
    Rpc(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("transaction rejected: {0}")]
    Rejected(String),
    #[error("timeout waiting for transaction receipt")]
    Timeout,
    #[error("invalid private key: {0}")]
    InvalidKey(String),
}

fn rlp_encode_bytes(data: &[u8]) -> Vec<u8> {
    if data.len() == 1 && data[0] < 0x80 {
        vec![data[0]]
    } else if data.len() <= 55 {
        let mut out = Vec::with_capacity(1 + data.len());
        out.push(0x80 + data.len() as u8);
        out.extend_from_slice(data);
        out
    } else {
        let len_bytes = to_minimal_be_bytes(data.len() as u64);
        let mut out = Vec::with_capacity(1 + len_bytes.len() + data.len());
        out.push(0xb7 + len_bytes.len() as u8);
        out.extend_from_slice(&len_bytes);
        out.extend_from_slice(data);
        out
    }
}

fn rlp_encode_u64(val: u64) -> Vec<u8> {
    if val == 0 {
        rlp_encode_bytes(&[])
    } else {
        rlp_encode_bytes(&to_minimal_be_bytes(val))
    }
}

fn rlp_encode_uint_bytes(val: &[u8]) -> Vec<u8> {
    let stripped = strip_leading_zeros(val);
    if stripped.is_empty() {
        rlp_encode_bytes(&[])
    } else {
        rlp_encode_bytes(stripped)
    }
}

fn rlp_encode_list(items: &[Vec<u8>]) -> Vec<u8> {
    let payload: Vec<u8> = items.iter().flat_map(|i| i.iter().copied()).collect();
    if payload.len() <= 55 {
        let mut out = Vec::with_capacity(1 + payload.len());
        out.push(0xc0 + payload.len() as u8);
        out.extend_from_slice(&payload);
        out
    } else {
        let len_bytes = to_minimal_be_bytes(payload.len() as u64);
        let mut out = Vec::with_capacity(1 + len_bytes.len() + payload.len());
        out.push(0xf7 + len_bytes.len() as u8);
        out.extend_from_slice(&len_bytes);
        out.extend_from_slice(&payload);
        out
    }
}

fn to_minimal_be_bytes(val: u64) -> Vec<u8> {
    let bytes = val.to_be_bytes();
    let stripped = strip_leading_zeros(&bytes);
    if stripped.is_empty() { vec![0] } else { stripped.to_vec() }
}

fn strip_leading_zeros(data: &[u8]) -> &[u8] {
    let start = data.iter().position(|&b| b != 0).unwrap_or(data.len());
    &data[start..]
}

/// A legacy (type 0) Ethereum transaction.
pub struct LegacyTx {
    pub nonce: u64,
    pub gas_price: u64,
    pub gas_limit: u64,
    pub to: [u8; 20],
    pub value: [u8; 32],
    pub data: Vec<u8>,
}

/// Signs a legacy transaction with EIP-155 replay protection, returning the
/// RLP-encoded signed transaction ready for broadcasting.
pub fn sign_legacy_tx(tx: &LegacyTx, chain_id: u64, private_key_hex: &str) -> Result<Vec<u8>, TxError> {
    let unsigned_rlp = rlp_encode_list(&[
        rlp_encode_u64(tx.nonce),
        rlp_encode_u64(tx.gas_price),
        rlp_encode_u64(tx.gas_limit),
        rlp_encode_bytes(&tx.to),
        rlp_encode_uint_bytes(&tx.value),
        rlp_encode_bytes(&tx.data),
        rlp_encode_u64(chain_id),
        rlp_encode_bytes(&[]),
        rlp_encode_bytes(&[]),
    ]);

    let hash = Keccak256::digest(&unsigned_rlp);
    let key_bytes = hex::decode(private_key_hex.strip_prefix("0x").unwrap_or(private_key_hex))
        .map_err(|e| TxError::InvalidKey(e.to_string()))?;
    let signing_key = SigningKey::from_bytes(key_bytes.as_slice().into())
        .map_err(|e| TxError::InvalidKey(e.to_string()))?;
    let (signature, recovery_id) = signing_key
        .sign_prehash_recoverable(&hash)
        .map_err(|e| TxError::Signing(e.to_string()))?;

    let r_bytes = signature.r().to_bytes();
    let s_bytes = signature.s().to_bytes();
    let v = chain_id * 2 + 35 + u64::from(recovery_id.to_byte());

    Ok(rlp_encode_list(&[
        rlp_encode_u64(tx.nonce),
        rlp_encode_u64(tx.gas_price),
        rlp_encode_u64(tx.gas_limit),
        rlp_encode_bytes(&tx.to),
        rlp_encode_uint_bytes(&tx.value),
        rlp_encode_bytes(&tx.data),
        rlp_encode_u64(v),
        rlp_encode_uint_bytes(r_bytes.as_slice()),
        rlp_encode_uint_bytes(s_bytes.as_slice()),
    ]))
}

/// A thin JSON-RPC client against a Polygon (or compatible EVM) node.
#[derive(Clone)]
pub struct PolygonRpc {
    http: Client,
    rpc_url: String,
}

impl PolygonRpc {
    #[must_use]
    pub fn new(rpc_url: impl Into<String>) -> Self {
        Self { http: Client::new(), rpc_url: rpc_url.into() }
    }

    pub async fn nonce(&self, address_checksummed: &str) -> Result<u64, TxError> {
        self.call_u64("eth_getTransactionCount", serde_json::json!([address_checksummed, "latest"])).await
    }

    pub async fn gas_price(&self) -> Result<u64, TxError> {
        self.call_u64("eth_gasPrice", serde_json::json!([])).await
    }

    /// Read-only contract call (`eth_call`), used for allowance/approval
    /// checks before deciding whether to submit an approval transaction.
    pub async fn eth_call(&self, to: &str, data: &[u8]) -> Result<Vec<u8>, TxError> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_call",
            "params": [{"to": to, "data": format!("0x{}", hex::encode(data))}, "latest"],
            "id": 1,
        });
        let resp: serde_json::Value =
            self.http.post(&self.rpc_url).json(&body).send().await?.json().await?;
        if let Some(error) = resp.get("error") {
            return Err(TxError::Rpc(error_message(error)));
        }
        let hex_str = resp.get("result").and_then(|r| r.as_str()).unwrap_or("0x");
        hex::decode(hex_str.strip_prefix("0x").unwrap_or(hex_str))
            .map_err(|e| TxError::Rpc(format!("malformed eth_call result: {e}")))
    }

    pub async fn broadcast(&self, signed_tx: &[u8]) -> Result<String, TxError> {
        let tx_hex = format!("0x{}", hex::encode(signed_tx));
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "eth_sendRawTransaction",
            "params": [tx_hex],
            "id": 1,
        });
        let resp: serde_json::Value =
            self.http.post(&self.rpc_url).json(&body).send().await?.json().await?;
        if let Some(error) = resp.get("error") {
            return Err(TxError::Rejected(error_message(error)));
        }
        resp.get("result")
            .and_then(|r| r.as_str())
            .map(str::to_string)
            .ok_or_else(|| TxError::Rpc("no tx hash in response".to_string()))
    }

    /// Polls every 2 seconds up to `timeout_secs`. Returns `true` on status `0x1`.
    pub async fn wait_for_receipt(&self, tx_hash: &str, timeout_secs: u64) -> Result<bool, TxError> {
        let start = std::time::Instant::now();
        let timeout = std::time::Duration::from_secs(timeout_secs);
        loop {
            if start.elapsed() > timeout {
                return Err(TxError::Timeout);
            }
            let body = serde_json::json!({
                "jsonrpc": "2.0",
                "method": "eth_getTransactionReceipt",
                "params": [tx_hash],
                "id": 1,
            });
            let resp: serde_json::Value =
                self.http.post(&self.rpc_url).json(&body).send().await?.json().await?;
            if let Some(result) = resp.get("result") {
                if !result.is_null() {
                    let status = result.get("status").and_then(|s| s.as_str()).unwrap_or("0x0");
                    let success = status == "0x1";
                    if success {
                        info!(tx_hash, "transaction confirmed");
                    } else {
                        debug!(tx_hash, "transaction reverted");
                    }
                    return Ok(success);
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
    }

    /// Signs, broadcasts and waits for a receipt in one call, bumping gas
    /// price by 20% to mirror the teacher's approval-flow buffer.
    pub async fn send_and_confirm(
        &self,
        to: [u8; 20],
        data: Vec<u8>,
        gas_limit: u64,
        chain_id: u64,
        signer_address_checksummed: &str,
        private_key_hex: &str,
        confirm_timeout_secs: u64,
    ) -> Result<(String, bool), TxError> {
        let nonce = self.nonce(signer_address_checksummed).await?;
        let gas_price = self.gas_price().await?;
        let gas_price = gas_price + gas_price / 5;
        let tx = LegacyTx { nonce, gas_price, gas_limit, to, value: [0u8; 32], data };
        let signed = sign_legacy_tx(&tx, chain_id, private_key_hex)?;
        let hash = self.broadcast(&signed).await?;
        let success = self.wait_for_receipt(&hash, confirm_timeout_secs).await?;
        Ok((hash, success))
    }

    async fn call_u64(&self, method: &str, params: serde_json::Value) -> Result<u64, TxError> {
        let body = serde_json::json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 });
        let resp: serde_json::Value =
            self.http.post(&self.rpc_url).json(&body).send().await?.json().await?;
        if let Some(error) = resp.get("error") {
            return Err(TxError::Rpc(error_message(error)));
        }
        let hex_str = resp
            .get("result")
            .and_then(|r| r.as_str())
            .ok_or_else(|| TxError::Rpc("no result in response".to_string()))?;
        u64::from_str_radix(hex_str.strip_prefix("0x").unwrap_or(hex_str), 16)
            .map_err(|e| TxError::Rpc(format!("failed to parse hex '{hex_str}': {e}")))
    }
}

fn error_message(error: &serde_json::Value) -> String {
    error.get("message").and_then(|m| m.as_str()).unwrap_or("unknown error").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rlp_encode_empty_bytes() {
        assert_eq!(rlp_encode_bytes(&[]), vec![0x80]);
    }

    #[test]
    fn rlp_encode_single_byte_below_0x80() {
        assert_eq!(rlp_encode_bytes(&[0x42]), vec![0x42]);
    }

    #[test]
    fn rlp_encode_u64_zero_and_small() {
        assert_eq!(rlp_encode_u64(0), vec![0x80]);
        assert_eq!(rlp_encode_u64(1), vec![0x01]);
        assert_eq!(rlp_encode_u64(1000), vec![0x82, 0x03, 0xe8]);
    }

    #[test]
    fn rlp_encode_empty_list() {
        assert_eq!(rlp_encode_list(&[]), vec![0xc0]);
    }

    #[test]
    fn sign_legacy_tx_produces_an_rlp_list_and_varies_with_nonce() {
        let key = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
        let base = LegacyTx { nonce: 0, gas_price: 30_000_000_000, gas_limit: 100_000, to: [0u8; 20], value: [0u8; 32], data: vec![] };
        let signed0 = sign_legacy_tx(&base, 137, key).unwrap();
        assert!(signed0[0] >= 0xc0);

        let mut other = LegacyTx { nonce: 1, gas_price: 30_000_000_000, gas_limit: 100_000, to: [0u8; 20], value: [0u8; 32], data: vec![] };
        other.nonce = 1;
        let signed1 = sign_legacy_tx(&other, 137, key).unwrap();
        assert_ne!(signed0, signed1);
    }
}
