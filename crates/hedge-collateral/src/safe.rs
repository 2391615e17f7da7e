//! Gnosis Safe `SafeTx` EIP-712 hashing and `execTransaction` calldata, used
//! by `PROXY-direct` mode (spec.md §9 "submit_safe_tx" capability): the
//! operator owns a 1-of-1 Safe as its funder address and signs+submits the
//! transaction itself rather than routing it through a relayer. Follows the
//! same domain-separator/struct-hash/signing-hash shape as the teacher's
//! `arbitrage::eip712` order signing, applied to the Safe contract's
//! `SafeTx` typehash instead of the CTF Exchange's `Order` typehash.

use k256::ecdsa::SigningKey;
use sha3::{Digest, Keccak256};
use thiserror::Error;

const SAFE_DOMAIN_TYPE_HASH_INPUT: &str = "EIP712Domain(uint256 chainId,address verifyingContract)";
const SAFE_TX_TYPE_HASH_INPUT: &str =
    "SafeTx(address to,uint256 value,bytes data,uint8 operation,uint256 safeTxGas,\
     uint256 baseGas,uint256 gasPrice,address gasToken,address refundReceiver,uint256 nonce)";

/// `execTransaction(address,uint256,bytes,uint8,uint256,uint256,uint256,address,address,bytes)`.
const EXEC_TRANSACTION_SELECTOR: [u8; 4] = [0x6a, 0x76, 0x12, 0x02];

#[derive(Debug, Error)]
pub enum SafeError {
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("invalid key: {0}")]
    InvalidKey(String),
}

fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn encode_address(addr: &[u8; 20]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..32].copy_from_slice(addr);
    out
}

fn encode_u256(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..32].copy_from_slice(&value.to_be_bytes());
    out
}

/// One Safe multisig transaction (operation 0 = `CALL`, the only kind this
/// crate ever submits).
pub struct SafeTxParams<'a> {
    pub safe_address: [u8; 20],
    pub chain_id: u64,
    pub to: [u8; 20],
    pub data: &'a [u8],
    pub safe_tx_gas: u64,
    pub base_gas: u64,
    pub gas_price: u64,
    pub nonce: u64,
}

fn domain_separator(chain_id: u64, safe_address: &[u8; 20]) -> [u8; 32] {
    let mut encoded = Vec::with_capacity(3 * 32);
    encoded.extend_from_slice(&keccak256(SAFE_DOMAIN_TYPE_HASH_INPUT.as_bytes()));
    encoded.extend_from_slice(&encode_u256(chain_id));
    encoded.extend_from_slice(&encode_address(safe_address));
    keccak256(&encoded)
}

fn struct_hash(params: &SafeTxParams<'_>) -> [u8; 32] {
    let data_hash = keccak256(params.data);
    let mut encoded = Vec::with_capacity(10 * 32);
    encoded.extend_from_slice(&keccak256(SAFE_TX_TYPE_HASH_INPUT.as_bytes()));
    encoded.extend_from_slice(&encode_address(&params.to));
    encoded.extend_from_slice(&encode_u256(0)); // value: Polymarket calls never move native MATIC
    encoded.extend_from_slice(&data_hash);
    encoded.extend_from_slice(&encode_u256(0)); // operation: CALL
    encoded.extend_from_slice(&encode_u256(params.safe_tx_gas));
    encoded.extend_from_slice(&encode_u256(params.base_gas));
    encoded.extend_from_slice(&encode_u256(params.gas_price));
    encoded.extend_from_slice(&encode_address(&[0u8; 20])); // gasToken: native
    encoded.extend_from_slice(&encode_address(&[0u8; 20])); // refundReceiver: none
    encoded.extend_from_slice(&encode_u256(params.nonce));
    keccak256(&encoded)
}

/// The final `keccak256("\x19\x01" || domainSeparator || structHash)`.
#[must_use]
pub fn safe_tx_hash(params: &SafeTxParams<'_>) -> [u8; 32] {
    let domain = domain_separator(params.chain_id, &params.safe_address);
    let st_hash = struct_hash(params);
    let mut data = Vec::with_capacity(66);
    data.push(0x19);
    data.push(0x01);
    data.extend_from_slice(&domain);
    data.extend_from_slice(&st_hash);
    keccak256(&data)
}

/// Signs the SafeTx hash, returning `r||s||v` (v = 27/28, the format Safe's
/// `checkNSignatures` expects for a single EOA-owner ECDSA signature).
pub fn sign_safe_tx_hash(hash: &[u8; 32], private_key_hex: &str) -> Result<Vec<u8>, SafeError> {
    let key_bytes = hex::decode(private_key_hex.strip_prefix("0x").unwrap_or(private_key_hex))
        .map_err(|e| SafeError::InvalidKey(e.to_string()))?;
    let signing_key =
        SigningKey::from_bytes(key_bytes.as_slice().into()).map_err(|e| SafeError::InvalidKey(e.to_string()))?;
    let (signature, recovery_id) = signing_key
        .sign_prehash_recoverable(hash)
        .map_err(|e| SafeError::Signing(e.to_string()))?;
    let mut out = Vec::with_capacity(65);
    out.extend_from_slice(&signature.r().to_bytes());
    out.extend_from_slice(&signature.s().to_bytes());
    out.push(recovery_id.to_byte() + 27);
    Ok(out)
}

/// Builds `execTransaction(to, 0, data, 0, safeTxGas, baseGas, gasPrice, 0x0, 0x0, signature)` calldata.
#[must_use]
pub fn build_exec_transaction(params: &SafeTxParams<'_>, signature: &[u8]) -> Vec<u8> {
    // Head: 10 words (9 static + 1 offset to `signatures`), then `data` and `signatures` tails.
    let mut out = Vec::with_capacity(4 + 32 * 12 + params.data.len() + signature.len());
    out.extend_from_slice(&EXEC_TRANSACTION_SELECTOR);
    out.extend_from_slice(&encode_address(&params.to));
    out.extend_from_slice(&encode_u256(0)); // value
    out.extend_from_slice(&encode_u256(0x140)); // offset to `data`: 10 head words * 32
    out.extend_from_slice(&encode_u256(0)); // operation
    out.extend_from_slice(&encode_u256(params.safe_tx_gas));
    out.extend_from_slice(&encode_u256(params.base_gas));
    out.extend_from_slice(&encode_u256(params.gas_price));
    out.extend_from_slice(&encode_address(&[0u8; 20])); // gasToken
    out.extend_from_slice(&encode_address(&[0u8; 20])); // refundReceiver
    let data_words = (params.data.len() + 31) / 32;
    let signatures_offset = 0x140 + 32 + data_words as u64 * 32;
    out.extend_from_slice(&encode_u256(signatures_offset));
    // `data` tail
    out.extend_from_slice(&encode_u256(params.data.len() as u64));
    out.extend_from_slice(params.data);
    out.extend(vec![0u8; data_words * 32 - params.data.len()]);
    // `signatures` tail
    out.extend_from_slice(&encode_u256(signature.len() as u64));
    out.extend_from_slice(signature);
    let sig_words = (signature.len() + 31) / 32;
    out.extend(vec![0u8; sig_words * 32 - signature.len()]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn sample_params(data: &[u8]) -> SafeTxParams<'_> {
        SafeTxParams {
            safe_address: [0x11; 20],
            chain_id: 137,
            to: [0x22; 20],
            data,
            safe_tx_gas: 0,
            base_gas: 0,
            gas_price: 0,
            nonce: 3,
        }
    }

    #[test]
    fn safe_tx_hash_is_deterministic() {
        let data = [0x01, 0x02, 0x03];
        let h1 = safe_tx_hash(&sample_params(&data));
        let h2 = safe_tx_hash(&sample_params(&data));
        assert_eq!(h1, h2);
        assert_ne!(h1, [0u8; 32]);
    }

    #[test]
    fn safe_tx_hash_changes_with_nonce() {
        let data = [0x01];
        let mut p1 = sample_params(&data);
        p1.nonce = 1;
        let mut p2 = sample_params(&data);
        p2.nonce = 2;
        assert_ne!(safe_tx_hash(&p1), safe_tx_hash(&p2));
    }

    #[test]
    fn sign_and_build_exec_transaction_round_trips_length() {
        let data = vec![0xAB; 68];
        let params = sample_params(&data);
        let hash = safe_tx_hash(&params);
        let sig = sign_safe_tx_hash(&hash, TEST_KEY).unwrap();
        assert_eq!(sig.len(), 65);

        let calldata = build_exec_transaction(&params, &sig);
        assert_eq!(&calldata[0..4], &EXEC_TRANSACTION_SELECTOR);
        // head (10 words) + data length word + 3 padded data words (68B) + sig length word + 3 padded sig words (65B)
        assert_eq!(calldata.len(), 4 + 32 * 10 + 32 + 96 + 32 + 96);
    }
}
