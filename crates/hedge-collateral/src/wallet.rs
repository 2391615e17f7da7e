//! Private-key custody for the operator's EOA and Safe-owner signing key
//! (spec.md §4.10, §9 "signature-type polymorphism"). Adapted from the
//! teacher's `exchange-polymarket::arbitrage::signer::Wallet`: same
//! `SecretString`-backed custody and EIP-55 address derivation, generalized
//! so the chain ID and funder address are configured once at startup from
//! `RPC_URL`/`AUTH_MODE` rather than hardcoded mainnet defaults.

use secrecy::{ExposeSecret, SecretString};
use sha3::{Digest, Keccak256};
use thiserror::Error;

pub const PRIVATE_KEY_ENV: &str = "POLYMARKET_PRIVATE_KEY";
pub const POLYGON_MAINNET_CHAIN_ID: u64 = 137;

const PRIVATE_KEY_HEX_LEN: usize = 64;

#[derive(Debug, Error)]
pub enum WalletError {
    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
}

/// Signing key for either a bare EOA or a Safe owner, plus the address the
/// caller trades as (`POLYMARKET_FUNDER` for proxy modes, the derived
/// address for a plain EOA).
pub struct Wallet {
    private_key: SecretString,
    signer_address: [u8; 20],
    /// Address orders/positions are attributed to: the Safe/proxy address
    /// in `PROXY-*` modes, the signer's own address under `EOA`.
    funder_address: [u8; 20],
    chain_id: u64,
}

impl Wallet {
    /// Loads the key from `POLYMARKET_PRIVATE_KEY`. `funder` overrides the
    /// derived signer address (spec.md §6 `POLYMARKET_FUNDER`); pass `None`
    /// for `AUTH_MODE=EOA`, where the signer trades as itself.
    pub fn from_env(chain_id: u64, funder: Option<&str>) -> Result<Self, WalletError> {
        let key_raw = std::env::var(PRIVATE_KEY_ENV)
            .map_err(|_| WalletError::MissingEnvVar(PRIVATE_KEY_ENV.to_string()))?;
        if key_raw.is_empty() {
            return Err(WalletError::MissingEnvVar(PRIVATE_KEY_ENV.to_string()));
        }
        Self::from_private_key(&key_raw, chain_id, funder)
    }

    pub fn from_private_key(
        private_key: &str,
        chain_id: u64,
        funder: Option<&str>,
    ) -> Result<Self, WalletError> {
        let key_hex = private_key.strip_prefix("0x").unwrap_or(private_key);
        Self::validate_private_key(key_hex)?;
        let signer_address = Self::derive_address(key_hex)?;
        let funder_address = match funder {
            Some(addr) => parse_address(addr)
                .map_err(|e| WalletError::InvalidPrivateKey(format!("invalid funder: {e}")))?,
            None => signer_address,
        };
        Ok(Self {
            private_key: SecretString::from(key_hex.to_string()),
            signer_address,
            funder_address,
            chain_id,
        })
    }

    fn validate_private_key(key_hex: &str) -> Result<(), WalletError> {
        if key_hex.len() != PRIVATE_KEY_HEX_LEN {
            return Err(WalletError::InvalidPrivateKey(format!(
                "expected {PRIVATE_KEY_HEX_LEN} hex characters, got {}",
                key_hex.len()
            )));
        }
        if !key_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(WalletError::InvalidPrivateKey(
                "key contains non-hex characters".to_string(),
            ));
        }
        Ok(())
    }

    fn derive_address(key_hex: &str) -> Result<[u8; 20], WalletError> {
        use k256::ecdsa::SigningKey;

        let key_bytes = hex::decode(key_hex)
            .map_err(|e| WalletError::InvalidPrivateKey(format!("invalid hex: {e}")))?;
        let signing_key = SigningKey::from_slice(&key_bytes)
            .map_err(|e| WalletError::InvalidPrivateKey(format!("invalid secp256k1 key: {e}")))?;
        let public_key = signing_key.verifying_key().to_encoded_point(false);
        let mut hasher = Keccak256::new();
        hasher.update(&public_key.as_bytes()[1..]);
        let hash = hasher.finalize();
        let mut out = [0u8; 20];
        out.copy_from_slice(&hash[12..32]);
        Ok(out)
    }

    #[must_use]
    pub fn signer_address(&self) -> [u8; 20] {
        self.signer_address
    }

    #[must_use]
    pub fn funder_address(&self) -> [u8; 20] {
        self.funder_address
    }

    #[must_use]
    pub fn signer_address_checksummed(&self) -> String {
        eip55_checksum(&self.signer_address)
    }

    #[must_use]
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub(crate) fn expose_private_key(&self) -> &str {
        self.private_key.expose_secret()
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("signer_address", &eip55_checksum(&self.signer_address))
            .field("funder_address", &eip55_checksum(&self.funder_address))
            .field("chain_id", &self.chain_id)
            .field("private_key", &"[REDACTED]")
            .finish()
    }
}

/// Parses a hex address string (with or without `0x`) into 20 bytes.
pub fn parse_address(addr: &str) -> Result<[u8; 20], String> {
    let stripped = addr.strip_prefix("0x").unwrap_or(addr);
    let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex: {e}"))?;
    if bytes.len() != 20 {
        return Err(format!("address must be 20 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Applies EIP-55 mixed-case checksumming to raw address bytes.
#[must_use]
pub fn eip55_checksum(address_bytes: &[u8; 20]) -> String {
    let hex_address: String = address_bytes.iter().map(|b| format!("{b:02x}")).collect();
    let mut hasher = Keccak256::new();
    hasher.update(hex_address.as_bytes());
    let hash = hasher.finalize();

    let mut checksummed = String::with_capacity(42);
    checksummed.push_str("0x");
    for (i, c) in hex_address.chars().enumerate() {
        let nibble = if i % 2 == 0 { hash[i / 2] >> 4 } else { hash[i / 2] & 0x0f };
        if nibble >= 8 {
            checksummed.push(c.to_ascii_uppercase());
        } else {
            checksummed.push(c);
        }
    }
    checksummed
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    #[test]
    fn derives_checksummed_address_from_known_key() {
        let wallet = Wallet::from_private_key(TEST_KEY, POLYGON_MAINNET_CHAIN_ID, None).unwrap();
        assert_eq!(wallet.signer_address_checksummed(), "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266");
        assert_eq!(wallet.funder_address(), wallet.signer_address());
    }

    #[test]
    fn funder_override_differs_from_signer_under_proxy_modes() {
        let funder = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";
        let wallet = Wallet::from_private_key(TEST_KEY, POLYGON_MAINNET_CHAIN_ID, Some(funder)).unwrap();
        assert_ne!(wallet.funder_address(), wallet.signer_address());
        assert_eq!(wallet.funder_address(), parse_address(funder).unwrap());
    }

    #[test]
    fn rejects_wrong_length_key() {
        assert!(Wallet::from_private_key("deadbeef", POLYGON_MAINNET_CHAIN_ID, None).is_err());
    }

    #[test]
    fn debug_output_never_contains_private_key() {
        let wallet = Wallet::from_private_key(TEST_KEY, POLYGON_MAINNET_CHAIN_ID, None).unwrap();
        let debug = format!("{wallet:?}");
        assert!(!debug.contains(TEST_KEY));
        assert!(debug.contains("REDACTED"));
    }
}
