//! EIP-712 CLOB order signing. A distinct domain from the on-chain
//! `SPLIT`/`MERGE`/`REDEEM` transaction signing `hedge_collateral::Wallet`
//! owns: this signs the off-chain `Order` struct the venue's CLOB matching
//! engine requires on every `OrderRequest.signature`/`salt` pair. Grounded
//! on the teacher's `exchange-polymarket::arbitrage::{eip712,signer}` pair,
//! adapted from a standalone CLI signing flow into a component the
//! strategy loop owns and calls once per order. `hedge_exchange::ClobClient`
//! documents this as deliberately out of its own scope ("callers hand in
//! an already-signed `OrderRequest.signature`").

use hedge_collateral::wallet::parse_address;
use hedge_collateral::{CTF_EXCHANGE, NEG_RISK_CTF_EXCHANGE};
use hedge_core::events::OrderSide;
use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{RecoveryId, Signature, SigningKey};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use sha3::{Digest, Keccak256};
use thiserror::Error;

const DOMAIN_NAME: &str = "Polymarket CTF Exchange";
const DOMAIN_VERSION: &str = "1";
const ORDER_TYPE_STRING: &str = "Order(uint256 salt,address maker,address signer,address taker,uint256 tokenId,uint256 makerAmount,uint256 takerAmount,uint256 expiration,uint256 nonce,uint256 feeRateBps,uint8 side,uint8 signatureType)";
const DOMAIN_TYPE_STRING: &str = "EIP712Domain(string name,string version,uint256 chainId,address verifyingContract)";
const SIGNATURE_TYPE_EOA: u8 = 0;
const PRIVATE_KEY_ENV: &str = "POLYMARKET_PRIVATE_KEY";
const RAW_UNIT_SCALE: Decimal = Decimal::from_parts(1_000_000, 0, 0, false, 0);

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),
    #[error("invalid token id: {0}")]
    InvalidTokenId(String),
}

/// Parameters for one order (spec.md §4.7); `neg_risk` selects which
/// exchange contract's domain separator applies.
#[derive(Debug, Clone)]
pub struct BuildOrderParams {
    pub token_id: String,
    pub side: OrderSide,
    pub price: Decimal,
    pub size: Decimal,
    pub nonce: u64,
    pub fee_rate_bps: u16,
    pub neg_risk: bool,
}

#[derive(Debug, Clone)]
pub struct SignedOrder {
    pub signature: String,
    pub salt: String,
}

struct Eip712Order {
    salt: u64,
    maker: [u8; 20],
    token_id: String,
    maker_amount: u64,
    taker_amount: u64,
    nonce: u64,
    fee_rate_bps: u16,
    side: u8,
}

/// Signs CLOB orders as a plain EOA (`SIGNATURE_TYPE_EOA`); proxy-wallet
/// order signing is out of scope (spec.md §1 scopes signature-type
/// polymorphism to collateral operations, not CLOB orders).
pub struct OrderSigner {
    private_key: SecretString,
    maker: [u8; 20],
    chain_id: u64,
}

impl OrderSigner {
    pub fn from_env(maker: [u8; 20], chain_id: u64) -> Result<Self, SignerError> {
        let key = std::env::var(PRIVATE_KEY_ENV).map_err(|_| SignerError::MissingEnvVar(PRIVATE_KEY_ENV.to_string()))?;
        Self::new(&key, maker, chain_id)
    }

    pub fn new(private_key_hex: &str, maker: [u8; 20], chain_id: u64) -> Result<Self, SignerError> {
        let key_hex = private_key_hex.strip_prefix("0x").unwrap_or(private_key_hex);
        if key_hex.len() != 64 || !key_hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SignerError::InvalidPrivateKey("expected 64 hex characters".to_string()));
        }
        Ok(Self { private_key: SecretString::from(key_hex.to_string()), maker, chain_id })
    }

    /// Builds, hashes, and signs one CLOB order (spec.md §4.7: the
    /// `signature`/`salt` fields every `OrderRequest` needs).
    pub fn sign_order(&self, params: &BuildOrderParams) -> Result<SignedOrder, SignerError> {
        let order = self.build_order(params)?;
        let exchange = if params.neg_risk { NEG_RISK_CTF_EXCHANGE } else { CTF_EXCHANGE };
        let exchange_bytes = parse_address(exchange).map_err(SignerError::InvalidTokenId)?;
        let domain_separator = compute_domain_separator(self.chain_id, &exchange_bytes);
        let struct_hash = compute_order_struct_hash(&order)?;
        let signing_hash = compute_signing_hash(&domain_separator, &struct_hash);
        let signature = self.sign_hash(&signing_hash)?;
        Ok(SignedOrder { signature, salt: order.salt.to_string() })
    }

    fn build_order(&self, params: &BuildOrderParams) -> Result<Eip712Order, SignerError> {
        let (maker_amount, taker_amount) = calculate_amounts(params.side, params.price, params.size);
        Ok(Eip712Order {
            salt: generate_salt(),
            maker: self.maker,
            token_id: params.token_id.clone(),
            maker_amount,
            taker_amount,
            nonce: params.nonce,
            fee_rate_bps: params.fee_rate_bps,
            side: match params.side {
                OrderSide::Buy => 0,
                OrderSide::Sell => 1,
            },
        })
    }

    fn sign_hash(&self, hash: &[u8; 32]) -> Result<String, SignerError> {
        let key_bytes = hex::decode(self.private_key.expose_secret())
            .map_err(|e| SignerError::InvalidPrivateKey(format!("invalid hex: {e}")))?;
        let signing_key =
            SigningKey::from_slice(&key_bytes).map_err(|e| SignerError::InvalidPrivateKey(format!("invalid secp256k1 key: {e}")))?;
        let (signature, recovery_id): (Signature, RecoveryId) =
            signing_key.sign_prehash(hash).map_err(|e| SignerError::InvalidPrivateKey(format!("signing failed: {e}")))?;
        let r = signature.r().to_bytes();
        let s = signature.s().to_bytes();
        let v = recovery_id.to_byte() + 27;
        Ok(format!("0x{}{}{:02x}", hex::encode(r), hex::encode(s), v))
    }
}

/// `calculate_amounts(side, price, size)`: raw on-chain units at 6 decimals
/// for both the settlement token and the conditional-token legs, matching
/// USDC/CTF share precision elsewhere in the workspace.
fn calculate_amounts(side: OrderSide, price: Decimal, size: Decimal) -> (u64, u64) {
    let token_units = to_raw_units(size);
    let usdc_units = to_raw_units(price * size);
    match side {
        // maker gives USDC, wants tokens.
        OrderSide::Buy => (usdc_units, token_units),
        // maker gives tokens, wants USDC.
        OrderSide::Sell => (token_units, usdc_units),
    }
}

fn to_raw_units(amount: Decimal) -> u64 {
    (amount * RAW_UNIT_SCALE).floor().to_string().parse().unwrap_or(0)
}

/// `Math.round(now_secs * rand())`, matching the venue reference clients'
/// salt generation (collision probability is not security-relevant here;
/// the salt only needs to make otherwise-identical orders hash distinctly).
fn generate_salt() -> u64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    let jitter: u64 = rand::random::<u32>() as u64;
    now.wrapping_mul(jitter.max(1))
}

fn keccak(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn abi_address(addr: &[u8; 20]) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[12..].copy_from_slice(addr);
    out
}

fn abi_u64(value: u64) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[24..].copy_from_slice(&value.to_be_bytes());
    out
}

fn abi_u8(value: u8) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[31] = value;
    out
}

/// Converts a large base-10 token-id string into its 32-byte big-endian
/// `uint256` representation (token ids exceed `u64` range).
fn token_id_to_u256(token_id: &str) -> Result<[u8; 32], SignerError> {
    let mut digits = [0u8; 32];
    for ch in token_id.chars() {
        let digit = ch.to_digit(10).ok_or_else(|| SignerError::InvalidTokenId(token_id.to_string()))?;
        let mut carry = u32::from(digit);
        for byte in digits.iter_mut().rev() {
            let product = u32::from(*byte) * 10 + carry;
            *byte = (product & 0xff) as u8;
            carry = product >> 8;
        }
        if carry != 0 {
            return Err(SignerError::InvalidTokenId(format!("{token_id} overflows 256 bits")));
        }
    }
    Ok(digits)
}

fn compute_domain_separator(chain_id: u64, exchange: &[u8; 20]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(32 * 5);
    buf.extend_from_slice(&keccak(DOMAIN_TYPE_STRING.as_bytes()));
    buf.extend_from_slice(&keccak(DOMAIN_NAME.as_bytes()));
    buf.extend_from_slice(&keccak(DOMAIN_VERSION.as_bytes()));
    buf.extend_from_slice(&abi_u64(chain_id));
    buf.extend_from_slice(&abi_address(exchange));
    keccak(&buf)
}

fn compute_order_struct_hash(order: &Eip712Order) -> Result<[u8; 32], SignerError> {
    let mut buf = Vec::with_capacity(32 * 12);
    buf.extend_from_slice(&keccak(ORDER_TYPE_STRING.as_bytes()));
    buf.extend_from_slice(&abi_u64(order.salt));
    buf.extend_from_slice(&abi_address(&order.maker));
    buf.extend_from_slice(&abi_address(&order.maker)); // signer == maker for a plain EOA
    buf.extend_from_slice(&[0u8; 32]); // taker: zero address (any counterparty)
    buf.extend_from_slice(&token_id_to_u256(&order.token_id)?);
    buf.extend_from_slice(&abi_u64(order.maker_amount));
    buf.extend_from_slice(&abi_u64(order.taker_amount));
    buf.extend_from_slice(&abi_u64(0)); // expiration: 0 means "no expiration" for GTC/FAK alike
    buf.extend_from_slice(&abi_u64(order.nonce));
    buf.extend_from_slice(&abi_u64(u64::from(order.fee_rate_bps)));
    buf.extend_from_slice(&abi_u8(order.side));
    buf.extend_from_slice(&abi_u8(SIGNATURE_TYPE_EOA));
    Ok(keccak(&buf))
}

fn compute_signing_hash(domain_separator: &[u8; 32], struct_hash: &[u8; 32]) -> [u8; 32] {
    let mut buf = Vec::with_capacity(2 + 32 + 32);
    buf.push(0x19);
    buf.push(0x01);
    buf.extend_from_slice(domain_separator);
    buf.extend_from_slice(struct_hash);
    keccak(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const TEST_KEY: &str = "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn signer() -> OrderSigner {
        OrderSigner::new(TEST_KEY, [0x11; 20], 137).unwrap()
    }

    #[test]
    fn calculate_amounts_buy_splits_usdc_and_token_legs() {
        let (maker, taker) = calculate_amounts(OrderSide::Buy, dec!(0.42), dec!(10));
        assert_eq!(maker, 4_200_000);
        assert_eq!(taker, 10_000_000);
    }

    #[test]
    fn calculate_amounts_sell_swaps_legs() {
        let (maker, taker) = calculate_amounts(OrderSide::Sell, dec!(0.56), dec!(10));
        assert_eq!(maker, 10_000_000);
        assert_eq!(taker, 5_600_000);
    }

    #[test]
    fn token_id_to_u256_round_trips_small_values() {
        let bytes = token_id_to_u256("256").unwrap();
        assert_eq!(bytes[30], 1);
        assert_eq!(bytes[31], 0);
    }

    #[test]
    fn token_id_to_u256_rejects_non_digits() {
        assert!(token_id_to_u256("12a").is_err());
    }

    #[test]
    fn sign_order_produces_130_hex_char_signature() {
        let params = BuildOrderParams {
            token_id: "123456789012345678901234567890".to_string(),
            side: OrderSide::Buy,
            price: dec!(0.42),
            size: dec!(10),
            nonce: 0,
            fee_rate_bps: 0,
            neg_risk: false,
        };
        let signed = signer().sign_order(&params).unwrap();
        assert_eq!(signed.signature.len(), 2 + 130);
        assert!(signed.signature.starts_with("0x"));
    }

    #[test]
    fn sign_order_differs_between_standard_and_neg_risk_domains() {
        let base = BuildOrderParams {
            token_id: "42".to_string(),
            side: OrderSide::Sell,
            price: dec!(0.5),
            size: dec!(5),
            nonce: 1,
            fee_rate_bps: 0,
            neg_risk: false,
        };
        let neg_risk = BuildOrderParams { neg_risk: true, ..base.clone() };
        let s1 = signer().sign_order(&base).unwrap();
        let s2 = signer().sign_order(&neg_risk).unwrap();
        assert_ne!(s1.signature, s2.signature);
    }
}
