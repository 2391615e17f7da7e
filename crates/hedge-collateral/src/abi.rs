//! Contract addresses and ABI calldata encoding for the Conditional Tokens
//! Framework (CTF), its NegRisk adapter, ERC-20/ERC-1155 approvals, and the
//! Gnosis Safe `execTransaction` entry point used by `PROXY-direct` mode.
//! Grounded on the teacher's `arbitrage::approvals` (contract addresses,
//! `approve`/`setApprovalForAll` selectors), generalized here with the CTF
//! `split`/`merge`/`redeem` selectors and the Safe selector the teacher's
//! approval-only module never needed.

/// USDCe (PoS bridged USDC) on Polygon.
pub const USDCE: &str = "0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174";
/// Conditional Tokens Framework (ERC-1155).
pub const CTF: &str = "0x4D97DCd97eC945f40cF65F87097ACe5EA0476045";
/// Polymarket CTF Exchange.
pub const CTF_EXCHANGE: &str = "0x4bFb41d5B3570DeFd03C39a9A4D8dE6Bd8B8982E";
/// Polymarket Neg Risk CTF Exchange.
pub const NEG_RISK_CTF_EXCHANGE: &str = "0xC5d563A36AE78145C45a50134d48A1215220f80a";
/// Polymarket Neg Risk Adapter: wraps CTF split/merge/redeem in a single-arg
/// variant scoped to one neg-risk market (spec.md §4.10).
pub const NEG_RISK_ADAPTER: &str = "0xd91E80cF2E7be2e162c6513ceD06f1dD0dA35296";

pub const POLYGON_CHAIN_ID: u64 = 137;
pub const APPROVAL_GAS_LIMIT: u64 = 100_000;
pub const CTF_OP_GAS_LIMIT: u64 = 300_000;

const APPROVE_SELECTOR: [u8; 4] = [0x09, 0x5e, 0xa7, 0xb3];
const SET_APPROVAL_FOR_ALL_SELECTOR: [u8; 4] = [0xa2, 0x2c, 0xb4, 0x65];
const ALLOWANCE_SELECTOR: [u8; 4] = [0xdd, 0x62, 0xed, 0x3e];
const IS_APPROVED_FOR_ALL_SELECTOR: [u8; 4] = [0xe9, 0x85, 0xe9, 0xc5];
/// Standard CTF `splitPosition(address,bytes32,bytes32,uint256[],uint256)`.
const SPLIT_POSITION_SELECTOR: [u8; 4] = [0x72, 0xce, 0x42, 0x75];
/// Standard CTF `mergePositions(address,bytes32,bytes32,uint256[],uint256)`.
const MERGE_POSITIONS_SELECTOR: [u8; 4] = [0x9e, 0x72, 0x12, 0xad];
/// Standard CTF `redeemPositions(address,bytes32,bytes32,uint256[])`.
const REDEEM_POSITIONS_SELECTOR: [u8; 4] = [0x01, 0xb7, 0x03, 0x7c];
/// NegRisk adapter `splitPosition(bytes32,uint256)` single-arg variant.
const NEG_RISK_SPLIT_SELECTOR: [u8; 4] = [0xa3, 0xd7, 0xda, 0x1d];
/// NegRisk adapter `mergePositions(bytes32,uint256)` single-arg variant.
const NEG_RISK_MERGE_SELECTOR: [u8; 4] = [0xb1, 0x0c, 0x5c, 0x17];
/// NegRisk adapter `redeemPositions(bytes32,uint256[])`: per-outcome share
/// amounts rather than CTF's index-set encoding (spec.md §4.10 "`shares`
/// required for NegRisk path").
const NEG_RISK_REDEEM_SELECTOR: [u8; 4] = [0xdb, 0xec, 0xcb, 0x23];

pub const MAX_UINT256: [u8; 32] = [0xff; 32];

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

fn encode_bool(value: bool) -> [u8; 32] {
    let mut out = [0u8; 32];
    out[31] = u8::from(value);
    out
}

/// ABI-encodes a dynamic `uint256[]` tail (offset word is the caller's
/// responsibility since it depends on preceding head slots).
fn encode_u256_array(values: &[u64]) -> Vec<u8> {
    let mut out = encode_u256(values.len() as u64).to_vec();
    for &v in values {
        out.extend_from_slice(&encode_u256(v));
    }
    out
}

pub fn build_erc20_approve(spender: &[u8; 20]) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&APPROVE_SELECTOR);
    data.extend_from_slice(&encode_address(spender));
    data.extend_from_slice(&MAX_UINT256);
    data
}

pub fn build_set_approval_for_all(operator: &[u8; 20]) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&SET_APPROVAL_FOR_ALL_SELECTOR);
    data.extend_from_slice(&encode_address(operator));
    data.extend_from_slice(&encode_bool(true));
    data
}

pub fn build_allowance_call(owner: &[u8; 20], spender: &[u8; 20]) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&ALLOWANCE_SELECTOR);
    data.extend_from_slice(&encode_address(owner));
    data.extend_from_slice(&encode_address(spender));
    data
}

pub fn build_is_approved_for_all_call(owner: &[u8; 20], operator: &[u8; 20]) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&IS_APPROVED_FOR_ALL_SELECTOR);
    data.extend_from_slice(&encode_address(owner));
    data.extend_from_slice(&encode_address(operator));
    data
}

/// Parses a 32-byte big-endian `bytes32` condition/collection ID.
pub fn parse_bytes32(hex_str: &str) -> Result<[u8; 32], String> {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let bytes = hex::decode(stripped).map_err(|e| format!("invalid hex: {e}"))?;
    if bytes.len() != 32 {
        return Err(format!("condition id must be 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Standard CTF `splitPosition(collateral, parentCollectionId=0, conditionId, partition=[1,2], amount)`.
pub fn build_split_position(collateral: &[u8; 20], condition_id: &[u8; 32], amount: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * 6);
    data.extend_from_slice(&SPLIT_POSITION_SELECTOR);
    data.extend_from_slice(&encode_address(collateral));
    data.extend_from_slice(&[0u8; 32]); // parentCollectionId: root collection
    data.extend_from_slice(condition_id);
    data.extend_from_slice(&encode_u256(0xA0)); // offset to partition: 5 head words * 32
    data.extend_from_slice(&encode_u256(amount));
    data.extend_from_slice(&encode_u256_array(&[1, 2])); // binary outcome index sets
    data
}

pub fn build_merge_positions(collateral: &[u8; 20], condition_id: &[u8; 32], amount: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * 6);
    data.extend_from_slice(&MERGE_POSITIONS_SELECTOR);
    data.extend_from_slice(&encode_address(collateral));
    data.extend_from_slice(&[0u8; 32]);
    data.extend_from_slice(condition_id);
    data.extend_from_slice(&encode_u256(0xA0));
    data.extend_from_slice(&encode_u256(amount));
    data.extend_from_slice(&encode_u256_array(&[1, 2]));
    data
}

/// Standard CTF `redeemPositions(collateral, parentCollectionId=0, conditionId, indexSets=[1,2])`.
pub fn build_redeem_positions(collateral: &[u8; 20], condition_id: &[u8; 32]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * 5);
    data.extend_from_slice(&REDEEM_POSITIONS_SELECTOR);
    data.extend_from_slice(&encode_address(collateral));
    data.extend_from_slice(&[0u8; 32]);
    data.extend_from_slice(condition_id);
    data.extend_from_slice(&encode_u256(0x80)); // offset: 4 head words * 32
    data.extend_from_slice(&encode_u256_array(&[1, 2]));
    data
}

/// NegRisk adapter single-arg `splitPosition(conditionId, amount)`.
pub fn build_neg_risk_split(condition_id: &[u8; 32], amount: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&NEG_RISK_SPLIT_SELECTOR);
    data.extend_from_slice(condition_id);
    data.extend_from_slice(&encode_u256(amount));
    data
}

pub fn build_neg_risk_merge(condition_id: &[u8; 32], amount: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&NEG_RISK_MERGE_SELECTOR);
    data.extend_from_slice(condition_id);
    data.extend_from_slice(&encode_u256(amount));
    data
}

/// NegRisk adapter `redeemPositions(conditionId, amounts=[yesShares, noShares])`
/// (spec.md §4.10: `shares` is required on this path).
pub fn build_neg_risk_redeem(condition_id: &[u8; 32], yes_shares: u64, no_shares: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * 4);
    data.extend_from_slice(&NEG_RISK_REDEEM_SELECTOR);
    data.extend_from_slice(condition_id);
    data.extend_from_slice(&encode_u256(0x40)); // offset: 2 head words * 32
    data.extend_from_slice(&encode_u256_array(&[yes_shares, no_shares]));
    data
}

#[cfg(test)]
mod tests {
    use super::super::wallet::parse_address;
    use super::*;

    #[test]
    fn erc20_approve_calldata_format() {
        let spender = [0xAA; 20];
        let data = build_erc20_approve(&spender);
        assert_eq!(data.len(), 68);
        assert_eq!(&data[0..4], &APPROVE_SELECTOR);
        assert_eq!(&data[16..36], &[0xAA; 20]);
        assert_eq!(&data[36..68], &MAX_UINT256);
    }

    #[test]
    fn set_approval_for_all_calldata_format() {
        let operator = [0xBB; 20];
        let data = build_set_approval_for_all(&operator);
        assert_eq!(data.len(), 68);
        assert_eq!(&data[0..4], &SET_APPROVAL_FOR_ALL_SELECTOR);
        assert_eq!(data[67], 1);
    }

    #[test]
    fn split_position_calldata_has_correct_length_and_selector() {
        let collateral = parse_address(USDCE).unwrap();
        let condition_id = [0x42; 32];
        let data = build_split_position(&collateral, &condition_id, 1_000_000);
        assert_eq!(&data[0..4], &SPLIT_POSITION_SELECTOR);
        assert_eq!(data.len(), 4 + 32 * 6);
        assert_eq!(&data[4 + 32..4 + 64], &encode_address(&collateral));
    }

    #[test]
    fn neg_risk_split_is_two_args_only() {
        let condition_id = [0x7; 32];
        let data = build_neg_risk_split(&condition_id, 500_000);
        assert_eq!(data.len(), 4 + 32 * 2);
        assert_eq!(&data[0..4], &NEG_RISK_SPLIT_SELECTOR);
    }

    #[test]
    fn neg_risk_redeem_encodes_both_outcome_shares() {
        let condition_id = [0x9; 32];
        let data = build_neg_risk_redeem(&condition_id, 12, 34);
        assert_eq!(&data[0..4], &NEG_RISK_REDEEM_SELECTOR);
        // amounts array length = 2 at offset 4 + 32 (conditionId) + 32 (array offset)
        let len_word = &data[4 + 64..4 + 96];
        assert_eq!(len_word[31], 2);
    }

    #[test]
    fn parse_bytes32_rejects_wrong_length() {
        assert!(parse_bytes32("0x1234").is_err());
        assert!(parse_bytes32(&"00".repeat(32)).is_ok());
    }
}
