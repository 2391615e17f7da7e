//! CTF/USDC approval management (spec.md §4.10 "CTF approvals"): a
//! session-scoped cache avoids re-approving every call; on a cache miss the
//! current on-chain allowance is queried and an approval transaction is
//! submitted only if it falls below a sufficiency threshold. Generalizes
//! the teacher's `arbitrage::approvals::set_polymarket_allowances`, which
//! unconditionally re-sent all six approvals on every startup, into a
//! cached check-then-approve per spender.

use std::collections::HashSet;

use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::abi::{build_allowance_call, build_erc20_approve, build_is_approved_for_all_call, build_set_approval_for_all, APPROVAL_GAS_LIMIT, MAX_UINT256};
use crate::wallet::parse_address;
use crate::executor::{ContractCall, ExecutorError, TxExecutor};
use crate::tx::PolygonRpc;

/// USDC has 6 decimals; treat an allowance at or above 10,000 USDC as
/// "sufficient" rather than requiring the full `MAX_UINT256` re-check on
/// every call (spec.md §4.10 "below a sufficiency threshold").
const SUFFICIENT_ALLOWANCE_USDC: u64 = 10_000 * 1_000_000;

#[derive(Hash, Eq, PartialEq, Clone, Copy)]
enum ApprovalKind {
    Erc20(&'static str),
    Erc1155(&'static str),
}

/// Session-scoped approval cache: once a spender/operator is confirmed
/// approved (from this process's own transaction or a satisfied allowance
/// read), it is never re-checked for the rest of the process's lifetime.
pub struct ApprovalCache {
    confirmed: RwLock<HashSet<ApprovalKind>>,
}

impl ApprovalCache {
    #[must_use]
    pub fn new() -> Self {
        Self { confirmed: RwLock::new(HashSet::new()) }
    }

    /// Ensures `spender` can pull `owner`'s USDC. Submits `approve(spender,
    /// MAX_UINT256)` only if the on-chain allowance is insufficient.
    pub async fn ensure_erc20_approved(
        &self,
        rpc: &PolygonRpc,
        executor: &dyn TxExecutor,
        usdc_address: &str,
        owner: [u8; 20],
        spender: &'static str,
    ) -> Result<(), ExecutorError> {
        let kind = ApprovalKind::Erc20(spender);
        if self.confirmed.read().contains(&kind) {
            return Ok(());
        }
        let spender_bytes = parse_address(spender).expect("static contract address");
        let call = build_allowance_call(&owner, &spender_bytes);
        let raw = rpc.eth_call(usdc_address, &call).await?;
        let allowance = decode_u256_as_u64(&raw);
        if allowance >= SUFFICIENT_ALLOWANCE_USDC {
            self.confirmed.write().insert(kind);
            return Ok(());
        }

        let usdc_bytes = parse_address(usdc_address).expect("valid usdc address");
        let data = build_erc20_approve(&spender_bytes);
        let outcome = executor.execute(ContractCall { to: usdc_bytes, data, gas_limit: APPROVAL_GAS_LIMIT }).await?;
        if outcome.success {
            self.confirmed.write().insert(kind);
        }
        Ok(())
    }

    /// Ensures `operator` can move `owner`'s conditional tokens. Submits
    /// `setApprovalForAll(operator, true)` only if not already approved.
    pub async fn ensure_erc1155_approved(
        &self,
        rpc: &PolygonRpc,
        executor: &dyn TxExecutor,
        ctf_address: &str,
        owner: [u8; 20],
        operator: &'static str,
    ) -> Result<(), ExecutorError> {
        let kind = ApprovalKind::Erc1155(operator);
        if self.confirmed.read().contains(&kind) {
            return Ok(());
        }
        let operator_bytes = parse_address(operator).expect("static contract address");
        let call = build_is_approved_for_all_call(&owner, &operator_bytes);
        let raw = rpc.eth_call(ctf_address, &call).await?;
        let already_approved = raw.last().copied().unwrap_or(0) == 1;
        if already_approved {
            self.confirmed.write().insert(kind);
            return Ok(());
        }

        let ctf_bytes = parse_address(ctf_address).expect("valid ctf address");
        let data = build_set_approval_for_all(&operator_bytes);
        let outcome = executor.execute(ContractCall { to: ctf_bytes, data, gas_limit: APPROVAL_GAS_LIMIT }).await?;
        if outcome.success {
            self.confirmed.write().insert(kind);
        }
        Ok(())
    }
}

impl Default for ApprovalCache {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_u256_as_u64(raw: &[u8]) -> u64 {
    if raw.len() < 32 {
        return 0;
    }
    let tail = &raw[raw.len() - 8..];
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(tail);
    u64::from_be_bytes(bytes)
}

/// Converts a `Decimal` share/USDC amount (natural units) to raw 10^6 units.
#[must_use]
pub fn to_usdc_raw_units(amount: Decimal) -> u64 {
    let scaled = (amount * Decimal::new(1_000_000, 0)).floor();
    scaled.to_string().parse().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_u256_as_u64_reads_trailing_bytes() {
        let mut raw = vec![0u8; 32];
        raw[31] = 42;
        assert_eq!(decode_u256_as_u64(&raw), 42);
    }

    #[test]
    fn to_usdc_raw_units_scales_by_a_million() {
        assert_eq!(to_usdc_raw_units(Decimal::new(150, 2)), 1_500_000);
    }

    #[test]
    fn max_uint256_constant_is_all_ones() {
        assert_eq!(MAX_UINT256, [0xffu8; 32]);
    }
}
