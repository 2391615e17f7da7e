//! Collateral Operations (spec.md §4.10): `split`/`merge`/`redeem` against
//! the Conditional Tokens Framework, each wrapping an injected
//! [`TxExecutor`] adapter (EOA, Safe-direct, or Safe-relayer — spec.md §9
//! "signature-type polymorphism"). Grounded on the teacher's
//! `exchange-polymarket::arbitrage::{signer,polygon_tx,approvals,eip712}`:
//! the RLP/EIP-155 signing core and EIP-55 address handling are adapted
//! nearly as-is (self-contained crypto plumbing not worth reinventing),
//! generalized from approval-only calldata to the CTF's `split`/`merge`/
//! `redeem` selectors plus the NegRisk adapter's single-arg variants, and
//! extended with the `TxExecutor` trait the teacher's single-EOA flow never
//! needed.

mod abi;
pub mod approvals;
pub mod executor;
mod safe;
mod tx;
pub mod wallet;

use std::sync::Arc;
use std::time::Duration;

use hedge_gateway::{ClassifyGatewayError, RateLimitSignal, RateLimitedGateway};
use hedge_store::Store;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{info, warn};

pub use abi::{CTF, CTF_EXCHANGE, NEG_RISK_ADAPTER, NEG_RISK_CTF_EXCHANGE, POLYGON_CHAIN_ID, USDCE};
pub use executor::{ContractCall, ExecutorError, SafeDirectExecutor, SafeRelayerExecutor, EoaExecutor, TxExecutor, TxOutcome};
pub use tx::PolygonRpc;
pub use wallet::Wallet;

use abi::{build_merge_positions, build_neg_risk_merge, build_neg_risk_redeem, build_neg_risk_split, build_redeem_positions, build_split_position, parse_bytes32, CTF_OP_GAS_LIMIT};
use approvals::{to_usdc_raw_units, ApprovalCache};

const GATEWAY_CATEGORY: &str = "clob-general";
const REDEEM_RETRY_PAUSE: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum CollateralError {
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Store(#[from] hedge_store::StoreError),
    #[error("invalid condition id: {0}")]
    InvalidConditionId(String),
    #[error("NegRisk redeem requires per-outcome share counts")]
    MissingNegRiskShares,
    #[error("redemption attempt cap reached for condition {0}")]
    AttemptCapReached(String),
}

impl ClassifyGatewayError for CollateralError {
    fn rate_limit_signal(&self) -> Option<RateLimitSignal> {
        // On-chain calls never carry a venue rate-limit signal; the
        // gateway's own window/interval limiters still pace dispatch.
        None
    }
}

#[derive(Debug, Clone)]
pub struct SplitResult {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub amount_split: Option<Decimal>,
}

#[derive(Debug, Clone)]
pub struct MergeResult {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RedeemResult {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
    pub rate_limited: bool,
    pub reset_after: Option<Duration>,
    pub attempts_used: i64,
}

/// Per-outcome share counts, required on the NegRisk redeem path (spec.md
/// §4.10: "`shares` required for NegRisk path").
#[derive(Debug, Clone, Copy)]
pub struct NegRiskRedeemShares {
    pub yes_shares: Decimal,
    pub no_shares: Decimal,
}

/// The Collateral Operations component (spec.md §4.10).
pub struct CollateralOps {
    gateway: Arc<RateLimitedGateway>,
    store: Store,
    executor: Arc<dyn TxExecutor>,
    rpc: PolygonRpc,
    approvals: ApprovalCache,
}

impl CollateralOps {
    #[must_use]
    pub fn new(gateway: Arc<RateLimitedGateway>, store: Store, executor: Arc<dyn TxExecutor>, rpc: PolygonRpc) -> Self {
        Self { gateway, store, executor, rpc, approvals: ApprovalCache::new() }
    }

    /// Makes sure the CTF Exchange (and, transparently, USDCe/CTF) contracts
    /// can pull the operator's funds before any sell or collateral op
    /// (spec.md §4.10 "CTF approvals").
    pub async fn ensure_approvals(&self) -> Result<(), CollateralError> {
        let owner = self.executor.acting_address();
        for spender in [CTF_EXCHANGE, NEG_RISK_CTF_EXCHANGE, NEG_RISK_ADAPTER] {
            self.approvals.ensure_erc20_approved(&self.rpc, self.executor.as_ref(), USDCE, owner, spender).await?;
            self.approvals.ensure_erc1155_approved(&self.rpc, self.executor.as_ref(), CTF, owner, spender).await?;
        }
        Ok(())
    }

    /// `split(condition_id, amount, neg_risk)` (spec.md §4.10).
    pub async fn split(&self, condition_id: &str, amount: Decimal, neg_risk: bool) -> Result<SplitResult, CollateralError> {
        self.ensure_approvals().await?;
        let condition = parse_bytes32(condition_id).map_err(CollateralError::InvalidConditionId)?;
        let raw_amount = to_usdc_raw_units(amount);
        let executor = self.executor.clone();
        let target = if neg_risk { NEG_RISK_ADAPTER } else { CTF };
        let target_bytes = wallet::parse_address(target).expect("static contract address");
        let usdc_bytes = wallet::parse_address(USDCE).expect("static contract address");
        let data = if neg_risk {
            build_neg_risk_split(&condition, raw_amount)
        } else {
            build_split_position(&usdc_bytes, &condition, raw_amount)
        };

        // Closure is `move` and clones its owned captures per attempt so the
        // produced future is `Send + 'static`: the gateway spawns it, which
        // lets an in-flight split survive the caller discarding this result
        // future (spec.md §4.1).
        let outcome = self
            .gateway
            .execute(GATEWAY_CATEGORY, "collateral_split", move || {
                let executor = executor.clone();
                let data = data.clone();
                async move {
                    executor
                        .execute(ContractCall { to: target_bytes, data, gas_limit: CTF_OP_GAS_LIMIT })
                        .await
                        .map_err(CollateralError::Executor)
                }
            })
            .await?;

        if outcome.success {
            info!(condition_id, neg_risk, "split confirmed");
        } else {
            warn!(condition_id, neg_risk, "split transaction reverted");
        }
        Ok(SplitResult {
            success: outcome.success,
            tx_hash: outcome.tx_hash,
            error: (!outcome.success).then(|| "split transaction reverted".to_string()),
            amount_split: outcome.success.then_some(amount),
        })
    }

    /// `merge(condition_id, amount, neg_risk)` (spec.md §4.10): symmetric
    /// recovery of collateral from equal-quantity UP+DOWN tokens.
    pub async fn merge(&self, condition_id: &str, amount: Decimal, neg_risk: bool) -> Result<MergeResult, CollateralError> {
        let condition = parse_bytes32(condition_id).map_err(CollateralError::InvalidConditionId)?;
        let raw_amount = to_usdc_raw_units(amount);
        let executor = self.executor.clone();
        let target = if neg_risk { NEG_RISK_ADAPTER } else { CTF };
        let target_bytes = wallet::parse_address(target).expect("static contract address");
        let usdc_bytes = wallet::parse_address(USDCE).expect("static contract address");
        let data = if neg_risk {
            build_neg_risk_merge(&condition, raw_amount)
        } else {
            build_merge_positions(&usdc_bytes, &condition, raw_amount)
        };

        let outcome = self
            .gateway
            .execute(GATEWAY_CATEGORY, "collateral_merge", move || {
                let executor = executor.clone();
                let data = data.clone();
                async move {
                    executor
                        .execute(ContractCall { to: target_bytes, data, gas_limit: CTF_OP_GAS_LIMIT })
                        .await
                        .map_err(CollateralError::Executor)
                }
            })
            .await?;

        if outcome.success {
            info!(condition_id, neg_risk, "merge confirmed");
        } else {
            warn!(condition_id, neg_risk, "merge transaction reverted");
        }
        Ok(MergeResult {
            success: outcome.success,
            tx_hash: outcome.tx_hash,
            error: (!outcome.success).then(|| "merge transaction reverted".to_string()),
        })
    }

    /// `redeem(condition_id, outcome_index, neg_risk, shares?)` (spec.md
    /// §4.10): retries up to the Store's hard cap with a 30s pause between
    /// attempts, except that a gateway rate-limit signal returns
    /// immediately with the reset interval so the scheduler can defer.
    pub async fn redeem(
        &self,
        condition_id: &str,
        outcome_index: u8,
        neg_risk: bool,
        shares: Option<NegRiskRedeemShares>,
    ) -> Result<RedeemResult, CollateralError> {
        if neg_risk && shares.is_none() {
            return Err(CollateralError::MissingNegRiskShares);
        }
        let already_used = self.store.redemption_attempts(condition_id).await?;
        if already_used >= Store::MAX_REDEMPTION_ATTEMPTS {
            return Err(CollateralError::AttemptCapReached(condition_id.to_string()));
        }

        let condition = parse_bytes32(condition_id).map_err(CollateralError::InvalidConditionId)?;
        let target = if neg_risk { NEG_RISK_ADAPTER } else { CTF };
        let target_bytes = wallet::parse_address(target).expect("static contract address");
        let usdc_bytes = wallet::parse_address(USDCE).expect("static contract address");
        let data = if neg_risk {
            let s = shares.expect("checked above");
            build_neg_risk_redeem(&condition, to_usdc_raw_units(s.yes_shares), to_usdc_raw_units(s.no_shares))
        } else {
            let _ = outcome_index; // standard CTF redeem settles both index sets at once
            build_redeem_positions(&usdc_bytes, &condition)
        };

        let mut attempts = already_used;
        loop {
            if self.gateway.approaching_limit(GATEWAY_CATEGORY) {
                warn!(condition_id, "deferring redeem: clob-general gateway near its window limit");
                return Ok(RedeemResult {
                    success: false,
                    tx_hash: None,
                    error: Some("rate limit approaching".to_string()),
                    rate_limited: true,
                    reset_after: Some(Duration::from_secs(10)),
                    attempts_used: attempts,
                });
            }

            let executor = self.executor.clone();
            let call_data = data.clone();
            let result: Result<TxOutcome, CollateralError> = self
                .gateway
                .execute(GATEWAY_CATEGORY, "collateral_redeem", move || {
                    let executor = executor.clone();
                    let call_data = call_data.clone();
                    async move {
                        executor
                            .execute(ContractCall { to: target_bytes, data: call_data, gas_limit: CTF_OP_GAS_LIMIT })
                            .await
                            .map_err(CollateralError::Executor)
                    }
                })
                .await;

            let (success, tx_hash, error) = match result {
                Ok(outcome) => (outcome.success, outcome.tx_hash, None),
                Err(e) => (false, None, Some(e.to_string())),
            };
            attempts = self.store.record_redemption_attempt(condition_id, tx_hash.as_deref(), success).await?;

            if success {
                info!(condition_id, attempts, "redeem confirmed");
                return Ok(RedeemResult { success: true, tx_hash, error: None, rate_limited: false, reset_after: None, attempts_used: attempts });
            }
            if attempts >= Store::MAX_REDEMPTION_ATTEMPTS {
                warn!(condition_id, attempts, "redeem attempts exhausted");
                return Ok(RedeemResult { success: false, tx_hash, error, rate_limited: false, reset_after: None, attempts_used: attempts });
            }
            warn!(condition_id, attempts, "redeem attempt failed, pausing before retry");
            tokio::time::sleep(REDEEM_RETRY_PAUSE).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedExecutor {
        results: Vec<TxOutcome>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl TxExecutor for ScriptedExecutor {
        async fn execute(&self, _call: ContractCall) -> Result<TxOutcome, ExecutorError> {
            let i = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.results[i.min(self.results.len() - 1)].clone())
        }

        fn acting_address(&self) -> [u8; 20] {
            [0x01; 20]
        }
    }

    async fn ops_with(executor: ScriptedExecutor) -> CollateralOps {
        let store = Store::open_in_memory().await.unwrap();
        let gateway = Arc::new(RateLimitedGateway::disabled());
        let rpc = PolygonRpc::new("http://127.0.0.1:0");
        CollateralOps::new(gateway, store, Arc::new(executor), rpc)
    }

    #[tokio::test]
    async fn merge_reports_reverted_transaction_without_retrying() {
        let executor = ScriptedExecutor { results: vec![TxOutcome { tx_hash: Some("0xabc".into()), success: false }], calls: AtomicUsize::new(0) };
        let ops = ops_with(executor).await;
        let result = ops.merge(&"11".repeat(32), Decimal::new(100, 0), false).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.tx_hash.as_deref(), Some("0xabc"));
    }

    #[tokio::test]
    async fn redeem_negrisk_without_shares_is_rejected() {
        let executor = ScriptedExecutor { results: vec![TxOutcome { tx_hash: None, success: true }], calls: AtomicUsize::new(0) };
        let ops = ops_with(executor).await;
        let err = ops.redeem(&"22".repeat(32), 0, true, None).await.unwrap_err();
        assert!(matches!(err, CollateralError::MissingNegRiskShares));
    }

    #[tokio::test(start_paused = true)]
    async fn redeem_retries_once_then_succeeds_and_records_two_attempts() {
        let condition = "33".repeat(32);
        let executor = ScriptedExecutor {
            results: vec![
                TxOutcome { tx_hash: Some("0x1".into()), success: false },
                TxOutcome { tx_hash: Some("0x2".into()), success: true },
            ],
            calls: AtomicUsize::new(0),
        };
        let ops = ops_with(executor).await;
        let handle = tokio::spawn(async move { ops.redeem(&condition, 0, false, None).await });
        tokio::time::advance(Duration::from_secs(31)).await;
        let result = handle.await.unwrap().unwrap();
        assert!(result.success);
        assert_eq!(result.attempts_used, 2);
    }

    #[tokio::test]
    async fn redeem_refuses_once_the_attempt_cap_is_already_reached() {
        let condition = "44".repeat(32);
        let executor = ScriptedExecutor { results: vec![TxOutcome { tx_hash: None, success: false }], calls: AtomicUsize::new(0) };
        let ops = ops_with(executor).await;
        ops.store.record_redemption_attempt(&condition, None, false).await.unwrap();
        ops.store.record_redemption_attempt(&condition, None, false).await.unwrap();
        let err = ops.redeem(&condition, 0, false, None).await.unwrap_err();
        assert!(matches!(err, CollateralError::AttemptCapReached(_)));
    }
}
