//! Shared error kinds (spec.md §7) propagated across component boundaries.
//!
//! Each component defines its own leaf error type (e.g. `WsError`,
//! `StoreError`) and converts into [`HedgeError`] at the point where the
//! error crosses into strategy-loop or gateway code that needs to apply the
//! §7 propagation policy (retry, surface-and-continue, treat-as-success,
//! reconnect-and-swallow).

use thiserror::Error;

/// The error kinds named in spec.md §7, used as the common currency between
/// components. Not every component constructs every variant — a leaf crate
/// maps its own error enum into the subset relevant to it.
#[derive(Debug, Error)]
pub enum HedgeError {
    #[error("rate limited, retry after {reset_seconds}s")]
    RateLimited { reset_seconds: u64 },

    #[error("no liquidity available at requested price")]
    NoLiquidity,

    #[error("insufficient settlement-token balance")]
    InsufficientBalance,

    #[error("insufficient gas to submit transaction")]
    InsufficientGas,

    #[error("condition already redeemed")]
    AlreadyRedeemed,

    #[error("transaction reverted: {reason}")]
    TransactionReverted { reason: String },

    #[error("relayer request timed out")]
    RelayerTimeout,

    #[error("nonce error: {0}")]
    NonceError(String),

    #[error("token/contract approval required before trading")]
    ApprovalRequired,

    #[error("websocket data stale")]
    WsStale,

    #[error("websocket disconnected")]
    WsDisconnected,

    #[error("order killed with {filled_shares} shares filled")]
    OrderKilled { filled_shares: rust_decimal::Decimal },

    #[error("order confirmation timed out")]
    OrderTimeout,

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("operation already in progress")]
    AlreadyInProgress,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HedgeError {
    /// §7 propagation policy: is this an error the caller should log and
    /// continue on, trusting the next event-loop iteration to retry?
    #[must_use]
    pub const fn is_retry_naturally(&self) -> bool {
        matches!(
            self,
            Self::NoLiquidity | Self::OrderKilled { .. } | Self::OrderTimeout | Self::ApprovalRequired
        )
    }

    /// §7: `AlreadyRedeemed` is idempotent success, not failure.
    #[must_use]
    pub const fn is_idempotent_success(&self) -> bool {
        matches!(self, Self::AlreadyRedeemed)
    }

    /// §7: WS errors never propagate above the WS component; they trigger
    /// reconnect instead.
    #[must_use]
    pub const fn triggers_reconnect(&self) -> bool {
        matches!(self, Self::WsStale | Self::WsDisconnected)
    }
}
