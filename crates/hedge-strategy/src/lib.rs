//! Per-market strategy loop (spec.md §4.8, §4.9, §4.11): one actor per
//! tracked market serializing every price tick, fill, and lifecycle event
//! through a single mailbox, plus the router that demuxes the
//! process-wide Price-Monitor and User-Channel streams onto those
//! mailboxes and the EIP-712 signer that produces every order's
//! `signature`/`salt`. Grounded on the teacher's
//! `bot-orchestrator::{BotActor, BotHandle}` pair, generalized from one
//! actor per trading bot to one actor per tracked market.

pub mod market_loop;
pub mod router;
pub mod signer;

pub use market_loop::{Command, MarketLoop, MarketLoopHandle, MarketLoopStatus, StrategyState};
pub use router::Router;
pub use signer::{BuildOrderParams, OrderSigner, SignedOrder, SignerError};
