//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Ratio scouting across coin pairs
//! - Limit order execution with timeouts and cancellation
//! - Bounded retry of exchange calls
//! - The auto trader that jumps between coins through the bridge

mod error;
mod executor;
mod retry;
mod scout;
mod trader;

pub use error::TradeError;
pub use executor::{order_quantity, FilledOrder, OrderExecutor};
pub use retry::{retry, RetryError, RetryPolicy, Retryable};
pub use scout::{RatioScout, ScoutEntry, ScoutReport};
pub use trader::{AutoTrader, JumpOutcome};
