//! Exchange integrations for coin rotation.
//!
//! ## Binance
//! Spot REST connectivity for:
//! - Market data (ticker prices, LOT_SIZE filters)
//! - Account operations (balances, limit orders, cancellation)
//!
//! ## Mock
//! In-memory spot venue for paper trading and deterministic tests.

mod client;
mod error;
pub mod mock;
mod traits;
mod types;

pub use client::BinanceClient;
pub use error::GatewayError;
pub use mock::MockExchange;
pub use traits::{ExchangeGateway, MarketSnapshot, MarketView};
#[cfg(test)]
pub use traits::MockExchangeGateway;
pub use types::*;
