//! # Coin Rotation Trader
//!
//! Spot trading agent that rotates a single holding between coins through a
//! bridge currency whenever the fee-adjusted price ratio moves in its favour.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `exchange`: Binance spot REST client, in-memory mock exchange, market snapshots
//! - `strategy`: Ratio scouting, order execution, retries, and the auto trader
//! - `persistence`: SQLite ledger of coins, pairs, holdings, and trades
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod exchange;
pub mod persistence;
pub mod strategy;
pub mod utils;

pub use config::Config;
