//! Configuration management for the coin rotation trader.
//!
//! Loads settings from environment variables and config files.

use crate::exchange::OrderSide;
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on any order timeout or grace period, one year in minutes.
const MAX_TIMEOUT_MINUTES: u64 = 525_600;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Binance API credentials
    #[serde(default)]
    pub binance: BinanceConfig,
    /// Scouting and coin universe settings
    #[serde(default)]
    pub trading: TradingConfig,
    /// Order execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Ledger storage
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Paper trading account
    #[serde(default)]
    pub paper: PaperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinanceConfig {
    /// API key for authentication
    #[serde(default)]
    pub api_key: String,
    /// Secret key for signing requests
    #[serde(default)]
    pub secret_key: String,
    /// Use testnet instead of production
    #[serde(default)]
    pub testnet: bool,
    /// Route orders to the in-memory exchange instead of Binance
    #[serde(default = "default_paper_trading")]
    pub paper_trading: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    /// Bridge asset all ratios are denominated in
    #[serde(default = "default_bridge")]
    pub bridge: String,
    /// Coins the bot may rotate between
    #[serde(default)]
    pub coins: Vec<String>,
    /// Coin to assume as held when the ledger has no holding yet
    #[serde(default)]
    pub current_coin: Option<String>,
    /// Exchange fee per trade (0.001 = 0.1%)
    #[serde(default = "default_scout_transaction_fee")]
    pub scout_transaction_fee: Decimal,
    /// How many fees a jump must beat
    #[serde(default = "default_scout_multiplier")]
    pub scout_multiplier: Decimal,
    /// Minimum improvement in percent before a pair qualifies
    #[serde(default)]
    pub min_scout_rate: Decimal,
    /// Hours of scout history to keep
    #[serde(default = "default_scout_history_hours")]
    pub scout_history_hours: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Minutes before an unfilled buy order is canceled (0 = never)
    #[serde(default)]
    pub buy_timeout_minutes: u64,
    /// Minutes before an unfilled sell order is canceled (0 = never)
    #[serde(default)]
    pub sell_timeout_minutes: u64,
    /// Delay between order status polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Placement attempts before giving up
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    /// Pause before the first placement attempt
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Cancel attempts before escalating
    #[serde(default = "default_cancel_max_attempts")]
    pub cancel_max_attempts: u32,
    /// Seconds to wait for the sold balance to drop after a fill
    #[serde(default = "default_balance_settle_timeout")]
    pub balance_settle_timeout_secs: u64,
    /// Extra minutes a partially filled order may rest past its timeout
    #[serde(default = "default_partial_fill_grace")]
    pub partial_fill_grace_minutes: u64,
    /// Minimum order value in bridge currency
    #[serde(default = "default_min_notional")]
    pub min_notional: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperConfig {
    /// Starting bridge balance for paper trading
    #[serde(default = "default_initial_balance")]
    pub initial_balance: Decimal,
}

// Default value functions
fn default_paper_trading() -> bool {
    true
}

fn default_bridge() -> String {
    "USDT".to_string()
}

fn default_scout_transaction_fee() -> Decimal {
    Decimal::new(1, 3) // 0.001
}

fn default_scout_multiplier() -> Decimal {
    Decimal::new(5, 0)
}

fn default_scout_history_hours() -> u32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_retry_max_attempts() -> u32 {
    20
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

fn default_cancel_max_attempts() -> u32 {
    100
}

fn default_balance_settle_timeout() -> u64 {
    120
}

fn default_partial_fill_grace() -> u64 {
    5
}

fn default_min_notional() -> Decimal {
    Decimal::new(10, 0) // 10 USDT
}

fn default_db_path() -> String {
    "data/crypto_trading.db".to_string()
}

fn default_initial_balance() -> Decimal {
    Decimal::new(1000, 0)
}

impl ExecutionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn balance_settle_timeout(&self) -> Duration {
        Duration::from_secs(self.balance_settle_timeout_secs)
    }

    /// Order timeout in minutes for a side, `None` when orders never time out.
    pub fn timeout_minutes(&self, side: OrderSide) -> Option<u64> {
        let minutes = match side {
            OrderSide::Buy => self.buy_timeout_minutes,
            OrderSide::Sell => self.sell_timeout_minutes,
        };
        (minutes > 0).then_some(minutes)
    }
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .prefix("CRT")
                    .list_separator(",")
                    .with_list_parse_key("trading.coins")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.trading.bridge.is_empty(),
            "bridge asset must be set"
        );

        anyhow::ensure!(
            self.trading.scout_transaction_fee >= Decimal::ZERO
                && self.trading.scout_transaction_fee < Decimal::ONE,
            "scout_transaction_fee must be between 0 and 1"
        );

        anyhow::ensure!(
            self.trading.scout_multiplier >= Decimal::ZERO,
            "scout_multiplier must not be negative"
        );

        anyhow::ensure!(
            !self
                .trading
                .coins
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&self.trading.bridge)),
            "bridge asset cannot be in the coin list"
        );

        anyhow::ensure!(
            self.execution.retry_max_attempts >= 1,
            "retry_max_attempts must be at least 1"
        );

        anyhow::ensure!(
            self.execution.cancel_max_attempts >= 1,
            "cancel_max_attempts must be at least 1"
        );

        anyhow::ensure!(
            self.execution.poll_interval_ms > 0,
            "poll_interval_ms must be positive"
        );

        for (name, value) in [
            ("buy_timeout_minutes", self.execution.buy_timeout_minutes),
            ("sell_timeout_minutes", self.execution.sell_timeout_minutes),
            ("partial_fill_grace_minutes", self.execution.partial_fill_grace_minutes),
        ] {
            anyhow::ensure!(
                value <= MAX_TIMEOUT_MINUTES,
                "{name} must be at most {MAX_TIMEOUT_MINUTES}"
            );
        }

        Ok(())
    }
}

impl Default for BinanceConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            secret_key: String::new(),
            testnet: false,
            paper_trading: default_paper_trading(),
        }
    }
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            bridge: default_bridge(),
            coins: Vec::new(),
            current_coin: None,
            scout_transaction_fee: default_scout_transaction_fee(),
            scout_multiplier: default_scout_multiplier(),
            min_scout_rate: Decimal::ZERO,
            scout_history_hours: default_scout_history_hours(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            buy_timeout_minutes: 0,
            sell_timeout_minutes: 0,
            poll_interval_ms: default_poll_interval_ms(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            cancel_max_attempts: default_cancel_max_attempts(),
            balance_settle_timeout_secs: default_balance_settle_timeout(),
            partial_fill_grace_minutes: default_partial_fill_grace(),
            min_notional: default_min_notional(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: default_initial_balance(),
        }
    }
}
