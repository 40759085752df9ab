//! Ledger row types: coins, pairs, trade records and scout history.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use std::hash::{Hash, Hasher};

/// A tradable coin (or the bridge currency).
///
/// Two assets are equal when their symbols match, regardless of `enabled`.
#[derive(Debug, Clone)]
pub struct Asset {
    pub symbol: String,
    /// Whether the scout may rotate into this asset
    pub enabled: bool,
}

impl Asset {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            enabled: true,
        }
    }

    /// The bridge currency, which is never a scouting target.
    pub fn bridge(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            enabled: false,
        }
    }
}

impl PartialEq for Asset {
    fn eq(&self, other: &Self) -> bool {
        self.symbol == other.symbol
    }
}

impl Eq for Asset {}

impl Hash for Asset {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.symbol.hash(state);
    }
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.symbol)
    }
}

/// Ordered coin pair with the last committed exchange ratio.
#[derive(Debug, Clone, PartialEq)]
pub struct Pair {
    pub id: i64,
    pub from: Asset,
    pub to: Asset,
    /// `None` until initialized from market prices
    pub ratio: Option<Decimal>,
    pub ratio_updated_at: Option<DateTime<Utc>>,
}

/// Direction of a trade relative to its origin coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeDirection {
    /// Liquidation: sell the origin coin for the target (bridge)
    SellOriginForTarget,
    /// Acquisition: buy the origin coin with the target (bridge)
    BuyOriginWithTarget,
}

impl TradeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeDirection::SellOriginForTarget => "SELL_ORIGIN_FOR_TARGET",
            TradeDirection::BuyOriginWithTarget => "BUY_ORIGIN_WITH_TARGET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SELL_ORIGIN_FOR_TARGET" => Some(TradeDirection::SellOriginForTarget),
            "BUY_ORIGIN_WITH_TARGET" => Some(TradeDirection::BuyOriginWithTarget),
            _ => None,
        }
    }
}

/// Lifecycle state of a trade record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeState {
    /// Intent recorded, no order on the exchange yet
    Starting,
    Ordered,
    Complete,
    Canceled,
    Timeout,
}

impl TradeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeState::Starting => "STARTING",
            TradeState::Ordered => "ORDERED",
            TradeState::Complete => "COMPLETE",
            TradeState::Canceled => "CANCELED",
            TradeState::Timeout => "TIMEOUT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STARTING" => Some(TradeState::Starting),
            "ORDERED" => Some(TradeState::Ordered),
            "COMPLETE" => Some(TradeState::Complete),
            "CANCELED" => Some(TradeState::Canceled),
            "TIMEOUT" => Some(TradeState::Timeout),
            _ => None,
        }
    }

    /// Starting -> Ordered -> {Complete, Canceled, Timeout}; nothing else.
    pub fn can_transition_to(&self, next: TradeState) -> bool {
        matches!(
            (self, next),
            (TradeState::Starting, TradeState::Ordered)
                | (TradeState::Ordered, TradeState::Complete)
                | (TradeState::Ordered, TradeState::Canceled)
                | (TradeState::Ordered, TradeState::Timeout)
        )
    }
}

impl fmt::Display for TradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One attempt to move between a coin and the bridge.
#[derive(Debug, Clone, PartialEq)]
pub struct TradeRecord {
    pub id: i64,
    pub origin: String,
    pub target: String,
    pub direction: TradeDirection,
    pub state: TradeState,
    /// Balances observed right before the order was placed
    pub origin_balance: Option<Decimal>,
    pub target_balance: Option<Decimal>,
    pub quantity: Option<Decimal>,
    pub cumulative_quote_qty: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub ordered_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A scouting observation for one pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoutRecord {
    pub from_coin: String,
    pub to_coin: String,
    pub target_ratio: Decimal,
    pub current_coin_price: Decimal,
    pub other_coin_price: Decimal,
    pub datetime: DateTime<Utc>,
}
