//! Venue-agnostic market data and order placement interfaces.
//!
//! Provides a common interface for:
//! - Point-in-time price/balance lookups used by the scout
//! - Order placement, polling and cancellation used by the executor

use crate::exchange::error::GatewayError;
use crate::exchange::types::{OrderSide, OrderState};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;

/// Read-only view of prices and balances at one point in time.
pub trait MarketView {
    /// Last price of `base` quoted in `quote` (e.g. `price("ETH", "USDT")`).
    fn price(&self, base: &str, quote: &str) -> Option<Decimal>;

    /// Free balance of an asset.
    fn balance(&self, asset: &str) -> Option<Decimal>;
}

/// Immutable snapshot of ticker prices and free balances.
///
/// Prices are keyed by exchange symbol (`"ETHUSDT"`), balances by asset (`"ETH"`).
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    prices: HashMap<String, Decimal>,
    balances: HashMap<String, Decimal>,
}

impl MarketSnapshot {
    /// Create a snapshot from price and balance maps.
    pub fn new(prices: HashMap<String, Decimal>, balances: HashMap<String, Decimal>) -> Self {
        Self { prices, balances }
    }

    /// Build a prices-only snapshot from `(symbol, price)` pairs.
    pub fn from_prices<I, S>(prices: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        Self::new(
            prices.into_iter().map(|(s, p)| (s.into(), p)).collect(),
            HashMap::new(),
        )
    }

    /// Add balances to the snapshot.
    pub fn with_balances<I, S>(mut self, balances: I) -> Self
    where
        I: IntoIterator<Item = (S, Decimal)>,
        S: Into<String>,
    {
        self.balances
            .extend(balances.into_iter().map(|(a, b)| (a.into(), b)));
        self
    }

    /// Price by raw exchange symbol.
    pub fn symbol_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices.get(symbol).copied()
    }
}

impl MarketView for MarketSnapshot {
    fn price(&self, base: &str, quote: &str) -> Option<Decimal> {
        self.prices.get(&format!("{base}{quote}")).copied()
    }

    fn balance(&self, asset: &str) -> Option<Decimal> {
        self.balances.get(asset).copied()
    }
}

/// Order placement and account access for a spot venue.
///
/// Implemented by the live Binance client and by the in-memory mock
/// used for paper trading and tests.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    /// Capture all ticker prices and free balances.
    async fn snapshot(&self) -> Result<MarketSnapshot, GatewayError>;

    /// Fresh free balance of one asset (not served from a snapshot).
    async fn balance(&self, asset: &str) -> Result<Option<Decimal>, GatewayError>;

    /// LOT_SIZE step string for a symbol (e.g. `"0.00100000"`).
    async fn lot_step(&self, symbol: &str) -> Result<String, GatewayError>;

    /// Place a GTC limit order and return its exchange order id.
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<i64, GatewayError>;

    /// Query the current state of an order.
    async fn order_status(&self, symbol: &str, order_id: i64) -> Result<OrderState, GatewayError>;

    /// Cancel an open order.
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), GatewayError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_snapshot_lookups() {
        let snapshot = MarketSnapshot::from_prices([("BTCUSDT", dec!(50000)), ("ETHUSDT", dec!(2500))])
            .with_balances([("USDT", dec!(1000))]);

        assert_eq!(snapshot.price("BTC", "USDT"), Some(dec!(50000)));
        assert_eq!(snapshot.price("ETH", "BTC"), None);
        assert_eq!(snapshot.balance("USDT"), Some(dec!(1000)));
        assert_eq!(snapshot.balance("ETH"), None);
        assert_eq!(snapshot.symbol_price("ETHUSDT"), Some(dec!(2500)));
    }
}
