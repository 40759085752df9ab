//! Mock spot exchange for paper trading and tests.
//!
//! Simulates limit order placement, fills and cancellation in memory.
//! Fills settle balances at the limit price. Failure modes (placement
//! errors, status query errors, cancel failures, stale balance reads,
//! old orders) can be scripted for exercising the executor.

use crate::exchange::error::GatewayError;
use crate::exchange::traits::{ExchangeGateway, MarketSnapshot};
use crate::exchange::types::{OrderSide, OrderState, OrderStatus};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// A listed spot symbol.
#[derive(Debug, Clone)]
struct MockSymbol {
    base: String,
    quote: String,
    lot_step: String,
}

/// A simulated order resting on the mock book.
#[derive(Debug, Clone)]
struct MockOrder {
    symbol: String,
    side: OrderSide,
    quantity: Decimal,
    price: Decimal,
    created_at: DateTime<Utc>,
    status: OrderStatus,
    /// Quantity whose balances have already been moved
    settled_qty: Decimal,
}

/// Record of a placement request that reached the mock book.
#[derive(Debug, Clone, PartialEq)]
pub struct PlacedOrder {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Default)]
struct MockState {
    symbols: HashMap<String, MockSymbol>,
    prices: HashMap<String, Decimal>,
    balances: HashMap<String, Decimal>,
    orders: HashMap<i64, MockOrder>,
    placed: Vec<PlacedOrder>,
    placement_failures: VecDeque<GatewayError>,
    status_script: VecDeque<OrderStatus>,
    status_failures: u32,
    cancel_failures: u32,
    cancel_requests: u32,
    stale_reads: u32,
    stale_balances: HashMap<String, Decimal>,
    order_age: Option<Duration>,
}

/// In-memory spot exchange implementing [`ExchangeGateway`].
pub struct MockExchange {
    state: RwLock<MockState>,
    order_id_counter: AtomicU64,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    /// Create an empty mock exchange.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MockState::default()),
            order_id_counter: AtomicU64::new(1),
        }
    }

    fn next_order_id(&self) -> i64 {
        self.order_id_counter.fetch_add(1, Ordering::SeqCst) as i64
    }

    /// List a `base`/`quote` symbol with the given LOT_SIZE step.
    pub async fn add_symbol(&self, base: &str, quote: &str, lot_step: &str) {
        let mut state = self.state.write().await;
        state.symbols.insert(
            format!("{base}{quote}"),
            MockSymbol {
                base: base.to_string(),
                quote: quote.to_string(),
                lot_step: lot_step.to_string(),
            },
        );
    }

    /// Set the last price of a symbol.
    pub async fn set_price(&self, symbol: &str, price: Decimal) {
        self.state
            .write()
            .await
            .prices
            .insert(symbol.to_string(), price);
    }

    /// Set the free balance of an asset.
    pub async fn set_balance(&self, asset: &str, amount: Decimal) {
        self.state
            .write()
            .await
            .balances
            .insert(asset.to_string(), amount);
    }

    /// Fail the next placements with the given errors, in order.
    pub async fn fail_next_placements<I>(&self, errors: I)
    where
        I: IntoIterator<Item = GatewayError>,
    {
        self.state.write().await.placement_failures.extend(errors);
    }

    /// Statuses returned by successive status queries. Once drained, orders fill.
    pub async fn script_statuses<I>(&self, statuses: I)
    where
        I: IntoIterator<Item = OrderStatus>,
    {
        self.state.write().await.status_script.extend(statuses);
    }

    /// Fail the next `count` status queries with a transient error.
    pub async fn fail_next_status_queries(&self, count: u32) {
        self.state.write().await.status_failures = count;
    }

    /// Fail the next `count` cancel requests with a transient error.
    pub async fn fail_next_cancels(&self, count: u32) {
        self.state.write().await.cancel_failures = count;
    }

    /// Serve pre-fill balances for the next `count` balance reads after a fill.
    pub async fn serve_stale_balances(&self, count: u32) {
        self.state.write().await.stale_reads = count;
    }

    /// Back-date newly placed orders by `age`.
    pub async fn set_order_age(&self, age: Duration) {
        self.state.write().await.order_age = Some(age);
    }

    /// All orders accepted so far.
    pub async fn placed_orders(&self) -> Vec<PlacedOrder> {
        self.state.read().await.placed.clone()
    }

    /// Number of cancel requests received, including failed ones.
    pub async fn cancel_requests(&self) -> u32 {
        self.state.read().await.cancel_requests
    }

    /// Current free balance, ignoring stale-read scripting.
    pub async fn free_balance(&self, asset: &str) -> Decimal {
        self.state
            .read()
            .await
            .balances
            .get(asset)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

impl MockState {
    /// Move balances for the part of `order_id` executed since the last settlement.
    fn settle(&mut self, order_id: i64, executed_qty: Decimal) {
        let Some(order) = self.orders.get_mut(&order_id) else {
            return;
        };
        let delta_qty = executed_qty - order.settled_qty;
        if delta_qty <= Decimal::ZERO {
            return;
        }
        order.settled_qty = executed_qty;

        let Some(symbol) = self.symbols.get(&order.symbol) else {
            return;
        };
        let (base, quote) = (symbol.base.clone(), symbol.quote.clone());
        let notional = delta_qty * order.price;
        let side = order.side;

        // Remember what a lagging account endpoint would still report
        if self.stale_reads > 0 {
            for asset in [&base, &quote] {
                let current = self.balances.get(asset).copied().unwrap_or(Decimal::ZERO);
                self.stale_balances.entry(asset.clone()).or_insert(current);
            }
        }

        let (base_delta, quote_delta) = match side {
            OrderSide::Buy => (delta_qty, -notional),
            OrderSide::Sell => (-delta_qty, notional),
        };
        *self.balances.entry(base).or_insert(Decimal::ZERO) += base_delta;
        *self.balances.entry(quote).or_insert(Decimal::ZERO) += quote_delta;

        debug!(order_id, qty = %delta_qty, %notional, side = ?side, "Mock fill settled");
    }
}

#[async_trait]
impl ExchangeGateway for MockExchange {
    async fn snapshot(&self) -> Result<MarketSnapshot, GatewayError> {
        let state = self.state.read().await;
        Ok(MarketSnapshot::new(
            state.prices.clone(),
            state.balances.clone(),
        ))
    }

    async fn balance(&self, asset: &str) -> Result<Option<Decimal>, GatewayError> {
        let mut state = self.state.write().await;
        if state.stale_reads > 0 {
            if let Some(stale) = state.stale_balances.get(asset).copied() {
                state.stale_reads -= 1;
                debug!(%asset, balance = %stale, "Mock serving stale balance");
                return Ok(Some(stale));
            }
        }
        Ok(state.balances.get(asset).copied())
    }

    async fn lot_step(&self, symbol: &str) -> Result<String, GatewayError> {
        self.state
            .read()
            .await
            .symbols
            .get(symbol)
            .map(|s| s.lot_step.clone())
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))
    }

    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<i64, GatewayError> {
        let mut state = self.state.write().await;

        if let Some(err) = state.placement_failures.pop_front() {
            debug!(%symbol, error = %err, "Mock placement failure");
            return Err(err);
        }

        let listing = state
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))?;

        if quantity <= Decimal::ZERO || price <= Decimal::ZERO {
            return Err(GatewayError::Rejected {
                code: -1013,
                message: "Filter failure: LOT_SIZE".to_string(),
            });
        }

        let (asset, required) = match side {
            OrderSide::Buy => (&listing.quote, quantity * price),
            OrderSide::Sell => (&listing.base, quantity),
        };
        let available = state.balances.get(asset).copied().unwrap_or(Decimal::ZERO);
        if required > available {
            return Err(GatewayError::Rejected {
                code: -2010,
                message: "Account has insufficient balance for requested action.".to_string(),
            });
        }

        let order_id = self.next_order_id();
        let created_at = Utc::now() - state.order_age.unwrap_or_else(Duration::zero);
        state.orders.insert(
            order_id,
            MockOrder {
                symbol: symbol.to_string(),
                side,
                quantity,
                price,
                created_at,
                status: OrderStatus::New,
                settled_qty: Decimal::ZERO,
            },
        );
        state.placed.push(PlacedOrder {
            order_id,
            symbol: symbol.to_string(),
            side,
            quantity,
            price,
        });

        info!(
            order_id,
            %symbol,
            side = ?side,
            quantity = %quantity,
            price = %price,
            "Mock limit order placed"
        );

        Ok(order_id)
    }

    async fn order_status(&self, symbol: &str, order_id: i64) -> Result<OrderState, GatewayError> {
        let mut state = self.state.write().await;

        if state.status_failures > 0 {
            state.status_failures -= 1;
            return Err(GatewayError::Transient("connection reset by peer".to_string()));
        }

        let current = state
            .orders
            .get(&order_id)
            .filter(|o| o.symbol == symbol)
            .map(|o| o.status)
            .ok_or_else(|| GatewayError::Rejected {
                code: -2013,
                message: "Order does not exist.".to_string(),
            })?;

        // Canceled and filled orders stay that way
        let status = match current {
            OrderStatus::New | OrderStatus::PartiallyFilled => state
                .status_script
                .pop_front()
                .unwrap_or(OrderStatus::Filled),
            other => other,
        };

        let (quantity, settled) = {
            let order = &state.orders[&order_id];
            (order.quantity, order.settled_qty)
        };
        let executed_qty = match status {
            OrderStatus::Filled => quantity,
            OrderStatus::PartiallyFilled => settled.max(quantity / dec!(2)),
            _ => settled,
        };
        state.settle(order_id, executed_qty);

        let order = state
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| GatewayError::Transient("order vanished".to_string()))?;
        order.status = status;

        Ok(OrderState {
            order_id,
            symbol: order.symbol.clone(),
            status,
            side: order.side,
            created_at: order.created_at,
            executed_qty,
            cumulative_quote_qty: executed_qty * order.price,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), GatewayError> {
        let mut state = self.state.write().await;
        state.cancel_requests += 1;

        if state.cancel_failures > 0 {
            state.cancel_failures -= 1;
            return Err(GatewayError::Transient("cancel timed out".to_string()));
        }

        let order = state
            .orders
            .get_mut(&order_id)
            .filter(|o| o.symbol == symbol)
            .ok_or_else(|| GatewayError::Rejected {
                code: -2011,
                message: "Unknown order sent.".to_string(),
            })?;

        if order.status == OrderStatus::Filled {
            return Err(GatewayError::Rejected {
                code: -2011,
                message: "Order already filled.".to_string(),
            });
        }

        order.status = OrderStatus::Canceled;
        info!(order_id, %symbol, "Mock order canceled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn setup_exchange() -> MockExchange {
        let exchange = MockExchange::new();
        exchange.add_symbol("ETH", "USDT", "0.00010000").await;
        exchange.set_price("ETHUSDT", dec!(2500)).await;
        exchange.set_balance("USDT", dec!(1000)).await;
        exchange
    }

    #[tokio::test]
    async fn test_fill_settles_balances() {
        let exchange = setup_exchange().await;

        let id = exchange
            .place_limit_order("ETHUSDT", OrderSide::Buy, dec!(0.4), dec!(2500))
            .await
            .unwrap();
        let state = exchange.order_status("ETHUSDT", id).await.unwrap();

        assert_eq!(state.status, OrderStatus::Filled);
        assert_eq!(state.cumulative_quote_qty, dec!(1000));
        assert_eq!(exchange.free_balance("ETH").await, dec!(0.4));
        assert_eq!(exchange.free_balance("USDT").await, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_insufficient_balance_is_rejected() {
        let exchange = setup_exchange().await;

        let err = exchange
            .place_limit_order("ETHUSDT", OrderSide::Buy, dec!(1), dec!(2500))
            .await
            .unwrap_err();

        assert!(matches!(err, GatewayError::Rejected { code: -2010, .. }));
        assert!(exchange.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_scripted_statuses_then_fill() {
        let exchange = setup_exchange().await;
        exchange
            .script_statuses([OrderStatus::New, OrderStatus::PartiallyFilled])
            .await;

        let id = exchange
            .place_limit_order("ETHUSDT", OrderSide::Buy, dec!(0.2), dec!(2500))
            .await
            .unwrap();

        assert_eq!(exchange.order_status("ETHUSDT", id).await.unwrap().status, OrderStatus::New);
        let partial = exchange.order_status("ETHUSDT", id).await.unwrap();
        assert_eq!(partial.status, OrderStatus::PartiallyFilled);
        assert_eq!(partial.executed_qty, dec!(0.1));
        assert_eq!(exchange.free_balance("ETH").await, dec!(0.1));

        let filled = exchange.order_status("ETHUSDT", id).await.unwrap();
        assert_eq!(filled.status, OrderStatus::Filled);
        assert_eq!(exchange.free_balance("ETH").await, dec!(0.2));
        assert_eq!(exchange.free_balance("USDT").await, dec!(500));
    }

    #[tokio::test]
    async fn test_stale_balance_reads_after_fill() {
        let exchange = setup_exchange().await;
        exchange.set_balance("ETH", dec!(1)).await;
        exchange.serve_stale_balances(2).await;

        let id = exchange
            .place_limit_order("ETHUSDT", OrderSide::Sell, dec!(1), dec!(2500))
            .await
            .unwrap();
        exchange.order_status("ETHUSDT", id).await.unwrap();

        assert_eq!(exchange.balance("ETH").await.unwrap(), Some(dec!(1)));
        assert_eq!(exchange.balance("ETH").await.unwrap(), Some(dec!(1)));
        assert_eq!(exchange.balance("ETH").await.unwrap(), Some(Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_cancel_failures_then_success() {
        let exchange = setup_exchange().await;
        exchange.script_statuses([OrderStatus::New]).await;
        exchange.fail_next_cancels(1).await;

        let id = exchange
            .place_limit_order("ETHUSDT", OrderSide::Buy, dec!(0.1), dec!(2500))
            .await
            .unwrap();
        exchange.order_status("ETHUSDT", id).await.unwrap();

        assert!(exchange.cancel_order("ETHUSDT", id).await.is_err());
        assert!(exchange.cancel_order("ETHUSDT", id).await.is_ok());
        assert_eq!(exchange.cancel_requests().await, 2);
        assert_eq!(
            exchange.order_status("ETHUSDT", id).await.unwrap().status,
            OrderStatus::Canceled
        );
    }
}
