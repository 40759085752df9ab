//! Type definitions for Binance spot API responses and gateway-level order state.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest price for a symbol (`GET /api/v3/ticker/price`).
#[derive(Debug, Clone, Deserialize)]
pub struct TickerPrice {
    pub symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
}

/// Spot account information (`GET /api/v3/account`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotAccount {
    pub balances: Vec<SpotBalance>,
}

/// Free and locked balance of one asset.
#[derive(Debug, Clone, Deserialize)]
pub struct SpotBalance {
    pub asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    pub free: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub locked: Decimal,
}

/// Spot exchange information (`GET /api/v3/exchangeInfo`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotExchangeInfo {
    pub symbols: Vec<SpotSymbolInfo>,
}

/// Spot symbol information with trading filters.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotSymbolInfo {
    pub symbol: String,
    pub status: String,
    pub base_asset: String,
    pub quote_asset: String,
    #[serde(default)]
    pub filters: Vec<SymbolFilter>,
}

impl SpotSymbolInfo {
    /// The LOT_SIZE step string, if the symbol declares one.
    pub fn lot_step(&self) -> Option<&str> {
        self.filters.iter().find_map(|f| match f {
            SymbolFilter::LotSize { step_size, .. } => Some(step_size.as_str()),
            _ => None,
        })
    }
}

/// Trading rule attached to a symbol. Only the filters we act on are decoded.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "filterType")]
pub enum SymbolFilter {
    #[serde(rename = "LOT_SIZE", rename_all = "camelCase")]
    LotSize {
        min_qty: String,
        max_qty: String,
        step_size: String,
    },
    #[serde(other)]
    Other,
}

/// Order side (buy or sell).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderType {
    Limit,
    Market,
    LimitMaker,
}

/// Order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    PendingCancel,
    Rejected,
    Expired,
    ExpiredInMatch,
}

impl OrderStatus {
    /// Whether the order left the book without filling completely.
    pub fn is_dead(&self) -> bool {
        matches!(
            self,
            OrderStatus::Canceled
                | OrderStatus::PendingCancel
                | OrderStatus::Rejected
                | OrderStatus::Expired
                | OrderStatus::ExpiredInMatch
        )
    }
}

/// Acknowledgement returned by `POST /api/v3/order`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAck {
    pub symbol: String,
    pub order_id: i64,
    #[serde(default)]
    pub transact_time: i64,
}

/// Spot order as returned by `GET /api/v3/order`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpotOrder {
    pub symbol: String,
    pub order_id: i64,
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub orig_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub executed_qty: Decimal,
    // Binance spells it this way
    #[serde(rename = "cummulativeQuoteQty", with = "rust_decimal::serde::str")]
    pub cumulative_quote_qty: Decimal,
    pub status: OrderStatus,
    pub side: OrderSide,
    #[serde(rename = "type")]
    pub order_type: OrderType,
    pub time: i64,
}

/// Error body returned by Binance on 4xx responses.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    pub code: i64,
    pub msg: String,
}

/// Venue-neutral view of an order, as polled by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderState {
    pub order_id: i64,
    pub symbol: String,
    pub status: OrderStatus,
    pub side: OrderSide,
    pub created_at: DateTime<Utc>,
    pub executed_qty: Decimal,
    pub cumulative_quote_qty: Decimal,
}

impl From<SpotOrder> for OrderState {
    fn from(order: SpotOrder) -> Self {
        Self {
            order_id: order.order_id,
            symbol: order.symbol,
            status: order.status,
            side: order.side,
            created_at: Utc
                .timestamp_millis_opt(order.time)
                .single()
                .unwrap_or_else(Utc::now),
            executed_qty: order.executed_qty,
            cumulative_quote_qty: order.cumulative_quote_qty,
        }
    }
}
