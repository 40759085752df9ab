//! Trade execution error types.

use crate::exchange::GatewayError;
use crate::strategy::retry::RetryError;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;

/// Why an acquire/liquidate call did not end with a booked fill.
#[derive(Debug, Error)]
pub enum TradeError {
    /// Balance is smaller than one lot step; nothing was submitted.
    #[error("Insufficient {asset} balance {balance} (lot step {step})")]
    InsufficientBalance {
        asset: String,
        balance: Decimal,
        step: Decimal,
    },

    /// Order value is under the exchange minimum; nothing was submitted.
    #[error("Order value {notional} below minimum notional {min_notional}")]
    BelowMinNotional {
        notional: Decimal,
        min_notional: Decimal,
    },

    /// The exchange reported a LOT_SIZE step we cannot interpret.
    #[error("Invalid lot step {step:?} for {symbol}")]
    InvalidLotStep { symbol: String, step: String },

    /// The exchange refused the order outright.
    #[error("Order rejected: {0}")]
    OrderRejected(GatewayError),

    /// Every attempt at an exchange call failed.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last: GatewayError,
    },

    /// Order rested past its timeout and was canceled by us.
    #[error("Order {order_id} on {symbol} timed out after {minutes} minutes")]
    OrderTimedOut {
        symbol: String,
        order_id: i64,
        minutes: i64,
    },

    /// Order was canceled, rejected or expired on the exchange side.
    #[error("Order {order_id} on {symbol} was canceled on the exchange")]
    OrderCanceledExternally { symbol: String, order_id: i64 },

    /// A timed-out order could not be canceled; it may still be live.
    #[error("Could not cancel order {order_id} on {symbol} after {attempts} attempts")]
    CancelFailed {
        symbol: String,
        order_id: i64,
        attempts: u32,
    },

    /// The sold balance never dropped below its pre-trade value.
    #[error("{asset} balance did not settle below {previous} within {waited:?}")]
    BalanceSettleTimeout {
        asset: String,
        previous: Decimal,
        waited: Duration,
    },

    /// Another trade is being executed by this agent.
    #[error("Another trade is already in flight")]
    TradeInFlight,

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] anyhow::Error),
}

impl TradeError {
    /// Outcomes after which the driver should go back to scouting.
    pub fn should_rescout(&self) -> bool {
        matches!(
            self,
            TradeError::OrderTimedOut { .. } | TradeError::OrderCanceledExternally { .. }
        )
    }
}

impl From<RetryError<GatewayError>> for TradeError {
    fn from(err: RetryError<GatewayError>) -> Self {
        match err {
            RetryError::Exhausted {
                operation,
                attempts,
                last,
            } => TradeError::RetriesExhausted {
                operation,
                attempts,
                last,
            },
            RetryError::Aborted { error, .. } => match error {
                GatewayError::Rejected { .. } => TradeError::OrderRejected(error),
                other => TradeError::Gateway(other),
            },
        }
    }
}
