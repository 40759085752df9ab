//! Order execution: drives one limit order from submission to a booked fill.
//!
//! Each call walks SUBMITTING -> OPEN -> {FILLED, CANCELED, TIMEOUT}:
//! the order is placed through the retry harness, recorded as ORDERED in the
//! ledger, then polled until it fills, is canceled on the exchange, or rests
//! past the side's timeout (in which case we cancel it ourselves).

use crate::config::ExecutionConfig;
use crate::exchange::{ExchangeGateway, GatewayError, OrderSide, OrderState, OrderStatus};
use crate::persistence::{Asset, Ledger, TradeRecord};
use crate::strategy::error::TradeError;
use crate::strategy::retry::{retry, RetryPolicy};
use crate::utils::decimal::{floor_to_precision, lot_precision, step_for_precision};
use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, instrument, warn};

/// A limit order that filled and was booked as COMPLETE.
#[derive(Debug, Clone, PartialEq)]
pub struct FilledOrder {
    pub trade_id: i64,
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub limit_price: Decimal,
    pub quantity: Decimal,
    pub executed_qty: Decimal,
    pub cumulative_quote_qty: Decimal,
    /// Remainder was canceled after resting partially filled too long
    pub partial: bool,
}

/// How a polled order left the book.
enum PollOutcome {
    Filled(OrderState),
    PartiallyFilled(OrderState),
}

/// Result of trying to cancel an order.
enum CancelOutcome {
    Canceled,
    /// The order filled before the cancel landed
    AlreadyFilled(OrderState),
}

/// Quantity to order, floored to the lot precision.
///
/// Buys spend the whole bridge balance at `price`; sells offload the whole
/// origin balance.
pub fn order_quantity(
    side: OrderSide,
    origin_balance: Decimal,
    bridge_balance: Decimal,
    price: Decimal,
    precision: i32,
) -> Decimal {
    match side {
        OrderSide::Buy if price > Decimal::ZERO => {
            floor_to_precision(bridge_balance / price, precision)
        }
        OrderSide::Buy => Decimal::ZERO,
        OrderSide::Sell => floor_to_precision(origin_balance, precision),
    }
}

/// Minutes as a chrono duration, `None` when too large to represent.
fn minutes(m: u64) -> Option<ChronoDuration> {
    i64::try_from(m).ok().and_then(ChronoDuration::try_minutes)
}

/// Places and babysits limit orders between a coin and the bridge.
pub struct OrderExecutor {
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<Ledger>,
    config: ExecutionConfig,
    retry_policy: RetryPolicy,
}

impl OrderExecutor {
    /// Create a new order executor.
    pub fn new(
        gateway: Arc<dyn ExchangeGateway>,
        ledger: Arc<Ledger>,
        config: ExecutionConfig,
    ) -> Self {
        let retry_policy = RetryPolicy::from_config(&config);
        Self {
            gateway,
            ledger,
            config,
            retry_policy,
        }
    }

    /// Buy `origin` with the whole `bridge` balance at `limit_price`.
    pub async fn acquire(
        &self,
        origin: &Asset,
        bridge: &Asset,
        limit_price: Decimal,
    ) -> Result<FilledOrder, TradeError> {
        self.execute(OrderSide::Buy, origin, bridge, limit_price)
            .await
    }

    /// Sell the whole `origin` balance for `bridge` at `limit_price`.
    pub async fn liquidate(
        &self,
        origin: &Asset,
        bridge: &Asset,
        limit_price: Decimal,
    ) -> Result<FilledOrder, TradeError> {
        self.execute(OrderSide::Sell, origin, bridge, limit_price)
            .await
    }

    #[instrument(skip(self, origin, bridge), fields(origin = %origin, bridge = %bridge))]
    async fn execute(
        &self,
        side: OrderSide,
        origin: &Asset,
        bridge: &Asset,
        limit_price: Decimal,
    ) -> Result<FilledOrder, TradeError> {
        let symbol = format!("{}{}", origin.symbol, bridge.symbol);
        let is_liquidation = side == OrderSide::Sell;

        let gateway = self.gateway.as_ref();
        let (symbol_ref, origin_ref, bridge_ref) =
            (symbol.as_str(), origin.symbol.as_str(), bridge.symbol.as_str());

        let (lot_step, origin_balance, bridge_balance) =
            retry(&self.retry_policy, "read lot step and balances", move || async move {
                let step = gateway.lot_step(symbol_ref).await?;
                let origin_balance = gateway.balance(origin_ref).await?;
                let bridge_balance = gateway.balance(bridge_ref).await?;
                Ok::<_, GatewayError>((
                    step,
                    origin_balance.unwrap_or_default(),
                    bridge_balance.unwrap_or_default(),
                ))
            })
            .await?;

        let precision = lot_precision(&lot_step).ok_or_else(|| TradeError::InvalidLotStep {
            symbol: symbol.clone(),
            step: lot_step.clone(),
        })?;

        let quantity = order_quantity(side, origin_balance, bridge_balance, limit_price, precision);
        if quantity <= Decimal::ZERO {
            let (asset, balance) = if is_liquidation {
                (origin, origin_balance)
            } else {
                (bridge, bridge_balance)
            };
            warn!(%symbol, %balance, %lot_step, "Balance below one lot, not ordering");
            return Err(TradeError::InsufficientBalance {
                asset: asset.symbol.clone(),
                balance,
                step: step_for_precision(precision),
            });
        }

        let notional = quantity * limit_price;
        if notional < self.config.min_notional {
            warn!(%symbol, %notional, min_notional = %self.config.min_notional, "Order value too small");
            return Err(TradeError::BelowMinNotional {
                notional,
                min_notional: self.config.min_notional,
            });
        }

        let mut trade = self.ledger.start_trade(origin, bridge, is_liquidation)?;

        info!(
            trade_id = trade.id,
            %symbol,
            side = ?side,
            %quantity,
            price = %limit_price,
            %origin_balance,
            %bridge_balance,
            "Placing limit order"
        );

        let order_id = retry(&self.retry_policy, "place limit order", move || {
            gateway.place_limit_order(symbol_ref, side, quantity, limit_price)
        })
        .await
        .map_err(|e| {
            error!(trade_id = trade.id, %symbol, error = %e, "Order placement failed");
            TradeError::from(e)
        })?;

        self.ledger
            .set_ordered(&mut trade, origin_balance, bridge_balance, quantity)?;
        info!(trade_id = trade.id, order_id, %symbol, "Order placed, waiting for fill");

        let (state, partial) = match self.wait_for_order(&symbol, order_id, &mut trade).await? {
            PollOutcome::Filled(state) => (state, false),
            PollOutcome::PartiallyFilled(state) => (state, true),
        };

        if is_liquidation {
            self.wait_for_balance_settle(&origin.symbol, origin_balance)
                .await?;
        }

        self.ledger
            .set_complete(&mut trade, state.cumulative_quote_qty)?;

        let holding = if is_liquidation { bridge } else { origin };
        self.ledger.set_current_holding(holding)?;

        info!(
            trade_id = trade.id,
            order_id,
            %symbol,
            side = ?side,
            executed_qty = %state.executed_qty,
            cumulative_quote_qty = %state.cumulative_quote_qty,
            partial,
            "Trade complete"
        );

        Ok(FilledOrder {
            trade_id: trade.id,
            order_id,
            symbol,
            side,
            limit_price,
            quantity,
            executed_qty: state.executed_qty,
            cumulative_quote_qty: state.cumulative_quote_qty,
            partial,
        })
    }

    /// Poll until the order fills, dies, or outstays its timeout.
    ///
    /// Query errors never abandon the order: we keep watching it.
    async fn wait_for_order(
        &self,
        symbol: &str,
        order_id: i64,
        trade: &mut TradeRecord,
    ) -> Result<PollOutcome, TradeError> {
        let poll_interval = self.config.poll_interval();

        loop {
            let state = match self.gateway.order_status(symbol, order_id).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(%symbol, order_id, error = %e, "Order status query failed, retrying");
                    sleep(poll_interval).await;
                    continue;
                }
            };

            let age = Utc::now() - state.created_at;
            let timeout = self.config.timeout_minutes(state.side).and_then(minutes);

            match state.status {
                OrderStatus::Filled => {
                    debug!(%symbol, order_id, "Order filled");
                    return Ok(PollOutcome::Filled(state));
                }
                status if status.is_dead() => {
                    if state.executed_qty > Decimal::ZERO {
                        warn!(
                            %symbol,
                            order_id,
                            status = ?status,
                            executed_qty = %state.executed_qty,
                            "Order closed on the exchange after a partial fill"
                        );
                        return Ok(PollOutcome::PartiallyFilled(state));
                    }
                    warn!(%symbol, order_id, status = ?status, "Order canceled on the exchange");
                    self.ledger.set_canceled(trade)?;
                    return Err(TradeError::OrderCanceledExternally {
                        symbol: symbol.to_string(),
                        order_id,
                    });
                }
                OrderStatus::New => {
                    if let Some(timeout) = timeout.filter(|t| age > *t) {
                        info!(
                            %symbol,
                            order_id,
                            age_minutes = age.num_minutes(),
                            timeout_minutes = timeout.num_minutes(),
                            "Order timeout, canceling"
                        );
                        match self.cancel_order(symbol, order_id, trade).await? {
                            CancelOutcome::AlreadyFilled(state) => {
                                return Ok(PollOutcome::Filled(state))
                            }
                            CancelOutcome::Canceled => {
                                let last = self.final_state(symbol, order_id, state).await;
                                if last.executed_qty > Decimal::ZERO {
                                    info!(
                                        %symbol,
                                        order_id,
                                        executed_qty = %last.executed_qty,
                                        "Order filled partly before the cancel landed"
                                    );
                                    return Ok(PollOutcome::PartiallyFilled(last));
                                }
                                self.ledger.set_canceled(trade)?;
                                info!(%symbol, order_id, "Order timed out, back to scouting");
                                return Err(TradeError::OrderTimedOut {
                                    symbol: symbol.to_string(),
                                    order_id,
                                    minutes: age.num_minutes(),
                                });
                            }
                        }
                    }
                }
                OrderStatus::PartiallyFilled => {
                    let deadline = timeout.and_then(|t| {
                        minutes(self.config.partial_fill_grace_minutes).and_then(|g| t.checked_add(&g))
                    });
                    if let Some(deadline) = deadline.filter(|d| age > *d) {
                        info!(
                            %symbol,
                            order_id,
                            executed_qty = %state.executed_qty,
                            age_minutes = age.num_minutes(),
                            deadline_minutes = deadline.num_minutes(),
                            "Partial fill rested too long, canceling remainder"
                        );
                        return match self.cancel_order(symbol, order_id, trade).await? {
                            CancelOutcome::AlreadyFilled(state) => Ok(PollOutcome::Filled(state)),
                            CancelOutcome::Canceled => {
                                let last = self.final_state(symbol, order_id, state).await;
                                Ok(PollOutcome::PartiallyFilled(last))
                            }
                        };
                    }
                    debug!(%symbol, order_id, executed_qty = %state.executed_qty, "Order partially filled");
                }
                _ => {}
            }

            sleep(poll_interval).await;
        }
    }

    /// Cancel an order, retrying up to `cancel_max_attempts` times.
    ///
    /// Gives up by marking the trade TIMEOUT: the order may still be live.
    async fn cancel_order(
        &self,
        symbol: &str,
        order_id: i64,
        trade: &mut TradeRecord,
    ) -> Result<CancelOutcome, TradeError> {
        let max_attempts = self.config.cancel_max_attempts.max(1);

        for attempt in 1..=max_attempts {
            match self.gateway.cancel_order(symbol, order_id).await {
                Ok(()) => return Ok(CancelOutcome::Canceled),
                Err(e) if !e.is_retryable() => {
                    // Usually "unknown order": it filled or died before the cancel landed
                    if let Ok(state) = self.gateway.order_status(symbol, order_id).await {
                        match state.status {
                            OrderStatus::Filled => {
                                info!(%symbol, order_id, "Order filled before cancel");
                                return Ok(CancelOutcome::AlreadyFilled(state));
                            }
                            status if status.is_dead() => return Ok(CancelOutcome::Canceled),
                            _ => {}
                        }
                    }
                    warn!(%symbol, order_id, attempt, error = %e, "Cancel rejected, retrying");
                }
                Err(e) => {
                    warn!(%symbol, order_id, attempt, error = %e, "Cancel failed, retrying");
                }
            }
            sleep(self.config.poll_interval()).await;
        }

        error!(%symbol, order_id, attempts = max_attempts, "Giving up on cancel, order may still be live");
        self.ledger.set_timed_out(trade)?;
        Err(TradeError::CancelFailed {
            symbol: symbol.to_string(),
            order_id,
            attempts: max_attempts,
        })
    }

    /// Re-read an order after canceling its remainder, falling back to the last seen state.
    async fn final_state(&self, symbol: &str, order_id: i64, last_seen: OrderState) -> OrderState {
        match self.gateway.order_status(symbol, order_id).await {
            Ok(state) if state.executed_qty >= last_seen.executed_qty => state,
            Ok(_) => last_seen,
            Err(e) => {
                warn!(%symbol, order_id, error = %e, "Could not re-read canceled order");
                last_seen
            }
        }
    }

    /// Wait until a fresh balance read drops below the pre-trade balance.
    ///
    /// Guards against the account endpoint lagging behind the fill.
    async fn wait_for_balance_settle(&self, asset: &str, previous: Decimal) -> Result<(), TradeError> {
        let timeout = self.config.balance_settle_timeout();
        let started = Instant::now();

        loop {
            match self.gateway.balance(asset).await {
                Ok(Some(balance)) if balance < previous => {
                    debug!(%asset, %balance, %previous, "Balance settled");
                    return Ok(());
                }
                Ok(None) => return Ok(()),
                Ok(Some(balance)) => {
                    debug!(%asset, %balance, %previous, "Balance not updated yet");
                }
                Err(e) => {
                    debug!(%asset, error = %e, "Balance query failed while settling");
                }
            }

            if started.elapsed() >= timeout {
                error!(%asset, %previous, waited = ?timeout, "Balance never settled");
                return Err(TradeError::BalanceSettleTimeout {
                    asset: asset.to_string(),
                    previous,
                    waited: timeout,
                });
            }
            sleep(self.config.poll_interval()).await;
        }
    }
}
