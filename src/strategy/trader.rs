//! Auto trader: the agent that scouts and jumps between coins.
//!
//! Owns the ledger, the order executor and the single-flight guard. One
//! jump sells the held coin into the bridge, buys the best candidate with
//! the proceeds, and commits fresh ratios for every pair into the new coin.

use crate::config::{Config, TradingConfig};
use crate::exchange::{ExchangeGateway, GatewayError, MarketSnapshot, MarketView};
use crate::persistence::{Asset, Ledger, ScoutRecord};
use crate::strategy::error::TradeError;
use crate::strategy::executor::{FilledOrder, OrderExecutor};
use crate::strategy::scout::{RatioScout, ScoutReport};
use anyhow::{anyhow, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// What a completed jump did.
#[derive(Debug, Clone)]
pub struct JumpOutcome {
    pub from: Asset,
    pub to: Asset,
    /// Absent when starting from the bridge or holding dust
    pub liquidation: Option<FilledOrder>,
    pub acquisition: FilledOrder,
}

pub struct AutoTrader {
    gateway: Arc<dyn ExchangeGateway>,
    ledger: Arc<Ledger>,
    executor: OrderExecutor,
    scout: RatioScout,
    trading: TradingConfig,
    min_notional: Decimal,
    trade_guard: Mutex<()>,
}

impl AutoTrader {
    pub fn new(gateway: Arc<dyn ExchangeGateway>, ledger: Arc<Ledger>, config: &Config) -> Self {
        let executor = OrderExecutor::new(gateway.clone(), ledger.clone(), config.execution.clone());
        Self {
            gateway,
            ledger,
            executor,
            scout: RatioScout::from_config(&config.trading),
            trading: config.trading.clone(),
            min_notional: config.execution.min_notional,
            trade_guard: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn bridge(&self) -> Asset {
        Asset::bridge(&self.trading.bridge)
    }

    /// Sync the coin list and record a starting holding if none exists.
    ///
    /// The starting holding is `current_coin` when configured, otherwise the
    /// first listed coin. The account is assumed to already hold it.
    pub fn initialize(&self) -> Result<()> {
        self.ledger.set_coins(&self.trading.coins)?;

        if let Some(holding) = self.ledger.current_holding()? {
            info!(%holding, "Resuming with existing holding");
            return Ok(());
        }

        let symbol = self
            .trading
            .current_coin
            .clone()
            .or_else(|| self.trading.coins.first().cloned())
            .ok_or_else(|| anyhow!("no coins configured"))?;
        let coin = self
            .ledger
            .coin(&symbol)?
            .ok_or_else(|| anyhow!("starting coin {symbol} is not in the coin list"))?;

        info!(holding = %coin, "Setting initial holding");
        self.ledger.set_current_holding(&coin)
    }

    /// Give every uninitialized pair a ratio from current prices.
    ///
    /// Returns how many pairs were initialized.
    pub fn initialize_ratios(&self, market: &dyn MarketView) -> Result<usize> {
        let bridge = &self.trading.bridge;
        let mut initialized = 0;

        for coin in self.ledger.coins()?.into_iter().filter(|c| c.enabled) {
            for pair in self.ledger.pairs_from(&coin.symbol)? {
                if pair.ratio.is_some() || !pair.to.enabled {
                    continue;
                }

                let from_price = market.price(&pair.from.symbol, bridge);
                let to_price = market.price(&pair.to.symbol, bridge);
                let (Some(from_price), Some(to_price)) = (from_price, to_price.filter(|p| *p > Decimal::ZERO))
                else {
                    warn!(from = %pair.from, to = %pair.to, "Skipping ratio init, price unavailable");
                    continue;
                };

                self.ledger
                    .update_pair_ratio(&pair.from.symbol, &pair.to.symbol, from_price / to_price)?;
                initialized += 1;
            }
        }

        info!(initialized, "Pair ratios initialized");
        Ok(initialized)
    }

    pub fn current_holding(&self) -> Result<Option<Asset>> {
        self.ledger.current_holding()
    }

    fn require_holding(&self) -> Result<Asset> {
        self.ledger
            .current_holding()?
            .ok_or_else(|| anyhow!("no current holding recorded, initialize the trader first"))
    }

    /// Score every pair out of the held coin and log the heartbeat.
    pub fn scout(&self, market: &dyn MarketView) -> Result<ScoutReport> {
        let current = self.require_holding()?;
        let pairs = self.ledger.pairs_from(&current.symbol)?;
        let report = self.scout.evaluate(market, &current, &pairs);

        let now = Utc::now();
        for entry in &report.entries {
            info!("{}", entry.report_line());
            if let Some(target_ratio) = entry.pair.ratio {
                self.ledger.log_scout(&ScoutRecord {
                    from_coin: entry.pair.from.symbol.clone(),
                    to_coin: entry.pair.to.symbol.clone(),
                    target_ratio,
                    current_coin_price: entry.current_price,
                    other_coin_price: entry.candidate_price,
                    datetime: now,
                })?;
            }
        }

        self.ledger
            .prune_scout_history(self.trading.scout_history_hours)?;
        Ok(report)
    }

    /// One trading cycle: fill in missing pair ratios, then jump if worthwhile.
    ///
    /// Coins added since the last run get ratios before they are scouted.
    pub async fn run_cycle(&self, snapshot: &MarketSnapshot) -> Result<Option<JumpOutcome>, TradeError> {
        self.initialize_ratios(snapshot)?;
        self.jump_to_best(snapshot).await
    }

    /// Scout and, if a candidate qualifies, jump to the best one.
    ///
    /// Returns `Ok(None)` when there is nothing worth doing.
    pub async fn jump_to_best(&self, snapshot: &MarketSnapshot) -> Result<Option<JumpOutcome>, TradeError> {
        let _guard = self
            .trade_guard
            .try_lock()
            .map_err(|_| TradeError::TradeInFlight)?;

        let current = self.require_holding()?;
        if current == self.bridge() {
            return self.bridge_scout(snapshot).await;
        }

        let report = self.scout(snapshot)?;
        let Some(best) = report.best_candidate() else {
            debug!(current = %current, "No candidate above threshold");
            return Ok(None);
        };

        info!(
            from = %current,
            to = %best.pair.to,
            delta = %best.delta.round_dp(2),
            "Will be jumping"
        );
        let target = best.pair.to.clone();
        self.transaction_through_bridge(&current, &target, snapshot)
            .await
            .map(Some)
    }

    /// Sell `from` into the bridge, then buy `to` with the bridge balance.
    async fn transaction_through_bridge(
        &self,
        from: &Asset,
        to: &Asset,
        snapshot: &MarketSnapshot,
    ) -> Result<JumpOutcome, TradeError> {
        let bridge = self.bridge();

        let from_price = self.price_of(snapshot, from)?;
        let held = snapshot.balance(&from.symbol).unwrap_or_default();

        let liquidation = if held * from_price >= self.min_notional {
            Some(self.executor.liquidate(from, &bridge, from_price).await?)
        } else {
            info!(coin = %from, balance = %held, "Holding below minimum notional, skipping sell");
            None
        };

        let market = self.refresh(snapshot).await;
        let to_price = self.price_of(&market, to)?;
        let acquisition = self.executor.acquire(to, &bridge, to_price).await?;

        self.commit_ratios(to, acquisition.limit_price, &market)?;

        Ok(JumpOutcome {
            from: from.clone(),
            to: to.clone(),
            liquidation,
            acquisition,
        })
    }

    /// Holding the bridge: buy the first coin no pair would jump away from.
    async fn bridge_scout(&self, snapshot: &MarketSnapshot) -> Result<Option<JumpOutcome>, TradeError> {
        let bridge = self.bridge();
        let bridge_balance = snapshot.balance(&bridge.symbol).unwrap_or_default();

        for coin in self.ledger.coins()?.into_iter().filter(|c| c.enabled) {
            let pairs = self.ledger.pairs_from(&coin.symbol)?;
            let report = self.scout.evaluate(snapshot, &coin, &pairs);
            if report.current_price_unavailable || report.candidates().next().is_some() {
                continue;
            }

            if bridge_balance < self.min_notional {
                info!(%bridge_balance, "Bridge balance below minimum notional");
                return Ok(None);
            }

            info!(%coin, "Will be purchasing using bridge coin");
            let price = self.price_of(snapshot, &coin)?;
            let acquisition = self.executor.acquire(&coin, &bridge, price).await?;
            self.commit_ratios(&coin, acquisition.limit_price, snapshot)?;

            return Ok(Some(JumpOutcome {
                from: bridge,
                to: coin,
                liquidation: None,
                acquisition,
            }));
        }

        debug!("No coin worth buying from the bridge");
        Ok(None)
    }

    /// Re-base every pair into `coin` on the price we just paid for it.
    fn commit_ratios(&self, coin: &Asset, coin_price: Decimal, market: &dyn MarketView) -> Result<usize> {
        if coin_price <= Decimal::ZERO {
            return Ok(0);
        }

        let mut committed = 0;
        for other in self.ledger.coins()?.into_iter().filter(|c| c.enabled && c != coin) {
            let Some(price) = market.price(&other.symbol, &self.trading.bridge) else {
                warn!(from = %other, to = %coin, "Price unavailable, ratio left unchanged");
                continue;
            };
            self.ledger
                .update_pair_ratio(&other.symbol, &coin.symbol, price / coin_price)?;
            committed += 1;
        }

        debug!(%coin, committed, "Pair ratios committed");
        Ok(committed)
    }

    fn price_of(&self, market: &dyn MarketView, asset: &Asset) -> Result<Decimal, TradeError> {
        market
            .price(&asset.symbol, &self.trading.bridge)
            .ok_or_else(|| GatewayError::UnknownSymbol(format!("{}{}", asset, self.trading.bridge)).into())
    }

    /// Prices move while the sell is working; re-read before buying.
    async fn refresh(&self, snapshot: &MarketSnapshot) -> MarketSnapshot {
        match self.gateway.snapshot().await {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(error = %e, "Could not refresh prices, using scouting snapshot");
                snapshot.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionConfig;
    use crate::exchange::{MockExchange, OrderStatus};
    use crate::persistence::TradeState;
    use rust_decimal_macros::dec;

    fn config(coins: &[&str], current: Option<&str>) -> Config {
        let mut config = Config::default();
        config.trading.coins = coins.iter().map(|c| c.to_string()).collect();
        config.trading.current_coin = current.map(str::to_string);
        config.execution = ExecutionConfig {
            poll_interval_ms: 1,
            retry_backoff_ms: 1,
            balance_settle_timeout_secs: 5,
            ..Default::default()
        };
        config
    }

    async fn exchange() -> Arc<MockExchange> {
        let exchange = Arc::new(MockExchange::new());
        exchange.add_symbol("BTC", "USDT", "0.00001000").await;
        exchange.add_symbol("ETH", "USDT", "0.00010000").await;
        exchange.add_symbol("BNB", "USDT", "0.00100000").await;
        exchange.set_price("BTCUSDT", dec!(50000)).await;
        exchange.set_price("ETHUSDT", dec!(2500)).await;
        exchange.set_price("BNBUSDT", dec!(500)).await;
        exchange
    }

    fn trader(exchange: &Arc<MockExchange>, config: &Config) -> AutoTrader {
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        let trader = AutoTrader::new(exchange.clone(), ledger, config);
        trader.initialize().unwrap();
        trader
    }

    #[tokio::test]
    async fn test_initialize_sets_holding_once() {
        let exchange = exchange().await;
        let trader = trader(&exchange, &config(&["BTC", "ETH"], Some("ETH")));
        assert_eq!(trader.current_holding().unwrap().unwrap().symbol, "ETH");

        trader.ledger().set_current_holding(&Asset::new("BTC")).unwrap();
        trader.initialize().unwrap();
        assert_eq!(trader.current_holding().unwrap().unwrap().symbol, "BTC");
    }

    #[tokio::test]
    async fn test_initialize_rejects_unlisted_coin() {
        let exchange = exchange().await;
        let ledger = Arc::new(Ledger::in_memory().unwrap());
        let trader = AutoTrader::new(exchange, ledger, &config(&["BTC"], Some("DOGE")));
        assert!(trader.initialize().is_err());
    }

    #[tokio::test]
    async fn test_initialize_ratios_fills_only_missing() {
        let exchange = exchange().await;
        let trader = trader(&exchange, &config(&["BTC", "ETH", "XRP"], Some("BTC")));
        trader
            .ledger()
            .update_pair_ratio("ETH", "BTC", dec!(0.06))
            .unwrap();

        let snapshot = exchange.snapshot().await.unwrap();
        // XRP has no price: its four pairs stay empty
        assert_eq!(trader.initialize_ratios(&snapshot).unwrap(), 1);

        let btc = trader.ledger().pairs_from("BTC").unwrap();
        assert_eq!(btc[0].to.symbol, "ETH");
        assert_eq!(btc[0].ratio, Some(dec!(20)));
        let eth = trader.ledger().pairs_from("ETH").unwrap();
        assert_eq!(eth[0].ratio, Some(dec!(0.06)));
    }

    #[tokio::test]
    async fn test_scout_logs_history() {
        let exchange = exchange().await;
        let trader = trader(&exchange, &config(&["BTC", "ETH", "BNB"], Some("BTC")));
        let snapshot = exchange.snapshot().await.unwrap();
        trader.initialize_ratios(&snapshot).unwrap();

        let report = trader.scout(&snapshot).unwrap();

        assert_eq!(report.entries.len(), 2);
        assert!(report.best_candidate().is_none());
        assert_eq!(trader.ledger().scout_history_len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_jump_sells_then_buys_and_commits_ratios() {
        let exchange = exchange().await;
        exchange.set_balance("BTC", dec!(0.02)).await;
        let trader = trader(&exchange, &config(&["BTC", "ETH"], Some("BTC")));
        trader
            .ledger()
            .update_pair_ratio("BTC", "ETH", dec!(19.5))
            .unwrap();

        let snapshot = exchange.snapshot().await.unwrap();
        let outcome = trader.jump_to_best(&snapshot).await.unwrap().unwrap();

        assert_eq!(outcome.to.symbol, "ETH");
        let sold = outcome.liquidation.unwrap();
        assert_eq!(sold.quantity, dec!(0.02));
        assert_eq!(sold.cumulative_quote_qty, dec!(1000));
        assert_eq!(outcome.acquisition.quantity, dec!(0.4));

        assert_eq!(trader.current_holding().unwrap().unwrap().symbol, "ETH");
        assert_eq!(
            trader.ledger().pairs_from("BTC").unwrap()[0].ratio,
            Some(dec!(20))
        );
        let trades = trader.ledger().trade_history(10).unwrap();
        assert_eq!(trades.len(), 2);
        assert!(trades.iter().all(|t| t.state == TradeState::Complete));
    }

    #[tokio::test]
    async fn test_no_candidate_places_nothing() {
        let exchange = exchange().await;
        exchange.set_balance("BTC", dec!(0.02)).await;
        let trader = trader(&exchange, &config(&["BTC", "ETH"], Some("BTC")));
        trader
            .ledger()
            .update_pair_ratio("BTC", "ETH", dec!(25))
            .unwrap();

        let snapshot = exchange.snapshot().await.unwrap();
        assert!(trader.jump_to_best(&snapshot).await.unwrap().is_none());
        assert!(exchange.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_cycle_initializes_ratios_on_fresh_ledger() {
        let exchange = exchange().await;
        exchange.set_balance("BTC", dec!(0.02)).await;
        let trader = trader(&exchange, &config(&["BTC", "ETH", "BNB"], Some("BTC")));
        assert!(trader.ledger().pairs_from("BTC").unwrap()[0].ratio.is_none());

        let snapshot = exchange.snapshot().await.unwrap();
        assert!(trader.run_cycle(&snapshot).await.unwrap().is_none());

        for coin in ["BTC", "ETH", "BNB"] {
            let pairs = trader.ledger().pairs_from(coin).unwrap();
            assert!(pairs.iter().all(|p| p.ratio.is_some()));
        }
        assert_eq!(trader.ledger().scout_history_len().unwrap(), 2);
        assert!(exchange.placed_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_jump_is_refused() {
        let exchange = exchange().await;
        let trader = trader(&exchange, &config(&["BTC", "ETH"], Some("BTC")));
        let snapshot = exchange.snapshot().await.unwrap();

        let _held = trader.trade_guard.lock().await;
        let err = trader.jump_to_best(&snapshot).await.unwrap_err();
        assert!(matches!(err, TradeError::TradeInFlight));
    }

    #[tokio::test]
    async fn test_failed_buy_leaves_bridge_then_bridge_scout_recovers() {
        let exchange = exchange().await;
        exchange.set_balance("BTC", dec!(0.02)).await;
        let mut config = config(&["BTC", "ETH"], Some("BTC"));
        config.execution.buy_timeout_minutes = 1;
        let trader = trader(&exchange, &config);
        trader
            .ledger()
            .update_pair_ratio("BTC", "ETH", dec!(19.5))
            .unwrap();
        trader
            .ledger()
            .update_pair_ratio("ETH", "BTC", dec!(0.05))
            .unwrap();

        // Sell fills right away, the buy rests past its timeout
        exchange
            .script_statuses([OrderStatus::Filled, OrderStatus::New])
            .await;
        exchange
            .set_order_age(chrono::Duration::minutes(2))
            .await;

        let snapshot = exchange.snapshot().await.unwrap();
        let err = trader.jump_to_best(&snapshot).await.unwrap_err();
        assert!(err.should_rescout());
        assert_eq!(trader.current_holding().unwrap().unwrap().symbol, "USDT");

        // From the bridge, ETH is the coin nothing wants to leave
        let snapshot = exchange.snapshot().await.unwrap();
        let outcome = trader.jump_to_best(&snapshot).await.unwrap().unwrap();
        assert_eq!(outcome.from.symbol, "USDT");
        assert_eq!(outcome.to.symbol, "ETH");
        assert!(outcome.liquidation.is_none());
        assert_eq!(trader.current_holding().unwrap().unwrap().symbol, "ETH");
    }
}
