//! End-to-end rotation cycles against the in-memory exchange.

use coin_rotation_trader::config::{Config, ExecutionConfig};
use coin_rotation_trader::exchange::{ExchangeGateway, GatewayError, MockExchange};
use coin_rotation_trader::persistence::{Ledger, TradeDirection, TradeState};
use coin_rotation_trader::strategy::{AutoTrader, TradeError};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

fn config() -> Config {
    let mut config = Config::default();
    config.trading.coins = vec!["BTC".into(), "ETH".into(), "BNB".into()];
    config.trading.current_coin = Some("BTC".into());
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
    exchange.set_balance("BTC", dec!(0.02)).await;
    exchange
}

#[tokio::test]
async fn test_price_move_triggers_rotation() {
    let exchange = exchange().await;
    let ledger = Arc::new(Ledger::in_memory().unwrap());
    let trader = AutoTrader::new(exchange.clone(), ledger.clone(), &config());
    assert_ok!(trader.initialize());

    let snapshot = exchange.snapshot().await.unwrap();
    assert_eq!(trader.initialize_ratios(&snapshot).unwrap(), 6);

    // Flat market: every pair is behind by the fee allowance
    assert!(assert_ok!(trader.jump_to_best(&snapshot).await).is_none());

    // ETH drops 5% against BTC
    exchange.set_price("ETHUSDT", dec!(2375)).await;
    let snapshot = exchange.snapshot().await.unwrap();
    let report = trader.scout(&snapshot).unwrap();
    assert_eq!(report.best_candidate().unwrap().pair.to.symbol, "ETH");

    let outcome = assert_ok!(trader.jump_to_best(&snapshot).await).unwrap();
    assert_eq!(outcome.from.symbol, "BTC");
    assert_eq!(outcome.to.symbol, "ETH");

    let trades = ledger.trade_history(10).unwrap();
    assert_eq!(trades.len(), 2);
    assert_eq!(trades[1].direction, TradeDirection::SellOriginForTarget);
    assert_eq!(trades[0].direction, TradeDirection::BuyOriginWithTarget);
    assert!(trades.iter().all(|t| t.state == TradeState::Complete));

    assert_eq!(ledger.current_holding().unwrap().unwrap().symbol, "ETH");
    assert_eq!(exchange.free_balance("BTC").await, dec!(0));
    assert!(exchange.free_balance("ETH").await > dec!(0.42));

    // Pairs into ETH are re-based on the price just paid
    let btc_pairs = ledger.pairs_from("BTC").unwrap();
    let btc_to_eth = btc_pairs.iter().find(|p| p.to.symbol == "ETH").unwrap();
    assert_eq!(btc_to_eth.ratio.unwrap().round_dp(6), dec!(21.052632));

    // Holding ETH, nothing beats the fresh baseline
    let snapshot = exchange.snapshot().await.unwrap();
    assert!(assert_ok!(trader.jump_to_best(&snapshot).await).is_none());
}

#[tokio::test]
async fn test_rejected_sell_keeps_holding() {
    let exchange = exchange().await;
    let ledger = Arc::new(Ledger::in_memory().unwrap());
    let trader = AutoTrader::new(exchange.clone(), ledger.clone(), &config());
    trader.initialize().unwrap();
    ledger.update_pair_ratio("BTC", "ETH", dec!(19.5)).unwrap();

    exchange
        .fail_next_placements([GatewayError::Rejected {
            code: -1013,
            message: "Filter failure: PRICE_FILTER".into(),
        }])
        .await;

    let snapshot = exchange.snapshot().await.unwrap();
    let err = assert_err!(trader.jump_to_best(&snapshot).await);

    assert!(matches!(err, TradeError::OrderRejected(_)));
    assert!(!err.should_rescout());
    assert_eq!(ledger.current_holding().unwrap().unwrap().symbol, "BTC");
    assert!(ledger.in_flight_trade().unwrap().is_none());

    // The rejected attempt does not block the next one
    let outcome = assert_ok!(trader.jump_to_best(&snapshot).await).unwrap();
    assert_eq!(outcome.to.symbol, "ETH");
}
