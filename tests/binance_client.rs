//! Binance spot client against a stubbed HTTP server.

use coin_rotation_trader::config::BinanceConfig;
use coin_rotation_trader::exchange::{
    BinanceClient, ExchangeGateway, GatewayError, MarketView, OrderSide, OrderStatus,
};
use rust_decimal_macros::dec;
use serde_json::json;
use tokio_test::{assert_err, assert_ok};
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> BinanceClient {
    let config = BinanceConfig {
        api_key: "test-key".to_string(),
        secret_key: "test-secret".to_string(),
        ..Default::default()
    };
    BinanceClient::with_base_url(&config, server.uri()).unwrap()
}

#[tokio::test]
async fn test_snapshot_combines_prices_and_balances() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"symbol": "BTCUSDT", "price": "50000.00000000"},
            {"symbol": "ETHUSDT", "price": "2500.00000000"}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/account"))
        .and(header("X-MBX-APIKEY", "test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "balances": [
                {"asset": "USDT", "free": "1000.00000000", "locked": "0.00000000"},
                {"asset": "ETH", "free": "0.40000000", "locked": "0.00000000"}
            ]
        })))
        .mount(&server)
        .await;

    let snapshot = assert_ok!(client(&server).snapshot().await);

    assert_eq!(snapshot.price("BTC", "USDT"), Some(dec!(50000)));
    assert_eq!(snapshot.price("ETH", "USDT"), Some(dec!(2500)));
    assert_eq!(snapshot.price("BNB", "USDT"), None);
    assert_eq!(snapshot.balance("ETH"), Some(dec!(0.4)));
}

#[tokio::test]
async fn test_lot_step_is_fetched_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/exchangeInfo"))
        .and(query_param("symbol", "ETHUSDT"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbols": [{
                "symbol": "ETHUSDT",
                "status": "TRADING",
                "baseAsset": "ETH",
                "quoteAsset": "USDT",
                "filters": [
                    {"filterType": "PRICE_FILTER", "minPrice": "0.01", "maxPrice": "1000000", "tickSize": "0.01"},
                    {"filterType": "LOT_SIZE", "minQty": "0.00010000", "maxQty": "9000.00000000", "stepSize": "0.00010000"}
                ]
            }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    assert_eq!(client.lot_step("ETHUSDT").await.unwrap(), "0.00010000");
    assert_eq!(client.lot_step("ETHUSDT").await.unwrap(), "0.00010000");
}

#[tokio::test]
async fn test_order_status_parses_partial_fill() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/order"))
        .and(query_param("symbol", "ETHUSDT"))
        .and(query_param("orderId", "42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbol": "ETHUSDT",
            "orderId": 42,
            "price": "2500.00000000",
            "origQty": "0.40000000",
            "executedQty": "0.20000000",
            "cummulativeQuoteQty": "500.00000000",
            "status": "PARTIALLY_FILLED",
            "side": "BUY",
            "type": "LIMIT",
            "time": 1700000000000i64
        })))
        .mount(&server)
        .await;

    let state = assert_ok!(client(&server).order_status("ETHUSDT", 42).await);

    assert_eq!(state.status, OrderStatus::PartiallyFilled);
    assert_eq!(state.side, OrderSide::Buy);
    assert_eq!(state.executed_qty, dec!(0.2));
    assert_eq!(state.cumulative_quote_qty, dec!(500));
    assert_eq!(state.created_at.timestamp_millis(), 1_700_000_000_000);
}

#[tokio::test]
async fn test_place_limit_order_returns_id() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v3/order"))
        .and(query_param("type", "LIMIT"))
        .and(query_param("timeInForce", "GTC"))
        .and(query_param("quantity", "0.4"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "symbol": "ETHUSDT",
            "orderId": 7,
            "transactTime": 1700000000000i64
        })))
        .mount(&server)
        .await;

    let order_id = client(&server)
        .place_limit_order("ETHUSDT", OrderSide::Buy, dec!(0.4000), dec!(2500))
        .await;

    assert_eq!(assert_ok!(order_id), 7);
}

#[tokio::test]
async fn test_rejection_carries_binance_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/v3/order"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": -2010,
            "msg": "Account has insufficient balance for requested action."
        })))
        .mount(&server)
        .await;

    let err = assert_err!(
        client(&server)
            .place_limit_order("ETHUSDT", OrderSide::Buy, dec!(1), dec!(2500))
            .await
    );

    assert!(matches!(err, GatewayError::Rejected { code: -2010, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_rate_limit_and_server_errors_are_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/v3/order"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v3/order"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&server)
        .await;

    let client = client(&server);

    let cancel = assert_err!(client.cancel_order("ETHUSDT", 1).await);
    assert_eq!(cancel, GatewayError::RateLimited { status: 429 });
    assert!(cancel.is_retryable());

    let status = assert_err!(client.order_status("ETHUSDT", 1).await);
    assert!(matches!(status, GatewayError::Transient(_)));
    assert!(status.is_retryable());
}

#[tokio::test]
async fn test_undecodable_body_is_decode_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v3/ticker/price"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
        .mount(&server)
        .await;

    let err = assert_err!(client(&server).get_ticker_prices().await);
    assert!(matches!(err, GatewayError::Decode(_)));
}
