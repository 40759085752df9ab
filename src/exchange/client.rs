//! Binance spot REST API client.

use crate::config::BinanceConfig;
use crate::exchange::error::GatewayError;
use crate::exchange::traits::{ExchangeGateway, MarketSnapshot};
use crate::exchange::types::*;
use anyhow::{Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, Response};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use sha2::Sha256;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

const SPOT_BASE_URL: &str = "https://api.binance.com";
const SPOT_TESTNET_URL: &str = "https://testnet.binance.vision";
const RECV_WINDOW_MS: u64 = 5000;

/// Binance spot API client.
pub struct BinanceClient {
    http: Client,
    api_key: String,
    secret_key: String,
    base_url: String,
    /// LOT_SIZE steps rarely change; fetched once per symbol
    lot_steps: RwLock<HashMap<String, String>>,
}

impl BinanceClient {
    /// Create a new Binance client from configuration.
    pub fn new(config: &BinanceConfig) -> Result<Self> {
        let base_url = if config.testnet {
            SPOT_TESTNET_URL
        } else {
            SPOT_BASE_URL
        };
        Self::with_base_url(config, base_url)
    }

    /// Create a client against a custom base URL.
    pub fn with_base_url(config: &BinanceConfig, base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            api_key: config.api_key.clone(),
            secret_key: config.secret_key.clone(),
            base_url: base_url.into(),
            lot_steps: RwLock::new(HashMap::new()),
        })
    }

    /// Generate HMAC-SHA256 signature for authenticated requests.
    fn sign(&self, query_string: &str) -> String {
        let mut mac = Hmac::<Sha256>::new_from_slice(self.secret_key.as_bytes())
            .expect("HMAC can take key of any size");
        mac.update(query_string.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Get current timestamp in milliseconds.
    fn timestamp() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn encode_params(params: &[(&str, String)]) -> String {
        params
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Map an HTTP response onto the gateway error taxonomy.
    async fn handle_response<T: DeserializeOwned>(response: Response) -> Result<T, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return response.json().await.map_err(GatewayError::from);
        }

        let code = status.as_u16();
        let body = response.text().await.unwrap_or_default();
        if code == 429 || code == 418 {
            warn!(status = code, "Binance rate limit hit");
            return Err(GatewayError::RateLimited { status: code });
        }
        if status.is_server_error() {
            return Err(GatewayError::Transient(format!("HTTP {code}: {body}")));
        }

        match serde_json::from_str::<ApiErrorBody>(&body) {
            Ok(err) => Err(GatewayError::Rejected {
                code: err.code,
                message: err.msg,
            }),
            Err(_) => Err(GatewayError::Rejected {
                code: -(code as i64),
                message: body,
            }),
        }
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let mut url = format!("{}{}", self.base_url, path);
        if !params.is_empty() {
            url.push('?');
            url.push_str(&Self::encode_params(params));
        }
        let response = self.http.get(&url).send().await?;
        Self::handle_response(response).await
    }

    async fn signed_request<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, GatewayError> {
        let mut query = Self::encode_params(params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "recvWindow={}&timestamp={}",
            RECV_WINDOW_MS,
            Self::timestamp()
        ));
        let signature = self.sign(&query);
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        let response = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    // ==================== Market Data (Public) ====================

    /// Get last prices for all spot symbols.
    #[instrument(skip(self))]
    pub async fn get_ticker_prices(&self) -> Result<Vec<TickerPrice>, GatewayError> {
        self.public_get("/api/v3/ticker/price", &[]).await
    }

    /// Get exchange information for a single symbol.
    #[instrument(skip(self))]
    pub async fn get_symbol_info(&self, symbol: &str) -> Result<SpotSymbolInfo, GatewayError> {
        let info: SpotExchangeInfo = self
            .public_get("/api/v3/exchangeInfo", &[("symbol", symbol.to_string())])
            .await?;
        info.symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| GatewayError::UnknownSymbol(symbol.to_string()))
    }

    // ==================== Account (Authenticated) ====================

    /// Get spot account balances.
    #[instrument(skip(self))]
    pub async fn get_account(&self) -> Result<SpotAccount, GatewayError> {
        self.signed_request(Method::GET, "/api/v3/account", &[]).await
    }

    /// Get a spot order by id.
    #[instrument(skip(self))]
    pub async fn get_order(&self, symbol: &str, order_id: i64) -> Result<SpotOrder, GatewayError> {
        self.signed_request(
            Method::GET,
            "/api/v3/order",
            &[
                ("symbol", symbol.to_string()),
                ("orderId", order_id.to_string()),
            ],
        )
        .await
    }
}

#[async_trait]
impl ExchangeGateway for BinanceClient {
    async fn snapshot(&self) -> Result<MarketSnapshot, GatewayError> {
        let (tickers, account) = tokio::try_join!(self.get_ticker_prices(), self.get_account())?;

        let prices = tickers.into_iter().map(|t| (t.symbol, t.price)).collect();
        let balances = account
            .balances
            .into_iter()
            .map(|b| (b.asset, b.free))
            .collect();

        Ok(MarketSnapshot::new(prices, balances))
    }

    async fn balance(&self, asset: &str) -> Result<Option<Decimal>, GatewayError> {
        let account = self.get_account().await?;
        Ok(account
            .balances
            .into_iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free))
    }

    async fn lot_step(&self, symbol: &str) -> Result<String, GatewayError> {
        if let Some(step) = self.lot_steps.read().await.get(symbol) {
            return Ok(step.clone());
        }

        let info = self.get_symbol_info(symbol).await?;
        let step = info
            .lot_step()
            .map(str::to_string)
            .ok_or_else(|| GatewayError::Decode(format!("{symbol} has no LOT_SIZE filter")))?;

        self.lot_steps
            .write()
            .await
            .insert(symbol.to_string(), step.clone());
        Ok(step)
    }

    #[instrument(skip(self))]
    async fn place_limit_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
        price: Decimal,
    ) -> Result<i64, GatewayError> {
        let ack: OrderAck = self
            .signed_request(
                Method::POST,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("side", side.as_str().to_string()),
                    ("type", "LIMIT".to_string()),
                    ("timeInForce", "GTC".to_string()),
                    ("quantity", quantity.normalize().to_string()),
                    ("price", price.normalize().to_string()),
                    ("newOrderRespType", "ACK".to_string()),
                ],
            )
            .await?;

        debug!(order_id = ack.order_id, %symbol, "Limit order acknowledged");
        Ok(ack.order_id)
    }

    async fn order_status(&self, symbol: &str, order_id: i64) -> Result<OrderState, GatewayError> {
        self.get_order(symbol, order_id).await.map(OrderState::from)
    }

    #[instrument(skip(self))]
    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<(), GatewayError> {
        let _: serde_json::Value = self
            .signed_request(
                Method::DELETE,
                "/api/v3/order",
                &[
                    ("symbol", symbol.to_string()),
                    ("orderId", order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_hex_sha256() {
        let config = BinanceConfig {
            api_key: "key".to_string(),
            secret_key: "secret".to_string(),
            ..Default::default()
        };
        let client = BinanceClient::new(&config).unwrap();

        let signature = client.sign("symbol=ETHUSDT&timestamp=1");
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(signature, client.sign("symbol=ETHUSDT&timestamp=1"));
    }

    #[test]
    fn test_encode_params() {
        let query = BinanceClient::encode_params(&[
            ("symbol", "ETHUSDT".to_string()),
            ("price", "2500.5".to_string()),
        ]);
        assert_eq!(query, "symbol=ETHUSDT&price=2500.5");
    }
}
