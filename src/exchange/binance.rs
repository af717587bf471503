// =============================================================================
// Binance USD-M Futures adapter
// =============================================================================
//
// Signed endpoints carry an HMAC-SHA256 signature computed over the full
// query string, plus a recvWindow that absorbs small clock drift against the
// exchange. The API key travels only in the X-MBX-APIKEY header; the secret
// lives inside the signer and must never reach a log line or a serialized
// struct.
// =============================================================================

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use crate::exchange::retry::is_retryable_status;
use crate::exchange::{
    ExchangeClient, ExchangePosition, OrderError, OrderSide, PlacedOrder, SymbolInfo,
};
use crate::types::MarginType;

type HmacSha256 = Hmac<Sha256>;

/// Default recv-window sent with every signed request (milliseconds).
const RECV_WINDOW: u64 = 5000;

/// Error code Binance returns when the margin type is already the requested
/// one; treated as success.
const ERR_NO_NEED_TO_CHANGE_MARGIN: i64 = -4046;

/// Error codes for quantity above the symbol's maximum at current leverage.
const ERR_QTY_OVER_MAX: i64 = -4005;
const ERR_MAX_LEVERAGE_QTY: i64 = -2027;

/// Fallback when exchangeInfo carries no bracket data for a symbol.
const DEFAULT_MAX_LEVERAGE: u32 = 125;

/// Binance futures REST client with HMAC-SHA256 request signing.
#[derive(Clone)]
pub struct BinanceFuturesClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
    max_qty_pattern: Regex,
}

impl BinanceFuturesClient {
    // -------------------------------------------------------------------------
    // Construction
    // -------------------------------------------------------------------------

    /// Client for the production futures API. The key goes into the default
    /// header set; the secret is held back for signing only.
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret, "https://fapi.binance.com")
    }

    /// Client against a custom base URL (testnet).
    pub fn with_base_url(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();
        let secret = secret.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(val) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", val);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("static client settings");

        // "Quantity greater than max quantity: 1234.5" and similar shapes.
        let max_qty_pattern = Regex::new(r"(?i)max(?:imum)?[^0-9]*([0-9]+(?:\.[0-9]+)?)")
            .expect("static regex compiles");

        debug!("BinanceFuturesClient initialised");

        Self {
            api_key,
            secret,
            base_url: base_url.into(),
            client,
            max_qty_pattern,
        }
    }

    // -------------------------------------------------------------------------
    // Request signing
    // -------------------------------------------------------------------------

    /// Hex-encoded HMAC-SHA256 of `payload` under the account secret.
    fn hmac_hex(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("hmac-sha256 takes keys of any length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Full URL for a signed endpoint: `params` extended with the current
    /// millisecond timestamp and recvWindow, then the signature over that
    /// whole query string appended last.
    fn signed_url(&self, path: &str, params: &str) -> String {
        let mut query = String::with_capacity(params.len() + 48);
        if !params.is_empty() {
            query.push_str(params);
            query.push('&');
        }
        query.push_str(&format!(
            "timestamp={}&recvWindow={RECV_WINDOW}",
            Utc::now().timestamp_millis()
        ));

        let signature = self.hmac_hex(&query);
        format!("{}{path}?{query}&signature={signature}", self.base_url)
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    async fn send_json(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<serde_json::Value> {
        let resp = req.send().await.with_context(|| format!("{what} request failed"))?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {what} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance {what} returned {}: {}", status, body);
        }

        Ok(body)
    }

    /// Issue an order request and classify failures into [`OrderError`].
    async fn send_order(
        &self,
        params: String,
        what: &str,
    ) -> std::result::Result<PlacedOrder, OrderError> {
        let url = self.signed_url("/fapi/v1/order", &params);

        let resp = match self.client.post(&url).send().await {
            Ok(r) => r,
            Err(e) => return Err(OrderError::Transient(format!("{what}: {e}"))),
        };

        let status = resp.status();
        let body: serde_json::Value = match resp.json().await {
            Ok(b) => b,
            Err(e) => return Err(OrderError::Transient(format!("{what} body: {e}"))),
        };

        if status.is_success() {
            let order_id = body["orderId"].as_u64().unwrap_or(0);
            let avg_fill_price = Self::field_f64(&body, "avgPrice");
            let executed_qty = Self::field_f64(&body, "executedQty");
            debug!(what, order_id, avg_fill_price, executed_qty, "order accepted");
            return Ok(PlacedOrder { order_id, avg_fill_price, executed_qty });
        }

        let code = body["code"].as_i64().unwrap_or(0);
        let msg = body["msg"].as_str().unwrap_or("").to_string();

        if is_retryable_status(status.as_u16()) {
            return Err(OrderError::Transient(format!("{what} {status}: {msg}")));
        }

        if code == ERR_QTY_OVER_MAX || code == ERR_MAX_LEVERAGE_QTY {
            if let Some(max_qty) = self.parse_max_quantity(&msg) {
                warn!(what, code, max_qty, "exchange conveyed a maximum quantity");
                return Err(OrderError::MaxQuantityExceeded { max_qty });
            }
        }

        Err(OrderError::Rejected(format!("{what} code {code}: {msg}")))
    }

    /// Extract the maximum quantity an error message conveys, if any.
    fn parse_max_quantity(&self, msg: &str) -> Option<f64> {
        self.max_qty_pattern
            .captures(msg)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .filter(|q| *q > 0.0)
    }

    /// Parse a JSON field that may be a string or a number into `f64`.
    fn field_f64(val: &serde_json::Value, key: &str) -> f64 {
        match &val[key] {
            serde_json::Value::String(s) => s.parse().unwrap_or(0.0),
            serde_json::Value::Number(n) => n.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }

    /// Parse one exchangeInfo symbol entry into a [`SymbolInfo`].
    fn parse_symbol_entry(entry: &serde_json::Value) -> Option<SymbolInfo> {
        let symbol = entry["symbol"].as_str()?.to_string();

        let mut tick_size = 0.0;
        let mut step_size = 0.0;
        let mut min_qty = 0.0;
        let mut min_notional = 0.0;

        for filter in entry["filters"].as_array()?.iter() {
            match filter["filterType"].as_str().unwrap_or("") {
                "PRICE_FILTER" => tick_size = Self::field_f64(filter, "tickSize"),
                "LOT_SIZE" => {
                    step_size = Self::field_f64(filter, "stepSize");
                    min_qty = Self::field_f64(filter, "minQty");
                }
                "MIN_NOTIONAL" => min_notional = Self::field_f64(filter, "notional"),
                _ => {}
            }
        }

        if tick_size <= 0.0 || step_size <= 0.0 {
            return None;
        }

        Some(SymbolInfo {
            symbol,
            tick_size,
            step_size,
            min_qty,
            min_notional,
            max_leverage: DEFAULT_MAX_LEVERAGE,
        })
    }

    // -------------------------------------------------------------------------
    // User-data stream listen key
    // -------------------------------------------------------------------------

    /// POST /fapi/v1/listenKey — create or reuse the user-data stream key.
    #[instrument(skip(self), name = "binance::create_listen_key")]
    pub async fn create_listen_key(&self) -> Result<String> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        let body = self.send_json(self.client.post(&url), "POST /fapi/v1/listenKey").await?;

        body["listenKey"]
            .as_str()
            .map(|s| s.to_string())
            .context("listenKey missing from response")
    }

    /// PUT /fapi/v1/listenKey — extend the key's validity.
    #[instrument(skip(self), name = "binance::keepalive_listen_key")]
    pub async fn keepalive_listen_key(&self) -> Result<()> {
        let url = format!("{}/fapi/v1/listenKey", self.base_url);
        self.send_json(self.client.put(&url), "PUT /fapi/v1/listenKey").await?;
        Ok(())
    }

    /// WebSocket base for the user-data stream, derived from the REST base.
    pub fn stream_url(&self, listen_key: &str) -> String {
        if self.base_url.contains("testnet") {
            format!("wss://stream.binancefuture.com/ws/{listen_key}")
        } else {
            format!("wss://fstream.binance.com/ws/{listen_key}")
        }
    }
}

#[async_trait]
impl ExchangeClient for BinanceFuturesClient {
    #[instrument(skip(self), name = "binance::ping")]
    async fn test_connectivity(&self) -> Result<bool> {
        let url = format!("{}/fapi/v1/ping", self.base_url);
        let resp = self.client.get(&url).send().await.context("ping request failed")?;
        Ok(resp.status().is_success())
    }

    #[instrument(skip(self), name = "binance::exchange_info")]
    async fn all_symbols(&self) -> Result<Vec<SymbolInfo>> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.base_url);
        let body = self.send_json(self.client.get(&url), "GET /fapi/v1/exchangeInfo").await?;

        let raw = body["symbols"].as_array().context("exchangeInfo missing 'symbols'")?;

        let symbols: Vec<SymbolInfo> = raw
            .iter()
            .filter(|s| s["status"].as_str() == Some("TRADING"))
            .filter_map(Self::parse_symbol_entry)
            .collect();

        debug!(count = symbols.len(), "tradable symbols fetched");
        Ok(symbols)
    }

    #[instrument(skip(self), name = "binance::symbol_info")]
    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        let url = format!("{}/fapi/v1/exchangeInfo?symbol={}", self.base_url, symbol);
        let body = self.send_json(self.client.get(&url), "GET /fapi/v1/exchangeInfo").await?;

        body["symbols"]
            .as_array()
            .and_then(|arr| arr.first())
            .and_then(Self::parse_symbol_entry)
            .with_context(|| format!("symbol {symbol} not found in exchangeInfo"))
    }

    #[instrument(skip(self), name = "binance::mark_price")]
    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        let url = format!("{}/fapi/v1/premiumIndex?symbol={}", self.base_url, symbol);
        let body = self.send_json(self.client.get(&url), "GET /fapi/v1/premiumIndex").await?;

        let price = Self::field_f64(&body, "markPrice");
        anyhow::ensure!(price > 0.0, "non-positive mark price for {symbol}");
        Ok(price)
    }

    #[instrument(skip(self), name = "binance::balance")]
    async fn balance(&self, asset: &str) -> Result<f64> {
        let url = self.signed_url("/fapi/v2/balance", "");
        let body = self.send_json(self.client.get(&url), "GET /fapi/v2/balance").await?;

        let entries = body.as_array().context("balance response is not an array")?;

        for entry in entries {
            if entry["asset"].as_str() == Some(asset) {
                let free = Self::field_f64(entry, "availableBalance");
                debug!(asset, free, "balance retrieved");
                return Ok(free);
            }
        }

        warn!(asset, "no balance entry for asset; treating as zero");
        Ok(0.0)
    }

    #[instrument(skip(self), name = "binance::set_leverage")]
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<bool> {
        let params = format!("symbol={symbol}&leverage={leverage}");
        let url = self.signed_url("/fapi/v1/leverage", &params);

        self.send_json(self.client.post(&url), "POST /fapi/v1/leverage").await?;
        debug!(symbol, leverage, "leverage set");
        Ok(true)
    }

    #[instrument(skip(self), name = "binance::set_margin_type")]
    async fn set_margin_type(&self, symbol: &str, margin: MarginType) -> Result<bool> {
        let wire = match margin {
            MarginType::Isolated => "ISOLATED",
            MarginType::Cross => "CROSSED",
        };
        let params = format!("symbol={symbol}&marginType={wire}");
        let url = self.signed_url("/fapi/v1/marginType", &params);

        let resp = self
            .client
            .post(&url)
            .send()
            .await
            .context("POST /fapi/v1/marginType request failed")?;

        let status = resp.status();
        let body: serde_json::Value =
            resp.json().await.context("failed to parse marginType response")?;

        if status.is_success() {
            debug!(symbol, margin = %margin, "margin type set");
            return Ok(true);
        }

        // Already in the requested mode: report "not modified".
        if body["code"].as_i64() == Some(ERR_NO_NEED_TO_CHANGE_MARGIN) {
            debug!(symbol, margin = %margin, "margin type unchanged");
            return Ok(false);
        }

        anyhow::bail!("Binance POST /fapi/v1/marginType returned {}: {}", status, body)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> std::result::Result<PlacedOrder, OrderError> {
        let params = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={quantity}&newOrderRespType=RESULT"
        );
        debug!(symbol, %side, quantity, "placing market order");
        self.send_order(params, "market order").await
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        reduce_only: bool,
    ) -> std::result::Result<PlacedOrder, OrderError> {
        let params = format!(
            "symbol={symbol}&side={side}&type=STOP_MARKET&quantity={quantity}\
             &stopPrice={stop_price}&reduceOnly={reduce_only}&workingType=MARK_PRICE"
        );
        debug!(symbol, %side, quantity, stop_price, "placing stop-market order");
        self.send_order(params, "stop-loss order").await
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        reduce_only: bool,
    ) -> std::result::Result<PlacedOrder, OrderError> {
        let params = format!(
            "symbol={symbol}&side={side}&type=TAKE_PROFIT_MARKET&quantity={quantity}\
             &stopPrice={stop_price}&reduceOnly={reduce_only}&workingType=MARK_PRICE"
        );
        debug!(symbol, %side, quantity, stop_price, "placing take-profit-market order");
        self.send_order(params, "take-profit order").await
    }

    #[instrument(skip(self), name = "binance::cancel_order")]
    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<bool> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let url = self.signed_url("/fapi/v1/order", &params);

        self.send_json(self.client.delete(&url), "DELETE /fapi/v1/order").await?;
        debug!(symbol, order_id, "order cancelled");
        Ok(true)
    }

    #[instrument(skip(self), name = "binance::position_risk")]
    async fn position_risk(&self) -> Result<Vec<ExchangePosition>> {
        let url = self.signed_url("/fapi/v2/positionRisk", "");
        let body = self.send_json(self.client.get(&url), "GET /fapi/v2/positionRisk").await?;

        let entries = body.as_array().context("positionRisk response is not an array")?;

        let positions: Vec<ExchangePosition> = entries
            .iter()
            .filter_map(|e| {
                let symbol = e["symbol"].as_str()?.to_string();
                let quantity = Self::field_f64(e, "positionAmt");
                if quantity == 0.0 {
                    return None;
                }
                Some(ExchangePosition {
                    symbol,
                    quantity,
                    entry_price: Self::field_f64(e, "entryPrice"),
                    mark_price: Self::field_f64(e, "markPrice"),
                })
            })
            .collect();

        debug!(count = positions.len(), "exchange positions fetched");
        Ok(positions)
    }
}

impl std::fmt::Debug for BinanceFuturesClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceFuturesClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
