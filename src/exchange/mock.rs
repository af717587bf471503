// =============================================================================
// Deterministic in-memory exchange for tests
// =============================================================================
//
// Scripted failure queues let tests inject rejections per order kind; every
// accepted order, cancel, and account call is recorded for assertions.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use crate::exchange::{
    ExchangeClient, ExchangePosition, OrderError, OrderSide, PlacedOrder, SymbolInfo,
};
use crate::types::MarginType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOrderKind {
    Market,
    StopMarket,
    TakeProfitMarket,
}

/// One order accepted by the mock.
#[derive(Debug, Clone)]
pub struct MockOrder {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub kind: MockOrderKind,
    pub quantity: f64,
    pub stop_price: f64,
    pub reduce_only: bool,
}

#[derive(Default)]
struct Inner {
    next_order_id: u64,
    symbols: HashMap<String, SymbolInfo>,
    mark_prices: HashMap<String, f64>,
    balance: f64,
    market_failures: VecDeque<OrderError>,
    stop_failures: VecDeque<OrderError>,
    tp_failures: VecDeque<OrderError>,
    orders: Vec<MockOrder>,
    cancelled: Vec<u64>,
    leverage_calls: Vec<(String, u32)>,
    margin_calls: Vec<(String, MarginType)>,
    positions: Vec<ExchangePosition>,
}

pub struct MockExchange {
    inner: Mutex<Inner>,
}

impl MockExchange {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner { next_order_id: 1000, balance: 10_000.0, ..Default::default() }),
        }
    }

    /// A symbol with generous limits and fine precision.
    pub fn basic_info(symbol: &str) -> SymbolInfo {
        SymbolInfo {
            symbol: symbol.to_string(),
            tick_size: 0.01,
            step_size: 0.01,
            min_qty: 0.01,
            min_notional: 5.0,
            max_leverage: 125,
        }
    }

    pub fn add_symbol(&self, info: SymbolInfo) -> &Self {
        self.inner.lock().symbols.insert(info.symbol.clone(), info);
        self
    }

    pub fn set_mark_price(&self, symbol: &str, price: f64) -> &Self {
        self.inner.lock().mark_prices.insert(symbol.to_string(), price);
        self
    }

    pub fn set_balance(&self, balance: f64) -> &Self {
        self.inner.lock().balance = balance;
        self
    }

    pub fn set_positions(&self, positions: Vec<ExchangePosition>) -> &Self {
        self.inner.lock().positions = positions;
        self
    }

    pub fn fail_next_market(&self, err: OrderError) -> &Self {
        self.inner.lock().market_failures.push_back(err);
        self
    }

    pub fn fail_next_stop(&self, err: OrderError) -> &Self {
        self.inner.lock().stop_failures.push_back(err);
        self
    }

    pub fn fail_next_take_profit(&self, err: OrderError) -> &Self {
        self.inner.lock().tp_failures.push_back(err);
        self
    }

    // ── Assertion helpers ───────────────────────────────────────────────

    pub fn orders(&self) -> Vec<MockOrder> {
        self.inner.lock().orders.clone()
    }

    pub fn orders_of_kind(&self, kind: MockOrderKind) -> Vec<MockOrder> {
        self.inner.lock().orders.iter().filter(|o| o.kind == kind).cloned().collect()
    }

    pub fn cancelled(&self) -> Vec<u64> {
        self.inner.lock().cancelled.clone()
    }

    pub fn leverage_calls(&self) -> Vec<(String, u32)> {
        self.inner.lock().leverage_calls.clone()
    }

    pub fn margin_calls(&self) -> Vec<(String, MarginType)> {
        self.inner.lock().margin_calls.clone()
    }

    /// Protective (stop / take-profit) order ids not yet cancelled.
    pub fn live_protective_ids(&self) -> Vec<u64> {
        let inner = self.inner.lock();
        inner
            .orders
            .iter()
            .filter(|o| o.kind != MockOrderKind::Market)
            .filter(|o| !inner.cancelled.contains(&o.order_id))
            .map(|o| o.order_id)
            .collect()
    }

    fn accept(
        &self,
        symbol: &str,
        side: OrderSide,
        kind: MockOrderKind,
        quantity: f64,
        stop_price: f64,
        reduce_only: bool,
    ) -> PlacedOrder {
        let mut inner = self.inner.lock();
        inner.next_order_id += 1;
        let order_id = inner.next_order_id;

        let avg_fill_price = if kind == MockOrderKind::Market {
            inner.mark_prices.get(symbol).copied().unwrap_or(0.0)
        } else {
            0.0
        };

        inner.orders.push(MockOrder {
            order_id,
            symbol: symbol.to_string(),
            side,
            kind,
            quantity,
            stop_price,
            reduce_only,
        });

        PlacedOrder { order_id, avg_fill_price, executed_qty: quantity }
    }
}

#[async_trait]
impl ExchangeClient for MockExchange {
    async fn test_connectivity(&self) -> Result<bool> {
        Ok(true)
    }

    async fn all_symbols(&self) -> Result<Vec<SymbolInfo>> {
        Ok(self.inner.lock().symbols.values().cloned().collect())
    }

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo> {
        self.inner
            .lock()
            .symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("unknown symbol {symbol}"))
    }

    async fn mark_price(&self, symbol: &str) -> Result<f64> {
        self.inner
            .lock()
            .mark_prices
            .get(symbol)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("no mark price for {symbol}"))
    }

    async fn balance(&self, _asset: &str) -> Result<f64> {
        Ok(self.inner.lock().balance)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<bool> {
        self.inner.lock().leverage_calls.push((symbol.to_string(), leverage));
        Ok(true)
    }

    async fn set_margin_type(&self, symbol: &str, margin: MarginType) -> Result<bool> {
        self.inner.lock().margin_calls.push((symbol.to_string(), margin));
        Ok(true)
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> std::result::Result<PlacedOrder, OrderError> {
        if let Some(err) = self.inner.lock().market_failures.pop_front() {
            return Err(err);
        }
        Ok(self.accept(symbol, side, MockOrderKind::Market, quantity, 0.0, false))
    }

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        reduce_only: bool,
    ) -> std::result::Result<PlacedOrder, OrderError> {
        if let Some(err) = self.inner.lock().stop_failures.pop_front() {
            return Err(err);
        }
        Ok(self.accept(symbol, side, MockOrderKind::StopMarket, quantity, stop_price, reduce_only))
    }

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        reduce_only: bool,
    ) -> std::result::Result<PlacedOrder, OrderError> {
        if let Some(err) = self.inner.lock().tp_failures.pop_front() {
            return Err(err);
        }
        Ok(self.accept(
            symbol,
            side,
            MockOrderKind::TakeProfitMarket,
            quantity,
            stop_price,
            reduce_only,
        ))
    }

    async fn cancel_order(&self, _symbol: &str, order_id: u64) -> Result<bool> {
        self.inner.lock().cancelled.push(order_id);
        Ok(true)
    }

    async fn position_risk(&self) -> Result<Vec<ExchangePosition>> {
        Ok(self.inner.lock().positions.clone())
    }
}
