// =============================================================================
// Exchange abstraction — the capability set the trading core consumes
// =============================================================================
//
// One thin adapter per exchange implements `ExchangeClient`; configuration
// selects the concrete adapter in `main`. The core never sees REST details.
// =============================================================================

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{Direction, MarginType};

pub mod binance;
pub mod retry;
pub mod user_stream;

#[cfg(test)]
pub mod mock;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Per-symbol precision and limits from the exchange's instrument metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    /// Price increment.
    pub tick_size: f64,
    /// Quantity increment.
    pub step_size: f64,
    pub min_qty: f64,
    /// Minimum order notional in quote currency.
    pub min_notional: f64,
    pub max_leverage: u32,
}

/// Order side on the exchange wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// Side that opens a position in `direction`.
    pub fn entry(direction: Direction) -> Self {
        match direction {
            Direction::Long => Self::Buy,
            Direction::Short => Self::Sell,
        }
    }

    /// Side that reduces a position in `direction`.
    pub fn exit(direction: Direction) -> Self {
        Self::entry(direction.opposite())
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "BUY"),
            Self::Sell => write!(f, "SELL"),
        }
    }
}

/// Successful order placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlacedOrder {
    pub order_id: u64,
    /// Average fill price; 0.0 for resting (stop / take-profit) orders.
    pub avg_fill_price: f64,
    pub executed_qty: f64,
}

/// Order placement failure, classified for the retry and fallback paths.
#[derive(Debug, Clone)]
pub enum OrderError {
    /// The exchange rejected the quantity and conveyed the maximum allowed
    /// at the current leverage.
    MaxQuantityExceeded { max_qty: f64 },
    /// Hard rejection: bad parameters, untradable symbol, auth failure.
    Rejected(String),
    /// Network error, 5xx, or rate limit; worth retrying.
    Transient(String),
}

impl OrderError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MaxQuantityExceeded { max_qty } => {
                write!(f, "quantity above exchange maximum {max_qty}")
            }
            Self::Rejected(msg) => write!(f, "rejected: {msg}"),
            Self::Transient(msg) => write!(f, "transient: {msg}"),
        }
    }
}

impl std::error::Error for OrderError {}

/// Lifecycle state of an order reported on the user-data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderUpdateStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl OrderUpdateStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(Self::New),
            "PARTIALLY_FILLED" => Some(Self::PartiallyFilled),
            "FILLED" => Some(Self::Filled),
            "CANCELED" => Some(Self::Canceled),
            "EXPIRED" => Some(Self::Expired),
            "REJECTED" => Some(Self::Rejected),
            _ => None,
        }
    }
}

/// One order event from the user-data stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub symbol: String,
    pub order_id: u64,
    pub status: OrderUpdateStatus,
    pub quantity_filled: f64,
    pub average_price: f64,
}

/// Position snapshot from the exchange, used by reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangePosition {
    pub symbol: String,
    /// Signed base quantity: positive long, negative short, zero flat.
    pub quantity: f64,
    pub entry_price: f64,
    pub mark_price: f64,
}

// ---------------------------------------------------------------------------
// Client trait
// ---------------------------------------------------------------------------

/// The exchange capability set consumed by the trading core.
///
/// All implementations must be safe for concurrent calls.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    async fn test_connectivity(&self) -> Result<bool>;

    /// Instrument metadata for every tradable symbol.
    async fn all_symbols(&self) -> Result<Vec<SymbolInfo>>;

    async fn symbol_info(&self, symbol: &str) -> Result<SymbolInfo>;

    async fn mark_price(&self, symbol: &str) -> Result<f64>;

    /// Available balance for `asset` (e.g. "USDT").
    async fn balance(&self, asset: &str) -> Result<f64>;

    /// Returns false when the exchange reports "no change needed".
    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<bool>;

    async fn set_margin_type(&self, symbol: &str, margin: MarginType) -> Result<bool>;

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
    ) -> std::result::Result<PlacedOrder, OrderError>;

    async fn place_stop_loss(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        reduce_only: bool,
    ) -> std::result::Result<PlacedOrder, OrderError>;

    async fn place_take_profit(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        stop_price: f64,
        reduce_only: bool,
    ) -> std::result::Result<PlacedOrder, OrderError>;

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<bool>;

    /// All non-flat position entries, for reconciliation.
    async fn position_risk(&self) -> Result<Vec<ExchangePosition>>;
}
