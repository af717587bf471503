// =============================================================================
// Position model — the mutable entity driven through the trade lifecycle
// =============================================================================
//
// Life-cycle:
//   Pending -> Opening -> Open -> PartialClosed* -> Closed
//        \         \         \
//         +---------+---------+--> Failed / Cancelled
//
// A position is created by the trader (Pending), mutated by the trader while
// opening, and by the position manager afterwards. Every transition is
// persisted through the store.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{CloseReason, Direction};

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Current status of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Pending,
    Opening,
    Open,
    PartialClosed,
    Closed,
    Cancelled,
    Failed,
}

impl PositionStatus {
    /// States that occupy the one-position-per-symbol slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Opening | Self::Open | Self::PartialClosed)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Opening => write!(f, "Opening"),
            Self::Open => write!(f, "Open"),
            Self::PartialClosed => write!(f, "PartialClosed"),
            Self::Closed => write!(f, "Closed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// One take-profit level with its share of the position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// 0-based, stable for the lifetime of the position.
    pub index: usize,
    pub price: f64,
    /// Fraction of the initial quantity this target closes.
    pub fraction: f64,
    /// `fraction * initial_quantity`, rounded to the symbol step; the last
    /// target absorbs the rounding residual.
    pub quantity: f64,
    #[serde(default)]
    pub hit: bool,
    #[serde(default)]
    pub hit_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub fill_price: Option<f64>,
    /// Where the stop migrates after this target fills: breakeven after the
    /// first target, the previous target's price after later ones.
    #[serde(default)]
    pub move_stop_to: Option<f64>,
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// A live exposure on the exchange together with its protective orders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub id: String,
    pub signal_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub status: PositionStatus,
    pub planned_entry: f64,
    /// Average fill of the entry order; 0.0 until filled.
    #[serde(default)]
    pub entry_price: f64,
    /// Current protective stop price.
    pub stop_loss: f64,
    /// Simplified liquidation estimate computed at validation time.
    #[serde(default)]
    pub liquidation_price: f64,
    pub leverage: u32,
    pub initial_quantity: f64,
    pub remaining_quantity: f64,
    pub targets: Vec<Target>,
    #[serde(default)]
    pub entry_order_id: Option<u64>,
    #[serde(default)]
    pub stop_order_id: Option<u64>,
    /// One slot per target, positionally aligned; None when placement failed.
    #[serde(default)]
    pub take_profit_order_ids: Vec<Option<u64>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub opened_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub realized_pnl: f64,
    #[serde(default)]
    pub close_reason: Option<CloseReason>,
}

impl Position {
    /// Create a Pending position skeleton for a signal. Quantities stay zero
    /// until sizing; targets are attached once the fill quantity is known.
    pub fn pending(
        signal_id: &str,
        symbol: &str,
        direction: Direction,
        planned_entry: f64,
        stop_loss: f64,
        liquidation_price: f64,
        leverage: u32,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            signal_id: signal_id.to_string(),
            symbol: symbol.to_string(),
            direction,
            status: PositionStatus::Pending,
            planned_entry,
            entry_price: 0.0,
            stop_loss,
            liquidation_price,
            leverage,
            initial_quantity: 0.0,
            remaining_quantity: 0.0,
            targets: Vec::new(),
            entry_order_id: None,
            stop_order_id: None,
            take_profit_order_ids: Vec::new(),
            created_at: Utc::now(),
            opened_at: None,
            closed_at: None,
            realized_pnl: 0.0,
            close_reason: None,
        }
    }

    /// Directional PnL of a closed slice.
    pub fn slice_pnl(&self, exit_price: f64, quantity: f64) -> f64 {
        self.direction.sign() * (exit_price - self.entry_price) * quantity
    }

    /// Terminal transition. `remaining_quantity` must already be zeroed by
    /// the caller's bookkeeping.
    pub fn mark_closed(&mut self, reason: CloseReason) {
        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.closed_at = Some(Utc::now());
        self.remaining_quantity = 0.0;
    }

    /// Index of the target a filled order id belongs to.
    pub fn target_index_for_order(&self, order_id: u64) -> Option<usize> {
        self.take_profit_order_ids
            .iter()
            .position(|slot| *slot == Some(order_id))
    }
}

// ---------------------------------------------------------------------------
// Quantity helpers
// ---------------------------------------------------------------------------

/// Round a quantity DOWN to the symbol's step size.
pub fn round_to_step(quantity: f64, step: f64) -> f64 {
    if step <= 0.0 {
        return quantity;
    }
    // Epsilon guards against 0.30000000000000004-style float error.
    ((quantity / step) + 1e-9).floor() * step
}

/// Build the take-profit ladder for a filled quantity.
///
/// The configured fractions are matched to the published target count: a
/// longer fraction list is truncated and renormalised, a shorter one falls
/// back to an equal split. The last target absorbs the step-rounding residual
/// so the ladder always sums to `quantity`.
pub fn build_targets(
    prices: &[f64],
    configured_fractions: &[f64],
    quantity: f64,
    step: f64,
    entry: f64,
    move_stop_on_target: bool,
) -> Vec<Target> {
    let n = prices.len();
    if n == 0 || quantity <= 0.0 {
        return Vec::new();
    }

    let fractions: Vec<f64> = if configured_fractions.len() >= n {
        let prefix = &configured_fractions[..n];
        let sum: f64 = prefix.iter().sum();
        if sum > 0.0 {
            prefix.iter().map(|f| f / sum).collect()
        } else {
            vec![1.0 / n as f64; n]
        }
    } else {
        vec![1.0 / n as f64; n]
    };

    let mut targets = Vec::with_capacity(n);
    let mut allocated = 0.0;

    for (i, (&price, &fraction)) in prices.iter().zip(fractions.iter()).enumerate() {
        let qty = if i + 1 == n {
            round_to_step(quantity - allocated, step)
        } else {
            round_to_step(fraction * quantity, step)
        };
        allocated += qty;

        let move_stop_to = if !move_stop_on_target {
            None
        } else if i == 0 {
            Some(entry)
        } else {
            Some(prices[i - 1])
        };

        targets.push(Target {
            index: i,
            price,
            fraction,
            quantity: qty,
            hit: false,
            hit_at: None,
            fill_price: None,
            move_stop_to,
        });
    }

    targets
}
