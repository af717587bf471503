// =============================================================================
// Signal validation — liquidation-aware stop and leverage adjustment
// =============================================================================
//
// Pure computation: takes a parsed signal plus the symbol's exchange metadata
// and the risk policy, and produces the adjusted values a position will be
// opened with, together with human-readable warnings for every substitution.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{RiskPolicy, StopLossMode};
use crate::exchange::SymbolInfo;
use crate::signal::Signal;
use crate::types::Direction;

/// A signal together with the values adjusted by validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedSignal {
    pub signal: Signal,
    /// Stop-loss after liquidation-buffer adjustment, on the tick grid.
    pub stop_loss: f64,
    /// Leverage after capping.
    pub leverage: u32,
    /// Simplified liquidation estimate for the adjusted leverage.
    pub liquidation_price: f64,
    /// Reward-to-risk ratio to the first target.
    pub risk_reward: f64,
    pub warnings: Vec<String>,
}

/// Snap a price onto the symbol's tick grid.
fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick <= 0.0 {
        return price;
    }
    (price / tick).round() * tick
}

/// Validate one signal. Returns an error string instead of panicking; the
/// caller notifies and drops the signal.
pub fn validate(
    signal: &Signal,
    info: &SymbolInfo,
    risk: &RiskPolicy,
) -> Result<ValidatedSignal, String> {
    let mut warnings = Vec::new();
    let entry = signal.entry;

    // Every target must be beyond entry AND the list must advance strictly
    // in the trade direction; the fill sequence depends on that ordering.
    let beyond_entry = signal.targets.iter().all(|t| match signal.direction {
        Direction::Long => *t > entry,
        Direction::Short => *t < entry,
    });
    if !beyond_entry || !crate::signal::targets_monotonic(signal.direction, &signal.targets) {
        return Err(format!(
            "targets of {} {} signal are not monotonic beyond entry {}",
            signal.symbol, signal.direction, entry
        ));
    }

    // ── Leverage ─────────────────────────────────────────────────────────
    let cap = risk.max_leverage.min(info.max_leverage).max(1);
    let leverage = if risk.use_signal_leverage { signal.leverage.min(cap) } else { cap };
    if risk.use_signal_leverage && leverage != signal.leverage {
        warnings.push(format!(
            "leverage reduced from {}x to {}x (cap)",
            signal.leverage, leverage
        ));
    }

    // ── Liquidation estimate ─────────────────────────────────────────────
    // Simplified: ignores margin-tier schedules; the maintenance buffer
    // haircuts the full 1/leverage distance.
    let liq_distance = entry / leverage as f64 * (1.0 - risk.maintenance_buffer);
    let liquidation_price = match signal.direction {
        Direction::Long => entry - liq_distance,
        Direction::Short => entry + liq_distance,
    };

    // ── Stop-loss ────────────────────────────────────────────────────────
    // The published stop is usable only when it sits strictly between entry
    // and the liquidation estimate; otherwise a stop at a configured
    // fraction of the liquidation distance is substituted.
    let published_ok = match signal.direction {
        Direction::Long => signal.stop_loss > liquidation_price && signal.stop_loss < entry,
        Direction::Short => signal.stop_loss < liquidation_price && signal.stop_loss > entry,
    };

    let stop_loss = match risk.stop_loss_mode {
        StopLossMode::FromSignal if published_ok => signal.stop_loss,
        mode => {
            let safe_offset = risk.safe_distance_fraction * liq_distance;
            let safe_stop = match signal.direction {
                Direction::Long => entry - safe_offset,
                Direction::Short => entry + safe_offset,
            };
            if mode == StopLossMode::FromSignal {
                warnings.push(format!(
                    "published stop {} is outside the liquidation buffer (liq ~{:.8}); \
                     using {:.8}",
                    signal.stop_loss, liquidation_price, safe_stop
                ));
            }
            safe_stop
        }
    };
    let stop_loss = round_to_tick(stop_loss, info.tick_size);

    // ── Risk:reward to target 1 ──────────────────────────────────────────
    let risk_distance = (entry - stop_loss).abs();
    let reward_distance = (signal.targets[0] - entry).abs();
    let risk_reward = if risk_distance > 0.0 { reward_distance / risk_distance } else { 0.0 };
    if risk_reward < 1.0 {
        warnings.push(format!("risk:reward to target 1 is {risk_reward:.2} (< 1.0)"));
    }

    debug!(
        symbol = %signal.symbol,
        direction = %signal.direction,
        leverage,
        stop_loss,
        liquidation_price,
        risk_reward,
        warning_count = warnings.len(),
        "signal validated"
    );

    Ok(ValidatedSignal {
        signal: signal.clone(),
        stop_loss,
        leverage,
        liquidation_price,
        risk_reward,
        warnings,
    })
}
