// =============================================================================
// Position Sizer — sizing modes plus portfolio limits
// =============================================================================
//
// The selected mode produces a raw notional; the cooldown multiplier and the
// portfolio limits are then applied in a fixed order:
//   (a) minimum-notional floor (reject below it),
//   (b) absolute max-notional cap,
//   (c) per-position percent-of-equity cap,
//   (d) remaining total-exposure headroom (reject when none is left).
// Every adjustment is reported as a warning.
// =============================================================================

use serde::Serialize;
use tracing::debug;

use crate::config::{SizingMode, SizingPolicy};
use crate::exchange::SymbolInfo;
use crate::position::round_to_step;

/// Outcome of sizing one trade. `quantity == 0.0` means the trade is
/// rejected; the warnings explain why.
#[derive(Debug, Clone, Serialize)]
pub struct SizeDecision {
    pub quantity: f64,
    pub notional: f64,
    pub margin: f64,
    /// Quote-currency amount lost if the stop fills at its price.
    pub risk_notional: f64,
    pub warnings: Vec<String>,
}

impl SizeDecision {
    pub fn rejected(&self) -> bool {
        self.quantity <= 0.0
    }

    fn reject(reason: String) -> Self {
        Self { quantity: 0.0, notional: 0.0, margin: 0.0, risk_notional: 0.0, warnings: vec![reason] }
    }
}

/// Compute the order quantity for a validated signal.
///
/// `current_exposure` is the summed notional of all open positions;
/// `multiplier` comes from the cooldown controller and is 1.0 outside a
/// losing streak.
#[allow(clippy::too_many_arguments)]
pub fn size_position(
    policy: &SizingPolicy,
    info: &SymbolInfo,
    symbol: &str,
    entry: f64,
    stop: f64,
    leverage: u32,
    equity: f64,
    current_exposure: f64,
    multiplier: f64,
) -> SizeDecision {
    if entry <= 0.0 || leverage == 0 {
        return SizeDecision::reject("invalid entry price or leverage".to_string());
    }

    let mut warnings = Vec::new();

    // ── Mode-specific raw notional ───────────────────────────────────────
    let mut notional = match policy.mode {
        SizingMode::RiskPercent => {
            let sl_distance = (entry - stop).abs() / entry;
            if sl_distance <= 0.0 {
                return SizeDecision::reject("stop equals entry — cannot size by risk".to_string());
            }
            let risk_notional = equity * policy.risk_percent / 100.0;
            risk_notional / sl_distance
        }
        SizingMode::FixedAmount => policy
            .fixed_amount_overrides
            .get(symbol)
            .copied()
            .unwrap_or(policy.fixed_amount),
        SizingMode::FixedMargin => policy.fixed_margin * leverage as f64,
        SizingMode::FixedQuantity => policy.fixed_quantity * entry,
    };

    // ── Cooldown multiplier ──────────────────────────────────────────────
    if multiplier < 1.0 {
        notional *= multiplier;
        warnings.push(format!("size reduced to {:.0}% by cooldown", multiplier * 100.0));
    }

    // ── (a) minimum notional ─────────────────────────────────────────────
    if notional < info.min_notional {
        return SizeDecision::reject(format!(
            "notional {:.2} below exchange minimum {:.2}",
            notional, info.min_notional
        ));
    }

    // ── (b) absolute cap ─────────────────────────────────────────────────
    if notional > policy.max_notional {
        warnings.push(format!(
            "notional capped at {:.2} (absolute limit)",
            policy.max_notional
        ));
        notional = policy.max_notional;
    }

    // ── (c) per-position percent of equity ───────────────────────────────
    let per_position_cap = policy.max_position_percent / 100.0 * equity;
    if notional > per_position_cap {
        warnings.push(format!(
            "notional capped at {:.2} ({:.0}% of equity)",
            per_position_cap, policy.max_position_percent
        ));
        notional = per_position_cap;
    }

    // ── (d) total exposure headroom ──────────────────────────────────────
    let headroom = policy.max_total_exposure_percent / 100.0 * equity - current_exposure;
    if headroom <= 0.0 {
        return SizeDecision::reject(format!(
            "no exposure headroom left (current {:.2}, limit {:.0}% of equity)",
            current_exposure, policy.max_total_exposure_percent
        ));
    }
    if notional > headroom {
        warnings.push(format!("notional capped at {:.2} (exposure headroom)", headroom));
        notional = headroom;
    }

    // ── Quantity on the step grid ────────────────────────────────────────
    let quantity = round_to_step(notional / entry, info.step_size);
    if quantity <= 0.0 || quantity < info.min_qty {
        return SizeDecision::reject(format!(
            "quantity {} below exchange minimum {}",
            quantity, info.min_qty
        ));
    }

    let notional = quantity * entry;
    let margin = notional / leverage as f64;
    let risk_notional = (entry - stop).abs() * quantity;

    debug!(
        symbol,
        mode = ?policy.mode,
        quantity,
        notional,
        margin,
        risk_notional,
        warning_count = warnings.len(),
        "position sized"
    );

    SizeDecision { quantity, notional, margin, risk_notional, warnings }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> SymbolInfo {
        SymbolInfo {
            symbol: "ABCUSDT".into(),
            tick_size: 0.01,
            step_size: 0.01,
            min_qty: 0.01,
            min_notional: 5.0,
            max_leverage: 125,
        }
    }

    fn policy(mode: SizingMode) -> SizingPolicy {
        SizingPolicy {
            mode,
            risk_percent: 1.0,
            fixed_amount: 100.0,
            fixed_margin: 50.0,
            fixed_quantity: 2.0,
            max_notional: 100_000.0,
            max_position_percent: 100.0,
            max_total_exposure_percent: 1_000.0,
            ..SizingPolicy::default()
        }
    }

    #[test]
    fn risk_percent_matches_reference_case() {
        // 10 000 equity, 1% risk, entry 100, stop 95 => 20 units.
        let d = size_position(
            &policy(SizingMode::RiskPercent),
            &info(),
            "ABCUSDT",
            100.0,
            95.0,
            10,
            10_000.0,
            0.0,
            1.0,
        );
        assert!((d.quantity - 20.0).abs() < 1e-9);
        assert!((d.notional - 2_000.0).abs() < 1e-9);
        assert!((d.margin - 200.0).abs() < 1e-9);
        assert!((d.risk_notional - 100.0).abs() < 1e-9);
        assert!(d.warnings.is_empty());
    }

    #[test]
    fn fixed_amount_with_override() {
        let mut p = policy(SizingMode::FixedAmount);
        p.fixed_amount_overrides.insert("ABCUSDT".to_string(), 400.0);

        let d = size_position(&p, &info(), "ABCUSDT", 100.0, 95.0, 10, 10_000.0, 0.0, 1.0);
        assert!((d.notional - 400.0).abs() < 1e-9);

        let d = size_position(&p, &info(), "XYZUSDT", 100.0, 95.0, 10, 10_000.0, 0.0, 1.0);
        assert!((d.notional - 100.0).abs() < 1e-9);
    }

    #[test]
    fn fixed_margin_scales_with_leverage() {
        let d = size_position(
            &policy(SizingMode::FixedMargin),
            &info(),
            "ABCUSDT",
            100.0,
            95.0,
            20,
            10_000.0,
            0.0,
            1.0,
        );
        // 50 margin * 20x = 1000 notional.
        assert!((d.notional - 1_000.0).abs() < 1e-9);
        assert!((d.quantity - 10.0).abs() < 1e-9);
    }

    #[test]
    fn fixed_quantity_mode() {
        let d = size_position(
            &policy(SizingMode::FixedQuantity),
            &info(),
            "ABCUSDT",
            100.0,
            95.0,
            10,
            10_000.0,
            0.0,
            1.0,
        );
        assert!((d.quantity - 2.0).abs() < 1e-9);
        assert!((d.notional - 200.0).abs() < 1e-9);
    }

    #[test]
    fn cooldown_multiplier_shrinks_size() {
        let d = size_position(
            &policy(SizingMode::RiskPercent),
            &info(),
            "ABCUSDT",
            100.0,
            95.0,
            10,
            10_000.0,
            0.0,
            0.5,
        );
        assert!((d.quantity - 10.0).abs() < 1e-9);
        assert!(d.warnings.iter().any(|w| w.contains("cooldown")));
    }

    #[test]
    fn rejects_below_min_notional() {
        let mut p = policy(SizingMode::FixedAmount);
        p.fixed_amount = 3.0; // below min_notional 5.0
        let d = size_position(&p, &info(), "ABCUSDT", 100.0, 95.0, 10, 10_000.0, 0.0, 1.0);
        assert!(d.rejected());
        assert!(d.warnings[0].contains("below exchange minimum"));
    }

    #[test]
    fn caps_apply_in_order() {
        let mut p = policy(SizingMode::FixedAmount);
        p.fixed_amount = 50_000.0;
        p.max_notional = 4_000.0;
        p.max_position_percent = 30.0; // 3 000 of 10 000
        p.max_total_exposure_percent = 50.0; // 5 000 total

        let d = size_position(&p, &info(), "ABCUSDT", 100.0, 95.0, 10, 10_000.0, 3_000.0, 1.0);
        // absolute cap 4 000 -> percent cap 3 000 -> headroom 2 000.
        assert!((d.notional - 2_000.0).abs() < 1e-9);
        assert_eq!(d.warnings.len(), 3);
    }

    #[test]
    fn rejects_when_no_headroom() {
        let mut p = policy(SizingMode::FixedAmount);
        p.max_total_exposure_percent = 50.0;
        let d = size_position(&p, &info(), "ABCUSDT", 100.0, 95.0, 10, 10_000.0, 6_000.0, 1.0);
        assert!(d.rejected());
        assert!(d.warnings[0].contains("headroom"));
    }

    #[test]
    fn quantity_rounds_down_to_step() {
        let mut i = info();
        i.step_size = 1.0;
        let mut p = policy(SizingMode::FixedAmount);
        p.fixed_amount = 250.0;
        let d = size_position(&p, &i, "ABCUSDT", 100.0, 95.0, 10, 10_000.0, 0.0, 1.0);
        assert!((d.quantity - 2.0).abs() < 1e-9); // 2.5 floored
        assert!((d.notional - 200.0).abs() < 1e-9);
    }

    #[test]
    fn stop_at_entry_cannot_be_risk_sized() {
        let d = size_position(
            &policy(SizingMode::RiskPercent),
            &info(),
            "ABCUSDT",
            100.0,
            100.0,
            10,
            10_000.0,
            0.0,
            1.0,
        );
        assert!(d.rejected());
    }
}
