// =============================================================================
// Trader — executes one accepted signal end-to-end
// =============================================================================
//
// Happy path, in strict order: persist a Pending skeleton, check price
// deviation, size, set leverage and margin type, place the entry market
// order, place the protective stop, place the take-profit ladder, persist
// the Open position.
//
// The safety invariant: a position never stays open without a stop. If stop
// placement fails after the entry filled, a compensating market order
// flattens the position and it closes with reason Error.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::{BotConfig, DeviationAction};
use crate::cooldown::CooldownController;
use crate::exchange::retry::retry_order;
use crate::exchange::{ExchangeClient, OrderError, OrderSide, SymbolInfo};
use crate::position::{build_targets, round_to_step, Position, PositionStatus};
use crate::signal::validator::ValidatedSignal;
use crate::sizing::size_position;
use crate::statistics::StatisticsStore;
use crate::store::PositionStore;
use crate::telegram::Notifier;
use crate::types::CloseReason;

/// Outcome of one execution attempt. Persistence faults propagate as errors
/// instead.
#[derive(Debug, Clone)]
pub enum TradeOutcome {
    Opened(Position),
    Cancelled { reason: String },
    Failed { reason: String },
}

impl std::fmt::Display for TradeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened(p) => write!(f, "Opened({} {} qty {})", p.symbol, p.direction, p.initial_quantity),
            Self::Cancelled { reason } => write!(f, "Cancelled({reason})"),
            Self::Failed { reason } => write!(f, "Failed({reason})"),
        }
    }
}

pub struct Trader {
    config: Arc<BotConfig>,
    client: Arc<dyn ExchangeClient>,
    store: Arc<PositionStore>,
    stats: Arc<StatisticsStore>,
    cooldown: Arc<CooldownController>,
    notifier: Notifier,
}

impl Trader {
    pub fn new(
        config: Arc<BotConfig>,
        client: Arc<dyn ExchangeClient>,
        store: Arc<PositionStore>,
        stats: Arc<StatisticsStore>,
        cooldown: Arc<CooldownController>,
        notifier: Notifier,
    ) -> Self {
        Self { config, client, store, stats, cooldown, notifier }
    }

    // -------------------------------------------------------------------------
    // Open a position for a validated signal
    // -------------------------------------------------------------------------

    /// Execute one validated signal. Gate checks are the runner's job; this
    /// only drives the exchange.
    pub async fn execute(
        &self,
        validated: &ValidatedSignal,
        info: &SymbolInfo,
        equity: f64,
        current_exposure: f64,
        size_multiplier: f64,
    ) -> Result<TradeOutcome> {
        let signal = &validated.signal;

        // ── 1. Pending skeleton ──────────────────────────────────────────
        let mut position = Position::pending(
            &signal.id,
            &signal.symbol,
            signal.direction,
            signal.entry,
            validated.stop_loss,
            validated.liquidation_price,
            validated.leverage,
        );
        self.store.save(&position)?;

        // ── 2. Deviation policy ──────────────────────────────────────────
        let mark = match self.client.mark_price(&signal.symbol).await {
            Ok(m) => m,
            Err(e) => {
                return self.fail(position, format!("mark price unavailable: {e}"));
            }
        };

        let deviation_pct = (mark - signal.entry).abs() / signal.entry * 100.0;
        let mut adjust_targets = false;

        if deviation_pct > self.config.entry.max_deviation_percent {
            match self.config.entry.deviation_action {
                DeviationAction::Skip => {
                    return self.cancel(
                        position,
                        format!(
                            "price deviated {:.2}% from planned entry {} (mark {})",
                            deviation_pct, signal.entry, mark
                        ),
                    );
                }
                DeviationAction::PlaceLimitAtEntry => {
                    // Not implemented; never silently downgrade to market.
                    return self.cancel(
                        position,
                        "limit-at-entry deviation handling is not available".to_string(),
                    );
                }
                DeviationAction::EnterAtMarket => {
                    warn!(
                        symbol = %signal.symbol,
                        deviation_pct,
                        "entering at market despite deviation"
                    );
                }
                DeviationAction::EnterAndAdjustTargets => {
                    adjust_targets = true;
                }
            }
        }

        // ── 3. Sizing ────────────────────────────────────────────────────
        let size = size_position(
            &self.config.sizing,
            info,
            &signal.symbol,
            signal.entry,
            validated.stop_loss,
            validated.leverage,
            equity,
            current_exposure,
            size_multiplier,
        );
        if size.rejected() {
            return self.cancel(position, format!("sizing rejected: {}", size.warnings.join("; ")));
        }

        // ── 4. Leverage and margin type (idempotent; log-and-continue) ───
        if let Err(e) = self.client.set_leverage(&signal.symbol, validated.leverage).await {
            warn!(symbol = %signal.symbol, error = %e, "set_leverage failed — continuing");
        }
        if let Err(e) = self.client.set_margin_type(&signal.symbol, self.config.risk.margin_type).await
        {
            warn!(symbol = %signal.symbol, error = %e, "set_margin_type failed — continuing");
        }

        // ── 5. Entry market order ────────────────────────────────────────
        position.status = PositionStatus::Opening;
        self.store.save(&position)?;

        let entry_side = OrderSide::entry(signal.direction);
        let placed = match self.place_entry(&signal.symbol, entry_side, size.quantity, info).await {
            Ok(placed) => placed,
            Err(e) => {
                return self.fail(position, format!("entry order failed: {e}"));
            }
        };

        let filled_qty = if placed.executed_qty > 0.0 { placed.executed_qty } else { size.quantity };
        let actual_entry = if placed.avg_fill_price > 0.0 { placed.avg_fill_price } else { mark };

        position.entry_order_id = Some(placed.order_id);
        position.entry_price = actual_entry;
        position.initial_quantity = filled_qty;
        position.remaining_quantity = filled_qty;
        position.opened_at = Some(Utc::now());
        position.status = PositionStatus::Open;

        // ── 6. Target ladder over the filled quantity ────────────────────
        let target_prices: Vec<f64> = if adjust_targets {
            let offset = actual_entry - signal.entry;
            signal.targets.iter().map(|t| t + offset).collect()
        } else {
            signal.targets.clone()
        };

        position.targets = build_targets(
            &target_prices,
            &self.config.targets.fractions,
            filled_qty,
            info.step_size,
            actual_entry,
            self.config.targets.move_stop_on_target,
        );
        self.store.save(&position)?;

        info!(
            symbol = %signal.symbol,
            direction = %signal.direction,
            qty = filled_qty,
            entry = actual_entry,
            stop = position.stop_loss,
            targets = position.targets.len(),
            "entry filled"
        );

        // ── 7. Protective stop (compensate and close on failure) ─────────
        let exit_side = OrderSide::exit(signal.direction);
        match retry_order(&self.config.retry, "stop-loss placement", || {
            self.client.place_stop_loss(
                &signal.symbol,
                exit_side,
                position.remaining_quantity,
                position.stop_loss,
                true,
            )
        })
        .await
        {
            Ok(stop) => {
                position.stop_order_id = Some(stop.order_id);
            }
            Err(e) => {
                error!(
                    symbol = %signal.symbol,
                    error = %e,
                    "stop placement failed after entry — issuing compensating close"
                );
                self.compensating_close(&mut position).await?;
                return Ok(TradeOutcome::Failed {
                    reason: format!("stop placement failed, position flattened: {e}"),
                });
            }
        }

        // ── 8. Take-profit ladder (failures logged, never abort) ────────
        self.place_take_profits(&mut position, exit_side).await;
        self.store.save(&position)?;

        self.notifier.send(format!(
            "Opened {} {} qty {:.4} @ {:.6} (stop {:.6}, {} targets)",
            signal.direction,
            signal.symbol,
            position.initial_quantity,
            position.entry_price,
            position.stop_loss,
            position.targets.len()
        ));

        Ok(TradeOutcome::Opened(position))
    }

    /// Entry with retry and the single max-quantity fallback attempt.
    async fn place_entry(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: f64,
        info: &SymbolInfo,
    ) -> std::result::Result<crate::exchange::PlacedOrder, OrderError> {
        let first = retry_order(&self.config.retry, "entry order", || {
            self.client.place_market_order(symbol, side, quantity)
        })
        .await;

        match first {
            Err(OrderError::MaxQuantityExceeded { max_qty }) => {
                let reduced = round_to_step(quantity.min(max_qty), info.step_size);
                if reduced <= 0.0 {
                    return Err(OrderError::Rejected(format!(
                        "exchange maximum quantity {max_qty} leaves nothing to trade"
                    )));
                }
                warn!(
                    symbol,
                    requested = quantity,
                    reduced,
                    "retrying entry once at exchange maximum quantity"
                );
                self.client.place_market_order(symbol, side, reduced).await
            }
            other => other,
        }
    }

    async fn place_take_profits(&self, position: &mut Position, exit_side: OrderSide) {
        position.take_profit_order_ids = Vec::with_capacity(position.targets.len());

        for target in &position.targets {
            if target.quantity <= 0.0 {
                position.take_profit_order_ids.push(None);
                continue;
            }

            let result = retry_order(&self.config.retry, "take-profit placement", || {
                self.client.place_take_profit(
                    &position.symbol,
                    exit_side,
                    target.quantity,
                    target.price,
                    true,
                )
            })
            .await;

            match result {
                Ok(order) => position.take_profit_order_ids.push(Some(order.order_id)),
                Err(e) => {
                    // The stop already protects the position.
                    warn!(
                        symbol = %position.symbol,
                        target = target.index,
                        price = target.price,
                        error = %e,
                        "take-profit placement failed — position stays protected by stop"
                    );
                    position.take_profit_order_ids.push(None);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Closing paths
    // -------------------------------------------------------------------------

    /// Flatten an unprotected position after a failed stop placement.
    async fn compensating_close(&self, position: &mut Position) -> Result<()> {
        let exit_side = OrderSide::exit(position.direction);
        let qty = position.remaining_quantity;

        let exit_price = match self.client.place_market_order(&position.symbol, exit_side, qty).await
        {
            Ok(order) if order.avg_fill_price > 0.0 => order.avg_fill_price,
            Ok(_) => position.entry_price,
            Err(e) => {
                // Flattening failed too; the operator must intervene.
                error!(
                    symbol = %position.symbol,
                    error = %e,
                    "COMPENSATING CLOSE FAILED — position may be unprotected on the exchange"
                );
                self.notifier.send(format!(
                    "URGENT: could not flatten unprotected {} position on {}: {e}",
                    position.direction, position.symbol
                ));
                position.entry_price
            }
        };

        position.realized_pnl += position.slice_pnl(exit_price, qty);
        position.mark_closed(CloseReason::Error);
        self.store.save(position)?;
        self.archive(position);

        self.notifier.send(format!(
            "Closed {} {} after stop placement failure (pnl {:.2})",
            position.direction, position.symbol, position.realized_pnl
        ));
        Ok(())
    }

    /// Flatten an open position at market: cancel its protective orders,
    /// close the remainder, and archive the result.
    pub async fn flatten(&self, position: &mut Position, reason: CloseReason) -> Result<()> {
        self.cancel_protective_orders(position).await;

        let qty = position.remaining_quantity;
        if qty > 0.0 {
            let exit_side = OrderSide::exit(position.direction);
            let exit_price = match retry_order(&self.config.retry, "flatten order", || {
                self.client.place_market_order(&position.symbol, exit_side, qty)
            })
            .await
            {
                Ok(order) if order.avg_fill_price > 0.0 => order.avg_fill_price,
                Ok(_) => position.entry_price,
                Err(e) => {
                    error!(symbol = %position.symbol, error = %e, "flatten order failed");
                    anyhow::bail!("failed to flatten {}: {e}", position.symbol);
                }
            };
            position.realized_pnl += position.slice_pnl(exit_price, qty);
        }

        position.mark_closed(reason);
        self.store.save(position)?;
        self.archive(position);

        info!(
            symbol = %position.symbol,
            reason = %reason,
            pnl = position.realized_pnl,
            "position flattened at market"
        );
        self.notifier.send(format!(
            "Closed {} {} at market ({reason}, pnl {:.2})",
            position.direction, position.symbol, position.realized_pnl
        ));
        Ok(())
    }

    /// Replace the take-profit ladder (and stop) of an open position with a
    /// new signal's levels, keeping entry and fill untouched. The new ladder
    /// is built over the remaining quantity; partial-fill state of the old
    /// take-profits is not reconciled.
    pub async fn update_targets(
        &self,
        position: &mut Position,
        new_stop: f64,
        new_prices: &[f64],
        info: &SymbolInfo,
    ) -> Result<()> {
        self.cancel_protective_orders(position).await;

        position.targets = build_targets(
            new_prices,
            &self.config.targets.fractions,
            position.remaining_quantity,
            info.step_size,
            position.entry_price,
            self.config.targets.move_stop_on_target,
        );
        position.stop_loss = new_stop;

        let exit_side = OrderSide::exit(position.direction);
        match retry_order(&self.config.retry, "stop-loss replacement", || {
            self.client.place_stop_loss(
                &position.symbol,
                exit_side,
                position.remaining_quantity,
                position.stop_loss,
                true,
            )
        })
        .await
        {
            Ok(stop) => position.stop_order_id = Some(stop.order_id),
            Err(e) => {
                error!(
                    symbol = %position.symbol,
                    error = %e,
                    "stop replacement failed during target update — issuing compensating close"
                );
                self.compensating_close(position).await?;
                anyhow::bail!("stop replacement failed, position flattened: {e}");
            }
        }

        self.place_take_profits(position, exit_side).await;
        self.store.save(position)?;

        info!(
            symbol = %position.symbol,
            targets = position.targets.len(),
            stop = position.stop_loss,
            "targets updated over remaining quantity"
        );
        Ok(())
    }

    async fn cancel_protective_orders(&self, position: &Position) {
        if let Some(stop_id) = position.stop_order_id {
            if let Err(e) = self.client.cancel_order(&position.symbol, stop_id).await {
                warn!(symbol = %position.symbol, order_id = stop_id, error = %e, "stop cancel failed");
            }
        }
        for (target, slot) in position.targets.iter().zip(&position.take_profit_order_ids) {
            if target.hit {
                continue;
            }
            if let Some(tp_id) = slot {
                if let Err(e) = self.client.cancel_order(&position.symbol, *tp_id).await {
                    warn!(symbol = %position.symbol, order_id = tp_id, error = %e, "take-profit cancel failed");
                }
            }
        }
    }

    fn archive(&self, position: &Position) {
        if let Err(e) = self.stats.record_close(position) {
            error!(position_id = %position.id, error = %e, "failed to archive closed position");
        }
        if let Some(reason) = position.close_reason {
            self.cooldown.on_position_closed(reason);
        }
    }

    // -------------------------------------------------------------------------
    // Terminal transitions before entry
    // -------------------------------------------------------------------------

    fn cancel(&self, mut position: Position, reason: String) -> Result<TradeOutcome> {
        position.status = PositionStatus::Cancelled;
        position.closed_at = Some(Utc::now());
        self.store.save(&position)?;
        info!(symbol = %position.symbol, reason = %reason, "signal cancelled before entry");
        self.notifier.send(format!("Signal on {} cancelled: {reason}", position.symbol));
        Ok(TradeOutcome::Cancelled { reason })
    }

    fn fail(&self, mut position: Position, reason: String) -> Result<TradeOutcome> {
        position.status = PositionStatus::Failed;
        position.closed_at = Some(Utc::now());
        self.store.save(&position)?;
        error!(symbol = %position.symbol, reason = %reason, "trade execution failed");
        self.notifier.send(format!("Trade on {} failed: {reason}", position.symbol));
        Ok(TradeOutcome::Failed { reason })
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::mock::{MockExchange, MockOrderKind};
    use crate::signal::validator::validate;
    use crate::signal::Signal;
    use crate::types::Direction;

    struct Fixture {
        exchange: Arc<MockExchange>,
        trader: Trader,
        store: Arc<PositionStore>,
        info: SymbolInfo,
        _dir: tempfile::TempDir,
    }

    fn fixture(config: BotConfig) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let exchange = Arc::new(MockExchange::new());
        let info = MockExchange::basic_info("ABCUSDT");
        exchange.add_symbol(info.clone());
        exchange.set_mark_price("ABCUSDT", 100.0);

        let store = Arc::new(PositionStore::open(dir.path().join("positions.json")).unwrap());
        let stats = Arc::new(StatisticsStore::open(dir.path().join("statistics.json")).unwrap());
        let cooldown = Arc::new(CooldownController::new(config.cooldown.clone()));

        let trader = Trader::new(
            Arc::new(config),
            exchange.clone(),
            store.clone(),
            stats,
            cooldown,
            Notifier::disabled(),
        );

        Fixture { exchange, trader, store, info, _dir: dir }
    }

    fn long_validated(config: &BotConfig, info: &SymbolInfo) -> ValidatedSignal {
        let signal = Signal::assemble(
            "raw",
            "ch",
            "ABC",
            "USDT",
            Direction::Long,
            100.0,
            95.0,
            vec![101.0, 102.0, 103.0, 104.0],
            10,
        )
        .unwrap();
        validate(&signal, info, &config.risk).unwrap()
    }

    #[tokio::test]
    async fn happy_path_places_entry_stop_and_targets() {
        let config = BotConfig::default();
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();

        let position = match outcome {
            TradeOutcome::Opened(p) => p,
            other => panic!("expected Opened, got {other}"),
        };

        assert_eq!(position.status, PositionStatus::Open);
        assert!((position.initial_quantity - 20.0).abs() < 1e-9);
        assert!(position.stop_order_id.is_some());
        assert_eq!(position.take_profit_order_ids.len(), 4);
        assert!(position.take_profit_order_ids.iter().all(Option::is_some));

        // One market entry, one reduce-only stop, four reduce-only TPs.
        assert_eq!(f.exchange.orders_of_kind(MockOrderKind::Market).len(), 1);
        let stops = f.exchange.orders_of_kind(MockOrderKind::StopMarket);
        assert_eq!(stops.len(), 1);
        assert!(stops[0].reduce_only);
        assert_eq!(stops[0].side, OrderSide::Sell);
        assert!((stops[0].stop_price - 95.0).abs() < 1e-9);
        let tps = f.exchange.orders_of_kind(MockOrderKind::TakeProfitMarket);
        assert_eq!(tps.len(), 4);
        assert!(tps.iter().all(|o| o.reduce_only && o.side == OrderSide::Sell));

        // Leverage and margin were configured before entry.
        assert_eq!(f.exchange.leverage_calls(), vec![("ABCUSDT".to_string(), 10)]);

        // The store holds the open position under its symbol.
        assert_eq!(f.store.get_by_symbol("ABCUSDT").unwrap().id, position.id);
    }

    #[tokio::test]
    async fn stop_failure_triggers_compensating_close() {
        let config = BotConfig::default();
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        f.exchange.fail_next_stop(OrderError::Rejected("would trigger immediately".into()));

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();
        assert!(matches!(outcome, TradeOutcome::Failed { .. }));

        let position = f.store.list_all().into_iter().next().unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.close_reason, Some(CloseReason::Error));
        assert_eq!(position.remaining_quantity, 0.0);

        // Entry plus compensating close; no take-profits ever placed.
        assert_eq!(f.exchange.orders_of_kind(MockOrderKind::Market).len(), 2);
        assert!(f.exchange.orders_of_kind(MockOrderKind::TakeProfitMarket).is_empty());
    }

    #[tokio::test]
    async fn transient_stop_failure_is_retried_not_compensated() {
        let config = BotConfig::default();
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        f.exchange.fail_next_stop(OrderError::Transient("504".into()));

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();
        assert!(matches!(outcome, TradeOutcome::Opened(_)));
        assert_eq!(f.exchange.orders_of_kind(MockOrderKind::StopMarket).len(), 1);
    }

    #[tokio::test]
    async fn max_quantity_fallback_retries_once_and_rebuilds_targets() {
        let config = BotConfig::default();
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        f.exchange.fail_next_market(OrderError::MaxQuantityExceeded { max_qty: 8.0 });

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();
        let position = match outcome {
            TradeOutcome::Opened(p) => p,
            other => panic!("expected Opened, got {other}"),
        };

        // Requested 20, retried at the exchange maximum of 8.
        assert!((position.initial_quantity - 8.0).abs() < 1e-9);
        let ladder: f64 = position.targets.iter().map(|t| t.quantity).sum();
        assert!((ladder - 8.0).abs() < 1e-9);

        let stops = f.exchange.orders_of_kind(MockOrderKind::StopMarket);
        assert!((stops[0].quantity - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn entry_rejection_marks_position_failed() {
        let config = BotConfig::default();
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        f.exchange.fail_next_market(OrderError::Rejected("margin insufficient".into()));

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();
        assert!(matches!(outcome, TradeOutcome::Failed { .. }));

        let position = f.store.list_all().into_iter().next().unwrap();
        assert_eq!(position.status, PositionStatus::Failed);
        // Nothing was placed beyond the failed entry attempt.
        assert!(f.exchange.orders_of_kind(MockOrderKind::StopMarket).is_empty());
    }

    #[tokio::test]
    async fn deviation_skip_cancels_without_orders() {
        let config = BotConfig::default(); // Skip action, 0.5% threshold
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        f.exchange.set_mark_price("ABCUSDT", 101.2); // 1.2% away

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();
        assert!(matches!(outcome, TradeOutcome::Cancelled { .. }));

        let position = f.store.list_all().into_iter().next().unwrap();
        assert_eq!(position.status, PositionStatus::Cancelled);
        assert!(f.exchange.orders().is_empty());
        assert!(f.store.get_by_symbol("ABCUSDT").is_none());
    }

    #[tokio::test]
    async fn deviation_adjust_shifts_targets_not_stop() {
        let mut config = BotConfig::default();
        config.entry.deviation_action = DeviationAction::EnterAndAdjustTargets;
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        f.exchange.set_mark_price("ABCUSDT", 101.0); // fills at 101

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();
        let position = match outcome {
            TradeOutcome::Opened(p) => p,
            other => panic!("expected Opened, got {other}"),
        };

        // Targets shifted by +1; stop untouched.
        assert!((position.targets[0].price - 102.0).abs() < 1e-9);
        assert!((position.targets[3].price - 105.0).abs() < 1e-9);
        assert!((position.stop_loss - 95.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn limit_at_entry_policy_cancels() {
        let mut config = BotConfig::default();
        config.entry.deviation_action = DeviationAction::PlaceLimitAtEntry;
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        f.exchange.set_mark_price("ABCUSDT", 102.0);

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();
        assert!(matches!(outcome, TradeOutcome::Cancelled { .. }));
        assert!(f.exchange.orders().is_empty());
    }

    #[tokio::test]
    async fn target_failures_do_not_abort() {
        let config = BotConfig::default();
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        f.exchange.fail_next_take_profit(OrderError::Rejected("bad price".into()));

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();
        let position = match outcome {
            TradeOutcome::Opened(p) => p,
            other => panic!("expected Opened, got {other}"),
        };

        assert_eq!(position.take_profit_order_ids[0], None);
        assert!(position.take_profit_order_ids[1].is_some());
        assert!(position.stop_order_id.is_some());
    }

    #[tokio::test]
    async fn flatten_cancels_protection_and_archives() {
        let config = BotConfig::default();
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();
        let mut position = match outcome {
            TradeOutcome::Opened(p) => p,
            other => panic!("expected Opened, got {other}"),
        };

        f.exchange.set_mark_price("ABCUSDT", 99.0);
        f.trader.flatten(&mut position, CloseReason::OppositeSignal).await.unwrap();

        assert_eq!(position.status, PositionStatus::Closed);
        assert_eq!(position.close_reason, Some(CloseReason::OppositeSignal));
        assert!(position.realized_pnl < 0.0); // long closed below entry
        assert!(f.exchange.live_protective_ids().is_empty());
        assert!(f.store.get_by_symbol("ABCUSDT").is_none());
    }

    #[tokio::test]
    async fn update_targets_replaces_ladder_over_remaining() {
        let config = BotConfig::default();
        let f = fixture(config.clone());
        let validated = long_validated(&config, &f.info);

        let outcome =
            f.trader.execute(&validated, &f.info, 10_000.0, 0.0, 1.0).await.unwrap();
        let mut position = match outcome {
            TradeOutcome::Opened(p) => p,
            other => panic!("expected Opened, got {other}"),
        };
        let old_stop_id = position.stop_order_id;

        f.trader
            .update_targets(&mut position, 97.0, &[105.0, 110.0], &f.info)
            .await
            .unwrap();

        assert_eq!(position.targets.len(), 2);
        assert!((position.targets[0].price - 105.0).abs() < 1e-9);
        assert!((position.stop_loss - 97.0).abs() < 1e-9);
        assert_ne!(position.stop_order_id, old_stop_id);
        assert!((position.entry_price - 100.0).abs() < 1e-9); // untouched

        let ladder: f64 = position.targets.iter().map(|t| t.quantity).sum();
        assert!((ladder - position.remaining_quantity).abs() < 1e-9);
    }
}
