// =============================================================================
// Position Manager — applies order-update events to open positions
// =============================================================================
//
// Routing is by order id against the position's recorded stop and take-profit
// ids. Entry and compensating fills are handled inline by the trader and are
// deliberately unroutable here.
//
// Stop migration is cancel-then-replace and explicitly not transactional: the
// brief unprotected window is tolerated because the alternative (new stop
// first, old stop second) risks two live stops triggering together.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::cooldown::CooldownController;
use crate::exchange::{ExchangeClient, OrderSide, OrderUpdate, OrderUpdateStatus};
use crate::position::{Position, PositionStatus};
use crate::statistics::StatisticsStore;
use crate::store::PositionStore;
use crate::telegram::Notifier;
use crate::types::CloseReason;

/// Quantities below this count as fully closed (step-size rounding noise).
const QTY_EPSILON: f64 = 1e-9;

pub struct PositionManager {
    client: Arc<dyn ExchangeClient>,
    store: Arc<PositionStore>,
    stats: Arc<StatisticsStore>,
    cooldown: Arc<CooldownController>,
    notifier: Notifier,
}

impl PositionManager {
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        store: Arc<PositionStore>,
        stats: Arc<StatisticsStore>,
        cooldown: Arc<CooldownController>,
        notifier: Notifier,
    ) -> Self {
        Self { client, store, stats, cooldown, notifier }
    }

    // -------------------------------------------------------------------------
    // Event entry point
    // -------------------------------------------------------------------------

    /// Apply one order-update event. Returns true when the event closed a
    /// position (the caller runs its emergency checks on closes).
    pub async fn handle_order_update(&self, update: &OrderUpdate) -> Result<bool> {
        if update.status != OrderUpdateStatus::Filled {
            return Ok(false);
        }

        let Some(mut position) = self.store.get_by_symbol(&update.symbol) else {
            debug!(symbol = %update.symbol, order_id = update.order_id, "fill for untracked symbol");
            return Ok(false);
        };

        if !matches!(position.status, PositionStatus::Open | PositionStatus::PartialClosed) {
            debug!(
                symbol = %update.symbol,
                status = %position.status,
                "fill for position not yet under management"
            );
            return Ok(false);
        }

        if position.stop_order_id == Some(update.order_id) {
            self.on_stop_filled(&mut position, update).await?;
            return Ok(true);
        }

        if let Some(index) = position.target_index_for_order(update.order_id) {
            return self.on_target_filled(&mut position, index, update).await;
        }

        debug!(
            symbol = %update.symbol,
            order_id = update.order_id,
            "fill does not match stop or take-profit ids — ignored"
        );
        Ok(false)
    }

    // -------------------------------------------------------------------------
    // Stop fill: full close of the remainder
    // -------------------------------------------------------------------------

    async fn on_stop_filled(&self, position: &mut Position, update: &OrderUpdate) -> Result<()> {
        // The stop consumed the position; the resting take-profits must go.
        for (target, slot) in position.targets.iter().zip(&position.take_profit_order_ids) {
            if target.hit {
                continue;
            }
            if let Some(tp_id) = slot {
                if let Err(e) = self.client.cancel_order(&position.symbol, *tp_id).await {
                    warn!(
                        symbol = %position.symbol,
                        order_id = tp_id,
                        error = %e,
                        "take-profit cancel failed after stop fill"
                    );
                }
            }
        }

        let exit_price =
            if update.average_price > 0.0 { update.average_price } else { position.stop_loss };
        let qty = position.remaining_quantity;

        position.realized_pnl += position.slice_pnl(exit_price, qty);
        position.mark_closed(CloseReason::StopLossHit);
        self.store.save(position)?;
        self.archive(position);

        info!(
            symbol = %position.symbol,
            exit = exit_price,
            qty,
            pnl = position.realized_pnl,
            "stop-loss filled — position closed"
        );
        self.notifier.send(format!(
            "Stop hit on {} {} (pnl {:.2})",
            position.direction, position.symbol, position.realized_pnl
        ));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Target fill: partial exit and stop migration
    // -------------------------------------------------------------------------

    async fn on_target_filled(
        &self,
        position: &mut Position,
        index: usize,
        update: &OrderUpdate,
    ) -> Result<bool> {
        if position.targets[index].hit {
            debug!(
                symbol = %position.symbol,
                target = index,
                "duplicate target fill ignored"
            );
            return Ok(false);
        }

        let (closed_qty, fill_price, move_stop_to) = {
            let target = &mut position.targets[index];
            let fill_price =
                if update.average_price > 0.0 { update.average_price } else { target.price };
            target.hit = true;
            target.hit_at = Some(Utc::now());
            target.fill_price = Some(fill_price);
            (target.quantity, fill_price, target.move_stop_to)
        };

        position.remaining_quantity -= closed_qty;
        if position.remaining_quantity < QTY_EPSILON {
            position.remaining_quantity = 0.0;
        }
        position.realized_pnl += position.slice_pnl(fill_price, closed_qty);

        info!(
            symbol = %position.symbol,
            target = index,
            fill = fill_price,
            closed_qty,
            remaining = position.remaining_quantity,
            "take-profit filled"
        );

        let closed = if position.remaining_quantity == 0.0 {
            position.mark_closed(CloseReason::AllTargetsHit);
            self.store.save(position)?;
            self.archive(position);
            self.notifier.send(format!(
                "All targets hit on {} {} (pnl {:.2})",
                position.direction, position.symbol, position.realized_pnl
            ));
            true
        } else {
            if let Some(new_stop) = move_stop_to {
                self.migrate_stop(position, new_stop).await;
            }
            position.status = PositionStatus::PartialClosed;
            self.store.save(position)?;
            false
        };

        Ok(closed)
    }

    /// Cancel-then-replace stop migration. When the replacement fails the
    /// recorded stop fields are kept and the failure is logged; the next
    /// migration or the reconciler picks the position up.
    async fn migrate_stop(&self, position: &mut Position, new_stop: f64) {
        if let Some(old_id) = position.stop_order_id {
            if let Err(e) = self.client.cancel_order(&position.symbol, old_id).await {
                warn!(
                    symbol = %position.symbol,
                    order_id = old_id,
                    error = %e,
                    "old stop cancel failed during migration"
                );
            }
        }

        let exit_side = OrderSide::exit(position.direction);
        match self
            .client
            .place_stop_loss(&position.symbol, exit_side, position.remaining_quantity, new_stop, true)
            .await
        {
            Ok(order) => {
                info!(
                    symbol = %position.symbol,
                    from = position.stop_loss,
                    to = new_stop,
                    order_id = order.order_id,
                    "stop migrated"
                );
                position.stop_loss = new_stop;
                position.stop_order_id = Some(order.order_id);
            }
            Err(e) => {
                warn!(
                    symbol = %position.symbol,
                    to = new_stop,
                    error = %e,
                    "stop migration failed — keeping previous stop"
                );
            }
        }
    }

    // -------------------------------------------------------------------------
    // External closes (reconciliation)
    // -------------------------------------------------------------------------

    /// Close a position that vanished on the exchange (manual flatten or
    /// liquidation observed by the reconciler).
    pub async fn close_externally(
        &self,
        position_id: &str,
        reason: CloseReason,
        exit_price: f64,
    ) -> Result<()> {
        let Some(mut position) = self.store.get(position_id) else {
            anyhow::bail!("position {position_id} not found");
        };
        if !position.status.is_active() {
            return Ok(());
        }

        // Best-effort cleanup of any protective orders still resting.
        if let Some(stop_id) = position.stop_order_id {
            let _ = self.client.cancel_order(&position.symbol, stop_id).await;
        }
        for slot in position.take_profit_order_ids.iter().flatten() {
            let _ = self.client.cancel_order(&position.symbol, *slot).await;
        }

        let qty = position.remaining_quantity;
        let exit = if exit_price > 0.0 { exit_price } else { position.entry_price };
        position.realized_pnl += position.slice_pnl(exit, qty);
        position.mark_closed(reason);
        self.store.save(&position)?;
        self.archive(&position);

        warn!(
            symbol = %position.symbol,
            reason = %reason,
            exit,
            pnl = position.realized_pnl,
            "position closed externally"
        );
        self.notifier.send(format!(
            "{} position on {} closed externally ({reason}, pnl {:.2})",
            position.direction, position.symbol, position.realized_pnl
        ));
        Ok(())
    }

    fn archive(&self, position: &Position) {
        if let Err(e) = self.stats.record_close(position) {
            warn!(position_id = %position.id, error = %e, "failed to archive closed position");
        }
        if let Some(reason) = position.close_reason {
            self.cooldown.on_position_closed(reason);
        }
    }
}
