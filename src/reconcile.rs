// =============================================================================
// Reconciliation — detect positions closed outside the bot
// =============================================================================
//
// Compares the store's open positions against the exchange's position risk.
// A local Open/PartialClosed position with no exchange counterpart was
// flattened externally: liquidated when the mark has crossed the liquidation
// estimate, manually closed otherwise. Either way the local record is closed
// through the manager so statistics and cooldown stay truthful.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::controller::BotController;
use crate::exchange::{ExchangeClient, ExchangePosition};
use crate::manager::PositionManager;
use crate::position::{Position, PositionStatus};
use crate::store::PositionStore;
use crate::types::{CloseReason, Direction};

/// Seconds between reconciliation passes.
const RECONCILE_INTERVAL_SECS: u64 = 60;

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileSummary {
    pub positions_matched: u32,
    pub positions_closed: u32,
    pub timestamp: String,
}

/// Run one reconciliation cycle.
pub async fn reconcile_once(
    client: &dyn ExchangeClient,
    store: &PositionStore,
    manager: &PositionManager,
) -> Result<ReconcileSummary> {
    let now = Utc::now().to_rfc3339();

    let exchange_positions = client
        .position_risk()
        .await
        .context("reconcile: failed to fetch position risk")?;

    let by_symbol: HashMap<&str, &ExchangePosition> =
        exchange_positions.iter().map(|p| (p.symbol.as_str(), p)).collect();

    let mut matched: u32 = 0;
    let mut closed: u32 = 0;

    for position in store.list_open() {
        // Pending/Opening positions have no exchange footprint yet.
        if !matches!(position.status, PositionStatus::Open | PositionStatus::PartialClosed) {
            continue;
        }

        match by_symbol.get(position.symbol.as_str()) {
            Some(exchange_pos) if exchange_pos.quantity != 0.0 => {
                matched += 1;
                debug!(
                    symbol = %position.symbol,
                    local_qty = position.remaining_quantity,
                    exchange_qty = exchange_pos.quantity,
                    "position matched on exchange"
                );
            }
            _ => {
                let (reason, exit_price) = classify_disappearance(client, &position).await;
                warn!(
                    symbol = %position.symbol,
                    reason = %reason,
                    "local position missing on exchange — closing locally"
                );
                manager.close_externally(&position.id, reason, exit_price).await?;
                closed += 1;
            }
        }
    }

    let summary =
        ReconcileSummary { positions_matched: matched, positions_closed: closed, timestamp: now };

    if closed > 0 {
        info!(
            matched = summary.positions_matched,
            closed = summary.positions_closed,
            "reconciliation cycle completed with external closes"
        );
    } else {
        debug!(matched = summary.positions_matched, "reconciliation cycle completed");
    }

    Ok(summary)
}

/// Liquidation when the mark has crossed the liquidation estimate, manual
/// close otherwise. The mark also serves as the best available exit price.
async fn classify_disappearance(
    client: &dyn ExchangeClient,
    position: &Position,
) -> (CloseReason, f64) {
    let mark = client.mark_price(&position.symbol).await.unwrap_or(0.0);

    if position.liquidation_price > 0.0 && mark > 0.0 {
        let beyond_liquidation = match position.direction {
            Direction::Long => mark <= position.liquidation_price,
            Direction::Short => mark >= position.liquidation_price,
        };
        if beyond_liquidation {
            return (CloseReason::Liquidation, position.liquidation_price);
        }
    }

    (CloseReason::ManualClose, mark)
}

/// Periodic reconciliation task. Paused and EmergencyStop modes skip the
/// pass; crash-equivalent state on the exchange is safe to leave alone.
pub async fn run_reconcile_loop(
    client: Arc<dyn ExchangeClient>,
    store: Arc<PositionStore>,
    manager: Arc<PositionManager>,
    controller: Arc<BotController>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(RECONCILE_INTERVAL_SECS));
    info!(interval_secs = RECONCILE_INTERVAL_SECS, "reconcile loop started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {
                if !controller.can_manage_positions() {
                    continue;
                }
                if let Err(e) = reconcile_once(client.as_ref(), &store, &manager).await {
                    warn!(error = %e, "reconciliation failed");
                }
            }
        }
    }

    info!("reconcile loop stopped");
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CooldownPolicy;
    use crate::cooldown::CooldownController;
    use crate::exchange::mock::MockExchange;
    use crate::statistics::StatisticsStore;
    use crate::telegram::Notifier;

    struct Fixture {
        exchange: Arc<MockExchange>,
        store: Arc<PositionStore>,
        manager: PositionManager,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let exchange = Arc::new(MockExchange::new());
        let store = Arc::new(PositionStore::open(dir.path().join("positions.json")).unwrap());
        let stats = Arc::new(StatisticsStore::open(dir.path().join("statistics.json")).unwrap());
        let cooldown = Arc::new(CooldownController::new(CooldownPolicy::default()));
        let manager = PositionManager::new(
            exchange.clone(),
            store.clone(),
            stats,
            cooldown,
            Notifier::disabled(),
        );
        Fixture { exchange, store, manager, _dir: dir }
    }

    fn open_position(store: &PositionStore, symbol: &str, liq: f64) -> Position {
        let mut pos = Position::pending("sig", symbol, Direction::Long, 100.0, 95.0, liq, 10);
        pos.entry_price = 100.0;
        pos.initial_quantity = 5.0;
        pos.remaining_quantity = 5.0;
        pos.status = PositionStatus::Open;
        store.save(&pos).unwrap();
        pos
    }

    #[tokio::test]
    async fn matched_positions_are_left_alone() {
        let f = fixture();
        let pos = open_position(&f.store, "BTCUSDT", 90.0);

        f.exchange.set_positions(vec![ExchangePosition {
            symbol: "BTCUSDT".into(),
            quantity: 5.0,
            entry_price: 100.0,
            mark_price: 101.0,
        }]);
        f.exchange.set_mark_price("BTCUSDT", 101.0);

        let summary = reconcile_once(f.exchange.as_ref(), &f.store, &f.manager).await.unwrap();
        assert_eq!(summary.positions_matched, 1);
        assert_eq!(summary.positions_closed, 0);
        assert_eq!(f.store.get(&pos.id).unwrap().status, PositionStatus::Open);
    }

    #[tokio::test]
    async fn vanished_position_closes_as_manual() {
        let f = fixture();
        let pos = open_position(&f.store, "BTCUSDT", 90.0);
        f.exchange.set_mark_price("BTCUSDT", 101.0); // well above liq

        let summary = reconcile_once(f.exchange.as_ref(), &f.store, &f.manager).await.unwrap();
        assert_eq!(summary.positions_closed, 1);

        let closed = f.store.get(&pos.id).unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::ManualClose));
    }

    #[tokio::test]
    async fn vanished_position_beyond_liq_closes_as_liquidation() {
        let f = fixture();
        let pos = open_position(&f.store, "BTCUSDT", 90.0);
        f.exchange.set_mark_price("BTCUSDT", 89.5); // below liq estimate

        reconcile_once(f.exchange.as_ref(), &f.store, &f.manager).await.unwrap();

        let closed = f.store.get(&pos.id).unwrap();
        assert_eq!(closed.close_reason, Some(CloseReason::Liquidation));
        assert!(closed.realized_pnl < 0.0);
    }

    #[tokio::test]
    async fn pending_positions_are_skipped() {
        let f = fixture();
        let pos = Position::pending("sig", "ETHUSDT", Direction::Long, 100.0, 95.0, 90.0, 10);
        f.store.save(&pos).unwrap();

        let summary = reconcile_once(f.exchange.as_ref(), &f.store, &f.manager).await.unwrap();
        assert_eq!(summary.positions_closed, 0);
        assert_eq!(f.store.get(&pos.id).unwrap().status, PositionStatus::Pending);
    }
}
