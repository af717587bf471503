// =============================================================================
// Signal Runner — the top-level pipeline from raw message to live position
// =============================================================================
//
// One signal is processed at a time under a process-wide lock; the gate chain
// short-circuits in a fixed order: operating mode, cooldown, concurrency cap,
// same-symbol duplicate handling. Order-update events are consumed on a
// separate task outside that lock and serialize per position through the
// store.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::catalog::SymbolCatalog;
use crate::config::{BotConfig, OppositeDirectionAction, SameDirectionAction};
use crate::controller::BotController;
use crate::cooldown::CooldownController;
use crate::exchange::{ExchangeClient, OrderUpdate, SymbolInfo};
use crate::manager::PositionManager;
use crate::position::Position;
use crate::signal::validator::{validate, ValidatedSignal};
use crate::signal::{ParserRegistry, Signal};
use crate::statistics::StatisticsStore;
use crate::store::PositionStore;
use crate::telegram::Notifier;
use crate::trader::{TradeOutcome, Trader};
use crate::types::{CloseReason, OperatingMode};

pub struct SignalRunner {
    config: Arc<BotConfig>,
    client: Arc<dyn ExchangeClient>,
    catalog: Arc<SymbolCatalog>,
    store: Arc<PositionStore>,
    stats: Arc<StatisticsStore>,
    cooldown: Arc<CooldownController>,
    controller: Arc<BotController>,
    trader: Arc<Trader>,
    manager: Arc<PositionManager>,
    registry: ParserRegistry,
    notifier: Notifier,
    /// Enforces the single-processing-cycle invariant.
    processing_lock: tokio::sync::Mutex<()>,
    /// Last accepted-for-processing time per symbol, for the duplicate
    /// minimum-interval rule.
    last_seen: Mutex<HashMap<String, DateTime<Utc>>>,
    /// Process start, anchoring the session-loss emergency check.
    started_at: DateTime<Utc>,
}

impl SignalRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<BotConfig>,
        client: Arc<dyn ExchangeClient>,
        catalog: Arc<SymbolCatalog>,
        store: Arc<PositionStore>,
        stats: Arc<StatisticsStore>,
        cooldown: Arc<CooldownController>,
        controller: Arc<BotController>,
        trader: Arc<Trader>,
        manager: Arc<PositionManager>,
        notifier: Notifier,
    ) -> Self {
        let registry = ParserRegistry::from_config(&config.parsers, &config.quote_suffix_signal);
        Self {
            config,
            client,
            catalog,
            store,
            stats,
            cooldown,
            controller,
            trader,
            manager,
            registry,
            notifier,
            processing_lock: tokio::sync::Mutex::new(()),
            last_seen: Mutex::new(HashMap::new()),
            started_at: Utc::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Intake loops
    // -------------------------------------------------------------------------

    /// Consume raw (text, channel) pairs from the chat listener.
    pub async fn run_signal_loop(self: Arc<Self>, mut rx: mpsc::Receiver<(String, String)>) {
        info!(parsers = self.registry.len(), "signal loop started");
        while let Some((text, channel)) = rx.recv().await {
            self.handle_raw_message(&text, &channel).await;
        }
        info!("signal loop stopped");
    }

    /// Consume order updates from the user-data stream.
    pub async fn run_event_loop(self: Arc<Self>, mut rx: mpsc::Receiver<OrderUpdate>) {
        info!("event loop started");
        while let Some(update) = rx.recv().await {
            if !self.controller.can_manage_positions() {
                debug!(
                    symbol = %update.symbol,
                    mode = %self.controller.mode(),
                    "order update ignored — position management disabled"
                );
                continue;
            }

            match self.manager.handle_order_update(&update).await {
                Ok(true) => self.check_emergency_loss().await,
                Ok(false) => {}
                Err(e) => {
                    error!(symbol = %update.symbol, error = %e, "order update handling failed");
                    self.notifier.send(format!("Event handling error on {}: {e}", update.symbol));
                }
            }
        }
        info!("event loop stopped");
    }

    /// Parse one raw message and run the pipeline when it is a signal.
    pub async fn handle_raw_message(&self, text: &str, channel: &str) {
        let Some(signal) = self.registry.dispatch(text, channel) else {
            return;
        };
        self.process_signal(signal).await;
    }

    // -------------------------------------------------------------------------
    // The pipeline
    // -------------------------------------------------------------------------

    /// Run one signal through normalization, the gates, validation, and the
    /// trader. Failures never escape the lock boundary.
    pub async fn process_signal(&self, mut signal: Signal) {
        let _guard = self.processing_lock.lock().await;

        // ── Symbol normalization ─────────────────────────────────────────
        let normalized = self.catalog.normalize(
            &signal.symbol,
            &self.config.quote_suffix_signal,
            &self.config.quote_suffix_execution,
        );
        if normalized != signal.symbol {
            debug!(from = %signal.symbol, to = %normalized, "symbol normalized");
            signal.symbol = normalized;
        }

        let Some(info) = self.catalog.resolve(self.client.as_ref(), &signal.symbol).await else {
            info!(symbol = %signal.symbol, "signal rejected — symbol not tradable");
            self.notifier.send(format!("Signal rejected: {} is not tradable", signal.symbol));
            return;
        };

        // ── Gate chain (fixed order, short-circuit) ──────────────────────
        if !self.controller.can_accept_new_signals() {
            info!(
                symbol = %signal.symbol,
                mode = %self.controller.mode(),
                "signal rejected — bot not accepting signals"
            );
            return;
        }

        if let Some((reason, until)) = self.cooldown.in_cooldown() {
            info!(symbol = %signal.symbol, reason = %reason, until = %until, "signal rejected — cooldown");
            self.notifier.send(format!(
                "Signal on {} skipped: cooling down until {} ({reason})",
                signal.symbol,
                until.format("%H:%M:%S UTC")
            ));
            return;
        }

        let existing = self.store.get_by_symbol(&signal.symbol);

        if existing.is_none()
            && self.store.open_count() >= self.config.max_concurrent_positions as usize
        {
            info!(
                symbol = %signal.symbol,
                open = self.store.open_count(),
                "signal rejected — concurrent position cap"
            );
            return;
        }

        if let Some(existing) = existing {
            self.handle_duplicate(signal, existing, &info).await;
            return;
        }

        self.touch(&signal.symbol);

        // ── Balance, validation, execution ───────────────────────────────
        let Some((validated, equity)) = self.validate_with_balance(&signal, &info).await else {
            return;
        };
        self.execute(&validated, &info, equity).await;
    }

    /// Fetch equity and validate; reports failures to the notifier.
    async fn validate_with_balance(
        &self,
        signal: &Signal,
        info: &SymbolInfo,
    ) -> Option<(ValidatedSignal, f64)> {
        let equity = match self.client.balance(&self.config.quote_suffix_execution).await {
            Ok(b) if b > 0.0 => b,
            Ok(_) => {
                warn!(symbol = %signal.symbol, "zero balance — signal dropped");
                self.notifier.send("Signal dropped: account balance is zero".to_string());
                return None;
            }
            Err(e) => {
                error!(symbol = %signal.symbol, error = %e, "balance fetch failed");
                self.notifier.send(format!("Signal on {} dropped: balance fetch failed", signal.symbol));
                return None;
            }
        };

        match validate(signal, info, &self.config.risk) {
            Ok(validated) => {
                for warning in &validated.warnings {
                    warn!(symbol = %signal.symbol, warning = %warning, "validation warning");
                }
                Some((validated, equity))
            }
            Err(e) => {
                info!(symbol = %signal.symbol, error = %e, "signal failed validation");
                self.notifier.send(format!("Signal on {} invalid: {e}", signal.symbol));
                None
            }
        }
    }

    async fn execute(&self, validated: &ValidatedSignal, info: &SymbolInfo, equity: f64) {
        let exposure: f64 = self
            .store
            .list_open()
            .iter()
            .map(|p| p.remaining_quantity * p.entry_price)
            .sum();
        let multiplier = self.cooldown.size_multiplier();

        match self.trader.execute(validated, info, equity, exposure, multiplier).await {
            Ok(TradeOutcome::Opened(position)) => {
                info!(
                    symbol = %position.symbol,
                    id = %position.id,
                    "signal executed — position open"
                );
            }
            Ok(outcome) => {
                info!(symbol = %validated.signal.symbol, outcome = %outcome, "signal not executed");
            }
            Err(e) => {
                // Persistence faults: stop mutating, make noise.
                error!(symbol = %validated.signal.symbol, error = %e, "trade execution fault");
                self.notifier
                    .send(format!("FAULT executing signal on {}: {e}", validated.signal.symbol));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Duplicate handling
    // -------------------------------------------------------------------------

    async fn handle_duplicate(&self, signal: Signal, existing: Position, info: &SymbolInfo) {
        let policy = &self.config.duplicates;

        // Rapid-fire duplicates are dropped regardless of the action.
        if let Some(last) = self.last_seen.lock().get(&signal.symbol).copied() {
            let min_gap = Duration::seconds(policy.min_seconds_between as i64);
            if Utc::now() - last < min_gap {
                info!(symbol = %signal.symbol, "duplicate signal too soon — dropped");
                return;
            }
        }
        self.touch(&signal.symbol);

        let same_direction = signal.direction == existing.direction;

        if same_direction {
            match policy.same_direction {
                SameDirectionAction::Ignore => {
                    info!(symbol = %signal.symbol, "duplicate same-direction signal ignored");
                }
                SameDirectionAction::OpenNew => {
                    // The store tracks one active position per symbol, so the
                    // per-symbol cap saturates at one.
                    info!(
                        symbol = %signal.symbol,
                        cap = policy.max_positions_per_symbol,
                        "per-symbol position cap reached — duplicate dropped"
                    );
                }
                SameDirectionAction::UpdateTargets => {
                    let Some((validated, _)) = self.validate_with_balance(&signal, info).await
                    else {
                        return;
                    };
                    let mut position = existing;
                    if let Err(e) = self
                        .trader
                        .update_targets(
                            &mut position,
                            validated.stop_loss,
                            &validated.signal.targets,
                            info,
                        )
                        .await
                    {
                        error!(symbol = %signal.symbol, error = %e, "target update failed");
                        self.notifier.send(format!("Target update on {} failed: {e}", signal.symbol));
                    } else {
                        self.notifier.send(format!(
                            "Targets on {} replaced from new signal",
                            signal.symbol
                        ));
                    }
                }
                SameDirectionAction::CloseAndReopen => {
                    let mut position = existing;
                    if let Err(e) = self.trader.flatten(&mut position, CloseReason::ManualClose).await
                    {
                        error!(symbol = %signal.symbol, error = %e, "close-and-reopen flatten failed");
                        return;
                    }
                    let Some((validated, equity)) = self.validate_with_balance(&signal, info).await
                    else {
                        return;
                    };
                    self.execute(&validated, info, equity).await;
                }
            }
        } else {
            match policy.opposite_direction {
                OppositeDirectionAction::Ignore => {
                    info!(symbol = %signal.symbol, "opposite-direction signal ignored");
                }
                OppositeDirectionAction::CloseOnly => {
                    let mut position = existing;
                    if let Err(e) =
                        self.trader.flatten(&mut position, CloseReason::OppositeSignal).await
                    {
                        error!(symbol = %signal.symbol, error = %e, "close-only flatten failed");
                    }
                }
                OppositeDirectionAction::Reverse => {
                    let mut position = existing;
                    if let Err(e) =
                        self.trader.flatten(&mut position, CloseReason::OppositeSignal).await
                    {
                        error!(symbol = %signal.symbol, error = %e, "reverse flatten failed");
                        return;
                    }
                    let Some((validated, equity)) = self.validate_with_balance(&signal, info).await
                    else {
                        return;
                    };
                    self.execute(&validated, info, equity).await;
                }
            }
        }
    }

    fn touch(&self, symbol: &str) {
        self.last_seen.lock().insert(symbol.to_string(), Utc::now());
    }

    // -------------------------------------------------------------------------
    // Emergency paths
    // -------------------------------------------------------------------------

    /// Flip to EmergencyStop; flattens everything when the policy says so.
    /// Returns the number of positions closed.
    pub async fn enter_emergency_stop(&self, reason: &str) -> usize {
        warn!(reason, "ENTERING EMERGENCY STOP");
        self.controller.set_mode(OperatingMode::EmergencyStop);
        self.notifier.send(format!("EMERGENCY STOP: {reason}"));

        if self.config.emergency.close_all_on_emergency {
            self.close_all_positions().await
        } else {
            0
        }
    }

    /// Flatten every open position at market. Returns how many closed.
    pub async fn close_all_positions(&self) -> usize {
        let open = self.store.list_open();
        let mut closed = 0;

        for mut position in open {
            match self.trader.flatten(&mut position, CloseReason::ManualClose).await {
                Ok(()) => closed += 1,
                Err(e) => {
                    error!(symbol = %position.symbol, error = %e, "close-all flatten failed");
                }
            }
        }

        info!(closed, "close-all finished");
        closed
    }

    /// Flatten the open position on one symbol, if any.
    pub async fn close_symbol(&self, symbol: &str) -> anyhow::Result<bool> {
        let Some(mut position) = self.store.get_by_symbol(symbol) else {
            return Ok(false);
        };
        self.trader.flatten(&mut position, CloseReason::ManualClose).await?;
        Ok(true)
    }

    /// After a close, trip the emergency breaker when the rolling 24h or the
    /// session realized loss exceeds its configured share of equity.
    async fn check_emergency_loss(&self) {
        if self.controller.mode() == OperatingMode::EmergencyStop {
            return;
        }

        let daily_pnl = self.stats.summary("24h").map(|s| s.realized_pnl).unwrap_or(0.0);
        let session_pnl = self.stats.realized_since(self.started_at);
        if daily_pnl >= 0.0 && session_pnl >= 0.0 {
            return;
        }

        let equity = match self.client.balance(&self.config.quote_suffix_execution).await {
            Ok(b) if b > 0.0 => b,
            _ => return,
        };

        let daily_loss_pct = (-daily_pnl).max(0.0) / equity * 100.0;
        if daily_loss_pct >= self.config.emergency.max_daily_loss_percent {
            warn!(
                loss_pct = daily_loss_pct,
                limit = self.config.emergency.max_daily_loss_percent,
                "daily loss limit breached"
            );
            self.enter_emergency_stop(&format!(
                "daily loss {daily_loss_pct:.2}% breached the {:.2}% limit",
                self.config.emergency.max_daily_loss_percent
            ))
            .await;
            return;
        }

        let session_loss_pct = (-session_pnl).max(0.0) / equity * 100.0;
        if session_loss_pct >= self.config.emergency.max_session_loss_percent {
            warn!(
                loss_pct = session_loss_pct,
                limit = self.config.emergency.max_session_loss_percent,
                "session loss limit breached"
            );
            self.enter_emergency_stop(&format!(
                "session loss {session_loss_pct:.2}% breached the {:.2}% limit",
                self.config.emergency.max_session_loss_percent
            ))
            .await;
        }
    }
}
