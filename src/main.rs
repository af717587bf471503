// =============================================================================
// SignalBot — Main Entry Point
// =============================================================================
//
// Explicit constructor wiring: configuration selects the concrete exchange
// client, every component receives its dependencies here, and the background
// tasks talk over channels. The bot starts in the configured operating mode
// (Paused by default) and the operator resumes via the command surface.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod catalog;
mod config;
mod controller;
mod cooldown;
mod exchange;
mod manager;
mod position;
mod reconcile;
mod runner;
mod signal;
mod sizing;
mod statistics;
mod store;
mod telegram;
mod trader;
mod types;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::catalog::SymbolCatalog;
use crate::config::BotConfig;
use crate::controller::BotController;
use crate::cooldown::CooldownController;
use crate::exchange::binance::BinanceFuturesClient;
use crate::exchange::ExchangeClient;
use crate::manager::PositionManager;
use crate::runner::SignalRunner;
use crate::statistics::StatisticsStore;
use crate::store::PositionStore;
use crate::telegram::{CommandContext, Notifier, TelegramBot};
use crate::trader::Trader;

const CONFIG_PATH: &str = "signalbot_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║              SignalBot — Starting Up                     ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = Arc::new(BotConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        BotConfig::default()
    }));

    info!(
        operating_mode = %config.operating_mode,
        parsers = ?config.parsers,
        sizing_mode = ?config.sizing.mode,
        "configuration active"
    );

    // ── 2. Exchange client ───────────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let binance = Arc::new(BinanceFuturesClient::new(api_key, api_secret));
    let client: Arc<dyn ExchangeClient> = binance.clone();

    match client.test_connectivity().await {
        Ok(true) => info!("exchange connectivity verified"),
        Ok(false) => warn!("exchange ping returned a non-success status"),
        Err(e) => warn!(error = %e, "exchange unreachable at startup — continuing"),
    }

    // ── 3. Symbol catalog ────────────────────────────────────────────────
    let catalog = Arc::new(SymbolCatalog::new());
    if catalog.load(client.as_ref()).await.is_err() {
        warn!("running with degraded symbol catalog — symbols verified on first use");
    }

    // ── 4. State stores ──────────────────────────────────────────────────
    let state_dir = Path::new(&config.state_dir);
    let store = Arc::new(PositionStore::open(state_dir.join("positions.json"))?);
    let stats = Arc::new(StatisticsStore::open(state_dir.join("statistics.json"))?);

    let resumed = store.open_count();
    if resumed > 0 {
        info!(count = resumed, "resuming with open positions from previous session");
    }

    // ── 5. Controllers ───────────────────────────────────────────────────
    let cooldown = Arc::new(CooldownController::new(config.cooldown.clone()));
    let controller = Arc::new(BotController::new(config.operating_mode));

    // ── 6. Channels ──────────────────────────────────────────────────────
    let (signal_tx, signal_rx) = mpsc::channel::<(String, String)>(64);
    let (update_tx, update_rx) = mpsc::channel::<exchange::OrderUpdate>(256);
    let (notify_tx, notify_rx) = mpsc::unbounded_channel::<String>();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let telegram_token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
    let telegram_active = config.telegram.enabled && !telegram_token.is_empty();
    let notifier =
        if telegram_active { Notifier::new(notify_tx) } else { Notifier::disabled() };

    // ── 7. Core components ───────────────────────────────────────────────
    let trader = Arc::new(Trader::new(
        config.clone(),
        client.clone(),
        store.clone(),
        stats.clone(),
        cooldown.clone(),
        notifier.clone(),
    ));
    let manager = Arc::new(PositionManager::new(
        client.clone(),
        store.clone(),
        stats.clone(),
        cooldown.clone(),
        notifier.clone(),
    ));
    let runner = Arc::new(SignalRunner::new(
        config.clone(),
        client.clone(),
        catalog.clone(),
        store.clone(),
        stats.clone(),
        cooldown.clone(),
        controller.clone(),
        trader,
        manager.clone(),
        notifier.clone(),
    ));

    // ── 8. Startup reconciliation ────────────────────────────────────────
    if resumed > 0 {
        match reconcile::reconcile_once(client.as_ref(), &store, &manager).await {
            Ok(summary) => info!(
                matched = summary.positions_matched,
                closed = summary.positions_closed,
                "startup reconciliation done"
            ),
            Err(e) => warn!(error = %e, "startup reconciliation failed"),
        }
    }

    // ── 9. Background tasks ──────────────────────────────────────────────
    tokio::spawn(exchange::user_stream::run_user_stream(
        binance.clone(),
        update_tx,
        shutdown_rx.clone(),
    ));

    tokio::spawn(runner.clone().run_event_loop(update_rx));
    tokio::spawn(runner.clone().run_signal_loop(signal_rx));

    tokio::spawn(reconcile::run_reconcile_loop(
        client.clone(),
        store.clone(),
        manager.clone(),
        controller.clone(),
        shutdown_rx.clone(),
    ));

    if telegram_active {
        let bot = Arc::new(TelegramBot::new(&telegram_token, config.telegram.clone()));
        let commands = Arc::new(CommandContext {
            config: config.clone(),
            controller: controller.clone(),
            store: store.clone(),
            stats: stats.clone(),
            cooldown: cooldown.clone(),
            runner: runner.clone(),
        });

        tokio::spawn(bot.clone().run_notification_loop(notify_rx, shutdown_rx.clone()));
        tokio::spawn(bot.clone().run_update_loop(commands, signal_tx.clone(), shutdown_rx.clone()));
        notifier.send(format!("SignalBot started in {} mode", controller.mode()));
    } else {
        info!("telegram surface disabled — commands and notifications unavailable");
        drop(notify_rx);
    }

    info!("all subsystems running — press Ctrl+C to stop");

    // ── 10. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    // Stop intake first; open positions stay protected on the exchange.
    controller.set_mode(types::OperatingMode::Paused);
    let _ = shutdown_tx.send(true);
    drop(signal_tx);

    // Give in-flight processing a moment to reach a persisted state.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "failed to save config on shutdown");
    }

    info!("SignalBot shut down complete");
    Ok(())
}
