// =============================================================================
// Telegram surface — notifier, command handler, and channel listener
// =============================================================================
//
// One getUpdates long-poll drives both inbound sides: direct-message commands
// from allowlisted operators, and channel posts forwarded into the signal
// pipeline. Outbound notifications travel over an unbounded channel so the
// trading core never blocks on Telegram.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::{BotConfig, TelegramPolicy};
use crate::controller::BotController;
use crate::cooldown::CooldownController;
use crate::runner::SignalRunner;
use crate::statistics::StatisticsStore;
use crate::store::PositionStore;
use crate::types::OperatingMode;

/// Seconds Telegram holds a getUpdates long-poll open.
const POLL_TIMEOUT_SECS: u64 = 30;

/// Delay before re-polling after a transport error.
const POLL_RETRY_SECS: u64 = 5;

// ---------------------------------------------------------------------------
// Notifier
// ---------------------------------------------------------------------------

/// Cheap cloneable handle the trading core uses to emit user-facing messages.
/// A disabled notifier swallows everything.
#[derive(Clone)]
pub struct Notifier {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl Notifier {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, text: impl Into<String>) {
        if let Some(tx) = &self.tx {
            // A closed receiver just means the surface shut down first.
            let _ = tx.send(text.into());
        }
    }
}

// ---------------------------------------------------------------------------
// Bot client
// ---------------------------------------------------------------------------

pub struct TelegramBot {
    client: reqwest::Client,
    base_url: String,
    policy: TelegramPolicy,
}

impl TelegramBot {
    pub fn new(token: &str, policy: TelegramPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("https://api.telegram.org/bot{token}"),
            policy,
        }
    }

    /// Send one message to the configured chat. Failures are logged, never
    /// propagated — notifications are best-effort.
    pub async fn send(&self, text: &str) {
        let body = serde_json::json!({
            "chat_id": self.policy.chat_id,
            "text": text,
        });

        match self.client.post(format!("{}/sendMessage", self.base_url)).json(&body).send().await {
            Ok(resp) if resp.status().is_success() => {
                let preview: String = text.chars().take(80).collect();
                debug!(preview = %preview.replace('\n', " "), "telegram message sent");
            }
            Ok(resp) => warn!(status = %resp.status(), "telegram sendMessage rejected"),
            Err(e) => warn!(error = %e, "telegram sendMessage failed"),
        }
    }

    /// Drain the notification channel into sendMessage calls.
    pub async fn run_notification_loop(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Some(text) => self.send(&text).await,
                        None => break,
                    }
                }
            }
        }
        info!("notification loop stopped");
    }

    /// Long-poll getUpdates: dispatch operator commands and forward signal
    /// channel posts into the pipeline.
    pub async fn run_update_loop(
        self: Arc<Self>,
        commands: Arc<CommandContext>,
        signal_tx: mpsc::Sender<(String, String)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut offset: i64 = 0;
        info!("telegram update loop started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let updates = tokio::select! {
                _ = shutdown.changed() => continue,
                r = self.get_updates(offset) => r,
            };

            let updates = match updates {
                Ok(u) => u,
                Err(e) => {
                    warn!(error = %e, "getUpdates failed — retrying in {POLL_RETRY_SECS}s");
                    tokio::time::sleep(std::time::Duration::from_secs(POLL_RETRY_SECS)).await;
                    continue;
                }
            };

            for update in updates {
                if let Some(id) = update["update_id"].as_i64() {
                    offset = offset.max(id + 1);
                }

                // Operator command in a direct message.
                if let Some(message) = update.get("message") {
                    let from = message["from"]["id"].as_i64().unwrap_or(0);
                    let text = message["text"].as_str().unwrap_or("");
                    if text.is_empty() {
                        continue;
                    }
                    if !self.policy.allowed_user_ids.contains(&from) {
                        warn!(user_id = from, "command from non-allowlisted user ignored");
                        continue;
                    }
                    let reply = commands.handle(text).await;
                    self.send(&reply).await;
                    continue;
                }

                // Signal channel post.
                if let Some(post) = update.get("channel_post") {
                    let chat_id = post["chat"]["id"].as_i64().unwrap_or(0);
                    let text = post["text"].as_str().unwrap_or("");
                    if text.is_empty() || !self.policy.signal_channel_ids.contains(&chat_id) {
                        continue;
                    }
                    if signal_tx.send((text.to_string(), chat_id.to_string())).await.is_err() {
                        // Pipeline gone; nothing left to do here.
                        return;
                    }
                }
            }
        }

        info!("telegram update loop stopped");
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<serde_json::Value>> {
        let url = format!(
            "{}/getUpdates?timeout={POLL_TIMEOUT_SECS}&offset={offset}&allowed_updates=[\"message\",\"channel_post\"]",
            self.base_url
        );

        let resp = self
            .client
            .get(&url)
            .timeout(std::time::Duration::from_secs(POLL_TIMEOUT_SECS + 10))
            .send()
            .await
            .context("getUpdates request failed")?;

        let body: serde_json::Value = resp.json().await.context("getUpdates parse failed")?;

        if body["ok"].as_bool() != Some(true) {
            anyhow::bail!("getUpdates returned ok=false: {}", body);
        }

        Ok(body["result"].as_array().cloned().unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Command handling
// ---------------------------------------------------------------------------

/// Everything the operator commands can reach.
pub struct CommandContext {
    pub config: Arc<BotConfig>,
    pub controller: Arc<BotController>,
    pub store: Arc<PositionStore>,
    pub stats: Arc<StatisticsStore>,
    pub cooldown: Arc<CooldownController>,
    pub runner: Arc<SignalRunner>,
}

impl CommandContext {
    /// Execute one operator command and build the text reply.
    pub async fn handle(&self, text: &str) -> String {
        let mut parts = text.split_whitespace();
        let command = parts.next().unwrap_or("").to_ascii_lowercase();
        let argument = parts.next().map(|s| s.to_uppercase());

        info!(command = %command, "operator command received");

        match command.as_str() {
            "/status" => self.status_reply(),
            "/positions" => self.positions_reply(),
            "/pause" => {
                self.controller.set_mode(OperatingMode::Paused);
                "Paused: new signals and automatic management are off.".to_string()
            }
            "/resume" => {
                self.controller.set_mode(OperatingMode::Automatic);
                "Resumed: accepting signals.".to_string()
            }
            "/stop" => {
                let closed = self.runner.enter_emergency_stop("operator /stop").await;
                format!("EMERGENCY STOP. Positions closed: {closed}.")
            }
            "/closeall" => {
                let closed = self.runner.close_all_positions().await;
                format!("Closed {closed} position(s) at market.")
            }
            "/close" => match argument {
                Some(symbol) => match self.runner.close_symbol(&symbol).await {
                    Ok(true) => format!("Closed {symbol} at market."),
                    Ok(false) => format!("No open position on {symbol}."),
                    Err(e) => format!("Failed to close {symbol}: {e}"),
                },
                None => "Usage: /close <symbol>".to_string(),
            },
            "/resetcooldown" => {
                self.cooldown.force_reset();
                "Cooldown state cleared.".to_string()
            }
            _ => "Commands: /status /positions /pause /resume /closeall /close <symbol> /stop /resetcooldown"
                .to_string(),
        }
    }

    fn status_reply(&self) -> String {
        let mode = self.controller.mode();
        let open = self.store.open_count();
        let cooldown = self.cooldown.snapshot();

        let mut lines = vec![
            format!("Mode: {mode} (since {})", self.controller.changed_at().format("%Y-%m-%d %H:%M UTC")),
            format!("Open positions: {open}/{}", self.config.max_concurrent_positions),
            format!(
                "Cooldown: losses={} wins={} multiplier={:.2}{}",
                cooldown.consecutive_losses,
                cooldown.consecutive_wins,
                cooldown.size_multiplier,
                cooldown
                    .cooldown_until
                    .map(|u| format!(" until {}", u.format("%H:%M:%S UTC")))
                    .unwrap_or_default()
            ),
        ];

        for window in ["24h", "7d", "30d"] {
            if let Some(s) = self.stats.summary(window) {
                lines.push(format!(
                    "{window}: {} trades, {:.0}% wins, pnl {:+.2} (best {:+.2} / worst {:+.2})",
                    s.trades,
                    s.win_rate * 100.0,
                    s.realized_pnl,
                    s.largest_win,
                    s.largest_loss
                ));
            }
        }

        lines.join("\n")
    }

    fn positions_reply(&self) -> String {
        let open = self.store.list_open();
        if open.is_empty() {
            return "No open positions.".to_string();
        }

        open.iter()
            .map(|p| {
                let hit = p.targets.iter().filter(|t| t.hit).count();
                format!(
                    "{} {} qty {:.4} @ {:.6} | stop {:.6} | targets {}/{} | pnl {:+.2}",
                    p.direction,
                    p.symbol,
                    p.remaining_quantity,
                    p.entry_price,
                    p.stop_loss,
                    hit,
                    p.targets.len(),
                    p.realized_pnl
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}
