// =============================================================================
// Bot Configuration — typed policies with atomic save
// =============================================================================
//
// Central configuration hub for SignalBot. Every tunable parameter lives here
// so the bot can be reconfigured without code changes.
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields never
// breaks loading an older config file.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{MarginType, OperatingMode};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_state_dir() -> String {
    "state".to_string()
}

fn default_quote_suffix() -> String {
    "USDT".to_string()
}

fn default_parsers() -> Vec<String> {
    vec!["standard".to_string(), "cornix".to_string(), "compact".to_string()]
}

fn default_max_concurrent_positions() -> u32 {
    3
}

fn default_max_leverage() -> u32 {
    20
}

fn default_safe_distance_fraction() -> f64 {
    0.5
}

fn default_maintenance_buffer() -> f64 {
    0.02
}

fn default_risk_percent() -> f64 {
    1.0
}

fn default_fixed_amount() -> f64 {
    100.0
}

fn default_fixed_margin() -> f64 {
    50.0
}

fn default_fixed_quantity() -> f64 {
    0.01
}

fn default_max_notional() -> f64 {
    5_000.0
}

fn default_max_position_percent() -> f64 {
    20.0
}

fn default_max_total_exposure_percent() -> f64 {
    60.0
}

fn default_max_deviation_percent() -> f64 {
    0.5
}

fn default_limit_ttl_secs() -> u64 {
    300
}

fn default_max_positions_per_symbol() -> u32 {
    1
}

fn default_min_seconds_between_duplicates() -> u64 {
    60
}

fn default_short_cooldown_secs() -> u64 {
    30 * 60
}

fn default_long_cooldown_secs() -> u64 {
    2 * 60 * 60
}

fn default_liquidation_cooldown_secs() -> u64 {
    6 * 60 * 60
}

fn default_long_cooldown_threshold() -> u32 {
    3
}

fn default_loss_multipliers() -> [f64; 3] {
    [0.75, 0.5, 0.25]
}

fn default_wins_to_reset() -> u32 {
    2
}

fn default_max_daily_loss_percent() -> f64 {
    5.0
}

fn default_max_session_loss_percent() -> f64 {
    8.0
}

fn default_target_fractions() -> Vec<f64> {
    vec![0.25, 0.25, 0.25, 0.25]
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

// =============================================================================
// Policy sub-structs
// =============================================================================

/// How the protective stop-loss is chosen during validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopLossMode {
    /// Use the stop published in the signal when it clears the liquidation
    /// buffer; substitute a safe stop otherwise.
    FromSignal,
    /// Always compute the stop from the liquidation distance.
    Calculate,
}

impl Default for StopLossMode {
    fn default() -> Self {
        Self::FromSignal
    }
}

/// Risk policy applied by the signal validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskPolicy {
    /// Hard cap on leverage regardless of what the signal publishes.
    #[serde(default = "default_max_leverage")]
    pub max_leverage: u32,

    /// Take `min(signal leverage, max_leverage)` when true; always
    /// `max_leverage` when false.
    #[serde(default = "default_true")]
    pub use_signal_leverage: bool,

    #[serde(default)]
    pub stop_loss_mode: StopLossMode,

    /// Fraction of the entry-to-liquidation distance at which the computed
    /// safe stop is placed. Must be in (0, 1).
    #[serde(default = "default_safe_distance_fraction")]
    pub safe_distance_fraction: f64,

    /// Maintenance-margin haircut used by the simplified liquidation price.
    #[serde(default = "default_maintenance_buffer")]
    pub maintenance_buffer: f64,

    #[serde(default)]
    pub margin_type: MarginType,
}

impl Default for RiskPolicy {
    fn default() -> Self {
        Self {
            max_leverage: default_max_leverage(),
            use_signal_leverage: true,
            stop_loss_mode: StopLossMode::default(),
            safe_distance_fraction: default_safe_distance_fraction(),
            maintenance_buffer: default_maintenance_buffer(),
            margin_type: MarginType::default(),
        }
    }
}

/// How the position size is derived from a validated signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SizingMode {
    /// Risk a fixed percent of equity between entry and stop.
    RiskPercent,
    /// Fixed notional in quote currency.
    FixedAmount,
    /// Fixed margin; notional = margin * leverage.
    FixedMargin,
    /// Fixed base-asset quantity.
    FixedQuantity,
}

impl Default for SizingMode {
    fn default() -> Self {
        Self::RiskPercent
    }
}

/// Sizing mode plus portfolio-wide limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingPolicy {
    #[serde(default)]
    pub mode: SizingMode,

    /// Percent of equity risked per trade (RiskPercent mode).
    #[serde(default = "default_risk_percent")]
    pub risk_percent: f64,

    /// Fixed notional in quote currency (FixedAmount mode).
    #[serde(default = "default_fixed_amount")]
    pub fixed_amount: f64,

    /// Per-symbol overrides for the fixed notional.
    #[serde(default)]
    pub fixed_amount_overrides: HashMap<String, f64>,

    /// Fixed margin in quote currency (FixedMargin mode).
    #[serde(default = "default_fixed_margin")]
    pub fixed_margin: f64,

    /// Fixed base-asset quantity (FixedQuantity mode).
    #[serde(default = "default_fixed_quantity")]
    pub fixed_quantity: f64,

    /// Absolute cap on a single position's notional.
    #[serde(default = "default_max_notional")]
    pub max_notional: f64,

    /// Cap on a single position as a percent of equity.
    #[serde(default = "default_max_position_percent")]
    pub max_position_percent: f64,

    /// Cap on the sum of all open notionals as a percent of equity.
    #[serde(default = "default_max_total_exposure_percent")]
    pub max_total_exposure_percent: f64,
}

impl Default for SizingPolicy {
    fn default() -> Self {
        Self {
            mode: SizingMode::default(),
            risk_percent: default_risk_percent(),
            fixed_amount: default_fixed_amount(),
            fixed_amount_overrides: HashMap::new(),
            fixed_margin: default_fixed_margin(),
            fixed_quantity: default_fixed_quantity(),
            max_notional: default_max_notional(),
            max_position_percent: default_max_position_percent(),
            max_total_exposure_percent: default_max_total_exposure_percent(),
        }
    }
}

/// What to do when the live mark price has drifted from the signal's planned
/// entry beyond `max_deviation_percent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviationAction {
    /// Cancel the position without touching the exchange.
    Skip,
    /// Enter at market anyway.
    EnterAtMarket,
    /// Declared but not implemented; the trader cancels instead of silently
    /// downgrading to market.
    PlaceLimitAtEntry,
    /// Enter at market and shift every target by the realised entry offset.
    EnterAndAdjustTargets,
}

impl Default for DeviationAction {
    fn default() -> Self {
        Self::Skip
    }
}

/// Entry policy for the trader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryPolicy {
    #[serde(default = "default_max_deviation_percent")]
    pub max_deviation_percent: f64,

    #[serde(default)]
    pub deviation_action: DeviationAction,

    /// TTL for the (unimplemented) limit-at-entry order.
    #[serde(default = "default_limit_ttl_secs")]
    pub limit_ttl_secs: u64,
}

impl Default for EntryPolicy {
    fn default() -> Self {
        Self {
            max_deviation_percent: default_max_deviation_percent(),
            deviation_action: DeviationAction::default(),
            limit_ttl_secs: default_limit_ttl_secs(),
        }
    }
}

/// Action for a new signal on a symbol that already has an open position in
/// the same direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SameDirectionAction {
    Ignore,
    OpenNew,
    UpdateTargets,
    CloseAndReopen,
}

impl Default for SameDirectionAction {
    fn default() -> Self {
        Self::Ignore
    }
}

/// Action for a new signal opposite to an existing open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OppositeDirectionAction {
    Ignore,
    CloseOnly,
    Reverse,
}

impl Default for OppositeDirectionAction {
    fn default() -> Self {
        Self::Ignore
    }
}

/// Duplicate-signal handling policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DuplicatePolicy {
    #[serde(default)]
    pub same_direction: SameDirectionAction,

    #[serde(default)]
    pub opposite_direction: OppositeDirectionAction,

    /// Ceiling for `SameDirectionAction::OpenNew`.
    #[serde(default = "default_max_positions_per_symbol")]
    pub max_positions_per_symbol: u32,

    /// Signals on the same symbol closer together than this are dropped.
    #[serde(default = "default_min_seconds_between_duplicates")]
    pub min_seconds_between: u64,
}

impl Default for DuplicatePolicy {
    fn default() -> Self {
        Self {
            same_direction: SameDirectionAction::default(),
            opposite_direction: OppositeDirectionAction::default(),
            max_positions_per_symbol: default_max_positions_per_symbol(),
            min_seconds_between: default_min_seconds_between_duplicates(),
        }
    }
}

/// Cooldown policy applied after losing trades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownPolicy {
    #[serde(default = "default_short_cooldown_secs")]
    pub short_cooldown_secs: u64,

    #[serde(default = "default_long_cooldown_secs")]
    pub long_cooldown_secs: u64,

    #[serde(default = "default_liquidation_cooldown_secs")]
    pub liquidation_cooldown_secs: u64,

    /// Consecutive losses at which the long cooldown replaces the short one.
    #[serde(default = "default_long_cooldown_threshold")]
    pub long_cooldown_threshold: u32,

    /// Shrink position size after consecutive losses.
    #[serde(default = "default_true")]
    pub reduce_size_after_losses: bool,

    /// Size multipliers for 1, 2, and >= 3 consecutive losses.
    #[serde(default = "default_loss_multipliers")]
    pub loss_multipliers: [f64; 3],

    /// Consecutive full wins required to clear the loss counter.
    #[serde(default = "default_wins_to_reset")]
    pub wins_to_reset: u32,
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self {
            short_cooldown_secs: default_short_cooldown_secs(),
            long_cooldown_secs: default_long_cooldown_secs(),
            liquidation_cooldown_secs: default_liquidation_cooldown_secs(),
            long_cooldown_threshold: default_long_cooldown_threshold(),
            reduce_size_after_losses: true,
            loss_multipliers: default_loss_multipliers(),
            wins_to_reset: default_wins_to_reset(),
        }
    }
}

/// Emergency policy: session-loss circuit breaker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmergencyPolicy {
    /// Realized loss over the last 24h (percent of equity) that flips the bot
    /// to EmergencyStop.
    #[serde(default = "default_max_daily_loss_percent")]
    pub max_daily_loss_percent: f64,

    /// Realized loss since process start (percent of equity) that flips the
    /// bot to EmergencyStop.
    #[serde(default = "default_max_session_loss_percent")]
    pub max_session_loss_percent: f64,

    /// Flatten every open position when entering EmergencyStop.
    #[serde(default = "default_true")]
    pub close_all_on_emergency: bool,
}

impl Default for EmergencyPolicy {
    fn default() -> Self {
        Self {
            max_daily_loss_percent: default_max_daily_loss_percent(),
            max_session_loss_percent: default_max_session_loss_percent(),
            close_all_on_emergency: true,
        }
    }
}

/// Take-profit ladder: fraction of the initial quantity closed at each
/// target, plus the stop-migration flag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetPolicy {
    /// Fraction of initial quantity per target, in target order. When a
    /// signal publishes fewer targets than fractions, the used prefix is
    /// renormalised to sum to 1; with more targets, the split is equal.
    #[serde(default = "default_target_fractions")]
    pub fractions: Vec<f64>,

    /// Migrate the stop to breakeven after target 1 and to the previous
    /// target's price after each later target.
    #[serde(default = "default_true")]
    pub move_stop_on_target: bool,
}

impl Default for TargetPolicy {
    fn default() -> Self {
        Self {
            fractions: default_target_fractions(),
            move_stop_on_target: true,
        }
    }
}

/// Telegram surface: notifier chat, command allowlist, signal channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramPolicy {
    #[serde(default)]
    pub enabled: bool,

    /// Chat id that receives notifications and command replies.
    #[serde(default)]
    pub chat_id: i64,

    /// User ids allowed to issue commands.
    #[serde(default)]
    pub allowed_user_ids: Vec<i64>,

    /// Channel ids whose posts are forwarded into the signal pipeline.
    #[serde(default)]
    pub signal_channel_ids: Vec<i64>,
}

/// Retry policy for exchange calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,

    /// Linear back-off base: attempt n sleeps `n * backoff_ms`.
    #[serde(default = "default_retry_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            backoff_ms: default_retry_backoff_ms(),
        }
    }
}

// =============================================================================
// BotConfig
// =============================================================================

/// Top-level configuration for SignalBot.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Mode the bot starts in. Forced to Paused at startup for safety; the
    /// operator resumes explicitly.
    #[serde(default)]
    pub operating_mode: OperatingMode,

    /// Directory holding `positions.json` and `statistics.json`.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Quote suffix used by signal channels (e.g. "USDT").
    #[serde(default = "default_quote_suffix")]
    pub quote_suffix_signal: String,

    /// Quote suffix traded on the exchange. Differs from the signal suffix
    /// when a channel publishes e.g. BUSD pairs.
    #[serde(default = "default_quote_suffix")]
    pub quote_suffix_execution: String,

    /// Parser names tried in order against every incoming message.
    #[serde(default = "default_parsers")]
    pub parsers: Vec<String>,

    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,

    #[serde(default)]
    pub risk: RiskPolicy,

    #[serde(default)]
    pub sizing: SizingPolicy,

    #[serde(default)]
    pub entry: EntryPolicy,

    #[serde(default)]
    pub duplicates: DuplicatePolicy,

    #[serde(default)]
    pub cooldown: CooldownPolicy,

    #[serde(default)]
    pub emergency: EmergencyPolicy,

    #[serde(default)]
    pub targets: TargetPolicy,

    #[serde(default)]
    pub telegram: TelegramPolicy,

    #[serde(default)]
    pub retry: RetrySettings,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            operating_mode: OperatingMode::Paused,
            state_dir: default_state_dir(),
            quote_suffix_signal: default_quote_suffix(),
            quote_suffix_execution: default_quote_suffix(),
            parsers: default_parsers(),
            max_concurrent_positions: default_max_concurrent_positions(),
            risk: RiskPolicy::default(),
            sizing: SizingPolicy::default(),
            entry: EntryPolicy::default(),
            duplicates: DuplicatePolicy::default(),
            cooldown: CooldownPolicy::default(),
            emergency: EmergencyPolicy::default(),
            targets: TargetPolicy::default(),
            telegram: TelegramPolicy::default(),
            retry: RetrySettings::default(),
        }
    }
}

impl BotConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config from {}", path.display()))?;

        info!(
            path = %path.display(),
            operating_mode = %config.operating_mode,
            parsers = ?config.parsers,
            "config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content =
            serde_json::to_string_pretty(self).context("failed to serialise config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "config saved (atomic)");
        Ok(())
    }
}
