// =============================================================================
// Signal model and parser dispatch
// =============================================================================
//
// A collection of per-channel parsers is registered in configuration order.
// The dispatcher tries them one by one and returns the first match; a message
// no parser recognises is not a signal. Parsers are pure and never panic on
// malformed input.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::types::Direction;

pub mod parsers;
pub mod validator;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A typed trade intent derived from one chat message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub raw_text: String,
    pub channel: String,
    pub received_at: DateTime<Utc>,
    /// Exchange symbol form, e.g. `BTCUSDT`.
    pub symbol: String,
    pub direction: Direction,
    pub entry: f64,
    /// Stop-loss as published; validation may substitute a safer one.
    pub stop_loss: f64,
    /// Ordered target prices, monotonic in the trade direction.
    pub targets: Vec<f64>,
    /// Leverage as published.
    pub leverage: u32,
}

impl Signal {
    /// Assemble a signal from parsed fields, enforcing the parser contract:
    /// positive prices, at least one target, target monotonicity, uppercased
    /// symbol with the channel's quote suffix. Returns None when any part of
    /// the contract fails — the message then counts as "not a signal".
    #[allow(clippy::too_many_arguments)]
    pub fn assemble(
        raw_text: &str,
        channel: &str,
        base_symbol: &str,
        quote_suffix: &str,
        direction: Direction,
        entry: f64,
        stop_loss: f64,
        targets: Vec<f64>,
        leverage: u32,
    ) -> Option<Self> {
        let base = base_symbol.trim().to_uppercase();
        if base.is_empty() {
            return None;
        }

        let suffix = quote_suffix.to_uppercase();
        let symbol = if base.ends_with(&suffix) { base } else { format!("{base}{suffix}") };

        if entry <= 0.0 || stop_loss <= 0.0 || leverage == 0 {
            return None;
        }
        if targets.is_empty() || targets.iter().any(|t| *t <= 0.0) {
            return None;
        }
        if !targets_monotonic(direction, &targets) {
            return None;
        }

        Some(Self {
            id: Uuid::new_v4().to_string(),
            raw_text: raw_text.to_string(),
            channel: channel.to_string(),
            received_at: Utc::now(),
            symbol,
            direction,
            entry,
            stop_loss,
            targets,
            leverage,
        })
    }
}

/// Targets must advance strictly in the trade direction.
pub fn targets_monotonic(direction: Direction, targets: &[f64]) -> bool {
    targets.windows(2).all(|w| match direction {
        Direction::Long => w[1] > w[0],
        Direction::Short => w[1] < w[0],
    })
}

// ---------------------------------------------------------------------------
// Parser trait and registry
// ---------------------------------------------------------------------------

/// One per-channel message format. Implementations are pure functions.
pub trait SignalParser: Send + Sync {
    fn name(&self) -> &str;

    /// Parse a raw message. Returns None for anything that is not a signal
    /// in this parser's format; never panics.
    fn try_parse(&self, text: &str, channel: &str) -> Option<Signal>;
}

/// Ordered collection of parsers tried against every incoming message.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn SignalParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self { parsers: Vec::new() }
    }

    pub fn register(&mut self, parser: Box<dyn SignalParser>) {
        self.parsers.push(parser);
    }

    /// Build a registry from configured parser names; unknown names are
    /// skipped with a log line.
    pub fn from_config(names: &[String], quote_suffix: &str) -> Self {
        let mut registry = Self::new();
        for name in names {
            match name.as_str() {
                "standard" => registry.register(Box::new(parsers::StandardParser::new(quote_suffix))),
                "cornix" => registry.register(Box::new(parsers::CornixParser::new(quote_suffix))),
                "compact" => registry.register(Box::new(parsers::CompactParser::new(quote_suffix))),
                other => {
                    tracing::warn!(parser = other, "unknown parser name in config — skipped");
                }
            }
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.parsers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parsers.is_empty()
    }

    /// First matching parse in registration order, or None when the message
    /// is not a signal.
    pub fn dispatch(&self, text: &str, channel: &str) -> Option<Signal> {
        for parser in &self.parsers {
            if let Some(signal) = parser.try_parse(text, channel) {
                debug!(
                    parser = parser.name(),
                    symbol = %signal.symbol,
                    direction = %signal.direction,
                    "message parsed into signal"
                );
                return Some(signal);
            }
        }
        debug!(channel, "message matched no parser — dropped");
        None
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}
