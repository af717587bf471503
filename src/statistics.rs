// =============================================================================
// Statistics Store — append-only trade log with rolling-window aggregates
// =============================================================================
//
// A TradeRecord is appended whenever a position transitions to Closed.
// Aggregates (count, PnL, win-rate, largest win/loss) are computed over named
// rolling windows; records older than the longest window are evicted.
// =============================================================================

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::position::Position;
use crate::types::{CloseReason, Direction};

const STORE_VERSION: u32 = 1;

/// One closed trade, as archived from a Closed position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub entry_price: f64,
    /// Weighted-average exit across all partial closes.
    pub exit_price: f64,
    pub realized_pnl: f64,
    pub close_reason: CloseReason,
    pub opened_at: Option<DateTime<Utc>>,
    pub closed_at: DateTime<Utc>,
}

/// Aggregate over one named rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSummary {
    pub window: String,
    pub trades: usize,
    pub wins: usize,
    pub win_rate: f64,
    pub realized_pnl: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
}

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    records: Vec<TradeRecord>,
}

pub struct StatisticsStore {
    path: PathBuf,
    records: Mutex<Vec<TradeRecord>>,
    windows: Vec<(String, Duration)>,
}

impl StatisticsStore {
    /// Open the statistics file with the standard 24h / 7d / 30d windows.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_windows(
            path,
            vec![
                ("24h".to_string(), Duration::hours(24)),
                ("7d".to_string(), Duration::days(7)),
                ("30d".to_string(), Duration::days(30)),
            ],
        )
    }

    pub fn with_windows(
        path: impl AsRef<Path>,
        windows: Vec<(String, Duration)>,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create state dir {}", dir.display()))?;
        }

        let mut records = Vec::new();
        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let file: StoreFile = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;
            records = file.records;
            info!(path = %path.display(), count = records.len(), "statistics loaded");
        }

        let store = Self { path, records: Mutex::new(records), windows };
        store.evict_expired();
        Ok(store)
    }

    /// Archive a Closed position. The weighted-average exit is recovered from
    /// the realized PnL so partial closes need no separate bookkeeping here.
    pub fn record_close(&self, position: &Position) -> Result<()> {
        let exit_price = if position.initial_quantity > 0.0 {
            position.entry_price
                + position.direction.sign() * position.realized_pnl / position.initial_quantity
        } else {
            position.entry_price
        };

        let record = TradeRecord {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            direction: position.direction,
            entry_price: position.entry_price,
            exit_price,
            realized_pnl: position.realized_pnl,
            close_reason: position.close_reason.unwrap_or(CloseReason::Error),
            opened_at: position.opened_at,
            closed_at: position.closed_at.unwrap_or_else(Utc::now),
        };

        debug!(
            position_id = %record.position_id,
            symbol = %record.symbol,
            pnl = record.realized_pnl,
            reason = %record.close_reason,
            "trade archived"
        );

        let mut records = self.records.lock();
        records.push(record);
        Self::evict(&mut records, &self.windows);
        self.persist(&records)
    }

    /// Aggregate for a named window, or None for an unknown name.
    pub fn summary(&self, window_name: &str) -> Option<WindowSummary> {
        let duration = self.windows.iter().find(|(n, _)| n == window_name).map(|(_, d)| *d)?;
        let cutoff = Utc::now() - duration;

        let records = self.records.lock();
        let in_window: Vec<&TradeRecord> =
            records.iter().filter(|r| r.closed_at >= cutoff).collect();

        let trades = in_window.len();
        let wins = in_window.iter().filter(|r| r.realized_pnl > 0.0).count();
        let realized_pnl: f64 = in_window.iter().map(|r| r.realized_pnl).sum();
        // Extremes are seeded from the records themselves: an all-loss window
        // must not report a phantom 0.0 "win", nor an all-win window a 0.0
        // "loss". Empty windows report 0.0 for both, matching trades == 0.
        let (largest_win, largest_loss) = in_window
            .iter()
            .map(|r| r.realized_pnl)
            .fold(None::<(f64, f64)>, |extremes, pnl| match extremes {
                None => Some((pnl, pnl)),
                Some((win, loss)) => Some((win.max(pnl), loss.min(pnl))),
            })
            .unwrap_or((0.0, 0.0));
        let win_rate = if trades > 0 { wins as f64 / trades as f64 } else { 0.0 };

        Some(WindowSummary {
            window: window_name.to_string(),
            trades,
            wins,
            win_rate,
            realized_pnl,
            largest_win,
            largest_loss,
        })
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }

    /// Sum of realized PnL for trades closed at or after `since`.
    pub fn realized_since(&self, since: DateTime<Utc>) -> f64 {
        self.records.lock().iter().filter(|r| r.closed_at >= since).map(|r| r.realized_pnl).sum()
    }

    fn evict_expired(&self) {
        let mut records = self.records.lock();
        Self::evict(&mut records, &self.windows);
    }

    fn evict(records: &mut Vec<TradeRecord>, windows: &[(String, Duration)]) {
        let Some(longest) = windows.iter().map(|(_, d)| *d).max() else {
            return;
        };
        let cutoff = Utc::now() - longest;
        records.retain(|r| r.closed_at >= cutoff);
    }

    fn persist(&self, records: &[TradeRecord]) -> Result<()> {
        let file = StoreFile { version: STORE_VERSION, records: records.to_vec() };
        let content =
            serde_json::to_string_pretty(&file).context("failed to serialise statistics")?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp statistics to {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename tmp statistics to {}", self.path.display()))?;
        Ok(())
    }
}
