// =============================================================================
// Position Store — crash-safe persistence for position records
// =============================================================================
//
// A durable map `position id -> Position` with a secondary index
// `symbol -> active position id`, rebuilt from the primary on load. Snapshots
// are written atomically (tmp + rename), so a crash mid-write leaves either
// the previous consistent file or the new one, never a torn file.
//
// A failed disk write rolls the in-memory mutation back and surfaces the
// error: the store never advances past what is on disk.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::position::Position;

const STORE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoreFile {
    version: u32,
    positions: Vec<Position>,
}

#[derive(Default)]
struct Inner {
    by_id: HashMap<String, Position>,
    /// Active (Pending / Opening / Open / PartialClosed) position per symbol.
    by_symbol: HashMap<String, String>,
}

pub struct PositionStore {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl PositionStore {
    /// Open the store at `path`, creating parent directories. A missing file
    /// yields an empty store; an unreadable one is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("failed to create state dir {}", dir.display()))?;
        }

        let mut inner = Inner::default();

        if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            let file: StoreFile = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?;

            for position in file.positions {
                if position.status.is_active() {
                    inner.by_symbol.insert(position.symbol.clone(), position.id.clone());
                }
                inner.by_id.insert(position.id.clone(), position);
            }

            info!(
                path = %path.display(),
                total = inner.by_id.len(),
                active = inner.by_symbol.len(),
                "position store loaded"
            );
        } else {
            info!(path = %path.display(), "position store starting empty");
        }

        Ok(Self { path, inner: Mutex::new(inner) })
    }

    /// Upsert one position and persist the snapshot atomically.
    ///
    /// On a persistence failure the in-memory state is rolled back to the
    /// previous value and the error propagates.
    pub fn save(&self, position: &Position) -> Result<()> {
        let mut inner = self.inner.lock();

        let previous = inner.by_id.insert(position.id.clone(), position.clone());
        let previous_index = inner.by_symbol.get(&position.symbol).cloned();

        if position.status.is_active() {
            inner.by_symbol.insert(position.symbol.clone(), position.id.clone());
        } else if previous_index.as_deref() == Some(position.id.as_str()) {
            inner.by_symbol.remove(&position.symbol);
        }

        if let Err(e) = self.persist(&inner) {
            // Roll back so memory and disk stay in agreement.
            match previous {
                Some(old) => {
                    inner.by_id.insert(position.id.clone(), old);
                }
                None => {
                    inner.by_id.remove(&position.id);
                }
            }
            match previous_index {
                Some(id) => {
                    inner.by_symbol.insert(position.symbol.clone(), id);
                }
                None => {
                    inner.by_symbol.remove(&position.symbol);
                }
            }
            return Err(e);
        }

        debug!(
            id = %position.id,
            symbol = %position.symbol,
            status = %position.status,
            "position saved"
        );
        Ok(())
    }

    fn persist(&self, inner: &Inner) -> Result<()> {
        let mut positions: Vec<Position> = inner.by_id.values().cloned().collect();
        positions.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        let file = StoreFile { version: STORE_VERSION, positions };
        let content =
            serde_json::to_string_pretty(&file).context("failed to serialise position store")?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &content)
            .with_context(|| format!("failed to write tmp store to {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to rename tmp store to {}", self.path.display()))?;
        Ok(())
    }

    // ── Queries (readonly snapshots) ────────────────────────────────────

    pub fn get(&self, id: &str) -> Option<Position> {
        self.inner.lock().by_id.get(id).cloned()
    }

    /// The active position on `symbol`, if any.
    pub fn get_by_symbol(&self, symbol: &str) -> Option<Position> {
        let inner = self.inner.lock();
        inner.by_symbol.get(symbol).and_then(|id| inner.by_id.get(id)).cloned()
    }

    pub fn list_open(&self) -> Vec<Position> {
        let inner = self.inner.lock();
        let mut open: Vec<Position> =
            inner.by_id.values().filter(|p| p.status.is_active()).cloned().collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        open
    }

    pub fn list_all(&self) -> Vec<Position> {
        let inner = self.inner.lock();
        let mut all: Vec<Position> = inner.by_id.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        all
    }

    pub fn open_count(&self) -> usize {
        self.inner.lock().by_symbol.len()
    }

    /// Administrative / test-only removal.
    pub fn remove(&self, id: &str) -> Result<Option<Position>> {
        let mut inner = self.inner.lock();
        let removed = inner.by_id.remove(id);
        if let Some(pos) = &removed {
            if inner.by_symbol.get(&pos.symbol).map(String::as_str) == Some(id) {
                inner.by_symbol.remove(&pos.symbol);
            }
            self.persist(&inner)?;
        }
        Ok(removed)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::PositionStatus;
    use crate::types::{CloseReason, Direction};

    fn sample(symbol: &str) -> Position {
        Position::pending("sig-1", symbol, Direction::Long, 100.0, 95.0, 90.0, 10)
    }

    fn temp_store() -> (tempfile::TempDir, PositionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PositionStore::open(dir.path().join("positions.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn save_and_lookup() {
        let (_dir, store) = temp_store();
        let pos = sample("BTCUSDT");
        store.save(&pos).unwrap();

        assert_eq!(store.get(&pos.id).unwrap().id, pos.id);
        assert_eq!(store.get_by_symbol("BTCUSDT").unwrap().id, pos.id);
        assert_eq!(store.open_count(), 1);
        assert_eq!(store.list_open().len(), 1);
    }

    #[test]
    fn closing_removes_from_symbol_index() {
        let (_dir, store) = temp_store();
        let mut pos = sample("BTCUSDT");
        store.save(&pos).unwrap();

        pos.mark_closed(CloseReason::StopLossHit);
        store.save(&pos).unwrap();

        assert!(store.get_by_symbol("BTCUSDT").is_none());
        assert_eq!(store.open_count(), 0);
        // Closed record stays queryable by id.
        assert_eq!(store.get(&pos.id).unwrap().status, PositionStatus::Closed);
    }

    #[test]
    fn reload_rebuilds_symbol_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let open_id;
        {
            let store = PositionStore::open(&path).unwrap();
            let mut closed = sample("ETHUSDT");
            closed.mark_closed(CloseReason::AllTargetsHit);
            store.save(&closed).unwrap();

            let open = sample("BTCUSDT");
            open_id = open.id.clone();
            store.save(&open).unwrap();
        }

        let reloaded = PositionStore::open(&path).unwrap();
        assert_eq!(reloaded.list_all().len(), 2);
        assert_eq!(reloaded.open_count(), 1);
        assert_eq!(reloaded.get_by_symbol("BTCUSDT").unwrap().id, open_id);
        assert!(reloaded.get_by_symbol("ETHUSDT").is_none());
    }

    #[test]
    fn serialisation_roundtrip_preserves_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let mut pos = sample("XYZUSDT");
        pos.entry_price = 100.5;
        pos.targets = crate::position::build_targets(
            &[101.0, 102.0],
            &[0.5, 0.5],
            10.0,
            0.01,
            100.5,
            true,
        );
        pos.take_profit_order_ids = vec![Some(7), None];
        pos.realized_pnl = 12.25;

        {
            let store = PositionStore::open(&path).unwrap();
            store.save(&pos).unwrap();
        }

        let reloaded = PositionStore::open(&path).unwrap();
        assert_eq!(reloaded.get(&pos.id).unwrap(), pos);
    }

    #[test]
    fn crash_leaves_previous_or_new_snapshot() {
        // A crash between tmp-write and rename leaves a stale tmp file plus
        // the previous snapshot; reload must see the previous state.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");

        let first = sample("BTCUSDT");
        {
            let store = PositionStore::open(&path).unwrap();
            store.save(&first).unwrap();
        }

        // Simulated crash artifact: half-written tmp next to the good file.
        std::fs::write(path.with_extension("json.tmp"), "{\"version\":1,\"posit").unwrap();

        let reloaded = PositionStore::open(&path).unwrap();
        assert_eq!(reloaded.list_all().len(), 1);
        assert_eq!(reloaded.get(&first.id).unwrap().symbol, "BTCUSDT");
    }

    #[test]
    fn failed_persist_rolls_back_memory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let store = PositionStore::open(&path).unwrap();

        let pos = sample("BTCUSDT");
        store.save(&pos).unwrap();

        // A directory squatting on the tmp path makes the snapshot write fail.
        std::fs::create_dir(path.with_extension("json.tmp")).unwrap();

        let mut updated = pos.clone();
        updated.realized_pnl = 99.0;
        let result = store.save(&updated);

        assert!(result.is_err());
        // In-memory state still shows the last persisted value.
        assert_eq!(store.get(&pos.id).unwrap().realized_pnl, 0.0);

        // Once the obstruction is gone, saving works again.
        std::fs::remove_dir(path.with_extension("json.tmp")).unwrap();
        store.save(&updated).unwrap();
        assert_eq!(store.get(&pos.id).unwrap().realized_pnl, 99.0);
    }

    #[test]
    fn remove_is_exposed_for_admin_reset() {
        let (_dir, store) = temp_store();
        let pos = sample("BTCUSDT");
        store.save(&pos).unwrap();

        let removed = store.remove(&pos.id).unwrap().unwrap();
        assert_eq!(removed.id, pos.id);
        assert!(store.get(&pos.id).is_none());
        assert_eq!(store.open_count(), 0);
    }
}
