// =============================================================================
// Bot Controller — process-wide operating mode
// =============================================================================
//
// The mode is read on every signal and every order event, so it lives in a
// single atomic word. Mutations go through `set_mode`, which logs the
// transition; the emergency close-all on EmergencyStop is driven by the
// caller that flips the mode.
// =============================================================================

use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::info;

use crate::types::OperatingMode;

pub struct BotController {
    mode: AtomicU8,
    changed_at: RwLock<DateTime<Utc>>,
}

impl BotController {
    pub fn new(initial: OperatingMode) -> Self {
        Self { mode: AtomicU8::new(initial as u8), changed_at: RwLock::new(Utc::now()) }
    }

    pub fn mode(&self) -> OperatingMode {
        OperatingMode::from_u8(self.mode.load(Ordering::SeqCst))
    }

    pub fn changed_at(&self) -> DateTime<Utc> {
        *self.changed_at.read()
    }

    /// Switch modes, returning the previous one. A no-op transition still
    /// refreshes nothing and is reported back to the caller.
    pub fn set_mode(&self, mode: OperatingMode) -> OperatingMode {
        let previous = OperatingMode::from_u8(self.mode.swap(mode as u8, Ordering::SeqCst));
        if previous != mode {
            *self.changed_at.write() = Utc::now();
            info!(from = %previous, to = %mode, "operating mode changed");
        }
        previous
    }

    /// New signals are only taken in Automatic.
    pub fn can_accept_new_signals(&self) -> bool {
        self.mode() == OperatingMode::Automatic
    }

    /// Exchange events trigger automatic position management in Automatic
    /// and MonitorOnly.
    pub fn can_manage_positions(&self) -> bool {
        matches!(self.mode(), OperatingMode::Automatic | OperatingMode::MonitorOnly)
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gates_follow_mode() {
        let ctl = BotController::new(OperatingMode::Automatic);
        assert!(ctl.can_accept_new_signals());
        assert!(ctl.can_manage_positions());

        ctl.set_mode(OperatingMode::MonitorOnly);
        assert!(!ctl.can_accept_new_signals());
        assert!(ctl.can_manage_positions());

        ctl.set_mode(OperatingMode::Paused);
        assert!(!ctl.can_accept_new_signals());
        assert!(!ctl.can_manage_positions());

        ctl.set_mode(OperatingMode::EmergencyStop);
        assert!(!ctl.can_accept_new_signals());
        assert!(!ctl.can_manage_positions());
    }

    #[test]
    fn set_mode_returns_previous() {
        let ctl = BotController::new(OperatingMode::Paused);
        assert_eq!(ctl.set_mode(OperatingMode::Automatic), OperatingMode::Paused);
        assert_eq!(ctl.set_mode(OperatingMode::Automatic), OperatingMode::Automatic);
        assert_eq!(ctl.mode(), OperatingMode::Automatic);
    }
}
