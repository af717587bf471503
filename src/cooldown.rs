// =============================================================================
// Cooldown Controller — refuses new signals after losing streaks
// =============================================================================
//
// Stop-loss and liquidation closes extend a cooldown window and grow the
// consecutive-loss counter; full-target wins shrink it back. While losses
// accumulate, the position-size multiplier steps down.
// =============================================================================

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::CooldownPolicy;
use crate::types::CloseReason;

/// Snapshot of the controller state for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct CooldownSnapshot {
    pub consecutive_losses: u32,
    pub consecutive_wins: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub reason: Option<String>,
    pub size_multiplier: f64,
}

#[derive(Default)]
struct Inner {
    consecutive_losses: u32,
    consecutive_wins: u32,
    cooldown_until: Option<DateTime<Utc>>,
    reason: Option<String>,
}

pub struct CooldownController {
    policy: CooldownPolicy,
    state: Mutex<Inner>,
}

impl CooldownController {
    pub fn new(policy: CooldownPolicy) -> Self {
        Self { policy, state: Mutex::new(Inner::default()) }
    }

    /// Feed one closed position's outcome into the streak state.
    pub fn on_position_closed(&self, reason: CloseReason) {
        let mut s = self.state.lock();

        match reason {
            CloseReason::StopLossHit => {
                s.consecutive_losses += 1;
                s.consecutive_wins = 0;
                let duration = if s.consecutive_losses >= self.policy.long_cooldown_threshold {
                    Duration::seconds(self.policy.long_cooldown_secs as i64)
                } else {
                    Duration::seconds(self.policy.short_cooldown_secs as i64)
                };
                let until = Utc::now() + duration;
                s.cooldown_until = Some(until);
                s.reason = Some(format!(
                    "{} consecutive stop-loss closes",
                    s.consecutive_losses
                ));
                warn!(
                    consecutive_losses = s.consecutive_losses,
                    until = %until,
                    "cooldown started after stop-loss"
                );
            }
            CloseReason::Liquidation => {
                s.consecutive_losses += 1;
                s.consecutive_wins = 0;
                let until = Utc::now() + Duration::seconds(self.policy.liquidation_cooldown_secs as i64);
                s.cooldown_until = Some(until);
                s.reason = Some("liquidation".to_string());
                warn!(
                    consecutive_losses = s.consecutive_losses,
                    until = %until,
                    "cooldown started after liquidation"
                );
            }
            CloseReason::AllTargetsHit => {
                s.consecutive_wins += 1;
                if s.consecutive_wins >= self.policy.wins_to_reset {
                    if s.consecutive_losses > 0 {
                        info!(
                            wins = s.consecutive_wins,
                            "loss counter cleared by winning streak"
                        );
                    }
                    s.consecutive_losses = 0;
                    s.consecutive_wins = 0;
                }
            }
            // Manual, error, and reversal closes leave the streaks alone.
            CloseReason::ManualClose | CloseReason::Error | CloseReason::OppositeSignal => {}
        }
    }

    /// Active cooldown, if any, as `(reason, until)`.
    pub fn in_cooldown(&self) -> Option<(String, DateTime<Utc>)> {
        let mut s = self.state.lock();
        match s.cooldown_until {
            Some(until) if until > Utc::now() => {
                Some((s.reason.clone().unwrap_or_default(), until))
            }
            Some(_) => {
                // Window elapsed; clear it so the snapshot stays tidy.
                s.cooldown_until = None;
                s.reason = None;
                None
            }
            None => None,
        }
    }

    /// Position-size multiplier for the current loss streak, in (0, 1].
    pub fn size_multiplier(&self) -> f64 {
        if !self.policy.reduce_size_after_losses {
            return 1.0;
        }
        let losses = self.state.lock().consecutive_losses;
        let m = match losses {
            0 => 1.0,
            1 => self.policy.loss_multipliers[0],
            2 => self.policy.loss_multipliers[1],
            _ => self.policy.loss_multipliers[2],
        };
        debug!(losses, multiplier = m, "size multiplier computed");
        m
    }

    /// Administrative reset of streaks and the cooldown window.
    pub fn force_reset(&self) {
        let mut s = self.state.lock();
        *s = Inner::default();
        info!("cooldown state force-reset");
    }

    pub fn snapshot(&self) -> CooldownSnapshot {
        let multiplier = self.size_multiplier();
        let s = self.state.lock();
        CooldownSnapshot {
            consecutive_losses: s.consecutive_losses,
            consecutive_wins: s.consecutive_wins,
            cooldown_until: s.cooldown_until,
            reason: s.reason.clone(),
            size_multiplier: multiplier,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> CooldownPolicy {
        CooldownPolicy {
            short_cooldown_secs: 60,
            long_cooldown_secs: 600,
            liquidation_cooldown_secs: 3600,
            long_cooldown_threshold: 3,
            reduce_size_after_losses: true,
            loss_multipliers: [0.75, 0.5, 0.25],
            wins_to_reset: 2,
        }
    }

    #[test]
    fn stop_loss_starts_cooldown_and_counts() {
        let ctl = CooldownController::new(policy());
        assert!(ctl.in_cooldown().is_none());

        ctl.on_position_closed(CloseReason::StopLossHit);
        let snap = ctl.snapshot();
        assert_eq!(snap.consecutive_losses, 1);
        assert!(ctl.in_cooldown().is_some());
        assert!((ctl.size_multiplier() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn multiplier_ladder_steps_down() {
        let ctl = CooldownController::new(policy());
        ctl.on_position_closed(CloseReason::StopLossHit);
        ctl.on_position_closed(CloseReason::StopLossHit);
        assert!((ctl.size_multiplier() - 0.5).abs() < 1e-9);
        ctl.on_position_closed(CloseReason::StopLossHit);
        assert!((ctl.size_multiplier() - 0.25).abs() < 1e-9);
        ctl.on_position_closed(CloseReason::StopLossHit);
        assert!((ctl.size_multiplier() - 0.25).abs() < 1e-9);
    }

    #[test]
    fn multiplier_disabled_is_unity() {
        let mut p = policy();
        p.reduce_size_after_losses = false;
        let ctl = CooldownController::new(p);
        ctl.on_position_closed(CloseReason::StopLossHit);
        ctl.on_position_closed(CloseReason::StopLossHit);
        assert_eq!(ctl.size_multiplier(), 1.0);
    }

    #[test]
    fn losses_only_grow_on_stop_or_liquidation() {
        let ctl = CooldownController::new(policy());
        ctl.on_position_closed(CloseReason::ManualClose);
        ctl.on_position_closed(CloseReason::Error);
        ctl.on_position_closed(CloseReason::OppositeSignal);
        assert_eq!(ctl.snapshot().consecutive_losses, 0);
        assert!(ctl.in_cooldown().is_none());

        ctl.on_position_closed(CloseReason::Liquidation);
        assert_eq!(ctl.snapshot().consecutive_losses, 1);
        assert!(ctl.in_cooldown().is_some());
    }

    #[test]
    fn wins_reset_after_threshold() {
        let ctl = CooldownController::new(policy());
        ctl.on_position_closed(CloseReason::StopLossHit);
        ctl.on_position_closed(CloseReason::StopLossHit);
        assert_eq!(ctl.snapshot().consecutive_losses, 2);

        // One win is not enough (wins_to_reset = 2).
        ctl.on_position_closed(CloseReason::AllTargetsHit);
        assert_eq!(ctl.snapshot().consecutive_losses, 2);

        ctl.on_position_closed(CloseReason::AllTargetsHit);
        let snap = ctl.snapshot();
        assert_eq!(snap.consecutive_losses, 0);
        assert_eq!(snap.consecutive_wins, 0);
        assert_eq!(ctl.size_multiplier(), 1.0);
    }

    #[test]
    fn loss_resets_win_streak() {
        let ctl = CooldownController::new(policy());
        ctl.on_position_closed(CloseReason::AllTargetsHit);
        assert_eq!(ctl.snapshot().consecutive_wins, 1);
        ctl.on_position_closed(CloseReason::StopLossHit);
        assert_eq!(ctl.snapshot().consecutive_wins, 0);
    }

    #[test]
    fn force_reset_clears_everything() {
        let ctl = CooldownController::new(policy());
        ctl.on_position_closed(CloseReason::Liquidation);
        assert!(ctl.in_cooldown().is_some());

        ctl.force_reset();
        assert!(ctl.in_cooldown().is_none());
        assert_eq!(ctl.snapshot().consecutive_losses, 0);
        assert_eq!(ctl.size_multiplier(), 1.0);
    }
}
