// =============================================================================
// Shared types used across the SignalBot engine
// =============================================================================

use serde::{Deserialize, Serialize};

/// Trade direction of a signal or position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Long,
    Short,
}

impl Direction {
    /// +1.0 for Long, -1.0 for Short. PnL of a closed slice is
    /// `sign * (exit - entry) * qty`.
    pub fn sign(self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }

    pub fn opposite(self) -> Self {
        match self {
            Self::Long => Self::Short,
            Self::Short => Self::Long,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Long => write!(f, "Long"),
            Self::Short => write!(f, "Short"),
        }
    }
}

/// System-wide gate controlling signal acceptance and position management.
///
/// Stored as an atomic u8 inside `BotController`; keep the discriminants
/// stable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OperatingMode {
    /// Accept new signals and manage open positions.
    Automatic = 0,
    /// Manage open positions only; reject new signals.
    MonitorOnly = 1,
    /// No new signals, no automatic actions on exchange events.
    Paused = 2,
    /// Everything halted. The transition itself may close all positions.
    EmergencyStop = 3,
}

impl OperatingMode {
    pub fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Automatic,
            1 => Self::MonitorOnly,
            2 => Self::Paused,
            _ => Self::EmergencyStop,
        }
    }
}

impl Default for OperatingMode {
    fn default() -> Self {
        Self::Paused
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Automatic => write!(f, "Automatic"),
            Self::MonitorOnly => write!(f, "MonitorOnly"),
            Self::Paused => write!(f, "Paused"),
            Self::EmergencyStop => write!(f, "EmergencyStop"),
        }
    }
}

/// Futures margin mode applied per symbol before opening a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginType {
    Isolated,
    Cross,
}

impl Default for MarginType {
    fn default() -> Self {
        Self::Isolated
    }
}

impl std::fmt::Display for MarginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Isolated => write!(f, "Isolated"),
            Self::Cross => write!(f, "Cross"),
        }
    }
}

/// Why a position reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    AllTargetsHit,
    StopLossHit,
    Liquidation,
    ManualClose,
    Error,
    OppositeSignal,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AllTargetsHit => write!(f, "AllTargetsHit"),
            Self::StopLossHit => write!(f, "StopLossHit"),
            Self::Liquidation => write!(f, "Liquidation"),
            Self::ManualClose => write!(f, "ManualClose"),
            Self::Error => write!(f, "Error"),
            Self::OppositeSignal => write!(f, "OppositeSignal"),
        }
    }
}
