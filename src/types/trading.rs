use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a candle or a structure segment.
///
/// `Undetermined` only occurs on the very first segment of a timeframe,
/// before its first candle fixes the direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Up,
    Down,
    #[default]
    Undetermined,
}

impl Direction {
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Undetermined => Direction::Undetermined,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => write!(f, "UP"),
            Direction::Down => write!(f, "DOWN"),
            Direction::Undetermined => write!(f, "?"),
        }
    }
}

/// Primary-structure timeframe levels, smallest to largest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PstLevel {
    Low,
    Mid,
    High,
}

impl PstLevel {
    pub fn all() -> [PstLevel; 3] {
        [PstLevel::Low, PstLevel::Mid, PstLevel::High]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PstLevel::Low => "low",
            PstLevel::Mid => "mid",
            PstLevel::High => "high",
        }
    }
}

impl fmt::Display for PstLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Support/resistance timeframe levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SrLevel {
    Low,
    High,
}

impl SrLevel {
    pub fn all() -> [SrLevel; 2] {
        [SrLevel::Low, SrLevel::High]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SrLevel::Low => "low",
            SrLevel::High => "high",
        }
    }
}

impl fmt::Display for SrLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether a zone acts as support or resistance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoneKind {
    Support,
    Resistance,
}

impl fmt::Display for ZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneKind::Support => write!(f, "SUPPORT"),
            ZoneKind::Resistance => write!(f, "RESISTANCE"),
        }
    }
}

/// Which part of the anchor candle contributes to an aggregated zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ZoningMode {
    #[default]
    Candle,
    Body,
    Wick,
}

/// Long/short marker for positions and advisor actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionKind {
    Long,
    Short,
}

impl fmt::Display for PositionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionKind::Long => write!(f, "LONG"),
            PositionKind::Short => write!(f, "SHORT"),
        }
    }
}

/// Lifecycle state of a position. Transitions OPEN -> CLOSED exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionState {
    Open,
    Closed,
}

/// Which rule strategy drives entries and exits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    #[serde(rename = "SIMPLE_TREND")]
    SimpleTrend,
    #[serde(rename = "PRICE_ACTION")]
    PriceAction,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::SimpleTrend => write!(f, "SIMPLE_TREND"),
            StrategyKind::PriceAction => write!(f, "PRICE_ACTION"),
        }
    }
}

/// Contract parameters of the traded instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymbolSpec {
    pub name: String,
    pub trade_contract_size: Decimal,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
}

impl SymbolSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.trade_contract_size <= Decimal::ZERO {
            return Err("trade_contract_size must be > 0".to_string());
        }
        if self.volume_min <= Decimal::ZERO {
            return Err("volume_min must be > 0".to_string());
        }
        if self.volume_max < self.volume_min {
            return Err("volume_max must be >= volume_min".to_string());
        }
        Ok(())
    }
}
