use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{Direction, ZoneKind};

/// Key structural levels of the active segment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KeyLevels {
    pub high: Option<Decimal>,
    pub low: Option<Decimal>,
}

/// Whole-segment extremes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SegmentRange {
    pub highest: Option<Decimal>,
    pub lowest: Option<Decimal>,
}

/// Condensed view of the previous segment on a level.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrevSegmentSignal {
    pub seg_id: Uuid,
    pub seg_dir: Direction,
    pub segment_range: SegmentRange,
}

/// Everything a strategy needs to know about one PST level after a candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelSignal {
    pub seg_id: Uuid,
    pub seg_dir: Direction,
    pub candle_time: Option<NaiveDateTime>,
    pub candle_dir: Option<Direction>,
    pub bos_count: u32,
    pub in_bos: bool,
    pub in_pull_back: bool,
    pub choc: bool,
    pub choc_confirmed: bool,
    pub key_levels: KeyLevels,
    pub segment_range: SegmentRange,
    pub prev_segment: PrevSegmentSignal,
}

/// Aggregated SR zone as exposed to strategies and the UI payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: ZoneKind,
    pub x: NaiveDateTime,
    pub interval: (Decimal, Decimal),
    pub retests: u32,
}

impl ZoneView {
    pub fn low(&self) -> Decimal {
        self.interval.0
    }

    pub fn high(&self) -> Decimal {
        self.interval.1
    }

    pub fn width(&self) -> Decimal {
        self.interval.1 - self.interval.0
    }
}

/// Full detector projection consumed by the advisor on every candle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSnapshot {
    pub low: LevelSignal,
    pub mid: LevelSignal,
    pub high: LevelSignal,
    pub sr_zones: Vec<ZoneView>,
}

/// Chart annotation for one PST level over a trailing candle window.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LevelAnnotation {
    pub timeframe: String,
    pub dir: Direction,
    pub bos: Vec<NaiveDateTime>,
    pub choc: Vec<NaiveDateTime>,
    pub choc_confirm: Vec<NaiveDateTime>,
    pub key_high: Option<Decimal>,
    pub key_low: Option<Decimal>,
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
    pub in_choc: bool,
}

/// Account block carried in the published annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountAnnotation {
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub equity: Decimal,
}

/// Everything the dashboard needs to mark up its charts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub pst_low: LevelAnnotation,
    pub pst_mid: LevelAnnotation,
    pub pst_high: LevelAnnotation,
    pub sr_zones: Vec<ZoneView>,
    pub account: Option<AccountAnnotation>,
}
