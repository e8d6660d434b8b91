use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::BacktestError;
use crate::types::{PstLevel, SrLevel, StrategyKind, SymbolSpec, ZoningMode, TIME_FORMAT};

/// Which low-timeframe event triggers an entry attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryTrigger {
    #[serde(rename = "CHOC")]
    Choc,
    #[serde(rename = "CHOC_CONFIRMED")]
    ChocConfirmed,
    #[serde(rename = "CHOC+BOS")]
    ChocBos,
    #[serde(rename = "CHOC_CONFIRMED+BOS")]
    ChocConfirmedBos,
}

impl EntryTrigger {
    pub fn uses_choc(&self) -> bool {
        matches!(self, EntryTrigger::Choc | EntryTrigger::ChocBos)
    }

    pub fn uses_choc_confirmed(&self) -> bool {
        matches!(
            self,
            EntryTrigger::ChocConfirmed | EntryTrigger::ChocConfirmedBos
        )
    }

    pub fn uses_bos(&self) -> bool {
        matches!(self, EntryTrigger::ChocBos | EntryTrigger::ChocConfirmedBos)
    }
}

/// Which low-timeframe event closes positions in the trend direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitTrigger {
    #[serde(rename = "CHOC")]
    Choc,
    #[serde(rename = "CHOC_CONFIRMED")]
    ChocConfirmed,
}

/// Source of the initial stop loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlLevelSource {
    #[serde(rename = "KEY_LEVEL")]
    KeyLevel,
    #[serde(rename = "SEGMENT_RANGE")]
    SegmentRange,
}

/// How a key level must relate to an SR zone before an entry qualifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneInteraction {
    #[serde(rename = "TOUCH")]
    Touch,
    #[serde(rename = "PROXIMITY")]
    Proximity,
}

/// Stop-movement policy applied while a BOS phase is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveSlOptions {
    pub allow: bool,
    pub to_break_even_at_r: Decimal,
    pub trailing_at_r: Decimal,
}

impl Default for MoveSlOptions {
    fn default() -> Self {
        Self {
            allow: false,
            to_break_even_at_r: dec!(1),
            trailing_at_r: dec!(2),
        }
    }
}

/// Strategy tuning knobs shared by both strategies; the `sr_zone_*` family
/// only applies to PRICE_ACTION and `exclude_high_trend` to SIMPLE_TREND.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyOptions {
    pub entry: EntryTrigger,
    pub exit: ExitTrigger,
    pub sl_level: SlLevelSource,
    #[serde(default)]
    pub sl_level_margin: Decimal,
    #[serde(default)]
    pub reward_ratio: Option<Decimal>,
    pub risk_per_trade: Decimal,
    #[serde(default = "default_true")]
    pub compound_risk: bool,
    pub max_concurrent_trades: usize,
    #[serde(default)]
    pub exclude_high_trend: bool,
    #[serde(default = "default_zone_interaction")]
    pub sr_zone_interaction: ZoneInteraction,
    #[serde(default)]
    pub sr_zone_entry_margin: Decimal,
    #[serde(default)]
    pub sr_zone_proximity_margin: Decimal,
    #[serde(default)]
    pub sr_zone_clearance_factor: Decimal,
    #[serde(default)]
    pub move_sl: MoveSlOptions,
}

fn default_true() -> bool {
    true
}

fn default_zone_interaction() -> ZoneInteraction {
    ZoneInteraction::Touch
}

/// Candle file paths per PST level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PstFiles {
    pub low: PathBuf,
    pub mid: PathBuf,
    pub high: PathBuf,
}

impl PstFiles {
    pub fn path(&self, level: PstLevel) -> &Path {
        match level {
            PstLevel::Low => &self.low,
            PstLevel::Mid => &self.mid,
            PstLevel::High => &self.high,
        }
    }
}

/// Candle file paths per SR level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrFiles {
    pub low: PathBuf,
    pub high: PathBuf,
}

impl SrFiles {
    pub fn path(&self, level: SrLevel) -> &Path {
        match level {
            SrLevel::Low => &self.low,
            SrLevel::High => &self.high,
        }
    }
}

/// Live-publishing knobs. Off by default; publishing never changes results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishSettings {
    pub live: bool,
    pub cycle: usize,
    pub sim_speed_ms: u64,
    pub annotation_candle_length: usize,
    /// Where the bundled consumer writes snapshots, one JSON document per
    /// line. Unset means snapshots are dropped at the boundary.
    #[serde(default)]
    pub out_file: Option<PathBuf>,
}

impl Default for PublishSettings {
    fn default() -> Self {
        Self {
            live: false,
            cycle: 1,
            sim_speed_ms: 0,
            annotation_candle_length: 100,
            out_file: None,
        }
    }
}

/// Full configuration of one backtest run, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub strategy: StrategyKind,
    pub instrument: String,
    pub start_date: String,
    pub end_date: String,
    pub init_account_balance: Decimal,
    pub pst_lookback_window: usize,
    pub sr_lookback_window: usize,
    pub sr_refresh_window: usize,
    #[serde(default)]
    pub zoning_mode: ZoningMode,
    #[serde(default = "default_true")]
    pub strict_candles: bool,
    pub pst_files: PstFiles,
    #[serde(default)]
    pub sr_files: Option<SrFiles>,
    pub symbol: SymbolSpec,
    pub options: StrategyOptions,
    #[serde(default)]
    pub publish: PublishSettings,
    #[serde(default)]
    pub trade_store: Option<PathBuf>,
}

impl BacktestConfig {
    pub fn from_file(path: &Path) -> Result<Self, BacktestError> {
        let raw = std::fs::read_to_string(path)?;
        let config: BacktestConfig = toml::from_str(&raw)
            .map_err(|e| BacktestError::Input(format!("bad config {}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse_date(value: &str, field: &str) -> Result<NaiveDateTime, BacktestError> {
        NaiveDateTime::parse_from_str(value, TIME_FORMAT)
            .map_err(|e| BacktestError::Input(format!("unparseable {field} '{value}': {e}")))
    }

    pub fn start(&self) -> Result<NaiveDateTime, BacktestError> {
        Self::parse_date(&self.start_date, "start_date")
    }

    pub fn end(&self) -> Result<NaiveDateTime, BacktestError> {
        Self::parse_date(&self.end_date, "end_date")
    }

    pub fn validate(&self) -> Result<(), BacktestError> {
        let mut errors = Vec::new();

        match (self.start(), self.end()) {
            (Ok(start), Ok(end)) if start > end => {
                errors.push(format!("start_date {start} is after end_date {end}"));
            }
            (Err(e), _) | (_, Err(e)) => errors.push(e.to_string()),
            _ => {}
        }

        if self.init_account_balance <= Decimal::ZERO {
            errors.push("init_account_balance must be > 0".to_string());
        }
        if self.sr_refresh_window == 0 {
            errors.push("sr_refresh_window must be > 0".to_string());
        }
        if let Err(e) = self.symbol.validate() {
            errors.push(e);
        }

        let options = &self.options;
        if options.risk_per_trade <= Decimal::ZERO || options.risk_per_trade > Decimal::ONE {
            errors.push("risk_per_trade must be within (0, 1]".to_string());
        }
        if options.max_concurrent_trades == 0 {
            errors.push("max_concurrent_trades must be > 0".to_string());
        }
        if let Some(rr) = options.reward_ratio {
            if rr <= Decimal::ZERO {
                errors.push("reward_ratio must be > 0 when set".to_string());
            }
        }
        if options.move_sl.allow
            && options.move_sl.to_break_even_at_r > options.move_sl.trailing_at_r
        {
            errors.push("move_sl: to_break_even_at_r must be <= trailing_at_r".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(BacktestError::Input(errors.join("; ")))
        }
    }

    /// Paths to load, keyed by PST level.
    pub fn pst_paths(&self) -> HashMap<PstLevel, PathBuf> {
        PstLevel::all()
            .into_iter()
            .map(|level| (level, self.pst_files.path(level).to_path_buf()))
            .collect()
    }

    /// Paths to load, keyed by SR level, when SR files are configured.
    pub fn sr_paths(&self) -> Option<HashMap<SrLevel, PathBuf>> {
        self.sr_files.as_ref().map(|files| {
            SrLevel::all()
                .into_iter()
                .map(|level| (level, files.path(level).to_path_buf()))
                .collect()
        })
    }
}
