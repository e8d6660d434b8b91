#![allow(dead_code)]
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::BacktestError;
use crate::types::{Candle, Direction};

/// One directional run of candles, delimited by confirmed ChOC events.
///
/// In an UP segment `key_high` is the BOS level and `key_low` the ChOC
/// level; a DOWN segment swaps the roles. `last_high`/`last_low` track the
/// extremes observed since the most recent break or pullback reset and feed
/// the next key level. A segment is terminal once `choc_confirmed` is set;
/// the coordinator must start a follow-on segment before the next candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimarySegment {
    pub id: Uuid,
    pub timeframe: String,
    pub dir: Direction,
    pub key_high: Option<Decimal>,
    pub key_low: Option<Decimal>,
    pub last_high: Option<Decimal>,
    pub last_low: Option<Decimal>,
    pub key_high_candle: Option<NaiveDateTime>,
    pub key_low_candle: Option<NaiveDateTime>,
    pub last_high_candle: Option<NaiveDateTime>,
    pub last_low_candle: Option<NaiveDateTime>,
    pub choc: bool,
    pub choc_confirmed: bool,
    pub segment_high: Option<Decimal>,
    pub segment_low: Option<Decimal>,
    pub bos_count: u32,
    pub in_bos: bool,
    pub in_pull_back: bool,
    pub in_choc_pull_back: bool,
    pub candles: Vec<NaiveDateTime>,
    pub bos_candles: Vec<NaiveDateTime>,
    pub choc_candles: Vec<NaiveDateTime>,
    pub key_high_candles: Vec<NaiveDateTime>,
    pub key_low_candles: Vec<NaiveDateTime>,
    pub highest_candle: Option<NaiveDateTime>,
    pub lowest_candle: Option<NaiveDateTime>,
    pub choc_confirm_candle: Option<NaiveDateTime>,
}

impl PrimarySegment {
    /// Fresh segment for the start of a timeframe. Direction stays
    /// undetermined until the first candle arrives.
    pub fn new(timeframe: &str) -> Self {
        let segment = Self {
            id: Uuid::new_v4(),
            timeframe: timeframe.to_string(),
            dir: Direction::Undetermined,
            key_high: None,
            key_low: None,
            last_high: None,
            last_low: None,
            key_high_candle: None,
            key_low_candle: None,
            last_high_candle: None,
            last_low_candle: None,
            choc: false,
            choc_confirmed: false,
            segment_high: None,
            segment_low: None,
            bos_count: 0,
            in_bos: true,
            in_pull_back: false,
            in_choc_pull_back: false,
            candles: Vec::new(),
            bos_candles: Vec::new(),
            choc_candles: Vec::new(),
            key_high_candles: Vec::new(),
            key_low_candles: Vec::new(),
            highest_candle: None,
            lowest_candle: None,
            choc_confirm_candle: None,
        };
        info!(
            "new primary segment {} ({}, dir {})",
            segment.id, segment.timeframe, segment.dir
        );
        segment
    }

    /// Segment seeded from a terminated parent: reversed direction, the
    /// parent's key and last levels (with their candle refs), everything
    /// else back to defaults.
    pub fn follow_on(parent: &PrimarySegment) -> Self {
        let mut segment = Self::new(&parent.timeframe);
        segment.dir = parent.dir.opposite();
        segment.key_high = parent.key_high;
        segment.key_low = parent.key_low;
        segment.last_high = parent.last_high;
        segment.last_low = parent.last_low;
        segment.key_high_candle = parent.key_high_candle;
        segment.key_low_candle = parent.key_low_candle;
        segment.last_high_candle = parent.last_high_candle;
        segment.last_low_candle = parent.last_low_candle;
        segment
    }

    pub fn candle_count(&self) -> usize {
        self.candles.len()
    }

    /// Full price range of the segment, when both extremes are known.
    pub fn segment_range(&self) -> Option<Decimal> {
        match (self.segment_high, self.segment_low) {
            (Some(high), Some(low)) => Some(high - low),
            _ => None,
        }
    }

    /// Append a candle and apply the structure rules for the segment's
    /// direction. Errors if the segment was already terminated.
    pub fn add_candle(&mut self, candle: &Candle) -> Result<(), BacktestError> {
        if self.choc_confirmed {
            return Err(BacktestError::DetectorInvariant(format!(
                "segment {} ({}) received candle {} after ChOC confirmation",
                self.id, self.timeframe, candle.time
            )));
        }

        debug!(
            "segment({}) candle {} high {} low {} close {}",
            self.timeframe, candle.time, candle.high, candle.low, candle.close
        );

        self.candles.push(candle.time);
        self.update_segment_high_low(candle);

        match self.dir {
            Direction::Undetermined => {
                // first candle of the very first segment fixes everything
                self.dir = candle.direction();
                self.key_high = Some(candle.high);
                self.key_high_candle = Some(candle.time);
                self.key_low = Some(candle.low);
                self.key_low_candle = Some(candle.time);
                self.in_bos = true;
            }
            Direction::Up => self.advance_up(candle),
            Direction::Down => self.advance_down(candle),
        }

        self.track_last_high_low(candle);
        Ok(())
    }

    fn advance_up(&mut self, candle: &Candle) {
        // pullback after a break: first bearish candle ends the BOS phase
        // and promotes the tracked high to the new key high
        if !self.in_pull_back && self.in_bos && candle.direction() == Direction::Down {
            self.in_pull_back = true;
            self.in_bos = false;
            self.key_high = self.last_high;
            self.key_high_candle = self.last_high_candle;
            if let Some(t) = self.last_high_candle {
                self.key_high_candles.push(t);
            }
            info!(
                "{} UPTREND: BOS pullback at {}, new key high {:?}",
                self.timeframe, candle.time, self.key_high
            );
        }

        // pullback after an unconfirmed ChOC: first bullish candle fixes the
        // lower low and restarts high tracking from this candle
        if self.choc && !self.in_choc_pull_back && candle.direction() == Direction::Up {
            self.in_choc_pull_back = true;
            self.key_low = self.last_low;
            self.key_low_candle = self.last_low_candle;
            if let Some(t) = self.last_low_candle {
                self.key_low_candles.push(t);
            }
            self.last_high = Some(candle.high);
            self.last_high_candle = Some(candle.time);
            info!(
                "{} UPTREND: ChOC pullback at {}, lower low {:?}",
                self.timeframe, candle.time, self.key_low
            );
        }

        let above_key_high = self.key_high.is_some_and(|kh| candle.close > kh);
        let below_key_low = self.key_low.is_some_and(|kl| candle.close < kl);

        if above_key_high && self.in_pull_back && candle.direction() == Direction::Up {
            // break of structure
            self.bos_count += 1;
            self.in_pull_back = false;
            self.in_choc_pull_back = false;
            self.choc = false;
            self.in_bos = true;
            self.bos_candles.push(candle.time);

            match (self.last_low, self.last_low_candle) {
                (Some(last_low), Some(last_low_candle)) if candle.low >= last_low => {
                    self.key_low = Some(last_low);
                    self.key_low_candle = Some(last_low_candle);
                    self.key_low_candles.push(last_low_candle);
                }
                _ => {
                    self.key_low = Some(candle.low);
                    self.key_low_candle = Some(candle.time);
                    self.key_low_candles.push(candle.time);
                }
            }
            self.last_low = None;
            self.last_low_candle = None;
            info!(
                "{} UPTREND: BOS at {}, higher low {:?}",
                self.timeframe, candle.time, self.key_low
            );
        } else if below_key_low {
            // change of character, or its confirmation
            if !self.choc {
                self.choc = true;
                self.last_low = Some(candle.low);
                self.last_low_candle = Some(candle.time);
                self.choc_candles.push(candle.time);
                info!("{} UPTREND: ChOC at {}", self.timeframe, candle.time);
            } else if self.in_choc_pull_back {
                self.choc_confirmed = true;
                self.key_high = self.last_high;
                self.key_high_candle = self.last_high_candle;
                if let Some(t) = self.last_high_candle {
                    self.key_high_candles.push(t);
                }
                self.last_low = Some(candle.low);
                self.last_low_candle = Some(candle.time);
                self.choc_confirm_candle = Some(candle.time);
                info!(
                    "{} UPTREND: ChOC confirmation at {}",
                    self.timeframe, candle.time
                );
            }
        }
    }

    fn advance_down(&mut self, candle: &Candle) {
        if !self.in_pull_back && self.in_bos && candle.direction() == Direction::Up {
            self.in_pull_back = true;
            self.in_bos = false;
            self.key_low = self.last_low;
            self.key_low_candle = self.last_low_candle;
            if let Some(t) = self.last_low_candle {
                self.key_low_candles.push(t);
            }
            info!(
                "{} DOWNTREND: BOS pullback at {}, new key low {:?}",
                self.timeframe, candle.time, self.key_low
            );
        }

        if self.choc && !self.in_choc_pull_back && candle.direction() == Direction::Down {
            self.in_choc_pull_back = true;
            self.key_high = self.last_high;
            self.key_high_candle = self.last_high_candle;
            if let Some(t) = self.last_high_candle {
                self.key_high_candles.push(t);
            }
            self.last_low = Some(candle.low);
            self.last_low_candle = Some(candle.time);
            info!(
                "{} DOWNTREND: ChOC pullback at {}, higher high {:?}",
                self.timeframe, candle.time, self.key_high
            );
        }

        let below_key_low = self.key_low.is_some_and(|kl| candle.close < kl);
        let above_key_high = self.key_high.is_some_and(|kh| candle.close > kh);

        if below_key_low && self.in_pull_back && candle.direction() == Direction::Down {
            self.bos_count += 1;
            self.in_pull_back = false;
            self.in_choc_pull_back = false;
            self.choc = false;
            self.in_bos = true;
            self.bos_candles.push(candle.time);

            match (self.last_high, self.last_high_candle) {
                (Some(last_high), Some(last_high_candle)) if candle.high <= last_high => {
                    self.key_high = Some(last_high);
                    self.key_high_candle = Some(last_high_candle);
                    self.key_high_candles.push(last_high_candle);
                }
                _ => {
                    self.key_high = Some(candle.high);
                    self.key_high_candle = Some(candle.time);
                    self.key_high_candles.push(candle.time);
                }
            }
            self.last_high = None;
            self.last_high_candle = None;
            info!(
                "{} DOWNTREND: BOS at {}, lower high {:?}",
                self.timeframe, candle.time, self.key_high
            );
        } else if above_key_high {
            if !self.choc {
                self.choc = true;
                self.last_high = Some(candle.high);
                self.last_high_candle = Some(candle.time);
                self.choc_candles.push(candle.time);
                info!("{} DOWNTREND: ChOC at {}", self.timeframe, candle.time);
            } else if self.in_choc_pull_back {
                self.choc_confirmed = true;
                self.key_low = self.last_low;
                self.key_low_candle = self.last_low_candle;
                if let Some(t) = self.last_low_candle {
                    self.key_low_candles.push(t);
                }
                self.last_high = Some(candle.high);
                self.last_high_candle = Some(candle.time);
                self.choc_confirm_candle = Some(candle.time);
                info!(
                    "{} DOWNTREND: ChOC confirmation at {}",
                    self.timeframe, candle.time
                );
            }
        }
    }

    fn update_segment_high_low(&mut self, candle: &Candle) {
        if self.segment_high.is_none() || self.segment_high.is_some_and(|h| h < candle.high) {
            self.segment_high = Some(candle.high);
            self.highest_candle = Some(candle.time);
        }
        if self.segment_low.is_none() || self.segment_low.is_some_and(|l| l > candle.low) {
            self.segment_low = Some(candle.low);
            self.lowest_candle = Some(candle.time);
        }
    }

    // Running extremes feeding the next key level. The tracker on the
    // break side is frozen while a BOS phase is active.
    fn track_last_high_low(&mut self, candle: &Candle) {
        if !(self.dir == Direction::Down && self.in_bos) {
            let replace = match self.last_high {
                None => true,
                Some(last_high) => last_high < candle.high,
            };
            if replace {
                self.last_high = Some(candle.high);
                self.last_high_candle = Some(candle.time);
            }
        }

        if !(self.dir == Direction::Up && self.in_bos) {
            let replace = match self.last_low {
                None => true,
                Some(last_low) => last_low > candle.low,
            };
            if replace {
                self.last_low = Some(candle.low);
                self.last_low_candle = Some(candle.time);
            }
        }
    }
}
