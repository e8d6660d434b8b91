#![allow(dead_code)]
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Direction;

/// Timestamp format used by candle files and config dates.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// A single OHLC candle. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub time: NaiveDateTime,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
}

impl Candle {
    pub fn new(
        time: NaiveDateTime,
        open: Decimal,
        high: Decimal,
        low: Decimal,
        close: Decimal,
    ) -> Self {
        Self {
            time,
            open,
            high,
            low,
            close,
        }
    }

    /// UP if the candle closed above its open, DOWN otherwise.
    pub fn direction(&self) -> Direction {
        if self.close > self.open {
            Direction::Up
        } else {
            Direction::Down
        }
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }

    /// Lower and upper edge of the candle body.
    pub fn body(&self) -> (Decimal, Decimal) {
        (self.open.min(self.close), self.open.max(self.close))
    }
}

/// A time-ordered run of candles for one timeframe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    pub fn new() -> Self {
        Self {
            candles: Vec::new(),
        }
    }

    pub fn from_candles(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub fn push(&mut self, candle: Candle) {
        self.candles.push(candle);
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Candle> {
        self.candles.get(index)
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Candle> {
        self.candles.iter()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Index of the candle with exactly this timestamp.
    pub fn index_of(&self, time: NaiveDateTime) -> Option<usize> {
        self.candles.binary_search_by_key(&time, |c| c.time).ok()
    }

    /// Candle with exactly this timestamp.
    pub fn at_time(&self, time: NaiveDateTime) -> Option<&Candle> {
        self.index_of(time).map(|i| &self.candles[i])
    }

    /// Copy of the half-open index range `[start, end)`, clamped to bounds.
    pub fn window(&self, start: usize, end: usize) -> CandleSeries {
        let end = end.min(self.candles.len());
        let start = start.min(end);
        CandleSeries {
            candles: self.candles[start..end].to_vec(),
        }
    }

    /// The last `n` candles (or the whole series when shorter).
    pub fn tail(&self, n: usize) -> &[Candle] {
        let len = self.candles.len();
        &self.candles[len.saturating_sub(n)..]
    }
}
