use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

use super::segment::PrimarySegment;
use crate::error::BacktestError;
use crate::types::{Candle, CandleSeries, Direction, SrLevel, ZoneKind, ZoningMode};

/// A support/resistance candidate taken from one segment extreme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawZone {
    pub kind: ZoneKind,
    pub anchor_time: NaiveDateTime,
    pub full_candle: (Decimal, Decimal),
    pub body: (Decimal, Decimal),
    pub wick: (Decimal, Decimal),
}

impl RawZone {
    /// Derive a raw zone from the anchor candle of a completed segment.
    ///
    /// The wick interval leans toward the zone side: for resistance it runs
    /// from the upper body edge to the high, for support from the low to
    /// the lower body edge.
    pub fn from_candle(kind: ZoneKind, candle: &Candle) -> Self {
        let (body_low, body_high) = candle.body();
        let wick = match (kind, candle.is_bearish()) {
            (ZoneKind::Resistance, true) => (candle.open, candle.high),
            (ZoneKind::Resistance, false) => (candle.close, candle.high),
            (ZoneKind::Support, true) => (candle.low, candle.close),
            (ZoneKind::Support, false) => (candle.low, candle.open),
        };
        info!(
            "raw {} zone at {} spanning {} to {}",
            kind, candle.time, candle.low, candle.high
        );
        Self {
            kind,
            anchor_time: candle.time,
            full_candle: (candle.low, candle.high),
            body: (body_low, body_high),
            wick,
        }
    }

    /// The contributing interval under the configured zoning mode.
    pub fn interval(&self, mode: ZoningMode) -> (Decimal, Decimal) {
        match mode {
            ZoningMode::Candle => self.full_candle,
            ZoningMode::Body => self.body,
            ZoningMode::Wick => self.wick,
        }
    }
}

/// Overlapping raw zones merged into one retest-counted price interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateZone {
    pub id: Uuid,
    pub kind: ZoneKind,
    pub anchor_time: NaiveDateTime,
    pub interval: (Decimal, Decimal),
    pub retests: u32,
}

impl AggregateZone {
    fn from_raw(raw: &RawZone, mode: ZoningMode) -> Self {
        let zone = Self {
            id: Uuid::new_v4(),
            kind: raw.kind,
            anchor_time: raw.anchor_time,
            interval: raw.interval(mode),
            retests: 0,
        };
        info!(
            "aggregate {} zone {} at {} spanning {} to {}",
            zone.kind, zone.id, zone.anchor_time, zone.interval.0, zone.interval.1
        );
        zone
    }

    /// Try to absorb a raw zone. Returns false when the intervals do not
    /// overlap; a raw interval that only touches a boundary does not merge.
    fn try_merge(&mut self, raw: &RawZone, mode: ZoningMode) -> bool {
        let (raw_low, raw_high) = raw.interval(mode);
        let (agg_low, agg_high) = self.interval;

        let merged = if raw_high < agg_high && raw_high > agg_low {
            // raw top lies inside: keep the aggregate top
            Some((raw_low.min(agg_low), agg_high))
        } else if raw_high > agg_high && raw_low < agg_high {
            // raw sticks out above: extend upward
            Some((raw_low.min(agg_low), raw_high))
        } else {
            None
        };

        match merged {
            Some(interval) => {
                if raw.anchor_time < self.anchor_time {
                    self.anchor_time = raw.anchor_time;
                    self.kind = raw.kind;
                }
                self.interval = interval;
                self.retests += 1;
                true
            }
            None => false,
        }
    }
}

/// Fold raw zones, in discovery order, into pairwise-disjoint aggregates.
///
/// Order matters for retest accounting; callers must pass zones in
/// ascending segment-completion order.
pub fn aggregate_zones(raw_zones: &[RawZone], mode: ZoningMode) -> Vec<AggregateZone> {
    let mut aggregates: Vec<AggregateZone> = Vec::new();

    for raw in raw_zones {
        let absorbed = aggregates.iter_mut().any(|agg| agg.try_merge(raw, mode));
        if !absorbed {
            aggregates.push(AggregateZone::from_raw(raw, mode));
        }
    }
    aggregates
}

/// Higher-timeframe structure tracker that parses out SR zones.
///
/// Runs the same segment state machine over the two SR series, then derives
/// raw zones from completed segments and merges them. The whole structure
/// is rebuilt on every refresh; aggregate ids do not survive a rebuild.
#[derive(Debug)]
pub struct SrStructure {
    segments: HashMap<SrLevel, Vec<PrimarySegment>>,
    series: HashMap<SrLevel, CandleSeries>,
    raw_zones: Vec<RawZone>,
    aggregate_zones: Vec<AggregateZone>,
    mode: ZoningMode,
}

impl SrStructure {
    pub fn new(mode: ZoningMode) -> Self {
        Self {
            segments: SrLevel::all()
                .into_iter()
                .map(|level| (level, vec![PrimarySegment::new(level.as_str())]))
                .collect(),
            series: SrLevel::all()
                .into_iter()
                .map(|level| (level, CandleSeries::new()))
                .collect(),
            raw_zones: Vec::new(),
            aggregate_zones: Vec::new(),
            mode,
        }
    }

    /// Rebuild segments and zones from a fresh lookback of SR candles.
    pub fn rebuild(&mut self, data: HashMap<SrLevel, CandleSeries>) -> Result<(), BacktestError> {
        for level in SrLevel::all() {
            self.segments
                .insert(level, vec![PrimarySegment::new(level.as_str())]);
            self.series.insert(level, data.get(&level).cloned().unwrap_or_default());
        }

        for level in SrLevel::all() {
            let candles: Vec<Candle> = self
                .series
                .get(&level)
                .map(|s| s.candles().to_vec())
                .unwrap_or_default();
            for candle in &candles {
                self.process_candle(level, candle)?;
            }
        }

        self.compile_raw_zones();
        self.aggregate_zones = aggregate_zones(&self.raw_zones, self.mode);
        Ok(())
    }

    fn process_candle(&mut self, level: SrLevel, candle: &Candle) -> Result<(), BacktestError> {
        let Some(segments) = self.segments.get_mut(&level) else {
            return Err(BacktestError::DetectorInvariant(format!(
                "SR level {level} not initialized"
            )));
        };
        if segments.last().is_some_and(|s| s.choc_confirmed) {
            let follow_on = PrimarySegment::follow_on(segments.last().expect("non-empty"));
            segments.push(follow_on);
        }
        segments
            .last_mut()
            .expect("segment list never empty")
            .add_candle(candle)
    }

    /// Derive raw zones from the extremes of completed non-first segments.
    fn compile_raw_zones(&mut self) {
        self.raw_zones.clear();

        for level in SrLevel::all() {
            let (Some(segments), Some(series)) =
                (self.segments.get(&level), self.series.get(&level))
            else {
                continue;
            };

            // the first segment may not have a well-formed character and the
            // growing one is not done printing its extreme
            for segment in segments.iter().skip(1).filter(|s| s.choc_confirmed) {
                let anchored = match segment.dir {
                    Direction::Up => segment
                        .highest_candle
                        .map(|t| (ZoneKind::Resistance, t)),
                    Direction::Down => segment.lowest_candle.map(|t| (ZoneKind::Support, t)),
                    Direction::Undetermined => None,
                };
                let Some((kind, anchor_time)) = anchored else {
                    continue;
                };
                match series.at_time(anchor_time) {
                    Some(candle) => self.raw_zones.push(RawZone::from_candle(kind, candle)),
                    None => warn!(
                        "anchor candle {} missing from {} SR series",
                        anchor_time, level
                    ),
                }
            }
        }
    }

    pub fn zones(&self) -> &[AggregateZone] {
        &self.aggregate_zones
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TIME_FORMAT;
    use rust_decimal_macros::dec;

    fn at(minute: i64) -> NaiveDateTime {
        NaiveDateTime::parse_from_str("2024-01-01 00:00:00", TIME_FORMAT).unwrap()
            + chrono::Duration::minutes(minute)
    }

    fn raw(minute: i64, low: Decimal, high: Decimal) -> RawZone {
        RawZone {
            kind: ZoneKind::Resistance,
            anchor_time: at(minute),
            full_candle: (low, high),
            body: (low, high),
            wick: (low, high),
        }
    }

    #[test]
    fn wick_interval_depends_on_kind_and_candle_direction() {
        let bearish = Candle::new(at(0), dec!(102), dec!(103), dec!(99), dec!(100));
        let bullish = Candle::new(at(0), dec!(100), dec!(103), dec!(99), dec!(102));

        let resistance = RawZone::from_candle(ZoneKind::Resistance, &bearish);
        assert_eq!(resistance.wick, (dec!(102), dec!(103)));
        assert_eq!(resistance.body, (dec!(100), dec!(102)));
        assert_eq!(resistance.full_candle, (dec!(99), dec!(103)));

        let resistance = RawZone::from_candle(ZoneKind::Resistance, &bullish);
        assert_eq!(resistance.wick, (dec!(102), dec!(103)));

        let support = RawZone::from_candle(ZoneKind::Support, &bearish);
        assert_eq!(support.wick, (dec!(99), dec!(100)));

        let support = RawZone::from_candle(ZoneKind::Support, &bullish);
        assert_eq!(support.wick, (dec!(99), dec!(100)));
    }

    #[test]
    fn overlapping_zones_merge_with_retest_count() {
        // A=[100,102], B=[101,103] overlap; C=[104,105] stands alone
        let raw_zones = vec![
            raw(0, dec!(100), dec!(102)),
            raw(1, dec!(101), dec!(103)),
            raw(2, dec!(104), dec!(105)),
        ];
        let aggregates = aggregate_zones(&raw_zones, ZoningMode::Candle);

        assert_eq!(aggregates.len(), 2);
        assert_eq!(aggregates[0].interval, (dec!(100), dec!(103)));
        assert_eq!(aggregates[0].retests, 1);
        assert_eq!(aggregates[0].anchor_time, at(0));
        assert_eq!(aggregates[1].interval, (dec!(104), dec!(105)));
        assert_eq!(aggregates[1].retests, 0);
    }

    #[test]
    fn touching_boundaries_do_not_merge() {
        let raw_zones = vec![raw(0, dec!(100), dec!(102)), raw(1, dec!(98), dec!(100))];
        let aggregates = aggregate_zones(&raw_zones, ZoningMode::Candle);
        assert_eq!(aggregates.len(), 2, "rhi == alo must not merge");
    }

    #[test]
    fn merge_takes_the_earlier_anchor() {
        let mut first = raw(5, dec!(100), dec!(102));
        first.kind = ZoneKind::Resistance;
        let mut second = raw(1, dec!(101), dec!(103));
        second.kind = ZoneKind::Support;

        let aggregates = aggregate_zones(&[first, second], ZoningMode::Candle);
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].anchor_time, at(1));
        assert_eq!(aggregates[0].kind, ZoneKind::Support);
    }

    #[test]
    fn aggregates_are_pairwise_disjoint_and_cover_raws() {
        let raw_zones = vec![
            raw(0, dec!(100), dec!(103)),
            raw(1, dec!(102), dec!(105)),
            raw(2, dec!(104), dec!(107)),
            raw(3, dec!(110), dec!(111)),
            raw(4, dec!(109), dec!(110.5)),
        ];
        let aggregates = aggregate_zones(&raw_zones, ZoningMode::Candle);

        for (i, a) in aggregates.iter().enumerate() {
            for b in aggregates.iter().skip(i + 1) {
                assert!(
                    a.interval.1 <= b.interval.0 || b.interval.1 <= a.interval.0,
                    "aggregates {:?} and {:?} overlap",
                    a.interval,
                    b.interval
                );
            }
        }
        for raw_zone in &raw_zones {
            let (lo, hi) = raw_zone.interval(ZoningMode::Candle);
            assert!(
                aggregates
                    .iter()
                    .any(|a| lo <= a.interval.1 && hi >= a.interval.0),
                "raw {:?} not covered",
                raw_zone.full_candle
            );
        }
    }

    #[test]
    fn sr_structure_extracts_zones_from_completed_segments() {
        // drive one SR level through two full segments so the second
        // completed segment's extreme becomes a raw zone
        let swings: Vec<(Decimal, Decimal)> = vec![
            // up segment: bootstrap, pullback, BOS
            (dec!(100), dec!(101)),
            (dec!(101), dec!(100.5)),
            (dec!(100.5), dec!(102)),
            // choc, pullback, confirm -> segment 1 closes
            (dec!(102), dec!(98)),
            (dec!(98), dec!(99)),
            (dec!(99), dec!(97)),
            // down segment: pullback then break -> structure continues
            (dec!(97), dec!(97.5)),
            (dec!(97.5), dec!(96)),
            // choc, pullback, confirm -> segment 2 closes
            (dec!(96), dec!(99.5)),
            (dec!(99.5), dec!(99)),
            (dec!(99), dec!(100.5)),
            // one more candle opens segment 3
            (dec!(100.5), dec!(100)),
        ];

        let mut candles = CandleSeries::new();
        for (i, (open, close)) in swings.iter().enumerate() {
            candles.push(Candle::new(
                at(i as i64),
                *open,
                *open.max(close),
                *open.min(close),
                *close,
            ));
        }

        let mut structure = SrStructure::new(ZoningMode::Candle);
        let mut data = HashMap::new();
        data.insert(SrLevel::Low, candles);
        data.insert(SrLevel::High, CandleSeries::new());
        structure.rebuild(data).unwrap();

        // only the second completed segment contributes (first is skipped)
        assert_eq!(structure.zones().len(), 1);
        let zone = &structure.zones()[0];
        assert_eq!(zone.kind, ZoneKind::Support);
        // anchored at the lowest candle of the down segment
        assert_eq!(zone.anchor_time, at(7));
        assert_eq!(zone.interval, (dec!(96), dec!(97.5)));
    }
}
