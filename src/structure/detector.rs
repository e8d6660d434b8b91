#![allow(dead_code)]
use std::collections::HashMap;

use tracing::{debug, info};

use super::segment::PrimarySegment;
use super::signals::{
    Annotation, KeyLevels, LevelAnnotation, LevelSignal, PrevSegmentSignal, SegmentRange,
    SignalSnapshot, ZoneView,
};
use super::zones::SrStructure;
use crate::error::BacktestError;
use crate::types::{Candle, CandleSeries, PstLevel, SrLevel, ZoningMode};

/// Multi-timeframe structure detector.
///
/// Owns one segment chain per PST level plus the SR structure, and projects
/// their state into signal snapshots and chart annotations. Candle feeding
/// and SR refreshes are driven externally by the backtest engine, which
/// keeps everything on the low-timeframe clock.
#[derive(Debug)]
pub struct StructureDetector {
    segments: HashMap<PstLevel, Vec<PrimarySegment>>,
    series: HashMap<PstLevel, CandleSeries>,
    sr_structure: Option<SrStructure>,
    zoning_mode: ZoningMode,
}

impl StructureDetector {
    pub fn new(zoning_mode: ZoningMode) -> Self {
        Self {
            segments: PstLevel::all()
                .into_iter()
                .map(|level| (level, vec![PrimarySegment::new(level.as_str())]))
                .collect(),
            series: PstLevel::all()
                .into_iter()
                .map(|level| (level, CandleSeries::new()))
                .collect(),
            sr_structure: None,
            zoning_mode,
        }
    }

    /// Replay the warm-up windows through the PST machines and, when SR data
    /// is present, build the initial zone set.
    pub fn initialize(
        &mut self,
        pst_warmup: HashMap<PstLevel, CandleSeries>,
        sr_warmup: Option<HashMap<SrLevel, CandleSeries>>,
    ) -> Result<(), BacktestError> {
        info!("initializing structure detector from warm-up windows");

        for level in PstLevel::all() {
            let candles: Vec<Candle> = pst_warmup
                .get(&level)
                .map(|s| s.candles().to_vec())
                .unwrap_or_default();
            debug!("warming up {} level with {} candles", level, candles.len());
            for candle in &candles {
                self.add_candle(level, candle)?;
            }
        }

        if let Some(sr_data) = sr_warmup {
            self.refresh_zones(sr_data)?;
        }
        Ok(())
    }

    /// Feed one candle to a PST level. Starts a follow-on segment first when
    /// the previous candle confirmed a ChOC.
    pub fn add_candle(&mut self, level: PstLevel, candle: &Candle) -> Result<(), BacktestError> {
        if let Some(series) = self.series.get_mut(&level) {
            series.push(*candle);
        }

        let Some(segments) = self.segments.get_mut(&level) else {
            return Err(BacktestError::DetectorInvariant(format!(
                "PST level {level} not initialized"
            )));
        };
        if segments.last().is_some_and(|s| s.choc_confirmed) {
            debug!("appending follow-on segment on {} level", level);
            let follow_on = PrimarySegment::follow_on(segments.last().expect("non-empty"));
            segments.push(follow_on);
        }
        segments
            .last_mut()
            .expect("segment list never empty")
            .add_candle(candle)
    }

    /// Rebuild the SR structure from a fresh lookback of SR candles. Zone
    /// identities do not survive this call.
    pub fn refresh_zones(
        &mut self,
        sr_data: HashMap<SrLevel, CandleSeries>,
    ) -> Result<(), BacktestError> {
        let structure = self
            .sr_structure
            .get_or_insert_with(|| SrStructure::new(self.zoning_mode));
        structure.rebuild(sr_data)
    }

    pub fn zone_views(&self) -> Vec<ZoneView> {
        self.sr_structure
            .as_ref()
            .map(|sr| {
                sr.zones()
                    .iter()
                    .map(|zone| ZoneView {
                        id: zone.id,
                        kind: zone.kind,
                        x: zone.anchor_time,
                        interval: zone.interval,
                        retests: zone.retests,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Project the current structure state for the advisor.
    pub fn signal_snapshot(&self) -> SignalSnapshot {
        SignalSnapshot {
            low: self.level_signal(PstLevel::Low),
            mid: self.level_signal(PstLevel::Mid),
            high: self.level_signal(PstLevel::High),
            sr_zones: self.zone_views(),
        }
    }

    fn level_signal(&self, level: PstLevel) -> LevelSignal {
        let segments = self
            .segments
            .get(&level)
            .expect("all PST levels initialized in new()");
        let active = segments.last().expect("segment list never empty");
        // before the first rollover the previous segment is the active one
        let prev = if segments.len() < 2 {
            active
        } else {
            &segments[segments.len() - 2]
        };

        let candle_time = active.candles.last().copied();
        let candle_dir = candle_time.and_then(|t| {
            self.series
                .get(&level)
                .and_then(|s| s.at_time(t))
                .map(|c| c.direction())
        });

        LevelSignal {
            seg_id: active.id,
            seg_dir: active.dir,
            candle_time,
            candle_dir,
            bos_count: active.bos_count,
            in_bos: active.in_bos,
            in_pull_back: active.in_pull_back,
            choc: active.choc,
            choc_confirmed: active.choc_confirmed,
            key_levels: KeyLevels {
                high: active.key_high,
                low: active.key_low,
            },
            segment_range: SegmentRange {
                highest: active.segment_high,
                lowest: active.segment_low,
            },
            prev_segment: PrevSegmentSignal {
                seg_id: prev.id,
                seg_dir: prev.dir,
                segment_range: SegmentRange {
                    highest: prev.segment_high,
                    lowest: prev.segment_low,
                },
            },
        }
    }

    /// Build chart annotations over a trailing window of `candle_length`
    /// low-timeframe candles, scaled per level by the timeframe ratios.
    pub fn annotation(
        &self,
        ratios: &HashMap<PstLevel, usize>,
        candle_length: usize,
    ) -> Annotation {
        Annotation {
            pst_low: self.level_annotation(PstLevel::Low, ratios, candle_length),
            pst_mid: self.level_annotation(PstLevel::Mid, ratios, candle_length),
            pst_high: self.level_annotation(PstLevel::High, ratios, candle_length),
            sr_zones: self.zone_views(),
            account: None,
        }
    }

    fn level_annotation(
        &self,
        level: PstLevel,
        ratios: &HashMap<PstLevel, usize>,
        candle_length: usize,
    ) -> LevelAnnotation {
        let segments = self
            .segments
            .get(&level)
            .expect("all PST levels initialized in new()");
        let ratio = ratios.get(&level).copied().unwrap_or(1).max(1);

        // walk segments backward until the candle budget for this level is
        // spent, then collect markers from those segments
        let mut budget = (candle_length / ratio) as i64;
        let mut take = 0usize;
        while take < segments.len() {
            take += 1;
            budget -= segments[segments.len() - take].candle_count() as i64;
            if budget <= 0 {
                break;
            }
        }

        let mut annotation = LevelAnnotation::default();
        for segment in segments.iter().rev().take(take) {
            annotation.bos.extend(segment.bos_candles.iter().copied());
            annotation.choc.extend(segment.choc_candles.iter().copied());
            if let Some(t) = segment.choc_confirm_candle {
                annotation.choc_confirm.push(t);
            }
            annotation.min = match (annotation.min, segment.segment_low) {
                (None, low) => low,
                (Some(current), Some(low)) if low < current => Some(low),
                (current, _) => current,
            };
            annotation.max = match (annotation.max, segment.segment_high) {
                (None, high) => high,
                (Some(current), Some(high)) if high > current => Some(high),
                (current, _) => current,
            };
        }

        let active = segments.last().expect("segment list never empty");
        annotation.timeframe = active.timeframe.clone();
        annotation.dir = active.dir;
        annotation.key_high = active.key_high;
        annotation.key_low = active.key_low;
        annotation.in_choc = active.choc;
        annotation
    }

    pub fn segment_count(&self, level: PstLevel) -> usize {
        self.segments.get(&level).map(|s| s.len()).unwrap_or(0)
    }

    /// Invariant check used by tests: at most the last segment per level is
    /// still unconfirmed.
    #[cfg(test)]
    pub fn assert_segment_chain(&self) {
        for level in PstLevel::all() {
            let segments = &self.segments[&level];
            for segment in &segments[..segments.len() - 1] {
                assert!(
                    segment.choc_confirmed,
                    "non-terminal segment before the last on {level}"
                );
            }
        }
    }
}
