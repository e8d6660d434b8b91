pub mod zone_filter;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{EntryTrigger, ExitTrigger, SlLevelSource, StrategyOptions};
use crate::error::BacktestError;
use crate::structure::SignalSnapshot;
use crate::types::{Direction, PositionKind, StrategyKind, SymbolSpec};

/// A new position the advisor wants opened at the current close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub kind: PositionKind,
    pub instrument: String,
    pub volume: Decimal,
    pub price: Decimal,
    pub sl: Decimal,
    pub tp: Option<Decimal>,
}

/// Post-evaluation actions on existing positions, applied in list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PositionAction {
    Close {
        kind: PositionKind,
        instrument: String,
    },
    MoveSl {
        kind: PositionKind,
        instrument: String,
        new_sl_target: Decimal,
    },
}

/// Rule strategies over detector signals.
///
/// Stateless except for three edge-triggered latches: a ChOC event yields at
/// most one entry attempt until `low.choc` reads false again, a BOS phase
/// yields at most one BOS entry attempt and one MOVE_SL emission until
/// `low.in_bos` reads false again.
#[derive(Debug)]
pub struct Advisor {
    strategy: StrategyKind,
    instrument: String,
    symbol: SymbolSpec,
    options: StrategyOptions,
    choc_spent: bool,
    bos_spent: bool,
    move_sl_spent: bool,
}

impl Advisor {
    pub fn new(
        strategy: StrategyKind,
        instrument: &str,
        symbol: SymbolSpec,
        options: StrategyOptions,
    ) -> Self {
        Self {
            strategy,
            instrument: instrument.to_string(),
            symbol,
            options,
            choc_spent: false,
            bos_spent: false,
            move_sl_spent: false,
        }
    }

    /// Ask for at most one new order on this candle.
    pub fn generate_positions(
        &mut self,
        close: Decimal,
        balance: Decimal,
        signals: &SignalSnapshot,
    ) -> Option<OrderRequest> {
        if !signals.low.choc {
            self.choc_spent = false;
        }

        match self.strategy {
            StrategyKind::SimpleTrend => self.simple_trend_entry(close, balance, signals),
            StrategyKind::PriceAction => self.price_action_entry(close, balance, signals),
        }
    }

    /// Close/stop-move actions for existing positions on this candle.
    pub fn modify_positions(&mut self, signals: &SignalSnapshot) -> Vec<PositionAction> {
        let mut actions = Vec::new();
        let low = &signals.low;

        if !low.in_bos {
            self.bos_spent = false;
            self.move_sl_spent = false;
        }

        match self.options.exit {
            ExitTrigger::ChocConfirmed => {
                if low.choc_confirmed && low.seg_dir == Direction::Up {
                    actions.push(PositionAction::Close {
                        kind: PositionKind::Long,
                        instrument: self.instrument.clone(),
                    });
                } else if low.choc_confirmed && low.seg_dir == Direction::Down {
                    actions.push(PositionAction::Close {
                        kind: PositionKind::Short,
                        instrument: self.instrument.clone(),
                    });
                }
            }
            ExitTrigger::Choc => {
                if low.choc && low.seg_dir == Direction::Up {
                    actions.push(PositionAction::Close {
                        kind: PositionKind::Long,
                        instrument: self.instrument.clone(),
                    });
                }
                if low.choc && low.seg_dir == Direction::Down {
                    actions.push(PositionAction::Close {
                        kind: PositionKind::Short,
                        instrument: self.instrument.clone(),
                    });
                }
            }
        }

        // one stop move per BOS phase, mirroring the trend direction
        if low.in_bos && !self.move_sl_spent {
            let (kind, target) = if low.seg_dir == Direction::Down {
                (PositionKind::Short, low.key_levels.high)
            } else {
                (PositionKind::Long, low.key_levels.low)
            };
            if let Some(new_sl_target) = target {
                actions.push(PositionAction::MoveSl {
                    kind,
                    instrument: self.instrument.clone(),
                    new_sl_target,
                });
                self.move_sl_spent = true;
            }
        }

        actions
    }

    fn simple_trend_entry(
        &mut self,
        close: Decimal,
        balance: Decimal,
        signals: &SignalSnapshot,
    ) -> Option<OrderRequest> {
        let low = &signals.low;
        let mid = &signals.mid;
        let high = &signals.high;

        let mid_bullish = mid.seg_dir == Direction::Up
            || (mid.seg_dir == Direction::Down && mid.choc);
        let high_bullish = high.seg_dir == Direction::Up
            || (high.seg_dir == Direction::Down && high.choc);
        let mid_bearish = mid.seg_dir == Direction::Down
            || (mid.seg_dir == Direction::Up && mid.choc);
        let high_bearish = high.seg_dir == Direction::Down
            || (high.seg_dir == Direction::Up && high.choc);

        if mid_bullish && (high_bullish || self.options.exclude_high_trend) {
            // higher timeframes lean up; buy the low-timeframe turn
            match self.options.entry {
                EntryTrigger::ChocConfirmed
                    if low.choc_confirmed && low.seg_dir == Direction::Down =>
                {
                    let sl_raw = self.long_sl_source(signals)?;
                    let sl = sl_raw - (close - sl_raw) * self.options.sl_level_margin;
                    let tp = self.options.reward_ratio.map(|rr| close + (close - sl) * rr);
                    self.build_position(PositionKind::Long, close, sl, tp, balance)
                }
                EntryTrigger::Choc
                    if low.choc && !self.choc_spent && low.seg_dir == Direction::Down =>
                {
                    let sl_raw = self.long_sl_source(signals)?;
                    let sl = sl_raw - (close - sl_raw) * self.options.sl_level_margin;
                    let tp = self.options.reward_ratio.map(|rr| close + (close - sl) * rr);
                    self.choc_spent = true;
                    self.build_position(PositionKind::Long, close, sl, tp, balance)
                }
                _ => None,
            }
        } else if mid_bearish && (high_bearish || self.options.exclude_high_trend) {
            match self.options.entry {
                EntryTrigger::ChocConfirmed
                    if low.choc_confirmed && low.seg_dir == Direction::Up =>
                {
                    let sl_raw = self.short_sl_source(signals)?;
                    let sl = sl_raw + (sl_raw - close) * self.options.sl_level_margin;
                    let tp = self.options.reward_ratio.map(|rr| close - (sl - close) * rr);
                    self.build_position(PositionKind::Short, close, sl, tp, balance)
                }
                EntryTrigger::Choc
                    if low.choc && !self.choc_spent && low.seg_dir == Direction::Up =>
                {
                    let sl_raw = self.short_sl_source(signals)?;
                    let sl = sl_raw + (sl_raw - close) * self.options.sl_level_margin;
                    let tp = self.options.reward_ratio.map(|rr| close - (sl - close) * rr);
                    self.choc_spent = true;
                    self.build_position(PositionKind::Short, close, sl, tp, balance)
                }
                _ => None,
            }
        } else {
            None
        }
    }

    fn price_action_entry(
        &mut self,
        close: Decimal,
        balance: Decimal,
        signals: &SignalSnapshot,
    ) -> Option<OrderRequest> {
        let entry = self.options.entry;
        let low = &signals.low;

        let choc_leg = (low.choc && entry.uses_choc() && !self.choc_spent)
            || (low.choc_confirmed && entry.uses_choc_confirmed());

        if choc_leg {
            // the latch burns even when the zone tests reject the candidate
            if low.choc && entry.uses_choc() {
                self.choc_spent = true;
            }

            let key_level = if low.seg_dir == Direction::Up {
                low.segment_range.highest
            } else {
                low.segment_range.lowest
            };

            if let Some(level) = key_level {
                if let Some(interval) = zone_filter::choc_trade_zone(
                    &signals.sr_zones,
                    low.seg_dir,
                    level,
                    close,
                    &self.options,
                ) {
                    if low.seg_dir == Direction::Up {
                        // reversal short off the zone above
                        let sl_raw = self.short_sl_source(signals)?;
                        let sl_raw = sl_raw.max(interval.1);
                        let sl = sl_raw + (sl_raw - close) * self.options.sl_level_margin;
                        let tp =
                            self.options.reward_ratio.map(|rr| close - (sl - close) * rr);
                        return self.build_position(PositionKind::Short, close, sl, tp, balance);
                    } else {
                        let sl_raw = self.long_sl_source(signals)?;
                        let sl_raw = sl_raw.min(interval.0);
                        let sl = sl_raw - (close - sl_raw) * self.options.sl_level_margin;
                        let tp =
                            self.options.reward_ratio.map(|rr| close + (close - sl) * rr);
                        return self.build_position(PositionKind::Long, close, sl, tp, balance);
                    }
                }
            }
        }

        if low.in_bos && entry.uses_bos() && !self.bos_spent {
            self.bos_spent = true;

            let key_level = if low.seg_dir == Direction::Up {
                low.key_levels.low
            } else {
                low.key_levels.high
            };

            if let Some(level) = key_level {
                if let Some(interval) = zone_filter::bos_trade_zone(
                    &signals.sr_zones,
                    low.seg_dir,
                    level,
                    close,
                    &self.options,
                ) {
                    let mid_dir = signals.mid.seg_dir;
                    let high_dir = signals.high.seg_dir;

                    // continuation trades need all three levels aligned
                    if low.seg_dir == Direction::Down
                        && mid_dir == Direction::Down
                        && high_dir == Direction::Down
                    {
                        let sl_raw = low.key_levels.high?;
                        let sl_raw = sl_raw.max(interval.1);
                        let sl = sl_raw + (sl_raw - close) * self.options.sl_level_margin;
                        let tp =
                            self.options.reward_ratio.map(|rr| close - (sl - close) * rr);
                        return self.build_position(PositionKind::Short, close, sl, tp, balance);
                    } else if low.seg_dir == Direction::Up
                        && mid_dir == Direction::Up
                        && high_dir == Direction::Up
                    {
                        let sl_raw = low.key_levels.low?;
                        let sl_raw = sl_raw.min(interval.0);
                        let sl = sl_raw - (close - sl_raw) * self.options.sl_level_margin;
                        let tp =
                            self.options.reward_ratio.map(|rr| close + (close - sl) * rr);
                        return self.build_position(PositionKind::Long, close, sl, tp, balance);
                    }
                }
            }
        }

        None
    }

    fn long_sl_source(&self, signals: &SignalSnapshot) -> Option<Decimal> {
        match self.options.sl_level {
            SlLevelSource::KeyLevel => signals.low.key_levels.low,
            SlLevelSource::SegmentRange => signals.low.segment_range.lowest,
        }
    }

    fn short_sl_source(&self, signals: &SignalSnapshot) -> Option<Decimal> {
        match self.options.sl_level {
            SlLevelSource::KeyLevel => signals.low.key_levels.high,
            SlLevelSource::SegmentRange => signals.low.segment_range.highest,
        }
    }

    /// Size the order from the risked balance fraction and stop distance,
    /// then apply the volume limits of the instrument.
    fn build_position(
        &self,
        kind: PositionKind,
        close: Decimal,
        sl: Decimal,
        tp: Option<Decimal>,
        balance: Decimal,
    ) -> Option<OrderRequest> {
        let stop_distance = (close - sl).abs();
        if stop_distance.is_zero() {
            warn!(
                "{}",
                BacktestError::InvalidPositionParameters(format!(
                    "zero stop distance at close {close}"
                ))
            );
            return None;
        }

        let mut volume =
            (balance * self.options.risk_per_trade) / (stop_distance * self.symbol.trade_contract_size);

        if volume < self.symbol.volume_min {
            warn!(
                "{}",
                BacktestError::VolumeOutOfRange {
                    instrument: self.instrument.clone(),
                    volume,
                    min: self.symbol.volume_min,
                    max: self.symbol.volume_max,
                }
            );
            return None;
        } else if volume > self.symbol.volume_max {
            warn!(
                "{}; clamping",
                BacktestError::VolumeOutOfRange {
                    instrument: self.instrument.clone(),
                    volume,
                    min: self.symbol.volume_min,
                    max: self.symbol.volume_max,
                }
            );
            volume = self.symbol.volume_max;
        } else {
            // keep the volume on the instrument's step grid
            volume = volume
                .round_dp_with_strategy(self.symbol.volume_min.scale(), RoundingStrategy::ToZero);
        }

        let tp = match self.options.reward_ratio {
            Some(rr) => {
                let risk = (close - sl).abs();
                Some(match kind {
                    PositionKind::Short => close - rr * risk,
                    PositionKind::Long => close + rr * risk,
                })
            }
            None => tp,
        };

        Some(OrderRequest {
            kind,
            instrument: self.instrument.clone(),
            volume,
            price: close,
            sl,
            tp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{MoveSlOptions, ZoneInteraction};
    use crate::structure::{KeyLevels, LevelSignal, PrevSegmentSignal, SegmentRange, ZoneView};
    use crate::types::{ZoneKind, TIME_FORMAT};
    use chrono::NaiveDateTime;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn level_signal(dir: Direction) -> LevelSignal {
        LevelSignal {
            seg_id: Uuid::new_v4(),
            seg_dir: dir,
            candle_time: None,
            candle_dir: None,
            bos_count: 0,
            in_bos: false,
            in_pull_back: false,
            choc: false,
            choc_confirmed: false,
            key_levels: KeyLevels {
                high: Some(dec!(102)),
                low: Some(dec!(98)),
            },
            segment_range: SegmentRange {
                highest: Some(dec!(103)),
                lowest: Some(dec!(97)),
            },
            prev_segment: PrevSegmentSignal {
                seg_id: Uuid::new_v4(),
                seg_dir: dir,
                segment_range: SegmentRange {
                    highest: None,
                    lowest: None,
                },
            },
        }
    }

    fn snapshot(low: Direction, mid: Direction, high: Direction) -> SignalSnapshot {
        SignalSnapshot {
            low: level_signal(low),
            mid: level_signal(mid),
            high: level_signal(high),
            sr_zones: Vec::new(),
        }
    }

    fn symbol() -> SymbolSpec {
        SymbolSpec {
            name: "Step Index".to_string(),
            trade_contract_size: dec!(10),
            volume_min: dec!(0.1),
            volume_max: dec!(50),
        }
    }

    fn options() -> StrategyOptions {
        StrategyOptions {
            entry: EntryTrigger::Choc,
            exit: ExitTrigger::ChocConfirmed,
            sl_level: SlLevelSource::KeyLevel,
            sl_level_margin: Decimal::ZERO,
            reward_ratio: None,
            risk_per_trade: dec!(0.1),
            compound_risk: true,
            max_concurrent_trades: 5,
            exclude_high_trend: false,
            sr_zone_interaction: ZoneInteraction::Touch,
            sr_zone_entry_margin: dec!(0.5),
            sr_zone_proximity_margin: dec!(0.5),
            sr_zone_clearance_factor: dec!(1),
            move_sl: MoveSlOptions {
                allow: true,
                to_break_even_at_r: dec!(1),
                trailing_at_r: dec!(2),
            },
        }
    }

    fn advisor(strategy: StrategyKind, options: StrategyOptions) -> Advisor {
        Advisor::new(strategy, "Step Index", symbol(), options)
    }

    #[test]
    fn simple_trend_buys_the_low_timeframe_turn() {
        let mut advisor = advisor(StrategyKind::SimpleTrend, options());
        let mut signals = snapshot(Direction::Down, Direction::Up, Direction::Up);
        signals.low.choc = true;

        let order = advisor
            .generate_positions(dec!(101), dec!(1000), &signals)
            .expect("entry should fire");
        assert_eq!(order.kind, PositionKind::Long);
        assert_eq!(order.sl, dec!(98));
        assert_eq!(order.tp, None);
        // risk 100 over stop distance 3 with contract 10
        assert_eq!(order.volume, dec!(3.3));
    }

    #[test]
    fn choc_latch_fires_once_until_reset() {
        let mut advisor = advisor(StrategyKind::SimpleTrend, options());
        let mut signals = snapshot(Direction::Down, Direction::Up, Direction::Up);
        signals.low.choc = true;

        assert!(advisor
            .generate_positions(dec!(101), dec!(1000), &signals)
            .is_some());
        // same standing choc: latched
        assert!(advisor
            .generate_positions(dec!(101), dec!(1000), &signals)
            .is_none());

        // choc falls away, then re-fires
        signals.low.choc = false;
        assert!(advisor
            .generate_positions(dec!(101), dec!(1000), &signals)
            .is_none());
        signals.low.choc = true;
        assert!(advisor
            .generate_positions(dec!(101), dec!(1000), &signals)
            .is_some());
    }

    #[test]
    fn high_trend_disagreement_blocks_unless_excluded() {
        let mut opts = options();
        let mut signals = snapshot(Direction::Down, Direction::Up, Direction::Down);
        signals.low.choc = true;

        let mut strict = advisor(StrategyKind::SimpleTrend, opts.clone());
        assert!(strict
            .generate_positions(dec!(101), dec!(1000), &signals)
            .is_none());

        opts.exclude_high_trend = true;
        let mut relaxed = advisor(StrategyKind::SimpleTrend, opts);
        assert!(relaxed
            .generate_positions(dec!(101), dec!(1000), &signals)
            .is_some());
    }

    #[test]
    fn mirror_short_uses_segment_range_when_configured() {
        let mut opts = options();
        opts.sl_level = SlLevelSource::SegmentRange;
        opts.reward_ratio = Some(dec!(2));
        let mut advisor = advisor(StrategyKind::SimpleTrend, opts);

        let mut signals = snapshot(Direction::Up, Direction::Down, Direction::Down);
        signals.low.choc = true;

        let order = advisor
            .generate_positions(dec!(100), dec!(1000), &signals)
            .expect("short entry should fire");
        assert_eq!(order.kind, PositionKind::Short);
        assert_eq!(order.sl, dec!(103));
        // tp recomputed from the final stop distance
        assert_eq!(order.tp, Some(dec!(94)));
    }

    #[test]
    fn volume_below_minimum_rejects_the_trade() {
        let mut advisor = advisor(StrategyKind::SimpleTrend, options());
        let mut signals = snapshot(Direction::Down, Direction::Up, Direction::Up);
        signals.low.choc = true;

        // balance so small the sized volume undershoots volume_min
        assert!(advisor
            .generate_positions(dec!(101), dec!(1), &signals)
            .is_none());
    }

    #[test]
    fn volume_above_maximum_clamps() {
        let mut advisor = advisor(StrategyKind::SimpleTrend, options());
        let mut signals = snapshot(Direction::Down, Direction::Up, Direction::Up);
        signals.low.choc = true;

        let order = advisor
            .generate_positions(dec!(101), dec!(100000), &signals)
            .expect("entry should fire");
        assert_eq!(order.volume, dec!(50));
    }

    #[test]
    fn price_action_choc_burns_latch_even_on_rejection() {
        let mut advisor = advisor(StrategyKind::PriceAction, options());
        // no SR zones at all: candidate must be rejected
        let mut signals = snapshot(Direction::Up, Direction::Up, Direction::Up);
        signals.low.choc = true;

        assert!(advisor
            .generate_positions(dec!(99.9), dec!(1000), &signals)
            .is_none());
        assert!(advisor.choc_spent, "latch burns before the zone test");
    }

    #[test]
    fn price_action_reversal_short_at_resistance() {
        let mut advisor = advisor(StrategyKind::PriceAction, options());
        let mut signals = snapshot(Direction::Up, Direction::Up, Direction::Up);
        signals.low.choc = true;
        signals.sr_zones.push(ZoneView {
            id: Uuid::new_v4(),
            kind: ZoneKind::Resistance,
            x: NaiveDateTime::parse_from_str("2024-01-01 00:00:00", TIME_FORMAT).unwrap(),
            interval: (dec!(102.5), dec!(104)),
            retests: 1,
        });

        // segment high 103 touches the zone, close just below it
        let order = advisor
            .generate_positions(dec!(101.8), dec!(1000), &signals)
            .expect("reversal short should fire");
        assert_eq!(order.kind, PositionKind::Short);
        // stop pushed out to the zone top
        assert_eq!(order.sl, dec!(104));
    }

    #[test]
    fn move_sl_emitted_once_per_bos_phase() {
        let mut advisor = advisor(StrategyKind::SimpleTrend, options());
        let mut signals = snapshot(Direction::Up, Direction::Up, Direction::Up);
        signals.low.in_bos = true;

        let actions = advisor.modify_positions(&signals);
        assert!(matches!(
            actions.as_slice(),
            [PositionAction::MoveSl {
                kind: PositionKind::Long,
                ..
            }]
        ));
        assert!(advisor.modify_positions(&signals).is_empty());

        // leaving and re-entering a BOS phase re-arms the latch
        signals.low.in_bos = false;
        assert!(advisor.modify_positions(&signals).is_empty());
        signals.low.in_bos = true;
        assert_eq!(advisor.modify_positions(&signals).len(), 1);
    }

    #[test]
    fn exit_close_targets_the_reversed_direction() {
        let mut advisor = advisor(StrategyKind::SimpleTrend, options());
        let mut signals = snapshot(Direction::Up, Direction::Up, Direction::Up);
        signals.low.choc_confirmed = true;

        let actions = advisor.modify_positions(&signals);
        assert!(actions.iter().any(|a| matches!(
            a,
            PositionAction::Close {
                kind: PositionKind::Long,
                ..
            }
        )));
    }
}
