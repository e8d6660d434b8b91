use rust_decimal::Decimal;

use crate::config::{StrategyOptions, ZoneInteraction};
use crate::structure::ZoneView;
use crate::types::Direction;

/// SR-zone geometry behind PRICE_ACTION entries: a key level must interact
/// with a zone, price must be exiting that zone on the reversal side, and no
/// other zone may crowd the trade path.

/// Zone whose interval contains the key level.
fn in_zone(zones: &[ZoneView], key_level: Decimal) -> Option<&ZoneView> {
    zones
        .iter()
        .find(|zone| key_level >= zone.low() && key_level <= zone.high())
}

/// Zone whose proximity band, extended on the side consistent with the
/// impending reversal, contains the key level.
fn around_zone(
    zones: &[ZoneView],
    seg_dir: Direction,
    key_level: Decimal,
    proximity_margin: Decimal,
) -> Option<&ZoneView> {
    zones.iter().find(|zone| {
        let allowed = zone.width() * proximity_margin;
        match seg_dir {
            Direction::Up => key_level >= zone.low() && key_level <= zone.high() + allowed,
            Direction::Down => key_level <= zone.high() && key_level >= zone.low() - allowed,
            Direction::Undetermined => false,
        }
    })
}

/// Close must sit just outside the zone on the reversal side, no farther
/// than `entry_margin` zone-widths away.
fn zone_exit(
    interval: (Decimal, Decimal),
    seg_dir: Direction,
    close: Decimal,
    entry_margin: Decimal,
) -> bool {
    let allowed = (interval.1 - interval.0) * entry_margin;
    match seg_dir {
        Direction::Up => {
            let distance = interval.0 - close;
            distance > Decimal::ZERO && distance <= allowed
        }
        Direction::Down => {
            let distance = close - interval.1;
            distance > Decimal::ZERO && distance <= allowed
        }
        Direction::Undetermined => false,
    }
}

/// No other zone may overlap the clearance band extending from the
/// candidate in the trade direction. The candidate clears itself.
fn zone_clearance(
    zones: &[ZoneView],
    seg_dir: Direction,
    interval: (Decimal, Decimal),
    clearance_factor: Decimal,
) -> bool {
    let size = (interval.1 - interval.0) * clearance_factor;
    let band = match seg_dir {
        Direction::Down => (interval.1, interval.1 + size),
        _ => (interval.0 - size, interval.0),
    };
    zones
        .iter()
        .all(|zone| zone.low() >= band.1 || zone.high() <= band.0)
}

/// Qualify a ChOC-triggered entry: the segment extreme must interact with a
/// zone that also passes the exit and clearance tests. Returns the zone
/// interval backing the trade.
pub fn choc_trade_zone(
    zones: &[ZoneView],
    seg_dir: Direction,
    key_level: Decimal,
    close: Decimal,
    options: &StrategyOptions,
) -> Option<(Decimal, Decimal)> {
    let zone = match options.sr_zone_interaction {
        ZoneInteraction::Touch => in_zone(zones, key_level),
        ZoneInteraction::Proximity => {
            around_zone(zones, seg_dir, key_level, options.sr_zone_proximity_margin)
        }
    }?;
    let interval = zone.interval;

    if zone_exit(interval, seg_dir, close, options.sr_zone_entry_margin)
        && zone_clearance(zones, seg_dir, interval, options.sr_zone_clearance_factor)
    {
        Some(interval)
    } else {
        None
    }
}

/// Qualify a BOS-triggered entry. The structural key level anchors the
/// interaction test while the exit/clearance side flips to the direction
/// the break trades into.
pub fn bos_trade_zone(
    zones: &[ZoneView],
    seg_dir: Direction,
    key_level: Decimal,
    close: Decimal,
    options: &StrategyOptions,
) -> Option<(Decimal, Decimal)> {
    let bos_dir = seg_dir.opposite();

    let zone = match options.sr_zone_interaction {
        ZoneInteraction::Touch => in_zone(zones, key_level),
        ZoneInteraction::Proximity => {
            around_zone(zones, bos_dir, key_level, options.sr_zone_proximity_margin)
        }
    }?;
    let interval = zone.interval;

    if zone_exit(interval, bos_dir, close, options.sr_zone_entry_margin)
        && zone_clearance(zones, bos_dir, interval, options.sr_zone_clearance_factor)
    {
        Some(interval)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        EntryTrigger, ExitTrigger, MoveSlOptions, SlLevelSource, StrategyOptions,
    };
    use crate::types::{ZoneKind, TIME_FORMAT};
    use chrono::NaiveDateTime;
    use rust_decimal_macros::dec;
    use uuid::Uuid;

    fn zone(low: Decimal, high: Decimal) -> ZoneView {
        ZoneView {
            id: Uuid::new_v4(),
            kind: ZoneKind::Resistance,
            x: NaiveDateTime::parse_from_str("2024-01-01 00:00:00", TIME_FORMAT).unwrap(),
            interval: (low, high),
            retests: 0,
        }
    }

    fn options(interaction: ZoneInteraction) -> StrategyOptions {
        StrategyOptions {
            entry: EntryTrigger::Choc,
            exit: ExitTrigger::Choc,
            sl_level: SlLevelSource::KeyLevel,
            sl_level_margin: Decimal::ZERO,
            reward_ratio: None,
            risk_per_trade: dec!(0.1),
            compound_risk: true,
            max_concurrent_trades: 5,
            exclude_high_trend: false,
            sr_zone_interaction: interaction,
            sr_zone_entry_margin: dec!(0.5),
            sr_zone_proximity_margin: dec!(0.5),
            sr_zone_clearance_factor: dec!(1),
            move_sl: MoveSlOptions::default(),
        }
    }

    #[test]
    fn touch_requires_level_inside_zone() {
        let zones = vec![zone(dec!(100), dec!(102))];
        let opts = options(ZoneInteraction::Touch);

        // segment high 101 inside the zone, close just below it
        assert!(
            choc_trade_zone(&zones, Direction::Up, dec!(101), dec!(99.5), &opts).is_some()
        );
        // level outside the zone
        assert!(
            choc_trade_zone(&zones, Direction::Up, dec!(103), dec!(99.5), &opts).is_none()
        );
    }

    #[test]
    fn proximity_extends_the_reversal_side() {
        let zones = vec![zone(dec!(100), dec!(102))];
        let opts = options(ZoneInteraction::Proximity);

        // width 2, margin 0.5 -> allowed overshoot 1 above the zone
        assert!(
            choc_trade_zone(&zones, Direction::Up, dec!(102.9), dec!(99.5), &opts).is_some()
        );
        assert!(
            choc_trade_zone(&zones, Direction::Up, dec!(103.1), dec!(99.5), &opts).is_none()
        );
    }

    #[test]
    fn zone_exit_needs_close_just_outside() {
        let zones = vec![zone(dec!(100), dec!(102))];
        let opts = options(ZoneInteraction::Touch);

        // close still inside the zone: no exit yet
        assert!(
            choc_trade_zone(&zones, Direction::Up, dec!(101), dec!(100.5), &opts).is_none()
        );
        // close too far below: exit overshot (allowed 1)
        assert!(
            choc_trade_zone(&zones, Direction::Up, dec!(101), dec!(98.5), &opts).is_none()
        );
        // short side: close just above the zone
        assert!(
            choc_trade_zone(&zones, Direction::Down, dec!(101), dec!(102.5), &opts).is_some()
        );
    }

    #[test]
    fn crowding_zone_blocks_clearance() {
        let candidate = zone(dec!(100), dec!(102));
        let opts = options(ZoneInteraction::Touch);

        // clearance band for an UP-segment reversal is [98, 100)
        let blocker = zone(dec!(98.5), dec!(99.5));
        let zones = vec![candidate.clone(), blocker];
        assert!(
            choc_trade_zone(&zones, Direction::Up, dec!(101), dec!(99.9), &opts).is_none()
        );

        // a zone clear of the band does not interfere
        let distant = zone(dec!(95), dec!(97.9));
        let zones = vec![candidate, distant];
        assert!(
            choc_trade_zone(&zones, Direction::Up, dec!(101), dec!(99.9), &opts).is_some()
        );
    }

    #[test]
    fn bos_zone_flips_the_test_side() {
        let zones = vec![zone(dec!(100), dec!(102))];
        let opts = options(ZoneInteraction::Touch);

        // DOWN segment breaking lower trades DOWN off its key high; the
        // exit test then runs on the UP side of the zone
        assert!(
            bos_trade_zone(&zones, Direction::Down, dec!(101), dec!(99.5), &opts).is_some()
        );
        assert!(
            bos_trade_zone(&zones, Direction::Down, dec!(101), dec!(102.5), &opts).is_none()
        );
    }
}
