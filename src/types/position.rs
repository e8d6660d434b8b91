#![allow(dead_code)]
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::{PositionKind, PositionState};
use crate::error::BacktestError;

/// A simulated long or short position with SL/TP management.
///
/// `profit` is kept in price units; the cash effect on the account is
/// `profit * volume * contract_size`. `reward_units` is the realized
/// R-multiple against the initial stop distance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub account_id: Uuid,
    pub kind: PositionKind,
    pub instrument: String,
    pub contract_size: Decimal,
    pub volume: Decimal,
    pub entry_price: Decimal,
    pub sl: Option<Decimal>,
    pub initial_sl: Option<Decimal>,
    pub tp: Option<Decimal>,
    pub state: PositionState,
    pub entry_time: NaiveDateTime,
    pub exit_time: Option<NaiveDateTime>,
    pub close_price: Option<Decimal>,
    pub profit: Decimal,
    pub reward_units: Option<Decimal>,
}

impl Position {
    /// Open a new position, validating SL/TP sidedness against the entry.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        kind: PositionKind,
        account_id: Uuid,
        instrument: &str,
        entry_time: NaiveDateTime,
        contract_size: Decimal,
        volume: Decimal,
        entry_price: Decimal,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
    ) -> Result<Self, BacktestError> {
        if volume <= Decimal::ZERO {
            return Err(BacktestError::InvalidPositionParameters(format!(
                "volume must be positive, got {volume}"
            )));
        }
        match kind {
            PositionKind::Long => {
                if let Some(sl) = sl {
                    if sl >= entry_price {
                        return Err(BacktestError::InvalidPositionParameters(format!(
                            "stop loss {sl} on a long must be below entry {entry_price}"
                        )));
                    }
                }
                if let Some(tp) = tp {
                    if tp <= entry_price {
                        return Err(BacktestError::InvalidPositionParameters(format!(
                            "take profit {tp} on a long must be above entry {entry_price}"
                        )));
                    }
                }
            }
            PositionKind::Short => {
                if let Some(sl) = sl {
                    if sl <= entry_price {
                        return Err(BacktestError::InvalidPositionParameters(format!(
                            "stop loss {sl} on a short must be above entry {entry_price}"
                        )));
                    }
                }
                if let Some(tp) = tp {
                    if tp >= entry_price {
                        return Err(BacktestError::InvalidPositionParameters(format!(
                            "take profit {tp} on a short must be below entry {entry_price}"
                        )));
                    }
                }
            }
        }

        let position = Self {
            id: Uuid::new_v4(),
            account_id,
            kind,
            instrument: instrument.to_string(),
            contract_size,
            volume,
            entry_price,
            sl,
            initial_sl: sl,
            tp,
            state: PositionState::Open,
            entry_time,
            exit_time: None,
            close_price: None,
            profit: Decimal::ZERO,
            reward_units: None,
        };
        info!(
            "opened {} {} vol {} @ {} (sl {:?}, tp {:?})",
            position.kind, position.instrument, position.volume, position.entry_price, sl, tp
        );
        Ok(position)
    }

    pub fn is_open(&self) -> bool {
        self.state == PositionState::Open
    }

    /// Evaluate SL/TP against the candle extremes; SL wins when a single
    /// candle reaches both (pessimistic fill). Returns the realized cash
    /// profit when the position closes on this candle.
    pub fn check_and_update(
        &mut self,
        time: NaiveDateTime,
        low: Decimal,
        high: Decimal,
    ) -> Option<Decimal> {
        if self.state == PositionState::Closed {
            return None;
        }

        match self.kind {
            PositionKind::Long => {
                if let Some(sl) = self.sl {
                    if low <= sl {
                        return Some(self.close_at(time, sl));
                    }
                }
                if let Some(tp) = self.tp {
                    if high >= tp {
                        return Some(self.close_at(time, tp));
                    }
                }
            }
            PositionKind::Short => {
                if let Some(sl) = self.sl {
                    if high >= sl {
                        return Some(self.close_at(time, sl));
                    }
                }
                if let Some(tp) = self.tp {
                    if low <= tp {
                        return Some(self.close_at(time, tp));
                    }
                }
            }
        }
        None
    }

    /// Close at the given price. Returns the realized cash profit.
    pub fn close_at(&mut self, time: NaiveDateTime, price: Decimal) -> Decimal {
        if self.state == PositionState::Closed {
            warn!("attempt to close already-closed position {}", self.id);
            return Decimal::ZERO;
        }

        self.profit = match self.kind {
            PositionKind::Long => price - self.entry_price,
            PositionKind::Short => self.entry_price - price,
        };
        self.close_price = Some(price);
        self.state = PositionState::Closed;
        self.exit_time = Some(time);
        self.reward_units = self.initial_sl.and_then(|initial_sl| {
            let risk = (self.entry_price - initial_sl).abs();
            if risk.is_zero() {
                None
            } else {
                Some(self.profit / risk)
            }
        });

        let cash = self.profit * self.volume * self.contract_size;
        info!(
            "closed {} {} @ {} profit {} ({} cash, R {:?})",
            self.kind, self.instrument, price, self.profit, cash, self.reward_units
        );
        cash
    }

    /// Unrealized profit in cash terms, given the current candle extremes.
    pub fn unrealized_profit(&self, low: Decimal, high: Decimal) -> Decimal {
        if self.state == PositionState::Closed {
            return Decimal::ZERO;
        }

        let pip = match self.kind {
            PositionKind::Long => {
                if low > self.entry_price {
                    high - self.entry_price
                } else {
                    low - self.entry_price
                }
            }
            PositionKind::Short => {
                if high < self.entry_price {
                    self.entry_price - low
                } else {
                    self.entry_price - high
                }
            }
        };

        pip * self.contract_size * self.volume
    }

    /// Move the stop. The new stop must sit between the entry price and the
    /// current close: never past the close on the wrong side, never toward
    /// the losing side relative to entry.
    pub fn move_sl(&mut self, value: Decimal, close: Decimal) -> Result<(), BacktestError> {
        if self.state == PositionState::Closed {
            return Err(BacktestError::InvalidPositionParameters(
                "cannot move stop of a closed position".to_string(),
            ));
        }
        if value <= Decimal::ZERO {
            return Err(BacktestError::InvalidPositionParameters(format!(
                "stop loss must be positive, got {value}"
            )));
        }
        let valid = match self.kind {
            PositionKind::Long => value < close && value >= self.entry_price,
            PositionKind::Short => value > close && value <= self.entry_price,
        };
        if !valid {
            return Err(BacktestError::InvalidPositionParameters(format!(
                "stop {value} rejected for {} (entry {}, close {close})",
                self.kind, self.entry_price
            )));
        }
        self.sl = Some(value);
        Ok(())
    }
}

/// Simulated trading account. Owns its positions; `balance` changes only on
/// realized closes, `equity` tracks balance plus unrealized profit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub description: String,
    pub initial_balance: Decimal,
    pub balance: Decimal,
    pub equity: Decimal,
    pub min_equity: Decimal,
    pub max_equity: Decimal,
    pub positions: Vec<Position>,
}

impl Account {
    pub fn new(description: &str, balance: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            description: description.to_string(),
            initial_balance: balance,
            balance,
            equity: balance,
            min_equity: balance,
            max_equity: balance,
            positions: Vec::new(),
        }
    }

    /// Run SL/TP evaluation for every open position against this candle.
    pub fn update_positions(&mut self, time: NaiveDateTime, low: Decimal, high: Decimal) {
        for position in &mut self.positions {
            if let Some(cash) = position.check_and_update(time, low, high) {
                self.balance += cash;
            }
        }
    }

    /// Recompute equity from open positions and track the min/max range.
    pub fn update_equity(&mut self, low: Decimal, high: Decimal) -> Decimal {
        let unrealized: Decimal = self
            .positions
            .iter()
            .map(|p| p.unrealized_profit(low, high))
            .sum();
        self.equity = self.balance + unrealized;

        if self.equity > self.max_equity {
            self.max_equity = self.equity;
        } else if self.equity < self.min_equity {
            self.min_equity = self.equity;
        }
        unrealized
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.iter().filter(|p| p.is_open()).count()
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| p.is_open())
    }

    /// Close every open position matching kind and instrument at `price`.
    pub fn close_matching(
        &mut self,
        kind: PositionKind,
        instrument: &str,
        time: NaiveDateTime,
        price: Decimal,
    ) -> usize {
        let mut closed = 0;
        for position in &mut self.positions {
            if position.is_open() && position.kind == kind && position.instrument == instrument {
                self.balance += position.close_at(time, price);
                closed += 1;
            }
        }
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn t(minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(0, minute, 0)
            .unwrap()
    }

    fn long(entry: Decimal, sl: Decimal, tp: Decimal) -> Position {
        Position::open(
            PositionKind::Long,
            Uuid::new_v4(),
            "TEST",
            t(0),
            dec!(1),
            dec!(1),
            entry,
            Some(sl),
            Some(tp),
        )
        .unwrap()
    }

    #[test]
    fn rejects_stop_on_wrong_side() {
        let result = Position::open(
            PositionKind::Long,
            Uuid::new_v4(),
            "TEST",
            t(0),
            dec!(1),
            dec!(1),
            dec!(100),
            Some(dec!(101)),
            None,
        );
        assert!(result.is_err());

        let result = Position::open(
            PositionKind::Short,
            Uuid::new_v4(),
            "TEST",
            t(0),
            dec!(1),
            dec!(1),
            dec!(100),
            Some(dec!(99)),
            None,
        );
        assert!(result.is_err());
    }

    #[test]
    fn sl_takes_precedence_over_tp_on_the_same_candle() {
        // long at 100 with sl 99 / tp 101; the candle spans both
        let mut position = long(dec!(100), dec!(99), dec!(101));
        let cash = position.check_and_update(t(1), dec!(98.5), dec!(101.5));

        assert_eq!(position.state, PositionState::Closed);
        assert_eq!(position.close_price, Some(dec!(99)));
        assert_eq!(position.profit, dec!(-1));
        assert_eq!(cash, Some(dec!(-1)));
    }

    #[test]
    fn reward_units_sign_matches_profit() {
        let mut winner = long(dec!(100), dec!(99), dec!(102));
        winner.check_and_update(t(1), dec!(99.5), dec!(102.5));
        assert_eq!(winner.reward_units, Some(dec!(2)));

        let mut loser = long(dec!(100), dec!(99), dec!(102));
        loser.check_and_update(t(1), dec!(98), dec!(100.5));
        assert_eq!(loser.reward_units, Some(dec!(-1)));
    }

    #[test]
    fn unrealized_profit_uses_favorable_extreme_only_when_clear() {
        let position = long(dec!(100), dec!(95), dec!(110));
        // low above entry: favorable, read the high
        assert_eq!(position.unrealized_profit(dec!(101), dec!(103)), dec!(3));
        // low at or below entry: conservative, read the low
        assert_eq!(position.unrealized_profit(dec!(99), dec!(103)), dec!(-1));
    }

    #[test]
    fn closed_position_stays_closed() {
        let mut position = long(dec!(100), dec!(99), dec!(101));
        position.check_and_update(t(1), dec!(98), dec!(100));
        assert_eq!(position.state, PositionState::Closed);
        let again = position.check_and_update(t(2), dec!(90), dec!(110));
        assert!(again.is_none());
        assert_eq!(position.close_price, Some(dec!(99)));
        assert!(position.exit_time.unwrap() >= position.entry_time);
    }

    #[test]
    fn move_sl_validity_window() {
        let mut position = long(dec!(100), dec!(99), dec!(105));
        // to break-even, below close: fine
        assert!(position.move_sl(dec!(100), dec!(102)).is_ok());
        // past the close on the wrong side
        assert!(position.move_sl(dec!(103), dec!(102)).is_err());
        // back toward the losing side of entry
        assert!(position.move_sl(dec!(99.5), dec!(102)).is_err());
        assert_eq!(position.sl, Some(dec!(100)));
        assert_eq!(position.initial_sl, Some(dec!(99)));
    }

    #[test]
    fn account_balance_tracks_realized_closes_only() {
        let mut account = Account::new("test", dec!(1000));
        let position = long(dec!(100), dec!(99), dec!(102));
        account.positions.push(position);

        // candle that moves against the position but hits nothing
        account.update_positions(t(1), dec!(99.5), dec!(100.5));
        account.update_equity(dec!(99.5), dec!(100.5));
        assert_eq!(account.balance, dec!(1000));
        assert_eq!(account.equity, dec!(999.5));
        assert_eq!(account.min_equity, dec!(999.5));

        // candle that tags the take profit
        account.update_positions(t(2), dec!(101), dec!(102.5));
        account.update_equity(dec!(101), dec!(102.5));
        assert_eq!(account.balance, dec!(1002));
        assert_eq!(account.equity, dec!(1002));
        assert_eq!(account.max_equity, dec!(1002));
        assert_eq!(account.open_position_count(), 0);
    }
}
