use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::BacktestError;
use crate::types::{Account, Position, PositionKind, PositionState, StrategyKind};

/// One position flattened for reports and the live payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionView {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: PositionKind,
    pub instrument: String,
    pub entry_time: NaiveDateTime,
    pub exit_time: Option<NaiveDateTime>,
    pub price: Decimal,
    pub volume: Decimal,
    /// Current (possibly trailed) stop.
    pub tsl: Option<Decimal>,
    /// Stop the position was opened with.
    pub sl: Option<Decimal>,
    pub tp: Option<Decimal>,
    pub close: Option<Decimal>,
    pub state: PositionState,
    pub profit: Decimal,
    pub reward_units: Option<Decimal>,
}

impl PositionView {
    pub fn from_position(position: &Position) -> Self {
        Self {
            id: position.id,
            kind: position.kind,
            instrument: position.instrument.clone(),
            entry_time: position.entry_time,
            exit_time: position.exit_time,
            price: position.entry_price,
            volume: position.volume,
            tsl: position.sl,
            sl: position.initial_sl,
            tp: position.tp,
            close: position.close_price,
            state: position.state,
            profit: position.profit,
            reward_units: position.reward_units,
        }
    }

    pub fn cash_profit(&self, contract_size: Decimal) -> Decimal {
        self.profit * self.volume * contract_size
    }
}

/// End-of-run summary: account outcome plus the full trade list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub strategy: StrategyKind,
    pub instrument: String,
    pub start_date: String,
    pub end_date: String,
    pub initial_balance: Decimal,
    pub final_balance: Decimal,
    pub final_equity: Decimal,
    pub min_equity: Decimal,
    pub max_equity: Decimal,
    pub net_profit: Decimal,
    pub total_return_pct: Decimal,
    pub total_trades: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub open_at_end: u64,
    pub win_rate_pct: Decimal,
    pub gross_profit: Decimal,
    pub gross_loss: Decimal,
    pub trades: Vec<PositionView>,
}

impl RunReport {
    pub fn build(
        strategy: StrategyKind,
        instrument: &str,
        start_date: &str,
        end_date: &str,
        account: &Account,
        contract_size: Decimal,
    ) -> Self {
        let trades: Vec<PositionView> = account
            .positions
            .iter()
            .map(PositionView::from_position)
            .collect();

        let closed: Vec<&PositionView> = trades
            .iter()
            .filter(|t| t.state == PositionState::Closed)
            .collect();
        let open_at_end = (trades.len() - closed.len()) as u64;

        let mut winning_trades = 0u64;
        let mut losing_trades = 0u64;
        let mut gross_profit = Decimal::ZERO;
        let mut gross_loss = Decimal::ZERO;
        for trade in &closed {
            let cash = trade.cash_profit(contract_size);
            if cash > Decimal::ZERO {
                winning_trades += 1;
                gross_profit += cash;
            } else if cash < Decimal::ZERO {
                losing_trades += 1;
                gross_loss += cash.abs();
            }
        }

        let total_trades = closed.len() as u64;
        let win_rate_pct = if total_trades > 0 {
            Decimal::from(winning_trades) / Decimal::from(total_trades) * dec!(100)
        } else {
            Decimal::ZERO
        };

        let net_profit = account.balance - account.initial_balance;
        let total_return_pct = if !account.initial_balance.is_zero() {
            net_profit / account.initial_balance * dec!(100)
        } else {
            Decimal::ZERO
        };

        Self {
            strategy,
            instrument: instrument.to_string(),
            start_date: start_date.to_string(),
            end_date: end_date.to_string(),
            initial_balance: account.initial_balance,
            final_balance: account.balance,
            final_equity: account.equity,
            min_equity: account.min_equity,
            max_equity: account.max_equity,
            net_profit,
            total_return_pct,
            total_trades,
            winning_trades,
            losing_trades,
            open_at_end,
            win_rate_pct,
            gross_profit,
            gross_loss,
            trades,
        }
    }

    /// Pretty print the summary to the console.
    pub fn print_summary(&self) {
        println!("\n{}", "=".repeat(60));
        println!("                 BACKTEST RESULTS");
        println!("{}", "=".repeat(60));
        println!("Strategy:           {}", self.strategy);
        println!("Instrument:         {}", self.instrument);
        println!("Period:             {} to {}", self.start_date, self.end_date);
        println!("{}", "-".repeat(60));
        println!("Initial Balance:    {:.2}", self.initial_balance);
        println!("Final Balance:      {:.2}", self.final_balance);
        println!(
            "Net Profit:         {:.2} ({:.2}%)",
            self.net_profit, self.total_return_pct
        );
        println!(
            "Equity (min/max):   {:.2} / {:.2}",
            self.min_equity, self.max_equity
        );
        println!("{}", "-".repeat(60));
        println!("Closed Trades:      {}", self.total_trades);
        println!(
            "Winners / Losers:   {} / {} ({:.1}% win rate)",
            self.winning_trades, self.losing_trades, self.win_rate_pct
        );
        println!("Gross Profit:       {:.2}", self.gross_profit);
        println!("Gross Loss:         {:.2}", self.gross_loss);
        println!("Open at End:        {}", self.open_at_end);
        println!("{}", "=".repeat(60));
    }

    pub fn write_json(&self, path: &Path) -> Result<(), BacktestError> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| BacktestError::Input(format!("cannot serialize report: {e}")))?;
        std::fs::write(path, json)?;
        info!("report written to {}", path.display());
        Ok(())
    }
}

/// Write-only sink for finished positions. Persisting the same position id
/// twice keeps the later record.
pub trait TradeStore {
    fn persist_positions(
        &self,
        account_id: Uuid,
        positions: &[Position],
    ) -> Result<(), BacktestError>;
}

/// Trade sink writing a JSON document per account to a file.
pub struct JsonTradeStore {
    path: PathBuf,
}

impl JsonTradeStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl TradeStore for JsonTradeStore {
    fn persist_positions(
        &self,
        account_id: Uuid,
        positions: &[Position],
    ) -> Result<(), BacktestError> {
        // last write wins per position id
        let mut by_id: HashMap<Uuid, PositionView> = HashMap::new();
        for position in positions {
            by_id.insert(position.id, PositionView::from_position(position));
        }
        let mut views: Vec<PositionView> = by_id.into_values().collect();
        views.sort_by_key(|v| (v.entry_time, v.id));

        let document = serde_json::json!({
            "account_id": account_id,
            "positions": views,
        });
        let json = serde_json::to_string_pretty(&document)
            .map_err(|e| BacktestError::Input(format!("cannot serialize trades: {e}")))?;
        std::fs::write(&self.path, json)?;
        info!(
            "persisted {} positions for account {} to {}",
            views.len(),
            account_id,
            self.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn closed_position(profit: Decimal) -> Position {
        let mut position = Position::open(
            PositionKind::Long,
            Uuid::new_v4(),
            "TEST",
            NaiveDate::from_ymd_opt(2024, 1, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            dec!(1),
            dec!(1),
            dec!(100),
            Some(dec!(90)),
            None,
        )
        .unwrap();
        position.close_at(
            position.entry_time + chrono::Duration::minutes(5),
            dec!(100) + profit,
        );
        position
    }

    #[test]
    fn report_counts_winners_and_losers() {
        let mut account = Account::new("test", dec!(1000));
        for profit in [dec!(2), dec!(-1), dec!(3)] {
            let position = closed_position(profit);
            account.balance += position.profit * position.volume * position.contract_size;
            account.positions.push(position);
        }
        account.equity = account.balance;

        let report = RunReport::build(
            StrategyKind::SimpleTrend,
            "TEST",
            "2024-01-01 00:00:00",
            "2024-01-02 00:00:00",
            &account,
            dec!(1),
        );

        assert_eq!(report.total_trades, 3);
        assert_eq!(report.winning_trades, 2);
        assert_eq!(report.losing_trades, 1);
        assert_eq!(report.gross_profit, dec!(5));
        assert_eq!(report.gross_loss, dec!(1));
        assert_eq!(report.net_profit, dec!(4));
        assert_eq!(report.final_balance, dec!(1004));
    }

    #[test]
    fn report_round_trips_through_json() {
        let account = Account::new("test", dec!(500));
        let report = RunReport::build(
            StrategyKind::PriceAction,
            "TEST",
            "2024-01-01 00:00:00",
            "2024-01-02 00:00:00",
            &account,
            dec!(10),
        );
        let json = serde_json::to_string(&report).unwrap();
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, report);
    }
}
