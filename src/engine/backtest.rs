use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use super::publisher::{LivePayload, SnapshotSink};
use super::results::{PositionView, RunReport, TradeStore};
use crate::config::BacktestConfig;
use crate::data;
use crate::error::BacktestError;
use crate::strategies::{Advisor, OrderRequest, PositionAction};
use crate::structure::{AccountAnnotation, StructureDetector};
use crate::types::{Account, CandleSeries, Position, PositionKind, PstLevel, SrLevel};

/// Core backtesting engine.
///
/// Streams low-timeframe candles between the configured start and end,
/// interleaving the structure detector, the strategy advisor and the
/// simulated account. The whole loop is single-threaded; given identical
/// inputs and options the resulting positions and final balance are
/// bit-identical across runs.
pub struct BacktestEngine {
    config: BacktestConfig,
    pst_data: HashMap<PstLevel, CandleSeries>,
    sr_data: Option<HashMap<SrLevel, CandleSeries>>,
    pst_ratios: HashMap<PstLevel, usize>,
    sr_ratios: HashMap<SrLevel, usize>,
    pst_sr_ratio: usize,
    detector: StructureDetector,
    advisor: Advisor,
    account: Account,
    publisher: Option<Box<dyn SnapshotSink>>,
    cancel: Arc<AtomicBool>,
}

impl BacktestEngine {
    /// Load candle files per the configuration and assemble an engine.
    pub fn from_files(config: BacktestConfig) -> Result<Self, BacktestError> {
        let mut pst_data = HashMap::new();
        for (level, path) in config.pst_paths() {
            pst_data.insert(level, data::load_candles(&path, config.strict_candles)?);
        }

        let sr_data = match config.sr_paths() {
            Some(paths) => {
                let mut loaded = HashMap::new();
                for (level, path) in paths {
                    loaded.insert(level, data::load_candles(&path, config.strict_candles)?);
                }
                Some(loaded)
            }
            None => None,
        };

        Self::new(config, pst_data, sr_data)
    }

    /// Assemble an engine from preloaded candle series.
    pub fn new(
        config: BacktestConfig,
        pst_data: HashMap<PstLevel, CandleSeries>,
        sr_data: Option<HashMap<SrLevel, CandleSeries>>,
    ) -> Result<Self, BacktestError> {
        config.validate()?;

        let low = pst_data
            .get(&PstLevel::Low)
            .ok_or_else(|| BacktestError::Input("missing low PST series".to_string()))?;

        let mut pst_ratios = HashMap::new();
        pst_ratios.insert(PstLevel::Low, 1usize);
        for level in [PstLevel::Mid, PstLevel::High] {
            let series = pst_data.get(&level).ok_or_else(|| {
                BacktestError::Input(format!("missing {level} PST series"))
            })?;
            pst_ratios.insert(level, data::level_ratio(low, series, level.as_str())?);
        }

        let mut sr_ratios = HashMap::new();
        let mut pst_sr_ratio = 1usize;
        if let Some(sr_data) = &sr_data {
            let sr_low = sr_data
                .get(&SrLevel::Low)
                .ok_or_else(|| BacktestError::Input("missing low SR series".to_string()))?;
            let sr_high = sr_data
                .get(&SrLevel::High)
                .ok_or_else(|| BacktestError::Input("missing high SR series".to_string()))?;
            sr_ratios.insert(SrLevel::Low, 1usize);
            sr_ratios.insert(SrLevel::High, data::level_ratio(sr_low, sr_high, "sr high")?);
            pst_sr_ratio = data::level_ratio(low, sr_low, "sr low")?;
        }

        let detector = StructureDetector::new(config.zoning_mode);
        let advisor = Advisor::new(
            config.strategy,
            &config.instrument,
            config.symbol.clone(),
            config.options.clone(),
        );
        let description = format!(
            "{} {} {} to {}",
            config.strategy, config.instrument, config.start_date, config.end_date
        );
        let account = Account::new(&description, config.init_account_balance);

        Ok(Self {
            config,
            pst_data,
            sr_data,
            pst_ratios,
            sr_ratios,
            pst_sr_ratio,
            detector,
            advisor,
            account,
            publisher: None,
            cancel: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Attach a live-snapshot consumer (optional).
    pub fn with_publisher(mut self, publisher: Box<dyn SnapshotSink>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Flag checked between candles for cooperative cancellation.
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Run the simulation and produce the end-of-run report.
    pub fn run(&mut self) -> Result<RunReport, BacktestError> {
        let start = self.config.start()?;
        let end = self.config.end()?;

        let low_series = self
            .pst_data
            .get(&PstLevel::Low)
            .cloned()
            .ok_or_else(|| BacktestError::Input("missing low PST series".to_string()))?;

        let start_index = low_series.index_of(start).ok_or_else(|| {
            BacktestError::Input(format!("start_date {start} not found in the low series"))
        })?;
        // a missing end date falls back to the last candle
        let end_index = low_series
            .index_of(end)
            .unwrap_or_else(|| low_series.len() - 1);

        info!(
            "running backtest: {} on {} from {} to {} ({} candles)",
            self.config.strategy,
            self.config.instrument,
            start,
            end,
            end_index + 1 - start_index
        );

        // warm the detector up on the lookback windows preceding the start
        let pst_warmup = self.pst_warm_up(start_index);
        let sr_warmup = self.sr_warm_up(start_index);
        self.detector.initialize(pst_warmup, sr_warmup)?;

        for index in start_index..=end_index {
            if self.cancel.load(Ordering::Relaxed) {
                info!("backtest cancelled at candle index {index}");
                break;
            }
            let Some(candle) = low_series.get(index).copied() else {
                break;
            };

            // 1. renew SR levels at intervals on the simulation clock
            let window_offset = index - start_index;
            if self.sr_data.is_some() && window_offset % self.config.sr_refresh_window == 0 {
                if let Some(sr_warmup) = self.sr_warm_up(index) {
                    self.detector.refresh_zones(sr_warmup)?;
                }
            }

            // 2. advance the PST machines; higher timeframes close on their
            //    multiple of the low clock
            self.detector.add_candle(PstLevel::Low, &candle)?;
            for level in [PstLevel::Mid, PstLevel::High] {
                let ratio = self.pst_ratios.get(&level).copied().unwrap_or(1);
                if index % ratio == 0 {
                    match self
                        .pst_data
                        .get(&level)
                        .and_then(|series| series.get(index / ratio))
                        .copied()
                    {
                        Some(higher) => self.detector.add_candle(level, &higher)?,
                        None => debug!("{level} series exhausted at index {}", index / ratio),
                    }
                }
            }

            // 3. project signals and ask the advisor
            let signals = self.detector.signal_snapshot();

            let published = self.publish_if_due(window_offset, &low_series);

            let risk_balance = if self.config.options.compound_risk {
                self.account.balance
            } else {
                self.account.initial_balance
            };
            let order = self
                .advisor
                .generate_positions(candle.close, risk_balance, &signals);
            let actions = self.advisor.modify_positions(&signals);

            // 4. evaluate SL/TP and refresh equity before any action lands
            self.account
                .update_positions(candle.time, candle.low, candle.high);
            self.account.update_equity(candle.low, candle.high);

            // 5. advisor actions, then the new order
            Self::apply_actions(&mut self.account, &self.config, actions, candle.close, candle.time);
            if let Some(order) = order {
                Self::place_order(
                    &mut self.account,
                    order,
                    candle.time,
                    self.config.symbol.trade_contract_size,
                    self.config.options.max_concurrent_trades,
                );
            }

            if published && self.config.publish.sim_speed_ms > 0 {
                std::thread::sleep(std::time::Duration::from_millis(
                    self.config.publish.sim_speed_ms,
                ));
            }
        }

        let report = RunReport::build(
            self.config.strategy,
            &self.config.instrument,
            &self.config.start_date,
            &self.config.end_date,
            &self.account,
            self.config.symbol.trade_contract_size,
        );
        info!(
            "backtest complete: {} closed trades, final balance {:.2}",
            report.total_trades, report.final_balance
        );
        Ok(report)
    }

    /// Persist all positions to the given trade sink.
    pub fn persist_trades(&self, store: &dyn TradeStore) -> Result<(), BacktestError> {
        store.persist_positions(self.account.id, &self.account.positions)
    }

    fn pst_warm_up(&self, base_end: usize) -> HashMap<PstLevel, CandleSeries> {
        PstLevel::all()
            .into_iter()
            .filter_map(|level| {
                let series = self.pst_data.get(&level)?;
                let ratio = self.pst_ratios.get(&level).copied().unwrap_or(1);
                Some((
                    level,
                    data::warm_up_window(
                        series,
                        base_end,
                        self.config.pst_lookback_window,
                        ratio,
                    ),
                ))
            })
            .collect()
    }

    /// SR warm-up: `sr_lookback_window` SR candles ending at the SR index
    /// corresponding to the current low-timeframe index.
    fn sr_warm_up(&self, pst_index: usize) -> Option<HashMap<SrLevel, CandleSeries>> {
        let sr_data = self.sr_data.as_ref()?;
        let sr_end = pst_index / self.pst_sr_ratio.max(1);
        Some(
            SrLevel::all()
                .into_iter()
                .filter_map(|level| {
                    let series = sr_data.get(&level)?;
                    let ratio = self.sr_ratios.get(&level).copied().unwrap_or(1);
                    Some((
                        level,
                        data::warm_up_window(
                            series,
                            sr_end,
                            self.config.sr_lookback_window,
                            ratio,
                        ),
                    ))
                })
                .collect(),
        )
    }

    fn publish_if_due(&mut self, window_offset: usize, low_series: &CandleSeries) -> bool {
        if !self.config.publish.live {
            return false;
        }
        let cycle = self.config.publish.cycle.max(1);
        if window_offset % cycle != 0 {
            return false;
        }
        let Some(publisher) = &self.publisher else {
            return false;
        };

        let mut annotation = self
            .detector
            .annotation(&self.pst_ratios, self.config.publish.annotation_candle_length);
        annotation.account = Some(AccountAnnotation {
            initial_balance: self.account.initial_balance,
            balance: self.account.balance,
            equity: self.account.equity,
        });

        publisher.publish(LivePayload {
            bars: low_series
                .tail(self.config.publish.annotation_candle_length)
                .to_vec(),
            annotation,
            trades: self
                .account
                .positions
                .iter()
                .map(PositionView::from_position)
                .collect(),
            options: self.config.options.clone(),
        });
        true
    }

    /// Apply advisor actions in list order: closes fill at the candle close,
    /// stop moves follow the break-even/trailing policy.
    fn apply_actions(
        account: &mut Account,
        config: &BacktestConfig,
        actions: Vec<PositionAction>,
        close: Decimal,
        time: NaiveDateTime,
    ) {
        for action in actions {
            match action {
                PositionAction::Close { kind, instrument } => {
                    let closed = account.close_matching(kind, &instrument, time, close);
                    if closed > 0 {
                        info!("advisor exit closed {closed} {kind} position(s)");
                    }
                }
                PositionAction::MoveSl {
                    kind,
                    instrument,
                    new_sl_target,
                } => {
                    Self::apply_move_sl(account, config, kind, &instrument, new_sl_target, close);
                }
            }
        }
    }

    fn apply_move_sl(
        account: &mut Account,
        config: &BacktestConfig,
        kind: PositionKind,
        instrument: &str,
        new_sl_target: Decimal,
        close: Decimal,
    ) {
        let options = &config.options;
        if !options.move_sl.allow {
            return;
        }

        for position in &mut account.positions {
            if !(position.is_open() && position.kind == kind && position.instrument == instrument) {
                continue;
            }
            let Some(initial_sl) = position.initial_sl else {
                continue;
            };
            let denominator = initial_sl - position.entry_price;
            if denominator.is_zero() {
                continue;
            }

            // realized R of the move so far; positive when in profit
            let r = (position.entry_price - close) / denominator;

            let target = if r >= options.move_sl.to_break_even_at_r
                && r <= options.move_sl.trailing_at_r
            {
                position.entry_price
            } else if r > options.move_sl.trailing_at_r {
                match kind {
                    PositionKind::Long if new_sl_target > position.entry_price => {
                        new_sl_target
                            - (position.entry_price - initial_sl) * options.sl_level_margin
                    }
                    PositionKind::Short if new_sl_target < position.entry_price => {
                        new_sl_target
                            + (initial_sl - position.entry_price) * options.sl_level_margin
                    }
                    _ => position.entry_price,
                }
            } else {
                continue;
            };

            if let Err(error) = position.move_sl(target, close) {
                warn!("{error}; stop move skipped");
            } else {
                debug!(
                    "stop of {} {} moved to {} (R {:.2})",
                    kind, instrument, target, r
                );
            }
        }
    }

    /// Append a new position unless the concurrency cap is reached.
    fn place_order(
        account: &mut Account,
        order: OrderRequest,
        time: NaiveDateTime,
        contract_size: Decimal,
        max_concurrent: usize,
    ) {
        if account.open_position_count() >= max_concurrent {
            warn!(
                "{}; order dropped",
                BacktestError::CapacityExceeded {
                    max: max_concurrent
                }
            );
            return;
        }

        match Position::open(
            order.kind,
            account.id,
            &order.instrument,
            time,
            contract_size,
            order.volume,
            order.price,
            Some(order.sl),
            order.tp,
        ) {
            Ok(position) => account.positions.push(position),
            Err(error) => warn!("{error}; order rejected"),
        }
    }
}
