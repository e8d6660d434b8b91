use std::io::Read;
use std::path::Path;

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use tracing::{info, warn};

use crate::error::BacktestError;
use crate::types::{Candle, CandleSeries, TIME_FORMAT};

/// Load a candle CSV. The header must contain `time, open, high, low, close`
/// (any extra columns are ignored) and timestamps must be strictly
/// ascending. In lenient mode an out-of-order candle is dropped with a
/// warning instead of failing the load.
pub fn load_candles(path: &Path, strict: bool) -> Result<CandleSeries, BacktestError> {
    let file = std::fs::File::open(path).map_err(|e| {
        BacktestError::Input(format!("cannot open candle file {}: {e}", path.display()))
    })?;
    let series = read_candles(file, &path.display().to_string(), strict)?;
    info!("loaded {} candles from {}", series.len(), path.display());
    Ok(series)
}

/// CSV reader behind `load_candles`, split out so tests can feed byte
/// buffers instead of files.
pub fn read_candles<R: Read>(
    reader: R,
    source: &str,
    strict: bool,
) -> Result<CandleSeries, BacktestError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let column = |name: &str| -> Result<usize, BacktestError> {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| BacktestError::Input(format!("{source}: missing '{name}' column")))
    };
    let time_col = column("time")?;
    let open_col = column("open")?;
    let high_col = column("high")?;
    let low_col = column("low")?;
    let close_col = column("close")?;

    let parse_price = |record: &csv::StringRecord,
                       col: usize,
                       row: usize|
     -> Result<Decimal, BacktestError> {
        record
            .get(col)
            .ok_or_else(|| BacktestError::Input(format!("{source}: short row {row}")))?
            .parse::<Decimal>()
            .map_err(|e| BacktestError::Input(format!("{source}: bad price in row {row}: {e}")))
    };

    let mut series = CandleSeries::new();
    for (row_index, record) in csv_reader.records().enumerate() {
        let record = record?;
        let row = row_index + 2; // 1-based, after the header

        let time_raw = record
            .get(time_col)
            .ok_or_else(|| BacktestError::Input(format!("{source}: short row {row}")))?;
        let time = NaiveDateTime::parse_from_str(time_raw, TIME_FORMAT).map_err(|e| {
            BacktestError::Input(format!("{source}: unparseable time '{time_raw}' in row {row}: {e}"))
        })?;

        if let Some(prev) = series.last() {
            if time <= prev.time {
                let error = BacktestError::OutOfOrderCandle {
                    timeframe: source.to_string(),
                    prev: prev.time,
                    time,
                };
                if strict {
                    return Err(error);
                }
                warn!("{error}; dropping candle");
                continue;
            }
        }

        series.push(Candle::new(
            time,
            parse_price(&record, open_col, row)?,
            parse_price(&record, high_col, row)?,
            parse_price(&record, low_col, row)?,
            parse_price(&record, close_col, row)?,
        ));
    }

    if series.is_empty() {
        return Err(BacktestError::Input(format!("{source}: no candles")));
    }
    Ok(series)
}

/// Integer ratio between a higher timeframe and the base timeframe, derived
/// from the inter-candle delta of the first two rows of each series.
pub fn level_ratio(
    base: &CandleSeries,
    higher: &CandleSeries,
    label: &str,
) -> Result<usize, BacktestError> {
    let delta = |series: &CandleSeries| -> Result<i64, BacktestError> {
        match (series.get(0), series.get(1)) {
            (Some(first), Some(second)) => Ok((second.time - first.time).num_seconds()),
            _ => Err(BacktestError::Input(format!(
                "{label}: need at least two candles to derive the timeframe ratio"
            ))),
        }
    };

    let base_delta = delta(base)?;
    let higher_delta = delta(higher)?;
    if base_delta <= 0 || higher_delta <= 0 {
        return Err(BacktestError::Input(format!(
            "{label}: non-positive candle spacing"
        )));
    }
    if higher_delta % base_delta != 0 || higher_delta < base_delta {
        return Err(BacktestError::Input(format!(
            "{label}: timeframe spacing {higher_delta}s is not an integer multiple of {base_delta}s"
        )));
    }
    Ok((higher_delta / base_delta) as usize)
}

/// Lookback slice for one level: the window `[end - lookback, end)` on the
/// base clock, rescaled onto this level's own index space by its ratio.
pub fn warm_up_window(
    series: &CandleSeries,
    base_end: usize,
    lookback: usize,
    ratio: usize,
) -> CandleSeries {
    let ratio = ratio.max(1);
    let base_start = base_end.saturating_sub(lookback);
    series.window(base_start / ratio, base_end / ratio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const CSV: &str = "\
time,open,high,low,close,tick_volume
2023-11-01 00:00:00,100,101,99,100.5,12
2023-11-01 00:05:00,100.5,102,100,101.5,9
2023-11-01 00:10:00,101.5,103,101,102.5,7
";

    #[test]
    fn parses_csv_and_ignores_extra_columns() {
        let series = read_candles(CSV.as_bytes(), "test", true).unwrap();
        assert_eq!(series.len(), 3);
        let first = series.get(0).unwrap();
        assert_eq!(first.open, dec!(100));
        assert_eq!(first.close, dec!(100.5));
        assert_eq!(
            first.time,
            NaiveDateTime::parse_from_str("2023-11-01 00:00:00", TIME_FORMAT).unwrap()
        );
    }

    #[test]
    fn strict_mode_rejects_out_of_order_candles() {
        let bad = "\
time,open,high,low,close
2023-11-01 00:05:00,100,101,99,100.5
2023-11-01 00:00:00,100.5,102,100,101.5
";
        let error = read_candles(bad.as_bytes(), "test", true);
        assert!(matches!(error, Err(BacktestError::OutOfOrderCandle { .. })));

        // lenient mode drops the offender
        let series = read_candles(bad.as_bytes(), "test", false).unwrap();
        assert_eq!(series.len(), 1);
    }

    #[test]
    fn missing_column_is_an_input_error() {
        let bad = "time,open,high,low\n2023-11-01 00:00:00,1,2,0\n";
        assert!(matches!(
            read_candles(bad.as_bytes(), "test", true),
            Err(BacktestError::Input(_))
        ));
    }

    #[test]
    fn ratio_comes_from_candle_spacing() {
        let base = read_candles(CSV.as_bytes(), "base", true).unwrap();
        let hourly = "\
time,open,high,low,close
2023-11-01 00:00:00,100,101,99,100.5
2023-11-01 01:00:00,100.5,102,100,101.5
";
        let higher = read_candles(hourly.as_bytes(), "higher", true).unwrap();
        assert_eq!(level_ratio(&base, &higher, "mid").unwrap(), 12);
        assert_eq!(level_ratio(&base, &base, "low").unwrap(), 1);

        let ragged = "\
time,open,high,low,close
2023-11-01 00:00:00,100,101,99,100.5
2023-11-01 00:07:00,100.5,102,100,101.5
";
        let uneven = read_candles(ragged.as_bytes(), "uneven", true).unwrap();
        assert!(level_ratio(&base, &uneven, "mid").is_err());
    }

    #[test]
    fn warm_up_window_rescales_by_ratio() {
        let mut series = CandleSeries::new();
        let start = NaiveDateTime::parse_from_str("2023-11-01 00:00:00", TIME_FORMAT).unwrap();
        for i in 0..10 {
            let t = start + chrono::Duration::hours(i);
            series.push(Candle::new(t, dec!(1), dec!(2), dec!(0), dec!(1)));
        }

        // base index 96 with lookback 48 on a ratio-12 level: rows 4..8
        let window = warm_up_window(&series, 96, 48, 12);
        assert_eq!(window.len(), 4);
        assert_eq!(window.get(0).unwrap().time, start + chrono::Duration::hours(4));

        // lookback larger than history clamps to the start
        let window = warm_up_window(&series, 24, 100, 12);
        assert_eq!(window.len(), 2);
    }
}
