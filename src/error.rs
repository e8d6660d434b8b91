use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use thiserror::Error;

/// Error taxonomy for the backtester.
///
/// `Input`, `OutOfOrderCandle` (in strict mode) and `DetectorInvariant` are
/// fatal. The remaining variants describe soft failures: the offending order
/// or action is dropped with a warning and the simulation continues, so every
/// soft error is a deterministic no-op.
#[derive(Debug, Error)]
pub enum BacktestError {
    #[error("input error: {0}")]
    Input(String),

    #[error("candle {time} is not after {prev} in the {timeframe} series")]
    OutOfOrderCandle {
        timeframe: String,
        prev: NaiveDateTime,
        time: NaiveDateTime,
    },

    #[error("invalid position parameters: {0}")]
    InvalidPositionParameters(String),

    #[error("volume {volume} for {instrument} outside [{min}, {max}]")]
    VolumeOutOfRange {
        instrument: String,
        volume: Decimal,
        min: Decimal,
        max: Decimal,
    },

    #[error("maximum of {max} concurrent positions already open")]
    CapacityExceeded { max: usize },

    #[error("detector invariant violated: {0}")]
    DetectorInvariant(String),

    #[error("candle file error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
