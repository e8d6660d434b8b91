pub mod backtest;
pub mod publisher;
pub mod results;

pub use backtest::BacktestEngine;
pub use publisher::{ChannelSink, LivePayload, SnapshotSink};
pub use results::{JsonTradeStore, PositionView, RunReport, TradeStore};
