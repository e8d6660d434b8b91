use crossbeam_channel::{Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::results::PositionView;
use crate::config::StrategyOptions;
use crate::structure::Annotation;
use crate::types::Candle;

/// Snapshot pushed to the dashboard boundary after a publish cycle.
/// Everything inside is an owned deep copy; consumers never see live state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LivePayload {
    pub bars: Vec<Candle>,
    pub annotation: Annotation,
    pub trades: Vec<PositionView>,
    pub options: StrategyOptions,
}

/// Consumer boundary for live snapshots. Implementations must not block the
/// simulation loop.
pub trait SnapshotSink: Send {
    fn publish(&self, payload: LivePayload);
}

/// Channel-backed sink for an external consumer thread. Snapshots are
/// dropped when the consumer falls behind; simulation results are never
/// affected by publishing.
pub struct ChannelSink {
    sender: Sender<LivePayload>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<LivePayload>) {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        (Self { sender }, receiver)
    }
}

impl SnapshotSink for ChannelSink {
    fn publish(&self, payload: LivePayload) {
        match self.sender.try_send(payload) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => debug!("snapshot consumer behind; payload dropped"),
            Err(TrySendError::Disconnected(_)) => {
                debug!("snapshot consumer gone; payload dropped")
            }
        }
    }
}
