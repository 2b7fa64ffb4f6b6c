use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::config::{AppConfig, EdgeKind, LineId};
use crate::coordinator::EdgeCallback;

#[derive(Debug, Clone, Serialize)]
pub struct EdgeEvent {
    pub line_id: LineId,
    pub edge: EdgeKind,
    pub timestamp_ms: u64,
}

/// Callback target for lines armed through the HTTP API.
///
/// Keeps a bounded history per configured line and fans every event out to
/// broadcast subscribers.
pub struct EventCallbackHandler {
    event_tx: broadcast::Sender<EdgeEvent>,
    event_history: FxHashMap<LineId, RwLock<VecDeque<EdgeEvent>>>,
    event_history_capacity: usize,
}

pub type EventHandler = Arc<EventCallbackHandler>;

impl EventCallbackHandler {
    pub fn new<I>(lines: I, broadcast_capacity: usize, event_history_capacity: usize) -> Self
    where
        I: IntoIterator<Item = LineId>,
    {
        let (event_tx, _) = broadcast::channel(broadcast_capacity);
        let event_history = lines
            .into_iter()
            .map(|id| (id, RwLock::new(VecDeque::new())))
            .collect();

        Self {
            event_tx,
            event_history,
            event_history_capacity,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.lines.keys().copied(),
            config.broadcast_capacity,
            config.event_history_capacity,
        )
    }

    pub fn dispatch(&self, event: EdgeEvent) {
        if let Some(history_lock) = self.event_history.get(&event.line_id) {
            let mut history = history_lock.write();
            while history.len() >= self.event_history_capacity.max(1) {
                history.pop_front();
            }
            history.push_back(event.clone());
        }
        let _ = self.event_tx.send(event);
    }

    /// Builds the poller callback that records edges for `line_id`.
    pub fn callback_for(self: &Arc<Self>, line_id: LineId) -> EdgeCallback {
        let handler = Arc::clone(self);
        Arc::new(move |edge| {
            handler.dispatch(EdgeEvent {
                line_id,
                edge,
                timestamp_ms: epoch_millis(),
            })
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EdgeEvent> {
        self.event_tx.subscribe()
    }

    /// Most recent events for a line in chronological order.
    pub fn events(&self, line_id: LineId, limit: Option<usize>) -> Vec<EdgeEvent> {
        self.event_history
            .get(&line_id)
            .map(|d| {
                let history = d.read();
                let skip = limit.map_or(0, |lim| history.len().saturating_sub(lim));
                history.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn last_event(&self, line_id: LineId) -> Option<EdgeEvent> {
        self.event_history
            .get(&line_id)
            .and_then(|d| d.read().back().cloned())
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
