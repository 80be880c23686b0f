use std::{
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, unbounded};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Lifecycle of a camera or PLC connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The last connect attempt failed; a retry is pending.
    Failed,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            ConnectionState::Disconnected => 0.0,
            ConnectionState::Connecting => 1.0,
            ConnectionState::Connected => 2.0,
            ConnectionState::Failed => -1.0,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Notification emitted on every connection state change.
#[derive(Clone, Debug)]
pub struct StatusEvent {
    pub link: Arc<str>,
    pub previous: ConnectionState,
    pub current: ConnectionState,
    pub at: DateTime<Utc>,
    pub detail: Option<String>,
}

/// State owned by one link, with fan-out to any number of observers.
pub struct StateCell {
    kind: &'static str,
    link: Arc<str>,
    state: Mutex<ConnectionState>,
    subscribers: Mutex<Vec<Sender<StatusEvent>>>,
}

impl StateCell {
    pub fn new(kind: &'static str, link: impl Into<Arc<str>>) -> Self {
        let link = link.into();
        metrics::gauge!("coalguard_link_state", "kind" => kind, "link" => link.to_string())
            .set(ConnectionState::Disconnected.gauge_value());
        Self {
            kind,
            link,
            state: Mutex::new(ConnectionState::Disconnected),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn link(&self) -> &Arc<str> {
        &self.link
    }

    pub fn get(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an observer. Events are delivered in transition order; dropped
    /// receivers are pruned on the next transition.
    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        let (tx, rx) = unbounded();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Move to `next`. Returns false when already in that state.
    pub fn transition(&self, next: ConnectionState, detail: Option<String>) -> bool {
        let previous = {
            let mut guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *guard == next {
                return false;
            }
            std::mem::replace(&mut *guard, next)
        };

        match (next, detail.as_deref()) {
            (ConnectionState::Connected, _) => {
                info!(kind = self.kind, link = %self.link, "{} link connected", self.kind)
            }
            (ConnectionState::Failed | ConnectionState::Disconnected, Some(reason)) => warn!(
                kind = self.kind,
                link = %self.link,
                from = %previous,
                to = %next,
                "{} link down: {reason}",
                self.kind
            ),
            _ => debug!(
                kind = self.kind,
                link = %self.link,
                from = %previous,
                to = %next,
                "{} link state change",
                self.kind
            ),
        }
        metrics::gauge!("coalguard_link_state", "kind" => self.kind, "link" => self.link.to_string())
            .set(next.gauge_value());

        let event = StatusEvent {
            link: self.link.clone(),
            previous,
            current: next,
            at: Utc::now(),
            detail,
        };
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event.clone()).is_ok());
        true
    }
}
