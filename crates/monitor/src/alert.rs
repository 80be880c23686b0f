//! Alarm notifications leaving the detection path.
//!
//! Coordinators hand events to an [`AlertSink`] that must not block. The
//! usual sink is a [`ChannelSink`] feeding an [`AlertDispatcher`] thread,
//! which runs the slow handlers (audit log, snapshots) off the cycle thread.

use std::{
    io,
    sync::Arc,
    thread::JoinHandle,
    time::Duration,
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, select};
use link_core::{JoinError, StopHandle, StopToken, join_within, spawn_thread, stop_pair};
use ml_core::Point;
use plc_link::BitAddress;
use tracing::{debug, warn};
use video_ingest::Frame;

use crate::alarm::AlarmKind;

/// Debounced alarm value changed.
#[derive(Debug, Clone)]
pub struct AlarmTransition {
    pub camera: Arc<str>,
    pub kind: AlarmKind,
    pub previous: bool,
    pub current: bool,
    pub metric: f32,
    pub at: DateTime<Utc>,
    /// Frame the change was decided on.
    pub frame: Option<Arc<Frame>>,
    /// ROI outline in that frame's pixels.
    pub roi: Vec<Point>,
}

/// The alarm bit could not be brought in line with the debounced value.
#[derive(Debug, Clone)]
pub struct DeliveryFailure {
    pub camera: Arc<str>,
    pub kind: AlarmKind,
    pub link: String,
    pub address: BitAddress,
    pub desired: bool,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum AlertEvent {
    Transition(AlarmTransition),
    DeliveryFailure(DeliveryFailure),
}

impl AlertEvent {
    pub fn camera(&self) -> &str {
        match self {
            AlertEvent::Transition(t) => &t.camera,
            AlertEvent::DeliveryFailure(f) => &f.camera,
        }
    }

    pub fn kind(&self) -> AlarmKind {
        match self {
            AlertEvent::Transition(t) => t.kind,
            AlertEvent::DeliveryFailure(f) => f.kind,
        }
    }

    pub fn at(&self) -> DateTime<Utc> {
        match self {
            AlertEvent::Transition(t) => t.at,
            AlertEvent::DeliveryFailure(f) => f.at,
        }
    }
}

/// Receives alarm events. `submit` is called on the detection thread and
/// must return promptly.
pub trait AlertSink: Send + Sync {
    fn submit(&self, event: AlertEvent);
}

/// Discards everything.
pub struct NullSink;

impl AlertSink for NullSink {
    fn submit(&self, _event: AlertEvent) {}
}

/// Forwards into a bounded channel, dropping events when it is full.
#[derive(Clone)]
pub struct ChannelSink {
    tx: Sender<AlertEvent>,
}

impl ChannelSink {
    pub fn bounded(capacity: usize) -> (Self, Receiver<AlertEvent>) {
        let (tx, rx) = bounded(capacity);
        (Self { tx }, rx)
    }
}

impl AlertSink for ChannelSink {
    fn submit(&self, event: AlertEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                metrics::counter!("coalguard_alert_events_dropped_total", "camera" => event.camera().to_string())
                    .increment(1);
                warn!(camera = %event.camera(), kind = %event.kind(), "alert queue full; event dropped");
            }
            Err(TrySendError::Disconnected(event)) => {
                debug!(camera = %event.camera(), "alert dispatcher gone; event dropped");
            }
        }
    }
}

/// Consumer side of the dispatcher. Handlers run one at a time in
/// registration order.
pub trait AlertHandler: Send {
    fn handle(&mut self, event: &AlertEvent);
}

/// Thread draining a [`ChannelSink`] into handlers.
pub struct AlertDispatcher {
    stop: StopHandle,
    thread: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl AlertDispatcher {
    pub fn spawn(
        events: Receiver<AlertEvent>,
        mut handlers: Vec<Box<dyn AlertHandler>>,
    ) -> io::Result<Self> {
        let (stop, token) = stop_pair();
        let thread = spawn_thread("alert-dispatch", move || {
            dispatch(&events, &mut handlers, &token);
        })?;
        Ok(Self {
            stop,
            thread: Some(thread),
            stop_timeout: Duration::from_secs(5),
        })
    }

    /// Deliver whatever is already queued, then stop.
    pub fn shutdown(mut self) -> Result<(), JoinError> {
        self.stop.stop();
        match self.thread.take() {
            Some(thread) => join_within(thread, self.stop_timeout),
            None => Ok(()),
        }
    }
}

impl Drop for AlertDispatcher {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

fn dispatch(events: &Receiver<AlertEvent>, handlers: &mut [Box<dyn AlertHandler>], stop: &StopToken) {
    let deliver = |handlers: &mut [Box<dyn AlertHandler>], event: AlertEvent| {
        for handler in handlers.iter_mut() {
            handler.handle(&event);
        }
    };
    loop {
        select! {
            recv(events) -> event => match event {
                Ok(event) => deliver(handlers, event),
                Err(_) => return,
            },
            recv(stop.channel()) -> _ => break,
        }
    }
    for event in events.try_iter() {
        deliver(handlers, event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    fn transition(camera: &str, current: bool) -> AlertEvent {
        AlertEvent::Transition(AlarmTransition {
            camera: camera.into(),
            kind: AlarmKind::Person,
            previous: !current,
            current,
            metric: 1.0,
            at: Utc::now(),
            frame: None,
            roi: Vec::new(),
        })
    }

    struct Recorder(Arc<Mutex<Vec<(String, bool)>>>);

    impl AlertHandler for Recorder {
        fn handle(&mut self, event: &AlertEvent) {
            if let AlertEvent::Transition(t) = event {
                self.0.lock().unwrap().push((t.camera.to_string(), t.current));
            }
        }
    }

    #[test]
    fn channel_sink_drops_when_full() {
        let (sink, rx) = ChannelSink::bounded(2);
        for _ in 0..5 {
            sink.submit(transition("cam1", true));
        }
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn dispatcher_delivers_in_order_and_drains_on_shutdown() {
        let (sink, rx) = ChannelSink::bounded(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let dispatcher =
            AlertDispatcher::spawn(rx, vec![Box::new(Recorder(seen.clone()))]).unwrap();
        sink.submit(transition("cam1", true));
        sink.submit(transition("cam1", false));
        sink.submit(transition("cam2", true));
        dispatcher.shutdown().unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                ("cam1".to_string(), true),
                ("cam1".to_string(), false),
                ("cam2".to_string(), true),
            ]
        );
    }
}
