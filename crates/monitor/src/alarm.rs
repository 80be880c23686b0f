//! Keeps one PLC alarm bit in line with one debounced condition.
//!
//! The coordinator tracks what it wants the bit to be (`desired`) and what it
//! last saw the controller accept (`confirmed`, tagged with the link epoch it
//! was written under). Every cycle it writes whenever those disagree or the
//! link has reconnected since the confirmation, so the bit converges after an
//! outage without a retry timer of its own.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use ml_core::Point;
use plc_link::{BitAddress, PlcError, PlcLink};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use video_ingest::Frame;

use crate::alert::{AlarmTransition, AlertEvent, AlertSink, DeliveryFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmKind {
    /// Person inside the restricted zone.
    Person,
    /// Chute or conveyor blocked by coal.
    Coal,
}

impl AlarmKind {
    pub const ALL: [AlarmKind; 2] = [AlarmKind::Person, AlarmKind::Coal];

    pub fn label(self) -> &'static str {
        match self {
            AlarmKind::Person => "person",
            AlarmKind::Coal => "coal",
        }
    }
}

impl fmt::Display for AlarmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmState {
    Idle,
    AlarmActive,
}

/// Where alarm bits are written. Implemented by [`PlcLink`]; tests use fakes.
pub trait AlarmOutput: Send + Sync {
    fn id(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Changes whenever the underlying connection is re-established.
    fn epoch(&self) -> u64;

    fn write_bit(&self, address: BitAddress, value: bool) -> Result<(), PlcError>;
}

impl AlarmOutput for PlcLink {
    fn id(&self) -> &str {
        PlcLink::id(self)
    }

    fn is_connected(&self) -> bool {
        PlcLink::is_connected(self)
    }

    fn epoch(&self) -> u64 {
        PlcLink::epoch(self)
    }

    fn write_bit(&self, address: BitAddress, value: bool) -> Result<(), PlcError> {
        PlcLink::write_bit(self, address, value)
    }
}

/// What a call to [`AlarmCoordinator::drive`] did to the hardware.
#[derive(Debug)]
pub enum DriveOutcome {
    /// The bit already matches; nothing written.
    InSync,
    Written(bool),
    /// Out of sync but the link is down; nothing attempted.
    Deferred,
    Failed(PlcError),
}

impl DriveOutcome {
    pub fn in_sync(&self) -> bool {
        matches!(self, DriveOutcome::InSync | DriveOutcome::Written(_))
    }
}

/// One debounced evaluation handed to the coordinator.
#[derive(Debug, Clone, Copy)]
pub struct Evaluation<'a> {
    pub value: bool,
    pub metric: f32,
    pub at: DateTime<Utc>,
    pub frame: Option<&'a Arc<Frame>>,
    pub roi: &'a [Point],
}

pub struct AlarmCoordinator {
    camera: Arc<str>,
    kind: AlarmKind,
    address: BitAddress,
    output: Arc<dyn AlarmOutput>,
    sink: Arc<dyn AlertSink>,
    desired: bool,
    confirmed: Option<bool>,
    confirmed_epoch: Option<u64>,
    failing: bool,
}

impl AlarmCoordinator {
    /// The bit is assumed to be 0 until proven otherwise.
    pub fn new(
        camera: Arc<str>,
        kind: AlarmKind,
        address: BitAddress,
        output: Arc<dyn AlarmOutput>,
        sink: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            camera,
            kind,
            address,
            output,
            sink,
            desired: false,
            confirmed: Some(false),
            confirmed_epoch: None,
            failing: false,
        }
    }

    /// Forget the assumed hardware value so the next drive always writes.
    pub fn assume_unknown(mut self) -> Self {
        self.confirmed = None;
        self
    }

    pub fn kind(&self) -> AlarmKind {
        self.kind
    }

    pub fn address(&self) -> BitAddress {
        self.address
    }

    pub fn output_id(&self) -> &str {
        self.output.id()
    }

    pub fn desired(&self) -> bool {
        self.desired
    }

    pub fn state(&self) -> AlarmState {
        if self.desired {
            AlarmState::AlarmActive
        } else {
            AlarmState::Idle
        }
    }

    /// Whether the last known hardware value matches the desired one.
    pub fn is_delivered(&self) -> bool {
        self.confirmed == Some(self.desired)
            && self
                .confirmed_epoch
                .is_none_or(|epoch| epoch == self.output.epoch())
    }

    /// Apply a debounced evaluation and bring the bit in line with it.
    pub fn drive(&mut self, eval: Evaluation<'_>) -> DriveOutcome {
        if eval.value != self.desired {
            let previous = self.desired;
            self.desired = eval.value;
            info!(
                camera = %self.camera,
                kind = %self.kind,
                metric = eval.metric,
                "{} alarm {}",
                self.kind,
                if eval.value { "raised" } else { "cleared" }
            );
            metrics::counter!(
                "coalguard_alarm_transitions_total",
                "camera" => self.camera.to_string(),
                "kind" => self.kind.label(),
                "to" => if eval.value { "active" } else { "idle" }
            )
            .increment(1);
            self.sink.submit(AlertEvent::Transition(AlarmTransition {
                camera: self.camera.clone(),
                kind: self.kind,
                previous,
                current: eval.value,
                metric: eval.metric,
                at: eval.at,
                frame: eval.frame.cloned(),
                roi: eval.roi.to_vec(),
            }));
        }
        self.sync(eval.at)
    }

    /// Re-assert the current desired value without a new evaluation.
    pub fn resync(&mut self) -> DriveOutcome {
        self.sync(Utc::now())
    }

    /// Clear the alarm on the way out. Best effort: a down link is skipped.
    pub fn release(&mut self) -> DriveOutcome {
        self.desired = false;
        if !self.output.is_connected() {
            if self.confirmed != Some(false) {
                warn!(
                    camera = %self.camera,
                    kind = %self.kind,
                    address = %self.address,
                    "PLC down at shutdown; alarm bit may remain set"
                );
            }
            return DriveOutcome::Deferred;
        }
        self.sync(Utc::now())
    }

    fn needs_write(&self, epoch: u64) -> bool {
        self.confirmed != Some(self.desired)
            || self.confirmed_epoch.is_some_and(|confirmed| confirmed != epoch)
    }

    fn sync(&mut self, at: DateTime<Utc>) -> DriveOutcome {
        let epoch = self.output.epoch();
        if !self.needs_write(epoch) {
            self.failing = false;
            return DriveOutcome::InSync;
        }
        if !self.output.is_connected() {
            self.report_failure(&PlcError::Disconnected, at);
            return DriveOutcome::Deferred;
        }
        match self.output.write_bit(self.address, self.desired) {
            Ok(()) => {
                self.confirmed = Some(self.desired);
                self.confirmed_epoch = Some(epoch);
                if self.failing {
                    info!(
                        camera = %self.camera,
                        kind = %self.kind,
                        address = %self.address,
                        "alarm output delivered again"
                    );
                }
                self.failing = false;
                debug!(
                    camera = %self.camera,
                    kind = %self.kind,
                    address = %self.address,
                    value = self.desired,
                    "alarm bit written"
                );
                DriveOutcome::Written(self.desired)
            }
            Err(err) => {
                self.confirmed = None;
                self.report_failure(&err, at);
                DriveOutcome::Failed(err)
            }
        }
    }

    /// Surface a delivery failure once per failing streak.
    fn report_failure(&mut self, err: &PlcError, at: DateTime<Utc>) {
        if self.failing {
            return;
        }
        self.failing = true;
        warn!(
            camera = %self.camera,
            kind = %self.kind,
            link = %self.output.id(),
            address = %self.address,
            desired = self.desired,
            "alarm output not delivered: {err}"
        );
        self.sink
            .submit(AlertEvent::DeliveryFailure(DeliveryFailure {
                camera: self.camera.clone(),
                kind: self.kind,
                link: self.output.id().to_string(),
                address: self.address,
                desired: self.desired,
                reason: err.to_string(),
                at,
            }));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicBool, AtomicU64, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct FakeOutput {
        connected: AtomicBool,
        epoch: AtomicU64,
        fail_writes: AtomicBool,
        writes: Mutex<Vec<bool>>,
    }

    impl FakeOutput {
        fn online() -> Arc<Self> {
            let out = Arc::new(Self::default());
            out.reconnect();
            out
        }

        fn reconnect(&self) {
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.connected.store(true, Ordering::SeqCst);
        }

        fn drop_link(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn writes(&self) -> Vec<bool> {
            self.writes.lock().unwrap().clone()
        }
    }

    impl AlarmOutput for FakeOutput {
        fn id(&self) -> &str {
            "plc-test"
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn epoch(&self) -> u64 {
            self.epoch.load(Ordering::SeqCst)
        }

        fn write_bit(&self, _address: BitAddress, value: bool) -> Result<(), PlcError> {
            if !self.is_connected() {
                return Err(PlcError::Disconnected);
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(PlcError::Timeout(std::time::Duration::from_secs(1)));
            }
            self.writes.lock().unwrap().push(value);
            Ok(())
        }
    }

    #[derive(Default)]
    struct Events(Mutex<Vec<AlertEvent>>);

    impl AlertSink for Events {
        fn submit(&self, event: AlertEvent) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl Events {
        fn failures(&self) -> usize {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|e| matches!(e, AlertEvent::DeliveryFailure(_)))
                .count()
        }

        fn transitions(&self) -> Vec<(bool, bool)> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter_map(|e| match e {
                    AlertEvent::Transition(t) => Some((t.previous, t.current)),
                    _ => None,
                })
                .collect()
        }
    }

    fn coordinator(output: &Arc<FakeOutput>, events: &Arc<Events>) -> AlarmCoordinator {
        AlarmCoordinator::new(
            "cam1".into(),
            AlarmKind::Person,
            BitAddress::new(300, 6, 0).unwrap(),
            output.clone(),
            events.clone(),
        )
    }

    fn eval(value: bool) -> Evaluation<'static> {
        Evaluation {
            value,
            metric: if value { 1.0 } else { 0.0 },
            at: Utc::now(),
            frame: None,
            roi: &[],
        }
    }

    #[test]
    fn writes_only_on_change() {
        let output = FakeOutput::online();
        let events = Arc::new(Events::default());
        let mut coord = coordinator(&output, &events);

        for value in [false, false, true, true, true, false, false] {
            coord.drive(eval(value));
        }
        assert_eq!(output.writes(), vec![true, false]);
        assert_eq!(events.transitions(), vec![(false, true), (true, false)]);
        assert_eq!(coord.state(), AlarmState::Idle);
    }

    #[test]
    fn outage_defers_then_converges_with_one_write() {
        let output = FakeOutput::online();
        let events = Arc::new(Events::default());
        let mut coord = coordinator(&output, &events);

        output.drop_link();
        for _ in 0..3 {
            assert!(matches!(coord.drive(eval(true)), DriveOutcome::Deferred));
        }
        assert!(output.writes().is_empty());
        assert_eq!(events.failures(), 1);

        output.reconnect();
        assert!(matches!(coord.drive(eval(true)), DriveOutcome::Written(true)));
        assert!(matches!(coord.drive(eval(true)), DriveOutcome::InSync));
        assert_eq!(output.writes(), vec![true]);
        assert!(coord.is_delivered());
    }

    #[test]
    fn flip_flop_during_outage_delivers_latest_value() {
        let output = FakeOutput::online();
        let events = Arc::new(Events::default());
        let mut coord = coordinator(&output, &events);
        coord.drive(eval(true));

        output.drop_link();
        coord.drive(eval(false));
        coord.drive(eval(true));
        output.reconnect();
        coord.drive(eval(true));
        assert_eq!(output.writes(), vec![true, true]);
        assert!(coord.desired());
    }

    #[test]
    fn reconnect_reasserts_cleared_bit() {
        let output = FakeOutput::online();
        let events = Arc::new(Events::default());
        let mut coord = coordinator(&output, &events);
        coord.drive(eval(true));
        coord.drive(eval(false));

        output.drop_link();
        output.reconnect();
        coord.drive(eval(false));
        assert_eq!(output.writes(), vec![true, false, false]);
    }

    #[test]
    fn initial_clear_state_needs_no_write_even_across_reconnect() {
        let output = FakeOutput::online();
        let events = Arc::new(Events::default());
        let mut coord = coordinator(&output, &events);
        coord.drive(eval(false));
        output.reconnect();
        coord.drive(eval(false));
        assert!(output.writes().is_empty());
    }

    #[test]
    fn failed_write_is_retried_next_cycle_and_reported_once() {
        let output = FakeOutput::online();
        let events = Arc::new(Events::default());
        let mut coord = coordinator(&output, &events);

        output.fail_writes.store(true, Ordering::SeqCst);
        assert!(matches!(coord.drive(eval(true)), DriveOutcome::Failed(_)));
        assert!(matches!(coord.drive(eval(true)), DriveOutcome::Failed(_)));
        assert_eq!(events.failures(), 1);

        output.fail_writes.store(false, Ordering::SeqCst);
        assert!(matches!(coord.drive(eval(true)), DriveOutcome::Written(true)));

        output.fail_writes.store(true, Ordering::SeqCst);
        coord.drive(eval(false));
        assert_eq!(events.failures(), 2);
    }

    #[test]
    fn release_clears_active_bit() {
        let output = FakeOutput::online();
        let events = Arc::new(Events::default());
        let mut coord = coordinator(&output, &events);
        coord.drive(eval(true));
        assert!(matches!(coord.release(), DriveOutcome::Written(false)));
        assert!(matches!(coord.release(), DriveOutcome::InSync));
        assert_eq!(output.writes(), vec![true, false]);
    }

    #[test]
    fn unknown_state_forces_first_write() {
        let output = FakeOutput::online();
        let events = Arc::new(Events::default());
        let mut coord = coordinator(&output, &events).assume_unknown();
        assert!(matches!(coord.drive(eval(false)), DriveOutcome::Written(false)));
    }
}
