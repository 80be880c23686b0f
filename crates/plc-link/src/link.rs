use std::{
    io,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded, select, unbounded};
use link_core::{
    AbortSlot, Backoff, BackoffPolicy, ConnectionState, JoinError, StateCell, StatusEvent,
    StopHandle, StopToken, join_within, spawn_thread, stop_pair,
};
use tracing::{debug, info_span, warn};

use crate::{
    address::BitAddress,
    error::PlcError,
    transport::{PlcConnector, PlcTransport},
};

/// Idle wait used when health probing is disabled.
const IDLE_PARK: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
pub struct LinkOptions {
    pub backoff: BackoffPolicy,
    /// Probe the controller after this much idle time.
    pub health_interval: Option<Duration>,
    /// Probe target used until the first write names one.
    pub probe_address: Option<BitAddress>,
    /// How long a caller waits for its queued request to complete.
    pub request_timeout: Duration,
    pub stop_timeout: Duration,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            health_interval: Some(Duration::from_secs(10)),
            probe_address: None,
            request_timeout: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
        }
    }
}

enum Request {
    WriteBit {
        address: BitAddress,
        value: bool,
        reply: Sender<Result<(), PlcError>>,
    },
    ReadBit {
        address: BitAddress,
        reply: Sender<Result<bool, PlcError>>,
    },
    ReadByte {
        db: u16,
        byte: u32,
        reply: Sender<Result<u8, PlcError>>,
    },
}

impl Request {
    fn reject(self) {
        match self {
            Request::WriteBit { reply, .. } => {
                let _ = reply.send(Err(PlcError::Disconnected));
            }
            Request::ReadBit { reply, .. } => {
                let _ = reply.send(Err(PlcError::Disconnected));
            }
            Request::ReadByte { reply, .. } => {
                let _ = reply.send(Err(PlcError::Disconnected));
            }
        }
    }
}

struct LinkRuntime {
    stop: StopHandle,
    requests: Sender<Request>,
    worker: JoinHandle<()>,
}

/// One controller connection shared by every coordinator that targets it.
///
/// The connection lives on its own thread. Requests queue FIFO on a channel
/// and run one at a time, so callers on different cameras never interleave
/// on the wire. Requests made while the link is down fail immediately with
/// [`PlcError::Disconnected`] instead of queueing.
pub struct PlcLink {
    id: Arc<str>,
    connector: Arc<dyn PlcConnector>,
    options: LinkOptions,
    state: Arc<StateCell>,
    epoch: Arc<AtomicU64>,
    abort: AbortSlot,
    runtime: Mutex<Option<LinkRuntime>>,
}

impl PlcLink {
    pub fn new(
        id: impl Into<Arc<str>>,
        connector: Arc<dyn PlcConnector>,
        options: LinkOptions,
    ) -> Self {
        let id = id.into();
        Self {
            state: Arc::new(StateCell::new("plc", id.clone())),
            id,
            connector,
            options,
            epoch: Arc::new(AtomicU64::new(0)),
            abort: AbortSlot::new(),
            runtime: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn describe(&self) -> String {
        self.connector.describe()
    }

    /// Start the connection thread. It connects in the background and keeps
    /// reconnecting until [`disconnect`](Self::disconnect).
    pub fn connect(&self) -> io::Result<()> {
        let mut runtime = self.runtime.lock().unwrap_or_else(PoisonError::into_inner);
        if runtime.is_some() {
            return Ok(());
        }
        let (stop, token) = stop_pair();
        let (requests, inbox) = unbounded();
        let session = Session {
            id: self.id.clone(),
            connector: self.connector.clone(),
            options: self.options.clone(),
            state: self.state.clone(),
            epoch: self.epoch.clone(),
            abort: self.abort.clone(),
            stop: token,
            inbox,
        };
        let worker = spawn_thread(format!("plc-{}", self.id), move || session.run())?;
        *runtime = Some(LinkRuntime {
            stop,
            requests,
            worker,
        });
        Ok(())
    }

    /// Close the connection and stop reconnecting. Blocks at most
    /// `stop_timeout`; an in-flight request is interrupted.
    pub fn disconnect(&self) -> Result<(), JoinError> {
        let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            return Ok(());
        };
        runtime.stop.stop();
        self.abort.fire();
        drop(runtime.requests);
        let joined = join_within(runtime.worker, self.options.stop_timeout);
        self.state.transition(ConnectionState::Disconnected, None);
        joined
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state.get() == ConnectionState::Connected
    }

    /// Incremented on every successful connect. A change means the
    /// controller may have lost whatever was written before.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        self.state.subscribe()
    }

    /// Wait until connected or `timeout` elapses.
    pub fn wait_connected(&self, timeout: Duration) -> bool {
        let events = self.subscribe();
        let deadline = Instant::now() + timeout;
        while !self.is_connected() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            match events.recv_timeout(remaining) {
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return self.is_connected(),
            }
        }
        true
    }

    pub fn write_bit(&self, address: BitAddress, value: bool) -> Result<(), PlcError> {
        let result = self.submit(|reply| Request::WriteBit {
            address,
            value,
            reply,
        });
        let outcome = match &result {
            Ok(()) => "ok",
            Err(PlcError::Disconnected) => "disconnected",
            Err(_) => "error",
        };
        metrics::counter!("coalguard_plc_writes_total", "link" => self.id.to_string(), "result" => outcome)
            .increment(1);
        result
    }

    pub fn read_bit(&self, address: BitAddress) -> Result<bool, PlcError> {
        self.submit(|reply| Request::ReadBit { address, reply })
    }

    pub fn read_byte(&self, db: u16, byte: u32) -> Result<u8, PlcError> {
        self.submit(|reply| Request::ReadByte { db, byte, reply })
    }

    fn submit<T>(
        &self,
        build: impl FnOnce(Sender<Result<T, PlcError>>) -> Request,
    ) -> Result<T, PlcError> {
        if !self.is_connected() {
            return Err(PlcError::Disconnected);
        }
        let requests = match self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            Some(runtime) => runtime.requests.clone(),
            None => return Err(PlcError::Disconnected),
        };
        let (reply, response) = bounded(1);
        requests
            .send(build(reply))
            .map_err(|_| PlcError::Disconnected)?;
        match response.recv_timeout(self.options.request_timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(PlcError::Timeout(self.options.request_timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(PlcError::Disconnected),
        }
    }
}

impl Drop for PlcLink {
    fn drop(&mut self) {
        if let Err(err) = self.disconnect() {
            warn!(link = %self.id, "PLC thread did not stop cleanly: {err}");
        }
    }
}

enum Served {
    Stopped,
    Lost(String),
}

/// State owned by the connection thread.
struct Session {
    id: Arc<str>,
    connector: Arc<dyn PlcConnector>,
    options: LinkOptions,
    state: Arc<StateCell>,
    epoch: Arc<AtomicU64>,
    abort: AbortSlot,
    stop: StopToken,
    inbox: Receiver<Request>,
}

impl Session {
    fn run(self) {
        let span = info_span!("plc.link", link = %self.id);
        let _enter = span.enter();

        let mut backoff = Backoff::new(self.options.backoff);
        let mut probe = self.options.probe_address;

        while !self.stop.is_stopped() {
            self.state.transition(ConnectionState::Connecting, None);
            let mut transport = match self.connector.connect() {
                Ok(transport) => transport,
                Err(err) => {
                    let delay = backoff.record_failure();
                    self.state
                        .transition(ConnectionState::Failed, Some(err.to_string()));
                    debug!(
                        attempt = backoff.failures(),
                        delay_ms = delay.as_millis() as u64,
                        "PLC connect failed; backing off"
                    );
                    if self.idle(delay) {
                        break;
                    }
                    continue;
                }
            };

            if let Some(handle) = transport.abort_handle() {
                self.abort.arm(handle);
            }
            if self.stop.is_stopped() {
                self.abort.disarm();
                transport.close();
                break;
            }

            backoff.reset();
            self.epoch.fetch_add(1, Ordering::SeqCst);
            self.state.transition(ConnectionState::Connected, None);

            let served = self.serve(transport.as_mut(), &mut probe);
            self.abort.disarm();
            transport.close();

            match served {
                Served::Stopped => break,
                Served::Lost(_) if self.stop.is_stopped() => break,
                Served::Lost(reason) => {
                    self.state
                        .transition(ConnectionState::Disconnected, Some(reason));
                    if self.idle(backoff.current()) {
                        break;
                    }
                }
            }
        }

        for request in self.inbox.try_iter() {
            request.reject();
        }
        self.state.transition(ConnectionState::Disconnected, None);
    }

    /// Run requests until the connection fails or a stop is requested.
    fn serve(&self, transport: &mut dyn PlcTransport, probe: &mut Option<BitAddress>) -> Served {
        let idle = self.options.health_interval.unwrap_or(IDLE_PARK);
        loop {
            select! {
                recv(self.stop.channel()) -> _ => return Served::Stopped,
                recv(self.inbox) -> request => {
                    let Ok(request) = request else {
                        return Served::Stopped;
                    };
                    if let Some(reason) = self.execute(transport, request, probe) {
                        return Served::Lost(reason);
                    }
                }
                default(idle) => {
                    if self.options.health_interval.is_none() {
                        continue;
                    }
                    if let Some(address) = *probe {
                        match transport.read_bit(address) {
                            Ok(_) => debug!(%address, "PLC health probe ok"),
                            Err(err) if err.is_connection_fault() => {
                                return Served::Lost(format!("health probe failed: {err}"));
                            }
                            Err(err) => debug!(%address, "PLC health probe rejected: {err}"),
                        }
                    }
                }
            }
        }
    }

    /// Returns the reason the connection must be dropped, if it must.
    fn execute(
        &self,
        transport: &mut dyn PlcTransport,
        request: Request,
        probe: &mut Option<BitAddress>,
    ) -> Option<String> {
        let started = Instant::now();
        let fault = match request {
            Request::WriteBit {
                address,
                value,
                reply,
            } => {
                let result = transport.write_bit(address, value);
                if result.is_ok() {
                    *probe = Some(address);
                    debug!(%address, value, "PLC bit written");
                }
                respond(reply, result)
            }
            Request::ReadBit { address, reply } => respond(reply, transport.read_bit(address)),
            Request::ReadByte { db, byte, reply } => {
                respond(reply, transport.read_byte(db, byte))
            }
        };
        metrics::histogram!("coalguard_plc_request_seconds", "link" => self.id.to_string())
            .record(started.elapsed().as_secs_f64());
        fault
    }

    /// Drain the inbox, rejecting requests, for `duration`. Returns true if stopped.
    fn idle(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return self.stop.is_stopped();
            }
            select! {
                recv(self.stop.channel()) -> _ => return true,
                recv(self.inbox) -> request => match request {
                    Ok(request) => request.reject(),
                    Err(_) => return true,
                },
                default(remaining) => return self.stop.is_stopped(),
            }
        }
    }
}

/// Deliver `result` and report whether it broke the connection.
fn respond<T>(reply: Sender<Result<T, PlcError>>, result: Result<T, PlcError>) -> Option<String> {
    let fault = match &result {
        Err(err) if err.is_connection_fault() => Some(err.to_string()),
        _ => None,
    };
    let _ = reply.send(result);
    fault
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicBool, AtomicU32},
        thread,
    };

    use super::*;

    #[derive(Default)]
    struct Bench {
        memory: Mutex<HashMap<(u16, u32), u8>>,
        writes: Mutex<Vec<(BitAddress, bool)>>,
        refuse: AtomicU32,
        break_next: AtomicBool,
        in_flight: AtomicBool,
        overlaps: AtomicU32,
        connects: AtomicU32,
        probes: AtomicU32,
    }

    struct BenchConnector(Arc<Bench>);

    impl PlcConnector for BenchConnector {
        fn connect(&self) -> Result<Box<dyn PlcTransport>, PlcError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            let refuse = self.0.refuse.load(Ordering::SeqCst);
            if refuse > 0 {
                self.0.refuse.store(refuse - 1, Ordering::SeqCst);
                return Err(PlcError::Communication(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            Ok(Box::new(BenchTransport(self.0.clone())))
        }

        fn describe(&self) -> String {
            "bench".into()
        }
    }

    struct BenchTransport(Arc<Bench>);

    impl BenchTransport {
        fn enter(&self) -> Result<(), PlcError> {
            if self.0.in_flight.swap(true, Ordering::SeqCst) {
                self.0.overlaps.fetch_add(1, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(1));
            self.0.in_flight.store(false, Ordering::SeqCst);
            if self.0.break_next.swap(false, Ordering::SeqCst) {
                return Err(PlcError::Communication(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "cable pulled",
                )));
            }
            Ok(())
        }
    }

    impl PlcTransport for BenchTransport {
        fn read_bit(&mut self, address: BitAddress) -> Result<bool, PlcError> {
            self.0.probes.fetch_add(1, Ordering::SeqCst);
            self.enter()?;
            let memory = self.0.memory.lock().unwrap();
            let byte = memory.get(&(address.db, address.byte)).copied().unwrap_or(0);
            Ok(byte & (1 << address.bit) != 0)
        }

        fn read_byte(&mut self, db: u16, byte: u32) -> Result<u8, PlcError> {
            self.enter()?;
            Ok(self.0.memory.lock().unwrap().get(&(db, byte)).copied().unwrap_or(0))
        }

        fn write_bit(&mut self, address: BitAddress, value: bool) -> Result<(), PlcError> {
            self.enter()?;
            let mut memory = self.0.memory.lock().unwrap();
            let byte = memory.entry((address.db, address.byte)).or_default();
            if value {
                *byte |= 1 << address.bit;
            } else {
                *byte &= !(1 << address.bit);
            }
            self.0.writes.lock().unwrap().push((address, value));
            Ok(())
        }
    }

    fn fast_options() -> LinkOptions {
        LinkOptions {
            backoff: BackoffPolicy {
                min_interval: Duration::from_millis(5),
                max_interval: Duration::from_millis(20),
                multiplier: 2.0,
            },
            health_interval: None,
            probe_address: None,
            request_timeout: Duration::from_secs(2),
            stop_timeout: Duration::from_secs(2),
        }
    }

    fn addr(byte: u32, bit: u8) -> BitAddress {
        BitAddress::new(300, byte, bit).unwrap()
    }

    fn link_with(bench: &Arc<Bench>, options: LinkOptions) -> PlcLink {
        PlcLink::new("plc-1", Arc::new(BenchConnector(bench.clone())), options)
    }

    #[test]
    fn write_before_connect_fails_immediately() {
        let bench = Arc::new(Bench::default());
        let link = link_with(&bench, fast_options());
        let started = Instant::now();
        assert!(matches!(link.write_bit(addr(6, 0), true), Err(PlcError::Disconnected)));
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_eq!(bench.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn writes_and_reads_bits() {
        let bench = Arc::new(Bench::default());
        let link = link_with(&bench, fast_options());
        link.connect().unwrap();
        assert!(link.wait_connected(Duration::from_secs(2)));
        assert_eq!(link.epoch(), 1);

        link.write_bit(addr(6, 1), true).unwrap();
        link.write_bit(addr(6, 0), true).unwrap();
        link.write_bit(addr(6, 0), false).unwrap();
        assert!(link.read_bit(addr(6, 1)).unwrap());
        assert!(!link.read_bit(addr(6, 0)).unwrap());
        assert_eq!(link.read_byte(300, 6).unwrap(), 0b10);
        link.disconnect().unwrap();
    }

    #[test]
    fn retries_refused_connections() {
        let bench = Arc::new(Bench::default());
        bench.refuse.store(3, Ordering::SeqCst);
        let link = link_with(&bench, fast_options());
        link.connect().unwrap();
        assert!(link.wait_connected(Duration::from_secs(2)));
        assert_eq!(bench.connects.load(Ordering::SeqCst), 4);
        link.disconnect().unwrap();
    }

    #[test]
    fn io_failure_drops_and_reestablishes_connection() {
        let bench = Arc::new(Bench::default());
        let link = link_with(&bench, fast_options());
        let events = link.subscribe();
        link.connect().unwrap();
        assert!(link.wait_connected(Duration::from_secs(2)));

        bench.break_next.store(true, Ordering::SeqCst);
        let err = link.write_bit(addr(6, 0), true).unwrap_err();
        assert!(err.is_connection_fault());

        let deadline = Instant::now() + Duration::from_secs(2);
        while link.epoch() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(link.epoch(), 2);
        assert!(
            events
                .try_iter()
                .any(|e| e.current == ConnectionState::Disconnected && e.detail.is_some())
        );
        assert!(link.wait_connected(Duration::from_secs(2)));
        link.write_bit(addr(6, 0), true).unwrap();
        link.disconnect().unwrap();
    }

    #[test]
    fn concurrent_writers_are_serialized() {
        let bench = Arc::new(Bench::default());
        let link = Arc::new(link_with(&bench, fast_options()));
        link.connect().unwrap();
        assert!(link.wait_connected(Duration::from_secs(2)));

        let writers: Vec<_> = (0..4u32)
            .map(|camera| {
                let link = link.clone();
                thread::spawn(move || {
                    for i in 0..10 {
                        link.write_bit(addr(6 + camera, 0), i % 2 == 0).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        assert_eq!(bench.writes.lock().unwrap().len(), 40);
        assert_eq!(bench.overlaps.load(Ordering::SeqCst), 0);
        link.disconnect().unwrap();
    }

    #[test]
    fn disconnect_is_bounded_and_final() {
        let bench = Arc::new(Bench::default());
        let link = link_with(&bench, fast_options());
        link.connect().unwrap();
        assert!(link.wait_connected(Duration::from_secs(2)));

        let started = Instant::now();
        link.disconnect().unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(link.state(), ConnectionState::Disconnected);
        assert!(matches!(link.write_bit(addr(6, 0), true), Err(PlcError::Disconnected)));
        link.disconnect().unwrap();
    }

    #[test]
    fn idle_probe_detects_dead_connection() {
        let bench = Arc::new(Bench::default());
        let options = LinkOptions {
            health_interval: Some(Duration::from_millis(20)),
            probe_address: Some(addr(6, 0)),
            ..fast_options()
        };
        let link = link_with(&bench, options);
        link.connect().unwrap();
        assert!(link.wait_connected(Duration::from_secs(2)));

        bench.break_next.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(2);
        while link.epoch() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(link.epoch(), 2);
        assert!(bench.probes.load(Ordering::SeqCst) >= 1);
        link.disconnect().unwrap();
    }
}
