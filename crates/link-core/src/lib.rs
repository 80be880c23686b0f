//! Building blocks shared by every long-lived link in the monitor: the
//! connection state machine, the reconnect backoff policy, interruptible stop
//! signals, and thread helpers that keep the tracing dispatcher attached.

pub mod backoff;
pub mod state;
pub mod stop;
pub mod thread;

pub use backoff::{Backoff, BackoffError, BackoffPolicy};
pub use state::{ConnectionState, StateCell, StatusEvent};
pub use stop::{AbortHandle, AbortSlot, StopHandle, StopToken, stop_pair};
pub use thread::{JoinError, join_within, spawn_thread};
