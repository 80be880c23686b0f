use std::{
    io, thread,
    time::{Duration, Instant},
};

use thiserror::Error;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("thread {name} did not finish within {timeout:?}")]
    Timeout { name: String, timeout: Duration },
    #[error("thread {name} panicked")]
    Panicked { name: String },
}

/// Spawn a named thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

/// Join `handle`, giving up after `timeout`.
///
/// On timeout the thread is detached; callers are expected to have already
/// interrupted whatever it was blocked on.
pub fn join_within<T>(handle: thread::JoinHandle<T>, timeout: Duration) -> Result<T, JoinError> {
    let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return Err(JoinError::Timeout { name, timeout });
        }
        thread::sleep(JOIN_POLL_INTERVAL);
    }
    handle.join().map_err(|_| JoinError::Panicked { name })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawned_thread_carries_name() {
        let handle = spawn_thread("link-test", || {
            thread::current().name().map(str::to_string)
        })
        .unwrap();
        assert_eq!(handle.join().unwrap().as_deref(), Some("link-test"));
    }

    #[test]
    fn join_within_returns_value() {
        let handle = spawn_thread("quick", || 7).unwrap();
        assert_eq!(join_within(handle, Duration::from_secs(2)).unwrap(), 7);
    }

    #[test]
    fn join_within_times_out() {
        let handle = spawn_thread("slow", || thread::sleep(Duration::from_millis(500))).unwrap();
        let err = join_within(handle, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, JoinError::Timeout { ref name, .. } if name == "slow"));
    }

    #[test]
    fn join_within_reports_panics() {
        let handle = spawn_thread("boom", || panic!("expected")).unwrap();
        let err = join_within::<()>(handle, Duration::from_secs(2)).unwrap_err();
        assert!(matches!(err, JoinError::Panicked { .. }));
    }
}
