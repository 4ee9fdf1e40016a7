//! Blocking calls over a non-blocking transport
//!
//! # Architecture
//!
//! One [`SharedTransport`] owns the session and the only mutex guarding it.
//! Every attempt against the transport or one of its channels runs under that
//! mutex; waiting for socket readiness happens *outside* it, so concurrent
//! tunnels and pumps interleave at the wait boundary and never in the middle
//! of an operation.
//!
//! ```text
//!  worker A ──lock──► attempt ──WouldBlock──► unlock ──poll(socket)──► lock ──► attempt ──► Ready
//!  worker B ───────────────lock──► attempt ──► Ready ──► unlock
//! ```
//!
//! The session-wide shutdown signal makes every pending retry give up
//! immediately, which is what makes session teardown fast.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use super::config::SessionConfig;
use super::error::SshError;
use super::readiness::{self, SocketRef};
use super::signal::StopSignal;
use super::transport::{Attempt, Channel, Transport};

/// A transport shared by every tunnel of one session
pub struct SharedTransport<T: Transport> {
    transport: T,
    lock: Mutex<()>,
    shutdown: StopSignal,
    config: SessionConfig,
}

impl<T: Transport> SharedTransport<T> {
    pub fn new(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            lock: Mutex::new(()),
            shutdown: StopSignal::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session-wide shutdown signal
    pub fn shutdown_signal(&self) -> &StopSignal {
        &self.shutdown
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_set()
    }

    /// Socket to wait on for channel-side readiness
    pub fn socket(&self) -> Option<SocketRef<'_>> {
        self.transport.socket()
    }

    /// Start a blocking call with the session's default wait granularity
    pub fn blocking(&self) -> BlockingCall<'_, T> {
        BlockingCall {
            shared: self,
            granularity: self.config.select_timeout(),
            timeout: None,
            cancel: None,
        }
    }

    /// Perform exactly one attempt under the transport mutex
    pub fn attempt<R>(
        &self,
        op: impl FnOnce(&T) -> Result<Attempt<R>, SshError>,
    ) -> Result<Attempt<R>, SshError> {
        let _guard = self.lock.lock();
        op(&self.transport)
    }

    /// Close a channel, giving up after the configured close timeout
    pub fn close_channel<C: Channel>(&self, channel: &mut C) {
        let closed = self
            .blocking()
            .granularity(self.config.tunnel_select_timeout())
            .timeout(self.config.close_timeout())
            .try_run(|_| channel.close());
        match closed {
            Ok(Some(())) => {}
            Ok(None) => trace!("Channel close did not complete"),
            Err(e) => trace!("Channel close failed: {}", e),
        }
    }

    /// Drop a channel or listener while holding the transport mutex.
    /// Backends free protocol state on drop, which must not race other attempts.
    pub fn release<R>(&self, resource: R) {
        let _guard = self.lock.lock();
        drop(resource);
    }

    pub(crate) fn transport(&self) -> &T {
        &self.transport
    }
}

/// Why a blocking call stopped without a result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Shutdown,
    Cancelled,
    TimedOut,
}

/// Retry-until-ready wrapper for a would-block operation
#[must_use]
pub struct BlockingCall<'a, T: Transport> {
    shared: &'a SharedTransport<T>,
    granularity: Duration,
    timeout: Option<Duration>,
    cancel: Option<&'a StopSignal>,
}

impl<'a, T: Transport> BlockingCall<'a, T> {
    /// Upper bound of a single readiness wait
    pub fn granularity(mut self, granularity: Duration) -> Self {
        self.granularity = granularity.max(Duration::from_millis(1));
        self
    }

    /// Give up with no result once `timeout` has passed while still blocked
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Give up with no result once `signal` is set
    pub fn cancel_on(mut self, signal: &'a StopSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// Run `op` until it stops reporting would-block.
    ///
    /// `Ok(None)` means no progress: the timeout expired, the cancel signal
    /// fired, or the session is shutting down.
    pub fn try_run<R>(
        self,
        op: impl FnMut(&T) -> Result<Attempt<R>, SshError>,
    ) -> Result<Option<R>, SshError> {
        Ok(self.drive(op)?.ok())
    }

    /// Run `op` to completion, mapping "no progress" onto an error
    pub fn run<R>(self, op: impl FnMut(&T) -> Result<Attempt<R>, SshError>) -> Result<R, SshError> {
        let limit = self.timeout;
        match self.drive(op)? {
            Ok(value) => Ok(value),
            Err(Interrupt::Shutdown) => Err(SshError::Disconnected),
            Err(Interrupt::Cancelled) => Err(SshError::Cancelled),
            Err(Interrupt::TimedOut) => Err(SshError::Timeout(format!(
                "operation still blocked after {:?}",
                limit.unwrap_or_default()
            ))),
        }
    }

    fn drive<R>(
        self,
        mut op: impl FnMut(&T) -> Result<Attempt<R>, SshError>,
    ) -> Result<Result<R, Interrupt>, SshError> {
        let shared = self.shared;
        let started = Instant::now();
        loop {
            let direction = {
                let _guard = shared.lock.lock();
                match op(&shared.transport)? {
                    Attempt::Ready(value) => return Ok(Ok(value)),
                    // 方向必须在同一把锁内读取，它描述的是刚才那次尝试
                    Attempt::WouldBlock => shared.transport.pending_io(),
                }
            };

            if shared.is_shutdown() {
                return Ok(Err(Interrupt::Shutdown));
            }
            if self.cancel.is_some_and(StopSignal::is_set) {
                return Ok(Err(Interrupt::Cancelled));
            }
            let mut wait = self.granularity;
            if let Some(limit) = self.timeout {
                let elapsed = started.elapsed();
                if elapsed >= limit {
                    return Ok(Err(Interrupt::TimedOut));
                }
                wait = wait.min(limit - elapsed);
            }

            readiness::wait_one(shared.transport.socket(), direction, wait)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::test_support::{loopback_shared, LoopbackTransport};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_retries_until_ready() {
        let shared = loopback_shared();
        let mut remaining = 3;
        let value = shared
            .blocking()
            .run(|_| {
                if remaining == 0 {
                    Ok(Attempt::Ready(42))
                } else {
                    remaining -= 1;
                    Ok(Attempt::WouldBlock)
                }
            })
            .unwrap();
        assert_eq!(value, 42);
        assert_eq!(remaining, 0);
    }

    #[test]
    fn test_error_is_returned_immediately() {
        let shared = loopback_shared();
        let mut attempts = 0;
        let result: Result<(), _> = shared.blocking().run(|_| {
            attempts += 1;
            Err(SshError::ChannelError("boom".into()))
        });
        assert!(matches!(result, Err(SshError::ChannelError(_))));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_timeout_yields_no_progress() {
        let shared = loopback_shared();
        let started = Instant::now();
        let result: Option<()> = shared
            .blocking()
            .timeout(Duration::from_millis(30))
            .try_run(|_| Ok(Attempt::WouldBlock))
            .unwrap();
        assert!(result.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));

        let err = shared
            .blocking()
            .timeout(Duration::from_millis(5))
            .run(|_| Ok::<Attempt<()>, SshError>(Attempt::WouldBlock))
            .unwrap_err();
        assert!(matches!(err, SshError::Timeout(_)));
    }

    #[test]
    fn test_cancel_signal_stops_retrying() {
        let shared = loopback_shared();
        let stop = StopSignal::new();
        let remote = stop.clone();
        let setter = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.set();
        });
        let err = shared
            .blocking()
            .cancel_on(&stop)
            .run(|_| Ok::<Attempt<()>, SshError>(Attempt::WouldBlock))
            .unwrap_err();
        assert!(matches!(err, SshError::Cancelled));
        setter.join().unwrap();
    }

    #[test]
    fn test_shutdown_abandons_retries() {
        let shared = loopback_shared();
        shared.shutdown_signal().set();
        let mut attempts = 0;
        let result = shared.blocking().try_run(|_| {
            attempts += 1;
            Ok::<Attempt<()>, SshError>(Attempt::WouldBlock)
        });
        assert!(matches!(result, Ok(None)));
        assert_eq!(attempts, 1);
    }

    #[test]
    fn test_attempts_are_serialized() {
        let shared = Arc::new(SharedTransport::new(LoopbackTransport::new(), SessionConfig::default()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let shared = shared.clone();
                let in_flight = in_flight.clone();
                let overlaps = overlaps.clone();
                thread::spawn(move || {
                    for round in 0..20 {
                        let mut blocked_once = round % 2 == 0;
                        shared
                            .blocking()
                            .run(|_| {
                                if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                                    overlaps.fetch_add(1, Ordering::SeqCst);
                                }
                                thread::sleep(Duration::from_micros(200));
                                in_flight.fetch_sub(1, Ordering::SeqCst);
                                if blocked_once {
                                    blocked_once = false;
                                    Ok(Attempt::WouldBlock)
                                } else {
                                    Ok(Attempt::Ready(()))
                                }
                            })
                            .unwrap();
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    struct LockWitness<'a> {
        shared: &'a SharedTransport<LoopbackTransport>,
        held_on_drop: &'a AtomicUsize,
    }

    impl Drop for LockWitness<'_> {
        fn drop(&mut self) {
            if self.shared.lock.is_locked() {
                self.held_on_drop.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[test]
    fn test_release_drops_under_lock() {
        let shared = loopback_shared();
        let held_on_drop = AtomicUsize::new(0);
        shared.release(LockWitness {
            shared: &shared,
            held_on_drop: &held_on_drop,
        });
        assert_eq!(held_on_drop.load(Ordering::SeqCst), 1);
        assert!(!shared.lock.is_locked());
    }

    #[test]
    fn test_open_direct_tcpip_through_stalls() {
        let echo = crate::ssh::test_support::spawn_echo_server();
        let transport = LoopbackTransport::new().with_open_stalls(3);
        let shared = SharedTransport::new(transport, SessionConfig::default());
        let mut channel = shared
            .blocking()
            .run(|t| t.open_direct_tcpip(&echo.addr.ip().to_string(), echo.addr.port(), None))
            .unwrap();
        assert_eq!(shared.transport().stalls_served(), 3);

        let written = shared.blocking().run(|_| channel.write(b"hello")).unwrap();
        assert_eq!(written, 5);
        assert_eq!(shared.transport().channels_opened(), 1);
        shared.close_channel(&mut channel);
    }
}
