//! Forwarding Pump
//!
//! Relays bytes between one local TCP socket and one SSH channel until
//! either side closes, the tunnel is stopped or the session shuts down.
//! Both endpoints are closed exactly once when the pump returns.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use tracing::{debug, trace};

use super::manager::TunnelStats;
use crate::ssh::readiness::{self, stream_socket, Interest};
use crate::ssh::{Attempt, Channel, ChunkStream, IoDirection, SharedTransport, SshError, StopSignal, Transport};

/// Why a pump stopped
#[derive(Debug)]
pub enum PumpExit {
    /// Local peer closed or reset its socket
    LocalClosed,
    /// Channel reached EOF or stopped accepting data
    RemoteClosed,
    /// Tunnel stop signal or session shutdown
    Stopped,
    /// Channel-side failure
    Failed(SshError),
}

#[derive(Debug)]
pub struct PumpReport {
    pub exit: PumpExit,
    /// Local -> channel
    pub bytes_sent: u64,
    /// Channel -> local
    pub bytes_received: u64,
}

impl PumpReport {
    /// Channel-side failures are the only exits worth reporting
    pub fn into_result(self) -> Result<(), SshError> {
        match self.exit {
            PumpExit::Failed(e) => Err(e),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
struct Outbound {
    data: Vec<u8>,
    offset: usize,
}

impl Outbound {
    fn is_empty(&self) -> bool {
        self.offset >= self.data.len()
    }

    fn fill(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
        self.offset = 0;
    }

    fn pending(&self) -> &[u8] {
        &self.data[self.offset..]
    }

    fn consume(&mut self, n: usize) {
        self.offset = (self.offset + n).min(self.data.len());
    }
}

pub struct ForwardingPump<'a, T: Transport> {
    shared: &'a SharedTransport<T>,
    stop: &'a StopSignal,
    stats: Option<&'a TunnelStats>,
}

impl<'a, T: Transport> ForwardingPump<'a, T> {
    pub fn new(shared: &'a SharedTransport<T>, stop: &'a StopSignal) -> Self {
        Self {
            shared,
            stop,
            stats: None,
        }
    }

    /// Account relayed bytes on a tunnel's counters as they flow
    pub fn with_stats(mut self, stats: &'a TunnelStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Relay until one side is done, then close both
    pub fn run<C: Channel>(&self, mut channel: C, mut local: TcpStream) -> PumpReport {
        let mut report = PumpReport {
            exit: PumpExit::Stopped,
            bytes_sent: 0,
            bytes_received: 0,
        };

        report.exit = match local.set_nonblocking(true) {
            Ok(()) => self.relay(&mut channel, &mut local, &mut report),
            Err(e) => PumpExit::Failed(e.into()),
        };

        self.shared.close_channel(&mut channel);
        self.shared.release(channel);
        if let Err(e) = local.shutdown(Shutdown::Both) {
            trace!("Local socket shutdown: {}", e);
        }

        debug!(
            "Pump finished ({:?}): {} bytes sent, {} bytes received",
            report.exit, report.bytes_sent, report.bytes_received
        );
        report
    }

    fn should_stop(&self) -> bool {
        self.stop.is_set() || self.shared.is_shutdown()
    }

    fn relay<C: Channel>(&self, channel: &mut C, local: &mut TcpStream, report: &mut PumpReport) -> PumpExit {
        let granularity = self.shared.config().tunnel_select_timeout();
        let mut buf = vec![0u8; self.shared.config().buffer_size.max(1)];
        // Local bytes read but not yet accepted by the channel
        let mut outbound = Outbound::default();

        loop {
            if self.should_stop() {
                return PumpExit::Stopped;
            }

            // Stop reading local while the channel is backed up
            let local_ready = {
                let watch_local = if outbound.is_empty() {
                    Some(stream_socket(local))
                } else {
                    None
                };
                let mut interests = [
                    Interest::new(watch_local, IoDirection::Read),
                    Interest::new(self.shared.socket(), IoDirection::Read),
                ];
                if let Err(e) = readiness::wait(&mut interests, granularity) {
                    return PumpExit::Failed(e.into());
                }
                watch_local.is_some() && interests[0].is_ready()
            };

            // channel -> local
            let mut chunks = ChunkStream::non_blocking(self.shared, channel);
            for chunk in &mut chunks {
                let data = match chunk {
                    Ok(data) => data,
                    Err(e) => return PumpExit::Failed(e),
                };
                if let Err(e) = self.write_local(local, &data, granularity) {
                    if e.kind() == io::ErrorKind::Interrupted {
                        return PumpExit::Stopped;
                    }
                    debug!("Local write error: {}", e);
                    return PumpExit::LocalClosed;
                }
                report.bytes_received += data.len() as u64;
                if let Some(stats) = self.stats {
                    stats.add_received(data.len() as u64);
                }
            }
            if chunks.at_eof() {
                return PumpExit::RemoteClosed;
            }

            // local -> channel
            if local_ready {
                match local.read(&mut buf) {
                    Ok(0) => return PumpExit::LocalClosed,
                    Ok(n) => outbound.fill(&buf[..n]),
                    Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) => {}
                    Err(e) => {
                        debug!("Local read error: {}", e);
                        return PumpExit::LocalClosed;
                    }
                }
            }
            match self.flush(channel, &mut outbound) {
                Ok(Some(written)) => {
                    report.bytes_sent += written;
                    if let Some(stats) = self.stats {
                        stats.add_sent(written);
                    }
                }
                Ok(None) => return PumpExit::RemoteClosed,
                Err(e) => return PumpExit::Failed(e),
            }
        }
    }

    /// Push pending outbound bytes into the channel until it would block.
    /// `None` means the channel accepted zero bytes and is done.
    fn flush<C: Channel>(&self, channel: &mut C, outbound: &mut Outbound) -> Result<Option<u64>, SshError> {
        let mut written = 0u64;
        while !outbound.is_empty() {
            match self.shared.attempt(|_| channel.write(outbound.pending()))? {
                Attempt::Ready(0) => return Ok(None),
                Attempt::Ready(n) => {
                    outbound.consume(n);
                    written += n as u64;
                }
                Attempt::WouldBlock => break,
            }
        }
        Ok(Some(written))
    }

    /// Write everything to the non-blocking local socket, waiting for
    /// writability in between. Fails with `Interrupted` once stopped.
    fn write_local(&self, local: &mut TcpStream, mut data: &[u8], granularity: Duration) -> io::Result<()> {
        while !data.is_empty() {
            match local.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if self.should_stop() {
                        return Err(io::Error::new(io::ErrorKind::Interrupted, "tunnel stopping"));
                    }
                    readiness::wait_one(Some(stream_socket(local)), IoDirection::Write, granularity)?;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}
