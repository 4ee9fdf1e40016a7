//! Channel read streams
//!
//! [`ChunkStream`] turns a channel into an iterator of byte chunks. In
//! blocking mode it waits for the first chunk (or EOF) and then drains
//! whatever is already available; in non-blocking mode it stops at the first
//! would-block. Either way the stream ends at EOF, which callers can tell
//! apart from "nothing right now" through [`ChunkStream::at_eof`].

use super::blocking::SharedTransport;
use super::error::SshError;
use super::signal::StopSignal;
use super::transport::{Attempt, Channel, Transport};

/// How a [`ChunkStream`] treats would-block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Wait until at least one chunk or EOF arrives
    Blocking,
    /// Yield only what is available right now
    NonBlocking,
}

pub struct ChunkStream<'a, T: Transport, C: Channel> {
    shared: &'a SharedTransport<T>,
    channel: &'a mut C,
    mode: ReadMode,
    cancel: Option<&'a StopSignal>,
    buf: Vec<u8>,
    produced: bool,
    finished: bool,
    eof: bool,
}

impl<'a, T: Transport, C: Channel> ChunkStream<'a, T, C> {
    pub fn new(shared: &'a SharedTransport<T>, channel: &'a mut C, mode: ReadMode) -> Self {
        let size = shared.config().buffer_size.max(1);
        Self {
            shared,
            channel,
            mode,
            cancel: None,
            buf: vec![0u8; size],
            produced: false,
            finished: false,
            eof: false,
        }
    }

    pub fn blocking(shared: &'a SharedTransport<T>, channel: &'a mut C) -> Self {
        Self::new(shared, channel, ReadMode::Blocking)
    }

    pub fn non_blocking(shared: &'a SharedTransport<T>, channel: &'a mut C) -> Self {
        Self::new(shared, channel, ReadMode::NonBlocking)
    }

    /// Stop waiting for the first chunk once `signal` is set
    pub fn cancel_on(mut self, signal: &'a StopSignal) -> Self {
        self.cancel = Some(signal);
        self
    }

    /// The channel reported end-of-stream
    pub fn at_eof(&self) -> bool {
        self.eof
    }

    fn read_once(&mut self) -> Result<Attempt<usize>, SshError> {
        let channel = &mut *self.channel;
        let buf = &mut self.buf;
        let attempt = self.shared.attempt(|_| read_chunk(channel, buf))?;
        Ok(attempt)
    }

    fn read_waiting(&mut self) -> Result<Option<usize>, SshError> {
        let channel = &mut *self.channel;
        let buf = &mut self.buf;
        let mut call = self
            .shared
            .blocking()
            .granularity(self.shared.config().tunnel_select_timeout());
        if let Some(stop) = self.cancel {
            call = call.cancel_on(stop);
        }
        call.try_run(|_| read_chunk(channel, buf))
    }
}

/// One read; a zero-length read without EOF counts as would-block
fn read_chunk<C: Channel>(channel: &mut C, buf: &mut [u8]) -> Result<Attempt<usize>, SshError> {
    match channel.read(buf)? {
        Attempt::Ready(0) if !channel.eof() => Ok(Attempt::WouldBlock),
        other => Ok(other),
    }
}

impl<T: Transport, C: Channel> Iterator for ChunkStream<'_, T, C> {
    type Item = Result<Vec<u8>, SshError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        let wait = self.mode == ReadMode::Blocking && !self.produced;
        let read = if wait {
            self.read_waiting()
        } else {
            self.read_once().map(|attempt| match attempt {
                Attempt::Ready(n) => Some(n),
                Attempt::WouldBlock => None,
            })
        };

        match read {
            Ok(Some(0)) => {
                self.eof = true;
                self.finished = true;
                None
            }
            Ok(Some(n)) => {
                self.produced = true;
                Some(Ok(self.buf[..n].to_vec()))
            }
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::test_support::{loopback_shared, ScriptedChannel, Step};

    fn collect<T: Transport, C: Channel>(stream: &mut ChunkStream<'_, T, C>) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in stream {
            out.extend(chunk.unwrap());
        }
        out
    }

    #[test]
    fn test_non_blocking_stops_at_would_block() {
        let shared = loopback_shared();
        let mut channel = ScriptedChannel::new(vec![
            Step::Data(b"abc".to_vec()),
            Step::Data(b"def".to_vec()),
            Step::Block,
            Step::Data(b"later".to_vec()),
        ]);
        let mut stream = ChunkStream::non_blocking(&shared, &mut channel);
        assert_eq!(collect(&mut stream), b"abcdef");
        assert!(!stream.at_eof());
    }

    #[test]
    fn test_non_blocking_nothing_available() {
        let shared = loopback_shared();
        let mut channel = ScriptedChannel::new(vec![Step::Block]);
        let mut stream = ChunkStream::non_blocking(&shared, &mut channel);
        assert!(stream.next().is_none());
        assert!(!stream.at_eof());
    }

    #[test]
    fn test_blocking_waits_for_first_chunk() {
        let shared = loopback_shared();
        let mut channel = ScriptedChannel::new(vec![
            Step::Block,
            Step::Block,
            Step::Data(b"hello".to_vec()),
            Step::Data(b" world".to_vec()),
            Step::Block,
            Step::Data(b"unread".to_vec()),
        ]);
        let mut stream = ChunkStream::blocking(&shared, &mut channel);
        assert_eq!(collect(&mut stream), b"hello world");
        assert!(!stream.at_eof());
    }

    #[test]
    fn test_spurious_zero_reads_are_not_eof() {
        let shared = loopback_shared();
        let mut channel = ScriptedChannel::new(vec![
            Step::Spurious,
            Step::Spurious,
            Step::Data(b"x".to_vec()),
            Step::Spurious,
        ]);
        let mut stream = ChunkStream::blocking(&shared, &mut channel);
        assert_eq!(collect(&mut stream), b"x");
        assert!(!stream.at_eof());

        let mut channel = ScriptedChannel::new(vec![Step::Spurious, Step::Data(b"y".to_vec())]);
        let mut stream = ChunkStream::non_blocking(&shared, &mut channel);
        assert!(stream.next().is_none());
        assert!(!stream.at_eof());
    }

    #[test]
    fn test_eof_ends_stream() {
        let shared = loopback_shared();
        let mut channel = ScriptedChannel::new(vec![Step::Data(b"tail".to_vec()), Step::Eof]);
        let mut stream = ChunkStream::blocking(&shared, &mut channel);
        assert_eq!(collect(&mut stream), b"tail");
        assert!(stream.at_eof());

        let mut channel = ScriptedChannel::new(vec![Step::Eof]);
        let mut stream = ChunkStream::non_blocking(&shared, &mut channel);
        assert!(stream.next().is_none());
        assert!(stream.at_eof());
    }

    #[test]
    fn test_blocking_read_cancelled() {
        let shared = loopback_shared();
        let stop = StopSignal::new();
        stop.set();
        let mut channel = ScriptedChannel::new(vec![Step::Block; 1000]);
        let mut stream = ChunkStream::blocking(&shared, &mut channel).cancel_on(&stop);
        assert!(stream.next().is_none());
        assert!(!stream.at_eof());
    }

    #[test]
    fn test_read_error_is_yielded_once() {
        let shared = loopback_shared();
        let mut channel = ScriptedChannel::new(vec![Step::Data(b"a".to_vec()), Step::Fail]);
        let mut stream = ChunkStream::non_blocking(&shared, &mut channel);
        assert_eq!(stream.next().unwrap().unwrap(), b"a");
        assert!(matches!(stream.next(), Some(Err(SshError::ChannelError(_)))));
        assert!(stream.next().is_none());
    }
}
