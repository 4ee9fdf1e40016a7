//! In-process transport for tests
//!
//! `LoopbackTransport` stands in for an SSH session: a `direct-tcpip` channel
//! is a plain TCP connection to the target, and a remote forward is a local
//! listener. Everything is non-blocking so the engine sees real would-block
//! results.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use super::blocking::SharedTransport;
use super::config::SessionConfig;
use super::error::SshError;
use super::transport::{Attempt, Channel, ForwardListener, IoDirection, Transport};

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub(crate) fn loopback_shared() -> SharedTransport<LoopbackTransport> {
    SharedTransport::new(LoopbackTransport::new(), SessionConfig::default())
}

#[derive(Debug, Default)]
pub(crate) struct LoopbackTransport {
    open_stalls: AtomicUsize,
    stalls_served: AtomicUsize,
    opened: AtomicUsize,
    keepalives: AtomicUsize,
}

impl LoopbackTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Answer would-block this many times before the next channel open
    pub(crate) fn with_open_stalls(self, stalls: usize) -> Self {
        self.open_stalls.store(stalls, Ordering::SeqCst);
        self
    }

    pub(crate) fn stalls_served(&self) -> usize {
        self.stalls_served.load(Ordering::SeqCst)
    }

    pub(crate) fn channels_opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub(crate) fn keepalives_sent(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }
}

impl Transport for LoopbackTransport {
    type Channel = LoopbackChannel;
    type Listener = LoopbackListener;

    fn open_direct_tcpip(
        &self,
        host: &str,
        port: u16,
        _originator: Option<SocketAddr>,
    ) -> Result<Attempt<LoopbackChannel>, SshError> {
        if self
            .open_stalls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            self.stalls_served.fetch_add(1, Ordering::SeqCst);
            return Ok(Attempt::WouldBlock);
        }
        let stream = TcpStream::connect((host, port))
            .map_err(|e| SshError::ChannelError(format!("open failed for {}:{}: {}", host, port, e)))?;
        stream.set_nonblocking(true)?;
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Attempt::Ready(LoopbackChannel::new(stream)))
    }

    fn request_remote_forward(
        &self,
        bind_addr: &str,
        port: u16,
    ) -> Result<Attempt<(LoopbackListener, u16)>, SshError> {
        let listener = TcpListener::bind((bind_addr, port))?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?.port();
        Ok(Attempt::Ready((LoopbackListener { listener }, bound)))
    }

    fn pending_io(&self) -> IoDirection {
        IoDirection::Read
    }

    fn keepalive(&self) -> Result<Attempt<Duration>, SshError> {
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(Attempt::Ready(Duration::ZERO))
    }
}

#[derive(Debug)]
pub(crate) struct LoopbackChannel {
    stream: TcpStream,
    eof: bool,
    closed: bool,
}

impl LoopbackChannel {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            eof: false,
            closed: false,
        }
    }
}

impl Channel for LoopbackChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<Attempt<usize>, SshError> {
        if self.closed {
            return Err(SshError::ChannelError("channel closed".into()));
        }
        let attempt = Attempt::from_io(self.stream.read(buf))?;
        if attempt == Attempt::Ready(0) {
            self.eof = true;
        }
        Ok(attempt)
    }

    fn write(&mut self, buf: &[u8]) -> Result<Attempt<usize>, SshError> {
        if self.closed {
            return Err(SshError::ChannelError("channel closed".into()));
        }
        Attempt::from_io(self.stream.write(buf))
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn close(&mut self) -> Result<Attempt<()>, SshError> {
        if !self.closed {
            self.closed = true;
            let _ = self.stream.shutdown(Shutdown::Both);
        }
        Ok(Attempt::Ready(()))
    }
}

#[derive(Debug)]
pub(crate) struct LoopbackListener {
    listener: TcpListener,
}

impl ForwardListener for LoopbackListener {
    type Channel = LoopbackChannel;

    fn accept(&mut self) -> Result<Attempt<LoopbackChannel>, SshError> {
        match self.listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(true)?;
                Ok(Attempt::Ready(LoopbackChannel::new(stream)))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(Attempt::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }
}

/// One scripted channel read
#[derive(Debug, Clone)]
pub(crate) enum Step {
    Data(Vec<u8>),
    Block,
    /// Zero-length read without EOF
    Spurious,
    Eof,
    Fail,
}

/// Channel that replays a fixed sequence of reads and swallows writes
#[derive(Debug)]
pub(crate) struct ScriptedChannel {
    steps: VecDeque<Step>,
    eof: bool,
}

impl ScriptedChannel {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: steps.into(),
            eof: false,
        }
    }
}

impl Channel for ScriptedChannel {
    fn read(&mut self, buf: &mut [u8]) -> Result<Attempt<usize>, SshError> {
        match self.steps.pop_front() {
            Some(Step::Data(data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.steps.push_front(Step::Data(data[n..].to_vec()));
                }
                Ok(Attempt::Ready(n))
            }
            Some(Step::Spurious) => Ok(Attempt::Ready(0)),
            Some(Step::Eof) => {
                self.eof = true;
                Ok(Attempt::Ready(0))
            }
            Some(Step::Fail) => Err(SshError::ChannelError("scripted failure".into())),
            Some(Step::Block) | None => Ok(Attempt::WouldBlock),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<Attempt<usize>, SshError> {
        Ok(Attempt::Ready(buf.len()))
    }

    fn eof(&self) -> bool {
        self.eof
    }

    fn close(&mut self) -> Result<Attempt<()>, SshError> {
        Ok(Attempt::Ready(()))
    }
}

/// TCP echo server that also records every byte it receives
pub(crate) struct EchoServer {
    pub(crate) addr: SocketAddr,
    received: Arc<Mutex<Vec<u8>>>,
    connections: Arc<AtomicUsize>,
}

impl EchoServer {
    pub(crate) fn received(&self) -> Vec<u8> {
        self.received.lock().clone()
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

pub(crate) fn spawn_echo_server() -> EchoServer {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let connections = Arc::new(AtomicUsize::new(0));

    let log = received.clone();
    let count = connections.clone();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            count.fetch_add(1, Ordering::SeqCst);
            let log = log.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 16 * 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            log.lock().extend_from_slice(&buf[..n]);
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    EchoServer {
        addr,
        received,
        connections,
    }
}

/// Deterministic, non-repeating-looking test payload
pub(crate) fn payload(len: usize) -> Vec<u8> {
    let mut state: u32 = 0x9e37_79b9;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}

/// Send `data` and read back the same number of bytes, writing and reading
/// concurrently so neither side's buffers can deadlock the exchange
pub(crate) fn round_trip(stream: &TcpStream, data: &[u8]) -> Vec<u8> {
    stream.set_read_timeout(Some(Duration::from_secs(20))).unwrap();
    let mut writer = stream.try_clone().unwrap();
    let outgoing = data.to_vec();
    let sender = thread::spawn(move || writer.write_all(&outgoing).unwrap());

    let mut reader = stream.try_clone().unwrap();
    let mut echoed = vec![0u8; data.len()];
    reader.read_exact(&mut echoed).unwrap();
    sender.join().unwrap();
    echoed
}

/// Connected pair of TCP streams: (client side, accepted side)
pub(crate) fn tcp_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    (client, accepted)
}
