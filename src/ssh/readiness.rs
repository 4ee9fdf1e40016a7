//! Socket readiness waits
//!
//! Thin `poll(2)` wrapper used by BlockingCall, the forwarding pump and the
//! accept loops. Every wait is bounded so callers get back control often
//! enough to observe their stop signals.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use super::transport::IoDirection;

#[cfg(unix)]
pub type SocketRef<'a> = std::os::fd::BorrowedFd<'a>;

#[cfg(windows)]
pub type SocketRef<'a> = std::os::windows::io::BorrowedSocket<'a>;

/// Borrow the OS socket of a TCP stream
pub fn stream_socket(stream: &TcpStream) -> SocketRef<'_> {
    #[cfg(unix)]
    {
        use std::os::fd::AsFd;
        stream.as_fd()
    }
    #[cfg(windows)]
    {
        use std::os::windows::io::AsSocket;
        stream.as_socket()
    }
}

/// Borrow the OS socket of a TCP listener
pub fn listener_socket(listener: &TcpListener) -> SocketRef<'_> {
    #[cfg(unix)]
    {
        use std::os::fd::AsFd;
        listener.as_fd()
    }
    #[cfg(windows)]
    {
        use std::os::windows::io::AsSocket;
        listener.as_socket()
    }
}

/// One socket to watch and the outcome of the wait
#[derive(Debug)]
pub struct Interest<'a> {
    socket: Option<SocketRef<'a>>,
    direction: IoDirection,
    ready: bool,
}

impl<'a> Interest<'a> {
    pub fn new(socket: Option<SocketRef<'a>>, direction: IoDirection) -> Self {
        Self {
            socket,
            direction,
            ready: false,
        }
    }

    /// Ready after the wait. Interests without a socket always report ready:
    /// the caller has nothing to wait on and must just try the operation.
    pub fn is_ready(&self) -> bool {
        self.ready
    }
}

/// Wait until at least one interest is ready or `timeout` elapses.
///
/// Returns `true` if some watched socket became ready.
pub fn wait(interests: &mut [Interest<'_>], timeout: Duration) -> io::Result<bool> {
    for interest in interests.iter_mut() {
        interest.ready = interest.socket.is_none();
    }
    if interests.iter().all(|i| i.socket.is_none()) {
        std::thread::sleep(timeout);
        return Ok(false);
    }
    poll_sockets(interests, timeout)
}

/// Convenience wrapper for a single socket
pub fn wait_one(socket: Option<SocketRef<'_>>, direction: IoDirection, timeout: Duration) -> io::Result<bool> {
    let mut interests = [Interest::new(socket, direction)];
    wait(&mut interests, timeout)
}

#[cfg(unix)]
fn poll_sockets(interests: &mut [Interest<'_>], timeout: Duration) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

    let flags_for = |direction: IoDirection| match direction {
        IoDirection::Write => PollFlags::POLLOUT,
        IoDirection::Both => PollFlags::POLLIN | PollFlags::POLLOUT,
        // libssh2 reports no direction between packets; inbound is what we wait for
        IoDirection::Read | IoDirection::None => PollFlags::POLLIN,
    };

    let mut slots = Vec::with_capacity(interests.len());
    let mut fds = Vec::with_capacity(interests.len());
    for (idx, interest) in interests.iter().enumerate() {
        if let Some(socket) = interest.socket {
            fds.push(PollFd::new(socket, flags_for(interest.direction)));
            slots.push(idx);
        }
    }

    let millis = timeout.as_millis().clamp(1, u16::MAX as u128) as u16;
    match poll(&mut fds, PollTimeout::from(millis)) {
        Ok(0) => return Ok(false),
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(false),
        Err(e) => return Err(io::Error::from(e)),
    }

    let wake = PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL;
    let mut any = false;
    for (fd, idx) in fds.iter().zip(slots) {
        let requested = flags_for(interests[idx].direction);
        if fd.revents().is_some_and(|r| r.intersects(requested | wake)) {
            interests[idx].ready = true;
            any = true;
        }
    }
    Ok(any)
}

// No poll(2): sleep one granularity and let the caller try everything.
#[cfg(not(unix))]
fn poll_sockets(interests: &mut [Interest<'_>], timeout: Duration) -> io::Result<bool> {
    std::thread::sleep(timeout);
    for interest in interests.iter_mut() {
        interest.ready = true;
    }
    Ok(true)
}
