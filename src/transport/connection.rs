// Connection state and reconnect backoff.

use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use super::resolve::Resolution;

/// `Resolving` and `Connecting` are the two halves of one attempt; to the
/// rest of the daemon they are still "not connected".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Resolving,
    Connecting,
    Connected,
}

enum Phase {
    Idle,
    Resolving(Resolution),
    Connecting(Socket),
    Connected(TcpStream),
}

/// Outcome of [`Connection::connect`].
pub enum ConnectStart {
    /// Handshake in flight; finish it with [`Connection::poll_connect`].
    Pending(RawFd),
    /// Connected straight away (possible on loopback).
    Done(RawFd),
}

/// Idle → Connected only through a finished non-blocking connect;
/// Connected → Idle through [`Connection::disconnect`], which restarts the
/// backoff window from the disconnect instant.
pub struct Connection {
    phase: Phase,
    peer: Option<SocketAddr>,
    /// `None` until the first attempt, so the first tick connects straight away.
    last_attempt: Option<u64>,
    backoff: u64,
    attempts: u64,
}

fn in_progress(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EINPROGRESS) || err.kind() == io::ErrorKind::WouldBlock
}

impl Connection {
    pub fn new(backoff_secs: u64) -> Self {
        Self {
            phase: Phase::Idle,
            peer: None,
            last_attempt: None,
            backoff: backoff_secs,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        match self.phase {
            Phase::Idle => ConnectionState::Idle,
            Phase::Resolving(_) => ConnectionState::Resolving,
            Phase::Connecting(_) => ConnectionState::Connecting,
            Phase::Connected(_) => ConnectionState::Connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.phase, Phase::Connected(_))
    }

    pub fn backoff(&self) -> u64 {
        self.backoff
    }

    pub fn last_attempt(&self) -> Option<u64> {
        self.last_attempt
    }

    /// Connection attempts started so far.
    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn stream(&self) -> Option<&TcpStream> {
        match &self.phase {
            Phase::Connected(stream) => Some(stream),
            _ => None,
        }
    }

    /// Idle and the backoff window since the last attempt has elapsed.
    pub fn attempt_due(&self, now: u64) -> bool {
        if !matches!(self.phase, Phase::Idle) {
            return false;
        }
        match self.last_attempt {
            None => true,
            Some(last) => now.saturating_sub(last) >= self.backoff,
        }
    }

    pub fn begin_attempt(&mut self, now: u64) {
        self.last_attempt = Some(now);
        self.attempts += 1;
    }

    /// Seconds since the current attempt started.
    pub fn attempt_age(&self, now: u64) -> u64 {
        self.last_attempt.map_or(0, |started| now.saturating_sub(started))
    }

    pub fn resolving(&mut self, resolution: Resolution) {
        self.phase = Phase::Resolving(resolution);
    }

    /// Answer of the pending resolution, if it has arrived.
    pub fn poll_resolution(&self) -> Option<io::Result<SocketAddr>> {
        match &self.phase {
            Phase::Resolving(resolution) => resolution.poll(),
            _ => None,
        }
    }

    /// Open a non-blocking socket for `addr`, let `register` claim its
    /// descriptor, then start the handshake. A refused registration or an
    /// immediate connect error leaves the connection idle.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        register: impl FnOnce(RawFd) -> bool,
    ) -> io::Result<ConnectStart> {
        self.phase = Phase::Idle;
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let fd = socket.as_raw_fd();
        if !register(fd) {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "descriptor registration refused",
            ));
        }
        let done = match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => true,
            Err(e) if in_progress(&e) => false,
            Err(e) => return Err(e),
        };
        self.phase = Phase::Connecting(socket);
        self.peer = Some(addr);
        if done {
            self.establish()?;
            Ok(ConnectStart::Done(fd))
        } else {
            Ok(ConnectStart::Pending(fd))
        }
    }

    /// Check on a handshake in flight. `Ok(true)` once connected; the socket
    /// error is reported if the handshake failed.
    pub fn poll_connect(&mut self) -> io::Result<bool> {
        let Phase::Connecting(socket) = &self.phase else {
            return Ok(self.is_connected());
        };
        if let Some(err) = socket.take_error()? {
            return Err(err);
        }
        match socket.peer_addr() {
            Ok(_) => {
                self.establish()?;
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn establish(&mut self) -> io::Result<()> {
        if let Phase::Connecting(socket) = std::mem::replace(&mut self.phase, Phase::Idle) {
            let stream = TcpStream::from(socket);
            // Stays non-blocking: reads and sends must never stall the loop.
            stream.set_nodelay(true)?;
            self.phase = Phase::Connected(stream);
        }
        Ok(())
    }

    /// Give up on the current attempt. The backoff window keeps running from
    /// when the attempt started.
    pub fn abandon(&mut self) -> Option<SocketAddr> {
        self.phase = Phase::Idle;
        self.peer.take()
    }

    /// Drop the stream (closing it) and stamp `now` as the last attempt.
    pub fn disconnect(&mut self, now: u64) -> Option<SocketAddr> {
        self.phase = Phase::Idle;
        self.last_attempt = Some(now);
        self.peer.take()
    }

    /// Drop whatever is open without touching the backoff window.
    pub fn close(&mut self) -> Option<SocketAddr> {
        self.abandon()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn first_attempt_is_due_immediately_then_waits_for_backoff() {
        let mut conn = Connection::new(10);
        assert!(conn.attempt_due(0));
        conn.begin_attempt(100);
        assert!(conn.attempt_due(110));
        assert!(!conn.attempt_due(109));
        assert_eq!(conn.attempt_age(103), 3);
    }

    #[test]
    fn refused_registration_keeps_the_connection_idle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut conn = Connection::new(10);
        let err = conn
            .connect(listener.local_addr().unwrap(), |_| false)
            .err()
            .unwrap();
        assert_eq!(err.kind(), io::ErrorKind::PermissionDenied);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert!(conn.peer().is_none());
    }

    #[test]
    fn handshake_finishes_through_polling() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut conn = Connection::new(10);
        let mut registered = None;
        conn.connect(listener.local_addr().unwrap(), |fd| {
            registered = Some(fd);
            true
        })
        .unwrap();
        assert!(registered.is_some());

        for _ in 0..200 {
            if conn.poll_connect().unwrap() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.stream().map(AsRawFd::as_raw_fd), registered);

        conn.disconnect(42);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.last_attempt(), Some(42));
    }
}
