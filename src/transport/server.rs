// The `server` module: one outbound TCP connection, reconnect with backoff,
// and a line bus republishing every received "\r\n"-delimited message.

use std::any::Any;
use std::cell::RefCell;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;

use super::connection::{ConnectStart, Connection, ConnectionState};
use super::framer::{Drained, FrameBuffer};
use super::resolve::{AddressFamily, Resolution};
use crate::bus::CallbackBus;
use crate::constants::{
    DEFAULT_BACKOFF_SECS, DEFAULT_BUFFER_CAPACITY, DEFAULT_CONNECT_TIMEOUT_SECS, LINE_DELIMITER,
};
use crate::events::{dispatcher::emit_network_event, LogLevel};
use crate::module_host::{Context, EntryPoints, Module, ModuleResult, Version};

pub const SERVER_MODULE: &str = "server";
pub const SERVER_VERSION: Version = 1;

struct Link {
    connection: Connection,
    buffer: FrameBuffer,
    /// Seconds one attempt may spend resolving and connecting.
    connect_timeout: u64,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            connection: Connection::new(DEFAULT_BACKOFF_SECS),
            buffer: FrameBuffer::with_capacity(DEFAULT_BUFFER_CAPACITY),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT_SECS,
        }
    }
}

enum Received {
    Frames(Drained),
    Closed(Option<io::Error>),
    Nothing,
}

pub struct ServerModule {
    link: RefCell<Link>,
    lines: CallbackBus<[u8]>,
}

impl Default for ServerModule {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerModule {
    pub fn new() -> Self {
        Self {
            link: RefCell::new(Link::default()),
            lines: CallbackBus::new("server.lines"),
        }
    }

    /// Every received message, delimiter stripped. Subscriptions belong to
    /// the context that makes them.
    pub fn lines(&self) -> &CallbackBus<[u8]> {
        &self.lines
    }

    pub fn state(&self) -> ConnectionState {
        self.link.borrow().connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.link.borrow().connection.is_connected()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.link.borrow().connection.peer()
    }

    pub fn attempts(&self) -> u64 {
        self.link.borrow().connection.attempts()
    }

    pub fn last_attempt(&self) -> Option<u64> {
        self.link.borrow().connection.last_attempt()
    }

    pub fn backoff(&self) -> u64 {
        self.link.borrow().connection.backoff()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.link.borrow().buffer.capacity()
    }

    /// Write `message` verbatim on the active connection. Callers are
    /// expected to check the state first; sending while not connected fails
    /// with `NotConnected`. The stream is non-blocking, so a peer that stops
    /// reading surfaces as `WouldBlock` instead of stalling the loop.
    pub fn send(&self, message: &[u8]) -> io::Result<()> {
        let link = self.link.borrow();
        let result = match link.connection.stream() {
            Some(mut stream) => stream.write_all(message),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "no active connection",
            )),
        };
        if let Err(e) = &result {
            emit_network_event(
                SERVER_MODULE,
                LogLevel::Warn,
                "send_failed",
                link.connection.peer().map(|p| p.to_string()),
                Some(e.to_string()),
            );
        }
        result
    }

    /// `send` with the line delimiter appended.
    pub fn send_line(&self, line: &[u8]) -> io::Result<()> {
        let mut message = Vec::with_capacity(line.len() + LINE_DELIMITER.len());
        message.extend_from_slice(line);
        message.extend_from_slice(LINE_DELIMITER);
        self.send(&message)
    }

    fn start_attempt(&self, ctx: &mut Context<'_>, link: &mut Link) {
        let Some(host) = ctx.config("host").map(str::to_string) else {
            emit_network_event(
                SERVER_MODULE,
                LogLevel::Warn,
                "config_missing",
                None,
                Some("[server] host is not set".into()),
            );
            return;
        };
        let Some(port) = ctx.config_parsed::<u16>("port") else {
            emit_network_event(
                SERVER_MODULE,
                LogLevel::Warn,
                "config_missing",
                Some(host),
                Some("[server] port is missing or invalid".into()),
            );
            return;
        };
        let family = ctx
            .config_parsed::<AddressFamily>("family")
            .unwrap_or_default();

        emit_network_event(
            SERVER_MODULE,
            LogLevel::Info,
            "connect_attempt",
            Some(format!("{}:{}", host, port)),
            Some(format!("family={} attempt={}", family, link.connection.attempts())),
        );

        match Resolution::start(&host, port, family) {
            Ok(resolution) => {
                link.connection.resolving(resolution);
                // Literal addresses answer at once; connect in the same tick.
                self.advance_resolution(ctx, link);
            }
            Err(e) => {
                emit_network_event(
                    SERVER_MODULE,
                    LogLevel::Warn,
                    "resolve_failed",
                    Some(host),
                    Some(e.to_string()),
                );
            }
        }
    }

    fn advance_resolution(&self, ctx: &mut Context<'_>, link: &mut Link) {
        let answer = match link.connection.poll_resolution() {
            Some(answer) => answer,
            None if link.connection.attempt_age(ctx.now()) >= link.connect_timeout => Err(
                io::Error::new(io::ErrorKind::TimedOut, "name resolution timed out"),
            ),
            None => return,
        };
        match answer {
            Ok(addr) => self.open(ctx, link, addr),
            Err(e) => {
                link.connection.abandon();
                emit_network_event(
                    SERVER_MODULE,
                    LogLevel::Warn,
                    "resolve_failed",
                    ctx.config("host").map(str::to_string),
                    Some(e.to_string()),
                );
            }
        }
    }

    /// The descriptor is registered before the handshake starts, so a
    /// failing connect is reported through the readable entry point.
    fn open(&self, ctx: &mut Context<'_>, link: &mut Link, addr: SocketAddr) {
        match link
            .connection
            .connect(addr, |fd| ctx.register_descriptor(fd))
        {
            Ok(ConnectStart::Done(fd)) => self.connected(link, fd),
            Ok(ConnectStart::Pending(fd)) => emit_network_event(
                SERVER_MODULE,
                LogLevel::Debug,
                "connect_pending",
                Some(addr.to_string()),
                Some(format!("fd={}", fd)),
            ),
            Err(e) => {
                ctx.unregister_descriptor();
                link.connection.abandon();
                emit_network_event(
                    SERVER_MODULE,
                    LogLevel::Warn,
                    "connect_failed",
                    Some(addr.to_string()),
                    Some(e.to_string()),
                );
            }
        }
    }

    fn advance_connect(&self, ctx: &mut Context<'_>, link: &mut Link) {
        let result = match link.connection.poll_connect() {
            Ok(true) => {
                if let Some(fd) = link.connection.stream().map(AsRawFd::as_raw_fd) {
                    self.connected(link, fd);
                }
                return;
            }
            Ok(false) if link.connection.attempt_age(ctx.now()) >= link.connect_timeout => {
                io::Error::new(io::ErrorKind::TimedOut, "connect timed out")
            }
            Ok(false) => return,
            Err(e) => e,
        };
        ctx.unregister_descriptor();
        let peer = link.connection.abandon();
        emit_network_event(
            SERVER_MODULE,
            LogLevel::Warn,
            "connect_failed",
            peer.map(|p| p.to_string()),
            Some(result.to_string()),
        );
    }

    fn connected(&self, link: &mut Link, fd: RawFd) {
        link.buffer.clear();
        emit_network_event(
            SERVER_MODULE,
            LogLevel::Info,
            "connected",
            link.connection.peer().map(|p| p.to_string()),
            Some(format!("fd={}", fd)),
        );
    }

    fn receive(link: &mut Link) -> Received {
        let Link {
            connection, buffer, ..
        } = link;
        let Some(mut stream) = connection.stream() else {
            return Received::Nothing;
        };
        match stream.read(buffer.spare_mut()) {
            Ok(0) => Received::Closed(None),
            Ok(n) => {
                buffer.commit(n);
                Received::Frames(buffer.drain())
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Received::Nothing,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Received::Nothing,
            Err(e) => Received::Closed(Some(e)),
        }
    }
}

impl Module for ServerModule {
    fn entry_points(&self) -> EntryPoints {
        EntryPoints::ALL
    }

    fn init(&self, ctx: &mut Context<'_>) -> ModuleResult<Version> {
        let backoff = ctx
            .config_parsed::<u64>("backoff")
            .unwrap_or(DEFAULT_BACKOFF_SECS);
        let capacity = ctx
            .config_parsed::<usize>("buffer")
            .unwrap_or(DEFAULT_BUFFER_CAPACITY);
        let timeout = ctx
            .config_parsed::<u64>("connect_timeout")
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS)
            .max(1);
        *self.link.borrow_mut() = Link {
            connection: Connection::new(backoff),
            buffer: FrameBuffer::with_capacity(capacity),
            connect_timeout: timeout,
        };
        Ok(SERVER_VERSION)
    }

    fn on_tick(&self, ctx: &mut Context<'_>) -> ModuleResult<()> {
        let now = ctx.now();
        let mut link = self.link.borrow_mut();
        match link.connection.state() {
            ConnectionState::Connected => {}
            ConnectionState::Idle => {
                if link.connection.attempt_due(now) {
                    link.connection.begin_attempt(now);
                    self.start_attempt(ctx, &mut link);
                }
            }
            ConnectionState::Resolving => self.advance_resolution(ctx, &mut link),
            ConnectionState::Connecting => self.advance_connect(ctx, &mut link),
        }
        Ok(())
    }

    fn on_readable(&self, ctx: &mut Context<'_>, _fd: RawFd) -> ModuleResult<()> {
        {
            let mut link = self.link.borrow_mut();
            if link.connection.state() == ConnectionState::Connecting {
                self.advance_connect(ctx, &mut link);
                return Ok(());
            }
        }
        let received = Self::receive(&mut self.link.borrow_mut());
        let drained = match received {
            Received::Nothing => return Ok(()),
            Received::Closed(error) => {
                let now = ctx.now();
                let peer = {
                    let mut link = self.link.borrow_mut();
                    link.buffer.clear();
                    link.connection.disconnect(now)
                };
                ctx.unregister_descriptor();
                emit_network_event(
                    SERVER_MODULE,
                    LogLevel::Warn,
                    "disconnected",
                    peer.map(|p| p.to_string()),
                    Some(match error {
                        Some(e) => e.to_string(),
                        None => "closed by peer".to_string(),
                    }),
                );
                return Ok(());
            }
            Received::Frames(drained) => drained,
        };

        if drained.discarded > 0 {
            emit_network_event(
                SERVER_MODULE,
                LogLevel::Warn,
                "oversized_line_discarded",
                self.peer().map(|p| p.to_string()),
                Some(format!("bytes={}", drained.discarded)),
            );
        }
        // Published outside the link borrow so subscribers can call `send`.
        for frame in &drained.frames {
            self.lines.publish(ctx, frame);
        }
        Ok(())
    }

    fn on_unload(&self, ctx: &mut Context<'_>) {
        let peer = {
            let mut link = self.link.borrow_mut();
            match link.connection.state() {
                ConnectionState::Idle => None,
                _ => Some(link.connection.close()),
            }
        };
        if let Some(peer) = peer {
            ctx.unregister_descriptor();
            emit_network_event(
                SERVER_MODULE,
                LogLevel::Info,
                "closed",
                peer.map(|p| p.to_string()),
                None,
            );
        }
        self.lines.clear();
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
