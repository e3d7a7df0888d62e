mod common;

use std::cell::RefCell;
use std::fs;
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use corebot::bus::{callback, Callback};
use corebot::config::ConfigStore;
use corebot::events::{init_events, LogSink, MemorySink};
use corebot::module_host::{Context, DylibLoader, Kernel, ModuleId, ModuleRef, Requirement};
use corebot::modules::{builtin_modules, LineLogModule};
use corebot::scheduler::wait_readable;
use corebot::transport::{ConnectionState, ServerModule};

const BACKOFF: u64 = 30;

fn config_for(port: u16, extra: &str) -> ConfigStore {
    ConfigStore::parse(&format!(
        "[server]\nhost = 127.0.0.1\nport = {}\nfamily = ipv4\nbackoff = {}\nbuffer = 64\n{}",
        port, BACKOFF, extra
    ))
}

fn kernel_for(port: u16) -> Kernel {
    let mut kernel = Kernel::new(config_for(port, "")).with_source(Box::new(builtin_modules()));
    kernel.add_module("server");
    kernel.add_module("linelog");
    assert_eq!(kernel.load_all(), 2);
    kernel
}

/// Tick at `now` until the attempt in flight has either connected or failed.
fn settle(kernel: &mut Kernel, server: &ModuleRef<ServerModule>, now: u64) {
    kernel.tick(now);
    for _ in 0..400 {
        match server.get().state() {
            ConnectionState::Resolving | ConnectionState::Connecting => {
                std::thread::sleep(Duration::from_millis(5));
                kernel.tick(now);
            }
            _ => return,
        }
    }
}

fn server_of(kernel: &mut Kernel) -> (ModuleId, ModuleRef<ServerModule>) {
    let server = kernel.module::<ServerModule>("server").unwrap();
    (server.id(), server)
}

/// Feed the server every readable event until nothing arrives for a while.
fn pump(kernel: &mut Kernel, id: ModuleId) {
    loop {
        let Some((_, fd)) = kernel.descriptors().into_iter().find(|(m, _)| *m == id) else {
            return;
        };
        let ready = wait_readable(&[fd], Duration::from_millis(300)).unwrap();
        if ready.is_empty() {
            return;
        }
        kernel.dispatch_readable(id, fd);
    }
}

#[test]
fn connects_frames_lines_and_echoes_through_send() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut kernel = kernel_for(port);
    let (id, server) = server_of(&mut kernel);
    assert_eq!(server.get().buffer_capacity(), 64);
    assert_eq!(server.get().backoff(), BACKOFF);
    assert_eq!(kernel.require("linelog", 1), Requirement::Satisfied);

    settle(&mut kernel, &server, 1_000);
    assert_eq!(server.get().state(), ConnectionState::Connected);
    assert_eq!(server.get().attempts(), 1);
    assert_eq!(kernel.descriptors().len(), 1);
    let (mut peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    // Host-owned subscriber that answers every line from inside the publish.
    let lines = Rc::new(RefCell::new(Vec::<String>::new()));
    let echo: Callback<[u8]> = {
        let (lines, server) = (lines.clone(), server.clone());
        callback(move |_ctx: &mut Context<'_>, line: &[u8]| {
            lines
                .borrow_mut()
                .push(String::from_utf8_lossy(line).into_owned());
            let mut reply = b"echo ".to_vec();
            reply.extend_from_slice(line);
            server.get().send_line(&reply)?;
            Ok(())
        })
    };
    kernel.with_context(None, |ctx| server.get().lines().subscribe(ctx, &echo));

    peer.write_all(b"hello\r\nworld\r\npart").unwrap();
    pump(&mut kernel, id);
    assert_eq!(*lines.borrow(), vec!["hello", "world"]);
    let linelog = kernel.module::<LineLogModule>("linelog").unwrap();
    assert_eq!(linelog.get().received(), 2);

    let mut reply = [0u8; 24];
    peer.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"echo hello\r\necho world\r\n");

    server.get().lines().unsubscribe(&echo);
    kernel.unload_all();
    assert!(!server.get().is_connected());
}

#[test]
fn reconnect_waits_for_the_full_backoff_window() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut kernel = kernel_for(port);
    let (id, server) = server_of(&mut kernel);

    settle(&mut kernel, &server, 1_000);
    assert!(server.get().is_connected());
    let (peer, _) = listener.accept().unwrap();
    drop(peer);

    let disconnected_at = 1_005;
    kernel.set_now(disconnected_at);
    pump(&mut kernel, id);
    assert_eq!(server.get().state(), ConnectionState::Idle);
    assert_eq!(server.get().last_attempt(), Some(disconnected_at));
    assert!(kernel.descriptors().is_empty());

    for now in disconnected_at..disconnected_at + BACKOFF {
        kernel.tick(now);
        assert_eq!(server.get().attempts(), 1, "attempted early at {}", now);
    }
    settle(&mut kernel, &server, disconnected_at + BACKOFF);
    assert_eq!(server.get().attempts(), 2);
    assert!(server.get().is_connected());
    assert_eq!(kernel.descriptors().len(), 1);

    kernel.tick(disconnected_at + BACKOFF + 1);
    assert_eq!(server.get().attempts(), 2);
    kernel.unload_all();
}

#[test]
fn failed_attempt_also_starts_a_backoff_window() {
    let port = {
        let vacant = TcpListener::bind("127.0.0.1:0").unwrap();
        vacant.local_addr().unwrap().port()
    };
    let mut kernel = kernel_for(port);
    let (_, server) = server_of(&mut kernel);

    settle(&mut kernel, &server, 50);
    assert_eq!(server.get().attempts(), 1);
    assert_eq!(server.get().state(), ConnectionState::Idle);
    assert!(kernel.descriptors().is_empty());

    kernel.tick(50 + BACKOFF - 1);
    assert_eq!(server.get().attempts(), 1);
    settle(&mut kernel, &server, 50 + BACKOFF);
    assert_eq!(server.get().attempts(), 2);
    assert_eq!(server.get().state(), ConnectionState::Idle);
}

#[test]
fn send_while_idle_is_not_connected() {
    let mut kernel = Kernel::new(ConfigStore::new()).with_source(Box::new(builtin_modules()));
    kernel.add_module("server");
    kernel.load_all();
    let (_, server) = server_of(&mut kernel);

    // No host configured: the attempt is counted but nothing connects.
    kernel.tick(0);
    assert_eq!(server.get().attempts(), 1);
    let err = server.get().send(b"PING\r\n").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotConnected);
    assert!(kernel.descriptors().is_empty());
}

#[test]
fn linelog_refuses_without_server() {
    let mut kernel = Kernel::new(ConfigStore::new()).with_source(Box::new(builtin_modules()));
    let linelog = kernel.add_module("linelog");
    kernel.add_module("server");
    assert_eq!(kernel.load_all(), 1);
    assert!(!kernel.record(linelog).unwrap().is_loaded());
    assert_eq!(kernel.require("server", 1), Requirement::Satisfied);
}

#[test]
fn descriptor_is_registered_while_the_handshake_is_pending() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut kernel = kernel_for(port);
    let (id, server) = server_of(&mut kernel);

    kernel.tick(10);
    match server.get().state() {
        ConnectionState::Connecting | ConnectionState::Connected => {}
        other => panic!("unexpected state {:?}", other),
    }
    let registered: Vec<ModuleId> = kernel.descriptors().into_iter().map(|(m, _)| m).collect();
    assert_eq!(registered, vec![id]);
    kernel.unload_all();
}

/// Listener with backlog 0 whose queue is already full, so further
/// handshakes are never answered.
fn saturated_listener() -> (Socket, Vec<Socket>, SocketAddr) {
    let listener = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
    listener
        .bind(&SockAddr::from("127.0.0.1:0".parse::<SocketAddr>().unwrap()))
        .unwrap();
    listener.listen(0).unwrap();
    let addr = listener.local_addr().unwrap().as_socket().unwrap();
    let fillers = (0..8)
        .map(|_| {
            let s = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
            s.set_nonblocking(true).unwrap();
            let _ = s.connect(&SockAddr::from(addr));
            s
        })
        .collect();
    std::thread::sleep(Duration::from_millis(50));
    (listener, fillers, addr)
}

#[test]
fn tick_returns_promptly_against_an_unanswering_peer() {
    let (_listener, _fillers, addr) = saturated_listener();
    let config = config_for(addr.port(), "connect_timeout = 3\n");
    let mut kernel = Kernel::new(config).with_source(Box::new(builtin_modules()));
    kernel.add_module("server");
    assert_eq!(kernel.load_all(), 1);
    let (_, server) = server_of(&mut kernel);

    let started = Instant::now();
    kernel.tick(100);
    kernel.tick(101);
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "tick blocked for {:?}",
        started.elapsed()
    );
    assert_eq!(server.get().attempts(), 1);

    // Past the connect timeout the attempt is abandoned and the backoff
    // window still counts from when it started.
    kernel.tick(103);
    assert_ne!(server.get().state(), ConnectionState::Connecting);
    if !server.get().is_connected() {
        assert!(kernel.descriptors().is_empty());
        assert_eq!(server.get().last_attempt(), Some(100));
    }
    kernel.unload_all();
}

#[test]
fn host_names_resolve_off_the_loop() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ConfigStore::parse(&format!(
        "[server]\nhost = localhost\nport = {}\nfamily = ipv4\n",
        port
    ));
    let mut kernel = Kernel::new(config).with_source(Box::new(builtin_modules()));
    kernel.add_module("server");
    kernel.load_all();
    let (_, server) = server_of(&mut kernel);

    settle(&mut kernel, &server, 5);
    assert_eq!(server.get().state(), ConnectionState::Connected);
    assert_eq!(server.get().peer().map(|p| p.port()), Some(port));
    kernel.unload_all();
}

#[test]
fn oversized_line_is_discarded_and_logged() {
    let memory = Arc::new(MemorySink::new());
    init_events(vec![memory.clone() as Arc<dyn LogSink>]);

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut kernel = kernel_for(port);
    let (id, server) = server_of(&mut kernel);
    settle(&mut kernel, &server, 7);
    assert!(server.get().is_connected());
    let (mut peer, _) = listener.accept().unwrap();

    let lines = Rc::new(RefCell::new(Vec::<Vec<u8>>::new()));
    let collect: Callback<[u8]> = {
        let lines = lines.clone();
        callback(move |_ctx: &mut Context<'_>, line: &[u8]| {
            lines.borrow_mut().push(line.to_vec());
            Ok(())
        })
    };
    kernel.with_context(None, |ctx| server.get().lines().subscribe(ctx, &collect));

    let capacity = server.get().buffer_capacity();
    let mut flood = vec![b'x'; capacity + 36];
    flood.extend_from_slice(b"\r\nok\r\n");
    peer.write_all(&flood).unwrap();
    pump(&mut kernel, id);

    assert!(memory
        .actions()
        .iter()
        .any(|a| a == "oversized_line_discarded"));
    assert!(server.get().is_connected());
    assert!(lines.borrow().iter().all(|l| l.len() < capacity));
    assert_eq!(lines.borrow().last().map(Vec::as_slice), Some(&b"ok"[..]));
    kernel.unload_all();
}

const ECHO_UNIT: &str = r#"
#include <string.h>

static const struct host_api *host;

static void on_line(const char *line, size_t len) {
    host->send("seen ", 5);
    host->send(line, len);
    host->send("\r\n", 2);
}

int echo_init(const struct host_api *h) {
    host = h;
    if (host->require("server", 1) != 1)
        return -1;
    if (host->subscribe_lines(on_line) != 1)
        return -1;
    /* A second subscription of the same function is a duplicate. */
    if (host->subscribe_lines(on_line) != 0)
        return -1;
    return 1;
}

void echo_free(void) {
    host->unsubscribe_lines(on_line);
}
"#;

#[test]
fn dylib_unit_receives_published_lines_and_sends() {
    let dir = common::temp_dir("modules");
    if common::compile_unit(&dir, "echo", ECHO_UNIT).is_none() {
        return;
    }
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let mut kernel = Kernel::new(config_for(port, ""))
        .with_source(Box::new(builtin_modules()))
        .with_source(Box::new(DylibLoader::new(&dir)));
    kernel.add_module("server");
    let echo = kernel.add_module("echo");
    assert_eq!(kernel.load_all(), 2);
    let (id, server) = server_of(&mut kernel);
    assert_eq!(server.get().lines().owners(), vec![Some(echo)]);

    settle(&mut kernel, &server, 1);
    assert!(server.get().is_connected());
    let (mut peer, _) = listener.accept().unwrap();
    peer.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    peer.write_all(b"PING :abc\r\n").unwrap();
    pump(&mut kernel, id);
    let mut reply = [0u8; 16];
    peer.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"seen PING :abc\r\n");

    kernel.unload(echo);
    assert!(server.get().lines().is_empty());
    kernel.unload_all();
    let _ = fs::remove_dir_all(&dir);
}
