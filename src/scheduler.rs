//! Single-threaded cooperative event loop.
//!
//! Each iteration: tick every module once per wall-clock second, wait (at
//! most [`WAIT_CEILING`]) for any registered descriptor to become readable,
//! then hand ready descriptors to their owners in module-list order. The only
//! way out is an explicit stop request, honoured at iteration boundaries.

use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::constants::WAIT_CEILING;
use crate::emit_system_event;
use crate::module_host::Kernel;

static STOP_SIGNALLED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_stop_signal(_signum: libc::c_int) {
    STOP_SIGNALLED.store(true, Ordering::SeqCst);
}

/// Route SIGINT and SIGTERM to a stop request.
pub fn install_stop_signals() {
    let handler = on_stop_signal as extern "C" fn(libc::c_int) as libc::sighandler_t;
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler);
        libc::signal(libc::SIGTERM, handler);
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Readiness of one polled descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Readable,
    /// Not an open descriptor any more.
    Invalid,
}

/// Block until at least one of `fds` is readable (hang-up and error count as
/// readable so the owner observes them on its next read) or `timeout` passes.
/// An interrupted wait reports nothing ready.
pub fn wait_readable(fds: &[RawFd], timeout: Duration) -> io::Result<Vec<(RawFd, Readiness)>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: `pollfds` is a valid, exclusively borrowed array of `len` entries.
    let rc = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(Vec::new());
        }
        return Err(err);
    }
    Ok(pollfds
        .iter()
        .filter_map(|p| {
            if p.revents & libc::POLLNVAL != 0 {
                Some((p.fd, Readiness::Invalid))
            } else if p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0 {
                Some((p.fd, Readiness::Readable))
            } else {
                None
            }
        })
        .collect())
}

pub struct Scheduler {
    kernel: Kernel,
    last_tick: u64,
    wait_ceiling: Duration,
}

impl Scheduler {
    pub fn new(kernel: Kernel) -> Self {
        Self {
            kernel,
            last_tick: 0,
            wait_ceiling: WAIT_CEILING,
        }
    }

    /// Shorter waits are useful when embedding or testing; the tick cadence
    /// stays one per wall-clock second.
    pub fn with_wait_ceiling(mut self, ceiling: Duration) -> Self {
        self.wait_ceiling = ceiling.min(WAIT_CEILING);
        self
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub fn into_kernel(self) -> Kernel {
        self.kernel
    }

    pub fn stop_pending(&self) -> bool {
        self.kernel.stop_requested() || STOP_SIGNALLED.load(Ordering::SeqCst)
    }

    /// One iteration. Returns how many descriptors were dispatched.
    pub fn run_once(&mut self) -> io::Result<usize> {
        let now = unix_now();
        self.kernel.set_now(now);
        if now > self.last_tick {
            self.kernel.tick(now);
            self.last_tick = now;
        }

        let watched = self.kernel.descriptors();
        let fds: Vec<RawFd> = watched.iter().map(|&(_, fd)| fd).collect();
        let ready = wait_readable(&fds, self.wait_ceiling)?;
        if ready.is_empty() {
            return Ok(0);
        }

        self.kernel.set_now(unix_now());
        let mut dispatched = 0;
        for &(id, fd) in &watched {
            match ready.iter().find(|(r, _)| *r == fd).map(|&(_, state)| state) {
                Some(Readiness::Readable) => {
                    self.kernel.dispatch_readable(id, fd);
                    dispatched += 1;
                }
                Some(Readiness::Invalid) => self.kernel.revoke_descriptor(id, fd),
                None => {}
            }
        }
        Ok(dispatched)
    }

    /// Loop until a stop is requested, then unload every module in reverse
    /// load order. Hands the kernel back for inspection.
    pub fn run(mut self) -> Kernel {
        emit_system_event!(
            "scheduler",
            LogLevel::Info,
            "started",
            Some(format!(
                "active_modules={}",
                self.kernel.records().iter().filter(|r| r.is_active()).count()
            ))
        );
        while !self.stop_pending() {
            if let Err(e) = self.run_once() {
                emit_system_event!(
                    "scheduler",
                    LogLevel::Error,
                    "wait_failed",
                    Some(e.to_string())
                );
                std::thread::sleep(self.wait_ceiling);
            }
        }
        emit_system_event!("scheduler", LogLevel::Info, "stopped");
        self.kernel.unload_all();
        self.kernel
    }
}
