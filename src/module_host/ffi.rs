//! C ABI seen by dynamic units.
//!
//! `<name>_init` receives a pointer to [`HOST_API`] as its opaque handle and
//! may keep it for later entry points. Every function in the table acts on
//! behalf of the unit whose entry point is currently executing; called from
//! anywhere else they do nothing.
//!
//! Line subscriptions made through `subscribe_lines` belong to the calling
//! unit. A unit should drop them in `<name>_free`; whatever it leaves behind
//! is removed right after `<name>_free` returns, before the library is closed.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::{c_char, c_int};
use std::ptr;
use std::slice;

use super::{Context, ModuleId, Version};
use crate::bus::{callback, Callback};
use crate::constants::HOST_ABI_VERSION;
use crate::transport::{ServerModule, SERVER_MODULE};

/// Receives one line from the `server` module, delimiter stripped. The
/// bytes are only valid for the duration of the call and are not
/// NUL-terminated.
pub type LineCallback = unsafe extern "C" fn(line: *const c_char, len: usize);

/// Function table handed to `<name>_init`.
///
/// `require` reports -1 for an unavailable module, 0 for an insufficient
/// version and 1 when satisfied. A negative `version` is rejected outright
/// and reported as -1; versions are never negative.
#[repr(C)]
pub struct HostApi {
    pub abi_version: u32,
    /// Returns 1 when the descriptor was registered, 0 otherwise.
    pub register_fd: unsafe extern "C" fn(fd: c_int) -> c_int,
    pub unregister_fd: unsafe extern "C" fn(),
    pub require: unsafe extern "C" fn(name: *const c_char, version: c_int) -> c_int,
    /// NUL-terminated value from the caller's config section, or NULL.
    pub config_get: unsafe extern "C" fn(key: *const c_char) -> *const c_char,
    pub stop: unsafe extern "C" fn(),
    /// Subscribe to server lines. Returns 1 when added, 0 when the function
    /// is already subscribed, -1 when no server is running.
    pub subscribe_lines: unsafe extern "C" fn(cb: Option<LineCallback>) -> c_int,
    /// Returns 1 when a subscription was removed, 0 otherwise.
    pub unsubscribe_lines: unsafe extern "C" fn(cb: Option<LineCallback>) -> c_int,
    /// Write `len` bytes verbatim on the server connection. Returns 0 on
    /// success, -1 otherwise.
    pub send: unsafe extern "C" fn(data: *const c_char, len: usize) -> c_int,
}

pub static HOST_API: HostApi = HostApi {
    abi_version: HOST_ABI_VERSION,
    register_fd: host_register_fd,
    unregister_fd: host_unregister_fd,
    require: host_require,
    config_get: host_config_get,
    stop: host_stop,
    subscribe_lines: host_subscribe_lines,
    unsubscribe_lines: host_unsubscribe_lines,
    send: host_send,
};

/// A unit's line subscription; the function address is its identity.
struct ForeignLine {
    owner: Option<ModuleId>,
    func: usize,
    callback: Callback<[u8]>,
}

thread_local! {
    static ACTIVE: Cell<*mut c_void> = const { Cell::new(ptr::null_mut()) };
    static INTERNED: RefCell<HashMap<(Option<String>, String), CString>> =
        RefCell::new(HashMap::new());
    static FOREIGN_LINES: RefCell<Vec<ForeignLine>> = const { RefCell::new(Vec::new()) };
}

/// Publishes a context to the C callbacks for the lifetime of the guard.
/// The previous value is restored on drop, unwinding included.
pub(crate) struct ActiveContext {
    prev: *mut c_void,
}

impl ActiveContext {
    pub(crate) fn enter(ctx: &mut Context<'_>) -> Self {
        let ptr = ctx as *mut Context<'_> as *mut c_void;
        let prev = ACTIVE.with(|a| a.replace(ptr));
        Self { prev }
    }
}

impl Drop for ActiveContext {
    fn drop(&mut self) {
        ACTIVE.with(|a| a.set(self.prev));
    }
}

fn with_active<R>(f: impl FnOnce(&mut Context<'_>) -> R) -> Option<R> {
    let ptr = ACTIVE.with(|a| a.get());
    if ptr.is_null() {
        return None;
    }
    // SAFETY: the pointer was taken from a live `&mut Context` by
    // `ActiveContext::enter`; that frame is suspended inside the foreign call
    // which led here and does not touch the context until the guard drops.
    let ctx = unsafe { &mut *(ptr as *mut Context<'_>) };
    Some(f(ctx))
}

unsafe extern "C" fn host_register_fd(fd: c_int) -> c_int {
    with_active(|ctx| ctx.register_descriptor(fd) as c_int).unwrap_or(0)
}

unsafe extern "C" fn host_unregister_fd() {
    with_active(|ctx| ctx.unregister_descriptor());
}

unsafe extern "C" fn host_require(name: *const c_char, version: c_int) -> c_int {
    if name.is_null() {
        return -1;
    }
    // SAFETY: caller passes a NUL-terminated string.
    let Ok(name) = unsafe { CStr::from_ptr(name) }.to_str() else {
        return -1;
    };
    let Ok(min) = Version::try_from(version) else {
        return -1;
    };
    with_active(|ctx| ctx.require(name, min).as_code()).unwrap_or(-1)
}

unsafe extern "C" fn host_config_get(key: *const c_char) -> *const c_char {
    if key.is_null() {
        return ptr::null();
    }
    // SAFETY: caller passes a NUL-terminated string.
    let Ok(key) = unsafe { CStr::from_ptr(key) }.to_str() else {
        return ptr::null();
    };
    with_active(|ctx| {
        let value = ctx.config(key)?;
        let section = ctx.current_name().map(str::to_string);
        INTERNED.with(|interned| {
            let mut interned = interned.borrow_mut();
            let slot = (section, key.to_string());
            if !interned.contains_key(&slot) {
                interned.insert(slot.clone(), CString::new(value).ok()?);
            }
            // Entries are never replaced, so the buffer outlives the caller's use.
            interned.get(&slot).map(|s| s.as_ptr())
        })
    })
    .flatten()
    .unwrap_or(ptr::null())
}

unsafe extern "C" fn host_stop() {
    with_active(|ctx| ctx.request_stop());
}

fn foreign_line(owner: Option<ModuleId>, func: LineCallback) -> Callback<[u8]> {
    let key = func as usize;
    FOREIGN_LINES.with(|lines| {
        let mut lines = lines.borrow_mut();
        if let Some(found) = lines.iter().find(|l| l.owner == owner && l.func == key) {
            return found.callback.clone();
        }
        let wrapped = callback(move |ctx: &mut Context<'_>, line: &[u8]| {
            let _active = ActiveContext::enter(ctx);
            // SAFETY: the owning unit is loaded while its subscription exists;
            // `release_foreign_lines` runs before its library is closed.
            unsafe { func(line.as_ptr().cast(), line.len()) };
            Ok(())
        });
        lines.push(ForeignLine {
            owner,
            func: key,
            callback: wrapped.clone(),
        });
        wrapped
    })
}

unsafe extern "C" fn host_subscribe_lines(cb: Option<LineCallback>) -> c_int {
    let Some(func) = cb else {
        return -1;
    };
    with_active(|ctx| {
        let Some(server) = ctx.lookup::<ServerModule>(SERVER_MODULE) else {
            return -1;
        };
        let wrapped = foreign_line(ctx.current(), func);
        server.get().lines().subscribe(ctx, &wrapped) as c_int
    })
    .unwrap_or(-1)
}

unsafe extern "C" fn host_unsubscribe_lines(cb: Option<LineCallback>) -> c_int {
    let Some(func) = cb else {
        return 0;
    };
    let key = func as usize;
    with_active(|ctx| {
        let owner = ctx.current();
        let removed = FOREIGN_LINES.with(|lines| {
            let mut lines = lines.borrow_mut();
            let idx = lines.iter().position(|l| l.owner == owner && l.func == key)?;
            Some(lines.remove(idx))
        });
        match (removed, ctx.lookup::<ServerModule>(SERVER_MODULE)) {
            (Some(entry), Some(server)) => {
                server.get().lines().unsubscribe(&entry.callback) as c_int
            }
            _ => 0,
        }
    })
    .unwrap_or(0)
}

unsafe extern "C" fn host_send(data: *const c_char, len: usize) -> c_int {
    if data.is_null() && len > 0 {
        return -1;
    }
    let bytes: &[u8] = if len == 0 {
        &[]
    } else {
        // SAFETY: caller passes `len` readable bytes at `data`.
        unsafe { slice::from_raw_parts(data.cast(), len) }
    };
    with_active(|ctx| {
        let server = ctx.lookup::<ServerModule>(SERVER_MODULE)?;
        ctx.call(&server, |server, _| server.send(bytes)).ok()?.ok()
    })
    .flatten()
    .map_or(-1, |()| 0)
}

/// Drop every line subscription the current unit still holds.
pub(crate) fn release_foreign_lines(ctx: &mut Context<'_>) {
    let owner = ctx.current();
    let released: Vec<ForeignLine> = FOREIGN_LINES.with(|lines| {
        let mut lines = lines.borrow_mut();
        let (released, kept): (Vec<_>, Vec<_>) =
            lines.drain(..).partition(|l| l.owner == owner);
        *lines = kept;
        released
    });
    if let Some(server) = ctx.lookup::<ServerModule>(SERVER_MODULE) {
        for entry in &released {
            server.get().lines().unsubscribe(&entry.callback);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;
    use crate::module_host::Kernel;
    use crate::modules::builtin_modules;

    #[test]
    fn callbacks_outside_entry_points_are_inert() {
        unsafe {
            assert_eq!((HOST_API.register_fd)(3), 0);
            assert_eq!((HOST_API.require)(c"server".as_ptr(), 1), -1);
            assert!((HOST_API.config_get)(c"host".as_ptr()).is_null());
        }
    }

    #[test]
    fn config_get_reads_the_active_section() {
        let config = ConfigStore::parse("host = global\n[alpha]\nhost = scoped\n");
        let mut kernel = Kernel::new(config);
        let alpha = kernel.add_module("alpha");
        let value = kernel.with_context(Some(alpha), |ctx| {
            let _active = ActiveContext::enter(ctx);
            let ptr = unsafe { (HOST_API.config_get)(c"host".as_ptr()) };
            unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string()
        });
        assert_eq!(value, "scoped");
    }

    #[test]
    fn negative_version_is_rejected() {
        let mut kernel =
            Kernel::new(ConfigStore::new()).with_source(Box::new(builtin_modules()));
        kernel.add_module("server");
        assert_eq!(kernel.load_all(), 1);
        let codes = kernel.with_context(None, |ctx| {
            let _active = ActiveContext::enter(ctx);
            unsafe {
                (
                    (HOST_API.require)(c"server".as_ptr(), -1),
                    (HOST_API.require)(c"server".as_ptr(), 0),
                    (HOST_API.require)(c"server".as_ptr(), 2),
                )
            }
        });
        assert_eq!(codes, (-1, 1, 0));
    }

    #[test]
    fn line_calls_without_a_server_fail() {
        unsafe extern "C" fn ignore(_line: *const c_char, _len: usize) {}
        let mut kernel = Kernel::new(ConfigStore::new());
        let codes = kernel.with_context(None, |ctx| {
            let _active = ActiveContext::enter(ctx);
            unsafe {
                (
                    (HOST_API.subscribe_lines)(Some(ignore)),
                    (HOST_API.send)(c"PING".as_ptr(), 4),
                    (HOST_API.unsubscribe_lines)(Some(ignore)),
                )
            }
        });
        assert_eq!(codes, (-1, -1, 0));
    }

    #[test]
    fn stop_reaches_the_kernel() {
        let mut kernel = Kernel::new(ConfigStore::new());
        kernel.with_context(None, |ctx| {
            let _active = ActiveContext::enter(ctx);
            unsafe { (HOST_API.stop)() };
        });
        assert!(kernel.stop_requested());
    }
}
