//! Module kernel: loading, capability negotiation and context attribution.
//!
//! A module is an independently loadable unit exposing up to four optional
//! entry points (init, readable, tick, unload). Units come from a
//! [`ModuleSource`]: statically linked built-ins or dynamic libraries found
//! under the module directory.
//!
//! Every entry point runs on the scheduler thread and must not block: the
//! only suspension point of the whole daemon is the scheduler's bounded
//! readiness wait, so a blocking call inside an entry point stalls the I/O
//! and timers of every other module for its duration.

pub mod context;
pub mod ffi;
pub mod kernel;
pub mod loader;

pub use context::{Context, ModuleRef};
pub use ffi::HostApi;
pub use kernel::{Kernel, ModuleRecord};
pub use loader::{BuiltinModules, DylibLoader, DylibModule, LoadError, ModuleSource};

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;

/// Negotiated feature level reported by a module's init entry point.
pub type Version = u32;

pub type ModuleResult<T> = Result<T, ModuleError>;

/// Position of a module in the configured module list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(pub(crate) usize);

impl ModuleId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Which of the four entry points a module exposes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntryPoints {
    pub init: bool,
    pub readable: bool,
    pub tick: bool,
    pub unload: bool,
}

impl EntryPoints {
    pub const NONE: EntryPoints = EntryPoints {
        init: false,
        readable: false,
        tick: false,
        unload: false,
    };

    pub const ALL: EntryPoints = EntryPoints {
        init: true,
        readable: true,
        tick: true,
        unload: true,
    };

    pub fn is_empty(&self) -> bool {
        *self == Self::NONE
    }
}

/// Outcome of a capability check against another module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requirement {
    /// No loaded module carries that name (never configured, failed or refused).
    Unavailable,
    /// Loaded, but negotiated below the requested version.
    InsufficientVersion,
    Satisfied,
}

impl Requirement {
    pub fn is_satisfied(self) -> bool {
        self == Requirement::Satisfied
    }

    /// C ABI encoding: -1 unavailable, 0 insufficient, 1 satisfied.
    pub fn as_code(self) -> i32 {
        match self {
            Requirement::Unavailable => -1,
            Requirement::InsufficientVersion => 0,
            Requirement::Satisfied => 1,
        }
    }
}

#[derive(Debug)]
pub enum ModuleError {
    /// No source could provide a usable unit.
    Load(LoadError),
    /// The module declined to initialise.
    Refused(String),
    /// A required module is missing or too old.
    CapabilityUnmet {
        name: String,
        min_version: Version,
        status: Requirement,
    },
    /// The target module of a call is not (or no longer) loaded.
    Unavailable(String),
    Io(std::io::Error),
    Failed(String),
}

impl fmt::Display for ModuleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleError::Load(e) => write!(f, "{}", e),
            ModuleError::Refused(reason) => write!(f, "module refused to load: {}", reason),
            ModuleError::CapabilityUnmet {
                name,
                min_version,
                status,
            } => write!(
                f,
                "module '{}' version >= {} required ({:?})",
                name, min_version, status
            ),
            ModuleError::Unavailable(name) => write!(f, "module '{}' is not loaded", name),
            ModuleError::Io(e) => write!(f, "i/o error: {}", e),
            ModuleError::Failed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ModuleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ModuleError::Load(e) => Some(e),
            ModuleError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ModuleError {
    fn from(e: std::io::Error) -> Self {
        ModuleError::Io(e)
    }
}

/// A loadable unit. Only the entry points reported by [`Module::entry_points`]
/// are ever invoked; the default bodies exist so implementors can skip the ones
/// they do not expose.
///
/// Modules keep their mutable state behind `Cell`/`RefCell`: entry points and
/// public operations take `&self` so that one module may call into another
/// while its own entry point is still on the stack.
pub trait Module: Any {
    fn entry_points(&self) -> EntryPoints;

    /// Returns the negotiated version; an error is a refusal and the kernel
    /// unloads the module immediately.
    fn init(&self, _ctx: &mut Context<'_>) -> ModuleResult<Version> {
        Ok(0)
    }

    fn on_readable(&self, _ctx: &mut Context<'_>, _fd: RawFd) -> ModuleResult<()> {
        Ok(())
    }

    fn on_tick(&self, _ctx: &mut Context<'_>) -> ModuleResult<()> {
        Ok(())
    }

    fn on_unload(&self, _ctx: &mut Context<'_>) {}

    fn as_any(self: Rc<Self>) -> Rc<dyn Any>;
}
