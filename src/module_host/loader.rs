// Module sources: statically linked built-ins and dynamic units.
// Dynamic units are platform libraries at `<module_dir>/<name>.<ext>`:
// .so (Linux), .dylib (macOS), .dll (Windows).

use std::any::Any;
use std::fmt;
use std::os::raw::c_int;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::Context as _;
use libloading::Library;

use super::ffi::{release_foreign_lines, ActiveContext, HostApi, HOST_API};
use super::{Context, EntryPoints, Module, ModuleError, ModuleResult, Version};
use crate::constants::dylib_extension;

#[derive(Debug)]
pub enum LoadError {
    NotFound { name: String, searched: Vec<String> },
    Library { name: String, reason: String },
    NoEntryPoints { name: String, path: String },
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadError::NotFound { name, searched } => {
                write!(f, "no unit for module '{}' (searched: {:?})", name, searched)
            }
            LoadError::Library { name, reason } => {
                write!(f, "cannot load module '{}': {}", name, reason)
            }
            LoadError::NoEntryPoints { name, path } => write!(
                f,
                "module '{}' ({}) exports none of the expected entry points",
                name, path
            ),
        }
    }
}

impl std::error::Error for LoadError {}

/// Where the kernel looks for a unit by module name.
pub trait ModuleSource {
    /// `LoadError::NotFound` lets the kernel fall through to the next source;
    /// any other error ends the search.
    fn open(&self, name: &str) -> Result<Rc<dyn Module>, LoadError>;
}

pub type ModuleFactory = Box<dyn Fn() -> Rc<dyn Module>>;

/// Statically linked units, instantiated fresh on every load.
#[derive(Default)]
pub struct BuiltinModules {
    factories: Vec<(String, ModuleFactory)>,
}

impl BuiltinModules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<S, F>(&mut self, name: S, factory: F) -> &mut Self
    where
        S: Into<String>,
        F: Fn() -> Rc<dyn Module> + 'static,
    {
        self.factories.push((name.into(), Box::new(factory)));
        self
    }

    pub fn with<S, F>(mut self, name: S, factory: F) -> Self
    where
        S: Into<String>,
        F: Fn() -> Rc<dyn Module> + 'static,
    {
        self.register(name, factory);
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.iter().map(|(n, _)| n.as_str()).collect()
    }
}

impl ModuleSource for BuiltinModules {
    fn open(&self, name: &str) -> Result<Rc<dyn Module>, LoadError> {
        self.factories
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, factory)| factory())
            .ok_or_else(|| LoadError::NotFound {
                name: name.to_string(),
                searched: vec![format!("builtin:{}", name)],
            })
    }
}

type InitFn = unsafe extern "C" fn(handle: *const HostApi) -> c_int;
type ReadFn = unsafe extern "C" fn(fd: c_int);
type TimerFn = unsafe extern "C" fn();
type FreeFn = unsafe extern "C" fn();

/// Opens `<dir>/<name>.<ext>` and resolves `<name>_init`, `<name>_read`,
/// `<name>_timer` and `<name>_free`.
pub struct DylibLoader {
    dir: PathBuf,
}

impl DylibLoader {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, dylib_extension()))
    }

    fn open_library(path: &Path) -> anyhow::Result<Library> {
        // SAFETY: loading runs the unit's initialisers; units in the module
        // directory are trusted to the same degree as the daemon itself.
        unsafe { Library::new(path) }.with_context(|| format!("dlopen {}", path.display()))
    }
}

/// # Safety
/// `T` must match the signature the unit exports under `symbol`.
unsafe fn resolve<T: Copy>(lib: &Library, symbol: &str) -> Option<T> {
    lib.get::<T>(symbol.as_bytes()).ok().map(|s| *s)
}

impl ModuleSource for DylibLoader {
    fn open(&self, name: &str) -> Result<Rc<dyn Module>, LoadError> {
        let path = self.path_for(name);
        if !path.is_file() {
            return Err(LoadError::NotFound {
                name: name.to_string(),
                searched: vec![path.display().to_string()],
            });
        }
        let library = Self::open_library(&path).map_err(|e| LoadError::Library {
            name: name.to_string(),
            reason: format!("{:#}", e),
        })?;

        // SAFETY: the four symbol names follow the module ABI documented on
        // `HostApi`; signatures are fixed by that convention.
        let (init, read, timer, free) = unsafe {
            (
                resolve::<InitFn>(&library, &format!("{}_init", name)),
                resolve::<ReadFn>(&library, &format!("{}_read", name)),
                resolve::<TimerFn>(&library, &format!("{}_timer", name)),
                resolve::<FreeFn>(&library, &format!("{}_free", name)),
            )
        };
        let module = DylibModule {
            name: name.to_string(),
            path: path.clone(),
            init,
            read,
            timer,
            free,
            _library: library,
        };
        if module.entry_points().is_empty() {
            return Err(LoadError::NoEntryPoints {
                name: name.to_string(),
                path: path.display().to_string(),
            });
        }
        Ok(Rc::new(module))
    }
}

/// A unit living in a dynamic library. Dropping it unmaps the library.
pub struct DylibModule {
    name: String,
    path: PathBuf,
    init: Option<InitFn>,
    read: Option<ReadFn>,
    timer: Option<TimerFn>,
    free: Option<FreeFn>,
    // Declared last: the function pointers above must not outlive the mapping.
    _library: Library,
}

impl DylibModule {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Module for DylibModule {
    fn entry_points(&self) -> EntryPoints {
        EntryPoints {
            init: self.init.is_some(),
            readable: self.read.is_some(),
            tick: self.timer.is_some(),
            unload: self.free.is_some(),
        }
    }

    fn init(&self, ctx: &mut Context<'_>) -> ModuleResult<Version> {
        let Some(init) = self.init else {
            return Ok(0);
        };
        let _active = ActiveContext::enter(ctx);
        // SAFETY: symbol resolved from the still-mapped library; HOST_API is static.
        let version = unsafe { init(&HOST_API) };
        Version::try_from(version).map_err(|_| {
            ModuleError::Refused(format!("{}_init returned {}", self.name, version))
        })
    }

    fn on_readable(&self, ctx: &mut Context<'_>, fd: RawFd) -> ModuleResult<()> {
        if let Some(read) = self.read {
            let _active = ActiveContext::enter(ctx);
            // SAFETY: see `init`.
            unsafe { read(fd) };
        }
        Ok(())
    }

    fn on_tick(&self, ctx: &mut Context<'_>) -> ModuleResult<()> {
        if let Some(timer) = self.timer {
            let _active = ActiveContext::enter(ctx);
            // SAFETY: see `init`.
            unsafe { timer() };
        }
        Ok(())
    }

    fn on_unload(&self, ctx: &mut Context<'_>) {
        if let Some(free) = self.free {
            let _active = ActiveContext::enter(ctx);
            // SAFETY: see `init`.
            unsafe { free() };
        }
        release_foreign_lines(ctx);
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
