//! Execution context: "the module whose code is currently executing".
//!
//! The context is an explicit value threaded through every kernel→module and
//! module→module call instead of a process-wide slot. Switching it means
//! building a child context for the duration of a closure; the caller's
//! context is untouched and resumes when the closure returns, on the error
//! path as much as on the success path.

use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::str::FromStr;

use super::kernel::KernelState;
use super::{Module, ModuleError, ModuleId, ModuleResult, Requirement, Version};
use crate::events::{dispatcher, LogLevel};

pub struct Context<'k> {
    state: &'k mut KernelState,
    current: Option<ModuleId>,
}

/// Typed handle on a loaded module, obtained through [`Context::lookup`].
///
/// Holding a `ModuleRef` does not keep the module loaded; operations that act
/// on behalf of the target go through [`Context::call`], which fails once the
/// target has been unloaded.
pub struct ModuleRef<T: Module> {
    id: ModuleId,
    module: Rc<T>,
}

impl<T: Module> Clone for ModuleRef<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            module: self.module.clone(),
        }
    }
}

impl<T: Module> ModuleRef<T> {
    pub fn id(&self) -> ModuleId {
        self.id
    }

    /// Direct access for read-only queries and bus subscriptions, which stay
    /// attributed to the caller's context.
    pub fn get(&self) -> &T {
        &self.module
    }
}

impl<'k> Context<'k> {
    pub(crate) fn new(state: &'k mut KernelState, current: Option<ModuleId>) -> Self {
        Self { state, current }
    }

    pub fn current(&self) -> Option<ModuleId> {
        self.current
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current.and_then(|id| self.module_name(id))
    }

    pub fn module_name(&self, id: ModuleId) -> Option<&str> {
        self.state.records.get(id.0).map(|r| r.name())
    }

    /// Run `body` with `module` as the current context.
    pub fn with_context<R>(
        &mut self,
        module: Option<ModuleId>,
        body: impl FnOnce(&mut Context<'_>) -> R,
    ) -> R {
        let mut inner = Context {
            state: &mut *self.state,
            current: module,
        };
        body(&mut inner)
    }

    /// Config value for `key` in the current module's section (global
    /// entries when no module is executing).
    pub fn config(&self, key: &str) -> Option<&str> {
        self.state.config.get(self.current_name(), key)
    }

    pub fn config_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        self.config(key).and_then(|v| v.parse().ok())
    }

    /// Register `fd` as the current module's descriptor, replacing any
    /// previous one. Refused unless the module is loaded and exposes a
    /// readable entry point.
    pub fn register_descriptor(&mut self, fd: RawFd) -> bool {
        let Some(id) = self.current else {
            return false;
        };
        let record = &mut self.state.records[id.0];
        if !record.is_loaded() || !record.entry_points().readable {
            dispatcher::emit_module_event(
                "kernel",
                LogLevel::Warn,
                record.name(),
                "descriptor_rejected",
                Some(format!("fd={}", fd)),
            );
            return false;
        }
        record.descriptor = Some(fd);
        true
    }

    pub fn unregister_descriptor(&mut self) {
        if let Some(id) = self.current {
            self.state.records[id.0].descriptor = None;
        }
    }

    pub fn descriptor(&self) -> Option<RawFd> {
        self.current
            .and_then(|id| self.state.records.get(id.0))
            .and_then(|r| r.descriptor())
    }

    pub fn require(&self, name: &str, min_version: Version) -> Requirement {
        self.state.require(name, min_version)
    }

    /// `require` as a refusal-ready result for use inside `init`.
    pub fn require_or_refuse(&self, name: &str, min_version: Version) -> ModuleResult<()> {
        match self.require(name, min_version) {
            Requirement::Satisfied => Ok(()),
            status => Err(ModuleError::CapabilityUnmet {
                name: name.to_string(),
                min_version,
                status,
            }),
        }
    }

    /// Ask the scheduler to stop at the next iteration boundary.
    pub fn request_stop(&mut self) {
        if !self.state.stop_requested {
            let by = self.current_name().unwrap_or("host").to_string();
            crate::emit_system_event!(
                "scheduler",
                LogLevel::Info,
                "stop_requested",
                Some(format!("by={}", by))
            );
        }
        self.state.stop_requested = true;
    }

    pub fn stop_requested(&self) -> bool {
        self.state.stop_requested
    }

    /// Wall-clock seconds as of the current scheduler iteration.
    pub fn now(&self) -> u64 {
        self.state.now
    }

    pub fn lookup<T: Module>(&self, name: &str) -> Option<ModuleRef<T>> {
        let (id, record) = self.state.find_active(name)?;
        let module = record.module.clone()?.as_any().downcast::<T>().ok()?;
        Some(ModuleRef { id, module })
    }

    /// Invoke a public operation of another module with the context switched
    /// to that module for the duration of `body`.
    pub fn call<T: Module, R>(
        &mut self,
        target: &ModuleRef<T>,
        body: impl FnOnce(&T, &mut Context<'_>) -> R,
    ) -> ModuleResult<R> {
        let record = &self.state.records[target.id.0];
        if !record.is_active() {
            return Err(ModuleError::Unavailable(record.name().to_string()));
        }
        let module = target.module.clone();
        Ok(self.with_context(Some(target.id), |ctx| body(&module, ctx)))
    }
}
