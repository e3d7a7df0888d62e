//! Curated re-exports for module authors.
//! Import with: `use corebot::prelude::*;`

pub use crate::bus::{callback, Callback, CallbackBus};
pub use crate::config::ConfigStore;
pub use crate::module_host::{
    Context, EntryPoints, Kernel, Module, ModuleError, ModuleId, ModuleRef, ModuleResult,
    Requirement, Version,
};
pub use crate::scheduler::Scheduler;
pub use crate::transport::ServerModule;
