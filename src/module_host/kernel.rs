use std::os::unix::io::RawFd;
use std::rc::Rc;

use super::context::{Context, ModuleRef};
use super::loader::{LoadError, ModuleSource};
use super::{EntryPoints, Module, ModuleError, ModuleId, Requirement, Version};
use crate::config::ConfigStore;
use crate::events::{dispatcher::emit_module_event, LogLevel};

/// Kernel-side bookkeeping for one configured module name.
pub struct ModuleRecord {
    name: String,
    pub(crate) module: Option<Rc<dyn Module>>,
    version: Option<Version>,
    pub(crate) descriptor: Option<RawFd>,
    entry_points: EntryPoints,
}

impl ModuleRecord {
    fn new(name: String) -> Self {
        Self {
            name,
            module: None,
            version: None,
            descriptor: None,
            entry_points: EntryPoints::NONE,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A unit is attached (possibly still inside its init entry point).
    pub fn is_loaded(&self) -> bool {
        self.module.is_some()
    }

    /// Loaded and initialised: visible to `require` and the scheduler.
    pub fn is_active(&self) -> bool {
        self.module.is_some() && self.version.is_some()
    }

    pub fn version(&self) -> Option<Version> {
        self.version
    }

    pub fn descriptor(&self) -> Option<RawFd> {
        self.descriptor
    }

    pub fn entry_points(&self) -> EntryPoints {
        self.entry_points
    }

    fn clear(&mut self) {
        self.module = None;
        self.version = None;
        self.descriptor = None;
        self.entry_points = EntryPoints::NONE;
    }
}

pub(crate) struct KernelState {
    pub(crate) records: Vec<ModuleRecord>,
    pub(crate) config: ConfigStore,
    pub(crate) stop_requested: bool,
    pub(crate) now: u64,
}

impl KernelState {
    pub(crate) fn find_active(&self, name: &str) -> Option<(ModuleId, &ModuleRecord)> {
        self.records
            .iter()
            .enumerate()
            .find(|(_, r)| r.is_active() && r.name == name)
            .map(|(idx, r)| (ModuleId(idx), r))
    }

    pub(crate) fn require(&self, name: &str, min_version: Version) -> Requirement {
        match self.find_active(name).and_then(|(_, r)| r.version) {
            None => Requirement::Unavailable,
            Some(v) if v < min_version => Requirement::InsufficientVersion,
            Some(_) => Requirement::Satisfied,
        }
    }
}

/// Owns the module records, in configuration order, and the sources units
/// are opened from.
pub struct Kernel {
    state: KernelState,
    sources: Vec<Box<dyn ModuleSource>>,
}

impl Kernel {
    pub fn new(config: ConfigStore) -> Self {
        Self {
            state: KernelState {
                records: Vec::new(),
                config,
                stop_requested: false,
                now: 0,
            },
            sources: Vec::new(),
        }
    }

    /// Sources are consulted in the order they were added.
    pub fn with_source(mut self, source: Box<dyn ModuleSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn add_module<S: Into<String>>(&mut self, name: S) -> ModuleId {
        self.state.records.push(ModuleRecord::new(name.into()));
        ModuleId(self.state.records.len() - 1)
    }

    pub fn config(&self) -> &ConfigStore {
        &self.state.config
    }

    pub fn records(&self) -> &[ModuleRecord] {
        &self.state.records
    }

    pub fn record(&self, id: ModuleId) -> Option<&ModuleRecord> {
        self.state.records.get(id.0)
    }

    pub fn id_of(&self, name: &str) -> Option<ModuleId> {
        self.state
            .records
            .iter()
            .position(|r| r.name == name)
            .map(ModuleId)
    }

    pub fn now(&self) -> u64 {
        self.state.now
    }

    pub fn set_now(&mut self, now: u64) {
        self.state.now = now;
    }

    pub fn stop_requested(&self) -> bool {
        self.state.stop_requested
    }

    pub fn request_stop(&mut self) {
        self.context().request_stop();
    }

    /// Host-level context: no module is executing, config reads hit the
    /// global section.
    pub fn context(&mut self) -> Context<'_> {
        Context::new(&mut self.state, None)
    }

    pub fn with_context<R>(
        &mut self,
        module: Option<ModuleId>,
        body: impl FnOnce(&mut Context<'_>) -> R,
    ) -> R {
        let mut ctx = Context::new(&mut self.state, module);
        body(&mut ctx)
    }

    pub fn require(&self, name: &str, min_version: Version) -> Requirement {
        self.state.require(name, min_version)
    }

    pub fn module<T: Module>(&mut self, name: &str) -> Option<ModuleRef<T>> {
        self.context().lookup(name)
    }

    fn open(&self, name: &str) -> Result<Rc<dyn Module>, LoadError> {
        let mut searched = Vec::new();
        for source in &self.sources {
            match source.open(name) {
                Ok(module) => return Ok(module),
                Err(LoadError::NotFound { searched: s, .. }) => searched.extend(s),
                Err(e) => return Err(e),
            }
        }
        Err(LoadError::NotFound {
            name: name.to_string(),
            searched,
        })
    }

    /// Attach and initialise the unit for `id`. Failures are logged and leave
    /// the record unloaded; they never affect other modules.
    pub fn load(&mut self, id: ModuleId) -> Result<Version, ModuleError> {
        let record = &self.state.records[id.0];
        if let (true, Some(v)) = (record.is_loaded(), record.version) {
            return Ok(v);
        }
        let name = record.name.clone();

        let module = match self.open(&name) {
            Ok(module) => module,
            Err(e) => {
                emit_module_event(
                    "kernel",
                    LogLevel::Error,
                    &name,
                    "load_failed",
                    Some(e.to_string()),
                );
                return Err(ModuleError::Load(e));
            }
        };

        let entry_points = module.entry_points();
        {
            let record = &mut self.state.records[id.0];
            record.module = Some(module.clone());
            record.entry_points = entry_points;
            record.version = None;
        }
        emit_module_event(
            "kernel",
            LogLevel::Debug,
            &name,
            "loaded",
            Some(format!("{:?}", entry_points)),
        );

        let version = if entry_points.init {
            let mut ctx = Context::new(&mut self.state, Some(id));
            match module.init(&mut ctx) {
                Ok(v) => v,
                Err(e) => {
                    emit_module_event(
                        "kernel",
                        LogLevel::Warn,
                        &name,
                        "refused",
                        Some(e.to_string()),
                    );
                    drop(module);
                    self.unload(id);
                    return Err(e);
                }
            }
        } else {
            0
        };

        self.state.records[id.0].version = Some(version);
        emit_module_event(
            "kernel",
            LogLevel::Info,
            &name,
            "initialised",
            Some(format!("version={}", version)),
        );
        Ok(version)
    }

    /// Load every configured module in list order. Returns how many loaded.
    pub fn load_all(&mut self) -> usize {
        (0..self.state.records.len())
            .filter(|&idx| self.load(ModuleId(idx)).is_ok())
            .count()
    }

    /// Run the unload entry point, then drop the unit and reset the record.
    pub fn unload(&mut self, id: ModuleId) {
        let Some(module) = self.state.records[id.0].module.clone() else {
            return;
        };
        if self.state.records[id.0].entry_points.unload {
            let mut ctx = Context::new(&mut self.state, Some(id));
            module.on_unload(&mut ctx);
        }
        let record = &mut self.state.records[id.0];
        record.clear();
        drop(module);
        emit_module_event("kernel", LogLevel::Info, &record.name, "unloaded", None);
    }

    /// Tear down in reverse list order so dependents go before what they
    /// depend on.
    pub fn unload_all(&mut self) {
        for idx in (0..self.state.records.len()).rev() {
            self.unload(ModuleId(idx));
        }
    }

    /// Invoke every active module's tick entry point, in list order.
    pub fn tick(&mut self, now: u64) {
        self.state.now = now;
        for idx in 0..self.state.records.len() {
            let record = &self.state.records[idx];
            if !record.is_active() || !record.entry_points.tick {
                continue;
            }
            let Some(module) = record.module.clone() else {
                continue;
            };
            let mut ctx = Context::new(&mut self.state, Some(ModuleId(idx)));
            if let Err(e) = module.on_tick(&mut ctx) {
                self.report_failure(ModuleId(idx), "tick", &e);
            }
        }
    }

    /// Descriptors of active modules, in list order.
    pub fn descriptors(&self) -> Vec<(ModuleId, RawFd)> {
        self.state
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.is_active() && r.entry_points.readable)
            .filter_map(|(idx, r)| r.descriptor.map(|fd| (ModuleId(idx), fd)))
            .collect()
    }

    /// Hand a ready descriptor to its owner. Skipped if the owner dropped or
    /// replaced the descriptor since the wait set was built.
    pub fn dispatch_readable(&mut self, id: ModuleId, fd: RawFd) {
        let Some(record) = self.state.records.get(id.0) else {
            return;
        };
        if !record.is_active() || !record.entry_points.readable || record.descriptor != Some(fd)
        {
            return;
        }
        let Some(module) = record.module.clone() else {
            return;
        };
        let mut ctx = Context::new(&mut self.state, Some(id));
        if let Err(e) = module.on_readable(&mut ctx, fd) {
            self.report_failure(id, "readable", &e);
        }
    }

    /// Drop a descriptor the owner can no longer service (closed behind its back).
    pub(crate) fn revoke_descriptor(&mut self, id: ModuleId, fd: RawFd) {
        if let Some(record) = self.state.records.get_mut(id.0) {
            if record.descriptor == Some(fd) {
                record.descriptor = None;
                emit_module_event(
                    "kernel",
                    LogLevel::Warn,
                    &record.name,
                    "descriptor_revoked",
                    Some(format!("fd={}", fd)),
                );
            }
        }
    }

    fn report_failure(&self, id: ModuleId, entry_point: &str, error: &ModuleError) {
        emit_module_event(
            "kernel",
            LogLevel::Error,
            self.state.records[id.0].name(),
            "entry_point_failed",
            Some(format!("entry={} error={}", entry_point, error)),
        );
    }
}
