// The `linelog` module: logs every line the `server` module receives.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::bus::{callback, Callback};
use crate::events::{dispatcher::emit_module_event, LogLevel};
use crate::module_host::{
    Context, EntryPoints, Module, ModuleError, ModuleRef, ModuleResult, Version,
};
use crate::transport::{ServerModule, SERVER_MODULE, SERVER_VERSION};

pub const LINELOG_MODULE: &str = "linelog";
pub const LINELOG_VERSION: Version = 1;

#[derive(Default)]
pub struct LineLogModule {
    server: RefCell<Option<ModuleRef<ServerModule>>>,
    on_line: RefCell<Option<Callback<[u8]>>>,
    received: Rc<Cell<u64>>,
}

impl LineLogModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn received(&self) -> u64 {
        self.received.get()
    }
}

impl Module for LineLogModule {
    fn entry_points(&self) -> EntryPoints {
        EntryPoints {
            init: true,
            unload: true,
            ..EntryPoints::NONE
        }
    }

    fn init(&self, ctx: &mut Context<'_>) -> ModuleResult<Version> {
        ctx.require_or_refuse(SERVER_MODULE, SERVER_VERSION)?;
        let server = ctx
            .lookup::<ServerModule>(SERVER_MODULE)
            .ok_or_else(|| ModuleError::Unavailable(SERVER_MODULE.to_string()))?;

        let received = self.received.clone();
        let on_line = callback(move |ctx: &mut Context<'_>, line: &[u8]| {
            received.set(received.get() + 1);
            emit_module_event(
                LINELOG_MODULE,
                LogLevel::Debug,
                ctx.current_name().unwrap_or(LINELOG_MODULE),
                "line",
                Some(String::from_utf8_lossy(line).into_owned()),
            );
            Ok(())
        });
        server.get().lines().subscribe(ctx, &on_line);

        *self.server.borrow_mut() = Some(server);
        *self.on_line.borrow_mut() = Some(on_line);
        Ok(LINELOG_VERSION)
    }

    fn on_unload(&self, _ctx: &mut Context<'_>) {
        let server = self.server.borrow_mut().take();
        let on_line = self.on_line.borrow_mut().take();
        if let (Some(server), Some(on_line)) = (server, on_line) {
            server.get().lines().unsubscribe(&on_line);
        }
    }

    fn as_any(self: Rc<Self>) -> Rc<dyn Any> {
        self
    }
}
