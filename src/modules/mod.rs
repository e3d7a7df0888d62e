//! Statically linked modules, available by name without a dynamic unit.

pub mod linelog;

pub use linelog::{LineLogModule, LINELOG_MODULE, LINELOG_VERSION};

use std::rc::Rc;

use crate::module_host::{BuiltinModules, Module};
use crate::transport::{ServerModule, SERVER_MODULE};

pub fn builtin_modules() -> BuiltinModules {
    BuiltinModules::new()
        .with(SERVER_MODULE, || Rc::new(ServerModule::new()) as Rc<dyn Module>)
        .with(LINELOG_MODULE, || Rc::new(LineLogModule::new()) as Rc<dyn Module>)
}
