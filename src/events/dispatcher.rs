use crate::events::model::{EventMeta, LogEvent, LogLevel, ModuleEvent, NetworkEvent};
use crate::events::sink::LogSink;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

static DISPATCHER: OnceCell<EventDispatcher> = OnceCell::new();

/// Process-wide fan-out of structured events to the registered sinks.
///
/// Delivery is synchronous: the daemon runs on a single thread and every
/// event reaches every sink before `emit` returns.
pub struct EventDispatcher {
    pub session_id: String,
    sinks: RwLock<Vec<Arc<dyn LogSink>>>,
}

impl EventDispatcher {
    pub fn global() -> Option<&'static EventDispatcher> {
        DISPATCHER.get()
    }

    pub fn register_sink(&self, sink: Arc<dyn LogSink>) {
        self.sinks.write().push(sink);
    }

    pub fn flush(&self) {
        for sink in self.sinks.read().iter() {
            sink.flush();
        }
    }
}

/// Install the global dispatcher. Returns false if one was already installed;
/// in that case the given sinks are appended to the existing dispatcher.
pub fn init_events(sinks: Vec<Arc<dyn LogSink>>) -> bool {
    let mut installed = false;
    let dispatcher = DISPATCHER.get_or_init(|| {
        installed = true;
        EventDispatcher {
            session_id: Uuid::new_v4().to_string(),
            sinks: RwLock::new(Vec::new()),
        }
    });
    for sink in sinks {
        dispatcher.register_sink(sink);
    }
    installed
}

pub fn correlation_id() -> String {
    Uuid::new_v4().to_string()[..8].to_string()
}

pub fn meta(component: &'static str, level: LogLevel) -> EventMeta {
    let session_id = EventDispatcher::global()
        .map(|d| d.session_id.clone())
        .unwrap_or_else(|| "unknown".into());
    EventMeta {
        ts: SystemTime::now(),
        level,
        corr_id: None,
        session_id,
        component,
        suppress_console: false,
    }
}

pub fn emit(event: LogEvent) {
    if let Some(d) = EventDispatcher::global() {
        let sinks = d.sinks.read().clone();
        for sink in sinks {
            sink.handle(&event);
        }
    }
}

pub fn flush() {
    if let Some(d) = EventDispatcher::global() {
        d.flush();
    }
}

/// Emit a module lifecycle / entry point event.
pub fn emit_module_event(
    component: &'static str,
    level: LogLevel,
    module: &str,
    action: &str,
    detail: Option<String>,
) {
    emit(LogEvent::Module(ModuleEvent {
        meta: meta(component, level),
        module: module.to_string(),
        action: action.to_string(),
        detail,
    }));
}

/// Emit a structured network event.
pub fn emit_network_event(
    component: &'static str,
    level: LogLevel,
    action: &str,
    addr: Option<String>,
    detail: Option<String>,
) {
    let mut meta = meta(component, level);
    meta.corr_id = Some(correlation_id());
    emit(LogEvent::Network(NetworkEvent {
        meta,
        action: action.to_string(),
        addr,
        detail,
    }));
}
