use serde::Serialize;
use std::str::FromStr;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    pub ts: SystemTime,
    pub level: LogLevel,
    pub corr_id: Option<String>,
    pub session_id: String,
    pub component: &'static str,
    pub suppress_console: bool,
}

/// Module lifecycle and entry point outcomes.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleEvent {
    pub meta: EventMeta,
    pub module: String,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NetworkEvent {
    pub meta: EventMeta,
    pub action: String,
    pub addr: Option<String>,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    pub meta: EventMeta,
    pub action: String,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogEvent {
    Module(ModuleEvent),
    Network(NetworkEvent),
    System(SystemEvent),
}

impl LogEvent {
    pub fn meta(&self) -> &EventMeta {
        match self {
            LogEvent::Module(e) => &e.meta,
            LogEvent::Network(e) => &e.meta,
            LogEvent::System(e) => &e.meta,
        }
    }

    pub fn action(&self) -> &str {
        match self {
            LogEvent::Module(e) => &e.action,
            LogEvent::Network(e) => &e.action,
            LogEvent::System(e) => &e.action,
        }
    }
}
