use crate::config::LoggingConfig;
use crate::events::dispatcher::init_events;
use crate::events::sink::{ConsoleSink, JsonFileSink, LogSink};
use std::sync::Arc;

/// Initialize events from the `log_*` global config keys.
pub fn init_events_from_config(logging: &LoggingConfig) {
    let mut sinks: Vec<Arc<dyn LogSink>> = Vec::new();

    if !logging.disable_console {
        sinks.push(Arc::new(ConsoleSink::new(logging.console_level)));
    }

    if let Some(json_path) = logging.json_path.as_ref() {
        match JsonFileSink::new(
            json_path,
            true,
            logging.json_max_bytes,
            logging.json_rotate,
        ) {
            Ok(json_sink) => sinks.push(Arc::new(json_sink)),
            Err(e) => eprintln!("❌ Failed to open JSON log '{}': {}", json_path, e),
        }
    }
    init_events(sinks);
}
