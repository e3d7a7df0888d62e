#[macro_export]
macro_rules! emit_system_event {
    ($component:expr, $level:expr, $action:expr) => {
        $crate::emit_system_event!($component, $level, $action, None)
    };
    ($component:expr, $level:expr, $action:expr, $detail:expr) => {{
        use $crate::events::{dispatcher, model::*};
        let mut meta = dispatcher::meta($component, $level);
        meta.corr_id = Some(dispatcher::correlation_id());
        dispatcher::emit(LogEvent::System(SystemEvent {
            meta,
            action: $action.to_string(),
            detail: $detail,
        }));
    }};
}
