use std::fs;

use corebot::config::{ConfigStore, LoggingConfig};
use corebot::events::LogLevel;
use corebot::module_host::Kernel;

const SAMPLE: &str = r#"
modules = "server, linelog"
log_level = warn
nick = first
nick = second

[server]
host = irc.example.net ; trailing comment
port = 6667
motd = "welcome to the network"

[linelog]
host = elsewhere
"#;

#[test]
fn first_definition_wins() {
    let store = ConfigStore::parse(SAMPLE);
    assert_eq!(store.get_global("nick"), Some("first"));
}

#[test]
fn sections_scope_keys() {
    let store = ConfigStore::parse(SAMPLE);
    assert_eq!(store.get(Some("server"), "host"), Some("irc.example.net"));
    assert_eq!(store.get(Some("linelog"), "host"), Some("elsewhere"));
    assert_eq!(store.get_global("host"), None);
    assert_eq!(store.get(Some("server"), "nick"), None);
    assert_eq!(store.get_parsed::<u16>(Some("server"), "port"), Some(6667));
    assert_eq!(
        store.get(Some("server"), "motd"),
        Some("welcome to the network")
    );
}

#[test]
fn module_list_is_ordered_and_trimmed() {
    let store = ConfigStore::parse(SAMPLE);
    assert_eq!(
        store.module_names(),
        Some(vec!["server".to_string(), "linelog".to_string()])
    );
    assert_eq!(ConfigStore::parse("log_level = info\n").module_names(), None);
    assert_eq!(
        ConfigStore::parse("modules = \" , ,\"\n").module_names(),
        Some(Vec::new())
    );
}

#[test]
fn context_reads_the_current_modules_section() {
    let mut kernel = Kernel::new(ConfigStore::parse(SAMPLE));
    let server = kernel.add_module("server");
    let linelog = kernel.add_module("linelog");

    assert_eq!(
        kernel.with_context(Some(server), |ctx| ctx.config("host").map(str::to_string)),
        Some("irc.example.net".to_string())
    );
    assert_eq!(
        kernel.with_context(Some(linelog), |ctx| ctx.config("host").map(str::to_string)),
        Some("elsewhere".to_string())
    );
    // No module executing: global section.
    assert_eq!(
        kernel.with_context(None, |ctx| ctx.config("nick").map(str::to_string)),
        Some("first".to_string())
    );
    assert!(kernel.with_context(None, |ctx| ctx.config("host").is_none()));
}

#[test]
fn logging_config_from_globals() {
    let store = ConfigStore::parse(
        "log_level = debug\nlog_console = off\nlog_json = \"logs/corebot.jsonl\"\nlog_json_rotate = 7\n",
    );
    let logging = LoggingConfig::from_store(&store);
    assert_eq!(logging.console_level, Some(LogLevel::Debug));
    assert!(logging.disable_console);
    assert_eq!(logging.json_path.as_deref(), Some("logs/corebot.jsonl"));
    assert_eq!(logging.json_rotate, 7);
    assert_eq!(logging.json_max_bytes, LoggingConfig::default().json_max_bytes);

    let defaults = LoggingConfig::from_store(&ConfigStore::new());
    assert!(!defaults.disable_console);
    assert!(defaults.json_path.is_none());
}

#[test]
fn load_reads_file_and_reports_missing_one() {
    let path = std::env::temp_dir().join(format!("corebot-{}.ini", uuid::Uuid::new_v4()));
    fs::write(&path, "[server]\r\nport = 7000\r\n").unwrap();
    let store = ConfigStore::load(&path).unwrap();
    assert_eq!(store.get(Some("server"), "port"), Some("7000"));
    let _ = fs::remove_file(&path);

    let missing = ConfigStore::load(&path);
    assert!(missing.is_err());
}
