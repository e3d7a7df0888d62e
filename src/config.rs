//! Scoped key/value configuration.
//!
//! File grammar:
//! * `[section]` switches the current section (section names are module names).
//! * `key = value` or `key = "quoted value"` defines an entry under the current
//!   section, or globally before the first section header. The quoted form is
//!   tried first and may contain whitespace; an unquoted value ends at the
//!   first whitespace or `;`.
//! * The first definition of a (section, key) pair wins over later duplicates.
//! * Anything else is ignored.

use crate::constants::MODULES_KEY;
use crate::events::model::LogLevel;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub section: Option<String>,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigStore {
    entries: Vec<ConfigEntry>,
}

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: String,
        source: std::io::Error,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "cannot read config file '{}': {}", path, source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
        }
    }
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Split `  key = rest` into `(key, rest)`; `rest` starts after the blanks following `=`.
fn split_pair(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    let key_len = line.find(|c: char| !is_name_char(c)).unwrap_or(line.len());
    if key_len == 0 {
        return None;
    }
    let (key, rest) = line.split_at(key_len);
    let rest = rest.trim_start().strip_prefix('=')?;
    Some((key, rest.trim_start()))
}

fn quoted_value(rest: &str) -> Option<&str> {
    let inner = rest.strip_prefix('"')?;
    let end = inner.find('"')?;
    if end == 0 {
        return None;
    }
    Some(&inner[..end])
}

fn bare_value(rest: &str) -> Option<&str> {
    let end = rest
        .find(|c: char| c == ';' || c.is_whitespace())
        .unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(&rest[..end])
}

fn section_header(line: &str) -> Option<&str> {
    let inner = line.strip_prefix('[')?;
    let end = inner.find(']')?;
    let name = &inner[..end];
    if name.is_empty() || !name.chars().all(is_name_char) {
        return None;
    }
    Some(name)
}

enum Line<'a> {
    Pair(&'a str, &'a str),
    Section(&'a str),
    Other,
}

fn classify(line: &str) -> Line<'_> {
    if let Some((key, rest)) = split_pair(line) {
        if let Some(value) = quoted_value(rest).or_else(|| bare_value(rest)) {
            return Line::Pair(key, value);
        }
    }
    match section_header(line) {
        Some(name) => Line::Section(name),
        None => Line::Other,
    }
}

impl ConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(text: &str) -> Self {
        let mut entries = Vec::new();
        let mut section: Option<String> = None;
        for raw in text.lines() {
            let line = match raw.find(['\r', '\n']) {
                Some(end) => &raw[..end],
                None => raw,
            };
            match classify(line) {
                Line::Pair(key, value) => entries.push(ConfigEntry {
                    section: section.clone(),
                    key: key.to_string(),
                    value: value.to_string(),
                }),
                Line::Section(name) => section = Some(name.to_string()),
                Line::Other => {}
            }
        }
        Self { entries }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(Self::parse(&text))
    }

    /// First value defined for `key` in `section` (`None` = global entries).
    pub fn get(&self, section: Option<&str>, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.section.as_deref() == section && e.key == key)
            .map(|e| e.value.as_str())
    }

    pub fn get_global(&self, key: &str) -> Option<&str> {
        self.get(None, key)
    }

    pub fn get_parsed<T: FromStr>(&self, section: Option<&str>, key: &str) -> Option<T> {
        self.get(section, key).and_then(|v| v.parse().ok())
    }

    /// Ordered module list from the global `modules` key.
    pub fn module_names(&self) -> Option<Vec<String>> {
        let raw = self.get_global(MODULES_KEY)?;
        Some(
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

pub fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Path to JSON line log (rotated). Unset disables the file sink.
    pub json_path: Option<String>,
    /// Max size in bytes before rotation (default 5MB)
    pub json_max_bytes: u64,
    /// Number of rotated files to retain (default 3)
    pub json_rotate: u32,
    /// Disable console sink (default false)
    pub disable_console: bool,
    /// Minimum level printed on the console
    pub console_level: Option<LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json_path: None,
            json_max_bytes: 5 * 1024 * 1024,
            json_rotate: 3,
            disable_console: false,
            console_level: None,
        }
    }
}

impl LoggingConfig {
    pub fn from_store(store: &ConfigStore) -> Self {
        let defaults = Self::default();
        Self {
            json_path: store.get_global("log_json").map(str::to_string),
            json_max_bytes: store
                .get_parsed(None, "log_json_max_bytes")
                .unwrap_or(defaults.json_max_bytes),
            json_rotate: store
                .get_parsed(None, "log_json_rotate")
                .unwrap_or(defaults.json_rotate),
            disable_console: store
                .get_global("log_console")
                .and_then(parse_bool)
                .map(|enabled| !enabled)
                .unwrap_or(defaults.disable_console),
            console_level: store.get_parsed(None, "log_level"),
        }
    }
}
