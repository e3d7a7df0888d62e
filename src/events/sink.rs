use crate::{
    constants::ICON_PLACEHOLDER,
    events::model::{LogEvent, LogLevel},
};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

pub trait LogSink: Send + Sync {
    fn handle(&self, event: &LogEvent);
    fn flush(&self) {}
}

pub struct ConsoleSink {
    level_filter: Option<LogLevel>,
}

impl ConsoleSink {
    pub fn new(level_filter: Option<LogLevel>) -> Self {
        Self { level_filter }
    }
}

impl LogSink for ConsoleSink {
    fn handle(&self, event: &LogEvent) {
        let meta = event.meta();
        if meta.suppress_console {
            return;
        }
        if let Some(min) = self.level_filter {
            if meta.level < min {
                return;
            }
        }
        match event {
            LogEvent::Module(m) => {
                println!(
                    "{}MOD [{}] action={} detail={:?} corr={:?}",
                    ICON_PLACEHOLDER, m.module, m.action, m.detail, m.meta.corr_id
                );
            }
            LogEvent::Network(n) => {
                println!(
                    "{}NET action={} addr={:?} detail={:?} corr={:?}",
                    ICON_PLACEHOLDER, n.action, n.addr, n.detail, n.meta.corr_id
                );
            }
            LogEvent::System(s) => {
                println!(
                    "{}SYS [{}] action={} detail={:?}",
                    ICON_PLACEHOLDER, s.meta.component, s.action, s.detail
                );
            }
        }
    }
}

pub struct JsonFileSink {
    path: PathBuf,
    rotate: bool,
    max_size_bytes: u64,
    max_backups: u32,
    writer: Mutex<Option<File>>,
}

impl JsonFileSink {
    pub fn new<P: Into<PathBuf>>(
        path: P,
        rotate: bool,
        max_size_bytes: u64,
        max_backups: u32,
    ) -> std::io::Result<Self> {
        let pb = path.into();
        if let Some(parent) = pb.parent() {
            fs::create_dir_all(parent).ok();
        }
        let file = OpenOptions::new().create(true).append(true).open(&pb)?;
        Ok(Self {
            path: pb,
            rotate,
            max_size_bytes,
            max_backups,
            writer: Mutex::new(Some(file)),
        })
    }

    fn rotate_if_needed(&self) {
        if !self.rotate {
            return;
        }
        if let Ok(meta) = fs::metadata(&self.path) {
            if meta.len() >= self.max_size_bytes {
                let _ = self.perform_rotation();
            }
        }
    }

    fn perform_rotation(&self) -> std::io::Result<()> {
        let mut guard = self.writer.lock();
        *guard = None;
        for idx in (1..self.max_backups).rev() {
            let from = self.path.with_extension(format!("jsonl.{}", idx));
            let to = self.path.with_extension(format!("jsonl.{}", idx + 1));
            if from.exists() {
                let _ = fs::rename(&from, &to);
            }
        }
        if self.max_backups > 0 {
            fs::rename(&self.path, self.path.with_extension("jsonl.1"))?;
        } else {
            fs::remove_file(&self.path)?;
        }
        *guard = Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)?,
        );
        Ok(())
    }
}

impl LogSink for JsonFileSink {
    fn handle(&self, event: &LogEvent) {
        self.rotate_if_needed();
        if let Ok(json) = serde_json::to_string(event) {
            let mut guard = self.writer.lock();
            if let Some(f) = guard.as_mut() {
                let _ = f.write_all(json.as_bytes());
                let _ = f.write_all(b"\n");
            }
        }
    }

    fn flush(&self) {
        let guard = self.writer.lock();
        if let Some(f) = guard.as_ref() {
            let _ = f.sync_all();
        }
    }
}

/// Keeps every event in memory; handy for embedding and tests.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<LogEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<LogEvent> {
        self.events.lock().clone()
    }

    pub fn actions(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .map(|e| e.action().to_string())
            .collect()
    }
}

impl LogSink for MemorySink {
    fn handle(&self, event: &LogEvent) {
        self.events.lock().push(event.clone());
    }
}
