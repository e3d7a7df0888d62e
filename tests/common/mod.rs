// Helpers for tests that build small C units against the host ABI.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// C mirror of `corebot::module_host::HostApi`, field for field.
pub const HOST_API_C: &str = r#"
#include <stddef.h>
#include <stdlib.h>

typedef void (*line_cb)(const char *line, size_t len);

struct host_api {
    unsigned int abi_version;
    int (*register_fd)(int fd);
    void (*unregister_fd)(void);
    int (*require)(const char *name, int version);
    const char *(*config_get)(const char *key);
    void (*stop)(void);
    int (*subscribe_lines)(line_cb cb);
    int (*unsubscribe_lines)(line_cb cb);
    int (*send)(const char *data, size_t len);
};
"#;

pub fn temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("corebot-{}-{}", tag, uuid::Uuid::new_v4()));
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Compile `source` into `<dir>/<name>.<ext>`. `None` when no C compiler is
/// available, in which case the caller skips.
pub fn compile_unit(dir: &Path, name: &str, source: &str) -> Option<PathBuf> {
    let src = dir.join(format!("{}.c", name));
    fs::write(&src, format!("{}\n{}", HOST_API_C, source)).unwrap();
    let out = dir.join(format!("{}.{}", name, std::env::consts::DLL_EXTENSION));
    let cc = std::env::var("CC").unwrap_or_else(|_| "cc".to_string());
    let status = Command::new(&cc)
        .args(["-shared", "-fPIC", "-o"])
        .arg(&out)
        .arg(&src)
        .status();
    match status {
        Ok(s) if s.success() => Some(out),
        Ok(s) => panic!("{} failed to build {}: {}", cc, name, s),
        Err(e) => {
            eprintln!("skipping: no C compiler ({}): {}", cc, e);
            None
        }
    }
}
