//! Stub plugin helpers shared by unit tests.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Echoes every event line back and exits on `quit`.
pub(crate) const CAT: &str = r#"while IFS= read -r line; do
case "$line" in *'"event":"quit"'*) exit 0 ;; esac
echo "$line"
done"#;

/// Writes an executable `#!/bin/sh` script at `dir/name`.
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Creates a temp directory holding one script.
pub(crate) fn script(name: &str, body: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_script(dir.path(), name, body);
    (dir, path)
}

pub(crate) fn write_descriptor(dir: &Path, stem: &str, json: &str) {
    fs::write(dir.join(format!("{stem}.json")), json).unwrap();
}

/// Installs a script plus a descriptor named after it.
pub(crate) fn install_plugin(dir: &Path, name: &str, pattern: &str, body: &str) {
    write_script(dir, name, body);
    let descriptor = serde_json::json!({
        "name": name,
        "description": format!("{name} test plugin"),
        "pattern": pattern,
        "exec": name,
        "icon": "system-run",
    });
    write_descriptor(dir, name, &descriptor.to_string());
}
