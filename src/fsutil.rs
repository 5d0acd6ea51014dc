//! Small filesystem helpers shared by the persisted records.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

/// Serialize `value` as pretty JSON and write it to `path` atomically.
///
/// The bytes go to a sibling temp file named after the current PID, which is
/// then renamed over the target. Readers never observe a half-written record,
/// and concurrent writers from different processes never share a temp file.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    data.push(b'\n');
    write_atomic(path, &data)
}

/// Write `data` to `path` via temp file + rename, creating the parent directory.
pub fn write_atomic(path: &Path, data: &[u8]) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = temp_path(path);
    if let Err(e) = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Create `path` holding `value` as pretty JSON, failing with
/// [`io::ErrorKind::AlreadyExists`] if it is already there.
///
/// The record is written to a temp file and hard-linked into place, so the
/// target appears fully written or not at all, and only one of several
/// concurrent creators wins.
pub fn create_json_exclusive<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut data = serde_json::to_vec_pretty(value).map_err(io::Error::other)?;
    data.push(b'\n');
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let tmp = temp_path(path);
    let result = fs::write(&tmp, &data).and_then(|()| fs::hard_link(&tmp, path));
    let _ = fs::remove_file(&tmp);
    result
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp.{}", std::process::id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_json_atomic_creates_parent_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".runtime").join("state.json");

        write_json_atomic(&path, &serde_json::json!({"limited": true})).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("\"limited\": true"));
        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty(), "temp file left behind: {leftovers:?}");
    }

    #[test]
    fn write_atomic_overwrites_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("record.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn create_exclusive_never_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".runtime").join("agent.lock");

        create_json_exclusive(&path, &serde_json::json!({"pid": 1})).unwrap();
        let err = create_json_exclusive(&path, &serde_json::json!({"pid": 2})).unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert!(fs::read_to_string(&path).unwrap().contains("\"pid\": 1"));
        let names: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .map(|e| e.file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("agent.lock")]);
    }

    #[test]
    fn remove_if_exists_ignores_missing() {
        let dir = tempfile::tempdir().unwrap();
        assert!(remove_if_exists(&dir.path().join("nope")).is_ok());
    }
}
