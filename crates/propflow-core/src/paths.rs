/// Path constants and utilities for file-backed storage
use propflow_types::RequestKind;
use std::path::{Path, PathBuf};

pub const DEFAULT_DATA_ROOT: &str = "/data/propflow";

// Directory names (relative to the data root)
pub const RECORDS_DIR_NAME: &str = "records";
pub const EVENTS_DIR_NAME: &str = "events";
pub const OUTBOX_DIR_NAME: &str = "outbox";
pub const COMMANDS_DIR_NAME: &str = "commands";
pub const PROCESSED_DIR_NAME: &str = "processed";
pub const FAILED_DIR_NAME: &str = "failed";

pub const RECORD_FILE_PREFIX: &str = "request_";
pub const EVENT_FILE_PREFIX: &str = "event_";

// Path builder functions, relative to an explicit root
pub fn records_dir(root: &Path) -> PathBuf {
    root.join(RECORDS_DIR_NAME)
}

pub fn kind_dir(root: &Path, kind: RequestKind) -> PathBuf {
    records_dir(root).join(kind.directory_name())
}

pub fn record_file_name(id: &str) -> String {
    format!("{}{}.json", RECORD_FILE_PREFIX, id)
}

pub fn events_dir(root: &Path) -> PathBuf {
    root.join(EVENTS_DIR_NAME)
}

pub fn outbox_dir(root: &Path) -> PathBuf {
    events_dir(root).join(OUTBOX_DIR_NAME)
}

pub fn events_processed_dir(root: &Path) -> PathBuf {
    events_dir(root).join(PROCESSED_DIR_NAME)
}

pub fn events_failed_dir(root: &Path) -> PathBuf {
    events_dir(root).join(FAILED_DIR_NAME)
}

pub fn commands_dir(root: &Path) -> PathBuf {
    root.join(COMMANDS_DIR_NAME)
}

pub fn commands_processed_dir(root: &Path) -> PathBuf {
    commands_dir(root).join(PROCESSED_DIR_NAME)
}

pub fn commands_failed_dir(root: &Path) -> PathBuf {
    commands_dir(root).join(FAILED_DIR_NAME)
}

/// True for `<prefix>*.json` files, ignoring in-flight `.tmp` / `.processing` siblings
pub fn is_pending_json(path: &Path, prefix: &str) -> bool {
    path.is_file()
        && path.extension().and_then(|s| s.to_str()) == Some("json")
        && path
            .file_name()
            .and_then(|s| s.to_str())
            .map(|name| name.starts_with(prefix))
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_dirs_are_distinct() {
        let root = Path::new("/tmp/propflow");
        let mut dirs: Vec<PathBuf> = RequestKind::ALL.iter().map(|k| kind_dir(root, *k)).collect();
        dirs.sort();
        dirs.dedup();
        assert_eq!(dirs.len(), RequestKind::ALL.len());
        assert!(dirs.iter().all(|d| d.starts_with(records_dir(root))));
    }

    #[test]
    fn test_is_pending_json_filters_prefix_and_extension() {
        let dir = tempfile::TempDir::new().unwrap();
        let good = dir.path().join("event_1.json");
        let processing = dir.path().join("event_2.json.processing");
        let other = dir.path().join("notes.json");
        for path in [&good, &processing, &other] {
            std::fs::write(path, "{}").unwrap();
        }

        assert!(is_pending_json(&good, EVENT_FILE_PREFIX));
        assert!(!is_pending_json(&processing, EVENT_FILE_PREFIX));
        assert!(!is_pending_json(&other, EVENT_FILE_PREFIX));
    }
}
