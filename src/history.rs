//! Transcript export and import.
//!
//! A transcript is the session history as a pretty-printed JSON array of
//! `{role, content}` objects, the same shape the completion endpoint takes.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, StudioError};
use crate::wire::ChatMessage;

/// Serialize `history` for download. Refuses an empty history.
pub fn export_json(history: &[ChatMessage]) -> Result<String> {
    if history.is_empty() {
        return Err(StudioError::EmptyHistory);
    }
    Ok(serde_json::to_string_pretty(history)?)
}

pub fn import_json(json: &str) -> Result<Vec<ChatMessage>> {
    Ok(serde_json::from_str(json)?)
}

/// Write `history` to `path`.
pub fn save(path: &Path, history: &[ChatMessage]) -> Result<()> {
    let json = export_json(history)?;
    std::fs::write(path, json).map_err(|source| StudioError::Io { path: path.to_path_buf(), source })
}

/// Read a transcript previously written by [`save`].
pub fn load(path: &Path) -> Result<Vec<ChatMessage>> {
    let json = std::fs::read_to_string(path)
        .map_err(|source| StudioError::Io { path: path.to_path_buf(), source })?;
    import_json(&json)
}

/// `studio_chat_<unix-seconds>.json` in the current directory.
pub fn default_export_name() -> PathBuf {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    PathBuf::from(format!("studio_chat_{secs}.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Role;

    fn sample() -> Vec<ChatMessage> {
        vec![ChatMessage::user("Merhaba"), ChatMessage::assistant("Selam! 👋")]
    }


    #[test]
    fn test_export_empty_is_error() {
        assert!(matches!(export_json(&[]), Err(StudioError::EmptyHistory)));
    }

    #[test]
    fn test_export_is_pretty_array() {
        let json = export_json(&sample()).expect("export");
        assert!(json.starts_with('['));
        assert!(json.contains('\n'));
        assert!(json.contains("\"role\": \"assistant\""));
    }

    #[test]
    fn test_import_rejects_unknown_role() {
        let err = import_json(r#"[{"role":"tool","content":"x"}]"#);
        assert!(matches!(err, Err(StudioError::Json(_))));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chat.json");
        save(&path, &sample()).expect("save");
        let loaded = load(&path).expect("load");
        assert_eq!(loaded, sample());
        assert_eq!(loaded[1].role, Role::Assistant);
    }

    #[test]
    fn test_save_empty_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("empty.json");
        assert!(matches!(save(&path, &[]), Err(StudioError::EmptyHistory)));
        assert!(!path.exists());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("missing.json");
        match load(&path) {
            Err(StudioError::Io { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn test_default_export_name_shape() {
        let name = default_export_name();
        let s = name.to_string_lossy();
        assert!(s.starts_with("studio_chat_"));
        assert!(s.ends_with(".json"));
    }
}
