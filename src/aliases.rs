use crate::backend::Device;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// User-assigned presentation data for one hardware id. Owned by an external tool; this
/// crate only reads it.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AliasEntry {
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
}

pub type AliasBook = HashMap<String, AliasEntry>;

#[derive(Debug, Error)]
pub enum AliasError {
    #[error("failed to read alias file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse alias file {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

#[derive(Debug, Clone, Default)]
pub struct AliasFile {
    path: Option<PathBuf>,
}

impl AliasFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    /// Reads the book fresh from disk. No configured path or a missing file is an empty book.
    pub fn load(&self) -> Result<AliasBook, AliasError> {
        let Some(path) = &self.path else {
            return Ok(AliasBook::new());
        };
        let path_display = path.display().to_string();
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(AliasBook::new()),
            Err(source) => {
                return Err(AliasError::Read {
                    path: path_display,
                    source,
                })
            }
        };
        if text.trim().is_empty() {
            return Ok(AliasBook::new());
        }
        serde_yaml::from_str(&text).map_err(|source| AliasError::Parse {
            path: path_display,
            source,
        })
    }
}

pub fn merge_aliases(devices: Vec<Device>, book: &AliasBook) -> Vec<Device> {
    devices
        .into_iter()
        .map(|mut device| {
            let entry = book.get(&device.id);
            device.alias = entry
                .and_then(|e| e.alias.clone())
                .filter(|a| !a.trim().is_empty());
            device.icon = entry
                .and_then(|e| e.icon.clone())
                .filter(|i| !i.trim().is_empty());
            device
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn merge_only_touches_matching_ids() {
        let mut book = AliasBook::new();
        book.insert(
            "1-2".to_string(),
            AliasEntry {
                alias: Some("Desk Mouse".to_string()),
                icon: Some("mouse".to_string()),
            },
        );
        book.insert(
            "1-4".to_string(),
            AliasEntry {
                alias: Some("".to_string()),
                icon: None,
            },
        );

        let merged = merge_aliases(
            vec![
                Device::new("1-2", "USB Receiver", "HID"),
                Device::new("1-3", "Webcam", "Video"),
                Device::new("1-4", "Dock", "Hub"),
            ],
            &book,
        );

        assert_eq!(merged[0].display_name(), "Desk Mouse");
        assert_eq!(merged[0].icon.as_deref(), Some("mouse"));
        assert_eq!(merged[1].alias, None);
        assert_eq!(merged[2].alias, None);
        assert_eq!(merged[2].display_name(), "Dock");
    }

    #[test]
    fn missing_or_unset_file_is_empty() {
        assert!(AliasFile::new(None).load().unwrap().is_empty());
        let absent = AliasFile::new(Some(PathBuf::from("/nonexistent/aether/aliases.yaml")));
        assert!(absent.load().unwrap().is_empty());
    }

    #[test]
    fn loads_yaml_book() {
        let file = NamedTempFile::new().unwrap();
        fs::write(
            file.path(),
            "\"1-2\":\n  alias: Desk Mouse\n  icon: mouse\n\"1-3\":\n  icon: camera\n",
        )
        .unwrap();

        let book = AliasFile::new(Some(file.path().to_path_buf())).load().unwrap();
        assert_eq!(book.len(), 2);
        assert_eq!(book["1-2"].alias.as_deref(), Some("Desk Mouse"));
        assert_eq!(book["1-3"].alias, None);
    }

    #[test]
    fn broken_yaml_is_a_parse_error() {
        let file = NamedTempFile::new().unwrap();
        fs::write(file.path(), "- just\n- a list\n").unwrap();
        let err = AliasFile::new(Some(file.path().to_path_buf()))
            .load()
            .unwrap_err();
        assert!(matches!(err, AliasError::Parse { .. }));
    }
}
