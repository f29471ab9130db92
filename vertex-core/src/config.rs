//! Dotted-key JSON settings persistence, grounded on the original
//! `Settings` class: a single JSON document addressed by paths like
//! `memoryScan.readerThreads`, loaded once and written back on reset.

use std::fs;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{VertexError, VertexResult};

pub struct Settings {
    path: PathBuf,
    document: Value,
}

impl Settings {
    /// Loads settings from `path`, falling back to an empty document (and
    /// logging) if the file is missing or malformed.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let document = Self::load_from_file(&path).unwrap_or_else(|err| {
            log::error!("failed to load settings from {}: {err}", path.display());
            Value::Object(Default::default())
        });
        Self { path, document }
    }

    fn load_from_file(path: &Path) -> VertexResult<Value> {
        let contents = fs::read_to_string(path)
            .map_err(|e| VertexError::IoFailed(format!("{}: {e}", path.display())))?;
        serde_json::from_str(&contents)
            .map_err(|e| VertexError::IoFailed(format!("parse {}: {e}", path.display())))
    }

    pub fn save(&self) -> VertexResult<()> {
        let rendered = serde_json::to_string_pretty(&self.document)
            .map_err(|e| VertexError::IoFailed(e.to_string()))?;
        fs::write(&self.path, rendered)
            .map_err(|e| VertexError::IoFailed(format!("{}: {e}", self.path.display())))
    }

    fn split_key(key: &str) -> Vec<&str> {
        key.split('.').filter(|p| !p.is_empty()).collect()
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let parts = Self::split_key(key);
        let mut cursor = &self.document;
        for part in parts {
            cursor = cursor.get(part)?;
        }
        serde_json::from_value(cursor.clone()).ok()
    }

    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) {
        let parts = Self::split_key(key);
        let Some((last, ancestors)) = parts.split_last() else {
            return;
        };

        let mut cursor = &mut self.document;
        for part in ancestors {
            if !cursor.is_object() {
                *cursor = Value::Object(Default::default());
            }
            cursor = cursor
                .as_object_mut()
                .unwrap()
                .entry(part.to_string())
                .or_insert_with(|| Value::Object(Default::default()));
        }

        if !cursor.is_object() {
            *cursor = Value::Object(Default::default());
        }
        let rendered = serde_json::to_value(value).unwrap_or(Value::Null);
        cursor
            .as_object_mut()
            .unwrap()
            .insert(last.to_string(), rendered);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotted_get_set_roundtrips() {
        let dir = std::env::temp_dir().join(format!("vertex-settings-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        let path = dir.join("Settings.json");
        let _ = fs::remove_file(&path);

        let mut settings = Settings::load(&path);
        assert_eq!(settings.get::<u32>("memoryScan.readerThreads"), None);

        settings.set("memoryScan.readerThreads", 4u32);
        assert_eq!(settings.get::<u32>("memoryScan.readerThreads"), Some(4));

        settings.set("debugger.debuggerIndependentThread", true);
        assert_eq!(
            settings.get::<bool>("debugger.debuggerIndependentThread"),
            Some(true)
        );
        // Sibling key under the same nested object survives.
        assert_eq!(settings.get::<u32>("memoryScan.readerThreads"), Some(4));
    }

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load("/nonexistent/path/Settings.json");
        assert_eq!(settings.get_or("memoryScan.maxUndoDepth", 8u32), 8);
    }
}
