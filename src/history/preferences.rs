//! Persisted user preferences

use super::storage::{KeyValueStore, StorageResult};
use serde::{Deserialize, Serialize};

pub const SETTINGS_KEY: &str = "agentChatSettings";

/// Stored fields override the defaults one by one
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Preferences {
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            model: "qwen3:8b".to_string(),
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

impl Preferences {
    pub fn load(store: &dyn KeyValueStore) -> Self {
        match store.get(SETTINGS_KEY) {
            Ok(Some(raw)) => serde_json::from_str(&raw).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Discarding corrupt preferences");
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read preferences");
                Self::default()
            }
        }
    }

    pub fn save(&self, store: &dyn KeyValueStore) -> StorageResult<()> {
        // Plain strings and numbers always serialize
        let raw = serde_json::to_string(self).unwrap_or_default();
        store.set(SETTINGS_KEY, &raw)
    }

    /// Apply a `name value` setting; returns false for an unknown name or bad value
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        match name {
            "model" if !value.trim().is_empty() => {
                self.model = value.trim().to_string();
                true
            }
            "temperature" => match value.parse::<f32>() {
                Ok(t) if (0.0..=2.0).contains(&t) => {
                    self.temperature = t;
                    true
                }
                _ => false,
            },
            "maxTokens" | "max_tokens" => match value.parse::<u32>() {
                Ok(n) if n > 0 => {
                    self.max_tokens = n;
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::MemoryStore;

    #[test]
    fn test_defaults_when_missing() {
        let store = MemoryStore::new();
        assert_eq!(Preferences::load(&store), Preferences::default());
    }

    #[test]
    fn test_partial_record_merges_over_defaults() {
        let store = MemoryStore::new();
        store.set(SETTINGS_KEY, r#"{"model":"llama3"}"#).unwrap();
        let prefs = Preferences::load(&store);
        assert_eq!(prefs.model, "llama3");
        assert_eq!(prefs.max_tokens, 4096);
    }

    #[test]
    fn test_corrupt_record_resets() {
        let store = MemoryStore::new();
        store.set(SETTINGS_KEY, "][").unwrap();
        assert_eq!(Preferences::load(&store), Preferences::default());
    }

    #[test]
    fn test_save_and_set() {
        let store = MemoryStore::new();
        let mut prefs = Preferences::default();
        assert!(prefs.set("maxTokens", "2048"));
        assert!(prefs.set("temperature", "1.2"));
        assert!(!prefs.set("temperature", "9"));
        assert!(!prefs.set("colour", "blue"));
        prefs.save(&store).unwrap();

        let raw = store.get(SETTINGS_KEY).unwrap().unwrap();
        assert!(raw.contains(r#""maxTokens":2048"#));
        assert_eq!(Preferences::load(&store), prefs);
    }
}
