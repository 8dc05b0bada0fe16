use std::path::Path;

use anyhow::Context;
use indexmap::IndexMap;
use thiserror::Error;

/// Raised when a detected gesture has no prompt behind it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("No prompt defined for {gesture}")]
    UnmappedGesture { gesture: String },
}

/// Gesture label to prompt mapping, in insertion order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptMap {
    prompts: IndexMap<String, String>,
}

impl Default for PromptMap {
    fn default() -> Self {
        Self::new(None)
    }
}

impl PromptMap {
    pub fn new(prompts: Option<IndexMap<String, String>>) -> Self {
        Self {
            prompts: prompts.unwrap_or_else(default_prompts),
        }
    }

    /// Parses a JSON object of `{ "<gesture>": "<prompt>" }`.
    ///
    /// Entries with blank labels or blank prompts are dropped.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let parsed: IndexMap<String, String> =
            serde_json::from_str(raw).context("prompt map must be a JSON object of strings")?;
        let prompts = parsed
            .into_iter()
            .map(|(gesture, prompt)| (gesture.trim().to_string(), prompt.trim().to_string()))
            .filter(|(gesture, prompt)| !gesture.is_empty() && !prompt.is_empty())
            .collect();
        Ok(Self { prompts })
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt map {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("invalid prompt map {}", path.display()))
    }

    pub fn get(&self, gesture: &str) -> Option<&str> {
        self.prompts.get(gesture).map(String::as_str)
    }

    pub fn prompt_for(&self, gesture: &str) -> Result<&str, ConfigurationError> {
        self.get(gesture)
            .ok_or_else(|| ConfigurationError::UnmappedGesture {
                gesture: gesture.to_string(),
            })
    }

    pub fn gestures(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.prompts
            .iter()
            .map(|(gesture, prompt)| (gesture.as_str(), prompt.as_str()))
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

fn default_prompts() -> IndexMap<String, String> {
    let mut map = IndexMap::new();

    let mut insert = |gesture: &str, prompt: &str| {
        map.insert(gesture.to_string(), prompt.to_string());
    };

    insert(
        "Thumb_Up",
        "a peaceful forest landscape at sunrise, digital art",
    );
    insert(
        "Victory",
        "a futuristic cyberpunk city skyline at night, neon lights",
    );
    insert(
        "Open_Palm",
        "a surreal cosmic landscape with colorful nebulae and planets",
    );
    insert("Closed_Fist", "a surreal suset in an animated world");
    insert(
        "Pointing_Up",
        "a majestic castle floating in the clouds, dreamlike atmosphere",
    );

    map
}
