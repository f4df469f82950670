use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

const SUFFIXES: [&str; 5] = ["jr", "sr", "ii", "iii", "iv"];

#[derive(Debug, Clone, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    players: Vec<DirectoryEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Maps sportsbook display names to stats-provider player ids.
#[derive(Debug, Clone, Default)]
pub struct PlayerDirectory {
    by_name: HashMap<String, (String, String)>,
}

impl PlayerDirectory {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read player map {}", path.display()))?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let file: DirectoryFile = serde_json::from_str(raw).context("invalid player map json")?;
        Ok(Self::from_entries(file.players))
    }

    pub fn from_entries(entries: impl IntoIterator<Item = DirectoryEntry>) -> Self {
        let mut by_name = HashMap::new();
        for entry in entries {
            let id = entry.id.trim().to_string();
            if id.is_empty() {
                continue;
            }
            let value = (id, entry.name.clone());
            by_name.insert(normalize_name(&entry.name), value.clone());
            for alias in &entry.aliases {
                by_name.insert(normalize_name(alias), value.clone());
            }
        }
        Self { by_name }
    }

    /// Returns `(player_id, canonical_name)`.
    pub fn resolve(&self, name: &str) -> Option<(&str, &str)> {
        self.by_name
            .get(&normalize_name(name))
            .map(|(id, canonical)| (id.as_str(), canonical.as_str()))
    }
}

/// Lowercase, punctuation stripped, generational suffix dropped.
pub fn normalize_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || ch.is_whitespace() {
                ch.to_lowercase().next().unwrap_or(ch)
            } else if ch == '-' {
                ' '
            } else {
                '\0'
            }
        })
        .filter(|ch| *ch != '\0')
        .collect();
    let mut parts: Vec<&str> = cleaned.split_whitespace().collect();
    if parts.len() > 1
        && let Some(last) = parts.last()
        && SUFFIXES.contains(last)
    {
        parts.pop();
    }
    parts.join(" ")
}
