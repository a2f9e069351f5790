/// Scene and behavior documents as they appear on disk.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::event::EventEntry;
use crate::core::guard::Guard;

/// A character placed in a scene.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CharacterEntry {
    pub display_name: String,
    pub persona_name: String,
    pub behavior: String,
    #[serde(default)]
    pub few_shots: Option<String>,
    #[serde(default)]
    pub llm_name: Option<String>,
}

/// An exit edge. Without a condition the compiler substitutes its default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExitEntry {
    #[serde(default)]
    pub condition: Option<Guard>,
    pub target: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SceneDocument {
    #[serde(default)]
    pub initial: bool,
    #[serde(default, rename = "final")]
    pub terminal: bool,
    #[serde(default)]
    pub force_mute: bool,
    #[serde(default)]
    pub auto_think: Option<bool>,
    #[serde(default)]
    pub characters: Vec<CharacterEntry>,
    #[serde(default)]
    pub internal_callbacks: Vec<String>,
    #[serde(default)]
    pub exits: Vec<ExitEntry>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicEntry {
    #[serde(default, rename = "loop")]
    pub looping: bool,
    #[serde(default)]
    pub randomize: bool,
    #[serde(default)]
    pub max_iterations: Option<u32>,
    #[serde(default)]
    pub events: Vec<EventEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BehaviorDocument {
    #[serde(default)]
    pub init: Option<Vec<EventEntry>>,
    #[serde(default)]
    pub end: Option<Vec<EventEntry>>,
    /// Alternative end buckets keyed by the transition that ends the scene.
    #[serde(default)]
    pub end_on: BTreeMap<String, Vec<EventEntry>>,
    #[serde(default)]
    pub dynamic: Option<DynamicEntry>,
    #[serde(default, rename = "override")]
    pub overrides: BTreeMap<String, Vec<EventEntry>>,
    #[serde(default)]
    pub meta: BTreeMap<String, String>,
}

/// Splits a file stem of the form `<index>_<name>` where the index is
/// digits and dots. Stems without such a prefix are returned whole.
pub fn split_stem(stem: &str) -> (Option<&str>, &str) {
    if let Some((index, name)) = stem.split_once('_') {
        let numeric = index.starts_with(|c: char| c.is_ascii_digit())
            && index.chars().all(|c| c.is_ascii_digit() || c == '.');
        if numeric && !name.is_empty() {
            return (Some(index), name);
        }
    }
    (None, stem)
}
