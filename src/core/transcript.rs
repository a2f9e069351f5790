/// Session transcript: numbered chat lines interleaved with scene changes,
/// character arrivals and rig posture changes.
use serde::Serialize;
use std::collections::BTreeMap;

use crate::schema::attributes::RigState;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TranscriptEntry {
    Chat {
        line: usize,
        name: String,
        persona: String,
        message: String,
        log_ref: Option<String>,
    },
    SceneChange {
        scene: String,
        meta: BTreeMap<String, String>,
    },
    CharacterJoined {
        name: String,
        persona: String,
        behavior: String,
    },
    Meatstate {
        name: String,
        persona: String,
        state: RigState,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    chat_lines: usize,
}

/// Removes `[stage directions]` and `**speaker markers**` from a line.
pub fn strip_markup(text: &str) -> String {
    let without_brackets = strip_delimited(text, "[", "]");
    let stripped = strip_delimited(&without_brackets, "**", "**");
    stripped.trim().to_string()
}

/// Removes every `open ... close` span whose content starts with a
/// non-whitespace character. Unclosed spans are kept.
fn strip_delimited(text: &str, open: &str, close: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(open) {
        let after_open = &rest[start + open.len()..];
        let starts_tight = after_open
            .chars()
            .next()
            .is_some_and(|c| !c.is_whitespace());
        match after_open.find(close) {
            Some(end) if starts_tight && end > 0 => {
                out.push_str(&rest[..start]);
                rest = &after_open[end + close.len()..];
            }
            _ => {
                out.push_str(&rest[..start + open.len()]);
                rest = after_open;
            }
        }
    }
    out.push_str(rest);
    out
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Appends a chat line with its markup stripped. Returns the line number.
    pub fn add_chat(&mut self, name: &str, persona: &str, message: &str, log_ref: Option<String>) -> usize {
        let line = self.chat_lines;
        self.chat_lines += 1;
        self.entries.push(TranscriptEntry::Chat {
            line,
            name: name.to_string(),
            persona: persona.to_string(),
            message: strip_markup(message),
            log_ref,
        });
        line
    }

    pub fn add_scene_change(&mut self, scene: &str, meta: &BTreeMap<String, String>) {
        self.entries.push(TranscriptEntry::SceneChange {
            scene: scene.to_string(),
            meta: meta.clone(),
        });
    }

    pub fn add_character(&mut self, name: &str, persona: &str, behavior: &str) {
        self.entries.push(TranscriptEntry::CharacterJoined {
            name: name.to_string(),
            persona: persona.to_string(),
            behavior: behavior.to_string(),
        });
    }

    pub fn add_meatstate(&mut self, name: &str, persona: &str, state: RigState) {
        self.entries.push(TranscriptEntry::Meatstate {
            name: name.to_string(),
            persona: persona.to_string(),
            state,
        });
    }

    /// (name, message) of every chat line, oldest first.
    pub fn chats(&self) -> impl DoubleEndedIterator<Item = (&str, &str)> {
        self.entries.iter().filter_map(|entry| match entry {
            TranscriptEntry::Chat { name, message, .. } => Some((name.as_str(), message.as_str())),
            _ => None,
        })
    }

    pub fn last_speaker(&self) -> Option<&str> {
        self.chats().next_back().map(|(name, _)| name)
    }

    /// The chat history as fed to prompts, optionally limited to the most
    /// recent `limit` lines.
    pub fn render(&self, limit: Option<usize>) -> String {
        let chats: Vec<_> = self.chats().collect();
        let start = limit.map_or(0, |limit| chats.len().saturating_sub(limit));
        let mut rendered = String::from("--- Beginning of transcript ---\n\n");
        for (name, message) in &chats[start..] {
            rendered.push_str(&format!("**{name}:**\n{message}\n\n"));
        }
        rendered.push_str("--- End of transcript ---");
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_directions_and_markers() {
        assert_eq!(strip_markup("[sighs] Fine. **Clerk:**"), "Fine.");
        assert_eq!(strip_markup("Keep [ this ] and ** that **"), "Keep [ this ] and ** that **");
        assert_eq!(strip_markup("Unclosed [bracket"), "Unclosed [bracket");
    }

    #[test]
    fn chat_lines_are_numbered() {
        let mut transcript = Transcript::new();
        transcript.add_scene_change("s_intro", &BTreeMap::new());
        assert_eq!(transcript.add_chat("Clerk", "clerk", "Hi.", None), 0);
        transcript.add_meatstate("Clerk", "clerk", RigState::Think);
        assert_eq!(transcript.add_chat("Patient", "Patient", "Hello.", None), 1);
        assert_eq!(transcript.len(), 4);
    }

    #[test]
    fn last_speaker_ignores_other_entries() {
        let mut transcript = Transcript::new();
        assert_eq!(transcript.last_speaker(), None);
        transcript.add_chat("Clerk", "clerk", "Hi.", None);
        transcript.add_scene_change("s_next", &BTreeMap::new());
        transcript.add_character("Guard", "guard", "watcher");
        assert_eq!(transcript.last_speaker(), Some("Clerk"));
    }

    #[test]
    fn render_with_limit() {
        let mut transcript = Transcript::new();
        for i in 0..12 {
            transcript.add_chat("Clerk", "clerk", &format!("line {i}"), None);
        }
        let rendered = transcript.render(Some(10));
        assert!(rendered.starts_with("--- Beginning of transcript ---\n\n**Clerk:**\nline 2\n\n"));
        assert!(!rendered.contains("line 1\n"));
        assert!(rendered.ends_with("line 11\n\n--- End of transcript ---"));
    }

    #[test]
    fn serializes_with_type_tag() {
        let mut transcript = Transcript::new();
        transcript.add_chat("Clerk", "clerk", "Hi.", None);
        let json = serde_json::to_value(&transcript.entries()[0]).unwrap();
        assert_eq!(json["type"], "chat");
        assert_eq!(json["line"], 0);
    }
}
