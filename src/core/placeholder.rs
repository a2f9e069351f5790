/// `_UPPER_CASE` placeholder substitution for prompts and lines.
use log::warn;
use std::collections::BTreeMap;

use super::transcript::Transcript;

/// Lines of history included by `_CHAT_HISTORY_LAST`.
pub const RECENT_HISTORY: usize = 10;

fn is_word(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

/// Replaces every standalone `_[A-Z_]+` token for which `lookup` has a
/// value. Tokens without a value are left as they are.
pub fn replace_tokens<F>(text: &str, mut lookup: F) -> String
where
    F: FnMut(&str) -> Option<String>,
{
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let at_boundary = i == 0 || !is_word(chars[i - 1]);
        if chars[i] == '_' && at_boundary {
            let mut end = i + 1;
            while end < chars.len() && (chars[end].is_ascii_uppercase() || chars[end] == '_') {
                end += 1;
            }
            let closed = end == chars.len() || !is_word(chars[end]);
            if end > i + 1 && closed {
                let token: String = chars[i..end].iter().collect();
                match lookup(&token) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&token),
                }
                i = end;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

/// The speaking character's side of the substitution.
#[derive(Debug, Clone, Copy)]
pub struct Speaker<'a> {
    pub persona: Option<&'a str>,
    pub few_shots: Option<&'a str>,
    pub emotion: &'a str,
}

/// Everything placeholders can resolve against for one dispatch.
#[derive(Debug, Clone, Copy)]
pub struct Placeholders<'a> {
    pub script: &'a BTreeMap<String, String>,
    pub transcript: &'a Transcript,
    pub user_emotion: &'a str,
}

impl<'a> Placeholders<'a> {
    pub fn new(
        script: &'a BTreeMap<String, String>,
        transcript: &'a Transcript,
        user_emotion: &'a str,
    ) -> Self {
        Self {
            script,
            transcript,
            user_emotion,
        }
    }

    /// Character tokens first, then script placeholders (twice, so they may
    /// nest), then session tokens. Whatever is left is logged.
    pub fn resolve(&self, text: &str, speaker: &Speaker<'_>) -> String {
        let text = replace_tokens(text, |token| match token {
            "_PERSONA" => speaker.persona.map(str::to_string),
            "_FEW_SHOTS" => speaker.few_shots.map(str::to_string),
            "_EMOTION" => Some(speaker.emotion.to_string()),
            _ => None,
        });
        let mut text = text;
        for _ in 0..2 {
            text = replace_tokens(&text, |token| self.script.get(token).cloned());
        }
        replace_tokens(&text, |token| match token {
            "_CHAT_HISTORY" => Some(self.transcript.render(None)),
            "_CHAT_HISTORY_LAST" => Some(self.transcript.render(Some(RECENT_HISTORY))),
            "_EMOTION_USER" => Some(self.user_emotion.to_string()),
            other => {
                warn!("Placeholder {other} not found");
                None
            }
        })
    }
}
