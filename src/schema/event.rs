/// Script events: the closed set of things a character can be told to do.
///
/// Documents describe events as flat entries carrying exactly one tag
/// (`speak`, `prompt`, `meatstate`, `play`, `glitch`) plus optional
/// attributes. Entries are turned into [`Event`]s through a static
/// tag → constructor table, so an entry with no tag or several tags is a
/// load error rather than something discovered mid-performance.
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::attributes::{
    Animation, AttributeError, Attributes, Channel, Emotion, Mood, MoodSetting, RigState, Role,
    SpeakingStyle,
};

#[derive(Debug, Error)]
pub enum EventError {
    #[error("event entry must carry exactly one of {expected:?}, found {found:?}")]
    Tag {
        found: Vec<&'static str>,
        expected: Vec<&'static str>,
    },
    #[error("invalid attribute: {0}")]
    Attribute(#[from] AttributeError),
    #[error("speak entry has no lines")]
    EmptyLines,
    #[error("prompt entry has no elements")]
    EmptyPrompt,
}

/// One line, or a set of alternatives of which one is picked at dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Lines {
    One(String),
    Choice(Vec<String>),
}

impl Lines {
    pub fn pick<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<&str> {
        match self {
            Self::One(line) => Some(line.as_str()),
            Self::Choice(lines) => lines.choose(rng).map(String::as_str),
        }
    }

    fn is_empty(&self) -> bool {
        match self {
            Self::One(_) => false,
            Self::Choice(lines) => lines.is_empty(),
        }
    }
}

/// A prompt fragment: fixed text, or a choice where `None` contributes nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptElement {
    Text(String),
    Choice(Vec<Option<String>>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlitchSettings {
    pub active: bool,
    #[serde(default)]
    pub duration: f32,
    #[serde(default = "half")]
    pub start: f32,
    #[serde(default = "half")]
    pub end: f32,
}

fn half() -> f32 {
    0.5
}

impl Default for GlitchSettings {
    fn default() -> Self {
        Self {
            active: false,
            duration: 0.0,
            start: 0.5,
            end: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeakEvent {
    pub lines: Lines,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptEvent {
    pub elements: Vec<PromptElement>,
    pub attributes: Attributes,
}

impl PromptEvent {
    /// Picks one alternative per choice element and joins the pieces with
    /// blank lines.
    pub fn assemble<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(self.elements.len());
        for element in &self.elements {
            match element {
                PromptElement::Text(text) => parts.push(text),
                PromptElement::Choice(options) => {
                    if let Some(Some(text)) = options.choose(rng) {
                        parts.push(text);
                    }
                }
            }
        }
        parts.join("\n\n").trim().to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MeatstateEvent {
    pub state: RigState,
    pub timeout: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlayEvent {
    pub id: u32,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Speak(SpeakEvent),
    Prompt(PromptEvent),
    Meatstate(MeatstateEvent),
    Play(PlayEvent),
    Glitch(GlitchSettings),
}

/// An event as written in a behavior document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventEntry {
    #[serde(default)]
    pub speak: Option<Lines>,
    #[serde(default)]
    pub prompt: Option<Vec<PromptElement>>,
    #[serde(default)]
    pub meatstate: Option<String>,
    #[serde(default)]
    pub play: Option<u32>,
    #[serde(default)]
    pub glitch: Option<GlitchSettings>,
    #[serde(default)]
    pub emotion: Option<String>,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub mood: Option<String>,
    #[serde(default)]
    pub mood_scale: Option<f32>,
    #[serde(default)]
    pub mood_frequency: Option<f32>,
    #[serde(default)]
    pub preanimation: Option<String>,
    #[serde(default)]
    pub postanimation: Option<String>,
    #[serde(default)]
    pub timeout: Option<f32>,
}

type Constructor = fn(&EventEntry) -> Result<Event, EventError>;

/// Tag → constructor table. Adding a variant means adding a row here.
const CONSTRUCTORS: &[(&str, Constructor)] = &[
    ("speak", build_speak),
    ("prompt", build_prompt),
    ("meatstate", build_meatstate),
    ("play", build_play),
    ("glitch", build_glitch),
];

impl EventEntry {
    fn has_tag(&self, tag: &str) -> bool {
        match tag {
            "speak" => self.speak.is_some(),
            "prompt" => self.prompt.is_some(),
            "meatstate" => self.meatstate.is_some(),
            "play" => self.play.is_some(),
            "glitch" => self.glitch.is_some(),
            _ => false,
        }
    }
}

impl Event {
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Speak(_) => "speak",
            Self::Prompt(_) => "prompt",
            Self::Meatstate(_) => "meatstate",
            Self::Play(_) => "play",
            Self::Glitch(_) => "glitch",
        }
    }

    /// Builds the event for the one tag the entry carries. Entries with no
    /// tag or several tags are rejected at load, never at run time.
    pub fn from_entry(entry: &EventEntry) -> Result<Event, EventError> {
        let matching: Vec<_> = CONSTRUCTORS
            .iter()
            .filter(|(tag, _)| entry.has_tag(tag))
            .collect();
        match matching.as_slice() {
            [(_, construct)] => construct(entry),
            _ => Err(EventError::Tag {
                found: matching.iter().map(|(tag, _)| *tag).collect(),
                expected: CONSTRUCTORS.iter().map(|(tag, _)| *tag).collect(),
            }),
        }
    }

    /// Attribute bundle, for the variants that carry one.
    pub fn attributes(&self) -> Option<&Attributes> {
        match self {
            Self::Speak(e) => Some(&e.attributes),
            Self::Prompt(e) => Some(&e.attributes),
            Self::Play(e) => Some(&e.attributes),
            Self::Meatstate(_) | Self::Glitch(_) => None,
        }
    }
}

fn parse_optional<T>(value: &Option<String>) -> Result<Option<T>, AttributeError>
where
    T: std::str::FromStr<Err = AttributeError>,
{
    value.as_deref().map(str::parse).transpose()
}

impl Attributes {
    /// Builds the bundle from a document entry, applying defaults for
    /// anything left out.
    pub fn from_entry(entry: &EventEntry, channel: Channel) -> Result<Attributes, AttributeError> {
        let defaults = MoodSetting::default();
        Ok(Attributes {
            emotion: parse_optional::<Emotion>(&entry.emotion)?.unwrap_or_default(),
            style: parse_optional::<SpeakingStyle>(&entry.style)?.unwrap_or_default(),
            pre_animation: parse_optional::<Animation>(&entry.preanimation)?,
            post_animation: parse_optional::<Animation>(&entry.postanimation)?,
            mood: MoodSetting {
                mood: parse_optional::<Mood>(&entry.mood)?.unwrap_or_default(),
                scale: entry.mood_scale.unwrap_or(defaults.scale),
                frequency: entry.mood_frequency.unwrap_or(defaults.frequency),
            },
            role: parse_optional::<Role>(&entry.role)?.unwrap_or_default(),
            channel,
        })
    }
}

fn build_speak(entry: &EventEntry) -> Result<Event, EventError> {
    let lines = entry.speak.clone().ok_or(EventError::EmptyLines)?;
    if lines.is_empty() {
        return Err(EventError::EmptyLines);
    }
    Ok(Event::Speak(SpeakEvent {
        lines,
        attributes: Attributes::from_entry(entry, Channel::Say)?,
    }))
}

fn build_prompt(entry: &EventEntry) -> Result<Event, EventError> {
    let elements = entry.prompt.clone().unwrap_or_default();
    if elements.is_empty() {
        return Err(EventError::EmptyPrompt);
    }
    Ok(Event::Prompt(PromptEvent {
        elements,
        attributes: Attributes::from_entry(entry, Channel::Say)?,
    }))
}

fn build_meatstate(entry: &EventEntry) -> Result<Event, EventError> {
    let state = parse_optional::<RigState>(&entry.meatstate)?.unwrap_or(RigState::Idle);
    Ok(Event::Meatstate(MeatstateEvent {
        state,
        timeout: entry.timeout.unwrap_or(0.0),
    }))
}

fn build_play(entry: &EventEntry) -> Result<Event, EventError> {
    Ok(Event::Play(PlayEvent {
        id: entry.play.unwrap_or_default(),
        attributes: Attributes::from_entry(entry, Channel::Play)?,
    }))
}

fn build_glitch(entry: &EventEntry) -> Result<Event, EventError> {
    Ok(Event::Glitch(entry.glitch.clone().unwrap_or_default()))
}

/// Converts a list of document entries, failing on the first bad one.
pub fn build_events(entries: &[EventEntry]) -> Result<Vec<Event>, EventError> {
    entries.iter().map(Event::from_entry).collect()
}
