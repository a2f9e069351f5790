/// Inbound command queue.
///
/// Producers (the bus bridge, an operator console, tests) push commands from
/// any thread; the scene graph drains the whole queue once per tick in
/// arrival order.
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InboxError {
    #[error("malformed inbound message: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid listening value '{0}'")]
    Listening(String),
}

/// Microphone command: an explicit flag or `"toggle"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawListening")]
pub enum Listening {
    Set(bool),
    Toggle,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawListening {
    Flag(bool),
    Word(String),
}

impl TryFrom<RawListening> for Listening {
    type Error = InboxError;

    fn try_from(raw: RawListening) -> Result<Self, Self::Error> {
        match raw {
            RawListening::Flag(flag) => Ok(Self::Set(flag)),
            RawListening::Word(word) if word == "toggle" => Ok(Self::Toggle),
            RawListening::Word(word) => Err(InboxError::Listening(word)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "action")]
pub enum EventAction {
    /// Take the manual transition with this name.
    #[serde(rename = "transition")]
    Transition { transition: String },
    #[serde(rename = "force_advance")]
    ForceAdvance,
    #[serde(rename = "microphone")]
    Microphone { listening: Listening },
    /// Ask every character to speak its next queued line.
    #[serde(rename = "speak")]
    Speak,
    /// The visitor's recognised facial emotion, e.g. `"Sad"`.
    #[serde(rename = "emotion-recognition")]
    EmotionRecognition { message: String },
    #[serde(rename = "vision-visitor-attributes")]
    VisionAttributes { message: serde_json::Value },
    #[serde(rename = "override")]
    Override {
        name: String,
        #[serde(rename = "override")]
        bucket: String,
    },
    /// Confirmation from speech recognition that it is (not) listening.
    #[serde(rename = "stt-state")]
    SttState { listening: bool },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum InboundMessage {
    Chat { user: String, message: String },
    Event(EventAction),
    /// Accepted and ignored.
    Config(serde_json::Value),
}

impl InboundMessage {
    pub fn from_json(text: &str) -> Result<Self, InboxError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn chat(user: &str, message: &str) -> Self {
        Self::Chat {
            user: user.to_string(),
            message: message.to_string(),
        }
    }

    pub fn transition(name: &str) -> Self {
        Self::Event(EventAction::Transition {
            transition: name.to_string(),
        })
    }
}

/// Cloneable handle to the shared queue.
#[derive(Debug, Clone, Default)]
pub struct Inbox {
    queue: Arc<Mutex<VecDeque<InboundMessage>>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: InboundMessage) {
        self.queue.lock().push_back(message);
    }

    pub fn push_json(&self, text: &str) -> Result<(), InboxError> {
        self.push(InboundMessage::from_json(text)?);
        Ok(())
    }

    /// Everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<InboundMessage> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
