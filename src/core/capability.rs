/// External capabilities the engine drives but does not implement: the
/// language model, the speech sink, the physical rig, the emotion
/// classifier and the message bus.
///
/// Everything here is handed to the scene graph explicitly; nothing is
/// reached through globals.
use log::{debug, info};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;

use crate::schema::attributes::{Attributes, RigState};
use crate::schema::event::GlitchSettings;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    #[error("'{0}' is unavailable")]
    Unavailable(String),
    #[error("capability failed: {0}")]
    Failed(String),
}

/// Produces a completion for a prompt. Implementations may block.
pub trait LanguageModel: Send + Sync {
    fn complete(&self, llm_name: &str, prompt: &str) -> Result<String, CapabilityError>;
}

/// A model that always fails; characters relying on it stay silent.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnavailableModel;

impl LanguageModel for UnavailableModel {
    fn complete(&self, llm_name: &str, _prompt: &str) -> Result<String, CapabilityError> {
        Err(CapabilityError::Unavailable(llm_name.to_string()))
    }
}

/// Identifies one prompt: the roster epoch it was issued in, the character
/// and a per-character sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PromptTicket {
    pub epoch: u64,
    pub character: String,
    pub sequence: u64,
}

impl fmt::Display for PromptTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}#{}", self.epoch, self.character, self.sequence)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub ticket: PromptTicket,
    pub llm_name: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub ticket: PromptTicket,
    pub prompt: String,
    pub result: Result<String, CapabilityError>,
}

/// Runs prompts, either on the caller's thread or in the background.
pub trait PromptExecutor: Send {
    /// Returns the completion right away when the executor is synchronous,
    /// `None` when it will show up in a later [`poll`](Self::poll).
    fn submit(&self, request: PromptRequest) -> Option<Completion>;

    /// Completions that finished since the last poll.
    fn poll(&self) -> Vec<Completion>;
}

/// Calls the model on the ticking thread.
pub struct InlineExecutor {
    model: Arc<dyn LanguageModel>,
}

impl InlineExecutor {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }
}

impl PromptExecutor for InlineExecutor {
    fn submit(&self, request: PromptRequest) -> Option<Completion> {
        let result = self.model.complete(&request.llm_name, &request.prompt);
        Some(Completion {
            ticket: request.ticket,
            prompt: request.prompt,
            result,
        })
    }

    fn poll(&self) -> Vec<Completion> {
        Vec::new()
    }
}

/// Runs each prompt on a tokio blocking worker and hands completions back
/// through a channel. There is no timeout; a hung call only keeps its own
/// character waiting.
pub struct BackgroundExecutor {
    model: Arc<dyn LanguageModel>,
    runtime: Handle,
    sender: mpsc::UnboundedSender<Completion>,
    receiver: Mutex<mpsc::UnboundedReceiver<Completion>>,
}

impl BackgroundExecutor {
    pub fn new(model: Arc<dyn LanguageModel>, runtime: Handle) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            model,
            runtime,
            sender,
            receiver: Mutex::new(receiver),
        }
    }
}

impl PromptExecutor for BackgroundExecutor {
    fn submit(&self, request: PromptRequest) -> Option<Completion> {
        let model = Arc::clone(&self.model);
        let sender = self.sender.clone();
        self.runtime.spawn_blocking(move || {
            let result = model.complete(&request.llm_name, &request.prompt);
            let completion = Completion {
                ticket: request.ticket,
                prompt: request.prompt,
                result,
            };
            if sender.send(completion).is_err() {
                debug!("Completion dropped: executor is gone");
            }
        });
        None
    }

    fn poll(&self) -> Vec<Completion> {
        let mut receiver = self.receiver.lock();
        let mut ready = Vec::new();
        while let Ok(completion) = receiver.try_recv() {
            ready.push(completion);
        }
        ready
    }
}

/// A line handed to the speech sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    pub speaker: String,
    pub persona: String,
    pub text: String,
    pub attributes: Attributes,
    pub log_ref: Option<String>,
    /// Emotion state summary, when emotion processing is on.
    pub emotion_summary: Option<String>,
}

/// Whether the sink finished the line on the spot or will echo it later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechAck {
    Completed,
    Pending,
}

pub trait SpeechSink: Send {
    fn say(&mut self, utterance: &Utterance) -> Result<SpeechAck, CapabilityError>;
}

/// Logs each line and reports it spoken immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateSpeech;

impl SpeechSink for ImmediateSpeech {
    fn say(&mut self, utterance: &Utterance) -> Result<SpeechAck, CapabilityError> {
        info!("{}: {}", utterance.speaker, utterance.text);
        Ok(SpeechAck::Completed)
    }
}

/// The physical rig: posture, media playback and visual glitches.
pub trait RigSink: Send {
    fn meatstate(&mut self, speaker: &str, state: RigState) -> Result<(), CapabilityError>;
    fn play(&mut self, speaker: &str, id: u32, attributes: &Attributes) -> Result<(), CapabilityError>;
    fn glitch(&mut self, settings: &GlitchSettings) -> Result<(), CapabilityError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NullRig;

impl RigSink for NullRig {
    fn meatstate(&mut self, speaker: &str, state: RigState) -> Result<(), CapabilityError> {
        debug!("{speaker} -> {state}");
        Ok(())
    }

    fn play(&mut self, speaker: &str, id: u32, _attributes: &Attributes) -> Result<(), CapabilityError> {
        debug!("{speaker} plays {id}");
        Ok(())
    }

    fn glitch(&mut self, settings: &GlitchSettings) -> Result<(), CapabilityError> {
        debug!("glitch {settings:?}");
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabelScore {
    pub label: String,
    pub score: f32,
}

/// Scores a line of text against a fixed label set.
pub trait EmotionClassifier: Send + Sync {
    fn classify(&self, text: &str) -> Result<Vec<LabelScore>, CapabilityError>;
}

pub type BusHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Channel-based publish/subscribe transport.
pub trait MessageBus: Send + Sync {
    fn publish(&self, channel: &str, payload: &str) -> Result<(), CapabilityError>;
    fn subscribe(&self, channel: &str, handler: BusHandler);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    impl LanguageModel for Echo {
        fn complete(&self, llm_name: &str, prompt: &str) -> Result<String, CapabilityError> {
            Ok(format!("{llm_name}:{prompt}"))
        }
    }

    fn request(sequence: u64) -> PromptRequest {
        PromptRequest {
            ticket: PromptTicket {
                epoch: 1,
                character: "Clerk".into(),
                sequence,
            },
            llm_name: "test".into(),
            prompt: "hello".into(),
        }
    }

    #[test]
    fn inline_completes_immediately() {
        let executor = InlineExecutor::new(Arc::new(Echo));
        let completion = executor.submit(request(1)).unwrap();
        assert_eq!(completion.result, Ok("test:hello".to_string()));
        assert!(executor.poll().is_empty());
    }

    #[test]
    fn unavailable_model_fails() {
        let executor = InlineExecutor::new(Arc::new(UnavailableModel));
        let completion = executor.submit(request(1)).unwrap();
        assert!(matches!(completion.result, Err(CapabilityError::Unavailable(_))));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_delivers_through_poll() {
        let executor = BackgroundExecutor::new(Arc::new(Echo), Handle::current());
        assert!(executor.submit(request(7)).is_none());

        let mut ready = Vec::new();
        for _ in 0..200 {
            ready = executor.poll();
            if !ready.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].ticket.sequence, 7);
        assert_eq!(ready[0].result, Ok("test:hello".to_string()));
    }

    #[test]
    fn ticket_display() {
        let ticket = PromptTicket {
            epoch: 3,
            character: "Clerk".into(),
            sequence: 2,
        };
        assert_eq!(ticket.to_string(), "3:Clerk#2");
    }
}
