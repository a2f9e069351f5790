/// Message-bus bridge.
///
/// Translates bus traffic into inbound commands (`words-in`, `av`) and
/// publishes the rig character's speech and posture as JSON on
/// `meat-command`. [`InMemoryBus`] is a process-local bus for tests and
/// headless runs.
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use super::capability::{
    BusHandler, CapabilityError, MessageBus, RigSink, SpeechAck, SpeechSink, Utterance,
};
use super::inbox::{EventAction, InboundMessage, Inbox, InboxError};
use crate::schema::attributes::{Animation, Attributes, RigState};
use crate::schema::event::GlitchSettings;

pub const WORDS_IN_CHANNEL: &str = "words-in";
pub const AV_CHANNEL: &str = "av";
pub const MEAT_CHANNEL: &str = "meat-command";

type SharedHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Synchronous in-process bus. Handlers run on the publishing thread.
#[derive(Default)]
pub struct InMemoryBus {
    handlers: Mutex<BTreeMap<String, Vec<SharedHandler>>>,
    published: Mutex<Vec<(String, String)>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every payload published so far on `channel`.
    pub fn published(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, payload)| payload.clone())
            .collect()
    }
}

impl MessageBus for InMemoryBus {
    fn publish(&self, channel: &str, payload: &str) -> Result<(), CapabilityError> {
        self.published
            .lock()
            .push((channel.to_string(), payload.to_string()));
        let handlers = self
            .handlers
            .lock()
            .get(channel)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler(payload);
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str, handler: BusHandler) {
        self.handlers
            .lock()
            .entry(channel.to_string())
            .or_default()
            .push(Arc::from(handler));
    }
}

#[derive(Deserialize)]
struct WordsIn {
    entity: String,
    text: String,
}

#[derive(Deserialize)]
struct AvMessage {
    #[serde(rename = "av-command")]
    command: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// A `words-in` payload as chat. The entity `user` is the primary user.
pub fn parse_words_in(payload: &str, primary_user: &str) -> Result<InboundMessage, InboxError> {
    let words: WordsIn = serde_json::from_str(payload)?;
    let user = if words.entity == "user" {
        primary_user
    } else {
        words.entity.as_str()
    };
    Ok(InboundMessage::chat(user, &words.text))
}

/// An `av` payload as an action, if it carries one the engine reacts to.
pub fn parse_av(payload: &str) -> Result<Option<InboundMessage>, InboxError> {
    let value: serde_json::Value = serde_json::from_str(payload)?;
    let message: AvMessage = serde_json::from_value(value.clone())?;
    let action = match message.command.as_str() {
        "emotion-recognition" => match message.data.get("text").and_then(|t| t.as_str()) {
            Some(text) => EventAction::EmotionRecognition {
                message: text.to_string(),
            },
            None => {
                warn!("Emotion recognition without text: {payload}");
                return Ok(None);
            }
        },
        "vision-visitor-attributes" => EventAction::VisionAttributes { message: value },
        "stt-enabled" => EventAction::SttState { listening: true },
        "stt-disabled" => EventAction::SttState { listening: false },
        _ => return Ok(None),
    };
    Ok(Some(InboundMessage::Event(action)))
}

/// Subscribes the inbox to the bus's inbound channels.
pub fn connect_inbound(bus: &dyn MessageBus, inbox: &Inbox, primary_user: &str) {
    let words = inbox.clone();
    let user = primary_user.to_string();
    bus.subscribe(
        WORDS_IN_CHANNEL,
        Box::new(move |payload: &str| match parse_words_in(payload, &user) {
            Ok(message) => {
                info!("Received words-in message: {payload}");
                words.push(message);
            }
            Err(err) => error!("Error processing words-in message: {err}"),
        }),
    );

    let av = inbox.clone();
    bus.subscribe(
        AV_CHANNEL,
        Box::new(move |payload: &str| match parse_av(payload) {
            Ok(Some(message)) => av.push(message),
            Ok(None) => debug!("Ignoring av message: {payload}"),
            Err(err) => error!("Error processing av message: {err}"),
        }),
    );
}

fn timestamp() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
        .to_string()
}

fn animate(attributes: &Attributes) -> serde_json::Value {
    let name = |animation: Option<Animation>| animation.map_or("", |a| a.as_str());
    json!({
        "pre": name(attributes.pre_animation),
        "pre_speed": 1.0,
        "post": name(attributes.post_animation),
        "post_speed": 1.0,
        "next_state": "",
    })
}

/// `meat-command` payload for a spoken line.
pub fn meat_say(utterance: &Utterance) -> String {
    let attributes = &utterance.attributes;
    json!({
        "id": timestamp(),
        "name": "meat",
        "type": "meat",
        "channel": "say",
        "role": attributes.role,
        "text": utterance.text.trim(),
        "gpt_emotion": "",
        "gpt_tone": "",
        "animate": animate(attributes),
        "azure": attributes.style.prosody(),
        "emotion": attributes.emotion,
        "sgcom": attributes.mood,
    })
    .to_string()
}

/// `meat-command` payload for media playback.
pub fn meat_play(id: u32, attributes: &Attributes) -> String {
    json!({
        "id": id.to_string(),
        "type": "meat",
        "text": "",
        "channel": "play",
        "animate": animate(attributes),
        "emotion": attributes.emotion,
        "gpt_emotion": "",
        "gpt_tone": "",
        "sgcom": attributes.mood,
    })
    .to_string()
}

/// `meat-command` payload for a posture change.
pub fn meat_state(state: RigState) -> String {
    json!({
        "id": timestamp(),
        "type": "meat",
        "channel": "state",
        "state": state,
    })
    .to_string()
}

/// Sends the rig character's lines to the bus; everybody else's lines are
/// logged and count as spoken at once.
pub struct BusSpeech {
    bus: Arc<dyn MessageBus>,
    rig_character: String,
    /// The rig echoes each line on `words-in` once it has been spoken.
    wait_for_echo: bool,
}

impl BusSpeech {
    pub fn new(bus: Arc<dyn MessageBus>, rig_character: &str, wait_for_echo: bool) -> Self {
        Self {
            bus,
            rig_character: rig_character.to_string(),
            wait_for_echo,
        }
    }
}

impl SpeechSink for BusSpeech {
    fn say(&mut self, utterance: &Utterance) -> Result<SpeechAck, CapabilityError> {
        if utterance.speaker != self.rig_character {
            info!("{}: {}", utterance.speaker, utterance.text);
            return Ok(SpeechAck::Completed);
        }
        info!(
            "Sending meat message {} (persona {}): {}",
            utterance.speaker, utterance.persona, utterance.text
        );
        self.bus.publish(MEAT_CHANNEL, &meat_say(utterance))?;
        Ok(if self.wait_for_echo {
            SpeechAck::Pending
        } else {
            SpeechAck::Completed
        })
    }
}

/// Drives the physical rig over the bus.
pub struct BusRig {
    bus: Arc<dyn MessageBus>,
    rig_character: String,
}

impl BusRig {
    pub fn new(bus: Arc<dyn MessageBus>, rig_character: &str) -> Self {
        Self {
            bus,
            rig_character: rig_character.to_string(),
        }
    }
}

impl RigSink for BusRig {
    fn meatstate(&mut self, speaker: &str, state: RigState) -> Result<(), CapabilityError> {
        if speaker != self.rig_character {
            debug!("{speaker} -> {state} (not the rig)");
            return Ok(());
        }
        self.bus.publish(MEAT_CHANNEL, &meat_state(state))
    }

    fn play(&mut self, speaker: &str, id: u32, attributes: &Attributes) -> Result<(), CapabilityError> {
        if speaker != self.rig_character {
            debug!("{speaker} plays {id} (not the rig)");
            return Ok(());
        }
        self.bus.publish(MEAT_CHANNEL, &meat_play(id, attributes))
    }

    fn glitch(&mut self, settings: &GlitchSettings) -> Result<(), CapabilityError> {
        let payload = json!({ "av-command": "glitch", "data": settings });
        self.bus.publish(AV_CHANNEL, &payload.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::attributes::{Emotion, SpeakingStyle};

    fn utterance(speaker: &str) -> Utterance {
        Utterance {
            speaker: speaker.into(),
            persona: speaker.into(),
            text: " Take a seat. ".into(),
            attributes: Attributes {
                emotion: Emotion::Joy,
                style: SpeakingStyle::Friendly,
                pre_animation: Some(Animation::Smile),
                ..Default::default()
            },
            log_ref: None,
            emotion_summary: None,
        }
    }

    #[test]
    fn say_payload_shape() {
        let payload: serde_json::Value = serde_json::from_str(&meat_say(&utterance("Dr. Stanley"))).unwrap();
        assert_eq!(payload["channel"], "say");
        assert_eq!(payload["text"], "Take a seat.");
        assert_eq!(payload["emotion"], "joy");
        assert_eq!(payload["role"], "mask");
        assert_eq!(payload["animate"]["pre"], "smile");
        assert_eq!(payload["animate"]["post"], "");
        assert_eq!(payload["azure"]["style"], "Friendly");
        assert_eq!(payload["sgcom"]["mood"], "neutral");
    }

    #[test]
    fn only_the_rig_goes_to_the_bus() {
        let bus = Arc::new(InMemoryBus::new());
        let mut speech = BusSpeech::new(bus.clone(), "Dr. Stanley", true);
        assert_eq!(speech.say(&utterance("Clerk")), Ok(SpeechAck::Completed));
        assert!(bus.published(MEAT_CHANNEL).is_empty());
        assert_eq!(speech.say(&utterance("Dr. Stanley")), Ok(SpeechAck::Pending));
        assert_eq!(bus.published(MEAT_CHANNEL).len(), 1);

        let mut rig = BusRig::new(bus.clone(), "Dr. Stanley");
        rig.meatstate("Dr. Stanley", RigState::Think).unwrap();
        let state: serde_json::Value = serde_json::from_str(&bus.published(MEAT_CHANNEL)[1]).unwrap();
        assert_eq!(state["channel"], "state");
        assert_eq!(state["state"], "think");
    }

    #[test]
    fn inbound_channels_reach_the_inbox() {
        let bus = InMemoryBus::new();
        let inbox = Inbox::new();
        connect_inbound(&bus, &inbox, "Patient");

        bus.publish(WORDS_IN_CHANNEL, r#"{"entity": "user", "text": "Hello?"}"#).unwrap();
        bus.publish(WORDS_IN_CHANNEL, r#"{"entity": "Dr. Stanley", "text": "Hi."}"#).unwrap();
        bus.publish(AV_CHANNEL, r#"{"av-command": "emotion-recognition", "data": {"text": "Sad"}}"#)
            .unwrap();
        bus.publish(AV_CHANNEL, r#"{"av-command": "stt-control", "data": {"listening": true}}"#)
            .unwrap();
        bus.publish(AV_CHANNEL, r#"{"av-command": "stt-enabled"}"#).unwrap();
        bus.publish(WORDS_IN_CHANNEL, "not json").unwrap();

        assert_eq!(
            inbox.drain(),
            vec![
                InboundMessage::chat("Patient", "Hello?"),
                InboundMessage::chat("Dr. Stanley", "Hi."),
                InboundMessage::Event(EventAction::EmotionRecognition {
                    message: "Sad".into()
                }),
                InboundMessage::Event(EventAction::SttState { listening: true }),
            ]
        );
    }

    #[test]
    fn vision_keeps_whole_payload() {
        let message = parse_av(
            r#"{"av-command": "vision-visitor-attributes", "data": {"attributes": {"age": 40}}}"#,
        )
        .unwrap()
        .unwrap();
        let InboundMessage::Event(EventAction::VisionAttributes { message }) = message else {
            panic!("expected vision attributes");
        };
        assert_eq!(message["data"]["attributes"]["age"], 40);
    }
}
