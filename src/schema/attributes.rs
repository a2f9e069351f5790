/// Delivery attributes attached to spoken and played events.
///
/// Every attribute is a closed allow-list. Script documents carry the
/// attribute as a plain string; an unknown literal is rejected when the
/// event is constructed, so a bad script never reaches the stage.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttributeError {
    #[error("{attribute} '{value}' is not one of {allowed:?}")]
    NotAllowed {
        attribute: &'static str,
        value: String,
        allowed: &'static [&'static str],
    },
}

macro_rules! allow_list {
    (
        $(#[$meta:meta])*
        $name:ident ($attribute:literal) {
            $($variant:ident => $literal:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Literals accepted in script documents.
            pub const ALLOWED: &'static [&'static str] = &[$($literal),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $literal),+
                }
            }
        }

        impl FromStr for $name {
            type Err = AttributeError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($literal => Ok(Self::$variant),)+
                    _ => Err(AttributeError::NotAllowed {
                        attribute: $attribute,
                        value: value.to_string(),
                        allowed: Self::ALLOWED,
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = AttributeError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

allow_list! {
    /// Coarse emotion label driving the avatar's face.
    Emotion("emotion") {
        Neutral => "neutral",
        Anger => "anger",
        Fear => "fear",
        Sadness => "sadness",
        Joy => "joy",
        Disgust => "disgust",
    }
}

allow_list! {
    /// Named speaking style handed to the speech sink.
    SpeakingStyle("style") {
        Default => "Default",
        Sad => "Sad",
        Cheerful => "Cheerful",
        Terrified => "Terrified",
        Unfriendly => "Unfriendly",
        Angry => "Angry",
        Excited => "Excited",
        Shouting => "Shouting",
        Whispering => "Whispering",
        Friendly => "Friendly",
        Hopeful => "Hopeful",
    }
}

allow_list! {
    /// Gesture played before or after a line.
    Animation("animation") {
        Eyeroll => "eyeroll",
        Shirtcheck => "shirtcheck",
        Steam => "steam",
        DiscoverFake => "discoverfake",
        LookLeftRight => "lookleftright",
        LookUp => "look_up",
        Affectionate => "affectionate",
        Bored => "bored",
        CircleLook => "circle_look",
        Growl => "growl",
        Judge => "judge",
        LeftLook => "left_look",
        Pounder => "pounder",
        Scanning => "scanning",
        Sceptic => "sceptic",
        Shrug => "shrug",
        Smile => "smile",
        Weary => "weary",
    }
}

allow_list! {
    /// Body mood of the rig.
    Mood("mood") {
        Neutral => "neutral",
        Positive => "positive",
        Negative => "negative",
        Effort => "effort",
        Annoyed => "annoyed",
        Acknowledge => "acknowledge",
    }
}

allow_list! {
    /// Which of the rig's roles delivers the line.
    Role("role") {
        Mask => "mask",
        Clerk => "clerk",
    }
}

allow_list! {
    /// Idle/think/speak/listen posture of the physical rig.
    RigState("meatstate") {
        Idle => "idle",
        Think => "think",
        Speak => "speak",
        Listen => "listen",
    }
}

impl Default for Emotion {
    fn default() -> Self {
        Self::Neutral
    }
}

impl Default for SpeakingStyle {
    fn default() -> Self {
        Self::Default
    }
}

impl Default for Mood {
    fn default() -> Self {
        Self::Neutral
    }
}

impl Default for Role {
    fn default() -> Self {
        Self::Mask
    }
}

/// Per-emotion intensity in `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EmotionScores {
    pub anger: f32,
    pub disgust: f32,
    pub fear: f32,
    pub joy: f32,
    pub sadness: f32,
}

impl EmotionScores {
    pub fn get(&self, emotion: Emotion) -> f32 {
        match emotion {
            Emotion::Neutral => 0.0,
            Emotion::Anger => self.anger,
            Emotion::Disgust => self.disgust,
            Emotion::Fear => self.fear,
            Emotion::Joy => self.joy,
            Emotion::Sadness => self.sadness,
        }
    }

    pub fn get_mut(&mut self, emotion: Emotion) -> Option<&mut f32> {
        match emotion {
            Emotion::Neutral => None,
            Emotion::Anger => Some(&mut self.anger),
            Emotion::Disgust => Some(&mut self.disgust),
            Emotion::Fear => Some(&mut self.fear),
            Emotion::Joy => Some(&mut self.joy),
            Emotion::Sadness => Some(&mut self.sadness),
        }
    }
}

impl Emotion {
    /// The five non-neutral emotions, in the order the emotion state reports them.
    pub const SCORED: [Emotion; 5] = [
        Emotion::Anger,
        Emotion::Disgust,
        Emotion::Fear,
        Emotion::Joy,
        Emotion::Sadness,
    ];

    /// Scores sent alongside a line: 0.5 on the labelled emotion, zero elsewhere.
    pub fn scores(&self) -> EmotionScores {
        let mut scores = EmotionScores::default();
        if let Some(slot) = scores.get_mut(*self) {
            *slot = 0.5;
        }
        scores
    }
}

/// Prosody parameters for one speaking style.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prosody {
    pub style: SpeakingStyle,
    pub degree: f32,
    pub pause: u32,
    pub pitch: i32,
    pub rate: i32,
    pub volume: i32,
}

impl SpeakingStyle {
    pub fn prosody(&self) -> Prosody {
        let (degree, pause, pitch, rate, volume) = match self {
            Self::Angry => (1.2, 100, -6, 1, 10),
            Self::Sad | Self::Cheerful => (0.3, 350, -5, 2, 0),
            Self::Excited => (0.5, 200, -5, 2, 0),
            Self::Shouting => (1.2, 100, -5, 8, 0),
            Self::Terrified => (1.1, 100, -5, -2, 0),
            Self::Unfriendly => (0.8, 250, -3, 3, 0),
            Self::Whispering => (1.2, 350, -5, 2, 0),
            Self::Friendly => (0.3, 350, -5, 2, 0),
            Self::Hopeful => (0.7, 280, -5, 3, 0),
            Self::Default => (1.0, 350, -5, 2, 0),
        };
        Prosody {
            style: *self,
            degree,
            pause,
            pitch,
            rate,
            volume,
        }
    }
}

/// Mood plus its animation scale and frequency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoodSetting {
    pub mood: Mood,
    pub scale: f32,
    pub frequency: f32,
}

impl Default for MoodSetting {
    fn default() -> Self {
        Self {
            mood: Mood::Neutral,
            scale: 0.5,
            frequency: 1.0,
        }
    }
}

/// Output channel of a line: spoken through TTS or played from media.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Say,
    Play,
}

/// The fixed attribute bundle carried by speak, prompt and play events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attributes {
    pub emotion: Emotion,
    pub style: SpeakingStyle,
    pub pre_animation: Option<Animation>,
    pub post_animation: Option<Animation>,
    pub mood: MoodSetting,
    pub role: Role,
    pub channel: Channel,
}

impl Default for Attributes {
    fn default() -> Self {
        Self {
            emotion: Emotion::default(),
            style: SpeakingStyle::default(),
            pre_animation: None,
            post_animation: None,
            mood: MoodSetting::default(),
            role: Role::default(),
            channel: Channel::Say,
        }
    }
}
