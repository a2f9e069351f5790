/// Session-level emotion state.
///
/// Outgoing lines feed the state through a decaying integrator, classifier
/// scores and the visitor's recognised emotion push it further, and the
/// state in turn overwrites the emotion and speaking style actually sent
/// to the rig.
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::capability::LabelScore;
use crate::schema::attributes::{Attributes, Emotion, EmotionScores, SpeakingStyle};

/// Tuning of the emotion integrator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmotionTuning {
    pub decay: f32,
    pub classifier_coefficient: f32,
    pub low: f32,
    pub medium: f32,
    pub high: f32,
}

impl Default for EmotionTuning {
    fn default() -> Self {
        Self {
            decay: 0.67,
            classifier_coefficient: 0.5,
            low: 0.25,
            medium: 0.5,
            high: 0.75,
        }
    }
}

/// Classifier label families and the emotion each one feeds.
const LABEL_FAMILIES: &[(Emotion, &[&str])] = &[
    (
        Emotion::Joy,
        &[
            "admiration",
            "amusement",
            "caring",
            "desire",
            "excitement",
            "gratitude",
            "joy",
            "love",
            "optimism",
            "pride",
            "relief",
        ],
    ),
    (Emotion::Anger, &["anger", "annoyance"]),
    (
        Emotion::Disgust,
        &[
            "confusion",
            "disappointment",
            "disapproval",
            "disgust",
            "embarrassment",
        ],
    ),
    (Emotion::Fear, &["fear", "nervousness"]),
    (Emotion::Sadness, &["grief", "remorse", "sadness"]),
];

/// Maps a classifier label onto one of the five scored emotions.
pub fn label_family(label: &str) -> Option<Emotion> {
    LABEL_FAMILIES
        .iter()
        .find(|(_, labels)| labels.contains(&label))
        .map(|(emotion, _)| *emotion)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EmotionState {
    tuning: EmotionTuning,
    scores: EmotionScores,
    style: SpeakingStyle,
}

impl Default for EmotionState {
    fn default() -> Self {
        Self::new(EmotionTuning::default())
    }
}

impl EmotionState {
    pub fn new(tuning: EmotionTuning) -> Self {
        Self {
            tuning,
            scores: EmotionScores::default(),
            style: SpeakingStyle::Default,
        }
    }

    pub fn reset(&mut self) {
        self.scores = EmotionScores::default();
        self.style = SpeakingStyle::Default;
    }

    pub fn scores(&self) -> EmotionScores {
        self.scores
    }

    pub fn style(&self) -> SpeakingStyle {
        self.style
    }

    /// Strongest emotion above the low threshold, or neutral.
    pub fn dominant(&self) -> Emotion {
        let mut dominant = Emotion::Neutral;
        let mut max = 0.0;
        for emotion in Emotion::SCORED {
            let score = self.scores.get(emotion);
            if score > max && score > self.tuning.low {
                dominant = emotion;
                max = score;
            }
        }
        dominant
    }

    /// `anger0.00 disgust0.00 ...`, the compact form used in logs and prompts.
    pub fn summary(&self) -> String {
        Emotion::SCORED
            .iter()
            .map(|e| format!("{}{:.2}", e.as_str(), self.scores.get(*e)))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn clamp(&mut self) {
        for emotion in Emotion::SCORED {
            if let Some(score) = self.scores.get_mut(emotion) {
                *score = score.min(1.0);
            }
        }
    }

    /// Feeds an outgoing line's attributes into the state and returns them
    /// with the integrated emotion and style.
    pub fn integrate(&mut self, attributes: &Attributes) -> Attributes {
        let incoming = attributes.emotion.scores();
        for emotion in Emotion::SCORED {
            if let Some(score) = self.scores.get_mut(emotion) {
                *score = (*score * self.tuning.decay + incoming.get(emotion)).min(1.0);
            }
        }

        if attributes.style != SpeakingStyle::Default {
            self.style = attributes.style;
        } else if !self.style_still_fits() {
            self.style = SpeakingStyle::Default;
        }
        self.escalate_style();

        let mut integrated = attributes.clone();
        integrated.emotion = self.dominant();
        integrated.style = self.style;
        debug!("Integrated emotion: {} ({})", integrated.emotion, self.summary());
        integrated
    }

    /// Adds classifier scores for a line of text.
    pub fn absorb(&mut self, labels: &[LabelScore]) {
        for label in labels {
            if let Some(emotion) = label_family(&label.label) {
                if let Some(score) = self.scores.get_mut(emotion) {
                    *score += label.score * self.tuning.classifier_coefficient;
                }
            }
        }
        self.clamp();
    }

    /// Takes in the visitor's recognised emotion.
    pub fn from_user(&mut self, label: &str) {
        info!("User emotion: {label}");
        let target = match label {
            "Angry" => Some(Emotion::Anger),
            "Sad" => Some(Emotion::Sadness),
            "Happy" | "Surprise" => Some(Emotion::Joy),
            "Fear" => Some(Emotion::Fear),
            "Disgust" | "Contempt" => Some(Emotion::Disgust),
            _ => None,
        };
        if let Some(score) = target.and_then(|e| self.scores.get_mut(e)) {
            *score += 2.0;
        }
        self.clamp();
        self.escalate_style();
    }

    /// Replaces the emotion and style of a line about to be spoken with the
    /// current state.
    pub fn overwrite(&self, attributes: &Attributes) -> Attributes {
        let mut overwritten = attributes.clone();
        overwritten.emotion = self.dominant();
        overwritten.style = self.style;
        overwritten
    }

    fn style_still_fits(&self) -> bool {
        let low = self.tuning.low;
        let s = &self.scores;
        match self.style {
            SpeakingStyle::Angry | SpeakingStyle::Shouting | SpeakingStyle::Unfriendly => {
                s.anger > low || s.disgust > low
            }
            SpeakingStyle::Cheerful
            | SpeakingStyle::Excited
            | SpeakingStyle::Friendly
            | SpeakingStyle::Hopeful => s.joy > low,
            SpeakingStyle::Sad | SpeakingStyle::Terrified | SpeakingStyle::Whispering => {
                s.fear > low || s.sadness > low
            }
            SpeakingStyle::Default => true,
        }
    }

    /// Moves a default style to one matching the strongest feeling.
    fn escalate_style(&mut self) {
        if self.style != SpeakingStyle::Default {
            return;
        }
        let EmotionTuning { low, medium, high, .. } = self.tuning;
        let s = self.scores;
        let hostile = s.anger.max(s.disgust);
        let next = if hostile > high {
            SpeakingStyle::Shouting
        } else if hostile > medium {
            SpeakingStyle::Angry
        } else if hostile > low {
            SpeakingStyle::Unfriendly
        } else if s.fear > high {
            SpeakingStyle::Terrified
        } else if s.fear > medium {
            SpeakingStyle::Whispering
        } else if s.sadness > low {
            SpeakingStyle::Sad
        } else if s.joy > high {
            SpeakingStyle::Cheerful
        } else if s.joy > medium {
            SpeakingStyle::Excited
        } else if s.joy > low {
            SpeakingStyle::Friendly
        } else {
            SpeakingStyle::Default
        };
        if next != SpeakingStyle::Default {
            info!("Speaking style escalated to {next}");
        }
        self.style = next;
    }
}
