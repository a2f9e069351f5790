/// Session configuration, loadable from RON.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use super::compiler::{CompileOptions, LoadError};
use super::emotion::EmotionTuning;
use crate::schema::parse_document;

/// The visitor. Always present among the external users.
pub const PRIMARY_USER: &str = "Patient";

/// Character whose speech and posture drive the physical rig.
pub const RIG_CHARACTER: &str = "Dr. Stanley";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Ticks per second.
    pub frame_rate: f64,
    pub start_scene: Option<String>,
    /// Exits without a condition fire once the scene is complete.
    pub simulation: bool,
    pub exit_on_complete: bool,
    /// Scene default when the scene does not say.
    pub auto_think: bool,
    pub emotions: bool,
    pub emotion_tuning: EmotionTuning,
    pub llm_name: String,
    /// Names of the people in the room. The first is the primary user.
    pub users: Vec<String>,
    pub rig_character: String,
    /// The rig echoes its own lines back as chat once they are spoken.
    pub wait_for_speech: bool,
    pub seed: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            frame_rate: 30.0,
            start_scene: None,
            simulation: false,
            exit_on_complete: false,
            auto_think: false,
            emotions: false,
            emotion_tuning: EmotionTuning::default(),
            llm_name: "default".to_string(),
            users: vec![PRIMARY_USER.to_string()],
            rig_character: RIG_CHARACTER.to_string(),
            wait_for_speech: false,
            seed: None,
        }
    }
}

impl SessionConfig {
    pub fn from_ron(text: &str) -> Result<Self, LoadError> {
        parse_document(text).map_err(|source| LoadError::Document {
            document: "session config".to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let text = fs::read_to_string(path)?;
        parse_document(&text).map_err(|source| LoadError::Document {
            document: path.display().to_string(),
            source,
        })
    }

    pub fn compile_options(&self) -> CompileOptions {
        CompileOptions {
            start_scene: self.start_scene.clone(),
            simulation: self.simulation,
        }
    }

    /// Time between ticks. Non-positive rates fall back to one tick a second.
    pub fn frame_interval(&self) -> Duration {
        if self.frame_rate > 0.0 {
            Duration::from_secs_f64(1.0 / self.frame_rate)
        } else {
            Duration::from_secs(1)
        }
    }

    pub fn primary_user(&self) -> &str {
        self.users.first().map_or(PRIMARY_USER, String::as_str)
    }
}
