/// Scene graph: the top-level machine over compiled scenes.
///
/// The graph owns the roster of behavior machines for the active scene and
/// every collaborator the machines need. Machines report effects as cues;
/// the graph delivers them (speech, rig, transcript) and reacts to the
/// results, so turn-taking is decided in one place.
///
/// ```text
/// tick ──► inbox ──► completions ──► automatic transition
///            │            │                 │
///            ▼            ▼                 ▼
///        actions ──► machines ──► cues ──► collaborators
/// ```
use log::{debug, error, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use super::behavior::{BehaviorMachine, BehaviorState, CharacterProfile, Cue, Stage};
use super::capability::{
    EmotionClassifier, ImmediateSpeech, InlineExecutor, LanguageModel, MessageBus, NullRig,
    PromptExecutor, RigSink, SpeechAck, SpeechSink, UnavailableModel, Utterance,
};
use super::compiler::{ScriptDefinition, PREROLL_SCENE};
use super::config::SessionConfig;
use super::emotion::EmotionState;
use super::guard::{GuardFacts, GuardRejected};
use super::hub::AV_CHANNEL;
use super::inbox::{EventAction, InboundMessage, Inbox, Listening};
use super::placeholder::Placeholders;
use super::status::{CharacterStatus, EmotionStatus, FrameMetrics, GuardStatus, StatusSnapshot};
use super::transcript::Transcript;
use super::transition::Transition;
use crate::schema::attributes::RigState;
use crate::schema::event::GlitchSettings;

const NEUTRAL: &str = "Neutral";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Rejected(#[from] GuardRejected),
    #[error("unknown transition '{0}'")]
    UnknownTransition(String),
    #[error("unknown scene '{0}'")]
    UnknownScene(String),
    #[error("character '{character}' uses unknown behavior '{behavior}'")]
    UnknownBehavior { character: String, behavior: String },
    #[error("scene '{scene}' names unknown callback '{name}'")]
    UnknownCallback { scene: String, name: String },
    #[error("character name '{0}' is reserved for a user")]
    ReservedName(String),
}

impl SessionError {
    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected(_))
    }
}

/// Hook run when a scene listing it is entered.
pub type SceneCallback = Box<dyn FnMut(&mut Session) + Send>;

/// A person in the room, as far as the engine can tell.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserState {
    /// Last recognised facial emotion.
    pub emotion: String,
    pub observations: serde_json::Value,
}

impl Default for UserState {
    fn default() -> Self {
        Self {
            emotion: NEUTRAL.to_string(),
            observations: serde_json::Value::Null,
        }
    }
}

/// Session state outliving any one scene.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub transcript: Transcript,
    pub users: BTreeMap<String, UserState>,
    /// Effective microphone state.
    pub listening: bool,
    /// Last explicit microphone request.
    pub listening_requested: bool,
    pub glitch: GlitchSettings,
    pub emotions: Option<EmotionState>,
}

/// What a transition did.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionReport {
    pub from: String,
    pub to: String,
    pub trigger: String,
    /// State each character of the old scene was left in.
    pub retired: Vec<(String, BehaviorState)>,
}

/// How a spoken line ended.
enum LineEnd {
    Spoken,
    Echoed(String),
    Failed,
}

pub struct SceneGraphBuilder {
    script: Arc<ScriptDefinition>,
    config: SessionConfig,
    prompts: Option<Box<dyn PromptExecutor>>,
    speech: Box<dyn SpeechSink>,
    rig: Box<dyn RigSink>,
    classifier: Option<Arc<dyn EmotionClassifier>>,
    bus: Option<Arc<dyn MessageBus>>,
    inbox: Inbox,
    callbacks: BTreeMap<String, SceneCallback>,
}

impl SceneGraphBuilder {
    /// Prompts run on the ticking thread against `model`.
    pub fn language_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.prompts = Some(Box::new(InlineExecutor::new(model)));
        self
    }

    pub fn prompt_executor(mut self, executor: Box<dyn PromptExecutor>) -> Self {
        self.prompts = Some(executor);
        self
    }

    pub fn speech(mut self, speech: Box<dyn SpeechSink>) -> Self {
        self.speech = speech;
        self
    }

    pub fn rig(mut self, rig: Box<dyn RigSink>) -> Self {
        self.rig = rig;
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn EmotionClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn inbox(mut self, inbox: Inbox) -> Self {
        self.inbox = inbox;
        self
    }

    pub fn callback(mut self, name: &str, callback: SceneCallback) -> Self {
        self.callbacks.insert(name.to_string(), callback);
        self
    }

    pub fn build(self) -> Result<SceneGraph, SessionError> {
        self.build_at(Instant::now())
    }

    /// Builds the graph and enters the initial scene at `now`.
    pub fn build_at(self, now: Instant) -> Result<SceneGraph, SessionError> {
        for scene in self.script.scenes.values() {
            if let Some(name) = scene
                .document
                .internal_callbacks
                .iter()
                .find(|name| !self.callbacks.contains_key(name.as_str()))
            {
                return Err(SessionError::UnknownCallback {
                    scene: scene.id.clone(),
                    name: name.clone(),
                });
            }
            if let Some(character) = scene
                .characters()
                .iter()
                .find(|character| self.config.users.contains(&character.display_name))
            {
                return Err(SessionError::ReservedName(character.display_name.clone()));
            }
        }

        let seed = self.config.seed.unwrap_or_else(rand::random);
        let session = Session {
            users: self
                .config
                .users
                .iter()
                .map(|name| (name.clone(), UserState::default()))
                .collect(),
            emotions: self
                .config
                .emotions
                .then(|| EmotionState::new(self.config.emotion_tuning)),
            ..Session::default()
        };
        let prompts: Box<dyn PromptExecutor> = match self.prompts {
            Some(prompts) => prompts,
            None => Box::new(InlineExecutor::new(Arc::new(UnavailableModel))),
        };

        let mut graph = SceneGraph {
            scene: self.script.initial_scene.clone(),
            script: self.script,
            config: self.config,
            epoch: 0,
            roster: Vec::new(),
            session,
            prompts,
            speech: self.speech,
            rig: self.rig,
            classifier: self.classifier,
            bus: self.bus,
            inbox: self.inbox,
            callbacks: self.callbacks,
            cues: Vec::new(),
            flushing: false,
            metrics: FrameMetrics::new(),
            rng: StdRng::seed_from_u64(seed),
            now,
            scene_entered: now,
            started: None,
            finished: false,
        };
        info!("Session for script '{}' (seed {seed})", graph.script.name);
        let initial = graph.scene.clone();
        graph.enter_scene(&initial)?;
        graph.set_listening(false);
        Ok(graph)
    }
}

pub struct SceneGraph {
    script: Arc<ScriptDefinition>,
    config: SessionConfig,
    scene: String,
    /// Bumped on every scene exit.
    epoch: u64,
    roster: Vec<BehaviorMachine>,
    session: Session,
    prompts: Box<dyn PromptExecutor>,
    speech: Box<dyn SpeechSink>,
    rig: Box<dyn RigSink>,
    classifier: Option<Arc<dyn EmotionClassifier>>,
    bus: Option<Arc<dyn MessageBus>>,
    inbox: Inbox,
    callbacks: BTreeMap<String, SceneCallback>,
    cues: Vec<Cue>,
    flushing: bool,
    metrics: FrameMetrics,
    rng: StdRng,
    now: Instant,
    scene_entered: Instant,
    started: Option<Instant>,
    finished: bool,
}

impl SceneGraph {
    pub fn builder(script: Arc<ScriptDefinition>, config: SessionConfig) -> SceneGraphBuilder {
        let mut callbacks: BTreeMap<String, SceneCallback> = BTreeMap::new();
        callbacks.insert(
            "reset_emotions".to_string(),
            Box::new(|session: &mut Session| {
                if let Some(emotions) = session.emotions.as_mut() {
                    emotions.reset();
                }
            }),
        );
        SceneGraphBuilder {
            script,
            config,
            prompts: None,
            speech: Box::new(ImmediateSpeech),
            rig: Box::new(NullRig),
            classifier: None,
            bus: None,
            inbox: Inbox::new(),
            callbacks,
        }
    }

    pub fn scene(&self) -> &str {
        &self.scene
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn script(&self) -> &ScriptDefinition {
        &self.script
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn transcript(&self) -> &Transcript {
        &self.session.transcript
    }

    pub fn inbox(&self) -> Inbox {
        self.inbox.clone()
    }

    pub fn characters(&self) -> impl Iterator<Item = &BehaviorMachine> {
        self.roster.iter()
    }

    pub fn character(&self, name: &str) -> Option<&BehaviorMachine> {
        self.roster.iter().find(|machine| machine.name() == name)
    }

    pub fn listening(&self) -> bool {
        self.session.listening
    }

    /// The active scene is final.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn tick(&mut self) -> Result<Option<TransitionReport>, SessionError> {
        self.tick_at(Instant::now())
    }

    /// One frame: drain the inbox, route finished prompts, then try the
    /// automatic transitions. Returns the first failure other than a guard
    /// rejection; the rest of the frame still runs. A scene without a tick
    /// edge (a final scene) discards its input.
    pub fn tick_at(&mut self, now: Instant) -> Result<Option<TransitionReport>, SessionError> {
        self.metrics.start(Instant::now());
        self.now = now;

        if !self.script.transitions.has_tick(&self.scene) {
            let dropped = self.inbox.drain().len();
            if dropped > 0 {
                debug!("SceneGraph | '{}' takes no input, dropped {dropped} messages", self.scene);
            }
            self.metrics.end(Instant::now());
            return Ok(None);
        }

        let mut failure = None;
        for message in self.inbox.drain() {
            if let Err(err) = self.handle_message(message) {
                if err.is_rejected() {
                    debug!("SceneGraph | {err}");
                } else {
                    error!("SceneGraph | {err}");
                    failure.get_or_insert(err);
                }
            }
        }

        self.route_completions();

        let report = match self.try_automatic() {
            Ok(report) => Some(report),
            Err(SessionError::Rejected(rejected)) => {
                debug!("SceneGraph | {rejected}");
                None
            }
            Err(err) => {
                error!("SceneGraph | {err}");
                failure.get_or_insert(err);
                None
            }
        };

        self.metrics.end(Instant::now());
        match failure {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Takes a manual transition by name.
    pub fn send(&mut self, name: &str) -> Result<TransitionReport, SessionError> {
        if !name.starts_with("manual_") || !self.script.transitions.has_manual(name) {
            return Err(SessionError::UnknownTransition(name.to_string()));
        }
        let transition = self
            .script
            .transitions
            .manual_from(&self.scene, name)
            .cloned()
            .ok_or_else(|| GuardRejected::new(name, &self.scene))?;
        let facts = self.facts();
        if let Some(guard) = &transition.guard {
            if !guard.evaluate(&facts) {
                return Err(GuardRejected::new(name, &self.scene).into());
            }
        }
        info!("SceneGraph | Manual transition '{name}'");
        self.perform(&transition)
    }

    /// Takes the first automatic transition whose guard holds.
    pub fn try_automatic(&mut self) -> Result<TransitionReport, SessionError> {
        let facts = self.facts();
        let transition = self
            .script
            .transitions
            .automatic_from(&self.scene)
            .find(|t| t.guard.as_ref().map_or(true, |guard| guard.evaluate(&facts)))
            .cloned()
            .ok_or_else(|| GuardRejected::new("automatic", &self.scene))?;
        self.perform(&transition)
    }

    pub fn facts(&self) -> GuardFacts {
        let last = self.session.transcript.last_speaker();
        GuardFacts {
            elapsed: self.now.saturating_duration_since(self.scene_entered),
            all_final_and_silent: self
                .roster
                .iter()
                .all(|m| m.state() == BehaviorState::Final && !m.is_speaking()),
            no_waiting_responses: self.roster.iter().all(|m| !m.has_pending_responses()),
            user_spoke_last: last.is_some_and(|name| self.session.users.contains_key(name)),
            character_spoke_last: last.is_some_and(|name| self.character(name).is_some()),
            anyone_speaking: self.anyone_speaking(),
        }
    }

    fn anyone_speaking(&self) -> bool {
        self.roster.iter().any(BehaviorMachine::is_speaking)
    }

    fn perform(&mut self, transition: &Transition) -> Result<TransitionReport, SessionError> {
        let from = self.scene.clone();
        let retired = self.exit_scene(&transition.name);
        self.enter_scene(&transition.target)?;
        Ok(TransitionReport {
            from,
            to: transition.target.clone(),
            trigger: transition.name.clone(),
            retired,
        })
    }

    fn exit_scene(&mut self, trigger: &str) -> Vec<(String, BehaviorState)> {
        info!("SceneGraph | Exiting '{}' on '{trigger}'", self.scene);
        for index in 0..self.roster.len() {
            self.drive(index, |machine, stage| machine.retire(stage, trigger));
        }
        let retired = self
            .roster
            .drain(..)
            .map(|machine| (machine.name().to_string(), machine.state()))
            .collect();
        self.epoch += 1;
        if self.scene == PREROLL_SCENE {
            self.started = Some(self.now);
        }
        retired
    }

    fn enter_scene(&mut self, id: &str) -> Result<(), SessionError> {
        let script = Arc::clone(&self.script);
        let scene = script
            .scene(id)
            .ok_or_else(|| SessionError::UnknownScene(id.to_string()))?;
        info!("SceneGraph | Scene [{id}]");
        self.scene = id.to_string();
        self.scene_entered = self.now;
        self.session
            .transcript
            .add_scene_change(id, &scene.document.meta);

        for character in scene.characters() {
            let behavior = script.behavior(&character.behavior).ok_or_else(|| {
                SessionError::UnknownBehavior {
                    character: character.display_name.clone(),
                    behavior: character.behavior.clone(),
                }
            })?;
            let profile = CharacterProfile {
                display_name: character.display_name.clone(),
                persona_name: character.persona_name.clone(),
                behavior: character.behavior.clone(),
                persona: script.personas.get(&character.persona_name).cloned(),
                few_shots: character
                    .few_shots
                    .as_ref()
                    .and_then(|name| script.few_shots.get(name))
                    .cloned(),
                llm_name: character
                    .llm_name
                    .clone()
                    .unwrap_or_else(|| self.config.llm_name.clone()),
            };
            info!(
                "SceneGraph | Creating character '{}' (persona '{}', behavior '{}', LLM '{}')",
                profile.display_name, profile.persona_name, profile.behavior, profile.llm_name
            );
            self.session.transcript.add_character(
                &profile.display_name,
                &profile.persona_name,
                &profile.behavior,
            );
            self.roster
                .push(BehaviorMachine::new(profile, behavior, self.rng.gen()));
            let index = self.roster.len() - 1;
            if let Some(Err(rejected)) = self.drive(index, |machine, stage| machine.init(stage)) {
                debug!("SceneGraph | {rejected}");
            }
        }

        for name in &scene.document.internal_callbacks {
            match self.callbacks.get_mut(name) {
                Some(callback) => {
                    info!("SceneGraph | Running callback '{name}'");
                    callback(&mut self.session);
                }
                None => {
                    return Err(SessionError::UnknownCallback {
                        scene: id.to_string(),
                        name: name.clone(),
                    })
                }
            }
        }

        let last = self.session.transcript.last_speaker();
        if !last.is_some_and(|name| self.character(name).is_some()) {
            self.advance_all();
        }

        if scene.is_final() {
            self.finished = true;
            let total = self
                .started
                .map(|started| self.now.saturating_duration_since(started));
            info!("SceneGraph | Final scene reached, total time {total:?}");
            if let Some(summary) = self.metrics.summary() {
                info!("SceneGraph | Metrics: {summary:?}");
            }
        }
        self.apply_listening();
        Ok(())
    }

    /// Runs `op` on one machine with a stage borrowed from the graph, then
    /// delivers whatever cues it produced.
    fn drive<R>(
        &mut self,
        index: usize,
        op: impl FnOnce(&mut BehaviorMachine, &mut Stage<'_>) -> R,
    ) -> Option<R> {
        let result = {
            let primary = self.config.primary_user();
            let user_emotion = self
                .session
                .users
                .get(primary)
                .map_or(NEUTRAL, |user| user.emotion.as_str());
            let machine = self.roster.get_mut(index)?;
            let mut stage = Stage {
                epoch: self.epoch,
                prompts: &*self.prompts,
                placeholders: Placeholders::new(
                    &self.script.placeholders,
                    &self.session.transcript,
                    user_emotion,
                ),
                emotions: self.session.emotions.as_mut(),
                classifier: self.classifier.as_deref(),
                cues: &mut self.cues,
            };
            op(machine, &mut stage)
        };
        self.flush_cues();
        Some(result)
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.roster.iter().position(|machine| machine.name() == name)
    }

    /// Delivers queued cues until none are left. Cues raised while
    /// delivering are appended and handled in the same flush.
    fn flush_cues(&mut self) {
        if self.flushing {
            return;
        }
        self.flushing = true;
        while !self.cues.is_empty() {
            let batch = std::mem::take(&mut self.cues);
            for cue in batch {
                self.deliver(cue);
            }
        }
        self.flushing = false;
    }

    fn deliver(&mut self, cue: Cue) {
        match cue {
            Cue::Utterance {
                speaker,
                persona,
                entry,
            } => {
                let attributes = match &self.session.emotions {
                    Some(emotions) => emotions.overwrite(&entry.attributes),
                    None => entry.attributes.clone(),
                };
                let utterance = Utterance {
                    speaker,
                    persona,
                    text: entry.text,
                    attributes,
                    log_ref: entry.log_ref,
                    emotion_summary: self.session.emotions.as_ref().map(EmotionState::summary),
                };
                self.apply_listening();
                let end = match self.speech.say(&utterance) {
                    Ok(SpeechAck::Completed) => Some(LineEnd::Spoken),
                    Ok(SpeechAck::Pending) => None,
                    Err(err) => {
                        warn!("{} | Speech failed: {err}", utterance.speaker);
                        Some(LineEnd::Failed)
                    }
                };
                if let (Some(end), Some(index)) = (end, self.index_of(&utterance.speaker)) {
                    self.finish_line(index, end);
                }
            }
            Cue::Meatstate {
                speaker,
                persona,
                state,
                timeout,
            } => {
                self.session
                    .transcript
                    .add_meatstate(&speaker, &persona, state);
                if timeout > 0.0 {
                    debug!("{speaker} | Meatstate '{state}' for {timeout}s");
                }
                if let Err(err) = self.rig.meatstate(&speaker, state) {
                    warn!("{speaker} | Rig failed: {err}");
                }
                if let Some(index) = self.index_of(&speaker) {
                    self.settle(index);
                }
            }
            Cue::Play {
                speaker,
                id,
                attributes,
                ..
            } => {
                if let Err(err) = self.rig.play(&speaker, id, &attributes) {
                    warn!("{speaker} | Playback {id} failed: {err}");
                }
            }
            Cue::Glitch(settings) => {
                if let Err(err) = self.rig.glitch(&settings) {
                    warn!("Glitch failed: {err}");
                }
                self.session.glitch = settings;
            }
        }
    }

    /// A character's line is over: record it, reopen the microphone and let
    /// the character continue.
    fn finish_line(&mut self, index: usize, end: LineEnd) {
        let Some(machine) = self.roster.get_mut(index) else {
            return;
        };
        let entry = machine.speech_complete();
        let name = machine.name().to_string();
        let persona = machine.profile().persona_name.clone();
        let log_ref = entry.as_ref().and_then(|entry| entry.log_ref.clone());
        let text = match end {
            LineEnd::Spoken => entry.map(|entry| entry.text),
            LineEnd::Echoed(text) => Some(text),
            LineEnd::Failed => None,
        };
        if let Some(text) = text {
            self.session.transcript.add_chat(&name, &persona, &text, log_ref);
        }
        self.set_listening(true);
        self.settle(index);
    }

    /// Speaks the next queued line, or lets a stopping character finish.
    fn settle(&mut self, index: usize) {
        let Some(machine) = self.roster.get(index) else {
            return;
        };
        let outcome = if machine.has_pending_responses() {
            self.drive(index, |machine, stage| machine.speak(stage))
        } else if machine.state() == BehaviorState::Stop {
            self.drive(index, |machine, stage| machine.advance(stage).map(|_| ()))
        } else {
            None
        };
        if let Some(Err(rejected)) = outcome {
            debug!("SceneGraph | {rejected}");
        }
    }

    fn advance_all(&mut self) {
        debug!("SceneGraph | Advancing characters");
        for index in 0..self.roster.len() {
            if let Some(Err(rejected)) = self.drive(index, |machine, stage| machine.advance(stage)) {
                debug!("SceneGraph | {rejected}");
            }
        }
    }

    fn speak_all(&mut self) {
        for index in 0..self.roster.len() {
            if let Some(Err(rejected)) = self.drive(index, |machine, stage| machine.speak(stage)) {
                debug!("SceneGraph | {rejected}");
            }
        }
    }

    fn route_completions(&mut self) {
        for completion in self.prompts.poll() {
            if completion.ticket.epoch != self.epoch {
                debug!(
                    "SceneGraph | Dropping completion {} from a previous scene",
                    completion.ticket
                );
                continue;
            }
            match self.index_of(&completion.ticket.character) {
                Some(index) => {
                    self.drive(index, |machine, stage| machine.complete_prompt(stage, completion));
                }
                None => debug!("SceneGraph | No character for completion {}", completion.ticket),
            }
        }
    }

    fn handle_message(&mut self, message: InboundMessage) -> Result<(), SessionError> {
        match message {
            InboundMessage::Chat { user, message } => self.deliver_chat(&user, &message),
            InboundMessage::Event(action) => return self.handle_action(action),
            InboundMessage::Config(_) => debug!("SceneGraph | Config message ignored"),
        }
        Ok(())
    }

    fn handle_action(&mut self, action: EventAction) -> Result<(), SessionError> {
        match action {
            EventAction::Transition { transition } => {
                self.send(&transition)?;
            }
            EventAction::ForceAdvance => self.advance_all(),
            EventAction::Microphone { listening } => {
                let requested = match listening {
                    Listening::Set(flag) => flag,
                    Listening::Toggle => !self.session.listening,
                };
                self.set_listening(requested);
            }
            EventAction::Speak => self.speak_all(),
            EventAction::EmotionRecognition { message } => {
                if let Some(emotions) = self.session.emotions.as_mut() {
                    emotions.from_user(&message);
                }
                let primary = self.config.primary_user().to_string();
                self.session.users.entry(primary).or_default().emotion = message;
            }
            EventAction::VisionAttributes { message } => {
                let attributes = message
                    .pointer("/data/attributes")
                    .cloned()
                    .unwrap_or(message);
                let primary = self.config.primary_user().to_string();
                self.session.users.entry(primary).or_default().observations = attributes;
            }
            EventAction::Override { name, bucket } => match self.index_of(&name) {
                Some(index) => {
                    self.drive(index, |machine, stage| machine.override_with(stage, &bucket));
                }
                None => warn!("SceneGraph | Override for unknown character '{name}'"),
            },
            EventAction::SttState { listening } => {
                info!("SceneGraph | Speech recognition reports listening={listening}");
                self.session.listening = listening;
            }
            EventAction::Unknown => warn!("SceneGraph | Unknown action"),
        }
        Ok(())
    }

    /// Chat from a user, or a character's line echoed back by the speech
    /// sink once it has been spoken.
    fn deliver_chat(&mut self, user: &str, message: &str) {
        if self.session.users.contains_key(user) {
            self.session.transcript.add_chat(user, user, message, None);
            let auto_think = self
                .script
                .scene(&self.scene)
                .and_then(|scene| scene.document.auto_think)
                .unwrap_or(self.config.auto_think);
            if auto_think && !self.anyone_speaking() {
                let rig = self.config.rig_character.clone();
                self.cues.push(Cue::Meatstate {
                    speaker: rig.clone(),
                    persona: rig,
                    state: RigState::Think,
                    timeout: 0.0,
                });
                self.flush_cues();
            }
            self.advance_all();
        } else if let Some(index) = self.index_of(user) {
            self.finish_line(index, LineEnd::Echoed(message.to_string()));
        } else {
            warn!("SceneGraph | Unknown character '{user}'");
        }
    }

    /// Records a microphone request and applies the mute policy to it.
    pub fn set_listening(&mut self, requested: bool) {
        self.session.listening_requested = requested;
        self.apply_listening();
    }

    fn apply_listening(&mut self) {
        let force_mute = self
            .script
            .scene(&self.scene)
            .is_some_and(|scene| scene.document.force_mute);
        let listening = self.session.listening_requested && !force_mute && !self.anyone_speaking();
        if listening == self.session.listening {
            return;
        }
        self.session.listening = listening;
        info!("SceneGraph | Listening: {listening}");
        if let Some(bus) = &self.bus {
            let payload = serde_json::json!({
                "av-command": "stt-control",
                "data": { "listening": listening },
            });
            if let Err(err) = bus.publish(AV_CHANNEL, &payload.to_string()) {
                warn!("SceneGraph | Could not publish listening state: {err}");
            }
        }
    }

    pub fn status(&self) -> StatusSnapshot {
        let facts = self.facts();
        let scene = self.script.scene(&self.scene);
        StatusSnapshot {
            script: self.script.name.clone(),
            scene: self.scene.clone(),
            scene_meta: scene.map(|s| s.document.meta.clone()).unwrap_or_default(),
            epoch: self.epoch,
            elapsed: facts.elapsed.as_secs_f64(),
            characters: self
                .roster
                .iter()
                .map(|machine| CharacterStatus {
                    name: machine.name().to_string(),
                    persona: machine.profile().persona_name.clone(),
                    behavior: machine.profile().behavior.clone(),
                    state: machine.state(),
                    queue_length: machine.queue_len(),
                    speaking: machine.is_speaking(),
                    awaiting_completion: machine.awaiting_completion(),
                    emotion: machine.emotion(),
                })
                .collect(),
            manual_transitions: self
                .script
                .transitions
                .manual_names_from(&self.scene)
                .into_iter()
                .map(str::to_string)
                .collect(),
            automatic: self
                .script
                .transitions
                .automatic_from(&self.scene)
                .map(|t| GuardStatus {
                    target: t.target.clone(),
                    guard: t
                        .guard
                        .as_ref()
                        .map_or_else(|| "none".to_string(), ToString::to_string),
                    satisfied: t.guard.as_ref().map_or(true, |g| g.evaluate(&facts)),
                })
                .collect(),
            listening: self.session.listening,
            glitch: self.session.glitch.clone(),
            user_emotion: self
                .session
                .users
                .get(self.config.primary_user())
                .map_or_else(|| NEUTRAL.to_string(), |user| user.emotion.clone()),
            emotions: self.session.emotions.as_ref().map(|emotions| EmotionStatus {
                scores: emotions.scores(),
                style: emotions.style(),
                dominant: emotions.dominant(),
            }),
            transcript: self.session.transcript.entries().to_vec(),
            finished: self.finished,
            frames: self.metrics.total_frames(),
            metrics: self.metrics.summary(),
        }
    }
}
