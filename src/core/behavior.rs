/// Per-character behavior machine.
///
/// A machine runs `Init → Start → Dynamic → Stop → Final`. Entering a state
/// pulls events from the character's buckets into a pending list; the list
/// is drained into queued responses and cues, then one response is offered
/// for speaking. The machine never talks to a collaborator directly: every
/// effect leaves it as a [`Cue`] pushed onto the [`Stage`], and the scene
/// graph delivers the cues after the call returns.
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;

use super::capability::{Completion, EmotionClassifier, PromptExecutor, PromptRequest, PromptTicket};
use super::compiler::BehaviorDescriptor;
use super::emotion::EmotionState;
use super::guard::GuardRejected;
use super::placeholder::{Placeholders, Speaker};
use super::transcript::strip_markup;
use crate::schema::attributes::{Attributes, Emotion, RigState};
use crate::schema::event::{Event, GlitchSettings};
use crate::schema::sequence::{DynamicEventSequence, EventSequence, AUTOMATIC};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BehaviorState {
    Init,
    Start,
    Dynamic,
    Stop,
    Final,
}

impl fmt::Display for BehaviorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Start => "start",
            Self::Dynamic => "dynamic",
            Self::Stop => "stop",
            Self::Final => "final",
        };
        f.write_str(name)
    }
}

/// A line waiting to be spoken.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEntry {
    pub text: String,
    pub attributes: Attributes,
    /// Scripted lines are immediate; model completions are not.
    pub immediate: bool,
    pub log_ref: Option<String>,
}

/// Who a machine plays.
#[derive(Debug, Clone, PartialEq)]
pub struct CharacterProfile {
    pub display_name: String,
    pub persona_name: String,
    pub behavior: String,
    pub persona: Option<String>,
    pub few_shots: Option<String>,
    pub llm_name: String,
}

/// An effect for the scene graph to carry out.
#[derive(Debug, Clone, PartialEq)]
pub enum Cue {
    Utterance {
        speaker: String,
        persona: String,
        entry: ResponseEntry,
    },
    Meatstate {
        speaker: String,
        persona: String,
        state: RigState,
        timeout: f32,
    },
    Play {
        speaker: String,
        persona: String,
        id: u32,
        attributes: Attributes,
    },
    Glitch(GlitchSettings),
}

/// What a machine may touch during one operation.
pub struct Stage<'a> {
    pub epoch: u64,
    pub prompts: &'a dyn PromptExecutor,
    pub placeholders: Placeholders<'a>,
    pub emotions: Option<&'a mut EmotionState>,
    pub classifier: Option<&'a dyn EmotionClassifier>,
    pub cues: &'a mut Vec<Cue>,
}

pub struct BehaviorMachine {
    profile: CharacterProfile,
    state: BehaviorState,
    pending: VecDeque<Event>,
    responses: VecDeque<ResponseEntry>,
    speaking: Option<ResponseEntry>,
    stop_flag: bool,
    dynamic_counter: u32,
    speak_counter: u32,
    prompt_counter: u64,
    awaiting: Option<(PromptTicket, Attributes)>,
    emotion: Emotion,
    emotion_summary: Option<String>,
    init: Option<EventSequence>,
    end: Option<EventSequence>,
    dynamic: Option<DynamicEventSequence>,
    overrides: EventSequence,
    rng: StdRng,
}

impl fmt::Debug for BehaviorMachine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BehaviorMachine")
            .field("character", &self.profile.display_name)
            .field("state", &self.state)
            .field("pending", &self.pending.len())
            .field("responses", &self.responses.len())
            .field("speaking", &self.speaking.is_some())
            .field("stop_flag", &self.stop_flag)
            .finish()
    }
}

impl BehaviorMachine {
    /// A fresh machine in `Init`, holding its own copy of the behavior's
    /// buckets.
    pub fn new(profile: CharacterProfile, behavior: &BehaviorDescriptor, seed: u64) -> Self {
        Self {
            profile,
            state: BehaviorState::Init,
            pending: VecDeque::new(),
            responses: VecDeque::new(),
            speaking: None,
            stop_flag: false,
            dynamic_counter: 0,
            speak_counter: 0,
            prompt_counter: 0,
            awaiting: None,
            emotion: Emotion::Neutral,
            emotion_summary: None,
            init: behavior.init.clone(),
            end: behavior.end.clone(),
            dynamic: behavior.dynamic.clone(),
            overrides: behavior.overrides.clone(),
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn profile(&self) -> &CharacterProfile {
        &self.profile
    }

    pub fn name(&self) -> &str {
        &self.profile.display_name
    }

    pub fn state(&self) -> BehaviorState {
        self.state
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking.is_some()
    }

    pub fn has_pending_responses(&self) -> bool {
        !self.responses.is_empty()
    }

    pub fn queue_len(&self) -> usize {
        self.responses.len()
    }

    pub fn pending_events(&self) -> usize {
        self.pending.len()
    }

    pub fn stop_flagged(&self) -> bool {
        self.stop_flag
    }

    pub fn awaiting_completion(&self) -> bool {
        self.awaiting.is_some()
    }

    pub fn dynamic_counter(&self) -> u32 {
        self.dynamic_counter
    }

    pub fn lines_spoken(&self) -> u32 {
        self.speak_counter
    }

    pub fn emotion(&self) -> Emotion {
        self.emotion
    }

    pub fn emotion_summary(&self) -> Option<&str> {
        self.emotion_summary.as_deref()
    }

    pub fn responses(&self) -> impl Iterator<Item = &ResponseEntry> {
        self.responses.iter()
    }

    fn reject(&self, transition: &str) -> GuardRejected {
        GuardRejected::new(transition, self.state)
    }

    fn ready(&self, transition: &str) -> Result<(), GuardRejected> {
        if self.is_speaking() || self.awaiting_completion() {
            Err(self.reject(transition))
        } else {
            Ok(())
        }
    }

    /// `Init → Start`.
    pub fn init(&mut self, stage: &mut Stage<'_>) -> Result<(), GuardRejected> {
        if self.state != BehaviorState::Init {
            return Err(self.reject("init"));
        }
        self.enter_start(stage);
        Ok(())
    }

    /// One step: `Start → Dynamic`, `Dynamic → Dynamic` until the stop flag
    /// is set, then `Dynamic → Stop`, and `Stop → Final` once nothing is
    /// left to say.
    pub fn advance(&mut self, stage: &mut Stage<'_>) -> Result<BehaviorState, GuardRejected> {
        self.ready("advance")?;
        match self.state {
            BehaviorState::Start => self.enter_dynamic(stage),
            BehaviorState::Dynamic if !self.stop_flag => self.enter_dynamic(stage),
            BehaviorState::Dynamic => self.enter_stop(stage, None),
            BehaviorState::Stop if self.responses.is_empty() => self.enter_final(),
            _ => return Err(self.reject("advance")),
        }
        Ok(self.state)
    }

    /// Pops the next response and hands it to the speech sink.
    pub fn speak(&mut self, stage: &mut Stage<'_>) -> Result<(), GuardRejected> {
        let can_speak = matches!(
            self.state,
            BehaviorState::Start | BehaviorState::Dynamic | BehaviorState::Stop
        );
        if !can_speak || self.is_speaking() {
            return Err(self.reject("speak"));
        }
        let Some(entry) = self.responses.pop_front() else {
            return Err(self.reject("speak"));
        };
        self.speak_counter += 1;
        info!("{} | Speaking: \"{}\"", self.profile.display_name, entry.text);
        stage.cues.push(Cue::Utterance {
            speaker: self.profile.display_name.clone(),
            persona: self.profile.persona_name.clone(),
            entry: entry.clone(),
        });
        self.speaking = Some(entry);
        Ok(())
    }

    /// Clears the speaking flag and returns the line that finished.
    pub fn speech_complete(&mut self) -> Option<ResponseEntry> {
        self.speaking.take()
    }

    /// Forced `Dynamic → Stop`.
    pub fn stop(&mut self, stage: &mut Stage<'_>, trigger: Option<&str>) -> Result<(), GuardRejected> {
        if self.state != BehaviorState::Dynamic || self.is_speaking() {
            return Err(self.reject("stop"));
        }
        self.enter_stop(stage, trigger);
        Ok(())
    }

    /// `Stop → Final`.
    pub fn finish(&mut self) -> Result<(), GuardRejected> {
        if self.state != BehaviorState::Stop || self.is_speaking() || !self.responses.is_empty() {
            return Err(self.reject("final"));
        }
        self.enter_final();
        Ok(())
    }

    /// Scene teardown. Moves the machine to `Stop`, running the end bucket
    /// for `trigger`, then tries `Final`. A line already being spoken is
    /// left to finish; a prompt still in flight is abandoned.
    pub fn retire(&mut self, stage: &mut Stage<'_>, trigger: &str) {
        if self.is_speaking() {
            debug!(
                "{} | Retiring while speaking; the current line plays out",
                self.profile.display_name
            );
        }
        self.abandon_prompt();
        if matches!(
            self.state,
            BehaviorState::Init | BehaviorState::Start | BehaviorState::Dynamic
        ) {
            self.enter_stop(stage, Some(trigger));
        }
        if let Err(rejected) = self.finish() {
            debug!("{} | {rejected}", self.profile.display_name);
        }
    }

    /// Replaces the pending events with the named override bucket and
    /// forces an advance. A prompt in flight is abandoned. Unknown names are
    /// ignored.
    pub fn override_with(&mut self, stage: &mut Stage<'_>, name: &str) -> bool {
        let Some(events) = self.overrides.get(name).map(|e| e.iter().cloned().collect::<VecDeque<_>>()) else {
            warn!("{} | Unknown override '{name}'", self.profile.display_name);
            return false;
        };
        info!("{} | Override '{name}'", self.profile.display_name);
        self.abandon_prompt();
        self.pending = events;
        if let Err(rejected) = self.advance(stage) {
            debug!("{} | Override advance: {rejected}", self.profile.display_name);
        }
        true
    }

    /// Takes a finished prompt. Completions for anything but the prompt in
    /// flight are dropped.
    pub fn complete_prompt(&mut self, stage: &mut Stage<'_>, completion: Completion) -> bool {
        if !self.accept_completion(stage, completion) {
            return false;
        }
        self.drain(stage);
        self.try_speak(stage);
        true
    }

    fn enter_start(&mut self, stage: &mut Stage<'_>) {
        self.state = BehaviorState::Start;
        debug!("{} | Enter start", self.profile.display_name);
        if let Some(events) = self.init.as_ref().and_then(|init| init.get("init")) {
            self.pending.extend(events.iter().cloned());
        }
        self.drain(stage);
        self.try_speak(stage);
    }

    /// Forgets the prompt in flight and the events paused behind it. Its
    /// completion is dropped when it arrives.
    fn abandon_prompt(&mut self) {
        if let Some((ticket, _)) = self.awaiting.take() {
            debug!(
                "{} | Abandoning prompt {ticket} and {} pending events",
                self.profile.display_name,
                self.pending.len()
            );
            self.pending.clear();
        }
    }

    fn enter_dynamic(&mut self, stage: &mut Stage<'_>) {
        self.state = BehaviorState::Dynamic;
        let next = self
            .dynamic
            .as_mut()
            .and_then(|dynamic| dynamic.get(AUTOMATIC, self.dynamic_counter, &mut self.rng));
        match next {
            Some(event) => {
                self.dynamic_counter += 1;
                debug!(
                    "{} | Enter dynamic #{}",
                    self.profile.display_name, self.dynamic_counter
                );
                self.pending.push_back(event);
            }
            None => {
                debug!("{} | Dynamic sequence exhausted", self.profile.display_name);
                self.stop_flag = true;
            }
        }
        self.drain(stage);
        self.try_speak(stage);
    }

    fn enter_stop(&mut self, stage: &mut Stage<'_>, trigger: Option<&str>) {
        self.state = BehaviorState::Stop;
        debug!(
            "{} | Enter stop ({})",
            self.profile.display_name,
            trigger.unwrap_or("advance")
        );
        if let Some(end) = &self.end {
            let bucket = match trigger {
                Some(trigger) if end.contains(trigger) => trigger,
                _ => "end",
            };
            if let Some(events) = end.get(bucket) {
                self.pending.extend(events.iter().cloned());
            }
        }
        self.drain(stage);
        self.try_speak(stage);
    }

    fn enter_final(&mut self) {
        self.state = BehaviorState::Final;
        info!("{} | Final", self.profile.display_name);
    }

    fn try_speak(&mut self, stage: &mut Stage<'_>) {
        if self.responses.is_empty() {
            return;
        }
        if let Err(rejected) = self.speak(stage) {
            debug!("{} | {rejected}", self.profile.display_name);
        }
    }

    /// Dispatches pending events in order, pausing while a prompt is in flight.
    fn drain(&mut self, stage: &mut Stage<'_>) {
        while !self.awaiting_completion() {
            let Some(event) = self.pending.pop_front() else {
                break;
            };
            self.dispatch(stage, event);
        }
    }

    fn speaker(&self) -> Speaker<'_> {
        Speaker {
            persona: self.profile.persona.as_deref(),
            few_shots: self.profile.few_shots.as_deref(),
            emotion: self.emotion.as_str(),
        }
    }

    fn dispatch(&mut self, stage: &mut Stage<'_>, event: Event) {
        match event {
            Event::Speak(speak) => {
                let Some(line) = speak.lines.pick(&mut self.rng).map(str::to_string) else {
                    return;
                };
                let text = stage.placeholders.resolve(&line, &self.speaker());
                let attributes = self.shape(stage, &text, &speak.attributes);
                self.responses.push_back(ResponseEntry {
                    text,
                    attributes,
                    immediate: true,
                    log_ref: None,
                });
            }
            Event::Prompt(prompt) => {
                let before = self.responses.len();
                self.responses.retain(|entry| entry.immediate);
                if self.responses.len() != before {
                    debug!(
                        "{} | Dropped {} stale generated lines",
                        self.profile.display_name,
                        before - self.responses.len()
                    );
                }
                let body = prompt.assemble(&mut self.rng);
                let body = stage.placeholders.resolve(&body, &self.speaker());
                let text = format!("{body}\n\n**{}:**", self.profile.display_name)
                    .trim()
                    .to_string();
                self.prompt_counter += 1;
                let ticket = PromptTicket {
                    epoch: stage.epoch,
                    character: self.profile.display_name.clone(),
                    sequence: self.prompt_counter,
                };
                debug!("{} | Prompt {ticket}:\n{text}", self.profile.display_name);
                self.awaiting = Some((ticket.clone(), prompt.attributes));
                let request = PromptRequest {
                    ticket,
                    llm_name: self.profile.llm_name.clone(),
                    prompt: text,
                };
                if let Some(completion) = stage.prompts.submit(request) {
                    self.accept_completion(stage, completion);
                }
            }
            Event::Meatstate(meatstate) => {
                info!("{} | Meatstate '{}'", self.profile.display_name, meatstate.state);
                stage.cues.push(Cue::Meatstate {
                    speaker: self.profile.display_name.clone(),
                    persona: self.profile.persona_name.clone(),
                    state: meatstate.state,
                    timeout: meatstate.timeout,
                });
            }
            Event::Play(play) => {
                stage.cues.push(Cue::Play {
                    speaker: self.profile.display_name.clone(),
                    persona: self.profile.persona_name.clone(),
                    id: play.id,
                    attributes: play.attributes,
                });
            }
            Event::Glitch(glitch) => stage.cues.push(Cue::Glitch(glitch)),
        }
    }

    /// Runs a line through the emotion state, when there is one.
    fn shape(&mut self, stage: &mut Stage<'_>, text: &str, attributes: &Attributes) -> Attributes {
        let Some(emotions) = stage.emotions.as_deref_mut() else {
            return attributes.clone();
        };
        if let Some(classifier) = stage.classifier {
            match classifier.classify(text) {
                Ok(labels) => emotions.absorb(&labels),
                Err(err) => warn!("{} | Emotion classification failed: {err}", self.profile.display_name),
            }
        }
        let shaped = emotions.integrate(attributes);
        self.emotion = shaped.emotion;
        self.emotion_summary = Some(emotions.summary());
        shaped
    }

    fn accept_completion(&mut self, stage: &mut Stage<'_>, completion: Completion) -> bool {
        let matches = self
            .awaiting
            .as_ref()
            .is_some_and(|(ticket, _)| *ticket == completion.ticket);
        if !matches {
            debug!(
                "{} | Dropping completion {} that is no longer awaited",
                self.profile.display_name, completion.ticket
            );
            return false;
        }
        let Some((ticket, attributes)) = self.awaiting.take() else {
            return false;
        };
        match completion.result {
            Ok(raw) => {
                let text = strip_markup(&raw);
                if text != raw.trim() {
                    warn!(
                        "{} | Markup removed from response: '{raw}' -> '{text}'",
                        self.profile.display_name
                    );
                }
                info!("{} | LLM response: \"{text}\"", self.profile.display_name);
                let attributes = self.shape(stage, &text, &attributes);
                self.responses.push_back(ResponseEntry {
                    text,
                    attributes,
                    immediate: false,
                    log_ref: Some(ticket.to_string()),
                });
            }
            Err(err) => {
                warn!("{} | LLM call failed, skipping turn: {err}", self.profile.display_name);
            }
        }
        true
    }
}
