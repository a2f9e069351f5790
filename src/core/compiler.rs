/// Script compiler. Loads scene and behavior documents, validates every
/// cross-reference, prunes to the reachable subgraph and emits the flat
/// transition table.
///
/// Compilation is all-or-nothing: any failure yields a [`LoadError`] and no
/// partial [`ScriptDefinition`].
use log::{debug, info};
use rustc_hash::FxHashSet;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::guard::Guard;
use super::transition::{
    Transition, TransitionKind, TransitionTable, AUTOMATIC, MANUAL_FAULT, TICK,
};
use crate::schema::event::{Event, EventEntry, EventError};
use crate::schema::parse_document;
use crate::schema::script::{split_stem, BehaviorDocument, CharacterEntry, ExitEntry, SceneDocument};
use crate::schema::sequence::{DynamicEventSequence, EventSequence, AUTOMATIC as AUTOMATIC_BUCKET};

/// Entry scene added to every pruned graph.
pub const PREROLL_SCENE: &str = "s_PREROLL_init";
/// Recovery scene every non-final scene can jump to.
pub const FAULT_SCENE: &str = "s_unknown_fault";

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
    #[error("document '{document}': {source}")]
    Document {
        document: String,
        source: ron::error::SpannedError,
    },
    #[error("document '{document}': {source}")]
    Event { document: String, source: EventError },
    #[error("no scenes found in '{}'", .0.display())]
    NoScenes(PathBuf),
    #[error("duplicate scene id '{0}'")]
    DuplicateScene(String),
    #[error("duplicate behavior '{0}'")]
    DuplicateBehavior(String),
    #[error("scene '{scene}' lists character '{character}' more than once")]
    DuplicateCharacter { scene: String, character: String },
    #[error("final scene '{0}' has exits")]
    FinalWithExits(String),
    #[error("expected exactly one initial scene, found {0:?}")]
    InitialScene(Vec<String>),
    #[error("scene '{scene}' refers to unknown {kind} '{name}'")]
    Dangling {
        scene: String,
        kind: &'static str,
        name: String,
    },
    #[error("start scene '{0}' not found")]
    UnknownStartScene(String),
    #[error("required scene '{0}' is missing")]
    MissingScene(&'static str),
}

/// Knobs that change how the table is generated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileOptions {
    pub start_scene: Option<String>,
    /// Exits without a condition fire on `Complete` instead of waiting for
    /// an operator.
    pub simulation: bool,
}

impl CompileOptions {
    pub fn default_condition(&self) -> Guard {
        if self.simulation {
            Guard::Complete
        } else {
            Guard::ManualOnly
        }
    }
}

/// Raw script documents, from a directory or assembled in memory.
#[derive(Debug, Clone, Default)]
pub struct ScriptSource {
    pub name: String,
    /// (file stem, RON text)
    pub scenes: Vec<(String, String)>,
    /// (behavior name, RON text)
    pub behaviors: Vec<(String, String)>,
    pub personas: BTreeMap<String, String>,
    pub few_shots: BTreeMap<String, String>,
    pub default_overrides: Option<String>,
    /// Keyed by token, e.g. `_CLINIC_NAME`.
    pub placeholders: BTreeMap<String, String>,
}

impl ScriptSource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_scene(mut self, stem: &str, document: &str) -> Self {
        self.scenes.push((stem.to_string(), document.to_string()));
        self
    }

    pub fn with_behavior(mut self, name: &str, document: &str) -> Self {
        self.behaviors.push((name.to_string(), document.to_string()));
        self
    }

    pub fn with_persona(mut self, name: &str, text: &str) -> Self {
        self.personas.insert(name.to_string(), text.to_string());
        self
    }

    pub fn with_few_shots(mut self, name: &str, text: &str) -> Self {
        self.few_shots.insert(name.to_string(), text.to_string());
        self
    }

    pub fn with_placeholder(mut self, name: &str, text: &str) -> Self {
        self.placeholders.insert(placeholder_token(name), text.to_string());
        self
    }

    pub fn with_default_overrides(mut self, document: &str) -> Self {
        self.default_overrides = Some(document.to_string());
        self
    }

    /// Reads a script directory:
    ///
    /// ```text
    /// scenes/*.ron  behaviors/*.ron  persona/*.txt  few-shots/*.txt
    /// overrides/default_overrides.ron  placeholders/*.txt
    /// ```
    pub fn load_dir(path: &Path) -> Result<Self, LoadError> {
        let scene_dir = path.join("scenes");
        let scenes = read_documents(&scene_dir, "ron")?;
        if scenes.is_empty() {
            return Err(LoadError::NoScenes(scene_dir));
        }
        let overrides = path.join("overrides").join("default_overrides.ron");
        let default_overrides = if overrides.is_file() {
            Some(fs::read_to_string(&overrides)?)
        } else {
            None
        };
        let source = ScriptSource {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            scenes,
            behaviors: read_documents(&path.join("behaviors"), "ron")?,
            personas: read_documents(&path.join("persona"), "txt")?
                .into_iter()
                .collect(),
            few_shots: read_documents(&path.join("few-shots"), "txt")?
                .into_iter()
                .collect(),
            default_overrides,
            placeholders: read_documents(&path.join("placeholders"), "txt")?
                .into_iter()
                .map(|(name, text)| (placeholder_token(&name), text.trim().to_string()))
                .collect(),
        };
        info!(
            "Loaded script '{}': {} scenes, {} behaviors, {} personas",
            source.name,
            source.scenes.len(),
            source.behaviors.len(),
            source.personas.len()
        );
        Ok(source)
    }
}

fn placeholder_token(name: &str) -> String {
    if name.starts_with('_') {
        name.to_string()
    } else {
        format!("_{name}")
    }
}

/// Every `*.<extension>` file of a directory as (stem, contents), sorted by
/// stem. A missing directory reads as empty.
fn read_documents(dir: &Path, extension: &str) -> Result<Vec<(String, String)>, LoadError> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        found.push((stem.to_string(), fs::read_to_string(&path)?));
    }
    found.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(found)
}

/// A compiled scene.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneDescriptor {
    pub id: String,
    /// Ordering prefix of the file stem, if it had one.
    pub index: Option<String>,
    pub document: SceneDocument,
}

impl SceneDescriptor {
    pub fn is_initial(&self) -> bool {
        self.document.initial
    }

    pub fn is_final(&self) -> bool {
        self.document.terminal
    }

    pub fn characters(&self) -> &[CharacterEntry] {
        &self.document.characters
    }
}

/// A compiled behavior: the buckets a character draws its events from.
#[derive(Debug, Clone, PartialEq)]
pub struct BehaviorDescriptor {
    pub name: String,
    pub init: Option<EventSequence>,
    pub end: Option<EventSequence>,
    pub dynamic: Option<DynamicEventSequence>,
    pub overrides: EventSequence,
    pub meta: BTreeMap<String, String>,
}

impl BehaviorDescriptor {
    pub fn from_document(
        name: &str,
        document: &BehaviorDocument,
        default_overrides: &EventSequence,
    ) -> Result<Self, EventError> {
        let init = document
            .init
            .as_ref()
            .map(|events| bucket("init", events))
            .transpose()?;

        let end = if document.end.is_some() || !document.end_on.is_empty() {
            let mut end = EventSequence::from_entries(&document.end_on)?;
            if let Some(events) = &document.end {
                end.merge(&bucket("end", events)?);
            }
            Some(end)
        } else {
            None
        };

        let dynamic = document
            .dynamic
            .as_ref()
            .map(|entry| -> Result<_, EventError> {
                Ok(DynamicEventSequence::new(
                    bucket(AUTOMATIC_BUCKET, &entry.events)?,
                    entry.looping,
                    entry.randomize,
                    entry.max_iterations,
                ))
            })
            .transpose()?;

        let mut overrides = default_overrides.clone();
        overrides.merge(&EventSequence::from_entries(&document.overrides)?);

        Ok(Self {
            name: name.to_string(),
            init,
            end,
            dynamic,
            overrides,
            meta: document.meta.clone(),
        })
    }
}

fn bucket(name: &str, entries: &[EventEntry]) -> Result<EventSequence, EventError> {
    let events = entries
        .iter()
        .map(Event::from_entry)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(EventSequence::single(name, events))
}

/// Everything a session needs, validated and immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptDefinition {
    pub name: String,
    pub initial_scene: String,
    pub scenes: BTreeMap<String, SceneDescriptor>,
    pub behaviors: BTreeMap<String, BehaviorDescriptor>,
    pub personas: BTreeMap<String, String>,
    pub few_shots: BTreeMap<String, String>,
    pub placeholders: BTreeMap<String, String>,
    pub transitions: TransitionTable,
}

impl ScriptDefinition {
    pub fn scene(&self, id: &str) -> Option<&SceneDescriptor> {
        self.scenes.get(id)
    }

    pub fn behavior(&self, name: &str) -> Option<&BehaviorDescriptor> {
        self.behaviors.get(name)
    }
}

/// Compiles a script source into a [`ScriptDefinition`].
pub fn compile(source: &ScriptSource, options: &CompileOptions) -> Result<ScriptDefinition, LoadError> {
    let default_overrides = match &source.default_overrides {
        Some(text) => {
            let document: BTreeMap<String, Vec<EventEntry>> =
                parse_document(text).map_err(|source| LoadError::Document {
                    document: "default_overrides".to_string(),
                    source,
                })?;
            EventSequence::from_entries(&document).map_err(|source| LoadError::Event {
                document: "default_overrides".to_string(),
                source,
            })?
        }
        None => EventSequence::new(),
    };

    let mut behaviors = BTreeMap::new();
    for (name, text) in &source.behaviors {
        if behaviors.contains_key(name) {
            return Err(LoadError::DuplicateBehavior(name.clone()));
        }
        let document: BehaviorDocument =
            parse_document(text).map_err(|source| LoadError::Document {
                document: name.clone(),
                source,
            })?;
        let descriptor = BehaviorDescriptor::from_document(name, &document, &default_overrides)
            .map_err(|source| LoadError::Event {
                document: name.clone(),
                source,
            })?;
        behaviors.insert(name.clone(), descriptor);
    }

    let mut scenes = BTreeMap::new();
    for (stem, text) in &source.scenes {
        let (index, id) = split_stem(stem);
        if scenes.contains_key(id) {
            return Err(LoadError::DuplicateScene(id.to_string()));
        }
        let document: SceneDocument =
            parse_document(text).map_err(|source| LoadError::Document {
                document: stem.clone(),
                source,
            })?;
        scenes.insert(
            id.to_string(),
            SceneDescriptor {
                id: id.to_string(),
                index: index.map(str::to_string),
                document,
            },
        );
    }

    for scene in scenes.values() {
        validate_scene(scene, &scenes, &behaviors, source)?;
    }

    let scenes = match &options.start_scene {
        Some(start) => prune(scenes, start)?,
        None => scenes,
    };
    if !scenes.contains_key(FAULT_SCENE) {
        return Err(LoadError::MissingScene(FAULT_SCENE));
    }

    let initial: Vec<String> = scenes
        .values()
        .filter(|s| s.is_initial())
        .map(|s| s.id.clone())
        .collect();
    if initial.len() != 1 {
        return Err(LoadError::InitialScene(initial));
    }
    let initial_scene = &initial[0];

    let transitions = build_transitions(&scenes, &options.default_condition());
    info!(
        "Compiled script '{}': {} scenes, {} transitions, initial '{}'",
        source.name,
        scenes.len(),
        transitions.len(),
        initial_scene
    );

    Ok(ScriptDefinition {
        name: source.name.clone(),
        initial_scene: initial_scene.clone(),
        scenes,
        behaviors,
        personas: source.personas.clone(),
        few_shots: source.few_shots.clone(),
        placeholders: source.placeholders.clone(),
        transitions,
    })
}

fn validate_scene(
    scene: &SceneDescriptor,
    scenes: &BTreeMap<String, SceneDescriptor>,
    behaviors: &BTreeMap<String, BehaviorDescriptor>,
    source: &ScriptSource,
) -> Result<(), LoadError> {
    let dangling = |kind: &'static str, name: &str| LoadError::Dangling {
        scene: scene.id.clone(),
        kind,
        name: name.to_string(),
    };

    if scene.is_final() && !scene.document.exits.is_empty() {
        return Err(LoadError::FinalWithExits(scene.id.clone()));
    }

    let mut seen = FxHashSet::default();
    for character in scene.characters() {
        if !seen.insert(character.display_name.as_str()) {
            return Err(LoadError::DuplicateCharacter {
                scene: scene.id.clone(),
                character: character.display_name.clone(),
            });
        }
        if !behaviors.contains_key(&character.behavior) {
            return Err(dangling("behavior", &character.behavior));
        }
        if !source.personas.contains_key(&character.persona_name) {
            return Err(dangling("persona", &character.persona_name));
        }
        if let Some(few_shots) = &character.few_shots {
            if !source.few_shots.contains_key(few_shots) {
                return Err(dangling("few-shots", few_shots));
            }
        }
    }

    for exit in &scene.document.exits {
        if !scenes.contains_key(&exit.target) {
            return Err(dangling("exit target", &exit.target));
        }
    }
    Ok(())
}

/// Keeps the scenes reachable from `start`, plus the preroll scene (rewired
/// to lead into `start` and made the sole initial scene) and the fault scene.
fn prune(
    mut all: BTreeMap<String, SceneDescriptor>,
    start: &str,
) -> Result<BTreeMap<String, SceneDescriptor>, LoadError> {
    if !all.contains_key(start) {
        return Err(LoadError::UnknownStartScene(start.to_string()));
    }

    let mut reachable = FxHashSet::default();
    let mut stack = vec![start.to_string()];
    while let Some(id) = stack.pop() {
        if !reachable.insert(id.clone()) {
            continue;
        }
        if let Some(scene) = all.get(&id) {
            // reversed so the first exit is explored first
            for exit in scene.document.exits.iter().rev() {
                if !reachable.contains(&exit.target) {
                    stack.push(exit.target.clone());
                }
            }
        }
    }
    debug!("Scenes reachable from '{start}': {}", reachable.len());

    let mut preroll = all
        .remove(PREROLL_SCENE)
        .ok_or(LoadError::MissingScene(PREROLL_SCENE))?;
    let mut fault = all
        .remove(FAULT_SCENE)
        .ok_or(LoadError::MissingScene(FAULT_SCENE))?;

    let mut kept: BTreeMap<String, SceneDescriptor> = all
        .into_iter()
        .filter(|(id, _)| reachable.contains(id))
        .collect();
    for scene in kept.values_mut() {
        scene.document.initial = false;
    }

    if start != PREROLL_SCENE {
        let condition = preroll.document.exits.first().and_then(|e| e.condition.clone());
        preroll.document.exits = vec![ExitEntry {
            condition,
            target: start.to_string(),
        }];
    }
    preroll.document.initial = true;
    kept.insert(PREROLL_SCENE.to_string(), preroll);

    fault.document.initial = false;
    fault.document.exits.retain(|exit| {
        let keep = kept.contains_key(&exit.target) || exit.target == FAULT_SCENE;
        if !keep {
            debug!("Dropping fault exit to pruned scene '{}'", exit.target);
        }
        keep
    });
    kept.insert(FAULT_SCENE.to_string(), fault);
    Ok(kept)
}

fn build_transitions(scenes: &BTreeMap<String, SceneDescriptor>, default_condition: &Guard) -> TransitionTable {
    let mut table = TransitionTable::default();
    for (id, scene) in scenes {
        if scene.is_final() {
            continue;
        }
        table.push(Transition {
            name: TICK.to_string(),
            source: id.clone(),
            target: id.clone(),
            kind: TransitionKind::Tick,
            guard: None,
        });
        for exit in &scene.document.exits {
            table.push(Transition {
                name: AUTOMATIC.to_string(),
                source: id.clone(),
                target: exit.target.clone(),
                kind: TransitionKind::Automatic,
                guard: Some(exit.condition.clone().unwrap_or_else(|| default_condition.clone())),
            });
        }
        for exit in &scene.document.exits {
            table.push(Transition {
                name: Transition::manual_name(&exit.target),
                source: id.clone(),
                target: exit.target.clone(),
                kind: TransitionKind::Manual,
                guard: Some(Guard::NobodySpeaking),
            });
        }
        if id != FAULT_SCENE {
            table.push(Transition {
                name: MANUAL_FAULT.to_string(),
                source: id.clone(),
                target: FAULT_SCENE.to_string(),
                kind: TransitionKind::Manual,
                guard: Some(Guard::NobodySpeaking),
            });
        }
    }
    table
}
