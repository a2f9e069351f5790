/// The flat scene transition table produced by the compiler.
use serde::Serialize;

use super::guard::Guard;

/// Name shared by every automatic transition.
pub const AUTOMATIC: &str = "automatic";
/// Name of the per-scene self-loop run every frame.
pub const TICK: &str = "tick";
/// Name of the manual edge into the fault scene.
pub const MANUAL_FAULT: &str = "manual_fault";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransitionKind {
    Manual,
    Automatic,
    Tick,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub name: String,
    pub source: String,
    pub target: String,
    pub kind: TransitionKind,
    pub guard: Option<Guard>,
}

impl Transition {
    pub fn manual_name(target: &str) -> String {
        format!("manual_{target}")
    }
}

/// Transitions grouped by source scene, in a deterministic order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransitionTable {
    transitions: Vec<Transition>,
}

impl TransitionTable {
    pub(crate) fn push(&mut self, transition: Transition) {
        let duplicate = self.transitions.iter().any(|t| {
            t.kind == transition.kind
                && t.kind == TransitionKind::Manual
                && t.name == transition.name
                && t.source == transition.source
        });
        if !duplicate {
            self.transitions.push(transition);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn from_scene<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions.iter().filter(move |t| t.source == source)
    }

    /// Automatic transitions leaving `source`, in declaration order.
    pub fn automatic_from<'a>(&'a self, source: &'a str) -> impl Iterator<Item = &'a Transition> + 'a {
        self.from_scene(source)
            .filter(|t| t.kind == TransitionKind::Automatic)
    }

    pub fn manual_from(&self, source: &str, name: &str) -> Option<&Transition> {
        self.transitions
            .iter()
            .find(|t| t.source == source && t.kind == TransitionKind::Manual && t.name == name)
    }

    pub fn manual_names_from(&self, source: &str) -> Vec<&str> {
        self.transitions
            .iter()
            .filter(|t| t.source == source && t.kind == TransitionKind::Manual)
            .map(|t| t.name.as_str())
            .collect()
    }

    /// Whether `source` has a tick self-loop. Final scenes have none.
    pub fn has_tick(&self, source: &str) -> bool {
        self.transitions
            .iter()
            .any(|t| t.source == source && t.kind == TransitionKind::Tick)
    }

    /// Whether any scene declares a manual transition with this name.
    pub fn has_manual(&self, name: &str) -> bool {
        self.transitions
            .iter()
            .any(|t| t.kind == TransitionKind::Manual && t.name == name)
    }

    /// Sources of a shared manual transition name.
    pub fn manual_sources(&self, name: &str) -> Vec<&str> {
        self.transitions
            .iter()
            .filter(|t| t.kind == TransitionKind::Manual && t.name == name)
            .map(|t| t.source.as_str())
            .collect()
    }
}
