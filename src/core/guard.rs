/// Scene transition guards.
///
/// Guards are data: a closed vocabulary of named predicates plus
/// `All`/`Any`/`Not` composition, evaluated against a [`GuardFacts`]
/// snapshot the scene graph takes once per attempt.
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// A transition whose guard did not hold, or that does not leave the
/// current state. Expected in normal operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("transition '{transition}' not allowed from '{from}'")]
pub struct GuardRejected {
    pub transition: String,
    pub from: String,
}

impl GuardRejected {
    pub fn new(transition: &str, from: impl fmt::Display) -> Self {
        Self {
            transition: transition.to_string(),
            from: from.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Guard {
    /// Every character is final and nobody is speaking.
    Complete,
    /// No character has queued responses.
    NoWaitingResponses,
    UserSpokeLast,
    CharacterSpokeLast,
    /// Seconds since the scene was entered, inclusive.
    Elapsed(f64),
    /// Never true; the edge can only be taken manually.
    ManualOnly,
    NobodySpeaking,
    All(Vec<Guard>),
    Any(Vec<Guard>),
    Not(Box<Guard>),
}

/// What the guards can see of the session at one instant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GuardFacts {
    pub elapsed: Duration,
    pub all_final_and_silent: bool,
    pub no_waiting_responses: bool,
    pub user_spoke_last: bool,
    pub character_spoke_last: bool,
    pub anyone_speaking: bool,
}

impl Guard {
    pub fn evaluate(&self, facts: &GuardFacts) -> bool {
        match self {
            Self::Complete => facts.all_final_and_silent,
            Self::NoWaitingResponses => facts.no_waiting_responses,
            Self::UserSpokeLast => facts.user_spoke_last,
            Self::CharacterSpokeLast => facts.character_spoke_last,
            Self::Elapsed(seconds) => facts.elapsed.as_secs_f64() >= *seconds,
            Self::ManualOnly => false,
            Self::NobodySpeaking => !facts.anyone_speaking,
            Self::All(guards) => guards.iter().all(|g| g.evaluate(facts)),
            Self::Any(guards) => guards.iter().any(|g| g.evaluate(facts)),
            Self::Not(guard) => !guard.evaluate(facts),
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn list(f: &mut fmt::Formatter<'_>, name: &str, guards: &[Guard]) -> fmt::Result {
            write!(f, "{name}(")?;
            for (i, guard) in guards.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{guard}")?;
            }
            f.write_str(")")
        }
        match self {
            Self::Complete => f.write_str("complete"),
            Self::NoWaitingResponses => f.write_str("no_waiting_responses"),
            Self::UserSpokeLast => f.write_str("user_spoke_last"),
            Self::CharacterSpokeLast => f.write_str("character_spoke_last"),
            Self::Elapsed(seconds) => write!(f, "elapsed({seconds}s)"),
            Self::ManualOnly => f.write_str("manual_only"),
            Self::NobodySpeaking => f.write_str("nobody_speaking"),
            Self::All(guards) => list(f, "all", guards),
            Self::Any(guards) => list(f, "any", guards),
            Self::Not(guard) => write!(f, "not({guard})"),
        }
    }
}
