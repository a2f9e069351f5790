//! Scene Engine: a script-driven runtime for interactive character scenes.
//!
//! Scripts are directories of RON documents describing scenes, the
//! characters on stage and the behaviors they follow. The compiler turns a
//! script into an immutable [`ScriptDefinition`](core::compiler::ScriptDefinition);
//! a [`SceneGraph`](core::scene::SceneGraph) then runs it, ticking behavior
//! machines, taking turns at speaking and moving between scenes on guarded
//! transitions. Language models, speech, the physical rig and the message
//! bus sit behind the traits in [`core::capability`].

pub mod core;
pub mod schema;

pub use crate::core::compiler::{compile, CompileOptions, LoadError, ScriptDefinition, ScriptSource};
pub use crate::core::config::SessionConfig;
pub use crate::core::scene::{SceneGraph, SessionError};
