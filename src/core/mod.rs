pub mod behavior;
pub mod capability;
pub mod compiler;
pub mod config;
pub mod driver;
pub mod emotion;
pub mod guard;
pub mod hub;
pub mod inbox;
pub mod placeholder;
pub mod scene;
pub mod status;
pub mod transcript;
pub mod transition;
