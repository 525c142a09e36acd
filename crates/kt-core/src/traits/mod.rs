//! Core trait definitions

mod orchestrator;

pub use orchestrator::{Orchestrator, StatusSource};
