//! Host-facing popup SDK — composes the consent gate, campaign selector,
//! variant allocator, and trigger engine into one orchestration surface.

pub mod orchestrator;

pub use orchestrator::{EvaluationOutcome, PopupOrchestrator};
