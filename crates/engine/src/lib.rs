//! Popup trigger engine — session event sourcing, trigger rule matching,
//! and fire-once registration lifecycle for one visitor session.

pub mod engine;
pub mod events;
pub mod evaluator;
pub mod registration;
pub mod rules;

pub use engine::PopupTriggerEngine;
pub use evaluator::{EvalOutcome, TriggerEvaluator};
pub use events::{
    ManualEventSource, SessionEvent, SessionEventSource, SignalKind, SubscriptionId,
    TokioEventSource,
};
pub use registration::{TriggerCallback, TriggerRegistration};
