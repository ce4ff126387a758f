//! Campaign selection — targeting filters, weighted variant allocation,
//! and the marketing consent gate.

pub mod allocator;
pub mod consent;
pub mod selector;

pub use allocator::VariantAllocator;
pub use consent::{BlockReason, ConsentDecision, ConsentGate};
pub use selector::{CampaignSelector, ExclusionReason};
