//! Marketing consent gate — decides whether any campaign evaluation may
//! run for a visitor at all.

use std::sync::Arc;

use tracing::{debug, warn};

use popup_core::config::ConsentConfig;
use popup_core::store::ConsentStore;
use popup_core::types::VisitorSession;

/// Outcome of the consent check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsentDecision {
    /// Evaluation may proceed.
    Allowed,
    /// Evaluation must not run; the reason is logged, never user-visible.
    Blocked(BlockReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Visitor is in an opt-in jurisdiction without a marketing grant.
    ConsentRequired,
    /// Geography unresolved and policy fails closed.
    JurisdictionUnknown,
    /// The consent store could not be read; fail closed.
    StoreUnavailable,
}

/// Blocks campaign evaluation until the visitor has granted marketing
/// consent, or consent is not required for their jurisdiction. Ambiguity
/// always fails closed.
#[derive(Debug, Clone)]
pub struct ConsentGate {
    config: ConsentConfig,
}

impl Default for ConsentGate {
    fn default() -> Self {
        Self::new(ConsentConfig::default())
    }
}

impl ConsentGate {
    pub fn new(config: ConsentConfig) -> Self {
        Self { config }
    }

    /// Whether the session's jurisdiction requires opt-in consent.
    /// Unknown geography defers to the fail-closed policy knob.
    pub fn consent_required(&self, session: &VisitorSession) -> bool {
        match &session.geo {
            Some(geo) => self
                .config
                .opt_in_countries
                .iter()
                .any(|c| c.eq_ignore_ascii_case(&geo.country)),
            None => self.config.require_consent_when_geo_unknown,
        }
    }

    /// The gate decision for this visitor right now.
    pub fn decision(
        &self,
        session: &VisitorSession,
        consent_store: &Arc<dyn ConsentStore>,
    ) -> ConsentDecision {
        if !self.consent_required(session) {
            return ConsentDecision::Allowed;
        }

        match consent_store.marketing_consent(&session.visitor_id) {
            Ok(Some(record)) if record.granted => ConsentDecision::Allowed,
            Ok(_) => {
                debug!(
                    visitor_id = %session.visitor_id,
                    geo_known = session.geo.is_some(),
                    "Marketing evaluation blocked pending consent"
                );
                if session.geo.is_some() {
                    ConsentDecision::Blocked(BlockReason::ConsentRequired)
                } else {
                    ConsentDecision::Blocked(BlockReason::JurisdictionUnknown)
                }
            }
            Err(err) => {
                warn!(visitor_id = %session.visitor_id, error = %err, "Consent store unavailable");
                ConsentDecision::Blocked(BlockReason::StoreUnavailable)
            }
        }
    }
}
