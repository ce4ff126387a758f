//! Reduces the active-campaign catalog to the subset eligible for the
//! current visitor, session, and page.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use popup_core::store::CampaignStore;
use popup_core::types::{Campaign, VisitorSession};

/// Why a campaign was excluded from an evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExclusionReason {
    NotInAllowList,
    Blocked,
    DeviceMismatch,
    GeoMismatch,
    AlreadyShown,
    OracleUnavailable,
}

/// Applies the targeting filter chain, in order, short-circuiting on the
/// first failing predicate per campaign.
#[derive(Debug, Clone, Default)]
pub struct CampaignSelector {
    /// Non-empty means only these campaign ids may be considered.
    allow_list: Vec<Uuid>,
    block_list: Vec<Uuid>,
}

impl CampaignSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allow_list(mut self, allow: Vec<Uuid>) -> Self {
        self.allow_list = allow;
        self
    }

    pub fn with_block_list(mut self, block: Vec<Uuid>) -> Self {
        self.block_list = block;
        self
    }

    /// Whether one campaign passes every predicate for this session.
    /// Returns the first failing predicate otherwise.
    pub fn check(
        &self,
        campaign: &Campaign,
        session: &VisitorSession,
        store: &Arc<dyn CampaignStore>,
    ) -> Result<(), ExclusionReason> {
        if !self.allow_list.is_empty() && !self.allow_list.contains(&campaign.id) {
            return Err(ExclusionReason::NotInAllowList);
        }
        if self.block_list.contains(&campaign.id) {
            return Err(ExclusionReason::Blocked);
        }
        if !campaign.device_targeting.matches(session.device.kind) {
            return Err(ExclusionReason::DeviceMismatch);
        }

        // Geo targeting is enforced only when geography is known; an
        // unresolved lookup passes through rather than excluding.
        if let (Some(countries), Some(geo)) = (&campaign.geo_targeting.countries, &session.geo) {
            if !countries.is_empty()
                && !countries.iter().any(|c| c.eq_ignore_ascii_case(&geo.country))
            {
                return Err(ExclusionReason::GeoMismatch);
            }
        }

        match store.should_show_popup(
            &session.visitor_id,
            &session.session_id,
            &campaign.id,
            &session.current_url,
        ) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ExclusionReason::AlreadyShown),
            Err(err) => {
                warn!(
                    campaign_id = %campaign.id,
                    error = %err,
                    "Dedup oracle unavailable, skipping campaign"
                );
                Err(ExclusionReason::OracleUnavailable)
            }
        }
    }

    /// First-wins policy: at most one popup is live at a time, so only the
    /// first eligible campaign proceeds to allocation.
    pub fn first_eligible(
        &self,
        campaigns: &[Campaign],
        session: &VisitorSession,
        store: &Arc<dyn CampaignStore>,
    ) -> Option<Campaign> {
        campaigns
            .iter()
            .find(|campaign| match self.check(campaign, session, store) {
                Ok(()) => true,
                Err(reason) => {
                    debug!(campaign_id = %campaign.id, ?reason, "Campaign excluded");
                    false
                }
            })
            .cloned()
    }
}
