//! External collaborator contracts — campaign catalog, display/lead
//! tracking, and consent persistence.
//!
//! The engine only ever sees these traits behind `Arc<dyn ...>`; the host
//! wires real backends. The in-memory implementations here back tests and
//! demos.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::Utc;
use dashmap::DashMap;
use tracing::info;
use uuid::Uuid;

use crate::error::PopupResult;
use crate::types::{
    Campaign, ConsentMethod, ConsentRecord, ConsentType, DisplayEvent, InteractionKind,
    LeadSubmission, Variation,
};

/// Campaign catalog and dedup oracle.
pub trait CampaignStore: Send + Sync {
    /// Fetch the current active-campaign catalog.
    fn active_campaigns(&self) -> PopupResult<Vec<Campaign>>;

    /// Fetch the variations of one campaign.
    fn campaign_variations(&self, campaign_id: &Uuid) -> PopupResult<Vec<Variation>>;

    /// Dedup/eligibility oracle: whether this campaign may still be shown
    /// to this visitor in this session under the campaign's repeat policy.
    fn should_show_popup(
        &self,
        visitor_id: &str,
        session_id: &str,
        campaign_id: &Uuid,
        page_url: &str,
    ) -> PopupResult<bool>;
}

/// Records displays, interactions, and captured leads.
pub trait DisplayTracker: Send + Sync {
    /// Records that a variation was shown; returns an opaque display id
    /// used to correlate later interaction and lead events.
    fn track_display(&self, event: DisplayEvent) -> PopupResult<Uuid>;

    fn track_interaction(
        &self,
        display_id: Uuid,
        kind: InteractionKind,
        metadata: serde_json::Value,
    ) -> PopupResult<()>;

    fn submit_lead(&self, lead: LeadSubmission) -> PopupResult<()>;
}

/// Consent record persistence.
pub trait ConsentStore: Send + Sync {
    /// The most recent consent record covering marketing for this visitor.
    fn marketing_consent(&self, visitor_id: &str) -> PopupResult<Option<ConsentRecord>>;

    fn grant_consent(
        &self,
        visitor_id: &str,
        session_id: &str,
        consent_type: ConsentType,
        granted: bool,
        method: ConsentMethod,
    ) -> PopupResult<ConsentRecord>;
}

/// In-memory campaign store for tests and demos. Dedup policy:
/// once per campaign per session.
#[derive(Default)]
pub struct InMemoryCampaignStore {
    campaigns: DashMap<Uuid, Campaign>,
    variations: DashMap<Uuid, Vec<Variation>>,
    shown: DashMap<(String, Uuid), u32>,
    catalog_fetches: AtomicU64,
}

impl InMemoryCampaignStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_campaign(&self, campaign: Campaign, variations: Vec<Variation>) {
        self.variations.insert(campaign.id, variations);
        self.campaigns.insert(campaign.id, campaign);
    }

    /// Marks a campaign as shown in a session, consumed by the dedup check.
    pub fn record_shown(&self, session_id: &str, campaign_id: &Uuid) {
        *self
            .shown
            .entry((session_id.to_string(), *campaign_id))
            .or_insert(0) += 1;
    }

    /// Number of catalog fetches served, for asserting consent gating.
    pub fn catalog_fetch_count(&self) -> u64 {
        self.catalog_fetches.load(Ordering::Relaxed)
    }
}

impl CampaignStore for InMemoryCampaignStore {
    fn active_campaigns(&self) -> PopupResult<Vec<Campaign>> {
        self.catalog_fetches.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .campaigns
            .iter()
            .filter(|e| e.value().status == crate::types::CampaignStatus::Active)
            .map(|e| e.value().clone())
            .collect())
    }

    fn campaign_variations(&self, campaign_id: &Uuid) -> PopupResult<Vec<Variation>> {
        Ok(self
            .variations
            .get(campaign_id)
            .map(|v| v.value().clone())
            .unwrap_or_default())
    }

    fn should_show_popup(
        &self,
        _visitor_id: &str,
        session_id: &str,
        campaign_id: &Uuid,
        _page_url: &str,
    ) -> PopupResult<bool> {
        let count = self
            .shown
            .get(&(session_id.to_string(), *campaign_id))
            .map(|c| *c)
            .unwrap_or(0);
        Ok(count == 0)
    }
}

/// In-memory display/interaction/lead tracker for tests and demos.
#[derive(Default)]
pub struct InMemoryTracker {
    displays: DashMap<Uuid, DisplayEvent>,
    interactions: Mutex<Vec<(Uuid, InteractionKind, serde_json::Value)>>,
    leads: Mutex<Vec<LeadSubmission>>,
}

impl InMemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn display_count(&self) -> usize {
        self.displays.len()
    }

    pub fn interactions(&self) -> Vec<(Uuid, InteractionKind, serde_json::Value)> {
        self.interactions.lock().expect("tracker mutex poisoned").clone()
    }

    pub fn leads(&self) -> Vec<LeadSubmission> {
        self.leads.lock().expect("tracker mutex poisoned").clone()
    }
}

impl DisplayTracker for InMemoryTracker {
    fn track_display(&self, event: DisplayEvent) -> PopupResult<Uuid> {
        let display_id = Uuid::new_v4();
        info!(
            campaign_id = %event.campaign_id,
            variation_id = %event.variation_id,
            display_id = %display_id,
            "Display tracked"
        );
        self.displays.insert(display_id, event);
        Ok(display_id)
    }

    fn track_interaction(
        &self,
        display_id: Uuid,
        kind: InteractionKind,
        metadata: serde_json::Value,
    ) -> PopupResult<()> {
        self.interactions
            .lock()
            .expect("tracker mutex poisoned")
            .push((display_id, kind, metadata));
        Ok(())
    }

    fn submit_lead(&self, lead: LeadSubmission) -> PopupResult<()> {
        info!(display_id = %lead.display_id, "Lead submitted");
        self.leads.lock().expect("tracker mutex poisoned").push(lead);
        Ok(())
    }
}

/// In-memory consent store for tests and demos.
#[derive(Default)]
pub struct InMemoryConsentStore {
    records: DashMap<String, Vec<ConsentRecord>>,
}

impl InMemoryConsentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConsentStore for InMemoryConsentStore {
    fn marketing_consent(&self, visitor_id: &str) -> PopupResult<Option<ConsentRecord>> {
        Ok(self.records.get(visitor_id).and_then(|records| {
            records
                .iter()
                .rev()
                .find(|r| r.consent_type.covers_marketing())
                .cloned()
        }))
    }

    fn grant_consent(
        &self,
        visitor_id: &str,
        session_id: &str,
        consent_type: ConsentType,
        granted: bool,
        method: ConsentMethod,
    ) -> PopupResult<ConsentRecord> {
        let record = ConsentRecord {
            visitor_id: visitor_id.to_string(),
            session_id: session_id.to_string(),
            consent_type,
            granted,
            method,
            timestamp: Utc::now(),
        };
        info!(visitor_id, ?consent_type, granted, "Consent recorded");
        self.records
            .entry(visitor_id.to_string())
            .or_default()
            .push(record.clone());
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CampaignStatus, DeviceTargeting, GeoTargeting};

    fn campaign(status: CampaignStatus) -> Campaign {
        Campaign {
            id: Uuid::new_v4(),
            name: "Spring Sale".into(),
            status,
            device_targeting: DeviceTargeting::All,
            geo_targeting: GeoTargeting::default(),
        }
    }

    #[test]
    fn test_catalog_filters_inactive() {
        let store = InMemoryCampaignStore::new();
        store.insert_campaign(campaign(CampaignStatus::Active), vec![]);
        store.insert_campaign(campaign(CampaignStatus::Paused), vec![]);
        store.insert_campaign(campaign(CampaignStatus::Draft), vec![]);

        let active = store.active_campaigns().unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(store.catalog_fetch_count(), 1);
    }

    #[test]
    fn test_dedup_once_per_session() {
        let store = InMemoryCampaignStore::new();
        let camp = campaign(CampaignStatus::Active);
        let id = camp.id;
        store.insert_campaign(camp, vec![]);

        assert!(store.should_show_popup("vis_1", "ses_1", &id, "/").unwrap());
        store.record_shown("ses_1", &id);
        assert!(!store.should_show_popup("vis_1", "ses_1", &id, "/").unwrap());
        // A fresh session is eligible again.
        assert!(store.should_show_popup("vis_1", "ses_2", &id, "/").unwrap());
    }

    #[test]
    fn test_latest_marketing_consent_wins() {
        let store = InMemoryConsentStore::new();
        store
            .grant_consent("vis_1", "ses_1", ConsentType::Marketing, false, ConsentMethod::Banner)
            .unwrap();
        store
            .grant_consent("vis_1", "ses_1", ConsentType::Marketing, true, ConsentMethod::Preferences)
            .unwrap();
        store
            .grant_consent("vis_1", "ses_1", ConsentType::Analytics, false, ConsentMethod::Banner)
            .unwrap();

        let record = store.marketing_consent("vis_1").unwrap().unwrap();
        assert!(record.granted);
        assert_eq!(record.method, ConsentMethod::Preferences);
    }
}
