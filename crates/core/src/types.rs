//! Core domain types — visitor sessions, campaigns, variations, trigger
//! rules, consent records, and display/interaction payloads.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Device class of the visitor's browser.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    Desktop,
    Mobile,
    Tablet,
}

/// Device and browser facts captured at session start.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub kind: DeviceKind,
    pub os: String,
    pub browser: String,
    pub screen_width: u32,
    pub screen_height: u32,
}

/// Resolved geography for a visitor. Arrives asynchronously, if at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoInfo {
    pub country: String,
    pub region: Option<String>,
    pub city: Option<String>,
    pub timezone: Option<String>,
}

/// Identity and behavioral state for one browsing session. Owned
/// exclusively by a single trigger engine instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitorSession {
    /// Stable id, persisted across sessions by the host.
    pub visitor_id: String,
    /// Ephemeral id, one per browsing session.
    pub session_id: String,
    pub started_at: DateTime<Utc>,
    /// Number of recorded page views. Starts at zero; the host records
    /// every navigation, the landing view included.
    pub page_view_count: u32,
    pub current_url: String,
    pub referrer_url: Option<String>,
    pub device: DeviceInfo,
    pub geo: Option<GeoInfo>,
    /// Whether the visitor id was already known to the host before
    /// this session began.
    pub is_returning: bool,
}

impl VisitorSession {
    pub fn new(
        visitor_id: impl Into<String>,
        session_id: impl Into<String>,
        current_url: impl Into<String>,
        device: DeviceInfo,
    ) -> Self {
        Self {
            visitor_id: visitor_id.into(),
            session_id: session_id.into(),
            started_at: Utc::now(),
            page_view_count: 0,
            current_url: current_url.into(),
            referrer_url: None,
            device,
            geo: None,
            is_returning: false,
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer_url = Some(referrer.into());
        self
    }

    pub fn with_returning(mut self, returning: bool) -> Self {
        self.is_returning = returning;
        self
    }

    /// Records an in-app navigation.
    pub fn record_page_view(&mut self, url: impl Into<String>) {
        self.page_view_count += 1;
        self.current_url = url.into();
    }

    /// Attaches resolved geography.
    pub fn resolve_geo(&mut self, geo: GeoInfo) {
        self.geo = Some(geo);
    }

    /// Milliseconds elapsed since the session started, saturating at zero
    /// for clock skew.
    pub fn elapsed_ms(&self, now: DateTime<Utc>) -> u64 {
        now.signed_duration_since(self.started_at)
            .num_milliseconds()
            .max(0) as u64
    }
}

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Draft,
    Active,
    Paused,
    Archived,
}

/// Which device classes a campaign targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "kinds")]
pub enum DeviceTargeting {
    All,
    Only(Vec<DeviceKind>),
}

impl DeviceTargeting {
    pub fn matches(&self, kind: DeviceKind) -> bool {
        match self {
            DeviceTargeting::All => true,
            DeviceTargeting::Only(kinds) => kinds.contains(&kind),
        }
    }
}

/// Geographic targeting constraints. Empty/absent lists do not constrain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GeoTargeting {
    pub countries: Option<Vec<String>>,
    pub regions: Option<Vec<String>>,
    pub cities: Option<Vec<String>>,
}

/// An immutable campaign snapshot fetched from the campaign store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub status: CampaignStatus,
    pub device_targeting: DeviceTargeting,
    pub geo_targeting: GeoTargeting,
}

/// One A/B-tested presentation of a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variation {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub name: String,
    /// Share of traffic, 0-100. The allocator normalizes, so sums other
    /// than 100 are tolerated.
    pub traffic_percentage: f64,
    pub is_control: bool,
    pub trigger_rules: Vec<TriggerRule>,
}

/// A condition that must hold before a variation may be shown.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum TriggerRule {
    TimeDelay {
        ms: u64,
    },
    ScrollPercentage {
        percentage: f64,
    },
    ExitIntent {
        /// 0-100; higher fires on gentler pointer exits. Omitted means the
        /// configured default applies.
        #[serde(default)]
        sensitivity: Option<u8>,
    },
    PageVisitCount {
        count: u32,
    },
    SessionDuration {
        ms: u64,
    },
    SpecificPage {
        /// Exact URLs, or path-prefix patterns ending in `*`.
        urls: Vec<String>,
    },
    ReferrerSource {
        domains: Vec<String>,
    },
    DeviceType {
        kinds: Vec<DeviceKind>,
    },
    ReturningVisitor,
    FirstTimeVisitor,
    GeographicLocation {
        countries: Vec<String>,
        #[serde(default)]
        regions: Vec<String>,
    },
}

/// What kind of consent a record covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentType {
    Marketing,
    Analytics,
    Functional,
    All,
}

impl ConsentType {
    /// Whether a grant of this type covers marketing display.
    pub fn covers_marketing(&self) -> bool {
        matches!(self, ConsentType::Marketing | ConsentType::All)
    }
}

/// How consent was collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsentMethod {
    Banner,
    Preferences,
    Api,
    Implied,
}

/// A persisted consent decision. Owned by the consent store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
    pub visitor_id: String,
    pub session_id: String,
    pub consent_type: ConsentType,
    pub granted: bool,
    pub method: ConsentMethod,
    pub timestamp: DateTime<Utc>,
}

/// Payload recorded when a variation is displayed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisplayEvent {
    pub visitor_id: String,
    pub session_id: String,
    pub campaign_id: Uuid,
    pub variation_id: Uuid,
    pub page_url: String,
    pub timestamp: DateTime<Utc>,
}

/// Visitor interactions with a displayed popup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Displayed,
    Clicked,
    Dismissed,
    Converted,
    Closed,
}

/// A lead captured through a popup form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeadSubmission {
    pub display_id: Uuid,
    pub campaign_id: Uuid,
    pub variation_id: Uuid,
    pub fields: HashMap<String, serde_json::Value>,
    pub marketing_consent: bool,
}

/// The single live popup slot. At most one per host page.
#[derive(Debug, Clone)]
pub struct ActivePopup {
    pub campaign: Campaign,
    pub variation: Variation,
    pub display_id: Uuid,
    pub shown_at: DateTime<Utc>,
}
