//! One evaluation surface per visitor session: decides whether, when, and
//! which popup variation to surface, and records everything that happens
//! to it afterwards.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use popup_core::config::EngineConfig;
use popup_core::error::{PopupError, PopupResult};
use popup_core::event_bus::{make_event, noop_sink, EventSink, EventType};
use popup_core::store::{CampaignStore, ConsentStore, DisplayTracker};
use popup_core::types::{
    ActivePopup, Campaign, ConsentMethod, ConsentType, DisplayEvent, InteractionKind,
    LeadSubmission, Variation, VisitorSession,
};
use popup_engine::{PopupTriggerEngine, SessionEvent, SessionEventSource};
use popup_selection::{CampaignSelector, ConsentDecision, ConsentGate, VariantAllocator};

/// Result of one `evaluate_popups` pass.
#[derive(Debug, Clone)]
pub enum EvaluationOutcome {
    /// A variation's rules were already satisfied; the popup is live.
    Shown(ActivePopup),
    /// A variation was selected and its trigger rules armed for later.
    Deferred {
        campaign_id: Uuid,
        variation_id: Uuid,
    },
    /// Consent gating stopped the pass before any campaign fetch.
    ConsentBlocked,
    /// Nothing eligible this pass.
    NoneEligible,
    /// A popup is already live; later campaigns wait for dismissal.
    SlotOccupied,
}

struct PendingDisplay {
    campaign: Campaign,
    variation: Variation,
}

/// Owns the full decision pipeline for one visitor session. One
/// orchestrator per session; multiple tabs get independent instances.
pub struct PopupOrchestrator {
    engine: PopupTriggerEngine,
    selector: CampaignSelector,
    allocator: VariantAllocator,
    gate: ConsentGate,
    campaigns: Arc<dyn CampaignStore>,
    tracker: Arc<dyn DisplayTracker>,
    consents: Arc<dyn ConsentStore>,
    event_sink: Arc<dyn EventSink>,
    active: Arc<Mutex<Option<ActivePopup>>>,
    pending: Arc<Mutex<Option<PendingDisplay>>>,
}

impl PopupOrchestrator {
    pub fn new(
        session: VisitorSession,
        source: Arc<dyn SessionEventSource>,
        campaigns: Arc<dyn CampaignStore>,
        tracker: Arc<dyn DisplayTracker>,
        consents: Arc<dyn ConsentStore>,
    ) -> Self {
        let config = EngineConfig::default();
        Self {
            engine: PopupTriggerEngine::new(session, source),
            selector: CampaignSelector::new(),
            allocator: VariantAllocator::new(),
            gate: ConsentGate::new(config.consent),
            campaigns,
            tracker,
            consents,
            event_sink: noop_sink(),
            active: Arc::new(Mutex::new(None)),
            pending: Arc::new(Mutex::new(None)),
        }
    }

    /// Applies consent, selection, and trigger settings from
    /// configuration. Allow/block entries that are not campaign ids are
    /// ignored.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        let parse = |entries: &[String]| -> Vec<Uuid> {
            entries.iter().filter_map(|e| e.parse().ok()).collect()
        };
        self.selector = CampaignSelector::new()
            .with_allow_list(parse(&config.selection.allowed_campaigns))
            .with_block_list(parse(&config.selection.blocked_campaigns));
        self.gate = ConsentGate::new(config.consent);
        self.engine = self.engine.with_trigger_config(config.triggers);
        self
    }

    pub fn with_selector(mut self, selector: CampaignSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Attach an event sink for emitting analytics events.
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.event_sink = sink;
        self
    }

    pub fn session(&self) -> &VisitorSession {
        self.engine.session()
    }

    pub fn active_popup(&self) -> Option<ActivePopup> {
        self.active.lock().clone()
    }

    /// One full selection + allocation pass. Consent-gated; transient
    /// collaborator failures read as "nothing eligible" and are never
    /// visible to the end visitor.
    pub fn evaluate_popups(&mut self) -> EvaluationOutcome {
        if self.active.lock().is_some() {
            return EvaluationOutcome::SlotOccupied;
        }

        if self.gate.decision(self.engine.session(), &self.consents) != ConsentDecision::Allowed {
            self.event_sink.emit(make_event(
                EventType::EvaluationDeferred,
                self.engine.session().visitor_id.clone(),
                None,
                None,
            ));
            return EvaluationOutcome::ConsentBlocked;
        }

        let catalog = match self.campaigns.active_campaigns() {
            Ok(catalog) => catalog,
            Err(err) => {
                warn!(error = %err, "Campaign catalog unavailable this pass");
                return EvaluationOutcome::NoneEligible;
            }
        };

        let campaign =
            match self
                .selector
                .first_eligible(&catalog, self.engine.session(), &self.campaigns)
            {
                Some(campaign) => campaign,
                None => return EvaluationOutcome::NoneEligible,
            };

        let variations = match self.campaigns.campaign_variations(&campaign.id) {
            Ok(variations) => variations,
            Err(err) => {
                warn!(campaign_id = %campaign.id, error = %err, "Variations unavailable");
                return EvaluationOutcome::NoneEligible;
            }
        };

        let variation = match self.allocator.allocate(&variations) {
            Some(variation) => variation.clone(),
            None => return EvaluationOutcome::NoneEligible,
        };

        info!(
            campaign_id = %campaign.id,
            variation_id = %variation.id,
            is_control = variation.is_control,
            "Variation allocated"
        );

        if self.engine.should_show_variation(&variation) {
            return match self.display(campaign, variation) {
                Some(active) => EvaluationOutcome::Shown(active),
                None => EvaluationOutcome::NoneEligible,
            };
        }

        let campaign_id = campaign.id;
        let variation_id = variation.id;
        let pending = self.pending.clone();
        let deferred = PendingDisplay {
            campaign,
            variation: variation.clone(),
        };
        let registered = self.engine.register_trigger(
            variation_id.to_string(),
            variation.trigger_rules.clone(),
            Box::new(move || {
                let mut slot = pending.lock();
                if slot.is_none() {
                    *slot = Some(PendingDisplay {
                        campaign: deferred.campaign.clone(),
                        variation: deferred.variation.clone(),
                    });
                }
                Ok(())
            }),
        );
        if let Err(err) = registered {
            warn!(variation_id = %variation_id, error = %err, "Trigger registration rejected");
            return EvaluationOutcome::NoneEligible;
        }

        self.event_sink.emit(make_event(
            EventType::EvaluationDeferred,
            self.engine.session().visitor_id.clone(),
            Some(campaign_id),
            Some(variation_id),
        ));
        EvaluationOutcome::Deferred {
            campaign_id,
            variation_id,
        }
    }

    /// Records an in-app navigation. Returns a popup newly shown by a
    /// deferred trigger, if any.
    pub fn update_page_view(&mut self, url: impl Into<String>) -> Option<ActivePopup> {
        self.engine.update_page_view(url);
        self.finalize_pending()
    }

    /// Feeds one ambient event through the engine. Returns a popup newly
    /// shown by a deferred trigger, if any.
    pub fn handle_event(&mut self, event: SessionEvent) -> Option<ActivePopup> {
        self.engine.handle_event(event);
        self.finalize_pending()
    }

    /// Persists a consent grant and, when granted, restarts evaluation
    /// from scratch with a fresh catalog fetch.
    pub fn on_consent_change(
        &mut self,
        granted: bool,
        method: ConsentMethod,
    ) -> PopupResult<EvaluationOutcome> {
        let session = self.engine.session();
        self.consents.grant_consent(
            &session.visitor_id,
            &session.session_id,
            ConsentType::Marketing,
            granted,
            method,
        )?;
        let event_type = if granted {
            EventType::ConsentGranted
        } else {
            EventType::ConsentDeclined
        };
        self.event_sink.emit(make_event(
            event_type,
            self.engine.session().visitor_id.clone(),
            None,
            None,
        ));

        if !granted {
            return Ok(EvaluationOutcome::ConsentBlocked);
        }
        Ok(self.evaluate_popups())
    }

    /// Records a visitor interaction with the live popup. `Closed` and
    /// `Dismissed` free the slot so later campaigns can be evaluated, and
    /// return a queued deferred display if one surfaced.
    pub fn record_interaction(
        &mut self,
        kind: InteractionKind,
        metadata: serde_json::Value,
    ) -> PopupResult<Option<ActivePopup>> {
        let active = self
            .active
            .lock()
            .clone()
            .ok_or_else(|| PopupError::Tracking("no popup is currently displayed".into()))?;

        self.tracker
            .track_interaction(active.display_id, kind, metadata)?;

        let event_type = match kind {
            InteractionKind::Displayed => EventType::PopupDisplayed,
            InteractionKind::Clicked => EventType::PopupClicked,
            InteractionKind::Dismissed => EventType::PopupDismissed,
            InteractionKind::Converted => EventType::PopupConverted,
            InteractionKind::Closed => EventType::PopupClosed,
        };
        self.event_sink.emit(make_event(
            event_type,
            self.engine.session().visitor_id.clone(),
            Some(active.campaign.id),
            Some(active.variation.id),
        ));

        if matches!(kind, InteractionKind::Closed | InteractionKind::Dismissed) {
            *self.active.lock() = None;
            return Ok(self.finalize_pending());
        }
        Ok(None)
    }

    /// Submits a captured lead against the live popup.
    pub fn submit_lead(
        &self,
        fields: std::collections::HashMap<String, serde_json::Value>,
        marketing_consent: bool,
    ) -> PopupResult<()> {
        let active = self
            .active
            .lock()
            .clone()
            .ok_or_else(|| PopupError::Tracking("no popup is currently displayed".into()))?;

        self.tracker.submit_lead(LeadSubmission {
            display_id: active.display_id,
            campaign_id: active.campaign.id,
            variation_id: active.variation.id,
            fields,
            marketing_consent,
        })?;
        self.event_sink.emit(make_event(
            EventType::LeadCaptured,
            self.engine.session().visitor_id.clone(),
            Some(active.campaign.id),
            Some(active.variation.id),
        ));
        Ok(())
    }

    /// Tears down every armed trigger resource and clears the live slot.
    /// Idempotent; safe on both popup close and host unmount.
    pub fn cleanup(&mut self) {
        self.engine.cleanup();
        *self.pending.lock() = None;
        *self.active.lock() = None;
    }

    /// Claims a display queued by a deferred trigger callback. The slot
    /// stays queued while another popup is live.
    fn finalize_pending(&mut self) -> Option<ActivePopup> {
        if self.active.lock().is_some() {
            return None;
        }
        let queued = self.pending.lock().take()?;
        self.display(queued.campaign, queued.variation)
    }

    /// Tracks the display and fills the live slot. A tracking failure
    /// means no popup this pass, keeping dedup state consistent.
    fn display(&mut self, campaign: Campaign, variation: Variation) -> Option<ActivePopup> {
        let session = self.engine.session();
        let event = DisplayEvent {
            visitor_id: session.visitor_id.clone(),
            session_id: session.session_id.clone(),
            campaign_id: campaign.id,
            variation_id: variation.id,
            page_url: session.current_url.clone(),
            timestamp: Utc::now(),
        };
        let display_id = match self.tracker.track_display(event) {
            Ok(display_id) => display_id,
            Err(err) => {
                warn!(campaign_id = %campaign.id, error = %err, "Display tracking failed");
                return None;
            }
        };

        self.event_sink.emit(make_event(
            EventType::PopupDisplayed,
            self.engine.session().visitor_id.clone(),
            Some(campaign.id),
            Some(variation.id),
        ));

        let active = ActivePopup {
            campaign,
            variation,
            display_id,
            shown_at: Utc::now(),
        };
        *self.active.lock() = Some(active.clone());
        Some(active)
    }
}

impl std::fmt::Debug for PopupOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopupOrchestrator")
            .field("visitor_id", &self.engine.session().visitor_id)
            .field("active", &self.active.lock().is_some())
            .finish()
    }
}
