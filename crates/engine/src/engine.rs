//! The per-session trigger engine — registration lifecycle, event
//! dispatch, and resource teardown.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use popup_core::config::TriggerConfig;
use popup_core::error::PopupResult;
use popup_core::types::{TriggerRule, Variation, VisitorSession};

use crate::evaluator::{EvalOutcome, TriggerEvaluator};
use crate::events::{SessionEvent, SessionEventSource, SignalKind};
use crate::registration::{TriggerCallback, TriggerRegistration};
use crate::rules;

/// Owns one `VisitorSession` exclusively and every trigger registration
/// armed for it. One instance per browsing session; instances never share
/// state, so concurrent tabs cannot interfere.
pub struct PopupTriggerEngine {
    session: VisitorSession,
    source: Arc<dyn SessionEventSource>,
    evaluator: TriggerEvaluator,
    registrations: HashMap<String, TriggerRegistration>,
}

impl std::fmt::Debug for PopupTriggerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PopupTriggerEngine")
            .field("visitor_id", &self.session.visitor_id)
            .field("registrations", &self.registrations.len())
            .finish()
    }
}

impl PopupTriggerEngine {
    pub fn new(session: VisitorSession, source: Arc<dyn SessionEventSource>) -> Self {
        Self {
            session,
            source,
            evaluator: TriggerEvaluator::new(),
            registrations: HashMap::new(),
        }
    }

    /// Applies configured rule defaults (exit-intent sensitivity).
    pub fn with_trigger_config(mut self, triggers: TriggerConfig) -> Self {
        self.evaluator = TriggerEvaluator::with_config(triggers);
        self
    }

    pub fn session(&self) -> &VisitorSession {
        &self.session
    }

    /// Number of live (armed, unfired) registrations.
    pub fn live_registrations(&self) -> usize {
        self.registrations.len()
    }

    /// Synchronous fast-path check: evaluates the variation's rules once
    /// against current state only. No timers or listeners are armed. A
    /// matcher fault reads as "not showable".
    pub fn should_show_variation(&self, variation: &Variation) -> bool {
        match self
            .evaluator
            .evaluate_now(&variation.trigger_rules, &self.session, Utc::now())
        {
            Ok(satisfied) => satisfied,
            Err(err) => {
                warn!(
                    variation_id = %variation.id,
                    error = %err,
                    "Variation rules could not be evaluated"
                );
                false
            }
        }
    }

    /// Arms a rule set for later asynchronous satisfaction. Idempotent per
    /// id: re-registering replaces the prior registration, revoking its
    /// armed resources first. Rule sets already satisfied at registration
    /// time fire immediately and arm nothing.
    pub fn register_trigger(
        &mut self,
        id: impl Into<String>,
        rules: Vec<TriggerRule>,
        callback: TriggerCallback,
    ) -> PopupResult<()> {
        let id = id.into();
        if let Some(old) = self.registrations.remove(&id) {
            info!(registration_id = %id, "Replacing existing trigger registration");
            self.release(&old);
        }

        for rule in &rules {
            rules::validate(rule)?;
        }

        let now = Utc::now();
        let mut registration = TriggerRegistration::new(id.clone(), rules, callback);

        // Immediate pass: state-satisfiable rules may already hold.
        if self.evaluator.refresh(&mut registration, &self.session, now)? == EvalOutcome::Fired {
            info!(registration_id = %id, "Trigger satisfied at registration time");
            return Ok(());
        }

        // Arm only what the still-unsatisfied rules need.
        let mut signals: HashSet<SignalKind> = HashSet::new();
        let rule_list = registration.rules.clone();
        for (idx, rule) in rule_list.iter().enumerate() {
            if registration.is_satisfied(idx) {
                continue;
            }
            if let Some(delay) = rules::timer_delay(rule, &self.session, now) {
                let timer = self.source.arm_timer(&id, delay);
                registration.own_timer(timer, idx);
            }
            signals.extend(rules::required_signals(rule));
        }
        for signal in signals {
            let subscription = self.source.subscribe(&id, signal);
            registration.own_subscription(subscription);
        }

        info!(
            registration_id = %id,
            rules = registration.rules.len(),
            "Trigger registered"
        );
        self.registrations.insert(id, registration);
        Ok(())
    }

    /// Records an in-app navigation and re-evaluates live registrations.
    pub fn update_page_view(&mut self, url: impl Into<String>) {
        self.handle_event(SessionEvent::PageView { url: url.into() });
    }

    /// Attaches resolved geography and re-evaluates live registrations.
    pub fn resolve_geo(&mut self, geo: popup_core::types::GeoInfo) {
        self.handle_event(SessionEvent::GeoResolved { geo });
    }

    /// Dispatches one ambient event to every live registration. A matcher
    /// fault tears down only the faulting registration; the rest continue.
    pub fn handle_event(&mut self, event: SessionEvent) {
        match &event {
            SessionEvent::PageView { url } => self.session.record_page_view(url.clone()),
            SessionEvent::GeoResolved { geo } => self.session.resolve_geo(geo.clone()),
            _ => {}
        }

        let now = Utc::now();
        let mut done: Vec<String> = Vec::new();
        for (id, registration) in self.registrations.iter_mut() {
            match self
                .evaluator
                .apply_event(registration, &event, &self.session, now)
            {
                Ok(EvalOutcome::Fired) => done.push(id.clone()),
                Ok(EvalOutcome::Pending) => {}
                Err(err) => {
                    warn!(registration_id = %id, error = %err, "Trigger registration faulted");
                    done.push(id.clone());
                }
            }
        }

        for id in done {
            if let Some(registration) = self.registrations.remove(&id) {
                self.release(&registration);
            }
        }
    }

    /// Tears down every live registration's armed resources. Safe to call
    /// repeatedly; the second call is a no-op.
    pub fn cleanup(&mut self) {
        if self.registrations.is_empty() {
            return;
        }
        info!(
            registrations = self.registrations.len(),
            "Cleaning up trigger engine"
        );
        let registrations: Vec<TriggerRegistration> =
            self.registrations.drain().map(|(_, r)| r).collect();
        for registration in &registrations {
            self.release(registration);
        }
    }

    fn release(&self, registration: &TriggerRegistration) {
        for subscription in registration.subscriptions() {
            self.source.revoke(*subscription);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ManualEventSource;
    use popup_core::types::{DeviceInfo, DeviceKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    fn session(kind: DeviceKind) -> VisitorSession {
        VisitorSession::new(
            "vis_1",
            "ses_1",
            "https://academy.example.com/",
            DeviceInfo {
                kind,
                os: "Linux".into(),
                browser: "Firefox".into(),
                screen_width: 1920,
                screen_height: 1080,
            },
        )
    }

    fn make_engine(kind: DeviceKind) -> (PopupTriggerEngine, Arc<ManualEventSource>) {
        let source = Arc::new(ManualEventSource::new());
        let engine = PopupTriggerEngine::new(session(kind), source.clone());
        (engine, source)
    }

    fn counting_callback() -> (TriggerCallback, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let inner = count.clone();
        let cb: TriggerCallback = Box::new(move || {
            inner.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        (cb, count)
    }

    fn variation(rules: Vec<TriggerRule>) -> Variation {
        Variation {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            name: "A".into(),
            traffic_percentage: 100.0,
            is_control: false,
            trigger_rules: rules,
        }
    }

    #[test]
    fn test_should_show_variation_arms_nothing() {
        let (engine, source) = make_engine(DeviceKind::Desktop);
        let desktop_only = variation(vec![TriggerRule::DeviceType {
            kinds: vec![DeviceKind::Desktop],
        }]);
        assert!(engine.should_show_variation(&desktop_only));
        assert_eq!(source.armed_count(), 0);

        let (engine, source) = make_engine(DeviceKind::Mobile);
        assert!(!engine.should_show_variation(&desktop_only));
        assert_eq!(source.armed_count(), 0);
    }

    #[test]
    fn test_page_visit_count_fires_exactly_once_on_third_view() {
        let (mut engine, _source) = make_engine(DeviceKind::Desktop);
        let (cb, count) = counting_callback();
        engine
            .register_trigger("reg-1", vec![TriggerRule::PageVisitCount { count: 3 }], cb)
            .unwrap();

        engine.update_page_view("https://academy.example.com/a");
        engine.update_page_view("https://academy.example.com/b");
        assert_eq!(count.load(Ordering::SeqCst), 0);

        engine.update_page_view("https://academy.example.com/c");
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(engine.live_registrations(), 0);

        engine.update_page_view("https://academy.example.com/d");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_time_delay_and_scroll_fire_in_either_order() {
        for scroll_first in [true, false] {
            let (mut engine, source) = make_engine(DeviceKind::Desktop);
            let (cb, count) = counting_callback();
            engine
                .register_trigger(
                    "reg-1",
                    vec![
                        TriggerRule::TimeDelay { ms: 5000 },
                        TriggerRule::ScrollPercentage { percentage: 50.0 },
                    ],
                    cb,
                )
                .unwrap();
            assert_eq!(source.armed_timer_count(), 1);

            let timer_event = source.elapse_timer("reg-1").expect("timer armed");
            let scroll_event = SessionEvent::Scroll { percent: 72.0 };

            if scroll_first {
                engine.handle_event(scroll_event.clone());
                assert_eq!(count.load(Ordering::SeqCst), 0);
                engine.handle_event(timer_event);
            } else {
                engine.handle_event(timer_event);
                assert_eq!(count.load(Ordering::SeqCst), 0);
                engine.handle_event(scroll_event);
            }

            assert_eq!(count.load(Ordering::SeqCst), 1);
            // Fired registrations release everything they armed.
            assert_eq!(source.armed_count(), 0);
        }
    }

    #[test]
    fn test_session_duration_already_elapsed_fires_at_registration() {
        let (mut engine, source) = make_engine(DeviceKind::Desktop);
        engine.session.started_at = Utc::now() - chrono::Duration::milliseconds(10_000);

        let (cb, count) = counting_callback();
        engine
            .register_trigger("reg-1", vec![TriggerRule::SessionDuration { ms: 5000 }], cb)
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(engine.live_registrations(), 0);
        assert_eq!(source.armed_count(), 0);
    }

    #[test]
    fn test_reregistering_replaces_and_revokes() {
        let (mut engine, source) = make_engine(DeviceKind::Desktop);
        let (cb1, count1) = counting_callback();
        engine
            .register_trigger("reg-1", vec![TriggerRule::TimeDelay { ms: 5000 }], cb1)
            .unwrap();
        assert_eq!(source.armed_timer_count(), 1);
        let stale_timer = source.elapse_timer("reg-1").expect("timer armed");

        let (cb2, count2) = counting_callback();
        engine
            .register_trigger("reg-1", vec![TriggerRule::TimeDelay { ms: 9000 }], cb2)
            .unwrap();
        // Old timer revoked, one fresh timer armed.
        assert_eq!(source.armed_timer_count(), 1);
        assert_eq!(engine.live_registrations(), 1);

        // The stale timer handle no longer satisfies anything.
        engine.handle_event(stale_timer);
        assert_eq!(count1.load(Ordering::SeqCst), 0);
        assert_eq!(count2.load(Ordering::SeqCst), 0);

        let fresh = source.elapse_timer("reg-1").expect("fresh timer armed");
        engine.handle_event(fresh);
        assert_eq!(count1.load(Ordering::SeqCst), 0);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_satisfied_page_rule_latches_across_navigation() {
        let (mut engine, source) = make_engine(DeviceKind::Desktop);
        let (cb, count) = counting_callback();
        engine
            .register_trigger(
                "reg-1",
                vec![
                    TriggerRule::SpecificPage {
                        urls: vec!["/pricing".into()],
                    },
                    TriggerRule::TimeDelay { ms: 5000 },
                ],
                cb,
            )
            .unwrap();

        // Visiting the page satisfies the rule and the flag stays set
        // after navigating away.
        engine.update_page_view("https://academy.example.com/pricing");
        engine.update_page_view("https://academy.example.com/about");
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let timer = source.elapse_timer("reg-1").expect("timer armed");
        engine.handle_event(timer);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cleanup_twice_is_noop() {
        let (mut engine, source) = make_engine(DeviceKind::Desktop);
        let (cb, _count) = counting_callback();
        engine
            .register_trigger(
                "reg-1",
                vec![
                    TriggerRule::TimeDelay { ms: 5000 },
                    TriggerRule::ScrollPercentage { percentage: 25.0 },
                ],
                cb,
            )
            .unwrap();
        assert!(source.armed_count() > 0);

        engine.cleanup();
        assert_eq!(source.armed_count(), 0);
        assert_eq!(engine.live_registrations(), 0);

        engine.cleanup();
        assert_eq!(source.armed_count(), 0);
    }

    #[test]
    fn test_faulting_registration_does_not_stop_others() {
        let (mut engine, _source) = make_engine(DeviceKind::Desktop);

        // Valid at registration time, faults when geo resolves against a
        // malformed rule snuck in through a config edit.
        let (cb_ok, count_ok) = counting_callback();
        engine
            .register_trigger("good", vec![TriggerRule::PageVisitCount { count: 2 }], cb_ok)
            .unwrap();

        // Registration rejected up front: malformed rule never arms.
        let (cb_bad, count_bad) = counting_callback();
        let result = engine.register_trigger(
            "bad",
            vec![TriggerRule::ScrollPercentage { percentage: 500.0 }],
            cb_bad,
        );
        assert!(result.is_err());
        assert_eq!(engine.live_registrations(), 1);

        engine.update_page_view("https://academy.example.com/a");
        engine.update_page_view("https://academy.example.com/b");
        assert_eq!(count_ok.load(Ordering::SeqCst), 1);
        assert_eq!(count_bad.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_callback_error_still_releases_resources() {
        let (mut engine, source) = make_engine(DeviceKind::Desktop);
        let cb: TriggerCallback = Box::new(|| Err(anyhow::anyhow!("render failed")));
        engine
            .register_trigger("reg-1", vec![TriggerRule::ScrollPercentage { percentage: 10.0 }], cb)
            .unwrap();
        assert!(source.armed_count() > 0);

        engine.handle_event(SessionEvent::Scroll { percent: 50.0 });
        assert_eq!(engine.live_registrations(), 0);
        assert_eq!(source.armed_count(), 0);
    }

    #[test]
    fn test_geo_resolution_satisfies_geo_rule() {
        let (mut engine, _source) = make_engine(DeviceKind::Desktop);
        let (cb, count) = counting_callback();
        engine
            .register_trigger(
                "reg-1",
                vec![TriggerRule::GeographicLocation {
                    countries: vec!["CA".into()],
                    regions: vec![],
                }],
                cb,
            )
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);

        engine.resolve_geo(popup_core::types::GeoInfo {
            country: "CA".into(),
            region: Some("ON".into()),
            city: Some("Toronto".into()),
            timezone: Some("America/Toronto".into()),
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
