//! Applies session state and ambient events to trigger registrations,
//! firing each at most once.

use chrono::{DateTime, Utc};
use tracing::debug;

use popup_core::config::TriggerConfig;
use popup_core::error::PopupResult;
use popup_core::types::{TriggerRule, VisitorSession};

use crate::events::SessionEvent;
use crate::registration::TriggerRegistration;
use crate::rules;

/// Result of applying an event or a state re-check to one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalOutcome {
    /// Some rules remain unsatisfied.
    Pending,
    /// Every rule was satisfied and the callback was invoked.
    Fired,
}

/// Evaluates trigger rule sets against live session state and ambient
/// events. All per-registration state lives in the registration itself;
/// the evaluator only carries configured rule defaults.
#[derive(Debug, Clone, Default)]
pub struct TriggerEvaluator {
    triggers: TriggerConfig,
}

impl TriggerEvaluator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(triggers: TriggerConfig) -> Self {
        Self { triggers }
    }

    /// One synchronous pass over a rule set against current state only.
    /// No resources are armed; event-driven rules simply read as
    /// unsatisfied. An empty rule set is trivially satisfied.
    pub fn evaluate_now(
        &self,
        rules: &[TriggerRule],
        session: &VisitorSession,
        now: DateTime<Utc>,
    ) -> PopupResult<bool> {
        for rule in rules {
            if !rules::satisfied_now(rule, session, now)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Re-checks every unsatisfied rule against current session state and
    /// fires if the whole set is now satisfied. Used at registration time
    /// and after session mutations (navigation, geo resolution).
    pub fn refresh(
        &self,
        registration: &mut TriggerRegistration,
        session: &VisitorSession,
        now: DateTime<Utc>,
    ) -> PopupResult<EvalOutcome> {
        if registration.fired() {
            return Ok(EvalOutcome::Fired);
        }
        let rules: Vec<(usize, TriggerRule)> = registration
            .rules
            .iter()
            .cloned()
            .enumerate()
            .filter(|(idx, _)| !registration.is_satisfied(*idx))
            .collect();
        for (idx, rule) in rules {
            if rules::satisfied_now(&rule, session, now)? {
                registration.mark_satisfied(idx);
            }
        }
        Ok(self.maybe_fire(registration))
    }

    /// Applies one ambient event to a registration.
    pub fn apply_event(
        &self,
        registration: &mut TriggerRegistration,
        event: &SessionEvent,
        session: &VisitorSession,
        now: DateTime<Utc>,
    ) -> PopupResult<EvalOutcome> {
        if registration.fired() {
            return Ok(EvalOutcome::Fired);
        }

        match event {
            SessionEvent::TimerElapsed {
                registration_id,
                timer_id,
            } => {
                if registration_id == &registration.id {
                    if let Some(idx) = registration.timer_rule(*timer_id) {
                        debug!(registration_id = %registration.id, rule = idx, "Timer rule satisfied");
                        registration.mark_satisfied(idx);
                    }
                }
                Ok(self.maybe_fire(registration))
            }
            SessionEvent::Scroll { percent } => {
                self.mark_matching(registration, |rule| rules::scroll_satisfies(rule, *percent));
                Ok(self.maybe_fire(registration))
            }
            SessionEvent::ExitIntent { velocity } => {
                let default_sensitivity = self.triggers.exit_intent_sensitivity;
                self.mark_matching(registration, |rule| {
                    rules::exit_intent_satisfies(rule, *velocity, default_sensitivity)
                });
                Ok(self.maybe_fire(registration))
            }
            // Navigation and geo resolution mutate the session before the
            // event is dispatched, so a state re-check covers them.
            SessionEvent::PageView { .. } | SessionEvent::GeoResolved { .. } => {
                self.refresh(registration, session, now)
            }
        }
    }

    fn mark_matching<F>(&self, registration: &mut TriggerRegistration, matches: F)
    where
        F: Fn(&TriggerRule) -> bool,
    {
        let hits: Vec<usize> = registration
            .rules
            .iter()
            .enumerate()
            .filter(|(idx, rule)| !registration.is_satisfied(*idx) && matches(rule))
            .map(|(idx, _)| idx)
            .collect();
        for idx in hits {
            registration.mark_satisfied(idx);
        }
    }

    fn maybe_fire(&self, registration: &mut TriggerRegistration) -> EvalOutcome {
        if registration.all_satisfied() && registration.fire() {
            EvalOutcome::Fired
        } else if registration.fired() {
            EvalOutcome::Fired
        } else {
            EvalOutcome::Pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionEventSource;
    use crate::registration::TriggerCallback;
    use popup_core::types::{DeviceInfo, DeviceKind};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn session() -> VisitorSession {
        VisitorSession::new(
            "vis_1",
            "ses_1",
            "https://academy.example.com/",
            DeviceInfo {
                kind: DeviceKind::Desktop,
                os: "Linux".into(),
                browser: "Firefox".into(),
                screen_width: 1920,
                screen_height: 1080,
            },
        )
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

    #[test]
    fn test_scroll_event_fires_single_rule() {
        let evaluator = TriggerEvaluator::new();
        let (cb, count) = counting_callback();
        let mut reg = TriggerRegistration::new(
            "reg-1",
            vec![TriggerRule::ScrollPercentage { percentage: 50.0 }],
            cb,
        );
        let s = session();
        let now = Utc::now();

        let outcome = evaluator
            .apply_event(&mut reg, &SessionEvent::Scroll { percent: 30.0 }, &s, now)
            .unwrap();
        assert_eq!(outcome, EvalOutcome::Pending);

        let outcome = evaluator
            .apply_event(&mut reg, &SessionEvent::Scroll { percent: 75.0 }, &s, now)
            .unwrap();
        assert_eq!(outcome, EvalOutcome::Fired);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Further scrolls do not re-fire.
        let outcome = evaluator
            .apply_event(&mut reg, &SessionEvent::Scroll { percent: 90.0 }, &s, now)
            .unwrap();
        assert_eq!(outcome, EvalOutcome::Fired);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_and_semantics_either_order() {
        let evaluator = TriggerEvaluator::new();
        let s = session();
        let now = Utc::now();

        for scroll_first in [true, false] {
            let (cb, count) = counting_callback();
            let mut reg = TriggerRegistration::new(
                "reg-1",
                vec![
                    TriggerRule::TimeDelay { ms: 5000 },
                    TriggerRule::ScrollPercentage { percentage: 50.0 },
                ],
                cb,
            );
            let timer_id = crate::events::ManualEventSource::new()
                .arm_timer("reg-1", std::time::Duration::from_millis(5000));
            reg.own_timer(timer_id, 0);

            let timer_event = SessionEvent::TimerElapsed {
                registration_id: "reg-1".into(),
                timer_id,
            };
            let scroll_event = SessionEvent::Scroll { percent: 60.0 };

            let (first, second) = if scroll_first {
                (&scroll_event, &timer_event)
            } else {
                (&timer_event, &scroll_event)
            };

            let outcome = evaluator.apply_event(&mut reg, first, &s, now).unwrap();
            assert_eq!(outcome, EvalOutcome::Pending);
            assert_eq!(count.load(Ordering::SeqCst), 0);

            let outcome = evaluator.apply_event(&mut reg, second, &s, now).unwrap();
            assert_eq!(outcome, EvalOutcome::Fired);
            assert_eq!(count.load(Ordering::SeqCst), 1);
        }
    }

    #[test]
    fn test_refresh_satisfies_state_rules_immediately() {
        let evaluator = TriggerEvaluator::new();
        let (cb, count) = counting_callback();
        let mut reg = TriggerRegistration::new(
            "reg-1",
            vec![TriggerRule::DeviceType {
                kinds: vec![DeviceKind::Desktop],
            }],
            cb,
        );

        let outcome = evaluator.refresh(&mut reg, &session(), Utc::now()).unwrap();
        assert_eq!(outcome, EvalOutcome::Fired);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_malformed_rule_is_an_error() {
        let evaluator = TriggerEvaluator::new();
        let (cb, count) = counting_callback();
        let mut reg = TriggerRegistration::new(
            "reg-1",
            vec![TriggerRule::PageVisitCount { count: 0 }],
            cb,
        );

        assert!(evaluator.refresh(&mut reg, &session(), Utc::now()).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_configured_exit_intent_default_applies() {
        let evaluator = TriggerEvaluator::with_config(TriggerConfig {
            exit_intent_sensitivity: 100,
        });
        let (cb, count) = counting_callback();
        let mut reg = TriggerRegistration::new(
            "reg-1",
            vec![TriggerRule::ExitIntent { sensitivity: None }],
            cb,
        );

        // Maximum sensitivity: even a slow pointer exit qualifies.
        let outcome = evaluator
            .apply_event(
                &mut reg,
                &SessionEvent::ExitIntent { velocity: 5.0 },
                &session(),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(outcome, EvalOutcome::Fired);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_for_other_registration_ignored() {
        let evaluator = TriggerEvaluator::new();
        let (cb, count) = counting_callback();
        let mut reg =
            TriggerRegistration::new("reg-1", vec![TriggerRule::TimeDelay { ms: 1000 }], cb);
        let source = crate::events::ManualEventSource::new();
        let timer_id = source.arm_timer("reg-1", std::time::Duration::from_millis(1000));
        reg.own_timer(timer_id, 0);

        let foreign = SessionEvent::TimerElapsed {
            registration_id: "reg-2".into(),
            timer_id,
        };
        let outcome = evaluator
            .apply_event(&mut reg, &foreign, &session(), Utc::now())
            .unwrap();
        assert_eq!(outcome, EvalOutcome::Pending);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
