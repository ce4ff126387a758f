//! Trigger rule matchers — stateless satisfaction checks and arming
//! requirements for each rule kind.

use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use popup_core::error::{PopupError, PopupResult};
use popup_core::types::{TriggerRule, VisitorSession};

use crate::events::SignalKind;

/// Rejects structurally malformed rule configs up front so a bad rule
/// tears down only its own registration.
pub fn validate(rule: &TriggerRule) -> PopupResult<()> {
    match rule {
        TriggerRule::ScrollPercentage { percentage } => {
            if !(*percentage > 0.0 && *percentage <= 100.0) {
                return Err(PopupError::Rule(format!(
                    "scroll_percentage out of range: {percentage}"
                )));
            }
        }
        TriggerRule::ExitIntent {
            sensitivity: Some(sensitivity),
        } => {
            if *sensitivity > 100 {
                return Err(PopupError::Rule(format!(
                    "exit_intent sensitivity out of range: {sensitivity}"
                )));
            }
        }
        TriggerRule::PageVisitCount { count } => {
            if *count == 0 {
                return Err(PopupError::Rule("page_visit_count requires count >= 1".into()));
            }
        }
        TriggerRule::SpecificPage { urls } => {
            if urls.is_empty() {
                return Err(PopupError::Rule("specific_page requires at least one url".into()));
            }
        }
        TriggerRule::ReferrerSource { domains } => {
            if domains.is_empty() {
                return Err(PopupError::Rule(
                    "referrer_source requires at least one domain".into(),
                ));
            }
        }
        TriggerRule::DeviceType { kinds } => {
            if kinds.is_empty() {
                return Err(PopupError::Rule("device_type requires at least one kind".into()));
            }
        }
        TriggerRule::GeographicLocation { countries, regions } => {
            if countries.is_empty() && regions.is_empty() {
                return Err(PopupError::Rule(
                    "geographic_location requires countries or regions".into(),
                ));
            }
        }
        TriggerRule::TimeDelay { .. }
        | TriggerRule::SessionDuration { .. }
        | TriggerRule::ExitIntent { sensitivity: None }
        | TriggerRule::ReturningVisitor
        | TriggerRule::FirstTimeVisitor => {}
    }
    Ok(())
}

/// Evaluates a rule against current session state only. Event-driven rules
/// (`time_delay`, `scroll_percentage`, `exit_intent`) are never satisfied
/// by a stateless check. Unknown geography is not satisfied, never an
/// error.
pub fn satisfied_now(
    rule: &TriggerRule,
    session: &VisitorSession,
    now: DateTime<Utc>,
) -> PopupResult<bool> {
    validate(rule)?;
    let satisfied = match rule {
        TriggerRule::TimeDelay { .. }
        | TriggerRule::ScrollPercentage { .. }
        | TriggerRule::ExitIntent { .. } => false,
        TriggerRule::PageVisitCount { count } => session.page_view_count >= *count,
        TriggerRule::SessionDuration { ms } => session.elapsed_ms(now) >= *ms,
        TriggerRule::SpecificPage { urls } => urls
            .iter()
            .any(|pattern| page_matches(&session.current_url, pattern)),
        TriggerRule::ReferrerSource { domains } => match &session.referrer_url {
            Some(referrer) => referrer_matches(referrer, domains),
            None => false,
        },
        TriggerRule::DeviceType { kinds } => kinds.contains(&session.device.kind),
        TriggerRule::ReturningVisitor => session.is_returning,
        TriggerRule::FirstTimeVisitor => !session.is_returning,
        TriggerRule::GeographicLocation { countries, regions } => match &session.geo {
            Some(geo) => {
                let country_ok = !countries.is_empty()
                    && countries.iter().any(|c| c.eq_ignore_ascii_case(&geo.country));
                let region_ok = !regions.is_empty()
                    && geo.region.as_ref().map_or(false, |r| {
                        regions.iter().any(|t| t.eq_ignore_ascii_case(r))
                    });
                country_ok || region_ok
            }
            None => false,
        },
    };
    Ok(satisfied)
}

/// The signal classes that must be subscribed for this rule to become
/// satisfiable after registration time.
pub fn required_signals(rule: &TriggerRule) -> Vec<SignalKind> {
    match rule {
        TriggerRule::ScrollPercentage { .. } => vec![SignalKind::Scroll],
        TriggerRule::ExitIntent { .. } => vec![SignalKind::ExitIntent],
        TriggerRule::PageVisitCount { .. } | TriggerRule::SpecificPage { .. } => {
            vec![SignalKind::PageView]
        }
        _ => Vec::new(),
    }
}

/// The one-shot timer this rule needs, if any. `session_duration` arms only
/// the remaining time; `None` means the rule is already satisfied or needs
/// no timer.
pub fn timer_delay(
    rule: &TriggerRule,
    session: &VisitorSession,
    now: DateTime<Utc>,
) -> Option<Duration> {
    match rule {
        TriggerRule::TimeDelay { ms } => Some(Duration::from_millis(*ms)),
        TriggerRule::SessionDuration { ms } => {
            let elapsed = session.elapsed_ms(now);
            if elapsed >= *ms {
                None
            } else {
                Some(Duration::from_millis(*ms - elapsed))
            }
        }
        _ => None,
    }
}

/// Whether a scroll to `percent` satisfies the rule.
pub fn scroll_satisfies(rule: &TriggerRule, percent: f64) -> bool {
    matches!(rule, TriggerRule::ScrollPercentage { percentage } if percent >= *percentage)
}

/// Whether an exit-intent event at the given upward velocity qualifies.
/// Higher sensitivity lowers the velocity bar; rules without an inline
/// sensitivity use the configured default.
pub fn exit_intent_satisfies(rule: &TriggerRule, velocity: f64, default_sensitivity: u8) -> bool {
    match rule {
        TriggerRule::ExitIntent { sensitivity } => {
            let sensitivity = sensitivity.unwrap_or(default_sensitivity).min(100);
            let threshold = f64::from(100 - sensitivity) * 10.0;
            velocity >= threshold
        }
        _ => false,
    }
}

/// Matches a URL against a `specific_page` pattern: exact URL, exact path,
/// or prefix when the pattern ends in `*`.
pub fn page_matches(current_url: &str, pattern: &str) -> bool {
    if let Some(prefix) = pattern.strip_suffix('*') {
        if current_url.starts_with(prefix) {
            return true;
        }
        if let Ok(url) = Url::parse(current_url) {
            return url.path().starts_with(prefix);
        }
        return false;
    }
    if current_url == pattern {
        return true;
    }
    match Url::parse(current_url) {
        Ok(url) => url.path() == pattern,
        Err(_) => false,
    }
}

/// Matches a referrer URL against a domain list. A bare domain matches
/// itself and its subdomains; full URLs in the list are reduced to their
/// host.
pub fn referrer_matches(referrer: &str, domains: &[String]) -> bool {
    let host = match Url::parse(referrer) {
        Ok(url) => match url.host_str() {
            Some(h) => h.to_ascii_lowercase(),
            None => return false,
        },
        // A referrer that is not a URL is compared as a bare host.
        Err(_) => referrer.to_ascii_lowercase(),
    };

    domains.iter().any(|entry| {
        let domain = Url::parse(entry)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| entry.clone())
            .to_ascii_lowercase();
        host == domain || host.ends_with(&format!(".{domain}"))
    })
}
