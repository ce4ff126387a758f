//! Trigger registrations — a variation's rule set armed for later
//! asynchronous satisfaction, owning its subscriptions.

use std::collections::HashMap;

use tracing::warn;

use popup_core::types::TriggerRule;

use crate::events::SubscriptionId;

/// Invoked exactly once when every rule in a registration is satisfied.
/// Errors are logged and isolated; they never poison other registrations.
pub type TriggerCallback = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// One variation's rule set, armed and waiting. All rules must be
/// satisfied (logical AND) before the callback fires, and it fires at most
/// once.
pub struct TriggerRegistration {
    pub id: String,
    pub rules: Vec<TriggerRule>,
    satisfied: Vec<bool>,
    callback: TriggerCallback,
    /// Every armed resource this registration owns.
    subscriptions: Vec<SubscriptionId>,
    /// Which rule each armed timer belongs to.
    timer_rules: HashMap<SubscriptionId, usize>,
    fired: bool,
}

impl std::fmt::Debug for TriggerRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistration")
            .field("id", &self.id)
            .field("rules", &self.rules.len())
            .field("satisfied", &self.satisfied)
            .field("fired", &self.fired)
            .finish()
    }
}

impl TriggerRegistration {
    pub fn new(id: impl Into<String>, rules: Vec<TriggerRule>, callback: TriggerCallback) -> Self {
        let satisfied = vec![false; rules.len()];
        Self {
            id: id.into(),
            rules,
            satisfied,
            callback,
            subscriptions: Vec::new(),
            timer_rules: HashMap::new(),
            fired: false,
        }
    }

    pub fn fired(&self) -> bool {
        self.fired
    }

    pub fn is_satisfied(&self, rule_index: usize) -> bool {
        self.satisfied.get(rule_index).copied().unwrap_or(false)
    }

    pub fn mark_satisfied(&mut self, rule_index: usize) {
        if let Some(slot) = self.satisfied.get_mut(rule_index) {
            *slot = true;
        }
    }

    pub fn all_satisfied(&self) -> bool {
        self.satisfied.iter().all(|s| *s)
    }

    pub fn own_subscription(&mut self, subscription: SubscriptionId) {
        self.subscriptions.push(subscription);
    }

    pub fn own_timer(&mut self, subscription: SubscriptionId, rule_index: usize) {
        self.subscriptions.push(subscription);
        self.timer_rules.insert(subscription, rule_index);
    }

    /// The rule index an elapsed timer belongs to, if this registration
    /// armed it.
    pub fn timer_rule(&self, timer_id: SubscriptionId) -> Option<usize> {
        self.timer_rules.get(&timer_id).copied()
    }

    pub fn subscriptions(&self) -> &[SubscriptionId] {
        &self.subscriptions
    }

    /// Fires the callback if it has not fired yet. The flag is set before
    /// the callback runs, so two conditions resolving in the same tick
    /// still produce exactly one invocation.
    pub fn fire(&mut self) -> bool {
        if self.fired {
            return false;
        }
        self.fired = true;
        if let Err(err) = (self.callback)() {
            warn!(registration_id = %self.id, error = %err, "Trigger callback failed");
        }
        true
    }
}
