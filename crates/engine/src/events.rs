//! Ambient session signals and the cancellable-subscription abstraction.
//!
//! The engine never touches a UI runtime directly. It arms timers and
//! signal subscriptions through a [`SessionEventSource`] and consumes the
//! resulting [`SessionEvent`]s one at a time, so every armed resource is a
//! revocable handle that `cleanup()` can release.

use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use popup_core::types::GeoInfo;

/// An ambient event observed during a browsing session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum SessionEvent {
    /// Vertical scroll position as a fraction of page height, 0-100.
    Scroll { percent: f64 },
    /// Pointer left the viewport toward the top at the given upward
    /// velocity (px/s).
    ExitIntent { velocity: f64 },
    /// In-app navigation to a new URL.
    PageView { url: String },
    /// A previously armed one-shot timer elapsed.
    TimerElapsed {
        registration_id: String,
        timer_id: SubscriptionId,
    },
    /// Geography lookup completed.
    GeoResolved { geo: GeoInfo },
}

/// The classes of ambient signal a registration can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Scroll,
    ExitIntent,
    PageView,
}

/// Opaque handle to one armed resource (timer or signal subscription).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn mint() -> Self {
        Self(Uuid::new_v4())
    }
}

/// Capability interface over the host environment's timers and listeners.
///
/// Every arming call returns a [`SubscriptionId`]; the caller owns the
/// handle and must `revoke` it on teardown. Revoking an already-consumed
/// or unknown handle is a no-op.
pub trait SessionEventSource: Send + Sync {
    /// Arms a one-shot timer that will deliver
    /// [`SessionEvent::TimerElapsed`] after `delay`.
    fn arm_timer(&self, registration_id: &str, delay: Duration) -> SubscriptionId;

    /// Subscribes a registration to an ambient signal class.
    fn subscribe(&self, registration_id: &str, signal: SignalKind) -> SubscriptionId;

    /// Releases one armed resource.
    fn revoke(&self, subscription: SubscriptionId);
}

#[derive(Debug, Clone)]
enum ArmedResource {
    Timer {
        registration_id: String,
        delay: Duration,
    },
    Signal {
        registration_id: String,
        kind: SignalKind,
    },
}

/// Deterministic event source for tests and hosts that pump events
/// themselves. Records what is armed without any real timers; tests drive
/// satisfaction by elapsing timers explicitly.
#[derive(Default)]
pub struct ManualEventSource {
    armed: DashMap<SubscriptionId, ArmedResource>,
}

impl ManualEventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn armed_timer_count(&self) -> usize {
        self.armed
            .iter()
            .filter(|e| matches!(e.value(), ArmedResource::Timer { .. }))
            .count()
    }

    pub fn armed_signal_count(&self) -> usize {
        self.armed
            .iter()
            .filter(|e| matches!(e.value(), ArmedResource::Signal { .. }))
            .count()
    }

    pub fn armed_count(&self) -> usize {
        self.armed.len()
    }

    /// Builds the `TimerElapsed` event for the first timer armed by the
    /// given registration, as if its delay had passed.
    pub fn elapse_timer(&self, registration_id: &str) -> Option<SessionEvent> {
        self.armed.iter().find_map(|e| match e.value() {
            ArmedResource::Timer {
                registration_id: reg,
                ..
            } if reg == registration_id => Some(SessionEvent::TimerElapsed {
                registration_id: reg.clone(),
                timer_id: *e.key(),
            }),
            _ => None,
        })
    }

    /// Delay of the first timer armed by the given registration.
    pub fn timer_delay_for(&self, registration_id: &str) -> Option<Duration> {
        self.armed.iter().find_map(|e| match e.value() {
            ArmedResource::Timer {
                registration_id: reg,
                delay,
            } if reg == registration_id => Some(*delay),
            _ => None,
        })
    }
}

impl SessionEventSource for ManualEventSource {
    fn arm_timer(&self, registration_id: &str, delay: Duration) -> SubscriptionId {
        let id = SubscriptionId::mint();
        self.armed.insert(
            id,
            ArmedResource::Timer {
                registration_id: registration_id.to_string(),
                delay,
            },
        );
        id
    }

    fn subscribe(&self, registration_id: &str, signal: SignalKind) -> SubscriptionId {
        let id = SubscriptionId::mint();
        self.armed.insert(
            id,
            ArmedResource::Signal {
                registration_id: registration_id.to_string(),
                kind: signal,
            },
        );
        id
    }

    fn revoke(&self, subscription: SubscriptionId) {
        self.armed.remove(&subscription);
    }
}

/// Production event source backed by the tokio runtime.
///
/// Armed timers are spawned sleep tasks that deliver `TimerElapsed` into
/// an unbounded channel; the host pumps the receiver into
/// `PopupTriggerEngine::handle_event`, which keeps event processing
/// strictly sequential. Browser-originated signals (scroll, exit intent,
/// navigation) are forwarded by the host adaptor through [`Self::push`].
pub struct TokioEventSource {
    tx: mpsc::UnboundedSender<SessionEvent>,
    timers: DashMap<SubscriptionId, tokio::task::JoinHandle<()>>,
    subscriptions: Mutex<Vec<(SubscriptionId, String, SignalKind)>>,
}

impl TokioEventSource {
    /// Creates the source and the event stream the host must pump.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                timers: DashMap::new(),
                subscriptions: Mutex::new(Vec::new()),
            },
            rx,
        )
    }

    /// Forwards a host-observed signal into the event stream.
    pub fn push(&self, event: SessionEvent) {
        // Receiver dropped means the session is torn down; drop the event.
        let _ = self.tx.send(event);
    }

    /// Whether any live subscription wants the given signal class. Host
    /// adaptors may use this to skip attaching expensive DOM listeners.
    pub fn wants(&self, signal: SignalKind) -> bool {
        self.subscriptions.lock().iter().any(|(_, _, k)| *k == signal)
    }
}

impl SessionEventSource for TokioEventSource {
    fn arm_timer(&self, registration_id: &str, delay: Duration) -> SubscriptionId {
        let id = SubscriptionId::mint();
        let tx = self.tx.clone();
        let reg = registration_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(SessionEvent::TimerElapsed {
                registration_id: reg,
                timer_id: id,
            });
        });
        debug!(registration_id, delay_ms = delay.as_millis() as u64, "Timer armed");
        self.timers.insert(id, handle);
        id
    }

    fn subscribe(&self, registration_id: &str, signal: SignalKind) -> SubscriptionId {
        let id = SubscriptionId::mint();
        self.subscriptions
            .lock()
            .push((id, registration_id.to_string(), signal));
        id
    }

    fn revoke(&self, subscription: SubscriptionId) {
        if let Some((_, handle)) = self.timers.remove(&subscription) {
            handle.abort();
        }
        self.subscriptions.lock().retain(|(id, _, _)| *id != subscription);
    }
}
