//! Structured lifecycle events emitted by the load-balancer engine.
//!
//! The engine never logs its milestones directly to a global subscriber;
//! it is handed an [`EventSink`] instead. Production wires up
//! [`TracingEventSink`], tests use [`RecordingEventSink`] and assert on what
//! was emitted.
//!
//! Emitting is fire-and-forget: a sink must never fail the operation that
//! reported the event.

use std::sync::Mutex;

use tracing::{info, warn};

/// Severity of an engine event
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    /// Expected lifecycle step
    Normal,
    /// Something went wrong or needs attention
    Warning,
}

/// A single engine milestone
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineEvent {
    /// Hostname of the balancer the event is about
    pub balancer: String,
    /// Normal or Warning
    pub type_: EventType,
    /// Machine-readable reason (one of [`reasons`])
    pub reason: &'static str,
    /// Human-readable detail
    pub note: String,
}

impl EngineEvent {
    /// Create a Normal event
    pub fn normal(balancer: impl Into<String>, reason: &'static str, note: impl Into<String>) -> Self {
        Self {
            balancer: balancer.into(),
            type_: EventType::Normal,
            reason,
            note: note.into(),
        }
    }

    /// Create a Warning event
    pub fn warning(
        balancer: impl Into<String>,
        reason: &'static str,
        note: impl Into<String>,
    ) -> Self {
        Self {
            balancer: balancer.into(),
            type_: EventType::Warning,
            reason,
            note: note.into(),
        }
    }
}

/// Receiver for engine events.
pub trait EventSink: Send + Sync {
    /// Record an event. Must not block on I/O or fail.
    fn emit(&self, event: EngineEvent);
}

/// Production sink writing events as structured `tracing` records.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: EngineEvent) {
        match event.type_ {
            EventType::Normal => info!(
                balancer = %event.balancer,
                reason = event.reason,
                "{}",
                event.note
            ),
            EventType::Warning => warn!(
                balancer = %event.balancer,
                reason = event.reason,
                "{}",
                event.note
            ),
        }
    }
}

/// Sink that keeps every event in memory, in emission order.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<EngineEvent>>,
}

impl RecordingEventSink {
    /// Create an empty recording sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all events recorded so far
    pub fn events(&self) -> Vec<EngineEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Reasons of all events recorded so far, in order
    pub fn reasons(&self) -> Vec<&'static str> {
        self.events().into_iter().map(|e| e.reason).collect()
    }

    /// Whether an event with this reason was recorded
    pub fn saw(&self, reason: &str) -> bool {
        self.events().iter().any(|e| e.reason == reason)
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: EngineEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// A create request was submitted to the store
    pub const INSTANCE_CREATING: &str = "InstanceCreating";
    /// The store reported the new instance with addresses
    pub const INSTANCE_CREATED: &str = "InstanceCreated";
    /// Host preparation finished
    pub const HOST_PREPARED: &str = "HostPrepared";
    /// The balancer daemon was installed
    pub const BALANCER_INSTALLED: &str = "BalancerInstalled";
    /// A new configuration was uploaded and the daemon reloaded
    pub const CONFIG_APPLIED: &str = "ConfigApplied";
    /// The configuration was uploaded but the daemon did not reload
    pub const RELOAD_FAILED: &str = "ReloadFailed";
    /// Create failed part-way; the instance is being torn down
    pub const PROVISIONING_FAILED: &str = "ProvisioningFailed";
    /// The backing instance was destroyed
    pub const INSTANCE_DESTROYED: &str = "InstanceDestroyed";
    /// Policy hints failed validation
    pub const INVALID_OPTIONS: &str = "InvalidOptions";
}
