//! The typed reactive event enum and channel plumbing that drive the engine's
//! single-threaded event loop (spec §5 "single reactive message queue").

use satt_actuator::MotionOutcome;
use tokio::sync::mpsc::Sender;
use tokio::task::JoinHandle;

/// Channel capacity for the engine's event queue. A solid-attenuator stack has
/// one writer set driven by control-surface edits and motion completions, so
/// this can be small relative to the teacher's keypress-driven 8192.
pub const EVENT_CHANNEL_CAP: usize = 256;

/// Every externally or internally triggered reason the engine re-evaluates
/// (spec §5 reactive triggers: T_desired write, E_photon write, set_mode
/// write, run rising edge, motion settlement, operator stuck/unstuck).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Event {
    /// `T_desired` was written.
    TargetChanged(f64),
    /// The photon energy changed.
    EnergyChanged(f64),
    /// `set_mode` (Low/High) was written.
    SetModeChanged(SetMode),
    /// `run` transitioned false -> true.
    RunEdge,
    /// A blade's in-flight motion settled.
    MotionSettled { index: usize, outcome: MotionOutcome },
    /// Operator flagged or cleared a blade's stuck status.
    StuckChanged { index: usize, stuck: bool },
    /// `locked` was written.
    LockChanged(bool),
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetMode {
    Low,
    High,
}

/// Optional hooks observing events at the loop boundary. Default no-op;
/// consumers can supply their own (e.g. for test assertions on sequencing).
pub trait EventHooks: Send + Sync + 'static {
    fn pre_handle(&self, _event: &Event) {}
    fn post_handle(&self, _event: &Event) {}
}

pub struct NoopEventHooks;

impl EventHooks for NoopEventHooks {}

/// An async producer of [`Event`]s. Implementations own one background task
/// and push events into the shared channel until it closes.
pub trait AsyncEventSource: Send + 'static {
    fn name(&self) -> &'static str;
    fn spawn(self: Box<Self>, tx: Sender<Event>) -> JoinHandle<()>;
}

/// Registry of event sources spawned together at startup.
#[derive(Default)]
pub struct EventSourceRegistry {
    sources: Vec<Box<dyn AsyncEventSource>>,
}

impl EventSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, source: impl AsyncEventSource) {
        self.sources.push(Box::new(source));
    }

    pub fn spawn_all(&mut self, tx: &Sender<Event>) -> Vec<JoinHandle<()>> {
        self.sources
            .drain(..)
            .map(|source| {
                tracing::debug!(target: "runtime.startup", name = source.name(), "spawning event source");
                source.spawn(tx.clone())
            })
            .collect()
    }
}
