//! The actuator command/status contract and an in-memory test double.
//!
//! Only the narrow interface the engine needs is specified here: issue a
//! move, wait for it to settle. Real actuator drivers are out of scope (spec
//! §1); [`ProcessModel`] stands in for them in tests the way the teacher's
//! mock `AsyncEventSource` implementations stand in for real input sources.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

/// Terminal result of a single motion command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionOutcome {
    Reached,
    Timeout,
    Failed,
}

/// A pending motion. Polled via [`wait`](Self::wait), which never panics and
/// always resolves to a [`MotionOutcome`] — a dropped actuator task surfaces
/// as `Failed`, not as an error the caller must additionally handle.
pub struct MotionHandle {
    rx: oneshot::Receiver<MotionOutcome>,
}

impl MotionHandle {
    pub fn new(rx: oneshot::Receiver<MotionOutcome>) -> Self {
        Self { rx }
    }

    /// Wait for the motion to settle, or for `timeout` to elapse.
    ///
    /// A `None` timeout waits indefinitely. Spec §5: "every `MotionHandle.wait`
    /// takes an optional timeout. On timeout, the blade transitions to
    /// Unknown and the commit is abandoned."
    pub async fn wait(self, timeout: Option<Duration>) -> MotionOutcome {
        let fut = self.rx;
        let result = match timeout {
            Some(d) => match tokio::time::timeout(d, fut).await {
                Ok(inner) => inner,
                Err(_elapsed) => return MotionOutcome::Timeout,
            },
            None => fut.await,
        };
        result.unwrap_or(MotionOutcome::Failed)
    }
}

/// The narrow contract the engine drives: issue insert/retract for a blade
/// index, get back a handle to await completion. Implementations must be
/// safe to call from any context (spec §5 "external actuator drivers are
/// assumed thread-safe for issuing commands and polling status").
pub trait BladeActuator: Send + Sync {
    fn insert(&self, index: usize) -> MotionHandle;
    fn retract(&self, index: usize) -> MotionHandle;
}

/// Per-blade scripted behavior for [`ProcessModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Reached,
    Timeout,
    Failed,
}

impl From<ScriptedOutcome> for MotionOutcome {
    fn from(value: ScriptedOutcome) -> Self {
        match value {
            ScriptedOutcome::Reached => MotionOutcome::Reached,
            ScriptedOutcome::Timeout => MotionOutcome::Timeout,
            ScriptedOutcome::Failed => MotionOutcome::Failed,
        }
    }
}

/// In-memory actuator used by engine tests (spec §2 "ProcessModel (test-time
/// only) — abstract blade actuator that the Stack drives; allows in-memory
/// tests without real hardware").
///
/// By default every command resolves immediately with [`MotionOutcome::Reached`].
/// Tests can script a different outcome per blade index via
/// [`script`](Self::script), and can hold completion back with
/// [`hold`](Self::hold) to observe in-flight `running` state before releasing
/// it with [`release`](Self::release).
#[derive(Clone, Default)]
pub struct ProcessModel {
    scripted: Arc<Mutex<HashMap<usize, ScriptedOutcome>>>,
    held: Arc<Mutex<HashMap<usize, Vec<oneshot::Sender<MotionOutcome>>>>>,
    hold_new_commands: Arc<Mutex<bool>>,
}

impl ProcessModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome the next command(s) for `index` will resolve to.
    pub fn script(&self, index: usize, outcome: ScriptedOutcome) {
        self.scripted.lock().unwrap().insert(index, outcome);
    }

    /// Commands issued after this call block until [`release`](Self::release)
    /// is called, letting tests observe `running == true` mid-commit.
    pub fn hold(&self) {
        *self.hold_new_commands.lock().unwrap() = true;
    }

    /// Release every held command, resolving each with [`MotionOutcome::Reached`]
    /// unless a different outcome was scripted for that index.
    pub fn release(&self) {
        *self.hold_new_commands.lock().unwrap() = false;
        let mut held = self.held.lock().unwrap();
        let scripted = self.scripted.lock().unwrap();
        for (index, senders) in held.drain() {
            let outcome = scripted
                .get(&index)
                .copied()
                .map(MotionOutcome::from)
                .unwrap_or(MotionOutcome::Reached);
            for tx in senders {
                let _ = tx.send(outcome);
            }
        }
    }

    fn issue(&self, index: usize) -> MotionHandle {
        let (tx, rx) = oneshot::channel();
        let holding = *self.hold_new_commands.lock().unwrap();
        if holding {
            self.held.lock().unwrap().entry(index).or_default().push(tx);
        } else {
            let outcome = self
                .scripted
                .lock()
                .unwrap()
                .get(&index)
                .copied()
                .map(MotionOutcome::from)
                .unwrap_or(MotionOutcome::Reached);
            let _ = tx.send(outcome);
        }
        MotionHandle::new(rx)
    }
}

impl BladeActuator for ProcessModel {
    fn insert(&self, index: usize) -> MotionHandle {
        tracing::trace!(target: "actuator.process_model", index, "insert_command");
        self.issue(index)
    }

    fn retract(&self, index: usize) -> MotionHandle {
        tracing::trace!(target: "actuator.process_model", index, "retract_command");
        self.issue(index)
    }
}
