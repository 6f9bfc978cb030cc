//! Emulator lifecycle state machine.
//!
//! Events describe outcomes, not requests: the controller checks legality with
//! [`VmState::permits`] before touching the emulator, and reports what
//! actually happened afterwards. An outcome that no longer applies (for
//! example a `Paused` reply that lands after a crash) is ignored.
//!
//! ```text
//! NotStarted ─┐
//!             ├─ StartRequested ─► Active (superstate)
//! Stopped ────┘                      ├── Starting ── HandshakeCompleted ─► Running
//!      ▲                             │       └────── StartFailed ────────► Stopped
//!      │                             ├── Running ─── Paused ─► Paused
//!      │                             └── Paused ──── Resumed ─► Running
//!      │                           Active ── ProcessLost ─► Crashed
//!      │                 Active | Crashed ── StopRequested ─► Stopping
//!      └──────────── Stopping ── Exited
//! ```

use statig::prelude::*;

use crate::vm::VmState;

/// Outcomes reported to the lifecycle machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    StartRequested,
    HandshakeCompleted,
    StartFailed,
    Paused,
    Resumed,
    StopRequested,
    Exited,
    ProcessLost,
}

/// Shared storage; the lifecycle keeps no data beyond its state.
#[derive(Debug, Default)]
pub struct LifecycleMachine;

#[state_machine(
    initial = "State::not_started()",
    state(derive(Debug, Clone, PartialEq, Eq))
)]
impl LifecycleMachine {
    #[state]
    fn not_started(event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::StartRequested => Transition(State::starting()),
            _ => Handled,
        }
    }

    /// Parent of every state with a live process.
    #[superstate]
    fn active(event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::StopRequested => Transition(State::stopping()),
            LifecycleEvent::ProcessLost => Transition(State::crashed()),
            _ => Handled,
        }
    }

    #[state(superstate = "active")]
    fn starting(event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::HandshakeCompleted => Transition(State::running()),
            LifecycleEvent::StartFailed => Transition(State::stopped()),
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn running(event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Paused => Transition(State::paused()),
            _ => Super,
        }
    }

    #[state(superstate = "active")]
    fn paused(event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Resumed => Transition(State::running()),
            _ => Super,
        }
    }

    #[state]
    fn stopping(event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::Exited => Transition(State::stopped()),
            _ => Handled,
        }
    }

    #[state]
    fn stopped(event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::StartRequested => Transition(State::starting()),
            _ => Handled,
        }
    }

    /// The process died or the QMP link dropped underneath us.
    #[state]
    fn crashed(event: &LifecycleEvent) -> Outcome<State> {
        match event {
            LifecycleEvent::StopRequested => Transition(State::stopping()),
            _ => Handled,
        }
    }
}

impl From<&State> for VmState {
    fn from(state: &State) -> Self {
        match state {
            State::NotStarted {} => VmState::NotStarted,
            State::Starting {} => VmState::Starting,
            State::Running {} => VmState::Running,
            State::Paused {} => VmState::Paused,
            State::Stopping {} => VmState::Stopping,
            State::Stopped {} => VmState::Stopped,
            State::Crashed {} => VmState::Crashed,
        }
    }
}

/// The statig machine plus a plain-enum view of its state.
pub struct Lifecycle {
    machine: StateMachine<LifecycleMachine>,
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lifecycle").field("state", &self.state()).finish()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            machine: LifecycleMachine.state_machine(),
        }
    }
}

impl Lifecycle {
    pub fn state(&self) -> VmState {
        VmState::from(self.machine.state())
    }

    /// Feed one outcome; returns the state before and after.
    pub fn handle(&mut self, event: LifecycleEvent) -> (VmState, VmState) {
        let from = self.state();
        self.machine.handle(&event);
        (from, self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent::*;

    fn run(events: &[LifecycleEvent]) -> VmState {
        let mut lifecycle = Lifecycle::default();
        for event in events {
            lifecycle.handle(*event);
        }
        lifecycle.state()
    }

    #[test]
    fn starts_not_started() {
        assert_eq!(Lifecycle::default().state(), VmState::NotStarted);
    }

    #[test]
    fn happy_path() {
        assert_eq!(run(&[StartRequested]), VmState::Starting);
        assert_eq!(run(&[StartRequested, HandshakeCompleted]), VmState::Running);
        assert_eq!(run(&[StartRequested, HandshakeCompleted, Paused]), VmState::Paused);
        assert_eq!(
            run(&[StartRequested, HandshakeCompleted, Paused, Resumed]),
            VmState::Running
        );
        assert_eq!(
            run(&[StartRequested, HandshakeCompleted, StopRequested, Exited]),
            VmState::Stopped
        );
    }

    #[test]
    fn failed_start_lands_in_stopped_and_can_restart() {
        assert_eq!(run(&[StartRequested, StartFailed]), VmState::Stopped);
        assert_eq!(
            run(&[StartRequested, StartFailed, StartRequested]),
            VmState::Starting
        );
    }

    #[test]
    fn process_loss_crashes_every_active_state() {
        assert_eq!(run(&[StartRequested, ProcessLost]), VmState::Crashed);
        assert_eq!(
            run(&[StartRequested, HandshakeCompleted, ProcessLost]),
            VmState::Crashed
        );
        assert_eq!(
            run(&[StartRequested, HandshakeCompleted, Paused, ProcessLost]),
            VmState::Crashed
        );
    }

    #[test]
    fn crash_is_cleared_by_stop() {
        assert_eq!(
            run(&[StartRequested, ProcessLost, StopRequested, Exited]),
            VmState::Stopped
        );
    }

    #[test]
    fn stale_outcomes_are_ignored() {
        // A pause reply arriving after a crash changes nothing.
        assert_eq!(
            run(&[StartRequested, HandshakeCompleted, ProcessLost, Paused]),
            VmState::Crashed
        );
        // Exiting while stopping is expected, not a crash.
        assert_eq!(
            run(&[StartRequested, HandshakeCompleted, StopRequested, ProcessLost]),
            VmState::Stopping
        );
        assert_eq!(run(&[Paused, Resumed, Exited]), VmState::NotStarted);
    }

    #[test]
    fn handle_reports_from_and_to() {
        let mut lifecycle = Lifecycle::default();
        assert_eq!(
            lifecycle.handle(StartRequested),
            (VmState::NotStarted, VmState::Starting)
        );
        assert_eq!(
            lifecycle.handle(StartRequested),
            (VmState::Starting, VmState::Starting)
        );
    }
}
