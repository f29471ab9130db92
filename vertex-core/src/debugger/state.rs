//! Debugger state machine.

use crate::error::{VertexError, VertexResult};
use crate::types::StepMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DebuggerState {
    Detached,
    Attached,
    Running,
    Paused,
    Stepping,
    BreakpointHit,
    Exception,
}

/// Commands a caller may submit through the facade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebuggerCommand {
    Attach,
    Detach,
    Continue,
    Pause,
    Step(StepMode),
    RunToAddress(u64),
    Shutdown,
}

impl DebuggerState {
    /// Whether `self -> new` is a legal transition of the debugger's state
    /// diagram.
    pub fn can_transition_to(self, new: DebuggerState) -> bool {
        use DebuggerState::*;
        if self == new {
            return false;
        }
        matches!(
            (self, new),
            (Detached, Attached)
                | (Attached, Running)
                | (Running, Paused)
                | (Running, BreakpointHit)
                | (Running, Exception)
                | (Running, Stepping)
                | (Paused, Running)
                | (BreakpointHit, Running)
                | (Exception, Running)
                | (Stepping, Running)
                | (Paused, Detached)
                | (BreakpointHit, Detached)
                | (Exception, Detached)
                | (Stepping, Detached)
                | (Attached, Detached)
                | (Running, Detached)
        )
    }

    fn is_stopped(self) -> bool {
        matches!(
            self,
            DebuggerState::Paused
                | DebuggerState::BreakpointHit
                | DebuggerState::Exception
                | DebuggerState::Stepping
        )
    }

    /// Gates command validity by `(state, attached)`, grounded on
    /// `debuggerworker_commands.cc`'s `is_valid_command_for_state`.
    pub fn is_valid_command(self, attached: bool, command: DebuggerCommand) -> bool {
        match command {
            DebuggerCommand::Attach => !attached && self == DebuggerState::Detached,
            DebuggerCommand::Detach => attached,
            DebuggerCommand::Continue
            | DebuggerCommand::Step(_)
            | DebuggerCommand::RunToAddress(_) => attached && self.is_stopped(),
            DebuggerCommand::Pause => attached && self == DebuggerState::Running,
            DebuggerCommand::Shutdown => true,
        }
    }
}

/// Tracks the authoritative state and fires `on_state_changed` exactly once
/// per transition.
pub struct StateMachine {
    current: DebuggerState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            current: DebuggerState::Detached,
        }
    }

    pub fn current(&self) -> DebuggerState {
        self.current
    }

    /// Transitions to `new`, invoking `on_change(old, new)` exactly once if
    /// the transition is legal.
    pub fn transition(
        &mut self,
        new: DebuggerState,
        on_change: impl FnOnce(DebuggerState, DebuggerState),
    ) -> VertexResult<()> {
        let old = self.current;
        if !old.can_transition_to(new) {
            return Err(VertexError::ProtocolViolation(format!(
                "illegal transition {old:?} -> {new:?}"
            )));
        }
        self.current = new;
        on_change(old, new);
        Ok(())
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
