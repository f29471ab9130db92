//! User-mode debugger subsystem: state machine, breakpoint/watchpoint
//! management, callback re-entrancy guard, and the event loop.

pub mod breakpoints;
pub mod callback;
pub mod dr7;
pub mod loop_;
pub mod state;
pub mod types;

pub use breakpoints::{BreakpointManager, DebugRegisters, ThreadContextAccess};
pub use state::{DebuggerCommand, DebuggerState, StateMachine};
pub use types::{
    Breakpoint, BreakpointHitEvent, BreakpointKind, BreakpointState, ExceptionEvent,
    SingleStepEvent, Watchpoint, WatchpointAccess, WatchpointHitInfo, WatchpointSpec,
};
