//! External interfaces consumed/produced across the plugin boundary,
//! expressed as Rust traits instead of C function pointers.

use crate::debugger::state::DebuggerState;
use crate::debugger::types::{
    BreakpointHitEvent, BreakpointKind, ExceptionEvent, SingleStepEvent, WatchpointHitInfo,
    WatchpointSpec,
};
use crate::debugger::Breakpoint;
use crate::debugger::Watchpoint;
use crate::error::VertexResult;
use crate::types::{ExportEntry, ImportEntry, ProcessInfo, Region, StepMode};

pub trait MemoryReader: Send + Sync {
    fn read_memory(&self, address: u64, out: &mut [u8]) -> VertexResult<()>;
    fn write_memory(&self, address: u64, data: &[u8]) -> VertexResult<()>;
    fn enumerate_regions(&self) -> VertexResult<Vec<Region>>;
    fn kill_process(&self) -> VertexResult<()>;
    fn is_process_valid(&self) -> VertexResult<bool>;
    fn list_processes(&self) -> VertexResult<Vec<ProcessInfo>>;
    fn open_process(&self, pid: u32) -> VertexResult<()>;
    fn pointer_size(&self) -> VertexResult<u8>;
}

pub trait DebuggerCallbacks: Send + Sync {
    fn on_attached(&self, pid: u32);
    fn on_detached(&self, pid: u32);
    fn on_state_changed(&self, old: DebuggerState, new: DebuggerState);
    fn on_breakpoint_hit(&self, event: &BreakpointHitEvent);
    fn on_single_step(&self, event: &SingleStepEvent);
    fn on_exception(&self, event: &ExceptionEvent);
    fn on_watchpoint_hit(&self, event: &WatchpointHitInfo);
    fn on_error(&self, error: &crate::error::VertexError);
}

pub trait DebuggerPlugin: Send + Sync {
    fn run(&self, callbacks: std::sync::Arc<dyn DebuggerCallbacks>) -> VertexResult<()>;
    fn attach(&self, pid: u32) -> VertexResult<()>;
    fn detach(&self) -> VertexResult<()>;
    fn continue_execution(&self, pass_exception: bool) -> VertexResult<()>;
    fn pause(&self) -> VertexResult<()>;
    fn step(&self, mode: StepMode) -> VertexResult<()>;
    fn run_to_address(&self, addr: u64) -> VertexResult<()>;
    fn set_breakpoint(&self, addr: u64, kind: BreakpointKind) -> VertexResult<u32>;
    fn remove_breakpoint(&self, id: u32) -> VertexResult<()>;
    fn enable_breakpoint(&self, id: u32, enabled: bool) -> VertexResult<()>;
    fn set_watchpoint(&self, wp: &WatchpointSpec) -> VertexResult<u32>;
    fn remove_watchpoint(&self, id: u32) -> VertexResult<()>;
    fn enable_watchpoint(&self, id: u32, enabled: bool) -> VertexResult<()>;
    fn get_breakpoints(&self) -> VertexResult<Vec<Breakpoint>>;
    fn get_watchpoints(&self) -> VertexResult<Vec<Watchpoint>>;
    fn get_instruction_pointer(&self, thread_id: u32) -> VertexResult<u64>;
    fn set_instruction_pointer(&self, thread_id: u32, value: u64) -> VertexResult<()>;
}

/// Parses a module image already read out of the target process into its
/// import/export directories. A separate trait from `MemoryReader` because
/// the parsing (PE-format-specific, via `goblin` in `vertex-runtime`) has
/// nothing to do with how the bytes were obtained, and a non-Windows plugin
/// would have no image format to parse at all.
pub trait ModuleInspector: Send + Sync {
    fn read_exports(&self, image: &[u8]) -> VertexResult<Vec<ExportEntry>>;
    fn read_imports(&self, image: &[u8]) -> VertexResult<Vec<ImportEntry>>;
}
