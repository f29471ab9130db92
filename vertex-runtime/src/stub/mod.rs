//! Non-Windows / `stub`-feature backend. Every call is accepted and fails
//! with `Unsupported`, so `vertex-cli` links and runs (reporting a clear
//! error) on a host that cannot actually attach to a process the way
//! `vertex-runtime`'s Windows backend does.

use std::sync::Arc;

use vertex_core::debugger::{Breakpoint, BreakpointKind, Watchpoint, WatchpointSpec};
use vertex_core::error::{VertexError, VertexResult};
use vertex_core::plugin::{DebuggerCallbacks, DebuggerPlugin, MemoryReader};
use vertex_core::types::{ProcessInfo, Region, StepMode};

fn unsupported(op: &str) -> VertexError {
    VertexError::Unsupported(format!("{op} requires the Windows backend"))
}

#[derive(Default)]
pub struct StubProcess;

impl MemoryReader for StubProcess {
    fn read_memory(&self, _address: u64, _out: &mut [u8]) -> VertexResult<()> {
        Err(unsupported("read_memory"))
    }
    fn write_memory(&self, _address: u64, _data: &[u8]) -> VertexResult<()> {
        Err(unsupported("write_memory"))
    }
    fn enumerate_regions(&self) -> VertexResult<Vec<Region>> {
        Err(unsupported("enumerate_regions"))
    }
    fn kill_process(&self) -> VertexResult<()> {
        Err(unsupported("kill_process"))
    }
    fn is_process_valid(&self) -> VertexResult<bool> {
        Ok(false)
    }
    fn list_processes(&self) -> VertexResult<Vec<ProcessInfo>> {
        Err(unsupported("list_processes"))
    }
    fn open_process(&self, _pid: u32) -> VertexResult<()> {
        Err(unsupported("open_process"))
    }
    fn pointer_size(&self) -> VertexResult<u8> {
        Ok(8)
    }
}

#[derive(Default)]
pub struct StubDebugger;

impl DebuggerPlugin for StubDebugger {
    fn run(&self, _callbacks: Arc<dyn DebuggerCallbacks>) -> VertexResult<()> {
        Ok(())
    }
    fn attach(&self, _pid: u32) -> VertexResult<()> {
        Err(unsupported("attach"))
    }
    fn detach(&self) -> VertexResult<()> {
        Ok(())
    }
    fn continue_execution(&self, _pass_exception: bool) -> VertexResult<()> {
        Err(unsupported("continue_execution"))
    }
    fn pause(&self) -> VertexResult<()> {
        Err(unsupported("pause"))
    }
    fn step(&self, _mode: StepMode) -> VertexResult<()> {
        Err(unsupported("step"))
    }
    fn run_to_address(&self, _addr: u64) -> VertexResult<()> {
        Err(unsupported("run_to_address"))
    }
    fn set_breakpoint(&self, _addr: u64, _kind: BreakpointKind) -> VertexResult<u32> {
        Err(unsupported("set_breakpoint"))
    }
    fn remove_breakpoint(&self, _id: u32) -> VertexResult<()> {
        Err(unsupported("remove_breakpoint"))
    }
    fn enable_breakpoint(&self, _id: u32, _enabled: bool) -> VertexResult<()> {
        Err(unsupported("enable_breakpoint"))
    }
    fn set_watchpoint(&self, _wp: &WatchpointSpec) -> VertexResult<u32> {
        Err(unsupported("set_watchpoint"))
    }
    fn remove_watchpoint(&self, _id: u32) -> VertexResult<()> {
        Err(unsupported("remove_watchpoint"))
    }
    fn enable_watchpoint(&self, _id: u32, _enabled: bool) -> VertexResult<()> {
        Err(unsupported("enable_watchpoint"))
    }
    fn get_breakpoints(&self) -> VertexResult<Vec<Breakpoint>> {
        Ok(vec![])
    }
    fn get_watchpoints(&self) -> VertexResult<Vec<Watchpoint>> {
        Ok(vec![])
    }
    fn get_instruction_pointer(&self, _thread_id: u32) -> VertexResult<u64> {
        Err(unsupported("get_instruction_pointer"))
    }
    fn set_instruction_pointer(&self, _thread_id: u32, _value: u64) -> VertexResult<()> {
        Err(unsupported("set_instruction_pointer"))
    }
}
