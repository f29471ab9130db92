//! In-process stand-in for `vertex-runtime`: a `Vec<u8>`-backed
//! `MemoryReader` and a `DebuggerPlugin` whose debug events are injected by
//! the test rather than pumped from `WaitForDebugEvent`. Lets
//! `vertex-core`'s scanner and debugger be exercised end to end without a
//! live OS-level process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use vertex_core::debugger::loop_::{DebugEvent, DebugLoop, Disassembler, ExecutionControl};
use vertex_core::debugger::{
    Breakpoint, BreakpointKind, DebugRegisters, ThreadContextAccess, Watchpoint, WatchpointSpec,
};
use vertex_core::error::{VertexError, VertexResult};
use vertex_core::plugin::{DebuggerCallbacks, DebuggerPlugin, MemoryReader};
use vertex_core::types::{ProcessInfo, Region, StepMode};

/// A single contiguous block of process memory, addressed starting at
/// `base`. Good enough for tests that scan or step through a synthetic
/// image without needing real page boundaries.
pub struct FakeMemory {
    base: u64,
    bytes: Mutex<Vec<u8>>,
}

impl FakeMemory {
    pub fn new(base: u64, size: usize) -> Self {
        Self { base, bytes: Mutex::new(vec![0u8; size]) }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    fn offset(&self, address: u64, len: usize) -> VertexResult<usize> {
        let offset = address
            .checked_sub(self.base)
            .ok_or_else(|| VertexError::InvalidParameter(format!("{address:#x} below base")))?;
        let offset = offset as usize;
        let bytes = self.bytes.lock().unwrap();
        if offset.checked_add(len).map_or(true, |end| end > bytes.len()) {
            return Err(VertexError::InvalidParameter(format!("{address:#x}+{len} out of range")));
        }
        Ok(offset)
    }

    /// Seeds the buffer directly, bypassing the `MemoryReader` API, for
    /// test setup (planting a `call` opcode, an initial scan value, etc).
    pub fn seed(&self, address: u64, data: &[u8]) {
        let offset = self.offset(address, data.len()).expect("seed within bounds");
        self.bytes.lock().unwrap()[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl MemoryReader for FakeMemory {
    fn read_memory(&self, address: u64, out: &mut [u8]) -> VertexResult<()> {
        let offset = self.offset(address, out.len())?;
        out.copy_from_slice(&self.bytes.lock().unwrap()[offset..offset + out.len()]);
        Ok(())
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> VertexResult<()> {
        let offset = self.offset(address, data.len())?;
        self.bytes.lock().unwrap()[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn enumerate_regions(&self) -> VertexResult<Vec<Region>> {
        Ok(vec![Region {
            base: self.base,
            size: self.bytes.lock().unwrap().len() as u64,
            module_name: Some("fake.bin".to_string()),
        }])
    }

    fn kill_process(&self) -> VertexResult<()> {
        Ok(())
    }

    fn is_process_valid(&self) -> VertexResult<bool> {
        Ok(true)
    }

    fn list_processes(&self) -> VertexResult<Vec<ProcessInfo>> {
        Ok(vec![ProcessInfo { pid: 1, name: "fake.exe".to_string() }])
    }

    fn open_process(&self, _pid: u32) -> VertexResult<()> {
        Ok(())
    }

    fn pointer_size(&self) -> VertexResult<u8> {
        Ok(8)
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct ThreadState {
    instruction_pointer: u64,
    stack_pointer: u64,
    regs: DebugRegisters,
}

/// Per-thread register state a test can preload and a `DebugLoop` can
/// read/write the same way it would a real `GetThreadContext` handle.
pub struct FakeThreads {
    memory: Arc<FakeMemory>,
    threads: Mutex<HashMap<u32, ThreadState>>,
}

impl FakeThreads {
    pub fn new(memory: Arc<FakeMemory>) -> Self {
        Self { memory, threads: Mutex::new(HashMap::new()) }
    }

    pub fn add_thread(&self, thread_id: u32, instruction_pointer: u64, stack_pointer: u64) {
        self.threads.lock().unwrap().insert(
            thread_id,
            ThreadState { instruction_pointer, stack_pointer, regs: DebugRegisters::default() },
        );
    }

    pub fn remove_thread(&self, thread_id: u32) {
        self.threads.lock().unwrap().remove(&thread_id);
    }

    fn state(&self, thread_id: u32) -> VertexResult<ThreadState> {
        self.threads
            .lock()
            .unwrap()
            .get(&thread_id)
            .copied()
            .ok_or_else(|| VertexError::NotFound(format!("thread {thread_id}")))
    }
}

impl ThreadContextAccess for FakeThreads {
    fn thread_ids(&self) -> Vec<u32> {
        self.threads.lock().unwrap().keys().copied().collect()
    }

    fn read_debug_registers(&self, thread_id: u32) -> VertexResult<DebugRegisters> {
        Ok(self.state(thread_id)?.regs)
    }

    fn write_debug_registers(&self, thread_id: u32, regs: &DebugRegisters) -> VertexResult<()> {
        let mut threads = self.threads.lock().unwrap();
        let state = threads.get_mut(&thread_id).ok_or_else(|| VertexError::NotFound(format!("thread {thread_id}")))?;
        state.regs = *regs;
        Ok(())
    }
}

impl ExecutionControl for FakeThreads {
    fn get_instruction_pointer(&self, thread_id: u32) -> VertexResult<u64> {
        Ok(self.state(thread_id)?.instruction_pointer)
    }

    fn set_instruction_pointer(&self, thread_id: u32, value: u64) -> VertexResult<()> {
        let mut threads = self.threads.lock().unwrap();
        let state = threads.get_mut(&thread_id).ok_or_else(|| VertexError::NotFound(format!("thread {thread_id}")))?;
        state.instruction_pointer = value;
        Ok(())
    }

    fn arm_single_step(&self, thread_id: u32) -> VertexResult<()> {
        // Nothing to arm: the test drives single-steps by calling
        // `inject_event(DebugEvent::SingleStep { .. })` directly.
        self.state(thread_id).map(|_| ())
    }

    fn read_return_address(&self, thread_id: u32) -> VertexResult<u64> {
        let stack_pointer = self.state(thread_id)?.stack_pointer;
        let mut bytes = [0u8; 8];
        self.memory.read_memory(stack_pointer, &mut bytes)?;
        Ok(u64::from_le_bytes(bytes))
    }
}

/// Recognizes a single-byte marker (`0xE8`, matching the real x86 near-call
/// opcode) as a 5-byte `call`; every other byte decodes as a 1-byte
/// non-call instruction. Enough to drive StepOver's call/non-call branch
/// without a real x86 decoder.
#[derive(Default)]
pub struct FakeDisassembler;

impl Disassembler for FakeDisassembler {
    fn decode_one(&self, bytes: &[u8]) -> Option<(usize, bool)> {
        match bytes.first() {
            Some(0xE8) => Some((5, true)),
            Some(_) => Some((1, false)),
            None => None,
        }
    }
}

/// A `DebuggerPlugin` driven by `inject_event` instead of a real event
/// pump. Wraps the same `DebugLoop` a real backend would.
pub struct FakeDebuggerPlugin {
    threads: Arc<FakeThreads>,
    inner: DebugLoop<FakeMemory, FakeThreads, FakeDisassembler>,
    callbacks: Mutex<Option<Arc<dyn DebuggerCallbacks>>>,
    current_thread: AtomicU32,
}

impl FakeDebuggerPlugin {
    pub fn new(memory: Arc<FakeMemory>, threads: Arc<FakeThreads>) -> Self {
        let inner = DebugLoop::new(memory, threads.clone(), FakeDisassembler);
        Self { threads, inner, callbacks: Mutex::new(None), current_thread: AtomicU32::new(0) }
    }

    fn callbacks(&self) -> VertexResult<Arc<dyn DebuggerCallbacks>> {
        self.callbacks
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| VertexError::ProtocolViolation("run() was never called".into()))
    }

    /// Feeds one event through the loop exactly as a real event pump
    /// would, including the active-thread bookkeeping `step`/
    /// `run_to_address` rely on.
    pub fn inject_event(&self, thread_id: u32, event: DebugEvent) -> VertexResult<()> {
        self.current_thread.store(thread_id, Ordering::Release);
        let callbacks = self.callbacks()?;
        self.inner.handle_event(event, callbacks.as_ref())
    }

    pub fn state(&self) -> vertex_core::debugger::DebuggerState {
        self.inner.state()
    }
}

impl DebuggerPlugin for FakeDebuggerPlugin {
    fn run(&self, callbacks: Arc<dyn DebuggerCallbacks>) -> VertexResult<()> {
        *self.callbacks.lock().unwrap() = Some(callbacks);
        Ok(())
    }

    fn attach(&self, pid: u32) -> VertexResult<()> {
        let callbacks = self.callbacks()?;
        self.inner.attach(pid, callbacks.as_ref())
    }

    fn detach(&self) -> VertexResult<()> {
        let callbacks = self.callbacks()?;
        self.inner.detach(0, callbacks.as_ref())
    }

    fn continue_execution(&self, _pass_exception: bool) -> VertexResult<()> {
        Ok(())
    }

    fn pause(&self) -> VertexResult<()> {
        Ok(())
    }

    fn step(&self, mode: StepMode) -> VertexResult<()> {
        let callbacks = self.callbacks()?;
        let thread_id = self.current_thread.load(Ordering::Acquire);
        self.inner.step(thread_id, mode, callbacks.as_ref())
    }

    fn run_to_address(&self, addr: u64) -> VertexResult<()> {
        let callbacks = self.callbacks()?;
        self.inner.run_to_address(addr, callbacks.as_ref())
    }

    fn set_breakpoint(&self, addr: u64, kind: BreakpointKind) -> VertexResult<u32> {
        match kind {
            BreakpointKind::Software => self.inner.breakpoints().set_software_breakpoint(addr),
            BreakpointKind::Hardware => self.inner.breakpoints().set_hardware_breakpoint(addr, 1),
        }
    }

    fn remove_breakpoint(&self, id: u32) -> VertexResult<()> {
        let kind = self
            .inner
            .breakpoints()
            .breakpoints()
            .into_iter()
            .find(|bp| bp.id == id)
            .map(|bp| bp.kind)
            .ok_or_else(|| VertexError::NotFound(format!("breakpoint {id}")))?;
        match kind {
            BreakpointKind::Software => self.inner.breakpoints().remove_software_breakpoint(id),
            BreakpointKind::Hardware => self.inner.breakpoints().remove_hardware_breakpoint(id),
        }
    }

    fn enable_breakpoint(&self, id: u32, enabled: bool) -> VertexResult<()> {
        self.inner.breakpoints().enable_software_breakpoint(id, enabled)
    }

    fn set_watchpoint(&self, wp: &WatchpointSpec) -> VertexResult<u32> {
        self.inner.breakpoints().set_watchpoint(wp)
    }

    fn remove_watchpoint(&self, id: u32) -> VertexResult<()> {
        self.inner.breakpoints().remove_watchpoint(id)
    }

    fn enable_watchpoint(&self, id: u32, enabled: bool) -> VertexResult<()> {
        self.inner.breakpoints().enable_watchpoint(id, enabled)
    }

    fn get_breakpoints(&self) -> VertexResult<Vec<Breakpoint>> {
        Ok(self.inner.breakpoints().breakpoints())
    }

    fn get_watchpoints(&self) -> VertexResult<Vec<Watchpoint>> {
        Ok(self.inner.breakpoints().watchpoints())
    }

    fn get_instruction_pointer(&self, thread_id: u32) -> VertexResult<u64> {
        self.threads.get_instruction_pointer(thread_id)
    }

    fn set_instruction_pointer(&self, thread_id: u32, value: u64) -> VertexResult<()> {
        self.threads.set_instruction_pointer(thread_id, value)
    }
}
