//! Debug event dispatch: the platform-independent half of the "wait for an
//! event, react, resume" cycle. A concrete `DebugEventSource` (vertex-runtime
//! drives this over `WaitForDebugEvent`) feeds events in; this module owns
//! the state machine, breakpoint/watchpoint bookkeeping, and step-command
//! sequencing. Grounded on `debuggerworker.cc`'s event-loop shape.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::breakpoints::{BreakpointManager, ThreadContextAccess};
use super::callback::CallbackContext;
use super::state::{DebuggerState, StateMachine};
use super::types::{BreakpointHitEvent, ExceptionEvent, SingleStepEvent, WatchpointHitInfo};
use crate::error::{VertexError, VertexResult};
use crate::plugin::{DebuggerCallbacks, MemoryReader};
use crate::types::StepMode;

/// Events a platform-specific pump translates its native debug events into.
#[derive(Debug, Clone)]
pub enum DebugEvent {
    ProcessCreated { thread_id: u32 },
    ProcessExited { exit_code: u32 },
    ThreadCreated { thread_id: u32 },
    ThreadExited { thread_id: u32 },
    ModuleLoaded { base: u64 },
    ModuleUnloaded { base: u64 },
    /// A breakpoint-instruction (e.g. INT3) fault. `address` is the faulting
    /// instruction's address, already adjusted for the INT3-advances-IP
    /// quirk by the caller.
    BreakpointInstruction { thread_id: u32, address: u64 },
    SingleStep { thread_id: u32, address: u64, dr6: u64 },
    Exception(ExceptionEvent),
}

/// Per-thread execution control the loop needs beyond debug-register IO:
/// reading/setting the instruction pointer and arming a one-shot
/// single-step (trap flag). Implemented concretely by vertex-runtime.
pub trait ExecutionControl: Send + Sync {
    fn get_instruction_pointer(&self, thread_id: u32) -> VertexResult<u64>;
    fn set_instruction_pointer(&self, thread_id: u32, value: u64) -> VertexResult<()>;
    fn arm_single_step(&self, thread_id: u32) -> VertexResult<()>;
    /// Reads the return address pushed by a `call`: 4 bytes under WoW64,
    /// 8 bytes natively.
    fn read_return_address(&self, thread_id: u32) -> VertexResult<u64>;
}

/// Detects call instructions so StepOver/StepOut can place a temporary
/// breakpoint at the fallthrough address instead of single-stepping through
/// the callee. A real implementation (vertex-runtime) backs this with
/// `iced-x86`; this module only depends on the trait.
pub trait Disassembler: Send + Sync {
    /// Returns the instruction length at `bytes[0..]` and whether it is a
    /// `call`.
    fn decode_one(&self, bytes: &[u8]) -> Option<(usize, bool)>;
}

#[derive(Debug, Clone, Copy)]
enum PendingStep {
    None,
    Into,
    Over { temp_breakpoint: u32 },
    Out { temp_breakpoint: u32 },
    RunTo { temp_breakpoint: u32 },
}

pub struct DebugLoop<M, T, D>
where
    M: MemoryReader,
    T: ThreadContextAccess + ExecutionControl,
    D: Disassembler,
{
    memory: Arc<M>,
    threads: Arc<T>,
    disassembler: D,
    breakpoints: BreakpointManager<M, T>,
    state: Mutex<StateMachine>,
    callback_context: CallbackContext,
    pending_step: Mutex<PendingStep>,
    last_instruction_pointer: AtomicU64,
}

impl<M, T, D> DebugLoop<M, T, D>
where
    M: MemoryReader,
    T: ThreadContextAccess + ExecutionControl,
    D: Disassembler,
{
    pub fn new(memory: Arc<M>, threads: Arc<T>, disassembler: D) -> Self {
        let breakpoints = BreakpointManager::new(memory.clone(), threads.clone());
        Self {
            memory,
            threads,
            disassembler,
            breakpoints,
            state: Mutex::new(StateMachine::new()),
            callback_context: CallbackContext::new(),
            pending_step: Mutex::new(PendingStep::None),
            last_instruction_pointer: AtomicU64::new(0),
        }
    }

    pub fn breakpoints(&self) -> &BreakpointManager<M, T> {
        &self.breakpoints
    }

    pub fn state(&self) -> DebuggerState {
        self.state.lock().unwrap().current()
    }

    fn transition(
        &self,
        new: DebuggerState,
        callbacks: &dyn DebuggerCallbacks,
    ) -> VertexResult<()> {
        self.state.lock().unwrap().transition(new, |old, new| {
            callbacks.on_state_changed(old, new);
        })
    }

    pub fn attach(&self, pid: u32, callbacks: &dyn DebuggerCallbacks) -> VertexResult<()> {
        self.transition(DebuggerState::Attached, callbacks)?;
        callbacks.on_attached(pid);
        self.transition(DebuggerState::Running, callbacks)
    }

    pub fn detach(&self, pid: u32, callbacks: &dyn DebuggerCallbacks) -> VertexResult<()> {
        self.callback_context.invalidate_and_drain();
        self.transition(DebuggerState::Detached, callbacks)?;
        callbacks.on_detached(pid);
        Ok(())
    }

    /// Dispatches one platform event, advancing the state machine and
    /// invoking the matching `callbacks` method.
    pub fn handle_event(
        &self,
        event: DebugEvent,
        callbacks: &dyn DebuggerCallbacks,
    ) -> VertexResult<()> {
        let guard = match self.callback_context.enter() {
            Some(guard) => guard,
            None => return Ok(()),
        };
        let result = self.dispatch(event, callbacks);
        drop(guard);
        result
    }

    fn dispatch(&self, event: DebugEvent, callbacks: &dyn DebuggerCallbacks) -> VertexResult<()> {
        match event {
            DebugEvent::ProcessCreated { .. }
            | DebugEvent::ThreadCreated { .. }
            | DebugEvent::ThreadExited { .. }
            | DebugEvent::ModuleLoaded { .. }
            | DebugEvent::ModuleUnloaded { .. } => Ok(()),
            DebugEvent::ProcessExited { .. } => {
                self.transition(DebuggerState::Detached, callbacks)
            }
            DebugEvent::BreakpointInstruction { thread_id, address } => {
                self.handle_breakpoint_hit(thread_id, address, callbacks)
            }
            DebugEvent::SingleStep { thread_id, address, dr6 } => {
                self.handle_single_step(thread_id, address, dr6, callbacks)
            }
            DebugEvent::Exception(event) => {
                self.transition(DebuggerState::Exception, callbacks)?;
                callbacks.on_exception(&event);
                Ok(())
            }
        }
    }

    fn handle_breakpoint_hit(
        &self,
        thread_id: u32,
        address: u64,
        callbacks: &dyn DebuggerCallbacks,
    ) -> VertexResult<()> {
        let breakpoint = self
            .breakpoints
            .software_breakpoint_at(address)
            .ok_or_else(|| VertexError::NotFound(format!("no breakpoint at {address:#x}")))?;

        self.threads.set_instruction_pointer(thread_id, address)?;
        let original = breakpoint.original_byte.unwrap_or(0);
        self.memory.write_memory(address, &[original])?;
        self.breakpoints.record_software_hit(breakpoint.id)?;

        // Re-arm on the next instruction boundary: single-step once, then
        // the loop's SingleStep handler re-inserts the 0xCC.
        self.threads.arm_single_step(thread_id)?;
        *self.pending_step.lock().unwrap() = PendingStep::Into;
        self.last_instruction_pointer.store(address, Ordering::Release);

        self.transition(DebuggerState::BreakpointHit, callbacks)?;
        callbacks.on_breakpoint_hit(&BreakpointHitEvent {
            breakpoint_id: breakpoint.id,
            thread_id,
            address,
        });
        Ok(())
    }

    fn handle_single_step(
        &self,
        thread_id: u32,
        address: u64,
        dr6: u64,
        callbacks: &dyn DebuggerCallbacks,
    ) -> VertexResult<()> {
        if dr6 != 0 {
            if let Some(hit) = self.breakpoints.record_watchpoint_hit(dr6, address) {
                self.breakpoints.temporarily_disable_watchpoint(hit.id)?;
                self.threads.arm_single_step(thread_id)?;
                self.transition(DebuggerState::Exception, callbacks)?;
                callbacks.on_watchpoint_hit(&WatchpointHitInfo {
                    watchpoint_id: hit.id,
                    thread_id,
                    access_address: hit.last_accessor_address,
                    instruction_address: address,
                    access_type: hit.access,
                    access_size: hit.size,
                });
                return Ok(());
            }
        }

        // Re-insert any software breakpoint this single-step was re-arming.
        let pending = *self.pending_step.lock().unwrap();
        if let PendingStep::Into = pending {
            let restore_address = self.last_instruction_pointer.load(Ordering::Acquire);
            if let Some(bp) = self.breakpoints.software_breakpoint_at(restore_address) {
                self.memory.write_memory(bp.address, &[0xCC])?;
            }
        }

        callbacks.on_single_step(&SingleStepEvent { thread_id, address });
        self.transition(DebuggerState::Stepping, callbacks)?;
        *self.pending_step.lock().unwrap() = PendingStep::None;
        Ok(())
    }

    /// Issues `mode`, arming whatever mechanism (trap flag or temp
    /// breakpoint) the mode requires.
    pub fn step(
        &self,
        thread_id: u32,
        mode: StepMode,
        callbacks: &dyn DebuggerCallbacks,
    ) -> VertexResult<()> {
        match mode {
            StepMode::StepInto => {
                self.threads.arm_single_step(thread_id)?;
                *self.pending_step.lock().unwrap() = PendingStep::Into;
            }
            StepMode::StepOver => {
                let ip = self.threads.get_instruction_pointer(thread_id)?;
                let mut bytes = [0u8; 16];
                self.memory.read_memory(ip, &mut bytes)?;
                match self.disassembler.decode_one(&bytes) {
                    Some((length, true)) => {
                        let fallthrough = ip + length as u64;
                        let id = self.breakpoints.set_software_breakpoint(fallthrough)?;
                        *self.pending_step.lock().unwrap() = PendingStep::Over { temp_breakpoint: id };
                    }
                    _ => {
                        self.threads.arm_single_step(thread_id)?;
                        *self.pending_step.lock().unwrap() = PendingStep::Into;
                    }
                }
            }
            StepMode::StepOut => {
                let return_address = self.threads.read_return_address(thread_id)?;
                let id = self.breakpoints.set_software_breakpoint(return_address)?;
                *self.pending_step.lock().unwrap() = PendingStep::Out { temp_breakpoint: id };
            }
        }
        self.transition(DebuggerState::Running, callbacks)
    }

    pub fn run_to_address(
        &self,
        address: u64,
        callbacks: &dyn DebuggerCallbacks,
    ) -> VertexResult<()> {
        let id = self.breakpoints.set_software_breakpoint(address)?;
        *self.pending_step.lock().unwrap() = PendingStep::RunTo { temp_breakpoint: id };
        self.transition(DebuggerState::Running, callbacks)
    }

    /// Called once a temporary breakpoint placed by `step`/`run_to_address`
    /// has actually fired, to clean it up before resuming normally.
    pub fn clear_temporary_step_breakpoint(&self) -> VertexResult<()> {
        let pending = {
            let mut guard = self.pending_step.lock().unwrap();
            std::mem::replace(&mut *guard, PendingStep::None)
        };
        match pending {
            PendingStep::Over { temp_breakpoint } | PendingStep::Out { temp_breakpoint } | PendingStep::RunTo { temp_breakpoint } => {
                self.breakpoints.remove_software_breakpoint(temp_breakpoint)
            }
            PendingStep::Into | PendingStep::None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use crate::debugger::breakpoints::DebugRegisters;
    use crate::types::{ProcessInfo, Region};

    struct FakeMemory {
        bytes: StdMutex<HashMap<u64, u8>>,
    }

    impl FakeMemory {
        fn new() -> Self {
            Self { bytes: StdMutex::new(HashMap::new()) }
        }
    }

    impl MemoryReader for FakeMemory {
        fn read_memory(&self, address: u64, out: &mut [u8]) -> VertexResult<()> {
            let bytes = self.bytes.lock().unwrap();
            for (i, b) in out.iter_mut().enumerate() {
                *b = *bytes.get(&(address + i as u64)).unwrap_or(&0x90);
            }
            Ok(())
        }
        fn write_memory(&self, address: u64, data: &[u8]) -> VertexResult<()> {
            let mut bytes = self.bytes.lock().unwrap();
            for (i, b) in data.iter().enumerate() {
                bytes.insert(address + i as u64, *b);
            }
            Ok(())
        }
        fn enumerate_regions(&self) -> VertexResult<Vec<Region>> {
            Ok(vec![])
        }
        fn kill_process(&self) -> VertexResult<()> {
            Ok(())
        }
        fn is_process_valid(&self) -> VertexResult<bool> {
            Ok(true)
        }
        fn list_processes(&self) -> VertexResult<Vec<ProcessInfo>> {
            Ok(vec![])
        }
        fn open_process(&self, _pid: u32) -> VertexResult<()> {
            Ok(())
        }
        fn pointer_size(&self) -> VertexResult<u8> {
            Ok(8)
        }
    }

    struct FakeThreads {
        registers: StdMutex<HashMap<u32, DebugRegisters>>,
        ip: StdMutex<HashMap<u32, u64>>,
    }

    impl FakeThreads {
        fn new() -> Self {
            let mut registers = HashMap::new();
            registers.insert(1, DebugRegisters::default());
            let mut ip = HashMap::new();
            ip.insert(1, 0);
            Self { registers: StdMutex::new(registers), ip: StdMutex::new(ip) }
        }
    }

    impl ThreadContextAccess for FakeThreads {
        fn thread_ids(&self) -> Vec<u32> {
            self.registers.lock().unwrap().keys().copied().collect()
        }
        fn read_debug_registers(&self, thread_id: u32) -> VertexResult<DebugRegisters> {
            Ok(*self.registers.lock().unwrap().get(&thread_id).unwrap())
        }
        fn write_debug_registers(&self, thread_id: u32, regs: &DebugRegisters) -> VertexResult<()> {
            self.registers.lock().unwrap().insert(thread_id, *regs);
            Ok(())
        }
    }

    impl ExecutionControl for FakeThreads {
        fn get_instruction_pointer(&self, thread_id: u32) -> VertexResult<u64> {
            Ok(*self.ip.lock().unwrap().get(&thread_id).unwrap_or(&0))
        }
        fn set_instruction_pointer(&self, thread_id: u32, value: u64) -> VertexResult<()> {
            self.ip.lock().unwrap().insert(thread_id, value);
            Ok(())
        }
        fn arm_single_step(&self, _thread_id: u32) -> VertexResult<()> {
            Ok(())
        }
        fn read_return_address(&self, _thread_id: u32) -> VertexResult<u64> {
            Ok(0x4000)
        }
    }

    struct NeverCallDisassembler;
    impl Disassembler for NeverCallDisassembler {
        fn decode_one(&self, _bytes: &[u8]) -> Option<(usize, bool)> {
            Some((1, false))
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        attached: StdMutex<Vec<u32>>,
        breakpoint_hits: StdMutex<Vec<BreakpointHitEvent>>,
        state_changes: StdMutex<Vec<(DebuggerState, DebuggerState)>>,
    }

    impl DebuggerCallbacks for RecordingCallbacks {
        fn on_attached(&self, pid: u32) {
            self.attached.lock().unwrap().push(pid);
        }
        fn on_detached(&self, _pid: u32) {}
        fn on_state_changed(&self, old: DebuggerState, new: DebuggerState) {
            self.state_changes.lock().unwrap().push((old, new));
        }
        fn on_breakpoint_hit(&self, event: &BreakpointHitEvent) {
            self.breakpoint_hits.lock().unwrap().push(event.clone());
        }
        fn on_single_step(&self, _event: &SingleStepEvent) {}
        fn on_exception(&self, _event: &ExceptionEvent) {}
        fn on_watchpoint_hit(&self, _event: &WatchpointHitInfo) {}
        fn on_error(&self, _error: &VertexError) {}
    }

    fn harness() -> (DebugLoop<FakeMemory, FakeThreads, NeverCallDisassembler>, RecordingCallbacks) {
        let loop_ = DebugLoop::new(Arc::new(FakeMemory::new()), Arc::new(FakeThreads::new()), NeverCallDisassembler);
        (loop_, RecordingCallbacks::default())
    }

    #[test]
    fn attach_transitions_through_attached_to_running() {
        let (loop_, callbacks) = harness();
        loop_.attach(42, &callbacks).unwrap();
        assert_eq!(loop_.state(), DebuggerState::Running);
        assert_eq!(*callbacks.attached.lock().unwrap(), vec![42]);
        assert_eq!(
            *callbacks.state_changes.lock().unwrap(),
            vec![
                (DebuggerState::Detached, DebuggerState::Attached),
                (DebuggerState::Attached, DebuggerState::Running)
            ]
        );
    }

    #[test]
    fn breakpoint_hit_restores_original_byte_and_fires_callback() {
        let (loop_, callbacks) = harness();
        loop_.attach(1, &callbacks).unwrap();

        loop_.memory.write_memory(0x5000, &[0x90]).unwrap();
        let id = loop_.breakpoints().set_software_breakpoint(0x5000).unwrap();

        loop_
            .handle_event(DebugEvent::BreakpointInstruction { thread_id: 1, address: 0x5000 }, &callbacks)
            .unwrap();

        let mut byte = [0u8];
        loop_.memory.read_memory(0x5000, &mut byte).unwrap();
        assert_eq!(byte[0], 0x90);
        assert_eq!(loop_.state(), DebuggerState::BreakpointHit);

        let hits = callbacks.breakpoint_hits.lock().unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].breakpoint_id, id);
    }

    #[test]
    fn single_step_after_breakpoint_reinserts_int3() {
        let (loop_, callbacks) = harness();
        loop_.attach(1, &callbacks).unwrap();
        loop_.memory.write_memory(0x5000, &[0x90]).unwrap();
        loop_.breakpoints().set_software_breakpoint(0x5000).unwrap();
        loop_
            .handle_event(DebugEvent::BreakpointInstruction { thread_id: 1, address: 0x5000 }, &callbacks)
            .unwrap();

        loop_
            .handle_event(DebugEvent::SingleStep { thread_id: 1, address: 0x5001, dr6: 0 }, &callbacks)
            .unwrap();

        let mut byte = [0u8];
        loop_.memory.read_memory(0x5000, &mut byte).unwrap();
        assert_eq!(byte[0], 0xCC);
    }

    #[test]
    fn step_over_non_call_falls_back_to_single_step() {
        let (loop_, callbacks) = harness();
        loop_.attach(1, &callbacks).unwrap();
        loop_.step(1, StepMode::StepOver, &callbacks).unwrap();
        assert_eq!(loop_.state(), DebuggerState::Running);
    }

    #[test]
    fn run_to_address_plants_and_clears_temp_breakpoint() {
        let (loop_, callbacks) = harness();
        loop_.attach(1, &callbacks).unwrap();
        loop_.memory.write_memory(0x6000, &[0x90]).unwrap();
        loop_.run_to_address(0x6000, &callbacks).unwrap();

        let mut byte = [0u8];
        loop_.memory.read_memory(0x6000, &mut byte).unwrap();
        assert_eq!(byte[0], 0xCC);

        loop_.clear_temporary_step_breakpoint().unwrap();
        loop_.memory.read_memory(0x6000, &mut byte).unwrap();
        assert_eq!(byte[0], 0x90);
    }
}
