//! Per-thread context access: debug registers (DR0-DR3/DR6/DR7), the
//! instruction pointer, and the single-step trap flag, plus the WoW64
//! duality (32-bit contexts on a 64-bit host need
//! `Wow64GetThreadContext`/`Wow64SetThreadContext` instead of the native
//! pair). Grounded on
//! `src/vertexusrrt/windows/debugger/breakpoints/hardware_breakpoints.cc`
//! and `src/vertexusrrt/windows/thread/thread_helpers.cc`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use vertex_core::debugger::breakpoints::DebugRegisters;
use vertex_core::debugger::loop_::ExecutionControl;
use vertex_core::debugger::ThreadContextAccess;
use vertex_core::error::{VertexError, VertexResult};
use vertex_core::plugin::MemoryReader;
use winapi::um::processthreadsapi::{GetThreadContext, SetThreadContext};
use winapi::um::winnt::{CONTEXT, CONTEXT_CONTROL, CONTEXT_DEBUG_REGISTERS, HANDLE, WOW64_CONTEXT};
use winapi::um::wow64apiset::{Wow64GetThreadContext, Wow64SetThreadContext};

const TRAP_FLAG: u32 = 0x100;

pub struct WindowsThreads<M> {
    memory: Arc<M>,
    wow64: AtomicBool,
    handles: Mutex<HashMap<u32, HANDLE>>,
}

unsafe impl<M> Send for WindowsThreads<M> {}
unsafe impl<M> Sync for WindowsThreads<M> {}

impl<M: MemoryReader> WindowsThreads<M> {
    pub fn new(memory: Arc<M>) -> Self {
        Self { memory, wow64: AtomicBool::new(false), handles: Mutex::new(HashMap::new()) }
    }

    pub fn set_wow64(&self, is_wow64: bool) {
        self.wow64.store(is_wow64, Ordering::Release);
    }

    /// Called by the debug-event pump on `CREATE_THREAD_DEBUG_EVENT`; the
    /// handle comes from the debug event itself, so no `OpenThread` call is
    /// needed here.
    pub fn register_thread(&self, thread_id: u32, handle: HANDLE) {
        self.handles.lock().unwrap().insert(thread_id, handle);
    }

    /// Called on `EXIT_THREAD_DEBUG_EVENT`. The debug event's handle is
    /// owned by the OS debug subsystem, not us, so this does not close it.
    pub fn unregister_thread(&self, thread_id: u32) {
        self.handles.lock().unwrap().remove(&thread_id);
    }

    fn handle_for(&self, thread_id: u32) -> VertexResult<HANDLE> {
        self.handles
            .lock()
            .unwrap()
            .get(&thread_id)
            .copied()
            .ok_or_else(|| VertexError::NotFound(format!("thread {thread_id} not tracked")))
    }
}

impl<M: MemoryReader> ThreadContextAccess for WindowsThreads<M> {
    fn thread_ids(&self) -> Vec<u32> {
        self.handles.lock().unwrap().keys().copied().collect()
    }

    fn read_debug_registers(&self, thread_id: u32) -> VertexResult<DebugRegisters> {
        let handle = self.handle_for(thread_id)?;

        if self.wow64.load(Ordering::Acquire) {
            let mut ctx: WOW64_CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_DEBUG_REGISTERS;
            if unsafe { Wow64GetThreadContext(handle, &mut ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "Wow64GetThreadContext failed for thread {thread_id}"
                )));
            }
            Ok(DebugRegisters {
                dr0: ctx.Dr0 as u64,
                dr1: ctx.Dr1 as u64,
                dr2: ctx.Dr2 as u64,
                dr3: ctx.Dr3 as u64,
                dr6: ctx.Dr6 as u64,
                dr7: ctx.Dr7 as u64,
            })
        } else {
            let mut ctx: CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_DEBUG_REGISTERS;
            if unsafe { GetThreadContext(handle, &mut ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "GetThreadContext failed for thread {thread_id}"
                )));
            }
            Ok(DebugRegisters {
                dr0: ctx.Dr0,
                dr1: ctx.Dr1,
                dr2: ctx.Dr2,
                dr3: ctx.Dr3,
                dr6: ctx.Dr6,
                dr7: ctx.Dr7,
            })
        }
    }

    fn write_debug_registers(&self, thread_id: u32, regs: &DebugRegisters) -> VertexResult<()> {
        let handle = self.handle_for(thread_id)?;

        if self.wow64.load(Ordering::Acquire) {
            let mut ctx: WOW64_CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_DEBUG_REGISTERS;
            ctx.Dr0 = regs.dr0 as u32;
            ctx.Dr1 = regs.dr1 as u32;
            ctx.Dr2 = regs.dr2 as u32;
            ctx.Dr3 = regs.dr3 as u32;
            ctx.Dr6 = regs.dr6 as u32;
            ctx.Dr7 = regs.dr7 as u32;
            if unsafe { Wow64SetThreadContext(handle, &ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "Wow64SetThreadContext failed for thread {thread_id}"
                )));
            }
        } else {
            let mut ctx: CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_DEBUG_REGISTERS;
            ctx.Dr0 = regs.dr0;
            ctx.Dr1 = regs.dr1;
            ctx.Dr2 = regs.dr2;
            ctx.Dr3 = regs.dr3;
            ctx.Dr6 = regs.dr6;
            ctx.Dr7 = regs.dr7;
            if unsafe { SetThreadContext(handle, &ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "SetThreadContext failed for thread {thread_id}"
                )));
            }
        }
        Ok(())
    }
}

impl<M: MemoryReader> ExecutionControl for WindowsThreads<M> {
    fn get_instruction_pointer(&self, thread_id: u32) -> VertexResult<u64> {
        let handle = self.handle_for(thread_id)?;

        if self.wow64.load(Ordering::Acquire) {
            let mut ctx: WOW64_CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_CONTROL;
            if unsafe { Wow64GetThreadContext(handle, &mut ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "Wow64GetThreadContext failed for thread {thread_id}"
                )));
            }
            Ok(ctx.Eip as u64)
        } else {
            let mut ctx: CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_CONTROL;
            if unsafe { GetThreadContext(handle, &mut ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "GetThreadContext failed for thread {thread_id}"
                )));
            }
            Ok(ctx.Rip)
        }
    }

    fn set_instruction_pointer(&self, thread_id: u32, value: u64) -> VertexResult<()> {
        let handle = self.handle_for(thread_id)?;

        if self.wow64.load(Ordering::Acquire) {
            let mut ctx: WOW64_CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_CONTROL;
            ctx.Eip = value as u32;
            if unsafe { Wow64SetThreadContext(handle, &ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "Wow64SetThreadContext failed for thread {thread_id}"
                )));
            }
        } else {
            let mut ctx: CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_CONTROL;
            ctx.Rip = value;
            if unsafe { SetThreadContext(handle, &ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "SetThreadContext failed for thread {thread_id}"
                )));
            }
        }
        Ok(())
    }

    fn arm_single_step(&self, thread_id: u32) -> VertexResult<()> {
        let handle = self.handle_for(thread_id)?;

        if self.wow64.load(Ordering::Acquire) {
            let mut ctx: WOW64_CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_CONTROL;
            if unsafe { Wow64GetThreadContext(handle, &mut ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "Wow64GetThreadContext failed for thread {thread_id}"
                )));
            }
            ctx.EFlags |= TRAP_FLAG;
            if unsafe { Wow64SetThreadContext(handle, &ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "Wow64SetThreadContext failed for thread {thread_id}"
                )));
            }
        } else {
            let mut ctx: CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_CONTROL;
            if unsafe { GetThreadContext(handle, &mut ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "GetThreadContext failed for thread {thread_id}"
                )));
            }
            ctx.EFlags |= TRAP_FLAG;
            if unsafe { SetThreadContext(handle, &ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "SetThreadContext failed for thread {thread_id}"
                )));
            }
        }
        Ok(())
    }

    fn read_return_address(&self, thread_id: u32) -> VertexResult<u64> {
        let handle = self.handle_for(thread_id)?;

        let stack_pointer = if self.wow64.load(Ordering::Acquire) {
            let mut ctx: WOW64_CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_CONTROL;
            if unsafe { Wow64GetThreadContext(handle, &mut ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "Wow64GetThreadContext failed for thread {thread_id}"
                )));
            }
            ctx.Esp as u64
        } else {
            let mut ctx: CONTEXT = unsafe { std::mem::zeroed() };
            ctx.ContextFlags = CONTEXT_CONTROL;
            if unsafe { GetThreadContext(handle, &mut ctx) } == 0 {
                return Err(VertexError::IoFailed(format!(
                    "GetThreadContext failed for thread {thread_id}"
                )));
            }
            ctx.Rsp
        };

        if self.wow64.load(Ordering::Acquire) {
            let mut bytes = [0u8; 4];
            self.memory.read_memory(stack_pointer, &mut bytes)?;
            Ok(u32::from_le_bytes(bytes) as u64)
        } else {
            let mut bytes = [0u8; 8];
            self.memory.read_memory(stack_pointer, &mut bytes)?;
            Ok(u64::from_le_bytes(bytes))
        }
    }
}
