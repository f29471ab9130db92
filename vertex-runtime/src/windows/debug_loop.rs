//! `WaitForDebugEvent` pump: translates native `DEBUG_EVENT`s into
//! `vertex_core::debugger::loop_::DebugEvent`s and drives a `DebugLoop`.
//! Grounded on `src/vertex/debugger/debuggerworker.cc`'s event-loop shape
//! and `src/vertexusrrt/windows/debugger/debuggerstate.cc`.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use vertex_core::debugger::loop_::{DebugEvent, DebugLoop, ExecutionControl};
use vertex_core::debugger::{Breakpoint, BreakpointKind, ThreadContextAccess, Watchpoint, WatchpointSpec};
use vertex_core::error::{VertexError, VertexResult};
use vertex_core::plugin::{DebuggerCallbacks, DebuggerPlugin};
use vertex_core::registry::Architecture;
use vertex_core::types::StepMode;
use winapi::um::debugapi::{ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, WaitForDebugEvent};
use winapi::um::minwinbase::{
    CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT, DEBUG_EVENT, EXCEPTION_DEBUG_EVENT,
    EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT, LOAD_DLL_DEBUG_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use winapi::um::winnt::{DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, EXCEPTION_BREAKPOINT, EXCEPTION_SINGLE_STEP};
use winapi::um::wow64apiset::IsWow64Process;

use super::disassembler::IcedDisassembler;
use super::process::WindowsProcess;
use super::threads::WindowsThreads;

const WAIT_TIMEOUT_MS: u32 = 100;

struct PauseGate {
    paused: Mutex<bool>,
    condvar: Condvar,
}

impl PauseGate {
    fn new() -> Self {
        Self { paused: Mutex::new(false), condvar: Condvar::new() }
    }

    fn pause(&self) {
        *self.paused.lock().unwrap() = true;
    }

    fn resume(&self) {
        *self.paused.lock().unwrap() = false;
        self.condvar.notify_all();
    }

    fn wait_if_paused(&self) {
        let mut paused = self.paused.lock().unwrap();
        while *paused {
            paused = self.condvar.wait(paused).unwrap();
        }
    }
}

pub struct WindowsDebugger {
    process: Arc<WindowsProcess>,
    threads: Arc<WindowsThreads<WindowsProcess>>,
    inner: Arc<DebugLoop<WindowsProcess, WindowsThreads<WindowsProcess>, IcedDisassembler>>,
    callbacks: Mutex<Option<Arc<dyn DebuggerCallbacks>>>,
    current_thread: AtomicU32,
    running: Arc<AtomicBool>,
    pause_gate: Arc<PauseGate>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl WindowsDebugger {
    pub fn new(architecture: Architecture) -> Self {
        let process = Arc::new(WindowsProcess::new());
        let threads = Arc::new(WindowsThreads::new(process.clone()));
        let inner = Arc::new(DebugLoop::new(
            process.clone(),
            threads.clone(),
            IcedDisassembler::new(architecture),
        ));
        Self {
            process,
            threads,
            inner,
            callbacks: Mutex::new(None),
            current_thread: AtomicU32::new(0),
            running: Arc::new(AtomicBool::new(false)),
            pause_gate: Arc::new(PauseGate::new()),
            pump: Mutex::new(None),
        }
    }

    fn callbacks(&self) -> VertexResult<Arc<dyn DebuggerCallbacks>> {
        self.callbacks
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| VertexError::ProtocolViolation("run() was never called".into()))
    }

    /// The `MemoryReader` backing this debugger's target process, shared so
    /// a caller can hand the same process to `Facade::new` for scanning
    /// without opening the target twice.
    pub fn process(&self) -> Arc<WindowsProcess> {
        self.process.clone()
    }

    fn translate_event(event: &DEBUG_EVENT, threads: &WindowsThreads<WindowsProcess>) -> Option<DebugEvent> {
        let thread_id = event.dwThreadId;
        match event.dwDebugEventCode {
            CREATE_PROCESS_DEBUG_EVENT => {
                let info = unsafe { event.u.CreateProcessInfo() };
                threads.register_thread(thread_id, info.hThread);
                None
            }
            CREATE_THREAD_DEBUG_EVENT => {
                let info = unsafe { event.u.CreateThread() };
                threads.register_thread(thread_id, info.hThread);
                Some(DebugEvent::ThreadCreated { thread_id })
            }
            EXIT_THREAD_DEBUG_EVENT => {
                threads.unregister_thread(thread_id);
                Some(DebugEvent::ThreadExited { thread_id })
            }
            EXIT_PROCESS_DEBUG_EVENT => {
                let info = unsafe { event.u.ExitProcess() };
                Some(DebugEvent::ProcessExited { exit_code: info.dwExitCode })
            }
            LOAD_DLL_DEBUG_EVENT => {
                let info = unsafe { event.u.LoadDll() };
                Some(DebugEvent::ModuleLoaded { base: info.lpBaseOfDll as u64 })
            }
            UNLOAD_DLL_DEBUG_EVENT => {
                let info = unsafe { event.u.UnloadDll() };
                Some(DebugEvent::ModuleUnloaded { base: info.lpBaseOfDll as u64 })
            }
            EXCEPTION_DEBUG_EVENT => {
                let info = unsafe { event.u.Exception() };
                let record = &info.ExceptionRecord;
                let address = record.ExceptionAddress as u64;
                match record.ExceptionCode {
                    EXCEPTION_BREAKPOINT => Some(DebugEvent::BreakpointInstruction { thread_id, address }),
                    EXCEPTION_SINGLE_STEP => {
                        let dr6 = threads
                            .read_debug_registers(thread_id)
                            .map(|regs| regs.dr6)
                            .unwrap_or(0);
                        Some(DebugEvent::SingleStep { thread_id, address, dr6 })
                    }
                    code => Some(DebugEvent::Exception(vertex_core::debugger::ExceptionEvent {
                        thread_id,
                        code,
                        address,
                        is_first_chance: info.dwFirstChance != 0,
                    })),
                }
            }
            _ => None,
        }
    }

    fn pump_loop(
        pid: u32,
        inner: Arc<DebugLoop<WindowsProcess, WindowsThreads<WindowsProcess>, IcedDisassembler>>,
        threads: Arc<WindowsThreads<WindowsProcess>>,
        callbacks: Arc<dyn DebuggerCallbacks>,
        running: Arc<AtomicBool>,
        pause_gate: Arc<PauseGate>,
        current_thread: Arc<AtomicU32>,
    ) {
        while running.load(Ordering::Acquire) {
            pause_gate.wait_if_paused();

            let mut event: DEBUG_EVENT = unsafe { std::mem::zeroed() };
            let got_event = unsafe { WaitForDebugEvent(&mut event, WAIT_TIMEOUT_MS) };
            if got_event == 0 {
                continue;
            }

            current_thread.store(event.dwThreadId, Ordering::Release);
            let code = event.dwDebugEventCode;
            let translated = Self::translate_event(&event, &threads);
            let process_exited = code == EXIT_PROCESS_DEBUG_EVENT;

            let continue_status = match code {
                EXCEPTION_DEBUG_EVENT => {
                    if let Some(DebugEvent::Exception(_)) = &translated {
                        DBG_EXCEPTION_NOT_HANDLED
                    } else {
                        DBG_CONTINUE
                    }
                }
                _ => DBG_CONTINUE,
            };

            if let Some(native_event) = translated {
                if let Err(error) = inner.handle_event(native_event, callbacks.as_ref()) {
                    callbacks.on_error(&error);
                }
            }

            unsafe { ContinueDebugEvent(pid, event.dwThreadId, continue_status as u32) };

            if process_exited {
                running.store(false, Ordering::Release);
            }
        }
    }
}

impl DebuggerPlugin for WindowsDebugger {
    fn run(&self, callbacks: Arc<dyn DebuggerCallbacks>) -> VertexResult<()> {
        *self.callbacks.lock().unwrap() = Some(callbacks);
        Ok(())
    }

    fn attach(&self, pid: u32) -> VertexResult<()> {
        self.process.open_process(pid)?;

        let mut is_wow64 = 0;
        unsafe { IsWow64Process(self.process.raw_handle()?, &mut is_wow64) };
        self.threads.set_wow64(is_wow64 != 0);

        if unsafe { DebugActiveProcess(pid) } == 0 {
            return Err(VertexError::IoFailed(format!("DebugActiveProcess failed for pid {pid}")));
        }

        let callbacks = self.callbacks()?;
        self.inner.attach(pid, callbacks.as_ref())?;
        self.running.store(true, Ordering::Release);

        let inner = self.inner.clone();
        let threads = self.threads.clone();
        let running = self.running.clone();
        let pause_gate = self.pause_gate.clone();
        let current_thread = Arc::new(AtomicU32::new(0));
        *self.pump.lock().unwrap() = Some(std::thread::spawn(move || {
            Self::pump_loop(pid, inner, threads, callbacks, running, pause_gate, current_thread);
        }));

        Ok(())
    }

    fn detach(&self) -> VertexResult<()> {
        let pid = self.process.pid();
        self.running.store(false, Ordering::Release);
        self.pause_gate.resume();
        if let Some(handle) = self.pump.lock().unwrap().take() {
            let _ = handle.join();
        }
        unsafe { DebugActiveProcessStop(pid) };
        let callbacks = self.callbacks()?;
        self.inner.detach(pid, callbacks.as_ref())
    }

    fn continue_execution(&self, _pass_exception: bool) -> VertexResult<()> {
        self.pause_gate.resume();
        Ok(())
    }

    fn pause(&self) -> VertexResult<()> {
        self.pause_gate.pause();
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
        let kind = self
            .inner
            .breakpoints()
            .breakpoints()
            .into_iter()
            .find(|bp| bp.id == id)
            .map(|bp| bp.kind)
            .ok_or_else(|| VertexError::NotFound(format!("breakpoint {id}")))?;
        match kind {
            BreakpointKind::Software => self.inner.breakpoints().enable_software_breakpoint(id, enabled),
            BreakpointKind::Hardware => Err(VertexError::Unsupported(
                "hardware breakpoints cannot be toggled without removing them".into(),
            )),
        }
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
