//! Top-level facade: the one object a UI layer talks to. Command submission
//! goes through the Thread Dispatcher so the caller's thread never blocks on
//! scanner/debugger I/O; snapshot reads are synchronous and cheap (lock
//! reads over already-computed state). Grounded on
//! `src/vertex/facade/vertexfacade.cc`.

use std::sync::Arc;

use crate::debugger::{Breakpoint, DebuggerCommand, Watchpoint, WatchpointSpec};
use crate::dispatch::ThreadDispatcher;
use crate::error::VertexResult;
use crate::plugin::{DebuggerCallbacks, DebuggerPlugin, MemoryReader, ModuleInspector};
use crate::registry::Registry;
use crate::scanner::config::ScanConfig;
use crate::scanner::store::ScanResultRecord;
use crate::scanner::MemoryScanner;
use crate::types::{ExportEntry, ImportEntry, RegisterSet, Region};

pub struct Facade {
    memory: Arc<dyn MemoryReader>,
    debugger: Arc<dyn DebuggerPlugin>,
    callbacks: Arc<dyn DebuggerCallbacks>,
    scanner: MemoryScanner<dyn MemoryReader>,
    registry: Registry,
    dispatcher: Arc<ThreadDispatcher>,
    module_inspector: Option<Arc<dyn ModuleInspector>>,
}

impl Facade {
    pub fn new(
        memory: Arc<dyn MemoryReader>,
        debugger: Arc<dyn DebuggerPlugin>,
        callbacks: Arc<dyn DebuggerCallbacks>,
        registry: Registry,
    ) -> Self {
        let dispatcher = Arc::new(ThreadDispatcher::new());
        let scanner = MemoryScanner::new(memory.clone(), dispatcher.clone());
        Self {
            memory,
            debugger,
            callbacks,
            scanner,
            registry,
            dispatcher,
            module_inspector: None,
        }
    }

    pub fn configure_dispatcher(&mut self, single_threaded: bool, scanner_workers: usize, debugger_independent: bool) {
        self.dispatcher.configure(single_threaded, scanner_workers, debugger_independent);
    }

    /// Installs the image-format parser module inspection reads will use
    /// (`vertex-runtime::PeModuleInspector` on Windows). Left unset, the
    /// engine still works end to end; `module_exports`/`module_imports`
    /// simply report `Unsupported`.
    pub fn set_module_inspector(&mut self, inspector: Arc<dyn ModuleInspector>) {
        self.module_inspector = Some(inspector);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Best-effort register snapshot for a stopped thread. The plugin
    /// boundary only exposes the instruction pointer (§6), so only that
    /// field is populated; a richer `RegisterSet` would require a plugin
    /// method this repo's trait surface does not carry.
    pub fn cached_registers(&self, thread_id: u32) -> VertexResult<RegisterSet> {
        let instruction_pointer = self.debugger.get_instruction_pointer(thread_id)?;
        Ok(RegisterSet { instruction_pointer, ..RegisterSet::default() })
    }

    /// Reads `region`'s bytes out of the target and parses its export
    /// table. Fails with `Unsupported` if no `ModuleInspector` was
    /// installed, or `NotFound` if no enumerated region matches
    /// `module_name`.
    pub fn module_exports(&self, module_name: &str) -> VertexResult<Vec<ExportEntry>> {
        let image = self.read_module_image(module_name)?;
        self.inspector()?.read_exports(&image)
    }

    pub fn module_imports(&self, module_name: &str) -> VertexResult<Vec<ImportEntry>> {
        let image = self.read_module_image(module_name)?;
        self.inspector()?.read_imports(&image)
    }

    fn inspector(&self) -> VertexResult<&Arc<dyn ModuleInspector>> {
        self.module_inspector
            .as_ref()
            .ok_or_else(|| crate::error::VertexError::Unsupported("no module inspector installed".into()))
    }

    fn read_module_image(&self, module_name: &str) -> VertexResult<Vec<u8>> {
        let region = self
            .memory
            .enumerate_regions()?
            .into_iter()
            .find(|region| region.module_name.as_deref() == Some(module_name))
            .ok_or_else(|| crate::error::VertexError::NotFound(format!("module {module_name}")))?;
        let mut image = vec![0u8; region.size as usize];
        self.memory.read_memory(region.base, &mut image)?;
        Ok(image)
    }

    // ---- Command submission (routed through the dispatcher, non-blocking) ----

    /// Submits a debugger command onto the debugger channel. Errors surface
    /// through `on_error` rather than this call's return value, since the
    /// command runs asynchronously on the dedicated debugger thread.
    pub fn submit_command(&self, command: DebuggerCommand) {
        let debugger = self.debugger.clone();
        let callbacks = self.callbacks.clone();
        let task: crate::dispatch::Task = Box::new(move || {
            let result = match command {
                DebuggerCommand::Attach => Err(crate::error::VertexError::Unsupported(
                    "attach requires a pid; use attach() directly".into(),
                )),
                DebuggerCommand::Detach => debugger.detach(),
                DebuggerCommand::Continue => debugger.continue_execution(false),
                DebuggerCommand::Pause => debugger.pause(),
                DebuggerCommand::Step(mode) => debugger.step(mode),
                DebuggerCommand::RunToAddress(address) => debugger.run_to_address(address),
                DebuggerCommand::Shutdown => debugger.detach(),
            };
            if let Err(error) = result {
                callbacks.on_error(&error);
            }
        });
        if let Err(error) = self.dispatcher.dispatch_debugger(task) {
            self.callbacks.on_error(&error);
        }
    }

    pub fn attach(&self, pid: u32) -> VertexResult<()> {
        self.debugger.attach(pid)
    }

    pub fn first_scan(&self, regions: &[Region], config: ScanConfig) -> VertexResult<()> {
        self.scanner.first_scan(regions, config)
    }

    pub fn next_scan(&self, config: ScanConfig) -> VertexResult<()> {
        self.scanner.next_scan(config)
    }

    pub fn scan_results(&self) -> Vec<ScanResultRecord> {
        self.scanner.results()
    }

    /// Results whose address falls within `[start, end)`, for a UI paging
    /// through a potentially large result set without copying the whole
    /// thing every frame.
    pub fn scan_results_range(&self, start: u64, end: u64) -> Vec<ScanResultRecord> {
        self.scanner
            .results()
            .into_iter()
            .filter(|record| record.address >= start && record.address < end)
            .collect()
    }

    pub fn undo_scan(&self) -> VertexResult<()> {
        self.scanner.undo()
    }

    pub fn abort_scan(&self) {
        self.scanner.abort();
    }

    /// Blocks the calling thread until the in-flight scan's workers finish,
    /// bounded by `timeout_ms` (defaults to a 5000ms bound). Returns whether
    /// the scan actually completed within the bound.
    pub fn wait_for_scan_completion(&self, timeout_ms: Option<u64>) -> bool {
        self.scanner.wait_for_completion(timeout_ms)
    }

    // ---- Synchronous snapshot reads ----

    pub fn breakpoints(&self) -> VertexResult<Vec<Breakpoint>> {
        self.debugger.get_breakpoints()
    }

    pub fn watchpoints(&self) -> VertexResult<Vec<Watchpoint>> {
        self.debugger.get_watchpoints()
    }

    pub fn set_breakpoint(&self, address: u64, kind: crate::debugger::BreakpointKind) -> VertexResult<u32> {
        self.debugger.set_breakpoint(address, kind)
    }

    pub fn set_watchpoint(&self, spec: &WatchpointSpec) -> VertexResult<u32> {
        self.debugger.set_watchpoint(spec)
    }

    pub fn enumerate_regions(&self) -> VertexResult<Vec<Region>> {
        self.memory.enumerate_regions()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::state::DebuggerState;
    use crate::debugger::{BreakpointHitEvent, ExceptionEvent, SingleStepEvent, WatchpointAccess, WatchpointHitInfo};
    use crate::error::{VertexError, VertexResult as Result};
    use crate::registry::Architecture;
    use crate::types::{ProcessInfo, StepMode};
    use std::sync::Mutex;

    struct NullMemory;
    impl MemoryReader for NullMemory {
        fn read_memory(&self, _address: u64, _out: &mut [u8]) -> Result<()> {
            Ok(())
        }
        fn write_memory(&self, _address: u64, _data: &[u8]) -> Result<()> {
            Ok(())
        }
        fn enumerate_regions(&self) -> Result<Vec<Region>> {
            Ok(vec![])
        }
        fn kill_process(&self) -> Result<()> {
            Ok(())
        }
        fn is_process_valid(&self) -> Result<bool> {
            Ok(true)
        }
        fn list_processes(&self) -> Result<Vec<ProcessInfo>> {
            Ok(vec![])
        }
        fn open_process(&self, _pid: u32) -> Result<()> {
            Ok(())
        }
        fn pointer_size(&self) -> Result<u8> {
            Ok(8)
        }
    }

    struct NullDebugger {
        detach_calls: Mutex<u32>,
    }

    impl DebuggerPlugin for NullDebugger {
        fn run(&self, _callbacks: Arc<dyn DebuggerCallbacks>) -> Result<()> {
            Ok(())
        }
        fn attach(&self, _pid: u32) -> Result<()> {
            Ok(())
        }
        fn detach(&self) -> Result<()> {
            *self.detach_calls.lock().unwrap() += 1;
            Ok(())
        }
        fn continue_execution(&self, _pass_exception: bool) -> Result<()> {
            Ok(())
        }
        fn pause(&self) -> Result<()> {
            Ok(())
        }
        fn step(&self, _mode: StepMode) -> Result<()> {
            Ok(())
        }
        fn run_to_address(&self, _addr: u64) -> Result<()> {
            Ok(())
        }
        fn set_breakpoint(&self, _addr: u64, _kind: crate::debugger::BreakpointKind) -> Result<u32> {
            Ok(1)
        }
        fn remove_breakpoint(&self, _id: u32) -> Result<()> {
            Ok(())
        }
        fn enable_breakpoint(&self, _id: u32, _enabled: bool) -> Result<()> {
            Ok(())
        }
        fn set_watchpoint(&self, _wp: &WatchpointSpec) -> Result<u32> {
            Ok(1)
        }
        fn remove_watchpoint(&self, _id: u32) -> Result<()> {
            Ok(())
        }
        fn enable_watchpoint(&self, _id: u32, _enabled: bool) -> Result<()> {
            Ok(())
        }
        fn get_breakpoints(&self) -> Result<Vec<Breakpoint>> {
            Ok(vec![])
        }
        fn get_watchpoints(&self) -> Result<Vec<Watchpoint>> {
            Ok(vec![])
        }
        fn get_instruction_pointer(&self, _thread_id: u32) -> Result<u64> {
            Ok(0)
        }
        fn set_instruction_pointer(&self, _thread_id: u32, _value: u64) -> Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingCallbacks {
        errors: Mutex<Vec<VertexError>>,
    }

    impl DebuggerCallbacks for RecordingCallbacks {
        fn on_attached(&self, _pid: u32) {}
        fn on_detached(&self, _pid: u32) {}
        fn on_state_changed(&self, _old: DebuggerState, _new: DebuggerState) {}
        fn on_breakpoint_hit(&self, _event: &BreakpointHitEvent) {}
        fn on_single_step(&self, _event: &SingleStepEvent) {}
        fn on_exception(&self, _event: &ExceptionEvent) {}
        fn on_watchpoint_hit(&self, _event: &WatchpointHitInfo) {}
        fn on_error(&self, error: &VertexError) {
            self.errors.lock().unwrap().push(error.clone());
        }
    }

    fn facade() -> (Facade, Arc<RecordingCallbacks>) {
        let callbacks = Arc::new(RecordingCallbacks::default());
        let mut facade = Facade::new(
            Arc::new(NullMemory),
            Arc::new(NullDebugger { detach_calls: Mutex::new(0) }),
            callbacks.clone(),
            Registry::new(Architecture::X64),
        );
        facade.configure_dispatcher(true, 1, true);
        (facade, callbacks)
    }

    #[test]
    fn breakpoints_and_watchpoints_snapshot_reads_delegate_to_plugin() {
        let (facade, _callbacks) = facade();
        assert!(facade.breakpoints().unwrap().is_empty());
        assert!(facade.watchpoints().unwrap().is_empty());
    }

    #[test]
    fn submit_command_detach_runs_asynchronously_without_error() {
        let (facade, callbacks) = facade();
        facade.submit_command(DebuggerCommand::Detach);

        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(500);
        while callbacks.errors.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(callbacks.errors.lock().unwrap().is_empty());
    }

    #[test]
    fn submit_command_attach_reports_unsupported_error() {
        let (facade, callbacks) = facade();
        facade.submit_command(DebuggerCommand::Attach);

        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(500);
        while callbacks.errors.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(matches!(
            callbacks.errors.lock().unwrap().first(),
            Some(VertexError::Unsupported(_))
        ));
    }
}
