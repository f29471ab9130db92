//! End-to-end scenarios exercising the scanner and debugger through
//! `Facade`, against `vertex-test-plugin`'s in-memory backend instead of a
//! live process.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use vertex_core::debugger::loop_::DebugEvent;
use vertex_core::debugger::state::DebuggerState;
use vertex_core::debugger::{
    BreakpointHitEvent, BreakpointKind, DebuggerCommand, ExceptionEvent, SingleStepEvent,
    WatchpointAccess, WatchpointHitInfo, WatchpointSpec,
};
use vertex_core::error::VertexError;
use vertex_core::plugin::{DebuggerCallbacks, DebuggerPlugin, MemoryReader};
use vertex_core::registry::{Architecture, Registry};
use vertex_core::scanner::config::{Endianness, ScanConfig, ScanMode, ValueType};
use vertex_core::types::Region;
use vertex_core::Facade;
use vertex_test_plugin::{FakeDebuggerPlugin, FakeMemory, FakeThreads};

const BASE: u64 = 0x1000;
const SIZE: usize = 0x1000;

#[derive(Default)]
struct RecordingCallbacks {
    attached: Mutex<Vec<u32>>,
    breakpoint_hits: Mutex<Vec<BreakpointHitEvent>>,
    watchpoint_hits: Mutex<Vec<WatchpointHitInfo>>,
    single_steps: Mutex<Vec<SingleStepEvent>>,
    errors: Mutex<Vec<VertexError>>,
}

impl DebuggerCallbacks for RecordingCallbacks {
    fn on_attached(&self, pid: u32) {
        self.attached.lock().unwrap().push(pid);
    }
    fn on_detached(&self, _pid: u32) {}
    fn on_state_changed(&self, _old: DebuggerState, _new: DebuggerState) {}
    fn on_breakpoint_hit(&self, event: &BreakpointHitEvent) {
        self.breakpoint_hits.lock().unwrap().push(event.clone());
    }
    fn on_single_step(&self, event: &SingleStepEvent) {
        self.single_steps.lock().unwrap().push(event.clone());
    }
    fn on_exception(&self, _event: &ExceptionEvent) {}
    fn on_watchpoint_hit(&self, event: &WatchpointHitInfo) {
        self.watchpoint_hits.lock().unwrap().push(event.clone());
    }
    fn on_error(&self, error: &VertexError) {
        self.errors.lock().unwrap().push(error.clone());
    }
}

fn setup() -> (Facade, Arc<RecordingCallbacks>, Arc<FakeMemory>, Arc<FakeDebuggerPlugin>, Arc<FakeThreads>) {
    let memory = Arc::new(FakeMemory::new(BASE, SIZE));
    let threads = Arc::new(FakeThreads::new(memory.clone()));
    let debugger = Arc::new(FakeDebuggerPlugin::new(memory.clone(), threads.clone()));
    let callbacks = Arc::new(RecordingCallbacks::default());

    let mut facade = Facade::new(
        memory.clone(),
        debugger.clone(),
        callbacks.clone(),
        Registry::new(Architecture::X64),
    );
    facade.configure_dispatcher(true, 1, true);
    (facade, callbacks, memory, debugger, threads)
}

fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_millis(500);
    while !done() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert!(done(), "condition did not become true in time");
}

#[test]
fn initial_scan_finds_exact_u32_match() {
    let (facade, _callbacks, memory, _debugger, _threads) = setup();

    memory.write_memory(BASE + 0x10, &100u32.to_le_bytes()).unwrap();
    memory.write_memory(BASE + 0x20, &200u32.to_le_bytes()).unwrap();
    memory.write_memory(BASE + 0x30, &100u32.to_le_bytes()).unwrap();

    let region = Region { base: BASE, size: SIZE as u64, module_name: None };
    let config = ScanConfig {
        value_type: ValueType::U32,
        mode: ScanMode::Exact,
        input: 100u32.to_le_bytes().to_vec(),
        input2: None,
        alignment: 4,
        endianness: Endianness::host(),
        hex_display: false,
    };

    facade.first_scan(&[region], config).unwrap();

    let mut addresses: Vec<u64> = facade.scan_results().iter().map(|r| r.address).collect();
    addresses.sort();
    assert_eq!(addresses, vec![BASE + 0x10, BASE + 0x30]);
}

#[test]
fn next_scan_narrows_results_and_undo_restores_them() {
    let (facade, _callbacks, memory, _debugger, _threads) = setup();

    memory.write_memory(BASE + 0x10, &100u32.to_le_bytes()).unwrap();
    memory.write_memory(BASE + 0x20, &100u32.to_le_bytes()).unwrap();

    let region = Region { base: BASE, size: SIZE as u64, module_name: None };
    let first_config = ScanConfig {
        value_type: ValueType::U32,
        mode: ScanMode::Exact,
        input: 100u32.to_le_bytes().to_vec(),
        input2: None,
        alignment: 4,
        endianness: Endianness::host(),
        hex_display: false,
    };
    facade.first_scan(&[region], first_config).unwrap();
    assert_eq!(facade.scan_results().len(), 2);

    // Only one address actually changed to 150; Changed narrows to it.
    memory.write_memory(BASE + 0x10, &150u32.to_le_bytes()).unwrap();
    let next_config = ScanConfig {
        value_type: ValueType::U32,
        mode: ScanMode::Changed,
        input: Vec::new(),
        input2: None,
        alignment: 4,
        endianness: Endianness::host(),
        hex_display: false,
    };
    facade.next_scan(next_config).unwrap();

    let results = facade.scan_results();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].address, BASE + 0x10);

    facade.undo_scan().unwrap();
    assert_eq!(facade.scan_results().len(), 2);
}

#[test]
fn string_contains_scan_matches_embedded_substring() {
    let (facade, _callbacks, memory, _debugger, _threads) = setup();

    memory.write_memory(BASE + 0x40, b"the_quick_fox").unwrap();
    memory.write_memory(BASE + 0x60, b"nothing_here_").unwrap();

    let region = Region { base: BASE, size: SIZE as u64, module_name: None };
    let config = ScanConfig {
        value_type: ValueType::StringAscii,
        mode: ScanMode::Contains,
        input: b"quick".to_vec(),
        input2: None,
        alignment: 1,
        endianness: Endianness::host(),
        hex_display: false,
    };
    facade.first_scan(&[region], config).unwrap();

    let addresses: Vec<u64> = facade.scan_results().iter().map(|r| r.address).collect();
    assert!(addresses.contains(&(BASE + 0x40)));
    assert!(!addresses.contains(&(BASE + 0x60)));
}

#[test]
fn software_breakpoint_hit_restores_original_byte_and_counts_hit() {
    let (facade, callbacks, memory, debugger, threads) = setup();

    memory.write_memory(BASE + 0x10, &[0x90]).unwrap();
    threads.add_thread(1, BASE + 0x10, BASE + 0x800);
    debugger.run(callbacks.clone()).unwrap();
    facade.attach(1).unwrap();

    let id = facade.set_breakpoint(BASE + 0x10, BreakpointKind::Software).unwrap();
    let mut byte = [0u8; 1];
    memory.read_memory(BASE + 0x10, &mut byte).unwrap();
    assert_eq!(byte[0], 0xCC);

    debugger
        .inject_event(1, DebugEvent::BreakpointInstruction { thread_id: 1, address: BASE + 0x10 })
        .unwrap();

    memory.read_memory(BASE + 0x10, &mut byte).unwrap();
    assert_eq!(byte[0], 0x90);

    let hit = facade.breakpoints().unwrap().into_iter().find(|bp| bp.id == id).unwrap();
    assert_eq!(hit.hit_count, 1);
    assert_eq!(callbacks.breakpoint_hits.lock().unwrap().len(), 1);
}

#[test]
fn hardware_watchpoint_fires_on_simulated_write() {
    let (facade, callbacks, _memory, debugger, threads) = setup();

    threads.add_thread(1, BASE + 0x200, BASE + 0x800);
    debugger.run(callbacks.clone()).unwrap();
    facade.attach(1).unwrap();

    let id = facade
        .set_watchpoint(&WatchpointSpec { address: BASE + 0x50, size: 4, access: WatchpointAccess::Write })
        .unwrap();

    // DR6 bit 0 set => slot 0 triggered, matching the slot `set_watchpoint`
    // allocated first.
    debugger
        .inject_event(1, DebugEvent::SingleStep { thread_id: 1, address: BASE + 0x200, dr6: 0x1 })
        .unwrap();

    let watchpoint = facade.watchpoints().unwrap().into_iter().find(|wp| wp.id == id).unwrap();
    assert_eq!(watchpoint.hit_count, 1);
    assert!(watchpoint.temporarily_disabled);
    assert_eq!(callbacks.watchpoint_hits.lock().unwrap().len(), 1);
}

#[test]
fn step_over_a_call_plants_a_temporary_breakpoint_at_the_fallthrough() {
    let (facade, callbacks, memory, debugger, threads) = setup();

    // `0xE8 00 00 00 00` is a 5-byte near call the fake disassembler
    // recognizes by opcode.
    memory.write_memory(BASE + 0x10, &[0xE8, 0x00, 0x00, 0x00, 0x00]).unwrap();
    threads.add_thread(1, BASE + 0x10, BASE + 0x800);
    debugger.run(callbacks.clone()).unwrap();
    facade.attach(1).unwrap();
    debugger.inject_event(1, DebugEvent::ThreadCreated { thread_id: 1 }).unwrap();
    debugger.set_instruction_pointer(1, BASE + 0x10).unwrap();

    facade.submit_command(DebuggerCommand::Step(vertex_core::types::StepMode::StepOver));

    wait_until(|| {
        let mut byte = [0u8; 1];
        memory.read_memory(BASE + 0x15, &mut byte).unwrap();
        byte[0] == 0xCC
    });
    assert!(callbacks.errors.lock().unwrap().is_empty());
}
