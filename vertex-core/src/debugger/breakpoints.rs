//! Breakpoint Manager: software INT3 table, hardware DR-register allocator,
//! watchpoint table, per-thread propagation. Grounded on
//! `src/vertexusrrt/windows/debugger/breakpoints/hardware_breakpoints.cc`.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use super::dr7::{self, Condition};
use super::types::{
    Breakpoint, BreakpointKind, BreakpointState, Watchpoint, WatchpointAccess, WatchpointSpec,
};
use crate::error::{VertexError, VertexResult};
use crate::plugin::MemoryReader;

const SOFTWARE_BREAKPOINT_BYTE: u8 = 0xCC;
const HW_SLOT_COUNT: u8 = 4;

/// Per-thread debug-register snapshot, read/written as one unit so the
/// condition/length/local-enable bits of every slot stay consistent.
#[derive(Debug, Clone, Copy, Default)]
pub struct DebugRegisters {
    pub dr0: u64,
    pub dr1: u64,
    pub dr2: u64,
    pub dr3: u64,
    pub dr6: u64,
    pub dr7: u64,
}

impl DebugRegisters {
    fn address_slot(&self, slot: u8) -> u64 {
        match slot {
            0 => self.dr0,
            1 => self.dr1,
            2 => self.dr2,
            3 => self.dr3,
            _ => unreachable!(),
        }
    }

    fn set_address_slot(&mut self, slot: u8, address: u64) {
        match slot {
            0 => self.dr0 = address,
            1 => self.dr1 = address,
            2 => self.dr2 = address,
            3 => self.dr3 = address,
            _ => unreachable!(),
        }
    }
}

/// Per-thread register read/write, suspend/resume: the OS-specific half of
/// hardware breakpoint propagation. Implemented concretely by
/// `vertex-runtime` (native and WoW64).
pub trait ThreadContextAccess: Send + Sync {
    fn thread_ids(&self) -> Vec<u32>;
    fn read_debug_registers(&self, thread_id: u32) -> VertexResult<DebugRegisters>;
    fn write_debug_registers(&self, thread_id: u32, regs: &DebugRegisters) -> VertexResult<()>;
}

enum HwOwner {
    Breakpoint(u32),
    Watchpoint(u32),
}

struct SoftwareEntry {
    breakpoint: Breakpoint,
}

struct Inner {
    software: Vec<SoftwareEntry>,
    hw_slots: [Option<HwOwner>; 4],
    watchpoints: Vec<Watchpoint>,
}

pub struct BreakpointManager<M: MemoryReader, T: ThreadContextAccess> {
    memory: std::sync::Arc<M>,
    threads: std::sync::Arc<T>,
    next_id: AtomicU32,
    inner: Mutex<Inner>,
}

impl<M: MemoryReader, T: ThreadContextAccess> BreakpointManager<M, T> {
    pub fn new(memory: std::sync::Arc<M>, threads: std::sync::Arc<T>) -> Self {
        Self {
            memory,
            threads,
            next_id: AtomicU32::new(1),
            inner: Mutex::new(Inner {
                software: Vec::new(),
                hw_slots: [None, None, None, None],
                watchpoints: Vec::new(),
            }),
        }
    }

    fn allocate_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::AcqRel)
    }

    // ---- Software breakpoints ----

    pub fn set_software_breakpoint(&self, address: u64) -> VertexResult<u32> {
        let mut inner = self.inner.lock().unwrap();
        if inner.software.iter().any(|e| e.breakpoint.address == address) {
            return Err(VertexError::AlreadyExists(format!(
                "software breakpoint already set at {address:#x}"
            )));
        }

        let mut original = [0u8; 1];
        self.memory.read_memory(address, &mut original)?;
        self.memory.write_memory(address, &[SOFTWARE_BREAKPOINT_BYTE])?;

        let id = self.allocate_id();
        inner.software.push(SoftwareEntry {
            breakpoint: Breakpoint {
                id,
                address,
                kind: BreakpointKind::Software,
                state: BreakpointState::Enabled,
                hit_count: 0,
                temporary: false,
                original_byte: Some(original[0]),
                dr_index: None,
                size: None,
            },
        });
        Ok(id)
    }

    pub fn remove_software_breakpoint(&self, id: u32) -> VertexResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let position = inner
            .software
            .iter()
            .position(|e| e.breakpoint.id == id)
            .ok_or_else(|| VertexError::NotFound(format!("breakpoint {id}")))?;
        let entry = inner.software.remove(position);
        if entry.breakpoint.state == BreakpointState::Enabled {
            let original = entry.breakpoint.original_byte.unwrap_or(0);
            self.memory.write_memory(entry.breakpoint.address, &[original])?;
        }
        Ok(())
    }

    pub fn enable_software_breakpoint(&self, id: u32, enabled: bool) -> VertexResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .software
            .iter_mut()
            .find(|e| e.breakpoint.id == id)
            .ok_or_else(|| VertexError::NotFound(format!("breakpoint {id}")))?;

        let already_enabled = entry.breakpoint.state == BreakpointState::Enabled;
        if enabled == already_enabled {
            return Ok(());
        }

        let original = entry.breakpoint.original_byte.unwrap_or(0);
        if enabled {
            self.memory.write_memory(entry.breakpoint.address, &[SOFTWARE_BREAKPOINT_BYTE])?;
            entry.breakpoint.state = BreakpointState::Enabled;
        } else {
            self.memory.write_memory(entry.breakpoint.address, &[original])?;
            entry.breakpoint.state = BreakpointState::Disabled;
        }
        Ok(())
    }

    pub fn software_breakpoint_at(&self, address: u64) -> Option<Breakpoint> {
        let inner = self.inner.lock().unwrap();
        inner
            .software
            .iter()
            .find(|e| e.breakpoint.address == address)
            .map(|e| e.breakpoint.clone())
    }

    pub fn record_software_hit(&self, id: u32) -> VertexResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner
            .software
            .iter_mut()
            .find(|e| e.breakpoint.id == id)
            .ok_or_else(|| VertexError::NotFound(format!("breakpoint {id}")))?;
        entry.breakpoint.hit_count += 1;
        Ok(())
    }

    // ---- Hardware breakpoints / watchpoints share the DR0-DR3 slots ----

    fn first_free_slot(inner: &Inner) -> Option<u8> {
        (0u8..HW_SLOT_COUNT).find(|&slot| inner.hw_slots[slot as usize].is_none())
    }

    fn condition_for_access(access: WatchpointAccess) -> VertexResult<Condition> {
        match access {
            WatchpointAccess::Execute => Ok(Condition::Execute),
            WatchpointAccess::Write => Ok(Condition::Write),
            WatchpointAccess::ReadWrite => Ok(Condition::ReadWrite),
            WatchpointAccess::Read => Err(VertexError::Unsupported(
                "read-only watchpoints are not representable by DR7 alone".into(),
            )),
        }
    }

    fn check_alignment(address: u64, size: u8) -> VertexResult<()> {
        if address == 0 {
            return Err(VertexError::InvalidParameter("address is zero".into()));
        }
        if ![1u8, 2, 4, 8].contains(&size) {
            return Err(VertexError::InvalidParameter(format!("unsupported size {size}")));
        }
        if address % size as u64 != 0 {
            return Err(VertexError::InvalidParameter(format!(
                "address {address:#x} is not {size}-byte aligned"
            )));
        }
        Ok(())
    }

    fn apply_slot_to_all_threads(&self, slot: u8, address: u64, condition: Condition, size: u8) -> VertexResult<()> {
        for thread_id in self.threads.thread_ids() {
            let mut regs = self.threads.read_debug_registers(thread_id)?;
            regs.set_address_slot(slot, address);
            regs.dr7 = dr7::set_slot(regs.dr7, slot, condition, size)
                .ok_or_else(|| VertexError::InvalidParameter("bad DR7 encoding".into()))?;
            self.threads.write_debug_registers(thread_id, &regs)?;
        }
        Ok(())
    }

    fn clear_slot_on_all_threads(&self, slot: u8) -> VertexResult<()> {
        for thread_id in self.threads.thread_ids() {
            let mut regs = self.threads.read_debug_registers(thread_id)?;
            regs.set_address_slot(slot, 0);
            regs.dr7 = dr7::clear_slot(regs.dr7, slot);
            self.threads.write_debug_registers(thread_id, &regs)?;
        }
        Ok(())
    }

    pub fn set_hardware_breakpoint(&self, address: u64, size: u8) -> VertexResult<u32> {
        Self::check_alignment(address, size)?;

        let mut inner = self.inner.lock().unwrap();
        let slot = Self::first_free_slot(&inner)
            .ok_or_else(|| VertexError::LimitReached("no free hardware debug register".into()))?;

        let id = self.allocate_id();
        inner.hw_slots[slot as usize] = Some(HwOwner::Breakpoint(id));
        drop(inner);

        self.apply_slot_to_all_threads(slot, address, Condition::Execute, size)?;

        let mut inner = self.inner.lock().unwrap();
        inner.software.push(SoftwareEntry {
            breakpoint: Breakpoint {
                id,
                address,
                kind: BreakpointKind::Hardware,
                state: BreakpointState::Enabled,
                hit_count: 0,
                temporary: false,
                original_byte: None,
                dr_index: Some(slot),
                size: Some(size),
            },
        });
        Ok(id)
    }

    pub fn remove_hardware_breakpoint(&self, id: u32) -> VertexResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .hw_slots
            .iter()
            .position(|o| matches!(o, Some(HwOwner::Breakpoint(owner)) if *owner == id))
            .ok_or_else(|| VertexError::NotFound(format!("hardware breakpoint {id}")))? as u8;
        inner.hw_slots[slot as usize] = None;
        inner.software.retain(|e| e.breakpoint.id != id);
        drop(inner);

        self.clear_slot_on_all_threads(slot)
    }

    pub fn hardware_slots_in_use(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.hw_slots.iter().filter(|s| s.is_some()).count()
    }

    // ---- Watchpoints ----

    pub fn set_watchpoint(&self, spec: &WatchpointSpec) -> VertexResult<u32> {
        Self::check_alignment(spec.address, spec.size)?;
        let condition = Self::condition_for_access(spec.access)?;

        let mut inner = self.inner.lock().unwrap();
        let slot = Self::first_free_slot(&inner)
            .ok_or_else(|| VertexError::LimitReached("no free hardware debug register".into()))?;

        let id = self.allocate_id();
        inner.hw_slots[slot as usize] = Some(HwOwner::Watchpoint(id));
        inner.watchpoints.push(Watchpoint {
            id,
            address: spec.address,
            size: spec.size,
            access: spec.access,
            enabled: true,
            hit_count: 0,
            last_accessor_address: 0,
            dr_index: slot,
            temporarily_disabled: false,
        });
        drop(inner);

        self.apply_slot_to_all_threads(slot, spec.address, condition, spec.size)?;
        Ok(id)
    }

    pub fn remove_watchpoint(&self, id: u32) -> VertexResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let slot = inner
            .watchpoints
            .iter()
            .find(|w| w.id == id)
            .map(|w| w.dr_index)
            .ok_or_else(|| VertexError::NotFound(format!("watchpoint {id}")))?;
        inner.watchpoints.retain(|w| w.id != id);
        inner.hw_slots[slot as usize] = None;
        drop(inner);

        self.clear_slot_on_all_threads(slot)
    }

    pub fn enable_watchpoint(&self, id: u32, enabled: bool) -> VertexResult<()> {
        let (slot, address, condition, size) = {
            let mut inner = self.inner.lock().unwrap();
            let wp = inner
                .watchpoints
                .iter_mut()
                .find(|w| w.id == id)
                .ok_or_else(|| VertexError::NotFound(format!("watchpoint {id}")))?;
            wp.enabled = enabled;
            (wp.dr_index, wp.address, Self::condition_for_access(wp.access)?, wp.size)
        };

        if enabled {
            self.apply_slot_to_all_threads(slot, address, condition, size)
        } else {
            self.clear_slot_on_all_threads(slot)
        }
    }

    /// Identifies the watchpoint by which DR slot triggered (from DR6),
    /// increments `hit_count`, and records the faulting instruction address
    /// into `last_accessor_address`.
    pub fn record_watchpoint_hit(&self, dr6: u64, instruction_address: u64) -> Option<Watchpoint> {
        let slot = dr7::triggered_slot(dr6)?;
        let mut inner = self.inner.lock().unwrap();
        let wp = inner.watchpoints.iter_mut().find(|w| w.dr_index == slot)?;
        wp.hit_count += 1;
        wp.last_accessor_address = instruction_address;
        Some(wp.clone())
    }

    /// Temporarily clears just the local-enable bit for `watchpoint_id`'s
    /// slot on every cached thread, so the faulting instruction can retire.
    /// Condition/size bits are preserved.
    pub fn temporarily_disable_watchpoint(&self, watchpoint_id: u32) -> VertexResult<()> {
        let slot = {
            let mut inner = self.inner.lock().unwrap();
            let wp = inner
                .watchpoints
                .iter_mut()
                .find(|w| w.id == watchpoint_id)
                .ok_or_else(|| VertexError::NotFound(format!("watchpoint {watchpoint_id}")))?;
            wp.temporarily_disabled = true;
            wp.dr_index
        };

        for thread_id in self.threads.thread_ids() {
            let mut regs = self.threads.read_debug_registers(thread_id)?;
            regs.dr7 = dr7::clear_local_enable(regs.dr7, slot);
            self.threads.write_debug_registers(thread_id, &regs)?;
        }
        Ok(())
    }

    /// Re-sets the local-enable bit for `watchpoint_id`'s slot on every
    /// cached thread, the counterpart to `temporarily_disable_watchpoint`.
    pub fn re_enable_watchpoint(&self, watchpoint_id: u32) -> VertexResult<()> {
        let slot = {
            let mut inner = self.inner.lock().unwrap();
            let wp = inner
                .watchpoints
                .iter_mut()
                .find(|w| w.id == watchpoint_id)
                .ok_or_else(|| VertexError::NotFound(format!("watchpoint {watchpoint_id}")))?;
            wp.temporarily_disabled = false;
            wp.dr_index
        };

        for thread_id in self.threads.thread_ids() {
            let mut regs = self.threads.read_debug_registers(thread_id)?;
            regs.dr7 = dr7::set_local_enable(regs.dr7, slot);
            self.threads.write_debug_registers(thread_id, &regs)?;
        }
        Ok(())
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.inner
            .lock()
            .unwrap()
            .software
            .iter()
            .map(|e| e.breakpoint.clone())
            .collect()
    }

    pub fn watchpoints(&self) -> Vec<Watchpoint> {
        self.inner.lock().unwrap().watchpoints.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    struct FakeMemory {
        bytes: Mutex<std::collections::HashMap<u64, u8>>,
    }

    impl FakeMemory {
        fn new() -> Self {
            Self {
                bytes: Mutex::new(std::collections::HashMap::new()),
            }
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
        fn enumerate_regions(&self) -> VertexResult<Vec<crate::types::Region>> {
            Ok(vec![])
        }
        fn kill_process(&self) -> VertexResult<()> {
            Ok(())
        }
        fn is_process_valid(&self) -> VertexResult<bool> {
            Ok(true)
        }
        fn list_processes(&self) -> VertexResult<Vec<crate::types::ProcessInfo>> {
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
        registers: Mutex<std::collections::HashMap<u32, DebugRegisters>>,
        calls: AtomicU64,
    }

    impl FakeThreads {
        fn new() -> Self {
            let mut registers = std::collections::HashMap::new();
            registers.insert(1, DebugRegisters::default());
            Self {
                registers: Mutex::new(registers),
                calls: AtomicU64::new(0),
            }
        }
    }

    impl ThreadContextAccess for FakeThreads {
        fn thread_ids(&self) -> Vec<u32> {
            self.registers.lock().unwrap().keys().copied().collect()
        }
        fn read_debug_registers(&self, thread_id: u32) -> VertexResult<DebugRegisters> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(*self.registers.lock().unwrap().get(&thread_id).unwrap())
        }
        fn write_debug_registers(&self, thread_id: u32, regs: &DebugRegisters) -> VertexResult<()> {
            self.registers.lock().unwrap().insert(thread_id, *regs);
            Ok(())
        }
    }

    fn manager() -> BreakpointManager<FakeMemory, FakeThreads> {
        BreakpointManager::new(Arc::new(FakeMemory::new()), Arc::new(FakeThreads::new()))
    }

    #[test]
    fn software_breakpoint_set_then_remove_restores_original_byte() {
        let mgr = manager();
        mgr.memory.write_memory(0x5000, &[0x90]).unwrap();
        let id = mgr.set_software_breakpoint(0x5000).unwrap();

        let mut byte = [0u8];
        mgr.memory.read_memory(0x5000, &mut byte).unwrap();
        assert_eq!(byte[0], SOFTWARE_BREAKPOINT_BYTE);

        mgr.remove_software_breakpoint(id).unwrap();
        mgr.memory.read_memory(0x5000, &mut byte).unwrap();
        assert_eq!(byte[0], 0x90);
    }

    #[test]
    fn duplicate_software_breakpoint_address_rejected() {
        let mgr = manager();
        mgr.set_software_breakpoint(0x5000).unwrap();
        assert!(matches!(
            mgr.set_software_breakpoint(0x5000),
            Err(VertexError::AlreadyExists(_))
        ));
    }

    #[test]
    fn hardware_breakpoint_allocation_is_first_fit_and_bounded() {
        let mgr = manager();
        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(mgr.set_hardware_breakpoint(0x1000 * (i + 1), 4).unwrap());
        }
        assert_eq!(mgr.hardware_slots_in_use(), 4);
        assert!(matches!(
            mgr.set_hardware_breakpoint(0x9000, 4),
            Err(VertexError::LimitReached(_))
        ));

        mgr.remove_hardware_breakpoint(ids[1]).unwrap();
        assert_eq!(mgr.hardware_slots_in_use(), 3);
        // A new request now succeeds by reusing the freed slot.
        let _ = mgr.set_hardware_breakpoint(0x9000, 4).unwrap();
    }

    #[test]
    fn misaligned_hardware_breakpoint_rejected() {
        let mgr = manager();
        assert!(mgr.set_hardware_breakpoint(0x1001, 4).is_err());
    }

    #[test]
    fn watchpoint_temporarily_disable_then_re_enable_preserves_condition() {
        let mgr = manager();
        let id = mgr
            .set_watchpoint(&WatchpointSpec {
                address: 0x3000,
                size: 4,
                access: WatchpointAccess::Write,
            })
            .unwrap();

        mgr.temporarily_disable_watchpoint(id).unwrap();
        let regs = mgr.threads.read_debug_registers(1).unwrap();
        let wp = mgr.watchpoints().into_iter().find(|w| w.id == id).unwrap();
        assert!(!dr7::is_local_enabled(regs.dr7, wp.dr_index));

        mgr.re_enable_watchpoint(id).unwrap();
        let regs = mgr.threads.read_debug_registers(1).unwrap();
        assert!(dr7::is_local_enabled(regs.dr7, wp.dr_index));
        let decoded = dr7::decode_slot(regs.dr7, wp.dr_index).unwrap();
        assert_eq!(decoded.condition, Condition::Write);
        assert_eq!(decoded.size, 4);
    }

    #[test]
    fn watchpoint_hit_records_slot_and_address() {
        let mgr = manager();
        let id = mgr
            .set_watchpoint(&WatchpointSpec {
                address: 0x3000,
                size: 4,
                access: WatchpointAccess::Write,
            })
            .unwrap();
        let wp_before = mgr.watchpoints().into_iter().find(|w| w.id == id).unwrap();
        let dr6 = 1u64 << wp_before.dr_index;

        let hit = mgr.record_watchpoint_hit(dr6, 0x4050).unwrap();
        assert_eq!(hit.id, id);
        assert_eq!(hit.hit_count, 1);
        assert_eq!(hit.last_accessor_address, 0x4050);
    }

    #[test]
    fn hardware_breakpoints_and_watchpoints_share_the_same_four_slots() {
        let mgr = manager();
        for i in 0..3 {
            mgr.set_hardware_breakpoint(0x1000 * (i + 1), 4).unwrap();
        }
        mgr.set_watchpoint(&WatchpointSpec {
            address: 0x9000,
            size: 4,
            access: WatchpointAccess::ReadWrite,
        })
        .unwrap();
        assert_eq!(mgr.hardware_slots_in_use(), 4);
        assert!(mgr
            .set_watchpoint(&WatchpointSpec {
                address: 0xA000,
                size: 4,
                access: WatchpointAccess::Write,
            })
            .is_err());
    }
}
