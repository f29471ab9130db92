//! Live process memory access: `ReadProcessMemory`/`WriteProcessMemory`,
//! region enumeration via `VirtualQueryEx`, and the process list. Grounded
//! on `src/vertexusrrt/windows/memory.cc`.

use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use vertex_core::error::{VertexError, VertexResult};
use vertex_core::plugin::MemoryReader;
use vertex_core::types::{ProcessInfo, Region};
use winapi::shared::minwindef::FALSE;
use winapi::um::handleapi::{CloseHandle, INVALID_HANDLE_VALUE};
use winapi::um::memoryapi::{ReadProcessMemory, VirtualQueryEx, WriteProcessMemory};
use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
use winapi::um::tlhelp32::{
    CreateToolhelp32Snapshot, Module32FirstW, Module32NextW, Process32FirstW, Process32NextW,
    MODULEENTRY32W, PROCESSENTRY32W, TH32CS_SNAPMODULE, TH32CS_SNAPMODULE32, TH32CS_SNAPPROCESS,
};
use winapi::um::winnt::{HANDLE, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PROCESS_ALL_ACCESS};

struct ModuleRange {
    base: u64,
    end: u64,
    name: String,
}

/// Snapshots the loaded-module list for `pid` so `enumerate_regions` can
/// label each committed region with the module it falls inside, if any.
/// A snapshot failure (process exiting, access denied) just yields no
/// labels rather than failing the whole region walk.
fn snapshot_modules(pid: u32) -> Vec<ModuleRange> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPMODULE | TH32CS_SNAPMODULE32, pid) };
    if snapshot == INVALID_HANDLE_VALUE {
        return Vec::new();
    }

    let mut entry: MODULEENTRY32W = unsafe { std::mem::zeroed() };
    entry.dwSize = std::mem::size_of::<MODULEENTRY32W>() as u32;

    let mut out = Vec::new();
    let mut ok = unsafe { Module32FirstW(snapshot, &mut entry) };
    while ok != 0 {
        let base = entry.modBaseAddr as u64;
        let size = entry.modBaseSize as u64;
        out.push(ModuleRange { base, end: base + size, name: wchar_to_string(&entry.szModule) });
        ok = unsafe { Module32NextW(snapshot, &mut entry) };
    }
    unsafe { CloseHandle(snapshot) };
    out
}

fn wchar_to_string(buf: &[u16]) -> String {
    let len = buf.iter().position(|&c| c == 0).unwrap_or(buf.len());
    widestring::U16Str::from_slice(&buf[..len]).to_string_lossy()
}

/// A `ReadProcessMemory`/`WriteProcessMemory` handle to the attached target,
/// plus the few lifetime operations (`OpenProcess`, `TerminateProcess`) that
/// don't belong to the debugger subsystem.
pub struct WindowsProcess {
    handle: Mutex<Option<HANDLE>>,
    pid: AtomicU32,
}

// `HANDLE` is just a kernel object reference; Windows lets any thread use
// it once opened.
unsafe impl Send for WindowsProcess {}
unsafe impl Sync for WindowsProcess {}

impl WindowsProcess {
    pub fn new() -> Self {
        Self { handle: Mutex::new(None), pid: AtomicU32::new(0) }
    }

    pub fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    pub fn raw_handle(&self) -> VertexResult<HANDLE> {
        self.handle
            .lock()
            .unwrap()
            .ok_or_else(|| VertexError::InvalidParameter("no process attached".into()))
    }

    fn with_handle<R>(&self, f: impl FnOnce(HANDLE) -> VertexResult<R>) -> VertexResult<R> {
        f(self.raw_handle()?)
    }
}

impl Default for WindowsProcess {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryReader for WindowsProcess {
    fn read_memory(&self, address: u64, out: &mut [u8]) -> VertexResult<()> {
        self.with_handle(|handle| {
            let mut bytes_read = 0usize;
            let ok = unsafe {
                ReadProcessMemory(
                    handle,
                    address as *const _,
                    out.as_mut_ptr() as *mut _,
                    out.len(),
                    &mut bytes_read,
                )
            };
            if ok == 0 || bytes_read != out.len() {
                log::trace!("ReadProcessMemory failed at {:#x} ({} bytes)", address, out.len());
                return Err(VertexError::IoFailed(format!("read failed at {address:#x}")));
            }
            Ok(())
        })
    }

    fn write_memory(&self, address: u64, data: &[u8]) -> VertexResult<()> {
        self.with_handle(|handle| {
            let mut bytes_written = 0usize;
            let ok = unsafe {
                WriteProcessMemory(
                    handle,
                    address as *mut _,
                    data.as_ptr() as *const _,
                    data.len(),
                    &mut bytes_written,
                )
            };
            if ok == 0 || bytes_written != data.len() {
                log::trace!("WriteProcessMemory failed at {:#x} ({} bytes)", address, data.len());
                return Err(VertexError::IoFailed(format!("write failed at {address:#x}")));
            }
            Ok(())
        })
    }

    fn enumerate_regions(&self) -> VertexResult<Vec<Region>> {
        let modules = snapshot_modules(self.pid());
        self.with_handle(|handle| {
            let mut regions = Vec::new();
            let mut address: usize = 0;

            loop {
                let mut info = MaybeUninit::<MEMORY_BASIC_INFORMATION>::uninit();
                let written = unsafe {
                    VirtualQueryEx(
                        handle,
                        address as *const _,
                        info.as_mut_ptr(),
                        std::mem::size_of::<MEMORY_BASIC_INFORMATION>(),
                    )
                };
                if written == 0 {
                    break;
                }
                let info = unsafe { info.assume_init() };

                if info.State == MEM_COMMIT {
                    let base = info.BaseAddress as u64;
                    let module_name = modules
                        .iter()
                        .find(|m| base >= m.base && base < m.end)
                        .map(|m| m.name.clone());
                    regions.push(Region { base, size: info.RegionSize as u64, module_name });
                }

                let next = (info.BaseAddress as usize).saturating_add(info.RegionSize);
                if next <= address {
                    break;
                }
                address = next;
            }

            Ok(regions)
        })
    }

    fn kill_process(&self) -> VertexResult<()> {
        self.with_handle(|handle| {
            let ok = unsafe { TerminateProcess(handle, 1) };
            if ok == 0 {
                return Err(VertexError::IoFailed("TerminateProcess failed".into()));
            }
            Ok(())
        })
    }

    fn is_process_valid(&self) -> VertexResult<bool> {
        Ok(self.handle.lock().unwrap().is_some())
    }

    fn list_processes(&self) -> VertexResult<Vec<ProcessInfo>> {
        let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
        if snapshot == INVALID_HANDLE_VALUE {
            return Err(VertexError::IoFailed("CreateToolhelp32Snapshot failed".into()));
        }

        let mut entry: PROCESSENTRY32W = unsafe { std::mem::zeroed() };
        entry.dwSize = std::mem::size_of::<PROCESSENTRY32W>() as u32;

        let mut out = Vec::new();
        let mut ok = unsafe { Process32FirstW(snapshot, &mut entry) };
        while ok != 0 {
            out.push(ProcessInfo {
                pid: entry.th32ProcessID,
                name: wchar_to_string(&entry.szExeFile),
            });
            ok = unsafe { Process32NextW(snapshot, &mut entry) };
        }
        unsafe { CloseHandle(snapshot) };
        Ok(out)
    }

    fn open_process(&self, pid: u32) -> VertexResult<()> {
        let handle = unsafe { OpenProcess(PROCESS_ALL_ACCESS, FALSE, pid) };
        if handle.is_null() {
            return Err(VertexError::NotFound(format!("process {pid} not found")));
        }

        let mut guard = self.handle.lock().unwrap();
        if let Some(old) = guard.take() {
            unsafe { CloseHandle(old) };
        }
        *guard = Some(handle);
        self.pid.store(pid, Ordering::Release);
        Ok(())
    }

    fn pointer_size(&self) -> VertexResult<u8> {
        Ok(8)
    }
}

impl Drop for WindowsProcess {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.handle.lock() {
            if let Some(handle) = guard.take() {
                unsafe { CloseHandle(handle) };
            }
        }
    }
}
