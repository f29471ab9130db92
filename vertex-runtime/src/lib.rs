//! Windows platform plugin: concrete `MemoryReader`/`DebuggerPlugin`
//! implementations vertex-core's traits require, backed by
//! `ReadProcessMemory`/`WriteProcessMemory`, `WaitForDebugEvent`, and the
//! thread-context debug-register APIs. Also hosts the PE import/export
//! reader (`modules`), which only needs a byte buffer and so builds on any
//! host.
//!
//! Real process/debug access is only available under `cfg(windows)`. The
//! `stub` feature (or a non-Windows host) swaps in [`stub`], a backend that
//! accepts every call and fails every one of them with `Unsupported`, so
//! `vertex-cli` links on any platform even though it can only do useful
//! work on Windows.

pub mod modules;
pub use modules::PeModuleInspector;

#[cfg(all(windows, not(feature = "stub")))]
pub mod windows;
#[cfg(all(windows, not(feature = "stub")))]
pub use windows::{disassembler::IcedDisassembler, process::WindowsProcess, threads::WindowsThreads};
#[cfg(all(windows, not(feature = "stub")))]
pub use windows::debug_loop::WindowsDebugger;

#[cfg(any(not(windows), feature = "stub"))]
pub mod stub;
#[cfg(any(not(windows), feature = "stub"))]
pub use stub::{StubDebugger, StubProcess};
