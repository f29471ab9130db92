//! Picks the concrete `MemoryReader`/`DebuggerPlugin` pair this binary
//! drives: the real Windows backend when built for Windows, the `stub`
//! backend (which accepts every call and reports `Unsupported`) everywhere
//! else, so the binary still links and gives a clear error on a host that
//! cannot actually attach to a process this way.

use std::sync::Arc;

use vertex_core::error::VertexResult;
use vertex_core::plugin::{DebuggerPlugin, MemoryReader};
use vertex_core::registry::Architecture;

#[cfg(all(windows, not(feature = "stub")))]
pub fn attach(pid: u32, architecture: Architecture) -> VertexResult<(Arc<impl MemoryReader>, Arc<impl DebuggerPlugin>)> {
    let debugger = Arc::new(vertex_runtime::WindowsDebugger::new(architecture));
    let process = debugger.process();
    process.open_process(pid)?;
    Ok((process, debugger))
}

#[cfg(any(not(windows), feature = "stub"))]
pub fn attach(_pid: u32, _architecture: Architecture) -> VertexResult<(Arc<impl MemoryReader>, Arc<impl DebuggerPlugin>)> {
    Ok((Arc::new(vertex_runtime::StubProcess::default()), Arc::new(vertex_runtime::StubDebugger::default())))
}
