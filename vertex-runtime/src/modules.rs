//! PE import/export table reading. Grounded on
//! `src/vertexusrrt/windows/process/get_module_exports.cc` and
//! `get_module_imports.cc`, re-expressed over `goblin::pe::PE` instead of a
//! hand-rolled directory walk. Only needs the module's bytes, so it has no
//! Windows dependency and runs the same on any host.

use goblin::pe::PE;
use vertex_core::error::{VertexError, VertexResult};
use vertex_core::plugin::ModuleInspector;
use vertex_core::types::{ExportEntry, ImportEntry};

/// Parses a PE image already read into memory (e.g. via `ReadProcessMemory`
/// over the module's mapped range, or a file read for on-disk inspection)
/// and returns its export table.
pub fn read_exports(image: &[u8]) -> VertexResult<Vec<ExportEntry>> {
    let pe = PE::parse(image).map_err(|e| VertexError::IoFailed(format!("failed to parse PE: {e}")))?;

    Ok(pe
        .exports
        .iter()
        .map(|export| ExportEntry {
            name: export.name.map(|s| s.to_string()),
            ordinal: export.ordinal,
            rva: export.rva as u32,
            forwarded_to: export.reexport.as_ref().map(|r| format!("{r:?}")),
        })
        .collect())
}

/// Parses a PE image's import table. Each entry names the DLL it imports
/// from; `ordinal` is `Some` for an ordinal-only import, `name` is `Some`
/// for a name-based one (exactly one of the two, matching the Windows
/// import-thunk encoding).
pub fn read_imports(image: &[u8]) -> VertexResult<Vec<ImportEntry>> {
    let pe = PE::parse(image).map_err(|e| VertexError::IoFailed(format!("failed to parse PE: {e}")))?;

    Ok(pe
        .imports
        .iter()
        .map(|import| ImportEntry {
            module: import.dll.to_string(),
            name: if import.name.is_empty() { None } else { Some(import.name.to_string()) },
            ordinal: if import.name.is_empty() { Some(import.ordinal as u16) } else { None },
            thunk_rva: import.rva as u32,
        })
        .collect())
}

/// The `ModuleInspector` the facade reaches for on Windows: a thin wrapper
/// so `vertex-core` never links `goblin` directly.
#[derive(Default)]
pub struct PeModuleInspector;

impl ModuleInspector for PeModuleInspector {
    fn read_exports(&self, image: &[u8]) -> VertexResult<Vec<ExportEntry>> {
        read_exports(image)
    }

    fn read_imports(&self, image: &[u8]) -> VertexResult<Vec<ImportEntry>> {
        read_imports(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_image_reports_io_failed() {
        let result = read_exports(&[0u8; 16]);
        assert!(matches!(result, Err(VertexError::IoFailed(_))));
        let result = read_imports(&[0u8; 16]);
        assert!(matches!(result, Err(VertexError::IoFailed(_))));
    }
}
