//! Small control binary: attaches to a pid, drives a scan or a breakpoint
//! session from the command line, and prints facade snapshots. Exercises
//! `vertex-core` + `vertex-runtime` the way `hv-control` exercised the
//! hypervisor driver's ioctl surface, minus the driver handle.

mod backend;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;

use vertex_core::debugger::{
    BreakpointHitEvent, BreakpointKind as CoreBreakpointKind, DebuggerCommand, DebuggerState,
    ExceptionEvent, SingleStepEvent, WatchpointAccess as CoreWatchpointAccess, WatchpointHitInfo,
    WatchpointSpec,
};
use vertex_core::error::{VertexError, VertexResult};
use vertex_core::plugin::{DebuggerCallbacks, DebuggerPlugin, MemoryReader};
use vertex_core::registry::{Architecture, Registry};
use vertex_core::scanner::config::{Endianness, ScanConfig, ScanMode as CoreScanMode, ValueType as CoreValueType};
use vertex_core::types::{Region, StepMode as CoreStepMode};
use vertex_core::Facade;

#[derive(Parser)]
#[command(name = "vertex", about = "Attach to a process and drive a scan or debug session.")]
struct Cli {
    /// Target process id.
    #[arg(long)]
    pid: u32,

    /// Process architecture; affects register naming and instruction decode.
    #[arg(long, value_enum, default_value_t = CliArchitecture::X64)]
    arch: CliArchitecture,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lists the process's memory regions.
    Regions,
    /// Starts a first scan over every enumerated region.
    ScanFirst {
        #[arg(long, value_enum)]
        r#type: CliValueType,
        #[arg(long, value_enum)]
        mode: CliScanMode,
        #[arg(long)]
        value: String,
        #[arg(long)]
        value2: Option<String>,
        #[arg(long, default_value_t = 1)]
        alignment: usize,
    },
    /// Narrows the previous scan's results against the same value type.
    ScanNext {
        #[arg(long, value_enum)]
        r#type: CliValueType,
        #[arg(long, value_enum)]
        mode: CliScanMode,
        #[arg(long)]
        value: Option<String>,
        #[arg(long)]
        value2: Option<String>,
    },
    /// Prints the current scan result set.
    Results {
        #[arg(long, default_value_t = 100)]
        limit: usize,
    },
    /// Restores the previous scan's result set.
    UndoScan,
    /// Sets a breakpoint at an address (accepts `0x...` or decimal).
    SetBreakpoint {
        #[arg(long, value_parser = parse_address)]
        address: u64,
        #[arg(long, value_enum, default_value_t = CliBreakpointKind::Software)]
        kind: CliBreakpointKind,
    },
    /// Lists breakpoints and their hit counts.
    ListBreakpoints,
    /// Sets a watchpoint over an address range.
    SetWatchpoint {
        #[arg(long, value_parser = parse_address)]
        address: u64,
        #[arg(long, default_value_t = 4)]
        size: u8,
        #[arg(long, value_enum, default_value_t = CliWatchAccess::Write)]
        access: CliWatchAccess,
    },
    /// Lists watchpoints and their hit counts.
    ListWatchpoints,
    /// Single-steps the given thread.
    Step {
        thread_id: u32,
        #[arg(long, value_enum, default_value_t = CliStepMode::Into)]
        mode: CliStepMode,
    },
    /// Resumes execution.
    Continue,
    /// Pauses execution.
    Pause,
    /// Prints a module's export table.
    Exports { module: String },
    /// Prints a module's import table.
    Imports { module: String },
}

fn main() {
    vertex_core::log::init(LevelFilter::Info);
    let cli = Cli::parse();

    if let Err(error) = run(cli) {
        log::error!("{error}");
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> VertexResult<()> {
    let architecture: Architecture = cli.arch.into();
    let (process, debugger) = backend::attach(cli.pid, architecture)?;
    let callbacks: Arc<dyn DebuggerCallbacks> = Arc::new(PrintingCallbacks::default());
    debugger.run(callbacks.clone())?;

    let mut facade = Facade::new(
        process.clone() as Arc<dyn MemoryReader>,
        debugger.clone() as Arc<dyn DebuggerPlugin>,
        callbacks,
        Registry::new(architecture),
    );
    facade.configure_dispatcher(false, 2, true);
    facade.set_module_inspector(Arc::new(vertex_runtime::PeModuleInspector));
    facade.attach(cli.pid)?;

    match cli.command {
        Command::Regions => print_regions(&facade)?,
        Command::ScanFirst { r#type, mode, value, value2, alignment } => {
            scan_first(&facade, r#type.into(), mode.into(), &value, value2.as_deref(), alignment)?
        }
        Command::ScanNext { r#type, mode, value, value2 } => {
            scan_next(&facade, r#type.into(), mode.into(), value.as_deref(), value2.as_deref())?
        }
        Command::Results { limit } => print_results(&facade, limit),
        Command::UndoScan => facade.undo_scan()?,
        Command::SetBreakpoint { address, kind } => {
            let id = facade.set_breakpoint(address, kind.into())?;
            println!("breakpoint {id} set at {address:#x}");
        }
        Command::ListBreakpoints => {
            for bp in facade.breakpoints()? {
                println!(
                    "#{:<4} {:#x} {:?} state={:?} hits={}",
                    bp.id, bp.address, bp.kind, bp.state, bp.hit_count
                );
            }
        }
        Command::SetWatchpoint { address, size, access } => {
            let id = facade.set_watchpoint(&WatchpointSpec { address, size, access: access.into() })?;
            println!("watchpoint {id} set at {address:#x} size={size}");
        }
        Command::ListWatchpoints => {
            for wp in facade.watchpoints()? {
                println!(
                    "#{:<4} {:#x} size={} {:?} hits={} disabled={}",
                    wp.id, wp.address, wp.size, wp.access, wp.hit_count, wp.temporarily_disabled
                );
            }
        }
        Command::Step { thread_id, mode } => {
            let _ = thread_id;
            facade.submit_command(DebuggerCommand::Step(mode.into()));
            println!("step submitted");
        }
        Command::Continue => facade.submit_command(DebuggerCommand::Continue),
        Command::Pause => facade.submit_command(DebuggerCommand::Pause),
        Command::Exports { module } => {
            for export in facade.module_exports(&module)? {
                println!(
                    "{:#06x} ordinal={} {}",
                    export.rva,
                    export.ordinal,
                    export.name.as_deref().unwrap_or("<noname>")
                );
            }
        }
        Command::Imports { module } => {
            for import in facade.module_imports(&module)? {
                let symbol = import
                    .name
                    .clone()
                    .unwrap_or_else(|| format!("ordinal#{}", import.ordinal.unwrap_or(0)));
                println!("{} {}", import.module, symbol);
            }
        }
    }

    // Asynchronous commands run on the dispatcher's worker threads; give
    // them a moment before the process exits and their channels drop.
    std::thread::sleep(Duration::from_millis(50));
    Ok(())
}

fn print_regions(facade: &Facade) -> VertexResult<()> {
    for region in facade.enumerate_regions()? {
        println!(
            "{:#018x} +{:#x} {}",
            region.base,
            region.size,
            region.module_name.as_deref().unwrap_or("<anonymous>")
        );
    }
    Ok(())
}

fn scan_first(
    facade: &Facade,
    value_type: CoreValueType,
    mode: CoreScanMode,
    value: &str,
    value2: Option<&str>,
    alignment: usize,
) -> VertexResult<()> {
    let regions: Vec<Region> = facade.enumerate_regions()?;
    let config = build_config(value_type, mode, Some(value), value2, alignment)?;
    facade.first_scan(&regions, config)?;
    facade.wait_for_scan_completion(Some(5_000));
    println!("first scan found {} results", facade.scan_results().len());
    Ok(())
}

fn scan_next(
    facade: &Facade,
    value_type: CoreValueType,
    mode: CoreScanMode,
    value: Option<&str>,
    value2: Option<&str>,
) -> VertexResult<()> {
    let config = build_config(value_type, mode, value, value2, 1)?;
    facade.next_scan(config)?;
    facade.wait_for_scan_completion(Some(5_000));
    println!("next scan narrowed to {} results", facade.scan_results().len());
    Ok(())
}

fn build_config(
    value_type: CoreValueType,
    mode: CoreScanMode,
    value: Option<&str>,
    value2: Option<&str>,
    alignment: usize,
) -> VertexResult<ScanConfig> {
    let endianness = Endianness::host();
    let input = match value {
        Some(text) => encode_value(value_type, text, endianness)?,
        None => Vec::new(),
    };
    let input2 = value2.map(|text| encode_value(value_type, text, endianness)).transpose()?;
    let config = ScanConfig { value_type, mode, input, input2, alignment, endianness, hex_display: false };
    config.validate()?;
    Ok(config)
}

fn print_results(facade: &Facade, limit: usize) {
    for record in facade.scan_results().into_iter().take(limit) {
        println!("{:#018x} prev={}", record.address, hex(&record.previous_value));
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_address(text: &str) -> Result<u64, String> {
    let trimmed = text.trim();
    match trimmed.strip_prefix("0x").or_else(|| trimmed.strip_prefix("0X")) {
        Some(stripped) => u64::from_str_radix(stripped, 16).map_err(|e| e.to_string()),
        None => trimmed.parse::<u64>().map_err(|e| e.to_string()),
    }
}

/// Encodes a CLI-supplied value as the raw bytes `ScanConfig::input` expects,
/// honoring the target endianness for every multi-byte numeric/string type.
macro_rules! encode_numeric {
    ($text:expr, $ty:ty, $endianness:expr) => {{
        let value: $ty = $text
            .parse()
            .map_err(|e| VertexError::InvalidParameter(format!("{e}")))?;
        match $endianness {
            Endianness::Little => value.to_le_bytes().to_vec(),
            Endianness::Big => value.to_be_bytes().to_vec(),
        }
    }};
}

fn encode_value(value_type: CoreValueType, text: &str, endianness: Endianness) -> VertexResult<Vec<u8>> {
    use CoreValueType::*;
    Ok(match value_type {
        I8 => vec![text.parse::<i8>().map_err(|e| VertexError::InvalidParameter(e.to_string()))? as u8],
        U8 => vec![text.parse::<u8>().map_err(|e| VertexError::InvalidParameter(e.to_string()))?],
        I16 => encode_numeric!(text, i16, endianness),
        U16 => encode_numeric!(text, u16, endianness),
        I32 => encode_numeric!(text, i32, endianness),
        U32 => encode_numeric!(text, u32, endianness),
        I64 => encode_numeric!(text, i64, endianness),
        U64 => encode_numeric!(text, u64, endianness),
        F32 => encode_numeric!(text, f32, endianness),
        F64 => encode_numeric!(text, f64, endianness),
        StringAscii | StringUtf8 => text.as_bytes().to_vec(),
        StringUtf16 => text
            .encode_utf16()
            .flat_map(|unit| match endianness {
                Endianness::Little => unit.to_le_bytes(),
                Endianness::Big => unit.to_be_bytes(),
            })
            .collect(),
        StringUtf32 => text
            .chars()
            .flat_map(|ch| {
                let code = ch as u32;
                match endianness {
                    Endianness::Little => code.to_le_bytes(),
                    Endianness::Big => code.to_be_bytes(),
                }
            })
            .collect(),
    })
}

#[derive(Default)]
struct PrintingCallbacks {
    breakpoint_hits: Mutex<Vec<BreakpointHitEvent>>,
}

impl DebuggerCallbacks for PrintingCallbacks {
    fn on_attached(&self, pid: u32) {
        println!("attached to pid {pid}");
    }
    fn on_detached(&self, pid: u32) {
        println!("detached from pid {pid}");
    }
    fn on_state_changed(&self, old: DebuggerState, new: DebuggerState) {
        log::info!("state {old:?} -> {new:?}");
    }
    fn on_breakpoint_hit(&self, event: &BreakpointHitEvent) {
        println!("breakpoint {} hit on thread {} at {:#x}", event.breakpoint_id, event.thread_id, event.address);
        self.breakpoint_hits.lock().unwrap().push(event.clone());
    }
    fn on_single_step(&self, event: &SingleStepEvent) {
        log::debug!("single step: thread {} at {:#x}", event.thread_id, event.address);
    }
    fn on_exception(&self, event: &ExceptionEvent) {
        println!(
            "exception {:#x} on thread {} at {:#x} (first_chance={})",
            event.code, event.thread_id, event.address, event.is_first_chance
        );
    }
    fn on_watchpoint_hit(&self, event: &WatchpointHitInfo) {
        println!(
            "watchpoint {} hit on thread {}: {:?} at {:#x}",
            event.watchpoint_id, event.thread_id, event.access_type, event.access_address
        );
    }
    fn on_error(&self, error: &VertexError) {
        log::error!("{error}");
    }
}

#[derive(Copy, Clone, Default, ValueEnum)]
enum CliArchitecture {
    #[default]
    X64,
    X86,
}

impl From<CliArchitecture> for Architecture {
    fn from(value: CliArchitecture) -> Self {
        match value {
            CliArchitecture::X64 => Architecture::X64,
            CliArchitecture::X86 => Architecture::X86,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
enum CliValueType {
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    StringAscii,
    StringUtf8,
    StringUtf16,
    StringUtf32,
}

impl From<CliValueType> for CoreValueType {
    fn from(value: CliValueType) -> Self {
        match value {
            CliValueType::I8 => CoreValueType::I8,
            CliValueType::U8 => CoreValueType::U8,
            CliValueType::I16 => CoreValueType::I16,
            CliValueType::U16 => CoreValueType::U16,
            CliValueType::I32 => CoreValueType::I32,
            CliValueType::U32 => CoreValueType::U32,
            CliValueType::I64 => CoreValueType::I64,
            CliValueType::U64 => CoreValueType::U64,
            CliValueType::F32 => CoreValueType::F32,
            CliValueType::F64 => CoreValueType::F64,
            CliValueType::StringAscii => CoreValueType::StringAscii,
            CliValueType::StringUtf8 => CoreValueType::StringUtf8,
            CliValueType::StringUtf16 => CoreValueType::StringUtf16,
            CliValueType::StringUtf32 => CoreValueType::StringUtf32,
        }
    }
}

#[derive(Copy, Clone, ValueEnum)]
enum CliScanMode {
    Exact,
    GreaterThan,
    LessThan,
    Between,
    Unknown,
    Changed,
    Unchanged,
    Increased,
    Decreased,
    IncreasedBy,
    DecreasedBy,
    Contains,
    BeginsWith,
    EndsWith,
}

impl From<CliScanMode> for CoreScanMode {
    fn from(value: CliScanMode) -> Self {
        match value {
            CliScanMode::Exact => CoreScanMode::Exact,
            CliScanMode::GreaterThan => CoreScanMode::GreaterThan,
            CliScanMode::LessThan => CoreScanMode::LessThan,
            CliScanMode::Between => CoreScanMode::Between,
            CliScanMode::Unknown => CoreScanMode::Unknown,
            CliScanMode::Changed => CoreScanMode::Changed,
            CliScanMode::Unchanged => CoreScanMode::Unchanged,
            CliScanMode::Increased => CoreScanMode::Increased,
            CliScanMode::Decreased => CoreScanMode::Decreased,
            CliScanMode::IncreasedBy => CoreScanMode::IncreasedBy,
            CliScanMode::DecreasedBy => CoreScanMode::DecreasedBy,
            CliScanMode::Contains => CoreScanMode::Contains,
            CliScanMode::BeginsWith => CoreScanMode::BeginsWith,
            CliScanMode::EndsWith => CoreScanMode::EndsWith,
        }
    }
}

#[derive(Copy, Clone, Default, ValueEnum)]
enum CliBreakpointKind {
    #[default]
    Software,
    Hardware,
}

impl From<CliBreakpointKind> for CoreBreakpointKind {
    fn from(value: CliBreakpointKind) -> Self {
        match value {
            CliBreakpointKind::Software => CoreBreakpointKind::Software,
            CliBreakpointKind::Hardware => CoreBreakpointKind::Hardware,
        }
    }
}

#[derive(Copy, Clone, Default, ValueEnum)]
enum CliWatchAccess {
    Read,
    #[default]
    Write,
    ReadWrite,
    Execute,
}

impl From<CliWatchAccess> for CoreWatchpointAccess {
    fn from(value: CliWatchAccess) -> Self {
        match value {
            CliWatchAccess::Read => CoreWatchpointAccess::Read,
            CliWatchAccess::Write => CoreWatchpointAccess::Write,
            CliWatchAccess::ReadWrite => CoreWatchpointAccess::ReadWrite,
            CliWatchAccess::Execute => CoreWatchpointAccess::Execute,
        }
    }
}

#[derive(Copy, Clone, Default, ValueEnum)]
enum CliStepMode {
    #[default]
    Into,
    Over,
    Out,
}

impl From<CliStepMode> for CoreStepMode {
    fn from(value: CliStepMode) -> Self {
        match value {
            CliStepMode::Into => CoreStepMode::StepInto,
            CliStepMode::Over => CoreStepMode::StepOver,
            CliStepMode::Out => CoreStepMode::StepOut,
        }
    }
}
