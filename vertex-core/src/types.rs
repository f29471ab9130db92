//! Shared data-model types crossing the plugin boundary or the facade.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub base: u64,
    pub size: u64,
    pub module_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepMode {
    StepInto,
    StepOver,
    StepOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchType {
    None,
    UnconditionalJump,
    ConditionalJump,
    Call,
    Return,
    Loop,
    Interrupt,
}

#[derive(Debug, Clone)]
pub struct DisassemblyLine {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
    pub comment: String,
    pub is_current_instruction: bool,
    pub has_breakpoint: bool,
    pub is_jump_target: bool,
    pub is_call_target: bool,
    pub branch_target: Option<u64>,
    pub branch_type: BranchType,
}

#[derive(Debug, Clone)]
pub struct DisassemblyRange {
    pub start_address: u64,
    pub end_address: u64,
    pub lines: Vec<DisassemblyLine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterCategory {
    General,
    Segment,
    Flags,
    FloatingPoint,
    Vector,
    Debug,
    Control,
}

#[derive(Debug, Clone)]
pub struct Register {
    pub name: String,
    pub category: RegisterCategory,
    pub value: u64,
    pub previous_value: u64,
    pub bit_width: u8,
    pub modified: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RegisterSet {
    pub general_purpose: Vec<Register>,
    pub segment: Vec<Register>,
    pub flags: Vec<Register>,
    pub floating_point: Vec<Register>,
    pub vector: Vec<Register>,
    pub instruction_pointer: u64,
    pub stack_pointer: u64,
    pub base_pointer: u64,
}

#[derive(Debug, Clone)]
pub struct StackFrame {
    pub frame_index: u32,
    pub return_address: u64,
    pub frame_pointer: u64,
    pub stack_pointer: u64,
    pub function_name: String,
}

#[derive(Debug, Clone)]
pub struct ExportEntry {
    pub name: Option<String>,
    pub ordinal: u16,
    pub rva: u32,
    pub forwarded_to: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ImportEntry {
    pub module: String,
    pub name: Option<String>,
    pub ordinal: Option<u16>,
    pub thunk_rva: u32,
}
