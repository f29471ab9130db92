//! `iced-x86`-backed instruction decode, used by the step-over/step-out
//! logic in `vertex_core::debugger::loop_` to tell a `call` apart from
//! everything else without reimplementing an x86 decoder.

use iced_x86::{Decoder, DecoderOptions, Mnemonic};
use vertex_core::debugger::loop_::Disassembler;
use vertex_core::registry::Architecture;

pub struct IcedDisassembler {
    bitness: u32,
}

impl IcedDisassembler {
    pub fn new(architecture: Architecture) -> Self {
        let bitness = match architecture {
            Architecture::X86 => 32,
            Architecture::X64 => 64,
        };
        Self { bitness }
    }
}

impl Disassembler for IcedDisassembler {
    fn decode_one(&self, bytes: &[u8]) -> Option<(usize, bool)> {
        let mut decoder = Decoder::with_ip(self.bitness, bytes, 0, DecoderOptions::NONE);
        if !decoder.can_decode() {
            return None;
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return None;
        }
        let is_call = matches!(instruction.mnemonic(), Mnemonic::Call);
        Some((instruction.len(), is_call))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_near_call_as_a_call() {
        // E8 00 00 00 00 -> call rel32 (0)
        let disassembler = IcedDisassembler::new(Architecture::X64);
        let (length, is_call) = disassembler.decode_one(&[0xE8, 0x00, 0x00, 0x00, 0x00]).unwrap();
        assert_eq!(length, 5);
        assert!(is_call);
    }

    #[test]
    fn decodes_a_nop_as_not_a_call() {
        let disassembler = IcedDisassembler::new(Architecture::X64);
        let (length, is_call) = disassembler.decode_one(&[0x90]).unwrap();
        assert_eq!(length, 1);
        assert!(!is_call);
    }
}
