//! DR7 debug-control-register bitfield encoding, kept in one place since a
//! misencoding silently mis-triggers watchpoints and is hard to catch in
//! integration tests. Grounded on
//! `src/vertexusrrt/windows/debugger/breakpoints/hardware_breakpoints.cc`.

use bitfield::bitfield;

bitfield! {
    /// Raw DR7 layout: one local-enable bit per slot at `2*slot`, and one
    /// 2-bit R/W + 2-bit LEN field per slot packed from bit 16 onward.
    struct Dr7Bits(u64);
    impl Debug;
    l0, set_l0: 0, 0;
    l1, set_l1: 2, 2;
    l2, set_l2: 4, 4;
    l3, set_l3: 6, 6;
    rw0, set_rw0: 17, 16;
    len0, set_len0: 19, 18;
    rw1, set_rw1: 21, 20;
    len1, set_len1: 23, 22;
    rw2, set_rw2: 25, 24;
    len2, set_len2: 27, 26;
    rw3, set_rw3: 29, 28;
    len3, set_len3: 31, 30;
}

impl Dr7Bits {
    fn local_enable(&self, slot: u8) -> bool {
        match slot {
            0 => self.l0() != 0,
            1 => self.l1() != 0,
            2 => self.l2() != 0,
            3 => self.l3() != 0,
            _ => unreachable!("DR7 has only 4 slots"),
        }
    }

    fn set_local_enable_bit(&mut self, slot: u8, value: bool) {
        let bit = value as u64;
        match slot {
            0 => self.set_l0(bit),
            1 => self.set_l1(bit),
            2 => self.set_l2(bit),
            3 => self.set_l3(bit),
            _ => unreachable!("DR7 has only 4 slots"),
        }
    }

    fn rw(&self, slot: u8) -> u64 {
        match slot {
            0 => self.rw0(),
            1 => self.rw1(),
            2 => self.rw2(),
            3 => self.rw3(),
            _ => unreachable!("DR7 has only 4 slots"),
        }
    }

    fn set_rw(&mut self, slot: u8, value: u64) {
        match slot {
            0 => self.set_rw0(value),
            1 => self.set_rw1(value),
            2 => self.set_rw2(value),
            3 => self.set_rw3(value),
            _ => unreachable!("DR7 has only 4 slots"),
        }
    }

    fn len(&self, slot: u8) -> u64 {
        match slot {
            0 => self.len0(),
            1 => self.len1(),
            2 => self.len2(),
            3 => self.len3(),
            _ => unreachable!("DR7 has only 4 slots"),
        }
    }

    fn set_len(&mut self, slot: u8, value: u64) {
        match slot {
            0 => self.set_len0(value),
            1 => self.set_len1(value),
            2 => self.set_len2(value),
            3 => self.set_len3(value),
            _ => unreachable!("DR7 has only 4 slots"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Execute,
    Write,
    ReadWrite,
}

impl Condition {
    fn bits(self) -> u64 {
        match self {
            Condition::Execute => 0b00,
            Condition::Write => 0b01,
            Condition::ReadWrite => 0b11,
        }
    }

    fn from_bits(bits: u64) -> Option<Condition> {
        match bits & 0b11 {
            0b00 => Some(Condition::Execute),
            0b01 => Some(Condition::Write),
            0b11 => Some(Condition::ReadWrite),
            _ => None, // 0b10 ("I/O read/write") is not used by this debugger
        }
    }
}

/// Length field is intentionally non-monotonic: `10` means 8 bytes, not 4.
fn length_bits(size: u8) -> Option<u64> {
    match size {
        1 => Some(0b00),
        2 => Some(0b01),
        8 => Some(0b10),
        4 => Some(0b11),
        _ => None,
    }
}

fn length_from_bits(bits: u64) -> Option<u8> {
    match bits & 0b11 {
        0b00 => Some(1),
        0b01 => Some(2),
        0b10 => Some(8),
        0b11 => Some(4),
        _ => unreachable!(),
    }
}

/// Sets local-enable, condition, and length for `slot`, leaving every other
/// slot's bits untouched.
pub fn set_slot(dr7: u64, slot: u8, condition: Condition, size: u8) -> Option<u64> {
    let length = length_bits(size)?;
    let mut bits = Dr7Bits(dr7);
    bits.set_local_enable_bit(slot, true);
    bits.set_rw(slot, condition.bits());
    bits.set_len(slot, length);
    Some(bits.0)
}

/// Fully clears a slot's address-config bits (local-enable + condition +
/// length), used when removing a hardware breakpoint/watchpoint.
pub fn clear_slot(dr7: u64, slot: u8) -> u64 {
    let mut bits = Dr7Bits(dr7);
    bits.set_local_enable_bit(slot, false);
    bits.set_rw(slot, 0);
    bits.set_len(slot, 0);
    bits.0
}

/// Clears only the local-enable bit, preserving condition/length. Used to
/// temporarily disable a watchpoint slot while the faulting instruction
/// retires.
pub fn clear_local_enable(dr7: u64, slot: u8) -> u64 {
    let mut bits = Dr7Bits(dr7);
    bits.set_local_enable_bit(slot, false);
    bits.0
}

/// Re-sets only the local-enable bit, matching `clear_local_enable`'s
/// counterpart in the re-enable path.
pub fn set_local_enable(dr7: u64, slot: u8) -> u64 {
    let mut bits = Dr7Bits(dr7);
    bits.set_local_enable_bit(slot, true);
    bits.0
}

pub fn is_local_enabled(dr7: u64, slot: u8) -> bool {
    Dr7Bits(dr7).local_enable(slot)
}

pub struct SlotConfig {
    pub condition: Condition,
    pub size: u8,
}

pub fn decode_slot(dr7: u64, slot: u8) -> Option<SlotConfig> {
    let bits = Dr7Bits(dr7);
    if !bits.local_enable(slot) {
        return None;
    }
    let condition = Condition::from_bits(bits.rw(slot))?;
    let size = length_from_bits(bits.len(slot))?;
    Some(SlotConfig { condition, size })
}

/// Which slot (0..=3) triggered, per DR6's low 4 bits.
pub fn triggered_slot(dr6: u64) -> Option<u8> {
    (0u8..4).find(|&slot| dr6 & (1 << slot) != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_combination_of_slot_condition_size() {
        for slot in 0u8..4 {
            for condition in [Condition::Execute, Condition::Write, Condition::ReadWrite] {
                for size in [1u8, 2, 4, 8] {
                    let dr7 = set_slot(0, slot, condition, size).unwrap();
                    assert!(is_local_enabled(dr7, slot));
                    let decoded = decode_slot(dr7, slot).unwrap();
                    assert_eq!(decoded.condition, condition);
                    assert_eq!(decoded.size, size);
                }
            }
        }
    }

    #[test]
    fn length_encoding_is_non_monotonic() {
        assert_eq!(length_bits(1), Some(0b00));
        assert_eq!(length_bits(2), Some(0b01));
        assert_eq!(length_bits(8), Some(0b10));
        assert_eq!(length_bits(4), Some(0b11));
    }

    #[test]
    fn setting_one_slot_does_not_disturb_others() {
        let dr7 = set_slot(0, 0, Condition::Execute, 1).unwrap();
        let dr7 = set_slot(dr7, 2, Condition::Write, 4).unwrap();
        assert!(is_local_enabled(dr7, 0));
        assert!(is_local_enabled(dr7, 2));
        assert!(!is_local_enabled(dr7, 1));
        assert!(!is_local_enabled(dr7, 3));

        let slot0 = decode_slot(dr7, 0).unwrap();
        assert_eq!(slot0.condition, Condition::Execute);
        assert_eq!(slot0.size, 1);
        let slot2 = decode_slot(dr7, 2).unwrap();
        assert_eq!(slot2.condition, Condition::Write);
        assert_eq!(slot2.size, 4);
    }

    #[test]
    fn clear_local_enable_preserves_condition_and_size() {
        let dr7 = set_slot(0, 1, Condition::ReadWrite, 8).unwrap();
        let disabled = clear_local_enable(dr7, 1);
        assert!(!is_local_enabled(disabled, 1));

        let re_enabled = set_local_enable(disabled, 1);
        let decoded = decode_slot(re_enabled, 1).unwrap();
        assert_eq!(decoded.condition, Condition::ReadWrite);
        assert_eq!(decoded.size, 8);
    }

    #[test]
    fn clear_slot_removes_condition_and_length_too() {
        let dr7 = set_slot(0, 3, Condition::Write, 2).unwrap();
        let cleared = clear_slot(dr7, 3);
        assert!(!is_local_enabled(cleared, 3));
        assert!(decode_slot(cleared, 3).is_none());
    }

    #[test]
    fn rejects_unsupported_sizes() {
        assert!(set_slot(0, 0, Condition::Execute, 3).is_none());
    }

    #[test]
    fn triggered_slot_reads_dr6_low_bits() {
        assert_eq!(triggered_slot(0b0000), None);
        assert_eq!(triggered_slot(0b0001), Some(0));
        assert_eq!(triggered_slot(0b0100), Some(2));
    }
}
