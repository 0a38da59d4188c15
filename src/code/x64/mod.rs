use std::mem;

use super::{jmp_rel, Architecture, JMP_REL_LEN};

/// 64-bit x86
#[derive(Debug, Clone, Copy)]
pub struct X64;

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating an absolute jump
struct JmpAbs {
    /// Absolute jmp instruction (jmp [rip + 0])
    jmp: [u8; 6],
    /// Absolute address to jump to
    target: u64,
}

/// Length of the absolute jump produced by [`jmp_abs`]
pub const JMP_ABS_LEN: usize = mem::size_of::<JmpAbs>();

/// Generates an absolute jump to a specified address and returns bytecode
pub fn jmp_abs(target: u64) -> [u8; JMP_ABS_LEN] {
    unsafe {
        mem::transmute(JmpAbs {
            jmp: [0xff, 0x25, 0x00, 0x00, 0x00, 0x00],
            target,
        })
    }
}

impl Architecture for X64 {
    const BITNESS: u32 = 64;

    fn jmp_to(from: usize, to: usize) -> Option<[u8; JMP_REL_LEN]> {
        let next = from as i128 + JMP_REL_LEN as i128;
        i32::try_from(to as i128 - next).ok().map(jmp_rel)
    }

    fn relay(to: usize) -> Option<Vec<u8>> {
        Some(jmp_abs(to as u64).to_vec())
    }
}
