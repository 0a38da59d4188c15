//! # Code
//!
//! Per-architecture instruction decoding and the jumps written into targets and trampolines

use std::mem;

use iced_x86::{Decoder, DecoderOptions};

pub mod x64;
pub mod x86;

pub use x64::X64;
pub use x86::X86;

/// Architecture of the running process
#[cfg(target_pointer_width = "64")]
pub type Native = X64;
/// Architecture of the running process
#[cfg(target_pointer_width = "32")]
pub type Native = X86;

/// Length of a `jmp rel32` instruction, the smallest patch ever written
pub const JMP_REL_LEN: usize = mem::size_of::<JmpRel>();

#[repr(packed)]
#[allow(dead_code)]
/// Struct helper for generating a relative jump
struct JmpRel {
    /// `jmp rel32` opcode
    opcode: u8,
    /// Displacement from the end of the instruction
    displacement: i32,
}

/// Encodes `jmp rel32` with the given displacement
pub fn jmp_rel(displacement: i32) -> [u8; JMP_REL_LEN] {
    unsafe {
        mem::transmute(JmpRel {
            opcode: 0xe9,
            displacement,
        })
    }
}

/// Helper functions for an architecture
pub trait Architecture {
    /// Decoder bitness
    const BITNESS: u32;
    /// Longest encodable instruction
    const MAX_INSTRUCTION_LEN: usize = 15;

    /// Creates an instruction decoder over `data`, which is assumed to live at `ip`
    fn decoder(data: &[u8], ip: u64) -> Decoder<'_> {
        Decoder::with_ip(Self::BITNESS, data, ip, DecoderOptions::NONE)
    }

    /// Encodes a `jmp rel32` placed at `from` that lands on `to`, or `None` if `to` is out of reach
    fn jmp_to(from: usize, to: usize) -> Option<[u8; JMP_REL_LEN]>;

    /// Encodes a position-independent jump to `to` for when [`Architecture::jmp_to`] cannot reach it.
    ///
    /// Returns `None` when the architecture has no such jump, or never needs one.
    fn relay(to: usize) -> Option<Vec<u8>>;
}
