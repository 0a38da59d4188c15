//! # Scan
//!
//! Finds how many leading bytes of a function can be replaced without splitting an instruction

use std::marker::PhantomData;

use iced_x86::{FlowControl, Instruction, OpKind};

use crate::code::Architecture;
use crate::error::HookError;

/// Decodes `code` from offset 0 until at least `min_len` bytes are covered by whole instructions.
///
/// Decoding stops early at the first byte sequence that is not a complete, valid instruction
/// within the first `max_len` bytes. The result is always an instruction boundary, and is
/// below `min_len` only if decoding stopped early.
pub fn scan_minimum_length<A: Architecture>(code: &[u8], min_len: usize, max_len: usize) -> usize {
    decode::<A>(code, 0, min_len, max_len).1
}

/// Decodes instructions one at a time until `min_len` bytes are covered
fn decode<A: Architecture>(
    code: &[u8],
    ip: u64,
    min_len: usize,
    max_len: usize,
) -> (Vec<Instruction>, usize) {
    let window = &code[..max_len.min(code.len())];
    let mut decoder = A::decoder(window, ip);
    let mut instruction = Instruction::default();
    let mut instructions = Vec::new();
    let mut len = 0;

    while len < min_len && decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        // Also covers an instruction cut off by the end of the window
        if instruction.is_invalid() {
            break;
        }
        len += instruction.len();
        instructions.push(instruction);
    }

    (instructions, len)
}

/// The whole instructions at the head of a function that a patch will replace
#[derive(Debug, Clone)]
pub struct Prologue<A: Architecture> {
    /// Address the prologue was decoded at
    address: usize,
    /// Decoded instructions, in order
    instructions: Vec<Instruction>,
    /// Total length of `instructions`
    len: usize,
    /// Architecture the prologue was decoded for
    _arch: PhantomData<A>,
}

impl<A: Architecture> Prologue<A> {
    /// Decodes the shortest run of whole instructions at the start of `code` that covers `min_len` bytes,
    /// looking no further than `max_len` bytes.
    ///
    /// `address` is where `code` lives; it only affects how IP-relative operands decode.
    pub fn scan(
        code: &[u8],
        address: usize,
        min_len: usize,
        max_len: usize,
    ) -> Result<Self, HookError> {
        let (instructions, len) = decode::<A>(code, address as u64, min_len, max_len);
        if len < min_len {
            return Err(HookError::ScanFailed {
                address,
                found: len,
                required: min_len,
            });
        }

        tracing::debug!(
            "Prologue at {:x} is {} bytes over {} instructions",
            address,
            len,
            instructions.len()
        );

        Ok(Self {
            address,
            instructions,
            len,
            _arch: PhantomData,
        })
    }

    /// Number of bytes covered
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether no instructions were decoded
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The decoded instructions
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Offset of every instruction, plus the end offset
    pub fn boundaries(&self) -> Vec<usize> {
        let mut offset = 0;
        let mut boundaries = vec![0];
        for instruction in &self.instructions {
            offset += instruction.len();
            boundaries.push(offset);
        }
        boundaries
    }

    /// Checks that a verbatim copy of the prologue, followed by a jump back, behaves like the original.
    ///
    /// Instructions addressing memory relative to themselves, and relative branches, would point
    /// somewhere else once copied. An instruction that ends the function before the prologue does
    /// means the patch would spill over whatever follows the function.
    pub fn check_relocatable(&self) -> Result<(), HookError> {
        let mut offset = 0;
        for instruction in &self.instructions {
            let end = offset + instruction.len();

            if is_position_dependent(instruction) {
                return Err(HookError::RelocationRequired {
                    address: self.address,
                    offset,
                });
            }

            if end < self.len && is_terminal(instruction) {
                return Err(HookError::TargetTooSmall {
                    address: self.address,
                    len: end,
                });
            }

            offset = end;
        }
        Ok(())
    }
}

/// Whether the instruction means something different at another address
fn is_position_dependent(instruction: &Instruction) -> bool {
    instruction.is_ip_rel_memory_operand()
        || (0..instruction.op_count()).any(|operand| {
            matches!(
                instruction.op_kind(operand),
                OpKind::NearBranch16 | OpKind::NearBranch32 | OpKind::NearBranch64
            )
        })
}

/// Whether execution never falls through to the next instruction
fn is_terminal(instruction: &Instruction) -> bool {
    matches!(
        instruction.flow_control(),
        FlowControl::Return
            | FlowControl::UnconditionalBranch
            | FlowControl::IndirectBranch
            | FlowControl::Interrupt
            | FlowControl::Exception
    )
}
