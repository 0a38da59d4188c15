use super::{jmp_rel, Architecture, JMP_REL_LEN};

/// 32-bit x86
///
/// The address space is 4 GiB, so a wrapping rel32 displacement reaches every address.
#[derive(Debug, Clone, Copy)]
pub struct X86;

impl Architecture for X86 {
    const BITNESS: u32 = 32;

    fn jmp_to(from: usize, to: usize) -> Option<[u8; JMP_REL_LEN]> {
        let next = (from as u32).wrapping_add(JMP_REL_LEN as u32);
        Some(jmp_rel((to as u32).wrapping_sub(next) as i32))
    }

    fn relay(_to: usize) -> Option<Vec<u8>> {
        None
    }
}
