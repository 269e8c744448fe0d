//! Return-site discovery
//!
//! Finds every physical return instruction in a function body. Some
//! runtimes (Go in particular) cannot be traced with uretprobes because
//! they move goroutine stacks, so function exit is observed by placing a
//! plain uprobe on each return instruction instead.

use iced_x86::{Decoder, DecoderOptions, FlowControl, Instruction};
use log::warn;

/// Instruction set of a function body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodeArch {
    X86_64,
    Aarch64,
    Unsupported,
}

/// Raw machine code of one function
#[derive(Debug, Clone)]
pub struct FunctionCode {
    pub arch: CodeArch,
    pub bytes: Vec<u8>,
}

/// Offsets (from the function start) of every return instruction
///
/// Undecodable bytes are skipped; the scan never stops early, so callers
/// see the full count and can decide what to do when it is too large.
pub fn find_return_offsets(code: &FunctionCode) -> Vec<u64> {
    match code.arch {
        CodeArch::X86_64 => x86_64_returns(&code.bytes),
        CodeArch::Aarch64 => aarch64_returns(&code.bytes),
        CodeArch::Unsupported => {
            warn!("Return-site discovery not supported for this architecture");
            Vec::new()
        }
    }
}

fn x86_64_returns(bytes: &[u8]) -> Vec<u64> {
    let mut decoder = Decoder::with_ip(64, bytes, 0, DecoderOptions::NONE);
    let mut instruction = Instruction::default();
    let mut offsets = Vec::new();

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);
        if !instruction.is_invalid() && instruction.flow_control() == FlowControl::Return {
            offsets.push(instruction.ip());
        }
    }

    offsets
}

/// `RET Xn`: 1101011 0 0 10 11111 000000 nnnnn 00000
const AARCH64_RET_MASK: u32 = 0xffff_fc1f;
const AARCH64_RET: u32 = 0xd65f_0000;
/// Pointer-authenticated returns
const AARCH64_RETAA: u32 = 0xd65f_0bff;
const AARCH64_RETAB: u32 = 0xd65f_0fff;

fn aarch64_returns(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(4)
        .enumerate()
        .filter_map(|(i, word)| {
            let insn = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            let is_ret = insn & AARCH64_RET_MASK == AARCH64_RET
                || insn == AARCH64_RETAA
                || insn == AARCH64_RETAB;
            is_ret.then_some(i as u64 * 4)
        })
        .collect()
}
