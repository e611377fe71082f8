//! Two-pass symbolic assembler: resolves [`Label`]s and [`SymJump`]s into
//! the final flat instruction stream with numeric relative offsets.

use crate::error::{Error, Result};
use crate::insn::{Insn, JumpOp, LddwMode, Reg};
use std::collections::HashMap;

/// One element of a pre-assembly stream.
pub enum Stmt {
    /// An already-fully-formed instruction.
    Insn(Insn),
    /// Both slots of an `lddw` pair, kept together so label-position
    /// accounting can count them as a single two-slot unit.
    Lddw([Insn; 2]),
    /// A position marker. Contributes zero slots.
    Label(String),
    /// An immediate-form conditional or unconditional jump whose target is
    /// a label rather than a numeric offset.
    SymJump { op: Option<JumpOp>, dst: Reg, imm_or_src: JumpTarget, target: String },
}

/// Whether a symbolic jump compares against an immediate or a register.
pub enum JumpTarget {
    Imm(i32),
    Reg(Reg),
    None,
}

impl Stmt {
    /// Number of 8-byte slots this statement occupies once assembled.
    fn slots(&self) -> usize {
        match self {
            Stmt::Insn(_) => 1,
            Stmt::Lddw(_) => 2,
            Stmt::Label(_) => 0,
            Stmt::SymJump { .. } => 1,
        }
    }
}

/// Assemble a pre-assembly [`Stmt`] stream into a flat byte-exact
/// instruction stream, resolving every label reference.
pub fn assemble(stream: &[Stmt]) -> Result<Vec<Insn>> {
    // Pass 1: position accounting.
    let mut positions: HashMap<&str, usize> = HashMap::new();
    let mut pos = 0usize;
    for stmt in stream {
        if let Stmt::Label(name) = stmt {
            if positions.insert(name.as_str(), pos).is_some() {
                return Err(Error::Encoding {
                    op: "assemble",
                    detail: format!("duplicate label `{name}`"),
                });
            }
        }
        pos += stmt.slots();
    }

    // Pass 2: emission.
    let mut out = Vec::with_capacity(pos);
    let mut cur = 0usize;
    for stmt in stream {
        match stmt {
            Stmt::Insn(insn) => {
                out.push(*insn);
                cur += 1;
            }
            Stmt::Lddw(pair) => {
                out.push(pair[0]);
                out.push(pair[1]);
                cur += 2;
            }
            Stmt::Label(_) => {}
            Stmt::SymJump { op, dst, imm_or_src, target } => {
                let target_pos = *positions.get(target.as_str()).ok_or_else(|| Error::Encoding {
                    op: "assemble",
                    detail: format!("undefined label `{target}`"),
                })?;
                let offset = target_pos as i64 - cur as i64 - 1;
                if !(i16::MIN as i64..=i16::MAX as i64).contains(&offset) {
                    return Err(Error::JumpOutOfRange { label: target.clone(), offset });
                }
                let off = offset as i16;
                let insn = match op {
                    None => Insn::ja(off),
                    Some(op) => match imm_or_src {
                        JumpTarget::Imm(imm) => Insn::jmp_imm(*op, *dst, *imm, off),
                        JumpTarget::Reg(src) => Insn::jmp_reg(*op, *dst, *src, off),
                        JumpTarget::None => {
                            return Err(Error::Encoding {
                                op: "assemble",
                                detail: "conditional jump requires an operand".into(),
                            });
                        }
                    },
                };
                out.push(insn);
                cur += 1;
            }
        }
    }
    Ok(out)
}

/// Flatten an already-resolved instruction stream (no labels, no symbolic
/// jumps) into raw bytecode.
pub fn to_bytecode(insns: &[Insn]) -> Vec<u8> {
    let mut out = Vec::with_capacity(insns.len() * crate::insn::INSN_SIZE);
    for insn in insns {
        out.extend_from_slice(&insn.to_bytes());
    }
    out
}

/// Convenience: build, assemble, and count positions for an `lddw`-aware
/// program so callers can size `bpf_attr.insn_cnt` (which counts 8-byte
/// *slots*, not logical instructions).
pub fn insn_cnt(insns: &[Insn]) -> u32 {
    insns.len() as u32
}

pub fn lddw_stmt(dst: Reg, imm: i64, mode: LddwMode) -> Stmt {
    Stmt::Lddw(Insn::lddw(dst, imm, mode))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::insn::{AluOp, MemWidth};

    #[test]
    fn fixed_point_on_label_free_stream() {
        let stream = vec![Stmt::Insn(Insn::mov64_imm(Reg::R0, 2)), Stmt::Insn(Insn::exit())];
        let once = assemble(&stream).unwrap();
        let restream: Vec<Stmt> = once.iter().map(|i| Stmt::Insn(*i)).collect();
        let twice = assemble(&restream).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn forward_jump_offset_skips_two_instructions() {
        // mov r0, 0; jeq r1, 0, :ok; mov r0, -1; exit; ok: mov r0, 1; exit
        let stream = vec![
            Stmt::Insn(Insn::mov64_imm(Reg::R0, 0)),
            Stmt::SymJump {
                op: Some(JumpOp::Jeq),
                dst: Reg::R1,
                imm_or_src: JumpTarget::Imm(0),
                target: "ok".into(),
            },
            Stmt::Insn(Insn::mov64_imm(Reg::R0, -1)),
            Stmt::Insn(Insn::exit()),
            Stmt::Label("ok".into()),
            Stmt::Insn(Insn::mov64_imm(Reg::R0, 1)),
            Stmt::Insn(Insn::exit()),
        ];
        let out = assemble(&stream).unwrap();
        assert_eq!(out.len(), 6);
        // jeq is at position 1, target "ok" is at position 3 (labels elide).
        assert_eq!(out[1].off, 1);
    }

    #[test]
    fn backward_jump_offset_is_negative() {
        let stream = vec![
            Stmt::Label("top".into()),
            Stmt::Insn(Insn::alu64_imm(AluOp::Sub, Reg::R1, 1)),
            Stmt::SymJump { op: Some(JumpOp::Jne), dst: Reg::R1, imm_or_src: JumpTarget::Imm(0), target: "top".into() },
            Stmt::Insn(Insn::exit()),
        ];
        let out = assemble(&stream).unwrap();
        // jne at position 1 targets position 0: offset = 0 - 1 - 1 = -2
        assert_eq!(out[1].off, -2);
    }

    #[test]
    fn duplicate_label_is_fatal() {
        let stream = vec![Stmt::Label("x".into()), Stmt::Label("x".into())];
        assert!(assemble(&stream).is_err());
    }

    #[test]
    fn undefined_label_is_fatal() {
        let stream = vec![Stmt::SymJump { op: None, dst: Reg::R0, imm_or_src: JumpTarget::None, target: "nowhere".into() }];
        assert!(assemble(&stream).is_err());
    }

    #[test]
    fn lddw_counts_as_two_positions() {
        let stream = vec![
            lddw_stmt(Reg::R1, 0x1_0000_0000, LddwMode::Imm64),
            Stmt::Label("here".into()),
            Stmt::Insn(Insn::exit()),
        ];
        let out = assemble(&stream).unwrap();
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn unconditional_jump_out_of_range_rejected() {
        let mut stream = vec![Stmt::SymJump { op: None, dst: Reg::R0, imm_or_src: JumpTarget::None, target: "far".into() }];
        for _ in 0..70_000 {
            stream.push(Stmt::Insn(Insn::exit()));
        }
        stream.push(Stmt::Label("far".into()));
        assert!(matches!(assemble(&stream), Err(Error::JumpOutOfRange { .. })));
    }

    #[test]
    fn to_bytecode_length_matches_insn_count() {
        let insns = vec![Insn::mov64_imm(Reg::R0, 2), Insn::exit()];
        let bytes = to_bytecode(&insns);
        assert_eq!(bytes.len(), insns.len() * crate::insn::INSN_SIZE);
        assert_eq!(insn_cnt(&insns), 2);
    }

    #[test]
    fn memwidth_variants_encode_distinct_bits() {
        let b = Insn::load_mem(Reg::R0, Reg::R1, 0, MemWidth::B);
        let w = Insn::load_mem(Reg::R0, Reg::R1, 0, MemWidth::W);
        assert_ne!(b.opcode, w.opcode);
    }
}
