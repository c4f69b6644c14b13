//! Frame layout and prologue/epilogue insertion.
//!
//! Layout, growing down from the caller's stack pointer:
//!
//! ```text
//! [ caller stack ]
//! [ saved x29 | saved x30 ]         <-- fp after the prologue
//! [ additional saved callee regs ]  (paired stp; single str for odd counts)
//! [ spill slots ]
//! [ local alloca area ]             (16-byte aligned, total rounded up)
//! ```
//!
//! SP stays 16-byte aligned at every instruction boundary; oversized frame
//! adjustments are split into 16-byte-multiple chunks.

use viper_core::mir::{
    MFunction, MInstr, MOpcode, MOperand, MReg, PhysReg,
};

use crate::Result;

/// Largest single `sub sp, sp, #imm` adjustment we emit; a 16-byte multiple
/// so intermediate SP values stay aligned.
const MAX_SP_CHUNK: i64 = 4080;

/// Compute the final stack layout for an allocated function, rewrite frame
/// slot operands to concrete `[x29, #offset]` addressing, and insert the
/// prologue and epilogues.
pub fn plan(mf: &mut MFunction) -> Result<()> {
    let saved_bytes = 16 * pair_count(mf.saved_gprs.len()) + 16 * pair_count(mf.saved_fprs.len());

    // Slot offsets within the locals area, in slot order.
    let mut offsets = Vec::with_capacity(mf.frame.slots.len());
    let mut running: u32 = 0;
    for slot in &mf.frame.slots {
        running = align_up(running, slot.align);
        offsets.push(running + slot.size);
        running += slot.size;
    }
    let locals_total = align_up(running, 16);
    mf.local_frame_size = locals_total;

    let fp_offset = |slot: u32| -> i32 { -((saved_bytes as i32) + offsets[slot as usize] as i32) };

    for block in &mut mf.blocks {
        for instr in &mut block.instrs {
            match instr.op {
                MOpcode::Ldr | MOpcode::Str => {
                    if let Some(MOperand::Frame(slot)) = instr.operands.get(1).cloned() {
                        instr.operands[1] = MOperand::Mem {
                            base: MReg::Phys(PhysReg::FP),
                            offset: fp_offset(slot),
                            index: None,
                            scale: 0,
                        };
                    }
                }
                MOpcode::AddRRI => {
                    // Alloca address: `add dst, x29, frame.N` has a negative
                    // resolved offset, so it becomes a subtract.
                    if let Some(MOperand::Frame(slot)) = instr.operands.get(2).cloned() {
                        instr.op = MOpcode::SubRRI;
                        instr.operands[2] = MOperand::Imm(-fp_offset(slot) as i64);
                    }
                }
                _ => {}
            }
        }
    }

    let prologue = build_prologue(mf, locals_total);
    let epilogue = build_epilogue(mf, locals_total);

    for (bi, block) in mf.blocks.iter_mut().enumerate() {
        let mut rewritten = Vec::with_capacity(block.instrs.len() + 4);
        if bi == 0 {
            rewritten.extend(prologue.iter().cloned());
        }
        for instr in block.instrs.drain(..) {
            if instr.op == MOpcode::Ret {
                rewritten.extend(epilogue.iter().cloned());
            }
            rewritten.push(instr);
        }
        block.instrs = rewritten;
    }
    Ok(())
}

fn build_prologue(mf: &MFunction, locals_total: u32) -> Vec<MInstr> {
    let mut out = Vec::new();
    out.push(MInstr::new(
        MOpcode::StpPre,
        vec![MOperand::phys(PhysReg::FP), MOperand::phys(PhysReg::LR)],
    ));
    out.push(MInstr::new(
        MOpcode::MovRR,
        vec![MOperand::phys(PhysReg::FP), MOperand::phys(PhysReg::Sp)],
    ));
    push_saves(&mut out, &mf.saved_gprs);
    push_saves(&mut out, &mf.saved_fprs);
    adjust_sp(&mut out, MOpcode::SubSpImm, locals_total as i64);
    out
}

fn build_epilogue(mf: &MFunction, locals_total: u32) -> Vec<MInstr> {
    let mut out = Vec::new();
    adjust_sp(&mut out, MOpcode::AddSpImm, locals_total as i64);
    pop_saves(&mut out, &mf.saved_fprs);
    pop_saves(&mut out, &mf.saved_gprs);
    out.push(MInstr::new(
        MOpcode::LdpPost,
        vec![MOperand::phys(PhysReg::FP), MOperand::phys(PhysReg::LR)],
    ));
    out
}

/// `stp rA, rB, [sp, #-16]!` for each pair; a trailing odd register uses
/// `str rA, [sp, #-16]!`.
fn push_saves(out: &mut Vec<MInstr>, regs: &[PhysReg]) {
    let mut i = 0;
    while i + 1 < regs.len() {
        out.push(MInstr::new(
            MOpcode::StpPre,
            vec![MOperand::phys(regs[i]), MOperand::phys(regs[i + 1])],
        ));
        i += 2;
    }
    if i < regs.len() {
        out.push(MInstr::new(MOpcode::StrPre, vec![MOperand::phys(regs[i])]));
    }
}

/// Exact reverse of [`push_saves`].
fn pop_saves(out: &mut Vec<MInstr>, regs: &[PhysReg]) {
    let mut n = regs.len();
    if n % 2 == 1 {
        out.push(MInstr::new(
            MOpcode::LdrPost,
            vec![MOperand::phys(regs[n - 1])],
        ));
        n -= 1;
    }
    while n > 0 {
        out.push(MInstr::new(
            MOpcode::LdpPost,
            vec![MOperand::phys(regs[n - 2]), MOperand::phys(regs[n - 1])],
        ));
        n -= 2;
    }
}

fn adjust_sp(out: &mut Vec<MInstr>, op: MOpcode, mut bytes: i64) {
    while bytes > MAX_SP_CHUNK {
        out.push(MInstr::new(op, vec![MOperand::Imm(MAX_SP_CHUNK)]));
        bytes -= MAX_SP_CHUNK;
    }
    if bytes > 0 {
        out.push(MInstr::new(op, vec![MOperand::Imm(bytes)]));
    }
}

fn pair_count(n: usize) -> u32 {
    n.div_ceil(2) as u32
}

fn align_up(v: u32, align: u32) -> u32 {
    (v + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_core::mir::{MBlock, RegClass, SlotKind};

    #[test]
    fn prologue_and_epilogue_bracket_the_body() {
        let mut mf = MFunction::new("f");
        let mut bb = MBlock::new("entry");
        bb.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(bb);
        plan(&mut mf).unwrap();
        let ops: Vec<MOpcode> = mf.blocks[0].instrs.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                MOpcode::StpPre,
                MOpcode::MovRR,
                MOpcode::LdpPost,
                MOpcode::Ret
            ]
        );
    }

    #[test]
    fn saved_registers_push_in_pairs_and_pop_in_reverse() {
        let mut mf = MFunction::new("f");
        mf.saved_gprs = vec![PhysReg::X(19), PhysReg::X(20), PhysReg::X(21)];
        let mut bb = MBlock::new("entry");
        bb.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(bb);
        plan(&mut mf).unwrap();
        let ops: Vec<MOpcode> = mf.blocks[0].instrs.iter().map(|i| i.op).collect();
        assert_eq!(
            ops,
            vec![
                MOpcode::StpPre, // fp/lr
                MOpcode::MovRR,
                MOpcode::StpPre, // x19, x20
                MOpcode::StrPre, // x21
                MOpcode::LdrPost,
                MOpcode::LdpPost,
                MOpcode::LdpPost, // fp/lr
                MOpcode::Ret
            ]
        );
    }

    #[test]
    fn frame_slots_resolve_below_saved_registers() {
        let mut mf = MFunction::new("f");
        mf.saved_gprs = vec![PhysReg::X(19), PhysReg::X(20)];
        let slot = mf.frame.add_local(16, 16);
        let spill = mf.frame.ensure_spill(RegClass::Gpr, 7);
        assert_eq!(mf.frame.slots[spill as usize].kind, SlotKind::Spill(RegClass::Gpr, 7));
        let mut bb = MBlock::new("entry");
        bb.push(MInstr::new(
            MOpcode::AddRRI,
            vec![
                MOperand::vreg(RegClass::Gpr, 1),
                MOperand::phys(PhysReg::FP),
                MOperand::Frame(slot),
            ],
        ));
        bb.push(MInstr::new(
            MOpcode::Ldr,
            vec![MOperand::phys(PhysReg::X(9)), MOperand::Frame(spill)],
        ));
        bb.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(bb);
        plan(&mut mf).unwrap();

        // 16 bytes of saved regs, local slot at [-32, -16), spill at -40.
        let body = &mf.blocks[0].instrs;
        let alloca = body.iter().find(|i| i.op == MOpcode::SubRRI).unwrap();
        assert_eq!(alloca.operands[2], MOperand::Imm(32));
        let reload = body.iter().find(|i| i.op == MOpcode::Ldr).unwrap();
        assert_eq!(
            reload.operands[1],
            MOperand::Mem {
                base: MReg::Phys(PhysReg::FP),
                offset: -40,
                index: None,
                scale: 0
            }
        );
        // Locals area rounds to 16.
        assert_eq!(mf.local_frame_size, 32);
    }
}
