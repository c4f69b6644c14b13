//! Conservative post-allocation peephole pass.
//!
//! Runs after register allocation, when every operand is physical. Three
//! rewrites, all block-local:
//!
//! 1. Identity `mov`/`fmov` elimination.
//! 2. Store-to-load forwarding: a load from the most recently stored frame
//!    slot becomes a register move (or disappears when source and
//!    destination agree).
//! 3. Redundant reload elimination, as a special case of 2.
//!
//! Forwarding only tracks frame-slot stores and is dropped at calls, at
//! stores through pointers (which may alias a local whose address was
//! taken), and when the stored register is redefined.

use viper_core::mir::{MFunction, MInstr, MOpcode, MOperand, MReg, MemWidth};

use crate::lower::moves;

pub fn run(mf: &mut MFunction) {
    for block in &mut mf.blocks {
        let mut out: Vec<MInstr> = Vec::with_capacity(block.instrs.len());
        // Most recent `str reg, frame-slot` still known to hold.
        let mut last_store: Option<(MOperand, MReg, MemWidth)> = None;

        for instr in block.instrs.drain(..) {
            if is_identity_move(&instr) {
                continue;
            }

            if instr.op == MOpcode::Ldr {
                if let (Some((slot, src, width)), Some(dst)) =
                    (last_store.clone(), instr.operands[0].as_reg())
                {
                    if instr.operands.get(1) == Some(&slot)
                        && instr.width == width
                        && src.class() == dst.class()
                    {
                        if dst != src {
                            out.push(moves::copy_instr(dst, src));
                        }
                        continue;
                    }
                }
            }

            match instr.op {
                MOpcode::Str if matches!(instr.operands.get(1), Some(MOperand::Frame(_))) => {
                    if let Some(src) = instr.operands[0].as_reg() {
                        last_store = Some((instr.operands[1].clone(), src, instr.width));
                    }
                }
                MOpcode::Str | MOpcode::Bl | MOpcode::Blr => last_store = None,
                _ => {
                    if let (Some(def), Some((_, src, _))) = (instr.def_reg(), &last_store) {
                        if def == *src {
                            last_store = None;
                        }
                    }
                }
            }

            out.push(instr);
        }
        block.instrs = out;
    }
}

fn is_identity_move(instr: &MInstr) -> bool {
    matches!(instr.op, MOpcode::MovRR | MOpcode::FMovRR)
        && instr.operands.len() == 2
        && instr.operands[0] == instr.operands[1]
        && matches!(instr.operands[0], MOperand::Reg(_))
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_core::mir::{MBlock, MFunction, PhysReg};

    fn x(n: u8) -> MOperand {
        MOperand::phys(PhysReg::X(n))
    }

    #[test]
    fn removes_identity_moves() {
        let mut mf = MFunction::new("f");
        let mut bb = MBlock::new("entry");
        bb.push(MInstr::new(MOpcode::MovRR, vec![x(0), x(0)]));
        bb.push(MInstr::new(MOpcode::MovRR, vec![x(0), x(1)]));
        bb.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(bb);
        run(&mut mf);
        let ops: Vec<MOpcode> = mf.blocks[0].instrs.iter().map(|i| i.op).collect();
        assert_eq!(ops, vec![MOpcode::MovRR, MOpcode::Ret]);
    }

    #[test]
    fn forwards_store_to_load() {
        let mut mf = MFunction::new("f");
        let mut bb = MBlock::new("entry");
        let slot = MOperand::Frame(0);
        bb.push(MInstr::new(MOpcode::Str, vec![x(1), slot.clone()]));
        bb.push(MInstr::new(MOpcode::Ldr, vec![x(2), slot.clone()]));
        bb.push(MInstr::new(MOpcode::Ldr, vec![x(3), slot]));
        bb.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(bb);
        run(&mut mf);
        let instrs = &mf.blocks[0].instrs;
        assert_eq!(instrs[0].op, MOpcode::Str);
        assert_eq!(instrs[1].operands, vec![x(2), x(1)]);
        assert_eq!(instrs[2].operands, vec![x(3), x(1)]);
        assert!(!instrs.iter().any(|i| i.op == MOpcode::Ldr));
    }

    #[test]
    fn call_drops_the_forwarding_window() {
        let mut mf = MFunction::new("f");
        let mut bb = MBlock::new("entry");
        let slot = MOperand::Frame(0);
        bb.push(MInstr::new(MOpcode::Str, vec![x(19), slot.clone()]));
        bb.push(MInstr::new(
            MOpcode::Bl,
            vec![MOperand::Sym {
                name: "g".into(),
                addend: 0,
            }],
        ));
        bb.push(MInstr::new(MOpcode::Ldr, vec![x(2), slot]));
        bb.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(bb);
        run(&mut mf);
        assert!(mf.blocks[0].instrs.iter().any(|i| i.op == MOpcode::Ldr));
    }

    #[test]
    fn redefining_the_stored_register_stops_forwarding() {
        let mut mf = MFunction::new("f");
        let mut bb = MBlock::new("entry");
        let slot = MOperand::Frame(0);
        bb.push(MInstr::new(MOpcode::Str, vec![x(1), slot.clone()]));
        bb.push(MInstr::new(MOpcode::MovRI, vec![x(1), MOperand::Imm(9)]));
        bb.push(MInstr::new(MOpcode::Ldr, vec![x(2), slot]));
        bb.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(bb);
        run(&mut mf);
        assert!(mf.blocks[0].instrs.iter().any(|i| i.op == MOpcode::Ldr));
    }
}
