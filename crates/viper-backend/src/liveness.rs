//! Backward liveness over MIR.
//!
//! Produces, per block, the set of virtual registers live at block exit, and
//! a global linear numbering of instructions in reverse postorder that the
//! allocator uses to build live intervals and next-use distances.

use std::collections::{HashMap, HashSet};

use viper_core::mir::{MFunction, MInstr, MOpcode, MOperand, MReg, Role};

#[derive(Debug)]
pub struct Liveness {
    /// Block order used for linearization (reverse postorder).
    pub order: Vec<usize>,
    /// Linear position of the first instruction of each block (by block index).
    pub block_start: Vec<usize>,
    /// One past the linear position of the last instruction of each block.
    pub block_end: Vec<usize>,
    /// Virtual registers live at the exit of each block (by block index).
    pub live_out: Vec<HashSet<MReg>>,
    /// Linear positions of `bl`/`blr` instructions.
    pub call_positions: Vec<usize>,
}

/// Uses and defs of one instruction, virtual registers only. `movk` both
/// reads and writes its destination.
pub fn instr_uses_defs(instr: &MInstr) -> (Vec<MReg>, Vec<MReg>) {
    let mut uses = Vec::new();
    let mut defs = Vec::new();
    instr.visit_regs(|r, role| {
        if matches!(r, MReg::Virt(..)) {
            match role {
                Role::Use => uses.push(*r),
                Role::Def => defs.push(*r),
            }
        }
    });
    if instr.op == MOpcode::MovK {
        if let Some(r @ MReg::Virt(..)) = instr.operands[0].as_reg() {
            uses.push(r);
        }
    }
    (uses, defs)
}

pub fn analyze(mf: &MFunction) -> Liveness {
    let label_index: HashMap<&str, usize> = mf
        .blocks
        .iter()
        .enumerate()
        .map(|(i, b)| (b.label.as_str(), i))
        .collect();

    let successors: Vec<Vec<usize>> = mf
        .blocks
        .iter()
        .map(|b| {
            let mut succ = Vec::new();
            for instr in &b.instrs {
                if matches!(instr.op, MOpcode::B | MOpcode::BCond) {
                    if let Some(MOperand::Label(l)) = instr.operands.last() {
                        if let Some(&idx) = label_index.get(l.as_str()) {
                            if !succ.contains(&idx) {
                                succ.push(idx);
                            }
                        }
                    }
                }
            }
            succ
        })
        .collect();

    // Reverse postorder from the entry block; unreachable blocks append in
    // source order so every instruction still gets a position.
    let mut order = Vec::with_capacity(mf.blocks.len());
    let mut visited = vec![false; mf.blocks.len()];
    let mut post = Vec::new();
    if !mf.blocks.is_empty() {
        dfs(0, &successors, &mut visited, &mut post);
    }
    post.reverse();
    order.extend(&post);
    for i in 0..mf.blocks.len() {
        if !visited[i] {
            order.push(i);
        }
    }

    let mut block_start = vec![0usize; mf.blocks.len()];
    let mut block_end = vec![0usize; mf.blocks.len()];
    let mut call_positions = Vec::new();
    let mut pos = 0usize;
    for &b in &order {
        block_start[b] = pos;
        for instr in &mf.blocks[b].instrs {
            if instr.op.is_call() {
                call_positions.push(pos);
            }
            pos += 1;
        }
        block_end[b] = pos;
    }

    // use[b] / def[b]: upward-exposed uses and definitions per block.
    let mut gen = vec![HashSet::new(); mf.blocks.len()];
    let mut kill = vec![HashSet::new(); mf.blocks.len()];
    for (bi, block) in mf.blocks.iter().enumerate() {
        for instr in &block.instrs {
            let (uses, defs) = instr_uses_defs(instr);
            for u in uses {
                if !kill[bi].contains(&u) {
                    gen[bi].insert(u);
                }
            }
            for d in defs {
                kill[bi].insert(d);
            }
        }
    }

    let mut live_in: Vec<HashSet<MReg>> = vec![HashSet::new(); mf.blocks.len()];
    let mut live_out: Vec<HashSet<MReg>> = vec![HashSet::new(); mf.blocks.len()];
    let mut changed = true;
    while changed {
        changed = false;
        for &b in order.iter().rev() {
            let mut out = HashSet::new();
            for &s in &successors[b] {
                out.extend(live_in[s].iter().copied());
            }
            let mut inn: HashSet<MReg> = gen[b].clone();
            inn.extend(out.difference(&kill[b]).copied());
            if out != live_out[b] || inn != live_in[b] {
                live_out[b] = out;
                live_in[b] = inn;
                changed = true;
            }
        }
    }

    Liveness {
        order,
        block_start,
        block_end,
        live_out,
        call_positions,
    }
}

fn dfs(b: usize, succ: &[Vec<usize>], visited: &mut [bool], post: &mut Vec<usize>) {
    visited[b] = true;
    for &s in &succ[b] {
        if !visited[s] {
            dfs(s, succ, visited, post);
        }
    }
    post.push(b);
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_core::mir::{MBlock, RegClass};

    fn v(id: u32) -> MReg {
        MReg::Virt(RegClass::Gpr, id)
    }

    #[test]
    fn value_used_across_branch_is_live_out() {
        let mut mf = MFunction::new("f");
        let mut entry = MBlock::new("entry");
        entry.push(MInstr::new(
            MOpcode::MovRI,
            vec![MOperand::reg(v(1)), MOperand::Imm(1)],
        ));
        entry.push(MInstr::new(MOpcode::B, vec![MOperand::Label("exit".into())]));
        let mut exit = MBlock::new("exit");
        exit.push(MInstr::new(
            MOpcode::AddRRI,
            vec![MOperand::reg(v(2)), MOperand::reg(v(1)), MOperand::Imm(2)],
        ));
        exit.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(entry);
        mf.blocks.push(exit);

        let live = analyze(&mf);
        assert!(live.live_out[0].contains(&v(1)));
        assert!(live.live_out[1].is_empty());
        assert_eq!(live.order, vec![0, 1]);
    }

    #[test]
    fn loop_keeps_induction_variable_live() {
        // entry -> head; head -> body | exit; body -> head
        let mut mf = MFunction::new("loop");
        let mut entry = MBlock::new("entry");
        entry.push(MInstr::new(
            MOpcode::MovRI,
            vec![MOperand::reg(v(1)), MOperand::Imm(0)],
        ));
        entry.push(MInstr::new(MOpcode::B, vec![MOperand::Label("head".into())]));
        let mut head = MBlock::new("head");
        head.push(MInstr::new(
            MOpcode::CmpRI,
            vec![MOperand::reg(v(1)), MOperand::Imm(10)],
        ));
        head.push(MInstr::new(
            MOpcode::BCond,
            vec![
                MOperand::Cond(viper_core::mir::Cond::Lt),
                MOperand::Label("body".into()),
            ],
        ));
        head.push(MInstr::new(MOpcode::B, vec![MOperand::Label("exit".into())]));
        let mut body = MBlock::new("body");
        body.push(MInstr::new(
            MOpcode::AddRRI,
            vec![MOperand::reg(v(1)), MOperand::reg(v(1)), MOperand::Imm(1)],
        ));
        body.push(MInstr::new(MOpcode::B, vec![MOperand::Label("head".into())]));
        let mut exit = MBlock::new("exit");
        exit.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(entry);
        mf.blocks.push(head);
        mf.blocks.push(body);
        mf.blocks.push(exit);

        let live = analyze(&mf);
        // v1 is live around the whole loop.
        assert!(live.live_out[0].contains(&v(1)));
        assert!(live.live_out[1].contains(&v(1)));
        assert!(live.live_out[2].contains(&v(1)));
    }
}
