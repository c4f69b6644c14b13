//! Linear-scan register allocation.
//!
//! Live intervals are derived from the liveness analysis over the reverse
//! postorder linearization. Allocation walks intervals in start order with
//! an active list; when no register is free the interval with the farthest
//! end is spilled (Belady approximation). Spilled intervals live in frame
//! slots: every use reloads through a reserved scratch register and every
//! def stores back.
//!
//! Pools follow the ABI split: integer `x9..x15` (caller-saved, preferred)
//! then `x19..x28`; float `d8..d15` (callee-saved, preferred) then
//! `d16..d29`. `x16`/`x17` and `d30`/`d31` are reserved as spill scratch and
//! never allocated. Intervals that cross a call site only take callee-saved
//! registers. Choices are fully deterministic: lowest-numbered free register
//! wins, ties between intervals break on virtual register id.

use std::collections::BTreeMap;

use viper_core::mir::{
    MFunction, MInstr, MOpcode, MOperand, MReg, PhysReg, RegClass, Role,
};

use crate::liveness::{self, instr_uses_defs};
use crate::{CodegenError, Result};

const GPR_CALLER: [u8; 7] = [9, 10, 11, 12, 13, 14, 15];
const GPR_CALLEE: [u8; 10] = [19, 20, 21, 22, 23, 24, 25, 26, 27, 28];
const FPR_CALLEE: [u8; 8] = [8, 9, 10, 11, 12, 13, 14, 15];
const FPR_CALLER: [u8; 14] = [16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27, 28, 29];

const GPR_SCRATCH: [PhysReg; 2] = [PhysReg::X(16), PhysReg::X(17)];
const FPR_SCRATCH: [PhysReg; 2] = [PhysReg::D(30), PhysReg::D(31)];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct VregKey(RegClass, u32);

#[derive(Debug, Clone)]
struct Interval {
    start: usize,
    end: usize,
    crosses_call: bool,
}

/// Assign physical registers to every virtual operand of `mf`, inserting
/// spill and reload code where needed, and record the callee-saved set.
pub fn allocate(mf: &mut MFunction) -> Result<()> {
    let live = liveness::analyze(mf);

    // Build raw intervals over the linear order.
    let mut intervals: BTreeMap<VregKey, Interval> = BTreeMap::new();
    let mut pos = 0usize;
    for &b in &live.order {
        for instr in &mf.blocks[b].instrs {
            let (uses, defs) = instr_uses_defs(instr);
            for r in uses.iter().chain(defs.iter()) {
                let MReg::Virt(cls, id) = *r else { continue };
                let itv = intervals.entry(VregKey(cls, id)).or_insert(Interval {
                    start: pos,
                    end: pos,
                    crosses_call: false,
                });
                itv.start = itv.start.min(pos);
                itv.end = itv.end.max(pos);
            }
            pos += 1;
        }
        for r in &live.live_out[b] {
            let MReg::Virt(cls, id) = *r else { continue };
            if let Some(itv) = intervals.get_mut(&VregKey(cls, id)) {
                itv.end = itv.end.max(live.block_end[b].saturating_sub(1));
            }
        }
    }

    // Move coalescing: a copy whose source dies at the copy and whose
    // destination is born there shares one interval, so the move later
    // collapses to an identity and disappears in the peephole pass.
    let mut repr: BTreeMap<VregKey, VregKey> = BTreeMap::new();
    let resolve = |map: &BTreeMap<VregKey, VregKey>, mut k: VregKey| {
        while let Some(&next) = map.get(&k) {
            k = next;
        }
        k
    };
    let mut pos = 0usize;
    for &b in &live.order {
        for instr in &mf.blocks[b].instrs {
            if matches!(instr.op, MOpcode::MovRR | MOpcode::FMovRR) {
                if let (Some(MReg::Virt(dc, dv)), Some(MReg::Virt(sc, sv))) =
                    (instr.operands[0].as_reg(), instr.operands[1].as_reg())
                {
                    if dc == sc {
                        let dk = resolve(&repr, VregKey(dc, dv));
                        let sk = resolve(&repr, VregKey(sc, sv));
                        if dk != sk {
                            let (Some(di), Some(si)) = (intervals.get(&dk), intervals.get(&sk))
                            else {
                                pos += 1;
                                continue;
                            };
                            if si.end <= pos && di.start >= pos {
                                let merged = Interval {
                                    start: si.start.min(di.start),
                                    end: si.end.max(di.end),
                                    crosses_call: false,
                                };
                                intervals.remove(&dk);
                                intervals.insert(sk, merged);
                                repr.insert(dk, sk);
                            }
                        }
                    }
                }
            }
            pos += 1;
        }
    }

    // A call clobbers caller-saved registers; intervals spanning one must
    // land in callee-saved registers.
    for itv in intervals.values_mut() {
        itv.crosses_call = live
            .call_positions
            .iter()
            .any(|&c| itv.start < c && c < itv.end);
    }

    // Copies between virtual registers and argument registers hint the
    // interval at that register: `mov v, x0` at entry and `mov x0, v` at a
    // marshalling or return site collapse into nothing when the hint is
    // honored. A hint only holds if the register has no conflicting def or
    // use anywhere inside the interval.
    let canonical_key = |mut k: VregKey| {
        while let Some(&next) = repr.get(&k) {
            k = next;
        }
        k
    };
    let mut hints: BTreeMap<VregKey, Vec<(PhysReg, usize)>> = BTreeMap::new();
    let mut phys_events: BTreeMap<PhysReg, Vec<usize>> = BTreeMap::new();
    let mut pos = 0usize;
    for &b in &live.order {
        for instr in &mf.blocks[b].instrs {
            if matches!(instr.op, MOpcode::MovRR | MOpcode::FMovRR) && instr.operands.len() == 2 {
                let dst = instr.operands[0].as_reg();
                let src = instr.operands[1].as_reg();
                match (dst, src) {
                    (Some(MReg::Virt(cls, id)), Some(MReg::Phys(p))) if is_arg_reg(p) => {
                        hints
                            .entry(canonical_key(VregKey(cls, id)))
                            .or_default()
                            .push((p, pos));
                    }
                    (Some(MReg::Phys(p)), Some(MReg::Virt(cls, id))) if is_arg_reg(p) => {
                        hints
                            .entry(canonical_key(VregKey(cls, id)))
                            .or_default()
                            .push((p, pos));
                    }
                    _ => {}
                }
            }
            instr.visit_regs(|r, _| {
                if let MReg::Phys(p) = r {
                    phys_events.entry(*p).or_default().push(pos);
                }
            });
            if instr.op.is_call() {
                for n in 0..=18u8 {
                    phys_events.entry(PhysReg::X(n)).or_default().push(pos);
                }
                for n in (0..=7u8).chain(16..=31u8) {
                    phys_events.entry(PhysReg::D(n)).or_default().push(pos);
                }
            }
            pos += 1;
        }
    }

    // Linear scan.
    let mut order: Vec<(VregKey, Interval)> =
        intervals.iter().map(|(k, v)| (*k, v.clone())).collect();
    order.sort_by_key(|(k, itv)| (itv.start, k.1));

    let mut free = FreePools::new();
    let mut active: Vec<(usize, VregKey, PhysReg)> = Vec::new(); // (end, vreg, reg)
    let mut assignment: BTreeMap<VregKey, PhysReg> = BTreeMap::new();
    let mut spilled: BTreeMap<VregKey, u32> = BTreeMap::new();

    for (key, itv) in order {
        active.retain(|&(end, _, reg)| {
            if end <= itv.start {
                free.release(reg);
                false
            } else {
                true
            }
        });

        if let Some(candidates) = hints.get(&key) {
            let own: Vec<usize> = candidates.iter().map(|&(_, p)| p).collect();
            let taken = candidates.iter().find(|&&(reg, _)| {
                reg.class() == key.0
                    && !active.iter().any(|&(_, _, r)| r == reg)
                    && phys_events
                        .get(&reg)
                        .map(|events| {
                            events
                                .iter()
                                .all(|&t| t < itv.start || t > itv.end || own.contains(&t))
                        })
                        .unwrap_or(true)
            });
            if let Some(&(reg, _)) = taken {
                assignment.insert(key, reg);
                active.push((itv.end, key, reg));
                active.sort_by_key(|&(end, k, _)| (end, k.1));
                continue;
            }
        }

        let choice = free.take(key.0, itv.crosses_call);
        match choice {
            Some(reg) => {
                assignment.insert(key, reg);
                active.push((itv.end, key, reg));
                active.sort_by_key(|&(end, k, _)| (end, k.1));
            }
            None => {
                // Evict the active interval with the farthest end, provided
                // it reaches past the current one and its register is legal
                // for the current interval.
                // Only pool registers may change hands; a hinted argument
                // register is valid solely for the interval it was checked
                // against.
                let victim = active.iter().rposition(|&(end, vk, reg)| {
                    vk.0 == key.0
                        && end > itv.end
                        && is_pool_reg(reg)
                        && (!itv.crosses_call || reg.is_callee_saved())
                });
                match victim {
                    Some(idx) => {
                        let (_, vk, reg) = active.remove(idx);
                        assignment.remove(&vk);
                        let slot = mf.frame.ensure_spill(vk.0, vk.1);
                        spilled.insert(vk, slot);
                        assignment.insert(key, reg);
                        active.push((itv.end, key, reg));
                        active.sort_by_key(|&(end, k, _)| (end, k.1));
                        tracing::debug!(victim = vk.1, slot, "evicted farthest interval");
                    }
                    None => {
                        let slot = mf.frame.ensure_spill(key.0, key.1);
                        spilled.insert(key, slot);
                        tracing::debug!(vreg = key.1, slot, "spilled current interval");
                    }
                }
            }
        }
    }

    // Record callee-saved usage for the frame planner.
    let mut saved_gprs: Vec<PhysReg> = assignment
        .values()
        .filter(|r| r.is_callee_saved() && r.class() == RegClass::Gpr)
        .copied()
        .collect();
    saved_gprs.sort();
    saved_gprs.dedup();
    let mut saved_fprs: Vec<PhysReg> = assignment
        .values()
        .filter(|r| r.is_callee_saved() && r.class() == RegClass::Fpr)
        .copied()
        .collect();
    saved_fprs.sort();
    saved_fprs.dedup();
    mf.saved_gprs = saved_gprs;
    mf.saved_fprs = saved_fprs;

    rewrite(mf, &repr, &assignment, &spilled)
}

struct FreePools {
    gpr: Vec<u8>,
    fpr: Vec<u8>,
}

impl FreePools {
    fn new() -> Self {
        let mut gpr: Vec<u8> = GPR_CALLER.to_vec();
        gpr.extend_from_slice(&GPR_CALLEE);
        let mut fpr: Vec<u8> = FPR_CALLEE.to_vec();
        fpr.extend_from_slice(&FPR_CALLER);
        Self { gpr, fpr }
    }

    fn take(&mut self, cls: RegClass, callee_only: bool) -> Option<PhysReg> {
        match cls {
            RegClass::Gpr => {
                let idx = self
                    .gpr
                    .iter()
                    .position(|&n| !callee_only || GPR_CALLEE.contains(&n))?;
                Some(PhysReg::X(self.gpr.remove(idx)))
            }
            RegClass::Fpr => {
                let idx = self
                    .fpr
                    .iter()
                    .position(|&n| !callee_only || FPR_CALLEE.contains(&n))?;
                Some(PhysReg::D(self.fpr.remove(idx)))
            }
        }
    }

    fn release(&mut self, reg: PhysReg) {
        // Hinted argument registers are not pool members and stay out.
        match reg {
            PhysReg::X(n) if GPR_CALLER.contains(&n) || GPR_CALLEE.contains(&n) => {
                self.gpr.push(n);
                self.gpr.sort_by_key(|&n| pool_rank_gpr(n));
            }
            PhysReg::D(n) if FPR_CALLER.contains(&n) || FPR_CALLEE.contains(&n) => {
                self.fpr.push(n);
                self.fpr.sort_by_key(|&n| pool_rank_fpr(n));
            }
            _ => {}
        }
    }
}

/// Argument/return registers are the only coalescing-hint candidates.
fn is_arg_reg(p: PhysReg) -> bool {
    matches!(p, PhysReg::X(0..=7) | PhysReg::D(0..=7))
}

fn is_pool_reg(p: PhysReg) -> bool {
    match p {
        PhysReg::X(n) => GPR_CALLER.contains(&n) || GPR_CALLEE.contains(&n),
        PhysReg::D(n) => FPR_CALLER.contains(&n) || FPR_CALLEE.contains(&n),
        PhysReg::Sp => false,
    }
}

/// Pool preference order: caller-saved GPRs first, callee-saved FPRs first.
fn pool_rank_gpr(n: u8) -> (u8, u8) {
    ((n >= 19) as u8, n)
}

fn pool_rank_fpr(n: u8) -> (u8, u8) {
    ((n >= 16) as u8, n)
}

/// Rewrite every virtual operand, inserting reloads before and stores after
/// instructions that touch spilled registers.
fn rewrite(
    mf: &mut MFunction,
    repr: &BTreeMap<VregKey, VregKey>,
    assignment: &BTreeMap<VregKey, PhysReg>,
    spilled: &BTreeMap<VregKey, u32>,
) -> Result<()> {
    let canonical = |mut k: VregKey| {
        while let Some(&next) = repr.get(&k) {
            k = next;
        }
        k
    };

    for block in &mut mf.blocks {
        let mut rewritten: Vec<MInstr> = Vec::with_capacity(block.instrs.len());
        for instr in block.instrs.drain(..) {
            let mut instr = instr;
            let (uses, defs) = instr_uses_defs(&instr);

            // Scratch assignment for spilled registers in this instruction.
            let mut scratch_map: BTreeMap<VregKey, PhysReg> = BTreeMap::new();
            let mut gpr_scratch = GPR_SCRATCH.iter();
            let mut fpr_scratch = FPR_SCRATCH.iter();
            let mut reloads: Vec<MInstr> = Vec::new();
            let mut stores: Vec<MInstr> = Vec::new();

            for r in uses.iter().chain(defs.iter()) {
                let MReg::Virt(cls, id) = *r else { continue };
                let key = canonical(VregKey(cls, id));
                let Some(&slot) = spilled.get(&key) else { continue };
                if scratch_map.contains_key(&key) {
                    continue;
                }
                let scratch = match cls {
                    RegClass::Gpr => gpr_scratch.next(),
                    RegClass::Fpr => fpr_scratch.next(),
                }
                .ok_or_else(|| {
                    CodegenError::OutOfRegisters(format!(
                        "more spilled operands than scratch registers in {}",
                        instr.op.mnemonic()
                    ))
                })?;
                scratch_map.insert(key, *scratch);
                if uses.contains(r) {
                    reloads.push(MInstr::new(
                        MOpcode::Ldr,
                        vec![MOperand::phys(*scratch), MOperand::Frame(slot)],
                    ));
                }
                if defs.contains(r) {
                    stores.push(MInstr::new(
                        MOpcode::Str,
                        vec![MOperand::phys(*scratch), MOperand::Frame(slot)],
                    ));
                }
            }

            instr.visit_regs_mut(|r, _role: Role| {
                if let MReg::Virt(cls, id) = *r {
                    let key = canonical(VregKey(cls, id));
                    if let Some(&scratch) = scratch_map.get(&key) {
                        *r = MReg::Phys(scratch);
                    } else if let Some(&reg) = assignment.get(&key) {
                        *r = MReg::Phys(reg);
                    }
                }
            });

            rewritten.extend(reloads);
            rewritten.push(instr);
            rewritten.extend(stores);
        }
        block.instrs = rewritten;
    }

    // Every virtual register must be gone now.
    for block in &mf.blocks {
        for instr in &block.instrs {
            let mut leftover = None;
            instr.visit_regs(|r, _| {
                if matches!(r, MReg::Virt(..)) && leftover.is_none() {
                    leftover = Some(*r);
                }
            });
            if let Some(r) = leftover {
                return Err(CodegenError::InternalInvariant(format!(
                    "virtual register {r} survived allocation"
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_core::mir::MBlock;

    fn v(id: u32) -> MOperand {
        MOperand::vreg(RegClass::Gpr, id)
    }

    #[test]
    fn simple_function_allocates_without_spills() {
        let mut mf = MFunction::new("f");
        let mut bb = MBlock::new("entry");
        bb.push(MInstr::new(
            MOpcode::MovRR,
            vec![v(1), MOperand::phys(PhysReg::X(0))],
        ));
        bb.push(MInstr::new(
            MOpcode::MovRR,
            vec![v(2), MOperand::phys(PhysReg::X(1))],
        ));
        bb.push(MInstr::new(MOpcode::AddRRR, vec![v(3), v(1), v(2)]));
        bb.push(MInstr::new(
            MOpcode::MovRR,
            vec![MOperand::phys(PhysReg::X(0)), v(3)],
        ));
        bb.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(bb);

        allocate(&mut mf).unwrap();
        for instr in &mf.blocks[0].instrs {
            instr.visit_regs(|r, _| assert!(matches!(r, MReg::Phys(_))));
        }
        // Nothing crossed a call, so no callee-saved registers were taken.
        assert!(mf.saved_gprs.is_empty());
        assert!(mf.frame.slots.is_empty());
    }

    #[test]
    fn interval_crossing_call_takes_callee_saved() {
        let mut mf = MFunction::new("f");
        let mut bb = MBlock::new("entry");
        bb.push(MInstr::new(
            MOpcode::MovRR,
            vec![v(1), MOperand::phys(PhysReg::X(0))],
        ));
        bb.push(MInstr::new(
            MOpcode::Bl,
            vec![MOperand::Sym {
                name: "g".into(),
                addend: 0,
            }],
        ));
        bb.push(MInstr::new(
            MOpcode::MovRR,
            vec![MOperand::phys(PhysReg::X(0)), v(1)],
        ));
        bb.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(bb);

        allocate(&mut mf).unwrap();
        assert_eq!(mf.saved_gprs, vec![PhysReg::X(19)]);
        let first = &mf.blocks[0].instrs[0];
        assert_eq!(first.operands[0], MOperand::phys(PhysReg::X(19)));
    }

    #[test]
    fn pressure_forces_deterministic_spill() {
        // Define more simultaneously-live values than the pool holds.
        let mut mf = MFunction::new("f");
        let mut bb = MBlock::new("entry");
        let n = (GPR_CALLER.len() + GPR_CALLEE.len() + 2) as u32;
        for i in 1..=n {
            bb.push(MInstr::new(MOpcode::MovRI, vec![v(i), MOperand::Imm(i as i64)]));
        }
        // Use them all afterwards so every interval stretches to the end.
        for i in 1..=n {
            bb.push(MInstr::new(MOpcode::CmpRI, vec![v(i), MOperand::Imm(0)]));
        }
        bb.push(MInstr::new(MOpcode::Ret, vec![]));
        mf.blocks.push(bb);

        allocate(&mut mf).unwrap();
        assert!(!mf.frame.slots.is_empty());
        // Re-running on a fresh copy produces identical output.
        let mut mf2 = MFunction::new("f");
        let mut bb2 = MBlock::new("entry");
        for i in 1..=n {
            bb2.push(MInstr::new(MOpcode::MovRI, vec![v(i), MOperand::Imm(i as i64)]));
        }
        for i in 1..=n {
            bb2.push(MInstr::new(MOpcode::CmpRI, vec![v(i), MOperand::Imm(0)]));
        }
        bb2.push(MInstr::new(MOpcode::Ret, vec![]));
        mf2.blocks.push(bb2);
        allocate(&mut mf2).unwrap();
        assert_eq!(mf.blocks, mf2.blocks);
    }
}
