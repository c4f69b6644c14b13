//! Instruction selection: IL functions to MIR with virtual registers.
//!
//! Lowering runs one function at a time, block by block. Every IL temporary
//! and block parameter gets a virtual register; physical registers appear
//! only where the ABI pins them (arguments, returns, the indirect-call
//! target). Block parameters are eliminated by emitting a parallel move on
//! every incoming edge into the target block's pre-reserved registers:
//! register copies only, no stack round-trips.

pub mod moves;

use std::collections::HashMap;

use viper_core::il::{self, Opcode, Type, Value};
use viper_core::mir::{
    Cond, MBlock, MFunction, MInstr, MOpcode, MOperand, MReg, MemWidth, PhysReg, RegClass,
};

use self::moves::{Move, MoveEmitter, MoveSrc};
use crate::{CodegenError, Result};

/// Largest immediate the AArch64 `add`/`sub`/`cmp` immediate forms encode
/// without a shift.
const MAX_ARITH_IMM: i64 = 4095;

/// A lowered module: functions plus the rodata the emitter must synthesize.
#[derive(Debug)]
pub struct LoweredModule {
    pub functions: Vec<MFunction>,
    /// Interned string literals, `(label, contents)`, in first-use order.
    pub strings: Vec<(String, String)>,
    pub globals: Vec<il::Global>,
}

/// Interns string literals into `L.str.N` rodata labels.
#[derive(Default)]
struct StringPool {
    by_content: HashMap<String, String>,
    entries: Vec<(String, String)>,
}

impl StringPool {
    fn intern(&mut self, content: &str) -> String {
        if let Some(label) = self.by_content.get(content) {
            return label.clone();
        }
        let label = format!("L.str.{}", self.entries.len());
        self.by_content.insert(content.to_string(), label.clone());
        self.entries.push((label.clone(), content.to_string()));
        label
    }
}

/// Lower every function in the module.
pub fn lower_module(module: &il::Module) -> Result<LoweredModule> {
    let mut strings = StringPool::default();
    let mut functions = Vec::new();
    for func in &module.functions {
        tracing::debug!(function = %func.name, blocks = func.blocks.len(), "selecting");
        functions.push(FunctionLowering::new(module, func, &mut strings).run()?);
    }
    Ok(LoweredModule {
        functions,
        strings: strings.entries,
        globals: module.globals.clone(),
    })
}

struct FunctionLowering<'a> {
    module: &'a il::Module,
    func: &'a il::Function,
    strings: &'a mut StringPool,
    mf: MFunction,
    next_vreg: u32,
    /// IL temporary name to its virtual register.
    temps: HashMap<String, MReg>,
    /// Alloca results addressed directly through their frame slot.
    frame_slots: HashMap<String, u32>,
    /// Non-entry block label to its parameter registers.
    block_params: HashMap<String, Vec<MReg>>,
    /// Compare results foldable into this block's terminator.
    folded_cmps: HashMap<String, (Value, Value, Cond, bool)>,
    /// Instructions of the block being lowered.
    cur: Vec<MInstr>,
    /// Synthetic blocks for conditional edges that carry arguments.
    edge_blocks: Vec<MBlock>,
}

impl<'a> FunctionLowering<'a> {
    fn new(module: &'a il::Module, func: &'a il::Function, strings: &'a mut StringPool) -> Self {
        Self {
            module,
            func,
            strings,
            mf: MFunction::new(&func.name),
            next_vreg: 1,
            temps: HashMap::new(),
            frame_slots: HashMap::new(),
            block_params: HashMap::new(),
            folded_cmps: HashMap::new(),
            cur: Vec::new(),
            edge_blocks: Vec::new(),
        }
    }

    fn run(mut self) -> Result<MFunction> {
        // Reserve registers for every non-entry block parameter up front so
        // all incoming edges agree on the destination of their moves.
        for block in self.func.blocks.iter().skip(1) {
            let regs: Vec<MReg> = block
                .params
                .iter()
                .map(|p| {
                    let r = self.fresh(class_of(p.ty));
                    self.temps.insert(p.name.clone(), r);
                    r
                })
                .collect();
            self.block_params.insert(block.label.clone(), regs);
        }

        // Likewise reserve a register for every instruction result, so uses
        // in blocks that appear textually before the defining block still
        // resolve.
        for block in &self.func.blocks {
            for instr in &block.instrs {
                if let Some(result) = &instr.result {
                    let reg = MReg::Virt(class_of(instr.ty), self.next_vreg);
                    self.next_vreg += 1;
                    self.temps.insert(result.clone(), reg);
                }
            }
        }

        for (index, block) in self.func.blocks.iter().enumerate() {
            self.cur = Vec::new();
            self.folded_cmps.clear();
            if index == 0 {
                self.bind_entry_params()?;
            }
            for instr in &block.instrs {
                self.lower_instr(block, instr)?;
            }
            let label = block.label.clone();
            let instrs = std::mem::take(&mut self.cur);
            self.mf.blocks.push(MBlock { label, instrs });
        }

        let edges = std::mem::take(&mut self.edge_blocks);
        self.mf.blocks.extend(edges);
        Ok(self.mf)
    }

    fn fresh(&mut self, cls: RegClass) -> MReg {
        let id = self.next_vreg;
        self.next_vreg += 1;
        MReg::Virt(cls, id)
    }

    fn emit(&mut self, instr: MInstr) {
        self.cur.push(instr);
    }

    /// Bind entry-block parameters: the first eight of each class arrive in
    /// `x0..x7`/`d0..d7`, the rest in the caller's 16-byte-aligned overflow
    /// area above the frame pointer.
    fn bind_entry_params(&mut self) -> Result<()> {
        let entry = self.func.entry();
        let params = if entry.params.is_empty() {
            &self.func.params
        } else {
            &entry.params
        };
        let mut int_idx = 0u8;
        let mut float_idx = 0u8;
        let mut stack_idx = 0i32;
        for param in params {
            let reg = self.fresh(class_of(param.ty));
            self.temps.insert(param.name.clone(), reg);
            match class_of(param.ty) {
                RegClass::Gpr if int_idx < 8 => {
                    self.emit(moves::copy_instr(reg, MReg::Phys(PhysReg::X(int_idx))));
                    int_idx += 1;
                }
                RegClass::Fpr if float_idx < 8 => {
                    self.emit(moves::copy_instr(reg, MReg::Phys(PhysReg::D(float_idx))));
                    float_idx += 1;
                }
                _ => {
                    let offset = 16 + 8 * stack_idx;
                    stack_idx += 1;
                    self.emit(MInstr::new(
                        MOpcode::Ldr,
                        vec![
                            MOperand::reg(reg),
                            MOperand::Mem {
                                base: MReg::Phys(PhysReg::FP),
                                offset,
                                index: None,
                                scale: 0,
                            },
                        ],
                    ));
                }
            }
        }
        Ok(())
    }

    fn lower_instr(&mut self, block: &il::Block, instr: &il::Instr) -> Result<()> {
        use Opcode::*;
        match instr.op {
            Add | Sub | IAddOvf | ISubOvf | Shl | LShr | AShr => self.lower_int_binop(instr),
            Mul | IMulOvf | And | Or | Xor => self.lower_int_rr_binop(instr),
            FAdd | FSub | FMul | FDiv => self.lower_float_binop(instr),
            op if op.is_compare() || op.is_float_compare() => self.lower_compare(block, instr),
            Sitofp => self.lower_unary(instr, MOpcode::Scvtf, RegClass::Fpr),
            Fptosi => self.lower_unary(instr, MOpcode::Fcvtzs, RegClass::Gpr),
            Zext1 => {
                let src = self.materialize(&instr.operands[0])?;
                let dst = self.def_vreg(instr)?;
                self.emit(moves::copy_instr(dst, src));
                Ok(())
            }
            Alloca => self.lower_alloca(instr),
            Load => self.lower_load(instr),
            Store => self.lower_store(instr),
            Gep => self.lower_gep(instr),
            ConstStr => self.lower_const_str(instr),
            Call => self.lower_call(instr, false),
            CallIndirect => self.lower_call(instr, true),
            Ret => self.lower_ret(instr),
            Br => self.lower_br(instr),
            Cbr => self.lower_cbr(instr),
            other => Err(CodegenError::UnsupportedOpcode(other.to_string())),
        }
    }

    /// Integer ops with a register-immediate form for small right operands.
    fn lower_int_binop(&mut self, instr: &il::Instr) -> Result<()> {
        use Opcode::*;
        let lhs = self.materialize(&instr.operands[0])?;
        let (ri_op, rr_op, imm_limit) = match instr.op {
            Add | IAddOvf => (MOpcode::AddRRI, MOpcode::AddRRR, MAX_ARITH_IMM),
            Sub | ISubOvf => (MOpcode::SubRRI, MOpcode::SubRRR, MAX_ARITH_IMM),
            Shl => (MOpcode::LslRI, MOpcode::LslRR, 63),
            LShr => (MOpcode::LsrRI, MOpcode::LsrRR, 63),
            AShr => (MOpcode::AsrRI, MOpcode::AsrRR, 63),
            _ => unreachable!(),
        };
        let dst = self.def_vreg(instr)?;
        match instr.operands[1].as_const_int() {
            Some(v) if (0..=imm_limit).contains(&v) => {
                self.emit(MInstr::new(
                    ri_op,
                    vec![MOperand::reg(dst), MOperand::reg(lhs), MOperand::Imm(v)],
                ));
            }
            _ => {
                let rhs = self.materialize(&instr.operands[1])?;
                self.emit(MInstr::new(
                    rr_op,
                    vec![MOperand::reg(dst), MOperand::reg(lhs), MOperand::reg(rhs)],
                ));
            }
        }
        Ok(())
    }

    /// Integer ops that only exist in register-register form.
    fn lower_int_rr_binop(&mut self, instr: &il::Instr) -> Result<()> {
        use Opcode::*;
        let op = match instr.op {
            Mul | IMulOvf => MOpcode::MulRRR,
            And => MOpcode::AndRRR,
            Or => MOpcode::OrrRRR,
            Xor => MOpcode::EorRRR,
            _ => unreachable!(),
        };
        let lhs = self.materialize(&instr.operands[0])?;
        let rhs = self.materialize(&instr.operands[1])?;
        let dst = self.def_vreg(instr)?;
        self.emit(MInstr::new(
            op,
            vec![MOperand::reg(dst), MOperand::reg(lhs), MOperand::reg(rhs)],
        ));
        Ok(())
    }

    fn lower_float_binop(&mut self, instr: &il::Instr) -> Result<()> {
        use Opcode::*;
        let op = match instr.op {
            FAdd => MOpcode::FAddRRR,
            FSub => MOpcode::FSubRRR,
            FMul => MOpcode::FMulRRR,
            FDiv => MOpcode::FDivRRR,
            _ => unreachable!(),
        };
        let lhs = self.materialize(&instr.operands[0])?;
        let rhs = self.materialize(&instr.operands[1])?;
        let dst = self.def_vreg(instr)?;
        self.emit(MInstr::new(
            op,
            vec![MOperand::reg(dst), MOperand::reg(lhs), MOperand::reg(rhs)],
        ));
        Ok(())
    }

    fn lower_unary(&mut self, instr: &il::Instr, op: MOpcode, _cls: RegClass) -> Result<()> {
        let src = self.materialize(&instr.operands[0])?;
        let dst = self.def_vreg(instr)?;
        self.emit(MInstr::new(op, vec![MOperand::reg(dst), MOperand::reg(src)]));
        Ok(())
    }

    /// Compares materialize an `i1` via `cmp` + `cset`, unless the sole use
    /// is this block's `cbr`, in which case the compare folds into the
    /// branch and no `cset` is emitted.
    fn lower_compare(&mut self, block: &il::Block, instr: &il::Instr) -> Result<()> {
        let cond = cond_for(instr.op);
        let is_float = instr.op.is_float_compare();
        let result = instr.result.clone().ok_or_else(|| {
            CodegenError::InternalInvariant("compare without result".to_string())
        })?;

        // `fcmp_ne` needs a two-cset sequence (ordered-false for NaN), so it
        // never folds.
        if instr.op != Opcode::FCmpNe && self.foldable_into_cbr(block, &result) {
            self.folded_cmps.insert(
                result,
                (
                    instr.operands[0].clone(),
                    instr.operands[1].clone(),
                    cond,
                    is_float,
                ),
            );
            return Ok(());
        }

        self.emit_cmp(&instr.operands[0], &instr.operands[1], is_float)?;
        let dst = self.def_vreg(instr)?;
        if instr.op == Opcode::FCmpNe {
            // Ordered not-equal: less-than or greater-than.
            let lt = self.fresh(RegClass::Gpr);
            self.emit(MInstr::new(
                MOpcode::Cset,
                vec![MOperand::reg(lt), MOperand::Cond(Cond::Mi)],
            ));
            self.emit(MInstr::new(
                MOpcode::Cset,
                vec![MOperand::reg(dst), MOperand::Cond(Cond::Gt)],
            ));
            self.emit(MInstr::new(
                MOpcode::OrrRRR,
                vec![MOperand::reg(dst), MOperand::reg(dst), MOperand::reg(lt)],
            ));
        } else {
            self.emit(MInstr::new(
                MOpcode::Cset,
                vec![MOperand::reg(dst), MOperand::Cond(cond)],
            ));
        }
        Ok(())
    }

    /// A compare folds iff its result's only use in the function is the
    /// condition of this block's terminating `cbr`.
    fn foldable_into_cbr(&self, block: &il::Block, result: &str) -> bool {
        let term = match block.terminator() {
            Some(t) if t.op == Opcode::Cbr => t,
            _ => return false,
        };
        if term.operands[0].as_temp() != Some(result) {
            return false;
        }
        let mut uses = 0usize;
        for b in &self.func.blocks {
            for i in &b.instrs {
                for v in i.operands.iter().chain(i.br_args.iter().flatten()) {
                    if v.as_temp() == Some(result) {
                        uses += 1;
                    }
                }
            }
        }
        uses == 1
    }

    fn emit_cmp(&mut self, lhs: &Value, rhs: &Value, is_float: bool) -> Result<()> {
        let lhs_reg = self.materialize(lhs)?;
        if is_float {
            let rhs_reg = self.materialize(rhs)?;
            self.emit(MInstr::new(
                MOpcode::Fcmp,
                vec![MOperand::reg(lhs_reg), MOperand::reg(rhs_reg)],
            ));
            return Ok(());
        }
        match rhs.as_const_int() {
            Some(v) if (0..=MAX_ARITH_IMM).contains(&v) => {
                self.emit(MInstr::new(
                    MOpcode::CmpRI,
                    vec![MOperand::reg(lhs_reg), MOperand::Imm(v)],
                ));
            }
            _ => {
                let rhs_reg = self.materialize(rhs)?;
                self.emit(MInstr::new(
                    MOpcode::CmpRR,
                    vec![MOperand::reg(lhs_reg), MOperand::reg(rhs_reg)],
                ));
            }
        }
        Ok(())
    }

    fn lower_alloca(&mut self, instr: &il::Instr) -> Result<()> {
        let size = instr.operands[0].as_const_int().ok_or_else(|| {
            CodegenError::UnsupportedType {
                what: "alloca with non-constant size".to_string(),
                ty: Type::I64,
            }
        })?;
        if size < 0 {
            return Err(CodegenError::OperandTooLarge(size));
        }
        let rounded = ((size as u32) + 15) & !15;
        let slot = self.mf.frame.add_local(rounded.max(16), 16);
        let dst = self.def_vreg(instr)?;
        if let Some(name) = &instr.result {
            self.frame_slots.insert(name.clone(), slot);
        }
        // Address of the slot; the frame planner turns this into
        // `sub dst, x29, #offset` once the layout is final.
        self.emit(MInstr::new(
            MOpcode::AddRRI,
            vec![
                MOperand::reg(dst),
                MOperand::phys(PhysReg::FP),
                MOperand::Frame(slot),
            ],
        ));
        Ok(())
    }

    fn lower_load(&mut self, instr: &il::Instr) -> Result<()> {
        let width = if instr.ty == Type::I1 {
            MemWidth::W
        } else {
            MemWidth::X
        };
        let dst = self.def_vreg(instr)?;
        let addr = self.address_operand(&instr.operands[0])?;
        self.emit(MInstr::new(MOpcode::Ldr, vec![MOperand::reg(dst), addr]).with_width(width));
        Ok(())
    }

    fn lower_store(&mut self, instr: &il::Instr) -> Result<()> {
        let width = if instr.ty == Type::I1 {
            MemWidth::W
        } else {
            MemWidth::X
        };
        let value = self.materialize(&instr.operands[1])?;
        let addr = self.address_operand(&instr.operands[0])?;
        self.emit(MInstr::new(MOpcode::Str, vec![MOperand::reg(value), addr]).with_width(width));
        Ok(())
    }

    /// Address of a pointer value: allocas address their frame slot
    /// directly, everything else goes through a base register.
    fn address_operand(&mut self, ptr: &Value) -> Result<MOperand> {
        if let Some(name) = ptr.as_temp() {
            if let Some(&slot) = self.frame_slots.get(name) {
                return Ok(MOperand::Frame(slot));
            }
        }
        let base = self.materialize(ptr)?;
        Ok(MOperand::Mem {
            base,
            offset: 0,
            index: None,
            scale: 0,
        })
    }

    fn lower_gep(&mut self, instr: &il::Instr) -> Result<()> {
        let base = self.materialize(&instr.operands[0])?;
        let dst = self.def_vreg(instr)?;
        match instr.operands[1].as_const_int() {
            Some(v) if (0..=MAX_ARITH_IMM).contains(&v) => {
                self.emit(MInstr::new(
                    MOpcode::AddRRI,
                    vec![MOperand::reg(dst), MOperand::reg(base), MOperand::Imm(v)],
                ));
            }
            _ => {
                let idx = self.materialize(&instr.operands[1])?;
                self.emit(MInstr::new(
                    MOpcode::AddRRR,
                    vec![MOperand::reg(dst), MOperand::reg(base), MOperand::reg(idx)],
                ));
            }
        }
        Ok(())
    }

    fn lower_const_str(&mut self, instr: &il::Instr) -> Result<()> {
        let label = match &instr.operands[0] {
            Value::ConstStrLiteral(s) => self.strings.intern(s),
            Value::Global(name) => name.clone(),
            other => {
                return Err(CodegenError::InternalInvariant(format!(
                    "const_str with operand {other}"
                )))
            }
        };
        let dst = self.def_vreg(instr)?;
        self.emit(MInstr::new(
            MOpcode::AdrpAdd,
            vec![MOperand::reg(dst), MOperand::Sym { name: label, addend: 0 }],
        ));
        Ok(())
    }

    fn lower_call(&mut self, instr: &il::Instr, indirect: bool) -> Result<()> {
        let args = if indirect {
            &instr.operands[1..]
        } else {
            &instr.operands[..]
        };

        let mut arg_moves = Vec::new();
        let mut stack_args: Vec<&Value> = Vec::new();
        let mut int_idx = 0u8;
        let mut float_idx = 0u8;
        for arg in args {
            match self.value_class(arg) {
                RegClass::Gpr if int_idx < 8 => {
                    arg_moves.push(Move {
                        dst: MReg::Phys(PhysReg::X(int_idx)),
                        src: self.move_src(arg)?,
                    });
                    int_idx += 1;
                }
                RegClass::Fpr if float_idx < 8 => {
                    arg_moves.push(Move {
                        dst: MReg::Phys(PhysReg::D(float_idx)),
                        src: self.move_src(arg)?,
                    });
                    float_idx += 1;
                }
                _ => stack_args.push(arg),
            }
        }

        // Overflow arguments: a 16-byte-aligned area pushed right-to-left,
        // so argument k of the overflow area lands at `[sp, #8k]`.
        let stack_bytes = ((stack_args.len() as i64 * 8) + 15) & !15;
        if stack_bytes > 0 {
            self.emit(MInstr::new(MOpcode::SubSpImm, vec![MOperand::Imm(stack_bytes)]));
            for (k, arg) in stack_args.iter().enumerate() {
                let reg = self.materialize(arg)?;
                self.emit(MInstr::new(
                    MOpcode::Str,
                    vec![
                        MOperand::reg(reg),
                        MOperand::Mem {
                            base: MReg::Phys(PhysReg::Sp),
                            offset: (8 * k) as i32,
                            index: None,
                            scale: 0,
                        },
                    ],
                ));
            }
        }

        // The indirect target is evaluated before the argument moves clobber
        // the argument registers; x16 is reserved and survives them.
        if indirect {
            let target = self.materialize(&instr.operands[0])?;
            self.emit(moves::copy_instr(MReg::Phys(PhysReg::INDIRECT_TARGET), target));
        }

        moves::resolve(arg_moves, self);

        if indirect {
            self.emit(MInstr::new(
                MOpcode::Blr,
                vec![MOperand::phys(PhysReg::INDIRECT_TARGET)],
            ));
        } else {
            let callee = instr.callee.clone().ok_or_else(|| {
                CodegenError::InternalInvariant("call without callee".to_string())
            })?;
            self.emit(MInstr::new(
                MOpcode::Bl,
                vec![MOperand::Sym { name: callee, addend: 0 }],
            ));
        }
        self.mf.has_calls = true;

        if stack_bytes > 0 {
            self.emit(MInstr::new(MOpcode::AddSpImm, vec![MOperand::Imm(stack_bytes)]));
        }

        if instr.result.is_some() && instr.ty != Type::Void {
            let dst = self.def_vreg(instr)?;
            let src = match class_of(instr.ty) {
                RegClass::Gpr => MReg::Phys(PhysReg::X(0)),
                RegClass::Fpr => MReg::Phys(PhysReg::D(0)),
            };
            self.emit(moves::copy_instr(dst, src));
        }
        Ok(())
    }

    fn lower_ret(&mut self, instr: &il::Instr) -> Result<()> {
        if let Some(value) = instr.operands.first() {
            let dst = match self.value_class(value) {
                RegClass::Gpr => MReg::Phys(PhysReg::X(0)),
                RegClass::Fpr => MReg::Phys(PhysReg::D(0)),
            };
            match self.move_src(value)? {
                MoveSrc::Reg(src) => self.emit(moves::copy_instr(dst, src)),
                MoveSrc::ImmInt(v) => self.load_imm_int(dst, v),
                MoveSrc::ImmFloat(v) => self.load_imm_float(dst, v),
                MoveSrc::Sym(name) => self.load_sym(dst, &name),
            }
        }
        self.emit(MInstr::new(MOpcode::Ret, vec![]));
        Ok(())
    }

    fn lower_br(&mut self, instr: &il::Instr) -> Result<()> {
        let target = &instr.labels[0];
        let edge = self.edge_moves(target, instr.br_args.first())?;
        moves::resolve(edge, self);
        self.emit(MInstr::new(
            MOpcode::B,
            vec![MOperand::Label(target.clone())],
        ));
        Ok(())
    }

    fn lower_cbr(&mut self, instr: &il::Instr) -> Result<()> {
        let cond = self.branch_condition(&instr.operands[0])?;
        let true_label = instr.labels[0].clone();
        let false_label = instr.labels[1].clone();
        let true_args = instr.br_args.first().cloned().unwrap_or_default();
        let false_args = instr.br_args.get(1).cloned().unwrap_or_default();

        // An argument-carrying taken edge gets its own block so the moves
        // only run when the edge is taken.
        let branch_target = if true_args.is_empty() {
            true_label.clone()
        } else {
            let split = format!("{}.{}", self.mf.blocks.len(), true_label);
            let edge = self.edge_moves(&true_label, Some(&true_args))?;
            let mut saved = std::mem::take(&mut self.cur);
            moves::resolve(edge, self);
            self.cur.push(MInstr::new(
                MOpcode::B,
                vec![MOperand::Label(true_label.clone())],
            ));
            let body = std::mem::replace(&mut self.cur, Vec::new());
            self.edge_blocks.push(MBlock {
                label: split.clone(),
                instrs: body,
            });
            std::mem::swap(&mut self.cur, &mut saved);
            split
        };

        self.emit(MInstr::new(
            MOpcode::BCond,
            vec![MOperand::Cond(cond), MOperand::Label(branch_target)],
        ));

        // Fall-through edge: moves run inline after the conditional branch.
        if !false_args.is_empty() {
            let edge = self.edge_moves(&false_label, Some(&false_args))?;
            moves::resolve(edge, self);
        }
        self.emit(MInstr::new(
            MOpcode::B,
            vec![MOperand::Label(false_label)],
        ));
        Ok(())
    }

    /// Emit the compare for a `cbr` condition and return the branch
    /// condition code. Folded compares re-materialize here; everything else
    /// tests the boolean against zero.
    fn branch_condition(&mut self, cond: &Value) -> Result<Cond> {
        if let Some(name) = cond.as_temp() {
            if let Some((lhs, rhs, cc, is_float)) = self.folded_cmps.remove(name) {
                self.emit_cmp(&lhs, &rhs, is_float)?;
                return Ok(cc);
            }
        }
        let reg = self.materialize(cond)?;
        self.emit(MInstr::new(
            MOpcode::CmpRI,
            vec![MOperand::reg(reg), MOperand::Imm(0)],
        ));
        Ok(Cond::Ne)
    }

    /// Parallel move set for one branch edge.
    fn edge_moves(&mut self, target: &str, args: Option<&Vec<Value>>) -> Result<Vec<Move>> {
        let Some(args) = args else {
            return Ok(Vec::new());
        };
        let params = match self.block_params.get(target) {
            Some(p) => p.clone(),
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::with_capacity(args.len());
        for (arg, dst) in args.iter().zip(params) {
            out.push(Move {
                dst,
                src: self.move_src(arg)?,
            });
        }
        Ok(out)
    }

    /// Destination register for an instruction result: the pre-reserved one
    /// for named results, a fresh one for unnamed values.
    fn def_vreg(&mut self, instr: &il::Instr) -> Result<MReg> {
        match &instr.result {
            Some(name) => self.temps.get(name).copied().ok_or_else(|| {
                CodegenError::InternalInvariant(format!("no register reserved for %{name}"))
            }),
            None => Ok(self.fresh(class_of(instr.ty))),
        }
    }

    fn value_class(&self, value: &Value) -> RegClass {
        match value {
            Value::Temp(name) => self
                .temps
                .get(name)
                .map(|r| r.class())
                .unwrap_or(RegClass::Gpr),
            Value::ConstFloat(_) => RegClass::Fpr,
            _ => RegClass::Gpr,
        }
    }

    fn move_src(&mut self, value: &Value) -> Result<MoveSrc> {
        Ok(match value {
            Value::Temp(name) => {
                let reg = *self.temps.get(name).ok_or_else(|| {
                    CodegenError::InternalInvariant(format!("use of unlowered temp %{name}"))
                })?;
                MoveSrc::Reg(reg)
            }
            Value::ConstInt(v) => MoveSrc::ImmInt(*v),
            Value::ConstFloat(v) => MoveSrc::ImmFloat(*v),
            Value::Global(name) => MoveSrc::Sym(name.clone()),
            Value::ConstStrLiteral(s) => MoveSrc::Sym(self.strings.intern(s)),
        })
    }

    /// Materialize any value into a register.
    fn materialize(&mut self, value: &Value) -> Result<MReg> {
        match self.move_src(value)? {
            MoveSrc::Reg(r) => Ok(r),
            MoveSrc::ImmInt(v) => {
                let dst = self.fresh(RegClass::Gpr);
                self.load_imm_int(dst, v);
                Ok(dst)
            }
            MoveSrc::ImmFloat(v) => {
                let dst = self.fresh(RegClass::Fpr);
                self.load_imm_float(dst, v);
                Ok(dst)
            }
            MoveSrc::Sym(name) => {
                let dst = self.fresh(RegClass::Gpr);
                self.load_sym(dst, &name);
                Ok(dst)
            }
        }
    }

    /// Integer constant materialization: a single `mov` when the value fits
    /// a 16-bit immediate, otherwise `movz` + up to three `movk`.
    fn emit_int_const(&mut self, dst: MReg, value: i64) {
        if (0..=0xFFFF).contains(&value) {
            self.emit(MInstr::new(
                MOpcode::MovRI,
                vec![MOperand::reg(dst), MOperand::Imm(value)],
            ));
            return;
        }
        let bits = value as u64;
        let chunks = [
            bits & 0xFFFF,
            (bits >> 16) & 0xFFFF,
            (bits >> 32) & 0xFFFF,
            (bits >> 48) & 0xFFFF,
        ];
        self.emit(MInstr::new(
            MOpcode::MovZ,
            vec![
                MOperand::reg(dst),
                MOperand::Imm(chunks[0] as i64),
                MOperand::Imm(0),
            ],
        ));
        for (i, &chunk) in chunks.iter().enumerate().skip(1) {
            if chunk != 0 {
                self.emit(MInstr::new(
                    MOpcode::MovK,
                    vec![
                        MOperand::reg(dst),
                        MOperand::Imm(chunk as i64),
                        MOperand::Imm((16 * i) as i64),
                    ],
                ));
            }
        }
    }
}

impl MoveEmitter for FunctionLowering<'_> {
    fn copy_reg(&mut self, dst: MReg, src: MReg) {
        let instr = moves::copy_instr(dst, src);
        self.emit(instr);
    }

    fn load_imm_int(&mut self, dst: MReg, value: i64) {
        match dst.class() {
            RegClass::Gpr => self.emit_int_const(dst, value),
            RegClass::Fpr => {
                // Integer literal flowing into a float slot: materialize and
                // convert.
                let tmp = self.fresh(RegClass::Gpr);
                self.emit_int_const(tmp, value);
                self.emit(MInstr::new(
                    MOpcode::Scvtf,
                    vec![MOperand::reg(dst), MOperand::reg(tmp)],
                ));
            }
        }
    }

    fn load_imm_float(&mut self, dst: MReg, value: f64) {
        if dst.class() == RegClass::Gpr {
            // Float literal flowing into an integer slot: truncate.
            self.emit_int_const(dst, value as i64);
            return;
        }
        // Move the raw bit pattern through a GPR; `fmov dN, xM` is exact.
        let tmp = self.fresh(RegClass::Gpr);
        self.emit_int_const(tmp, value.to_bits() as i64);
        self.emit(MInstr::new(
            MOpcode::FMovRR,
            vec![MOperand::reg(dst), MOperand::reg(tmp)],
        ));
    }

    fn load_sym(&mut self, dst: MReg, name: &str) {
        self.emit(MInstr::new(
            MOpcode::AdrpAdd,
            vec![
                MOperand::reg(dst),
                MOperand::Sym {
                    name: name.to_string(),
                    addend: 0,
                },
            ],
        ));
    }

    fn scratch(&mut self, cls: RegClass) -> MReg {
        self.fresh(cls)
    }
}

fn class_of(ty: Type) -> RegClass {
    match ty {
        Type::F64 => RegClass::Fpr,
        _ => RegClass::Gpr,
    }
}

fn cond_for(op: Opcode) -> Cond {
    use Opcode::*;
    match op {
        ICmpEq | FCmpEq => Cond::Eq,
        ICmpNe | FCmpNe => Cond::Ne,
        SCmpLt => Cond::Lt,
        SCmpLe => Cond::Le,
        SCmpGt | FCmpGt => Cond::Gt,
        SCmpGe | FCmpGe => Cond::Ge,
        UCmpLt => Cond::Lo,
        UCmpLe => Cond::Ls,
        UCmpGt => Cond::Hi,
        UCmpGe => Cond::Hs,
        FCmpLt => Cond::Mi,
        FCmpLe => Cond::Ls,
        _ => unreachable!("not a compare opcode"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_core::il::parse::parse_module;

    fn lower_one(src: &str) -> MFunction {
        let module = parse_module(src).unwrap();
        lower_module(&module).unwrap().functions.remove(0)
    }

    #[test]
    fn add_function_selects_add_rrr() {
        let mf = lower_one(
            "il 0.1\n\
             func @add2(%a:i64, %b:i64) -> i64 {\n\
             entry(%a:i64, %b:i64):\n\
               %t0 = add %a, %b\n\
               ret %t0\n\
             }\n",
        );
        let ops: Vec<MOpcode> = mf.blocks[0].instrs.iter().map(|i| i.op).collect();
        assert!(ops.contains(&MOpcode::AddRRR));
        assert_eq!(*ops.last().unwrap(), MOpcode::Ret);
    }

    #[test]
    fn small_constant_folds_into_immediate_form() {
        let mf = lower_one(
            "il 0.1\n\
             func @inc(%a:i64) -> i64 {\n\
             entry(%a:i64):\n\
               %t0 = add %a, 5\n\
               ret %t0\n\
             }\n",
        );
        assert!(mf.blocks[0]
            .instrs
            .iter()
            .any(|i| i.op == MOpcode::AddRRI && i.operands[2] == MOperand::Imm(5)));
    }

    #[test]
    fn wide_constant_uses_movz_movk_chain() {
        let mf = lower_one(
            "il 0.1\n\
             func @big() -> i64 {\n\
             entry:\n\
               ret 81985529216486895\n\
             }\n",
        );
        let instrs = &mf.blocks[0].instrs;
        let movz = instrs.iter().filter(|i| i.op == MOpcode::MovZ).count();
        let movk = instrs.iter().filter(|i| i.op == MOpcode::MovK).count();
        assert_eq!((movz, movk), (1, 3));
    }

    #[test]
    fn compare_folds_into_branch() {
        let mf = lower_one(
            "il 0.1\n\
             func @f(%x:i64) -> i64 {\n\
             entry(%x:i64):\n\
               %cond = scmp_gt %x, 0\n\
               cbr %cond, then, else\n\
             then:\n\
               br join(1)\n\
             else:\n\
               br join(2)\n\
             join(%v:i64):\n\
               ret %v\n\
             }\n",
        );
        let entry = &mf.blocks[0].instrs;
        let cmps = entry.iter().filter(|i| i.op == MOpcode::CmpRI).count();
        let csets = entry.iter().filter(|i| i.op == MOpcode::Cset).count();
        assert_eq!((cmps, csets), (1, 0));
        assert!(entry
            .iter()
            .any(|i| i.op == MOpcode::BCond && i.operands[0] == MOperand::Cond(Cond::Gt)));
        // Block-parameter passing stays in registers.
        for block in &mf.blocks {
            for i in &block.instrs {
                assert!(!matches!(i.op, MOpcode::Str | MOpcode::Ldr));
            }
        }
    }

    #[test]
    fn call_marshals_swapped_arguments() {
        let mf = lower_one(
            "il 0.1\n\
             extern @h(i64, i64) -> i64\n\
             func @f(%a:i64, %b:i64) -> i64 {\n\
             entry(%a:i64, %b:i64):\n\
               %t0 = call @h(%b, %a)\n\
               ret %t0\n\
             }\n",
        );
        let entry = &mf.blocks[0].instrs;
        assert!(entry
            .iter()
            .any(|i| i.op == MOpcode::Bl
                && i.operands[0] == MOperand::Sym { name: "h".into(), addend: 0 }));
        assert!(mf.has_calls);
    }

    #[test]
    fn alloca_load_store_use_frame_slots() {
        let mf = lower_one(
            "il 0.1\n\
             func @g() -> i64 {\n\
             entry:\n\
               %p = alloca 8\n\
               store i64, %p, 42\n\
               %v = load i64, %p\n\
               ret %v\n\
             }\n",
        );
        assert_eq!(mf.frame.slots.len(), 1);
        let entry = &mf.blocks[0].instrs;
        assert!(entry
            .iter()
            .any(|i| i.op == MOpcode::Str && matches!(i.operands[1], MOperand::Frame(0))));
        assert!(entry
            .iter()
            .any(|i| i.op == MOpcode::Ldr && matches!(i.operands[1], MOperand::Frame(0))));
    }
}
