//! Machine IR for the AArch64 backend.
//!
//! MIR sits between instruction selection and assembly emission. Register
//! operands start as virtual registers and are rewritten to physical
//! registers by the allocator; frame-slot operands are rewritten to concrete
//! `[x29, #offset]` addressing by the frame planner.

pub mod pretty;

use std::fmt;

/// Register class of a virtual or physical register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RegClass {
    Gpr,
    Fpr,
}

/// A physical AArch64 register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PhysReg {
    /// General-purpose `x0..x30`.
    X(u8),
    /// Floating-point/SIMD `d0..d31`.
    D(u8),
    /// Stack pointer.
    Sp,
}

impl PhysReg {
    pub const FP: PhysReg = PhysReg::X(29);
    pub const LR: PhysReg = PhysReg::X(30);
    /// Integer scratch for marshalling conflicts and large offsets.
    pub const SCRATCH_GPR: PhysReg = PhysReg::X(9);
    /// Float scratch kept out of the allocatable pool.
    pub const SCRATCH_FPR: PhysReg = PhysReg::D(31);
    /// Indirect-call target register.
    pub const INDIRECT_TARGET: PhysReg = PhysReg::X(16);

    pub fn class(self) -> RegClass {
        match self {
            PhysReg::X(_) | PhysReg::Sp => RegClass::Gpr,
            PhysReg::D(_) => RegClass::Fpr,
        }
    }

    /// Callee-saved under AAPCS64: `x19..x28`, `d8..d15`.
    pub fn is_callee_saved(self) -> bool {
        match self {
            PhysReg::X(n) => (19..=28).contains(&n),
            PhysReg::D(n) => (8..=15).contains(&n),
            PhysReg::Sp => false,
        }
    }
}

impl fmt::Display for PhysReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhysReg::X(n) => write!(f, "x{n}"),
            PhysReg::D(n) => write!(f, "d{n}"),
            PhysReg::Sp => f.write_str("sp"),
        }
    }
}

/// A register operand: virtual before allocation, physical after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MReg {
    Virt(RegClass, u32),
    Phys(PhysReg),
}

impl MReg {
    pub fn class(self) -> RegClass {
        match self {
            MReg::Virt(cls, _) => cls,
            MReg::Phys(p) => p.class(),
        }
    }

    pub fn as_phys(self) -> Option<PhysReg> {
        match self {
            MReg::Phys(p) => Some(p),
            MReg::Virt(..) => None,
        }
    }
}

impl fmt::Display for MReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MReg::Virt(_, id) => write!(f, "%v{id}"),
            MReg::Phys(p) => write!(f, "@{p}"),
        }
    }
}

/// AArch64 condition codes used by `cset` and `b.<cond>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Cond {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// Unsigned lower.
    Lo,
    /// Unsigned lower-or-same.
    Ls,
    /// Unsigned higher.
    Hi,
    /// Unsigned higher-or-same.
    Hs,
    /// Float ordered less-than.
    Mi,
    Pl,
}

/// Access width for loads and stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemWidth {
    /// 64-bit `x` (or `d` for FPR operands).
    X,
    /// 32-bit `w`, zero-extending on load. Used for `i1`.
    W,
}

/// A machine operand.
#[derive(Debug, Clone, PartialEq)]
pub enum MOperand {
    Reg(MReg),
    Imm(i64),
    FImm(f64),
    /// Symbol reference with addend (`adrp`/`add` pairs, call targets keep
    /// theirs in `Label`).
    Sym { name: String, addend: i64 },
    /// Frame-slot reference; rewritten by the frame planner.
    Frame(u32),
    /// Memory operand `[base, #offset]` or `[base, index, lsl #scale]`.
    Mem {
        base: MReg,
        offset: i32,
        index: Option<MReg>,
        scale: u8,
    },
    Cond(Cond),
    Label(String),
}

impl MOperand {
    pub fn reg(r: MReg) -> Self {
        MOperand::Reg(r)
    }

    pub fn vreg(cls: RegClass, id: u32) -> Self {
        MOperand::Reg(MReg::Virt(cls, id))
    }

    pub fn phys(p: PhysReg) -> Self {
        MOperand::Reg(MReg::Phys(p))
    }

    pub fn as_reg(&self) -> Option<MReg> {
        match self {
            MOperand::Reg(r) => Some(*r),
            _ => None,
        }
    }
}

/// Closed machine opcode set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MOpcode {
    MovRI,
    MovRR,
    MovZ,
    MovK,
    AddRRR,
    AddRRI,
    SubRRR,
    SubRRI,
    MulRRR,
    AndRRR,
    OrrRRR,
    EorRRR,
    LslRR,
    LslRI,
    LsrRR,
    LsrRI,
    AsrRR,
    AsrRI,
    CmpRR,
    CmpRI,
    Cset,
    BCond,
    B,
    Bl,
    Blr,
    Ret,
    /// Load: `[Reg dst, Mem|Frame src]`; width from [`MInstr::width`].
    Ldr,
    /// Store: `[Reg src, Mem|Frame dst]`.
    Str,
    /// Materialize a symbol address (`adrp` + `add` pair).
    AdrpAdd,
    FAddRRR,
    FSubRRR,
    FMulRRR,
    FDivRRR,
    Scvtf,
    Fcvtzs,
    Fcmp,
    FMovRR,
    /// `stp ra, rb, [sp, #-16]!`
    StpPre,
    /// `ldp ra, rb, [sp], #16`
    LdpPost,
    /// `str ra, [sp, #-16]!`
    StrPre,
    /// `ldr ra, [sp], #16`
    LdrPost,
    /// `sub sp, sp, #imm`
    SubSpImm,
    /// `add sp, sp, #imm`
    AddSpImm,
    Wfi,
}

impl MOpcode {
    /// Assembler mnemonic. Width/class refinements (e.g. `ldr` vs `ldrsw`)
    /// happen in the emitter.
    pub fn mnemonic(self) -> &'static str {
        use MOpcode::*;
        match self {
            MovRI | MovRR => "mov",
            MovZ => "movz",
            MovK => "movk",
            AddRRR | AddRRI | AddSpImm => "add",
            SubRRR | SubRRI | SubSpImm => "sub",
            MulRRR => "mul",
            AndRRR => "and",
            OrrRRR => "orr",
            EorRRR => "eor",
            LslRR | LslRI => "lsl",
            LsrRR | LsrRI => "lsr",
            AsrRR | AsrRI => "asr",
            CmpRR | CmpRI => "cmp",
            Cset => "cset",
            BCond => "b",
            B => "b",
            Bl => "bl",
            Blr => "blr",
            Ret => "ret",
            Ldr | LdrPost => "ldr",
            Str | StrPre => "str",
            AdrpAdd => "adrp",
            FAddRRR => "fadd",
            FSubRRR => "fsub",
            FMulRRR => "fmul",
            FDivRRR => "fdiv",
            Scvtf => "scvtf",
            Fcvtzs => "fcvtzs",
            Fcmp => "fcmp",
            FMovRR => "fmov",
            StpPre => "stp",
            LdpPost => "ldp",
            Wfi => "wfi",
        }
    }

    pub fn is_branch(self) -> bool {
        matches!(self, MOpcode::B | MOpcode::BCond | MOpcode::Ret)
    }

    pub fn is_call(self) -> bool {
        matches!(self, MOpcode::Bl | MOpcode::Blr)
    }
}

/// Role of a register operand within its instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Use,
    Def,
}

/// A single machine instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct MInstr {
    pub op: MOpcode,
    pub operands: Vec<MOperand>,
    pub width: MemWidth,
}

impl MInstr {
    pub fn new(op: MOpcode, operands: Vec<MOperand>) -> Self {
        Self {
            op,
            operands,
            width: MemWidth::X,
        }
    }

    pub fn with_width(mut self, width: MemWidth) -> Self {
        self.width = width;
        self
    }

    /// Visit every register operand with its role. Registers inside memory
    /// operands are always uses.
    pub fn visit_regs(&self, mut f: impl FnMut(&MReg, Role)) {
        for (idx, op) in self.operands.iter().enumerate() {
            match op {
                MOperand::Reg(r) => f(r, self.role_of(idx)),
                MOperand::Mem { base, index, .. } => {
                    f(base, Role::Use);
                    if let Some(ix) = index {
                        f(ix, Role::Use);
                    }
                }
                _ => {}
            }
        }
    }

    /// Mutable variant of [`visit_regs`](Self::visit_regs).
    pub fn visit_regs_mut(&mut self, mut f: impl FnMut(&mut MReg, Role)) {
        let roles: Vec<Role> = (0..self.operands.len()).map(|i| self.role_of(i)).collect();
        for (idx, op) in self.operands.iter_mut().enumerate() {
            match op {
                MOperand::Reg(r) => f(r, roles[idx]),
                MOperand::Mem { base, index, .. } => {
                    f(base, Role::Use);
                    if let Some(ix) = index {
                        f(ix, Role::Use);
                    }
                }
                _ => {}
            }
        }
    }

    /// Role of a direct register operand at position `idx`. At most one def
    /// per instruction, always at operand 0 where present.
    fn role_of(&self, idx: usize) -> Role {
        use MOpcode::*;
        let def0 = match self.op {
            MovRI | MovRR | MovZ | FMovRR | AddRRR | AddRRI | SubRRR | SubRRI | MulRRR | AndRRR
            | OrrRRR | EorRRR | LslRR | LslRI | LsrRR | LsrRI | AsrRR | AsrRI | Cset | Ldr
            | LdrPost | AdrpAdd | FAddRRR | FSubRRR | FMulRRR | FDivRRR | Scvtf | Fcvtzs => true,
            // movk reads and writes its destination.
            MovK => return if idx == 0 { Role::Def } else { Role::Use },
            CmpRR | CmpRI | Fcmp | Str | StrPre | StpPre | Bl | Blr | B | BCond | Ret | SubSpImm
            | AddSpImm | Wfi => false,
            LdpPost => return Role::Def,
        };
        if def0 && idx == 0 {
            Role::Def
        } else {
            Role::Use
        }
    }

    pub fn def_reg(&self) -> Option<MReg> {
        let mut def = None;
        self.visit_regs(|r, role| {
            if role == Role::Def && def.is_none() {
                def = Some(*r);
            }
        });
        def
    }
}

/// Kind of a frame slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// `alloca` local; the slot's address is taken.
    Local,
    /// Allocator spill slot for a virtual register.
    Spill(RegClass, u32),
}

/// One frame slot, sized and aligned. Concrete offsets are decided by the
/// frame planner once the callee-saved set is known.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSlot {
    pub kind: SlotKind,
    pub size: u32,
    pub align: u32,
}

/// Frame bookkeeping carried on the function during codegen.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameInfo {
    pub slots: Vec<FrameSlot>,
}

impl FrameInfo {
    pub fn add_local(&mut self, size: u32, align: u32) -> u32 {
        let id = self.slots.len() as u32;
        self.slots.push(FrameSlot {
            kind: SlotKind::Local,
            size,
            align,
        });
        id
    }

    /// Find or create the spill slot of a virtual register.
    pub fn ensure_spill(&mut self, cls: RegClass, vreg: u32) -> u32 {
        if let Some(pos) = self
            .slots
            .iter()
            .position(|s| s.kind == SlotKind::Spill(cls, vreg))
        {
            return pos as u32;
        }
        let id = self.slots.len() as u32;
        self.slots.push(FrameSlot {
            kind: SlotKind::Spill(cls, vreg),
            size: 8,
            align: 8,
        });
        id
    }
}

/// A machine basic block.
#[derive(Debug, Clone, PartialEq)]
pub struct MBlock {
    pub label: String,
    pub instrs: Vec<MInstr>,
}

impl MBlock {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            instrs: Vec::new(),
        }
    }

    pub fn push(&mut self, instr: MInstr) {
        self.instrs.push(instr);
    }
}

/// A machine function.
#[derive(Debug, Clone, PartialEq)]
pub struct MFunction {
    pub name: String,
    pub blocks: Vec<MBlock>,
    /// Callee-saved GPRs the allocator actually used, ascending.
    pub saved_gprs: Vec<PhysReg>,
    /// Callee-saved FPRs the allocator actually used, ascending.
    pub saved_fprs: Vec<PhysReg>,
    /// Bytes of locals + spills, 16-byte rounded; set by the frame planner.
    pub local_frame_size: u32,
    /// Whether the body contains `bl`/`blr` (forces the FP/LR save).
    pub has_calls: bool,
    pub frame: FrameInfo,
}

impl MFunction {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            blocks: Vec::new(),
            saved_gprs: Vec::new(),
            saved_fprs: Vec::new(),
            local_frame_size: 0,
            has_calls: false,
            frame: FrameInfo::default(),
        }
    }
}
