//! Textual MIR dumps.
//!
//! Virtual registers print as `%vN`, physical registers as `@xN`/`@dN`, so a
//! dump taken before allocation is visibly different from one taken after.

use std::fmt::Write;

use super::{MFunction, MInstr, MOperand};

/// Render one function in dump form.
pub fn dump_function(mf: &MFunction) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "func @{}:", mf.name);
    for block in &mf.blocks {
        let _ = writeln!(out, "{}:", block.label);
        for instr in &block.instrs {
            let _ = writeln!(out, "  {}", render_instr(instr));
        }
    }
    out
}

fn render_instr(instr: &MInstr) -> String {
    let mut line = instr.op.mnemonic().to_string();
    for (i, op) in instr.operands.iter().enumerate() {
        line.push_str(if i == 0 { " " } else { ", " });
        line.push_str(&render_operand(op));
    }
    line
}

fn render_operand(op: &MOperand) -> String {
    match op {
        MOperand::Reg(r) => r.to_string(),
        MOperand::Imm(v) => format!("#{v}"),
        MOperand::FImm(v) => format!("#{v}"),
        MOperand::Sym { name, addend } if *addend == 0 => name.clone(),
        MOperand::Sym { name, addend } => format!("{name}+{addend}"),
        MOperand::Frame(id) => format!("frame.{id}"),
        MOperand::Mem {
            base,
            offset,
            index: None,
            ..
        } => format!("[{base}, #{offset}]"),
        MOperand::Mem {
            base,
            offset: _,
            index: Some(ix),
            scale,
        } => format!("[{base}, {ix}, lsl #{scale}]"),
        MOperand::Cond(c) => c.to_string(),
        MOperand::Label(l) => l.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mir::{MBlock, MOpcode, MReg, PhysReg, RegClass};

    #[test]
    fn virtual_and_physical_registers_render_distinctly() {
        let mut mf = MFunction::new("f");
        let mut bb = MBlock::new("entry");
        bb.push(MInstr::new(
            MOpcode::MovRR,
            vec![
                MOperand::vreg(RegClass::Gpr, 1),
                MOperand::phys(PhysReg::X(0)),
            ],
        ));
        bb.push(MInstr::new(
            MOpcode::AddRRR,
            vec![
                MOperand::vreg(RegClass::Gpr, 2),
                MOperand::vreg(RegClass::Gpr, 1),
                MOperand::reg(MReg::Virt(RegClass::Gpr, 1)),
            ],
        ));
        mf.blocks.push(bb);
        let text = dump_function(&mf);
        assert!(text.contains("func @f:"));
        assert!(text.contains("mov %v1, @x0"));
        assert!(text.contains("add %v2, %v1, %v1"));
    }
}
