//! Textual AArch64 assembly emission.
//!
//! Serialization is a pure function of the lowered module and the target:
//! the golden-file tests depend on byte-identical output for identical
//! input. Lines end with `\n` and carry no trailing whitespace.

use viper_core::il::{Global, GlobalInit};
use viper_core::mir::{
    MBlock, MFunction, MInstr, MOpcode, MOperand, MReg, MemWidth, PhysReg,
};

use crate::lower::LoweredModule;
use crate::Target;

/// Map IL extern names in the `Viper.*` namespace onto their C runtime
/// symbols. Unknown names pass through unchanged.
fn map_runtime_symbol(name: &str) -> &str {
    match name {
        "Viper.Console.PrintI64" => "rt_print_i64",
        "Viper.Console.PrintF64" => "rt_print_f64",
        "Viper.Console.PrintStr" => "rt_print_str",
        "Viper.Console.ReadLine" => "rt_input_line",
        "Viper.Strings.Len" => "rt_len",
        "Viper.Strings.Concat" => "rt_concat",
        "Viper.Strings.FromInt" => "rt_int_to_str",
        "Viper.Strings.FromDouble" => "rt_f64_to_str",
        "Viper.Convert.ToInt" => "rt_to_int",
        "Viper.Convert.ToDouble" => "rt_to_double",
        "Viper.Math.Abs" => "rt_abs_f64",
        "Viper.Math.Sqrt" => "rt_sqrt",
        "Viper.Math.Sin" => "rt_sin",
        "Viper.Math.Cos" => "rt_cos",
        "Viper.Math.Tan" => "rt_tan",
        "Viper.Math.Floor" => "rt_floor",
        "Viper.Math.Ceil" => "rt_ceil",
        "Viper.Math.Pow" => "rt_pow_f64_chkdom",
        "Viper.Diagnostics.Trap" => "rt_trap",
        other => other,
    }
}

struct Emitter {
    target: Target,
    out: String,
    /// Function currently being emitted, for local-label mangling.
    current_fn: String,
}

impl Emitter {
    fn new(target: Target) -> Self {
        Self {
            target,
            out: String::new(),
            current_fn: String::new(),
        }
    }

    fn line(&mut self, text: impl AsRef<str>) {
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    /// Exported symbol, platform-mangled. Local labels (`L`/`.L` prefixed)
    /// are never mangled.
    fn mangle(&self, name: &str) -> String {
        if name.starts_with('L') || name.starts_with(".L") {
            return self.local_data_label(name);
        }
        match self.target {
            Target::MacOs => format!("_{name}"),
            Target::Linux => name.to_string(),
        }
    }

    fn mangle_call_target(&self, name: &str) -> String {
        self.mangle(map_runtime_symbol(name))
    }

    /// Block labels are function-local: `L<fn>_<block>` on Darwin,
    /// `.L<fn>_<block>` on ELF.
    fn local_label(&self, block: &str) -> String {
        let block = block.replace('.', "_");
        match self.target {
            Target::MacOs => format!("L{}_{}", self.current_fn, block),
            Target::Linux => format!(".L{}_{}", self.current_fn, block),
        }
    }

    /// Interned rodata labels already carry an `L` prefix; ELF wants `.L`.
    fn local_data_label(&self, label: &str) -> String {
        match self.target {
            Target::MacOs => label.to_string(),
            Target::Linux if label.starts_with(".L") => label.to_string(),
            Target::Linux => format!(".{label}"),
        }
    }

    fn emit_function(&mut self, mf: &MFunction) {
        self.current_fn = mf.name.clone();
        let sym = self.mangle(&mf.name);
        self.line(".text");
        self.line(".align 2");
        self.line(format!(".globl {sym}"));
        self.line(format!("{sym}:"));
        for (i, block) in mf.blocks.iter().enumerate() {
            self.emit_block(block, i == 0);
        }
    }

    fn emit_block(&mut self, block: &MBlock, is_entry: bool) {
        if !is_entry {
            let label = self.local_label(&block.label);
            self.line(format!("{label}:"));
        }
        for instr in &block.instrs {
            self.emit_instr(instr);
        }
    }

    fn emit_instr(&mut self, instr: &MInstr) {
        use MOpcode::*;
        match instr.op {
            AdrpAdd => {
                let dst = reg_operand(instr, 0, MemWidth::X);
                let MOperand::Sym { name, .. } = &instr.operands[1] else {
                    return;
                };
                let sym = self.mangle(name);
                match self.target {
                    Target::MacOs => {
                        self.line(format!("  adrp {dst}, {sym}@PAGE"));
                        self.line(format!("  add {dst}, {dst}, {sym}@PAGEOFF"));
                    }
                    Target::Linux => {
                        self.line(format!("  adrp {dst}, {sym}"));
                        self.line(format!("  add {dst}, {dst}, :lo12:{sym}"));
                    }
                }
            }
            MovZ | MovK => {
                let dst = reg_operand(instr, 0, MemWidth::X);
                let MOperand::Imm(chunk) = instr.operands[1] else {
                    return;
                };
                let MOperand::Imm(shift) = instr.operands[2] else {
                    return;
                };
                let mn = instr.op.mnemonic();
                if shift == 0 {
                    self.line(format!("  {mn} {dst}, #{:#X}", chunk));
                } else {
                    self.line(format!("  {mn} {dst}, #{:#X}, lsl #{shift}", chunk));
                }
            }
            Ldr | Str => {
                let value = reg_operand(instr, 0, instr.width);
                self.emit_mem_access(instr.op.mnemonic(), &value, &instr.operands[1]);
            }
            StpPre => {
                let a = reg_operand(instr, 0, MemWidth::X);
                let b = reg_operand(instr, 1, MemWidth::X);
                self.line(format!("  stp {a}, {b}, [sp, #-16]!"));
            }
            LdpPost => {
                let a = reg_operand(instr, 0, MemWidth::X);
                let b = reg_operand(instr, 1, MemWidth::X);
                self.line(format!("  ldp {a}, {b}, [sp], #16"));
            }
            StrPre => {
                let a = reg_operand(instr, 0, MemWidth::X);
                self.line(format!("  str {a}, [sp, #-16]!"));
            }
            LdrPost => {
                let a = reg_operand(instr, 0, MemWidth::X);
                self.line(format!("  ldr {a}, [sp], #16"));
            }
            SubSpImm | AddSpImm => {
                let MOperand::Imm(v) = instr.operands[0] else {
                    return;
                };
                self.line(format!("  {} sp, sp, #{v}", instr.op.mnemonic()));
            }
            BCond => {
                let MOperand::Cond(c) = &instr.operands[0] else {
                    return;
                };
                let MOperand::Label(l) = &instr.operands[1] else {
                    return;
                };
                let label = self.local_label(l);
                self.line(format!("  b.{c} {label}"));
            }
            B => {
                let MOperand::Label(l) = &instr.operands[0] else {
                    return;
                };
                let label = self.local_label(l);
                self.line(format!("  b {label}"));
            }
            Bl => {
                let MOperand::Sym { name, .. } = &instr.operands[0] else {
                    return;
                };
                let target = self.mangle_call_target(name);
                self.line(format!("  bl {target}"));
            }
            Wfi => self.line("  wfi"),
            Ret => self.line("  ret"),
            _ => {
                let mut text = format!("  {}", instr.op.mnemonic());
                for (i, op) in instr.operands.iter().enumerate() {
                    text.push_str(if i == 0 { " " } else { ", " });
                    text.push_str(&self.operand_text(op));
                }
                self.line(text);
            }
        }
    }

    /// `ldr`/`str` with frame-planned or pointer addressing. Offsets outside
    /// the signed unscaled range route through the reserved scratch
    /// registers.
    fn emit_mem_access(&mut self, mnemonic: &str, value: &str, addr: &MOperand) {
        let MOperand::Mem {
            base,
            offset,
            index,
            scale,
        } = addr
        else {
            return;
        };
        let base_name = reg_name(*base, MemWidth::X);
        if let Some(ix) = index {
            let ix = reg_name(*ix, MemWidth::X);
            if *scale == 0 {
                self.line(format!("  {mnemonic} {value}, [{base_name}, {ix}]"));
            } else {
                self.line(format!(
                    "  {mnemonic} {value}, [{base_name}, {ix}, lsl #{scale}]"
                ));
            }
            return;
        }
        if (-256..=255).contains(offset) {
            if *offset == 0 {
                self.line(format!("  {mnemonic} {value}, [{base_name}]"));
            } else {
                self.line(format!("  {mnemonic} {value}, [{base_name}, #{offset}]"));
            }
            return;
        }
        // Large offset: compute the address in a scratch register. Stores of
        // x17 fall back to x16 so the value is not clobbered.
        let scratch = if value == "x17" { "x16" } else { "x17" };
        self.line(format!("  mov {scratch}, #{offset}"));
        self.line(format!("  add {scratch}, {base_name}, {scratch}"));
        self.line(format!("  {mnemonic} {value}, [{scratch}]"));
    }

    fn operand_text(&self, op: &MOperand) -> String {
        match op {
            MOperand::Reg(r) => reg_name(*r, MemWidth::X),
            MOperand::Imm(v) => format!("#{v}"),
            MOperand::FImm(v) => format!("#{v}"),
            MOperand::Cond(c) => c.to_string(),
            MOperand::Label(l) => self.local_label(l),
            MOperand::Sym { name, .. } => self.mangle(name),
            MOperand::Frame(id) => format!("frame.{id}"),
            MOperand::Mem { .. } => String::from("?mem?"),
        }
    }

    fn emit_strings(&mut self, strings: &[(String, String)], globals: &[Global]) {
        let str_globals: Vec<&Global> = globals
            .iter()
            .filter(|g| matches!(g.init, GlobalInit::Str(_)))
            .collect();
        if !strings.is_empty() || !str_globals.is_empty() {
            match self.target {
                Target::MacOs => self.line(".section __TEXT,__cstring,cstring_literals"),
                Target::Linux => self.line(".section .rodata"),
            }
            for (label, content) in strings {
                let label = self.local_data_label(label);
                self.line(format!("{label}:"));
                self.line(format!("  .asciz \"{}\"", escape_asm(content)));
            }
            for g in str_globals {
                let GlobalInit::Str(content) = &g.init else {
                    continue;
                };
                let sym = self.mangle(&g.name);
                self.line(format!(".globl {sym}"));
                self.line(format!("{sym}:"));
                self.line(format!("  .asciz \"{}\"", escape_asm(content)));
            }
        }

        let int_globals: Vec<&Global> = globals
            .iter()
            .filter(|g| matches!(g.init, GlobalInit::Int(_)))
            .collect();
        if !int_globals.is_empty() {
            match self.target {
                Target::MacOs => self.line(".section __DATA,__data"),
                Target::Linux => self.line(".data"),
            }
            for g in int_globals {
                let GlobalInit::Int(v) = &g.init else { continue };
                let sym = self.mangle(&g.name);
                self.line(format!(".globl {sym}"));
                self.line(".align 3");
                self.line(format!("{sym}:"));
                self.line(format!("  .quad {v}"));
            }
        }
    }
}

/// Register operand at `idx`. After allocation and frame planning every
/// register slot holds a physical register, so a miss here is a codegen
/// bug, not an input error.
fn reg_operand(instr: &MInstr, idx: usize, width: MemWidth) -> String {
    match instr.operands.get(idx).and_then(|o| o.as_reg()) {
        Some(r) => reg_name(r, width),
        None => unreachable!("non-register operand in {}", instr.op.mnemonic()),
    }
}

/// Register name adjusted for access width: `w` forms for 32-bit integer
/// accesses, `d` forms for floats.
fn reg_name(reg: MReg, width: MemWidth) -> String {
    match (reg, width) {
        (MReg::Phys(PhysReg::X(n)), MemWidth::W) => format!("w{n}"),
        (MReg::Phys(p), _) => p.to_string(),
        (MReg::Virt(..), _) => reg.to_string(),
    }
}

fn escape_asm(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out
}

/// Serialize a lowered, allocated, frame-planned module.
pub fn emit_module(module: &LoweredModule, target: Target) -> String {
    let mut emitter = Emitter::new(target);
    for mf in &module.functions {
        emitter.emit_function(mf);
    }
    emitter.emit_strings(&module.strings, &module.globals);
    emitter.out
}
