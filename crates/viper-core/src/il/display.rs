//! Display impls that round-trip the textual IL form.

use std::fmt;

use super::{Instr, Opcode, Value};

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Temp(name) => write!(f, "%{name}"),
            Value::ConstInt(v) => write!(f, "{v}"),
            Value::ConstFloat(v) => write!(f, "{v}"),
            Value::Global(name) => write!(f, "@{name}"),
            Value::ConstStrLiteral(s) => write!(f, "{:?}", s),
        }
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(result) = &self.result {
            write!(f, "%{result} = ")?;
        }
        write!(f, "{}", self.op)?;
        match self.op {
            Opcode::Call => {
                write!(f, " @{}(", self.callee.as_deref().unwrap_or("?"))?;
                write_values(f, &self.operands)?;
                write!(f, ")")?;
            }
            Opcode::Br | Opcode::Cbr => {
                let mut first = true;
                if self.op == Opcode::Cbr {
                    write!(f, " {}", self.operands[0])?;
                    first = false;
                }
                for (i, label) in self.labels.iter().enumerate() {
                    write!(f, "{} {label}", if first { "" } else { "," })?;
                    first = false;
                    if let Some(args) = self.br_args.get(i) {
                        if !args.is_empty() {
                            write!(f, "(")?;
                            write_values(f, args)?;
                            write!(f, ")")?;
                        }
                    }
                }
            }
            _ => {
                if !self.operands.is_empty() {
                    write!(f, " ")?;
                    write_values(f, &self.operands)?;
                }
            }
        }
        Ok(())
    }
}

fn write_values(f: &mut fmt::Formatter<'_>, values: &[Value]) -> fmt::Result {
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{v}")?;
    }
    Ok(())
}
