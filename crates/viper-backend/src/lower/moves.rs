//! Parallel-move resolution.
//!
//! Call argument marshalling and block-parameter edges both need a set of
//! simultaneous assignments `dst_i := src_i` turned into a sequence of plain
//! copies that never reads a clobbered source. Register-to-register moves are
//! ordered so that every destination is written only after all pending reads
//! of it; a cycle is broken by saving one destination into a fresh scratch
//! register. Constant and symbol sources carry no dependencies and
//! materialize last.

use viper_core::mir::{MInstr, MOpcode, MOperand, MReg, RegClass};

/// Source of one parallel-move element.
#[derive(Debug, Clone, PartialEq)]
pub enum MoveSrc {
    Reg(MReg),
    ImmInt(i64),
    ImmFloat(f64),
    Sym(String),
}

#[derive(Debug, Clone)]
pub struct Move {
    pub dst: MReg,
    pub src: MoveSrc,
}

/// Emits the copy instructions for one resolved move. The closure owns
/// instruction materialization so the selector's constant/symbol policies
/// stay in one place.
pub trait MoveEmitter {
    fn copy_reg(&mut self, dst: MReg, src: MReg);
    fn load_imm_int(&mut self, dst: MReg, value: i64);
    fn load_imm_float(&mut self, dst: MReg, value: f64);
    fn load_sym(&mut self, dst: MReg, name: &str);
    /// Fresh scratch register of the given class for cycle breaking.
    fn scratch(&mut self, cls: RegClass) -> MReg;
}

/// Sequentialize `moves`, emitting through `out`.
pub fn resolve(moves: Vec<Move>, out: &mut impl MoveEmitter) {
    let mut pending: Vec<Move> = Vec::new();
    let mut trailing: Vec<Move> = Vec::new();
    for m in moves {
        match m.src {
            MoveSrc::Reg(src) if src != m.dst => pending.push(m),
            MoveSrc::Reg(_) => {} // identity
            _ => trailing.push(m),
        }
    }

    while !pending.is_empty() {
        let blocked = |m: &Move| {
            pending
                .iter()
                .any(|other| other.src == MoveSrc::Reg(m.dst))
        };
        match pending.iter().position(|m| !blocked(m)) {
            Some(idx) => {
                let m = pending.remove(idx);
                let MoveSrc::Reg(src) = m.src else { unreachable!() };
                out.copy_reg(m.dst, src);
            }
            None => {
                // Every pending destination is still read: a cycle. Save one
                // destination and redirect its readers.
                let victim = pending[0].dst;
                let tmp = out.scratch(victim.class());
                out.copy_reg(tmp, victim);
                for m in &mut pending {
                    if m.src == MoveSrc::Reg(victim) {
                        m.src = MoveSrc::Reg(tmp);
                    }
                }
            }
        }
    }

    for m in trailing {
        match m.src {
            MoveSrc::ImmInt(v) => out.load_imm_int(m.dst, v),
            MoveSrc::ImmFloat(v) => out.load_imm_float(m.dst, v),
            MoveSrc::Sym(name) => out.load_sym(m.dst, &name),
            MoveSrc::Reg(_) => unreachable!(),
        }
    }
}

/// Register-to-register copy selection shared by the emit paths: plain moves
/// within a class, numeric conversions across classes.
pub fn copy_instr(dst: MReg, src: MReg) -> MInstr {
    let op = match (dst.class(), src.class()) {
        (RegClass::Gpr, RegClass::Gpr) => MOpcode::MovRR,
        (RegClass::Fpr, RegClass::Fpr) => MOpcode::FMovRR,
        (RegClass::Fpr, RegClass::Gpr) => MOpcode::Scvtf,
        (RegClass::Gpr, RegClass::Fpr) => MOpcode::Fcvtzs,
    };
    MInstr::new(op, vec![MOperand::reg(dst), MOperand::reg(src)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use viper_core::mir::PhysReg;

    #[derive(Default)]
    struct Recorder {
        ops: Vec<String>,
        next_scratch: u32,
    }

    impl MoveEmitter for Recorder {
        fn copy_reg(&mut self, dst: MReg, src: MReg) {
            self.ops.push(format!("mov {dst}, {src}"));
        }
        fn load_imm_int(&mut self, dst: MReg, value: i64) {
            self.ops.push(format!("mov {dst}, #{value}"));
        }
        fn load_imm_float(&mut self, dst: MReg, value: f64) {
            self.ops.push(format!("fmov {dst}, #{value}"));
        }
        fn load_sym(&mut self, dst: MReg, name: &str) {
            self.ops.push(format!("adr {dst}, {name}"));
        }
        fn scratch(&mut self, cls: RegClass) -> MReg {
            self.next_scratch += 1;
            MReg::Virt(cls, 9000 + self.next_scratch)
        }
    }

    fn v(id: u32) -> MReg {
        MReg::Virt(RegClass::Gpr, id)
    }

    #[test]
    fn orders_chain_before_overwrite() {
        // x0 := v1, x1 := x0's producer is independent here; chain v2 := v1,
        // v1 := v3 must copy v2 first.
        let mut rec = Recorder::default();
        resolve(
            vec![
                Move {
                    dst: v(1),
                    src: MoveSrc::Reg(v(3)),
                },
                Move {
                    dst: v(2),
                    src: MoveSrc::Reg(v(1)),
                },
            ],
            &mut rec,
        );
        assert_eq!(rec.ops, vec!["mov %v2, %v1", "mov %v1, %v3"]);
    }

    #[test]
    fn breaks_swap_cycle_with_scratch() {
        let a = MReg::Phys(PhysReg::X(0));
        let b = MReg::Phys(PhysReg::X(1));
        let mut rec = Recorder::default();
        resolve(
            vec![
                Move {
                    dst: a,
                    src: MoveSrc::Reg(b),
                },
                Move {
                    dst: b,
                    src: MoveSrc::Reg(a),
                },
            ],
            &mut rec,
        );
        assert_eq!(
            rec.ops,
            vec!["mov %v9001, @x0", "mov @x0, @x1", "mov @x1, %v9001"]
        );
    }

    #[test]
    fn constants_materialize_after_reg_moves() {
        let mut rec = Recorder::default();
        resolve(
            vec![
                Move {
                    dst: v(1),
                    src: MoveSrc::ImmInt(7),
                },
                Move {
                    dst: v(2),
                    src: MoveSrc::Reg(v(1)),
                },
            ],
            &mut rec,
        );
        assert_eq!(rec.ops, vec!["mov %v2, %v1", "mov %v1, #7"]);
    }
}
