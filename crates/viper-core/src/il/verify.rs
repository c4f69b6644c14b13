//! Structural checks the backend performs independently of the upstream
//! verifier.
//!
//! A module that fails these checks is rejected with `InvalidModule` before
//! selection starts; the selector is entitled to assume every property
//! checked here.

use std::collections::{HashMap, HashSet};

use thiserror::Error;

use super::{Function, Instr, Module, Opcode, Type, Value};

#[derive(Debug, Error, PartialEq)]
pub enum VerifyError {
    #[error("function @{func}: block `{block}` has no terminator")]
    MissingTerminator { func: String, block: String },
    #[error("function @{func}: branch to unknown block `{target}`")]
    UnknownTarget { func: String, target: String },
    #[error(
        "function @{func}: branch to `{target}` passes {given} arguments, block declares {expected}"
    )]
    ArgCountMismatch {
        func: String,
        target: String,
        given: usize,
        expected: usize,
    },
    #[error("function @{func}: branch argument {index} to `{target}` has type {given}, block declares {expected}")]
    ArgTypeMismatch {
        func: String,
        target: String,
        index: usize,
        given: Type,
        expected: Type,
    },
    #[error("function @{func}: temporary %{name} defined more than once")]
    Redefinition { func: String, name: String },
    #[error("function @{func}: use of undefined temporary %{name}")]
    UndefinedTemp { func: String, name: String },
    #[error("function @{func}: terminator in the middle of block `{block}`")]
    EarlyTerminator { func: String, block: String },
}

/// Run the structural checks over a whole module.
pub fn check_module(module: &Module) -> Result<(), VerifyError> {
    for func in &module.functions {
        check_function(module, func)?;
    }
    Ok(())
}

fn check_function(module: &Module, func: &Function) -> Result<(), VerifyError> {
    let block_params: HashMap<&str, &[super::Param]> = func
        .blocks
        .iter()
        .map(|b| (b.label.as_str(), b.params.as_slice()))
        .collect();

    // Single definition per temporary across the function.
    let mut defined: HashSet<&str> = HashSet::new();
    for block in &func.blocks {
        for p in &block.params {
            if !defined.insert(p.name.as_str()) {
                return Err(VerifyError::Redefinition {
                    func: func.name.clone(),
                    name: p.name.clone(),
                });
            }
        }
        for instr in &block.instrs {
            if let Some(result) = &instr.result {
                if !defined.insert(result.as_str()) {
                    return Err(VerifyError::Redefinition {
                        func: func.name.clone(),
                        name: result.clone(),
                    });
                }
            }
        }
    }

    for block in &func.blocks {
        match block.terminator() {
            Some(_) => {}
            None => {
                return Err(VerifyError::MissingTerminator {
                    func: func.name.clone(),
                    block: block.label.clone(),
                })
            }
        }
        for (i, instr) in block.instrs.iter().enumerate() {
            if instr.op.is_terminator() && i + 1 != block.instrs.len() {
                return Err(VerifyError::EarlyTerminator {
                    func: func.name.clone(),
                    block: block.label.clone(),
                });
            }
            for value in instr_values(instr) {
                if let Value::Temp(name) = value {
                    if !defined.contains(name.as_str()) {
                        return Err(VerifyError::UndefinedTemp {
                            func: func.name.clone(),
                            name: name.clone(),
                        });
                    }
                }
            }
            check_branch_edges(module, func, instr, &block_params)?;
        }
    }

    Ok(())
}

fn check_branch_edges(
    module: &Module,
    func: &Function,
    instr: &Instr,
    block_params: &HashMap<&str, &[super::Param]>,
) -> Result<(), VerifyError> {
    if !matches!(instr.op, Opcode::Br | Opcode::Cbr) {
        return Ok(());
    }
    for (edge, target) in instr.labels.iter().enumerate() {
        let params = match block_params.get(target.as_str()) {
            Some(p) => *p,
            None => {
                return Err(VerifyError::UnknownTarget {
                    func: func.name.clone(),
                    target: target.clone(),
                })
            }
        };
        let args = instr.br_args.get(edge).map(|a| a.as_slice()).unwrap_or(&[]);
        if args.len() != params.len() {
            return Err(VerifyError::ArgCountMismatch {
                func: func.name.clone(),
                target: target.clone(),
                given: args.len(),
                expected: params.len(),
            });
        }
        for (i, (arg, param)) in args.iter().zip(params).enumerate() {
            if let Some(given) = value_type(module, func, arg) {
                // i64 constants flow into ptr-typed parameters unchanged.
                let compatible = given == param.ty
                    || (given == Type::I64 && param.ty == Type::Ptr)
                    || (given == Type::Ptr && param.ty == Type::I64);
                if !compatible {
                    return Err(VerifyError::ArgTypeMismatch {
                        func: func.name.clone(),
                        target: target.clone(),
                        index: i,
                        given,
                        expected: param.ty,
                    });
                }
            }
        }
    }
    Ok(())
}

/// All values an instruction reads.
fn instr_values(instr: &Instr) -> impl Iterator<Item = &Value> {
    instr
        .operands
        .iter()
        .chain(instr.br_args.iter().flatten())
}

/// Type of a value if it is statically known.
pub fn value_type(module: &Module, func: &Function, value: &Value) -> Option<Type> {
    match value {
        Value::ConstInt(_) => Some(Type::I64),
        Value::ConstFloat(_) => Some(Type::F64),
        Value::ConstStrLiteral(_) => Some(Type::Str),
        Value::Global(name) => match module.symbol(name) {
            Some(super::SymbolKind::Global(g)) => Some(g.ty),
            Some(_) => Some(Type::Ptr),
            None => None,
        },
        Value::Temp(name) => {
            for block in &func.blocks {
                for p in &block.params {
                    if p.name == *name {
                        return Some(p.ty);
                    }
                }
                for instr in &block.instrs {
                    if instr.result.as_deref() == Some(name) {
                        return Some(instr.ty);
                    }
                }
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::parse::parse_module;

    #[test]
    fn accepts_valid_diamond() {
        let m = parse_module(
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
        )
        .unwrap();
        check_module(&m).unwrap();
    }

    #[test]
    fn rejects_arg_count_mismatch() {
        let m = parse_module(
            "il 0.1\n\
             func @f() -> i64 {\n\
             entry:\n\
               br join(1, 2)\n\
             join(%v:i64):\n\
               ret %v\n\
             }\n",
        )
        .unwrap();
        assert!(matches!(
            check_module(&m),
            Err(VerifyError::ArgCountMismatch { .. })
        ));
    }

    #[test]
    fn rejects_missing_terminator() {
        let m = parse_module(
            "il 0.1\n\
             func @f() -> i64 {\n\
             entry:\n\
               %t = add 1, 2\n\
             done:\n\
               ret %t\n\
             }\n",
        )
        .unwrap();
        assert!(matches!(
            check_module(&m),
            Err(VerifyError::MissingTerminator { .. })
        ));
    }

    #[test]
    fn rejects_undefined_temp() {
        let m = parse_module(
            "il 0.1\n\
             func @f() -> i64 {\n\
             entry:\n\
               ret %nope\n\
             }\n",
        )
        .unwrap();
        assert!(matches!(
            check_module(&m),
            Err(VerifyError::UndefinedTemp { .. })
        ));
    }
}
