//! Textual IL parser.
//!
//! Line-oriented: one declaration or instruction per line, `#` starts a
//! comment, whitespace between tokens is arbitrary. The accepted surface is
//! the grammar from the IL reference:
//!
//! ```text
//! il 0.1
//! extern @name(i64, str) -> i64
//! global const str @msg = "hello"
//! func @f(%a:i64, %b:i64) -> i64 {
//! entry(%a:i64, %b:i64):
//!   %t0 = add %a, %b
//!   ret %t0
//! }
//! ```

use std::collections::HashMap;
use std::str::FromStr;

use thiserror::Error;

use super::{
    Block, Extern, Function, Global, GlobalInit, Instr, Module, Opcode, Param, Type, Value,
};

#[derive(Debug, Error, PartialEq)]
#[error("line {line}: {message}")]
pub struct ParseError {
    pub line: usize,
    pub message: String,
}

pub type Result<T> = std::result::Result<T, ParseError>;

/// Parse a complete IL module from its textual form.
pub fn parse_module(src: &str) -> Result<Module> {
    Parser::new(src).run()
}

struct Parser<'a> {
    lines: Vec<(usize, &'a str)>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        let lines = src
            .lines()
            .enumerate()
            .map(|(i, l)| {
                let l = match l.find('#') {
                    Some(idx) => &l[..idx],
                    None => l,
                };
                (i + 1, l.trim())
            })
            .filter(|(_, l)| !l.is_empty())
            .collect();
        Self { lines, pos: 0 }
    }

    fn err<T>(&self, line: usize, message: impl Into<String>) -> Result<T> {
        Err(ParseError {
            line,
            message: message.into(),
        })
    }

    fn peek(&self) -> Option<(usize, &'a str)> {
        self.lines.get(self.pos).copied()
    }

    fn next(&mut self) -> Option<(usize, &'a str)> {
        let item = self.peek();
        if item.is_some() {
            self.pos += 1;
        }
        item
    }

    fn run(mut self) -> Result<Module> {
        let mut module = Module::default();

        let (line, header) = match self.next() {
            Some(l) => l,
            None => return self.err(0, "empty module"),
        };
        match header.strip_prefix("il ") {
            Some(version) => module.version = version.trim().to_string(),
            None => return self.err(line, "expected `il <version>` header"),
        }

        while let Some((line, text)) = self.next() {
            if let Some(rest) = text.strip_prefix("extern ") {
                module.externs.push(parse_extern(line, rest)?);
            } else if let Some(rest) = text.strip_prefix("global ") {
                module.globals.push(parse_global(line, rest)?);
            } else if let Some(rest) = text.strip_prefix("func ") {
                module.functions.push(self.parse_function(line, rest)?);
            } else {
                return self.err(line, format!("unexpected declaration: `{text}`"));
            }
        }

        infer_types(&mut module)?;
        Ok(module)
    }

    fn parse_function(&mut self, line: usize, header: &str) -> Result<Function> {
        let header = match header.strip_suffix('{') {
            Some(h) => h.trim(),
            None => return self.err(line, "function header must end with `{`"),
        };
        let (name, rest) = parse_symbol_ref(line, header)?;
        let (params_text, rest) = take_parens(line, rest)?;
        let ret = match rest.trim().strip_prefix("->") {
            Some(ty) => parse_type(line, ty.trim())?,
            None => return self.err(line, "expected `->` return type"),
        };
        let params = parse_typed_params(line, params_text)?;

        let mut blocks = Vec::new();
        loop {
            let (bline, text) = match self.peek() {
                Some(item) => item,
                None => return self.err(line, "unterminated function body"),
            };
            if text == "}" {
                self.next();
                break;
            }
            blocks.push(self.parse_block(bline)?);
        }
        if blocks.is_empty() {
            return self.err(line, format!("function @{name} has no blocks"));
        }

        Ok(Function {
            name,
            params,
            ret,
            blocks,
        })
    }

    fn parse_block(&mut self, line: usize) -> Result<Block> {
        let (_, header) = self.next().expect("peeked");
        let header = match header.strip_suffix(':') {
            Some(h) => h.trim(),
            None => return self.err(line, "block header must end with `:`"),
        };
        let (label, params) = match header.find('(') {
            Some(idx) => {
                let (params_text, rest) = take_parens(line, &header[idx..])?;
                if !rest.trim().is_empty() {
                    return self.err(line, "trailing text after block parameter list");
                }
                (
                    header[..idx].trim().to_string(),
                    parse_typed_params(line, params_text)?,
                )
            }
            None => (header.to_string(), Vec::new()),
        };
        if label.is_empty() {
            return self.err(line, "empty block label");
        }

        let mut instrs = Vec::new();
        loop {
            let (iline, text) = match self.peek() {
                Some(item) => item,
                None => return self.err(line, "unterminated block"),
            };
            if text == "}" || is_block_header(text) {
                break;
            }
            self.next();
            let instr = parse_instruction(iline, text)?;
            let done = instr.op.is_terminator();
            instrs.push(instr);
            if done {
                break;
            }
        }

        Ok(Block {
            label,
            params,
            instrs,
        })
    }
}

/// A line that looks like `name:` or `name(params):` introduces a block.
fn is_block_header(text: &str) -> bool {
    let Some(stripped) = text.strip_suffix(':') else {
        return false;
    };
    let name_end = stripped.find('(').unwrap_or(stripped.len());
    let name = stripped[..name_end].trim();
    !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.')
}

fn parse_extern(line: usize, text: &str) -> Result<Extern> {
    let (name, rest) = parse_symbol_ref(line, text)?;
    let (params_text, rest) = take_parens(line, rest)?;
    let ret = match rest.trim().strip_prefix("->") {
        Some(ty) => parse_type(line, ty.trim())?,
        None => {
            return Err(ParseError {
                line,
                message: "expected `->` return type".into(),
            })
        }
    };
    let mut params = Vec::new();
    for piece in split_commas(params_text) {
        params.push(parse_type(line, piece.trim())?);
    }
    Ok(Extern { name, params, ret })
}

fn parse_global(line: usize, text: &str) -> Result<Global> {
    let (is_const, text) = match text.strip_prefix("const ") {
        Some(rest) => (true, rest.trim()),
        None => (false, text),
    };
    let (ty_text, rest) = match text.split_once(' ') {
        Some(pair) => pair,
        None => {
            return Err(ParseError {
                line,
                message: "malformed global declaration".into(),
            })
        }
    };
    let ty = parse_type(line, ty_text)?;
    let (name, rest) = parse_symbol_ref(line, rest.trim())?;
    let init_text = match rest.trim().strip_prefix('=') {
        Some(v) => v.trim(),
        None => {
            return Err(ParseError {
                line,
                message: "global declaration requires an initializer".into(),
            })
        }
    };
    let init = if init_text.starts_with('"') {
        GlobalInit::Str(parse_string_literal(line, init_text)?)
    } else {
        match init_text.parse::<i64>() {
            Ok(v) => GlobalInit::Int(v),
            Err(_) => {
                return Err(ParseError {
                    line,
                    message: format!("invalid global initializer `{init_text}`"),
                })
            }
        }
    };
    Ok(Global {
        name,
        ty,
        is_const,
        init,
    })
}

fn parse_instruction(line: usize, text: &str) -> Result<Instr> {
    // Optional `%result =` prefix.
    let (result, body) = match text.split_once('=') {
        Some((lhs, rhs)) if lhs.trim().starts_with('%') && !lhs.trim().contains(' ') => {
            (Some(lhs.trim()[1..].to_string()), rhs.trim())
        }
        _ => (None, text),
    };

    let (op_text, rest) = match body.split_once(|c: char| c.is_whitespace()) {
        Some((op, rest)) => (op, rest.trim()),
        None => (body, ""),
    };
    let op = match Opcode::from_str(op_text) {
        Ok(op) => op,
        Err(_) => {
            return Err(ParseError {
                line,
                message: format!("unknown opcode `{op_text}`"),
            })
        }
    };

    let mut instr = Instr::new(op, Type::Void);
    instr.result = result;

    match op {
        Opcode::Call => {
            let (callee, rest) = parse_symbol_ref(line, rest)?;
            let (args_text, _) = take_parens(line, rest)?;
            instr.callee = Some(callee);
            for piece in split_commas(args_text) {
                instr.operands.push(parse_value(line, piece.trim())?);
            }
        }
        Opcode::CallIndirect => {
            // call_indirect T, %fp(args...); the type is optional, defaults i64.
            let (ty, rest) = match rest.split_once(',') {
                Some((first, tail)) if !first.trim().starts_with('%') => {
                    (parse_type(line, first.trim())?, tail.trim())
                }
                _ => (Type::I64, rest),
            };
            instr.ty = ty;
            let idx = rest.find('(').unwrap_or(rest.len());
            instr.operands.push(parse_value(line, rest[..idx].trim())?);
            let (args_text, _) = take_parens(line, &rest[idx..])?;
            for piece in split_commas(args_text) {
                instr.operands.push(parse_value(line, piece.trim())?);
            }
        }
        Opcode::Load => {
            // load T, %p
            let (ty_text, ptr_text) = split_head(line, rest)?;
            instr.ty = parse_type(line, ty_text)?;
            instr.operands.push(parse_value(line, ptr_text)?);
        }
        Opcode::Store => {
            // store T, %p, %v
            let (ty_text, rest) = split_head(line, rest)?;
            let ty = parse_type(line, ty_text)?;
            let (ptr_text, val_text) = split_head(line, rest)?;
            // Stores carry the stored type for addressing-width selection.
            instr.ty = ty;
            instr.operands.push(parse_value(line, ptr_text)?);
            instr.operands.push(parse_value(line, val_text)?);
        }
        Opcode::ConstStr => {
            if rest.starts_with('"') {
                // Synthesized rodata label; the literal travels as the
                // instruction's sole "operand" via a global value later.
                instr
                    .operands
                    .push(Value::ConstStrLiteral(parse_string_literal(line, rest)?));
            } else {
                let (name, _) = parse_symbol_ref(line, rest)?;
                instr.operands.push(Value::Global(name));
            }
        }
        Opcode::Br => {
            let (label, args) = parse_branch_target(line, rest)?;
            instr.labels.push(label);
            instr.br_args.push(args);
        }
        Opcode::Cbr => {
            // cbr %c, then(args...), else(args...)
            let pieces = split_commas(rest);
            if pieces.len() != 3 {
                return Err(ParseError {
                    line,
                    message: "cbr expects a condition and two targets".into(),
                });
            }
            instr.operands.push(parse_value(line, pieces[0].trim())?);
            for target in &pieces[1..] {
                let (label, args) = parse_branch_target(line, target.trim())?;
                instr.labels.push(label);
                instr.br_args.push(args);
            }
        }
        _ => {
            for piece in split_commas(rest) {
                let piece = piece.trim();
                if piece.is_empty() {
                    continue;
                }
                instr.operands.push(parse_value(line, piece)?);
            }
        }
    }

    Ok(instr)
}

/// `target` or `target(a, b, ...)`.
fn parse_branch_target(line: usize, text: &str) -> Result<(String, Vec<Value>)> {
    match text.find('(') {
        Some(idx) => {
            let label = text[..idx].trim().to_string();
            let (args_text, _) = take_parens(line, &text[idx..])?;
            let mut args = Vec::new();
            for piece in split_commas(args_text) {
                args.push(parse_value(line, piece.trim())?);
            }
            Ok((label, args))
        }
        None => Ok((text.trim().to_string(), Vec::new())),
    }
}

fn parse_value(line: usize, text: &str) -> Result<Value> {
    if let Some(name) = text.strip_prefix('%') {
        return Ok(Value::Temp(name.to_string()));
    }
    if let Some(name) = text.strip_prefix('@') {
        return Ok(Value::Global(name.to_string()));
    }
    if text.starts_with('"') {
        return Ok(Value::ConstStrLiteral(parse_string_literal(line, text)?));
    }
    if text.contains('.') || text.contains("e+") || text.contains("e-") {
        if let Ok(v) = text.parse::<f64>() {
            return Ok(Value::ConstFloat(v));
        }
    }
    if let Some(hex) = text.strip_prefix("0x") {
        if let Ok(v) = u64::from_str_radix(hex, 16) {
            return Ok(Value::ConstInt(v as i64));
        }
    }
    match text.parse::<i64>() {
        Ok(v) => Ok(Value::ConstInt(v)),
        Err(_) => Err(ParseError {
            line,
            message: format!("invalid operand `{text}`"),
        }),
    }
}

fn parse_type(line: usize, text: &str) -> Result<Type> {
    match text {
        "i1" => Ok(Type::I1),
        "i64" => Ok(Type::I64),
        "f64" => Ok(Type::F64),
        "ptr" => Ok(Type::Ptr),
        "str" => Ok(Type::Str),
        "void" => Ok(Type::Void),
        other => Err(ParseError {
            line,
            message: format!("unknown type `{other}`"),
        }),
    }
}

/// `%a:i64, %b:f64` (empty allowed).
fn parse_typed_params(line: usize, text: &str) -> Result<Vec<Param>> {
    let mut params = Vec::new();
    for piece in split_commas(text) {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (name, ty) = match piece.split_once(':') {
            Some(pair) => pair,
            None => {
                return Err(ParseError {
                    line,
                    message: format!("parameter `{piece}` missing `:type`"),
                })
            }
        };
        let name = match name.trim().strip_prefix('%') {
            Some(n) => n.to_string(),
            None => {
                return Err(ParseError {
                    line,
                    message: format!("parameter name `{name}` must start with `%`"),
                })
            }
        };
        params.push(Param {
            name,
            ty: parse_type(line, ty.trim())?,
        });
    }
    Ok(params)
}

/// `@name` followed by the remaining text.
fn parse_symbol_ref<'b>(line: usize, text: &'b str) -> Result<(String, &'b str)> {
    let text = text.trim_start();
    let rest = match text.strip_prefix('@') {
        Some(r) => r,
        None => {
            return Err(ParseError {
                line,
                message: format!("expected `@name`, found `{text}`"),
            })
        }
    };
    let end = rest
        .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.'))
        .unwrap_or(rest.len());
    if end == 0 {
        return Err(ParseError {
            line,
            message: "empty symbol name".into(),
        });
    }
    Ok((rest[..end].to_string(), &rest[end..]))
}

/// Content of a leading `( ... )` plus the text after the closing paren.
fn take_parens<'b>(line: usize, text: &'b str) -> Result<(&'b str, &'b str)> {
    let text = text.trim_start();
    if !text.starts_with('(') {
        return Err(ParseError {
            line,
            message: format!("expected `(`, found `{text}`"),
        });
    }
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&text[1..i], &text[i + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(ParseError {
        line,
        message: "unbalanced parentheses".into(),
    })
}

/// First comma-separated piece plus the remainder.
fn split_head<'b>(line: usize, text: &'b str) -> Result<(&'b str, &'b str)> {
    match text.split_once(',') {
        Some((head, tail)) => Ok((head.trim(), tail.trim())),
        None => Err(ParseError {
            line,
            message: format!("expected `,` in `{text}`"),
        }),
    }
}

/// Split on top-level commas, respecting parens and string literals.
fn split_commas(text: &str) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut depth = 0usize;
    let mut in_str = false;
    let mut start = 0usize;
    let bytes = text.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'"' if !in_str => in_str = true,
            b'"' if in_str && (i == 0 || bytes[i - 1] != b'\\') => in_str = false,
            b'(' if !in_str => depth += 1,
            b')' if !in_str => depth = depth.saturating_sub(1),
            b',' if !in_str && depth == 0 => {
                pieces.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if start < text.len() || !pieces.is_empty() {
        pieces.push(&text[start..]);
    } else if !text.trim().is_empty() {
        pieces.push(text);
    }
    pieces.retain(|p| !p.trim().is_empty());
    pieces
}

fn parse_string_literal(line: usize, text: &str) -> Result<String> {
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .ok_or_else(|| ParseError {
            line,
            message: format!("malformed string literal `{text}`"),
        })?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('0') => out.push('\0'),
            other => {
                return Err(ParseError {
                    line,
                    message: format!("unknown escape `\\{}`", other.unwrap_or(' ')),
                })
            }
        }
    }
    Ok(out)
}

/// Assign result types to instructions that do not carry them syntactically.
///
/// Runs simple passes until every typed result resolves; SSA def-before-use
/// along control flow guarantees termination for verified modules.
fn infer_types(module: &mut Module) -> Result<()> {
    let extern_sigs: HashMap<String, Type> = module
        .externs
        .iter()
        .map(|e| (e.name.clone(), e.ret))
        .collect();
    let fn_sigs: HashMap<String, Type> = module
        .functions
        .iter()
        .map(|f| (f.name.clone(), f.ret))
        .collect();

    for func in &mut module.functions {
        let mut temp_ty: HashMap<String, Type> = HashMap::new();
        for block in &func.blocks {
            for p in &block.params {
                temp_ty.insert(p.name.clone(), p.ty);
            }
        }

        for _ in 0..func.blocks.len() + 1 {
            let mut progressed = false;
            for block in &mut func.blocks {
                for instr in &mut block.instrs {
                    if instr.result.is_some()
                        && instr.ty == Type::Void
                        && !matches!(instr.op, Opcode::Ret | Opcode::Br | Opcode::Cbr)
                    {
                        if let Some(ty) = result_type(instr, &temp_ty, &extern_sigs, &fn_sigs) {
                            instr.ty = ty;
                            progressed = true;
                        }
                    }
                    if let (Some(name), ty) = (&instr.result, instr.ty) {
                        if ty != Type::Void {
                            temp_ty.entry(name.clone()).or_insert(ty);
                        }
                    }
                }
            }
            if !progressed {
                break;
            }
        }
    }
    Ok(())
}

fn result_type(
    instr: &Instr,
    temp_ty: &HashMap<String, Type>,
    extern_sigs: &HashMap<String, Type>,
    fn_sigs: &HashMap<String, Type>,
) -> Option<Type> {
    use Opcode::*;
    match instr.op {
        Add | Sub | Mul | IAddOvf | ISubOvf | IMulOvf | And | Or | Xor | Shl | LShr | AShr => {
            // Pointer arithmetic keeps the pointer type.
            let lhs = instr.operands.first();
            match lhs {
                Some(Value::Temp(name)) if temp_ty.get(name) == Some(&Type::Ptr) => Some(Type::Ptr),
                _ => Some(Type::I64),
            }
        }
        ICmpEq | ICmpNe | SCmpLt | SCmpLe | SCmpGt | SCmpGe | UCmpLt | UCmpLe | UCmpGt | UCmpGe
        | FCmpEq | FCmpNe | FCmpLt | FCmpLe | FCmpGt | FCmpGe => Some(Type::I1),
        FAdd | FSub | FMul | FDiv | Sitofp => Some(Type::F64),
        Fptosi | Zext1 => Some(Type::I64),
        Alloca | Gep => Some(Type::Ptr),
        ConstStr => Some(Type::Str),
        Call => instr
            .callee
            .as_ref()
            .and_then(|c| fn_sigs.get(c).or_else(|| extern_sigs.get(c)))
            .copied(),
        CallIndirect | Load | Store | Ret | Br | Cbr => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_minimal_function() {
        let m = parse_module(
            "il 0.1\n\
             func @add2(%a:i64, %b:i64) -> i64 {\n\
             entry(%a:i64, %b:i64):\n\
               %t0 = add %a, %b\n\
               ret %t0\n\
             }\n",
        )
        .unwrap();
        assert_eq!(m.version, "0.1");
        assert_eq!(m.functions.len(), 1);
        let f = &m.functions[0];
        assert_eq!(f.name, "add2");
        assert_eq!(f.ret, Type::I64);
        assert_eq!(f.blocks.len(), 1);
        let instrs = &f.blocks[0].instrs;
        assert_eq!(instrs.len(), 2);
        assert_eq!(instrs[0].op, Opcode::Add);
        assert_eq!(instrs[0].ty, Type::I64);
        assert_eq!(instrs[0].result.as_deref(), Some("t0"));
    }

    #[test]
    fn parses_externs_and_calls() {
        let m = parse_module(
            "il 0.1\n\
             extern @h(i64, i64) -> i64\n\
             func @f(%a:i64, %b:i64) -> i64 {\n\
             entry(%a:i64, %b:i64):\n\
               %t0 = call @h(%b, %a)\n\
               ret %t0\n\
             }\n",
        )
        .unwrap();
        assert_eq!(m.externs.len(), 1);
        assert_eq!(m.externs[0].params, vec![Type::I64, Type::I64]);
        let call = &m.functions[0].blocks[0].instrs[0];
        assert_eq!(call.callee.as_deref(), Some("h"));
        assert_eq!(call.ty, Type::I64);
        assert_eq!(
            call.operands,
            vec![Value::Temp("b".into()), Value::Temp("a".into())]
        );
    }

    #[test]
    fn parses_branches_with_block_args() {
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
        let f = &m.functions[0];
        assert_eq!(f.blocks.len(), 4);
        let cbr = f.blocks[0].instrs.last().unwrap();
        assert_eq!(cbr.labels, vec!["then".to_string(), "else".to_string()]);
        let br = &f.blocks[1].instrs[0];
        assert_eq!(br.labels, vec!["join".to_string()]);
        assert_eq!(br.br_args, vec![vec![Value::ConstInt(1)]]);
        assert_eq!(f.blocks[3].params[0].ty, Type::I64);
    }

    #[test]
    fn parses_globals_and_memory_ops() {
        let m = parse_module(
            "il 0.1\n\
             global const str @msg = \"hi\\n\"\n\
             func @g() -> i64 {\n\
             entry:\n\
               %p = alloca 8\n\
               store i64, %p, 42\n\
               %v = load i64, %p\n\
               ret %v\n\
             }\n",
        )
        .unwrap();
        assert_eq!(m.globals[0].init, GlobalInit::Str("hi\n".into()));
        let store = &m.functions[0].blocks[0].instrs[1];
        assert_eq!(store.ty, Type::I64);
        assert_eq!(store.operands.len(), 2);
        let load = &m.functions[0].blocks[0].instrs[2];
        assert_eq!(load.ty, Type::I64);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let err = parse_module(
            "il 0.1\n\
             func @f() -> void {\n\
             entry:\n\
               frobnicate %x\n\
               ret\n\
             }\n",
        )
        .unwrap_err();
        assert!(err.message.contains("unknown opcode"));
    }
}
