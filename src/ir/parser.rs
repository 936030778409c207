//! Reader for the textual form of the IR.
//!
//! The syntax follows LLVM assembly closely enough that small hand-written
//! `.ll` files load unchanged:
//!
//! ```text
//! @greeting = constant [6 x i8] c"hello\00"
//! declare i32 @puts(ptr)
//!
//! define i32 @main() {
//! entry:
//!   %r = call i32 @puts(ptr @greeting)
//!   ret i32 0
//! }
//! ```

use super::{
    BinOp, Block, BlockId, CastOp, FloatPredicate, Function, Global, Initializer, Inst, InstKind,
    IntPredicate, Module, Operand, Signature, Type, ValueId,
};
use crate::{Result, error::parse_ir_error, value::IntValue};
use hashbrown::HashMap;

#[derive(Clone, Debug, PartialEq)]
enum Tok {
    Word(String),
    Local(String),
    Global(String),
    Int(i128),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Punct(char),
    Ellipsis,
}

#[derive(Clone, Debug)]
struct Token {
    tok: Tok,
    line: usize,
}

fn is_name_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, b'_' | b'.' | b'$' | b'-')
}

fn lex(src: &str) -> Result<Vec<Token>> {
    let bytes = src.as_bytes();
    let mut toks = Vec::new();
    let mut line = 1;
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i];
        match c {
            b'\n' => {
                line += 1;
                i += 1;
            }
            c if c.is_ascii_whitespace() => i += 1,
            b';' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'%' | b'@' => {
                i += 1;
                let name = if bytes.get(i) == Some(&b'"') {
                    let (text, next) = quoted(bytes, i, line)?;
                    i = next;
                    String::from_utf8_lossy(&text).into_owned()
                } else {
                    let start = i;
                    while i < bytes.len() && is_name_char(bytes[i]) {
                        i += 1;
                    }
                    if start == i {
                        return Err(parse_ir_error(line, "expected a name"));
                    }
                    src[start..i].to_owned()
                };
                toks.push(Token {
                    tok: if c == b'%' {
                        Tok::Local(name)
                    } else {
                        Tok::Global(name)
                    },
                    line,
                });
            }
            b'c' if bytes.get(i + 1) == Some(&b'"') => {
                let (text, next) = quoted(bytes, i + 1, line)?;
                i = next;
                toks.push(Token {
                    tok: Tok::Bytes(text),
                    line,
                });
            }
            b'"' => {
                let (text, next) = quoted(bytes, i, line)?;
                i = next;
                toks.push(Token {
                    tok: Tok::Str(String::from_utf8_lossy(&text).into_owned()),
                    line,
                });
            }
            b'.' if bytes[i..].starts_with(b"...") => {
                i += 3;
                toks.push(Token {
                    tok: Tok::Ellipsis,
                    line,
                });
            }
            c if c.is_ascii_digit()
                || (c == b'-' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) =>
            {
                let start = i;
                i += 1;
                let hex = bytes[start..].starts_with(b"0x");
                if hex {
                    i = start + 2;
                }
                let mut float = false;
                while i < bytes.len() {
                    let d = bytes[i];
                    if d.is_ascii_digit() || (hex && d.is_ascii_hexdigit()) {
                        i += 1;
                    } else if !hex && (d == b'.' || d == b'e' || d == b'E') {
                        float = true;
                        i += 1;
                        if matches!(bytes.get(i), Some(b'+' | b'-')) && (d == b'e' || d == b'E') {
                            i += 1;
                        }
                    } else {
                        break;
                    }
                }
                let text = &src[start..i];
                let tok = if hex {
                    i128::from_str_radix(&text[2..], 16).map(Tok::Int).ok()
                } else if float {
                    text.parse().map(Tok::Float).ok()
                } else {
                    text.parse().map(Tok::Int).ok()
                };
                let tok = tok.ok_or_else(|| parse_ir_error(line, format!("bad number '{text}'")))?;
                toks.push(Token { tok, line });
            }
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_' || bytes[i] == b'.') {
                    i += 1;
                }
                toks.push(Token {
                    tok: Tok::Word(src[start..i].to_owned()),
                    line,
                });
            }
            b'=' | b',' | b'(' | b')' | b'[' | b']' | b'{' | b'}' | b'<' | b'>' | b':' | b'*'
            | b'#' | b'!' => {
                i += 1;
                toks.push(Token {
                    tok: Tok::Punct(c as char),
                    line,
                });
            }
            other => {
                return Err(parse_ir_error(
                    line,
                    format!("unexpected character '{}'", other as char),
                ));
            }
        }
    }
    Ok(toks)
}

/// Reads a `"..."` literal starting at `start`, decoding `\XX` escapes.
fn quoted(bytes: &[u8], start: usize, line: usize) -> Result<(Vec<u8>, usize)> {
    let mut out = Vec::new();
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'"' => return Ok((out, i + 1)),
            b'\\' => {
                let hex = bytes
                    .get(i + 1..i + 3)
                    .and_then(|h| core::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None if bytes.get(i + 1) == Some(&b'\\') => {
                        out.push(b'\\');
                        i += 2;
                    }
                    None => return Err(parse_ir_error(line, "bad escape in string")),
                }
            }
            b'\n' => break,
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Err(parse_ir_error(line, "unterminated string"))
}

/// Per-function name tables.
#[derive(Default)]
struct FnScope {
    values: HashMap<String, ValueId>,
    types: Vec<Option<Type>>,
    /// Line of the first use of each still-undefined name.
    pending: HashMap<String, usize>,
    blocks: HashMap<String, BlockId>,
    bodies: Vec<Option<Block>>,
    block_refs: HashMap<String, usize>,
}

impl FnScope {
    fn value(&mut self, name: &str, line: usize) -> ValueId {
        if let Some(id) = self.values.get(name) {
            return *id;
        }
        let id = ValueId(self.types.len() as u32);
        self.types.push(None);
        self.values.insert(name.to_owned(), id);
        self.pending.insert(name.to_owned(), line);
        id
    }

    fn define(&mut self, name: &str, ty: Type, line: usize) -> Result<ValueId> {
        let id = self.value(name, line);
        if self.types[id.0 as usize].is_some() {
            return Err(parse_ir_error(line, format!("redefinition of %{name}")));
        }
        self.types[id.0 as usize] = Some(ty);
        self.pending.remove(name);
        Ok(id)
    }

    fn anonymous(&mut self, ty: Type) -> ValueId {
        let id = ValueId(self.types.len() as u32);
        self.types.push(Some(ty));
        id
    }

    fn block(&mut self, name: &str, line: usize) -> BlockId {
        if let Some(id) = self.blocks.get(name) {
            return *id;
        }
        let id = BlockId(self.bodies.len() as u32);
        self.bodies.push(None);
        self.blocks.insert(name.to_owned(), id);
        self.block_refs.insert(name.to_owned(), line);
        id
    }
}

struct Parser {
    toks: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn line(&self) -> usize {
        self.toks
            .get(self.pos)
            .or_else(|| self.toks.last())
            .map_or(1, |t| t.line)
    }

    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos).map(|t| &t.tok)
    }

    fn next(&mut self) -> Result<Tok> {
        let tok = self
            .toks
            .get(self.pos)
            .map(|t| t.tok.clone())
            .ok_or_else(|| parse_ir_error(self.line(), "unexpected end of input"))?;
        self.pos += 1;
        Ok(tok)
    }

    fn error<T>(&self, msg: impl Into<String>) -> Result<T> {
        Err(parse_ir_error(self.line(), msg.into()))
    }

    fn is_word(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Tok::Word(w)) if w == word)
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if self.is_word(word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_punct(&mut self, c: char) -> bool {
        if self.peek() == Some(&Tok::Punct(c)) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, c: char) -> Result<()> {
        if self.eat_punct(c) {
            Ok(())
        } else {
            self.error(format!("expected '{c}'"))
        }
    }

    fn expect_word(&mut self, word: &str) -> Result<()> {
        if self.eat_word(word) {
            Ok(())
        } else {
            self.error(format!("expected '{word}'"))
        }
    }

    fn word(&mut self) -> Result<String> {
        match self.next()? {
            Tok::Word(w) => Ok(w),
            other => {
                self.pos -= 1;
                self.error(format!("expected a keyword, found {other:?}"))
            }
        }
    }

    fn global_name(&mut self) -> Result<String> {
        match self.next()? {
            Tok::Global(name) => Ok(name),
            _ => {
                self.pos -= 1;
                self.error("expected a global name")
            }
        }
    }

    fn int(&mut self) -> Result<i128> {
        match self.next()? {
            Tok::Int(v) => Ok(v),
            _ => {
                self.pos -= 1;
                self.error("expected an integer")
            }
        }
    }

    /// Skips `, align N` and similar trailing attributes.
    fn skip_align(&mut self) -> Result<()> {
        while self.peek() == Some(&Tok::Punct(','))
            && matches!(self.toks.get(self.pos + 1).map(|t| &t.tok), Some(Tok::Word(w)) if w == "align")
        {
            self.pos += 2;
            self.int()?;
        }
        Ok(())
    }

    fn skip_words(&mut self, words: &[&str]) {
        while let Some(Tok::Word(w)) = self.peek() {
            if words.contains(&w.as_str()) {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn ty(&mut self) -> Result<Type> {
        if self.eat_punct('<') {
            let len = self.int()?;
            self.expect_word("x")?;
            let elem = self.ty()?;
            self.expect_punct('>')?;
            return Ok(Type::Vector(len as u32, Box::new(elem)));
        }
        let word = self.word()?;
        let ty = match word.as_str() {
            "void" => Type::Void,
            "float" => Type::Float,
            "double" => Type::Double,
            "ptr" => Type::Ptr,
            w if w.starts_with('i') => match w[1..].parse::<u32>() {
                Ok(bits) if (1..=128).contains(&bits) => Type::Int(bits),
                _ => return self.error(format!("unsupported type '{w}'")),
            },
            w => return self.error(format!("unknown type '{w}'")),
        };
        // Typed pointers read as opaque pointers.
        let mut ty = ty;
        while self.eat_punct('*') {
            ty = Type::Ptr;
        }
        Ok(ty)
    }

    fn constant(&mut self, ty: &Type, tok: Tok) -> Result<Operand> {
        Ok(match tok {
            Tok::Int(v) => match ty {
                Type::Int(bits) => Operand::Int(IntValue::new(*bits, v as u128)),
                Type::Float => Operand::Float(v as f32),
                Type::Double => Operand::Double(v as f64),
                Type::Ptr if v == 0 => Operand::Null,
                _ => return self.error(format!("integer constant for type {ty}")),
            },
            Tok::Float(v) => match ty {
                Type::Float => Operand::Float(v as f32),
                Type::Double => Operand::Double(v),
                _ => return self.error(format!("floating point constant for type {ty}")),
            },
            Tok::Word(w) => match w.as_str() {
                "true" => Operand::Int(IntValue::new(1, 1)),
                "false" => Operand::Int(IntValue::new(1, 0)),
                "null" => Operand::Null,
                "undef" | "poison" | "zeroinitializer" => Operand::Undef,
                other => return self.error(format!("unexpected '{other}'")),
            },
            other => return self.error(format!("expected a value, found {other:?}")),
        })
    }

    fn operand(&mut self, ty: &Type, scope: &mut FnScope) -> Result<Operand> {
        let line = self.line();
        match self.next()? {
            Tok::Local(name) => Ok(Operand::Value(scope.value(&name, line))),
            Tok::Global(name) => Ok(Operand::Global(name)),
            tok => self.constant(ty, tok),
        }
    }

    fn typed_operand(&mut self, scope: &mut FnScope) -> Result<(Type, Operand)> {
        let ty = self.ty()?;
        let op = self.operand(&ty, scope)?;
        Ok((ty, op))
    }

    fn label(&mut self, scope: &mut FnScope) -> Result<BlockId> {
        self.expect_word("label")?;
        let line = self.line();
        match self.next()? {
            Tok::Local(name) => Ok(scope.block(&name, line)),
            _ => {
                self.pos -= 1;
                self.error("expected a label")
            }
        }
    }

    fn parse_module(&mut self, identifier: &str) -> Result<Module> {
        let mut module = Module::new(identifier);
        while let Some(tok) = self.peek().cloned() {
            match tok {
                Tok::Global(_) => {
                    let global = self.global()?;
                    module.add_global(global);
                }
                Tok::Word(w) if w == "declare" => {
                    self.pos += 1;
                    let function = self.declaration()?;
                    module.add_function(function);
                }
                Tok::Word(w) if w == "define" => {
                    self.pos += 1;
                    let function = self.definition()?;
                    module.add_function(function);
                }
                Tok::Word(w) if w == "source_filename" => {
                    self.pos += 1;
                    self.expect_punct('=')?;
                    if let Tok::Str(name) = self.next()? {
                        module.identifier = name;
                    }
                }
                Tok::Word(w) if w == "target" => {
                    self.pos += 1;
                    self.word()?;
                    self.expect_punct('=')?;
                    self.next()?;
                }
                Tok::Word(w) if w == "attributes" => {
                    // attributes #0 = { ... }
                    while !self.eat_punct('}') {
                        self.next()?;
                    }
                }
                other => return self.error(format!("unexpected {other:?} at top level")),
            }
        }
        fixup_call_signatures(&mut module);
        Ok(module)
    }

    fn global(&mut self) -> Result<Global> {
        let name = self.global_name()?;
        self.expect_punct('=')?;
        self.skip_words(&[
            "private",
            "internal",
            "external",
            "dso_local",
            "unnamed_addr",
            "local_unnamed_addr",
        ]);
        let constant = match self.word()?.as_str() {
            "global" => false,
            "constant" => true,
            other => return self.error(format!("expected 'global' or 'constant', found '{other}'")),
        };
        let init = if self.eat_punct('[') {
            let len = self.int()? as usize;
            self.expect_word("x")?;
            let elem = self.ty()?;
            self.expect_punct(']')?;
            match self.next()? {
                Tok::Bytes(bytes) if elem == Type::I8 && bytes.len() == len => {
                    Initializer::Bytes(bytes)
                }
                Tok::Word(w) if w == "zeroinitializer" => {
                    Initializer::Bytes(vec![0; len * elem.store_size()])
                }
                _ => return self.error("expected a byte string or zeroinitializer"),
            }
        } else {
            let ty = self.ty()?;
            match (self.next()?, &ty) {
                (Tok::Word(w), _) if w == "zeroinitializer" => Initializer::Zero(ty),
                (Tok::Word(w), Type::Ptr) if w == "null" => Initializer::Zero(ty),
                (Tok::Int(v), Type::Int(bits)) => Initializer::Int(IntValue::new(*bits, v as u128)),
                (Tok::Float(v), Type::Float) => Initializer::Float(v as f32),
                (Tok::Float(v), Type::Double) => Initializer::Double(v),
                (Tok::Int(v), Type::Double) => Initializer::Double(v as f64),
                _ => return self.error(format!("unsupported initializer for {ty}")),
            }
        };
        self.skip_align()?;
        Ok(Global {
            name,
            init,
            constant,
        })
    }

    fn header(&mut self, scope: Option<&mut FnScope>) -> Result<(String, Signature)> {
        self.skip_words(&[
            "dso_local",
            "internal",
            "private",
            "external",
            "noundef",
            "signext",
            "zeroext",
        ]);
        let ret = self.ty()?;
        let name = self.global_name()?;
        self.expect_punct('(')?;
        let mut params = Vec::new();
        let mut variadic = false;
        let mut names = Vec::new();
        if !self.eat_punct(')') {
            loop {
                if self.peek() == Some(&Tok::Ellipsis) {
                    self.pos += 1;
                    variadic = true;
                } else {
                    params.push(self.ty()?);
                    self.skip_words(&["noundef", "signext", "zeroext", "nocapture", "readonly"]);
                    let line = self.line();
                    if let Some(Tok::Local(local)) = self.peek().cloned() {
                        self.pos += 1;
                        names.push(Some((local, line)));
                    } else {
                        names.push(None);
                    }
                }
                if self.eat_punct(')') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        if let Some(scope) = scope {
            for (ty, name) in params.iter().zip(names) {
                match name {
                    Some((name, line)) => {
                        scope.define(&name, ty.clone(), line)?;
                    }
                    None => {
                        scope.anonymous(ty.clone());
                    }
                }
            }
        }
        // Function attributes: words and `#N` groups.
        loop {
            match self.peek() {
                Some(Tok::Word(w))
                    if !matches!(
                        w.as_str(),
                        "define" | "declare" | "attributes" | "target" | "source_filename"
                    ) =>
                {
                    self.pos += 1
                }
                Some(Tok::Punct('#')) => {
                    self.pos += 1;
                    self.int()?;
                }
                _ => break,
            }
        }
        Ok((
            name,
            Signature {
                ret,
                params,
                variadic,
            },
        ))
    }

    fn declaration(&mut self) -> Result<Function> {
        let (name, sig) = self.header(None)?;
        Ok(Function::declare(name, sig))
    }

    fn definition(&mut self) -> Result<Function> {
        let mut scope = FnScope::default();
        let (name, sig) = self.header(Some(&mut scope))?;
        self.expect_punct('{')?;
        let mut current: Option<(BlockId, Block)> = None;
        loop {
            let line = self.line();
            match self.peek().cloned() {
                Some(Tok::Punct('}')) => {
                    self.pos += 1;
                    break;
                }
                Some(Tok::Word(label))
                    if self.toks.get(self.pos + 1).map(|t| &t.tok) == Some(&Tok::Punct(':')) =>
                {
                    self.pos += 2;
                    if let Some((id, block)) = current.take() {
                        scope.bodies[id.0 as usize] = Some(block);
                    }
                    let id = scope.block(&label, line);
                    if scope.bodies[id.0 as usize].is_some() {
                        return self.error(format!("redefinition of label %{label}"));
                    }
                    scope.block_refs.remove(&label);
                    current = Some((
                        id,
                        Block {
                            name: label,
                            insts: Vec::new(),
                        },
                    ));
                }
                Some(_) => {
                    if current.is_none() {
                        let id = scope.block("entry", line);
                        scope.block_refs.remove("entry");
                        current = Some((
                            id,
                            Block {
                                name: "entry".into(),
                                insts: Vec::new(),
                            },
                        ));
                    }
                    let inst = self.instruction(&mut scope)?;
                    if let Some((_, block)) = current.as_mut() {
                        block.insts.push(inst);
                    }
                }
                None => return self.error(format!("unterminated body of @{name}")),
            }
        }
        if let Some((id, block)) = current.take() {
            scope.bodies[id.0 as usize] = Some(block);
        }
        if let Some((label, line)) = scope.block_refs.iter().next() {
            return Err(parse_ir_error(*line, format!("use of undefined label %{label}")));
        }
        if let Some((value, line)) = scope.pending.iter().min_by_key(|(_, line)| **line) {
            return Err(parse_ir_error(*line, format!("use of undefined value %{value}")));
        }
        let blocks = scope.bodies.into_iter().flatten().collect();
        let value_types = scope
            .types
            .into_iter()
            .map(|ty| ty.unwrap_or(Type::Void))
            .collect();
        Ok(Function {
            name,
            sig,
            blocks,
            value_types,
        })
    }

    fn instruction(&mut self, scope: &mut FnScope) -> Result<Inst> {
        let line = self.line();
        let result = if let Some(Tok::Local(name)) = self.peek().cloned() {
            self.pos += 1;
            self.expect_punct('=')?;
            Some(name)
        } else {
            None
        };
        self.skip_words(&["tail", "musttail", "notail"]);
        let opcode = self.word()?;
        let (kind, ty) = self.inst_kind(&opcode, scope)?;
        let result = match (result, ty) {
            (Some(name), Some(ty)) => Some(scope.define(&name, ty, line)?),
            (Some(name), None) => {
                return Err(parse_ir_error(line, format!("'{opcode}' does not produce %{name}")));
            }
            (None, _) => None,
        };
        Ok(Inst { result, kind })
    }

    /// Parses the operands of `opcode`, returning the instruction and the
    /// type of the value it produces.
    fn inst_kind(&mut self, opcode: &str, scope: &mut FnScope) -> Result<(InstKind, Option<Type>)> {
        if let Some(op) = binop(opcode) {
            self.skip_words(&[
                "nuw", "nsw", "exact", "disjoint", "fast", "nnan", "ninf", "nsz", "arcp",
                "contract", "afn", "reassoc",
            ]);
            let ty = self.ty()?;
            let lhs = self.operand(&ty, scope)?;
            self.expect_punct(',')?;
            let rhs = self.operand(&ty, scope)?;
            return Ok((
                InstKind::Binary {
                    op,
                    ty: ty.clone(),
                    lhs,
                    rhs,
                },
                Some(ty),
            ));
        }
        if let Some(op) = castop(opcode) {
            let (from, value) = self.typed_operand(scope)?;
            self.expect_word("to")?;
            let to = self.ty()?;
            return Ok((
                InstKind::Cast {
                    op,
                    from,
                    to: to.clone(),
                    value,
                },
                Some(to),
            ));
        }
        Ok(match opcode {
            "icmp" => {
                let pred = int_predicate(&self.word()?)
                    .ok_or_else(|| parse_ir_error(self.line(), "unknown icmp predicate"))?;
                let ty = self.ty()?;
                let lhs = self.operand(&ty, scope)?;
                self.expect_punct(',')?;
                let rhs = self.operand(&ty, scope)?;
                let result = match &ty {
                    Type::Vector(len, _) => Type::Vector(*len, Box::new(Type::I1)),
                    _ => Type::I1,
                };
                (InstKind::ICmp { pred, ty, lhs, rhs }, Some(result))
            }
            "fcmp" => {
                self.skip_words(&["fast", "nnan", "ninf", "nsz"]);
                let pred = float_predicate(&self.word()?)
                    .ok_or_else(|| parse_ir_error(self.line(), "unknown fcmp predicate"))?;
                let ty = self.ty()?;
                let lhs = self.operand(&ty, scope)?;
                self.expect_punct(',')?;
                let rhs = self.operand(&ty, scope)?;
                (InstKind::FCmp { pred, ty, lhs, rhs }, Some(Type::I1))
            }
            "select" => {
                let (_, cond) = self.typed_operand(scope)?;
                self.expect_punct(',')?;
                let (ty, then) = self.typed_operand(scope)?;
                self.expect_punct(',')?;
                let (_, otherwise) = self.typed_operand(scope)?;
                (
                    InstKind::Select {
                        ty: ty.clone(),
                        cond,
                        then,
                        otherwise,
                    },
                    Some(ty),
                )
            }
            "alloca" => {
                let ty = self.ty()?;
                let mut count = 1;
                if self.peek() == Some(&Tok::Punct(','))
                    && !matches!(self.toks.get(self.pos + 1).map(|t| &t.tok), Some(Tok::Word(w)) if w == "align")
                {
                    self.pos += 1;
                    self.ty()?;
                    count = self.int()? as u32;
                }
                self.skip_align()?;
                (InstKind::Alloca { ty, count }, Some(Type::Ptr))
            }
            "load" => {
                self.skip_words(&["volatile"]);
                let ty = self.ty()?;
                self.expect_punct(',')?;
                let (_, ptr) = self.typed_operand(scope)?;
                self.skip_align()?;
                (InstKind::Load { ty: ty.clone(), ptr }, Some(ty))
            }
            "store" => {
                self.skip_words(&["volatile"]);
                let (ty, value) = self.typed_operand(scope)?;
                self.expect_punct(',')?;
                let (_, ptr) = self.typed_operand(scope)?;
                self.skip_align()?;
                (InstKind::Store { ty, value, ptr }, None)
            }
            "getelementptr" => {
                self.skip_words(&["inbounds", "nuw", "nusw"]);
                let elem = self.ty()?;
                self.expect_punct(',')?;
                let (_, ptr) = self.typed_operand(scope)?;
                self.expect_punct(',')?;
                let (index_ty, index) = self.typed_operand(scope)?;
                (
                    InstKind::Gep {
                        elem,
                        ptr,
                        index_ty,
                        index,
                    },
                    Some(Type::Ptr),
                )
            }
            "call" => self.call(scope)?,
            "phi" => {
                let ty = self.ty()?;
                let mut incoming = Vec::new();
                loop {
                    self.expect_punct('[')?;
                    let value = self.operand(&ty, scope)?;
                    self.expect_punct(',')?;
                    let line = self.line();
                    let block = match self.next()? {
                        Tok::Local(name) => scope.block(&name, line),
                        _ => return self.error("expected a label in phi"),
                    };
                    self.expect_punct(']')?;
                    incoming.push((value, block));
                    if !self.eat_punct(',') {
                        break;
                    }
                }
                (
                    InstKind::Phi {
                        ty: ty.clone(),
                        incoming,
                    },
                    Some(ty),
                )
            }
            "extractelement" => {
                let (ty, vector) = self.typed_operand(scope)?;
                self.expect_punct(',')?;
                let (_, index) = self.typed_operand(scope)?;
                let elem = match &ty {
                    Type::Vector(_, elem) => (**elem).clone(),
                    _ => return self.error("extractelement of a non-vector"),
                };
                (InstKind::ExtractElement { ty, vector, index }, Some(elem))
            }
            "insertelement" => {
                let (ty, vector) = self.typed_operand(scope)?;
                self.expect_punct(',')?;
                let (_, element) = self.typed_operand(scope)?;
                self.expect_punct(',')?;
                let (_, index) = self.typed_operand(scope)?;
                (
                    InstKind::InsertElement {
                        ty: ty.clone(),
                        vector,
                        element,
                        index,
                    },
                    Some(ty),
                )
            }
            "va_start" => (InstKind::VaStart, Some(Type::Ptr)),
            "va_arg" => {
                let (_, list) = self.typed_operand(scope)?;
                let Operand::Value(list) = list else {
                    return self.error("va_arg needs a list started by va_start");
                };
                self.expect_punct(',')?;
                let ty = self.ty()?;
                (InstKind::VaArg { list, ty: ty.clone() }, Some(ty))
            }
            "br" => {
                if self.is_word("label") {
                    let dest = self.label(scope)?;
                    (InstKind::Br { dest }, None)
                } else {
                    let (_, cond) = self.typed_operand(scope)?;
                    self.expect_punct(',')?;
                    let then = self.label(scope)?;
                    self.expect_punct(',')?;
                    let otherwise = self.label(scope)?;
                    (
                        InstKind::CondBr {
                            cond,
                            then,
                            otherwise,
                        },
                        None,
                    )
                }
            }
            "switch" => {
                let (ty, value) = self.typed_operand(scope)?;
                self.expect_punct(',')?;
                let default = self.label(scope)?;
                self.expect_punct('[')?;
                let bits = ty.int_bits().unwrap_or(64);
                let mut cases = Vec::new();
                while !self.eat_punct(']') {
                    self.ty()?;
                    let v = self.int()?;
                    self.expect_punct(',')?;
                    let dest = self.label(scope)?;
                    cases.push((IntValue::new(bits, v as u128), dest));
                }
                (
                    InstKind::Switch {
                        ty,
                        value,
                        default,
                        cases,
                    },
                    None,
                )
            }
            "ret" => {
                if self.eat_word("void") {
                    (InstKind::Ret { value: None }, None)
                } else {
                    let value = self.typed_operand(scope)?;
                    (InstKind::Ret { value: Some(value) }, None)
                }
            }
            "unreachable" => (InstKind::Unreachable, None),
            other => return self.error(format!("unknown instruction '{other}'")),
        })
    }

    fn call(&mut self, scope: &mut FnScope) -> Result<(InstKind, Option<Type>)> {
        self.skip_words(&["noundef", "signext", "zeroext"]);
        let ret = self.ty()?;
        // An explicit function type: `call i32 (ptr, ...) @printf(...)`.
        let mut explicit = None;
        if self.eat_punct('(') {
            let mut params = Vec::new();
            let mut variadic = false;
            if !self.eat_punct(')') {
                loop {
                    if self.peek() == Some(&Tok::Ellipsis) {
                        self.pos += 1;
                        variadic = true;
                    } else {
                        params.push(self.ty()?);
                    }
                    if self.eat_punct(')') {
                        break;
                    }
                    self.expect_punct(',')?;
                }
            }
            explicit = Some(Signature {
                ret: ret.clone(),
                params,
                variadic,
            });
        }
        let callee = self.operand(&Type::Ptr, scope)?;
        self.expect_punct('(')?;
        let mut args = Vec::new();
        let mut arg_types = Vec::new();
        if !self.eat_punct(')') {
            loop {
                let ty = self.ty()?;
                self.skip_words(&["noundef", "signext", "zeroext"]);
                args.push(self.operand(&ty, scope)?);
                arg_types.push(ty);
                if self.eat_punct(')') {
                    break;
                }
                self.expect_punct(',')?;
            }
        }
        while self.eat_punct('#') {
            self.int()?;
        }
        let sig = explicit.unwrap_or(Signature {
            ret: ret.clone(),
            params: arg_types,
            variadic: false,
        });
        let result = (ret != Type::Void).then_some(ret);
        Ok((InstKind::Call { callee, sig, args }, result))
    }
}

/// Calls written without an explicit function type take the signature of
/// the callee when the module declares it.
fn fixup_call_signatures(module: &mut Module) {
    let sigs: HashMap<String, Signature> = module
        .functions
        .iter()
        .map(|f| (f.name.clone(), f.sig.clone()))
        .collect();
    for function in &mut module.functions {
        for inst in function.blocks.iter_mut().flat_map(|b| b.insts.iter_mut()) {
            if let InstKind::Call {
                callee: Operand::Global(name),
                sig,
                ..
            } = &mut inst.kind
                && let Some(declared) = sigs.get(name)
            {
                *sig = declared.clone();
            }
        }
    }
}

fn binop(word: &str) -> Option<BinOp> {
    Some(match word {
        "add" => BinOp::Add,
        "sub" => BinOp::Sub,
        "mul" => BinOp::Mul,
        "udiv" => BinOp::UDiv,
        "sdiv" => BinOp::SDiv,
        "urem" => BinOp::URem,
        "srem" => BinOp::SRem,
        "shl" => BinOp::Shl,
        "lshr" => BinOp::LShr,
        "ashr" => BinOp::AShr,
        "and" => BinOp::And,
        "or" => BinOp::Or,
        "xor" => BinOp::Xor,
        "fadd" => BinOp::FAdd,
        "fsub" => BinOp::FSub,
        "fmul" => BinOp::FMul,
        "fdiv" => BinOp::FDiv,
        "frem" => BinOp::FRem,
        _ => return None,
    })
}

fn castop(word: &str) -> Option<CastOp> {
    Some(match word {
        "trunc" => CastOp::Trunc,
        "zext" => CastOp::ZExt,
        "sext" => CastOp::SExt,
        "fptrunc" => CastOp::FpTrunc,
        "fpext" => CastOp::FpExt,
        "fptoui" => CastOp::FpToUi,
        "fptosi" => CastOp::FpToSi,
        "uitofp" => CastOp::UiToFp,
        "sitofp" => CastOp::SiToFp,
        "ptrtoint" => CastOp::PtrToInt,
        "inttoptr" => CastOp::IntToPtr,
        "bitcast" => CastOp::Bitcast,
        _ => return None,
    })
}

fn int_predicate(word: &str) -> Option<IntPredicate> {
    Some(match word {
        "eq" => IntPredicate::Eq,
        "ne" => IntPredicate::Ne,
        "ugt" => IntPredicate::Ugt,
        "uge" => IntPredicate::Uge,
        "ult" => IntPredicate::Ult,
        "ule" => IntPredicate::Ule,
        "sgt" => IntPredicate::Sgt,
        "sge" => IntPredicate::Sge,
        "slt" => IntPredicate::Slt,
        "sle" => IntPredicate::Sle,
        _ => return None,
    })
}

fn float_predicate(word: &str) -> Option<FloatPredicate> {
    Some(match word {
        "false" => FloatPredicate::False,
        "oeq" => FloatPredicate::Oeq,
        "ogt" => FloatPredicate::Ogt,
        "oge" => FloatPredicate::Oge,
        "olt" => FloatPredicate::Olt,
        "ole" => FloatPredicate::Ole,
        "one" => FloatPredicate::One,
        "ord" => FloatPredicate::Ord,
        "ueq" => FloatPredicate::Ueq,
        "ugt" => FloatPredicate::Ugt,
        "uge" => FloatPredicate::Uge,
        "ult" => FloatPredicate::Ult,
        "ule" => FloatPredicate::Ule,
        "une" => FloatPredicate::Une,
        "uno" => FloatPredicate::Uno,
        "true" => FloatPredicate::True,
        _ => return None,
    })
}

/// Parses a module from its textual form. `identifier` names the module
/// unless the text sets `source_filename`.
pub fn parse_module(src: &str, identifier: &str) -> Result<Module> {
    let toks = lex(src)?;
    Parser { toks, pos: 0 }.parse_module(identifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_loops_with_forward_references() {
        let src = r#"
define i32 @sum(i32 %n) {
entry:
  br label %loop
loop:
  %i = phi i32 [ 0, %entry ], [ %next, %loop ]
  %acc = phi i32 [ 0, %entry ], [ %acc.next, %loop ]
  %acc.next = add nsw i32 %acc, %i
  %next = add i32 %i, 1
  %done = icmp eq i32 %next, %n
  br i1 %done, label %exit, label %loop
exit:
  ret i32 %acc.next
}
"#;
        let module = parse_module(src, "sum").unwrap();
        let sum = module.function("sum").unwrap();
        assert_eq!(sum.blocks.len(), 3);
        assert_eq!(sum.blocks[1].name, "loop");
        assert_eq!(sum.value_types.len(), 6);
        assert!(matches!(
            sum.blocks[2].insts[0].kind,
            InstKind::Ret { value: Some(_) }
        ));
    }

    #[test]
    fn calls_take_declared_signatures() {
        let src = r#"
@fmt = private constant [4 x i8] c"%d\0A\00"
define i32 @main() {
  %r = call i32 (ptr, ...) @printf(ptr @fmt, i32 7)
  %s = call i32 @puts(ptr @fmt)
  ret i32 0
}
declare i32 @printf(ptr, ...)
declare i32 @puts(ptr)
"#;
        let module = parse_module(src, "calls").unwrap();
        assert_eq!(
            module.global("fmt").unwrap().init,
            Initializer::Bytes(b"%d\n\0".to_vec())
        );
        let main = module.function("main").unwrap();
        let InstKind::Call { sig, .. } = &main.blocks[0].insts[0].kind else {
            panic!("expected a call");
        };
        assert!(sig.variadic);
        assert!(module.function("puts").unwrap().is_declaration());
    }

    #[test]
    fn errors_name_the_line() {
        let src = "define i32 @f() {\nentry:\n  %x = frobnicate i32 1\n  ret i32 %x\n}\n";
        match parse_module(src, "bad") {
            Err(crate::Error::ParseIr { line, .. }) => assert_eq!(line, 3),
            other => panic!("unexpected {other:?}"),
        }
        let src = "define i32 @f() {\n  ret i32 %missing\n}\n";
        match parse_module(src, "bad") {
            Err(crate::Error::ParseIr { line, msg }) => {
                assert_eq!(line, 2);
                assert!(msg.contains("missing"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
