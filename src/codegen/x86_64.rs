//! A baseline x86-64 code generator.
//!
//! Every SSA value lives in its own 8-byte frame slot below `rbp`, and each
//! instruction loads its operands into scratch registers, computes, and
//! stores the result back. Integers narrower than 64 bits are kept
//! zero-extended in their slots. The output is an ELF relocatable object.

use crate::{
    Result,
    codegen::{CodeGenerator, OptLevel},
    error::codegen_error,
    ir::{
        BinOp, BlockId, CastOp, Function, InstKind, IntPredicate, Module, Operand, Type, ValueId,
    },
    memory::roundup,
};
use elf::abi::{R_X86_64_GOTPCREL, R_X86_64_PC32, R_X86_64_PLT32};
use hashbrown::HashMap;
use object::{
    Architecture, BinaryFormat, Endianness, RelocationFlags, SymbolFlags, SymbolKind, SymbolScope,
    write::{Object, Relocation, StandardSection, Symbol, SymbolId, SymbolSection},
};

/// Lowers integer and pointer code to x86-64 ELF objects.
///
/// Every value lives in a stack slot, so the optimization level only shows
/// up in the log.
pub struct X86_64CodeGen {
    triple: String,
}

impl X86_64CodeGen {
    pub fn new() -> Self {
        Self {
            triple: "x86_64-unknown-linux-gnu".into(),
        }
    }
}

impl Default for X86_64CodeGen {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R11 = 11,
}

const ARG_REGS: [Reg; 6] = [Reg::Rdi, Reg::Rsi, Reg::Rdx, Reg::Rcx, Reg::R8, Reg::R9];

// Condition codes for jcc/setcc.
const CC_E: u8 = 0x4;
const CC_NE: u8 = 0x5;

/// A relocation against a symbol, relative to the function start.
struct FuncReloc {
    offset: u64,
    r_type: u32,
    symbol: String,
    addend: i64,
}

struct Emitter<'a> {
    module: &'a Module,
    function: &'a Function,
    code: Vec<u8>,
    relocs: Vec<FuncReloc>,
    block_offsets: Vec<Option<usize>>,
    fixups: Vec<(usize, BlockId)>,
    allocas: HashMap<(usize, usize), i32>,
    frame_size: u32,
}

fn int_width(ty: &Type) -> Result<u32> {
    match ty {
        Type::Int(bits) if *bits <= 64 => Ok(*bits),
        Type::Ptr => Ok(64),
        other => Err(codegen_error(format!(
            "type {other} is not supported by the baseline x86_64 code generator"
        ))),
    }
}

#[inline]
fn slot(id: ValueId) -> i32 {
    -8 * (id.0 as i32 + 1)
}

impl<'a> Emitter<'a> {
    fn new(module: &'a Module, function: &'a Function) -> Result<Self> {
        if function.sig.variadic {
            return Err(codegen_error(format!(
                "[{}]: variadic definitions are not supported",
                function.name
            )));
        }
        for ty in &function.value_types {
            if *ty != Type::Void {
                int_width(ty)?;
            }
        }
        let mut cursor = 8 * function.value_types.len();
        let mut allocas = HashMap::new();
        for (b, block) in function.blocks.iter().enumerate() {
            for (i, inst) in block.insts.iter().enumerate() {
                if let InstKind::Alloca { ty, count } = &inst.kind {
                    let size = ty.store_size() * (*count).max(1) as usize;
                    cursor = roundup(cursor + size, ty.align().max(8));
                    allocas.insert((b, i), -(cursor as i32));
                }
            }
        }
        Ok(Self {
            module,
            function,
            code: Vec::new(),
            relocs: Vec::new(),
            block_offsets: vec![None; function.blocks.len()],
            fixups: Vec::new(),
            allocas,
            frame_size: roundup(cursor, 16) as u32,
        })
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    fn imm32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    fn rex(&mut self, reg: Reg, rm: Reg) {
        let r = (reg as u8 >> 3) & 1;
        let b = (rm as u8 >> 3) & 1;
        self.code.push(0x48 | (r << 2) | b);
    }

    /// `op reg, rm` with both operands registers.
    fn op_rr(&mut self, opcode: &[u8], reg: Reg, rm: Reg) {
        self.rex(reg, rm);
        self.bytes(opcode);
        self.code
            .push(0xc0 | ((reg as u8 & 7) << 3) | (rm as u8 & 7));
    }

    /// `op reg, [rbp + disp32]`.
    fn op_rbp(&mut self, opcode: u8, reg: Reg, disp: i32) {
        self.rex(reg, Reg::Rax);
        self.code.push(opcode);
        self.code.push(0x85 | ((reg as u8 & 7) << 3));
        self.imm32(disp);
    }

    /// A `/ext` group opcode applied to a register.
    fn op_ext(&mut self, opcode: u8, ext: u8, rm: Reg) {
        self.rex(Reg::Rax, rm);
        self.code.push(opcode);
        self.code.push(0xc0 | (ext << 3) | (rm as u8 & 7));
    }

    fn mov_from_slot(&mut self, reg: Reg, disp: i32) {
        self.op_rbp(0x8b, reg, disp);
    }

    fn mov_to_slot(&mut self, disp: i32, reg: Reg) {
        self.op_rbp(0x89, reg, disp);
    }

    fn mov_imm(&mut self, reg: Reg, imm: u64) {
        self.rex(Reg::Rax, reg);
        self.code.push(0xb8 + (reg as u8 & 7));
        self.code.extend_from_slice(&imm.to_le_bytes());
    }

    fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.op_rr(&[0x89], src, dst);
    }

    /// `op reg, [rip + symbol]` with a relocation on the displacement.
    fn rip_relative(&mut self, opcode: u8, reg: Reg, symbol: &str, r_type: u32) {
        self.rex(reg, Reg::Rax);
        self.code.push(opcode);
        self.code.push(0x05 | ((reg as u8 & 7) << 3));
        self.relocs.push(FuncReloc {
            offset: self.code.len() as u64,
            r_type,
            symbol: symbol.to_owned(),
            addend: -4,
        });
        self.imm32(0);
    }

    fn shift_imm(&mut self, ext: u8, reg: Reg, amount: u8) {
        self.op_ext(0xc1, ext, reg);
        self.code.push(amount);
    }

    /// Zero-extends the low `bits` of `reg`.
    fn canon(&mut self, reg: Reg, bits: u32) {
        if bits < 64 {
            self.shift_imm(4, reg, (64 - bits) as u8);
            self.shift_imm(5, reg, (64 - bits) as u8);
        }
    }

    /// Sign-extends the low `bits` of `reg`.
    fn sext(&mut self, reg: Reg, bits: u32) {
        if bits < 64 {
            self.shift_imm(4, reg, (64 - bits) as u8);
            self.shift_imm(7, reg, (64 - bits) as u8);
        }
    }

    fn load_operand(&mut self, reg: Reg, op: &Operand) -> Result<()> {
        match op {
            Operand::Value(id) => {
                if id.0 as usize >= self.function.value_types.len() {
                    return Err(codegen_error(format!(
                        "[{}]: use of unknown value {}",
                        self.function.name, id.0
                    )));
                }
                self.mov_from_slot(reg, slot(*id));
            }
            Operand::Int(int) if int.bits() <= 64 => self.mov_imm(reg, int.as_u64()),
            Operand::Null | Operand::Undef => self.mov_imm(reg, 0),
            Operand::Global(name) => {
                if self.module.defines(name) {
                    self.rip_relative(0x8d, reg, name, R_X86_64_PC32);
                } else {
                    self.rip_relative(0x8b, reg, name, R_X86_64_GOTPCREL);
                }
            }
            other => {
                return Err(codegen_error(format!(
                    "[{}]: operand {other:?} is not supported",
                    self.function.name
                )));
            }
        }
        Ok(())
    }

    fn store_result(&mut self, result: Option<ValueId>) {
        if let Some(id) = result {
            self.mov_to_slot(slot(id), Reg::Rax);
        }
    }

    fn jump(&mut self, dest: BlockId) {
        self.code.push(0xe9);
        self.fixups.push((self.code.len(), dest));
        self.imm32(0);
    }

    /// A forward conditional jump; returns where to patch its target.
    fn jcc_forward(&mut self, cc: u8) -> usize {
        self.bytes(&[0x0f, 0x80 | cc]);
        let pos = self.code.len();
        self.imm32(0);
        pos
    }

    fn patch_here(&mut self, pos: usize) {
        let rel = (self.code.len() - (pos + 4)) as i32;
        self.code[pos..pos + 4].copy_from_slice(&rel.to_le_bytes());
    }

    /// Copies the values flowing along `from -> to` into the phis of `to`.
    /// All sources are read before any phi is written.
    fn edge_copies(&mut self, from: BlockId, to: BlockId) -> Result<()> {
        let function = self.function;
        let Some(target) = function.block(to) else {
            return Err(codegen_error(format!(
                "[{}]: branch to missing block {}",
                function.name, to.0
            )));
        };
        let mut dests = Vec::new();
        for inst in &target.insts {
            let InstKind::Phi { incoming, .. } = &inst.kind else {
                break;
            };
            let Some((value, _)) = incoming.iter().find(|(_, block)| *block == from) else {
                return Err(codegen_error(format!(
                    "[{}]: phi in [{}] has no value for [{}]",
                    function.name,
                    target.name,
                    function.blocks[from.0 as usize].name
                )));
            };
            match value {
                // push qword [rbp + disp32]
                Operand::Value(id) => {
                    self.bytes(&[0xff, 0xb5]);
                    self.imm32(slot(*id));
                }
                other => {
                    self.load_operand(Reg::Rax, other)?;
                    self.code.push(0x50);
                }
            }
            if let Some(result) = inst.result {
                dests.push(result);
            }
        }
        for id in dests.into_iter().rev() {
            // pop qword [rbp + disp32]
            self.bytes(&[0x8f, 0x85]);
            self.imm32(slot(id));
        }
        Ok(())
    }

    fn prologue(&mut self) -> Result<()> {
        // push rbp; mov rbp, rsp
        self.bytes(&[0x55, 0x48, 0x89, 0xe5]);
        if self.frame_size > 0 {
            self.bytes(&[0x48, 0x81, 0xec]);
            self.imm32(self.frame_size as i32);
        }
        let params = self.function.sig.params.clone();
        for (i, ty) in params.iter().enumerate() {
            let bits = int_width(ty)?;
            if let Some(reg) = ARG_REGS.get(i) {
                self.mov_rr(Reg::Rax, *reg);
            } else {
                self.mov_from_slot(Reg::Rax, 16 + 8 * (i as i32 - 6));
            }
            self.canon(Reg::Rax, bits);
            self.mov_to_slot(slot(ValueId(i as u32)), Reg::Rax);
        }
        Ok(())
    }

    fn emit(mut self) -> Result<(Vec<u8>, Vec<FuncReloc>)> {
        self.prologue()?;
        let function = self.function;
        for (b, block) in function.blocks.iter().enumerate() {
            self.block_offsets[b] = Some(self.code.len());
            for (i, inst) in block.insts.iter().enumerate() {
                self.inst(BlockId(b as u32), (b, i), inst.result, &inst.kind)?;
            }
        }
        for (pos, block) in core::mem::take(&mut self.fixups) {
            let target = self.block_offsets[block.0 as usize].ok_or_else(|| {
                codegen_error(format!("[{}]: branch to missing block", function.name))
            })?;
            let rel = target as i64 - (pos as i64 + 4);
            self.code[pos..pos + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        Ok((self.code, self.relocs))
    }

    fn inst(
        &mut self,
        block: BlockId,
        at: (usize, usize),
        result: Option<ValueId>,
        kind: &InstKind,
    ) -> Result<()> {
        match kind {
            InstKind::Binary { op, ty, lhs, rhs } => {
                let bits = int_width(ty)?;
                self.load_operand(Reg::Rax, lhs)?;
                self.load_operand(Reg::Rcx, rhs)?;
                self.binary(*op, bits)?;
                self.canon(Reg::Rax, bits);
                self.store_result(result);
            }
            InstKind::ICmp { pred, ty, lhs, rhs } => {
                let bits = int_width(ty)?;
                self.load_operand(Reg::Rax, lhs)?;
                self.load_operand(Reg::Rcx, rhs)?;
                let cc = match pred {
                    IntPredicate::Eq => CC_E,
                    IntPredicate::Ne => CC_NE,
                    IntPredicate::Ugt => 0x7,
                    IntPredicate::Uge => 0x3,
                    IntPredicate::Ult => 0x2,
                    IntPredicate::Ule => 0x6,
                    IntPredicate::Sgt => 0xf,
                    IntPredicate::Sge => 0xd,
                    IntPredicate::Slt => 0xc,
                    IntPredicate::Sle => 0xe,
                };
                if matches!(
                    pred,
                    IntPredicate::Sgt | IntPredicate::Sge | IntPredicate::Slt | IntPredicate::Sle
                ) {
                    self.sext(Reg::Rax, bits);
                    self.sext(Reg::Rcx, bits);
                }
                // cmp rax, rcx; setcc al; movzx eax, al
                self.op_rr(&[0x39], Reg::Rcx, Reg::Rax);
                self.bytes(&[0x0f, 0x90 | cc, 0xc0, 0x0f, 0xb6, 0xc0]);
                self.store_result(result);
            }
            InstKind::Select {
                ty,
                cond,
                then,
                otherwise,
            } => {
                int_width(ty)?;
                self.load_operand(Reg::Rax, otherwise)?;
                self.load_operand(Reg::Rdx, then)?;
                self.load_operand(Reg::Rcx, cond)?;
                self.op_rr(&[0x85], Reg::Rcx, Reg::Rcx);
                // cmovne rax, rdx
                self.op_rr(&[0x0f, 0x45], Reg::Rax, Reg::Rdx);
                self.store_result(result);
            }
            InstKind::Cast {
                op,
                from,
                to,
                value,
            } => {
                let from_bits = int_width(from)?;
                let to_bits = int_width(to)?;
                self.load_operand(Reg::Rax, value)?;
                match op {
                    CastOp::Trunc | CastOp::PtrToInt => self.canon(Reg::Rax, to_bits),
                    CastOp::ZExt | CastOp::IntToPtr | CastOp::Bitcast => {}
                    CastOp::SExt => {
                        self.sext(Reg::Rax, from_bits);
                        self.canon(Reg::Rax, to_bits);
                    }
                    other => {
                        return Err(codegen_error(format!(
                            "[{}]: cast {other:?} is not supported",
                            self.function.name
                        )));
                    }
                }
                self.store_result(result);
            }
            InstKind::Alloca { .. } => {
                let disp = self.allocas.get(&at).copied().unwrap_or(0);
                self.op_rbp(0x8d, Reg::Rax, disp);
                self.store_result(result);
            }
            InstKind::Load { ty, ptr } => {
                let bits = int_width(ty)?;
                self.load_operand(Reg::Rax, ptr)?;
                match ty.store_size() {
                    1 => self.bytes(&[0x0f, 0xb6, 0x00]),
                    2 => self.bytes(&[0x0f, 0xb7, 0x00]),
                    4 => self.bytes(&[0x8b, 0x00]),
                    8 => self.bytes(&[0x48, 0x8b, 0x00]),
                    size => return Err(self.width_error(size)),
                }
                self.canon(Reg::Rax, bits);
                self.store_result(result);
            }
            InstKind::Store { ty, value, ptr } => {
                int_width(ty)?;
                self.load_operand(Reg::Rax, ptr)?;
                self.load_operand(Reg::Rcx, value)?;
                match ty.store_size() {
                    1 => self.bytes(&[0x88, 0x08]),
                    2 => self.bytes(&[0x66, 0x89, 0x08]),
                    4 => self.bytes(&[0x89, 0x08]),
                    8 => self.bytes(&[0x48, 0x89, 0x08]),
                    size => return Err(self.width_error(size)),
                }
            }
            InstKind::Gep {
                elem,
                ptr,
                index_ty,
                index,
            } => {
                let bits = int_width(index_ty)?;
                self.load_operand(Reg::Rcx, index)?;
                self.sext(Reg::Rcx, bits);
                self.mov_imm(Reg::Rdx, elem.store_size() as u64);
                self.op_rr(&[0x0f, 0xaf], Reg::Rcx, Reg::Rdx);
                self.load_operand(Reg::Rax, ptr)?;
                self.op_rr(&[0x01], Reg::Rcx, Reg::Rax);
                self.store_result(result);
            }
            InstKind::Call { callee, sig, args } => {
                if args.len() > ARG_REGS.len() {
                    return Err(codegen_error(format!(
                        "[{}]: calls with more than {} arguments are not supported",
                        self.function.name,
                        ARG_REGS.len()
                    )));
                }
                for (arg, reg) in args.iter().zip(ARG_REGS) {
                    self.load_operand(reg, arg)?;
                }
                let direct = match callee {
                    Operand::Global(name) => Some(name),
                    other => {
                        self.load_operand(Reg::R11, other)?;
                        None
                    }
                };
                if sig.variadic {
                    // No vector registers carry arguments.
                    self.bytes(&[0x31, 0xc0]);
                }
                match direct {
                    Some(name) => {
                        self.code.push(0xe8);
                        self.relocs.push(FuncReloc {
                            offset: self.code.len() as u64,
                            r_type: R_X86_64_PLT32,
                            symbol: name.clone(),
                            addend: -4,
                        });
                        self.imm32(0);
                    }
                    // call r11
                    None => self.bytes(&[0x41, 0xff, 0xd3]),
                }
                if result.is_some() {
                    self.canon(Reg::Rax, int_width(&sig.ret)?);
                }
                self.store_result(result);
            }
            InstKind::Phi { .. } => {}
            InstKind::Br { dest } => {
                self.edge_copies(block, *dest)?;
                self.jump(*dest);
            }
            InstKind::CondBr {
                cond,
                then,
                otherwise,
            } => {
                self.load_operand(Reg::Rax, cond)?;
                self.op_rr(&[0x85], Reg::Rax, Reg::Rax);
                let to_else = self.jcc_forward(CC_E);
                self.edge_copies(block, *then)?;
                self.jump(*then);
                self.patch_here(to_else);
                self.edge_copies(block, *otherwise)?;
                self.jump(*otherwise);
            }
            InstKind::Switch {
                ty,
                value,
                default,
                cases,
            } => {
                int_width(ty)?;
                for (case, dest) in cases {
                    self.load_operand(Reg::Rax, value)?;
                    self.mov_imm(Reg::Rcx, case.as_u64());
                    self.op_rr(&[0x39], Reg::Rcx, Reg::Rax);
                    let next = self.jcc_forward(CC_NE);
                    self.edge_copies(block, *dest)?;
                    self.jump(*dest);
                    self.patch_here(next);
                }
                self.edge_copies(block, *default)?;
                self.jump(*default);
            }
            InstKind::Ret { value } => {
                if let Some((_, value)) = value {
                    self.load_operand(Reg::Rax, value)?;
                }
                // leave; ret
                self.bytes(&[0xc9, 0xc3]);
            }
            // ud2
            InstKind::Unreachable => self.bytes(&[0x0f, 0x0b]),
            other => {
                return Err(codegen_error(format!(
                    "[{}]: {} is not supported by the baseline x86_64 code generator",
                    self.function.name,
                    inst_name(other)
                )));
            }
        }
        Ok(())
    }

    fn binary(&mut self, op: BinOp, bits: u32) -> Result<()> {
        match op {
            BinOp::Add => self.op_rr(&[0x01], Reg::Rcx, Reg::Rax),
            BinOp::Sub => self.op_rr(&[0x29], Reg::Rcx, Reg::Rax),
            BinOp::And => self.op_rr(&[0x21], Reg::Rcx, Reg::Rax),
            BinOp::Or => self.op_rr(&[0x09], Reg::Rcx, Reg::Rax),
            BinOp::Xor => self.op_rr(&[0x31], Reg::Rcx, Reg::Rax),
            BinOp::Mul => self.op_rr(&[0x0f, 0xaf], Reg::Rax, Reg::Rcx),
            BinOp::Shl => self.op_ext(0xd3, 4, Reg::Rax),
            BinOp::LShr => self.op_ext(0xd3, 5, Reg::Rax),
            BinOp::AShr => {
                self.sext(Reg::Rax, bits);
                self.op_ext(0xd3, 7, Reg::Rax);
            }
            BinOp::UDiv | BinOp::URem => {
                // xor edx, edx; div rcx
                self.bytes(&[0x31, 0xd2]);
                self.op_ext(0xf7, 6, Reg::Rcx);
                if op == BinOp::URem {
                    self.mov_rr(Reg::Rax, Reg::Rdx);
                }
            }
            BinOp::SDiv | BinOp::SRem => {
                self.sext(Reg::Rax, bits);
                self.sext(Reg::Rcx, bits);
                // cqo; idiv rcx
                self.bytes(&[0x48, 0x99]);
                self.op_ext(0xf7, 7, Reg::Rcx);
                if op == BinOp::SRem {
                    self.mov_rr(Reg::Rax, Reg::Rdx);
                }
            }
            other => {
                return Err(codegen_error(format!(
                    "[{}]: floating point operation {other:?} is not supported",
                    self.function.name
                )));
            }
        }
        Ok(())
    }

    #[cold]
    fn width_error(&self, size: usize) -> crate::Error {
        codegen_error(format!(
            "[{}]: memory access of {size} bytes is not supported",
            self.function.name
        ))
    }
}

fn inst_name(kind: &InstKind) -> &'static str {
    match kind {
        InstKind::FCmp { .. } => "fcmp",
        InstKind::ExtractElement { .. } => "extractelement",
        InstKind::InsertElement { .. } => "insertelement",
        InstKind::VaStart => "va_start",
        InstKind::VaArg { .. } => "va_arg",
        _ => "this instruction",
    }
}

struct SymbolTable {
    ids: HashMap<String, SymbolId>,
}

impl SymbolTable {
    fn get_or_add(&mut self, obj: &mut Object<'_>, name: &str, kind: SymbolKind) -> SymbolId {
        if let Some(id) = self.ids.get(name) {
            return *id;
        }
        let id = obj.add_symbol(Symbol {
            name: name.as_bytes().to_vec(),
            value: 0,
            size: 0,
            kind,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Undefined,
            flags: SymbolFlags::None,
        });
        self.ids.insert(name.to_owned(), id);
        id
    }
}

impl CodeGenerator for X86_64CodeGen {
    fn target_triple(&self) -> &str {
        &self.triple
    }

    fn emit_object(&self, module: &Module, _opt_level: OptLevel) -> Result<Vec<u8>> {
        #[cfg(feature = "log")]
        log::debug!(
            "[{}] emitting x86_64 object at {:?}",
            module.identifier,
            _opt_level
        );
        let mut obj = Object::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let mut symbols = SymbolTable {
            ids: HashMap::new(),
        };

        for global in &module.globals {
            let sym = symbols.get_or_add(&mut obj, &global.name, SymbolKind::Data);
            let section = obj.section_id(if global.constant {
                StandardSection::ReadOnlyData
            } else {
                StandardSection::Data
            });
            obj.add_symbol_data(sym, section, &global.init.to_bytes(), global.init.align() as u64);
        }

        let text = obj.section_id(StandardSection::Text);
        for function in &module.functions {
            let sym = symbols.get_or_add(&mut obj, &function.name, SymbolKind::Text);
            if function.is_declaration() {
                continue;
            }
            let (code, relocs) = Emitter::new(module, function)?.emit()?;
            let offset = obj.add_symbol_data(sym, text, &code, 16);
            for reloc in relocs {
                let kind = if module.global(&reloc.symbol).is_some() {
                    SymbolKind::Data
                } else {
                    SymbolKind::Unknown
                };
                let symbol = symbols.get_or_add(&mut obj, &reloc.symbol, kind);
                obj.add_relocation(
                    text,
                    Relocation {
                        offset: offset + reloc.offset,
                        symbol,
                        addend: reloc.addend,
                        flags: RelocationFlags::Elf {
                            r_type: reloc.r_type,
                        },
                    },
                )
                .map_err(|err| codegen_error(format!("[{}]: {err}", function.name)))?;
            }
            #[cfg(feature = "log")]
            log::trace!(
                "[{}] function [{}] at offset {:#x}, {} bytes",
                module.identifier,
                function.name,
                offset,
                code.len()
            );
        }

        obj.write()
            .map_err(|err| codegen_error(format!("[{}]: {err}", module.identifier)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ObjectBuffer, ObjectImage, image::ObjectFormat, ir::parse_module};

    #[test]
    fn emits_relocatable_elf() {
        let module = parse_module(
            r#"
@counter = global i32 0
declare i32 @puts(ptr)
define i32 @bump(i32 %x) {
entry:
  %old = load i32, ptr @counter
  %new = add i32 %old, %x
  store i32 %new, ptr @counter
  %r = call i32 @puts(ptr @counter)
  ret i32 %new
}
"#,
            "bump",
        )
        .unwrap();
        let bytes = X86_64CodeGen::new()
            .emit_object(&module, OptLevel::Default)
            .unwrap();
        let image = ObjectImage::parse(ObjectBuffer::new("bump.o", bytes)).unwrap();
        assert_eq!(image.format(), ObjectFormat::Elf);
        let kinds: Vec<_> = image.relocations().iter().map(|r| r.kind).collect();
        assert!(kinds.contains(&crate::relocation::RelocKind::Elf(R_X86_64_PC32)));
        assert!(kinds.contains(&crate::relocation::RelocKind::Elf(R_X86_64_PLT32)));
    }

    #[test]
    fn rejects_floating_point() {
        let module = parse_module(
            "define double @half(double %x) {\n  %r = fmul double %x, 0.5\n  ret double %r\n}\n",
            "half",
        )
        .unwrap();
        let err = X86_64CodeGen::new()
            .emit_object(&module, OptLevel::None)
            .unwrap_err();
        assert!(matches!(err, crate::Error::Codegen { .. }));
    }
}
