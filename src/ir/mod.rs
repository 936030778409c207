//! A small SSA intermediate representation.
//!
//! Functions are lists of basic blocks; every instruction that produces a
//! value names it with a [`ValueId`]. Parameters take the first ids. The IR
//! is what the code generator lowers and what the interpreter walks.

mod builder;
mod parser;

pub use builder::FunctionBuilder;
pub use parser::parse_module;

use crate::value::IntValue;
use core::fmt::Display;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Type {
    Void,
    /// An integer of 1 to 128 bits.
    Int(u32),
    Float,
    Double,
    Ptr,
    /// A fixed-length vector of scalars.
    Vector(u32, Box<Type>),
}

impl Type {
    pub const I1: Type = Type::Int(1);
    pub const I8: Type = Type::Int(8);
    pub const I16: Type = Type::Int(16);
    pub const I32: Type = Type::Int(32);
    pub const I64: Type = Type::Int(64);

    /// Bytes the type occupies in memory.
    pub fn store_size(&self) -> usize {
        match self {
            Type::Void => 0,
            Type::Int(bits) => (*bits as usize).div_ceil(8),
            Type::Float => 4,
            Type::Double => 8,
            Type::Ptr => core::mem::size_of::<usize>(),
            Type::Vector(len, elem) => *len as usize * elem.store_size(),
        }
    }

    pub fn align(&self) -> usize {
        match self {
            Type::Vector(_, elem) => elem.align(),
            other => other.store_size().next_power_of_two().clamp(1, 16),
        }
    }

    #[inline]
    pub fn is_int(&self) -> bool {
        matches!(self, Type::Int(_))
    }

    #[inline]
    pub fn is_float(&self) -> bool {
        matches!(self, Type::Float | Type::Double)
    }

    pub fn int_bits(&self) -> Option<u32> {
        match self {
            Type::Int(bits) => Some(*bits),
            _ => None,
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Type::Void => f.write_str("void"),
            Type::Int(bits) => write!(f, "i{bits}"),
            Type::Float => f.write_str("float"),
            Type::Double => f.write_str("double"),
            Type::Ptr => f.write_str("ptr"),
            Type::Vector(len, elem) => write!(f, "<{len} x {elem}>"),
        }
    }
}

/// A function type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    pub ret: Type,
    pub params: Vec<Type>,
    pub variadic: bool,
}

impl Signature {
    pub fn new(ret: Type, params: Vec<Type>) -> Self {
        Self {
            ret,
            params,
            variadic: false,
        }
    }

    pub fn variadic(ret: Type, params: Vec<Type>) -> Self {
        Self {
            ret,
            params,
            variadic: true,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ValueId(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(pub u32);

#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Value(ValueId),
    Int(IntValue),
    Float(f32),
    Double(f64),
    Null,
    Undef,
    /// Address of a global variable or function.
    Global(String),
}

impl Operand {
    #[inline]
    pub fn int(bits: u32, value: i64) -> Self {
        Operand::Int(IntValue::from_i64(bits, value))
    }

    #[inline]
    pub fn global(name: impl Into<String>) -> Self {
        Operand::Global(name.into())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    UDiv,
    SDiv,
    URem,
    SRem,
    Shl,
    LShr,
    AShr,
    And,
    Or,
    Xor,
    FAdd,
    FSub,
    FMul,
    FDiv,
    FRem,
}

impl BinOp {
    pub fn is_float(self) -> bool {
        matches!(
            self,
            BinOp::FAdd | BinOp::FSub | BinOp::FMul | BinOp::FDiv | BinOp::FRem
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntPredicate {
    Eq,
    Ne,
    Ugt,
    Uge,
    Ult,
    Ule,
    Sgt,
    Sge,
    Slt,
    Sle,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FloatPredicate {
    False,
    Oeq,
    Ogt,
    Oge,
    Olt,
    Ole,
    One,
    Ord,
    Ueq,
    Ugt,
    Uge,
    Ult,
    Ule,
    Une,
    Uno,
    True,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CastOp {
    Trunc,
    ZExt,
    SExt,
    FpTrunc,
    FpExt,
    FpToUi,
    FpToSi,
    UiToFp,
    SiToFp,
    PtrToInt,
    IntToPtr,
    Bitcast,
}

#[derive(Clone, Debug, PartialEq)]
pub enum InstKind {
    Binary {
        op: BinOp,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    },
    ICmp {
        pred: IntPredicate,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    },
    FCmp {
        pred: FloatPredicate,
        ty: Type,
        lhs: Operand,
        rhs: Operand,
    },
    Select {
        ty: Type,
        cond: Operand,
        then: Operand,
        otherwise: Operand,
    },
    Cast {
        op: CastOp,
        from: Type,
        to: Type,
        value: Operand,
    },
    /// Stack memory for `count` values of `ty`, released on return.
    Alloca { ty: Type, count: u32 },
    Load { ty: Type, ptr: Operand },
    Store { ty: Type, value: Operand, ptr: Operand },
    /// `ptr + index * size_of(elem)`.
    Gep {
        elem: Type,
        ptr: Operand,
        index_ty: Type,
        index: Operand,
    },
    Call {
        callee: Operand,
        sig: Signature,
        args: Vec<Operand>,
    },
    Phi {
        ty: Type,
        incoming: Vec<(Operand, BlockId)>,
    },
    ExtractElement {
        ty: Type,
        vector: Operand,
        index: Operand,
    },
    InsertElement {
        ty: Type,
        vector: Operand,
        element: Operand,
        index: Operand,
    },
    /// Starts reading the variadic arguments of the current function.
    VaStart,
    /// Reads the next variadic argument from the list started by `list`
    /// and advances it.
    VaArg { list: ValueId, ty: Type },
    Br { dest: BlockId },
    CondBr {
        cond: Operand,
        then: BlockId,
        otherwise: BlockId,
    },
    Switch {
        ty: Type,
        value: Operand,
        default: BlockId,
        cases: Vec<(IntValue, BlockId)>,
    },
    Ret { value: Option<(Type, Operand)> },
    Unreachable,
}

impl InstKind {
    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            InstKind::Br { .. }
                | InstKind::CondBr { .. }
                | InstKind::Switch { .. }
                | InstKind::Ret { .. }
                | InstKind::Unreachable
        )
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Inst {
    pub result: Option<ValueId>,
    pub kind: InstKind,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Block {
    pub name: String,
    pub insts: Vec<Inst>,
}

/// A function definition, or a declaration when it has no blocks.
#[derive(Clone, Debug, PartialEq)]
pub struct Function {
    pub name: String,
    pub sig: Signature,
    pub blocks: Vec<Block>,
    /// Type of every value id, parameters first.
    pub value_types: Vec<Type>,
}

impl Function {
    pub fn declare(name: impl Into<String>, sig: Signature) -> Self {
        Self {
            name: name.into(),
            value_types: sig.params.clone(),
            sig,
            blocks: Vec::new(),
        }
    }

    #[inline]
    pub fn is_declaration(&self) -> bool {
        self.blocks.is_empty()
    }

    #[inline]
    pub fn param(&self, index: usize) -> ValueId {
        ValueId(index as u32)
    }

    #[inline]
    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.0 as usize)
    }

    #[inline]
    pub fn value_type(&self, id: ValueId) -> Option<&Type> {
        self.value_types.get(id.0 as usize)
    }
}

/// Initial contents of a global variable.
#[derive(Clone, Debug, PartialEq)]
pub enum Initializer {
    Zero(Type),
    Int(IntValue),
    Float(f32),
    Double(f64),
    Bytes(Vec<u8>),
}

impl Initializer {
    pub fn size(&self) -> usize {
        match self {
            Initializer::Zero(ty) => ty.store_size(),
            Initializer::Int(int) => (int.bits() as usize).div_ceil(8),
            Initializer::Float(_) => 4,
            Initializer::Double(_) => 8,
            Initializer::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn align(&self) -> usize {
        match self {
            Initializer::Bytes(_) => 1,
            _ => self.size().next_power_of_two().clamp(1, 16),
        }
    }

    /// The initializer laid out in little-endian memory order.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Initializer::Zero(ty) => vec![0; ty.store_size()],
            Initializer::Int(int) => int.zext().to_le_bytes()[..self.size()].to_vec(),
            Initializer::Float(v) => v.to_le_bytes().to_vec(),
            Initializer::Double(v) => v.to_le_bytes().to_vec(),
            Initializer::Bytes(bytes) => bytes.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Global {
    pub name: String,
    pub init: Initializer,
    pub constant: bool,
}

/// A unit of code compiled and loaded as one object.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Module {
    pub identifier: String,
    pub functions: Vec<Function>,
    pub globals: Vec<Global>,
}

impl Module {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    pub fn add_function(&mut self, function: Function) {
        self.functions.push(function);
    }

    pub fn add_global(&mut self, global: Global) {
        self.globals.push(global);
    }

    pub fn function(&self, name: &str) -> Option<&Function> {
        self.functions.iter().find(|f| f.name == name)
    }

    pub fn global(&self, name: &str) -> Option<&Global> {
        self.globals.iter().find(|g| g.name == name)
    }

    /// Whether `name` is defined (not just declared) by this module.
    pub fn defines(&self, name: &str) -> bool {
        self.global(name).is_some() || self.function(name).is_some_and(|f| !f.is_declaration())
    }
}
