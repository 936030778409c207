use super::{
    BinOp, Block, BlockId, CastOp, FloatPredicate, Function, Inst, InstKind, IntPredicate,
    Operand, Signature, Type, ValueId,
};
use crate::value::IntValue;

/// Builds a [`Function`] one instruction at a time.
///
/// ```rust
/// use rtdyld::ir::{FunctionBuilder, Signature, Type};
///
/// let mut b = FunctionBuilder::new("add2", Signature::new(Type::I32, vec![Type::I32, Type::I32]));
/// let entry = b.create_block("entry");
/// b.switch_to(entry);
/// let sum = b.add(Type::I32, b.param(0), b.param(1));
/// b.ret(Type::I32, sum);
/// let add2 = b.finish();
/// assert_eq!(add2.blocks.len(), 1);
/// ```
pub struct FunctionBuilder {
    function: Function,
    current: Option<BlockId>,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, sig: Signature) -> Self {
        Self {
            function: Function::declare(name, sig),
            current: None,
        }
    }

    pub fn param(&self, index: usize) -> Operand {
        Operand::Value(self.function.param(index))
    }

    pub fn create_block(&mut self, name: impl Into<String>) -> BlockId {
        let id = BlockId(self.function.blocks.len() as u32);
        self.function.blocks.push(Block {
            name: name.into(),
            insts: Vec::new(),
        });
        id
    }

    pub fn switch_to(&mut self, block: BlockId) {
        self.current = Some(block);
    }

    fn push(&mut self, result: Option<ValueId>, kind: InstKind) {
        let block = self.current.unwrap_or(BlockId(0));
        if self.function.blocks.is_empty() {
            self.create_block("entry");
        }
        self.function.blocks[block.0 as usize]
            .insts
            .push(Inst { result, kind });
    }

    fn value(&mut self, ty: Type, kind: InstKind) -> Operand {
        let id = ValueId(self.function.value_types.len() as u32);
        self.function.value_types.push(ty);
        self.push(Some(id), kind);
        Operand::Value(id)
    }

    pub fn binary(&mut self, op: BinOp, ty: Type, lhs: Operand, rhs: Operand) -> Operand {
        self.value(
            ty.clone(),
            InstKind::Binary {
                op,
                ty,
                lhs,
                rhs,
            },
        )
    }

    pub fn add(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> Operand {
        self.binary(BinOp::Add, ty, lhs, rhs)
    }

    pub fn sub(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> Operand {
        self.binary(BinOp::Sub, ty, lhs, rhs)
    }

    pub fn mul(&mut self, ty: Type, lhs: Operand, rhs: Operand) -> Operand {
        self.binary(BinOp::Mul, ty, lhs, rhs)
    }

    pub fn icmp(&mut self, pred: IntPredicate, ty: Type, lhs: Operand, rhs: Operand) -> Operand {
        let result = match &ty {
            Type::Vector(len, _) => Type::Vector(*len, Box::new(Type::I1)),
            _ => Type::I1,
        };
        self.value(
            result,
            InstKind::ICmp {
                pred,
                ty,
                lhs,
                rhs,
            },
        )
    }

    pub fn fcmp(&mut self, pred: FloatPredicate, ty: Type, lhs: Operand, rhs: Operand) -> Operand {
        self.value(
            Type::I1,
            InstKind::FCmp {
                pred,
                ty,
                lhs,
                rhs,
            },
        )
    }

    pub fn select(&mut self, ty: Type, cond: Operand, then: Operand, otherwise: Operand) -> Operand {
        self.value(
            ty.clone(),
            InstKind::Select {
                ty,
                cond,
                then,
                otherwise,
            },
        )
    }

    pub fn cast(&mut self, op: CastOp, from: Type, value: Operand, to: Type) -> Operand {
        self.value(
            to.clone(),
            InstKind::Cast {
                op,
                from,
                to,
                value,
            },
        )
    }

    pub fn alloca(&mut self, ty: Type, count: u32) -> Operand {
        self.value(Type::Ptr, InstKind::Alloca { ty, count })
    }

    pub fn load(&mut self, ty: Type, ptr: Operand) -> Operand {
        self.value(ty.clone(), InstKind::Load { ty, ptr })
    }

    pub fn store(&mut self, ty: Type, value: Operand, ptr: Operand) {
        self.push(None, InstKind::Store { ty, value, ptr });
    }

    pub fn gep(&mut self, elem: Type, ptr: Operand, index_ty: Type, index: Operand) -> Operand {
        self.value(
            Type::Ptr,
            InstKind::Gep {
                elem,
                ptr,
                index_ty,
                index,
            },
        )
    }

    /// Calls `callee`; returns `None` for `void` callees.
    pub fn call(&mut self, callee: Operand, sig: Signature, args: Vec<Operand>) -> Option<Operand> {
        let ret = sig.ret.clone();
        let kind = InstKind::Call { callee, sig, args };
        if ret == Type::Void {
            self.push(None, kind);
            None
        } else {
            Some(self.value(ret, kind))
        }
    }

    pub fn phi(&mut self, ty: Type, incoming: Vec<(Operand, BlockId)>) -> Operand {
        self.value(ty.clone(), InstKind::Phi { ty, incoming })
    }

    /// Adds an incoming edge to a phi created earlier, for loops whose
    /// back-edge values are built after the phi.
    pub fn add_incoming(&mut self, phi: &Operand, value: Operand, block: BlockId) {
        let Operand::Value(id) = phi else {
            return;
        };
        for inst in self.function.blocks.iter_mut().flat_map(|b| b.insts.iter_mut()) {
            if inst.result == Some(*id) {
                if let InstKind::Phi { incoming, .. } = &mut inst.kind {
                    incoming.push((value, block));
                }
                return;
            }
        }
    }

    pub fn extract_element(&mut self, ty: Type, vector: Operand, index: Operand) -> Operand {
        let elem = match &ty {
            Type::Vector(_, elem) => (**elem).clone(),
            other => other.clone(),
        };
        self.value(elem, InstKind::ExtractElement { ty, vector, index })
    }

    pub fn insert_element(
        &mut self,
        ty: Type,
        vector: Operand,
        element: Operand,
        index: Operand,
    ) -> Operand {
        self.value(
            ty.clone(),
            InstKind::InsertElement {
                ty,
                vector,
                element,
                index,
            },
        )
    }

    pub fn va_start(&mut self) -> Operand {
        self.value(Type::Ptr, InstKind::VaStart)
    }

    pub fn va_arg(&mut self, list: &Operand, ty: Type) -> Operand {
        let list = match list {
            Operand::Value(id) => *id,
            _ => ValueId(u32::MAX),
        };
        self.value(ty.clone(), InstKind::VaArg { list, ty })
    }

    pub fn br(&mut self, dest: BlockId) {
        self.push(None, InstKind::Br { dest });
    }

    pub fn cond_br(&mut self, cond: Operand, then: BlockId, otherwise: BlockId) {
        self.push(
            None,
            InstKind::CondBr {
                cond,
                then,
                otherwise,
            },
        );
    }

    pub fn switch(&mut self, ty: Type, value: Operand, default: BlockId, cases: Vec<(i64, BlockId)>) {
        let bits = ty.int_bits().unwrap_or(64);
        let cases = cases
            .into_iter()
            .map(|(v, block)| (IntValue::from_i64(bits, v), block))
            .collect();
        self.push(
            None,
            InstKind::Switch {
                ty,
                value,
                default,
                cases,
            },
        );
    }

    pub fn ret(&mut self, ty: Type, value: Operand) {
        self.push(
            None,
            InstKind::Ret {
                value: Some((ty, value)),
            },
        );
    }

    pub fn ret_void(&mut self) {
        self.push(None, InstKind::Ret { value: None });
    }

    pub fn unreachable(&mut self) {
        self.push(None, InstKind::Unreachable);
    }

    pub fn finish(self) -> Function {
        self.function
    }
}
