//! An engine that executes IR directly.
//!
//! Calls between module functions push an [`ExecutionContext`] on an
//! explicit stack instead of recursing on the host stack, so deep IR
//! recursion only costs heap memory.

mod ops;

use crate::{
    ObjectBuffer, Result, RuntimeDyld, SectionMemoryManager,
    engine::{EngineKind, EngineOptions, ExecutionEngine, marshal},
    error::{entry_point_error, fatal_error, unresolved_symbol},
    ir::{BlockId, Function, InstKind, Module, Operand, Signature, Type, ValueId},
    os::host_symbol,
    relocation::SymbolLookup,
    value::{GenericValue, IntValue, load_from_memory, store_to_memory},
};
use hashbrown::HashMap;
use std::{ffi::CStr, io::Write, rc::Rc, sync::Arc};

/// A host function callable from interpreted code.
pub type HostFunction = Box<dyn Fn(&[GenericValue]) -> Result<GenericValue>>;

/// Zeroed, 16-byte aligned memory.
struct Allocation(Box<[u128]>);

impl Allocation {
    fn new(size: usize) -> Self {
        Allocation(vec![0u128; size.div_ceil(16).max(1)].into_boxed_slice())
    }

    #[inline]
    fn addr(&self) -> usize {
        self.0.as_ptr() as usize
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.0.as_mut_ptr() as *mut u8
    }
}

/// One activation of an interpreted function.
pub struct ExecutionContext {
    function: usize,
    block: BlockId,
    inst: usize,
    values: Vec<GenericValue>,
    var_args: Vec<GenericValue>,
    /// Where the caller wants the return value.
    caller: Option<ValueId>,
    /// Stack memory of the activation, released when it returns.
    allocas: Vec<Allocation>,
}

impl ExecutionContext {
    pub fn function_index(&self) -> usize {
        self.function
    }

    pub fn block(&self) -> BlockId {
        self.block
    }

    pub fn var_args(&self) -> &[GenericValue] {
        &self.var_args
    }
}

enum Flow {
    Continue,
    Return(GenericValue),
    Exit(i32),
}

enum Called {
    Value(GenericValue),
    Pushed,
    Exit(i32),
}

/// Interprets the functions of one module.
pub struct Interpreter {
    module: Rc<Module>,
    globals: HashMap<String, Allocation>,
    /// One byte per function; the address of byte `i` stands for function `i`.
    function_tags: Box<[u8]>,
    host_functions: HashMap<String, HostFunction>,
    lookup: Arc<dyn SymbolLookup>,
    dyld: Option<RuntimeDyld>,
    stack: Vec<ExecutionContext>,
}

const BUILTINS: [&str; 4] = ["putchar", "puts", "exit", "abort"];

impl Interpreter {
    pub fn new(module: Module, options: EngineOptions) -> Result<Self> {
        let mut globals = HashMap::new();
        for global in &module.globals {
            let bytes = global.init.to_bytes();
            let mut memory = Allocation::new(bytes.len());
            // SAFETY: the allocation holds at least `bytes.len()` bytes.
            unsafe {
                core::ptr::copy_nonoverlapping(bytes.as_ptr(), memory.as_mut_ptr(), bytes.len())
            };
            #[cfg(feature = "log")]
            log::trace!(
                "global [{}] at [{:#x}], {} bytes",
                global.name,
                memory.addr(),
                bytes.len()
            );
            globals.insert(global.name.clone(), memory);
        }
        Ok(Self {
            function_tags: vec![0u8; module.functions.len().max(1)].into_boxed_slice(),
            module: Rc::new(module),
            globals,
            host_functions: HashMap::new(),
            lookup: options.symbol_lookup.unwrap_or_else(|| Arc::new(())),
            dyld: None,
            stack: Vec::new(),
        })
    }

    /// Makes `name` callable from interpreted code, ahead of the built-ins
    /// and the host process.
    pub fn register_host_function(
        &mut self,
        name: impl Into<String>,
        function: impl Fn(&[GenericValue]) -> Result<GenericValue> + 'static,
    ) {
        self.host_functions.insert(name.into(), Box::new(function));
    }

    /// Activations of the current run, innermost last.
    pub fn stack(&self) -> &[ExecutionContext] {
        &self.stack
    }

    fn function_index(&self, name: &str) -> Option<usize> {
        self.module.functions.iter().position(|f| f.name == name)
    }

    fn is_interpreted(&self, function: &Function) -> bool {
        !function.is_declaration()
            || self.host_functions.contains_key(&function.name)
            || BUILTINS.contains(&function.name.as_str())
    }

    fn native_address(&self, name: &str) -> Result<u64> {
        if let Some(dyld) = &self.dyld {
            let mangled = format!("{}{name}", dyld.format().map_or("", |f| f.global_prefix()));
            if let Some(addr) = dyld.get_symbol_load_address(&mangled) {
                return Ok(addr);
            }
        }
        self.lookup
            .lookup(name)
            .or_else(|| host_symbol(name))
            .map(|addr| addr as u64)
            .ok_or_else(|| unresolved_symbol(name))
    }

    fn global_address(&self, name: &str) -> Result<usize> {
        if let Some(memory) = self.globals.get(name) {
            return Ok(memory.addr());
        }
        if let Some(index) = self.function_index(name)
            && self.is_interpreted(&self.module.functions[index])
        {
            return Ok(self.function_tags.as_ptr() as usize + index);
        }
        Ok(self.native_address(name)? as usize)
    }

    fn frame(&self) -> Result<&ExecutionContext> {
        self.stack
            .last()
            .ok_or_else(|| fatal_error("the interpreter stack is empty"))
    }

    fn frame_mut(&mut self) -> Result<&mut ExecutionContext> {
        self.stack
            .last_mut()
            .ok_or_else(|| fatal_error("the interpreter stack is empty"))
    }

    /// Evaluates an operand; `ty` is unknown for variadic arguments.
    fn operand(&self, op: &Operand, ty: Option<&Type>) -> Result<GenericValue> {
        Ok(match (op, ty) {
            (Operand::Value(id), _) => self
                .frame()?
                .values
                .get(id.0 as usize)
                .cloned()
                .ok_or_else(|| fatal_error(format!("use of unknown value {}", id.0)))?,
            (Operand::Int(int), Some(Type::Int(bits))) => {
                GenericValue::Int(IntValue::new(*bits, int.zext()))
            }
            (Operand::Int(int), Some(Type::Ptr)) => GenericValue::Pointer(int.as_u64() as usize),
            (Operand::Int(int), _) => GenericValue::Int(*int),
            (Operand::Float(v), Some(Type::Double)) => GenericValue::Double(*v as f64),
            (Operand::Float(v), _) => GenericValue::Float(*v),
            (Operand::Double(v), Some(Type::Float)) => GenericValue::Float(*v as f32),
            (Operand::Double(v), _) => GenericValue::Double(*v),
            (Operand::Null, _) => GenericValue::Pointer(0),
            (Operand::Undef, Some(ty)) => GenericValue::zero(ty),
            (Operand::Undef, None) => GenericValue::default(),
            (Operand::Global(name), _) => GenericValue::Pointer(self.global_address(name)?),
        })
    }

    fn set(&mut self, result: Option<ValueId>, value: GenericValue) -> Result<()> {
        if let Some(id) = result {
            let frame = self.frame_mut()?;
            let slot = frame
                .values
                .get_mut(id.0 as usize)
                .ok_or_else(|| fatal_error(format!("definition of unknown value {}", id.0)))?;
            *slot = value;
        }
        Ok(())
    }

    fn push_frame(
        &mut self,
        index: usize,
        args: Vec<GenericValue>,
        caller: Option<ValueId>,
    ) -> Result<()> {
        let module = Rc::clone(&self.module);
        let function = &module.functions[index];
        marshal::check_args(&function.name, &function.sig, &args)?;
        let fixed = function.sig.params.len();
        let mut values: Vec<_> = function.value_types.iter().map(GenericValue::zero).collect();
        let mut args = args;
        let var_args = args.split_off(fixed);
        for (slot, arg) in values.iter_mut().zip(args) {
            *slot = arg;
        }
        self.stack.push(ExecutionContext {
            function: index,
            block: BlockId(0),
            inst: 0,
            values,
            var_args,
            caller,
            allocas: Vec::new(),
        });
        Ok(())
    }

    /// Runs until the activation at the bottom of the stack returns.
    fn execute(&mut self) -> Result<GenericValue> {
        loop {
            match self.step()? {
                Flow::Continue => {}
                Flow::Return(value) => {
                    let frame = self
                        .stack
                        .pop()
                        .ok_or_else(|| fatal_error("return from an empty stack"))?;
                    if self.stack.is_empty() {
                        return Ok(value);
                    }
                    self.set(frame.caller, value)?;
                }
                Flow::Exit(code) => {
                    self.stack.clear();
                    return Ok(GenericValue::Int(IntValue::from_i64(32, code as i64)));
                }
            }
        }
    }

    /// Moves to `to`, assigning its phis from the values of the current
    /// frame all at once.
    fn enter_block(&mut self, to: BlockId) -> Result<Flow> {
        let module = Rc::clone(&self.module);
        let frame = self.frame()?;
        let from = frame.block;
        let function = &module.functions[frame.function];
        let block = function.block(to).ok_or_else(|| {
            fatal_error(format!("[{}]: branch to missing block {}", function.name, to.0))
        })?;
        let mut assignments = Vec::new();
        for inst in &block.insts {
            let InstKind::Phi { ty, incoming } = &inst.kind else {
                break;
            };
            let (value, _) = incoming.iter().find(|(_, b)| *b == from).ok_or_else(|| {
                fatal_error(format!(
                    "[{}]: phi in [{}] has no value for [{}]",
                    function.name, block.name, function.blocks[from.0 as usize].name
                ))
            })?;
            assignments.push((inst.result, self.operand(value, Some(ty))?));
        }
        let skip = assignments.len();
        for (result, value) in assignments {
            self.set(result, value)?;
        }
        let frame = self.frame_mut()?;
        frame.block = to;
        frame.inst = skip;
        Ok(Flow::Continue)
    }

    fn step(&mut self) -> Result<Flow> {
        let module = Rc::clone(&self.module);
        let frame = self.frame_mut()?;
        let function = &module.functions[frame.function];
        let inst = function
            .block(frame.block)
            .and_then(|block| block.insts.get(frame.inst))
            .ok_or_else(|| {
                fatal_error(format!(
                    "[{}]: execution fell off the end of a block",
                    function.name
                ))
            })?;
        frame.inst += 1;
        let result = inst.result;
        match &inst.kind {
            InstKind::Binary { op, ty, lhs, rhs } => {
                let value = ops::binary(
                    *op,
                    ty,
                    &self.operand(lhs, Some(ty))?,
                    &self.operand(rhs, Some(ty))?,
                )?;
                self.set(result, value)?;
            }
            InstKind::ICmp { pred, ty, lhs, rhs } => {
                let value = ops::icmp(
                    *pred,
                    ty,
                    &self.operand(lhs, Some(ty))?,
                    &self.operand(rhs, Some(ty))?,
                )?;
                self.set(result, value)?;
            }
            InstKind::FCmp { pred, ty, lhs, rhs } => {
                let value = ops::fcmp(
                    *pred,
                    ty,
                    &self.operand(lhs, Some(ty))?,
                    &self.operand(rhs, Some(ty))?,
                )?;
                self.set(result, value)?;
            }
            InstKind::Select {
                ty,
                cond,
                then,
                otherwise,
            } => {
                let cond = self.operand(cond, Some(&Type::I1))?;
                let then = self.operand(then, Some(ty))?;
                let otherwise = self.operand(otherwise, Some(ty))?;
                let value = match (cond, then, otherwise) {
                    (GenericValue::Aggregate(c), GenericValue::Aggregate(t), GenericValue::Aggregate(o)) => {
                        GenericValue::Aggregate(
                            c.iter()
                                .zip(t.into_iter().zip(o))
                                .map(|(c, (t, o))| if is_true(c) { t } else { o })
                                .collect(),
                        )
                    }
                    (c, t, o) => {
                        if is_true(&c) {
                            t
                        } else {
                            o
                        }
                    }
                };
                self.set(result, value)?;
            }
            InstKind::Cast {
                op,
                from,
                to,
                value,
            } => {
                let value = ops::cast(*op, from, to, &self.operand(value, Some(from))?)?;
                self.set(result, value)?;
            }
            InstKind::Alloca { ty, count } => {
                let memory = Allocation::new(ty.store_size() * (*count).max(1) as usize);
                let addr = memory.addr();
                self.frame_mut()?.allocas.push(memory);
                self.set(result, GenericValue::Pointer(addr))?;
            }
            InstKind::Load { ty, ptr } => {
                let addr = self.pointer(ptr)?;
                // SAFETY: interpreted code only reaches memory it was given.
                let value = unsafe { load_from_memory(addr as *const u8, ty)? };
                self.set(result, value)?;
            }
            InstKind::Store { ty, value, ptr } => {
                let value = self.operand(value, Some(ty))?;
                let addr = self.pointer(ptr)?;
                // SAFETY: as for loads.
                unsafe { store_to_memory(&value, addr as *mut u8, ty)? };
            }
            InstKind::Gep {
                elem,
                ptr,
                index_ty,
                index,
            } => {
                let base = match self.operand(ptr, Some(&Type::Ptr))? {
                    GenericValue::Pointer(addr) => addr,
                    other => return Err(fatal_error(format!("{other:?} is not a pointer"))),
                };
                let index = match self.operand(index, Some(index_ty))? {
                    GenericValue::Int(int) => int.sext() as i64,
                    other => return Err(fatal_error(format!("{other:?} is not an index"))),
                };
                let offset = index.wrapping_mul(elem.store_size() as i64);
                self.set(result, GenericValue::Pointer(base.wrapping_add_signed(offset as isize)))?;
            }
            InstKind::Call { callee, sig, args } => {
                let mut values = Vec::with_capacity(args.len());
                for (i, arg) in args.iter().enumerate() {
                    values.push(self.operand(arg, sig.params.get(i))?);
                }
                match self.call(callee, sig, values, result)? {
                    Called::Value(value) => {
                        if sig.ret != Type::Void {
                            self.set(result, value)?;
                        }
                    }
                    Called::Pushed => {}
                    Called::Exit(code) => return Ok(Flow::Exit(code)),
                }
            }
            InstKind::Phi { .. } => {}
            InstKind::ExtractElement { ty, vector, index } => {
                let vector = self.operand(vector, Some(ty))?;
                let index = self.operand(index, Some(&Type::I32))?;
                let elem = match ty {
                    Type::Vector(_, elem) => (**elem).clone(),
                    other => other.clone(),
                };
                let value = match (&vector, index.as_u64()) {
                    (GenericValue::Aggregate(elems), Some(i)) => elems
                        .get(i as usize)
                        .cloned()
                        .unwrap_or_else(|| GenericValue::zero(&elem)),
                    _ => return Err(fatal_error(format!("{vector:?} is not a vector"))),
                };
                self.set(result, value)?;
            }
            InstKind::InsertElement {
                ty,
                vector,
                element,
                index,
            } => {
                let elem_ty = match ty {
                    Type::Vector(_, elem) => Some(&**elem),
                    _ => None,
                };
                let mut vector = self.operand(vector, Some(ty))?;
                let element = self.operand(element, elem_ty)?;
                let index = self.operand(index, Some(&Type::I32))?;
                if let (GenericValue::Aggregate(elems), Some(i)) = (&mut vector, index.as_u64())
                    && let Some(slot) = elems.get_mut(i as usize)
                {
                    *slot = element;
                }
                self.set(result, vector)?;
            }
            InstKind::VaStart => {
                let depth = self.stack.len() - 1;
                self.set(result, GenericValue::VaList { depth, index: 0 })?;
            }
            InstKind::VaArg { list, ty } => {
                let (depth, index) = match self.operand(&Operand::Value(*list), None)? {
                    GenericValue::VaList { depth, index } => (depth, index),
                    other => return Err(fatal_error(format!("{other:?} is not a va_list"))),
                };
                let arg = self
                    .stack
                    .get(depth)
                    .and_then(|frame| frame.var_args.get(index))
                    .cloned()
                    .ok_or_else(|| fatal_error("va_arg read past the last variadic argument"))?;
                let value = match (ty, arg) {
                    (Type::Float, GenericValue::Double(v)) => GenericValue::Float(v as f32),
                    (Type::Int(bits), GenericValue::Int(int)) => {
                        GenericValue::Int(IntValue::new(*bits, int.zext()))
                    }
                    (_, arg) => arg,
                };
                self.set(Some(*list), GenericValue::VaList {
                    depth,
                    index: index + 1,
                })?;
                self.set(result, value)?;
            }
            InstKind::Br { dest } => return self.enter_block(*dest),
            InstKind::CondBr {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.operand(cond, Some(&Type::I1))?;
                return self.enter_block(if is_true(&cond) { *then } else { *otherwise });
            }
            InstKind::Switch {
                ty,
                value,
                default,
                cases,
            } => {
                let value = self.operand(value, Some(ty))?.as_u64();
                let dest = cases
                    .iter()
                    .find(|(case, _)| Some(case.as_u64()) == value)
                    .map_or(*default, |(_, dest)| *dest);
                return self.enter_block(dest);
            }
            InstKind::Ret { value } => {
                let value = match value {
                    Some((ty, value)) => self.operand(value, Some(ty))?,
                    None => GenericValue::default(),
                };
                return Ok(Flow::Return(value));
            }
            InstKind::Unreachable => {
                return Err(fatal_error(format!(
                    "[{}]: unreachable executed",
                    function.name
                )));
            }
        }
        Ok(Flow::Continue)
    }

    fn pointer(&self, op: &Operand) -> Result<usize> {
        match self.operand(op, Some(&Type::Ptr))? {
            GenericValue::Pointer(0) => Err(fatal_error("memory access through a null pointer")),
            GenericValue::Pointer(addr) => Ok(addr),
            other => Err(fatal_error(format!("{other:?} is not a pointer"))),
        }
    }

    fn call(
        &mut self,
        callee: &Operand,
        sig: &Signature,
        args: Vec<GenericValue>,
        result: Option<ValueId>,
    ) -> Result<Called> {
        let name = match callee {
            Operand::Global(name) => name.clone(),
            other => {
                let addr = match self.operand(other, Some(&Type::Ptr))? {
                    GenericValue::Pointer(addr) => addr,
                    other => return Err(fatal_error(format!("cannot call {other:?}"))),
                };
                let tags = self.function_tags.as_ptr() as usize;
                match addr.checked_sub(tags) {
                    Some(index) if index < self.module.functions.len() => {
                        self.module.functions[index].name.clone()
                    }
                    _ => {
                        marshal::check_args("<indirect>", sig, &args)?;
                        // SAFETY: the pointer came from native code of type `sig`.
                        let value = unsafe { marshal::call_native(addr as u64, sig, &args)? };
                        return Ok(Called::Value(value));
                    }
                }
            }
        };

        if let Some(index) = self.function_index(&name)
            && !self.module.functions[index].is_declaration()
        {
            self.push_frame(index, args, result)?;
            return Ok(Called::Pushed);
        }
        if let Some(host) = self.host_functions.get(&name) {
            return host(&args).map(Called::Value);
        }
        if let Some(called) = self.builtin(&name, sig, &args)? {
            return Ok(called);
        }
        let addr = self.native_address(&name)?;
        marshal::check_args(&name, sig, &args)?;
        #[cfg(feature = "log")]
        log::trace!("calling native [{name}] at {addr:#x}");
        // SAFETY: the symbol is declared with type `sig`.
        let value = unsafe { marshal::call_native(addr, sig, &args)? };
        Ok(Called::Value(value))
    }

    fn builtin(&self, name: &str, sig: &Signature, args: &[GenericValue]) -> Result<Option<Called>> {
        let int_arg = |i: usize| args.get(i).and_then(|a| a.as_i64()).unwrap_or(0);
        let ret = |value: i64| {
            Called::Value(match sig.ret {
                Type::Int(bits) => GenericValue::Int(IntValue::from_i64(bits, value)),
                _ => GenericValue::default(),
            })
        };
        Ok(Some(match name {
            "putchar" => {
                let c = int_arg(0);
                let mut out = std::io::stdout().lock();
                out.write_all(&[c as u8])?;
                out.flush()?;
                ret(c)
            }
            "puts" => {
                let addr = match args.first() {
                    Some(GenericValue::Pointer(addr)) if *addr != 0 => *addr,
                    _ => return Err(fatal_error("puts called without a string")),
                };
                // SAFETY: the argument is a NUL-terminated string.
                let s = unsafe { CStr::from_ptr(addr as *const core::ffi::c_char) };
                let mut out = std::io::stdout().lock();
                out.write_all(s.to_bytes())?;
                out.write_all(b"\n")?;
                out.flush()?;
                ret(0)
            }
            "exit" => Called::Exit(int_arg(0) as i32),
            "abort" => return Err(fatal_error("abort() called from interpreted code")),
            _ => return Ok(None),
        }))
    }
}

fn is_true(value: &GenericValue) -> bool {
    match value {
        GenericValue::Int(int) => !int.is_zero(),
        GenericValue::Pointer(addr) => *addr != 0,
        _ => false,
    }
}

impl ExecutionEngine for Interpreter {
    fn kind(&self) -> EngineKind {
        EngineKind::Interpreter
    }

    fn module(&self) -> &Module {
        &self.module
    }

    fn run_function(&mut self, name: &str, args: &[GenericValue]) -> Result<GenericValue> {
        let index = self
            .function_index(name)
            .filter(|i| !self.module.functions[*i].is_declaration())
            .ok_or_else(|| entry_point_error(format!("function [{name}] has no body")))?;
        let sig = &self.module.functions[index].sig;
        marshal::check_args(name, sig, args)?;
        #[cfg(feature = "log")]
        log::debug!("interpreting [{name}] with {} arguments", args.len());
        self.stack.clear();
        self.push_frame(index, args.to_vec(), None)?;
        let result = self.execute();
        self.stack.clear();
        result
    }

    fn get_pointer_to_function(&mut self, name: &str) -> Result<u64> {
        Err(entry_point_error(format!(
            "[{name}]: the interpreter does not produce native code"
        )))
    }

    fn get_global_value_address(&mut self, name: &str) -> Result<u64> {
        self.globals
            .get(name)
            .map(|memory| memory.addr() as u64)
            .ok_or_else(|| unresolved_symbol(name))
    }

    fn finalize_object(&mut self) -> Result<()> {
        Ok(())
    }

    fn add_object_file(&mut self, buffer: ObjectBuffer) -> Result<()> {
        let lookup = self.lookup.clone();
        let dyld = self
            .dyld
            .get_or_insert_with(|| RuntimeDyld::new(SectionMemoryManager::new(), lookup));
        dyld.load_object(buffer)?;
        dyld.resolve_relocations()?;
        dyld.register_eh_frames()?;
        dyld.finalize_memory()
    }
}
