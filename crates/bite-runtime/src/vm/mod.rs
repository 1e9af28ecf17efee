//! Stack-based bytecode interpreter
//!
//! One value stack shared by every call frame (spec §4.6), addressed
//! frame-relatively through [`CallFrame::base`]. Globals and instance/class
//! members all go through the same `GetProperty`/`SetProperty` pair — a
//! `Nil` receiver is the sentinel for "the global table" (see
//! `compiler::Compiler::load_global`). Garbage collection runs between
//! bytecode instructions via [`crate::gc::Gc::maybe_collect`], polled after
//! every allocation-bearing opcode.

mod frame;

pub use frame::CallFrame;

use crate::bytecode::Opcode;
use crate::compiler::unpack_attrs;
use crate::gc::{Gc, Roots};
use crate::interner::{Interner, Symbol};
use crate::object::{
    BoundMethod, Class, Closure, Function, Heap, Instance, MemberInfo, NativeContext, Object, ObjectId, Range, RangeBoundMethod, RangeConstructor,
    RangeIterator, RangeSelector, Upvalue,
};
use crate::span::Span;
use crate::value::{RuntimeError, Value};
use std::collections::HashMap;

const MAX_FRAMES: usize = 512;

/// A value-bearing runtime error plus the span it occurred at, for
/// diagnostic reporting in `bite-cli`.
#[derive(Debug, Clone)]
pub struct VmError {
    pub error: RuntimeError,
    pub span: Span,
    /// One frame per still-open call, innermost first, for a stack trace.
    pub trace: Vec<String>,
}

pub struct Vm<'a> {
    heap: Heap,
    interner: &'a mut Interner,
    gc: Gc,
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<Symbol, Value>,
    natives: HashMap<Symbol, Value>,
    /// Open upvalues, keyed by the absolute stack index they alias, so a
    /// second closure over the same local reuses the same `Upvalue` object
    /// (spec §4.4 point 4: "closing over the same local twice yields the
    /// same upvalue instance until it closes").
    open_upvalues: HashMap<usize, ObjectId>,
}

impl<'a> Vm<'a> {
    pub fn new(heap: Heap, interner: &'a mut Interner) -> Self {
        let mut vm = Self {
            heap,
            interner,
            gc: Gc::new(),
            stack: Vec::new(),
            frames: Vec::new(),
            globals: HashMap::new(),
            natives: HashMap::new(),
            open_upvalues: HashMap::new(),
        };
        vm.install_intrinsics();
        vm
    }

    /// Registers the host-privileged globals every script sees without a
    /// `register_native` call — currently just `Range`/`RangeInclusive`,
    /// the constructors behind `start..end` / `start...end` literals.
    fn install_intrinsics(&mut self) {
        for (name, inclusive) in [("Range", false), ("RangeInclusive", true)] {
            let sym = self.interner.intern(name);
            let id = self.heap.allocate(Object::RangeConstructor(RangeConstructor { inclusive }));
            self.globals.insert(sym, Value::Object(id));
        }
    }

    pub fn with_gc_stress(mut self, stress: bool) -> Self {
        self.gc = Gc::with_stress(stress);
        self
    }

    pub fn register_native(
        &mut self,
        name: &str,
        func: impl Fn(&NativeContext) -> Result<Value, RuntimeError> + 'static,
    ) {
        let sym = self.interner.intern(name);
        let id = self.heap.allocate(Object::Foreign(crate::object::Foreign {
            name: sym,
            func: std::rc::Rc::new(func),
        }));
        self.natives.insert(sym, Value::Object(id));
    }

    /// Run the top-level script: wrap `function` in a closure and call it
    /// with no arguments, then drive the interpreter loop to completion.
    pub fn run(&mut self, function: Function) -> Result<Value, VmError> {
        let func_id = self.heap.allocate(Object::Function(function));
        let closure_id = self.heap.allocate(Object::Closure(Closure {
            function: func_id,
            upvalues: Vec::new(),
        }));
        self.stack.push(Value::Object(closure_id));
        self.frames.push(CallFrame {
            closure: closure_id,
            ip: 0,
            base: 0,
        });
        self.run_loop()
    }

    fn runtime_error(&self, error: RuntimeError, span: Span) -> VmError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|f| {
                let func = self.heap.get_function(self.heap.get_closure(f.closure).function);
                self.interner.resolve(func.name).to_string()
            })
            .collect();
        VmError { error, span, trace }
    }

    fn resolve_name(&mut self, sym_const: &Value) -> Symbol {
        match sym_const {
            Value::Str(s) => self.interner.intern(s),
            _ => unreachable!("name constants are always strings"),
        }
    }

    fn current_span(&self) -> Span {
        let frame = self.frames.last().expect("at least one active frame");
        let func = self.heap.get_function(self.heap.get_closure(frame.closure).function);
        func.bytecode
            .get_span_for_offset(frame.ip)
            .unwrap_or(Span::new(0, 0))
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().expect("stack underflow")
    }

    fn peek(&self, back: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - back]
    }

    fn read_u8(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let func = self.heap.get_function(self.heap.get_closure(frame.closure).function);
        let byte = func.bytecode.instructions[frame.ip];
        frame.ip += 1;
        byte
    }

    fn read_i16(&mut self) -> i16 {
        let frame = self.frames.last_mut().unwrap();
        let func = self.heap.get_function(self.heap.get_closure(frame.closure).function);
        let value = func.bytecode.read_i16(frame.ip);
        frame.ip += 2;
        value
    }

    fn read_constant(&mut self) -> Value {
        let idx = self.read_u8();
        let frame = self.frames.last().unwrap();
        let func = self.heap.get_function(self.heap.get_closure(frame.closure).function);
        func.bytecode.constants[idx as usize].clone()
    }

    fn current_closure(&self) -> ObjectId {
        self.frames.last().unwrap().closure
    }

    // ---- main loop ----

    fn run_loop(&mut self) -> Result<Value, VmError> {
        loop {
            if self.frames.is_empty() {
                return Ok(self.stack.pop().unwrap_or(Value::Nil));
            }
            let frame_ip_exhausted = {
                let frame = self.frames.last().unwrap();
                let func = self.heap.get_function(self.heap.get_closure(frame.closure).function);
                frame.ip >= func.bytecode.instructions.len()
            };
            if frame_ip_exhausted {
                // Fell off the end without an explicit RETURN (e.g. an
                // empty function body) — behave as `return nil`.
                self.do_return(Value::Nil)?;
                continue;
            }

            let byte = self.read_u8();
            let Some(opcode) = Opcode::from_u8(byte) else {
                return Err(self.runtime_error(RuntimeError::TypeError("invalid opcode".into()), self.current_span()));
            };
            self.step(opcode)?;

            if self.frames.is_empty() {
                return Ok(self.stack.pop().unwrap_or(Value::Nil));
            }
        }
    }

    fn step(&mut self, opcode: Opcode) -> Result<(), VmError> {
        use Opcode::*;
        match opcode {
            Constant => {
                let v = self.read_constant();
                self.push(v);
            }
            Nil => self.push(Value::Nil),
            True => self.push(Value::Bool(true)),
            False => self.push(Value::Bool(false)),
            Pop => {
                self.pop();
            }
            Get => {
                let slot = self.read_u8() as usize;
                let base = self.frames.last().unwrap().base;
                self.push(self.stack[base + slot].clone());
            }
            Set => {
                let slot = self.read_u8() as usize;
                let base = self.frames.last().unwrap().base;
                let value = self.peek(0).clone();
                self.stack[base + slot] = value;
            }
            GetUpvalue => {
                let idx = self.read_u8() as usize;
                let closure = self.current_closure();
                let up_id = self.heap.get_closure(closure).upvalues[idx];
                let value = self.read_upvalue(up_id);
                self.push(value);
            }
            SetUpvalue => {
                let idx = self.read_u8() as usize;
                let closure = self.current_closure();
                let up_id = self.heap.get_closure(closure).upvalues[idx];
                let value = self.peek(0).clone();
                self.write_upvalue(up_id, value);
            }
            CloseUpvalue => {
                let top = self.stack.len() - 1;
                self.close_upvalues_from(top);
                self.stack.pop();
            }
            Jump => {
                let offset = self.read_i16();
                self.frames.last_mut().unwrap().ip = (self.frames.last().unwrap().ip as i32 + offset as i32) as usize;
            }
            JumpIfFalse => {
                let offset = self.read_i16();
                if !self.peek(0).is_truthy() {
                    self.frames.last_mut().unwrap().ip = (self.frames.last().unwrap().ip as i32 + offset as i32) as usize;
                }
            }
            JumpIfTrue => {
                let offset = self.read_i16();
                if self.peek(0).is_truthy() {
                    self.frames.last_mut().unwrap().ip = (self.frames.last().unwrap().ip as i32 + offset as i32) as usize;
                }
            }
            Loop => {
                let offset = self.read_i16();
                self.frames.last_mut().unwrap().ip = (self.frames.last().unwrap().ip as i32 + offset as i32) as usize;
            }
            Negate => {
                let v = self.pop();
                let span = self.current_span();
                let result = match v {
                    Value::Int(n) => Value::Int(-n),
                    Value::Float(n) => Value::Float(-n),
                    other => return Err(self.runtime_error(RuntimeError::TypeError(format!("cannot negate {}", other.type_name())), span)),
                };
                self.push(result);
            }
            Not => {
                let v = self.pop();
                self.push(Value::Bool(!v.is_truthy()));
            }
            BinaryNot => {
                let v = self.pop();
                let span = self.current_span();
                match v {
                    Value::Int(n) => self.push(Value::Int(!n)),
                    other => return Err(self.runtime_error(RuntimeError::TypeError(format!("cannot bitwise-not {}", other.type_name())), span)),
                }
            }
            Add | Subtract | Multiply | Divide | FloorDivision | Modulo | Equal | NotEqual | Less
            | LessEqual | Greater | GreaterEqual | LeftShift | RightShift | BitwiseAnd | BitwiseOr
            | BitwiseXor => self.binary_op(opcode)?,
            Call => {
                let argc = self.read_u8() as usize;
                self.call(argc)?;
            }
            Return => {
                let value = self.pop();
                self.do_return(value)?;
            }
            Closure => self.make_closure()?,
            Class => {
                let name = self.read_constant();
                let name = self.resolve_name(&name);
                let id = self.heap.allocate(Object::Class(Class {
                    name,
                    methods: HashMap::new(),
                    fields: HashMap::new(),
                    superclass: None,
                    constructor: None,
                    class_object: None,
                    is_abstract: false,
                }));
                self.push(Value::Object(id));
                self.maybe_collect();
            }
            AbstractClass => {
                let id = self.peek(0).as_object().expect("class value");
                self.heap.get_class_mut(id).is_abstract = true;
            }
            Inherit => {
                let span = self.current_span();
                let super_value = self.pop();
                let super_id = match super_value.as_object() {
                    Some(id) if matches!(self.heap.get(id), Object::Class(_)) => id,
                    _ => return Err(self.runtime_error(RuntimeError::TypeError("superclass must be a class".into()), span)),
                };
                let class_id = self.peek(0).as_object().expect("class value");
                self.heap.get_class_mut(class_id).superclass = Some(super_id);
            }
            Method => {
                let name = self.read_constant();
                let name = self.resolve_name(&name);
                let closure_value = self.pop();
                let class_id = self.peek(0).as_object().expect("class value");
                self.heap.get_class_mut(class_id).methods.insert(name, closure_value);
            }
            Field => {
                let name = self.read_constant();
                let name = self.resolve_name(&name);
                let attrs_byte = self.read_u8();
                let info = unpack_attrs(attrs_byte);
                let class_id = self.peek(0).as_object().expect("class value");
                merge_member_info(&mut self.heap.get_class_mut(class_id).fields, name, info);
            }
            Constructor => {
                let ctor_value = self.pop();
                let class_id = self.peek(0).as_object().expect("class value");
                self.heap.get_class_mut(class_id).constructor = Some(ctor_value);
            }
            GetProperty => self.get_property()?,
            SetProperty => self.set_property()?,
            GetSuper => self.get_super()?,
            SetSuper => self.set_super()?,
            GetNative => {
                let name = self.read_constant();
                let name = self.resolve_name(&name);
                let span = self.current_span();
                match self.natives.get(&name).cloned() {
                    Some(v) => self.push(v),
                    None => {
                        let text = self.interner.resolve(name).to_string();
                        return Err(self.runtime_error(RuntimeError::UnknownNative(text), span));
                    }
                }
            }
            CallSuperConstructor => {
                let argc = self.read_u8() as usize;
                self.call_super_constructor(argc)?;
            }
            This | Trait | TraitMethod | GetTrait => {
                // Reserved opcodes this compiler never emits (see
                // `bytecode::opcode` doc comment): `this` is compiled as
                // `GET 0`, and traits are flattened into classes at
                // compile time.
                unreachable!("opcode {:?} is never emitted", opcode)
            }
        }
        Ok(())
    }

    fn maybe_collect(&mut self) {
        let heap = &mut self.heap;
        let gc = &mut self.gc;
        // SAFETY-free: Roots only reads `self`'s other fields, which aren't
        // borrowed by `heap`/`gc` here.
        struct Snapshot<'s> {
            stack: &'s [Value],
            frames: &'s [CallFrame],
            globals: &'s HashMap<Symbol, Value>,
            natives: &'s HashMap<Symbol, Value>,
            open_upvalues: &'s HashMap<usize, ObjectId>,
        }
        impl<'s> Roots for Snapshot<'s> {
            fn for_each_root(&self, visit: &mut dyn FnMut(ObjectId)) {
                for value in self.stack {
                    if let Some(id) = value.as_object() {
                        visit(id);
                    }
                }
                for frame in self.frames {
                    visit(frame.closure);
                }
                for value in self.globals.values().chain(self.natives.values()) {
                    if let Some(id) = value.as_object() {
                        visit(id);
                    }
                }
                for id in self.open_upvalues.values() {
                    visit(*id);
                }
            }
        }
        let snapshot = Snapshot {
            stack: &self.stack,
            frames: &self.frames,
            globals: &self.globals,
            natives: &self.natives,
            open_upvalues: &self.open_upvalues,
        };
        gc.maybe_collect(heap, &snapshot);
    }

    // ---- upvalues ----

    fn read_upvalue(&self, id: ObjectId) -> Value {
        match self.heap.get_upvalue(id) {
            Upvalue::Open(slot) => self.stack[*slot].clone(),
            Upvalue::Closed(v) => v.clone(),
        }
    }

    fn write_upvalue(&mut self, id: ObjectId, value: Value) {
        let slot = match self.heap.get_upvalue(id) {
            Upvalue::Open(slot) => Some(*slot),
            Upvalue::Closed(_) => None,
        };
        match slot {
            Some(slot) => self.stack[slot] = value,
            None => *self.heap.get_upvalue_mut(id) = Upvalue::Closed(value),
        }
    }

    fn close_upvalues_from(&mut self, from_slot: usize) {
        let to_close: Vec<usize> = self
            .open_upvalues
            .keys()
            .copied()
            .filter(|&slot| slot >= from_slot)
            .collect();
        for slot in to_close {
            if let Some(id) = self.open_upvalues.remove(&slot) {
                let value = self.stack[slot].clone();
                *self.heap.get_upvalue_mut(id) = Upvalue::Closed(value);
            }
        }
    }

    fn make_closure(&mut self) -> Result<(), VmError> {
        let func_value = self.read_constant();
        let func_id = func_value.as_object().expect("function constant");
        let upvalue_count = self.heap.get_function(func_id).upvalue_count;
        let base = self.frames.last().unwrap().base;
        let mut upvalues = Vec::with_capacity(upvalue_count);
        for _ in 0..upvalue_count {
            let is_local = self.read_u8() != 0;
            let index = self.read_u8() as usize;
            let up_id = if is_local {
                let slot = base + index;
                *self.open_upvalues.entry(slot).or_insert_with(|| self.heap_allocate_open(slot))
            } else {
                let closure = self.current_closure();
                self.heap.get_closure(closure).upvalues[index]
            };
            upvalues.push(up_id);
        }
        let id = self.heap.allocate(Object::Closure(Closure { function: func_id, upvalues }));
        self.push(Value::Object(id));
        self.maybe_collect();
        Ok(())
    }

    fn heap_allocate_open(&mut self, slot: usize) -> ObjectId {
        self.heap.allocate(Object::Upvalue(Upvalue::Open(slot)))
    }

    // ---- arithmetic / comparison ----

    fn binary_op(&mut self, opcode: Opcode) -> Result<(), VmError> {
        use Opcode::*;
        let span = self.current_span();
        let b = self.pop();
        let a = self.pop();
        let result = match opcode {
            Equal => Value::Bool(a == b),
            NotEqual => Value::Bool(a != b),
            Add => match (&a, &b) {
                (Value::Str(x), Value::Str(y)) => Value::string(format!("{x}{y}")),
                _ => numeric_op(&a, &b, span, i64::wrapping_add, |x, y| x + y, self)?,
            },
            Subtract => numeric_op(&a, &b, span, i64::wrapping_sub, |x, y| x - y, self)?,
            Multiply => numeric_op(&a, &b, span, i64::wrapping_mul, |x, y| x * y, self)?,
            Divide => {
                let (x, y) = as_f64_pair(&a, &b, span, self)?;
                if y == 0.0 {
                    return Err(self.runtime_error(RuntimeError::DivisionByZero, span));
                }
                Value::Float(x / y)
            }
            FloorDivision => match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    if *y == 0 {
                        return Err(self.runtime_error(RuntimeError::DivisionByZero, span));
                    }
                    Value::Int(x.div_euclid(*y))
                }
                _ => {
                    let (x, y) = as_f64_pair(&a, &b, span, self)?;
                    if y == 0.0 {
                        return Err(self.runtime_error(RuntimeError::DivisionByZero, span));
                    }
                    Value::Float((x / y).floor())
                }
            },
            Modulo => match (&a, &b) {
                (Value::Int(x), Value::Int(y)) => {
                    if *y == 0 {
                        return Err(self.runtime_error(RuntimeError::DivisionByZero, span));
                    }
                    Value::Int(x.rem_euclid(*y))
                }
                _ => {
                    let (x, y) = as_f64_pair(&a, &b, span, self)?;
                    if y == 0.0 {
                        return Err(self.runtime_error(RuntimeError::DivisionByZero, span));
                    }
                    Value::Float(x % y)
                }
            },
            Less | LessEqual | Greater | GreaterEqual => self.compare(opcode, &a, &b, span)?,
            LeftShift | RightShift | BitwiseAnd | BitwiseOr | BitwiseXor => {
                let (x, y) = as_i64_pair(&a, &b, span, self)?;
                match opcode {
                    LeftShift => Value::Int(x.wrapping_shl(y as u32)),
                    RightShift => Value::Int(x.wrapping_shr(y as u32)),
                    BitwiseAnd => Value::Int(x & y),
                    BitwiseOr => Value::Int(x | y),
                    BitwiseXor => Value::Int(x ^ y),
                    _ => unreachable!(),
                }
            }
            _ => unreachable!("not a binary op"),
        };
        self.push(result);
        Ok(())
    }

    fn compare(&mut self, opcode: Opcode, a: &Value, b: &Value, span: Span) -> Result<Value, VmError> {
        use Opcode::*;
        let ordering = match (a, b) {
            (Value::Str(x), Value::Str(y)) => x.as_ref().cmp(y.as_ref()),
            _ => {
                let (x, y) = as_f64_pair(a, b, span, self)?;
                x.partial_cmp(&y).ok_or_else(|| self.runtime_error(RuntimeError::TypeError("NaN comparison".into()), span))?
            }
        };
        use std::cmp::Ordering::*;
        Ok(Value::Bool(match opcode {
            Less => ordering == Less,
            LessEqual => ordering != Greater,
            Greater => ordering == Greater,
            GreaterEqual => ordering != Less,
            _ => unreachable!(),
        }))
    }

    // ---- calls ----

    fn call(&mut self, argc: usize) -> Result<(), VmError> {
        let span = self.current_span();
        let callee_idx = self.stack.len() - argc - 1;
        let callee = self.stack[callee_idx].clone();

        enum Callee {
            Closure(ObjectId),
            BoundMethod(BoundMethod),
            Class(ObjectId),
            Foreign(crate::object::NativeFn),
            RangeConstructor(bool),
            RangeBound(ObjectId, RangeSelector),
            NotCallable,
        }
        let kind = match callee.as_object() {
            Some(id) => match self.heap.get(id) {
                Object::Closure(_) => Callee::Closure(id),
                Object::BoundMethod(b) => Callee::BoundMethod(BoundMethod { receiver: b.receiver.clone(), closure: b.closure }),
                Object::Class(_) => Callee::Class(id),
                Object::Foreign(f) => Callee::Foreign(f.func.clone()),
                Object::RangeConstructor(c) => Callee::RangeConstructor(c.inclusive),
                Object::RangeBoundMethod(b) => Callee::RangeBound(b.receiver, b.selector),
                _ => Callee::NotCallable,
            },
            None => Callee::NotCallable,
        };

        match kind {
            Callee::Closure(id) => self.call_closure(id, callee_idx, argc, span),
            Callee::BoundMethod(bound) => {
                self.stack[callee_idx] = bound.receiver;
                self.call_closure(bound.closure, callee_idx, argc, span)
            }
            Callee::Class(id) => self.instantiate(id, callee_idx, argc, span),
            Callee::Foreign(func) => {
                let args = self.stack[callee_idx + 1..].to_vec();
                let ctx = NativeContext::new(&args);
                let result = func(&ctx).map_err(|e| self.runtime_error(e, span))?;
                self.stack.truncate(callee_idx);
                self.push(result);
                Ok(())
            }
            Callee::RangeConstructor(inclusive) => self.construct_range(inclusive, callee_idx, argc, span),
            Callee::RangeBound(receiver, selector) => self.call_range_bound(receiver, selector, callee_idx, argc, span),
            Callee::NotCallable => Err(self.runtime_error(RuntimeError::NotCallable(callee.type_name().to_string()), span)),
        }
    }

    /// Invoked from `call()` when the callee is the host-registered `Range`
    /// or `RangeInclusive` global (see [`Object::RangeConstructor`]).
    fn construct_range(&mut self, inclusive: bool, base: usize, argc: usize, span: Span) -> Result<(), VmError> {
        if argc != 2 {
            return Err(self.runtime_error(RuntimeError::ArityMismatch { expected: 2, got: argc }, span));
        }
        let (start, end) = as_i64_pair(&self.stack[base + 1], &self.stack[base + 2], span, self)?;
        let id = self.heap.allocate(Object::Range(Range { start, end, inclusive }));
        self.stack.truncate(base);
        self.push(Value::Object(id));
        self.maybe_collect();
        Ok(())
    }

    fn call_closure(&mut self, closure_id: ObjectId, base: usize, argc: usize, span: Span) -> Result<(), VmError> {
        let func_id = self.heap.get_closure(closure_id).function;
        let arity = self.heap.get_function(func_id).arity;
        if arity != argc {
            return Err(self.runtime_error(RuntimeError::ArityMismatch { expected: arity, got: argc }, span));
        }
        if self.frames.len() >= MAX_FRAMES {
            return Err(self.runtime_error(RuntimeError::StackOverflow, span));
        }
        self.frames.push(CallFrame { closure: closure_id, ip: 0, base });
        Ok(())
    }

    fn do_return(&mut self, value: Value) -> Result<(), VmError> {
        let frame = self.frames.pop().expect("return with no active frame");
        self.close_upvalues_from(frame.base);
        self.stack.truncate(frame.base);
        self.push(value);
        Ok(())
    }

    fn instantiate(&mut self, class_id: ObjectId, base: usize, argc: usize, span: Span) -> Result<(), VmError> {
        if self.heap.get_class(class_id).is_abstract {
            let name = self.interner.resolve(self.heap.get_class(class_id).name).to_string();
            return Err(self.runtime_error(RuntimeError::TypeError(format!("cannot instantiate abstract class '{name}'")), span));
        }
        let field_names = self.collect_field_names(class_id);
        let instance = Instance {
            class: class_id,
            fields: field_names.into_iter().map(|n| (n, Value::Nil)).collect(),
        };
        let instance_id = self.heap.allocate(Object::Instance(instance));
        self.maybe_collect();
        match self.heap.get_class(class_id).constructor.clone() {
            Some(Value::Object(ctor_closure)) => {
                self.stack[base] = Value::Object(instance_id);
                self.call_closure(ctor_closure, base, argc, span)
            }
            _ => {
                if argc != 0 {
                    return Err(self.runtime_error(RuntimeError::ArityMismatch { expected: 0, got: argc }, span));
                }
                self.stack.truncate(base);
                self.push(Value::Object(instance_id));
                Ok(())
            }
        }
    }

    /// Every declared field (this class and its ancestors) gets a
    /// `nil`-initialized slot before the constructor body runs — fields are
    /// never created on the fly by `SET_PROPERTY`.
    fn collect_field_names(&self, class_id: ObjectId) -> Vec<Symbol> {
        let mut names = Vec::new();
        let mut current = Some(class_id);
        while let Some(id) = current {
            let class = self.heap.get_class(id);
            for (name, _) in &class.fields {
                if !class.methods.contains_key(name) && !names.contains(name) {
                    names.push(*name);
                }
            }
            current = class.superclass;
        }
        names
    }

    fn call_super_constructor(&mut self, argc: usize) -> Result<(), VmError> {
        let span = self.current_span();
        let this = self.stack[self.frames.last().unwrap().base].clone();
        let this_id = this.as_object().expect("`this` is always an instance inside a method");
        let class_id = self.heap.get_instance(this_id).class;
        let super_id = self
            .heap
            .get_class(class_id)
            .superclass
            .ok_or_else(|| self.runtime_error(RuntimeError::TypeError("no superclass to construct".into()), span))?;
        let base = self.stack.len() - argc - 1;
        match self.heap.get_class(super_id).constructor.clone() {
            Some(Value::Object(ctor_closure)) => {
                self.stack[base] = this;
                self.call_closure(ctor_closure, base, argc, span)?;
                // The super constructor's own RETURN will push `this`
                // back; nothing further to do here.
                Ok(())
            }
            _ => {
                if argc != 0 {
                    return Err(self.runtime_error(RuntimeError::ArityMismatch { expected: 0, got: argc }, span));
                }
                self.stack.truncate(base);
                self.push(this);
                Ok(())
            }
        }
    }

    // ---- property / member dispatch ----

    fn classify_member(&self, class_id: ObjectId, name: Symbol) -> (Option<MemberInfo>, bool) {
        // (attrs if declared anywhere in the chain, is-a-method-name)
        let mut current = Some(class_id);
        let mut info = None;
        let mut is_method = false;
        while let Some(id) = current {
            let class = self.heap.get_class(id);
            if info.is_none() {
                info = class.fields.get(&name).copied();
            }
            if class.methods.contains_key(&name) {
                is_method = true;
            }
            current = class.superclass;
        }
        (info, is_method)
    }

    fn setter_name(&mut self, name: Symbol) -> Symbol {
        let plain = self.interner.resolve(name).to_string();
        self.interner.intern(&format!("{plain}="))
    }

    fn is_private_access_allowed(&self, receiver: &Value) -> bool {
        match self.frames.last() {
            Some(frame) => self.stack.get(frame.base).map(|t| t == receiver).unwrap_or(false),
            None => false,
        }
    }

    fn get_property(&mut self) -> Result<(), VmError> {
        let name_value = self.read_constant();
        let name = self.resolve_name(&name_value);
        let span = self.current_span();
        let receiver = self.pop();

        match &receiver {
            Value::Nil => match self.globals.get(&name).cloned() {
                Some(v) => {
                    self.push(v);
                    Ok(())
                }
                None => {
                    let text = self.interner.resolve(name).to_string();
                    Err(self.runtime_error(RuntimeError::UndefinedGlobal(text), span))
                }
            },
            Value::Object(id) => {
                // Read what kind of object this is first, then drop the
                // borrow before calling back into `&mut self` dispatch.
                enum Target {
                    Instance,
                    ClassObject(Option<ObjectId>),
                    RangeLike,
                    Other,
                }
                let target = match self.heap.get(*id) {
                    Object::Instance(_) => Target::Instance,
                    Object::Class(class) => Target::ClassObject(class.class_object),
                    Object::Range(_) | Object::RangeIterator(_) => Target::RangeLike,
                    _ => Target::Other,
                };
                match target {
                    Target::Instance => self.get_instance_property(*id, receiver.clone(), name, span),
                    Target::ClassObject(Some(co_id)) => self.get_instance_property(co_id, Value::Object(co_id), name, span),
                    Target::ClassObject(None) => {
                        let text = self.interner.resolve(name).to_string();
                        Err(self.runtime_error(RuntimeError::UndefinedProperty(text), span))
                    }
                    Target::RangeLike => self.get_range_property(*id, name, span),
                    Target::Other => Err(self.runtime_error(RuntimeError::NotAnInstance(receiver.type_name().to_string()), span)),
                }
            }
            _ => Err(self.runtime_error(RuntimeError::NotAnInstance(receiver.type_name().to_string()), span)),
        }
    }

    fn get_instance_property(&mut self, instance_id: ObjectId, receiver: Value, name: Symbol, span: Span) -> Result<(), VmError> {
        let class_id = self.heap.get_instance(instance_id).class;
        let (info, is_method) = self.classify_member(class_id, name);

        if let Some(info) = info {
            if info.private && !self.is_private_access_allowed(&receiver) {
                let text = self.interner.resolve(name).to_string();
                return Err(self.runtime_error(RuntimeError::PrivateMemberAccess(text), span));
            }
            if info.getter {
                let method = self.heap.get_class(class_id).find_method(name, &self.heap).cloned();
                return match method {
                    Some(closure) => self.invoke_immediately(closure, receiver, &[], span),
                    None => {
                        let text = self.interner.resolve(name).to_string();
                        Err(self.runtime_error(RuntimeError::UndefinedProperty(text), span))
                    }
                };
            }
        }

        if !is_method {
            if let Some(v) = self.heap.get_instance(instance_id).fields.get(&name).cloned() {
                self.push(v);
                return Ok(());
            }
        }

        match self.heap.get_class(class_id).find_method(name, &self.heap).cloned() {
            Some(closure_value) => {
                let closure_id = closure_value.as_object().expect("method is a closure");
                let bound_id = self.heap.allocate(Object::BoundMethod(BoundMethod { receiver, closure: closure_id }));
                self.push(Value::Object(bound_id));
                self.maybe_collect();
                Ok(())
            }
            None => {
                let text = self.interner.resolve(name).to_string();
                Err(self.runtime_error(RuntimeError::UndefinedProperty(text), span))
            }
        }
    }

    /// `GET_PROPERTY` on a `Range`/`RangeIterator` receiver: binds one of
    /// the three host-implemented iterator-protocol methods rather than
    /// looking anything up in a `Class`.
    fn get_range_property(&mut self, id: ObjectId, name: Symbol, span: Span) -> Result<(), VmError> {
        let selector = match (self.heap.get(id), self.interner.resolve(name)) {
            (Object::Range(_), "iterator") => RangeSelector::Iterator,
            (Object::RangeIterator(_), "has_next") => RangeSelector::HasNext,
            (Object::RangeIterator(_), "next") => RangeSelector::Next,
            _ => {
                let text = self.interner.resolve(name).to_string();
                return Err(self.runtime_error(RuntimeError::UndefinedProperty(text), span));
            }
        };
        let bound_id = self.heap.allocate(Object::RangeBoundMethod(RangeBoundMethod { receiver: id, selector }));
        self.push(Value::Object(bound_id));
        self.maybe_collect();
        Ok(())
    }

    /// Invoked from `call()` when the callee is a [`RangeBoundMethod`].
    fn call_range_bound(&mut self, receiver: ObjectId, selector: RangeSelector, base: usize, argc: usize, span: Span) -> Result<(), VmError> {
        if argc != 0 {
            return Err(self.runtime_error(RuntimeError::ArityMismatch { expected: 0, got: argc }, span));
        }
        let result = match selector {
            RangeSelector::Iterator => {
                let Object::Range(r) = self.heap.get(receiver) else {
                    unreachable!("iterator() only binds to a Range receiver");
                };
                let r = *r;
                let iter_id = self.heap.allocate(Object::RangeIterator(RangeIterator { current: r.start, end: r.end, inclusive: r.inclusive }));
                Value::Object(iter_id)
            }
            RangeSelector::HasNext => {
                let Object::RangeIterator(it) = self.heap.get(receiver) else {
                    unreachable!("has_next() only binds to a RangeIterator receiver");
                };
                let has_next = if it.inclusive { it.current <= it.end } else { it.current < it.end };
                Value::Bool(has_next)
            }
            RangeSelector::Next => {
                let Object::RangeIterator(it) = self.heap.get_mut(receiver) else {
                    unreachable!("next() only binds to a RangeIterator receiver");
                };
                let current = it.current;
                it.current += 1;
                Value::Int(current)
            }
        };
        self.stack.truncate(base);
        self.push(result);
        self.maybe_collect();
        Ok(())
    }

    fn set_property(&mut self) -> Result<(), VmError> {
        let name_value = self.read_constant();
        let name = self.resolve_name(&name_value);
        let span = self.current_span();
        let value = self.pop();
        let receiver = self.pop();

        match &receiver {
            Value::Nil => {
                self.globals.insert(name, value.clone());
                self.push(value);
                Ok(())
            }
            Value::Object(id) if matches!(self.heap.get(*id), Object::Instance(_)) => {
                self.set_instance_property(*id, receiver.clone(), name, value, span)
            }
            _ => Err(self.runtime_error(RuntimeError::NotAnInstance(receiver.type_name().to_string()), span)),
        }
    }

    fn set_instance_property(&mut self, instance_id: ObjectId, receiver: Value, name: Symbol, value: Value, span: Span) -> Result<(), VmError> {
        let class_id = self.heap.get_instance(instance_id).class;
        let (info, is_method) = self.classify_member(class_id, name);

        let Some(info) = info else {
            let text = self.interner.resolve(name).to_string();
            return Err(self.runtime_error(RuntimeError::UndefinedProperty(text), span));
        };
        if info.private && !self.is_private_access_allowed(&receiver) {
            let text = self.interner.resolve(name).to_string();
            return Err(self.runtime_error(RuntimeError::PrivateMemberAccess(text), span));
        }
        if info.setter {
            let setter_name = self.setter_name(name);
            let method = self.heap.get_class(class_id).find_method(setter_name, &self.heap).cloned();
            return match method {
                Some(closure) => {
                    self.invoke_immediately(closure, receiver, &[value.clone()], span)?;
                    self.pop(); // discard the setter's own return value
                    self.push(value);
                    Ok(())
                }
                None => {
                    let text = self.interner.resolve(name).to_string();
                    Err(self.runtime_error(RuntimeError::UndefinedProperty(text), span))
                }
            };
        }
        if is_method {
            return Err(self.runtime_error(RuntimeError::TypeError("cannot assign to a method".into()), span));
        }
        self.heap.get_instance_mut(instance_id).fields.insert(name, value.clone());
        self.push(value);
        Ok(())
    }

    fn get_super(&mut self) -> Result<(), VmError> {
        let name_value = self.read_constant();
        let name = self.resolve_name(&name_value);
        let span = self.current_span();
        let super_value = self.pop();
        let receiver = self.pop();
        let super_id = super_value.as_object().ok_or_else(|| self.runtime_error(RuntimeError::TypeError("`super` used outside a subclass".into()), span))?;
        match self.heap.get_class(super_id).find_method(name, &self.heap).cloned() {
            Some(closure_value) => {
                let closure_id = closure_value.as_object().expect("method is a closure");
                let bound_id = self.heap.allocate(Object::BoundMethod(BoundMethod { receiver, closure: closure_id }));
                self.push(Value::Object(bound_id));
                self.maybe_collect();
                Ok(())
            }
            None => {
                let text = self.interner.resolve(name).to_string();
                Err(self.runtime_error(RuntimeError::UndefinedProperty(text), span))
            }
        }
    }

    fn set_super(&mut self) -> Result<(), VmError> {
        let name_value = self.read_constant();
        let name = self.resolve_name(&name_value);
        let span = self.current_span();
        let value = self.pop();
        let super_value = self.pop();
        let receiver = self.pop();
        let super_id = super_value.as_object().ok_or_else(|| self.runtime_error(RuntimeError::TypeError("`super` used outside a subclass".into()), span))?;
        let setter_name = self.setter_name(name);
        match self.heap.get_class(super_id).find_method(setter_name, &self.heap).cloned() {
            Some(closure_value) => {
                self.invoke_immediately(closure_value, receiver, &[value.clone()], span)?;
                self.pop();
                self.push(value);
                Ok(())
            }
            None => {
                let text = self.interner.resolve(name).to_string();
                Err(self.runtime_error(RuntimeError::UndefinedProperty(text), span))
            }
        }
    }

    /// Run a closure to completion right now (used for getter/setter
    /// auto-invocation), nesting a fresh sub-loop rather than returning to
    /// the caller's bytecode stream.
    fn invoke_immediately(&mut self, closure_value: Value, receiver: Value, args: &[Value], span: Span) -> Result<(), VmError> {
        let closure_id = closure_value.as_object().expect("method is a closure");
        let base = self.stack.len();
        self.push(receiver);
        for a in args {
            self.push(a.clone());
        }
        let depth_before = self.frames.len();
        self.call_closure(closure_id, base, args.len(), span)?;
        while self.frames.len() > depth_before {
            let frame_ip = self.frames.last().unwrap().ip;
            let frame_closure = self.frames.last().unwrap().closure;
            let body_len = self
                .heap
                .get_function(self.heap.get_closure(frame_closure).function)
                .bytecode
                .instructions
                .len();
            if frame_ip >= body_len {
                self.do_return(Value::Nil)?;
                continue;
            }
            let byte = self.read_u8();
            let opcode = Opcode::from_u8(byte).ok_or_else(|| self.runtime_error(RuntimeError::TypeError("invalid opcode".into()), span))?;
            self.step(opcode)?;
        }
        Ok(())
    }
}

fn merge_member_info(fields: &mut HashMap<Symbol, MemberInfo>, name: Symbol, new: MemberInfo) {
    fields
        .entry(name)
        .and_modify(|existing| {
            existing.private |= new.private;
            existing.is_override |= new.is_override;
            existing.abstract_ |= new.abstract_;
            existing.getter |= new.getter;
            existing.setter |= new.setter;
        })
        .or_insert(new);
}

fn as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Int(n) => Some(*n as f64),
        Value::Float(n) => Some(*n),
        _ => None,
    }
}

fn as_f64_pair(a: &Value, b: &Value, span: Span, vm: &Vm) -> Result<(f64, f64), VmError> {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => Ok((x, y)),
        _ => Err(vm.runtime_error(RuntimeError::TypeError(format!("cannot compare/operate on {} and {}", a.type_name(), b.type_name())), span)),
    }
}

fn as_i64_pair(a: &Value, b: &Value, span: Span, vm: &Vm) -> Result<(i64, i64), VmError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok((*x, *y)),
        _ => Err(vm.runtime_error(RuntimeError::TypeError(format!("bitwise op requires ints, got {} and {}", a.type_name(), b.type_name())), span)),
    }
}

fn numeric_op(a: &Value, b: &Value, span: Span, int_op: impl Fn(i64, i64) -> i64, float_op: impl Fn(f64, f64) -> f64, vm: &Vm) -> Result<Value, VmError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Value::Int(int_op(*x, *y))),
        _ => {
            let (x, y) = as_f64_pair(a, b, span, vm)?;
            Ok(Value::Float(float_op(x, y)))
        }
    }
}
