//! Code generation: lowers an analyzed AST into per-[`Function`] bytecode
//!
//! One [`Compiler`] per compilation, holding a stack of open function
//! contexts ([`FnCtx`]) and, within each, a stack of lexical scopes
//! ([`CompileScope`]) mirroring spec §4.5's compile-time scope stack. Locals
//! are addressed by the same slot numbers the analyzer assigned
//! ([`crate::analyzer::binding::Binding::LocalBinding`]); the compiler keeps
//! its own running `depth` counter in lockstep with the analyzer's by
//! declaring locals in exactly the same order the analyzer did (top-level
//! function hoisting first, then textual order).
//!
//! Every expression nets exactly one value onto the stack; assignments
//! leave the assigned value as their result by writing the destination and
//! letting the `Set*` family push it back. There is no stack-duplicate
//! opcode, so a compound assignment to an arbitrary property target
//! (`obj.x += 1`) re-evaluates the receiver expression twice rather than
//! caching it — see DESIGN.md.

use crate::analyzer::binding::{Binding, UpvalueDescriptor};
use crate::analyzer::AnalysisResult;
use crate::ast::*;
use crate::bytecode::{Bytecode, Opcode};
use crate::interner::{Interner, Symbol};
use crate::object::{Function, Heap, MemberInfo, Object, ObjectId};
use crate::span::Span;
use crate::value::Value;
use std::collections::HashMap;

enum ScopeKind {
    Block,
    Loop { loop_start: usize },
}

/// One entry in a function's open-scope stack (spec §4.5).
struct CompileScope {
    kind: ScopeKind,
    label: Option<Symbol>,
    /// Declaration-site ids of locals opened in this scope, innermost-last.
    locals: Vec<NodeId>,
    /// Slot holding this scope's value as a block/loop expression.
    return_slot: Option<u16>,
    /// Forward jumps emitted by `break` out of this scope, patched once it closes.
    break_jumps: Vec<usize>,
}

/// One function's worth of compile state. `depth` is the next free stack
/// slot, mirroring [`crate::analyzer::binding::FunctionEnvironment::next_slot`].
struct FnCtx {
    bytecode: Bytecode,
    depth: u16,
    scopes: Vec<CompileScope>,
}

impl FnCtx {
    fn new() -> Self {
        Self {
            bytecode: Bytecode::new(),
            depth: 1, // slot 0 is `this`/dummy
            scopes: Vec::new(),
        }
    }
}

/// Tracks the superclass name of the class currently being compiled, for
/// `super` dispatch.
struct ClassCtx {
    superclass_name: Option<Symbol>,
}

/// A trait's compiled methods, ready to be spliced into a composing
/// class's method set by `using`. A plain name may hold more than one
/// entry — a getter and setter pair share a surface name.
#[derive(Clone)]
struct TraitTemplate {
    methods: HashMap<Symbol, Vec<(Value, MemberAttributes)>>,
}

pub struct Compiler<'a> {
    interner: &'a mut Interner,
    heap: &'a mut Heap,
    analysis: &'a AnalysisResult,
    fn_stack: Vec<FnCtx>,
    class_stack: Vec<ClassCtx>,
    traits: HashMap<Symbol, TraitTemplate>,
}

/// Compile a whole program into its implicit top-level [`Function`]
/// (arity 0) — running a script is an ordinary call to this function's
/// closure.
pub fn compile(
    program: &Program,
    analysis: &AnalysisResult,
    heap: &mut Heap,
    interner: &mut Interner,
) -> Function {
    let mut compiler = Compiler {
        interner,
        heap,
        analysis,
        fn_stack: vec![FnCtx::new()],
        class_stack: Vec::new(),
        traits: HashMap::new(),
    };
    compiler.collect_traits(program);
    for stmt in &program.statements {
        if let Stmt::Function(_) = stmt {
            compiler.stmt(stmt);
        }
    }
    let tail = compiler.last_tail_index(&program.statements);
    for (i, stmt) in program.statements.iter().enumerate() {
        if matches!(stmt, Stmt::Function(_)) || Some(i) == tail {
            continue;
        }
        compiler.stmt(stmt);
    }
    // The final trailing expression (if any) becomes the script's result,
    // fed straight to `RETURN` — no return-slot indirection needed, since
    // `do_return` already truncates the stack back to the frame base.
    let span = program.statements.last().map(|s| s.span()).unwrap_or_else(Span::dummy);
    match tail.map(|i| &program.statements[i]) {
        Some(Stmt::Expr { expr, .. }) => compiler.expr(expr),
        _ => compiler.emit(Opcode::Nil, span),
    }
    compiler.emit(Opcode::Return, span);
    let top = compiler.fn_stack.pop().expect("top-level context");
    let name = compiler.interner.intern("<script>");
    Function {
        name,
        arity: 0,
        bytecode: top.bytecode,
        upvalue_count: 0,
        is_constructor: false,
    }
}

impl<'a> Compiler<'a> {
    fn cur(&mut self) -> &mut FnCtx {
        self.fn_stack.last_mut().expect("open function context")
    }

    fn emit(&mut self, op: Opcode, span: Span) {
        self.cur().bytecode.emit(op, span);
    }

    fn emit_u8(&mut self, byte: u8) {
        self.cur().bytecode.emit_u8(byte);
    }

    /// Add a name (or any string) constant to the *current* function's pool.
    fn name_const(&mut self, sym: Symbol) -> u8 {
        let s = self.interner.resolve(sym).to_string();
        self.cur().bytecode.add_constant(Value::string(s))
    }

    fn const_value(&mut self, value: Value) -> u8 {
        self.cur().bytecode.add_constant(value)
    }

    // ---- declarations: slot bookkeeping mirrors the analyzer exactly ----

    /// Reserve the next slot for a declared local. Value is expected to
    /// already be sitting on top of the stack.
    fn declare_slot(&mut self, declaration: NodeId) -> u16 {
        let slot = self.cur().depth;
        self.cur().depth += 1;
        if let Some(scope) = self.cur().scopes.last_mut() {
            scope.locals.push(declaration);
        }
        slot
    }

    /// Reserve a slot for a compiler-only temporary (a block/loop
    /// `return_slot`) that the analyzer never assigned.
    fn reserve_temp_slot(&mut self) -> u16 {
        let slot = self.cur().depth;
        self.cur().depth += 1;
        slot
    }

    fn is_captured(&self, declaration: NodeId) -> bool {
        self.analysis.captured.contains(&declaration)
    }

    fn discard_local(&mut self, declaration: NodeId, span: Span) {
        if self.is_captured(declaration) {
            self.emit(Opcode::CloseUpvalue, span);
        } else {
            self.emit(Opcode::Pop, span);
        }
        self.cur().depth -= 1;
    }

    /// Whether a `var`/function/native declared *here* should become a
    /// true local slot rather than a global: true unless we're in the
    /// outermost program scope (no function, no open block).
    fn declares_local(&self) -> bool {
        self.fn_stack.len() > 1 || !self.fn_stack.last().unwrap().scopes.is_empty()
    }

    // ---- scopes ----

    fn push_scope(&mut self, kind: ScopeKind, label: Option<Symbol>) {
        self.cur().scopes.push(CompileScope {
            kind,
            label,
            locals: Vec::new(),
            return_slot: None,
            break_jumps: Vec::new(),
        });
    }

    fn pop_scope(&mut self, span: Span) -> Vec<usize> {
        let scope = self.cur().scopes.pop().expect("matching scope");
        for decl in scope.locals.iter().rev() {
            self.discard_local(*decl, span);
        }
        scope.break_jumps
    }

    /// Pop the locals of every scope strictly inside the target scope
    /// (used by `break`/`continue` to unwind mid-block without touching
    /// the target scope's own `return_slot`).
    fn unwind_to(&mut self, target_index: usize, span: Span) {
        let n_scopes = self.cur().scopes.len();
        for idx in (target_index + 1..n_scopes).rev() {
            let locals = std::mem::take(&mut self.cur().scopes[idx].locals);
            for decl in locals.iter().rev() {
                self.discard_local(*decl, span);
            }
        }
    }

    fn find_loop_scope(&self, label: Option<Symbol>) -> Option<usize> {
        let scopes = &self.fn_stack.last().unwrap().scopes;
        scopes
            .iter()
            .enumerate()
            .rev()
            .find(|(_, s)| {
                let is_loop = matches!(s.kind, ScopeKind::Loop { .. });
                match label {
                    None => is_loop,
                    Some(l) => is_loop && s.label == Some(l),
                }
            })
            .map(|(i, _)| i)
    }

    // ---- program structure ----

    fn collect_traits(&mut self, program: &Program) {
        for stmt in &program.statements {
            if let Stmt::Trait(decl) = stmt {
                let mut methods = HashMap::new();
                for method in &decl.methods {
                    if let Some(body) = &method.body {
                        let fd = FunctionDecl {
                            id: method.id,
                            name: method.name,
                            params: method.params.clone(),
                            body: body.clone(),
                            span: method.span,
                        };
                        let func_id = self.compile_function_value(&fd, false);
                        let func_value = Value::Object(func_id);
                        methods.entry(method.name).or_insert_with(Vec::new).push((func_value, method.attrs));
                    }
                }
                self.traits.insert(decl.name, TraitTemplate { methods });
            }
        }
    }

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Var { id, name, initializer, span } => {
                if self.declares_local() {
                    match initializer {
                        Some(init) => self.expr(init),
                        None => self.emit(Opcode::Nil, *span),
                    }
                    self.declare_slot(*id);
                } else {
                    self.emit(Opcode::Nil, *span);
                    match initializer {
                        Some(init) => self.expr(init),
                        None => self.emit(Opcode::Nil, *span),
                    }
                    let name_const = self.name_const(*name);
                    self.emit(Opcode::SetProperty, *span);
                    self.emit_u8(name_const);
                    self.emit(Opcode::Pop, *span);
                }
            }
            Stmt::Expr { expr, span, .. } => {
                self.expr(expr);
                self.emit(Opcode::Pop, *span);
            }
            Stmt::Function(f) => self.function_decl(f),
            Stmt::Native { id, name, span } => {
                if self.declares_local() {
                    let name_const = self.name_const(*name);
                    self.emit(Opcode::GetNative, *span);
                    self.emit_u8(name_const);
                    self.declare_slot(*id);
                } else {
                    self.emit(Opcode::Nil, *span);
                    let name_const = self.name_const(*name);
                    self.emit(Opcode::GetNative, *span);
                    self.emit_u8(name_const);
                    let store_const = self.name_const(*name);
                    self.emit(Opcode::SetProperty, *span);
                    self.emit_u8(store_const);
                    self.emit(Opcode::Pop, *span);
                }
            }
            Stmt::Class(c) => self.class_decl(c, false),
            Stmt::Object(c) => self.class_decl(c, false),
            Stmt::Trait(_) => {} // already compiled in `collect_traits`
        }
    }

    // ---- expressions (every arm leaves exactly one value on the stack) ----

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Integer { value, span, .. } => {
                let c = self.const_value(Value::Int(*value));
                self.emit(Opcode::Constant, *span);
                self.emit_u8(c);
            }
            Expr::Float { value, span, .. } => {
                let c = self.const_value(Value::Float(*value));
                self.emit(Opcode::Constant, *span);
                self.emit_u8(c);
            }
            Expr::StringLit { value, span, .. } => {
                let s = self.interner.resolve(*value).to_string();
                let c = self.const_value(Value::string(s));
                self.emit(Opcode::Constant, *span);
                self.emit_u8(c);
            }
            Expr::Bool { value, span, .. } => {
                self.emit(if *value { Opcode::True } else { Opcode::False }, *span);
            }
            Expr::Nil { span, .. } => self.emit(Opcode::Nil, *span),
            Expr::This { span, .. } => {
                self.emit(Opcode::Get, *span);
                self.emit_u8(0);
            }
            Expr::Invalid { span, .. } => self.emit(Opcode::Nil, *span),
            Expr::Variable { id, span, .. } => self.load_binding(*id, *span),
            Expr::Unary { op, operand, span, .. } => {
                self.expr(operand);
                let opcode = match op {
                    UnaryOp::Negate => Opcode::Negate,
                    UnaryOp::Not => Opcode::Not,
                    UnaryOp::BitwiseNot => Opcode::BinaryNot,
                };
                self.emit(opcode, *span);
            }
            Expr::Binary { op, left, right, span, .. } => self.binary(*op, left, right, *span),
            Expr::Assign { target, compound_op, value, id, span } => {
                self.assign(target, *compound_op, value, *id, *span)
            }
            Expr::Call { callee, args, span, .. } => {
                self.expr(callee);
                for a in args {
                    self.expr(a);
                }
                self.emit(Opcode::Call, *span);
                self.emit_u8(args.len() as u8);
            }
            Expr::GetProperty { object, name, span, .. } => {
                self.expr(object);
                let name_const = self.name_const(*name);
                self.emit(Opcode::GetProperty, *span);
                self.emit_u8(name_const);
            }
            Expr::Super { name, span, .. } => {
                self.emit(Opcode::Get, *span);
                self.emit_u8(0);
                self.push_superclass(*span);
                let name_const = self.name_const(*name);
                self.emit(Opcode::GetSuper, *span);
                self.emit_u8(name_const);
            }
            Expr::Block { block, label, span, .. } => {
                self.compile_block_expr(block, label.as_ref().map(|l| l.name), *span);
            }
            Expr::If { condition, then_branch, else_branch, span, .. } => {
                self.if_expr(condition, then_branch, else_branch.as_deref(), *span);
            }
            Expr::Loop { body, label, span, .. } => {
                self.loop_expr(body, label.as_ref().map(|l| l.name), *span);
            }
            Expr::While { condition, body, label, span, .. } => {
                self.while_expr(condition, body, label.as_ref().map(|l| l.name), *span);
            }
            Expr::For { binding, id, iterable, body, label, span } => {
                self.for_expr(*binding, *id, iterable, body, label.as_ref().map(|l| l.name), *span);
            }
            Expr::Break { label, value, span, .. } => self.break_expr(*label, value.as_deref(), *span),
            Expr::Continue { label, span, .. } => self.continue_expr(*label, *span),
            Expr::Return { value, span, .. } => {
                match value {
                    Some(v) => self.expr(v),
                    None => self.emit(Opcode::Nil, *span),
                }
                self.emit(Opcode::Return, *span);
                // Dead code after this point but the compiler's static
                // depth bookkeeping still needs a value here.
                self.emit(Opcode::Nil, *span);
            }
            Expr::Range { start, end, inclusive, span } => {
                let ctor_name = if *inclusive { "RangeInclusive" } else { "Range" };
                let ctor_sym = self.well_known(ctor_name);
                self.load_global(ctor_sym, *span);
                self.expr(start);
                self.expr(end);
                self.emit(Opcode::Call, *span);
                self.emit_u8(2);
            }
            Expr::ObjectExpr { id, body, span } => {
                let decl = ClassDecl {
                    id: *id,
                    name: self.interner.intern("<object>"),
                    is_abstract: false,
                    superclass: None,
                    body: body.clone(),
                    span: *span,
                };
                self.class_decl(&decl, true);
            }
        }
    }

    fn load_binding(&mut self, id: NodeId, span: Span) {
        match self.analysis.bindings.get(&id).cloned().unwrap_or(Binding::NoBinding) {
            Binding::LocalBinding { slot } | Binding::ParameterBinding { slot } => {
                self.emit(Opcode::Get, span);
                self.emit_u8(slot as u8);
            }
            Binding::UpvalueBinding { index } => {
                self.emit(Opcode::GetUpvalue, span);
                self.emit_u8(index as u8);
            }
            Binding::GlobalBinding { name } => self.load_global(name, span),
            Binding::MemberBinding { name } | Binding::ClassObjectBinding { name } => {
                self.emit(Opcode::Get, span);
                self.emit_u8(0);
                let name_const = self.name_const(name);
                self.emit(Opcode::GetProperty, span);
                self.emit_u8(name_const);
            }
            Binding::PropertyBinding { name, .. } => {
                let name_const = self.name_const(name);
                self.emit(Opcode::GetProperty, span);
                self.emit_u8(name_const);
            }
            Binding::SuperBinding { name } => {
                self.emit(Opcode::Get, span);
                self.emit_u8(0);
                self.push_superclass(span);
                let name_const = self.name_const(name);
                self.emit(Opcode::GetSuper, span);
                self.emit_u8(name_const);
            }
            Binding::NoBinding => self.emit(Opcode::Nil, span),
        }
    }

    /// `None` means we're compiling `super` syntax in a class with no
    /// superclass — unreachable once the analyzer has validated the
    /// program, but callers fall back to `Nil` rather than panicking.
    fn current_superclass_name(&self) -> Option<Symbol> {
        self.class_stack.iter().rev().find_map(|c| c.superclass_name)
    }

    /// Push the superclass value (or `Nil` if none is in scope).
    fn push_superclass(&mut self, span: Span) {
        match self.current_superclass_name() {
            Some(sup) => self.load_global(sup, span),
            None => self.emit(Opcode::Nil, span),
        }
    }

    /// Nil; name-const; `GetProperty` — the dedicated global table is
    /// reached through the ordinary property-access opcodes with a `Nil`
    /// receiver; see DESIGN.md for why `GlobalBinding` is encoded this way.
    fn load_global(&mut self, name: Symbol, span: Span) {
        self.emit(Opcode::Nil, span);
        let name_const = self.name_const(name);
        self.emit(Opcode::GetProperty, span);
        self.emit_u8(name_const);
    }

    /// Emits `SetProperty name`, assuming the stack already holds
    /// `[Nil, value]` (receiver pushed before the value).
    fn store_global(&mut self, name: Symbol, span: Span) {
        let name_const = self.name_const(name);
        self.emit(Opcode::SetProperty, span);
        self.emit_u8(name_const);
    }

    fn binary_opcode(&self, op: BinaryOp) -> Opcode {
        match op {
            BinaryOp::Add => Opcode::Add,
            BinaryOp::Subtract => Opcode::Subtract,
            BinaryOp::Multiply => Opcode::Multiply,
            BinaryOp::Divide => Opcode::Divide,
            BinaryOp::FloorDivide => Opcode::FloorDivision,
            BinaryOp::Modulo => Opcode::Modulo,
            BinaryOp::Equal => Opcode::Equal,
            BinaryOp::NotEqual => Opcode::NotEqual,
            BinaryOp::Less => Opcode::Less,
            BinaryOp::LessEqual => Opcode::LessEqual,
            BinaryOp::Greater => Opcode::Greater,
            BinaryOp::GreaterEqual => Opcode::GreaterEqual,
            BinaryOp::LeftShift => Opcode::LeftShift,
            BinaryOp::RightShift => Opcode::RightShift,
            BinaryOp::BitwiseAnd => Opcode::BitwiseAnd,
            BinaryOp::BitwiseOr => Opcode::BitwiseOr,
            BinaryOp::BitwiseXor => Opcode::BitwiseXor,
            BinaryOp::LogicalAnd | BinaryOp::LogicalOr => unreachable!("short-circuit ops handled in `binary`"),
        }
    }

    fn binary(&mut self, op: BinaryOp, left: &Expr, right: &Expr, span: Span) {
        match op {
            BinaryOp::LogicalAnd => {
                self.expr(left);
                let short = self.cur().bytecode.emit_jump_placeholder(Opcode::JumpIfFalse, span);
                self.emit(Opcode::Pop, span);
                self.expr(right);
                self.cur().bytecode.patch_jump(short);
            }
            BinaryOp::LogicalOr => {
                self.expr(left);
                let short = self.cur().bytecode.emit_jump_placeholder(Opcode::JumpIfTrue, span);
                self.emit(Opcode::Pop, span);
                self.expr(right);
                self.cur().bytecode.patch_jump(short);
            }
            _ => {
                self.expr(left);
                self.expr(right);
                let opcode = self.binary_opcode(op);
                self.emit(opcode, span);
            }
        }
    }

    fn assign(&mut self, target: &AssignTarget, compound_op: Option<BinaryOp>, value: &Expr, id: NodeId, span: Span) {
        let binding = self.analysis.bindings.get(&id).cloned().unwrap_or(Binding::NoBinding);
        match (target, binding) {
            (AssignTarget::Variable(_), Binding::LocalBinding { slot })
            | (AssignTarget::Variable(_), Binding::ParameterBinding { slot }) => {
                if let Some(op) = compound_op {
                    self.emit(Opcode::Get, span);
                    self.emit_u8(slot as u8);
                    self.expr(value);
                    let opcode = self.binary_opcode(op);
                    self.emit(opcode, span);
                } else {
                    self.expr(value);
                }
                self.emit(Opcode::Set, span);
                self.emit_u8(slot as u8);
            }
            (AssignTarget::Variable(_), Binding::UpvalueBinding { index }) => {
                if let Some(op) = compound_op {
                    self.emit(Opcode::GetUpvalue, span);
                    self.emit_u8(index as u8);
                    self.expr(value);
                    let opcode = self.binary_opcode(op);
                    self.emit(opcode, span);
                } else {
                    self.expr(value);
                }
                self.emit(Opcode::SetUpvalue, span);
                self.emit_u8(index as u8);
            }
            (AssignTarget::Variable(_), Binding::GlobalBinding { name }) => {
                self.emit(Opcode::Nil, span);
                if let Some(op) = compound_op {
                    self.load_global(name, span);
                    self.expr(value);
                    let opcode = self.binary_opcode(op);
                    self.emit(opcode, span);
                } else {
                    self.expr(value);
                }
                self.store_global(name, span);
            }
            (AssignTarget::Variable(name), _) => {
                // Implicit-`this` member write (`x = e` where `x` names a
                // field/method of the enclosing class), or an unresolved
                // name already diagnosed by the analyzer.
                let name = *name;
                self.emit(Opcode::Get, span);
                self.emit_u8(0);
                if let Some(op) = compound_op {
                    self.emit(Opcode::Get, span);
                    self.emit_u8(0);
                    let nc = self.name_const(name);
                    self.emit(Opcode::GetProperty, span);
                    self.emit_u8(nc);
                    self.expr(value);
                    let opcode = self.binary_opcode(op);
                    self.emit(opcode, span);
                } else {
                    self.expr(value);
                }
                let nc = self.name_const(name);
                self.emit(Opcode::SetProperty, span);
                self.emit_u8(nc);
            }
            (AssignTarget::Property { object, name }, _) => {
                let name = *name;
                self.expr(object);
                if let Some(op) = compound_op {
                    self.expr(object);
                    let nc = self.name_const(name);
                    self.emit(Opcode::GetProperty, span);
                    self.emit_u8(nc);
                    self.expr(value);
                    let opcode = self.binary_opcode(op);
                    self.emit(opcode, span);
                } else {
                    self.expr(value);
                }
                let nc = self.name_const(name);
                self.emit(Opcode::SetProperty, span);
                self.emit_u8(nc);
            }
            (AssignTarget::Super { name }, _) => {
                let name = *name;
                self.emit(Opcode::Get, span);
                self.emit_u8(0);
                self.push_superclass(span);
                if let Some(op) = compound_op {
                    self.emit(Opcode::Get, span);
                    self.emit_u8(0);
                    self.push_superclass(span);
                    let nc = self.name_const(name);
                    self.emit(Opcode::GetSuper, span);
                    self.emit_u8(nc);
                    self.expr(value);
                    let opcode = self.binary_opcode(op);
                    self.emit(opcode, span);
                } else {
                    self.expr(value);
                }
                let nc = self.name_const(name);
                self.emit(Opcode::SetSuper, span);
                self.emit_u8(nc);
            }
        }
    }

    // ---- block/if/loop/while/for ----

    fn compile_block_expr(&mut self, block: &Block, label: Option<Symbol>, span: Span) {
        self.push_scope(ScopeKind::Block, label);
        let return_slot = self.reserve_temp_slot();
        self.cur().scopes.last_mut().unwrap().return_slot = Some(return_slot);
        self.compile_block_statements(block);
        self.compile_tail(&block.statements, return_slot, span);
        let breaks = self.pop_scope(span);
        for j in breaks {
            self.cur().bytecode.patch_jump(j);
        }
        self.emit(Opcode::Get, span);
        self.emit_u8(return_slot as u8);
    }

    /// Hoisted-function first pass, then remaining statements in textual
    /// order, skipping whichever statement `compile_tail` will handle.
    fn compile_block_statements(&mut self, block: &Block) {
        for stmt in &block.statements {
            if let Stmt::Function(f) = stmt {
                self.function_decl(f);
            }
        }
        let last = self.last_tail_index(&block.statements);
        for (i, stmt) in block.statements.iter().enumerate() {
            if matches!(stmt, Stmt::Function(_)) || Some(i) == last {
                continue;
            }
            self.stmt(stmt);
        }
    }

    fn last_tail_index(&self, statements: &[Stmt]) -> Option<usize> {
        match statements.last() {
            Some(Stmt::Expr { has_semicolon: false, .. }) => Some(statements.len() - 1),
            _ => None,
        }
    }

    /// Compile the trailing expression (or `Nil`), then
    /// `SET return_slot; POP` — the reserved slot keeps the value.
    fn compile_tail(&mut self, statements: &[Stmt], return_slot: u16, span: Span) {
        match self.last_tail_index(statements).map(|i| &statements[i]) {
            Some(Stmt::Expr { expr, .. }) => self.expr(expr),
            _ => self.emit(Opcode::Nil, span),
        }
        self.emit(Opcode::Set, span);
        self.emit_u8(return_slot as u8);
        self.emit(Opcode::Pop, span);
    }

    fn if_expr(&mut self, condition: &Expr, then_branch: &Block, else_branch: Option<&Expr>, span: Span) {
        self.expr(condition);
        let else_jump = self.cur().bytecode.emit_jump_placeholder(Opcode::JumpIfFalse, span);
        self.emit(Opcode::Pop, span);
        self.compile_block_expr(then_branch, None, span);
        let end_jump = self.cur().bytecode.emit_jump_placeholder(Opcode::Jump, span);
        self.cur().bytecode.patch_jump(else_jump);
        self.emit(Opcode::Pop, span);
        match else_branch {
            Some(e) => self.expr(e),
            None => self.emit(Opcode::Nil, span),
        }
        self.cur().bytecode.patch_jump(end_jump);
    }

    fn loop_expr(&mut self, body: &Block, label: Option<Symbol>, span: Span) {
        let return_slot = self.reserve_temp_slot();
        self.emit(Opcode::Nil, span);
        self.emit(Opcode::Set, span);
        self.emit_u8(return_slot as u8);
        self.emit(Opcode::Pop, span);

        let loop_start = self.cur().bytecode.current_offset();
        self.push_scope(ScopeKind::Loop { loop_start }, label);
        self.cur().scopes.last_mut().unwrap().return_slot = Some(return_slot);
        self.compile_loop_body(body, span);
        self.cur().bytecode.emit_loop(loop_start, span);
        let breaks = self.pop_scope(span);
        for j in breaks {
            self.cur().bytecode.patch_jump(j);
        }
        self.emit(Opcode::Get, span);
        self.emit_u8(return_slot as u8);
    }

    fn while_expr(&mut self, condition: &Expr, body: &Block, label: Option<Symbol>, span: Span) {
        let return_slot = self.reserve_temp_slot();
        self.emit(Opcode::Nil, span);
        self.emit(Opcode::Set, span);
        self.emit_u8(return_slot as u8);
        self.emit(Opcode::Pop, span);

        let loop_start = self.cur().bytecode.current_offset();
        self.expr(condition);
        let exit = self.cur().bytecode.emit_jump_placeholder(Opcode::JumpIfFalse, span);
        self.emit(Opcode::Pop, span);

        self.push_scope(ScopeKind::Loop { loop_start }, label);
        self.cur().scopes.last_mut().unwrap().return_slot = Some(return_slot);
        self.compile_loop_body(body, span);
        self.cur().bytecode.emit_loop(loop_start, span);
        let breaks = self.pop_scope(span);

        self.cur().bytecode.patch_jump(exit);
        self.emit(Opcode::Pop, span);
        for j in breaks {
            self.cur().bytecode.patch_jump(j);
        }
        self.emit(Opcode::Get, span);
        self.emit_u8(return_slot as u8);
    }

    /// `for name in iter { body }` desugars to
    /// `{ let $it = iter.iterator(); loop { if !$it.has_next() break; let name = $it.next(); body } }`
    /// (spec §4.5), emitted inline.
    fn for_expr(
        &mut self,
        binding: Symbol,
        binding_id: NodeId,
        iterable: &Expr,
        body: &Block,
        label: Option<Symbol>,
        span: Span,
    ) {
        let binding_is_local = self.declares_local();
        self.push_scope(ScopeKind::Block, None);
        self.expr(iterable);
        let iterator_sym = self.well_known("iterator");
        let iterator_const = self.name_const(iterator_sym);
        self.emit(Opcode::GetProperty, span);
        self.emit_u8(iterator_const);
        self.emit(Opcode::Call, span);
        self.emit_u8(0);
        let it_slot = self.reserve_temp_slot();

        let return_slot = self.reserve_temp_slot();
        self.emit(Opcode::Nil, span);
        self.emit(Opcode::Set, span);
        self.emit_u8(return_slot as u8);
        self.emit(Opcode::Pop, span);

        let loop_start = self.cur().bytecode.current_offset();
        self.emit(Opcode::Get, span);
        self.emit_u8(it_slot as u8);
        let has_next_sym = self.well_known("has_next");
        let has_next_const = self.name_const(has_next_sym);
        self.emit(Opcode::GetProperty, span);
        self.emit_u8(has_next_const);
        self.emit(Opcode::Call, span);
        self.emit_u8(0);
        self.emit(Opcode::Not, span);
        let exit = self.cur().bytecode.emit_jump_placeholder(Opcode::JumpIfFalse, span);
        self.emit(Opcode::Pop, span);

        self.push_scope(ScopeKind::Loop { loop_start }, label);
        self.cur().scopes.last_mut().unwrap().return_slot = Some(return_slot);
        if !binding_is_local {
            // receiver sentinel for the global store below, pushed ahead of
            // the value so the stack ends up `[Nil, value]`.
            self.emit(Opcode::Nil, span);
        }
        self.emit(Opcode::Get, span);
        self.emit_u8(it_slot as u8);
        let next_sym = self.well_known("next");
        let next_const = self.name_const(next_sym);
        self.emit(Opcode::GetProperty, span);
        self.emit_u8(next_const);
        self.emit(Opcode::Call, span);
        self.emit_u8(0);
        if binding_is_local {
            self.declare_slot(binding_id);
        } else {
            self.store_global(binding, span);
            self.emit(Opcode::Pop, span);
        }
        self.compile_loop_body(body, span);
        self.cur().bytecode.emit_loop(loop_start, span);
        let breaks = self.pop_scope(span);

        self.cur().bytecode.patch_jump(exit);
        self.emit(Opcode::Pop, span);
        for j in breaks {
            self.cur().bytecode.patch_jump(j);
        }
        self.emit(Opcode::Get, span);
        self.emit_u8(return_slot as u8);

        self.pop_scope(span); // the synthetic `$it` block scope
    }

    fn well_known(&mut self, name: &str) -> Symbol {
        self.interner.intern(name)
    }

    /// Compile a loop body as an expression whose value is discarded (the
    /// loop's own `return_slot`, set only by `break <value>`, is what
    /// survives).
    fn compile_loop_body(&mut self, body: &Block, span: Span) {
        self.push_scope(ScopeKind::Block, None);
        let discard_slot = self.reserve_temp_slot();
        self.cur().scopes.last_mut().unwrap().return_slot = Some(discard_slot);
        self.compile_block_statements(body);
        self.compile_tail(&body.statements, discard_slot, span);
        let breaks = self.pop_scope(span);
        for j in breaks {
            self.cur().bytecode.patch_jump(j);
        }
        self.emit(Opcode::Get, span);
        self.emit_u8(discard_slot as u8);
        self.emit(Opcode::Pop, span);
    }

    fn break_expr(&mut self, label: Option<Symbol>, value: Option<&Expr>, span: Span) {
        let Some(target) = self.find_loop_scope(label) else { return };
        let return_slot = self.cur().scopes[target].return_slot;
        if let (Some(v), Some(slot)) = (value, return_slot) {
            self.expr(v);
            self.emit(Opcode::Set, span);
            self.emit_u8(slot as u8);
            self.emit(Opcode::Pop, span);
        }
        self.unwind_to(target, span);
        let jump = self.cur().bytecode.emit_jump_placeholder(Opcode::Jump, span);
        self.cur().scopes[target].break_jumps.push(jump);
    }

    fn continue_expr(&mut self, label: Option<Symbol>, span: Span) {
        let Some(target) = self.find_loop_scope(label) else { return };
        let loop_start = match self.cur().scopes[target].kind {
            ScopeKind::Loop { loop_start } => loop_start,
            ScopeKind::Block => return,
        };
        self.unwind_to(target, span);
        self.cur().bytecode.emit_loop(loop_start, span);
    }

    // ---- functions ----

    fn function_decl(&mut self, f: &FunctionDecl) {
        let func_id = self.compile_function_value(f, false);
        if self.declares_local() {
            self.emit_closure(func_id, f.id, f.span);
            self.declare_slot(f.id);
        } else {
            self.emit(Opcode::Nil, f.span);
            self.emit_closure(func_id, f.id, f.span);
            self.store_global(f.name, f.span);
            self.emit(Opcode::Pop, f.span);
        }
    }

    /// Compile a function/method body into a heap-allocated [`Function`]
    /// constant. Does not emit `CLOSURE` — callers do that in the
    /// *enclosing* context per spec §4.5.
    fn compile_function_value(&mut self, f: &FunctionDecl, is_constructor: bool) -> ObjectId {
        self.fn_stack.push(FnCtx::new());
        for _ in &f.params {
            // `Param` carries no `NodeId` of its own; parameters are
            // declared against the function's declaration id, so captured-
            // parameter tracking is approximated at function granularity
            // (see DESIGN.md).
            self.declare_slot(f.id);
        }
        self.compile_block_statements_top(&f.body);
        let tail = self.last_tail_index(&f.body.statements).map(|i| &f.body.statements[i]);
        if is_constructor {
            // A constructor's result is always the instance, regardless of
            // its body's trailing expression.
            if let Some(Stmt::Expr { expr, .. }) = tail {
                self.expr(expr);
                self.emit(Opcode::Pop, f.span);
            }
            self.emit(Opcode::Get, f.span);
            self.emit_u8(0);
        } else {
            match tail {
                Some(Stmt::Expr { expr, .. }) => self.expr(expr),
                _ => self.emit(Opcode::Nil, f.span),
            }
        }
        self.emit(Opcode::Return, f.span);

        let ctx = self.fn_stack.pop().expect("function context");
        let upvalue_count = self.analysis.function_upvalues.get(&f.id).map(|v| v.len()).unwrap_or(0);
        let func = Function {
            name: f.name,
            arity: f.params.len(),
            bytecode: ctx.bytecode,
            upvalue_count,
            is_constructor,
        };
        self.heap.allocate(Object::Function(func))
    }

    /// Like `compile_block_statements`, for a function's own top-level
    /// body (no enclosing block scope — the function context is the scope).
    fn compile_block_statements_top(&mut self, body: &Block) {
        for stmt in &body.statements {
            if let Stmt::Function(f) = stmt {
                self.function_decl(f);
            }
        }
        let last = self.last_tail_index(&body.statements);
        for (i, stmt) in body.statements.iter().enumerate() {
            if matches!(stmt, Stmt::Function(_)) || Some(i) == last {
                continue;
            }
            self.stmt(stmt);
        }
    }

    fn emit_closure(&mut self, func_id: ObjectId, decl_id: NodeId, span: Span) {
        let const_idx = self.const_value(Value::Object(func_id));
        self.emit(Opcode::Closure, span);
        self.emit_u8(const_idx);
        let upvalues = self.analysis.function_upvalues.get(&decl_id).cloned().unwrap_or_default();
        for UpvalueDescriptor { is_local, index } in upvalues {
            self.emit_u8(if is_local { 1 } else { 0 });
            self.emit_u8(index as u8);
        }
    }

    // ---- classes ----

    fn class_decl(&mut self, decl: &ClassDecl, is_expression: bool) {
        let span = decl.span;
        if !is_expression {
            self.emit(Opcode::Nil, span); // receiver sentinel for the eventual global store
        }
        let name_const = self.name_const(decl.name);
        self.emit(Opcode::Class, span);
        self.emit_u8(name_const);
        if decl.is_abstract {
            self.emit(Opcode::AbstractClass, span);
        }

        let superclass_name = decl.superclass;
        if let Some(super_name) = superclass_name {
            self.load_global(super_name, span);
            self.emit(Opcode::Inherit, span);
        }
        self.class_stack.push(ClassCtx { superclass_name });

        // Trait-contributed methods first so explicit methods/fields
        // override them (HashMap insert-overwrite at runtime).
        for using in &decl.body.using {
            self.compile_using(using, span);
        }
        for field in &decl.body.fields {
            self.compile_field(field);
        }
        for method in &decl.body.methods {
            self.compile_method(method, decl.is_abstract, span);
        }

        let (ctor_func, ctor_id) = self.compile_constructor_value(decl);
        self.emit_closure(ctor_func, ctor_id, span);
        self.emit(Opcode::Constructor, span);

        self.class_stack.pop();

        for nested in &decl.body.nested_objects {
            self.class_decl(nested, true);
            let name_const = self.name_const(nested.name);
            self.emit(Opcode::Method, span);
            self.emit_u8(name_const);
        }

        if !is_expression {
            self.store_global(decl.name, span);
        }
    }

    fn compile_using(&mut self, using: &UsingItem, span: Span) {
        let Some(template) = self.traits.get(&using.trait_name).cloned() else { return };
        for (name, variants) in template.methods {
            if using.excludes.contains(&name) {
                continue;
            }
            let final_name = using
                .renames
                .iter()
                .find(|(from, _)| *from == name)
                .map(|(_, to)| *to)
                .unwrap_or(name);
            for (func_value, attrs) in variants {
                self.emit_field_attrs(final_name, attrs, span);
                let const_idx = self.const_value(func_value);
                self.emit(Opcode::Closure, span);
                self.emit_u8(const_idx);
                let storage_name = self.member_storage_name(final_name, attrs);
                let name_const = self.name_const(storage_name);
                self.emit(Opcode::Method, span);
                self.emit_u8(name_const);
            }
        }
    }

    /// Getter and setter methods may share a surface name (`get x()` /
    /// `set x(v)`); store the setter under a distinct key so it doesn't
    /// clobber the getter in `Class.methods`. `Class.fields` (attrs) stays
    /// keyed by the plain name — that's what `GetProperty`/`SetProperty`
    /// dispatch consults to decide getter/setter routing.
    fn member_storage_name(&mut self, name: Symbol, attrs: MemberAttributes) -> Symbol {
        if attrs.setter {
            let plain = self.interner.resolve(name).to_string();
            self.interner.intern(&format!("{plain}="))
        } else {
            name
        }
    }

    /// `FIELD` only records the member's attributes on the class; a real
    /// `FieldDecl`'s initializer is compiled into the constructor (see
    /// `compile_constructor_value`), matched against `Instance.fields` at
    /// instance-creation time by the VM.
    fn compile_field(&mut self, field: &FieldDecl) {
        self.emit_field_attrs(field.name, field.attrs, field.span);
    }

    fn compile_method(&mut self, method: &MethodDecl, class_is_abstract: bool, span: Span) {
        self.emit_field_attrs(method.name, method.attrs, method.span);
        match &method.body {
            Some(body) => {
                let fd = FunctionDecl {
                    id: method.id,
                    name: method.name,
                    params: method.params.clone(),
                    body: body.clone(),
                    span: method.span,
                };
                let func_id = self.compile_function_value(&fd, false);
                self.emit_closure(func_id, method.id, method.span);
                let storage_name = self.member_storage_name(method.name, method.attrs);
                let name_const = self.name_const(storage_name);
                self.emit(Opcode::Method, span);
                self.emit_u8(name_const);
            }
            None => {
                debug_assert!(method.attrs.abstract_ || class_is_abstract);
            }
        }
    }

    /// `FIELD name attrs_byte` — beyond the single name-constant operand
    /// the disassembler's generic fallback assumes, this compiler packs
    /// the five `MemberAttributes` booleans into one extra inline byte
    /// (mirrored in `bytecode::disasm` and the VM's `Field` handler); not
    /// a new opcode, just a second operand byte.
    fn emit_field_attrs(&mut self, name: Symbol, attrs: MemberAttributes, span: Span) {
        let name_const = self.name_const(name);
        self.emit(Opcode::Field, span);
        self.emit_u8(name_const);
        self.emit_u8(pack_attrs(attrs));
    }

    fn compile_constructor_value(&mut self, decl: &ClassDecl) -> (ObjectId, NodeId) {
        let span = decl.span;
        let (ctor_id, params, super_args, user_body) = match &decl.body.constructor {
            Some(c) => (c.id, c.params.clone(), c.super_args.clone(), Some(&c.body)),
            None => (decl.id, Vec::new(), None, None),
        };
        self.fn_stack.push(FnCtx::new());
        for _ in &params {
            self.declare_slot(ctor_id);
        }
        if let Some(args) = &super_args {
            for arg in args {
                self.expr(arg);
            }
            self.emit(Opcode::CallSuperConstructor, span);
            self.emit_u8(args.len() as u8);
            self.emit(Opcode::Pop, span);
        }
        for field in &decl.body.fields {
            self.emit(Opcode::Get, span);
            self.emit_u8(0);
            match &field.initializer {
                Some(init) => self.expr(init),
                None => self.emit(Opcode::Nil, field.span),
            }
            let name_const = self.name_const(field.name);
            self.emit(Opcode::SetProperty, field.span);
            self.emit_u8(name_const);
            self.emit(Opcode::Pop, field.span);
        }
        if let Some(body) = user_body {
            self.compile_block_statements_top(body);
            if let Some(Stmt::Expr { expr, .. }) = self.last_tail_index(&body.statements).map(|i| &body.statements[i]) {
                self.expr(expr);
                self.emit(Opcode::Pop, span);
            }
        }
        self.emit(Opcode::Get, span);
        self.emit_u8(0);
        self.emit(Opcode::Return, span);

        let ctx = self.fn_stack.pop().expect("constructor context");
        let upvalue_count = self.analysis.function_upvalues.get(&ctor_id).map(|v| v.len()).unwrap_or(0);
        let func = Function {
            name: decl.name,
            arity: params.len(),
            bytecode: ctx.bytecode,
            upvalue_count,
            is_constructor: true,
        };
        (self.heap.allocate(Object::Function(func)), ctor_id)
    }
}

fn pack_attrs(attrs: MemberAttributes) -> u8 {
    (attrs.private as u8)
        | (attrs.is_override as u8) << 1
        | (attrs.abstract_ as u8) << 2
        | (attrs.getter as u8) << 3
        | (attrs.setter as u8) << 4
}

pub fn unpack_attrs(byte: u8) -> MemberInfo {
    MemberInfo {
        private: byte & 0b1 != 0,
        is_override: byte & 0b10 != 0,
        abstract_: byte & 0b100 != 0,
        getter: byte & 0b1000 != 0,
        setter: byte & 0b10000 != 0,
    }
}
