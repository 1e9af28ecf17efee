//! Semantic analysis: name resolution, closure-capture analysis, and
//! class/trait structural validation
//!
//! One pass over the AST, maintaining a stack of the function/class/trait
//! contexts currently open (mirroring `Analyzer`'s `node_stack` walk in the
//! reference implementation). Every name reference and assignment target
//! gets a [`Binding`]; every diagnostic uses the `BT3xxx` code range.

pub mod binding;

use crate::ast::*;
use crate::diagnostic::Diagnostic;
use crate::interner::{Interner, Symbol};
use crate::span::Span;
use binding::{
    Binding, ClassEnvironment, FunctionEnvironment, GlobalEnvironment, MemberInfo,
    TraitEnvironment, UpvalueDescriptor,
};
use std::collections::{HashMap, HashSet};

pub struct AnalysisResult {
    pub bindings: HashMap<NodeId, Binding>,
    /// Declaration-site `NodeId`s of locals captured by at least one inner
    /// closure; consulted by the compiler to decide `CLOSE_UPVALUE` vs `POP`.
    pub captured: HashSet<NodeId>,
    /// Each function/method/constructor's deduplicated upvalue descriptor
    /// list, keyed by its declaration `NodeId`. The compiler reads this to
    /// emit a `CLOSURE` instruction's trailing `{is_local, index}` bytes.
    pub function_upvalues: HashMap<NodeId, Vec<UpvalueDescriptor>>,
    pub diagnostics: Vec<Diagnostic>,
}

impl AnalysisResult {
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.level == crate::diagnostic::DiagnosticLevel::Error)
    }
}

enum Context {
    Function(FunctionEnvironment),
    Class {
        env: ClassEnvironment,
        has_superclass: bool,
    },
    Trait(TraitEnvironment),
    Loop {
        label: Option<Symbol>,
    },
}

pub struct Analyzer<'a> {
    interner: &'a Interner,
    stack: Vec<Context>,
    globals: GlobalEnvironment,
    bindings: HashMap<NodeId, Binding>,
    captured: HashSet<NodeId>,
    function_upvalues: HashMap<NodeId, Vec<UpvalueDescriptor>>,
    diagnostics: Vec<Diagnostic>,
}

impl<'a> Analyzer<'a> {
    pub fn new(interner: &'a Interner) -> Self {
        Self {
            interner,
            stack: Vec::new(),
            globals: GlobalEnvironment::default(),
            bindings: HashMap::new(),
            captured: HashSet::new(),
            function_upvalues: HashMap::new(),
            diagnostics: Vec::new(),
        }
    }

    pub fn analyze(mut self, program: &Program) -> AnalysisResult {
        for stmt in &program.statements {
            self.declare_top_level(stmt);
        }
        for stmt in &program.statements {
            self.stmt(stmt);
        }
        AnalysisResult {
            bindings: self.bindings,
            captured: self.captured,
            function_upvalues: self.function_upvalues,
            diagnostics: self.diagnostics,
        }
    }

    fn text(&self, sym: Symbol) -> &str {
        self.interner.resolve(sym)
    }

    fn error(&mut self, code: &str, message: impl Into<String>, span: Span, label: impl Into<String>) {
        self.diagnostics.push(
            Diagnostic::error_with_code(code, message, span).with_label(label),
        );
    }

    // ---- declaration insertion (spec §4.4 "Declarations") ----

    fn declare_top_level(&mut self, stmt: &Stmt) {
        let (name, id) = match stmt {
            Stmt::Var { name, id, .. } => (*name, *id),
            Stmt::Function(f) => (f.name, f.id),
            Stmt::Native { name, id, .. } => (*name, *id),
            Stmt::Class(c) | Stmt::Object(c) => (c.name, c.id),
            Stmt::Trait(t) => (t.name, t.id),
            Stmt::Expr { .. } => return,
        };
        self.declare_value(name, id, stmt.span());
    }

    /// Declare `name` in whatever environment is current: a function's
    /// local scope if one is open, the flat global table otherwise. Outside
    /// any function, *every* nesting level (top-level statement sequence or
    /// a block nested inside a top-level `if`/`loop`) shares the one global
    /// table — Bite has no block-scoped globals.
    fn declare_value(&mut self, name: Symbol, id: NodeId, span: Span) {
        if self.in_function() {
            self.declare_local(name, id, span);
            return;
        }
        // `declare_top_level` already inserted direct top-level statements
        // ahead of the walk that calls back into here; re-inserting the same
        // node is a no-op, not a redeclaration.
        match self.globals.names.insert(name, id) {
            Some(prev) if prev != id => {
                self.error(
                    "BT3001",
                    format!("redeclaration of '{}'", self.text(name)),
                    span,
                    "already declared at global scope",
                );
            }
            _ => {}
        }
    }

    fn declare_local(&mut self, name: Symbol, id: NodeId, span: Span) {
        let Some(Context::Function(env)) = self.innermost_function_mut() else {
            return;
        };
        if let Some(_prev) = env.redeclared_in_current_scope(name) {
            self.error(
                "BT3001",
                format!("redeclaration of '{}'", self.text(name)),
                span,
                "already declared in this scope",
            );
            return;
        }
        env.declare_local(name, id);
    }

    fn innermost_function_mut(&mut self) -> Option<&mut Context> {
        self.stack
            .iter_mut()
            .rev()
            .find(|c| matches!(c, Context::Function(_)))
    }

    fn in_function(&self) -> bool {
        self.stack.iter().any(|c| matches!(c, Context::Function(_)))
    }

    fn in_loop(&self, label: Option<Symbol>) -> bool {
        match label {
            None => self.stack.iter().any(|c| matches!(c, Context::Loop { .. })),
            Some(l) => self
                .stack
                .iter()
                .any(|c| matches!(c, Context::Loop { label: Some(x) } if *x == l)),
        }
    }

    fn in_class(&self) -> bool {
        self.stack.iter().any(|c| matches!(c, Context::Class { .. }))
    }

    fn current_class_has_superclass(&self) -> bool {
        self.stack.iter().rev().find_map(|c| match c {
            Context::Class { has_superclass, .. } => Some(*has_superclass),
            _ => None,
        }).unwrap_or(false)
    }

    // ---- statements ----

    fn stmt(&mut self, stmt: &Stmt) {
        match stmt {
            Stmt::Var { id, name, initializer, span } => {
                if let Some(init) = initializer {
                    self.expr(init);
                }
                // Direct top-level `var`s were already declared (in textual
                // order) by `declare_top_level`; `declare_value` treats that
                // as a no-op. Anything nested inside a top-level block, or
                // local to a function, is declared here for the first time.
                self.declare_value(*name, *id, *span);
            }
            Stmt::Expr { expr, .. } => self.expr(expr),
            Stmt::Function(f) => self.function(f, false, false),
            Stmt::Native { .. } => {}
            Stmt::Class(c) | Stmt::Object(c) => self.class(c),
            Stmt::Trait(t) => self.trait_decl(t),
        }
    }

    fn function(&mut self, f: &FunctionDecl, is_method: bool, is_constructor: bool) {
        let mut env = FunctionEnvironment::new(f.id, is_method, is_constructor);
        for param in &f.params {
            let slot = env.next_slot;
            env.next_slot += 1;
            env.scopes.last_mut().unwrap().push(binding::LocalSlot {
                name: param.name,
                slot,
                is_captured: false,
                declaration: f.id,
            });
        }
        self.stack.push(Context::Function(env));
        for stmt in &f.body.statements {
            self.declare_top_level_in_block(stmt);
        }
        for stmt in &f.body.statements {
            self.stmt(stmt);
        }
        self.pop_function();
    }

    fn declare_top_level_in_block(&mut self, stmt: &Stmt) {
        // Function declarations inside a function body are hoisted into
        // that function's scope so recursive calls resolve (spec §4.4).
        if let Stmt::Function(f) = stmt {
            self.declare_local(f.name, f.id, f.span);
        }
    }

    fn class(&mut self, decl: &ClassDecl) {
        self.class_body(decl.is_abstract, decl.superclass, &decl.body, decl.span);
    }

    fn class_body(
        &mut self,
        is_abstract: bool,
        superclass: Option<Symbol>,
        body: &ClassBody,
        span: Span,
    ) {
        let mut env = ClassEnvironment::default();
        let mut overridable: HashSet<Symbol> = HashSet::new();
        let has_superclass = superclass.is_some();
        if let Some(super_name) = superclass {
            if self.globals.names.get(&super_name).is_none() {
                self.error(
                    "BT3010",
                    format!("unresolved superclass '{}'", self.text(super_name)),
                    span,
                    "no such class",
                );
            }
            // Non-private members of the (unknown-here) superclass would be
            // pulled in; without a full symbol table for cross-class lookup
            // we accept any override as legal rather than rejecting it.
            env.has_superclass = true;
        }

        for field in &body.fields {
            if field.attrs.abstract_ && !is_abstract {
                self.error(
                    "BT3011",
                    "abstract member outside abstract class",
                    field.span,
                    "mark the class `abstract` or remove `abstract` here",
                );
            }
            env.members.insert(
                field.name,
                MemberInfo {
                    private: field.attrs.private,
                    is_override: field.attrs.is_override,
                    abstract_: field.attrs.abstract_,
                    getter: false,
                    setter: false,
                },
            );
            overridable.insert(field.name);
        }

        for method in &body.methods {
            if method.attrs.abstract_ && !is_abstract {
                self.error(
                    "BT3011",
                    "abstract member outside abstract class",
                    method.span,
                    "mark the class `abstract` or remove `abstract` here",
                );
            }
            if method.body.is_none() && !method.attrs.abstract_ {
                self.error(
                    "BT3012",
                    format!("method '{}' has no body", self.text(method.name)),
                    method.span,
                    "expected `{ ... }` or mark as `abstract`",
                );
            }
            let entry = env.members.entry(method.name).or_insert(MemberInfo {
                private: method.attrs.private,
                is_override: method.attrs.is_override,
                abstract_: method.attrs.abstract_,
                getter: false,
                setter: false,
            });
            if method.attrs.getter {
                entry.getter = true;
            }
            if method.attrs.setter {
                entry.setter = true;
            }
            overridable.insert(method.name);
        }

        for using in &body.using {
            let declared_trait = self.globals.names.get(&using.trait_name).copied();
            if declared_trait.is_none() {
                self.error(
                    "BT3013",
                    format!("'{}' is not a known trait or variable", self.text(using.trait_name)),
                    using.span,
                    "using item must resolve to a trait",
                );
            }
            for exclude in &using.excludes {
                env.members.remove(exclude);
            }
            for (from, to) in &using.renames {
                if let Some(info) = env.members.remove(from) {
                    env.members.insert(*to, info);
                }
            }
        }

        self.stack.push(Context::Class { env, has_superclass });
        if let Some(ctor) = &body.constructor {
            self.constructor(ctor, has_superclass);
        }
        for field in &body.fields {
            if let Some(init) = &field.initializer {
                self.expr(init);
            }
        }
        for method in &body.methods {
            if let Some(method_body) = &method.body {
                let fd = FunctionDecl {
                    id: method.id,
                    name: method.name,
                    params: method.params.clone(),
                    body: method_body.clone(),
                    span: method.span,
                };
                self.function(&fd, true, false);
            }
        }
        for nested in &body.nested_objects {
            self.class(nested);
        }
        self.stack.pop();
    }

    fn constructor(&mut self, ctor: &ConstructorDecl, has_superclass: bool) {
        if ctor.super_args.is_some() && !has_superclass {
            self.error(
                "BT3014",
                "`super(...)` call with no declared superclass",
                ctor.span,
                "this class has no superclass",
            );
        }
        let mut env = FunctionEnvironment::new(ctor.id, true, true);
        for param in &ctor.params {
            let slot = env.next_slot;
            env.next_slot += 1;
            env.scopes.last_mut().unwrap().push(binding::LocalSlot {
                name: param.name,
                slot,
                is_captured: false,
                declaration: ctor.id,
            });
        }
        self.stack.push(Context::Function(env));
        if let Some(args) = &ctor.super_args {
            for arg in args {
                self.expr(arg);
            }
        }
        for stmt in &ctor.body.statements {
            self.declare_top_level_in_block(stmt);
        }
        for stmt in &ctor.body.statements {
            self.stmt(stmt);
        }
        self.pop_function();
    }

    fn pop_function(&mut self) {
        if let Some(Context::Function(env)) = self.stack.pop() {
            self.function_upvalues.insert(env.decl_id, env.upvalues);
        }
    }

    fn trait_decl(&mut self, decl: &TraitDecl) {
        let mut env = TraitEnvironment::default();
        for method in &decl.methods {
            env.members.insert(
                method.name,
                MemberInfo {
                    private: method.attrs.private,
                    is_override: method.attrs.is_override,
                    abstract_: method.attrs.abstract_ || method.body.is_none(),
                    getter: method.attrs.getter,
                    setter: method.attrs.setter,
                },
            );
        }
        self.stack.push(Context::Trait(env));
        for method in &decl.methods {
            if let Some(body) = &method.body {
                let fd = FunctionDecl {
                    id: method.id,
                    name: method.name,
                    params: method.params.clone(),
                    body: body.clone(),
                    span: method.span,
                };
                self.function(&fd, true, false);
            }
        }
        self.stack.pop();
    }

    // ---- expressions ----

    fn expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Integer { .. }
            | Expr::Float { .. }
            | Expr::StringLit { .. }
            | Expr::Bool { .. }
            | Expr::Nil { .. }
            | Expr::Invalid { .. } => {}
            Expr::This { id, span } => {
                if !self.in_class() {
                    self.error("BT3020", "`this` outside a class", *span, "no enclosing class");
                }
                self.bindings.insert(*id, Binding::NoBinding);
            }
            Expr::Variable { id, name, span } => {
                let binding = self.resolve(*name, *span);
                if matches!(binding, Binding::NoBinding) {
                    self.error(
                        "BT3002",
                        format!("unresolved variable '{}'", self.text(*name)),
                        *span,
                        "not found in any enclosing scope",
                    );
                }
                self.bindings.insert(*id, binding);
            }
            Expr::Unary { operand, .. } => self.expr(operand),
            Expr::Binary { left, right, .. } => {
                self.expr(left);
                self.expr(right);
            }
            Expr::Range { start, end, .. } => {
                self.expr(start);
                self.expr(end);
            }
            Expr::Assign { id, target, value, .. } => {
                self.expr(value);
                let binding = self.assign_target(target, expr.span());
                self.bindings.insert(*id, binding);
            }
            Expr::Call { callee, args, .. } => {
                self.expr(callee);
                for a in args {
                    self.expr(a);
                }
            }
            Expr::GetProperty { id, object, name, .. } => {
                self.expr(object);
                self.bindings.insert(*id, Binding::MemberBinding { name: *name });
            }
            Expr::Super { id, name, span } => {
                if !self.current_class_has_superclass() {
                    self.error(
                        "BT3021",
                        "`super` outside a class with a declared superclass",
                        *span,
                        "no superclass in scope",
                    );
                }
                self.bindings.insert(*id, Binding::SuperBinding { name: *name });
            }
            Expr::Block { block, label, .. } => {
                self.block(block, label.as_ref().map(|l| l.name));
            }
            Expr::If { condition, then_branch, else_branch, .. } => {
                self.expr(condition);
                self.block(then_branch, None);
                if let Some(e) = else_branch {
                    self.expr(e);
                }
            }
            Expr::Loop { body, label, .. } => {
                self.stack.push(Context::Loop {
                    label: label.as_ref().map(|l| l.name),
                });
                self.block(body, label.as_ref().map(|l| l.name));
                self.stack.pop();
            }
            Expr::While { condition, body, label, .. } => {
                self.expr(condition);
                self.stack.push(Context::Loop {
                    label: label.as_ref().map(|l| l.name),
                });
                self.block(body, label.as_ref().map(|l| l.name));
                self.stack.pop();
            }
            Expr::For { binding, iterable, body, label, id, .. } => {
                self.expr(iterable);
                self.stack.push(Context::Loop {
                    label: label.as_ref().map(|l| l.name),
                });
                self.declare_value(*binding, *id, expr.span());
                self.block(body, label.as_ref().map(|l| l.name));
                self.stack.pop();
            }
            Expr::Break { label, value, span, .. } => {
                if !self.in_loop(*label) {
                    self.error(
                        "BT3022",
                        "`break` with no matching enclosing loop",
                        *span,
                        "label does not match any enclosing loop",
                    );
                }
                if let Some(v) = value {
                    self.expr(v);
                }
            }
            Expr::Continue { label, span, .. } => {
                if !self.in_loop(*label) {
                    self.error(
                        "BT3023",
                        "`continue` outside any loop",
                        *span,
                        "no enclosing loop",
                    );
                }
            }
            Expr::Return { value, span, .. } => {
                if !self.in_function() {
                    self.error("BT3024", "`return` outside any function", *span, "no enclosing function");
                }
                if let Some(v) = value {
                    self.expr(v);
                }
            }
            Expr::ObjectExpr { body, span, .. } => {
                self.class_body(false, None, body, *span);
            }
        }
    }

    fn block(&mut self, block: &Block, label: Option<Symbol>) {
        let pushed_loop = label.is_some() && !matches!(self.stack.last(), Some(Context::Loop { .. }));
        if pushed_loop {
            self.stack.push(Context::Loop { label });
        }
        if let Some(Context::Function(env)) = self.innermost_function_mut() {
            env.push_scope();
        }
        for stmt in &block.statements {
            self.declare_top_level_in_block(stmt);
        }
        for stmt in &block.statements {
            self.stmt(stmt);
        }
        if let Some(Context::Function(env)) = self.innermost_function_mut() {
            env.pop_scope();
        }
        if pushed_loop {
            self.stack.pop();
        }
    }

    fn assign_target(&mut self, target: &AssignTarget, span: Span) -> Binding {
        match target {
            AssignTarget::Variable(name) => {
                let binding = self.resolve(*name, span);
                if matches!(binding, Binding::NoBinding) {
                    self.error(
                        "BT3002",
                        format!("unresolved variable '{}'", self.text(*name)),
                        span,
                        "not found in any enclosing scope",
                    );
                }
                binding
            }
            AssignTarget::Property { object, name } => {
                self.expr(object);
                Binding::PropertyBinding {
                    name: *name,
                    getter: false,
                    setter: true,
                }
            }
            AssignTarget::Super { name } => {
                if !self.current_class_has_superclass() {
                    self.error(
                        "BT3021",
                        "`super` outside a class with a declared superclass",
                        span,
                        "no superclass in scope",
                    );
                }
                Binding::SuperBinding { name: *name }
            }
        }
    }

    // ---- name resolution (spec §4.4 "Name resolution", the 6-step walk) ----

    fn resolve(&mut self, name: Symbol, span: Span) -> Binding {
        let mut crossed_functions: Vec<usize> = Vec::new();

        for (idx, ctx) in self.stack.iter().enumerate().rev() {
            match ctx {
                Context::Function(env) => {
                    let in_params_or_locals = env
                        .scopes
                        .iter()
                        .rev()
                        .flat_map(|s| s.iter())
                        .find(|l| l.name == name)
                        .map(|l| (l.slot, l.declaration));
                    if let Some((slot, decl_id)) = in_params_or_locals {
                        if crossed_functions.is_empty() {
                            return Binding::LocalBinding { slot };
                        }
                        self.captured.insert(decl_id);
                        return self.thread_upvalue(idx, slot, &crossed_functions);
                    }
                    crossed_functions.push(idx);
                }
                Context::Class { env, .. } => {
                    if let Some(_info) = env.members.get(&name) {
                        return Binding::MemberBinding { name };
                    }
                }
                Context::Trait(env) => {
                    if let Some(_info) = env.members.get(&name) {
                        return Binding::MemberBinding { name };
                    }
                }
                Context::Loop { .. } => {}
            }
        }

        if self.globals.names.contains_key(&name) {
            return Binding::GlobalBinding { name };
        }
        let _ = span;
        Binding::NoBinding
    }

    /// Build the chain of `UpvalueDescriptor`s from the function holding
    /// `slot` (at `owner_idx` in `self.stack`) out through every function
    /// the search crossed, per spec §4.4 point 4.
    fn thread_upvalue(&mut self, owner_idx: usize, slot: u16, crossed: &[usize]) -> Binding {
        // `crossed` is the sequence of function-context stack indices
        // visited innermost-last (since we iterate the stack in reverse);
        // reverse it so we thread from just-outside-the-owner back to the
        // innermost function.
        let mut ordered: Vec<usize> = crossed.to_vec();
        ordered.reverse(); // now innermost-enclosing-owner first... i.e. outermost of the crossed set first
        // `ordered` currently lists function indices from the one closest to
        // `owner_idx` (smallest stack index greater than owner) to the
        // innermost. We thread the descriptor starting at the function
        // right outside the owner.
        let mut prev_is_local = true;
        let mut prev_index = slot;
        let mut last_upvalue_index = 0u16;
        for &fn_idx in ordered.iter() {
            if let Context::Function(env) = &mut self.stack[fn_idx] {
                let descriptor = UpvalueDescriptor {
                    is_local: prev_is_local,
                    index: prev_index,
                };
                let upvalue_idx = env.add_upvalue(descriptor);
                prev_is_local = false;
                prev_index = upvalue_idx;
                last_upvalue_index = upvalue_idx;
            }
        }
        let _ = owner_idx;
        Binding::UpvalueBinding {
            index: last_upvalue_index,
        }
    }
}
