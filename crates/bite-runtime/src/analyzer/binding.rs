//! Binding kinds and the per-scope environments the resolver builds them from

use crate::ast::NodeId;
use crate::interner::Symbol;
use std::collections::HashMap;

/// What a name reference resolves to, once the analyzer has run. Attached
/// to the referencing [`NodeId`] via [`crate::analyzer::AnalysisResult::bindings`]
/// rather than stored on the AST node itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    NoBinding,
    LocalBinding { slot: u16 },
    ParameterBinding { slot: u16 },
    GlobalBinding { name: Symbol },
    UpvalueBinding { index: u16 },
    MemberBinding { name: Symbol },
    PropertyBinding { name: Symbol, getter: bool, setter: bool },
    SuperBinding { name: Symbol },
    ClassObjectBinding { name: Symbol },
}

/// `{is_local, index}` descriptor attached to a closure at compile time,
/// per spec §4.4 point 4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpvalueDescriptor {
    pub is_local: bool,
    pub index: u16,
}

#[derive(Debug, Clone)]
pub struct LocalSlot {
    pub name: Symbol,
    pub slot: u16,
    pub is_captured: bool,
    pub declaration: NodeId,
}

/// One function's worth of local-variable bookkeeping: a stack of lexical
/// scopes (each a `Vec<LocalSlot>`), a running slot counter, and the
/// upvalues this function ends up needing.
#[derive(Debug)]
pub struct FunctionEnvironment {
    /// The `NodeId` of the `FunctionDecl`/`MethodDecl`/`ConstructorDecl` this
    /// environment belongs to, used to key the final upvalue list handed
    /// back to the compiler.
    pub decl_id: NodeId,
    pub scopes: Vec<Vec<LocalSlot>>,
    pub next_slot: u16,
    pub upvalues: Vec<UpvalueDescriptor>,
    pub is_method: bool,
    pub is_constructor: bool,
}

impl FunctionEnvironment {
    pub fn new(decl_id: NodeId, is_method: bool, is_constructor: bool) -> Self {
        Self {
            decl_id,
            scopes: vec![Vec::new()],
            // slot 0 is reserved for `this` (methods/constructors) or a dummy.
            next_slot: 1,
            upvalues: Vec::new(),
            is_method,
            is_constructor,
        }
    }

    pub fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    pub fn pop_scope(&mut self) -> Vec<LocalSlot> {
        self.scopes.pop().unwrap_or_default()
    }

    pub fn declare_local(&mut self, name: Symbol, declaration: NodeId) -> u16 {
        let slot = self.next_slot;
        self.next_slot += 1;
        self.scopes
            .last_mut()
            .expect("function environment always has an open scope")
            .push(LocalSlot {
                name,
                slot,
                is_captured: false,
                declaration,
            });
        slot
    }

    pub fn redeclared_in_current_scope(&self, name: Symbol) -> Option<NodeId> {
        self.scopes
            .last()
            .and_then(|scope| scope.iter().find(|l| l.name == name))
            .map(|l| l.declaration)
    }

    /// Search this function's scopes innermost-out.
    pub fn find_local(&mut self, name: Symbol) -> Option<&mut LocalSlot> {
        for scope in self.scopes.iter_mut().rev() {
            if let Some(local) = scope.iter_mut().find(|l| l.name == name) {
                return Some(local);
            }
        }
        None
    }

    /// Insert an upvalue descriptor, reusing an existing matching one
    /// (spec §4.4 point 4: "deduplicated").
    pub fn add_upvalue(&mut self, descriptor: UpvalueDescriptor) -> u16 {
        if let Some(idx) = self.upvalues.iter().position(|u| *u == descriptor) {
            return idx as u16;
        }
        self.upvalues.push(descriptor);
        (self.upvalues.len() - 1) as u16
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemberInfo {
    pub private: bool,
    pub is_override: bool,
    pub abstract_: bool,
    pub getter: bool,
    pub setter: bool,
}

/// A class's member lookup table, built while validating its body (spec
/// §4.4 "Class/trait validation").
#[derive(Debug, Default)]
pub struct ClassEnvironment {
    pub members: HashMap<Symbol, MemberInfo>,
    pub class_object_members: HashMap<Symbol, MemberInfo>,
    pub has_superclass: bool,
}

/// A trait's member table; abstract members become *requirements* that a
/// composing class must satisfy (spec §4.4 point 4).
#[derive(Debug, Default)]
pub struct TraitEnvironment {
    pub members: HashMap<Symbol, MemberInfo>,
}

#[derive(Debug, Default)]
pub struct GlobalEnvironment {
    pub names: HashMap<Symbol, NodeId>,
}
