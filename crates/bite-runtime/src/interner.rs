//! String interning for identifier and string-literal lexemes
//!
//! A process-local table mapping byte strings to stable handles. Handles
//! compare in O(1) and are used as identifiers throughout the lexer, parser,
//! analyzer, and compiler. Insertion is idempotent: interning the same bytes
//! twice returns the same handle.

use std::collections::HashMap;
use std::fmt;

/// A stable handle to an interned string.
///
/// Cheap to copy and compare; the actual bytes live in the [`Interner`] that
/// produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Append-only interner. New strings are always inserted at the end; existing
/// handles stay valid for the process lifetime.
#[derive(Debug, Default)]
pub struct Interner {
    strings: Vec<String>,
    lookup: HashMap<String, Symbol>,
}

impl Interner {
    /// Create an empty interner.
    pub fn new() -> Self {
        Self {
            strings: Vec::new(),
            lookup: HashMap::new(),
        }
    }

    /// Intern `text`, returning its handle. Idempotent.
    pub fn intern(&mut self, text: &str) -> Symbol {
        if let Some(&symbol) = self.lookup.get(text) {
            return symbol;
        }
        let symbol = Symbol(self.strings.len() as u32);
        self.strings.push(text.to_string());
        self.lookup.insert(text.to_string(), symbol);
        symbol
    }

    /// Resolve a handle back to its string slice.
    ///
    /// # Panics
    /// Panics if `symbol` was not produced by this interner.
    pub fn resolve(&self, symbol: Symbol) -> &str {
        &self.strings[symbol.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut interner = Interner::new();
        let a = interner.intern("foo");
        let b = interner.intern("foo");
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_strings_get_distinct_symbols() {
        let mut interner = Interner::new();
        let a = interner.intern("foo");
        let b = interner.intern("bar");
        assert_ne!(a, b);
        assert_eq!(interner.resolve(a), "foo");
        assert_eq!(interner.resolve(b), "bar");
    }
}
