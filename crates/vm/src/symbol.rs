//! Interned symbols for the Skein Virtual Machine.
//!
//! Symbols are interned per thread, so two symbols with the same name
//! share the same allocation and compare equal in constant time. The VM
//! is single-threaded; a thread-local interner keeps the type `!Send`
//! friendly without locking.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use hashbrown::HashMap;

thread_local! {
    static INTERNER: RefCell<HashMap<Box<str>, Symbol>> = RefCell::new(HashMap::new());
}

/// An interned symbol.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Symbol(Rc<str>);

impl Symbol {
    /// Interns `name`, returning the canonical symbol for it.
    pub fn intern(name: &str) -> Self {
        INTERNER.with(|table| {
            let mut table = table.borrow_mut();
            if let Some(sym) = table.get(name) {
                return sym.clone();
            }
            let sym = Symbol(Rc::from(name));
            table.insert(Box::from(name), sym.clone());
            sym
        })
    }

    /// Returns the symbol's name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identity comparison. Equivalent to `==` for interned symbols but
    /// never inspects the characters.
    pub fn identical(&self, other: &Symbol) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Symbol({})", self.0)
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_shares_storage() {
        let a = Symbol::intern("lambda");
        let b = Symbol::intern("lambda");
        assert!(a.identical(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_names_differ() {
        let a = Symbol::intern("car");
        let b = Symbol::intern("cdr");
        assert!(!a.identical(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_display_is_bare_name() {
        assert_eq!(Symbol::intern("set!").to_string(), "set!");
    }
}
