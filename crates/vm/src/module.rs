//! Modules and global binding cells for the Skein Virtual Machine.
//!
//! The VM reads only a narrow slice of the module subsystem: a module is
//! a named table of binding cells that serves as the root of environment
//! chains. A binding cell is shared between the module table and the
//! resolved-reference table built by global patching, so mutating either
//! side is observed by both.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use crate::symbol::Symbol;
use crate::value::Value;

/// A shared global binding cell.
pub type Binding = Rc<RefCell<Value>>;

/// A module: a name plus a table of global binding cells.
pub struct Module {
    name: Symbol,
    table: RefCell<HashMap<Symbol, Binding>>,
}

impl Module {
    /// Creates an empty module.
    pub fn new(name: &str) -> Rc<Self> {
        Rc::new(Self {
            name: Symbol::intern(name),
            table: RefCell::new(HashMap::new()),
        })
    }

    /// Returns the module name.
    pub fn name(&self) -> &Symbol {
        &self.name
    }

    /// Defines (or redefines) a global, returning its binding cell.
    pub fn define(&self, name: Symbol, value: Value) -> Binding {
        let mut table = self.table.borrow_mut();
        match table.get(&name) {
            Some(cell) => {
                *cell.borrow_mut() = value;
                cell.clone()
            }
            None => {
                let cell = Rc::new(RefCell::new(value));
                table.insert(name, cell.clone());
                cell
            }
        }
    }

    /// Looks up the binding cell for `name`.
    pub fn lookup(&self, name: &Symbol) -> Option<Binding> {
        self.table.borrow().get(name).cloned()
    }
}
