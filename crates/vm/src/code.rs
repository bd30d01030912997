//! Instruction stream representation for the Skein Virtual Machine.
//!
//! A [`CodeChunk`] is a shared vector of 16-bit instruction words. The
//! decoder resolves global references lazily and rewrites them in place
//! (`GLOBAL_REF` becomes `UGLOBAL_REF` once the binding cell is known),
//! so the words live behind interior mutability. The VM is the single
//! writer; plain stores suffice.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use once_cell::sync::Lazy;

use crate::error::{VmError, VmResult};
use crate::op_code::{OpCode, ALL_OPCODES, OPCODE_COUNT};

/// A shared, patchable sequence of 16-bit instruction words.
pub struct CodeChunk {
    words: RefCell<Vec<u16>>,
}

impl CodeChunk {
    /// Wraps a vector of instruction words.
    pub fn new(words: Vec<u16>) -> Rc<Self> {
        Rc::new(Self {
            words: RefCell::new(words),
        })
    }

    /// Returns the number of instruction words.
    pub fn len(&self) -> usize {
        self.words.borrow().len()
    }

    /// Returns true when the chunk contains no words.
    pub fn is_empty(&self) -> bool {
        self.words.borrow().is_empty()
    }

    /// Reads the word at `pos`.
    pub fn fetch(&self, pos: usize) -> VmResult<u16> {
        self.words
            .borrow()
            .get(pos)
            .copied()
            .ok_or_else(|| VmError::bad_bytecode(format!("truncated instruction stream at {pos}")))
    }

    /// Rewrites the instruction starting at `offset` with a new opcode
    /// and operand word. Used by the global-reference patching protocol;
    /// idempotent because the rewrite is a plain two-word store.
    pub fn patch_instruction(&self, offset: usize, new_opcode: OpCode, new_operand: u16) {
        let mut words = self.words.borrow_mut();
        words[offset] = new_opcode as u16;
        words[offset + 1] = new_operand;
    }

    /// Copies the words out, for dumping and tests.
    pub fn to_words(&self) -> Vec<u16> {
        self.words.borrow().clone()
    }
}

impl fmt::Debug for CodeChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodeChunk({} words)", self.len())
    }
}

/// A position inside a code chunk, as saved in activation records,
/// VM-state records and handler records.
#[derive(Clone)]
pub struct CodePtr {
    /// The chunk the position points into.
    pub chunk: Rc<CodeChunk>,
    /// Word index inside the chunk.
    pub pos: usize,
}

impl CodePtr {
    /// Creates a code pointer.
    pub fn new(chunk: Rc<CodeChunk>, pos: usize) -> Self {
        Self { chunk, pos }
    }
}

impl fmt::Debug for CodePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CodePtr(+{})", self.pos)
    }
}

static NAME_TABLE: Lazy<Vec<&'static str>> = Lazy::new(|| {
    ALL_OPCODES
        .iter()
        .map(|op| {
            // Debug formatting of the variants is exactly the mnemonic.
            let name: &'static str = Box::leak(format!("{op:?}").into_boxed_str());
            name
        })
        .collect()
});

/// Returns the mnemonic for an opcode word, or `"???"` for an invalid one.
pub fn opcode_name(word: u16) -> &'static str {
    if word < OPCODE_COUNT {
        NAME_TABLE[word as usize]
    } else {
        "???"
    }
}

/// Renders a chunk as one instruction per line, with word offsets.
pub fn disassemble(chunk: &CodeChunk) -> String {
    let words = chunk.to_words();
    let mut out = String::new();
    let mut pos = 0;
    while pos < words.len() {
        let word = words[pos];
        match OpCode::try_from(word) {
            Ok(op) => {
                out.push_str(&format!("{pos:6}  {}", op.name()));
                for i in 0..op.operand_words() {
                    match words.get(pos + 1 + i) {
                        Some(operand) => out.push_str(&format!(" {operand}")),
                        None => out.push_str(" <truncated>"),
                    }
                }
                out.push('\n');
                pos += 1 + op.operand_words();
            }
            Err(_) => {
                out.push_str(&format!("{pos:6}  ??? ({word})\n"));
                pos += 1;
            }
        }
    }
    out
}
