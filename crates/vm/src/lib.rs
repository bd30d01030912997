//! # Skein Virtual Machine
//!
//! The execution engine of the Skein Scheme-family runtime: a
//! register-and-stack bytecode interpreter with first-class procedures,
//! proper tail calls, multiple return values, reified continuations,
//! exception handlers and method-dispatching generic functions.
//!
//! ## Architecture
//!
//! - **Engine**: register file, dispatch loop, call protocol and the
//!   raising entry point of the handler protocol
//! - **ValueStack**: one contiguous array carrying operands, activation
//!   records and handler records
//! - **Value / Frame / Module**: the tagged value universe and the
//!   lexical environment chain
//! - **Continuation**: stack-image capture and multi-shot restoration
//! - **CodeChunk / loader**: patchable 16-bit instruction streams and
//!   the signed bytecode container format
//! - **CodeBuilder**: programmatic bytecode construction
//!
//! ## Example
//!
//! ```
//! use skein_vm::{CodeBuilder, Engine, OpCode};
//!
//! # fn main() -> skein_vm::VmResult<()> {
//! // (+ 3 4), using the inlined addition opcode.
//! let mut code = CodeBuilder::new();
//! code.emit1(OpCode::SMALL_INT, 3);
//! code.emit(OpCode::PUSH);
//! code.emit1(OpCode::SMALL_INT, 4);
//! code.emit(OpCode::IN_ADD2);
//! let (chunk, constants) = code.finish();
//!
//! let mut engine = Engine::default();
//! let result = engine.execute(chunk, constants, None)?;
//! assert_eq!(result.as_fixnum()?, 7);
//! # Ok(())
//! # }
//! ```

#![warn(rustdoc::missing_crate_level_docs)]

/// The call protocol: closure, primitive, generic and trampoline dispatch
pub mod call;
/// Patchable instruction streams and the disassembler
pub mod code;
/// Programmatic bytecode construction
pub mod code_builder;
/// First-class continuations
pub mod continuation;
/// Register file, dispatch loop and entry points
pub mod engine;
/// VM error types and result handling
pub mod error;
/// Lexical environment frames
pub mod frame;
/// Inlined primitive opcodes
pub mod inlined;
/// Bytecode container loading and dumping
pub mod loader;
/// Modules and global binding cells
pub mod module;
/// Numeric kernel shared by opcodes and primitives
pub mod number;
/// VM opcode definitions
pub mod op_code;
/// Built-in primitives
pub mod primitives;
/// Datum reader used by the loader
pub mod reader;
/// The contiguous value stack and its record layouts
pub mod stack;
/// Interned symbols
pub mod symbol;
/// The tagged value universe
pub mod value;

pub use code::{disassemble, opcode_name, CodeChunk, CodePtr};
pub use code_builder::{CodeBuilder, Patch};
pub use continuation::Continuation;
pub use engine::{Engine, EngineLimits, MethodResolver, MAX_VALS};
pub use error::{VmError, VmResult};
pub use frame::Frame;
pub use loader::{boot_from_image, dump_code, load_boot_file, load_bytecode, BYTECODE_MARKER};
pub use module::{Binding, Module};
pub use op_code::OpCode;
pub use reader::Reader;
pub use stack::ValueStack;
pub use symbol::Symbol;
pub use value::{
    eq, equal, eqv, Closure, Condition, GenericFunction, NextMethod, ParameterObject, Primitive,
    Subr, Value,
};
