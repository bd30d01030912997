//! OpCode module for the Skein Virtual Machine.
//!
//! This module defines all the instructions supported by the Skein VM.
//! Instructions are 16-bit units: one opcode word optionally followed by
//! one or two operand words (a 16-bit immediate, or two packed 8-bit
//! fields for deep environment accesses).

use crate::error::{VmError, VmResult};

/// Extracts the high byte of a packed two-field operand.
#[inline]
pub fn first_byte(word: u16) -> u16 {
    word >> 8
}

/// Extracts the low byte of a packed two-field operand.
#[inline]
pub fn second_byte(word: u16) -> u16 {
    word & 0xff
}

/// The instructions of the Skein VM.
///
/// The numbering is part of the bytecode format: it is what the compiler
/// emits and what `%dump-code` writes into bytecode containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(non_camel_case_types)]
#[repr(u16)]
pub enum OpCode {
    /// Does nothing.
    NOP = 0,

    // Immediate loads into `val`.
    /// Loads `#f`.
    IM_FALSE = 1,
    /// Loads `#t`.
    IM_TRUE = 2,
    /// Loads the empty list.
    IM_NIL = 3,
    /// Loads the fixnum -1.
    IM_MINUS1 = 4,
    /// Loads the fixnum 0.
    IM_ZERO = 5,
    /// Loads the fixnum 1.
    IM_ONE = 6,
    /// Loads the void value.
    IM_VOID = 7,
    /// Loads a signed 16-bit fixnum operand.
    SMALL_INT = 8,
    /// Loads the constant at pool index `k`.
    CONSTANT = 9,

    // Immediate loads that also push.
    /// Loads `#f` and pushes it.
    FALSE_PUSH = 10,
    /// Loads `#t` and pushes it.
    TRUE_PUSH = 11,
    /// Loads the empty list and pushes it.
    NIL_PUSH = 12,
    /// Loads -1 and pushes it.
    MINUS1_PUSH = 13,
    /// Loads 0 and pushes it.
    ZERO_PUSH = 14,
    /// Loads 1 and pushes it.
    ONE_PUSH = 15,
    /// Loads void and pushes it.
    VOID_PUSH = 16,
    /// Loads a signed 16-bit fixnum operand and pushes it.
    INT_PUSH = 17,
    /// Loads constant `k` and pushes it.
    CONSTANT_PUSH = 18,

    // Global references.
    /// Resolves the symbol at constant index `k` in the current
    /// environment, then patches itself into `UGLOBAL_REF`.
    GLOBAL_REF = 19,
    /// Reads the resolved-reference table at slot `idx`. Never produced
    /// by the compiler; only written by `GLOBAL_REF` patching.
    UGLOBAL_REF = 20,
    /// `GLOBAL_REF` fused with an invocation of `n` arguments.
    GREF_INVOKE = 21,
    /// `UGLOBAL_REF` fused with an invocation of `n` arguments.
    UGREF_INVOKE = 22,
    /// Mutates the global named by constant `k`, then patches itself
    /// into `UGLOBAL_SET`.
    GLOBAL_SET = 23,
    /// Mutates the resolved-reference table slot `idx`.
    UGLOBAL_SET = 24,

    // Local references.
    /// Reads slot 0 of the current frame.
    LOCAL_REF0 = 25,
    /// Reads slot 1 of the current frame.
    LOCAL_REF1 = 26,
    /// Reads slot 2 of the current frame.
    LOCAL_REF2 = 27,
    /// Reads slot 3 of the current frame.
    LOCAL_REF3 = 28,
    /// Reads slot 4 of the current frame.
    LOCAL_REF4 = 29,
    /// Reads slot `n` of the current frame.
    LOCAL_REF = 30,
    /// Reads slot `lo` of the frame `hi` links down the parent chain.
    DEEP_LOCAL_REF = 31,
    /// Writes slot 0 of the current frame.
    LOCAL_SET0 = 32,
    /// Writes slot 1 of the current frame.
    LOCAL_SET1 = 33,
    /// Writes slot 2 of the current frame.
    LOCAL_SET2 = 34,
    /// Writes slot 3 of the current frame.
    LOCAL_SET3 = 35,
    /// Writes slot 4 of the current frame.
    LOCAL_SET4 = 36,
    /// Writes slot `n` of the current frame.
    LOCAL_SET = 37,
    /// Writes slot `lo` of the frame `hi` links down the parent chain.
    DEEP_LOCAL_SET = 38,

    // Control.
    /// Unconditional relative branch.
    GOTO = 39,
    /// Branches when `val` is `#f`.
    JUMP_FALSE = 40,
    /// Branches when `val` is not `#f`.
    JUMP_TRUE = 41,
    /// Pops the left operand and branches when it is numerically equal
    /// to `val`.
    JUMP_NUMEQ = 42,
    /// Pops the left operand and branches when it differs numerically
    /// from `val`.
    JUMP_NUMDIFF = 43,
    /// Pops the left operand and branches on `<`.
    JUMP_NUMLT = 44,
    /// Pops the left operand and branches on `<=`.
    JUMP_NUMLE = 45,
    /// Pops the left operand and branches on `>`.
    JUMP_NUMGT = 46,
    /// Pops the left operand and branches on `>=`.
    JUMP_NUMGE = 47,
    /// Pops the left operand and branches when it is not `eq?` to `val`.
    JUMP_NOT_EQ = 48,
    /// Pops the left operand and branches when it is not `eqv?` to `val`.
    JUMP_NOT_EQV = 49,
    /// Pops the left operand and branches when it is not `equal?` to `val`.
    JUMP_NOT_EQUAL = 50,

    // Definitions and modules.
    /// Defines the symbol at constant index `k` in the current
    /// environment with the value in `val`.
    DEFINE_SYMBOL = 51,
    /// Switches the current module to the module in `val`.
    SET_CUR_MOD = 52,

    // Stack transfers.
    /// Pops the stack top into `val`.
    POP = 53,
    /// Pushes `val`.
    PUSH = 54,

    /// Records source debugging information; the operand selects the kind.
    DBG_VM = 55,

    /// Builds a closure. Operands: body offset and arity; the body
    /// starts after the two operand words and is `offset - 1` words long.
    CREATE_CLOSURE = 56,

    // Call protocol.
    /// Allocates an activation record.
    PREPARE_CALL = 57,
    /// Returns from a closure call.
    RETURN = 58,
    /// Invokes `val` with `n` arguments.
    INVOKE = 59,
    /// Invokes `val` with `n` arguments, reusing the caller's record.
    TAIL_INVOKE = 60,

    // Lexical environments.
    /// Pushes a frame of `n` slots populated from the stack.
    ENTER_LET = 61,
    /// Allocates an activation record, then pushes a frame of `n`
    /// uninitialized slots for sequential binding.
    ENTER_LET_STAR = 62,
    /// Pops the innermost frame, restoring the enclosing record.
    LEAVE_LET = 63,
    /// Tail variant of `ENTER_LET`: reuses the enclosing record.
    ENTER_TAIL_LET = 64,
    /// Tail variant of `ENTER_LET_STAR`.
    ENTER_TAIL_LET_STAR = 65,

    // Exception handlers.
    /// Installs the procedure in `val` as a handler; the operand is the
    /// relative resume point used after the handler returns.
    PUSH_HANDLER = 66,
    /// Removes the topmost handler record.
    POP_HANDLER = 67,

    /// Registers `val` as the expander for the symbol at constant `k`.
    MAKE_EXPANDER = 68,

    /// Exits the current VM re-entry.
    END_OF_CODE = 69,

    // Inlined primitives. Same semantics and error behavior as the
    // correspondingly named primitive; dispatch skips the call protocol.
    /// `+` on two operands.
    IN_ADD2 = 70,
    /// `-` on two operands.
    IN_SUB2 = 71,
    /// `*` on two operands.
    IN_MUL2 = 72,
    /// `/` on two operands.
    IN_DIV2 = 73,
    /// `=` on two operands.
    IN_NUMEQ = 74,
    /// Negated `=` on two operands.
    IN_NUMDIFF = 75,
    /// `<` on two operands.
    IN_NUMLT = 76,
    /// `>` on two operands.
    IN_NUMGT = 77,
    /// `<=` on two operands.
    IN_NUMLE = 78,
    /// `>=` on two operands.
    IN_NUMGE = 79,
    /// Adds 1 to `val`.
    IN_INCR = 80,
    /// Subtracts 1 from `val`.
    IN_DECR = 81,
    /// `cons` on two operands.
    IN_CONS = 82,
    /// `car` of `val`.
    IN_CAR = 83,
    /// `cdr` of `val`.
    IN_CDR = 84,
    /// `null?` of `val`.
    IN_NULLP = 85,
    /// Builds a list from the top `n` stack slots.
    IN_LIST = 86,
    /// `not` of `val`.
    IN_NOT = 87,
    /// `equal?` on two operands.
    IN_EQUAL = 88,
    /// `eqv?` on two operands.
    IN_EQV = 89,
    /// `eq?` on two operands.
    IN_EQ = 90,
    /// Negated `equal?` on two operands.
    IN_NOT_EQUAL = 91,
    /// Negated `eqv?` on two operands.
    IN_NOT_EQV = 92,
    /// Negated `eq?` on two operands.
    IN_NOT_EQ = 93,
    /// `vector-ref` on two operands.
    IN_VREF = 94,
    /// `string-ref` on two operands.
    IN_SREF = 95,
    /// `vector-set!` on three operands.
    IN_VSET = 96,
    /// `string-set!` on three operands.
    IN_SSET = 97,
}

/// Number of opcodes, used to size dispatch-adjacent tables.
pub const OPCODE_COUNT: u16 = 98;

impl OpCode {
    /// Returns the number of operand words following the opcode word.
    ///
    /// `CREATE_CLOSURE` reports its two operand words; the closure body
    /// that follows them is accounted for by the offset operand itself.
    pub fn operand_words(self) -> usize {
        use OpCode::*;
        match self {
            SMALL_INT | CONSTANT | INT_PUSH | CONSTANT_PUSH | GLOBAL_REF | UGLOBAL_REF
            | GLOBAL_SET | UGLOBAL_SET | LOCAL_REF | DEEP_LOCAL_REF | LOCAL_SET
            | DEEP_LOCAL_SET | GOTO | JUMP_FALSE | JUMP_TRUE | JUMP_NUMEQ | JUMP_NUMDIFF
            | JUMP_NUMLT | JUMP_NUMLE | JUMP_NUMGT | JUMP_NUMGE | JUMP_NOT_EQ | JUMP_NOT_EQV
            | JUMP_NOT_EQUAL | DEFINE_SYMBOL | DBG_VM | INVOKE | TAIL_INVOKE | ENTER_LET
            | ENTER_LET_STAR | ENTER_TAIL_LET | ENTER_TAIL_LET_STAR | PUSH_HANDLER
            | MAKE_EXPANDER | IN_LIST => 1,
            GREF_INVOKE | UGREF_INVOKE | CREATE_CLOSURE => 2,
            _ => 0,
        }
    }

    /// Returns the printable name of the opcode, as used by the
    /// disassembler and loader diagnostics.
    pub fn name(self) -> &'static str {
        crate::code::opcode_name(self as u16)
    }
}

impl TryFrom<u16> for OpCode {
    type Error = VmError;

    fn try_from(word: u16) -> VmResult<Self> {
        if word < OPCODE_COUNT {
            // Discriminants are dense from 0, so the transmute-free path
            // is a table produced by the macro-less match below.
            Ok(ALL_OPCODES[word as usize])
        } else {
            Err(VmError::bad_bytecode(format!("invalid opcode {word}")))
        }
    }
}

/// All opcodes in discriminant order.
pub const ALL_OPCODES: [OpCode; OPCODE_COUNT as usize] = {
    use OpCode::*;
    [
        NOP, IM_FALSE, IM_TRUE, IM_NIL, IM_MINUS1, IM_ZERO, IM_ONE, IM_VOID, SMALL_INT,
        CONSTANT, FALSE_PUSH, TRUE_PUSH, NIL_PUSH, MINUS1_PUSH, ZERO_PUSH, ONE_PUSH, VOID_PUSH,
        INT_PUSH, CONSTANT_PUSH, GLOBAL_REF, UGLOBAL_REF, GREF_INVOKE, UGREF_INVOKE, GLOBAL_SET,
        UGLOBAL_SET, LOCAL_REF0, LOCAL_REF1, LOCAL_REF2, LOCAL_REF3, LOCAL_REF4, LOCAL_REF,
        DEEP_LOCAL_REF, LOCAL_SET0, LOCAL_SET1, LOCAL_SET2, LOCAL_SET3, LOCAL_SET4, LOCAL_SET,
        DEEP_LOCAL_SET, GOTO, JUMP_FALSE, JUMP_TRUE, JUMP_NUMEQ, JUMP_NUMDIFF, JUMP_NUMLT,
        JUMP_NUMLE, JUMP_NUMGT, JUMP_NUMGE, JUMP_NOT_EQ, JUMP_NOT_EQV, JUMP_NOT_EQUAL,
        DEFINE_SYMBOL, SET_CUR_MOD, POP, PUSH, DBG_VM, CREATE_CLOSURE, PREPARE_CALL, RETURN,
        INVOKE, TAIL_INVOKE, ENTER_LET, ENTER_LET_STAR, LEAVE_LET, ENTER_TAIL_LET,
        ENTER_TAIL_LET_STAR, PUSH_HANDLER, POP_HANDLER, MAKE_EXPANDER, END_OF_CODE, IN_ADD2,
        IN_SUB2, IN_MUL2, IN_DIV2, IN_NUMEQ, IN_NUMDIFF, IN_NUMLT, IN_NUMGT, IN_NUMLE,
        IN_NUMGE, IN_INCR, IN_DECR, IN_CONS, IN_CAR, IN_CDR, IN_NULLP, IN_LIST, IN_NOT,
        IN_EQUAL, IN_EQV, IN_EQ, IN_NOT_EQUAL, IN_NOT_EQV, IN_NOT_EQ, IN_VREF, IN_SREF,
        IN_VSET, IN_SSET,
    ]
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_all_opcodes() {
        for (i, op) in ALL_OPCODES.iter().enumerate() {
            assert_eq!(*op as u16, i as u16, "discriminant order broken at {op:?}");
            assert_eq!(OpCode::try_from(i as u16).unwrap(), *op);
        }
    }

    #[test]
    fn test_invalid_opcode_rejected() {
        assert!(OpCode::try_from(OPCODE_COUNT).is_err());
        assert!(OpCode::try_from(u16::MAX).is_err());
    }

    #[test]
    fn test_operand_word_counts() {
        assert_eq!(OpCode::NOP.operand_words(), 0);
        assert_eq!(OpCode::SMALL_INT.operand_words(), 1);
        assert_eq!(OpCode::GREF_INVOKE.operand_words(), 2);
        assert_eq!(OpCode::CREATE_CLOSURE.operand_words(), 2);
        assert_eq!(OpCode::END_OF_CODE.operand_words(), 0);
    }

    #[test]
    fn test_packed_operand_fields() {
        let packed = (3 << 8) | 7;
        assert_eq!(first_byte(packed), 3);
        assert_eq!(second_byte(packed), 7);
    }
}
