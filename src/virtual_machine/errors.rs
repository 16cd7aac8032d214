use crate::virtual_machine::value::VMObject;
use thiserror::Error;

/// Fault category every [`VMError`] is reported under.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FaultKind {
    /// Assembly or emission failed; no bytecode was produced.
    Compile,
    /// An operand had the wrong runtime type.
    Cast,
    /// A register, stack, key, jump target or depth limit was out of range.
    Bounds,
    /// Division by zero, negative shift or integer overflow of the size limit.
    Arithmetic,
    /// Gas limit exhausted.
    Gas,
    /// The script executed `throw`.
    Script,
    /// An extcall or context name did not resolve, or a registration was rejected.
    UnknownExtcall,
}

impl FaultKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Compile => "CompileFault",
            FaultKind::Cast => "CastFault",
            FaultKind::Bounds => "BoundsFault",
            FaultKind::Arithmetic => "ArithmeticFault",
            FaultKind::Gas => "GasFault",
            FaultKind::Script => "ScriptFault",
            FaultKind::UnknownExtcall => "UnknownExtcallFault",
        }
    }
}

/// Errors that can occur during assembly, decoding or VM execution.
#[derive(Clone, Debug, Error)]
pub enum VMError {
    // ---- assembly ----
    /// Unrecognized instruction mnemonic.
    #[error("line {line}: unknown opcode '{name}'")]
    UnknownOpcode { line: usize, name: String },
    /// Malformed source text.
    #[error("line {line}: {message}")]
    SyntaxError { line: usize, message: String },
    /// Wrong number of operands for an instruction.
    #[error("line {line}: {opcode} expects {expected} operands, got {actual}")]
    ArityMismatch {
        line: usize,
        opcode: &'static str,
        expected: usize,
        actual: usize,
    },
    /// Operand text that does not parse as the kind the opcode expects.
    #[error("line {line}: invalid operand '{token}', expected {expected}")]
    InvalidOperand {
        line: usize,
        token: String,
        expected: &'static str,
    },
    /// Label defined more than once.
    #[error("line {line}: duplicate label {label}")]
    DuplicateLabel { line: usize, label: String },
    /// Reference to a label that is never defined.
    #[error("line {line}: undefined label {label}")]
    UndefinedLabel { line: usize, label: String },
    /// Script larger than the configured limit.
    #[error("script of {size} bytes exceeds the limit of {limit} bytes")]
    ScriptTooLarge { size: usize, limit: usize },
    /// Serialized script could not be decoded.
    #[error("decoding error: {0}")]
    DecodeError(String),
    /// File I/O failure while reading or writing scripts.
    #[error("io error: {0}")]
    IoError(String),

    // ---- cast ----
    /// Operand type does not match the type an instruction expects.
    #[error(
        "instruction {instruction} expected argument {arg_index} to be of type {expected} but got {actual}"
    )]
    TypeMismatch {
        instruction: &'static str,
        arg_index: usize,
        expected: &'static str,
        actual: &'static str,
    },
    /// Host-side conversion of a value to the wrong type.
    #[error("cannot cast {actual} to {expected}")]
    InvalidCast {
        expected: &'static str,
        actual: &'static str,
    },
    /// Instruction read a register that holds no value.
    #[error("instruction {instruction} read unset register r{index}")]
    UnsetRegister { instruction: &'static str, index: u8 },
    /// Bytes are not valid UTF-8, or a string slice split a character.
    #[error("invalid utf8 in string")]
    InvalidUtf8,
    /// Struct keys must be primitive values.
    #[error("struct key must be a primitive value, got {0}")]
    InvalidKey(&'static str),
    /// Interop object that cannot be deep-copied.
    #[error("interop object {0} cannot be copied")]
    NotCopyable(&'static str),

    // ---- bounds ----
    /// Register index exceeds the register file size.
    #[error("register index {index} out of bounds ({available} available)")]
    InvalidRegisterIndex { index: u8, available: usize },
    /// Pop from an empty operand stack.
    #[error("stack underflow in {0}")]
    StackUnderflow(&'static str),
    /// Push beyond the operand stack limit.
    #[error("stack depth limit of {0} exceeded")]
    StackOverflow(usize),
    /// Too many nested calls.
    #[error("call depth limit of {0} exceeded")]
    CallDepthExceeded(usize),
    /// Too many nested context switches.
    #[error("context depth limit of {0} exceeded")]
    ContextDepthExceeded(usize),
    /// Too many live aggregates.
    #[error("heap limit of {0} objects exceeded")]
    HeapExhausted(usize),
    /// Dangling aggregate handle.
    #[error("invalid heap reference {0}")]
    InvalidHeapRef(u32),
    /// Jump or call outside the code or into the middle of an instruction.
    #[error("invalid jump target {target} (code is {len} bytes)")]
    InvalidJumpTarget { target: usize, len: usize },
    /// Unknown opcode byte encountered in bytecode.
    #[error("invalid instruction 0x{opcode:02x} at offset {offset}")]
    InvalidInstruction { opcode: u8, offset: usize },
    /// Unknown operand or literal tag in bytecode.
    #[error("invalid operand tag {tag} at offset {offset}")]
    InvalidOperandTag { tag: u8, offset: usize },
    /// Bytecode ended while reading an instruction.
    #[error("unexpected end of bytecode at {ip} (requested {requested}, {available} available)")]
    UnexpectedEndOfBytecode {
        ip: usize,
        requested: usize,
        available: usize,
    },
    /// `left`/`right` asked for more bytes than the source holds.
    #[error("slice of {requested} bytes out of range for length {len}")]
    SliceOutOfRange { requested: usize, len: usize },
    /// `get` of a key the aggregate does not contain.
    #[error("key {0} not found")]
    KeyNotFound(String),

    // ---- arithmetic ----
    /// Division or modulo by zero.
    #[error("division by zero in {0}")]
    DivisionByZero(&'static str),
    /// Shift by a negative amount.
    #[error("negative shift amount in {0}")]
    NegativeShift(&'static str),
    /// Integer result wider than the configured limit.
    #[error("integer of {bits} bits exceeds the limit of {limit} bits")]
    IntegerTooLarge { bits: u64, limit: u64 },

    // ---- gas ----
    /// Gas limit exhausted.
    #[error("out of gas: {required} required, {remaining} remaining")]
    OutOfGas { required: u64, remaining: u64 },

    // ---- script ----
    /// Value raised by `throw`.
    #[error("script threw {0}")]
    Thrown(VMObject),

    // ---- extcall ----
    /// Extcall name with no registered handler.
    #[error("unknown extcall {0}")]
    UnknownExtcall(String),
    /// Context name with no registered context.
    #[error("unknown context {0}")]
    UnknownContext(String),
    /// Extcall or context registered twice.
    #[error("{0} is already registered")]
    DuplicateRegistration(String),
    /// Extcall descriptor rejected at registration.
    #[error("invalid extcall descriptor {name}: {reason}")]
    InvalidDescriptor { name: String, reason: &'static str },
}

impl VMError {
    /// Maps the error to its fault category.
    pub const fn kind(&self) -> FaultKind {
        match self {
            VMError::UnknownOpcode { .. }
            | VMError::SyntaxError { .. }
            | VMError::ArityMismatch { .. }
            | VMError::InvalidOperand { .. }
            | VMError::DuplicateLabel { .. }
            | VMError::UndefinedLabel { .. }
            | VMError::ScriptTooLarge { .. }
            | VMError::DecodeError(_)
            | VMError::IoError(_) => FaultKind::Compile,
            VMError::TypeMismatch { .. }
            | VMError::InvalidCast { .. }
            | VMError::UnsetRegister { .. }
            | VMError::InvalidUtf8
            | VMError::InvalidKey(_)
            | VMError::NotCopyable(_) => FaultKind::Cast,
            VMError::InvalidRegisterIndex { .. }
            | VMError::StackUnderflow(_)
            | VMError::StackOverflow(_)
            | VMError::CallDepthExceeded(_)
            | VMError::ContextDepthExceeded(_)
            | VMError::HeapExhausted(_)
            | VMError::InvalidHeapRef(_)
            | VMError::InvalidJumpTarget { .. }
            | VMError::InvalidInstruction { .. }
            | VMError::InvalidOperandTag { .. }
            | VMError::UnexpectedEndOfBytecode { .. }
            | VMError::SliceOutOfRange { .. }
            | VMError::KeyNotFound(_) => FaultKind::Bounds,
            VMError::DivisionByZero(_)
            | VMError::NegativeShift(_)
            | VMError::IntegerTooLarge { .. } => FaultKind::Arithmetic,
            VMError::OutOfGas { .. } => FaultKind::Gas,
            VMError::Thrown(_) => FaultKind::Script,
            VMError::UnknownExtcall(_)
            | VMError::UnknownContext(_)
            | VMError::DuplicateRegistration(_)
            | VMError::InvalidDescriptor { .. } => FaultKind::UnknownExtcall,
        }
    }

    /// Source line for assembly errors that carry one.
    pub const fn line(&self) -> Option<usize> {
        match self {
            VMError::UnknownOpcode { line, .. }
            | VMError::SyntaxError { line, .. }
            | VMError::ArityMismatch { line, .. }
            | VMError::InvalidOperand { line, .. }
            | VMError::DuplicateLabel { line, .. }
            | VMError::UndefinedLabel { line, .. } => Some(*line),
            _ => None,
        }
    }

    /// The value a script raised with `throw`, if that is what this error is.
    pub fn thrown(&self) -> Option<&VMObject> {
        match self {
            VMError::Thrown(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_fault_taxonomy() {
        let unknown = VMError::UnknownOpcode {
            line: 3,
            name: "bogus".into(),
        };
        assert_eq!(unknown.kind(), FaultKind::Compile);
        assert_eq!(unknown.line(), Some(3));
        assert_eq!(VMError::InvalidUtf8.kind(), FaultKind::Cast);
        assert_eq!(VMError::KeyNotFound("a".into()).kind(), FaultKind::Bounds);
        assert_eq!(VMError::DivisionByZero("div").kind(), FaultKind::Arithmetic);
        assert_eq!(
            VMError::OutOfGas {
                required: 2,
                remaining: 1
            }
            .kind(),
            FaultKind::Gas
        );
        assert_eq!(
            VMError::UnknownExtcall("Nope".into()).kind(),
            FaultKind::UnknownExtcall
        );
    }

    #[test]
    fn thrown_value_is_exposed() {
        let err = VMError::Thrown(VMObject::Bool(true));
        assert_eq!(err.kind(), FaultKind::Script);
        assert_eq!(err.thrown(), Some(&VMObject::Bool(true)));
        assert_eq!(err.to_string(), "script threw true");
        assert!(VMError::InvalidUtf8.thrown().is_none());
    }

    #[test]
    fn messages_carry_line_numbers() {
        let err = VMError::ArityMismatch {
            line: 7,
            opcode: "add",
            expected: 3,
            actual: 2,
        };
        assert_eq!(err.to_string(), "line 7: add expects 3 operands, got 2");
    }
}
