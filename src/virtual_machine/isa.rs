//! Instruction set definitions.
//!
//! The [`for_each_instruction!`](crate::for_each_instruction) macro holds the
//! canonical opcode table and invokes a callback macro for code generation, so
//! the interpreter, the assembler and the gas schedule all read one table.
//!
//! This module generates the [`Opcode`] enum with its byte mapping, mnemonic,
//! operand layout and base gas cost.
//!
//! # Bytecode format
//!
//! - Opcode: 1 byte
//! - Register operand: 1 byte
//! - Literal: type tag byte, then payload (bool: 1 byte, enum: u32 LE,
//!   integer/string/bytes: u32 LE length + bytes; integers are two's complement LE)
//! - Target / immediate: u32 LE
//! - Name: tag byte (0 register, 1 inline) + register byte or u32 LE length + UTF-8
//!
//! Operands are written source first, destination last.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::operand::OperandKind;

/// Invokes a callback macro with the complete instruction definition list.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Registers and stack
            // =========================
            /// NOP ; no effect
            Nop = 0x00, "nop" => [], 1,
            /// MOVE src, dst ; dst = src (aggregates and interop are shared)
            Move = 0x01, "move" => [src: Reg, dst: Reg], 1,
            /// COPY src, dst ; dst = deep copy of src
            Copy = 0x02, "copy" => [src: Reg, dst: Reg], 3,
            /// LOAD dst, literal ; dst = literal
            Load = 0x03, "load" => [dst: Reg, literal: Literal], 2,
            /// PUSH src ; stack.push(src)
            Push = 0x04, "push" => [src: Reg], 1,
            /// POP dst ; dst = stack.pop()
            Pop = 0x05, "pop" => [dst: Reg], 1,
            /// SWAP a, b ; exchange registers
            Swap = 0x06, "swap" => [a: Reg, b: Reg], 1,

            // =========================
            // Control flow
            // =========================
            /// CALL target ; push frame, jump
            Call = 0x10, "call" => [target: Target], 5,
            /// EXTCALL name ; invoke host method, arguments on the stack
            ExtCall = 0x11, "extcall" => [method: Name], 10,
            /// JMP target
            Jmp = 0x12, "jmp" => [target: Target], 1,
            /// JMPIF cond, target ; jump when cond is true
            JmpIf = 0x13, "jmpif" => [cond: Reg, target: Target], 1,
            /// JMPNOT cond, target ; jump when cond is false
            JmpNot = 0x14, "jmpnot" => [cond: Reg, target: Target], 1,
            /// RET ; pop frame, halt at the root frame
            Ret = 0x15, "ret" => [], 2,
            /// THROW ; raise the value on top of the stack
            Throw = 0x16, "throw" => [], 1,

            // =========================
            // Logic and comparison
            // =========================
            /// NOT src, dst
            Not = 0x20, "not" => [src: Reg, dst: Reg], 1,
            /// AND a, b, dst
            And = 0x21, "and" => [a: Reg, b: Reg, dst: Reg], 1,
            /// OR a, b, dst
            Or = 0x22, "or" => [a: Reg, b: Reg, dst: Reg], 1,
            /// XOR a, b, dst
            Xor = 0x23, "xor" => [a: Reg, b: Reg, dst: Reg], 1,
            /// EQUAL a, b, dst ; structural equality for values and structs
            Equal = 0x24, "equal" => [a: Reg, b: Reg, dst: Reg], 2,
            /// LT a, b, dst
            Lt = 0x25, "lt" => [a: Reg, b: Reg, dst: Reg], 2,
            /// GT a, b, dst
            Gt = 0x26, "gt" => [a: Reg, b: Reg, dst: Reg], 2,
            /// LTE a, b, dst
            Lte = 0x27, "lte" => [a: Reg, b: Reg, dst: Reg], 2,
            /// GTE a, b, dst
            Gte = 0x28, "gte" => [a: Reg, b: Reg, dst: Reg], 2,

            // =========================
            // Numeric
            // =========================
            /// INC reg
            Inc = 0x30, "inc" => [reg: Reg], 1,
            /// DEC reg
            Dec = 0x31, "dec" => [reg: Reg], 1,
            /// SIGN src, dst ; -1, 0 or 1
            Sign = 0x32, "sign" => [src: Reg, dst: Reg], 1,
            /// NEGATE src, dst
            Negate = 0x33, "negate" => [src: Reg, dst: Reg], 1,
            /// ABS src, dst
            Abs = 0x34, "abs" => [src: Reg, dst: Reg], 1,
            /// ADD a, b, dst
            Add = 0x35, "add" => [a: Reg, b: Reg, dst: Reg], 2,
            /// SUB a, b, dst
            Sub = 0x36, "sub" => [a: Reg, b: Reg, dst: Reg], 2,
            /// MUL a, b, dst
            Mul = 0x37, "mul" => [a: Reg, b: Reg, dst: Reg], 4,
            /// DIV a, b, dst ; truncating
            Div = 0x38, "div" => [a: Reg, b: Reg, dst: Reg], 8,
            /// MOD a, b, dst ; sign follows the dividend
            Mod = 0x39, "mod" => [a: Reg, b: Reg, dst: Reg], 8,
            /// SHL a, b, dst
            Shl = 0x3A, "shl" => [a: Reg, b: Reg, dst: Reg], 3,
            /// SHR a, b, dst ; arithmetic
            Shr = 0x3B, "shr" => [a: Reg, b: Reg, dst: Reg], 3,
            /// MIN a, b, dst
            Min = 0x3C, "min" => [a: Reg, b: Reg, dst: Reg], 2,
            /// MAX a, b, dst
            Max = 0x3D, "max" => [a: Reg, b: Reg, dst: Reg], 2,

            // =========================
            // Contexts
            // =========================
            /// CTX src, dst ; dst = handle of the context named by src
            Ctx = 0x40, "ctx" => [src: Reg, dst: Reg], 5,
            /// SWITCH src ; run the context held by src
            Switch = 0x41, "switch" => [src: Reg], 50,

            // =========================
            // Aggregates and data
            // =========================
            /// PUT src, dst, key ; dst[key] = src
            Put = 0x50, "put" => [src: Reg, dst: Reg, key: Reg], 3,
            /// GET src, dst, key ; dst = src[key]
            Get = 0x51, "get" => [src: Reg, dst: Reg, key: Reg], 2,
            /// CAT a, b, dst
            Cat = 0x52, "cat" => [a: Reg, b: Reg, dst: Reg], 2,
            /// LEFT src, dst, len ; first len bytes
            Left = 0x53, "left" => [src: Reg, dst: Reg, len: ImmU32], 2,
            /// RIGHT src, dst, len ; last len bytes
            Right = 0x54, "right" => [src: Reg, dst: Reg, len: ImmU32], 2,
            /// SIZE src, dst ; byte length
            Size = 0x55, "size" => [src: Reg, dst: Reg], 1,
        }
    };
}

macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ], $gas:expr
        ),* $(,)?
    ) => {
        /// VM opcodes.
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Opcode {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Opcode {
            type Error = VMError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Opcode::$name), )*
                    _ => Err(VMError::InvalidInstruction {
                        opcode: value,
                        offset: 0,
                    }),
                }
            }
        }

        impl Opcode {
            /// Every opcode in table order.
            pub const ALL: &'static [Opcode] = &[ $( Opcode::$name, )* ];

            /// Returns the assembly mnemonic for this opcode.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Opcode::$name => $mnemonic, )*
                }
            }

            /// Returns the base gas cost for this opcode.
            pub const fn base_gas(&self) -> u64 {
                match self {
                    $( Opcode::$name => $gas, )*
                }
            }

            /// Operand kinds in encoding order.
            pub const fn operands(&self) -> &'static [OperandKind] {
                match self {
                    $( Opcode::$name => &[ $( OperandKind::$kind ),* ], )*
                }
            }

            /// Looks up an opcode by mnemonic, ignoring ASCII case.
            pub fn from_mnemonic(name: &str) -> Option<Opcode> {
                $(
                    if name.eq_ignore_ascii_case($mnemonic) {
                        return Some(Opcode::$name);
                    }
                )*
                None
            }
        }
    };
}

for_each_instruction!(define_instructions);
