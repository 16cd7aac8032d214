//! Register-based bytecode virtual machine for blockchain scripts.
//!
//! Scripts are written in a small assembly language, compiled to bytecode and
//! executed by the interpreter under a gas budget supplied by the host.
//!
//! # Architecture
//!
//! - **Values**: dynamically typed [`value::VMObject`]s (bool, arbitrary
//!   precision integer, string, bytes, struct, enum, interop, object)
//! - **Registers**: a per-context register file of optional values
//! - **Operand stack**: shared by every frame and context of a run; carries
//!   extcall arguments and the final result
//! - **Contexts**: `ctx`/`switch` enter named host or script contexts with
//!   fresh registers
//! - **Gas metering**: every opcode is charged from a host-overridable
//!   schedule, with per-category profiling
//!
//! # Modules
//!
//! - [`assembler`]: Assembly parsing, diagnostics, and bytecode generation
//! - [`config`]: Run parameters and resource limits
//! - [`disassembler`]: Bytecode decoding and listings
//! - [`errors`]: Error type and fault taxonomy
//! - [`extcall`]: Host method registry and builtin library
//! - [`isa`]: Instruction set definition and opcode mappings
//! - [`operand`]: Operand kinds, inline literals and their encoding
//! - [`script`]: Compiled scripts and the label-patching emitter
//! - [`value`]: Runtime values
//! - [`vm`]: Interpreter, contexts, heap and gas metering

pub mod assembler;
pub mod config;
pub mod disassembler;
pub mod errors;
pub mod extcall;
pub mod isa;
mod isa_static_check;
pub mod operand;
pub mod script;
pub mod value;
pub mod vm;
