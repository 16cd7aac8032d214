//! Blockchain script virtual machine.
//!
//! Provides the assembler, bytecode format and interpreter used to run
//! blockchain scripts, plus the logging utilities they share.

pub mod utils;
pub mod virtual_machine;
