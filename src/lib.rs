//! A register-based bytecode virtual machine.
//!
//! Loads a self-contained `.lvme` module into a paged 48-bit linear address
//! space and interprets it on one or more native threads. Provides the
//! instruction set, the managed memory subsystem, the thread machinery, and a
//! small textual assembler used by tests and tooling.

pub mod bytecode;
pub mod errors;
pub mod memory;
pub mod module;
pub mod utils;
pub mod vm;
