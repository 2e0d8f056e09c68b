//! Sandboxed 32-bit virtual machine and its toolchain.
//!
//! Guest programs are written in a small assembly language, compiled by the two-pass
//! [`assembler`] into an object image ([`program`]), validated by the loader and executed
//! by the interpreter in [`vm`]. The only way a guest reaches the host is the
//! [`syscall`] layer, which checks every request against a [`sandbox`] policy.
//!
//! # Architecture
//!
//! - **Registers**: fifteen 32-bit registers (`$r0`..`$r9`, `$ra`, `$rb`, `$rc`, `$sp`,
//!   `$bp`), a program counter and a compare-flags word
//! - **Memory**: disjoint permissioned regions for `.text`, `.data`, the stack and
//!   guest mappings; anything else faults
//! - **Instruction format**: one opcode byte followed by register bytes and 4-byte
//!   little-endian immediates
//! - **Termination**: every run ends halted, faulted or timed out
//!
//! # Modules
//!
//! - [`assembler`]: parsing, label resolution, diagnostics and byte emission
//! - [`errors`]: one error type per stage
//! - [`isa`]: instruction table, memory layout constants and disassembly
//! - [`operand`]: operand kinds and decoded operand display
//! - [`program`]: the object image format and its loader validation
//! - [`sandbox`]: file and network access policy
//! - [`syscall`]: syscall ABI, descriptor table and handlers
//! - [`vm`]: the interpreter, its memory model and run limits

pub mod assembler;
pub mod errors;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod operand;
pub mod program;
pub mod sandbox;
pub mod syscall;
pub mod vm;
