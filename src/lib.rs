//! XVM library.
//!
//! Provides a sandboxed 32-bit virtual machine together with its toolchain: the
//! instruction set, the binary object format, a two-pass assembler, the syscall
//! layer, a content-addressed program store and the upload/execute/info service.

pub mod network;
pub mod storage;
pub mod types;
pub mod utils;
pub mod virtual_machine;
