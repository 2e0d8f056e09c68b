//! Error taxonomy for assembling, loading and running programs.
//!
//! Each stage has its own error type so callers can tell how far a program got:
//! [`AssembleError`] never reaches the VM, [`LoadError`] rejects an image before any
//! instruction runs, [`ExecFault`] ends a run, [`SyscallError`] is handed back to the
//! guest as a value, and [`HostLimitExceeded`] is enforced by the host around the run.

use crate::virtual_machine::vm::memory::Access;
use thiserror::Error;

/// Errors produced while compiling assembly source.
///
/// Line and column numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssembleError {
    /// Malformed operand, directive or literal.
    #[error("line {line}:{column}: {message}")]
    Syntax {
        line: usize,
        column: usize,
        message: String,
    },
    /// Mnemonic or directive not in the instruction table.
    #[error("line {line}:{column}: unknown instruction `{mnemonic}`")]
    UnknownMnemonic {
        line: usize,
        column: usize,
        mnemonic: String,
    },
    /// The mnemonic exists but has no encoding for the given operand forms.
    #[error("line {line}:{column}: `{mnemonic}` does not take operands ({forms})")]
    OperandMismatch {
        line: usize,
        column: usize,
        mnemonic: String,
        forms: String,
    },
    /// Label defined more than once.
    #[error("line {line}:{column}: label `{label}` already defined on line {first_line}")]
    DuplicateLabel {
        line: usize,
        column: usize,
        label: String,
        first_line: usize,
    },
    /// Reference to a label that is never defined.
    #[error("line {line}:{column}: undefined label `{label}`")]
    UndefinedLabel {
        line: usize,
        column: usize,
        label: String,
    },
    /// The program contains no code.
    #[error("the .text section is empty")]
    EmptyText,
    /// Sections do not fit below the memory-mapping area.
    #[error("program too large: {size} bytes exceed the {limit} byte load window")]
    TooLarge { size: usize, limit: usize },
    /// Reading the source or writing the output failed.
    #[error("io error on {path}: {message}")]
    Io { path: String, message: String },
}

impl AssembleError {
    /// Returns the `(line, column)` the error points at, if it has one.
    pub fn location(&self) -> Option<(usize, usize)> {
        match self {
            AssembleError::Syntax { line, column, .. }
            | AssembleError::UnknownMnemonic { line, column, .. }
            | AssembleError::OperandMismatch { line, column, .. }
            | AssembleError::DuplicateLabel { line, column, .. }
            | AssembleError::UndefinedLabel { line, column, .. } => Some((*line, *column)),
            AssembleError::EmptyText | AssembleError::TooLarge { .. } | AssembleError::Io { .. } => {
                None
            }
        }
    }
}

/// Reasons an object image is rejected before execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("image truncated: needed {needed} bytes at offset {offset}, have {available}")]
    Truncated {
        offset: usize,
        needed: usize,
        available: usize,
    },
    #[error("bad magic {found:02x?}")]
    BadMagic { found: [u8; 4] },
    #[error("unsupported format version {found} (expected {expected})")]
    UnsupportedVersion { found: u16, expected: u16 },
    #[error("unknown header flags {flags:#04x}")]
    UnknownFlags { flags: u8 },
    #[error("invalid section count {count}")]
    SectionCount { count: u8 },
    #[error("unknown section name {name:?}")]
    UnknownSection { name: String },
    #[error("section {name} declares kind {kind}, which does not match its name")]
    SectionKindMismatch { name: String, kind: u8 },
    #[error("section {name} has non-zero reserved bytes")]
    ReservedBytes { name: String },
    #[error("section {name} appears more than once")]
    DuplicateSection { name: String },
    #[error("section {name} payload [{offset:#x}, +{length:#x}) lies outside the {size} byte image")]
    SectionOutOfBounds {
        name: String,
        offset: u32,
        length: u32,
        size: usize,
    },
    #[error("section {name} payload overlaps {other}")]
    OverlappingPayload { name: String, other: String },
    #[error("section {name} load range overlaps section {other}")]
    OverlappingSections { name: String, other: String },
    #[error("section {name} load range [{base:#010x}, +{length:#x}) is outside the load window")]
    BadLoadAddress { name: String, base: u32, length: u32 },
    #[error("missing or empty .text section")]
    MissingText,
    #[error("entry point {entry:#010x} is outside .text")]
    BadEntry { entry: u32 },
    #[error("symbol table offset {offset:#x} is invalid")]
    BadSymbolTable { offset: u32 },
    #[error("symbol #{index} has an invalid name")]
    BadSymbolName { index: usize },
    #[error("symbol {name} at {address:#010x} is outside .text and .data")]
    SymbolOutOfRange { name: String, address: u32 },
    #[error("{count} trailing bytes after the image")]
    TrailingBytes { count: usize },
}

/// Terminal violations detected while executing.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecFault {
    #[error("invalid opcode {opcode:#04x} at {pc:#010x}")]
    InvalidOpcode { opcode: u8, pc: u32 },
    #[error("instruction at {pc:#010x} runs past executable memory")]
    TruncatedInstruction { pc: u32 },
    #[error("invalid register index {index} at {pc:#010x}")]
    InvalidRegister { index: u8, pc: u32 },
    #[error("{access} of {len} bytes at {addr:#010x} is not permitted")]
    MemoryFault { addr: u32, len: u32, access: Access },
    #[error("stack underflow (sp = {sp:#010x})")]
    StackUnderflow { sp: u32 },
    #[error("stack overflow (sp = {sp:#010x})")]
    StackOverflow { sp: u32 },
    #[error("invalid syscall number {number:#x} at {pc:#010x}")]
    InvalidSyscall { number: u32, pc: u32 },
}

/// Recoverable syscall failures, reported to the guest as a sentinel result value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyscallError {
    #[error("bad file descriptor {fd}")]
    BadDescriptor { fd: u32 },
    #[error("buffer [{addr:#010x}, +{len:#x}) is not accessible")]
    BadAddress { addr: u32, len: u32 },
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: &'static str },
    #[error("request of {requested:#x} bytes exceeds the {limit:#x} byte limit")]
    TooLarge { requested: u32, limit: u32 },
    #[error("path {path} is outside the sandbox")]
    PathDenied { path: String },
    #[error("path {path} does not exist")]
    NotFound { path: String },
    #[error("no mapping starts at {addr:#010x}")]
    NotMapped { addr: u32 },
    #[error("no space: {reason}")]
    NoSpace { reason: &'static str },
    #[error("network target {target} is not permitted")]
    NetworkDenied { target: String },
    #[error("socket {fd} is not connected")]
    NotConnected { fd: u32 },
    #[error("i/o error: {message}")]
    Io { message: String },
}

/// Limits enforced by the host around a run, independent of guest behavior.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostLimitExceeded {
    #[error("upload of {size} bytes rejected (limit is below {limit} bytes)")]
    UploadTooLarge { size: usize, limit: usize },
    #[error("execution exceeded the {budget_ms} ms budget")]
    Timeout { budget_ms: u128 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assemble_error_location() {
        let err = AssembleError::UndefinedLabel {
            line: 4,
            column: 9,
            label: "done".into(),
        };
        assert_eq!(err.location(), Some((4, 9)));
        assert_eq!(err.to_string(), "line 4:9: undefined label `done`");
        assert_eq!(AssembleError::EmptyText.location(), None);
    }

    #[test]
    fn fault_messages_are_readable() {
        let f = ExecFault::InvalidOpcode {
            opcode: 0xFF,
            pc: 0x1000,
        };
        assert_eq!(f.to_string(), "invalid opcode 0xff at 0x00001000");

        let f = ExecFault::MemoryFault {
            addr: 0x10,
            len: 4,
            access: Access::Write,
        };
        assert_eq!(f.to_string(), "write of 4 bytes at 0x00000010 is not permitted");
    }

    #[test]
    fn upload_limit_message() {
        let e = HostLimitExceeded::UploadTooLarge {
            size: 4096,
            limit: 4096,
        };
        assert!(e.to_string().contains("4096"));
    }
}
