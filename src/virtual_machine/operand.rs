//! Operand forms shared by the assembler, decoder and disassembler.

use crate::virtual_machine::isa::register_name;
use std::fmt;

/// Encoded operand kind, as listed in the instruction table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum OperandKind {
    /// `$reg`: 1 byte register index.
    Reg,
    /// `#value` or label: 4 byte little-endian word.
    Imm,
    /// `[ $reg ]`: 1 byte register index holding an address.
    Mem,
}

impl OperandKind {
    /// Encoded size in bytes.
    pub const fn size(self) -> usize {
        match self {
            OperandKind::Reg | OperandKind::Mem => 1,
            OperandKind::Imm => 4,
        }
    }

    /// Human-readable name used in diagnostics.
    pub const fn name(self) -> &'static str {
        match self {
            OperandKind::Reg => "register",
            OperandKind::Imm => "immediate",
            OperandKind::Mem => "memory",
        }
    }
}

/// Immediate operand before label resolution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Immediate {
    Value(u32),
    Label(String),
}

/// Parsed operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operand {
    Reg(u8),
    Imm(Immediate),
    Mem(u8),
}

impl Operand {
    pub fn kind(&self) -> OperandKind {
        match self {
            Operand::Reg(_) => OperandKind::Reg,
            Operand::Imm(_) => OperandKind::Imm,
            Operand::Mem(_) => OperandKind::Mem,
        }
    }
}

/// Operand decoded from machine code, used when printing disassembly.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decoded {
    Reg(u8),
    Imm(u32),
    Mem(u8),
}

impl fmt::Display for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decoded::Reg(r) => match register_name(*r) {
                Some(name) => write!(f, "${name}"),
                None => write!(f, "$?{r}"),
            },
            Decoded::Imm(v) => write!(f, "#{v:#x}"),
            Decoded::Mem(r) => match register_name(*r) {
                Some(name) => write!(f, "[${name}]"),
                None => write!(f, "[$?{r}]"),
            },
        }
    }
}

/// Formats a list of operand kinds as `register, immediate`.
pub fn describe_kinds(kinds: &[OperandKind]) -> String {
    if kinds.is_empty() {
        return "none".to_string();
    }
    kinds
        .iter()
        .map(|k| k.name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_sizes() {
        assert_eq!(OperandKind::Reg.size(), 1);
        assert_eq!(OperandKind::Mem.size(), 1);
        assert_eq!(OperandKind::Imm.size(), 4);
    }

    #[test]
    fn operand_kind_matches_variant() {
        assert_eq!(Operand::Reg(3).kind(), OperandKind::Reg);
        assert_eq!(Operand::Mem(3).kind(), OperandKind::Mem);
        assert_eq!(
            Operand::Imm(Immediate::Label("loop".into())).kind(),
            OperandKind::Imm
        );
    }

    #[test]
    fn decoded_display() {
        assert_eq!(Decoded::Reg(13).to_string(), "$sp");
        assert_eq!(Decoded::Mem(7).to_string(), "[$r7]");
        assert_eq!(Decoded::Imm(0x41).to_string(), "#0x41");
        assert_eq!(Decoded::Reg(15).to_string(), "$?15");
    }

    #[test]
    fn describe_kind_lists() {
        assert_eq!(describe_kinds(&[]), "none");
        assert_eq!(
            describe_kinds(&[OperandKind::Reg, OperandKind::Imm]),
            "register, immediate"
        );
    }
}
