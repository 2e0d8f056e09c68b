//! Instruction Set Architecture (ISA) definitions.
//!
//! The [`for_each_instruction!`](crate::for_each_instruction) macro holds the canonical
//! instruction table and invokes a callback macro for code generation, so the decoder,
//! the assembler and the disassembler never disagree about opcodes or operand layout.
//!
//! This module generates:
//! - The [`Instruction`] enum with opcode mappings
//! - Mnemonic, operand-kind and size lookups
//!
//! # Encoding
//!
//! One opcode byte followed by the operands in table order:
//! - `Reg`: 1 byte register index
//! - `Imm`: 4 bytes (little-endian word)
//! - `Mem`: 1 byte register index holding the address
//!
//! A mnemonic may appear several times, once per operand-form combination.

use crate::virtual_machine::operand::{Decoded, OperandKind};

/// Machine word size in bytes.
pub const WORD_SIZE: u32 = 4;
/// Page granularity for memory maps.
pub const PAGE_SIZE: u32 = 0x1000;
/// Load address of `.text`.
pub const TEXT_BASE: u32 = 0x0000_1000;
/// Start of the area reserved for `MAP` syscalls. Image sections must load below it.
pub const MAP_BASE: u32 = 0x2000_0000;
/// End (exclusive) of the map area.
pub const MAP_LIMIT: u32 = 0x4000_0000;
/// Initial `$sp`/`$bp`; the stack grows down from here.
pub const STACK_TOP: u32 = 0x8000_0000;
/// Size of the stack region.
pub const STACK_SIZE: u32 = 0x1_0000;
/// Lowest valid stack address.
pub const STACK_BASE: u32 = STACK_TOP - STACK_SIZE;

/// Number of operand-addressable registers.
pub const REGISTER_COUNT: usize = 15;
/// Syscall number and result register.
pub const REG_R0: u8 = 0;
pub const REG_R1: u8 = 1;
pub const REG_R2: u8 = 2;
pub const REG_R4: u8 = 4;
pub const REG_R5: u8 = 5;
pub const REG_SP: u8 = 13;
pub const REG_BP: u8 = 14;

const REGISTER_NAMES: [&str; REGISTER_COUNT] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "ra", "rb", "rc", "sp", "bp",
];

/// Looks up a register by name, without the `$` sigil.
pub fn register_index(name: &str) -> Option<u8> {
    REGISTER_NAMES
        .iter()
        .position(|r| r.eq_ignore_ascii_case(name))
        .map(|i| i as u8)
}

/// Returns the canonical name of register `index`.
pub fn register_name(index: u8) -> Option<&'static str> {
    REGISTER_NAMES.get(index as usize).copied()
}

/// Invokes a callback macro with the complete instruction definition list.
///
/// This macro enables code generation for instructions in multiple modules
/// without duplicating the instruction definitions.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Control
            // =========================
            /// HLT ; stop the run normally
            Hlt = 0x01, "hlt" => [],
            /// NOP ; no effect
            Nop = 0x02, "nop" => [],
            // =========================
            // Data movement
            // =========================
            /// MOV rd, imm ; rd = imm
            MovRegImm = 0x10, "mov" => [rd: Reg, imm: Imm],
            /// MOV rd, rs ; rd = rs
            MovRegReg = 0x11, "mov" => [rd: Reg, rs: Reg],
            /// MOV rd, [rs] ; rd = word at rs
            MovRegMem = 0x12, "mov" => [rd: Reg, rs: Mem],
            /// MOV [rd], rs ; word at rd = rs
            MovMemReg = 0x13, "mov" => [rd: Mem, rs: Reg],
            /// MOV [rd], imm ; word at rd = imm
            MovMemImm = 0x14, "mov" => [rd: Mem, imm: Imm],
            /// MOVB rd, [rs] ; rd = zero-extended byte at rs
            MovbRegMem = 0x18, "movb" => [rd: Reg, rs: Mem],
            /// MOVB [rd], rs ; byte at rd = low byte of rs
            MovbMemReg = 0x19, "movb" => [rd: Mem, rs: Reg],
            /// MOVB [rd], imm ; byte at rd = low byte of imm
            MovbMemImm = 0x1A, "movb" => [rd: Mem, imm: Imm],
            /// MOVB rd, imm ; rd = low byte of imm
            MovbRegImm = 0x1B, "movb" => [rd: Reg, imm: Imm],
            // =========================
            // Arithmetic
            // =========================
            /// ADD rd, rs ; rd += rs
            AddRegReg = 0x20, "add" => [rd: Reg, rs: Reg],
            /// ADD rd, imm ; rd += imm
            AddRegImm = 0x21, "add" => [rd: Reg, imm: Imm],
            /// SUB rd, rs ; rd -= rs
            SubRegReg = 0x22, "sub" => [rd: Reg, rs: Reg],
            /// SUB rd, imm ; rd -= imm
            SubRegImm = 0x23, "sub" => [rd: Reg, imm: Imm],
            /// INC rd ; rd += 1
            Inc = 0x24, "inc" => [rd: Reg],
            /// DEC rd ; rd -= 1
            Dec = 0x25, "dec" => [rd: Reg],
            // =========================
            // Bitwise
            // =========================
            /// XOR rd, rs ; rd ^= rs
            XorRegReg = 0x30, "xor" => [rd: Reg, rs: Reg],
            /// XOR rd, imm ; rd ^= imm
            XorRegImm = 0x31, "xor" => [rd: Reg, imm: Imm],
            /// XORB rd, rs ; low byte of rd ^= low byte of rs
            XorbRegReg = 0x32, "xorb" => [rd: Reg, rs: Reg],
            /// XORB rd, imm ; low byte of rd ^= low byte of imm
            XorbRegImm = 0x33, "xorb" => [rd: Reg, imm: Imm],
            /// AND rd, rs ; rd &= rs
            AndRegReg = 0x34, "and" => [rd: Reg, rs: Reg],
            /// AND rd, imm ; rd &= imm
            AndRegImm = 0x35, "and" => [rd: Reg, imm: Imm],
            /// OR rd, rs ; rd |= rs
            OrRegReg = 0x36, "or" => [rd: Reg, rs: Reg],
            /// OR rd, imm ; rd |= imm
            OrRegImm = 0x37, "or" => [rd: Reg, imm: Imm],
            // =========================
            // Compare / branch
            // =========================
            /// CMP ra, rb ; flags from ra - rb
            CmpRegReg = 0x40, "cmp" => [ra: Reg, rb: Reg],
            /// CMP ra, imm ; flags from ra - imm
            CmpRegImm = 0x41, "cmp" => [ra: Reg, imm: Imm],
            /// JMP target ; pc = target
            Jmp = 0x42, "jmp" => [target: Imm],
            /// JZ target ; if ZERO
            Jz = 0x43, "jz" => [target: Imm],
            /// JNZ target ; if !ZERO
            Jnz = 0x44, "jnz" => [target: Imm],
            /// JL target ; if SIGN (signed less)
            Jl = 0x45, "jl" => [target: Imm],
            /// JG target ; if !SIGN && !ZERO (signed greater)
            Jg = 0x46, "jg" => [target: Imm],
            /// JMP rs ; pc = rs
            JmpReg = 0x47, "jmp" => [rs: Reg],
            // =========================
            // Stack / call
            // =========================
            /// PUSH rs ; sp -= 4, [sp] = rs
            PushReg = 0x50, "push" => [rs: Reg],
            /// PUSH imm ; sp -= 4, [sp] = imm
            PushImm = 0x51, "push" => [imm: Imm],
            /// POP rd ; rd = [sp], sp += 4
            Pop = 0x52, "pop" => [rd: Reg],
            /// CALL target ; push return address, pc = target
            Call = 0x53, "call" => [target: Imm],
            /// CALL rs ; push return address, pc = rs
            CallReg = 0x54, "call" => [rs: Reg],
            /// RET ; pc = pop
            Ret = 0x55, "ret" => [],
            // =========================
            // Host
            // =========================
            /// SYSCALL ; dispatch on r0
            Syscall = 0x60, "syscall" => [],
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        // =========================
        // VM instruction enum
        // =========================
        #[repr(u8)]
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl Instruction {
            /// Every instruction, in table order.
            pub const ALL: &'static [Instruction] = &[ $( Instruction::$name, )* ];

            /// Size of the longest encoding.
            pub const MAX_SIZE: usize = {
                let mut max = 0;
                let mut i = 0;
                while i < Instruction::ALL.len() {
                    let size = Instruction::ALL[i].size();
                    if size > max {
                        max = size;
                    }
                    i += 1;
                }
                max
            };

            /// Decodes an opcode byte.
            pub const fn from_opcode(opcode: u8) -> Option<Instruction> {
                match opcode {
                    $( $opcode => Some(Instruction::$name), )*
                    _ => None,
                }
            }

            /// Returns the opcode byte.
            pub const fn opcode(self) -> u8 {
                self as u8
            }

            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Returns the operand kinds in encoding order.
            pub const fn operands(self) -> &'static [OperandKind] {
                match self {
                    $( Instruction::$name => &[ $( OperandKind::$kind ),* ], )*
                }
            }

            /// Returns the encoded size (opcode + operands).
            pub const fn size(self) -> usize {
                match self {
                    $( Instruction::$name => 1usize $( + OperandKind::$kind.size() )*, )*
                }
            }
        }
    };
}

for_each_instruction!(define_instructions);

impl Instruction {
    /// Finds the encoding of `mnemonic` whose operand kinds match `kinds`.
    pub fn lookup(mnemonic: &str, kinds: &[OperandKind]) -> Option<Instruction> {
        Instruction::ALL
            .iter()
            .copied()
            .find(|i| i.mnemonic() == mnemonic && i.operands() == kinds)
    }

    /// Returns `true` if some instruction uses `mnemonic`.
    pub fn is_mnemonic(mnemonic: &str) -> bool {
        Instruction::ALL.iter().any(|i| i.mnemonic() == mnemonic)
    }

    /// All operand-kind lists accepted by `mnemonic`.
    pub fn forms(mnemonic: &str) -> Vec<&'static [OperandKind]> {
        Instruction::ALL
            .iter()
            .filter(|i| i.mnemonic() == mnemonic)
            .map(|i| i.operands())
            .collect()
    }
}

/// Decodes the instruction at the start of `code` without executing it.
///
/// Returns `None` for an unknown opcode or when the operands run past the slice.
pub fn decode(code: &[u8]) -> Option<(Instruction, Vec<Decoded>)> {
    let instr = Instruction::from_opcode(*code.first()?)?;
    let mut cursor = 1usize;
    let mut operands = Vec::with_capacity(instr.operands().len());
    for kind in instr.operands() {
        let raw = code.get(cursor..cursor + kind.size())?;
        operands.push(match kind {
            OperandKind::Reg => Decoded::Reg(raw[0]),
            OperandKind::Mem => Decoded::Mem(raw[0]),
            OperandKind::Imm => Decoded::Imm(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]])),
        });
        cursor += kind.size();
    }
    Some((instr, operands))
}

/// Renders `code` loaded at `base` as one line per instruction.
///
/// Undecodable bytes are printed as `.db` and decoding resumes at the next byte.
pub fn disassemble(code: &[u8], base: u32) -> Vec<String> {
    let mut lines = Vec::new();
    let mut offset = 0usize;
    while offset < code.len() {
        let addr = base.wrapping_add(offset as u32);
        match decode(&code[offset..]) {
            Some((instr, operands)) => {
                let args = operands
                    .iter()
                    .map(|o| o.to_string())
                    .collect::<Vec<_>>()
                    .join(", ");
                if args.is_empty() {
                    lines.push(format!("{addr:#010x}  {}", instr.mnemonic()));
                } else {
                    lines.push(format!("{addr:#010x}  {} {args}", instr.mnemonic()));
                }
                offset += instr.size();
            }
            None => {
                lines.push(format!("{addr:#010x}  .db {:#04x}", code[offset]));
                offset += 1;
            }
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_opcode_invalid() {
        assert_eq!(Instruction::from_opcode(0xFF), None);
        assert_eq!(Instruction::from_opcode(0x00), None);
    }

    #[test]
    fn opcodes_round_trip() {
        for instr in Instruction::ALL {
            assert_eq!(Instruction::from_opcode(instr.opcode()), Some(*instr));
        }
    }

    #[test]
    fn sizes_follow_operands() {
        assert_eq!(Instruction::Hlt.size(), 1);
        assert_eq!(Instruction::MovRegImm.size(), 6);
        assert_eq!(Instruction::MovRegReg.size(), 3);
        assert_eq!(Instruction::MovbMemImm.size(), 6);
        assert_eq!(Instruction::Jz.size(), 5);
        assert_eq!(Instruction::Pop.size(), 2);
    }

    #[test]
    fn lookup_selects_form() {
        use OperandKind::*;
        assert_eq!(Instruction::lookup("mov", &[Reg, Imm]), Some(Instruction::MovRegImm));
        assert_eq!(Instruction::lookup("mov", &[Mem, Reg]), Some(Instruction::MovMemReg));
        assert_eq!(Instruction::lookup("jmp", &[Reg]), Some(Instruction::JmpReg));
        assert_eq!(Instruction::lookup("mov", &[Mem, Mem]), None);
        assert_eq!(Instruction::lookup("bogus", &[]), None);
        assert!(Instruction::is_mnemonic("xorb"));
        assert_eq!(Instruction::forms("push").len(), 2);
    }

    #[test]
    fn no_duplicate_forms() {
        for (i, a) in Instruction::ALL.iter().enumerate() {
            for b in &Instruction::ALL[i + 1..] {
                assert!(
                    a.mnemonic() != b.mnemonic() || a.operands() != b.operands(),
                    "{a:?} and {b:?} share a form"
                );
            }
        }
    }

    #[test]
    fn register_names() {
        assert_eq!(register_index("r0"), Some(0));
        assert_eq!(register_index("R9"), Some(9));
        assert_eq!(register_index("rc"), Some(12));
        assert_eq!(register_index("sp"), Some(REG_SP));
        assert_eq!(register_index("bp"), Some(REG_BP));
        assert_eq!(register_index("pc"), None);
        assert_eq!(register_index("r10"), None);
        assert_eq!(register_name(14), Some("bp"));
        assert_eq!(register_name(15), None);
    }

    #[test]
    fn decode_and_disassemble() {
        let code = [0x10, 0x02, 0x41, 0x00, 0x00, 0x00, 0x19, 0x07, 0x03, 0x01, 0xEE];
        let (instr, ops) = decode(&code).unwrap();
        assert_eq!(instr, Instruction::MovRegImm);
        assert_eq!(ops, vec![Decoded::Reg(2), Decoded::Imm(0x41)]);

        let lines = disassemble(&code, TEXT_BASE);
        assert_eq!(
            lines,
            vec![
                "0x00001000  mov $r2, #0x41",
                "0x00001006  movb [$r7], $r3",
                "0x00001009  hlt",
                "0x0000100a  .db 0xee",
            ]
        );
    }

    #[test]
    fn decode_truncated() {
        assert_eq!(decode(&[0x10, 0x02, 0x41]), None);
        assert_eq!(decode(&[]), None);
    }

    #[test]
    fn layout_is_disjoint() {
        assert!(TEXT_BASE < MAP_BASE);
        assert!(MAP_LIMIT <= STACK_BASE);
        assert_eq!(STACK_BASE % PAGE_SIZE, 0);
    }
}
