//! Object image format produced by the assembler and consumed by the VM.
//!
//! # Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! header        16 bytes   magic "\x7fXVM", version u16, flags u8, nsections u8,
//!                          entry u32, symtab_off u32
//! section table 24 bytes each: name [u8; 8], kind u8, reserved [u8; 3],
//!                          offset u32, length u32, base u32
//! payloads
//! symbol table  (DEBUG only) count u32, then { name_len u8, name, address u32 }
//! ```
//!
//! [`ProgramImage::from_bytes`] validates everything before returning, so the VM never
//! sees a malformed image.

use crate::types::encoding::{Decode, DecodeError, Encode, EncodeSink};
use crate::virtual_machine::errors::LoadError;
use crate::virtual_machine::isa::{MAP_BASE, PAGE_SIZE};
use std::fmt::Write;

/// Magic bytes identifying an object image.
pub const MAGIC: [u8; 4] = *b"\x7fXVM";

/// Current object format version.
pub const FORMAT_VERSION: u16 = 1;

/// Header flag: a symbol table follows the payloads.
pub const FLAG_DEBUG: u8 = 0x01;

pub const HEADER_SIZE: usize = 16;
pub const SECTION_HEADER_SIZE: usize = 24;
/// Longest symbol name the format can carry.
pub const MAX_SYMBOL_NAME: usize = 64;
const MAX_SECTIONS: u8 = 2;

/// Section content type.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionKind {
    Code = 1,
    Data = 2,
}

impl SectionKind {
    /// Canonical section name for this kind.
    pub const fn name(self) -> &'static str {
        match self {
            SectionKind::Code => ".text",
            SectionKind::Data => ".data",
        }
    }

    pub fn from_name(name: &str) -> Option<SectionKind> {
        match name {
            ".text" => Some(SectionKind::Code),
            ".data" => Some(SectionKind::Data),
            _ => None,
        }
    }

    const fn label(self) -> &'static str {
        match self {
            SectionKind::Code => "code",
            SectionKind::Data => "data",
        }
    }
}

/// A loadable section.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Section {
    pub kind: SectionKind,
    /// Load address.
    pub base: u32,
    pub bytes: Vec<u8>,
}

impl Section {
    pub fn name(&self) -> &'static str {
        self.kind.name()
    }

    /// Exclusive end address. Validated images never overflow.
    pub fn end(&self) -> u64 {
        self.base as u64 + self.bytes.len() as u64
    }
}

/// Debug symbol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    pub address: u32,
}

/// Symbol table presence.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum Symbols {
    #[default]
    Release,
    /// Symbols in source declaration order.
    Debug(Vec<Symbol>),
}

impl Symbols {
    pub fn is_debug(&self) -> bool {
        matches!(self, Symbols::Debug(_))
    }

    pub fn as_slice(&self) -> &[Symbol] {
        match self {
            Symbols::Release => &[],
            Symbols::Debug(symbols) => symbols,
        }
    }
}

/// Assembled program: sections, entry point and optional debug symbols.
///
/// Equality compares the program only; where a decoded image's payloads sat in its file
/// is kept for [`ProgramImage::describe`] but does not take part.
#[derive(Clone, Debug)]
pub struct ProgramImage {
    pub sections: Vec<Section>,
    pub entry: u32,
    pub symbols: Symbols,
    /// Payload offsets read from the section table, one per section.
    file_offsets: Option<Vec<u32>>,
}

impl PartialEq for ProgramImage {
    fn eq(&self, other: &Self) -> bool {
        self.sections == other.sections
            && self.entry == other.entry
            && self.symbols == other.symbols
    }
}

impl Eq for ProgramImage {}

struct Header {
    magic: [u8; 4],
    version: u16,
    flags: u8,
    nsections: u8,
    entry: u32,
    symtab_off: u32,
}

impl Encode for Header {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.magic.encode(out);
        self.version.encode(out);
        self.flags.encode(out);
        self.nsections.encode(out);
        self.entry.encode(out);
        self.symtab_off.encode(out);
    }
}

impl Decode for Header {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(Header {
            magic: Decode::decode(input)?,
            version: Decode::decode(input)?,
            flags: Decode::decode(input)?,
            nsections: Decode::decode(input)?,
            entry: Decode::decode(input)?,
            symtab_off: Decode::decode(input)?,
        })
    }
}

struct SectionHeader {
    name: [u8; 8],
    kind: u8,
    reserved: [u8; 3],
    offset: u32,
    length: u32,
    base: u32,
}

impl Encode for SectionHeader {
    fn encode<S: EncodeSink>(&self, out: &mut S) {
        self.name.encode(out);
        self.kind.encode(out);
        self.reserved.encode(out);
        self.offset.encode(out);
        self.length.encode(out);
        self.base.encode(out);
    }
}

impl Decode for SectionHeader {
    fn decode(input: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(SectionHeader {
            name: Decode::decode(input)?,
            kind: Decode::decode(input)?,
            reserved: Decode::decode(input)?,
            offset: Decode::decode(input)?,
            length: Decode::decode(input)?,
            base: Decode::decode(input)?,
        })
    }
}

fn encode_name(name: &str) -> [u8; 8] {
    let mut out = [0u8; 8];
    for (slot, b) in out.iter_mut().zip(name.bytes()) {
        *slot = b;
    }
    out
}

/// Decodes a NUL-padded section name. Bytes after the first NUL must be zero.
fn decode_name(raw: &[u8; 8]) -> Option<&str> {
    let len = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
    if raw[len..].iter().any(|b| *b != 0) {
        return None;
    }
    std::str::from_utf8(&raw[..len]).ok()
}

/// Returns `input[offset..offset + n]` or a truncation error.
fn take(input: &[u8], offset: usize, n: usize) -> Result<&[u8], LoadError> {
    offset
        .checked_add(n)
        .and_then(|end| input.get(offset..end))
        .ok_or(LoadError::Truncated {
            offset,
            needed: n,
            available: input.len().saturating_sub(offset),
        })
}

fn ranges_overlap(a: (u64, u64), b: (u64, u64)) -> bool {
    a.0 < b.1 && b.0 < a.1
}

impl ProgramImage {
    pub fn new(sections: Vec<Section>, entry: u32, symbols: Symbols) -> Self {
        Self {
            sections,
            entry,
            symbols,
            file_offsets: None,
        }
    }

    /// Returns the section called `name` (`.text` or `.data`).
    pub fn section(&self, name: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.name() == name)
    }

    pub fn text(&self) -> Option<&Section> {
        self.section(SectionKind::Code.name())
    }

    pub fn data(&self) -> Option<&Section> {
        self.section(SectionKind::Data.name())
    }

    /// File offsets of each section payload and of the symbol table.
    fn layout(&self) -> (Vec<u32>, u32) {
        let mut cursor = (HEADER_SIZE + self.sections.len() * SECTION_HEADER_SIZE) as u32;
        let mut offsets = Vec::with_capacity(self.sections.len());
        for section in &self.sections {
            offsets.push(cursor);
            cursor += section.bytes.len() as u32;
        }
        (offsets, cursor)
    }

    /// Serializes the image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (offsets, symtab_off) = self.layout();
        let mut out = Vec::new();
        Header {
            magic: MAGIC,
            version: FORMAT_VERSION,
            flags: if self.symbols.is_debug() { FLAG_DEBUG } else { 0 },
            nsections: self.sections.len() as u8,
            entry: self.entry,
            symtab_off: if self.symbols.is_debug() { symtab_off } else { 0 },
        }
        .encode(&mut out);

        for (section, offset) in self.sections.iter().zip(&offsets) {
            SectionHeader {
                name: encode_name(section.name()),
                kind: section.kind as u8,
                reserved: [0; 3],
                offset: *offset,
                length: section.bytes.len() as u32,
                base: section.base,
            }
            .encode(&mut out);
        }
        for section in &self.sections {
            out.write(&section.bytes);
        }

        if let Symbols::Debug(symbols) = &self.symbols {
            (symbols.len() as u32).encode(&mut out);
            for symbol in symbols {
                (symbol.name.len() as u8).encode(&mut out);
                out.write(symbol.name.as_bytes());
                symbol.address.encode(&mut out);
            }
        }
        out
    }

    /// Parses and validates an image.
    ///
    /// Nothing in the image is trusted: every offset, length, address and name is
    /// checked, and any inconsistency is a [`LoadError`].
    pub fn from_bytes(input: &[u8]) -> Result<Self, LoadError> {
        let mut cursor = take(input, 0, HEADER_SIZE)?;
        let header = Header::decode(&mut cursor).map_err(|_| LoadError::Truncated {
            offset: 0,
            needed: HEADER_SIZE,
            available: input.len(),
        })?;

        if header.magic != MAGIC {
            return Err(LoadError::BadMagic {
                found: header.magic,
            });
        }
        if header.version != FORMAT_VERSION {
            return Err(LoadError::UnsupportedVersion {
                found: header.version,
                expected: FORMAT_VERSION,
            });
        }
        if header.flags & !FLAG_DEBUG != 0 {
            return Err(LoadError::UnknownFlags {
                flags: header.flags,
            });
        }
        if header.nsections == 0 || header.nsections > MAX_SECTIONS {
            return Err(LoadError::SectionCount {
                count: header.nsections,
            });
        }
        let debug = header.flags & FLAG_DEBUG != 0;
        if !debug && header.symtab_off != 0 {
            return Err(LoadError::BadSymbolTable {
                offset: header.symtab_off,
            });
        }

        let table_end = HEADER_SIZE + header.nsections as usize * SECTION_HEADER_SIZE;
        let mut table = take(input, HEADER_SIZE, table_end - HEADER_SIZE)?;

        // (section, payload range)
        let mut parsed: Vec<(Section, (u64, u64))> = Vec::with_capacity(2);
        for _ in 0..header.nsections {
            let sh = SectionHeader::decode(&mut table).map_err(|_| LoadError::Truncated {
                offset: HEADER_SIZE,
                needed: table_end - HEADER_SIZE,
                available: input.len().saturating_sub(HEADER_SIZE),
            })?;
            parsed.push(Self::check_section(input, table_end, &sh)?);
        }

        for (i, (a, a_payload)) in parsed.iter().enumerate() {
            for (b, b_payload) in &parsed[i + 1..] {
                if a.kind == b.kind {
                    return Err(LoadError::DuplicateSection {
                        name: a.name().to_string(),
                    });
                }
                if ranges_overlap(*a_payload, *b_payload) {
                    return Err(LoadError::OverlappingPayload {
                        name: b.name().to_string(),
                        other: a.name().to_string(),
                    });
                }
                if ranges_overlap((a.base as u64, a.end()), (b.base as u64, b.end())) {
                    return Err(LoadError::OverlappingSections {
                        name: b.name().to_string(),
                        other: a.name().to_string(),
                    });
                }
            }
        }

        let payload_end = parsed
            .iter()
            .map(|(_, (_, end))| *end as usize)
            .fold(table_end, usize::max);
        let file_offsets: Vec<u32> = parsed.iter().map(|(_, (start, _))| *start as u32).collect();
        let sections: Vec<Section> = parsed.into_iter().map(|(s, _)| s).collect();

        let text = sections
            .iter()
            .find(|s| s.kind == SectionKind::Code && !s.bytes.is_empty())
            .ok_or(LoadError::MissingText)?;
        if (header.entry as u64) < text.base as u64 || header.entry as u64 >= text.end() {
            return Err(LoadError::BadEntry {
                entry: header.entry,
            });
        }

        let (symbols, end) = if debug {
            let off = header.symtab_off as usize;
            // The table follows the last payload directly.
            if off != payload_end {
                return Err(LoadError::BadSymbolTable {
                    offset: header.symtab_off,
                });
            }
            let (symbols, end) = Self::parse_symbols(input, off, &sections)?;
            (Symbols::Debug(symbols), end)
        } else {
            (Symbols::Release, payload_end)
        };

        if input.len() > end {
            return Err(LoadError::TrailingBytes {
                count: input.len() - end,
            });
        }

        Ok(ProgramImage {
            sections,
            entry: header.entry,
            symbols,
            file_offsets: Some(file_offsets),
        })
    }

    fn check_section(
        input: &[u8],
        table_end: usize,
        sh: &SectionHeader,
    ) -> Result<(Section, (u64, u64)), LoadError> {
        let name = decode_name(&sh.name).ok_or_else(|| LoadError::UnknownSection {
            name: String::from_utf8_lossy(&sh.name).into_owned(),
        })?;
        let kind = SectionKind::from_name(name).ok_or_else(|| LoadError::UnknownSection {
            name: name.to_string(),
        })?;
        if sh.kind != kind as u8 {
            return Err(LoadError::SectionKindMismatch {
                name: name.to_string(),
                kind: sh.kind,
            });
        }
        if sh.reserved != [0; 3] {
            return Err(LoadError::ReservedBytes {
                name: name.to_string(),
            });
        }

        let payload = (sh.offset as u64, sh.offset as u64 + sh.length as u64);
        if payload.1 > input.len() as u64 {
            return Err(LoadError::SectionOutOfBounds {
                name: name.to_string(),
                offset: sh.offset,
                length: sh.length,
                size: input.len(),
            });
        }
        if sh.length > 0 && payload.0 < table_end as u64 {
            return Err(LoadError::OverlappingPayload {
                name: name.to_string(),
                other: "the header".to_string(),
            });
        }

        let load_end = sh.base as u64 + sh.length as u64;
        if (sh.base as u64) < PAGE_SIZE as u64 || load_end > MAP_BASE as u64 {
            return Err(LoadError::BadLoadAddress {
                name: name.to_string(),
                base: sh.base,
                length: sh.length,
            });
        }

        let bytes = input[payload.0 as usize..payload.1 as usize].to_vec();
        Ok((
            Section {
                kind,
                base: sh.base,
                bytes,
            },
            payload,
        ))
    }

    /// Parses the symbol table at `off`, returning the symbols and the end offset.
    fn parse_symbols(
        input: &[u8],
        off: usize,
        sections: &[Section],
    ) -> Result<(Vec<Symbol>, usize), LoadError> {
        let raw = take(input, off, 4)?;
        let count = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize;
        let mut cursor = off + 4;
        // Each entry is at least 6 bytes, so a huge count fails on truncation.
        let mut symbols = Vec::with_capacity(count.min(input.len() / 6));
        for index in 0..count {
            let name_len = take(input, cursor, 1)?[0] as usize;
            cursor += 1;
            if name_len == 0 || name_len > MAX_SYMBOL_NAME {
                return Err(LoadError::BadSymbolName { index });
            }
            let name = std::str::from_utf8(take(input, cursor, name_len)?)
                .map_err(|_| LoadError::BadSymbolName { index })?
                .to_string();
            cursor += name_len;
            let raw = take(input, cursor, 4)?;
            let address = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
            cursor += 4;

            // A trailing label names the position just past its section.
            let in_range = sections
                .iter()
                .any(|s| address as u64 >= s.base as u64 && address as u64 <= s.end());
            if !in_range {
                return Err(LoadError::SymbolOutOfRange { name, address });
            }
            symbols.push(Symbol { name, address });
        }
        Ok((symbols, cursor))
    }

    /// Human-readable dump of sections and symbols, used by `xinfo` and the service.
    pub fn describe(&self) -> String {
        let offsets = match &self.file_offsets {
            Some(offsets) => offsets.clone(),
            None => self.layout().0,
        };
        let mut out = String::new();
        let _ = writeln!(out, "Dumping Section Info");
        for (section, offset) in self.sections.iter().zip(offsets) {
            let _ = writeln!(
                out,
                "  {:<6} {:<4}  base={:#010x}  size={:#x}  offset={:#x}",
                section.name(),
                section.kind.label(),
                section.base,
                section.bytes.len(),
                offset
            );
        }
        let _ = writeln!(out, "Entry point: {:#010x}", self.entry);
        match &self.symbols {
            Symbols::Debug(symbols) if !symbols.is_empty() => {
                let _ = writeln!(out, "Dumping SymTab");
                for symbol in symbols {
                    let _ = writeln!(out, "  {}  {:#010x}", symbol.name, symbol.address);
                }
            }
            _ => {
                let _ = writeln!(out, "No symbols.");
            }
        }
        out
    }
}
