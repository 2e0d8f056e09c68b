//! Assembly language parser and object image compiler.
//!
//! Converts human-readable assembly into a [`ProgramImage`]. Instruction forms come from
//! the [`for_each_instruction!`](crate::for_each_instruction) table through
//! [`Instruction::lookup`], so the assembler can never emit an encoding the VM does not know.
//!
//! # Syntax
//!
//! ```text
//! label:  mnemonic operand, operand   ; comment
//! ```
//!
//! - Registers use a `$` prefix (`$r0`..`$r9`, `$ra`, `$rb`, `$rc`, `$sp`, `$bp`)
//! - Immediates are `#value`, a bare integer or a label name
//! - Memory operands are `[ $reg ]`
//! - Integers are decimal or `0x` hex, optionally negative
//! - Directives: `.section .text|.data`, `.db`, `.dw`, `.asciz`, `.zero`
//! - Comments start with `;`
//!
//! # Passes
//!
//! Pass 1 parses every line, selects opcodes, sizes items and records label offsets per
//! section. Section bases are then fixed (`.data` follows `.text`) and labels become
//! absolute. Pass 2 resolves label references and emits bytes.

use crate::virtual_machine::errors::AssembleError;
use crate::virtual_machine::isa::{Instruction, MAP_BASE, TEXT_BASE, register_index};
use crate::virtual_machine::operand::{Immediate, Operand, OperandKind, describe_kinds};
use crate::virtual_machine::program::{
    MAX_SYMBOL_NAME, ProgramImage, Section, SectionKind, Symbol, Symbols,
};
use std::collections::HashMap;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const COMMENT_CHAR: u8 = b';';
const LABEL_SUFFIX: char = ':';
const ENTRY_LABEL: &str = "_start";
/// Bytes available between `TEXT_BASE` and the map area.
const LOAD_WINDOW: usize = (MAP_BASE - TEXT_BASE) as usize;

/// Assembler options.
#[derive(Clone, Copy, Debug, Default)]
pub struct AsmOptions {
    /// Emit a symbol table holding every label in declaration order.
    pub debug: bool,
}

/// Formats a compiler-style diagnostic for an assembly failure.
///
/// Errors without a source location render as a single `error:` line.
pub fn render_diagnostic(file: &str, source: &str, err: &AssembleError) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {err}");
    let Some((line, column)) = err.location() else {
        return diag;
    };
    let _ = writeln!(diag, " --> {file}:{line}:{column}");

    if let Some(raw_line) = source.lines().nth(line.saturating_sub(1)) {
        let line_text = raw_line.trim_end_matches('\r');
        let underline = " ".repeat(column.saturating_sub(1));
        let _ = writeln!(diag, "  |");
        let _ = writeln!(diag, "{:>4} | {}", line, line_text);
        let _ = writeln!(diag, "  | {}^", underline);
    }

    diag
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Location {
    line: usize,
    column: usize,
}

fn syntax(loc: Location, message: impl Into<String>) -> AssembleError {
    AssembleError::Syntax {
        line: loc.line,
        column: loc.column,
        message: message.into(),
    }
}

#[derive(Debug, Clone, Copy)]
struct Token<'a> {
    text: &'a str,
    /// 1-based column offset in the line.
    offset: usize,
}

impl Token<'_> {
    fn at(&self, line: usize) -> Location {
        Location {
            line,
            column: self.offset,
        }
    }
}

/// One source line split into its parts.
#[derive(Debug, Default)]
struct SourceLine<'a> {
    label: Option<Token<'a>>,
    head: Option<Token<'a>>,
    operands: Vec<Token<'a>>,
}

/// Returns the byte index where the comment starts, or the line length.
///
/// `;` inside string or character literals does not start a comment.
fn code_end(line_no: usize, line: &str) -> Result<usize, AssembleError> {
    let bytes = line.as_bytes();
    let mut quote: Option<(u8, usize)> = None;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        match quote {
            Some((q, _)) => {
                if b == b'\\' {
                    i += 1;
                } else if b == q {
                    quote = None;
                }
            }
            None if b == COMMENT_CHAR => return Ok(i),
            None if b == b'"' || b == b'\'' => quote = Some((b, i)),
            None => {}
        }
        i += 1;
    }
    if let Some((q, start)) = quote {
        let what = if q == b'"' { "string" } else { "character" };
        return Err(syntax(
            Location {
                line: line_no,
                column: start + 1,
            },
            format!("unterminated {what} literal"),
        ));
    }
    Ok(bytes.len())
}

fn skip_ws(bytes: &[u8], mut i: usize, end: usize) -> usize {
    while i < end && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn word_end(bytes: &[u8], mut i: usize, end: usize) -> usize {
    while i < end && !bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Tokenize a single line of assembly into label, head and operands.
///
/// Rules:
/// - `;` starts a comment
/// - a first word ending in `:` is a label
/// - operands are separated by commas outside literals and brackets
fn tokenize(line_no: usize, line: &str) -> Result<SourceLine<'_>, AssembleError> {
    let end = code_end(line_no, line)?;
    let bytes = line.as_bytes();
    let mut out = SourceLine::default();

    let mut i = skip_ws(bytes, 0, end);
    if i == end {
        return Ok(out);
    }
    let mut j = word_end(bytes, i, end);
    if let Some(name) = line[i..j].strip_suffix(LABEL_SUFFIX) {
        out.label = Some(Token {
            text: name,
            offset: i + 1,
        });
        i = skip_ws(bytes, j, end);
        if i == end {
            return Ok(out);
        }
        j = word_end(bytes, i, end);
    }
    out.head = Some(Token {
        text: &line[i..j],
        offset: i + 1,
    });

    let rest_start = skip_ws(bytes, j, end);
    if rest_start == end {
        return Ok(out);
    }

    let mut quote: Option<u8> = None;
    let mut depth = 0usize;
    let mut start = rest_start;
    let mut k = rest_start;
    while k <= end {
        let at_end = k == end;
        let b = if at_end { b',' } else { bytes[k] };
        match quote {
            Some(q) if !at_end => {
                if b == b'\\' {
                    k += 1;
                } else if b == q {
                    quote = None;
                }
            }
            _ => match b {
                b'"' | b'\'' => quote = Some(b),
                b'[' => depth += 1,
                b']' => depth = depth.saturating_sub(1),
                b',' if depth == 0 || at_end => {
                    let raw = &line[start..k];
                    let trimmed = raw.trim();
                    let lead = raw.len() - raw.trim_start().len();
                    if trimmed.is_empty() {
                        return Err(syntax(
                            Location {
                                line: line_no,
                                column: start + 1,
                            },
                            "empty operand",
                        ));
                    }
                    out.operands.push(Token {
                        text: trimmed,
                        offset: start + lead + 1,
                    });
                    start = k + 1;
                }
                _ => {}
            },
        }
        k += 1;
    }

    Ok(out)
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

/// Parses a decimal or `0x` hex integer, optionally negative.
///
/// Returns a value in `-2^31..=u32::MAX`.
pub(crate) fn parse_int(text: &str) -> Option<i64> {
    let (negative, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let magnitude = if let Some(hex) = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        u64::from_str_radix(hex, 16).ok()?
    } else {
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse::<u64>().ok()?
    };
    if negative {
        (magnitude <= 1 << 31).then(|| -(magnitude as i64))
    } else {
        (magnitude <= u32::MAX as u64).then_some(magnitude as i64)
    }
}

/// Decodes backslash escapes in a literal body.
fn unescape(body: &str, loc: Location) -> Result<Vec<u8>, AssembleError> {
    let bytes = body.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        let esc = *bytes
            .get(i + 1)
            .ok_or_else(|| syntax(loc, "dangling escape"))?;
        i += 2;
        out.push(match esc {
            b'n' => b'\n',
            b't' => b'\t',
            b'r' => b'\r',
            b'0' => 0,
            b'\\' => b'\\',
            b'"' => b'"',
            b'\'' => b'\'',
            b'x' => {
                let hex = body
                    .get(i..i + 2)
                    .filter(|h| h.bytes().all(|b| b.is_ascii_hexdigit()))
                    .ok_or_else(|| syntax(loc, "\\x needs two hex digits"))?;
                i += 2;
                u8::from_str_radix(hex, 16).map_err(|_| syntax(loc, "bad \\x escape"))?
            }
            other => {
                return Err(syntax(
                    loc,
                    format!("unknown escape `\\{}`", other as char),
                ));
            }
        });
    }
    Ok(out)
}

fn parse_string(tok: &Token, loc: Location) -> Result<Vec<u8>, AssembleError> {
    let body = tok
        .text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .filter(|_| tok.text.len() >= 2)
        .ok_or_else(|| syntax(loc, format!("expected a string literal, found `{}`", tok.text)))?;
    unescape(body, loc)
}

fn parse_char(text: &str, loc: Location) -> Result<u8, AssembleError> {
    let body = text
        .strip_prefix('\'')
        .and_then(|t| t.strip_suffix('\''))
        .filter(|_| text.len() >= 2)
        .ok_or_else(|| syntax(loc, format!("malformed character literal `{text}`")))?;
    match unescape(body, loc)?.as_slice() {
        [b] => Ok(*b),
        _ => Err(syntax(loc, "character literal must hold exactly one byte")),
    }
}

/// Parses an integer or character literal into a word.
fn parse_value(text: &str, loc: Location) -> Result<i64, AssembleError> {
    if text.starts_with('\'') {
        return parse_char(text, loc).map(i64::from);
    }
    parse_int(text).ok_or_else(|| syntax(loc, format!("invalid number `{text}`")))
}

fn parse_register(text: &str, loc: Location) -> Result<u8, AssembleError> {
    text.strip_prefix('$')
        .and_then(register_index)
        .ok_or_else(|| syntax(loc, format!("unknown register `{text}`")))
}

/// Parses one instruction operand.
fn parse_operand(tok: &Token, line: usize) -> Result<Operand, AssembleError> {
    let loc = tok.at(line);
    let text = tok.text;
    if text.starts_with('$') {
        return parse_register(text, loc).map(Operand::Reg);
    }
    if let Some(inner) = text.strip_prefix('[') {
        let inner = inner
            .strip_suffix(']')
            .ok_or_else(|| syntax(loc, "missing `]` in memory operand"))?;
        return parse_register(inner.trim(), loc).map(Operand::Mem);
    }
    let literal = text.strip_prefix('#').unwrap_or(text);
    if is_identifier(literal) {
        return Ok(Operand::Imm(Immediate::Label(literal.to_string())));
    }
    parse_value(literal, loc).map(|v| Operand::Imm(Immediate::Value(v as u32)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SectionId {
    Text,
    Data,
}

impl SectionId {
    fn parse(name: &str) -> Option<SectionId> {
        match SectionKind::from_name(name)? {
            SectionKind::Code => Some(SectionId::Text),
            SectionKind::Data => Some(SectionId::Data),
        }
    }
}

/// Sized output item produced by pass 1.
#[derive(Debug)]
enum Item {
    Instr {
        instr: Instruction,
        operands: Vec<(Operand, Location)>,
    },
    Bytes(Vec<u8>),
    Words(Vec<(Immediate, Location)>),
}

impl Item {
    fn size(&self) -> usize {
        match self {
            Item::Instr { instr, .. } => instr.size(),
            Item::Bytes(bytes) => bytes.len(),
            Item::Words(words) => words.len() * 4,
        }
    }
}

struct LabelDef {
    name: String,
    section: SectionId,
    offset: usize,
    at: Location,
}

/// Assembly context for label tracking during compilation.
#[derive(Default)]
struct AsmContext {
    /// Label definitions in declaration order.
    labels: Vec<LabelDef>,
    /// Label name to index in `labels`.
    index: HashMap<String, usize>,
    /// Absolute addresses, filled in between the passes.
    addresses: HashMap<String, u32>,
    items: Vec<(SectionId, Item)>,
    text_size: usize,
    data_size: usize,
}

impl AsmContext {
    fn section_size(&mut self, section: SectionId) -> &mut usize {
        match section {
            SectionId::Text => &mut self.text_size,
            SectionId::Data => &mut self.data_size,
        }
    }

    /// Registers a label at the current offset of `section`.
    fn define_label(&mut self, tok: &Token, line: usize, section: SectionId) -> Result<(), AssembleError> {
        let at = tok.at(line);
        if !is_identifier(tok.text) {
            return Err(syntax(at, format!("invalid label name `{}`", tok.text)));
        }
        if tok.text.len() > MAX_SYMBOL_NAME {
            return Err(syntax(
                at,
                format!("label name longer than {MAX_SYMBOL_NAME} bytes"),
            ));
        }
        if let Some(first) = self.index.get(tok.text) {
            return Err(AssembleError::DuplicateLabel {
                line,
                column: tok.offset,
                label: tok.text.to_string(),
                first_line: self.labels[*first].at.line,
            });
        }
        let offset = *self.section_size(section);
        self.index.insert(tok.text.to_string(), self.labels.len());
        self.labels.push(LabelDef {
            name: tok.text.to_string(),
            section,
            offset,
            at,
        });
        Ok(())
    }

    /// Fails if `extra` more bytes would not fit below the map area.
    fn check_room(&self, extra: usize) -> Result<(), AssembleError> {
        let total = self.text_size + self.data_size + extra;
        if total > LOAD_WINDOW {
            return Err(AssembleError::TooLarge {
                size: total,
                limit: LOAD_WINDOW,
            });
        }
        Ok(())
    }

    fn push(&mut self, section: SectionId, item: Item) -> Result<(), AssembleError> {
        let size = item.size();
        self.check_room(size)?;
        *self.section_size(section) += size;
        self.items.push((section, item));
        Ok(())
    }

    /// Resolves an immediate to its final word.
    fn resolve(&self, imm: &Immediate, at: Location) -> Result<u32, AssembleError> {
        match imm {
            Immediate::Value(v) => Ok(*v),
            Immediate::Label(name) => {
                self.addresses
                    .get(name)
                    .copied()
                    .ok_or_else(|| AssembleError::UndefinedLabel {
                        line: at.line,
                        column: at.column,
                        label: name.clone(),
                    })
            }
        }
    }
}

/// Builds an instruction item from its mnemonic and operand tokens.
fn parse_instruction(head: &Token, operands: &[Token], line: usize) -> Result<Item, AssembleError> {
    let mnemonic = head.text.to_ascii_lowercase();
    if !Instruction::is_mnemonic(&mnemonic) {
        return Err(AssembleError::UnknownMnemonic {
            line,
            column: head.offset,
            mnemonic: head.text.to_string(),
        });
    }

    let parsed = operands
        .iter()
        .map(|tok| Ok((parse_operand(tok, line)?, tok.at(line))))
        .collect::<Result<Vec<_>, AssembleError>>()?;
    let kinds: Vec<OperandKind> = parsed.iter().map(|(op, _)| op.kind()).collect();

    let instr = Instruction::lookup(&mnemonic, &kinds).ok_or_else(|| {
        let forms = Instruction::forms(&mnemonic)
            .iter()
            .map(|f| describe_kinds(f))
            .collect::<Vec<_>>()
            .join(" | ");
        AssembleError::OperandMismatch {
            line,
            column: head.offset,
            mnemonic: format!("{mnemonic} {}", describe_kinds(&kinds)),
            forms: format!("expected {forms}"),
        }
    })?;

    Ok(Item::Instr {
        instr,
        operands: parsed,
    })
}

/// Returns the only operand of a directive.
fn single<'t, 'a>(
    operands: &'t [Token<'a>],
    head: &Token,
    line: usize,
    what: &str,
) -> Result<&'t Token<'a>, AssembleError> {
    match operands {
        [one] => Ok(one),
        _ => Err(syntax(head.at(line), format!("{} expects {what}", head.text))),
    }
}

/// Handles a directive, updating `section` on `.section`.
fn parse_directive(
    ctx: &mut AsmContext,
    section: &mut SectionId,
    head: &Token,
    operands: &[Token],
    line: usize,
) -> Result<(), AssembleError> {
    let at = head.at(line);
    let directive = head.text.to_ascii_lowercase();

    match directive.as_str() {
        ".section" => {
            let name = single(operands, head, line, "a section name")?;
            *section = SectionId::parse(name.text).ok_or_else(|| {
                syntax(
                    name.at(line),
                    format!("unknown section `{}` (expected .text or .data)", name.text),
                )
            })?;
        }
        ".text" | ".data" if operands.is_empty() => {
            *section = SectionId::parse(&directive).unwrap_or(SectionId::Text);
        }
        ".db" | ".byte" => {
            if operands.is_empty() {
                return Err(syntax(at, ".db expects at least one value"));
            }
            let mut bytes = Vec::with_capacity(operands.len());
            for tok in operands {
                let loc = tok.at(line);
                if tok.text.starts_with('"') {
                    bytes.extend(parse_string(tok, loc)?);
                    continue;
                }
                let text = tok.text.strip_prefix('#').unwrap_or(tok.text);
                let value = parse_value(text, loc)?;
                if !(-128..=255).contains(&value) {
                    return Err(syntax(loc, format!("value `{}` does not fit in a byte", tok.text)));
                }
                bytes.push(value as u8);
            }
            ctx.push(*section, Item::Bytes(bytes))?;
        }
        ".dw" | ".word" => {
            if operands.is_empty() {
                return Err(syntax(at, ".dw expects at least one value"));
            }
            let words = operands
                .iter()
                .map(|tok| {
                    let loc = tok.at(line);
                    match parse_operand(tok, line)? {
                        Operand::Imm(imm) => Ok((imm, loc)),
                        _ => Err(syntax(loc, ".dw expects integers or labels")),
                    }
                })
                .collect::<Result<Vec<_>, AssembleError>>()?;
            ctx.push(*section, Item::Words(words))?;
        }
        ".asciz" | ".string" => {
            let tok = single(operands, head, line, "one string literal")?;
            let mut bytes = parse_string(tok, tok.at(line))?;
            bytes.push(0);
            ctx.push(*section, Item::Bytes(bytes))?;
        }
        ".zero" | ".space" => {
            let tok = single(operands, head, line, "a byte count")?;
            let loc = tok.at(line);
            let count = parse_int(tok.text)
                .filter(|n| (0..=LOAD_WINDOW as i64).contains(n))
                .ok_or_else(|| syntax(loc, format!("invalid byte count `{}`", tok.text)))?;
            ctx.check_room(count as usize)?;
            ctx.push(*section, Item::Bytes(vec![0; count as usize]))?;
        }
        _ => {
            return Err(AssembleError::UnknownMnemonic {
                line,
                column: head.offset,
                mnemonic: head.text.to_string(),
            });
        }
    }
    Ok(())
}

/// Assembles a full source string into an object image.
///
/// Uses two-pass assembly:
/// 1. First pass: parse lines, select opcodes, size items, record label offsets
/// 2. Second pass: resolve labels and emit bytes
///
/// The first error stops assembly; no partial image is produced.
pub fn assemble(source: &str, options: &AsmOptions) -> Result<ProgramImage, AssembleError> {
    let mut ctx = AsmContext::default();
    let mut section = SectionId::Text;

    // First pass
    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = tokenize(line_no, raw)?;

        if let Some(label) = &line.label {
            ctx.define_label(label, line_no, section)?;
        }
        let Some(head) = line.head else {
            continue;
        };

        if head.text.starts_with('.') {
            parse_directive(&mut ctx, &mut section, &head, &line.operands, line_no)?;
        } else {
            let item = parse_instruction(&head, &line.operands, line_no)?;
            if section != SectionId::Text {
                return Err(syntax(
                    head.at(line_no),
                    format!("instruction `{}` outside .text", head.text),
                ));
            }
            ctx.push(section, item)?;
        }
    }

    if ctx.text_size == 0 {
        return Err(AssembleError::EmptyText);
    }

    // Fix section bases and make labels absolute.
    let text_base = TEXT_BASE;
    let data_base = TEXT_BASE + ctx.text_size as u32;
    let mut symbols = Vec::with_capacity(ctx.labels.len());
    for label in &ctx.labels {
        let base = match label.section {
            SectionId::Text => text_base,
            SectionId::Data => data_base,
        };
        let address = base + label.offset as u32;
        ctx.addresses.insert(label.name.clone(), address);
        symbols.push(Symbol {
            name: label.name.clone(),
            address,
        });
    }

    let entry = match ctx.index.get(ENTRY_LABEL).map(|i| &ctx.labels[*i]) {
        Some(def) if def.section != SectionId::Text || def.offset >= ctx.text_size => {
            return Err(syntax(def.at, format!("`{ENTRY_LABEL}` must label code in .text")));
        }
        Some(def) => text_base + def.offset as u32,
        None => text_base,
    };

    // Second pass
    let mut text = Vec::with_capacity(ctx.text_size);
    let mut data = Vec::with_capacity(ctx.data_size);
    for (section, item) in &ctx.items {
        let out = match section {
            SectionId::Text => &mut text,
            SectionId::Data => &mut data,
        };
        match item {
            Item::Instr { instr, operands } => {
                out.push(instr.opcode());
                for (operand, at) in operands {
                    match operand {
                        Operand::Reg(r) | Operand::Mem(r) => out.push(*r),
                        Operand::Imm(imm) => {
                            out.extend_from_slice(&ctx.resolve(imm, *at)?.to_le_bytes())
                        }
                    }
                }
            }
            Item::Bytes(bytes) => out.extend_from_slice(bytes),
            Item::Words(words) => {
                for (imm, at) in words {
                    out.extend_from_slice(&ctx.resolve(imm, *at)?.to_le_bytes());
                }
            }
        }
    }

    let mut sections = vec![Section {
        kind: SectionKind::Code,
        base: text_base,
        bytes: text,
    }];
    if !data.is_empty() {
        sections.push(Section {
            kind: SectionKind::Data,
            base: data_base,
            bytes: data,
        });
    }

    let symbols = if options.debug {
        Symbols::Debug(symbols)
    } else {
        Symbols::Release
    };
    Ok(ProgramImage::new(sections, entry, symbols))
}

/// Convenience: assemble directly from a file path.
pub fn assemble_file<P: AsRef<Path>>(
    path: P,
    options: &AsmOptions,
) -> Result<ProgramImage, AssembleError> {
    let path_ref = path.as_ref();
    let source = fs::read_to_string(path_ref).map_err(|e| AssembleError::Io {
        path: path_ref.display().to_string(),
        message: e.to_string(),
    })?;
    assemble(&source, options)
}
