//! Two-pass assembler for Tiny16 source. Pass 1 walks every line to size
//! instructions and record label addresses; pass 2 re-walks them emitting
//! little-endian words, leaving a fixup behind for every symbolic address.
//! Fixups are patched once pass 2 has finished.

use fxhash::FxHashMap;
use miette::Result;

use crate::error;
use crate::isa::{pack, pack_imm8, Opcode};
use crate::span::Span;

use self::scan::StrError;

pub mod scan;

/// A pending address patch: the image offset of a 16-bit slot and the label
/// whose address belongs there.
struct Fixup {
    offset: usize,
    name: String,
    span: Span,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Mnemonic {
    Nop,
    Halt,
    Ldi,
    Mov,
    Add,
    Sub,
    And,
    Or,
    Xor,
    Not,
    Shl,
    Shr,
    Addi,
    Cmpi,
    Cmp,
    Ld,
    St,
    Ldb,
    Stb,
    Jmp,
    Jz,
    Jnz,
    Jc,
    Jn,
    Call,
    Ret,
    In,
    Out,
}

impl Mnemonic {
    fn parse(lower: &str) -> Option<Self> {
        Some(match lower {
            "nop" => Self::Nop,
            "halt" => Self::Halt,
            "ldi" => Self::Ldi,
            "mov" => Self::Mov,
            "add" => Self::Add,
            "sub" => Self::Sub,
            "and" => Self::And,
            "or" => Self::Or,
            "xor" => Self::Xor,
            "not" => Self::Not,
            "shl" => Self::Shl,
            "shr" => Self::Shr,
            "addi" => Self::Addi,
            "cmpi" => Self::Cmpi,
            "cmp" => Self::Cmp,
            "ld" => Self::Ld,
            "st" => Self::St,
            "ldb" => Self::Ldb,
            "stb" => Self::Stb,
            "jmp" => Self::Jmp,
            "jz" => Self::Jz,
            "jnz" => Self::Jnz,
            "jc" => Self::Jc,
            "jn" => Self::Jn,
            "call" => Self::Call,
            "ret" => Self::Ret,
            "in" => Self::In,
            "out" => Self::Out,
            _ => return None,
        })
    }

    /// Wide mnemonics always take an operand word. LD and ST are sized per
    /// line instead, depending on the addressing form.
    fn wide(self) -> bool {
        matches!(
            self,
            Self::Ldi
                | Self::Ldb
                | Self::Stb
                | Self::Jmp
                | Self::Jz
                | Self::Jnz
                | Self::Jc
                | Self::Jn
                | Self::Call
                | Self::In
                | Self::Out
        )
    }
}

/// Owns the symbol table, fixup list and output image for one translation.
pub struct Assembler<'a> {
    src: &'a str,
    /// Comment-stripped, trimmed spans of the non-empty lines
    lines: Vec<Span>,
    symbols: FxHashMap<String, u16>,
    bytes: Vec<u8>,
    fixups: Vec<Fixup>,
    /// Location counter for pass 1
    org: u16,
}

impl<'a> Assembler<'a> {
    pub fn new(src: &'a str) -> Self {
        let mut lines = Vec::new();
        let mut offs = 0;
        for raw in src.split('\n') {
            let cut = scan::find_unquoted(raw, ';').unwrap_or(raw.len());
            let content = scan::trim_span(src, Span::new(offs, cut));
            if !content.is_empty() {
                lines.push(content);
            }
            offs += raw.len() + 1;
        }
        Assembler {
            src,
            lines,
            symbols: FxHashMap::default(),
            bytes: Vec::new(),
            fixups: Vec::new(),
            org: 0,
        }
    }

    /// Run both passes and resolve fixups, transferring the image out. Any
    /// failure aborts with a diagnostic annotated against the source text.
    pub fn assemble(mut self) -> Result<Vec<u8>> {
        match self.run_passes() {
            Ok(()) => Ok(self.bytes),
            Err(report) => Err(report.with_source_code(self.src.to_string())),
        }
    }

    fn run_passes(&mut self) -> Result<()> {
        self.pass1()?;
        self.pass2()?;
        self.patch()
    }

    fn text(&self, span: Span) -> &'a str {
        &self.src[span.as_range()]
    }

    /// Split a leading `label:` off a line. The prefix only counts as a
    /// label when it is a bare identifier, so char literals containing `:`
    /// pass through untouched.
    fn split_label(&self, line: Span) -> (Option<Span>, Option<Span>) {
        let text = self.text(line);
        if let Some(idx) = scan::find_unquoted(text, ':') {
            let label = scan::trim_span(self.src, line.slice(0..idx));
            if scan::is_ident(self.text(label)) {
                let rest = scan::trim_span(self.src, line.slice(idx + 1..text.len()));
                return (Some(label), (!rest.is_empty()).then_some(rest));
            }
        }
        (None, Some(line))
    }

    /// First whitespace-delimited word and the trimmed remainder.
    fn split_word(&self, stmt: Span) -> (Span, Option<Span>) {
        let text = self.text(stmt);
        match text.find(char::is_whitespace) {
            Some(idx) => {
                let rest = scan::trim_span(self.src, stmt.slice(idx..text.len()));
                (stmt.slice(0..idx), (!rest.is_empty()).then_some(rest))
            }
            None => (stmt, None),
        }
    }

    // ----------------- Pass 1: symbol table & sizing -----------------

    fn pass1(&mut self) -> Result<()> {
        self.org = 0;
        for i in 0..self.lines.len() {
            let (label, stmt) = self.split_label(self.lines[i]);
            if let Some(label) = label {
                let name = self.text(label).to_lowercase();
                if self.symbols.insert(name.clone(), self.org).is_some() {
                    return Err(error::duplicate_label(label, &name));
                }
            }
            if let Some(stmt) = stmt {
                self.size_stmt(stmt)?;
            }
        }
        Ok(())
    }

    fn size_stmt(&mut self, stmt: Span) -> Result<()> {
        if self.text(stmt).starts_with('.') {
            return self.size_directive(stmt);
        }
        let (mnem_span, rest) = self.split_word(stmt);
        let lower = self.text(mnem_span).to_lowercase();
        let Some(mnem) = Mnemonic::parse(&lower) else {
            return Err(error::unknown_mnemonic(mnem_span, &lower));
        };
        let size = match mnem {
            Mnemonic::Ld | Mnemonic::St => {
                if self.is_short_form(rest) {
                    2
                } else {
                    4
                }
            }
            m if m.wide() => 4,
            _ => 2,
        };
        self.org = self.org.wrapping_add(size);
        Ok(())
    }

    /// `LD`/`ST` take the single-word form when the address operand carries
    /// a `+` displacement.
    fn is_short_form(&self, rest: Option<Span>) -> bool {
        let Some(rest) = rest else { return false };
        let ops = scan::split_operands(self.src, rest);
        ops.len() == 2 && self.text(ops[1]).contains('+')
    }

    fn size_directive(&mut self, stmt: Span) -> Result<()> {
        let (dir_span, rest) = self.split_word(stmt);
        match self.text(dir_span).to_lowercase().as_str() {
            ".org" => {
                let target = self.org_target(stmt, rest)?;
                if target < self.org {
                    return Err(error::org_backwards(stmt, target, self.org as usize));
                }
                self.org = target;
            }
            ".word" => {
                let words = rest.map_or(0, |r| scan::split_operands(self.src, r).len());
                self.org = self.org.wrapping_add(2 * words as u16);
            }
            ".stringz" => {
                let body = self.stringz_body(stmt, rest)?;
                self.org = self.org.wrapping_add(body.len() as u16 + 1);
            }
            _ => return Err(error::unknown_directive(dir_span)),
        }
        Ok(())
    }

    fn org_target(&self, stmt: Span, rest: Option<Span>) -> Result<u16> {
        let Some(rest) = rest else {
            return Err(error::org_missing_value(stmt));
        };
        match scan::parse_int(self.text(rest)) {
            Some(val) => Ok(val as u16),
            None => Err(error::org_missing_value(rest)),
        }
    }

    fn stringz_body(&self, stmt: Span, rest: Option<Span>) -> Result<String> {
        let Some(rest) = rest else {
            return Err(error::expected_string(stmt));
        };
        scan::decode_string(self.text(rest)).map_err(|e| match e {
            StrError::NotAString => error::expected_string(rest),
            StrError::Unterminated => error::unterminated_string(rest),
        })
    }

    // ----------------- Pass 2: emission -----------------

    fn pass2(&mut self) -> Result<()> {
        self.bytes.clear();
        for i in 0..self.lines.len() {
            let (_, stmt) = self.split_label(self.lines[i]);
            let Some(stmt) = stmt else { continue };
            if self.text(stmt).starts_with('.') {
                self.emit_directive(stmt)?;
            } else {
                self.emit_instr(stmt)?;
            }
        }
        debug_assert_eq!(self.org, self.bytes.len() as u16);
        Ok(())
    }

    fn emit8(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    fn emit16(&mut self, word: u16) {
        self.emit8((word & 0xFF) as u8);
        self.emit8((word >> 8) as u8);
    }

    /// Emit a 16-bit slot holding either a literal value or a zero to be
    /// patched once the named label resolves.
    fn emit_value_or_fixup(&mut self, operand: Span) -> Result<()> {
        let text = self.text(operand);
        if let Some(val) = scan::parse_int(text) {
            self.emit16(val as u16);
        } else if scan::is_ident(text) {
            self.fixups.push(Fixup {
                offset: self.bytes.len(),
                name: text.to_lowercase(),
                span: operand,
            });
            self.emit16(0);
        } else {
            return Err(error::bad_literal(operand));
        }
        Ok(())
    }

    /// `[0x1234]` or `[label]`
    fn emit_addr_or_fixup(&mut self, operand: Span) -> Result<()> {
        let inner = self.bracket_inner(operand)?;
        self.emit_value_or_fixup(inner)
            .map_err(|_| error::bad_addr(operand))
    }

    fn bracket_inner(&self, operand: Span) -> Result<Span> {
        let text = self.text(operand);
        if text.len() < 3 || !text.starts_with('[') || !text.ends_with(']') {
            return Err(error::bad_addr(operand));
        }
        Ok(scan::trim_span(self.src, operand.slice(1..text.len() - 1)))
    }

    /// `[rb+imm5]`: returns the base register and masked displacement.
    fn short_mem_operand(&self, operand: Span) -> Result<(u16, u16)> {
        let inner = self.bracket_inner(operand)?;
        let text = self.text(inner);
        let Some(plus) = text.find('+') else {
            return Err(error::bad_addr(operand));
        };
        let base = scan::trim_span(self.src, inner.slice(0..plus));
        let disp = scan::trim_span(self.src, inner.slice(plus + 1..text.len()));
        let rb = self.reg(base)?;
        let Some(val) = scan::parse_int(self.text(disp)) else {
            return Err(error::bad_addr(operand));
        };
        Ok((rb, val as u16 & 0x1F))
    }

    fn reg(&self, operand: Span) -> Result<u16> {
        scan::parse_reg(self.text(operand)).ok_or_else(|| error::bad_register(operand))
    }

    fn int(&self, operand: Span) -> Result<i32> {
        scan::parse_int(self.text(operand)).ok_or_else(|| error::bad_literal(operand))
    }

    fn expect_ops(&self, stmt: Span, ops: &[Span], count: usize, usage: &str) -> Result<()> {
        if ops.len() != count {
            return Err(error::wrong_operands(stmt, usage));
        }
        Ok(())
    }

    fn emit_instr(&mut self, stmt: Span) -> Result<()> {
        let (mnem_span, rest) = self.split_word(stmt);
        let lower = self.text(mnem_span).to_lowercase();
        let Some(mnem) = Mnemonic::parse(&lower) else {
            return Err(error::unknown_mnemonic(mnem_span, &lower));
        };
        let ops = rest.map_or_else(Vec::new, |r| scan::split_operands(self.src, r));

        match mnem {
            Mnemonic::Nop => {
                self.expect_ops(stmt, &ops, 0, "NOP")?;
                self.emit16(pack(Opcode::Nop, 0, 0, 0));
            }
            Mnemonic::Halt => {
                self.expect_ops(stmt, &ops, 0, "HALT")?;
                self.emit16(pack(Opcode::Halt, 0, 0, 0));
            }
            Mnemonic::Ldi => {
                self.expect_ops(stmt, &ops, 2, "LDI rd, imm16")?;
                let rd = self.reg(ops[0])?;
                self.emit16(pack(Opcode::Ldi, rd, 0, 0));
                self.emit_value_or_fixup(ops[1])?;
            }
            Mnemonic::Mov => {
                self.expect_ops(stmt, &ops, 2, "MOV rd, rs")?;
                let (rd, rs) = (self.reg(ops[0])?, self.reg(ops[1])?);
                self.emit16(pack(Opcode::Mov, rd, rs, 0));
            }
            Mnemonic::Add | Mnemonic::Sub | Mnemonic::And | Mnemonic::Or | Mnemonic::Xor => {
                let op = match mnem {
                    Mnemonic::Add => Opcode::Add,
                    Mnemonic::Sub => Opcode::Sub,
                    Mnemonic::And => Opcode::And,
                    Mnemonic::Or => Opcode::Or,
                    _ => Opcode::Xor,
                };
                self.expect_ops(stmt, &ops, 2, "OP rd, rs")?;
                let (rd, rs) = (self.reg(ops[0])?, self.reg(ops[1])?);
                self.emit16(pack(op, rd, rs, 0));
            }
            Mnemonic::Not => {
                self.expect_ops(stmt, &ops, 1, "NOT rd")?;
                let rd = self.reg(ops[0])?;
                self.emit16(pack(Opcode::Not, rd, 0, 0));
            }
            Mnemonic::Shl | Mnemonic::Shr => {
                let op = if mnem == Mnemonic::Shl {
                    Opcode::Shl
                } else {
                    Opcode::Shr
                };
                self.expect_ops(stmt, &ops, 2, "SHL rd, 0..7")?;
                let rd = self.reg(ops[0])?;
                let count = self.int(ops[1])?;
                if !(0..=7).contains(&count) {
                    return Err(error::shift_range(ops[1]));
                }
                self.emit16(pack(op, rd, 0, count as u16));
            }
            Mnemonic::Addi | Mnemonic::Cmpi => {
                let op = if mnem == Mnemonic::Addi {
                    Opcode::Addi
                } else {
                    Opcode::Cmpi
                };
                self.expect_ops(stmt, &ops, 2, "OP rd, imm8")?;
                let rd = self.reg(ops[0])?;
                let val = self.int(ops[1])?;
                self.emit16(pack_imm8(op, rd, (val & 0xFF) as u8));
            }
            Mnemonic::Cmp => {
                self.expect_ops(stmt, &ops, 2, "CMP rd, rs")?;
                let (rd, rs) = (self.reg(ops[0])?, self.reg(ops[1])?);
                self.emit16(pack(Opcode::Cmp, rd, rs, 0));
            }
            Mnemonic::Ld => {
                self.expect_ops(stmt, &ops, 2, "LD rd, [addr16] | LD rd, [rb+imm5]")?;
                let rd = self.reg(ops[0])?;
                if self.text(ops[1]).contains('+') {
                    let (rb, imm5) = self.short_mem_operand(ops[1])?;
                    self.emit16(pack(Opcode::LdOffs, rd, rb, imm5));
                } else {
                    self.emit16(pack(Opcode::Ld, rd, 0, 0));
                    self.emit_addr_or_fixup(ops[1])?;
                }
            }
            Mnemonic::St => {
                self.expect_ops(stmt, &ops, 2, "ST rs, [addr16] | ST rs, [rb+imm5]")?;
                let rs = self.reg(ops[0])?;
                if self.text(ops[1]).contains('+') {
                    // base register travels in the rd field
                    let (rb, imm5) = self.short_mem_operand(ops[1])?;
                    self.emit16(pack(Opcode::StOffs, rb, rs, imm5));
                } else {
                    self.emit16(pack(Opcode::St, 0, rs, 0));
                    self.emit_addr_or_fixup(ops[1])?;
                }
            }
            Mnemonic::Ldb => {
                self.expect_ops(stmt, &ops, 2, "LDB rd, [addr16]")?;
                let rd = self.reg(ops[0])?;
                self.emit16(pack(Opcode::Ldb, rd, 0, 0));
                self.emit_addr_or_fixup(ops[1])?;
            }
            Mnemonic::Stb => {
                self.expect_ops(stmt, &ops, 2, "STB rs, [addr16]")?;
                let rs = self.reg(ops[0])?;
                self.emit16(pack(Opcode::Stb, 0, rs, 0));
                self.emit_addr_or_fixup(ops[1])?;
            }
            Mnemonic::Jmp | Mnemonic::Jz | Mnemonic::Jnz | Mnemonic::Jc | Mnemonic::Jn => {
                let op = match mnem {
                    Mnemonic::Jmp => Opcode::Jmp,
                    Mnemonic::Jz => Opcode::Jz,
                    Mnemonic::Jnz => Opcode::Jnz,
                    Mnemonic::Jc => Opcode::Jc,
                    _ => Opcode::Jn,
                };
                self.expect_ops(stmt, &ops, 1, "JMP addr16")?;
                self.emit16(pack(op, 0, 0, 0));
                self.emit_value_or_fixup(ops[0])?;
            }
            Mnemonic::Call => {
                self.expect_ops(stmt, &ops, 1, "CALL addr16")?;
                self.emit16(pack(Opcode::Call, 0, 0, 0));
                self.emit_value_or_fixup(ops[0])?;
            }
            Mnemonic::Ret => {
                self.expect_ops(stmt, &ops, 0, "RET")?;
                self.emit16(pack(Opcode::Ret, 0, 0, 0));
            }
            Mnemonic::In => {
                self.expect_ops(stmt, &ops, 2, "IN rd, [ioaddr16]")?;
                let rd = self.reg(ops[0])?;
                self.emit16(pack(Opcode::In, rd, 0, 0));
                self.emit_addr_or_fixup(ops[1])?;
            }
            Mnemonic::Out => {
                self.expect_ops(stmt, &ops, 2, "OUT rs, [ioaddr16]")?;
                let rs = self.reg(ops[0])?;
                self.emit16(pack(Opcode::Out, 0, rs, 0));
                self.emit_addr_or_fixup(ops[1])?;
            }
        }
        Ok(())
    }

    fn emit_directive(&mut self, stmt: Span) -> Result<()> {
        let (dir_span, rest) = self.split_word(stmt);
        match self.text(dir_span).to_lowercase().as_str() {
            ".org" => {
                let target = self.org_target(stmt, rest)? as usize;
                if target < self.bytes.len() {
                    return Err(error::org_backwards(stmt, target as u16, self.bytes.len()));
                }
                self.bytes.resize(target, 0);
            }
            ".word" => {
                if let Some(rest) = rest {
                    for op in scan::split_operands(self.src, rest) {
                        self.emit_value_or_fixup(op)?;
                    }
                }
            }
            ".stringz" => {
                let body = self.stringz_body(stmt, rest)?;
                for byte in body.into_bytes() {
                    self.emit8(byte);
                }
                self.emit8(0);
            }
            _ => return Err(error::unknown_directive(dir_span)),
        }
        Ok(())
    }

    // ----------------- Fixup resolution -----------------

    fn patch(&mut self) -> Result<()> {
        for fx in &self.fixups {
            let Some(&addr) = self.symbols.get(&fx.name) else {
                return Err(error::undefined_label(fx.span, &fx.name));
            };
            self.bytes[fx.offset] = (addr & 0xFF) as u8;
            self.bytes[fx.offset + 1] = (addr >> 8) as u8;
        }
        Ok(())
    }
}
