//! Constructors for the toolchain's diagnostics. Assembler reports carry a
//! span into the source line; the source text itself is attached at the
//! `assemble()` boundary.

use miette::{miette, LabeledSpan, Report, Severity};

use crate::span::Span;

// Assembler errors

pub fn unknown_mnemonic(span: Span, name: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::mnemonic",
        help = "check the instruction listing for available mnemonics.",
        labels = vec![LabeledSpan::at(span, "unknown mnemonic")],
        "Unknown mnemonic `{name}`",
    )
}

pub fn unknown_directive(span: Span) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::directive",
        help = "available directives are .org, .word and .stringz.",
        labels = vec![LabeledSpan::at(span, "unknown directive")],
        "Unknown directive",
    )
}

pub fn bad_register(span: Span) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::register",
        help = "registers are named r0 through r7.",
        labels = vec![LabeledSpan::at(span, "not a register")],
        "Invalid register name",
    )
}

pub fn bad_literal(span: Span) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::literal",
        help = "decimal, 0x-prefixed hex, #-prefixed and char literals are accepted.",
        labels = vec![LabeledSpan::at(span, "not a value")],
        "Expected an integer literal or label",
    )
}

pub fn wrong_operands(span: Span, usage: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::operands",
        help = format!("expected form: {usage}"),
        labels = vec![LabeledSpan::at(span, "wrong operands")],
        "Wrong operands for instruction",
    )
}

pub fn shift_range(span: Span) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::shift",
        help = "shift counts are encoded in 3 bits.",
        labels = vec![LabeledSpan::at(span, "out-of-range count")],
        "Shift count must be between 0 and 7",
    )
}

pub fn bad_addr(span: Span) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::address",
        help = "address operands look like [0x1234], [label] or [rN+imm].",
        labels = vec![LabeledSpan::at(span, "malformed address")],
        "Malformed address operand",
    )
}

pub fn duplicate_label(span: Span, name: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::duplicate_label",
        help = "labels may only be defined once per file.",
        labels = vec![LabeledSpan::at(span, "redefinition")],
        "Duplicate label `{name}`",
    )
}

pub fn org_backwards(span: Span, target: u16, current: usize) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::org",
        help = ".org may only move the location counter forward.",
        labels = vec![LabeledSpan::at(span, "moves backward")],
        "Origin 0x{target:04X} is behind the current output size 0x{current:04X}",
    )
}

pub fn org_missing_value(span: Span) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::org",
        help = "write .org followed by an address, like `.org 0x0100`.",
        labels = vec![LabeledSpan::at(span, "expects a value")],
        "The .org directive expects an address",
    )
}

pub fn unterminated_string(span: Span) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::string",
        help = "close string literals with a \" character.",
        labels = vec![LabeledSpan::at(span, "unterminated literal")],
        "Unterminated string literal",
    )
}

pub fn expected_string(span: Span) -> Report {
    miette!(
        severity = Severity::Error,
        code = "asm::string",
        help = ".stringz expects a quoted literal like \"hello\\n\".",
        labels = vec![LabeledSpan::at(span, "not a string literal")],
        "Expected a string literal",
    )
}

// Link errors

pub fn undefined_label(span: Span, name: &str) -> Report {
    miette!(
        severity = Severity::Error,
        code = "link::undefined",
        help = "every referenced label must be defined somewhere in the file.",
        labels = vec![LabeledSpan::at(span, "unresolved reference")],
        "Undefined label `{name}`",
    )
}

// Runtime errors

pub fn unknown_opcode(pc: u16, opcode: u8) -> Report {
    miette!(
        severity = Severity::Error,
        code = "run::opcode",
        help = "the image is corrupt or execution ran into data.",
        "Unknown opcode 0x{opcode:02X} at PC=0x{pc:04X}",
    )
}
