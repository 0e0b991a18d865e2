//! Line-level scanning helpers for the assembler. These work on spans into
//! the original source so diagnostics can point at the offending token.

use lazy_static::lazy_static;
use regex::Regex;

use crate::span::Span;

lazy_static! {
    static ref IDENT: Regex = Regex::new(r"^[a-zA-Z_]\w*$").unwrap();
    static ref REGISTER: Regex = Regex::new(r"^[rR][0-7]$").unwrap();
}

/// Errors out of [`decode_string`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum StrError {
    NotAString,
    Unterminated,
}

pub fn is_ident(tok: &str) -> bool {
    IDENT.is_match(tok)
}

/// Register tokens are `r0` through `r7`, case-insensitive.
pub fn parse_reg(tok: &str) -> Option<u16> {
    if !REGISTER.is_match(tok) {
        return None;
    }
    tok[1..].parse().ok()
}

/// Integer literals: decimal, `0x` hex, an optional stripped `#` prefix, and
/// char literals with `\n`/`\t`/`\0`/`\<c>` escapes.
pub fn parse_int(tok: &str) -> Option<i32> {
    let t = tok.strip_prefix('#').unwrap_or(tok);
    if let Some(val) = parse_char(t) {
        return Some(val);
    }
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        return i64::from_str_radix(hex, 16).ok().map(|v| v as i32);
    }
    t.parse::<i64>().ok().map(|v| v as i32)
}

fn parse_char(t: &str) -> Option<i32> {
    let chars: Vec<char> = t.chars().collect();
    match chars.as_slice() {
        ['\'', c, '\''] => Some(*c as i32),
        ['\'', '\\', c, '\''] => {
            let c = match c {
                'n' => '\n',
                't' => '\t',
                '0' => '\0',
                c => *c,
            };
            Some(c as i32)
        }
        _ => None,
    }
}

/// Byte index of the first `needle` that sits outside single or double
/// quotes. Backslash escapes within quotes are skipped.
pub fn find_unquoted(text: &str, needle: char) -> Option<usize> {
    let mut in_str = false;
    let mut in_char = false;
    let mut escape = false;
    for (i, c) in text.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_str || in_char => escape = true,
            '"' if !in_char => in_str = !in_str,
            '\'' if !in_str => in_char = !in_char,
            c if c == needle && !in_str && !in_char => return Some(i),
            _ => (),
        }
    }
    None
}

/// Shrink a span to its non-whitespace content.
pub fn trim_span(src: &str, span: Span) -> Span {
    let text = &src[span.as_range()];
    let start = text.len() - text.trim_start().len();
    let trimmed = text.trim();
    span.slice(start..start + trimmed.len())
}

/// Split on commas that sit outside `[...]` brackets and quoted literals.
/// Pieces come back trimmed; a trailing empty piece is dropped.
pub fn split_operands(src: &str, span: Span) -> Vec<Span> {
    let text = &src[span.as_range()];
    let mut out = Vec::new();
    let mut start = 0;
    let mut depth = 0i32;
    let mut in_str = false;
    let mut in_char = false;
    let mut escape = false;
    for (i, c) in text.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match c {
            '\\' if in_str || in_char => escape = true,
            '"' if !in_char => in_str = !in_str,
            '\'' if !in_str => in_char = !in_char,
            '[' if !in_str && !in_char => depth += 1,
            ']' if !in_str && !in_char => depth -= 1,
            ',' if !in_str && !in_char && depth == 0 => {
                out.push(trim_span(src, span.slice(start..i)));
                start = i + 1;
            }
            _ => (),
        }
    }
    let last = trim_span(src, span.slice(start..text.len()));
    if !last.is_empty() {
        out.push(last);
    }
    out
}

/// Decode a quoted string literal at the start of `text`. Escapes follow the
/// char literal rules; anything after the closing quote is ignored.
pub fn decode_string(text: &str) -> Result<String, StrError> {
    let mut chars = text.chars();
    if chars.next() != Some('"') {
        return Err(StrError::NotAString);
    }
    let mut body = String::new();
    let mut escape = false;
    for c in chars {
        if escape {
            match c {
                'n' => body.push('\n'),
                't' => body.push('\t'),
                '0' => body.push('\0'),
                c => body.push(c),
            }
            escape = false;
        } else {
            match c {
                '\\' => escape = true,
                '"' => return Ok(body),
                c => body.push(c),
            }
        }
    }
    Err(StrError::Unterminated)
}
