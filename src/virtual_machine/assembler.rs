//! Assembly language parser and bytecode compiler.
//!
//! Converts assembly source into a [`Script`]. The front-end turns each line
//! into [`AsmEntry`] items (labels and instructions with raw operand tokens);
//! the back-end checks operands against the opcode table and feeds them to a
//! [`ScriptBuilder`], which patches label references.
//!
//! # Syntax
//!
//! ```text
//! @loop:  add r1, r2, r3   // line comment
//!         load r4, \"text, with \\ escapes\"   /* block
//!         comment */ jmpif r5 @loop
//! ```
//!
//! - Opcodes are matched case-insensitively
//! - Registers use the `r` prefix (e.g. `r0`, `r31`)
//! - Operands are separated by commas and/or whitespace
//! - A leading `name:` defines a label; `name` and `@name` are the same label
//! - String literals are delimited by `\"`; inside them `\\`, `\n` and `\t`
//!   are escapes and a bare `"` is an ordinary character
//! - Literals for `load`: `true`, `false`, decimal integers of any size,
//!   `0x`-prefixed bytes, strings and `enum(N)` enum values
//! - Jump targets are labels or absolute byte offsets

use crate::error;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::Opcode;
use crate::virtual_machine::operand::{Literal, NameOperand, Operand, OperandKind};
use crate::virtual_machine::script::{Script, ScriptBuilder, normalize_label};
use num_bigint::BigInt;
use std::fmt::Write;
use std::fs;
use std::path::Path;

const LABEL_SUFFIX: char = ':';

/// Formats a compiler-style diagnostic for assembly failures.
fn render_assembly_diagnostic(
    file: &str,
    source: &str,
    line: usize,
    message: &str,
) -> String {
    let mut diag = String::new();
    let _ = writeln!(diag, "error: {message}");

    match source.lines().nth(line.saturating_sub(1)) {
        Some(raw_line) => {
            let line_text = raw_line.trim_end_matches('\r');
            let column = line_text.len() - line_text.trim_start().len() + 1;
            let _ = writeln!(diag, " --> {file}:{line}:{column}");
            let _ = writeln!(diag, "  |");
            let _ = writeln!(diag, "{:>4} | {}", line, line_text);
            let _ = writeln!(diag, "  | {}^", " ".repeat(column - 1));
        }
        None => {
            let _ = writeln!(diag, " --> {file}:{line}");
        }
    }
    diag
}

/// Logs a diagnostic for assembly errors.
fn log_assembly_error(file: &str, source: &str, err: &VMError) {
    match err.line() {
        Some(line) => error!(
            "{}",
            render_assembly_diagnostic(file, source, line, &err.to_string())
        ),
        None => error!("{file}: {err}"),
    }
}

/// Operand token with its 1-based column in the source line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    /// Token text; string literals are unescaped and without delimiters.
    pub text: String,
    /// True for string literals.
    pub quoted: bool,
    pub column: usize,
}

/// One parsed source item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsmEntry {
    Label {
        line: usize,
        name: String,
    },
    Instruction {
        line: usize,
        opcode: Opcode,
        args: Vec<Token>,
    },
}

/// Blanks out comments so columns are preserved.
///
/// `in_block` carries an unterminated `/* ... */` into the next line. Comment
/// markers inside string literals are left alone.
fn strip_comments(line: &str, in_block: &mut bool) -> String {
    let chars: Vec<char> = line.chars().collect();
    let mut out = String::with_capacity(line.len());
    let mut in_str = false;
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if *in_block {
            if c == '*' && next == Some('/') {
                *in_block = false;
                out.push_str("  ");
                i += 2;
            } else {
                out.push(' ');
                i += 1;
            }
            continue;
        }

        if in_str {
            if c == '\\' {
                if let Some(escaped) = next {
                    out.push(c);
                    out.push(escaped);
                    in_str = escaped != '"';
                    i += 2;
                    continue;
                }
            }
            out.push(c);
            i += 1;
            continue;
        }

        match (c, next) {
            ('/', Some('/')) => break,
            ('/', Some('*')) => {
                *in_block = true;
                out.push_str("  ");
                i += 2;
            }
            ('\\', Some('"')) => {
                in_str = true;
                out.push_str("\\\"");
                i += 2;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn is_label_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@')
}

/// Splits a leading `name:` label off the line.
///
/// Returns the label (if any) and the char column where the rest begins.
fn split_label(line_no: usize, text: &str) -> Result<(Option<String>, usize), VMError> {
    let indent = text.chars().take_while(|c| c.is_whitespace()).count();
    let name: String = text
        .chars()
        .skip(indent)
        .take_while(|c| is_label_char(*c))
        .collect();
    let after = text.chars().nth(indent + name.chars().count());

    match (name.is_empty(), after) {
        (false, Some(LABEL_SUFFIX)) => {
            if name == "@" {
                return Err(VMError::SyntaxError {
                    line: line_no,
                    message: "empty label name".to_string(),
                });
            }
            Ok((Some(normalize_label(&name)), indent + name.chars().count() + 1))
        }
        (true, Some(LABEL_SUFFIX)) => Err(VMError::SyntaxError {
            line: line_no,
            message: "empty label name".to_string(),
        }),
        _ => Ok((None, indent)),
    }
}

/// Splits the instruction part of a line into tokens.
///
/// Commas and whitespace separate tokens outside string literals.
fn tokenize(line_no: usize, chars: &[char], start: usize) -> Result<Vec<Token>, VMError> {
    let syntax = |message: String| VMError::SyntaxError {
        line: line_no,
        message,
    };

    let mut out = Vec::with_capacity(4);
    let mut current = String::new();
    let mut column = 0;
    let mut in_str = false;
    let mut i = start;

    fn flush(out: &mut Vec<Token>, current: &mut String, column: usize) {
        if !current.is_empty() {
            out.push(Token {
                text: std::mem::take(current),
                quoted: false,
                column,
            });
        }
    }

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if in_str {
            if c == '\\' {
                match next {
                    Some('"') => {
                        out.push(Token {
                            text: std::mem::take(&mut current),
                            quoted: true,
                            column,
                        });
                        in_str = false;
                    }
                    Some('\\') => current.push('\\'),
                    Some('n') => current.push('\n'),
                    Some('t') => current.push('\t'),
                    Some(other) => return Err(syntax(format!("invalid escape sequence \\{other}"))),
                    None => return Err(syntax("trailing backslash in string literal".to_string())),
                }
                i += 2;
            } else {
                current.push(c);
                i += 1;
            }
            continue;
        }

        match c {
            ',' | ' ' | '\t' | '\r' => flush(&mut out, &mut current, column),
            '\\' if next == Some('"') => {
                flush(&mut out, &mut current, column);
                in_str = true;
                column = i + 1;
                i += 1;
            }
            '\\' => return Err(syntax("unexpected backslash outside string literal".to_string())),
            '"' => return Err(syntax("unexpected quote outside string literal".to_string())),
            _ => {
                if current.is_empty() {
                    column = i + 1;
                }
                current.push(c);
            }
        }
        i += 1;
    }

    if in_str {
        return Err(syntax("unterminated string literal".to_string()));
    }
    flush(&mut out, &mut current, column);
    Ok(out)
}

/// Parses source lines into labels and instructions.
///
/// Line numbers in entries and errors are 1-based.
pub fn parse_lines<I, S>(lines: I) -> Result<Vec<AsmEntry>, VMError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut entries = Vec::new();
    let mut in_block = false;

    for (idx, raw) in lines.into_iter().enumerate() {
        let line = idx + 1;
        let text = strip_comments(raw.as_ref(), &mut in_block);
        let (label, rest) = split_label(line, &text)?;
        if let Some(name) = label {
            entries.push(AsmEntry::Label { line, name });
        }

        let chars: Vec<char> = text.chars().collect();
        let mut tokens = tokenize(line, &chars, rest)?.into_iter();
        let Some(head) = tokens.next() else {
            continue;
        };
        if head.quoted {
            return Err(VMError::SyntaxError {
                line,
                message: "expected opcode, found string literal".to_string(),
            });
        }
        let opcode = Opcode::from_mnemonic(&head.text).ok_or(VMError::UnknownOpcode {
            line,
            name: head.text.clone(),
        })?;
        entries.push(AsmEntry::Instruction {
            line,
            opcode,
            args: tokens.collect(),
        });
    }
    Ok(entries)
}

/// Parse a register token like `r0`, `r15`.
pub(crate) fn parse_reg(tok: &str) -> Option<u8> {
    let digits = tok.strip_prefix('r').or_else(|| tok.strip_prefix('R'))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Parse a `load` literal.
pub(crate) fn parse_literal(tok: &Token) -> Option<Literal> {
    if tok.quoted {
        return Some(Literal::String(tok.text.clone()));
    }
    let text = tok.text.as_str();
    if text.eq_ignore_ascii_case("true") {
        return Some(Literal::Bool(true));
    }
    if text.eq_ignore_ascii_case("false") {
        return Some(Literal::Bool(false));
    }
    if let Some(hex_digits) = text.strip_prefix("0x") {
        return hex::decode(hex_digits).ok().map(Literal::Bytes);
    }
    if let Some(inner) = strip_enum(text) {
        if inner.is_empty() || !inner.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        return inner.parse::<u32>().ok().map(Literal::Enum);
    }
    let digits = text.strip_prefix('-').unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<BigInt>().ok().map(Literal::Integer)
}

fn strip_enum(text: &str) -> Option<&str> {
    let head = text.get(..5)?;
    if !head.eq_ignore_ascii_case("enum(") {
        return None;
    }
    text[5..].strip_suffix(')')
}

fn parse_target(tok: &str) -> Option<Operand> {
    if let Ok(offset) = tok.parse::<u32>() {
        return Some(Operand::Target(offset));
    }
    let name = tok.strip_prefix('@').unwrap_or(tok);
    if name.is_empty() || !tok.chars().all(is_label_char) {
        return None;
    }
    Some(Operand::Label(normalize_label(tok)))
}

fn parse_operand(kind: OperandKind, tok: &Token, line: usize) -> Result<Operand, VMError> {
    let parsed = match kind {
        OperandKind::Reg if !tok.quoted => parse_reg(&tok.text).map(Operand::Reg),
        OperandKind::Literal => parse_literal(tok).map(Operand::Literal),
        OperandKind::Target if !tok.quoted => parse_target(&tok.text),
        OperandKind::ImmU32 if !tok.quoted => tok.text.parse().ok().map(Operand::Imm),
        OperandKind::Name if tok.quoted => {
            Some(Operand::Name(NameOperand::Inline(tok.text.clone())))
        }
        OperandKind::Name => parse_reg(&tok.text).map(|r| Operand::Name(NameOperand::Reg(r))),
        _ => None,
    };
    parsed.ok_or_else(|| VMError::InvalidOperand {
        line,
        token: tok.text.clone(),
        expected: kind.as_str(),
    })
}

/// Emits parsed entries. Fails with the first error; no script is produced then.
pub fn assemble_entries(entries: &[AsmEntry]) -> Result<Script, VMError> {
    let mut builder = ScriptBuilder::new();
    for entry in entries {
        match entry {
            AsmEntry::Label { line, name } => {
                builder.set_line(*line).label(name)?;
            }
            AsmEntry::Instruction { line, opcode, args } => {
                let layout = opcode.operands();
                if layout.len() != args.len() {
                    return Err(VMError::ArityMismatch {
                        line: *line,
                        opcode: opcode.mnemonic(),
                        expected: layout.len(),
                        actual: args.len(),
                    });
                }
                let operands = layout
                    .iter()
                    .zip(args)
                    .map(|(kind, tok)| parse_operand(*kind, tok, *line))
                    .collect::<Result<Vec<_>, _>>()?;
                builder.set_line(*line).emit(*opcode, &operands)?;
            }
        }
    }
    builder.finish()
}

/// Assembles a sequence of source lines.
pub fn assemble_lines<I, S>(lines: I) -> Result<Script, VMError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    assemble_entries(&parse_lines(lines)?)
}

/// Assembles source text, logging a diagnostic on failure.
pub fn assemble_source(source: &str) -> Result<Script, VMError> {
    assemble_source_with_name(source, "<source>")
}

fn assemble_source_with_name(source: &str, source_name: &str) -> Result<Script, VMError> {
    let result = assemble_lines(source.lines());
    if let Err(err) = &result {
        log_assembly_error(source_name, source, err);
    }
    result
}

/// Convenience: assemble directly from file path
pub fn assemble_file<P: AsRef<Path>>(path: P) -> Result<Script, VMError> {
    let path_ref = path.as_ref();
    let source = fs::read_to_string(path_ref)
        .map_err(|e| VMError::IoError(format!("{}: {e}", path_ref.display())))?;
    assemble_source_with_name(&source, &path_ref.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::errors::FaultKind;

    fn instructions(source: &str) -> Vec<(Opcode, Vec<Token>)> {
        parse_lines(source.lines())
            .unwrap()
            .into_iter()
            .filter_map(|entry| match entry {
                AsmEntry::Instruction { opcode, args, .. } => Some((opcode, args)),
                AsmEntry::Label { .. } => None,
            })
            .collect()
    }

    fn texts(tokens: &[Token]) -> Vec<&str> {
        tokens.iter().map(|t| t.text.as_str()).collect()
    }

    fn syntax_error(source: &str) -> (usize, String) {
        match parse_lines(source.lines()) {
            Err(VMError::SyntaxError { line, message }) => (line, message),
            other => panic!("expected syntax error, got {other:?}"),
        }
    }

    #[test]
    fn parse_reg_valid() {
        assert_eq!(parse_reg("r0"), Some(0));
        assert_eq!(parse_reg("R31"), Some(31));
        assert_eq!(parse_reg("r255"), Some(255));
    }

    #[test]
    fn parse_reg_invalid() {
        assert_eq!(parse_reg("5"), None);
        assert_eq!(parse_reg("r"), None);
        assert_eq!(parse_reg("r256"), None);
        assert_eq!(parse_reg("r+1"), None);
    }

    #[test]
    fn assemble_empty_source() {
        let script = assemble_source("").unwrap();
        assert!(script.is_empty());
        let script = assemble_source("// nothing\n/* here */\n\n").unwrap();
        assert!(script.is_empty());
    }

    #[test]
    fn commas_and_spaces_both_separate_operands() {
        let parsed = instructions("put r1 r3 r2\nadd r1,r2 , r3");
        assert_eq!(parsed[0].0, Opcode::Put);
        assert_eq!(texts(&parsed[0].1), ["r1", "r3", "r2"]);
        assert_eq!(texts(&parsed[1].1), ["r1", "r2", "r3"]);
    }

    #[test]
    fn opcodes_are_case_insensitive() {
        let parsed = instructions("LOAD r1, 5\nJmpIf r1, @x\n@x: Ret");
        assert_eq!(parsed[0].0, Opcode::Load);
        assert_eq!(parsed[1].0, Opcode::JmpIf);
        assert_eq!(parsed[2].0, Opcode::Ret);
    }

    #[test]
    fn comments_are_removed() {
        let parsed = instructions(
            "push r1 // trailing\n\
             /* start\n\
             still comment */ pop r2\n\
             load r3, /* inline */ 7",
        );
        assert_eq!(parsed.len(), 3);
        assert_eq!(texts(&parsed[0].1), ["r1"]);
        assert_eq!(parsed[1].0, Opcode::Pop);
        assert_eq!(texts(&parsed[2].1), ["r3", "7"]);
    }

    #[test]
    fn comment_markers_inside_strings_are_kept() {
        let parsed = instructions(r#"load r1, \"http://x /* y */\" // real comment"#);
        assert_eq!(parsed[0].1[1].text, "http://x /* y */");
        assert!(parsed[0].1[1].quoted);
    }

    #[test]
    fn string_literals_keep_delimiters_and_escapes() {
        let parsed = instructions(r#"load r1, \"a, b "q" \\ \n\t\""#);
        let tok = &parsed[0].1[1];
        assert_eq!(tok.text, "a, b \"q\" \\ \n\t");
        assert!(tok.quoted);
        assert_eq!(tok.column, 10);

        let empty = instructions(r#"load r1, \"\""#);
        assert_eq!(empty[0].1[1].text, "");
        assert!(empty[0].1[1].quoted);
    }

    #[test]
    fn malformed_strings_are_syntax_errors() {
        let (line, message) = syntax_error("nop\nload r1, \\\"open");
        assert_eq!(line, 2);
        assert_eq!(message, "unterminated string literal");

        let (_, message) = syntax_error(r#"load r1, "bare""#);
        assert_eq!(message, "unexpected quote outside string literal");

        let (_, message) = syntax_error(r#"load r1, \"bad \q\""#);
        assert_eq!(message, "invalid escape sequence \\q");

        let (_, message) = syntax_error("load r1, \\\"ends\\");
        assert_eq!(message, "trailing backslash in string literal");
    }

    #[test]
    fn labels_are_normalized_and_may_share_a_line() {
        let entries = parse_lines(["loop: inc r1", "@end:", "  ret"]).unwrap();
        assert_eq!(
            entries[0],
            AsmEntry::Label {
                line: 1,
                name: "@loop".into()
            }
        );
        assert!(matches!(
            entries[1],
            AsmEntry::Instruction {
                line: 1,
                opcode: Opcode::Inc,
                ..
            }
        ));
        assert_eq!(
            entries[2],
            AsmEntry::Label {
                line: 2,
                name: "@end".into()
            }
        );
        assert!(matches!(
            entries[3],
            AsmEntry::Instruction {
                line: 3,
                opcode: Opcode::Ret,
                ..
            }
        ));
    }

    #[test]
    fn empty_label_is_rejected() {
        let (line, message) = syntax_error("nop\n: ret");
        assert_eq!(line, 2);
        assert_eq!(message, "empty label name");
    }

    #[test]
    fn unknown_opcode_reports_line() {
        let err = assemble_source("nop\nnop\nfrobnicate r1").unwrap_err();
        assert_eq!(err.kind(), FaultKind::Compile);
        assert!(matches!(
            err,
            VMError::UnknownOpcode { line: 3, ref name } if name == "frobnicate"
        ));
    }

    #[test]
    fn wrong_arity_reports_line() {
        let err = assemble_source("add r1, r2").unwrap_err();
        assert!(matches!(
            err,
            VMError::ArityMismatch {
                line: 1,
                opcode: "add",
                expected: 3,
                actual: 2
            }
        ));
    }

    #[test]
    fn operands_are_checked_by_kind() {
        assert!(matches!(
            assemble_source("push 5").unwrap_err(),
            VMError::InvalidOperand {
                expected: "register",
                ..
            }
        ));
        assert!(matches!(
            assemble_source("load r1, maybe").unwrap_err(),
            VMError::InvalidOperand {
                expected: "literal",
                ..
            }
        ));
        assert!(matches!(
            assemble_source("left r1, r2, -1").unwrap_err(),
            VMError::InvalidOperand { .. }
        ));
        assert!(matches!(
            assemble_source("jmp \\\"label\\\"").unwrap_err(),
            VMError::InvalidOperand { .. }
        ));
    }

    #[test]
    fn literal_forms() {
        let tok = |text: &str| Token {
            text: text.to_string(),
            quoted: false,
            column: 1,
        };
        assert_eq!(parse_literal(&tok("TRUE")), Some(Literal::Bool(true)));
        assert_eq!(parse_literal(&tok("0x00ff")), Some(Literal::Bytes(vec![0, 255])));
        assert_eq!(parse_literal(&tok("0xf")), None);
        assert_eq!(
            parse_literal(&tok("-12")),
            Some(Literal::Integer(BigInt::from(-12)))
        );
        assert_eq!(parse_literal(&tok("enum(3)")), Some(Literal::Enum(3)));
        assert_eq!(parse_literal(&tok("ENUM(0)")), Some(Literal::Enum(0)));
        assert_eq!(parse_literal(&tok("enum()")), None);
        assert_eq!(parse_literal(&tok("enum(-1)")), None);
        assert_eq!(parse_literal(&tok("enum(4294967296)")), None);
        assert_eq!(parse_literal(&tok("1.5")), None);
        assert_eq!(parse_literal(&tok("+3")), None);
        let big = "123098123049830982903580234959875213840923849203758942357834091";
        assert_eq!(
            parse_literal(&tok(big)),
            Some(Literal::Integer(big.parse().unwrap()))
        );
    }

    #[test]
    fn forward_and_backward_labels_resolve_to_same_offsets() {
        let forward = assemble_source("jmp @end\nnop\n@end: ret").unwrap();
        let numeric = assemble_source("jmp 6\nnop\nret").unwrap();
        assert_eq!(forward.code(), numeric.code());
        assert_eq!(forward.labels().get("@end"), Some(&6));
    }

    #[test]
    fn label_errors() {
        assert!(matches!(
            assemble_source("a: nop\n@a: nop").unwrap_err(),
            VMError::DuplicateLabel { line: 2, ref label } if label == "@a"
        ));
        assert!(matches!(
            assemble_source("nop\njmpnot r1, @nowhere").unwrap_err(),
            VMError::UndefinedLabel { line: 2, ref label } if label == "@nowhere"
        ));
    }

    #[test]
    fn extcall_accepts_string_or_register() {
        let inline = assemble_source("extcall \\\"String.Upper\\\"").unwrap();
        assert_eq!(inline.code()[0], Opcode::ExtCall as u8);
        assert_eq!(inline.code()[1], 1);
        let by_reg = assemble_source("extcall r4").unwrap();
        assert_eq!(by_reg.code(), &[Opcode::ExtCall as u8, 0, 4]);
    }

    #[test]
    fn diagnostic_points_at_line() {
        let diag = render_assembly_diagnostic("prog.asm", "nop\n  bogus r1", 2, "unknown opcode");
        assert!(diag.starts_with("error: unknown opcode\n"));
        assert!(diag.contains(" --> prog.asm:2:3"));
        assert!(diag.contains("   2 |   bogus r1"));
        assert!(diag.contains("  |   ^"));
    }

    #[test]
    fn assemble_file_reports_missing_file() {
        let err = assemble_file("/definitely/not/here.asm").unwrap_err();
        assert!(matches!(err, VMError::IoError(_)));
        assert_eq!(err.kind(), FaultKind::Compile);
    }
}
