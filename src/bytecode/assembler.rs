//! Textual assembler producing a loadable [`Module`].
//!
//! Exists for tests and tooling; the VM itself only ever sees bytecode.
//!
//! # Syntax
//!
//! ```text
//! # comment
//! .entry main          # entry point (label or address), default 0
//! .rodata 1 2 3        # append bytes to the rodata segment
//! .data 0 0            # append bytes to the data segment
//! .bss 64              # grow the bss segment
//!
//! main:
//!     MOV_IMMEDIATE8 42, r0
//!     MOV r0, rv
//!     THREAD_FINISH
//! ```
//!
//! - Mnemonics are case-insensitive; commas between operands are optional
//! - Registers are `r0`..`r41` or the aliases `rv bp sp pc flags idtr`
//! - Immediates are decimal (possibly negative) or `0x` hex; 8-byte
//!   immediates also accept a label, which resolves to its absolute text
//!   address
//! - Type tags accept `byte short int long float double` or a number
//! - Thread-control commands accept `stop wait get_register set_register`
//!   or a number; GET/SET take two further register operands

use crate::bytecode::isa::{Opcode, Operand};
use crate::bytecode::{
    BP, FLAGS, IDTR, PC, REGISTER_COUNT, RV, SP, TAG_BYTE, TAG_DOUBLE, TAG_FLOAT, TAG_INT,
    TAG_LONG, TAG_SHORT, TC_GET_REGISTER, TC_SET_REGISTER, TC_STOP, TC_WAIT,
};
use crate::errors::VmError;
use crate::module::Module;
use std::collections::HashMap;

const COMMENT_CHAR: char = '#';
const LABEL_SUFFIX: char = ':';

/// Parses a register token like `r7` or an alias like `sp`.
fn parse_reg(line: usize, token: &str) -> Result<u8, VmError> {
    let alias = match token.to_ascii_lowercase().as_str() {
        "rv" => Some(RV),
        "bp" => Some(BP),
        "sp" => Some(SP),
        "pc" => Some(PC),
        "flags" => Some(FLAGS),
        "idtr" => Some(IDTR),
        _ => None,
    };
    if let Some(idx) = alias {
        return Ok(idx);
    }
    token
        .strip_prefix('r')
        .and_then(|digits| digits.parse::<u8>().ok())
        .filter(|&idx| idx < REGISTER_COUNT)
        .ok_or_else(|| VmError::SyntaxError {
            line,
            message: format!("expected register, got {token}"),
        })
}

/// Parses a decimal or `0x` integer; negatives encode two's complement.
fn parse_int(line: usize, token: &str) -> Result<u64, VmError> {
    let parsed = if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(body) = token.strip_prefix('-') {
        body.parse::<u64>().ok().map(|v| (v as i64).wrapping_neg() as u64)
    } else {
        token.parse::<u64>().ok()
    };
    parsed.ok_or_else(|| VmError::SyntaxError {
        line,
        message: format!("expected integer, got {token}"),
    })
}

fn parse_tag(line: usize, token: &str) -> Result<u8, VmError> {
    let named = match token.to_ascii_lowercase().as_str() {
        "byte" => Some(TAG_BYTE),
        "short" => Some(TAG_SHORT),
        "int" => Some(TAG_INT),
        "long" => Some(TAG_LONG),
        "float" => Some(TAG_FLOAT),
        "double" => Some(TAG_DOUBLE),
        _ => None,
    };
    match named {
        Some(tag) => Ok(tag),
        None => Ok(parse_int(line, token)? as u8),
    }
}

fn parse_cmd(line: usize, token: &str) -> Result<u8, VmError> {
    let named = match token.to_ascii_lowercase().as_str() {
        "stop" => Some(TC_STOP),
        "wait" => Some(TC_WAIT),
        "get_register" => Some(TC_GET_REGISTER),
        "set_register" => Some(TC_SET_REGISTER),
        _ => None,
    };
    match named {
        Some(cmd) => Ok(cmd),
        None => Ok(parse_int(line, token)? as u8),
    }
}

/// One significant line of source, split into tokens.
struct Line<'a> {
    number: usize,
    tokens: Vec<&'a str>,
}

/// Strips comments and splits on whitespace and commas.
fn tokenize(source: &str) -> Vec<Line<'_>> {
    source
        .lines()
        .enumerate()
        .filter_map(|(idx, raw)| {
            let body = match raw.find(COMMENT_CHAR) {
                Some(pos) => &raw[..pos],
                None => raw,
            };
            let tokens: Vec<&str> = body
                .split(|c: char| c.is_whitespace() || c == ',')
                .filter(|t| !t.is_empty())
                .collect();
            if tokens.is_empty() {
                None
            } else {
                Some(Line {
                    number: idx + 1,
                    tokens,
                })
            }
        })
        .collect()
}

/// Encoded size of one instruction line, counting THREAD_CONTROL's trailing
/// register operands.
fn instruction_size(op: Opcode, operand_tokens: usize) -> usize {
    let shape: usize = op.operands().iter().map(|o| o.width()).sum();
    let extras = operand_tokens.saturating_sub(op.operands().len());
    1 + shape + extras
}

enum Entry {
    Address(u64),
    Label(String),
}

/// Assembles source text into a module.
pub fn assemble_source(source: &str) -> Result<Module, VmError> {
    let lines = tokenize(source);

    // Pass 1: label addresses and segment contents.
    let mut labels: HashMap<String, u64> = HashMap::new();
    let mut text_cursor: u64 = 0;
    let mut rodata = Vec::new();
    let mut data = Vec::new();
    let mut bss_length: u64 = 0;
    let mut entry = Entry::Address(0);

    for line in &lines {
        let first = line.tokens[0];
        if let Some(name) = first.strip_suffix(LABEL_SUFFIX) {
            if labels.insert(name.to_string(), text_cursor).is_some() {
                return Err(VmError::DuplicateLabel {
                    line: line.number,
                    label: name.to_string(),
                });
            }
            if line.tokens.len() > 1 {
                return Err(VmError::SyntaxError {
                    line: line.number,
                    message: "label must stand alone on its line".to_string(),
                });
            }
            continue;
        }
        if let Some(directive) = first.strip_prefix('.') {
            match directive {
                "entry" => {
                    let token = one_operand(line)?;
                    entry = match parse_int(line.number, token) {
                        Ok(addr) => Entry::Address(addr),
                        Err(_) => Entry::Label(token.to_string()),
                    };
                }
                "rodata" => append_bytes(line, &mut rodata)?,
                "data" => append_bytes(line, &mut data)?,
                "bss" => bss_length += parse_int(line.number, one_operand(line)?)?,
                other => {
                    return Err(VmError::SyntaxError {
                        line: line.number,
                        message: format!("unknown directive .{other}"),
                    });
                }
            }
            continue;
        }

        let op = Opcode::from_mnemonic(first).ok_or_else(|| VmError::UnknownMnemonic {
            line: line.number,
            mnemonic: first.to_string(),
        })?;
        check_arity(line, op)?;
        text_cursor += instruction_size(op, line.tokens.len() - 1) as u64;
    }

    // Pass 2: encode.
    let mut text = Vec::with_capacity(text_cursor as usize);
    for line in &lines {
        let first = line.tokens[0];
        if first.ends_with(LABEL_SUFFIX) || first.starts_with('.') {
            continue;
        }
        let op = Opcode::from_mnemonic(first).expect("checked in pass 1");
        encode_instruction(line, op, &labels, &mut text)?;
    }

    let entry_point = match entry {
        Entry::Address(addr) => addr,
        Entry::Label(name) => *labels
            .get(&name)
            .ok_or(VmError::UnknownLabel { label: name })?,
    };

    Ok(Module {
        text,
        rodata,
        data,
        bss_length,
        entry_point,
    })
}

fn one_operand<'a>(line: &Line<'a>) -> Result<&'a str, VmError> {
    if line.tokens.len() != 2 {
        return Err(VmError::SyntaxError {
            line: line.number,
            message: format!("{} takes exactly one operand", line.tokens[0]),
        });
    }
    Ok(line.tokens[1])
}

fn append_bytes(line: &Line<'_>, out: &mut Vec<u8>) -> Result<(), VmError> {
    for token in &line.tokens[1..] {
        out.push(parse_int(line.number, token)? as u8);
    }
    Ok(())
}

fn check_arity(line: &Line<'_>, op: Opcode) -> Result<(), VmError> {
    let expected = op.operands().len();
    let got = line.tokens.len() - 1;
    let ok = if op == Opcode::ThreadControl {
        // STOP/WAIT take none beyond the shape, GET/SET take two registers.
        got == expected || got == expected + 2
    } else {
        got == expected
    };
    if !ok {
        return Err(VmError::SyntaxError {
            line: line.number,
            message: format!(
                "{} expects {expected} operand(s), got {got}",
                op.mnemonic()
            ),
        });
    }
    Ok(())
}

fn encode_instruction(
    line: &Line<'_>,
    op: Opcode,
    labels: &HashMap<String, u64>,
    out: &mut Vec<u8>,
) -> Result<(), VmError> {
    out.push(op as u8);
    for (kind, token) in op.operands().iter().zip(&line.tokens[1..]) {
        match kind {
            Operand::Reg => out.push(parse_reg(line.number, token)?),
            Operand::Tag => out.push(parse_tag(line.number, token)?),
            Operand::Cmd => out.push(parse_cmd(line.number, token)?),
            Operand::Imm1 => out.push(parse_int(line.number, token)? as u8),
            Operand::Imm2 => {
                out.extend_from_slice(&(parse_int(line.number, token)? as u16).to_le_bytes())
            }
            Operand::Imm4 => {
                out.extend_from_slice(&(parse_int(line.number, token)? as u32).to_le_bytes())
            }
            Operand::Imm8 => {
                let value = match labels.get(*token) {
                    Some(addr) => *addr,
                    None => parse_int(line.number, token)?,
                };
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
    }
    // THREAD_CONTROL GET/SET trail two register bytes.
    for token in &line.tokens[1 + op.operands().len()..] {
        out.push(parse_reg(line.number, token)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_immediates_little_endian() {
        let module = assemble_source("MOV_IMMEDIATE8 42, r0").unwrap();
        let mut expected = vec![Opcode::MovImmediate8 as u8];
        expected.extend_from_slice(&42u64.to_le_bytes());
        expected.push(0);
        assert_eq!(module.text, expected);
    }

    #[test]
    fn register_aliases_resolve_to_reserved_slots() {
        let module = assemble_source("MOV r3, rv").unwrap();
        assert_eq!(module.text, vec![Opcode::Mov as u8, 3, RV]);
        let module = assemble_source("MOV sp, bp").unwrap();
        assert_eq!(module.text, vec![Opcode::Mov as u8, SP, BP]);
    }

    #[test]
    fn comments_and_commas_are_ignored() {
        let module = assemble_source(
            "# leading comment\n\
             NOP # trailing\n\
             MOV r0 , r1\n",
        )
        .unwrap();
        assert_eq!(
            module.text,
            vec![Opcode::Nop as u8, Opcode::Mov as u8, 0, 1]
        );
    }

    #[test]
    fn labels_resolve_to_absolute_addresses() {
        let module = assemble_source(
            "start:\n\
             JUMP_IMMEDIATE end\n\
             end:\n\
             THREAD_FINISH\n",
        )
        .unwrap();
        let mut expected = vec![Opcode::JumpImmediate as u8];
        expected.extend_from_slice(&9u64.to_le_bytes());
        expected.push(Opcode::ThreadFinish as u8);
        assert_eq!(module.text, expected);
    }

    #[test]
    fn entry_accepts_label_or_address() {
        let module = assemble_source(
            ".entry main\n\
             NOP\n\
             main:\n\
             THREAD_FINISH\n",
        )
        .unwrap();
        assert_eq!(module.entry_point, 1);
        let module = assemble_source(".entry 7\nNOP").unwrap();
        assert_eq!(module.entry_point, 7);
    }

    #[test]
    fn segment_directives_populate_the_module() {
        let module = assemble_source(
            ".rodata 1 2 3\n\
             .data 0xFF 0\n\
             .bss 64\n\
             .bss 8\n\
             NOP\n",
        )
        .unwrap();
        assert_eq!(module.rodata, vec![1, 2, 3]);
        assert_eq!(module.data, vec![0xFF, 0]);
        assert_eq!(module.bss_length, 72);
    }

    #[test]
    fn thread_control_trailing_registers() {
        let module = assemble_source("THREAD_CONTROL r0, get_register, rv, r1").unwrap();
        assert_eq!(
            module.text,
            vec![Opcode::ThreadControl as u8, 0, TC_GET_REGISTER, RV, 1]
        );
        let module = assemble_source("THREAD_CONTROL r0, wait").unwrap();
        assert_eq!(module.text, vec![Opcode::ThreadControl as u8, 0, TC_WAIT]);
    }

    #[test]
    fn type_tags_by_name() {
        let module = assemble_source("CMP long, r0, r1").unwrap();
        assert_eq!(module.text, vec![Opcode::Cmp as u8, TAG_LONG, 0, 1]);
        let module = assemble_source("CMP double, r0, r1").unwrap();
        assert_eq!(module.text, vec![Opcode::Cmp as u8, TAG_DOUBLE, 0, 1]);
    }

    #[test]
    fn negative_immediates_encode_twos_complement() {
        let module = assemble_source("MOV_IMMEDIATE8 -1, r0").unwrap();
        assert_eq!(&module.text[1..9], &u64::MAX.to_le_bytes());
    }

    #[test]
    fn rejects_unknown_mnemonic() {
        assert!(matches!(
            assemble_source("FROBNICATE r0"),
            Err(VmError::UnknownMnemonic { line: 1, .. })
        ));
    }

    #[test]
    fn rejects_arity_mismatch() {
        assert!(matches!(
            assemble_source("MOV r0"),
            Err(VmError::SyntaxError { line: 1, .. })
        ));
    }

    #[test]
    fn rejects_duplicate_and_unknown_labels() {
        assert!(matches!(
            assemble_source("a:\na:\n"),
            Err(VmError::DuplicateLabel { .. })
        ));
        assert!(matches!(
            assemble_source(".entry nowhere\nNOP"),
            Err(VmError::UnknownLabel { .. })
        ));
    }

    #[test]
    fn rejects_bad_register() {
        assert!(matches!(
            assemble_source("MOV r42, r0"),
            Err(VmError::SyntaxError { .. })
        ));
    }
}
