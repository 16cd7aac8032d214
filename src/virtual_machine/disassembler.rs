//! Bytecode decoding for listings and jump-target validation.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::Opcode;
use crate::virtual_machine::operand::{Cursor, Operand};
use std::fmt;

/// One decoded instruction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub offset: usize,
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
}

/// Assembly text for the instruction; jump targets print as byte offsets.
impl fmt::Display for DecodedInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.opcode.mnemonic())?;
        for (i, operand) in self.operands.iter().enumerate() {
            let sep = if i == 0 { " " } else { ", " };
            write!(f, "{sep}{operand}")?;
        }
        Ok(())
    }
}

fn decode_at(code: &[u8], offset: usize) -> Result<(DecodedInstruction, usize), VMError> {
    let byte = code[offset];
    let opcode = Opcode::try_from(byte).map_err(|_| VMError::InvalidInstruction {
        opcode: byte,
        offset,
    })?;
    let mut cursor = Cursor::new(code, offset + 1);
    let operands = opcode
        .operands()
        .iter()
        .map(|kind| cursor.read_operand(*kind))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((
        DecodedInstruction {
            offset,
            opcode,
            operands,
        },
        cursor.position(),
    ))
}

/// Decodes every instruction in `code`.
pub fn disassemble(code: &[u8]) -> Result<Vec<DecodedInstruction>, VMError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let (instr, next) = decode_at(code, offset)?;
        out.push(instr);
        offset = next;
    }
    Ok(out)
}

/// Marks the offsets at which an instruction begins.
pub(crate) fn instruction_starts(code: &[u8]) -> Result<Vec<bool>, VMError> {
    let mut starts = vec![false; code.len()];
    let mut offset = 0;
    while offset < code.len() {
        starts[offset] = true;
        offset = decode_at(code, offset)?.1;
    }
    Ok(starts)
}

/// Renders a listing with offsets, one instruction per line.
pub fn listing(code: &[u8]) -> Result<String, VMError> {
    let mut text = String::new();
    for instr in disassemble(code)? {
        text.push_str(&format!("{:04}: {}\n", instr.offset, instr));
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::assembler::assemble_source;
    use crate::virtual_machine::operand::Literal;
    use crate::virtual_machine::script::ScriptBuilder;

    const SOURCE: &str = r#"
        load r1, \"a b\"
        load r2, -42
        load r3, 0xdead
    @loop:
        jmpnot r4, @done
        left r1, r5, 1
        extcall \"String.Upper\"
        jmp @loop
    @done:
        ret
    "#;

    #[test]
    fn listing_reassembles_to_identical_bytecode() {
        let script = assemble_source(SOURCE).unwrap();
        let text: String = disassemble(script.code())
            .unwrap()
            .iter()
            .map(|i| format!("{i}\n"))
            .collect();
        let again = assemble_source(&text).unwrap();
        assert_eq!(again.code(), script.code());
    }

    #[test]
    fn every_literal_form_survives_reassembly() {
        let big: num_bigint::BigInt = "-340282366920938463463374607431768211457".parse().unwrap();
        let literals = [
            Literal::Bool(true),
            Literal::Bool(false),
            Literal::Integer(big),
            Literal::Integer(0.into()),
            Literal::String("tab\there, \"q\" \\ // not /* a comment\n".to_string()),
            Literal::String(String::new()),
            Literal::Bytes(vec![0xde, 0xad, 0x00]),
            Literal::Bytes(Vec::new()),
            Literal::Enum(3),
            Literal::Enum(u32::MAX),
        ];
        let mut builder = ScriptBuilder::new();
        for (i, literal) in literals.iter().enumerate() {
            builder.emit_load(i as u8, literal.clone()).unwrap();
        }
        builder.emit_ret().unwrap();
        let script = builder.finish().unwrap();

        let decoded = disassemble(script.code()).unwrap();
        for (instr, literal) in decoded.iter().zip(&literals) {
            assert_eq!(instr.operands[1], Operand::Literal(literal.clone()));
        }
        let text: String = decoded.iter().map(|i| format!("{i}\n")).collect();
        let again = assemble_source(&text).unwrap();
        assert_eq!(again.code(), script.code());
    }

    #[test]
    fn instructions_render_as_assembly() {
        let script = assemble_source("load r1, true\nadd r1, r2, r3\nret").unwrap();
        let decoded = disassemble(script.code()).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].to_string(), "load r1, true");
        assert_eq!(decoded[1].to_string(), "add r1, r2, r3");
        assert_eq!(decoded[1].offset, 4);
        assert_eq!(decoded[2].to_string(), "ret");
        assert!(listing(script.code()).unwrap().starts_with("0000: load r1, true\n"));
    }

    #[test]
    fn boundaries_skip_operand_bytes() {
        let script = assemble_source("push r1\nnop").unwrap();
        assert_eq!(
            instruction_starts(script.code()).unwrap(),
            vec![true, false, true]
        );
    }

    #[test]
    fn unknown_opcode_and_truncation_are_reported() {
        assert!(matches!(
            disassemble(&[0x00, 0xEE]),
            Err(VMError::InvalidInstruction {
                opcode: 0xEE,
                offset: 1
            })
        ));
        assert!(matches!(
            disassemble(&[Opcode::Jmp as u8, 1, 0]),
            Err(VMError::UnexpectedEndOfBytecode { .. })
        ));
    }
}
