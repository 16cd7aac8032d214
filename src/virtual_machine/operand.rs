use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::value::{VMObject, VMType};
use num_bigint::BigInt;
use std::fmt;

/// Operand kinds in the order they are encoded after the opcode byte.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OperandKind {
    /// Register index, one byte.
    Reg,
    /// Tagged inline constant materialized by `load`.
    Literal,
    /// Absolute code offset, u32 little-endian.
    Target,
    /// Unsigned immediate, u32 little-endian.
    ImmU32,
    /// Extcall method: register holding the name, or the name inline.
    Name,
}

impl OperandKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OperandKind::Reg => "register",
            OperandKind::Literal => "literal",
            OperandKind::Target => "label",
            OperandKind::ImmU32 => "unsigned integer",
            OperandKind::Name => "string or register",
        }
    }
}

/// Constant embedded in the instruction stream.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Literal {
    Bool(bool),
    Integer(BigInt),
    String(String),
    Bytes(Vec<u8>),
    Enum(u32),
}

impl Literal {
    pub const fn vm_type(&self) -> VMType {
        match self {
            Literal::Bool(_) => VMType::Bool,
            Literal::Integer(_) => VMType::Integer,
            Literal::String(_) => VMType::String,
            Literal::Bytes(_) => VMType::Bytes,
            Literal::Enum(_) => VMType::Enum,
        }
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.vm_type() as u8);
        match self {
            Literal::Bool(v) => out.push(u8::from(*v)),
            Literal::Integer(v) => encode_payload(out, &v.to_signed_bytes_le()),
            Literal::String(v) => encode_payload(out, v.as_bytes()),
            Literal::Bytes(v) => encode_payload(out, v),
            Literal::Enum(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }

    pub fn into_object(self) -> VMObject {
        match self {
            Literal::Bool(v) => VMObject::Bool(v),
            Literal::Integer(v) => VMObject::Integer(v),
            Literal::String(v) => VMObject::String(v),
            Literal::Bytes(v) => VMObject::Bytes(v),
            Literal::Enum(v) => VMObject::Enum(v),
        }
    }
}

fn encode_payload(out: &mut Vec<u8>, payload: &[u8]) {
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
}

/// Escapes a string so the assembler reads it back unchanged.
pub fn quote_string(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 4);
    quoted.push_str("\\\"");
    for ch in value.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\t' => quoted.push_str("\\t"),
            other => quoted.push(other),
        }
    }
    quoted.push_str("\\\"");
    quoted
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Bool(v) => write!(f, "{v}"),
            Literal::Integer(v) => write!(f, "{v}"),
            Literal::String(v) => f.write_str(&quote_string(v)),
            Literal::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
            Literal::Enum(v) => write!(f, "enum({v})"),
        }
    }
}

/// Extcall method operand.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NameOperand {
    Reg(u8),
    Inline(String),
}

#[repr(u8)]
#[derive(Debug)]
pub enum NameTag {
    Register = 0,
    Inline = 1,
}

impl TryFrom<u8> for NameTag {
    type Error = VMError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Register),
            1 => Ok(Self::Inline),
            _ => Err(VMError::InvalidOperandTag {
                tag: value,
                offset: 0,
            }),
        }
    }
}

/// An operand as handed to the emitter or produced by the disassembler.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Operand {
    Reg(u8),
    Literal(Literal),
    /// Jump target by label, patched when the script is finished.
    Label(String),
    /// Jump target by absolute offset.
    Target(u32),
    Imm(u32),
    Name(NameOperand),
}

impl Operand {
    pub const fn kind(&self) -> OperandKind {
        match self {
            Operand::Reg(_) => OperandKind::Reg,
            Operand::Literal(_) => OperandKind::Literal,
            Operand::Label(_) | Operand::Target(_) => OperandKind::Target,
            Operand::Imm(_) => OperandKind::ImmU32,
            Operand::Name(_) => OperandKind::Name,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Reg(r) => write!(f, "r{r}"),
            Operand::Literal(lit) => write!(f, "{lit}"),
            Operand::Label(label) => f.write_str(label),
            Operand::Target(offset) | Operand::Imm(offset) => write!(f, "{offset}"),
            Operand::Name(NameOperand::Reg(r)) => write!(f, "r{r}"),
            Operand::Name(NameOperand::Inline(name)) => f.write_str(&quote_string(name)),
        }
    }
}

/// Sequential reader over bytecode.
pub(crate) struct Cursor<'a> {
    code: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(code: &'a [u8], pos: usize) -> Self {
        Self { code, pos }
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn read_exact(&mut self, count: usize) -> Result<&'a [u8], VMError> {
        let available = self.code.len().saturating_sub(self.pos);
        if count > available {
            return Err(VMError::UnexpectedEndOfBytecode {
                ip: self.pos,
                requested: count,
                available,
            });
        }
        let slice = &self.code[self.pos..self.pos + count];
        self.pos += count;
        Ok(slice)
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, VMError> {
        Ok(self.read_exact(1)?[0])
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, VMError> {
        let bytes = self.read_exact(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_payload(&mut self) -> Result<&'a [u8], VMError> {
        let len = self.read_u32()? as usize;
        self.read_exact(len)
    }

    fn read_utf8(&mut self) -> Result<String, VMError> {
        let bytes = self.read_payload()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| VMError::InvalidUtf8)
    }

    pub(crate) fn read_literal(&mut self) -> Result<Literal, VMError> {
        let offset = self.pos;
        let tag = self.read_u8()?;
        Ok(match tag {
            t if t == VMType::Bool as u8 => Literal::Bool(self.read_u8()? != 0),
            t if t == VMType::Integer as u8 => {
                Literal::Integer(BigInt::from_signed_bytes_le(self.read_payload()?))
            }
            t if t == VMType::String as u8 => Literal::String(self.read_utf8()?),
            t if t == VMType::Bytes as u8 => Literal::Bytes(self.read_payload()?.to_vec()),
            t if t == VMType::Enum as u8 => Literal::Enum(self.read_u32()?),
            _ => return Err(VMError::InvalidOperandTag { tag, offset }),
        })
    }

    pub(crate) fn read_name(&mut self) -> Result<NameOperand, VMError> {
        let offset = self.pos;
        let tag = self.read_u8()?;
        match NameTag::try_from(tag).map_err(|_| VMError::InvalidOperandTag { tag, offset })? {
            NameTag::Register => Ok(NameOperand::Reg(self.read_u8()?)),
            NameTag::Inline => Ok(NameOperand::Inline(self.read_utf8()?)),
        }
    }

    /// Reads one operand of the given kind.
    pub(crate) fn read_operand(&mut self, kind: OperandKind) -> Result<Operand, VMError> {
        Ok(match kind {
            OperandKind::Reg => Operand::Reg(self.read_u8()?),
            OperandKind::Literal => Operand::Literal(self.read_literal()?),
            OperandKind::Target => Operand::Target(self.read_u32()?),
            OperandKind::ImmU32 => Operand::Imm(self.read_u32()?),
            OperandKind::Name => Operand::Name(self.read_name()?),
        })
    }
}

/// Appends the encoding of a resolved operand. Labels must be patched by the caller.
pub(crate) fn encode_operand(operand: &Operand, out: &mut Vec<u8>) {
    match operand {
        Operand::Reg(r) => out.push(*r),
        Operand::Literal(lit) => lit.encode(out),
        Operand::Label(_) => out.extend_from_slice(&0u32.to_le_bytes()),
        Operand::Target(v) | Operand::Imm(v) => out.extend_from_slice(&v.to_le_bytes()),
        Operand::Name(NameOperand::Reg(r)) => {
            out.push(NameTag::Register as u8);
            out.push(*r);
        }
        Operand::Name(NameOperand::Inline(name)) => {
            out.push(NameTag::Inline as u8);
            encode_payload(out, name.as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_literal(bytes: &[u8]) -> Result<Literal, VMError> {
        Cursor::new(bytes, 0).read_literal()
    }

    #[test]
    fn big_integer_literal_survives_encoding() {
        let value: BigInt = "-123098123049830982903580234959875213840923849203758942357834091"
            .parse()
            .unwrap();
        let mut out = Vec::new();
        Literal::Integer(value.clone()).encode(&mut out);
        assert_eq!(out[0], VMType::Integer as u8);
        assert_eq!(decode_literal(&out).unwrap(), Literal::Integer(value));
    }

    #[test]
    fn literal_tag_for_aggregate_is_rejected() {
        let err = decode_literal(&[VMType::Struct as u8, 0]).unwrap_err();
        assert!(matches!(err, VMError::InvalidOperandTag { tag: 5, offset: 0 }));
    }

    #[test]
    fn truncated_payload_reports_end_of_bytecode() {
        let err = decode_literal(&[VMType::String as u8, 10, 0, 0, 0, b'a']).unwrap_err();
        assert!(matches!(
            err,
            VMError::UnexpectedEndOfBytecode {
                ip: 5,
                requested: 10,
                available: 1
            }
        ));
    }

    #[test]
    fn name_operand_tags() {
        let mut out = Vec::new();
        encode_operand(&Operand::Name(NameOperand::Inline("Upper".into())), &mut out);
        encode_operand(&Operand::Name(NameOperand::Reg(4)), &mut out);
        let mut cursor = Cursor::new(&out, 0);
        assert_eq!(
            cursor.read_name().unwrap(),
            NameOperand::Inline("Upper".into())
        );
        assert_eq!(cursor.read_name().unwrap(), NameOperand::Reg(4));
        assert_eq!(cursor.position(), out.len());

        assert!(matches!(
            NameTag::try_from(2),
            Err(VMError::InvalidOperandTag { tag: 2, .. })
        ));
    }

    #[test]
    fn quoted_strings_escape_backslash_and_controls() {
        assert_eq!(quote_string("a\\b\nc"), "\\\"a\\\\b\\nc\\\"");
        assert_eq!(quote_string("say \"hi\""), "\\\"say \"hi\"\\\"");
    }

    #[test]
    fn operand_kinds_group_labels_with_targets() {
        assert_eq!(Operand::Label("@x".into()).kind(), OperandKind::Target);
        assert_eq!(Operand::Target(3).kind(), OperandKind::Target);
        assert_eq!(Operand::Imm(3).kind(), OperandKind::ImmU32);
    }
}
