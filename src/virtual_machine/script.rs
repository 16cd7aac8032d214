//! Compiled scripts and the bytecode emitter.
//!
//! [`ScriptBuilder`] appends encoded instructions, records label definitions
//! and patches forward references once the whole script has been emitted.
//! [`Script`] is the finished, immutable bytecode plus its label table.

use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::Opcode;
use crate::virtual_machine::operand::{Literal, NameOperand, Operand, encode_operand};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Magic bytes identifying a serialized script.
const MAGIC: &[u8; 5] = b"VM_SC";

/// Current serialization format version (major, minor, patch).
const CURRENT_VERSION: [u8; 3] = [1, 0, 0];

/// Normalizes a label so `loop` and `@loop` name the same location.
pub fn normalize_label(name: &str) -> String {
    if name.starts_with('@') {
        name.to_string()
    } else {
        format!("@{name}")
    }
}

/// Finished bytecode with the offsets of its labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Script {
    code: Arc<[u8]>,
    labels: BTreeMap<String, u32>,
}

impl Script {
    /// Wraps raw bytecode produced elsewhere.
    pub fn from_code(code: Vec<u8>) -> Self {
        Self {
            code: code.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub(crate) fn shared_code(&self) -> Arc<[u8]> {
        Arc::clone(&self.code)
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Label name to byte offset.
    pub fn labels(&self) -> &BTreeMap<String, u32> {
        &self.labels
    }

    /// Serializes the script to a portable binary format.
    ///
    /// The output includes a magic header and version for compatibility checking.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.code.len() + 16);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&CURRENT_VERSION);
        write_bytes(&mut out, &self.code);
        out.extend_from_slice(&(self.labels.len() as u32).to_le_bytes());
        for (name, offset) in &self.labels {
            write_bytes(&mut out, name.as_bytes());
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out
    }

    /// Deserializes a script, validating magic, version and framing.
    pub fn from_bytes(input: &[u8]) -> Result<Self, VMError> {
        let mut reader = Reader { input };
        if reader.take(MAGIC.len())? != MAGIC {
            return Err(VMError::DecodeError("bad magic".to_string()));
        }
        if reader.take(CURRENT_VERSION.len())? != &CURRENT_VERSION {
            return Err(VMError::DecodeError("unsupported version".to_string()));
        }
        let code = reader.bytes()?.to_vec();
        let count = reader.u32()?;
        let mut labels = BTreeMap::new();
        for _ in 0..count {
            let name = String::from_utf8(reader.bytes()?.to_vec())
                .map_err(|_| VMError::DecodeError("label is not utf8".to_string()))?;
            let offset = reader.u32()?;
            if offset as usize > code.len() {
                return Err(VMError::DecodeError(format!(
                    "label {name} points past the end of the code"
                )));
            }
            labels.insert(name, offset);
        }
        if !reader.input.is_empty() {
            return Err(VMError::DecodeError("trailing bytes".to_string()));
        }
        Ok(Self {
            code: code.into(),
            labels,
        })
    }
}

fn write_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(bytes);
}

struct Reader<'a> {
    input: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, count: usize) -> Result<&'a [u8], VMError> {
        if self.input.len() < count {
            return Err(VMError::DecodeError("truncated".to_string()));
        }
        let (head, rest) = self.input.split_at(count);
        self.input = rest;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32, VMError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn bytes(&mut self) -> Result<&'a [u8], VMError> {
        let len = self.u32()? as usize;
        self.take(len)
    }
}

/// Pending jump operand waiting for its label.
#[derive(Debug)]
struct Patch {
    label: String,
    offset: usize,
    line: usize,
}

/// Appends encoded instructions and resolves label references.
///
/// Label references may appear before their definition; they are written as
/// placeholders and patched in [`ScriptBuilder::finish`].
#[derive(Debug, Default)]
pub struct ScriptBuilder {
    code: Vec<u8>,
    labels: HashMap<String, usize>,
    patches: Vec<Patch>,
    line: usize,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source line attached to subsequent emission errors.
    pub fn set_line(&mut self, line: usize) -> &mut Self {
        self.line = line;
        self
    }

    /// Current write offset.
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Defines `name` at the current offset.
    pub fn label(&mut self, name: &str) -> Result<&mut Self, VMError> {
        let label = normalize_label(name);
        if self.labels.contains_key(&label) {
            return Err(VMError::DuplicateLabel {
                line: self.line,
                label,
            });
        }
        self.labels.insert(label, self.code.len());
        Ok(self)
    }

    /// Appends one instruction after checking its operands against the opcode table.
    pub fn emit(&mut self, opcode: Opcode, operands: &[Operand]) -> Result<&mut Self, VMError> {
        let layout = opcode.operands();
        if layout.len() != operands.len() {
            return Err(VMError::ArityMismatch {
                line: self.line,
                opcode: opcode.mnemonic(),
                expected: layout.len(),
                actual: operands.len(),
            });
        }
        if let Some((kind, operand)) = layout
            .iter()
            .zip(operands)
            .find(|(kind, operand)| operand.kind() != **kind)
        {
            return Err(VMError::InvalidOperand {
                line: self.line,
                token: operand.to_string(),
                expected: kind.as_str(),
            });
        }

        self.code.push(opcode as u8);
        for operand in operands {
            if let Operand::Label(name) = operand {
                self.patches.push(Patch {
                    label: normalize_label(name),
                    offset: self.code.len(),
                    line: self.line,
                });
            }
            encode_operand(operand, &mut self.code);
        }
        Ok(self)
    }

    pub fn emit_load(&mut self, dst: u8, literal: Literal) -> Result<&mut Self, VMError> {
        self.emit(Opcode::Load, &[Operand::Reg(dst), Operand::Literal(literal)])
    }

    pub fn emit_push(&mut self, src: u8) -> Result<&mut Self, VMError> {
        self.emit(Opcode::Push, &[Operand::Reg(src)])
    }

    pub fn emit_pop(&mut self, dst: u8) -> Result<&mut Self, VMError> {
        self.emit(Opcode::Pop, &[Operand::Reg(dst)])
    }

    /// `jmp`/`call` to a label.
    pub fn emit_jump(&mut self, opcode: Opcode, label: &str) -> Result<&mut Self, VMError> {
        self.emit(opcode, &[Operand::Label(label.to_string())])
    }

    /// `jmpif`/`jmpnot` on `cond` to a label.
    pub fn emit_branch(
        &mut self,
        opcode: Opcode,
        cond: u8,
        label: &str,
    ) -> Result<&mut Self, VMError> {
        self.emit(opcode, &[Operand::Reg(cond), Operand::Label(label.to_string())])
    }

    pub fn emit_extcall(&mut self, method: &str) -> Result<&mut Self, VMError> {
        self.emit(
            Opcode::ExtCall,
            &[Operand::Name(NameOperand::Inline(method.to_string()))],
        )
    }

    pub fn emit_ret(&mut self) -> Result<&mut Self, VMError> {
        self.emit(Opcode::Ret, &[])
    }

    /// Resolves every label reference and returns the finished script.
    pub fn finish(self) -> Result<Script, VMError> {
        let Self {
            mut code,
            labels,
            patches,
            ..
        } = self;
        if code.len() > u32::MAX as usize {
            return Err(VMError::ScriptTooLarge {
                size: code.len(),
                limit: u32::MAX as usize,
            });
        }
        for patch in patches {
            let target = *labels.get(&patch.label).ok_or(VMError::UndefinedLabel {
                line: patch.line,
                label: patch.label.clone(),
            })?;
            code[patch.offset..patch.offset + 4].copy_from_slice(&(target as u32).to_le_bytes());
        }
        let labels = labels
            .into_iter()
            .map(|(name, offset)| (name, offset as u32))
            .collect();
        Ok(Script {
            code: code.into(),
            labels,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_and_backward_references_patch_to_label_offset() {
        let mut builder = ScriptBuilder::new();
        builder.emit_jump(Opcode::Jmp, "end").unwrap();
        builder.label("@top").unwrap();
        builder.emit(Opcode::Nop, &[]).unwrap();
        builder.emit_branch(Opcode::JmpNot, 1, "top").unwrap();
        builder.label("end").unwrap();
        builder.emit_ret().unwrap();
        let script = builder.finish().unwrap();

        let code = script.code();
        // jmp @end: opcode + u32
        assert_eq!(code[0], Opcode::Jmp as u8);
        assert_eq!(u32::from_le_bytes(code[1..5].try_into().unwrap()), 12);
        // jmpnot r1, @top
        assert_eq!(code[6], Opcode::JmpNot as u8);
        assert_eq!(u32::from_le_bytes(code[8..12].try_into().unwrap()), 5);
        assert_eq!(script.labels().get("@end"), Some(&12));
        assert_eq!(script.labels().get("@top"), Some(&5));
    }

    #[test]
    fn undefined_label_reports_reference_line() {
        let mut builder = ScriptBuilder::new();
        builder.set_line(4);
        builder.emit_jump(Opcode::Call, "missing").unwrap();
        let err = builder.finish().unwrap_err();
        assert!(matches!(
            err,
            VMError::UndefinedLabel { line: 4, ref label } if label == "@missing"
        ));
    }

    #[test]
    fn duplicate_label_is_rejected() {
        let mut builder = ScriptBuilder::new();
        builder.label("a").unwrap();
        builder.set_line(2);
        assert!(matches!(
            builder.label("@a"),
            Err(VMError::DuplicateLabel { line: 2, .. })
        ));
    }

    #[test]
    fn operands_are_checked_against_layout() {
        let mut builder = ScriptBuilder::new();
        assert!(matches!(
            builder.emit(Opcode::Add, &[Operand::Reg(1), Operand::Reg(2)]),
            Err(VMError::ArityMismatch {
                opcode: "add",
                expected: 3,
                actual: 2,
                ..
            })
        ));
        assert!(matches!(
            builder.emit(Opcode::Push, &[Operand::Imm(3)]),
            Err(VMError::InvalidOperand {
                expected: "register",
                ..
            })
        ));
        assert_eq!(builder.offset(), 0);
    }

    #[test]
    fn serialized_script_round_trips_and_validates_header() {
        let mut builder = ScriptBuilder::new();
        builder.label("start").unwrap();
        builder.emit_load(1, Literal::String("hi".into())).unwrap();
        builder.emit_push(1).unwrap();
        builder.emit_extcall("Runtime.Log").unwrap();
        builder.emit_pop(2).unwrap();
        let script = builder.finish().unwrap();

        let bytes = script.to_bytes();
        assert_eq!(Script::from_bytes(&bytes).unwrap(), script);

        let mut bad_magic = bytes.clone();
        bad_magic[0] = b'X';
        assert!(matches!(
            Script::from_bytes(&bad_magic),
            Err(VMError::DecodeError(reason)) if reason == "bad magic"
        ));

        let mut trailing = bytes.clone();
        trailing.push(0);
        assert!(matches!(
            Script::from_bytes(&trailing),
            Err(VMError::DecodeError(reason)) if reason == "trailing bytes"
        ));

        assert!(matches!(
            Script::from_bytes(&bytes[..bytes.len() - 2]),
            Err(VMError::DecodeError(reason)) if reason == "truncated"
        ));
    }
}
