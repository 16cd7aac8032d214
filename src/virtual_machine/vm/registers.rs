use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::value::VMObject;
use num_bigint::BigInt;

/// Register file of one execution context.
///
/// Registers start unset; typed reads of an unset register fail.
#[derive(Clone, Debug)]
pub(super) struct Registers {
    regs: Vec<Option<VMObject>>,
}

impl Registers {
    /// Creates a register file with `count` unset registers.
    pub(super) fn new(count: usize) -> Self {
        Self {
            regs: vec![None; count],
        }
    }

    fn slot(&self, idx: u8) -> Result<&Option<VMObject>, VMError> {
        self.regs
            .get(idx as usize)
            .ok_or(VMError::InvalidRegisterIndex {
                index: idx,
                available: self.regs.len(),
            })
    }

    /// Returns the value in register `idx`, or `None` when it was never written.
    pub(super) fn get_opt(&self, idx: u8) -> Result<Option<&VMObject>, VMError> {
        Ok(self.slot(idx)?.as_ref())
    }

    /// Returns the value in register `idx`.
    ///
    /// Returns [`VMError::UnsetRegister`] if it was never written.
    pub(super) fn get(&self, idx: u8, instr: &'static str) -> Result<&VMObject, VMError> {
        self.slot(idx)?.as_ref().ok_or(VMError::UnsetRegister {
            instruction: instr,
            index: idx,
        })
    }

    fn mismatch(instr: &'static str, arg: usize, expected: &'static str, actual: &VMObject) -> VMError {
        VMError::TypeMismatch {
            instruction: instr,
            arg_index: arg,
            expected,
            actual: actual.type_name(),
        }
    }

    /// Returns the boolean in register `idx`.
    ///
    /// Returns [`VMError::TypeMismatch`] if the value is not a boolean.
    pub(super) fn get_bool(&self, idx: u8, instr: &'static str, arg: usize) -> Result<bool, VMError> {
        match self.get(idx, instr)? {
            VMObject::Bool(v) => Ok(*v),
            other => Err(Self::mismatch(instr, arg, "Bool", other)),
        }
    }

    /// Returns the integer in register `idx`.
    pub(super) fn get_int(&self, idx: u8, instr: &'static str, arg: usize) -> Result<&BigInt, VMError> {
        match self.get(idx, instr)? {
            VMObject::Integer(v) => Ok(v),
            other => Err(Self::mismatch(instr, arg, "Integer", other)),
        }
    }

    /// Returns the raw bytes of a string or bytes value in register `idx`.
    pub(super) fn get_bytes(&self, idx: u8, instr: &'static str, arg: usize) -> Result<&[u8], VMError> {
        match self.get(idx, instr)? {
            VMObject::String(v) => Ok(v.as_bytes()),
            VMObject::Bytes(v) => Ok(v),
            other => Err(Self::mismatch(instr, arg, "String", other)),
        }
    }

    /// Returns the string in register `idx`.
    pub(super) fn get_str(&self, idx: u8, instr: &'static str, arg: usize) -> Result<&str, VMError> {
        match self.get(idx, instr)? {
            VMObject::String(v) => Ok(v),
            other => Err(Self::mismatch(instr, arg, "String", other)),
        }
    }

    /// Stores a value into register `idx`.
    ///
    /// Returns [`VMError::InvalidRegisterIndex`] if `idx` is out of bounds.
    pub(super) fn set(&mut self, idx: u8, v: VMObject) -> Result<(), VMError> {
        let available = self.regs.len();
        let slot = self
            .regs
            .get_mut(idx as usize)
            .ok_or(VMError::InvalidRegisterIndex {
                index: idx,
                available,
            })?;
        *slot = Some(v);
        Ok(())
    }

    /// Exchanges the contents of two registers, set or not.
    pub(super) fn swap(&mut self, a: u8, b: u8) -> Result<(), VMError> {
        self.slot(a)?;
        self.slot(b)?;
        self.regs.swap(a as usize, b as usize);
        Ok(())
    }

    pub(super) fn clear(&mut self) {
        self.regs.iter_mut().for_each(|slot| *slot = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_register_reads_fail() {
        let regs = Registers::new(4);
        assert_eq!(regs.get_opt(1).unwrap(), None);
        assert!(matches!(
            regs.get(1, "push"),
            Err(VMError::UnsetRegister {
                instruction: "push",
                index: 1
            })
        ));
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut regs = Registers::new(4);
        assert!(matches!(
            regs.set(4, VMObject::from(true)),
            Err(VMError::InvalidRegisterIndex {
                index: 4,
                available: 4
            })
        ));
        assert!(regs.swap(0, 9).is_err());
    }

    #[test]
    fn typed_reads_report_argument_position() {
        let mut regs = Registers::new(4);
        regs.set(2, VMObject::from("text")).unwrap();
        assert!(matches!(
            regs.get_int(2, "add", 1),
            Err(VMError::TypeMismatch {
                instruction: "add",
                arg_index: 1,
                expected: "Integer",
                actual: "String"
            })
        ));
        assert_eq!(regs.get_bytes(2, "size", 0).unwrap(), b"text");
    }

    #[test]
    fn swap_moves_unset_slots() {
        let mut regs = Registers::new(3);
        regs.set(0, VMObject::from(1i64)).unwrap();
        regs.swap(0, 2).unwrap();
        assert_eq!(regs.get_opt(0).unwrap(), None);
        assert_eq!(regs.get(2, "swap").unwrap(), &VMObject::from(1i64));
        regs.clear();
        assert_eq!(regs.get_opt(2).unwrap(), None);
    }
}
