use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::value::VMObject;

/// Bounded operand stack shared by every frame and context of a run.
#[derive(Debug)]
pub struct OperandStack {
    items: Vec<VMObject>,
    limit: usize,
}

impl OperandStack {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            items: Vec::new(),
            limit,
        }
    }

    pub fn push(&mut self, value: VMObject) -> Result<(), VMError> {
        if self.items.len() >= self.limit {
            return Err(VMError::StackOverflow(self.limit));
        }
        self.items.push(value);
        Ok(())
    }

    pub fn pop(&mut self, instr: &'static str) -> Result<VMObject, VMError> {
        self.items.pop().ok_or(VMError::StackUnderflow(instr))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items bottom to top.
    pub fn as_slice(&self) -> &[VMObject] {
        &self.items
    }

    pub(crate) fn clear(&mut self) {
        self.items.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pop_is_lifo_and_bounded() {
        let mut stack = OperandStack::new(2);
        stack.push(VMObject::from(1i64)).unwrap();
        stack.push(VMObject::from(2i64)).unwrap();
        assert!(matches!(
            stack.push(VMObject::from(3i64)),
            Err(VMError::StackOverflow(2))
        ));
        assert_eq!(stack.pop("pop").unwrap(), VMObject::from(2i64));
        assert_eq!(stack.as_slice(), &[VMObject::from(1i64)]);
    }

    #[test]
    fn pop_on_empty_names_instruction() {
        let mut stack = OperandStack::new(2);
        assert!(matches!(stack.pop("throw"), Err(VMError::StackUnderflow("throw"))));
        assert!(stack.is_empty());
    }
}
