//! Host method bridge.
//!
//! Scripts reach host functionality through `extcall name`. The host registers
//! named methods in an [`ExtcallRegistry`] before the run; the VM pops the
//! declared number of arguments (top of stack first), invokes the handler with
//! a [`HostFrame`] and pushes whatever the handler returns.

use crate::info;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::value::VMObject;
use crate::virtual_machine::vm::gas::{GasCategory, GasMeter, GasSchedule};
use crate::virtual_machine::vm::heap::{Aggregate, Heap};
use crate::virtual_machine::vm::stack::OperandStack;
use num_bigint::BigInt;
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;

/// Most arguments a single extcall may declare.
pub const MAX_EXTCALL_ARITY: u8 = 16;

/// Whether a host method changes state outside the VM.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Effect {
    Pure,
    /// Skipped in read-only runs.
    Mutating,
}

/// VM state a host method may touch while it runs.
pub struct HostFrame<'a> {
    pub(crate) heap: &'a mut Heap,
    pub(crate) stack: &'a mut OperandStack,
    pub(crate) gas: &'a mut GasMeter,
    pub(crate) schedule: &'a GasSchedule,
    pub(crate) read_only: bool,
}

impl HostFrame<'_> {
    pub fn heap(&self) -> &Heap {
        &*self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut *self.heap
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn push(&mut self, value: VMObject) -> Result<(), VMError> {
        self.stack.push(value)
    }

    pub fn pop(&mut self) -> Result<VMObject, VMError> {
        self.stack.pop("extcall")
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    /// Charges host work against the run's gas limit.
    pub fn charge(&mut self, amount: u64) -> Result<(), VMError> {
        self.gas.charge(amount, GasCategory::HostFunction)
    }

    /// Charges the per-byte rate for `bytes` bytes of host work.
    pub fn charge_bytes(&mut self, bytes: usize) -> Result<(), VMError> {
        let cost = self.schedule.bytes_cost(bytes);
        self.gas.charge(cost, GasCategory::HostFunction)
    }
}

/// Handler signature for host methods.
pub type ExtcallHandler =
    dyn Fn(&mut HostFrame<'_>, Vec<VMObject>) -> Result<Vec<VMObject>, VMError> + Send + Sync;

/// A registered host method.
pub struct Extcall {
    name: String,
    arity: u8,
    effect: Effect,
    handler: Box<ExtcallHandler>,
}

impl Extcall {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arity(&self) -> u8 {
        self.arity
    }

    pub fn effect(&self) -> Effect {
        self.effect
    }

    pub(crate) fn invoke(
        &self,
        frame: &mut HostFrame<'_>,
        args: Vec<VMObject>,
    ) -> Result<Vec<VMObject>, VMError> {
        (self.handler)(frame, args)
    }
}

impl std::fmt::Debug for Extcall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Extcall")
            .field("name", &self.name)
            .field("arity", &self.arity)
            .field("effect", &self.effect)
            .finish_non_exhaustive()
    }
}

/// Name-keyed table of host methods, fixed before a run starts.
#[derive(Debug, Default)]
pub struct ExtcallRegistry {
    calls: HashMap<String, Extcall>,
}

impl ExtcallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the builtin library.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for (name, arity, handler) in BUILTINS {
            let registered = registry.register(*name, *arity, Effect::Pure, *handler);
            debug_assert!(registered.is_ok(), "builtin {name} rejected");
        }
        registry
    }

    /// Registers a host method.
    ///
    /// Rejects empty names, arities above [`MAX_EXTCALL_ARITY`] and names that
    /// are already taken.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        arity: u8,
        effect: Effect,
        handler: F,
    ) -> Result<(), VMError>
    where
        F: Fn(&mut HostFrame<'_>, Vec<VMObject>) -> Result<Vec<VMObject>, VMError>
            + Send
            + Sync
            + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(VMError::InvalidDescriptor {
                name,
                reason: "empty name",
            });
        }
        if arity > MAX_EXTCALL_ARITY {
            return Err(VMError::InvalidDescriptor {
                name,
                reason: "too many arguments",
            });
        }
        if self.calls.contains_key(&name) {
            return Err(VMError::DuplicateRegistration(name));
        }
        self.calls.insert(
            name.clone(),
            Extcall {
                name,
                arity,
                effect,
                handler: Box::new(handler),
            },
        );
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Extcall> {
        self.calls.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.calls.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.calls.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

type BuiltinFn = fn(&mut HostFrame<'_>, Vec<VMObject>) -> Result<Vec<VMObject>, VMError>;

const BUILTINS: &[(&str, u8, BuiltinFn)] = &[
    ("Runtime.Log", 1, runtime_log),
    ("Runtime.Expect", 2, runtime_expect),
    ("String.Upper", 1, string_upper),
    ("String.Lower", 1, string_lower),
    ("Hash.SHA3", 1, hash_sha3),
    ("Object.New", 0, object_new),
    ("Object.Count", 1, object_count),
];

fn runtime_log(_: &mut HostFrame<'_>, args: Vec<VMObject>) -> Result<Vec<VMObject>, VMError> {
    match &args[0] {
        VMObject::String(text) => info!("script: {}", text),
        other => info!("script: {}", other),
    }
    Ok(Vec::new())
}

fn runtime_expect(_: &mut HostFrame<'_>, args: Vec<VMObject>) -> Result<Vec<VMObject>, VMError> {
    let mut args = args.into_iter();
    let (Some(condition), Some(message)) = (args.next(), args.next()) else {
        return Err(VMError::StackUnderflow("extcall"));
    };
    if condition.as_bool()? {
        Ok(Vec::new())
    } else {
        Err(VMError::Thrown(message))
    }
}

fn string_upper(frame: &mut HostFrame<'_>, args: Vec<VMObject>) -> Result<Vec<VMObject>, VMError> {
    let text = args[0].as_str()?;
    frame.charge_bytes(text.len())?;
    Ok(vec![VMObject::String(text.to_uppercase())])
}

fn string_lower(frame: &mut HostFrame<'_>, args: Vec<VMObject>) -> Result<Vec<VMObject>, VMError> {
    let text = args[0].as_str()?;
    frame.charge_bytes(text.len())?;
    Ok(vec![VMObject::String(text.to_lowercase())])
}

fn hash_sha3(frame: &mut HostFrame<'_>, args: Vec<VMObject>) -> Result<Vec<VMObject>, VMError> {
    let data = args[0].as_bytes()?;
    frame.charge_bytes(data.len())?;
    Ok(vec![VMObject::Bytes(Sha3_256::digest(data).to_vec())])
}

fn object_new(frame: &mut HostFrame<'_>, _: Vec<VMObject>) -> Result<Vec<VMObject>, VMError> {
    let reference = frame.heap_mut().alloc(Aggregate::default())?;
    Ok(vec![VMObject::Object(reference)])
}

fn object_count(frame: &mut HostFrame<'_>, args: Vec<VMObject>) -> Result<Vec<VMObject>, VMError> {
    let len = frame.heap().get(args[0].as_aggregate()?)?.len();
    Ok(vec![VMObject::Integer(BigInt::from(len))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::errors::FaultKind;

    fn noop(_: &mut HostFrame<'_>, _: Vec<VMObject>) -> Result<Vec<VMObject>, VMError> {
        Ok(Vec::new())
    }

    #[test]
    fn registration_is_validated() {
        let mut registry = ExtcallRegistry::new();
        registry.register("Ledger.Add", 2, Effect::Mutating, noop).unwrap();

        let duplicate = registry
            .register("Ledger.Add", 1, Effect::Pure, noop)
            .unwrap_err();
        assert!(matches!(duplicate, VMError::DuplicateRegistration(ref n) if n == "Ledger.Add"));
        assert_eq!(duplicate.kind(), FaultKind::UnknownExtcall);

        assert!(matches!(
            registry.register("", 0, Effect::Pure, noop),
            Err(VMError::InvalidDescriptor {
                reason: "empty name",
                ..
            })
        ));
        assert!(matches!(
            registry.register("Wide", MAX_EXTCALL_ARITY + 1, Effect::Pure, noop),
            Err(VMError::InvalidDescriptor { .. })
        ));

        let call = registry.get("Ledger.Add").unwrap();
        assert_eq!(call.arity(), 2);
        assert_eq!(call.effect(), Effect::Mutating);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn builtins_are_registered() {
        let registry = ExtcallRegistry::with_builtins();
        assert_eq!(registry.len(), BUILTINS.len());
        assert!(registry.contains("String.Upper"));
        assert!(registry.contains("Hash.SHA3"));
        assert_eq!(registry.names().first(), Some(&"Hash.SHA3"));
        assert!(registry.get("Upper").is_none());
    }
}
