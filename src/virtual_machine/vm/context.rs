use super::registers::Registers;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::extcall::{Effect, ExtcallRegistry, HostFrame};
use crate::virtual_machine::script::Script;
use crate::virtual_machine::value::{InteropHandle, InteropObject, VMObject};
use std::collections::HashMap;
use std::sync::Arc;

/// Host collaborators consulted during a run.
pub struct ExecContext<'a> {
    /// Methods reachable through `extcall`.
    pub extcalls: &'a ExtcallRegistry,
    /// Contexts reachable through `ctx`/`switch`.
    pub contexts: &'a ContextRegistry,
}

impl<'a> ExecContext<'a> {
    pub fn new(extcalls: &'a ExtcallRegistry, contexts: &'a ContextRegistry) -> Self {
        Self { extcalls, contexts }
    }
}

/// Host code run in place of bytecode when a script switches to it.
///
/// It sees the shared operand stack through the [`HostFrame`] and returns to
/// the switching script as soon as it completes.
pub trait NativeContext: Send + Sync {
    fn execute(&self, frame: &mut HostFrame<'_>) -> Result<(), VMError>;

    /// Mutating contexts are skipped in read-only runs.
    fn effect(&self) -> Effect {
        Effect::Pure
    }
}

/// A switchable execution context.
pub enum Context {
    Script(Script),
    Native(Box<dyn NativeContext>),
}

/// Name-keyed contexts registered by the host before a run.
#[derive(Default)]
pub struct ContextRegistry {
    contexts: HashMap<String, Context>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, name: String, context: Context) -> Result<(), VMError> {
        if self.contexts.contains_key(&name) {
            return Err(VMError::DuplicateRegistration(name));
        }
        self.contexts.insert(name, context);
        Ok(())
    }

    pub fn register_script(&mut self, name: impl Into<String>, script: Script) -> Result<(), VMError> {
        self.insert(name.into(), Context::Script(script))
    }

    pub fn register_native<N: NativeContext + 'static>(
        &mut self,
        name: impl Into<String>,
        native: N,
    ) -> Result<(), VMError> {
        self.insert(name.into(), Context::Native(Box::new(native)))
    }

    pub fn get(&self, name: &str) -> Option<&Context> {
        self.contexts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.contexts.contains_key(name)
    }
}

/// Handle produced by `ctx`, consumed by `switch`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextRef {
    pub name: String,
}

impl InteropObject for ContextRef {
    fn type_name(&self) -> &'static str {
        "Context"
    }

    fn duplicate(&self) -> Option<Arc<dyn InteropObject>> {
        Some(Arc::new(self.clone()))
    }
}

impl ContextRef {
    pub fn handle(name: impl Into<String>) -> VMObject {
        VMObject::Interop(InteropHandle::new(ContextRef { name: name.into() }))
    }
}

/// Call stack frame.
///
/// The first frame of every context is its root frame (`return_addr` is
/// `None`); returning from it leaves the context. Calls within a context
/// share its register file.
#[derive(Clone, Debug)]
pub(super) struct CallFrame {
    /// Return address (bytecode offset to resume after call).
    pub(super) return_addr: Option<usize>,
}

impl CallFrame {
    pub(super) fn root() -> Self {
        Self { return_addr: None }
    }

    pub(super) fn returning_to(addr: usize) -> Self {
        Self {
            return_addr: Some(addr),
        }
    }
}

/// One active execution context: its code, position and registers.
#[derive(Debug)]
pub(super) struct ContextFrame {
    pub(super) name: String,
    pub(super) code: Arc<[u8]>,
    /// `starts[i]` is true when an instruction begins at offset `i`.
    pub(super) starts: Arc<[bool]>,
    pub(super) ip: usize,
    pub(super) registers: Registers,
}

impl ContextFrame {
    pub(super) fn new(name: String, code: Arc<[u8]>, starts: Arc<[bool]>, registers: usize) -> Self {
        Self {
            name,
            code,
            starts,
            ip: 0,
            registers: Registers::new(registers),
        }
    }

    /// True for instruction boundaries and for the end of the code.
    pub(super) fn is_boundary(&self, target: usize) -> bool {
        target == self.code.len() || self.starts.get(target).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Idle;

    impl NativeContext for Idle {
        fn execute(&self, _: &mut HostFrame<'_>) -> Result<(), VMError> {
            Ok(())
        }
    }

    #[test]
    fn context_names_are_unique() {
        let mut registry = ContextRegistry::new();
        registry.register_native("idle", Idle).unwrap();
        assert!(matches!(
            registry.register_script("idle", Script::from_code(vec![])),
            Err(VMError::DuplicateRegistration(ref n)) if n == "idle"
        ));
        assert!(registry.contains("idle"));
        assert!(matches!(registry.get("idle"), Some(Context::Native(_))));
    }

    #[test]
    fn context_handles_duplicate_by_name() {
        let handle = ContextRef::handle("token");
        let interop = handle.as_interop().unwrap();
        let copy = interop.duplicate().unwrap();
        assert_ne!(interop, &copy);
        assert_eq!(copy.downcast_ref::<ContextRef>().unwrap().name, "token");
        assert_eq!(interop.type_name(), "Context");
    }
}
