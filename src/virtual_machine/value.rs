//! Dynamically typed values manipulated by the VM.

use crate::virtual_machine::errors::VMError;
use num_bigint::BigInt;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Handle to an aggregate stored in the per-run heap.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct HeapRef(pub(crate) u32);

impl HeapRef {
    pub const fn index(&self) -> u32 {
        self.0
    }
}

/// Host object carried opaquely by scripts.
///
/// Scripts can move, push and compare interop values but never look inside
/// them; extcalls and native contexts recover the concrete type with
/// [`InteropHandle::downcast_ref`].
pub trait InteropObject: Any + fmt::Debug + Send + Sync {
    /// Name shown in diagnostics and type errors.
    fn type_name(&self) -> &'static str;

    /// Independent copy used by the `copy` instruction.
    ///
    /// Objects that cannot be duplicated return `None`, which makes `copy` fail.
    fn duplicate(&self) -> Option<Arc<dyn InteropObject>> {
        None
    }
}

/// Shared reference to an [`InteropObject`]. Equality is identity.
#[derive(Clone, Debug)]
pub struct InteropHandle(Arc<dyn InteropObject>);

impl InteropHandle {
    pub fn new<T: InteropObject>(object: T) -> Self {
        Self(Arc::new(object))
    }

    pub fn from_arc(object: Arc<dyn InteropObject>) -> Self {
        Self(object)
    }

    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    pub fn downcast_ref<T: InteropObject>(&self) -> Option<&T> {
        let any: &dyn Any = self.0.as_ref();
        any.downcast_ref::<T>()
    }

    pub fn duplicate(&self) -> Option<Self> {
        self.0.duplicate().map(Self)
    }

    /// True when both handles point at the same host object.
    pub fn same_object(&self, other: &InteropHandle) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.0), Arc::as_ptr(&other.0))
    }
}

impl PartialEq for InteropHandle {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl Eq for InteropHandle {}

/// Runtime type tag of a [`VMObject`]. Discriminants double as literal tags in bytecode.
#[repr(u8)]
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum VMType {
    Bool = 1,
    Integer = 2,
    String = 3,
    Bytes = 4,
    Struct = 5,
    Enum = 6,
    Interop = 7,
    Object = 8,
}

impl VMType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            VMType::Bool => "Bool",
            VMType::Integer => "Integer",
            VMType::String => "String",
            VMType::Bytes => "Bytes",
            VMType::Struct => "Struct",
            VMType::Enum => "Enum",
            VMType::Interop => "Interop",
            VMType::Object => "Object",
        }
    }
}

/// Value held in registers, on the operand stack and inside aggregates.
///
/// `Struct` and `Object` are handles into the heap: cloning the enum aliases
/// the aggregate, and the derived equality compares handles. Structural
/// equality of aggregates is [`Heap::structural_eq`](crate::virtual_machine::vm::heap::Heap::structural_eq).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum VMObject {
    Bool(bool),
    Integer(BigInt),
    String(String),
    Bytes(Vec<u8>),
    /// Keyed aggregate with value semantics under `equal` and `copy`.
    Struct(HeapRef),
    Enum(u32),
    Interop(InteropHandle),
    /// Keyed aggregate compared by identity.
    Object(HeapRef),
}

impl VMObject {
    pub fn vm_type(&self) -> VMType {
        match self {
            VMObject::Bool(_) => VMType::Bool,
            VMObject::Integer(_) => VMType::Integer,
            VMObject::String(_) => VMType::String,
            VMObject::Bytes(_) => VMType::Bytes,
            VMObject::Struct(_) => VMType::Struct,
            VMObject::Enum(_) => VMType::Enum,
            VMObject::Interop(_) => VMType::Interop,
            VMObject::Object(_) => VMType::Object,
        }
    }

    /// Returns the type name for error messages.
    pub fn type_name(&self) -> &'static str {
        self.vm_type().as_str()
    }

    /// Primitives are the values allowed as aggregate keys.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            VMObject::Bool(_)
                | VMObject::Integer(_)
                | VMObject::String(_)
                | VMObject::Bytes(_)
                | VMObject::Enum(_)
        )
    }

    pub fn integer(value: impl Into<BigInt>) -> Self {
        VMObject::Integer(value.into())
    }

    fn cast_error(&self, expected: &'static str) -> VMError {
        VMError::InvalidCast {
            expected,
            actual: self.type_name(),
        }
    }

    pub fn as_bool(&self) -> Result<bool, VMError> {
        match self {
            VMObject::Bool(v) => Ok(*v),
            other => Err(other.cast_error("Bool")),
        }
    }

    pub fn as_integer(&self) -> Result<&BigInt, VMError> {
        match self {
            VMObject::Integer(v) => Ok(v),
            other => Err(other.cast_error("Integer")),
        }
    }

    /// Strings as-is, bytes when they are valid UTF-8.
    pub fn as_str(&self) -> Result<&str, VMError> {
        match self {
            VMObject::String(v) => Ok(v),
            VMObject::Bytes(v) => std::str::from_utf8(v).map_err(|_| VMError::InvalidUtf8),
            other => Err(other.cast_error("String")),
        }
    }

    /// Raw bytes of a `Bytes` or `String` value.
    pub fn as_bytes(&self) -> Result<&[u8], VMError> {
        match self {
            VMObject::Bytes(v) => Ok(v),
            VMObject::String(v) => Ok(v.as_bytes()),
            other => Err(other.cast_error("Bytes")),
        }
    }

    pub fn as_aggregate(&self) -> Result<HeapRef, VMError> {
        match self {
            VMObject::Struct(r) | VMObject::Object(r) => Ok(*r),
            other => Err(other.cast_error("Struct")),
        }
    }

    pub fn as_interop(&self) -> Result<&InteropHandle, VMError> {
        match self {
            VMObject::Interop(h) => Ok(h),
            other => Err(other.cast_error("Interop")),
        }
    }
}

impl From<bool> for VMObject {
    fn from(value: bool) -> Self {
        VMObject::Bool(value)
    }
}

impl From<i64> for VMObject {
    fn from(value: i64) -> Self {
        VMObject::Integer(BigInt::from(value))
    }
}

impl From<BigInt> for VMObject {
    fn from(value: BigInt) -> Self {
        VMObject::Integer(value)
    }
}

impl From<&str> for VMObject {
    fn from(value: &str) -> Self {
        VMObject::String(value.to_string())
    }
}

impl From<String> for VMObject {
    fn from(value: String) -> Self {
        VMObject::String(value)
    }
}

impl From<Vec<u8>> for VMObject {
    fn from(value: Vec<u8>) -> Self {
        VMObject::Bytes(value)
    }
}

impl fmt::Display for VMObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VMObject::Bool(v) => write!(f, "{v}"),
            VMObject::Integer(v) => write!(f, "{v}"),
            VMObject::String(v) => write!(f, "{v:?}"),
            VMObject::Bytes(v) => write!(f, "0x{}", hex::encode(v)),
            VMObject::Struct(r) => write!(f, "struct#{}", r.0),
            VMObject::Enum(v) => write!(f, "enum({v})"),
            VMObject::Interop(h) => write!(f, "<{}>", h.type_name()),
            VMObject::Object(r) => write!(f, "object#{}", r.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Token(u32);

    impl InteropObject for Token {
        fn type_name(&self) -> &'static str {
            "Token"
        }

        fn duplicate(&self) -> Option<Arc<dyn InteropObject>> {
            Some(Arc::new(Token(self.0)))
        }
    }

    #[test]
    fn accessors_reject_other_types() {
        let value = VMObject::from("hello");
        assert_eq!(value.as_str().unwrap(), "hello");
        assert_eq!(value.as_bytes().unwrap(), b"hello");
        assert!(matches!(
            value.as_bool(),
            Err(VMError::InvalidCast {
                expected: "Bool",
                actual: "String"
            })
        ));
        assert!(VMObject::from(5i64).as_str().is_err());
    }

    #[test]
    fn bytes_convert_to_str_only_when_utf8() {
        assert_eq!(VMObject::Bytes(b"ok".to_vec()).as_str().unwrap(), "ok");
        assert!(matches!(
            VMObject::Bytes(vec![0xff, 0xfe]).as_str(),
            Err(VMError::InvalidUtf8)
        ));
    }

    #[test]
    fn interop_equality_is_identity() {
        let a = InteropHandle::new(Token(1));
        let alias = a.clone();
        let twin = a.duplicate().unwrap();

        assert_eq!(a, alias);
        assert_ne!(a, twin);
        assert_eq!(twin.downcast_ref::<Token>().unwrap().0, 1);
        assert_eq!(twin.type_name(), "Token");
    }

    #[test]
    fn primitives_are_key_types() {
        assert!(VMObject::Enum(1).is_primitive());
        assert!(VMObject::Bytes(vec![]).is_primitive());
        assert!(!VMObject::Struct(HeapRef(0)).is_primitive());
        assert!(!VMObject::Interop(InteropHandle::new(Token(0))).is_primitive());
    }

    #[test]
    fn display_renders_each_type() {
        assert_eq!(VMObject::from(-12i64).to_string(), "-12");
        assert_eq!(VMObject::from("a").to_string(), "\"a\"");
        assert_eq!(VMObject::Bytes(vec![0xab, 0x01]).to_string(), "0xab01");
        assert_eq!(VMObject::Struct(HeapRef(3)).to_string(), "struct#3");
    }
}
