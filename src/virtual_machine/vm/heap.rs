use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::value::{HeapRef, VMObject};
use std::collections::{HashMap, HashSet};

/// Keyed collection behind `Struct` and `Object` values.
///
/// Entries keep insertion order; keys are primitive values compared structurally.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Aggregate {
    entries: Vec<(VMObject, VMObject)>,
}

impl Aggregate {
    pub fn get(&self, key: &VMObject) -> Option<&VMObject> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, value)| value)
    }

    /// Inserts or replaces the value stored under `key`.
    pub fn insert(&mut self, key: VMObject, value: VMObject) {
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&VMObject, &VMObject)> {
        self.entries.iter().map(|(k, v)| (k, v))
    }
}

/// Arena owning every aggregate created during one run.
///
/// Values refer to aggregates through [`HeapRef`] handles, so aliasing after
/// `move` is handle sharing and cycles cannot leak memory beyond the run.
#[derive(Debug)]
pub struct Heap {
    slots: Vec<Aggregate>,
    limit: usize,
}

impl Heap {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            limit,
        }
    }

    pub fn alloc(&mut self, aggregate: Aggregate) -> Result<HeapRef, VMError> {
        if self.slots.len() >= self.limit {
            return Err(VMError::HeapExhausted(self.limit));
        }
        self.slots.push(aggregate);
        Ok(HeapRef((self.slots.len() - 1) as u32))
    }

    pub fn get(&self, reference: HeapRef) -> Result<&Aggregate, VMError> {
        self.slots
            .get(reference.0 as usize)
            .ok_or(VMError::InvalidHeapRef(reference.0))
    }

    pub fn get_mut(&mut self, reference: HeapRef) -> Result<&mut Aggregate, VMError> {
        self.slots
            .get_mut(reference.0 as usize)
            .ok_or(VMError::InvalidHeapRef(reference.0))
    }

    /// Number of live aggregates.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
    }

    /// Aggregates plus entries reachable from `value`; the amount of work `copy` does.
    pub fn footprint(&self, value: &VMObject) -> Result<usize, VMError> {
        let mut seen = HashSet::new();
        let mut pending = Vec::new();
        let mut total = 0usize;
        if let VMObject::Struct(r) | VMObject::Object(r) = value {
            pending.push(*r);
        }
        while let Some(reference) = pending.pop() {
            if !seen.insert(reference) {
                continue;
            }
            let aggregate = self.get(reference)?;
            total += 1 + aggregate.len();
            for (_, item) in aggregate.iter() {
                if let VMObject::Struct(r) | VMObject::Object(r) = item {
                    pending.push(*r);
                }
            }
        }
        Ok(total)
    }

    /// Deep copy: aggregates get fresh slots (sharing and cycles are preserved
    /// within the copy), interop objects are duplicated, primitives are cloned.
    pub fn deep_copy(&mut self, value: &VMObject) -> Result<VMObject, VMError> {
        let mut copied = HashMap::new();
        self.copy_value(value, &mut copied)
    }

    fn copy_value(
        &mut self,
        value: &VMObject,
        copied: &mut HashMap<HeapRef, HeapRef>,
    ) -> Result<VMObject, VMError> {
        match value {
            VMObject::Struct(r) => Ok(VMObject::Struct(self.copy_aggregate(*r, copied)?)),
            VMObject::Object(r) => Ok(VMObject::Object(self.copy_aggregate(*r, copied)?)),
            VMObject::Interop(handle) => handle
                .duplicate()
                .map(VMObject::Interop)
                .ok_or(VMError::NotCopyable(handle.type_name())),
            other => Ok(other.clone()),
        }
    }

    fn copy_aggregate(
        &mut self,
        source: HeapRef,
        copied: &mut HashMap<HeapRef, HeapRef>,
    ) -> Result<HeapRef, VMError> {
        if let Some(done) = copied.get(&source) {
            return Ok(*done);
        }
        let entries = self.get(source)?.entries.clone();
        let target = self.alloc(Aggregate::default())?;
        copied.insert(source, target);

        let mut fresh = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let value = self.copy_value(&value, copied)?;
            fresh.push((key, value));
        }
        self.get_mut(target)?.entries = fresh;
        Ok(target)
    }

    /// Equality used by `equal`: structural for primitives and structs,
    /// identity for objects and interop handles, false across types.
    pub fn structural_eq(&self, a: &VMObject, b: &VMObject) -> Result<bool, VMError> {
        let mut assumed = HashSet::new();
        self.eq_values(a, b, &mut assumed)
    }

    fn eq_values(
        &self,
        a: &VMObject,
        b: &VMObject,
        assumed: &mut HashSet<(HeapRef, HeapRef)>,
    ) -> Result<bool, VMError> {
        let (VMObject::Struct(x), VMObject::Struct(y)) = (a, b) else {
            return Ok(a == b);
        };
        // Pairs already under comparison are assumed equal so cycles terminate.
        if x == y || !assumed.insert((*x, *y)) {
            return Ok(true);
        }
        let (left, right) = (self.get(*x)?, self.get(*y)?);
        if left.len() != right.len() {
            return Ok(false);
        }
        for (key, value) in left.iter() {
            let Some(other) = right.get(key) else {
                return Ok(false);
            };
            if !self.eq_values(value, other, assumed)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::value::{InteropHandle, InteropObject};

    #[derive(Debug)]
    struct Opaque;

    impl InteropObject for Opaque {
        fn type_name(&self) -> &'static str {
            "Opaque"
        }
    }

    fn structure(heap: &mut Heap, entries: &[(&str, VMObject)]) -> VMObject {
        let mut aggregate = Aggregate::default();
        for (key, value) in entries {
            aggregate.insert(VMObject::from(*key), value.clone());
        }
        VMObject::Struct(heap.alloc(aggregate).unwrap())
    }

    #[test]
    fn insert_replaces_existing_key() {
        let mut aggregate = Aggregate::default();
        aggregate.insert(VMObject::from("a"), VMObject::from(1i64));
        aggregate.insert(VMObject::from("a"), VMObject::from(2i64));
        assert_eq!(aggregate.len(), 1);
        assert_eq!(
            aggregate.get(&VMObject::from("a")),
            Some(&VMObject::from(2i64))
        );
        assert_eq!(aggregate.get(&VMObject::Bytes(b"a".to_vec())), None);
    }

    #[test]
    fn structs_compare_by_content() {
        let mut heap = Heap::new(16);
        let a = structure(&mut heap, &[("x", VMObject::from(1i64)), ("y", true.into())]);
        let b = structure(&mut heap, &[("y", true.into()), ("x", VMObject::from(1i64))]);
        let c = structure(&mut heap, &[("x", VMObject::from(2i64))]);
        assert!(heap.structural_eq(&a, &b).unwrap());
        assert!(!heap.structural_eq(&a, &c).unwrap());
        assert!(!heap.structural_eq(&a, &VMObject::from(1i64)).unwrap());
    }

    #[test]
    fn objects_compare_by_identity() {
        let mut heap = Heap::new(16);
        let a = VMObject::Object(heap.alloc(Aggregate::default()).unwrap());
        let b = VMObject::Object(heap.alloc(Aggregate::default()).unwrap());
        assert!(heap.structural_eq(&a, &a.clone()).unwrap());
        assert!(!heap.structural_eq(&a, &b).unwrap());
    }

    #[test]
    fn deep_copy_detaches_nested_structs() {
        let mut heap = Heap::new(16);
        let inner = structure(&mut heap, &[("v", VMObject::from(1i64))]);
        let outer = structure(&mut heap, &[("inner", inner.clone())]);

        let copy = heap.deep_copy(&outer).unwrap();
        assert_eq!(heap.len(), 4);
        assert!(heap.structural_eq(&outer, &copy).unwrap());

        let copied_inner = heap
            .get(copy.as_aggregate().unwrap())
            .unwrap()
            .get(&VMObject::from("inner"))
            .cloned()
            .unwrap();
        assert_ne!(copied_inner, inner);
        heap.get_mut(copied_inner.as_aggregate().unwrap())
            .unwrap()
            .insert(VMObject::from("v"), VMObject::from(9i64));
        assert!(!heap.structural_eq(&outer, &copy).unwrap());
    }

    #[test]
    fn cyclic_structs_copy_and_compare() {
        let mut heap = Heap::new(16);
        let cyclic = structure(&mut heap, &[]);
        let r = cyclic.as_aggregate().unwrap();
        heap.get_mut(r)
            .unwrap()
            .insert(VMObject::from("self"), cyclic.clone());

        assert_eq!(heap.footprint(&cyclic).unwrap(), 2);
        let copy = heap.deep_copy(&cyclic).unwrap();
        assert_eq!(heap.len(), 2);
        assert!(heap.structural_eq(&cyclic, &copy).unwrap());
    }

    #[test]
    fn interop_without_duplicate_cannot_be_copied() {
        let mut heap = Heap::new(4);
        let value = VMObject::Interop(InteropHandle::new(Opaque));
        assert!(matches!(
            heap.deep_copy(&value),
            Err(VMError::NotCopyable("Opaque"))
        ));
    }

    #[test]
    fn allocation_respects_limit() {
        let mut heap = Heap::new(1);
        heap.alloc(Aggregate::default()).unwrap();
        assert!(matches!(
            heap.alloc(Aggregate::default()),
            Err(VMError::HeapExhausted(1))
        ));
        heap.clear();
        assert!(heap.is_empty());
    }
}
