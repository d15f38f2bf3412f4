//! Native object store
//!
//! Bidirectional map between native handles and hosted objects. Each live
//! handle is bound to exactly one object and each object to at most one
//! handle; the reverse direction is keyed by object identity, never equality.

use std::collections::HashMap;

use crate::error::{BridgeError, BridgeResult};
use crate::runtime::heap::HeapPtr;
use crate::vm::value::{ObjRef, WeakRef};

/// How a binding holds its object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strength {
    /// The store keeps the object alive until the binding is released.
    Strong,
    /// The hosted side owns the object; the binding does not keep it alive.
    Weak,
}

enum Target {
    Strong(ObjRef),
    Weak(WeakRef),
}

struct Slot {
    target: Target,
    id: usize,
    // bound weakly at creation; its strength follows the native refcount
    proxy: bool,
}

impl Slot {
    fn object(&self) -> Option<ObjRef> {
        match &self.target {
            Target::Strong(obj) => Some(obj.clone()),
            Target::Weak(weak) => weak.upgrade(),
        }
    }
}

#[derive(Default)]
pub struct ObjectStore {
    slots: HashMap<HeapPtr, Slot>,
    ids: HashMap<usize, HeapPtr>,
}

impl ObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, handle: HeapPtr, obj: &ObjRef, strength: Strength) -> BridgeResult<()> {
        if handle.is_null() {
            return Err(BridgeError::UnknownHandle(handle));
        }
        if self.slots.contains_key(&handle) {
            return Err(BridgeError::AlreadyBound(handle));
        }
        if let Some(existing) = self.handle_of(obj) {
            return Err(BridgeError::AlreadyBound(existing));
        }

        let target = match strength {
            Strength::Strong => Target::Strong(obj.clone()),
            Strength::Weak => Target::Weak(obj.downgrade()),
        };
        let slot = Slot {
            target,
            id: obj.id(),
            proxy: strength == Strength::Weak,
        };
        self.slots.insert(handle, slot);
        self.ids.insert(obj.id(), handle);
        Ok(())
    }

    /// The object bound to `handle`. A weak binding whose object has been
    /// collected counts as unknown.
    pub fn retrieve(&self, handle: HeapPtr) -> BridgeResult<ObjRef> {
        self.slots
            .get(&handle)
            .and_then(Slot::object)
            .ok_or(BridgeError::UnknownHandle(handle))
    }

    pub fn handle_of(&self, obj: &ObjRef) -> Option<HeapPtr> {
        let handle = *self.ids.get(&obj.id())?;
        let bound = self.slots.get(&handle)?.object()?;
        bound.is(obj).then_some(handle)
    }

    /// Whether `handle` is bound, even if its weakly held object is gone.
    pub fn has_handle(&self, handle: HeapPtr) -> bool {
        self.slots.contains_key(&handle)
    }

    /// Remove the binding for `handle`. The strongly held object, if any, is
    /// handed back so the caller decides when it is dropped.
    pub fn release(&mut self, handle: HeapPtr) -> BridgeResult<Option<ObjRef>> {
        let slot = self
            .slots
            .remove(&handle)
            .ok_or(BridgeError::UnknownHandle(handle))?;
        if self.ids.get(&slot.id) == Some(&handle) {
            self.ids.remove(&slot.id);
        }
        Ok(match slot.target {
            Target::Strong(obj) => Some(obj),
            Target::Weak(_) => None,
        })
    }

    /// Switch a weakly created binding between holding its object strongly
    /// and weakly. Bindings created strong are never weakened. The object is
    /// handed back so the caller decides when the dropped reference goes.
    pub fn set_strength(
        &mut self,
        handle: HeapPtr,
        strength: Strength,
    ) -> BridgeResult<Option<ObjRef>> {
        let slot = self
            .slots
            .get_mut(&handle)
            .ok_or(BridgeError::UnknownHandle(handle))?;
        if !slot.proxy {
            return Ok(None);
        }
        let obj = slot.object().ok_or(BridgeError::UnknownHandle(handle))?;
        let previous = match strength {
            Strength::Strong => std::mem::replace(&mut slot.target, Target::Strong(obj.clone())),
            Strength::Weak => std::mem::replace(&mut slot.target, Target::Weak(obj.downgrade())),
        };
        drop(previous);
        Ok(Some(obj))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(addr: usize) -> HeapPtr {
        HeapPtr::from_usize(addr)
    }

    #[test]
    fn test_bind_retrieve_release() {
        let mut store = ObjectStore::new();
        let obj = ObjRef::str("ewok");
        store.bind(h(0x10), &obj, Strength::Strong).unwrap();

        assert!(store.retrieve(h(0x10)).unwrap().is(&obj));
        assert_eq!(store.handle_of(&obj), Some(h(0x10)));
        assert!(store.has_handle(h(0x10)));

        let released = store.release(h(0x10)).unwrap();
        assert!(released.unwrap().is(&obj));
        assert!(store.retrieve(h(0x10)).is_err());
        assert_eq!(store.handle_of(&obj), None);
        assert!(store.is_empty());
    }

    #[test]
    fn test_binding_is_bijective() {
        let mut store = ObjectStore::new();
        let a = ObjRef::int(1);
        let b = ObjRef::int(1);
        store.bind(h(0x10), &a, Strength::Strong).unwrap();

        assert!(matches!(
            store.bind(h(0x10), &b, Strength::Strong),
            Err(BridgeError::AlreadyBound(_))
        ));
        assert!(matches!(
            store.bind(h(0x20), &a, Strength::Strong),
            Err(BridgeError::AlreadyBound(p)) if p == h(0x10)
        ));
        // equal but distinct objects bind separately
        store.bind(h(0x20), &b, Strength::Strong).unwrap();
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_weak_binding_outlived_by_handle() {
        let mut store = ObjectStore::new();
        let obj = ObjRef::str("proxy");
        store.bind(h(0x30), &obj, Strength::Weak).unwrap();
        assert!(store.retrieve(h(0x30)).is_ok());

        drop(obj);
        assert!(store.has_handle(h(0x30)));
        assert!(matches!(
            store.retrieve(h(0x30)),
            Err(BridgeError::UnknownHandle(_))
        ));
        assert_eq!(store.release(h(0x30)).unwrap().map(|o| o.id()), None);
    }

    #[test]
    fn test_weak_binding_can_be_pinned() {
        let mut store = ObjectStore::new();
        let obj = ObjRef::str("proxy");
        let weak = obj.downgrade();
        store.bind(h(0x50), &obj, Strength::Weak).unwrap();

        store.set_strength(h(0x50), Strength::Strong).unwrap();
        drop(obj);
        assert!(store.retrieve(h(0x50)).is_ok());

        let held = store.set_strength(h(0x50), Strength::Weak).unwrap();
        assert!(held.is_some());
        drop(held);
        assert!(weak.upgrade().is_none());
        assert!(store.retrieve(h(0x50)).unwrap_err().is_lookup());
        assert!(store.set_strength(h(0x50), Strength::Strong).unwrap_err().is_lookup());
    }

    #[test]
    fn test_strong_binding_is_never_weakened() {
        let mut store = ObjectStore::new();
        store.bind(h(0x60), &ObjRef::int(3), Strength::Strong).unwrap();
        assert!(store.set_strength(h(0x60), Strength::Weak).unwrap().is_none());
        assert_eq!(store.retrieve(h(0x60)).unwrap().as_int(), Some(3));
    }

    #[test]
    fn test_null_and_unknown_handles() {
        let mut store = ObjectStore::new();
        assert!(store
            .bind(HeapPtr::null(), &ObjRef::none(), Strength::Strong)
            .is_err());
        assert!(store.retrieve(HeapPtr::null()).unwrap_err().is_lookup());
        assert!(store.release(h(0x40)).unwrap_err().is_lookup());
    }
}
