//! Foreign capsules
//!
//! A capsule wraps an opaque native pointer plus an optional teardown
//! callback. The hosted side sees a [`CapsuleProxy`] registered with the
//! engine's collector, so its collection releases the reference it held on
//! the native block.
//!
//! A fresh capsule has refcount 2: one reference belongs to the proxy, the
//! other to the native caller. The binding holds the proxy strongly until
//! native code is down to the proxy's own reference; only then can the
//! collector take it.

use std::ffi::c_void;

use log::{debug, warn};

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::runtime::abi::{FnPtr, FreeFn, NativeArgs};
use crate::runtime::heap::HeapPtr;
use crate::runtime::layout::{self, CAPSULE, CAPSULE_DATA, CAPSULE_DESTRUCTOR, OB_REFCNT, OB_TYPE};
use crate::runtime::store::Strength;
use crate::vm::value::ObjRef;

/// Hosted-side stand-in for a capsule block.
#[derive(Debug)]
pub struct CapsuleProxy {
    handle: HeapPtr,
}

impl CapsuleProxy {
    pub fn handle(&self) -> HeapPtr {
        self.handle
    }
}

impl Bridge {
    pub fn capsule_from_pointer(
        &self,
        data: *mut c_void,
        destructor: Option<FreeFn>,
    ) -> BridgeResult<HeapPtr> {
        let handle = self.alloc_block(CAPSULE.size)?;
        unsafe {
            layout::write_int(handle, &OB_REFCNT, 1);
            layout::write_ptr(handle, &OB_TYPE, self.types.capsule.as_usize());
            layout::write_ptr(handle, &CAPSULE_DATA, data as usize);
            layout::write_fn(handle, &CAPSULE_DESTRUCTOR, destructor.map(FnPtr::freefunc));
        }

        let proxy = ObjRef::foreign(CapsuleProxy { handle });
        if let Err(e) = self.store_unmanaged(handle, &proxy, Strength::Weak) {
            let _ = self.allocator.free(handle);
            return Err(e);
        }
        self.engine.track_finalizable(&proxy, handle);
        drop(proxy);

        self.incref(handle)?;
        debug!("capsule {:?} wraps {:p}", handle, data);
        Ok(handle)
    }

    fn check_capsule(&self, handle: HeapPtr) -> BridgeResult<()> {
        if !self.has_handle(handle) {
            return Err(BridgeError::UnknownHandle(handle));
        }
        let type_ptr = unsafe { layout::read_ptr(handle, &OB_TYPE) };
        if type_ptr != self.types.capsule.as_usize() {
            return Err(BridgeError::TypeMismatch {
                handle,
                expected: "capsule",
            });
        }
        Ok(())
    }

    pub fn capsule_as_pointer(&self, handle: HeapPtr) -> BridgeResult<*mut c_void> {
        self.check_capsule(handle)?;
        Ok(unsafe { layout::read_ptr(handle, &CAPSULE_DATA) } as *mut c_void)
    }

    /// Teardown for capsule blocks: run the destructor on the data pointer,
    /// then release the block through the capsule type's `tp_free`. A
    /// failing destructor does not stop the free; its error is returned
    /// afterwards.
    pub fn capsule_dealloc(&self, handle: HeapPtr) -> BridgeResult<()> {
        self.check_capsule(handle)?;

        let destructor = unsafe { layout::read_fn(handle, &CAPSULE_DESTRUCTOR) };
        let failure = destructor.and_then(|destructor| {
            let data = unsafe { layout::read_ptr(handle, &CAPSULE_DATA) } as *mut c_void;
            match self.call_native_isolated(destructor, NativeArgs::Ptr(data)) {
                (Ok(_), raised) => raised,
                (Err(e), _) => Some(e),
            }
        });

        self.type_free(self.types.capsule, handle)?;
        match failure {
            Some(e) => {
                warn!("capsule destructor for {:?} failed: {}", handle, e);
                let cause = match e {
                    BridgeError::ForeignCallFailure(msg) => msg,
                    other => other.to_string(),
                };
                Err(BridgeError::ForeignCallFailure(cause))
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::ffi::{CString, c_void};

    use super::*;
    use crate::bridge::testing::*;
    use crate::runtime::stubs;

    thread_local! {
        static DESTROYED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
    }

    unsafe extern "C" fn record_destroy(data: *mut c_void) {
        DESTROYED.with(|d| d.borrow_mut().push(data as usize));
    }

    unsafe extern "C" fn failing_destroy(_data: *mut c_void) {
        let msg = CString::new("teardown refused").unwrap();
        stubs::objbridge_err_set_string(msg.as_ptr());
    }

    fn destroyed() -> Vec<usize> {
        DESTROYED.with(|d| d.borrow().clone())
    }

    #[test]
    fn test_fresh_capsule_has_two_references() {
        let (bridge, _vm) = bridge();
        let handle = bridge
            .capsule_from_pointer(0x1234 as *mut c_void, None)
            .unwrap();

        assert_eq!(bridge.refcount(handle).unwrap(), 2);
        assert_eq!(bridge.capsule_as_pointer(handle).unwrap() as usize, 0x1234);
        let proxy = bridge.retrieve(handle).unwrap();
        assert_eq!(
            proxy.downcast_ref::<CapsuleProxy>().map(CapsuleProxy::handle),
            Some(handle)
        );
    }

    #[test]
    fn test_as_pointer_type_checks() {
        let (bridge, _vm) = bridge();
        let not_capsule = bridge.store_int(3).unwrap();
        assert!(matches!(
            bridge.capsule_as_pointer(not_capsule),
            Err(BridgeError::TypeMismatch { expected: "capsule", .. })
        ));
        assert!(
            bridge
                .capsule_as_pointer(HeapPtr::from_usize(0x10))
                .unwrap_err()
                .is_lookup()
        );
    }

    #[test]
    fn test_destructor_runs_once_after_both_releases() {
        let (bridge, vm, log) = recording_bridge();
        let data = 0xD00D as *mut c_void;
        let handle = bridge
            .capsule_from_pointer(data, Some(record_destroy))
            .unwrap();

        // caller's reference
        bridge.decref(handle).unwrap();
        assert!(destroyed().is_empty());

        // proxy's reference
        assert_eq!(bridge.collect_garbage(), 1);
        assert_eq!(destroyed(), vec![0xD00D]);
        assert!(!bridge.has_handle(handle));
        assert_eq!(log.borrow().last(), Some(&HeapEvent::Free(handle)));

        assert_eq!(bridge.collect_garbage(), 0);
        assert_eq!(vm.collector().tracked(), 0);
        assert_eq!(destroyed(), vec![0xD00D]);
    }

    #[test]
    fn test_capsule_held_by_native_code_survives_collection() {
        let (bridge, _vm) = bridge();
        let module = bridge.module_new("holder").unwrap();
        let handle = bridge
            .capsule_from_pointer(0x42 as *mut c_void, Some(record_destroy))
            .unwrap();

        assert_eq!(bridge.collect_garbage(), 0);
        assert_eq!(bridge.refcount(handle).unwrap(), 2);
        assert!(bridge.retrieve(handle).is_ok());

        bridge.module_add_object(module, "cap", handle).unwrap();
        assert_eq!(bridge.refcount(handle).unwrap(), 1);
        let holder = bridge.retrieve(module).unwrap();
        let attr = holder.as_module().unwrap().get_attr("cap").unwrap();
        assert!(attr.is(&bridge.retrieve(handle).unwrap()));
        assert!(!destroyed().contains(&0x42));
    }

    #[test]
    fn test_proxy_collectable_only_at_own_reference() {
        let (bridge, _vm) = bridge();
        let handle = bridge
            .capsule_from_pointer(0x77 as *mut c_void, Some(record_destroy))
            .unwrap();
        bridge.incref(handle).unwrap();

        bridge.decref(handle).unwrap();
        assert_eq!(bridge.collect_garbage(), 0);
        bridge.decref(handle).unwrap();
        assert_eq!(bridge.refcount(handle).unwrap(), 1);

        // a new native reference pins the proxy again
        bridge.incref(handle).unwrap();
        assert_eq!(bridge.collect_garbage(), 0);
        bridge.decref(handle).unwrap();

        assert_eq!(bridge.collect_garbage(), 1);
        assert!(destroyed().contains(&0x77));
        assert!(!bridge.has_handle(handle));
    }

    #[test]
    fn test_live_proxy_is_not_finalized() {
        let (bridge, _vm) = bridge();
        let handle = bridge
            .capsule_from_pointer(0x5 as *mut c_void, None)
            .unwrap();
        let proxy = bridge.retrieve(handle).unwrap();
        bridge.decref(handle).unwrap();

        assert_eq!(bridge.collect_garbage(), 0);
        assert_eq!(bridge.refcount(handle).unwrap(), 1);
        drop(proxy);
        assert_eq!(bridge.collect_garbage(), 1);
        assert!(!bridge.has_handle(handle));
    }

    #[test]
    fn test_no_decref_after_dispose() {
        let (bridge, _vm) = bridge();
        let handle = bridge
            .capsule_from_pointer(0x6 as *mut c_void, Some(record_destroy))
            .unwrap();
        bridge.decref(handle).unwrap();
        bridge.dispose();

        assert_eq!(bridge.collect_garbage(), 1);
        assert_eq!(bridge.refcount(handle).unwrap(), 1);
        assert!(!destroyed().contains(&0x6));
    }

    #[test]
    fn test_failing_destructor_still_frees() {
        let (bridge, _vm) = bridge();
        let handle = bridge
            .capsule_from_pointer(0x8 as *mut c_void, Some(failing_destroy))
            .unwrap();
        bridge.decref(handle).unwrap();
        bridge.collect_garbage();

        assert!(!bridge.has_handle(handle));
        match bridge.take_last_error() {
            Some(BridgeError::ForeignCallFailure(msg)) => assert!(msg.contains("teardown refused")),
            other => panic!("expected foreign call failure, got {:?}", other),
        }
    }

    #[test]
    fn test_decref_reports_failing_destructor() {
        let (bridge, _vm, log) = recording_bridge();
        let handle = bridge
            .capsule_from_pointer(0x9 as *mut c_void, Some(failing_destroy))
            .unwrap();
        bridge.decref(handle).unwrap();

        // drop the proxy's reference directly instead of through the collector
        let err = bridge.decref(handle).unwrap_err();
        assert!(matches!(err, BridgeError::ForeignCallFailure(ref msg) if msg.contains("teardown refused")));
        assert!(!bridge.has_handle(handle));
        assert_eq!(log.borrow().last(), Some(&HeapEvent::Free(handle)));
        assert!(!bridge.has_last_error());
    }

    #[test]
    fn test_dealloc_rejects_non_capsule() {
        let (bridge, _vm) = bridge();
        let handle = bridge.store_int(4).unwrap();
        assert!(matches!(
            bridge.capsule_dealloc(handle),
            Err(BridgeError::TypeMismatch { expected: "capsule", .. })
        ));
        assert!(bridge.has_handle(handle));
    }
}
