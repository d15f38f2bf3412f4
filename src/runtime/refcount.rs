//! Reference-count emulation
//!
//! Native code manages lifetimes through the `ob_refcnt` field of each block.
//! The bridge keeps that field authoritative: incref and decref edit it in
//! place, and a decref that reaches zero runs the deallocation protocol of the
//! block's type.
//!
//! Deallocation order:
//! - the type's `tp_dealloc`, if set (builtin types tear down, then call `tp_free`)
//! - otherwise the type's `tp_free`
//! - otherwise, or for a block with no type, [`Bridge::free_object`]
//!
//! A teardown that fails is reported to the caller of `decref`, and the
//! block is reclaimed if the teardown left it bound.
//!
//! Weakly created bindings (capsule proxies) are held strongly while the
//! refcount is above one, so the proxy cannot be collected while native code
//! still holds a reference of its own.

use log::{debug, trace, warn};

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::runtime::abi::{FnPtr, NativeArgs};
use crate::runtime::heap::HeapPtr;
use crate::runtime::layout::{self, OB_REFCNT, OB_TYPE, TP_DEALLOC, TP_FREE};
use crate::runtime::store::Strength;

impl Bridge {
    fn check_bound(&self, handle: HeapPtr) -> BridgeResult<()> {
        if self.has_handle(handle) {
            Ok(())
        } else {
            Err(BridgeError::UnknownHandle(handle))
        }
    }

    pub fn refcount(&self, handle: HeapPtr) -> BridgeResult<isize> {
        self.check_bound(handle)?;
        Ok(unsafe { layout::read_int(handle, &OB_REFCNT) })
    }

    pub fn incref(&self, handle: HeapPtr) -> BridgeResult<()> {
        if handle.is_null() {
            return Ok(());
        }
        self.check_bound(handle)?;
        let count = unsafe { layout::read_int(handle, &OB_REFCNT) } + 1;
        self.sync_strength(handle, count)?;
        unsafe { layout::write_int(handle, &OB_REFCNT, count) };
        trace!("incref {:?} -> {}", handle, count);
        Ok(())
    }

    pub fn decref(&self, handle: HeapPtr) -> BridgeResult<()> {
        if handle.is_null() {
            return Ok(());
        }
        self.check_bound(handle)?;
        let count = unsafe { layout::read_int(handle, &OB_REFCNT) };
        if count <= 0 {
            if self.config.strict_refcounts {
                return Err(BridgeError::BadRefCount(handle));
            }
            warn!("decref of {:?} with refcount {}; ignored", handle, count);
            return Ok(());
        }

        if count > 1 {
            self.sync_strength(handle, count - 1)?;
        }
        unsafe { layout::write_int(handle, &OB_REFCNT, count - 1) };
        trace!("decref {:?} -> {}", handle, count - 1);
        if count == 1 {
            self.deallocate(handle)?;
        }
        Ok(())
    }

    /// Pin a proxy binding while `count` includes references beyond the
    /// proxy's own; release it to the collector at one.
    fn sync_strength(&self, handle: HeapPtr, count: isize) -> BridgeResult<()> {
        let strength = if count > 1 {
            Strength::Strong
        } else {
            Strength::Weak
        };
        let held = self.store.borrow_mut().set_strength(handle, strength)?;
        drop(held);
        Ok(())
    }

    fn type_of(&self, handle: HeapPtr) -> HeapPtr {
        HeapPtr::from_usize(unsafe { layout::read_ptr(handle, &OB_TYPE) })
    }

    fn deallocate(&self, handle: HeapPtr) -> BridgeResult<()> {
        let type_ptr = self.type_of(handle);
        if type_ptr.is_null() {
            return self.free_object(handle);
        }
        let torn_down = match unsafe { layout::read_fn(type_ptr, &TP_DEALLOC) } {
            Some(dealloc) => self.call_slot(dealloc, handle),
            None => self.type_free(type_ptr, handle),
        };
        if let Err(e) = &torn_down {
            warn!("teardown of {:?} failed: {}", handle, e);
            if self.has_handle(handle) {
                if let Err(e) = self.free_object(handle) {
                    warn!("could not reclaim {:?}: {}", handle, e);
                }
            }
        }
        torn_down
    }

    /// Run a type slot on `handle`. Slots report failure through the
    /// last-error slot; that error becomes the result here.
    fn call_slot(&self, slot: FnPtr, handle: HeapPtr) -> BridgeResult<()> {
        let (called, raised) = self.call_native_isolated(slot, NativeArgs::Obj(handle));
        called?;
        raised.map_or(Ok(()), Err)
    }

    /// Hand `handle` to its type's `tp_free`, or free it directly.
    pub(crate) fn type_free(&self, type_ptr: HeapPtr, handle: HeapPtr) -> BridgeResult<()> {
        match unsafe { layout::read_fn(type_ptr, &TP_FREE) } {
            Some(free) => self.call_slot(free, handle),
            None => self.free_object(handle),
        }
    }

    /// Teardown for blocks of the base object type: nothing to release but
    /// the block itself.
    pub fn object_dealloc(&self, handle: HeapPtr) -> BridgeResult<()> {
        self.check_bound(handle)?;
        let type_ptr = self.type_of(handle);
        if type_ptr.is_null() {
            return self.free_object(handle);
        }
        self.type_free(type_ptr, handle)
    }

    /// Drop the binding for `handle` and give its block back to the allocator.
    pub fn free_object(&self, handle: HeapPtr) -> BridgeResult<()> {
        let released = self.store.borrow_mut().release(handle)?;
        drop(released);
        self.allocator.free(handle)?;
        debug!("freed {:?}", handle);
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Temporaries
    // ---------------------------------------------------------------------

    pub fn push_temp_frame(&self) {
        self.temps.borrow_mut().push(Vec::new());
    }

    /// Decref `handle` when the innermost temp frame closes.
    pub fn remember_temp(&self, handle: HeapPtr) {
        let mut temps = self.temps.borrow_mut();
        match temps.last_mut() {
            Some(frame) => frame.push(handle),
            None => temps.push(vec![handle]),
        }
    }

    /// Close the innermost frame, decref'ing everything it holds. Every
    /// handle is released even if an earlier one fails; the first failure is
    /// reported.
    pub fn pop_temp_frame(&self) -> BridgeResult<()> {
        let frame = self.temps.borrow_mut().pop().unwrap_or_default();
        let mut first_error = None;
        for handle in frame {
            if let Err(e) = self.decref(handle) {
                warn!("failed to release temporary {:?}: {}", handle, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn pending_temps(&self) -> usize {
        self.temps.borrow().iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use quickcheck::quickcheck;

    use crate::bridge::testing::*;
    use crate::config::BridgeConfig;
    use crate::error::BridgeError;
    use crate::runtime::abi::FnPtr;
    use crate::runtime::heap::HeapPtr;
    use crate::runtime::layout::{self, OB_REFCNT, OB_TYPE, TP_DEALLOC, TP_FREE, TYPE};
    use crate::runtime::stubs;
    use crate::vm::value::ObjRef;

    thread_local! {
        static DEALLOC_SAW: RefCell<Vec<(usize, isize)>> = const { RefCell::new(Vec::new()) };
    }

    // Reads its own block's header while running, then frees it.
    unsafe extern "C" fn inspecting_dealloc(obj: HeapPtr) {
        let refcnt = unsafe { layout::read_int(obj, &OB_REFCNT) };
        DEALLOC_SAW.with(|s| s.borrow_mut().push((obj.as_usize(), refcnt)));
        stubs::objbridge_object_free(obj);
    }

    // Frees its block, then frees it again.
    unsafe extern "C" fn double_free_dealloc(obj: HeapPtr) {
        stubs::objbridge_object_free(obj);
        stubs::objbridge_object_free(obj);
    }

    // Refuses to tear down and leaves the block alone.
    unsafe extern "C" fn refusing_dealloc(_obj: HeapPtr) {
        let msg = std::ffi::CString::new("not today").unwrap();
        stubs::objbridge_err_set_string(msg.as_ptr());
    }

    fn type_with_dealloc(
        bridge: &crate::bridge::Bridge,
        dealloc: crate::runtime::abi::DestructorFn,
    ) -> HeapPtr {
        let custom_type = bridge.alloc_block(TYPE.size).unwrap();
        unsafe {
            layout::write_int(custom_type, &OB_REFCNT, 1);
            layout::write_fn(custom_type, &TP_DEALLOC, Some(FnPtr::destructor(dealloc)));
        }
        custom_type
    }

    #[test]
    fn test_incref_decref_round_trip() {
        let (bridge, _vm) = bridge();
        let handle = bridge.store_str("x").unwrap();
        bridge.incref(handle).unwrap();
        bridge.incref(handle).unwrap();
        assert_eq!(bridge.refcount(handle).unwrap(), 3);
        bridge.decref(handle).unwrap();
        bridge.decref(handle).unwrap();
        assert_eq!(bridge.refcount(handle).unwrap(), 1);
    }

    #[test]
    fn test_null_is_ignored_and_unknown_fails() {
        let (bridge, _vm) = bridge();
        bridge.incref(HeapPtr::null()).unwrap();
        bridge.decref(HeapPtr::null()).unwrap();

        let stray = HeapPtr::from_usize(0x1234);
        assert!(matches!(bridge.incref(stray), Err(BridgeError::UnknownHandle(_))));
        assert!(matches!(bridge.decref(stray), Err(BridgeError::UnknownHandle(_))));
        assert!(bridge.refcount(stray).unwrap_err().is_lookup());
    }

    #[test]
    fn test_decref_to_zero_frees_block() {
        let (bridge, _vm, log) = recording_bridge();
        let obj = ObjRef::str("gone");
        let handle = bridge.store(&obj).unwrap();
        bridge.decref(handle).unwrap();

        assert!(!bridge.has_handle(handle));
        assert!(bridge.handle_of(&obj).is_none());
        assert_eq!(
            *log.borrow(),
            vec![HeapEvent::Alloc(handle), HeapEvent::Free(handle)]
        );
    }

    #[test]
    fn test_decref_at_zero_strict() {
        let (bridge, _vm) = bridge();
        let block = bridge.alloc_block(layout::OBJECT.size).unwrap();
        bridge
            .store_unmanaged(block, &ObjRef::none(), crate::runtime::store::Strength::Strong)
            .unwrap();

        assert!(matches!(bridge.decref(block), Err(BridgeError::BadRefCount(_))));
        assert_eq!(bridge.refcount(block).unwrap(), 0);
        assert!(bridge.has_handle(block));
    }

    #[test]
    fn test_decref_at_zero_lenient() {
        let config = BridgeConfig {
            strict_refcounts: false,
            ..BridgeConfig::default()
        };
        let (bridge, _vm) = bridge_with(config);
        let block = bridge.alloc_block(layout::OBJECT.size).unwrap();
        bridge
            .store_unmanaged(block, &ObjRef::none(), crate::runtime::store::Strength::Strong)
            .unwrap();

        bridge.decref(block).unwrap();
        assert_eq!(bridge.refcount(block).unwrap(), 0);
        assert!(bridge.has_handle(block));
    }

    #[test]
    fn test_custom_dealloc_sees_valid_block() {
        let (bridge, _vm, log) = recording_bridge();
        let custom_type = bridge.alloc_block(TYPE.size).unwrap();
        unsafe {
            layout::write_int(custom_type, &OB_REFCNT, 1);
            layout::write_fn(custom_type, &TP_DEALLOC, Some(FnPtr::destructor(inspecting_dealloc)));
        }

        let handle = bridge.store_int(99).unwrap();
        unsafe { layout::write_ptr(handle, &OB_TYPE, custom_type.as_usize()) };
        bridge.decref(handle).unwrap();

        DEALLOC_SAW.with(|s| assert_eq!(*s.borrow(), vec![(handle.as_usize(), 0)]));
        assert!(!bridge.has_handle(handle));
        assert_eq!(log.borrow().last(), Some(&HeapEvent::Free(handle)));
    }

    #[test]
    fn test_failing_free_is_reported() {
        let (bridge, _vm, log) = recording_bridge();
        let custom_type = type_with_dealloc(&bridge, double_free_dealloc);
        let handle = bridge.store_int(5).unwrap();
        unsafe { layout::write_ptr(handle, &OB_TYPE, custom_type.as_usize()) };

        assert!(bridge.decref(handle).unwrap_err().is_lookup());
        assert!(!bridge.has_handle(handle));
        assert_eq!(log.borrow().last(), Some(&HeapEvent::Free(handle)));
        assert!(!bridge.has_last_error());
    }

    #[test]
    fn test_refused_teardown_is_reported_and_reclaimed() {
        let (bridge, _vm, log) = recording_bridge();
        let custom_type = type_with_dealloc(&bridge, refusing_dealloc);
        let handle = bridge.store_int(6).unwrap();
        unsafe { layout::write_ptr(handle, &OB_TYPE, custom_type.as_usize()) };
        bridge.set_last_error(BridgeError::Argument("earlier".into()));

        match bridge.decref(handle) {
            Err(BridgeError::ForeignCallFailure(msg)) => assert!(msg.contains("not today")),
            other => panic!("expected foreign call failure, got {:?}", other),
        }
        assert!(!bridge.has_handle(handle));
        assert_eq!(log.borrow().last(), Some(&HeapEvent::Free(handle)));
        // the error parked before the decref is still there
        assert_eq!(
            bridge.take_last_error().map(|e| e.to_string()).as_deref(),
            Some("earlier")
        );
    }

    #[test]
    fn test_capsule_teardown_of_wrong_block_is_reported() {
        let (bridge, _vm) = bridge();
        let custom_type = type_with_dealloc(&bridge, stubs::objbridge_capsule_dealloc);
        let handle = bridge.store_int(7).unwrap();
        unsafe { layout::write_ptr(handle, &OB_TYPE, custom_type.as_usize()) };

        assert!(matches!(
            bridge.decref(handle),
            Err(BridgeError::TypeMismatch { expected: "capsule", .. })
        ));
        assert!(!bridge.has_handle(handle));
    }

    #[test]
    fn test_free_slot_used_when_dealloc_missing() {
        let (bridge, _vm) = bridge();
        let custom_type = bridge.alloc_block(TYPE.size).unwrap();
        unsafe {
            layout::write_fn(
                custom_type,
                &TP_FREE,
                Some(FnPtr::destructor(stubs::objbridge_object_free)),
            );
        }
        let handle = bridge.store_int(1).unwrap();
        unsafe { layout::write_ptr(handle, &OB_TYPE, custom_type.as_usize()) };

        bridge.decref(handle).unwrap();
        assert!(!bridge.has_handle(handle));
    }

    #[test]
    fn test_typeless_block_freed_directly() {
        let (bridge, _vm, log) = recording_bridge();
        let handle = bridge.store_int(1).unwrap();
        unsafe { layout::write_ptr(handle, &OB_TYPE, 0) };
        bridge.decref(handle).unwrap();
        assert_eq!(log.borrow().last(), Some(&HeapEvent::Free(handle)));
    }

    #[test]
    fn test_free_object_unknown_handle() {
        let (bridge, _vm) = bridge();
        assert!(bridge
            .free_object(HeapPtr::from_usize(0x40))
            .unwrap_err()
            .is_lookup());
    }

    #[test]
    fn test_temp_frames_nest() {
        let (bridge, _vm) = bridge();
        let outer = bridge.store_int(1).unwrap();
        let inner = bridge.store_int(2).unwrap();

        bridge.push_temp_frame();
        bridge.remember_temp(outer);
        bridge.push_temp_frame();
        bridge.remember_temp(inner);
        assert_eq!(bridge.pending_temps(), 2);

        bridge.pop_temp_frame().unwrap();
        assert!(!bridge.has_handle(inner));
        assert!(bridge.has_handle(outer));

        bridge.pop_temp_frame().unwrap();
        assert!(!bridge.has_handle(outer));
        assert_eq!(bridge.pending_temps(), 0);
    }

    #[test]
    fn test_temp_frame_releases_all_despite_failure() {
        let (bridge, _vm) = bridge();
        let good = bridge.store_int(1).unwrap();
        bridge.push_temp_frame();
        bridge.remember_temp(HeapPtr::from_usize(0x99));
        bridge.remember_temp(good);

        assert!(bridge.pop_temp_frame().unwrap_err().is_lookup());
        assert!(!bridge.has_handle(good));
    }

    quickcheck! {
        fn prop_balanced_refcount_traffic_is_neutral(extra: u8) -> bool {
            let (bridge, _vm) = bridge();
            let handle = bridge.store_str("prop").unwrap();
            let n = extra as usize;
            for _ in 0..n {
                bridge.incref(handle).unwrap();
            }
            let peak = bridge.refcount(handle).unwrap();
            for _ in 0..n {
                bridge.decref(handle).unwrap();
            }
            peak == 1 + n as isize && bridge.refcount(handle).unwrap() == 1
        }

        fn prop_store_retrieve_identity(values: Vec<i64>) -> bool {
            let (bridge, _vm) = bridge();
            let objects: Vec<ObjRef> = values.into_iter().map(ObjRef::int).collect();
            let handles: Vec<HeapPtr> = objects.iter().map(|o| bridge.store(o).unwrap()).collect();
            objects.iter().zip(&handles).all(|(obj, &h)| {
                bridge.retrieve(h).unwrap().is(obj) && bridge.handle_of(obj) == Some(h)
            })
        }
    }
}
