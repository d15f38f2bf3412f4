//! Bridge instance context
//!
//! A [`Bridge`] owns everything one host/native pairing needs: the allocator
//! for emulated blocks, the handle store, the module registry, the hosted
//! engine, the last-error slot native code reports through, and the builtin
//! type objects every stored block points at.
//!
//! Native code calls back into the bridge through the `extern "C"` stubs,
//! which carry no context argument. Before the bridge hands control to native
//! code it pushes itself on a per-thread stack ([`Bridge::enter`]); the stubs
//! find it with [`with_current`]. No `RefCell` borrow is held across a native
//! call, so reentrant stub calls are always safe.

use std::cell::{Cell, RefCell};
use std::ffi::CString;
use std::fmt;
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use log::{debug, info, trace, warn};

use crate::config::BridgeConfig;
use crate::error::{BridgeError, BridgeResult};
use crate::module::registry::ModuleRegistry;
use crate::runtime::abi::{DestructorFn, FnPtr, NativeArgs, NativeReturn};
use crate::runtime::heap::{self, Allocator, HeapPtr, HeapStats, NativeHeap};
use crate::runtime::layout::{
    self, CAPSULE, OB_REFCNT, OB_TYPE, OBJECT, TP_BASICSIZE, TP_DEALLOC, TP_FREE, TP_NAME, TYPE,
};
use crate::runtime::store::{ObjectStore, Strength};
use crate::runtime::stubs;
use crate::vm::HostEngine;
use crate::vm::gc::Finalization;
use crate::vm::value::ObjRef;

thread_local! {
    static CURRENT: RefCell<Vec<Rc<Bridge>>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` against the innermost entered bridge, if any.
pub fn with_current<R>(f: impl FnOnce(&Bridge) -> R) -> Option<R> {
    // Clone out so the stack is not borrowed while `f` runs
    let bridge = CURRENT.with(|stack| stack.borrow().last().cloned())?;
    Some(f(&bridge))
}

/// Keeps a bridge current for native callbacks until dropped.
pub struct EnterGuard {
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let popped = CURRENT.with(|stack| stack.borrow_mut().pop());
        drop(popped);
    }
}

/// Type objects the bridge allocates for its own blocks.
pub struct BuiltinTypes {
    /// Base type of every block created by `store`.
    pub object: HeapPtr,
    pub capsule: HeapPtr,
    // tp_name points into these
    names: Vec<CString>,
}

impl BuiltinTypes {
    fn create(allocator: &dyn Allocator) -> BridgeResult<Self> {
        let mut names = Vec::new();
        let object = new_type(
            allocator,
            &mut names,
            "object",
            OBJECT.size,
            stubs::objbridge_object_dealloc,
        )?;
        let capsule = match new_type(
            allocator,
            &mut names,
            "capsule",
            CAPSULE.size,
            stubs::objbridge_capsule_dealloc,
        ) {
            Ok(capsule) => capsule,
            Err(e) => {
                let _ = allocator.free(object);
                return Err(e);
            }
        };
        Ok(Self {
            object,
            capsule,
            names,
        })
    }

    pub fn handles(&self) -> [HeapPtr; 2] {
        [self.object, self.capsule]
    }

    pub fn name_of(&self, type_ptr: HeapPtr) -> Option<&str> {
        let index = self.handles().iter().position(|&t| t == type_ptr)?;
        self.names.get(index).and_then(|n| n.to_str().ok())
    }
}

fn new_type(
    allocator: &dyn Allocator,
    names: &mut Vec<CString>,
    name: &str,
    basicsize: usize,
    dealloc: DestructorFn,
) -> BridgeResult<HeapPtr> {
    let name = CString::new(name).map_err(|e| BridgeError::Argument(e.to_string()))?;
    let ptr = allocator.alloc(TYPE.size)?;
    unsafe {
        heap::zero(ptr, TYPE.size);
        layout::write_int(ptr, &OB_REFCNT, 1);
        layout::write_ptr(ptr, &TP_NAME, name.as_ptr() as usize);
        layout::write_int(ptr, &TP_BASICSIZE, basicsize as isize);
        layout::write_fn(ptr, &TP_DEALLOC, Some(FnPtr::destructor(dealloc)));
        layout::write_fn(
            ptr,
            &TP_FREE,
            Some(FnPtr::destructor(stubs::objbridge_object_free)),
        );
    }
    // The CString's buffer stays put when the CString itself moves
    names.push(name);
    Ok(ptr)
}

pub struct Bridge {
    pub(crate) this: Weak<Bridge>,
    pub(crate) config: BridgeConfig,
    pub(crate) allocator: Box<dyn Allocator>,
    pub(crate) engine: Rc<dyn HostEngine>,
    pub(crate) store: RefCell<ObjectStore>,
    pub(crate) modules: ModuleRegistry,
    pub(crate) temps: RefCell<Vec<Vec<HeapPtr>>>,
    pub(crate) last_error: RefCell<Option<BridgeError>>,
    pub(crate) alive: Cell<bool>,
    pub(crate) types: BuiltinTypes,
}

impl Bridge {
    /// Bridge over a fresh [`NativeHeap`] sized by `config.heap`.
    pub fn new(config: BridgeConfig, engine: Rc<dyn HostEngine>) -> BridgeResult<Rc<Self>> {
        let heap = NativeHeap::with_config(config.heap.clone());
        Self::with_allocator(config, engine, Box::new(heap))
    }

    pub fn with_allocator(
        config: BridgeConfig,
        engine: Rc<dyn HostEngine>,
        allocator: Box<dyn Allocator>,
    ) -> BridgeResult<Rc<Self>> {
        let types = BuiltinTypes::create(&*allocator)?;
        debug!(
            "bridge created (object type {:?}, capsule type {:?})",
            types.object, types.capsule
        );
        Ok(Rc::new_cyclic(|this| Self {
            this: this.clone(),
            config,
            allocator,
            engine,
            store: RefCell::new(ObjectStore::new()),
            modules: ModuleRegistry::new(),
            temps: RefCell::new(Vec::new()),
            last_error: RefCell::new(None),
            alive: Cell::new(true),
            types,
        }))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn engine(&self) -> &Rc<dyn HostEngine> {
        &self.engine
    }

    pub fn modules(&self) -> &ModuleRegistry {
        &self.modules
    }

    pub fn types(&self) -> &BuiltinTypes {
        &self.types
    }

    pub fn allocator(&self) -> &dyn Allocator {
        &*self.allocator
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.allocator.stats()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.get()
    }

    /// Mark the bridge dead. Later finalizations become no-ops and pending
    /// temporaries are dropped without being decref'd. Idempotent.
    pub fn dispose(&self) {
        if !self.alive.replace(false) {
            return;
        }
        let pending: usize = self.temps.borrow_mut().drain(..).map(|f| f.len()).sum();
        info!(
            "bridge disposed ({} bindings, {} modules, {} pending temporaries dropped)",
            self.store.borrow().len(),
            self.modules.len(),
            pending
        );
    }

    /// Make this bridge the one native callbacks see until the guard drops.
    pub fn enter(&self) -> BridgeResult<EnterGuard> {
        let this = self.this.upgrade().ok_or(BridgeError::Disposed)?;
        CURRENT.with(|stack| stack.borrow_mut().push(this));
        Ok(EnterGuard {
            _not_send: PhantomData,
        })
    }

    /// Call a native function with this bridge current.
    pub(crate) fn call_native(&self, f: FnPtr, args: NativeArgs) -> BridgeResult<NativeReturn> {
        let _guard = self.enter()?;
        trace!("calling {:?} with {:?}", f, args);
        unsafe { f.call(args) }
    }

    /// [`Bridge::call_native`] with the last-error slot set aside: an error
    /// parked before the call is still parked afterwards, and whatever the
    /// callee parks is handed back instead.
    pub(crate) fn call_native_isolated(
        &self,
        f: FnPtr,
        args: NativeArgs,
    ) -> (BridgeResult<NativeReturn>, Option<BridgeError>) {
        let outer = self.take_last_error();
        let called = self.call_native(f, args);
        let raised = self.take_last_error();
        if let Some(outer) = outer {
            self.set_last_error(outer);
        }
        (called, raised)
    }

    // ---------------------------------------------------------------------
    // Last-error slot
    // ---------------------------------------------------------------------

    /// Park an error for native code or a later Rust caller to pick up.
    /// A newer error replaces an older one.
    pub fn set_last_error(&self, error: BridgeError) {
        debug!("parking error: {}", error);
        let old = self.last_error.borrow_mut().replace(error);
        drop(old);
    }

    pub fn take_last_error(&self) -> Option<BridgeError> {
        self.last_error.borrow_mut().take()
    }

    pub fn has_last_error(&self) -> bool {
        self.last_error.borrow().is_some()
    }

    // ---------------------------------------------------------------------
    // Object store
    // ---------------------------------------------------------------------

    /// A zeroed block from the bridge's allocator.
    pub(crate) fn alloc_block(&self, size: usize) -> BridgeResult<HeapPtr> {
        let ptr = self.allocator.alloc(size)?;
        unsafe { heap::zero(ptr, size) };
        Ok(ptr)
    }

    /// Handle for `obj`, creating a base-type block with refcount 1 if it has
    /// none. An object that is already bound gets its existing handle back
    /// with one more reference.
    pub fn store(&self, obj: &ObjRef) -> BridgeResult<HeapPtr> {
        let existing = self.store.borrow().handle_of(obj);
        if let Some(handle) = existing {
            self.incref(handle)?;
            return Ok(handle);
        }

        let handle = self.alloc_block(OBJECT.size)?;
        unsafe {
            layout::write_int(handle, &OB_REFCNT, 1);
            layout::write_ptr(handle, &OB_TYPE, self.types.object.as_usize());
        }
        let bound = self.store.borrow_mut().bind(handle, obj, Strength::Strong);
        if let Err(e) = bound {
            let _ = self.allocator.free(handle);
            return Err(e);
        }
        debug!("bound {} object to {:?}", obj.kind_name(), handle);
        Ok(handle)
    }

    /// Bind a block allocated elsewhere. Its header is left as the caller
    /// wrote it.
    pub fn store_unmanaged(
        &self,
        handle: HeapPtr,
        obj: &ObjRef,
        strength: Strength,
    ) -> BridgeResult<()> {
        self.store.borrow_mut().bind(handle, obj, strength)?;
        debug!(
            "bound {} object to unmanaged {:?} ({:?})",
            obj.kind_name(),
            handle,
            strength
        );
        Ok(())
    }

    pub fn retrieve(&self, handle: HeapPtr) -> BridgeResult<ObjRef> {
        self.store.borrow().retrieve(handle)
    }

    pub fn has_handle(&self, handle: HeapPtr) -> bool {
        self.store.borrow().has_handle(handle)
    }

    pub fn handle_of(&self, obj: &ObjRef) -> Option<HeapPtr> {
        self.store.borrow().handle_of(obj)
    }

    pub fn bound_count(&self) -> usize {
        self.store.borrow().len()
    }

    pub fn store_int(&self, value: i64) -> BridgeResult<HeapPtr> {
        self.store(&ObjRef::int(value))
    }

    pub fn store_float(&self, value: f64) -> BridgeResult<HeapPtr> {
        self.store(&ObjRef::float(value))
    }

    pub fn store_str(&self, value: &str) -> BridgeResult<HeapPtr> {
        self.store(&ObjRef::str(value))
    }

    // ---------------------------------------------------------------------
    // Finalization
    // ---------------------------------------------------------------------

    /// Run the engine's collector and route every notification through
    /// [`Bridge::finalize`]. Returns the number of notifications.
    pub fn collect_garbage(&self) -> usize {
        let notes = self.engine.collect();
        let count = notes.len();
        for note in notes {
            self.finalize(note);
        }
        count
    }

    /// Release the reference a collected proxy held. Does nothing once the
    /// bridge is disposed.
    pub fn finalize(&self, note: Finalization) {
        if !self.alive.get() {
            debug!(
                "bridge disposed; dropping finalization of {:?}",
                note.handle
            );
            return;
        }
        if let Err(e) = self.decref(note.handle) {
            warn!("finalization of {:?} failed: {}", note.handle, e);
            self.set_last_error(e);
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.dispose();
        // Bindings go before the blocks they describe
        let bindings = std::mem::take(self.store.get_mut());
        drop(bindings);
        for ty in self.types.handles() {
            if let Err(e) = self.allocator.free(ty) {
                warn!("failed to free builtin type {:?}: {}", ty, e);
            }
        }
        info!("bridge torn down");
    }
}

impl fmt::Debug for Bridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bridge")
            .field("alive", &self.alive.get())
            .field("bindings", &self.store.borrow().len())
            .field("modules", &self.modules.names())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::vm::Vm;

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum HeapEvent {
        Alloc(HeapPtr),
        Free(HeapPtr),
    }

    /// A [`NativeHeap`] that logs every allocation and free.
    pub struct RecordingAllocator {
        heap: NativeHeap,
        log: Rc<RefCell<Vec<HeapEvent>>>,
    }

    impl RecordingAllocator {
        pub fn new() -> (Self, Rc<RefCell<Vec<HeapEvent>>>) {
            let log = Rc::new(RefCell::new(Vec::new()));
            let heap = Self {
                heap: NativeHeap::new(),
                log: Rc::clone(&log),
            };
            (heap, log)
        }
    }

    impl Allocator for RecordingAllocator {
        fn alloc(&self, size: usize) -> BridgeResult<HeapPtr> {
            let ptr = self.heap.alloc(size)?;
            self.log.borrow_mut().push(HeapEvent::Alloc(ptr));
            Ok(ptr)
        }

        fn free(&self, ptr: HeapPtr) -> BridgeResult<()> {
            self.heap.free(ptr)?;
            self.log.borrow_mut().push(HeapEvent::Free(ptr));
            Ok(())
        }

        fn stats(&self) -> HeapStats {
            self.heap.stats()
        }
    }

    pub fn bridge() -> (Rc<Bridge>, Rc<Vm>) {
        bridge_with(BridgeConfig::default())
    }

    pub fn bridge_with(config: BridgeConfig) -> (Rc<Bridge>, Rc<Vm>) {
        let vm = Rc::new(Vm::new());
        let bridge = Bridge::new(config, vm.clone()).unwrap();
        (bridge, vm)
    }

    pub fn recording_bridge() -> (Rc<Bridge>, Rc<Vm>, Rc<RefCell<Vec<HeapEvent>>>) {
        let vm = Rc::new(Vm::new());
        let (heap, log) = RecordingAllocator::new();
        let bridge =
            Bridge::with_allocator(BridgeConfig::default(), vm.clone(), Box::new(heap)).unwrap();
        log.borrow_mut().clear();
        (bridge, vm, log)
    }
}
