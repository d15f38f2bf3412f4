//! Bridge entry points callable from native code
//!
//! These extern "C" functions are what unmodified native extensions link
//! against. None of them takes a context argument: each one resolves the
//! bridge that is currently handing control to native code (see
//! [`crate::bridge::with_current`]).
//!
//! The calling convention is:
//! - Objects travel as `HeapPtr` handles; null means "no object"
//! - Failure is a sentinel: null handle, null data pointer or `-1`
//! - The reason for a failure is parked in the bridge's last-error slot,
//!   where `objbridge_err_occurred` sees it
//! - With no bridge current, every entry point returns its sentinel

use std::ffi::{c_char, c_double, c_int, c_long, c_void};

use super::abi::FreeFn;
use super::heap::HeapPtr;
use super::layout::{MethodDef, read_cstr};
use crate::bridge::{Bridge, with_current};
use crate::error::{BridgeError, BridgeResult, STATUS_FAILED, STATUS_OK};

/// Run `f` on the current bridge, parking its error and returning `fail`.
fn with_bridge<T: Copy>(fail: T, f: impl FnOnce(&Bridge) -> BridgeResult<T>) -> T {
    with_current(|bridge| match f(bridge) {
        Ok(value) => value,
        Err(e) => {
            bridge.set_last_error(e);
            fail
        }
    })
    .unwrap_or(fail)
}

fn status(f: impl FnOnce(&Bridge) -> BridgeResult<()>) -> c_int {
    with_bridge(STATUS_FAILED, |bridge| f(bridge).map(|()| STATUS_OK))
}

fn required_str(ptr: *const c_char, what: &str) -> BridgeResult<String> {
    unsafe { read_cstr(ptr) }.ok_or_else(|| BridgeError::Argument(format!("{} must not be NULL", what)))
}

// =========================================================================
// Reference counting
// =========================================================================

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_incref(obj: HeapPtr) {
    with_bridge((), |bridge| bridge.incref(obj))
}

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_decref(obj: HeapPtr) {
    with_bridge((), |bridge| bridge.decref(obj))
}

/// Current refcount of `obj`, or -1.
#[unsafe(no_mangle)]
pub extern "C" fn objbridge_refcount(obj: HeapPtr) -> isize {
    with_bridge(-1, |bridge| bridge.refcount(obj))
}

// =========================================================================
// Object construction
// =========================================================================

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_store_long(value: c_long) -> HeapPtr {
    with_bridge(HeapPtr::null(), |bridge| bridge.store_int(value as i64))
}

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_store_double(value: c_double) -> HeapPtr {
    with_bridge(HeapPtr::null(), |bridge| bridge.store_float(value))
}

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_store_string(value: *const c_char) -> HeapPtr {
    with_bridge(HeapPtr::null(), |bridge| {
        bridge.store_str(&required_str(value, "string")?)
    })
}

// =========================================================================
// Object access
// =========================================================================

/// Integer value of `obj`. Returns -1 with an error parked on failure, so
/// callers check `objbridge_err_occurred` when they see -1.
#[unsafe(no_mangle)]
pub extern "C" fn objbridge_as_long(obj: HeapPtr) -> c_long {
    with_bridge(-1, |bridge| {
        let value = bridge.retrieve(obj)?;
        value
            .as_int()
            .map(|v| v as c_long)
            .ok_or(BridgeError::TypeMismatch {
                handle: obj,
                expected: "int",
            })
    })
}

/// Length of a tuple, list or dict, or -1.
#[unsafe(no_mangle)]
pub extern "C" fn objbridge_object_length(obj: HeapPtr) -> isize {
    with_bridge(-1, |bridge| {
        let value = bridge.retrieve(obj)?;
        value
            .items()
            .map(|items| items.len())
            .or_else(|| value.entries().map(|entries| entries.len()))
            .map(|len| len as isize)
            .ok_or(BridgeError::TypeMismatch {
                handle: obj,
                expected: "sequence",
            })
    })
}

// =========================================================================
// Type slots
// =========================================================================

/// `tp_dealloc` of the base object type.
#[unsafe(no_mangle)]
pub extern "C" fn objbridge_object_dealloc(obj: HeapPtr) {
    with_bridge((), |bridge| bridge.object_dealloc(obj))
}

/// `tp_free` of every builtin type.
#[unsafe(no_mangle)]
pub extern "C" fn objbridge_object_free(obj: HeapPtr) {
    with_bridge((), |bridge| bridge.free_object(obj))
}

// =========================================================================
// Capsules
// =========================================================================

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_capsule_from_pointer(
    data: *mut c_void,
    destructor: Option<FreeFn>,
) -> HeapPtr {
    with_bridge(HeapPtr::null(), |bridge| {
        bridge.capsule_from_pointer(data, destructor)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_capsule_as_pointer(obj: HeapPtr) -> *mut c_void {
    with_bridge(std::ptr::null_mut(), |bridge| bridge.capsule_as_pointer(obj))
}

/// `tp_dealloc` of the capsule type.
#[unsafe(no_mangle)]
pub extern "C" fn objbridge_capsule_dealloc(obj: HeapPtr) {
    with_bridge((), |bridge| bridge.capsule_dealloc(obj))
}

// =========================================================================
// Modules
// =========================================================================

/// Build and register a module from a NULL-terminated method table.
///
/// Returns a new reference to the module, or null.
#[unsafe(no_mangle)]
pub extern "C" fn objbridge_init_module(
    name: *const c_char,
    methods: *const MethodDef,
    doc: *const c_char,
    self_obj: HeapPtr,
    abi_version: c_int,
) -> HeapPtr {
    with_bridge(HeapPtr::null(), |bridge| {
        let name = required_str(name, "module name")?;
        let doc = unsafe { read_cstr(doc) };
        unsafe { bridge.init_module(&name, methods, doc.as_deref(), self_obj, abi_version) }
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_module_new(name: *const c_char) -> HeapPtr {
    with_bridge(HeapPtr::null(), |bridge| {
        bridge.module_new(&required_str(name, "module name")?)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_module_get_dict(module: HeapPtr) -> HeapPtr {
    with_bridge(HeapPtr::null(), |bridge| bridge.module_get_dict(module))
}

/// Set `module.name = value`, stealing the reference to `value`.
#[unsafe(no_mangle)]
pub extern "C" fn objbridge_module_add_object(
    module: HeapPtr,
    name: *const c_char,
    value: HeapPtr,
) -> c_int {
    status(|bridge| bridge.module_add_object(module, &required_str(name, "attribute name")?, value))
}

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_module_add_int_constant(
    module: HeapPtr,
    name: *const c_char,
    value: c_long,
) -> c_int {
    status(|bridge| {
        bridge.module_add_int_constant(module, &required_str(name, "attribute name")?, value as i64)
    })
}

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_module_add_string_constant(
    module: HeapPtr,
    name: *const c_char,
    value: *const c_char,
) -> c_int {
    status(|bridge| {
        let name = required_str(name, "attribute name")?;
        let value = required_str(value, "string constant")?;
        bridge.module_add_string_constant(module, &name, &value)
    })
}

// =========================================================================
// Error indicator
// =========================================================================

/// Report a failure; the next null return from a module function carries it.
#[unsafe(no_mangle)]
pub extern "C" fn objbridge_err_set_string(message: *const c_char) {
    let message = unsafe { read_cstr(message) }.unwrap_or_default();
    with_current(|bridge| bridge.set_last_error(BridgeError::ForeignCallFailure(message)));
}

/// 1 if an error is parked, else 0.
#[unsafe(no_mangle)]
pub extern "C" fn objbridge_err_occurred() -> c_int {
    with_current(|bridge| c_int::from(bridge.has_last_error())).unwrap_or(0)
}

#[unsafe(no_mangle)]
pub extern "C" fn objbridge_err_clear() {
    with_current(|bridge| drop(bridge.take_last_error()));
}
