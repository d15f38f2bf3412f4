// A native extension written against the bridge's C entry points, the same
// way an unmodified C extension would be: method table, init call, constants.
use std::ffi::{CStr, CString, c_int, c_long, c_void};

use objbridge::HeapPtr;
use objbridge::module::dispatcher::flags;
use objbridge::runtime::ABI_VERSION;
use objbridge::runtime::layout::MethodDef;
use objbridge::runtime::stubs::*;

const TOKEN_SEED: u64 = 0x5EED;

extern "C" fn version(_self: HeapPtr, _args: HeapPtr) -> HeapPtr {
    objbridge_store_string(c"objbridge demo 1".as_ptr())
}

extern "C" fn square(_self: HeapPtr, arg: HeapPtr) -> HeapPtr {
    let n = objbridge_as_long(arg);
    if n == -1 && objbridge_err_occurred() != 0 {
        return HeapPtr::null();
    }
    objbridge_store_long(n.wrapping_mul(n))
}

extern "C" fn count(_self: HeapPtr, args: HeapPtr, kwargs: HeapPtr) -> HeapPtr {
    let positional = objbridge_object_length(args);
    let keywords = if kwargs.is_null() {
        0
    } else {
        objbridge_object_length(kwargs)
    };
    if positional < 0 || keywords < 0 {
        return HeapPtr::null();
    }
    objbridge_store_long((positional + keywords) as c_long)
}

unsafe extern "C" fn free_token(data: *mut c_void) {
    drop(unsafe { Box::from_raw(data.cast::<u64>()) });
}

extern "C" fn make_token(_self: HeapPtr, _args: HeapPtr) -> HeapPtr {
    let data = Box::into_raw(Box::new(TOKEN_SEED));
    let capsule = objbridge_capsule_from_pointer(data.cast(), Some(free_token));
    if capsule.is_null() {
        drop(unsafe { Box::from_raw(data) });
    }
    capsule
}

extern "C" fn read_token(_self: HeapPtr, arg: HeapPtr) -> HeapPtr {
    let data = objbridge_capsule_as_pointer(arg);
    if data.is_null() {
        return HeapPtr::null();
    }
    let value = unsafe { *data.cast::<u64>() };
    objbridge_store_long(value as c_long)
}

extern "C" fn fail(_self: HeapPtr, _args: HeapPtr) -> HeapPtr {
    objbridge_err_set_string(c"failure requested".as_ptr());
    HeapPtr::null()
}

fn method(name: &'static CStr, meth: usize, flags: c_int, doc: &'static CStr) -> MethodDef {
    MethodDef {
        name: name.as_ptr(),
        meth,
        flags,
        doc: doc.as_ptr(),
    }
}

/// Initialize the demo module under `name`. Returns the module handle or
/// null with an error parked.
pub fn init(name: &str) -> HeapPtr {
    let Ok(name) = CString::new(name) else {
        return HeapPtr::null();
    };

    let table = [
        method(c"version", version as usize, flags::NOARGS, c"Version string."),
        method(c"square", square as usize, flags::O, c"Square an int."),
        method(
            c"count",
            count as usize,
            flags::VARARGS | flags::KEYWORDS,
            c"Count positional and keyword arguments.",
        ),
        method(c"make_token", make_token as usize, flags::NOARGS, c"Allocate a token capsule."),
        method(c"read_token", read_token as usize, flags::O, c"Read a token capsule."),
        method(c"fail", fail as usize, flags::VARARGS, c"Always fails."),
        MethodDef {
            name: std::ptr::null(),
            meth: 0,
            flags: 0,
            doc: std::ptr::null(),
        },
    ];

    let module = objbridge_init_module(
        name.as_ptr(),
        table.as_ptr(),
        c"Demo native module.".as_ptr(),
        HeapPtr::null(),
        ABI_VERSION,
    );
    if module.is_null() {
        return module;
    }
    if objbridge_module_add_int_constant(module, c"ANSWER".as_ptr(), 42) != 0
        || objbridge_module_add_string_constant(
            module,
            c"GREETING".as_ptr(),
            c"hello from native code".as_ptr(),
        ) != 0
    {
        return HeapPtr::null();
    }
    module
}
