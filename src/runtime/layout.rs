//! Native struct layouts
//!
//! The structs here are the byte-exact shapes unmodified native code reads and
//! writes. Each one also has an explicit [`Schema`]: field name, byte offset,
//! size and kind. Offsets come from `offset_of!` on the `#[repr(C)]` struct and
//! every schema is checked in a `const` assertion, so a layout mistake fails
//! the build rather than corrupting a block at runtime.
//!
//! All reads and writes of native blocks go through the field accessors at the
//! bottom of this file.

use std::ffi::{CStr, c_char, c_int, c_void};
use std::mem::{offset_of, size_of};

use super::abi::{DestructorFn, FnPtr, FreeFn, Signature};
use super::heap::HeapPtr;
use crate::error::{BridgeError, BridgeResult};

// =========================================================================
// Native structs
// =========================================================================

/// Header at the start of every native object block.
#[repr(C)]
pub struct ObjectHead {
    pub refcnt: isize,
    pub type_ptr: HeapPtr,
}

/// Opaque-pointer resource with an optional teardown callback.
#[repr(C)]
pub struct CapsuleBlock {
    pub head: ObjectHead,
    pub data: *mut c_void,
    pub destructor: Option<FreeFn>,
}

/// Type object prefix: the slots the bridge reads, in native order.
#[repr(C)]
pub struct TypeBlock {
    pub head: ObjectHead,
    pub size: isize,
    pub name: *const c_char,
    pub basicsize: isize,
    pub itemsize: isize,
    pub dealloc: Option<DestructorFn>,
    pub free: Option<DestructorFn>,
}

/// One entry of a native module's method table. A null `name` terminates
/// the table.
#[repr(C)]
pub struct MethodDef {
    pub name: *const c_char,
    pub meth: usize,
    pub flags: c_int,
    pub doc: *const c_char,
}

// =========================================================================
// Schemas
// =========================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldKind {
    /// `Py_ssize_t`-sized signed integer.
    Int,
    /// C `int`.
    CInt,
    /// Data pointer.
    Ptr,
    /// Function pointer with a declared signature.
    FnPtr(Signature),
}

impl FieldKind {
    pub const fn size(self) -> usize {
        match self {
            FieldKind::Int => size_of::<isize>(),
            FieldKind::CInt => size_of::<c_int>(),
            FieldKind::Ptr | FieldKind::FnPtr(_) => size_of::<usize>(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub kind: FieldKind,
}

impl Field {
    pub const fn new(name: &'static str, offset: usize, kind: FieldKind) -> Self {
        Self { name, offset, kind }
    }

    pub const fn size(&self) -> usize {
        self.kind.size()
    }
}

#[derive(Debug)]
pub struct Schema {
    pub name: &'static str,
    pub size: usize,
    pub fields: &'static [Field],
}

impl Schema {
    /// Fields are in ascending offset order, aligned to their own size,
    /// non-overlapping and inside the struct.
    pub const fn validate(&self) -> bool {
        let mut end = 0;
        let mut i = 0;
        while i < self.fields.len() {
            let field = &self.fields[i];
            if field.offset < end || field.offset % field.size() != 0 {
                return false;
            }
            end = field.offset + field.size();
            if end > self.size {
                return false;
            }
            i += 1;
        }
        true
    }

    pub fn field(&self, name: &str) -> Option<&'static Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Read a field by name.
    ///
    /// # Safety
    /// `ptr` must point at a live block laid out per this schema.
    pub unsafe fn read(&self, ptr: HeapPtr, name: &str) -> BridgeResult<FieldValue> {
        let field = self.lookup(name)?;
        Ok(unsafe {
            match field.kind {
                FieldKind::Int => FieldValue::Int(read_int(ptr, field)),
                FieldKind::CInt => FieldValue::Int(read_c_int(ptr, field) as isize),
                FieldKind::Ptr => FieldValue::Ptr(read_ptr(ptr, field)),
                FieldKind::FnPtr(_) => FieldValue::Fn(read_fn(ptr, field)),
            }
        })
    }

    /// Write a field by name. The value's shape must match the field kind.
    ///
    /// # Safety
    /// `ptr` must point at a live, writable block laid out per this schema.
    pub unsafe fn write(&self, ptr: HeapPtr, name: &str, value: FieldValue) -> BridgeResult<()> {
        let field = self.lookup(name)?;
        unsafe {
            match (field.kind, value) {
                (FieldKind::Int, FieldValue::Int(v)) => write_int(ptr, field, v),
                (FieldKind::CInt, FieldValue::Int(v)) => write_c_int(ptr, field, v as c_int),
                (FieldKind::Ptr, FieldValue::Ptr(v)) => write_ptr(ptr, field, v),
                (FieldKind::FnPtr(sig), FieldValue::Fn(f)) => {
                    if f.is_some_and(|f| f.signature() != sig) {
                        return Err(BridgeError::Argument(format!(
                            "{}.{} holds {:?} pointers",
                            self.name, name, sig
                        )));
                    }
                    write_fn(ptr, field, f)
                }
                (kind, value) => {
                    return Err(BridgeError::Argument(format!(
                        "cannot store {:?} in {:?} field {}.{}",
                        value, kind, self.name, name
                    )));
                }
            }
        }
        Ok(())
    }

    fn lookup(&self, name: &str) -> BridgeResult<&'static Field> {
        self.field(name)
            .ok_or_else(|| BridgeError::Argument(format!("{} has no field '{}'", self.name, name)))
    }
}

/// A field value read or written by name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Int(isize),
    Ptr(usize),
    Fn(Option<FnPtr>),
}

pub const OB_REFCNT: Field = Field::new("ob_refcnt", offset_of!(ObjectHead, refcnt), FieldKind::Int);
pub const OB_TYPE: Field = Field::new("ob_type", offset_of!(ObjectHead, type_ptr), FieldKind::Ptr);

pub const CAPSULE_DATA: Field =
    Field::new("data", offset_of!(CapsuleBlock, data), FieldKind::Ptr);
pub const CAPSULE_DESTRUCTOR: Field = Field::new(
    "destructor",
    offset_of!(CapsuleBlock, destructor),
    FieldKind::FnPtr(Signature::Freefunc),
);

pub const OB_SIZE: Field = Field::new("ob_size", offset_of!(TypeBlock, size), FieldKind::Int);
pub const TP_NAME: Field = Field::new("tp_name", offset_of!(TypeBlock, name), FieldKind::Ptr);
pub const TP_BASICSIZE: Field =
    Field::new("tp_basicsize", offset_of!(TypeBlock, basicsize), FieldKind::Int);
pub const TP_ITEMSIZE: Field =
    Field::new("tp_itemsize", offset_of!(TypeBlock, itemsize), FieldKind::Int);
pub const TP_DEALLOC: Field = Field::new(
    "tp_dealloc",
    offset_of!(TypeBlock, dealloc),
    FieldKind::FnPtr(Signature::Destructor),
);
pub const TP_FREE: Field = Field::new(
    "tp_free",
    offset_of!(TypeBlock, free),
    FieldKind::FnPtr(Signature::Destructor),
);

pub const ML_NAME: Field = Field::new("ml_name", offset_of!(MethodDef, name), FieldKind::Ptr);
// Signature depends on ml_flags, so the slot is read as a bare address.
pub const ML_METH: Field = Field::new("ml_meth", offset_of!(MethodDef, meth), FieldKind::Ptr);
pub const ML_FLAGS: Field = Field::new("ml_flags", offset_of!(MethodDef, flags), FieldKind::CInt);
pub const ML_DOC: Field = Field::new("ml_doc", offset_of!(MethodDef, doc), FieldKind::Ptr);

pub static OBJECT: Schema = Schema {
    name: "object",
    size: size_of::<ObjectHead>(),
    fields: &[OB_REFCNT, OB_TYPE],
};

pub static CAPSULE: Schema = Schema {
    name: "capsule",
    size: size_of::<CapsuleBlock>(),
    fields: &[OB_REFCNT, OB_TYPE, CAPSULE_DATA, CAPSULE_DESTRUCTOR],
};

pub static TYPE: Schema = Schema {
    name: "type",
    size: size_of::<TypeBlock>(),
    fields: &[
        OB_REFCNT,
        OB_TYPE,
        OB_SIZE,
        TP_NAME,
        TP_BASICSIZE,
        TP_ITEMSIZE,
        TP_DEALLOC,
        TP_FREE,
    ],
};

pub static METHOD_DEF: Schema = Schema {
    name: "methoddef",
    size: size_of::<MethodDef>(),
    fields: &[ML_NAME, ML_METH, ML_FLAGS, ML_DOC],
};

const _: () = assert!(OBJECT.validate());
const _: () = assert!(CAPSULE.validate());
const _: () = assert!(TYPE.validate());
const _: () = assert!(METHOD_DEF.validate());

// =========================================================================
// Field accessors
// =========================================================================
//
// Safety for all of these: `ptr` points at a live block at least
// `field.offset + field.size()` bytes long.

#[inline]
pub unsafe fn read_int(ptr: HeapPtr, field: &Field) -> isize {
    debug_assert_eq!(field.kind, FieldKind::Int);
    unsafe { std::ptr::read(ptr.offset(field.offset).cast::<isize>()) }
}

#[inline]
pub unsafe fn write_int(ptr: HeapPtr, field: &Field, value: isize) {
    debug_assert_eq!(field.kind, FieldKind::Int);
    unsafe { std::ptr::write(ptr.offset(field.offset).cast::<isize>(), value) }
}

#[inline]
pub unsafe fn read_c_int(ptr: HeapPtr, field: &Field) -> c_int {
    debug_assert_eq!(field.kind, FieldKind::CInt);
    unsafe { std::ptr::read(ptr.offset(field.offset).cast::<c_int>()) }
}

#[inline]
pub unsafe fn write_c_int(ptr: HeapPtr, field: &Field, value: c_int) {
    debug_assert_eq!(field.kind, FieldKind::CInt);
    unsafe { std::ptr::write(ptr.offset(field.offset).cast::<c_int>(), value) }
}

#[inline]
pub unsafe fn read_ptr(ptr: HeapPtr, field: &Field) -> usize {
    debug_assert_eq!(field.kind, FieldKind::Ptr);
    unsafe { std::ptr::read(ptr.offset(field.offset).cast::<usize>()) }
}

#[inline]
pub unsafe fn write_ptr(ptr: HeapPtr, field: &Field, value: usize) {
    debug_assert_eq!(field.kind, FieldKind::Ptr);
    unsafe { std::ptr::write(ptr.offset(field.offset).cast::<usize>(), value) }
}

/// Read a function-pointer slot, tagging it with the slot's declared signature.
#[inline]
pub unsafe fn read_fn(ptr: HeapPtr, field: &Field) -> Option<FnPtr> {
    let FieldKind::FnPtr(sig) = field.kind else {
        debug_assert!(false, "{} is not a function slot", field.name);
        return None;
    };
    let addr = unsafe { std::ptr::read(ptr.offset(field.offset).cast::<usize>()) };
    FnPtr::from_raw(addr, sig)
}

#[inline]
pub unsafe fn write_fn(ptr: HeapPtr, field: &Field, value: Option<FnPtr>) {
    debug_assert!(matches!(field.kind, FieldKind::FnPtr(sig) if value.is_none_or(|f| f.signature() == sig)));
    let addr = value.map_or(0, FnPtr::addr);
    unsafe { std::ptr::write(ptr.offset(field.offset).cast::<usize>(), addr) }
}

/// Copy a NUL-terminated string out of native memory.
///
/// # Safety
/// `ptr` is null or points at a NUL-terminated string.
pub unsafe fn read_cstr(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}
