//! Function-pointer dispatch across the native boundary
//!
//! Native blocks store function pointers as plain addresses. A stored address
//! is only callable once it is paired with the signature its slot declares,
//! so every function pointer the bridge handles is an [`FnPtr`]: the address
//! plus a [`Signature`] tag. Invocation goes through a match on the tag, which
//! is the only place an address is turned back into a typed `extern "C" fn`.
//!
//! Signatures mirror the C typedef families the native ABI uses:
//!
//! | Signature    | C shape                                   | Used for                     |
//! |--------------|-------------------------------------------|------------------------------|
//! | `Freefunc`   | `void (*)(void *)`                        | capsule destructors          |
//! | `Destructor` | `void (*)(object *)`                      | type dealloc and free slots  |
//! | `Binary`     | `object *(*)(object *, object *)`         | NOARGS / O / VARARGS methods |
//! | `Ternary`    | `object *(*)(object *, object *, object *)` | VARARGS \| KEYWORDS methods |

use std::ffi::c_void;

use super::heap::HeapPtr;
use crate::error::{BridgeError, BridgeResult};

pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type DestructorFn = unsafe extern "C" fn(HeapPtr);
pub type BinaryFn = unsafe extern "C" fn(HeapPtr, HeapPtr) -> HeapPtr;
pub type TernaryFn = unsafe extern "C" fn(HeapPtr, HeapPtr, HeapPtr) -> HeapPtr;

/// Declared signature of a stored function pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signature {
    Freefunc,
    Destructor,
    Binary,
    Ternary,
}

impl Signature {
    fn name(self) -> &'static str {
        match self {
            Signature::Freefunc => "freefunc",
            Signature::Destructor => "destructor",
            Signature::Binary => "binaryfunc",
            Signature::Ternary => "ternaryfunc",
        }
    }
}

/// Arguments for one native call, shaped by signature.
#[derive(Clone, Copy, Debug)]
pub enum NativeArgs {
    Ptr(*mut c_void),
    Obj(HeapPtr),
    Pair(HeapPtr, HeapPtr),
    Triple(HeapPtr, HeapPtr, HeapPtr),
}

/// What a native call handed back.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NativeReturn {
    Void,
    Obj(HeapPtr),
}

impl NativeReturn {
    /// The returned object, or null for void calls.
    pub fn object(self) -> HeapPtr {
        match self {
            NativeReturn::Obj(ptr) => ptr,
            NativeReturn::Void => HeapPtr::null(),
        }
    }
}

/// A non-null native function address tagged with its signature.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FnPtr {
    addr: usize,
    sig: Signature,
}

impl FnPtr {
    /// Pair a raw address with a signature. Null addresses yield `None`.
    pub fn from_raw(addr: usize, sig: Signature) -> Option<Self> {
        (addr != 0).then_some(Self { addr, sig })
    }

    pub fn freefunc(f: FreeFn) -> Self {
        Self {
            addr: f as usize,
            sig: Signature::Freefunc,
        }
    }

    pub fn destructor(f: DestructorFn) -> Self {
        Self {
            addr: f as usize,
            sig: Signature::Destructor,
        }
    }

    pub fn binary(f: BinaryFn) -> Self {
        Self {
            addr: f as usize,
            sig: Signature::Binary,
        }
    }

    pub fn ternary(f: TernaryFn) -> Self {
        Self {
            addr: f as usize,
            sig: Signature::Ternary,
        }
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.addr
    }

    #[inline]
    pub fn signature(self) -> Signature {
        self.sig
    }

    /// Invoke the function with arguments matching its signature.
    ///
    /// # Safety
    /// The address must really be a function of the declared signature, and the
    /// arguments must be what that function expects (live handles, valid data
    /// pointers).
    pub unsafe fn call(self, args: NativeArgs) -> BridgeResult<NativeReturn> {
        unsafe {
            match (self.sig, args) {
                (Signature::Freefunc, NativeArgs::Ptr(data)) => {
                    let f = std::mem::transmute::<usize, FreeFn>(self.addr);
                    f(data);
                    Ok(NativeReturn::Void)
                }
                (Signature::Destructor, NativeArgs::Obj(obj)) => {
                    let f = std::mem::transmute::<usize, DestructorFn>(self.addr);
                    f(obj);
                    Ok(NativeReturn::Void)
                }
                (Signature::Binary, NativeArgs::Pair(a, b)) => {
                    let f = std::mem::transmute::<usize, BinaryFn>(self.addr);
                    Ok(NativeReturn::Obj(f(a, b)))
                }
                (Signature::Ternary, NativeArgs::Triple(a, b, c)) => {
                    let f = std::mem::transmute::<usize, TernaryFn>(self.addr);
                    Ok(NativeReturn::Obj(f(a, b, c)))
                }
                (sig, args) => Err(BridgeError::Argument(format!(
                    "cannot call {} with {:?}",
                    sig.name(),
                    args
                ))),
            }
        }
    }
}

impl std::fmt::Debug for FnPtr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FnPtr({}@{:#x})", self.sig.name(), self.addr)
    }
}
