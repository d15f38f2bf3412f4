//! Calls from hosted code into native module functions
//!
//! Every native module gets one [`Dispatcher`] holding its function table.
//! The hosted function objects are thin closures over the dispatcher and an
//! index into that table. A call converts the hosted arguments into handles,
//! invokes the native function with the convention its table entry declares,
//! and converts the returned handle back.
//!
//! Argument objects live in a temp frame opened for the call, so they are
//! released whether the native function succeeds or not.

use std::ffi::c_int;
use std::rc::Weak;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::runtime::abi::{FnPtr, NativeArgs, Signature};
use crate::runtime::heap::HeapPtr;
use crate::runtime::layout::{self, METHOD_DEF, MethodDef, ML_DOC, ML_FLAGS, ML_METH, ML_NAME};
use crate::vm::value::ObjRef;

/// Method-table flag bits.
pub mod flags {
    use std::ffi::c_int;

    pub const VARARGS: c_int = 0x0001;
    pub const KEYWORDS: c_int = 0x0002;
    pub const NOARGS: c_int = 0x0004;
    pub const O: c_int = 0x0008;
}

/// How a native function wants its arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallingConvention {
    /// `f(self, NULL)`
    NoArgs,
    /// `f(self, arg)`
    Object,
    /// `f(self, args_tuple)`
    VarArgs,
    /// `f(self, args_tuple, kwargs_dict_or_NULL)`
    VarArgsKeywords,
}

impl CallingConvention {
    pub fn from_flags(bits: c_int) -> BridgeResult<Self> {
        match bits {
            flags::NOARGS => Ok(Self::NoArgs),
            flags::O => Ok(Self::Object),
            flags::VARARGS => Ok(Self::VarArgs),
            b if b == flags::VARARGS | flags::KEYWORDS => Ok(Self::VarArgsKeywords),
            other => Err(BridgeError::Argument(format!(
                "unsupported method flags {:#x}",
                other
            ))),
        }
    }

    pub fn flags(self) -> c_int {
        match self {
            Self::NoArgs => flags::NOARGS,
            Self::Object => flags::O,
            Self::VarArgs => flags::VARARGS,
            Self::VarArgsKeywords => flags::VARARGS | flags::KEYWORDS,
        }
    }

    pub fn signature(self) -> Signature {
        match self {
            Self::VarArgsKeywords => Signature::Ternary,
            _ => Signature::Binary,
        }
    }
}

/// One native function exposed by a module.
#[derive(Clone, Debug)]
pub struct FunctionTableEntry {
    pub name: String,
    pub func: FnPtr,
    pub convention: CallingConvention,
    pub doc: Option<String>,
}

impl FunctionTableEntry {
    pub fn new(
        name: impl Into<String>,
        func: FnPtr,
        convention: CallingConvention,
        doc: Option<String>,
    ) -> BridgeResult<Self> {
        let name = name.into();
        if func.signature() != convention.signature() {
            return Err(BridgeError::Argument(format!(
                "{}: {:?} function cannot use {:?}",
                name,
                func.signature(),
                convention
            )));
        }
        Ok(Self {
            name,
            func,
            convention,
            doc,
        })
    }

    /// Read a method table from native memory, up to the entry with a null
    /// name.
    ///
    /// # Safety
    /// `table` is null or points at a `MethodDef` array terminated by an
    /// entry whose name is null. Names and docs are NUL-terminated strings.
    pub unsafe fn read_table(table: *const MethodDef) -> BridgeResult<Vec<Self>> {
        let mut entries = Vec::new();
        if table.is_null() {
            return Ok(entries);
        }

        for index in 0.. {
            let def = HeapPtr::from_usize(table as usize + index * METHOD_DEF.size);
            let name_ptr = unsafe { layout::read_ptr(def, &ML_NAME) } as *const _;
            let Some(name) = (unsafe { layout::read_cstr(name_ptr) }) else {
                break;
            };
            let convention = CallingConvention::from_flags(unsafe { layout::read_c_int(def, &ML_FLAGS) })?;
            let addr = unsafe { layout::read_ptr(def, &ML_METH) };
            let func = FnPtr::from_raw(addr, convention.signature())
                .ok_or_else(|| BridgeError::Argument(format!("{}: null function pointer", name)))?;
            let doc = unsafe { layout::read_cstr(layout::read_ptr(def, &ML_DOC) as *const _) };
            entries.push(Self::new(name, func, convention, doc)?);
        }
        Ok(entries)
    }
}

/// Routes hosted calls to one module's native functions.
pub struct Dispatcher {
    bridge: Weak<Bridge>,
    table: Vec<FunctionTableEntry>,
    self_obj: HeapPtr,
}

impl Dispatcher {
    pub fn new(bridge: Weak<Bridge>, table: Vec<FunctionTableEntry>, self_obj: HeapPtr) -> Self {
        Self {
            bridge,
            table,
            self_obj,
        }
    }

    pub fn entries(&self) -> &[FunctionTableEntry] {
        &self.table
    }

    pub fn dispatch(
        &self,
        index: usize,
        args: &[ObjRef],
        kwargs: &[(String, ObjRef)],
    ) -> BridgeResult<ObjRef> {
        let bridge = self.bridge.upgrade().ok_or(BridgeError::Disposed)?;
        if !bridge.is_alive() {
            return Err(BridgeError::Disposed);
        }
        let entry = self.table.get(index).ok_or_else(|| {
            BridgeError::Argument(format!("no function at index {} of dispatch table", index))
        })?;

        trace!("dispatching {}() with {} args", entry.name, args.len());
        bridge.push_temp_frame();
        let result = self.invoke(&bridge, entry, args, kwargs);
        let cleanup = bridge.pop_temp_frame();
        let value = result?;
        cleanup?;
        Ok(value)
    }

    fn temp(&self, bridge: &Bridge, obj: &ObjRef) -> BridgeResult<HeapPtr> {
        let handle = bridge.store(obj)?;
        bridge.remember_temp(handle);
        Ok(handle)
    }

    fn invoke(
        &self,
        bridge: &Bridge,
        entry: &FunctionTableEntry,
        args: &[ObjRef],
        kwargs: &[(String, ObjRef)],
    ) -> BridgeResult<ObjRef> {
        if !kwargs.is_empty() && entry.convention != CallingConvention::VarArgsKeywords {
            return Err(BridgeError::Argument(format!(
                "{}() takes no keyword arguments",
                entry.name
            )));
        }

        let native_args = match entry.convention {
            CallingConvention::NoArgs => {
                if !args.is_empty() {
                    return Err(BridgeError::Argument(format!(
                        "{}() takes no arguments ({} given)",
                        entry.name,
                        args.len()
                    )));
                }
                NativeArgs::Pair(self.self_obj, HeapPtr::null())
            }
            CallingConvention::Object => {
                let [arg] = args else {
                    return Err(BridgeError::Argument(format!(
                        "{}() takes exactly one argument ({} given)",
                        entry.name,
                        args.len()
                    )));
                };
                NativeArgs::Pair(self.self_obj, self.temp(bridge, arg)?)
            }
            CallingConvention::VarArgs => {
                let tuple = self.temp(bridge, &ObjRef::tuple(args.to_vec()))?;
                NativeArgs::Pair(self.self_obj, tuple)
            }
            CallingConvention::VarArgsKeywords => {
                let tuple = self.temp(bridge, &ObjRef::tuple(args.to_vec()))?;
                let dict = if kwargs.is_empty() {
                    HeapPtr::null()
                } else {
                    let map: IndexMap<String, ObjRef> = kwargs.iter().cloned().collect();
                    self.temp(bridge, &ObjRef::dict(map))?
                };
                NativeArgs::Triple(self.self_obj, tuple, dict)
            }
        };

        // A previously parked error survives the call
        let (called, raised) = bridge.call_native_isolated(entry.func, native_args);
        let returned = called?.object();
        if returned.is_null() {
            let cause = raised
                .map(|e| match e {
                    BridgeError::ForeignCallFailure(msg) => msg,
                    other => other.to_string(),
                })
                .unwrap_or_else(|| format!("{}() returned NULL without setting an error", entry.name));
            return Err(BridgeError::ForeignCallFailure(cause));
        }
        if let Some(ignored) = raised {
            debug!("{}() returned a value with an error set: {}", entry.name, ignored);
        }

        let value = bridge.retrieve(returned)?;
        bridge.decref(returned)?;
        Ok(value)
    }
}
