//! Module construction protocol
//!
//! Turning a native method table into a hosted module takes eight steps:
//! - normalize the requested name against the current import context
//! - create the module and set `__doc__`, `__name__`, `__file__`, `__path__`
//! - attach a dispatcher under [`DISPATCHER_ATTR`]
//! - add one hosted function per table entry
//! - run the bootstrap snippet in the module namespace
//! - register the module (creating any missing parent packages)
//! - store it and hand the handle back to native code
//!
//! The module-level entry points native code uses after initialization
//! (`module_add_object` and friends) live here too.

use std::ffi::c_int;
use std::path::Path;
use std::rc::Rc;

use log::{info, warn};

use super::dispatcher::{Dispatcher, FunctionTableEntry};
use crate::bridge::Bridge;
use crate::error::{BridgeError, BridgeResult};
use crate::runtime::ABI_VERSION;
use crate::runtime::heap::HeapPtr;
use crate::runtime::layout::MethodDef;
use crate::vm::ImportContext;
use crate::vm::value::{Function, Module, ObjRef};

/// Name of the module attribute holding its dispatcher.
pub const DISPATCHER_ATTR: &str = "_dispatcher";

/// The name a module is registered under.
///
/// The host's package prefix is stripped first. An undotted result that
/// matches the last component of the name being imported becomes that full
/// dotted name, so `Init("sub")` while importing `pkg.sub` yields `pkg.sub`.
pub fn normalize_name(requested: &str, prefix: Option<&str>, context: Option<&ImportContext>) -> String {
    let name = prefix
        .filter(|p| !p.is_empty())
        .and_then(|p| requested.strip_prefix(p))
        .unwrap_or(requested);

    if !name.contains('.') {
        let full = context.and_then(|c| c.name.as_deref());
        if let Some(full) = full {
            if full.rsplit_once('.').is_some_and(|(_, last)| last == name) {
                return full.to_string();
            }
        }
    }
    name.to_string()
}

/// `__path__` for a module loaded from `file`: its directory, if known.
pub fn package_path(file: Option<&Path>) -> Vec<String> {
    file.and_then(Path::parent)
        .map(|dir| vec![dir.to_string_lossy().into_owned()])
        .unwrap_or_default()
}

impl Bridge {
    pub fn create_module(
        &self,
        requested: &str,
        table: Vec<FunctionTableEntry>,
        doc: Option<&str>,
        self_obj: HeapPtr,
    ) -> BridgeResult<HeapPtr> {
        let context = self.engine.import_context();
        let name = normalize_name(
            requested,
            self.config.package_prefix.as_deref(),
            context.as_ref(),
        );
        let file = context.and_then(|c| c.file);

        let module_obj = Module::new_object(&name);
        let module = module_obj
            .as_module()
            .ok_or_else(|| BridgeError::TypeMismatch {
                handle: HeapPtr::null(),
                expected: "module",
            })?;
        module.set_attr("__doc__", doc.map_or_else(ObjRef::none, ObjRef::str))?;
        module.set_attr("__name__", ObjRef::str(name.as_str()))?;
        module.set_attr(
            "__file__",
            file.as_deref()
                .map_or_else(ObjRef::none, |f| ObjRef::str(f.to_string_lossy())),
        )?;
        let path = package_path(file.as_deref())
            .into_iter()
            .map(ObjRef::str)
            .collect();
        module.set_attr("__path__", ObjRef::list(path))?;

        let dispatcher = Rc::new(Dispatcher::new(self.this.clone(), table, self_obj));
        module.set_attr(DISPATCHER_ATTR, ObjRef::foreign(Rc::clone(&dispatcher)))?;
        for (index, entry) in dispatcher.entries().iter().enumerate() {
            let target = Rc::clone(&dispatcher);
            let function = Function::new_object(entry.name.as_str(), entry.doc.clone(), move |args, kwargs| {
                target.dispatch(index, args, kwargs)
            });
            module.set_attr(&entry.name, function)?;
        }

        self.engine
            .exec_snippet(&self.config.bootstrap, module, &self.modules)?;
        self.modules.register(&name, module_obj.clone())?;
        info!(
            "registered module '{}' ({} functions)",
            name,
            dispatcher.entries().len()
        );

        self.store(&module_obj)
    }

    /// [`Bridge::create_module`] over a native method table.
    ///
    /// # Safety
    /// `methods` must satisfy [`FunctionTableEntry::read_table`].
    pub unsafe fn init_module(
        &self,
        requested: &str,
        methods: *const MethodDef,
        doc: Option<&str>,
        self_obj: HeapPtr,
        abi_version: c_int,
    ) -> BridgeResult<HeapPtr> {
        if abi_version != ABI_VERSION {
            warn!(
                "module '{}' built for ABI {}, bridge speaks {}",
                requested, abi_version, ABI_VERSION
            );
        }
        let table = unsafe { FunctionTableEntry::read_table(methods)? };
        self.create_module(requested, table, doc, self_obj)
    }

    pub fn get_module(&self, name: &str) -> Option<ObjRef> {
        self.modules.get(name)
    }

    /// A bare module that is stored but not registered.
    pub fn module_new(&self, name: &str) -> BridgeResult<HeapPtr> {
        let module_obj = Module::new_object(name);
        if let Some(module) = module_obj.as_module() {
            module.set_attr("__doc__", ObjRef::str(""))?;
        }
        self.store(&module_obj)
    }

    /// New reference to the namespace dict of `module`.
    pub fn module_get_dict(&self, module: HeapPtr) -> BridgeResult<HeapPtr> {
        let obj = self.retrieve(module)?;
        let dict = obj
            .as_module()
            .map(|m| m.dict().clone())
            .ok_or(BridgeError::TypeMismatch {
                handle: module,
                expected: "module",
            })?;
        self.store(&dict)
    }

    fn module_add(&self, module: HeapPtr, name: &str, value: ObjRef) -> BridgeResult<()> {
        let obj = self.retrieve(module)?;
        let module_ref = obj.as_module().ok_or(BridgeError::TypeMismatch {
            handle: module,
            expected: "module",
        })?;
        module_ref.set_attr(name, value)
    }

    /// Set `module.name` to the object behind `value`. The reference to
    /// `value` is consumed once the module is known to exist.
    pub fn module_add_object(&self, module: HeapPtr, name: &str, value: HeapPtr) -> BridgeResult<()> {
        if !self.has_handle(module) {
            return Err(BridgeError::UnknownHandle(module));
        }
        let obj = self.retrieve(value)?;
        self.decref(value)?;
        self.module_add(module, name, obj)
    }

    pub fn module_add_int_constant(&self, module: HeapPtr, name: &str, value: i64) -> BridgeResult<()> {
        self.module_add(module, name, ObjRef::int(value))
    }

    pub fn module_add_string_constant(&self, module: HeapPtr, name: &str, value: &str) -> BridgeResult<()> {
        self.module_add(module, name, ObjRef::str(value))
    }
}
