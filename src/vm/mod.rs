//! Hosted runtime collaborator
//!
//! The bridge needs three things from the engine hosting it: a way to run a
//! short snippet inside a module namespace, the current import context (which
//! module is being loaded, from which file), and a collector that reports
//! finalized proxies. [`HostEngine`] is that contract. [`Vm`] is the minimal
//! in-process engine that implements it; its snippet language only knows
//! `import` statements.

pub mod gc;
pub mod value;

use std::cell::RefCell;
use std::path::PathBuf;

use indexmap::IndexMap;

use crate::error::{BridgeError, BridgeResult};
use crate::module::registry::ModuleRegistry;
use crate::runtime::heap::HeapPtr;
use gc::{Collector, Finalization};
use value::{Module, ObjRef};

/// What the engine is importing right now.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ImportContext {
    /// Fully qualified name being imported, if known.
    pub name: Option<String>,
    /// File the extension was loaded from, if known.
    pub file: Option<PathBuf>,
}

impl ImportContext {
    pub fn new(name: impl Into<String>, file: impl Into<PathBuf>) -> Self {
        Self {
            name: Some(name.into()),
            file: Some(file.into()),
        }
    }
}

pub trait HostEngine {
    /// Execute `code` with `module`'s namespace as its only scope. Imports
    /// resolve through `modules` before the engine's own builtins.
    fn exec_snippet(&self, code: &str, module: &Module, modules: &ModuleRegistry)
    -> BridgeResult<()>;

    /// Top of the import-context stack.
    fn import_context(&self) -> Option<ImportContext>;

    /// Register `proxy` for finalization; its collection reports `handle`.
    fn track_finalizable(&self, proxy: &ObjRef, handle: HeapPtr);

    /// Run a collection and return the finalizations it produced.
    fn collect(&self) -> Vec<Finalization>;
}

pub struct Vm {
    builtins: IndexMap<String, ObjRef>,
    imports: RefCell<Vec<ImportContext>>,
    collector: Collector,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut builtins = IndexMap::new();

        let sys = Module::new_object("sys");
        if let Some(m) = sys.as_module() {
            let _ = m.set_attr("version", ObjRef::str(env!("CARGO_PKG_VERSION")));
            let _ = m.set_attr("platform", ObjRef::str(std::env::consts::OS));
        }
        builtins.insert("sys".to_string(), sys);
        builtins.insert("builtins".to_string(), Module::new_object("builtins"));

        Self {
            builtins,
            imports: RefCell::new(Vec::new()),
            collector: Collector::new(),
        }
    }

    pub fn push_import(&self, context: ImportContext) {
        self.imports.borrow_mut().push(context);
    }

    pub fn pop_import(&self) -> Option<ImportContext> {
        self.imports.borrow_mut().pop()
    }

    pub fn builtin(&self, name: &str) -> Option<ObjRef> {
        self.builtins.get(name).cloned()
    }

    pub fn collector(&self) -> &Collector {
        &self.collector
    }

    fn resolve(&self, path: &str, modules: &ModuleRegistry) -> BridgeResult<ObjRef> {
        modules
            .get(path)
            .or_else(|| self.builtin(path))
            .ok_or_else(|| BridgeError::Import(path.to_string()))
    }

    fn exec_import(&self, clause: &str, module: &Module, modules: &ModuleRegistry) -> BridgeResult<bool> {
        let (path, alias) = match clause.split_once(" as ") {
            Some((path, alias)) => (path.trim(), Some(alias.trim())),
            None => (clause.trim(), None),
        };
        if !is_dotted_name(path) || alias.is_some_and(|a| !is_identifier(a)) {
            return Ok(false);
        }

        let target = self.resolve(path, modules)?;
        match alias {
            Some(alias) => module.set_attr(alias, target)?,
            None => {
                // `import a.b` binds `a`
                let top = path.split('.').next().unwrap_or(path);
                let top_module = self.resolve(top, modules)?;
                module.set_attr(top, top_module)?;
            }
        }
        Ok(true)
    }

    fn exec_from(&self, rest: &str, module: &Module, modules: &ModuleRegistry) -> BridgeResult<bool> {
        let Some((path, names)) = rest.split_once(" import ") else {
            return Ok(false);
        };
        let path = path.trim();
        if !is_dotted_name(path) {
            return Ok(false);
        }

        let source = self.resolve(path, modules)?;
        let source = source
            .as_module()
            .ok_or_else(|| BridgeError::Import(path.to_string()))?;
        for name in names.split(',').map(str::trim) {
            if !is_identifier(name) {
                return Ok(false);
            }
            let value = source
                .get_attr(name)
                .ok_or_else(|| BridgeError::Import(format!("{}.{}", path, name)))?;
            module.set_attr(name, value)?;
        }
        Ok(true)
    }
}

impl HostEngine for Vm {
    fn exec_snippet(
        &self,
        code: &str,
        module: &Module,
        modules: &ModuleRegistry,
    ) -> BridgeResult<()> {
        for (index, raw) in code.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let understood = if let Some(rest) = line.strip_prefix("import ") {
                let mut ok = true;
                for clause in rest.split(',') {
                    ok &= self.exec_import(clause, module, modules)?;
                }
                ok
            } else if let Some(rest) = line.strip_prefix("from ") {
                self.exec_from(rest, module, modules)?
            } else {
                false
            };

            if !understood {
                return Err(BridgeError::Snippet {
                    line: index + 1,
                    text: line.to_string(),
                });
            }
        }
        Ok(())
    }

    fn import_context(&self) -> Option<ImportContext> {
        self.imports.borrow().last().cloned()
    }

    fn track_finalizable(&self, proxy: &ObjRef, handle: HeapPtr) {
        self.collector.track(proxy, handle);
    }

    fn collect(&self) -> Vec<Finalization> {
        self.collector.collect()
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}

fn is_dotted_name(s: &str) -> bool {
    s.split('.').all(is_identifier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch() -> ObjRef {
        Module::new_object("scratch")
    }

    #[test]
    fn test_import_binds_builtin() {
        let vm = Vm::new();
        let registry = ModuleRegistry::new();
        let module = scratch();
        let m = module.as_module().unwrap();

        vm.exec_snippet("import sys\n", m, &registry).unwrap();
        assert!(m.get_attr("sys").unwrap().is(&vm.builtin("sys").unwrap()));
    }

    #[test]
    fn test_registry_shadows_builtins() {
        let vm = Vm::new();
        let registry = ModuleRegistry::new();
        let own_sys = Module::new_object("sys");
        registry.insert("sys", own_sys.clone());

        let module = scratch();
        let m = module.as_module().unwrap();
        vm.exec_snippet("import sys", m, &registry).unwrap();
        assert!(m.get_attr("sys").unwrap().is(&own_sys));
    }

    #[test]
    fn test_dotted_import_and_from() {
        let vm = Vm::new();
        let registry = ModuleRegistry::new();
        let sub = Module::new_object("pkg.sub");
        sub.as_module()
            .unwrap()
            .set_attr("VALUE", ObjRef::int(3))
            .unwrap();
        registry.register("pkg.sub", sub.clone()).unwrap();

        let module = scratch();
        let m = module.as_module().unwrap();
        let code = "# setup\nimport pkg.sub\nimport pkg.sub as s\nfrom pkg.sub import VALUE\n";
        vm.exec_snippet(code, m, &registry).unwrap();

        assert!(m.get_attr("pkg").unwrap().is(&registry.get("pkg").unwrap()));
        assert!(m.get_attr("s").unwrap().is(&sub));
        assert_eq!(m.get_attr("VALUE").unwrap().as_int(), Some(3));
    }

    #[test]
    fn test_unknown_module_fails() {
        let vm = Vm::new();
        let registry = ModuleRegistry::new();
        let module = scratch();
        let err = vm
            .exec_snippet("import nowhere", module.as_module().unwrap(), &registry)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Import(name) if name == "nowhere"));
    }

    #[test]
    fn test_other_statements_are_rejected() {
        let vm = Vm::new();
        let registry = ModuleRegistry::new();
        let module = scratch();
        let err = vm
            .exec_snippet("import sys\nx = 1", module.as_module().unwrap(), &registry)
            .unwrap_err();
        assert!(matches!(err, BridgeError::Snippet { line: 2, .. }));
    }

    #[test]
    fn test_import_context_stack() {
        let vm = Vm::new();
        assert_eq!(vm.import_context(), None);
        vm.push_import(ImportContext::new("pkg.mod", "/x/y/mod.so"));
        vm.push_import(ImportContext::default());
        assert_eq!(vm.import_context(), Some(ImportContext::default()));
        vm.pop_import();
        assert_eq!(
            vm.import_context().and_then(|c| c.name),
            Some("pkg.mod".to_string())
        );
    }
}
