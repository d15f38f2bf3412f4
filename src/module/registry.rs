use std::cell::RefCell;

use indexmap::IndexMap;
use log::debug;

use crate::error::{BridgeError, BridgeResult};
use crate::vm::value::{Module, ObjRef};

/// Unique-name module table owned by one bridge.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: RefCell<IndexMap<String, ObjRef>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<ObjRef> {
        self.modules.borrow().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.borrow().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.modules.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.borrow().is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.modules.borrow().keys().cloned().collect()
    }

    /// Put `module` under `name`, replacing any previous entry. No ancestors
    /// are created.
    pub fn insert(&self, name: &str, module: ObjRef) -> Option<ObjRef> {
        self.modules.borrow_mut().insert(name.to_string(), module)
    }

    /// Register `module` under its dotted `name`, creating any missing
    /// ancestor packages and linking each level as an attribute of its parent.
    pub fn register(&self, name: &str, module: ObjRef) -> BridgeResult<()> {
        if module.as_module().is_none() {
            return Err(BridgeError::Argument(format!(
                "cannot register '{}' object as module '{}'",
                module.kind_name(),
                name
            )));
        }
        let parts: Vec<&str> = name.split('.').collect();
        self.check_links(&parts, &module)?;

        let replaced = self.insert(name, module);
        drop(replaced);

        for depth in 1..parts.len() {
            let parent_name = parts[..depth].join(".");
            if !self.contains(&parent_name) {
                debug!("creating package '{}' for '{}'", parent_name, name);
                self.insert(&parent_name, new_package(&parent_name));
            }
        }

        for depth in 1..parts.len() {
            let parent_name = parts[..depth].join(".");
            let child_name = parts[..=depth].join(".");
            let (Some(parent), Some(child)) = (self.get(&parent_name), self.get(&child_name))
            else {
                continue;
            };
            let Some(parent) = parent.as_module() else {
                continue;
            };
            let attr = parts[depth];
            if parent.get_attr(attr).is_some_and(|existing| existing.is(&child)) {
                continue;
            }
            parent.set_attr(attr, child)?;
        }
        Ok(())
    }

    /// Fail if an existing ancestor of `parts` would refuse the link to its
    /// child. Packages this registration would create are always writable.
    fn check_links(&self, parts: &[&str], module: &ObjRef) -> BridgeResult<()> {
        for depth in 1..parts.len() {
            let parent_name = parts[..depth].join(".");
            let Some(parent) = self.get(&parent_name) else {
                continue;
            };
            let Some(parent) = parent.as_module() else {
                continue;
            };
            if !parent.is_frozen() {
                continue;
            }
            let child = if depth + 1 == parts.len() {
                Some(module.clone())
            } else {
                self.get(&parts[..=depth].join("."))
            };
            let attr = parts[depth];
            let linked = child.is_some_and(|child| {
                parent
                    .get_attr(attr)
                    .is_some_and(|existing| existing.is(&child))
            });
            if !linked {
                return Err(BridgeError::ReadOnlyAttribute {
                    module: parent_name,
                    attr: attr.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn new_package(name: &str) -> ObjRef {
    let package = Module::new_object(name);
    if let Some(m) = package.as_module() {
        let _ = m.set_attr("__doc__", ObjRef::none());
        let _ = m.set_attr("__path__", ObjRef::list(Vec::new()));
    }
    package
}
