// Hosted object model. Objects are reference-counted by Rust (`Rc`) and
// compared by identity: two equal ints stored separately are two objects,
// exactly like boxed values in a managed runtime.
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use indexmap::IndexMap;

use crate::error::{BridgeError, BridgeResult};

pub type Attributes = IndexMap<String, ObjRef>;

pub type CallFn = dyn Fn(&[ObjRef], &[(String, ObjRef)]) -> BridgeResult<ObjRef>;

/// A reference to a hosted object.
#[derive(Clone)]
pub struct ObjRef(Rc<Object>);

/// Non-owning reference, used where the hosted side owns an object's lifetime.
#[derive(Clone)]
pub struct WeakRef(Weak<Object>);

pub enum Object {
    None,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Tuple(Vec<ObjRef>),
    List(RefCell<Vec<ObjRef>>),
    Dict(RefCell<Attributes>),
    Module(Module),
    Function(Function),
    /// Bridge-internal state exposed to the hosted side as an opaque value.
    Foreign(Box<dyn Any>),
}

impl ObjRef {
    pub fn new(obj: Object) -> Self {
        Self(Rc::new(obj))
    }

    pub fn none() -> Self {
        Self::new(Object::None)
    }

    pub fn int(v: i64) -> Self {
        Self::new(Object::Int(v))
    }

    pub fn float(v: f64) -> Self {
        Self::new(Object::Float(v))
    }

    pub fn str(s: impl Into<String>) -> Self {
        Self::new(Object::Str(s.into()))
    }

    pub fn tuple(items: Vec<ObjRef>) -> Self {
        Self::new(Object::Tuple(items))
    }

    pub fn list(items: Vec<ObjRef>) -> Self {
        Self::new(Object::List(RefCell::new(items)))
    }

    pub fn dict(items: Attributes) -> Self {
        Self::new(Object::Dict(RefCell::new(items)))
    }

    pub fn foreign<T: Any>(value: T) -> Self {
        Self::new(Object::Foreign(Box::new(value)))
    }

    pub fn object(&self) -> &Object {
        &self.0
    }

    /// Identity of the object, stable for as long as any reference exists.
    pub fn id(&self) -> usize {
        Rc::as_ptr(&self.0) as *const () as usize
    }

    pub fn is(&self, other: &ObjRef) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn downgrade(&self) -> WeakRef {
        WeakRef(Rc::downgrade(&self.0))
    }

    /// Number of owners; the collector uses this to find unreachable objects.
    pub fn strong_count(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    pub fn is_none(&self) -> bool {
        matches!(*self.0, Object::None)
    }

    pub fn as_int(&self) -> Option<i64> {
        match *self.0 {
            Object::Int(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match *self.0 {
            Object::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &*self.0 {
            Object::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_module(&self) -> Option<&Module> {
        match &*self.0 {
            Object::Module(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match &*self.0 {
            Object::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        match &*self.0 {
            Object::Foreign(any) => any.downcast_ref(),
            _ => None,
        }
    }

    /// Items of a tuple or list, copied out.
    pub fn items(&self) -> Option<Vec<ObjRef>> {
        match &*self.0 {
            Object::Tuple(items) => Some(items.clone()),
            Object::List(items) => Some(items.borrow().clone()),
            _ => None,
        }
    }

    /// Entries of a dict, copied out.
    pub fn entries(&self) -> Option<Attributes> {
        match &*self.0 {
            Object::Dict(map) => Some(map.borrow().clone()),
            _ => None,
        }
    }

    /// Call a function object.
    pub fn call(&self, args: &[ObjRef], kwargs: &[(String, ObjRef)]) -> BridgeResult<ObjRef> {
        match &*self.0 {
            Object::Function(f) => f.call(args, kwargs),
            _ => Err(BridgeError::Argument(format!(
                "'{}' object is not callable",
                self.kind_name()
            ))),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match &*self.0 {
            Object::None => "NoneType",
            Object::Bool(_) => "bool",
            Object::Int(_) => "int",
            Object::Float(_) => "float",
            Object::Str(_) => "str",
            Object::Tuple(_) => "tuple",
            Object::List(_) => "list",
            Object::Dict(_) => "dict",
            Object::Module(_) => "module",
            Object::Function(_) => "function",
            Object::Foreign(_) => "foreign",
        }
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.0 {
            Object::None => write!(f, "None"),
            Object::Bool(b) => write!(f, "{}", b),
            Object::Int(v) => write!(f, "{}", v),
            Object::Float(v) => write!(f, "{}", v),
            Object::Str(s) => write!(f, "{:?}", s),
            Object::Tuple(items) => f.debug_tuple("").field(items).finish(),
            Object::List(items) => f.debug_list().entries(items.borrow().iter()).finish(),
            Object::Dict(map) => f.debug_map().entries(map.borrow().iter()).finish(),
            Object::Module(m) => write!(f, "<module {:?}>", m.name().unwrap_or_default()),
            Object::Function(func) => write!(f, "<function {}>", func.name),
            Object::Foreign(_) => write!(f, "<foreign object at {:#x}>", self.id()),
        }
    }
}

impl WeakRef {
    pub fn upgrade(&self) -> Option<ObjRef> {
        self.0.upgrade().map(ObjRef)
    }
}

/// A module object: a namespace dict plus a read-only switch.
pub struct Module {
    dict: ObjRef,
    frozen: Cell<bool>,
}

impl Module {
    /// Create a module object whose namespace holds only `__name__`.
    pub fn new_object(name: &str) -> ObjRef {
        let mut attrs = Attributes::new();
        attrs.insert("__name__".to_string(), ObjRef::str(name));
        ObjRef::new(Object::Module(Module {
            dict: ObjRef::dict(attrs),
            frozen: Cell::new(false),
        }))
    }

    /// The namespace dict object.
    pub fn dict(&self) -> &ObjRef {
        &self.dict
    }

    fn namespace(&self) -> &RefCell<Attributes> {
        match self.dict.object() {
            Object::Dict(map) => map,
            _ => unreachable!("module namespace is always a dict"),
        }
    }

    pub fn name(&self) -> Option<String> {
        self.get_attr("__name__")
            .and_then(|n| n.as_str().map(str::to_owned))
    }

    pub fn get_attr(&self, name: &str) -> Option<ObjRef> {
        self.namespace().borrow().get(name).cloned()
    }

    pub fn has_attr(&self, name: &str) -> bool {
        self.namespace().borrow().contains_key(name)
    }

    pub fn set_attr(&self, name: &str, value: ObjRef) -> BridgeResult<()> {
        if self.frozen.get() {
            return Err(BridgeError::ReadOnlyAttribute {
                module: self.name().unwrap_or_default(),
                attr: name.to_string(),
            });
        }
        // Replaced value is dropped after the borrow ends
        let old = self.namespace().borrow_mut().insert(name.to_string(), value);
        drop(old);
        Ok(())
    }

    pub fn attr_names(&self) -> Vec<String> {
        self.namespace().borrow().keys().cloned().collect()
    }

    /// Make every later attribute-set fail.
    pub fn freeze(&self) {
        self.frozen.set(true);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.get()
    }
}

pub struct Function {
    pub name: String,
    pub doc: Option<String>,
    call: Box<CallFn>,
}

impl Function {
    pub fn new_object(
        name: impl Into<String>,
        doc: Option<String>,
        call: impl Fn(&[ObjRef], &[(String, ObjRef)]) -> BridgeResult<ObjRef> + 'static,
    ) -> ObjRef {
        ObjRef::new(Object::Function(Function {
            name: name.into(),
            doc,
            call: Box::new(call),
        }))
    }

    pub fn call(&self, args: &[ObjRef], kwargs: &[(String, ObjRef)]) -> BridgeResult<ObjRef> {
        (self.call)(args, kwargs)
    }
}
