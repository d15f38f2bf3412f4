//! Native modules
//!
//! - `registry` maps dotted names to module objects and links packages
//! - `builder` turns a native method table into a registered module
//! - `dispatcher` routes hosted calls to the native functions

pub mod builder;
pub mod dispatcher;
pub mod registry;

pub use builder::{DISPATCHER_ATTR, normalize_name};
pub use dispatcher::{CallingConvention, Dispatcher, FunctionTableEntry};
pub use registry::ModuleRegistry;
