//! Object bridge between a managed runtime and unmodified native extensions
//!
//! Native code sees byte-exact object blocks in an emulated heap and calls
//! back through the `extern "C"` entry points in [`runtime::stubs`]. The
//! hosted side sees ordinary objects in [`vm::value`]. A [`Bridge`] keeps the
//! two views bound to each other.

pub mod bridge;
pub mod config;
pub mod error;
pub mod module;
pub mod runtime;
pub mod vm;

pub use bridge::{Bridge, with_current};
pub use config::BridgeConfig;
pub use error::{BridgeError, BridgeResult};
pub use runtime::HeapPtr;
