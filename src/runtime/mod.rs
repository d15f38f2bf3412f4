//! Runtime kernel for native extensions
//!
//! This module holds everything native code touches directly:
//! - Emulated heap and block allocation (heap.rs)
//! - Byte-exact struct layouts and their field schemas (layout.rs)
//! - Signature-tagged function pointers (abi.rs)
//! - Handle/object bindings (store.rs)
//! - Reference counting and deallocation (refcount.rs)
//! - Opaque-pointer capsules (capsule.rs)
//! - Extern "C" entry points native code links against (stubs.rs)

pub mod abi;
pub mod capsule;
pub mod heap;
pub mod layout;
pub mod refcount;
pub mod store;
pub mod stubs;

use std::ffi::c_int;

/// ABI revision native modules pass to `objbridge_init_module`.
pub const ABI_VERSION: c_int = 1;

pub use abi::{FnPtr, Signature};
pub use capsule::CapsuleProxy;
pub use heap::{Allocator, HeapPtr, HeapStats, NativeHeap};
pub use store::{ObjectStore, Strength};
