//! Finalization for hosted objects
//!
//! The collector keeps one reference to every object registered as
//! finalizable. An object whose only remaining owner is the collector is
//! unreachable from the hosted program; `collect` drops it and reports a
//! [`Finalization`] naming the native block it fronted. Nothing runs during
//! the drop itself: whoever calls `collect` decides what a notification means.

use std::cell::{Cell, RefCell};

use super::value::ObjRef;
use crate::runtime::heap::HeapPtr;

/// Notice that the proxy for `handle` has been collected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Finalization {
    pub handle: HeapPtr,
}

#[derive(Default)]
pub struct Collector {
    tracked: RefCell<Vec<(ObjRef, HeapPtr)>>,
    collections: Cell<usize>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, proxy: &ObjRef, handle: HeapPtr) {
        self.tracked.borrow_mut().push((proxy.clone(), handle));
    }

    /// Number of finalizable objects not yet collected.
    pub fn tracked(&self) -> usize {
        self.tracked.borrow().len()
    }

    /// Number of `collect` passes run so far.
    pub fn collections(&self) -> usize {
        self.collections.get()
    }

    pub fn collect(&self) -> Vec<Finalization> {
        self.collections.set(self.collections.get() + 1);

        let dead: Vec<(ObjRef, HeapPtr)> = {
            let mut tracked = self.tracked.borrow_mut();
            let (dead, live): (Vec<_>, Vec<_>) = tracked
                .drain(..)
                .partition(|(proxy, _)| proxy.strong_count() == 1);
            *tracked = live;
            dead
        };

        dead.into_iter()
            .map(|(proxy, handle)| {
                drop(proxy);
                Finalization { handle }
            })
            .collect()
    }
}
