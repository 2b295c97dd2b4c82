use crate::{
    runtime::{ForeignRuntime, ObjPtr},
    utils::format_address,
};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::debug;

/// Whether a host wrapper holds a reference count on its object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Ownership {
    /// The host released nothing; the object is kept alive elsewhere.
    Borrowed,
    /// The host owns one reference and releases it exactly once.
    Owned,
}

struct ObjectInner {
    ptr: ObjPtr,
    owned: AtomicBool,
    runtime: Arc<dyn ForeignRuntime>,
}

impl Drop for ObjectInner {
    fn drop(&mut self) {
        if self.owned.swap(false, Ordering::AcqRel) {
            debug!(object = %format_address(self.ptr.address()), "releasing owned object");
            self.runtime.release(self.ptr);
        }
    }
}

/// Shared host reference to a foreign object. Clones share one ownership
/// state, so an owned object is released once when the last clone drops.
#[derive(Clone)]
pub struct ObjectHandle(Arc<ObjectInner>);

impl ObjectHandle {
    pub fn new(ptr: ObjPtr, ownership: Ownership, runtime: Arc<dyn ForeignRuntime>) -> Self {
        Self(Arc::new(ObjectInner {
            ptr,
            owned: AtomicBool::new(ownership == Ownership::Owned),
            runtime,
        }))
    }

    /// Take a new reference to `ptr` and own it.
    pub fn retain(ptr: ObjPtr, runtime: Arc<dyn ForeignRuntime>) -> Self {
        runtime.retain(ptr);
        Self::new(ptr, Ownership::Owned, runtime)
    }

    pub fn ptr(&self) -> ObjPtr {
        self.0.ptr
    }

    pub fn ownership(&self) -> Ownership {
        if self.0.owned.load(Ordering::Acquire) {
            Ownership::Owned
        } else {
            Ownership::Borrowed
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ForeignRuntime> {
        &self.0.runtime
    }

    /// A new handle owning its own reference to the same object.
    pub fn retained(&self) -> Self {
        Self::retain(self.0.ptr, self.0.runtime.clone())
    }

    /// Hand one reference to a callee that consumes its receiver. An owned
    /// handle gives up its reference; a borrowed one retains first so the
    /// callee's release stays balanced.
    pub fn consume(&self) {
        if self.0.owned.swap(false, Ordering::AcqRel) {
            debug!(object = %format_address(self.0.ptr.address()), "owned receiver consumed");
        } else {
            debug!(object = %format_address(self.0.ptr.address()), "retaining borrowed receiver before consuming call");
            self.0.runtime.retain(self.0.ptr);
        }
    }

    pub fn same_object(&self, other: &ObjectHandle) -> bool {
        self.0.ptr == other.0.ptr
    }
}

impl fmt::Debug for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObjectHandle({}, {:?})",
            format_address(self.0.ptr.address()),
            self.ownership()
        )
    }
}
