//! The foreign object runtime as seen by the bridge.
//!
//! [`ForeignRuntime`] is the read-only metadata source and message dispatch
//! mechanism the rest of the crate is written against. [`libobjc::LibObjc`]
//! talks to the platform runtime; [`local::LocalRuntime`] is an in-process
//! runtime with the same object model.

use crate::error::{ForeignException, Result};
use libffi::middle::CodePtr;
use std::{ffi::c_void, fmt, ptr::NonNull, thread::ThreadId};

pub mod libobjc;
pub mod local;

macro_rules! raw_handle {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(transparent)]
        pub struct $name(NonNull<c_void>);

        // SAFETY: the handle is an opaque address. The runtime that produced it
        // is responsible for synchronising access to what it points at.
        unsafe impl Send for $name {}
        unsafe impl Sync for $name {}

        impl $name {
            pub fn from_raw(ptr: *mut c_void) -> Option<Self> {
                NonNull::new(ptr).map(Self)
            }

            pub fn as_ptr(self) -> *mut c_void {
                self.0.as_ptr()
            }

            pub fn address(self) -> usize {
                self.0.as_ptr() as usize
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(
                    f,
                    "{}({})",
                    stringify!($name),
                    crate::utils::format_address(self.address())
                )
            }
        }
    };
}

raw_handle!(
    /// An object reference: an instance, a class object or a protocol object.
    ObjPtr
);
raw_handle!(ClassPtr);
raw_handle!(ProtocolPtr);
raw_handle!(SelPtr);

impl ClassPtr {
    pub fn as_object(self) -> ObjPtr {
        ObjPtr(self.0)
    }
}

impl ProtocolPtr {
    pub fn as_object(self) -> ObjPtr {
        ObjPtr(self.0)
    }
}

impl ObjPtr {
    pub fn as_class(self) -> ClassPtr {
        ClassPtr(self.0)
    }

    pub fn as_protocol(self) -> ProtocolPtr {
        ProtocolPtr(self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MethodInfo {
    pub selector: String,
    pub encoding: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PropertyInfo {
    pub name: String,
    pub attributes: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IvarInfo {
    pub name: String,
    pub encoding: String,
    pub offset: isize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectKind {
    Instance,
    Class,
    Protocol,
}

/// Which threads may message instances of a class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadAffinity {
    Any,
    Thread(ThreadId),
}

impl ThreadAffinity {
    pub fn permits_current(&self) -> bool {
        match self {
            ThreadAffinity::Any => true,
            ThreadAffinity::Thread(id) => *id == std::thread::current().id(),
        }
    }
}

pub trait ForeignRuntime: Send + Sync {
    /// Short identifier used in log output.
    fn name(&self) -> &str;

    fn lookup_class(&self, name: &str) -> Option<ClassPtr>;
    fn lookup_protocol(&self, name: &str) -> Option<ProtocolPtr>;

    fn class_name(&self, class: ClassPtr) -> Result<String>;
    fn superclass(&self, class: ClassPtr) -> Option<ClassPtr>;
    fn metaclass(&self, class: ClassPtr) -> Option<ClassPtr>;
    fn class_protocols(&self, class: ClassPtr) -> Vec<ProtocolPtr>;
    /// Methods declared directly on `class`. Pass the metaclass to list
    /// class methods.
    fn class_methods(&self, class: ClassPtr) -> Vec<MethodInfo>;
    fn class_properties(&self, class: ClassPtr) -> Vec<PropertyInfo>;
    fn class_ivars(&self, class: ClassPtr) -> Vec<IvarInfo>;

    fn protocol_name(&self, protocol: ProtocolPtr) -> Result<String>;
    fn protocol_protocols(&self, protocol: ProtocolPtr) -> Vec<ProtocolPtr>;
    fn protocol_methods(&self, protocol: ProtocolPtr, required: bool, instance: bool)
        -> Vec<MethodInfo>;
    fn protocol_properties(&self, protocol: ProtocolPtr, required: bool) -> Vec<PropertyInfo>;

    /// The class of an object; the metaclass when `obj` is a class.
    fn object_class(&self, obj: ObjPtr) -> Option<ClassPtr>;
    fn object_kind(&self, obj: ObjPtr) -> ObjectKind;

    fn register_selector(&self, name: &str) -> Result<SelPtr>;
    fn selector_name(&self, sel: SelPtr) -> Result<String>;
    fn responds_to(&self, class: ClassPtr, sel: SelPtr) -> bool;

    /// Code to call as `fn(receiver, selector, args...)` to send `sel` to
    /// `receiver`. `struct_return` is the size of a by-value aggregate
    /// return, if any.
    fn message_target(
        &self,
        receiver: ObjPtr,
        sel: SelPtr,
        struct_return: Option<usize>,
    ) -> Result<CodePtr>;

    fn retain(&self, obj: ObjPtr);
    fn release(&self, obj: ObjPtr);

    /// Exception raised by the last call on this thread, if any.
    fn take_exception(&self) -> Option<ForeignException>;

    fn affinity(&self, class: ClassPtr) -> ThreadAffinity;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handles_are_rejected() {
        assert!(ObjPtr::from_raw(std::ptr::null_mut()).is_none());
    }

    #[test]
    fn test_handle_conversions_keep_address() {
        let mut x = 0u64;
        let obj = ObjPtr::from_raw(&mut x as *mut u64 as *mut c_void).unwrap();
        assert_eq!(obj.as_class().as_object(), obj);
        assert_eq!(obj.as_protocol().address(), obj.address());
    }

    #[test]
    fn test_affinity() {
        assert!(ThreadAffinity::Any.permits_current());
        let here = ThreadAffinity::Thread(std::thread::current().id());
        assert!(here.permits_current());
        let elsewhere = std::thread::spawn(move || here.permits_current())
            .join()
            .unwrap();
        assert!(!elsewhere);
    }
}
