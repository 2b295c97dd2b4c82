//! Raw message sends through libffi.

use crate::{
    error::{BridgeError, Result},
    runtime::{ClassPtr, ForeignRuntime, ObjPtr, SelPtr},
    types::TypeDescriptor,
    utils::format_address,
    value::{
        layout::{ffi_type, type_layout, HasLayout},
        slot::ForeignSlot,
    },
};
use libffi::middle::{Cif, CodePtr, Type};
use std::{ffi::c_void, mem::size_of};
use tracing::trace;

pub mod ownership;

/// Everything the engine needs to know about one send besides the argument
/// values.
pub struct CallFrame<'a> {
    pub receiver: ObjPtr,
    /// Class whose thread-affinity rule applies.
    pub class: ClassPtr,
    pub selector: SelPtr,
    pub selector_name: &'a str,
    /// Types of every argument slot after the implicit receiver and selector,
    /// including a variadic tail.
    pub arguments: &'a [TypeDescriptor],
    /// How many of `arguments` are fixed; the rest are variadic.
    pub fixed_arguments: usize,
    pub return_type: &'a TypeDescriptor,
}

impl CallFrame<'_> {
    pub fn is_variadic(&self) -> bool {
        self.fixed_arguments < self.arguments.len()
    }
}

/// A send that passed every pre-call check.
pub struct PreparedCall {
    cif: Cif,
    target: CodePtr,
    ret_size: usize,
}

#[derive(Debug, Default)]
pub struct InvocationEngine;

impl InvocationEngine {
    pub fn new() -> Self {
        Self
    }

    fn build_cif(frame: &CallFrame<'_>) -> Result<Cif> {
        let mut types = vec![Type::pointer(), Type::pointer()];
        for arg in frame.arguments {
            if *arg == TypeDescriptor::Void {
                return Err(BridgeError::Unsupported("void argument".to_string()));
            }
            types.push(ffi_type(arg)?);
        }
        let ret = match frame.return_type {
            TypeDescriptor::Void => Type::void(),
            other => ffi_type(other)?,
        };
        Ok(if frame.is_variadic() {
            Cif::new_variadic(types, frame.fixed_arguments + 2, ret)
        } else {
            Cif::new(types, ret)
        })
    }

    /// Every check that can reject a send without calling into the foreign
    /// runtime: thread affinity, the call interface and the dispatch target.
    pub fn prepare(&self, runtime: &dyn ForeignRuntime, frame: &CallFrame<'_>) -> Result<PreparedCall> {
        if !runtime.affinity(frame.class).permits_current() {
            return Err(BridgeError::WrongThread {
                class: runtime.class_name(frame.class)?,
            });
        }

        let cif = Self::build_cif(frame)?;
        let ret_size = type_layout(frame.return_type)?.size();
        let struct_return = match frame.return_type {
            TypeDescriptor::Struct(_) | TypeDescriptor::Union(_) | TypeDescriptor::Array { .. } => {
                Some(ret_size)
            }
            _ => None,
        };
        let target = runtime.message_target(frame.receiver, frame.selector, struct_return)?;
        Ok(PreparedCall {
            cif,
            target,
            ret_size,
        })
    }

    /// Send the message described by `frame` with the already marshalled
    /// `args` and return the raw return slot.
    ///
    /// Fails before calling when the class may not be messaged from this
    /// thread, and after calling when the foreign runtime left an exception
    /// pending.
    pub fn invoke(
        &self,
        runtime: &dyn ForeignRuntime,
        frame: &CallFrame<'_>,
        args: &mut [ForeignSlot],
    ) -> Result<ForeignSlot> {
        let prepared = self.prepare(runtime, frame)?;
        self.call(runtime, frame, &prepared, args)
    }

    /// Perform a send already checked by [`InvocationEngine::prepare`].
    pub fn call(
        &self,
        runtime: &dyn ForeignRuntime,
        frame: &CallFrame<'_>,
        prepared: &PreparedCall,
        args: &mut [ForeignSlot],
    ) -> Result<ForeignSlot> {
        if args.len() != frame.arguments.len() {
            return Err(BridgeError::ArgumentCount {
                selector: frame.selector_name.to_string(),
                expected: frame.arguments.len(),
                found: args.len(),
            });
        }
        let PreparedCall {
            cif,
            target,
            ret_size,
        } = prepared;
        let ret_size = *ret_size;

        let mut ret = ForeignSlot::zeroed(ret_size);
        // libffi widens integral returns to a full register.
        ret.reserve_capacity(ret_size.max(size_of::<u64>()));

        let mut receiver = frame.receiver.as_ptr();
        let mut selector = frame.selector.as_ptr();
        let mut arg_ptrs: Vec<*mut c_void> = Vec::with_capacity(args.len() + 2);
        arg_ptrs.push(&mut receiver as *mut *mut c_void as *mut c_void);
        arg_ptrs.push(&mut selector as *mut *mut c_void as *mut c_void);
        arg_ptrs.extend(args.iter_mut().map(|a| a.as_mut_ptr() as *mut c_void));

        trace!(
            receiver = %format_address(frame.receiver.address()),
            selector = frame.selector_name,
            args = args.len(),
            variadic = frame.is_variadic(),
            "sending message"
        );
        // SAFETY: the cif describes exactly the slots in `arg_ptrs`, each of
        // which points at storage at least as large as its ffi type, and the
        // return buffer is at least one register wide.
        unsafe {
            libffi::raw::ffi_call(
                cif.as_raw_ptr(),
                Some(*target.as_fun()),
                ret.as_mut_ptr() as *mut c_void,
                arg_ptrs.as_mut_ptr(),
            );
        }

        if cfg!(target_endian = "big")
            && matches!(
                frame.return_type,
                TypeDescriptor::Bool | TypeDescriptor::Integer { .. }
            )
            && ret_size < size_of::<u64>()
        {
            let word = size_of::<u64>();
            let value = ret.raw_bytes()[word - ret_size..word].to_vec();
            ret.bytes_mut().copy_from_slice(&value);
        }

        if let Some(exception) = runtime.take_exception() {
            trace!(selector = frame.selector_name, %exception, "foreign exception");
            return Err(BridgeError::ForeignException(exception));
        }
        trace!(selector = frame.selector_name, ret = ?ret, "message returned");
        Ok(ret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::local::{self, LocalRuntime};
    use std::{ffi::c_void, sync::Arc};

    extern "C" fn add(_this: *mut c_void, _cmd: *const c_void, a: i32, b: i32) -> i32 {
        a + b
    }

    extern "C" fn fail(_this: *mut c_void, _cmd: *const c_void) {
        local::raise("NSInternalInconsistencyException", "boom");
    }

    fn frame<'a>(
        rt: &LocalRuntime,
        obj: ObjPtr,
        sel: &'a str,
        args: &'a [TypeDescriptor],
        ret: &'a TypeDescriptor,
    ) -> CallFrame<'a> {
        CallFrame {
            receiver: obj,
            class: rt.object_class(obj).unwrap(),
            selector: rt.register_selector(sel).unwrap(),
            selector_name: sel,
            arguments: args,
            fixed_arguments: args.len(),
            return_type: ret,
        }
    }

    fn int_slot(v: i32) -> ForeignSlot {
        ForeignSlot::from_bytes(&v.to_ne_bytes())
    }

    #[test]
    fn test_invoke_scalar() {
        let rt = Arc::new(LocalRuntime::new());
        rt.class("Adder")
            .instance_method("add:to:", "i24@0:8i16i20", add as *const c_void)
            .register()
            .unwrap();
        let obj = rt.instantiate("Adder").unwrap();
        let args = [TypeDescriptor::int(32), TypeDescriptor::int(32)];
        let ret_ty = TypeDescriptor::int(32);
        let f = frame(&rt, obj, "add:to:", &args, &ret_ty);
        let ret = InvocationEngine::new()
            .invoke(&*rt, &f, &mut [int_slot(40), int_slot(2)])
            .unwrap();
        assert_eq!(ret.bytes(), 42i32.to_ne_bytes());
        rt.release(obj);
    }

    #[test]
    fn test_exception_is_surfaced() {
        let rt = Arc::new(LocalRuntime::new());
        rt.class("Failing")
            .instance_method("fail", "v16@0:8", fail as *const c_void)
            .register()
            .unwrap();
        let obj = rt.instantiate("Failing").unwrap();
        let void = TypeDescriptor::Void;
        let f = frame(&rt, obj, "fail", &[], &void);
        let err = InvocationEngine::new().invoke(&*rt, &f, &mut []).unwrap_err();
        match err {
            BridgeError::ForeignException(e) => assert_eq!(e.reason, "boom"),
            other => panic!("unexpected {other:?}"),
        }
        rt.release(obj);
    }

    #[test]
    fn test_wrong_thread_is_rejected_before_calling() {
        let rt = Arc::new(LocalRuntime::new());
        rt.class("MainOnly")
            .thread_affine()
            .instance_method("fail", "v16@0:8", fail as *const c_void)
            .register()
            .unwrap();
        let obj = rt.instantiate("MainOnly").unwrap();
        let rt2 = rt.clone();
        let err = std::thread::spawn(move || {
            let void = TypeDescriptor::Void;
            let f = frame(&rt2, obj, "fail", &[], &void);
            InvocationEngine::new().invoke(&*rt2, &f, &mut [])
        })
        .join()
        .unwrap()
        .unwrap_err();
        assert_eq!(
            err,
            BridgeError::WrongThread {
                class: "MainOnly".into()
            }
        );
        assert!(rt.take_exception().is_none());
        rt.release(obj);
    }

    #[test]
    fn test_prepare_rejects_bit_field_slots() {
        let rt = Arc::new(LocalRuntime::new());
        let obj = rt.instantiate("NSObject").unwrap();
        let args = [TypeDescriptor::BitField { width: 3 }];
        let void = TypeDescriptor::Void;
        let f = frame(&rt, obj, "init", &args, &void);
        assert!(matches!(
            InvocationEngine::new().prepare(&*rt, &f),
            Err(BridgeError::Unsupported(_))
        ));
        rt.release(obj);
    }

    #[test]
    fn test_slot_count_must_match() {
        let rt = Arc::new(LocalRuntime::new());
        let obj = rt.instantiate("NSObject").unwrap();
        let args = [TypeDescriptor::int(32)];
        let void = TypeDescriptor::Void;
        let f = frame(&rt, obj, "init", &args, &void);
        assert!(matches!(
            InvocationEngine::new().invoke(&*rt, &f, &mut []),
            Err(BridgeError::ArgumentCount { .. })
        ));
        rt.release(obj);
    }
}
