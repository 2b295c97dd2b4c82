use super::{
    ClassPtr, ForeignRuntime, IvarInfo, MethodInfo, ObjPtr, ObjectKind, PropertyInfo,
    ProtocolPtr, SelPtr, ThreadAffinity,
};
use crate::error::{BridgeError, ForeignException, Result};
use libffi::middle::CodePtr;
use libloading::Library;
use std::ffi::{c_char, c_uint, c_void, CStr, CString};
use tracing::{debug, warn};

#[cfg(target_os = "macos")]
const CANDIDATES: &[&str] = &["/usr/lib/libobjc.A.dylib", "libobjc.A.dylib"];
#[cfg(not(target_os = "macos"))]
const CANDIDATES: &[&str] = &["libobjc.so.4", "libobjc.so"];

type Id = *mut c_void;
type Sel = *mut c_void;

#[repr(C)]
#[derive(Clone, Copy)]
struct MethodDescription {
    name: Sel,
    types: *const c_char,
}

/// # Safety
/// `T` must match the C signature of `name`.
unsafe fn symbol<T: Copy>(lib: &Library, name: &str) -> Result<T> {
    let bytes = format!("{name}\0");
    lib.get::<T>(bytes.as_bytes())
        .map(|s| *s)
        .map_err(|e| BridgeError::RuntimeLoad(format!("missing symbol {name}: {e}")))
}

macro_rules! api {
    ($($name:ident: fn($($arg:ty),*) $(-> $ret:ty)?;)*) => {
        #[allow(non_snake_case)]
        struct Api {
            $($name: unsafe extern "C" fn($($arg),*) $(-> $ret)?,)*
            objc_msgSend: unsafe extern "C" fn(),
            objc_msgSend_stret: Option<unsafe extern "C" fn()>,
            protocol_copyPropertyList2:
                Option<unsafe extern "C" fn(Id, *mut c_uint, bool, bool) -> *mut Id>,
            free: unsafe extern "C" fn(*mut c_void),
        }

        impl Api {
            fn load(lib: &Library, process: &Library) -> Result<Self> {
                // SAFETY: the declared signatures match the runtime's C API.
                unsafe {
                    Ok(Self {
                        $($name: symbol(lib, stringify!($name))?,)*
                        objc_msgSend: symbol(lib, "objc_msgSend")?,
                        objc_msgSend_stret: symbol(lib, "objc_msgSend_stret").ok(),
                        protocol_copyPropertyList2: symbol(lib, "protocol_copyPropertyList2").ok(),
                        free: symbol(process, "free")?,
                    })
                }
            }
        }
    };
}

api! {
    objc_getClass: fn(*const c_char) -> Id;
    objc_getProtocol: fn(*const c_char) -> Id;
    class_getName: fn(Id) -> *const c_char;
    class_getSuperclass: fn(Id) -> Id;
    class_isMetaClass: fn(Id) -> bool;
    class_copyProtocolList: fn(Id, *mut c_uint) -> *mut Id;
    class_copyMethodList: fn(Id, *mut c_uint) -> *mut Id;
    class_copyPropertyList: fn(Id, *mut c_uint) -> *mut Id;
    class_copyIvarList: fn(Id, *mut c_uint) -> *mut Id;
    class_respondsToSelector: fn(Id, Sel) -> bool;
    method_getName: fn(Id) -> Sel;
    method_getTypeEncoding: fn(Id) -> *const c_char;
    property_getName: fn(Id) -> *const c_char;
    property_getAttributes: fn(Id) -> *const c_char;
    ivar_getName: fn(Id) -> *const c_char;
    ivar_getTypeEncoding: fn(Id) -> *const c_char;
    ivar_getOffset: fn(Id) -> isize;
    protocol_getName: fn(Id) -> *const c_char;
    protocol_copyProtocolList: fn(Id, *mut c_uint) -> *mut Id;
    protocol_copyMethodDescriptionList: fn(Id, bool, bool, *mut c_uint) -> *mut MethodDescription;
    protocol_copyPropertyList: fn(Id, *mut c_uint) -> *mut Id;
    object_getClass: fn(Id) -> Id;
    sel_registerName: fn(*const c_char) -> Sel;
    sel_getName: fn(Sel) -> *const c_char;
    objc_retain: fn(Id) -> Id;
    objc_release: fn(Id);
}

/// The platform Objective-C runtime, loaded at run time.
///
/// Exceptions thrown by the platform runtime unwind through foreign frames
/// and are not caught here; `take_exception` always reports none.
pub struct LibObjc {
    api: Api,
    _library: Library,
    _process: Library,
}

impl LibObjc {
    pub fn load() -> Result<Self> {
        let mut errors = vec![];
        for candidate in CANDIDATES {
            match Self::open(candidate) {
                Ok(rt) => return Ok(rt),
                Err(e) => errors.push(e.to_string()),
            }
        }
        Err(BridgeError::RuntimeLoad(errors.join("; ")))
    }

    #[cfg(unix)]
    pub fn open(path: &str) -> Result<Self> {
        // SAFETY: loading libobjc runs its initialisers, which have no
        // preconditions.
        let library = unsafe { Library::new(path) }
            .map_err(|e| BridgeError::RuntimeLoad(format!("{path}: {e}")))?;
        let process: Library = libloading::os::unix::Library::this().into();
        let api = Api::load(&library, &process)?;
        debug!(path, "loaded objc runtime");
        Ok(Self {
            api,
            _library: library,
            _process: process,
        })
    }

    #[cfg(not(unix))]
    pub fn open(path: &str) -> Result<Self> {
        Err(BridgeError::RuntimeLoad(format!(
            "{path}: the objc runtime is only supported on unix platforms"
        )))
    }

    fn property_info(&self, property: Id) -> Result<PropertyInfo> {
        // SAFETY: `property` came from a property list of this runtime.
        unsafe {
            Ok(PropertyInfo {
                name: Self::string((self.api.property_getName)(property))?,
                attributes: Self::string((self.api.property_getAttributes)(property))?,
            })
        }
    }

    /// Copy out a runtime-allocated list and free it.
    fn copy_list<T: Copy>(&self, fetch: impl FnOnce(*mut c_uint) -> *mut T) -> Vec<T> {
        let mut count: c_uint = 0;
        let list = fetch(&mut count);
        if list.is_null() {
            return vec![];
        }
        // SAFETY: the runtime returned `count` contiguous entries.
        let out = unsafe { std::slice::from_raw_parts(list, count as usize) }.to_vec();
        // SAFETY: lists from copy* functions are malloc'd and owned by us.
        unsafe { (self.api.free)(list as *mut c_void) };
        out
    }

    /// Names are looked up again by their text, so a name that is not UTF-8
    /// is an error rather than a lossy copy.
    fn string(ptr: *const c_char) -> Result<String> {
        if ptr.is_null() {
            return Ok(String::new());
        }
        // SAFETY: the runtime returns NUL-terminated strings it keeps alive.
        let raw = unsafe { CStr::from_ptr(ptr) };
        raw.to_str().map(str::to_owned).map_err(|_| {
            BridgeError::Encoding(format!(
                "runtime name {:?} is not valid UTF-8",
                raw.to_string_lossy()
            ))
        })
    }

    /// Metadata entries whose text is not UTF-8 cannot be named from the
    /// host and are left out of listings.
    fn keep<T>(entry: Result<T>, kind: &str) -> Option<T> {
        entry
            .map_err(|error| warn!(kind, %error, "skipping runtime metadata entry"))
            .ok()
    }

    /// Whether an aggregate return of `size` bytes goes through the hidden
    /// result pointer of `objc_msgSend_stret`.
    fn needs_stret(size: usize) -> bool {
        if cfg!(target_arch = "x86_64") {
            size > 16
        } else if cfg!(target_arch = "x86") {
            // Darwin returns 1, 2, 4 and 8 byte structs in EAX:EDX.
            !(cfg!(target_vendor = "apple") && matches!(size, 1 | 2 | 4 | 8))
        } else if cfg!(target_arch = "arm") {
            size > 4
        } else {
            false
        }
    }
}

impl ForeignRuntime for LibObjc {
    fn name(&self) -> &str {
        "libobjc"
    }

    fn lookup_class(&self, name: &str) -> Option<ClassPtr> {
        let name = CString::new(name).ok()?;
        // SAFETY: valid C string.
        ClassPtr::from_raw(unsafe { (self.api.objc_getClass)(name.as_ptr()) })
    }

    fn lookup_protocol(&self, name: &str) -> Option<ProtocolPtr> {
        let name = CString::new(name).ok()?;
        // SAFETY: valid C string.
        ProtocolPtr::from_raw(unsafe { (self.api.objc_getProtocol)(name.as_ptr()) })
    }

    fn class_name(&self, class: ClassPtr) -> Result<String> {
        // SAFETY: `class` came from this runtime.
        Self::string(unsafe { (self.api.class_getName)(class.as_ptr()) })
    }

    fn superclass(&self, class: ClassPtr) -> Option<ClassPtr> {
        // SAFETY: as above.
        ClassPtr::from_raw(unsafe { (self.api.class_getSuperclass)(class.as_ptr()) })
    }

    fn metaclass(&self, class: ClassPtr) -> Option<ClassPtr> {
        // SAFETY: a class is an object whose class is its metaclass.
        ClassPtr::from_raw(unsafe { (self.api.object_getClass)(class.as_ptr()) })
    }

    fn class_protocols(&self, class: ClassPtr) -> Vec<ProtocolPtr> {
        // SAFETY: out-pointer is valid for the call.
        self.copy_list(|n| unsafe { (self.api.class_copyProtocolList)(class.as_ptr(), n) })
            .into_iter()
            .filter_map(ProtocolPtr::from_raw)
            .collect()
    }

    fn class_methods(&self, class: ClassPtr) -> Vec<MethodInfo> {
        // SAFETY: out-pointer is valid for the call.
        self.copy_list(|n| unsafe { (self.api.class_copyMethodList)(class.as_ptr(), n) })
            .into_iter()
            .filter_map(|m| {
                // SAFETY: `m` is a method of `class`.
                let (sel, types) = unsafe {
                    (
                        (self.api.method_getName)(m),
                        (self.api.method_getTypeEncoding)(m),
                    )
                };
                // SAFETY: selectors are interned C strings.
                let selector = Self::string(unsafe { (self.api.sel_getName)(sel) });
                let info = selector.and_then(|selector| {
                    Ok(MethodInfo {
                        selector,
                        encoding: Self::string(types)?,
                    })
                });
                Self::keep(info, "method")
            })
            .collect()
    }

    fn class_properties(&self, class: ClassPtr) -> Vec<PropertyInfo> {
        // SAFETY: out-pointer is valid for the call.
        self.copy_list(|n| unsafe { (self.api.class_copyPropertyList)(class.as_ptr(), n) })
            .into_iter()
            .filter_map(|p| Self::keep(self.property_info(p), "property"))
            .collect()
    }

    fn class_ivars(&self, class: ClassPtr) -> Vec<IvarInfo> {
        // SAFETY: out-pointer is valid for the call.
        self.copy_list(|n| unsafe { (self.api.class_copyIvarList)(class.as_ptr(), n) })
            .into_iter()
            .filter_map(|i| {
                // SAFETY: `i` is an ivar of `class`.
                let info = unsafe {
                    Self::string((self.api.ivar_getName)(i)).and_then(|name| {
                        Ok(IvarInfo {
                            name,
                            encoding: Self::string((self.api.ivar_getTypeEncoding)(i))?,
                            offset: (self.api.ivar_getOffset)(i),
                        })
                    })
                };
                Self::keep(info, "ivar")
            })
            .collect()
    }

    fn protocol_name(&self, protocol: ProtocolPtr) -> Result<String> {
        // SAFETY: `protocol` came from this runtime.
        Self::string(unsafe { (self.api.protocol_getName)(protocol.as_ptr()) })
    }

    fn protocol_protocols(&self, protocol: ProtocolPtr) -> Vec<ProtocolPtr> {
        // SAFETY: out-pointer is valid for the call.
        self.copy_list(|n| unsafe { (self.api.protocol_copyProtocolList)(protocol.as_ptr(), n) })
            .into_iter()
            .filter_map(ProtocolPtr::from_raw)
            .collect()
    }

    fn protocol_methods(
        &self,
        protocol: ProtocolPtr,
        required: bool,
        instance: bool,
    ) -> Vec<MethodInfo> {
        let copy = self.api.protocol_copyMethodDescriptionList;
        // SAFETY: out-pointer is valid for the call.
        let list = self.copy_list(|n| unsafe { copy(protocol.as_ptr(), required, instance, n) });
        list.iter()
            .filter_map(|d| {
                // SAFETY: selectors are interned C strings.
                let selector = Self::string(unsafe { (self.api.sel_getName)(d.name) });
                let info = selector.and_then(|selector| {
                    Ok(MethodInfo {
                        selector,
                        encoding: Self::string(d.types)?,
                    })
                });
                Self::keep(info, "protocol method")
            })
            .collect()
    }

    fn protocol_properties(&self, protocol: ProtocolPtr, required: bool) -> Vec<PropertyInfo> {
        let list = match self.api.protocol_copyPropertyList2 {
            // SAFETY: out-pointer is valid for the call.
            Some(copy) => self.copy_list(|n| unsafe { copy(protocol.as_ptr(), n, required, true) }),
            // SAFETY: out-pointer is valid for the call.
            None if required => self.copy_list(|n| unsafe {
                (self.api.protocol_copyPropertyList)(protocol.as_ptr(), n)
            }),
            None => vec![],
        };
        list.into_iter()
            .filter_map(|p| Self::keep(self.property_info(p), "protocol property"))
            .collect()
    }

    fn object_class(&self, obj: ObjPtr) -> Option<ClassPtr> {
        // SAFETY: `obj` is a live object.
        ClassPtr::from_raw(unsafe { (self.api.object_getClass)(obj.as_ptr()) })
    }

    fn object_kind(&self, obj: ObjPtr) -> ObjectKind {
        let Some(class) = self.object_class(obj) else {
            return ObjectKind::Instance;
        };
        // SAFETY: `class` came from the runtime.
        if unsafe { (self.api.class_isMetaClass)(class.as_ptr()) } {
            ObjectKind::Class
        } else if self.class_name(class).is_ok_and(|n| n == "Protocol") {
            ObjectKind::Protocol
        } else {
            ObjectKind::Instance
        }
    }

    fn register_selector(&self, name: &str) -> Result<SelPtr> {
        let c = CString::new(name)
            .map_err(|_| BridgeError::Encoding(format!("selector {name:?} contains NUL")))?;
        // SAFETY: valid C string; registration never returns null.
        SelPtr::from_raw(unsafe { (self.api.sel_registerName)(c.as_ptr()) })
            .ok_or_else(|| BridgeError::Unsupported(format!("cannot register selector {name}")))
    }

    fn selector_name(&self, sel: SelPtr) -> Result<String> {
        // SAFETY: `sel` came from the runtime.
        Self::string(unsafe { (self.api.sel_getName)(sel.as_ptr()) })
    }

    fn responds_to(&self, class: ClassPtr, sel: SelPtr) -> bool {
        // SAFETY: both handles came from the runtime.
        unsafe { (self.api.class_respondsToSelector)(class.as_ptr(), sel.as_ptr()) }
    }

    fn message_target(
        &self,
        _receiver: ObjPtr,
        _sel: SelPtr,
        struct_return: Option<usize>,
    ) -> Result<CodePtr> {
        let send = match (struct_return, self.api.objc_msgSend_stret) {
            (Some(size), Some(stret)) if Self::needs_stret(size) => stret,
            _ => self.api.objc_msgSend,
        };
        Ok(CodePtr::from_fun(send))
    }

    fn retain(&self, obj: ObjPtr) {
        // SAFETY: `obj` is live.
        unsafe { (self.api.objc_retain)(obj.as_ptr()) };
    }

    fn release(&self, obj: ObjPtr) {
        // SAFETY: the caller owns the reference.
        unsafe { (self.api.objc_release)(obj.as_ptr()) };
    }

    fn take_exception(&self) -> Option<ForeignException> {
        None
    }

    fn affinity(&self, _class: ClassPtr) -> ThreadAffinity {
        ThreadAffinity::Any
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stret_rule() {
        if cfg!(target_arch = "x86_64") {
            assert!(!LibObjc::needs_stret(16));
            assert!(LibObjc::needs_stret(24));
        }
        if cfg!(target_arch = "aarch64") {
            assert!(!LibObjc::needs_stret(64));
        }
        if cfg!(target_arch = "x86") {
            assert!(LibObjc::needs_stret(12));
            assert_eq!(LibObjc::needs_stret(8), !cfg!(target_vendor = "apple"));
        }
        if cfg!(target_arch = "arm") {
            assert!(!LibObjc::needs_stret(4));
            assert!(LibObjc::needs_stret(8));
        }
    }

    #[test]
    fn test_names_must_be_utf8() {
        assert_eq!(LibObjc::string(std::ptr::null()).unwrap(), "");
        assert_eq!(LibObjc::string(b"NSObject\0".as_ptr().cast()).unwrap(), "NSObject");
        assert!(matches!(
            LibObjc::string(b"Bad\xff\0".as_ptr().cast()),
            Err(BridgeError::Encoding(_))
        ));
    }

    #[test]
    fn test_missing_library_is_load_error() {
        assert!(matches!(
            LibObjc::open("/nonexistent/libobjc.so"),
            Err(BridgeError::RuntimeLoad(_))
        ));
    }
}
