//! An in-process object runtime.
//!
//! Objects are heap blocks that start with an `isa` pointer and a retain
//! count, followed by ivars at offsets computed from their encodings. Classes
//! are records pointed at by their metaclass; the root metaclass inherits
//! from the root class. Method implementations are `extern "C"` functions
//! called as `fn(self, _cmd, args...)`, exactly like the platform runtime.
//!
//! Class records live as long as the runtime. Objects must not outlive the
//! runtime that allocated them.

use super::{
    ClassPtr, ForeignRuntime, IvarInfo, MethodInfo, ObjPtr, ObjectKind, PropertyInfo,
    ProtocolPtr, SelPtr, ThreadAffinity,
};
use crate::{
    error::{BridgeError, EntityKind, ForeignException, Result},
    types::decode,
    value::layout::{align_up, type_layout, HasLayout},
};
use libffi::middle::CodePtr;
use parking_lot::RwLock;
use std::{
    alloc::{self, Layout},
    cell::RefCell,
    collections::{HashMap, HashSet},
    ffi::{c_void, CString},
    ptr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
};
use tracing::{debug, trace};

const OBJECT_ALIGN: usize = 16;

#[repr(C)]
struct ObjectHeader {
    isa: *const ClassRecord,
    retain_count: AtomicUsize,
}

const HEADER_SIZE: usize = std::mem::size_of::<ObjectHeader>();

#[derive(Clone, Copy)]
struct Imp(*const c_void);

struct MethodEntry {
    name: String,
    selector: SelPtr,
    encoding: Option<String>,
    imp: Imp,
}

/// Counters shared by every class of one runtime.
#[derive(Debug, Default)]
pub struct ObjectStats {
    allocations: AtomicUsize,
    live: AtomicUsize,
    retains: AtomicUsize,
    releases: AtomicUsize,
}

impl ObjectStats {
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    pub fn live_objects(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn retains(&self) -> usize {
        self.retains.load(Ordering::Relaxed)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::Relaxed)
    }
}

#[repr(C)]
struct ClassRecord {
    // Must stay first so class pointers read like object pointers.
    isa: *const ClassRecord,
    name: String,
    superclass: *const ClassRecord,
    instance_size: usize,
    methods: Vec<MethodEntry>,
    ivars: Vec<IvarInfo>,
    properties: Vec<PropertyInfo>,
    protocols: Vec<ProtocolPtr>,
    affinity: ThreadAffinity,
    stats: Arc<ObjectStats>,
}

// SAFETY: records are immutable once registered apart from atomics, and the
// raw pointers they hold point at other records owned by the same runtime.
unsafe impl Send for ClassRecord {}
unsafe impl Sync for ClassRecord {}

impl ClassRecord {
    fn superclass(&self) -> Option<&ClassRecord> {
        // SAFETY: superclass pointers are null or point at live records.
        unsafe { self.superclass.as_ref() }
    }

    fn chain(&self) -> impl Iterator<Item = &ClassRecord> {
        std::iter::successors(Some(self), |c| c.superclass())
    }

    fn find_imp(&self, sel: SelPtr) -> Option<Imp> {
        self.chain()
            .flat_map(|c| c.methods.iter())
            .find(|m| m.selector == sel)
            .map(|m| m.imp)
    }

    fn as_ptr(&self) -> ClassPtr {
        ClassPtr(ptr::NonNull::from(self).cast())
    }
}

struct ProtocolMethod {
    info: MethodInfo,
    required: bool,
    instance: bool,
}

struct ProtocolRecord {
    name: String,
    protocols: Vec<ProtocolPtr>,
    methods: Vec<ProtocolMethod>,
    properties: Vec<(PropertyInfo, bool)>,
}

#[derive(Default)]
struct Tables {
    classes: HashMap<String, Box<ClassRecord>>,
    metaclasses: Vec<Box<ClassRecord>>,
    class_addrs: HashSet<usize>,
    protocols: HashMap<String, Box<ProtocolRecord>>,
    protocol_addrs: HashSet<usize>,
    selectors: HashMap<String, CString>,
    selector_names: HashMap<usize, String>,
}

impl Tables {
    fn intern(&mut self, name: &str) -> Result<SelPtr> {
        if let Some(c) = self.selectors.get(name) {
            return Ok(sel_of(c));
        }
        let c = CString::new(name)
            .map_err(|_| BridgeError::Encoding(format!("selector {name:?} contains NUL")))?;
        let sel = sel_of(&c);
        self.selector_names.insert(sel.address(), name.to_string());
        self.selectors.insert(name.to_string(), c);
        Ok(sel)
    }
}

fn sel_of(c: &CString) -> SelPtr {
    // A CString's buffer is never null.
    SelPtr(ptr::NonNull::from(c.as_bytes_with_nul()).cast())
}

thread_local! {
    static PENDING: RefCell<Option<ForeignException>> = const { RefCell::new(None) };
}

/// Raise an exception from inside a method implementation. The bridge picks
/// it up when the call returns.
pub fn raise(name: &str, reason: &str) {
    PENDING.with(|p| {
        *p.borrow_mut() = Some(ForeignException {
            name: name.to_string(),
            reason: reason.to_string(),
            address: None,
        })
    });
}

/// `+alloc`: a zeroed instance of the receiving class with a retain count
/// of one.
pub extern "C" fn alloc_instance(cls: *mut c_void, _cmd: *const c_void) -> *mut c_void {
    // SAFETY: the receiver of a class method is a class record.
    let record = unsafe { &*(cls as *const ClassRecord) };
    let Ok(layout) = Layout::from_size_align(record.instance_size, OBJECT_ALIGN) else {
        return ptr::null_mut();
    };
    // SAFETY: instance_size is at least HEADER_SIZE, so the layout is non-zero.
    let obj = unsafe { alloc::alloc_zeroed(layout) };
    if obj.is_null() {
        return ptr::null_mut();
    }
    // SAFETY: freshly allocated and large enough for the header.
    unsafe {
        ptr::write(
            obj as *mut ObjectHeader,
            ObjectHeader {
                isa: record,
                retain_count: AtomicUsize::new(1),
            },
        );
    }
    record.stats.allocations.fetch_add(1, Ordering::Relaxed);
    record.stats.live.fetch_add(1, Ordering::Relaxed);
    obj as *mut c_void
}

/// `-init` and `-self`: returns the receiver.
pub extern "C" fn init_identity(this: *mut c_void, _cmd: *const c_void) -> *mut c_void {
    this
}

extern "C" fn retain_count_imp(this: *mut c_void, _cmd: *const c_void) -> u64 {
    // SAFETY: only registered on instances.
    unsafe { (*(this as *const ObjectHeader)).retain_count.load(Ordering::Acquire) as u64 }
}

/// Pointer to the ivar `name` of `obj`, looked up through its class chain.
///
/// # Safety
/// `obj` must be a live instance allocated by a [`LocalRuntime`] and `T`
/// must match the ivar's encoding.
pub unsafe fn ivar<T>(obj: *mut c_void, name: &str) -> Option<*mut T> {
    let record = &*(*(obj as *const ObjectHeader)).isa;
    let info = record
        .chain()
        .flat_map(|c| c.ivars.iter())
        .find(|i| i.name == name)?;
    Some((obj as *mut u8).offset(info.offset) as *mut T)
}

/// Retain an instance allocated by a [`LocalRuntime`].
///
/// # Safety
/// `obj` must be a live instance.
pub unsafe fn retain_object(obj: *mut c_void) {
    let header = &*(obj as *const ObjectHeader);
    header.retain_count.fetch_add(1, Ordering::AcqRel);
    (&(*header.isa).stats).retains.fetch_add(1, Ordering::Relaxed);
}

/// Release an instance allocated by a [`LocalRuntime`], freeing it when the
/// count reaches zero.
///
/// # Safety
/// `obj` must be a live instance and the caller must own the reference.
pub unsafe fn release_object(obj: *mut c_void) {
    let header = &*(obj as *const ObjectHeader);
    let record = &*header.isa;
    record.stats.releases.fetch_add(1, Ordering::Relaxed);
    if header.retain_count.fetch_sub(1, Ordering::AcqRel) == 1 {
        trace!(class = %record.name, "deallocating instance");
        record.stats.live.fetch_sub(1, Ordering::Relaxed);
        let layout = Layout::from_size_align_unchecked(record.instance_size, OBJECT_ALIGN);
        alloc::dealloc(obj as *mut u8, layout);
    }
}

pub struct LocalRuntime {
    tables: RwLock<Tables>,
    stats: Arc<ObjectStats>,
}

impl Default for LocalRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalRuntime {
    /// A runtime holding only the root class `NSObject` with `+alloc`,
    /// `+new`, `-init`, `-self` and `-retainCount`.
    pub fn new() -> Self {
        let this = Self {
            tables: RwLock::new(Tables::default()),
            stats: Arc::new(ObjectStats::default()),
        };
        let root = this
            .class("NSObject")
            .root()
            .class_method("alloc", "@16@0:8", alloc_instance as *const c_void)
            .class_method("new", "@16@0:8", alloc_instance as *const c_void)
            .instance_method("init", "@16@0:8", init_identity as *const c_void)
            .instance_method("self", "@16@0:8", init_identity as *const c_void)
            .instance_method("retainCount", "Q16@0:8", retain_count_imp as *const c_void)
            .register();
        if let Err(e) = root {
            unreachable!("root class registration cannot fail: {e}");
        }
        this
    }

    pub fn stats(&self) -> &ObjectStats {
        &self.stats
    }

    pub fn class(&self, name: &str) -> ClassBuilder<'_> {
        ClassBuilder {
            runtime: self,
            name: name.to_string(),
            superclass: Some("NSObject".to_string()),
            ivars: vec![],
            instance_methods: vec![],
            class_methods: vec![],
            properties: vec![],
            class_properties: vec![],
            protocols: vec![],
            affinity: ThreadAffinity::Any,
        }
    }

    pub fn protocol(&self, name: &str) -> ProtocolBuilder<'_> {
        ProtocolBuilder {
            runtime: self,
            name: name.to_string(),
            protocols: vec![],
            methods: vec![],
            properties: vec![],
        }
    }

    /// Allocate an instance of `class` the way `+alloc` does.
    pub fn instantiate(&self, class: &str) -> Result<ObjPtr> {
        let cls = self
            .lookup_class(class)
            .ok_or_else(|| BridgeError::not_found(EntityKind::Class, class))?;
        ObjPtr::from_raw(alloc_instance(cls.as_ptr(), ptr::null()))
            .ok_or_else(|| BridgeError::Unsupported(format!("allocation of {class} failed")))
    }

    pub fn retain_count(&self, obj: ObjPtr) -> usize {
        match self.object_kind(obj) {
            // SAFETY: instances start with an ObjectHeader.
            ObjectKind::Instance => unsafe {
                (*(obj.as_ptr() as *const ObjectHeader))
                    .retain_count
                    .load(Ordering::Acquire)
            },
            _ => usize::MAX,
        }
    }

    fn record(&self, class: ClassPtr) -> &ClassRecord {
        // SAFETY: ClassPtrs handed out by this runtime point at boxed records
        // that live as long as `self`.
        unsafe { &*(class.as_ptr() as *const ClassRecord) }
    }

    fn protocol_record(&self, protocol: ProtocolPtr) -> &ProtocolRecord {
        // SAFETY: as for class records.
        unsafe { &*(protocol.as_ptr() as *const ProtocolRecord) }
    }
}

pub struct ClassBuilder<'a> {
    runtime: &'a LocalRuntime,
    name: String,
    superclass: Option<String>,
    ivars: Vec<(String, String)>,
    instance_methods: Vec<(String, Option<String>, Imp)>,
    class_methods: Vec<(String, Option<String>, Imp)>,
    properties: Vec<PropertyInfo>,
    class_properties: Vec<PropertyInfo>,
    protocols: Vec<String>,
    affinity: ThreadAffinity,
}

impl<'a> ClassBuilder<'a> {
    pub fn superclass(mut self, name: &str) -> Self {
        self.superclass = Some(name.to_string());
        self
    }

    pub fn root(mut self) -> Self {
        self.superclass = None;
        self
    }

    pub fn ivar(mut self, name: &str, encoding: &str) -> Self {
        self.ivars.push((name.to_string(), encoding.to_string()));
        self
    }

    pub fn instance_method(mut self, selector: &str, encoding: &str, imp: *const c_void) -> Self {
        self.instance_methods
            .push((selector.to_string(), Some(encoding.to_string()), Imp(imp)));
        self
    }

    pub fn class_method(mut self, selector: &str, encoding: &str, imp: *const c_void) -> Self {
        self.class_methods
            .push((selector.to_string(), Some(encoding.to_string()), Imp(imp)));
        self
    }

    /// An instance method that dispatches but publishes no type metadata.
    pub fn dynamic_method(mut self, selector: &str, imp: *const c_void) -> Self {
        self.instance_methods
            .push((selector.to_string(), None, Imp(imp)));
        self
    }

    pub fn property(mut self, name: &str, attributes: &str) -> Self {
        self.properties.push(PropertyInfo {
            name: name.to_string(),
            attributes: attributes.to_string(),
        });
        self
    }

    pub fn class_property(mut self, name: &str, attributes: &str) -> Self {
        self.class_properties.push(PropertyInfo {
            name: name.to_string(),
            attributes: attributes.to_string(),
        });
        self
    }

    pub fn protocol(mut self, name: &str) -> Self {
        self.protocols.push(name.to_string());
        self
    }

    /// Only the registering thread may message this class and its instances.
    pub fn thread_affine(mut self) -> Self {
        self.affinity = ThreadAffinity::Thread(thread::current().id());
        self
    }

    pub fn register(self) -> Result<ClassPtr> {
        let mut tables = self.runtime.tables.write();
        if tables.classes.contains_key(&self.name) {
            return Err(BridgeError::Unsupported(format!(
                "class {} is already registered",
                self.name
            )));
        }

        let superclass: *const ClassRecord = match &self.superclass {
            None => ptr::null(),
            Some(s) => match tables.classes.get(s) {
                Some(r) => &**r as *const ClassRecord,
                None => return Err(BridgeError::not_found(EntityKind::Class, s.clone())),
            },
        };
        // SAFETY: null or a record owned by `tables`.
        let super_record = unsafe { superclass.as_ref() };

        let mut offset = super_record.map_or(HEADER_SIZE, |s| s.instance_size);
        let mut ivars = vec![];
        for (name, encoding) in &self.ivars {
            let layout = type_layout(&decode(encoding)?)?;
            let position = align_up(offset, layout.align());
            ivars.push(IvarInfo {
                name: name.clone(),
                encoding: encoding.clone(),
                offset: position as isize,
            });
            offset = position + layout.size();
        }
        let instance_size = align_up(offset, OBJECT_ALIGN);

        let mut protocols = vec![];
        for p in &self.protocols {
            match tables.protocols.get(p) {
                Some(r) => protocols.push(ProtocolPtr(ptr::NonNull::from(&**r).cast())),
                None => return Err(BridgeError::not_found(EntityKind::Protocol, p.clone())),
            }
        }

        let mut methods = |list: &[(String, Option<String>, Imp)]| -> Result<Vec<MethodEntry>> {
            list.iter()
                .map(|(name, encoding, imp)| {
                    Ok(MethodEntry {
                        name: name.clone(),
                        selector: tables.intern(name)?,
                        encoding: encoding.clone(),
                        imp: *imp,
                    })
                })
                .collect()
        };
        let instance_methods = methods(&self.instance_methods)?;
        let class_methods = methods(&self.class_methods)?;

        let root_meta = super_record.and_then(|s| s.chain().last().map(|root| root.isa));

        let mut meta = Box::new(ClassRecord {
            isa: root_meta.unwrap_or(ptr::null()),
            name: self.name.clone(),
            superclass: super_record.map_or(ptr::null(), |s| s.isa),
            instance_size: HEADER_SIZE,
            methods: class_methods,
            ivars: vec![],
            properties: self.class_properties,
            protocols: vec![],
            affinity: self.affinity,
            stats: self.runtime.stats.clone(),
        });
        let meta_ptr: *const ClassRecord = &*meta;
        if meta.isa.is_null() {
            meta.isa = meta_ptr;
        }

        let class = Box::new(ClassRecord {
            isa: meta_ptr,
            name: self.name.clone(),
            superclass,
            instance_size,
            methods: instance_methods,
            ivars,
            properties: self.properties,
            protocols,
            affinity: self.affinity,
            stats: self.runtime.stats.clone(),
        });
        if superclass.is_null() {
            // The root metaclass inherits from the root class.
            meta.superclass = &*class as *const ClassRecord;
        }

        let class_ptr = class.as_ptr();
        tables.class_addrs.insert(class_ptr.address());
        tables.class_addrs.insert(meta_ptr as usize);
        tables.metaclasses.push(meta);
        tables.classes.insert(self.name.clone(), class);
        debug!(class = %self.name, instance_size, "registered local class");
        Ok(class_ptr)
    }
}

pub struct ProtocolBuilder<'a> {
    runtime: &'a LocalRuntime,
    name: String,
    protocols: Vec<String>,
    methods: Vec<ProtocolMethod>,
    properties: Vec<(PropertyInfo, bool)>,
}

impl<'a> ProtocolBuilder<'a> {
    pub fn inherits(mut self, name: &str) -> Self {
        self.protocols.push(name.to_string());
        self
    }

    pub fn method(mut self, selector: &str, encoding: &str, required: bool, instance: bool) -> Self {
        self.methods.push(ProtocolMethod {
            info: MethodInfo {
                selector: selector.to_string(),
                encoding: encoding.to_string(),
            },
            required,
            instance,
        });
        self
    }

    pub fn required(self, selector: &str, encoding: &str) -> Self {
        self.method(selector, encoding, true, true)
    }

    pub fn optional(self, selector: &str, encoding: &str) -> Self {
        self.method(selector, encoding, false, true)
    }

    pub fn property(mut self, name: &str, attributes: &str, required: bool) -> Self {
        self.properties.push((
            PropertyInfo {
                name: name.to_string(),
                attributes: attributes.to_string(),
            },
            required,
        ));
        self
    }

    pub fn register(self) -> Result<ProtocolPtr> {
        let mut tables = self.runtime.tables.write();
        if tables.protocols.contains_key(&self.name) {
            return Err(BridgeError::Unsupported(format!(
                "protocol {} is already registered",
                self.name
            )));
        }
        let mut protocols = vec![];
        for p in &self.protocols {
            match tables.protocols.get(p) {
                Some(r) => protocols.push(ProtocolPtr(ptr::NonNull::from(&**r).cast())),
                None => return Err(BridgeError::not_found(EntityKind::Protocol, p.clone())),
            }
        }
        let record = Box::new(ProtocolRecord {
            name: self.name.clone(),
            protocols,
            methods: self.methods,
            properties: self.properties,
        });
        let p = ProtocolPtr(ptr::NonNull::from(&*record).cast());
        tables.protocol_addrs.insert(p.address());
        tables.protocols.insert(self.name.clone(), record);
        debug!(protocol = %self.name, "registered local protocol");
        Ok(p)
    }
}

impl ForeignRuntime for LocalRuntime {
    fn name(&self) -> &str {
        "local"
    }

    fn lookup_class(&self, name: &str) -> Option<ClassPtr> {
        self.tables.read().classes.get(name).map(|r| r.as_ptr())
    }

    fn lookup_protocol(&self, name: &str) -> Option<ProtocolPtr> {
        self.tables
            .read()
            .protocols
            .get(name)
            .map(|r| ProtocolPtr(ptr::NonNull::from(&**r).cast()))
    }

    fn class_name(&self, class: ClassPtr) -> Result<String> {
        Ok(self.record(class).name.clone())
    }

    fn superclass(&self, class: ClassPtr) -> Option<ClassPtr> {
        self.record(class).superclass().map(ClassRecord::as_ptr)
    }

    fn metaclass(&self, class: ClassPtr) -> Option<ClassPtr> {
        let record = self.record(class);
        // SAFETY: isa of a class record is always set.
        unsafe { record.isa.as_ref() }.map(ClassRecord::as_ptr)
    }

    fn class_protocols(&self, class: ClassPtr) -> Vec<ProtocolPtr> {
        self.record(class).protocols.clone()
    }

    fn class_methods(&self, class: ClassPtr) -> Vec<MethodInfo> {
        self.record(class)
            .methods
            .iter()
            .filter_map(|m| {
                m.encoding.as_ref().map(|e| MethodInfo {
                    selector: m.name.clone(),
                    encoding: e.clone(),
                })
            })
            .collect()
    }

    fn class_properties(&self, class: ClassPtr) -> Vec<PropertyInfo> {
        self.record(class).properties.clone()
    }

    fn class_ivars(&self, class: ClassPtr) -> Vec<IvarInfo> {
        self.record(class).ivars.clone()
    }

    fn protocol_name(&self, protocol: ProtocolPtr) -> Result<String> {
        Ok(self.protocol_record(protocol).name.clone())
    }

    fn protocol_protocols(&self, protocol: ProtocolPtr) -> Vec<ProtocolPtr> {
        self.protocol_record(protocol).protocols.clone()
    }

    fn protocol_methods(
        &self,
        protocol: ProtocolPtr,
        required: bool,
        instance: bool,
    ) -> Vec<MethodInfo> {
        self.protocol_record(protocol)
            .methods
            .iter()
            .filter(|m| m.required == required && m.instance == instance)
            .map(|m| m.info.clone())
            .collect()
    }

    fn protocol_properties(&self, protocol: ProtocolPtr, required: bool) -> Vec<PropertyInfo> {
        self.protocol_record(protocol)
            .properties
            .iter()
            .filter(|(_, r)| *r == required)
            .map(|(p, _)| p.clone())
            .collect()
    }

    fn object_class(&self, obj: ObjPtr) -> Option<ClassPtr> {
        if self.object_kind(obj) == ObjectKind::Protocol {
            return None;
        }
        // SAFETY: instances and class records both start with an isa pointer.
        let isa = unsafe { *(obj.as_ptr() as *const *const ClassRecord) };
        // SAFETY: isa points at a live record.
        unsafe { isa.as_ref() }.map(ClassRecord::as_ptr)
    }

    fn object_kind(&self, obj: ObjPtr) -> ObjectKind {
        let tables = self.tables.read();
        if tables.class_addrs.contains(&obj.address()) {
            ObjectKind::Class
        } else if tables.protocol_addrs.contains(&obj.address()) {
            ObjectKind::Protocol
        } else {
            ObjectKind::Instance
        }
    }

    fn register_selector(&self, name: &str) -> Result<SelPtr> {
        if let Some(c) = self.tables.read().selectors.get(name) {
            return Ok(sel_of(c));
        }
        self.tables.write().intern(name)
    }

    fn selector_name(&self, sel: SelPtr) -> Result<String> {
        Ok(self
            .tables
            .read()
            .selector_names
            .get(&sel.address())
            .cloned()
            .unwrap_or_default())
    }

    fn responds_to(&self, class: ClassPtr, sel: SelPtr) -> bool {
        self.record(class).find_imp(sel).is_some()
    }

    fn message_target(
        &self,
        receiver: ObjPtr,
        sel: SelPtr,
        _struct_return: Option<usize>,
    ) -> Result<CodePtr> {
        let class = self.object_class(receiver).ok_or_else(|| {
            BridgeError::Unsupported("messaging a protocol object".to_string())
        })?;
        let record = self.record(class);
        match record.find_imp(sel) {
            Some(Imp(imp)) => Ok(CodePtr::from_ptr(imp)),
            None => Err(BridgeError::DoesNotRespond {
                target: record.name.clone(),
                selector: self.selector_name(sel)?,
            }),
        }
    }

    fn retain(&self, obj: ObjPtr) {
        if self.object_kind(obj) == ObjectKind::Instance {
            // SAFETY: instances passed to the runtime are live.
            unsafe { retain_object(obj.as_ptr()) }
        }
    }

    fn release(&self, obj: ObjPtr) {
        if self.object_kind(obj) == ObjectKind::Instance {
            // SAFETY: the caller owns the reference being released.
            unsafe { release_object(obj.as_ptr()) }
        }
    }

    fn take_exception(&self) -> Option<ForeignException> {
        PENDING.with(|p| p.borrow_mut().take())
    }

    fn affinity(&self, class: ClassPtr) -> ThreadAffinity {
        self.record(class)
            .chain()
            .map(|c| c.affinity)
            .find(|a| *a != ThreadAffinity::Any)
            .unwrap_or(ThreadAffinity::Any)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn noop(_this: *mut c_void, _cmd: *const c_void) {}

    #[test]
    fn test_root_class() {
        let rt = LocalRuntime::new();
        let root = rt.lookup_class("NSObject").unwrap();
        assert_eq!(rt.class_name(root).unwrap(), "NSObject");
        assert_eq!(rt.superclass(root), None);
        assert_eq!(rt.object_kind(root.as_object()), ObjectKind::Class);

        let meta = rt.metaclass(root).unwrap();
        assert_eq!(rt.superclass(meta), Some(root));
        assert_eq!(rt.metaclass(meta), Some(meta));
        assert!(rt
            .class_methods(meta)
            .iter()
            .any(|m| m.selector == "alloc"));
    }

    #[test]
    fn test_ivar_offsets() {
        let rt = LocalRuntime::new();
        let cls = rt
            .class("Sample")
            .ivar("_flag", "c")
            .ivar("_value", "q")
            .register()
            .unwrap();
        let ivars = rt.class_ivars(cls);
        assert_eq!(ivars[0].offset, HEADER_SIZE as isize);
        assert_eq!(ivars[1].offset, HEADER_SIZE as isize + 8);

        let obj = rt.instantiate("Sample").unwrap();
        unsafe {
            *ivar::<i64>(obj.as_ptr(), "_value").unwrap() = 42;
            assert_eq!(*ivar::<i64>(obj.as_ptr(), "_value").unwrap(), 42);
        }
        assert!(unsafe { ivar::<i64>(obj.as_ptr(), "_missing") }.is_none());
        rt.release(obj);
        assert_eq!(rt.stats().live_objects(), 0);
    }

    #[test]
    fn test_dispatch_walks_superclasses() {
        let rt = LocalRuntime::new();
        rt.class("Base")
            .instance_method("ping", "v16@0:8", noop as *const c_void)
            .register()
            .unwrap();
        let derived = rt.class("Derived").superclass("Base").register().unwrap();
        let sel = rt.register_selector("ping").unwrap();
        assert!(rt.responds_to(derived, sel));

        let obj = rt.instantiate("Derived").unwrap();
        assert!(rt.message_target(obj, sel, None).is_ok());
        let missing = rt.register_selector("pong").unwrap();
        assert!(matches!(
            rt.message_target(obj, missing, None),
            Err(BridgeError::DoesNotRespond { .. })
        ));
        rt.release(obj);
    }

    #[test]
    fn test_class_messages_reach_root_instance_methods() {
        let rt = LocalRuntime::new();
        let cls = rt.class("Widget").register().unwrap();
        let init = rt.register_selector("init").unwrap();
        let meta = rt.metaclass(cls).unwrap();
        assert!(rt.responds_to(meta, init));
    }

    #[test]
    fn test_dynamic_methods_have_no_metadata() {
        let rt = LocalRuntime::new();
        let cls = rt
            .class("Dynamic")
            .dynamic_method("poke", noop as *const c_void)
            .register()
            .unwrap();
        assert!(rt.class_methods(cls).is_empty());
        let sel = rt.register_selector("poke").unwrap();
        assert!(rt.responds_to(cls, sel));
    }

    #[test]
    fn test_selectors_are_interned() {
        let rt = LocalRuntime::new();
        let a = rt.register_selector("doThing:").unwrap();
        let b = rt.register_selector("doThing:").unwrap();
        assert_eq!(a, b);
        assert_eq!(rt.selector_name(a).unwrap(), "doThing:");
    }

    #[test]
    fn test_protocols() {
        let rt = LocalRuntime::new();
        rt.protocol("Base").required("hello", "v16@0:8").register().unwrap();
        let p = rt
            .protocol("Child")
            .inherits("Base")
            .optional("maybe", "v16@0:8")
            .property("size", "Tq,R", true)
            .register()
            .unwrap();
        assert_eq!(rt.protocol_name(p).unwrap(), "Child");
        assert_eq!(rt.protocol_protocols(p).len(), 1);
        assert_eq!(rt.protocol_methods(p, false, true).len(), 1);
        assert!(rt.protocol_methods(p, true, true).is_empty());
        assert_eq!(rt.protocol_properties(p, true).len(), 1);
        assert_eq!(rt.object_kind(p.as_object()), ObjectKind::Protocol);

        assert!(rt.class("Broken").protocol("Nope").register().is_err());
    }

    #[test]
    fn test_pending_exception_is_per_thread() {
        let rt = LocalRuntime::new();
        raise("NSRangeException", "index 3 beyond bounds");
        let other = thread::spawn(|| LocalRuntime::new().take_exception())
            .join()
            .unwrap();
        assert!(other.is_none());
        let e = rt.take_exception().unwrap();
        assert_eq!(e.name, "NSRangeException");
        assert!(rt.take_exception().is_none());
    }

    #[test]
    fn test_duplicate_class_rejected() {
        let rt = LocalRuntime::new();
        assert!(rt.class("NSObject").root().register().is_err());
    }
}
