//! Host-side handles for foreign classes, protocols and instances.

use crate::{
    bridge::Bridge,
    error::{BridgeError, Result},
    runtime::{ClassPtr, ObjPtr, ProtocolPtr},
    types::members::{IvarDescription, MethodSignature, PropertyDescription},
    utils::{attribute_to_selector, format_address},
    value::{
        layout::{type_layout, HasLayout},
        marshal::DecodeMode,
        HostValue, ObjectHandle, Ownership,
    },
};
use std::fmt;

#[derive(Clone)]
pub struct ClassProxy {
    bridge: Bridge,
    class: ClassPtr,
    name: String,
}

#[derive(Clone)]
pub struct ProtocolProxy {
    bridge: Bridge,
    protocol: ProtocolPtr,
    name: String,
}

#[derive(Clone)]
pub struct InstanceProxy {
    bridge: Bridge,
    handle: ObjectHandle,
}

/// Exactly one foreign class, protocol or instance.
#[derive(Clone)]
pub enum ProxyHandle {
    Class(ClassProxy),
    Protocol(ProtocolProxy),
    Instance(InstanceProxy),
}

/// A selector bound to its receiver, produced by attribute access.
#[derive(Clone, Debug)]
pub struct BoundMethod {
    receiver: ProxyHandle,
    selector: String,
}

/// Result of attribute-style access on a proxy.
#[derive(Clone, Debug)]
pub enum Attribute {
    Property(HostValue),
    Method(BoundMethod),
}

impl ClassProxy {
    pub fn new(bridge: Bridge, class: ClassPtr, name: String) -> Self {
        Self {
            bridge,
            class,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_ptr(&self) -> ClassPtr {
        self.class
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    pub fn superclass(&self) -> Result<Option<ClassProxy>> {
        self.bridge
            .runtime()
            .superclass(self.class)
            .map(|s| self.bridge.class_proxy(s))
            .transpose()
    }

    pub fn call(&self, selector: &str, args: &[HostValue]) -> Result<HostValue> {
        ProxyHandle::Class(self.clone()).call(selector, args)
    }

    pub fn call_with_signature(
        &self,
        selector: &str,
        args: &[HostValue],
        signature: MethodSignature,
    ) -> Result<HostValue> {
        ProxyHandle::Class(self.clone()).call_with_signature(selector, args, signature)
    }

    /// Whether this class is `ancestor` or inherits from it.
    pub fn is_subclass_of(&self, ancestor: &ClassProxy) -> bool {
        self.bridge.cache().is_subclass(&self.name, &ancestor.name)
    }

    pub fn conforms_to(&self, protocol: &ProtocolProxy) -> bool {
        self.bridge.cache().conforms_to(&self.name, &protocol.name)
    }

    /// Whether instances respond to `selector`.
    pub fn instances_respond_to(&self, selector: &str) -> bool {
        self.bridge.responds_to(self.class, selector)
    }
}

impl ProtocolProxy {
    pub fn new(bridge: Bridge, protocol: ProtocolPtr, name: String) -> Self {
        Self {
            bridge,
            protocol,
            name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn protocol_ptr(&self) -> ProtocolPtr {
        self.protocol
    }

    /// Whether this protocol is `other` or inherits from it.
    pub fn conforms_to(&self, other: &ProtocolProxy) -> bool {
        self.bridge
            .cache()
            .protocol_conforms_to(&self.name, &other.name)
    }
}

impl InstanceProxy {
    pub fn new(bridge: Bridge, handle: ObjectHandle) -> Self {
        Self { bridge, handle }
    }

    pub fn handle(&self) -> &ObjectHandle {
        &self.handle
    }

    pub fn bridge(&self) -> &Bridge {
        &self.bridge
    }

    /// The object's current class, queried from the runtime on every call.
    pub fn class(&self) -> Result<ClassProxy> {
        let class = self
            .bridge
            .runtime()
            .object_class(self.handle.ptr())
            .ok_or_else(|| BridgeError::Unsupported(format!("{self:?} has no class")))?;
        self.bridge.class_proxy(class)
    }

    pub fn class_name(&self) -> Result<String> {
        self.class().map(|c| c.name)
    }

    pub fn call(&self, selector: &str, args: &[HostValue]) -> Result<HostValue> {
        self.bridge
            .send(&ProxyHandle::Instance(self.clone()), selector, args, None)
    }

    pub fn call_with_signature(
        &self,
        selector: &str,
        args: &[HostValue],
        signature: MethodSignature,
    ) -> Result<HostValue> {
        self.bridge.send(
            &ProxyHandle::Instance(self.clone()),
            selector,
            args,
            Some(signature),
        )
    }

    /// Instance variable `name`, found through the class chain.
    pub fn ivar(&self, name: &str) -> Result<HostValue> {
        let class = self.class_name()?;
        let IvarDescription { ty, offset, .. } = self.bridge.cache().find_ivar(&class, name)?;
        let size = type_layout(&ty)?.size();
        // SAFETY: the ivar's offset and type come from the object's own class
        // metadata, so the range lies inside the live instance.
        let bytes = unsafe {
            std::slice::from_raw_parts((self.handle.ptr().as_ptr() as *const u8).offset(offset), size)
        };
        self.bridge
            .marshaller()
            .decode_from(&self.bridge, bytes, &ty, DecodeMode::new(Ownership::Borrowed))
    }
}

impl ProxyHandle {
    pub fn object_ptr(&self) -> ObjPtr {
        match self {
            ProxyHandle::Class(c) => c.class.as_object(),
            ProxyHandle::Protocol(p) => p.protocol.as_object(),
            ProxyHandle::Instance(i) => i.handle.ptr(),
        }
    }

    pub fn bridge(&self) -> &Bridge {
        match self {
            ProxyHandle::Class(c) => &c.bridge,
            ProxyHandle::Protocol(p) => &p.bridge,
            ProxyHandle::Instance(i) => &i.bridge,
        }
    }

    /// Name of the class metadata applies to, and whether class-side members
    /// are meant.
    fn class_target(&self) -> Result<(String, bool)> {
        match self {
            ProxyHandle::Class(c) => Ok((c.name.clone(), true)),
            ProxyHandle::Instance(i) => Ok((i.class_name()?, false)),
            ProxyHandle::Protocol(p) => Err(BridgeError::Unsupported(format!(
                "protocol {} has no members",
                p.name
            ))),
        }
    }

    pub fn call(&self, selector: &str, args: &[HostValue]) -> Result<HostValue> {
        self.bridge().send(self, selector, args, None)
    }

    /// Call with a caller-supplied signature instead of the resolved one.
    pub fn call_with_signature(
        &self,
        selector: &str,
        args: &[HostValue],
        signature: MethodSignature,
    ) -> Result<HostValue> {
        self.bridge().send(self, selector, args, Some(signature))
    }

    fn property(&self, name: &str) -> Result<PropertyDescription> {
        let (class, is_class) = self.class_target()?;
        self.bridge().cache().find_property(&class, name, is_class)
    }

    pub fn get_property(&self, name: &str) -> Result<HostValue> {
        let property = self.property(name)?;
        self.call_with_signature(&property.getter(), &[], property.getter_signature())
    }

    pub fn set_property(&self, name: &str, value: HostValue) -> Result<()> {
        let property = self.property(name)?;
        let setter = property
            .setter()
            .ok_or_else(|| BridgeError::ReadonlyProperty(name.to_string()))?;
        self.call_with_signature(&setter, &[value], property.setter_signature())?;
        Ok(())
    }

    /// Attribute-style access: a property value if `name` is a property,
    /// otherwise a bound method if the receiver responds to the selector
    /// `name` spells (`_` for `:`).
    pub fn attribute(&self, name: &str) -> Result<Attribute> {
        match self.property(name) {
            Ok(property) => {
                return self
                    .call_with_signature(&property.getter(), &[], property.getter_signature())
                    .map(Attribute::Property)
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
        let selector = attribute_to_selector(name);
        if self.responds_to(&selector) {
            return Ok(Attribute::Method(BoundMethod {
                receiver: self.clone(),
                selector,
            }));
        }
        Err(BridgeError::NoSuchMember {
            target: format!("{self:?}"),
            name: name.to_string(),
        })
    }

    pub fn responds_to(&self, selector: &str) -> bool {
        let bridge = self.bridge();
        let runtime = bridge.runtime();
        let class = match self {
            ProxyHandle::Class(c) => runtime.metaclass(c.class),
            ProxyHandle::Instance(i) => runtime.object_class(i.handle.ptr()),
            ProxyHandle::Protocol(_) => None,
        };
        class.is_some_and(|c| bridge.responds_to(c, selector))
    }

    /// For instances: whether the object's class is `target` or a subclass
    /// of it, or conforms to protocol `target`. For classes, the same test
    /// applied to the class itself. Never fails; lookup problems are a
    /// negative answer.
    pub fn is_instance_of(&self, target: &ProxyHandle) -> bool {
        let class = match self {
            ProxyHandle::Instance(i) => match i.class_name() {
                Ok(c) => c,
                Err(_) => return false,
            },
            ProxyHandle::Class(c) => c.name.clone(),
            ProxyHandle::Protocol(p) => {
                return matches!(target, ProxyHandle::Protocol(t) if p.conforms_to(t))
            }
        };
        let cache = self.bridge().cache();
        match target {
            ProxyHandle::Class(t) => cache.is_subclass(&class, &t.name),
            ProxyHandle::Protocol(t) => cache.conforms_to(&class, &t.name),
            ProxyHandle::Instance(_) => false,
        }
    }

    /// Class-to-class (or protocol-to-protocol) hierarchy test.
    pub fn is_subclass_of(&self, target: &ProxyHandle) -> bool {
        match (self, target) {
            (ProxyHandle::Class(c), ProxyHandle::Class(t)) => c.is_subclass_of(t),
            (ProxyHandle::Class(c), ProxyHandle::Protocol(t)) => c.conforms_to(t),
            (ProxyHandle::Protocol(p), ProxyHandle::Protocol(t)) => p.conforms_to(t),
            _ => false,
        }
    }

    pub fn as_instance(&self) -> Option<&InstanceProxy> {
        match self {
            ProxyHandle::Instance(i) => Some(i),
            _ => None,
        }
    }

    pub fn as_class(&self) -> Option<&ClassProxy> {
        match self {
            ProxyHandle::Class(c) => Some(c),
            _ => None,
        }
    }
}

impl BoundMethod {
    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn receiver(&self) -> &ProxyHandle {
        &self.receiver
    }

    pub fn call(&self, args: &[HostValue]) -> Result<HostValue> {
        self.receiver.call(&self.selector, args)
    }

    pub fn call_with_signature(&self, args: &[HostValue], signature: MethodSignature) -> Result<HostValue> {
        self.receiver
            .call_with_signature(&self.selector, args, signature)
    }
}

impl PartialEq for ProxyHandle {
    fn eq(&self, other: &Self) -> bool {
        self.object_ptr() == other.object_ptr()
    }
}

impl fmt::Debug for ClassProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<class {} at {}>", self.name, format_address(self.class.address()))
    }
}

impl fmt::Debug for ProtocolProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<protocol {} at {}>", self.name, format_address(self.protocol.address()))
    }
}

impl fmt::Debug for InstanceProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ptr = self.handle.ptr();
        let class = self
            .bridge
            .runtime()
            .object_class(ptr)
            .and_then(|c| self.bridge.runtime().class_name(c).ok());
        write!(
            f,
            "<{} instance at {}>",
            class.as_deref().unwrap_or("?"),
            format_address(ptr.address())
        )
    }
}

impl fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyHandle::Class(c) => c.fmt(f),
            ProxyHandle::Protocol(p) => p.fmt(f),
            ProxyHandle::Instance(i) => i.fmt(f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::local::LocalRuntime;
    use std::sync::Arc;

    fn bridge() -> Bridge {
        let rt = LocalRuntime::new();
        rt.protocol("Copying").register().unwrap();
        rt.class("Shape").protocol("Copying").register().unwrap();
        rt.class("Circle").superclass("Shape").register().unwrap();
        Bridge::new(Arc::new(rt))
    }

    #[test]
    fn test_class_hierarchy() {
        let b = bridge();
        let circle = b.resolve_class("Circle").unwrap();
        let shape = b.resolve_class("Shape").unwrap();
        assert!(circle.is_subclass_of(&shape));
        assert!(!shape.is_subclass_of(&circle));
        assert_eq!(circle.superclass().unwrap().unwrap().name(), "Shape");
        assert!(shape.superclass().unwrap().unwrap().superclass().unwrap().is_none());

        let copying = b.resolve_protocol("Copying").unwrap();
        assert!(circle.conforms_to(&copying));
        let circle = ProxyHandle::Class(circle);
        assert!(circle.is_subclass_of(&ProxyHandle::Protocol(copying)));
    }

    #[test]
    fn test_instance_predicates() {
        let b = bridge();
        let circle = b.resolve_class("Circle").unwrap();
        let obj = circle.call("new", &[]).unwrap();
        let obj = obj.as_object().unwrap();
        let shape = ProxyHandle::Class(b.resolve_class("Shape").unwrap());
        let copying = ProxyHandle::Protocol(b.resolve_protocol("Copying").unwrap());
        assert!(obj.is_instance_of(&shape));
        assert!(obj.is_instance_of(&copying));
        assert!(!obj.is_instance_of(obj));
        assert!(!obj.is_subclass_of(&shape));
        assert_eq!(obj.as_instance().unwrap().class_name().unwrap(), "Circle");
    }

    #[test]
    fn test_debug_formats_address() {
        let b = bridge();
        let shape = b.resolve_class("Shape").unwrap();
        let text = format!("{shape:?}");
        assert!(text.starts_with("<class Shape at 0x"));
        assert!(text.ends_with(&format!("{:x}>", shape.class_ptr().address())));
    }

    #[test]
    fn test_protocol_has_no_members() {
        let b = bridge();
        let p = ProxyHandle::Protocol(b.resolve_protocol("Copying").unwrap());
        assert!(matches!(p.get_property("x"), Err(BridgeError::Unsupported(_))));
        assert!(!p.responds_to("init"));
    }
}
