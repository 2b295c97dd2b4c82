//! Boxing host text, bytes and collections into foreign objects.
//!
//! Boxed objects are created with `alloc` followed by an `init...` method,
//! so the result is always an owned reference that the call slot releases
//! once the call has returned.

use super::{HostKind, HostValue, ObjectHandle};
use crate::{
    bridge::Bridge,
    error::{BridgeError, Result},
    proxy::{ClassProxy, ProxyHandle},
    types::{members::MethodSignature, TypeDescriptor},
};
use std::{collections::HashMap, sync::Arc};

pub trait ObjectAdapter: Send + Sync {
    /// The foreign class values are boxed into when no more specific
    /// subclass is requested.
    fn class_name(&self) -> &str;

    /// Create an instance of `class` (the default class or a subclass of it)
    /// holding `value`.
    fn to_object(&self, bridge: &Bridge, value: &HostValue, class: &ClassProxy) -> Result<ObjectHandle>;
}

/// `[[class alloc] <selector>args...]` with an explicit signature.
fn alloc_init(
    class: &ClassProxy,
    selector: &str,
    signature: MethodSignature,
    args: &[HostValue],
) -> Result<ObjectHandle> {
    let allocated = class.call("alloc", &[])?;
    let Some(receiver) = allocated.as_instance() else {
        return Err(BridgeError::TypeMismatch {
            expected: format!("{} instance", class.name()),
            found: allocated.kind_name().to_string(),
        });
    };
    match receiver.call_with_signature(selector, args, signature)? {
        HostValue::Object(ProxyHandle::Instance(boxed)) => Ok(boxed.handle().clone()),
        other => Err(BridgeError::TypeMismatch {
            expected: format!("{} instance", class.name()),
            found: other.kind_name().to_string(),
        }),
    }
}

fn object_array(bridge: &Bridge, items: &[HostValue]) -> Result<(Vec<ObjectHandle>, Vec<u8>)> {
    let marshaller = bridge.marshaller();
    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let handle = marshaller.object_for(bridge, item)?.ok_or(BridgeError::TypeMismatch {
            expected: "collection element".to_string(),
            found: "nil".to_string(),
        })?;
        handles.push(handle);
    }
    let bytes = handles
        .iter()
        .flat_map(|h| h.ptr().address().to_ne_bytes())
        .collect();
    Ok((handles, bytes))
}

fn object_array_type() -> TypeDescriptor {
    TypeDescriptor::Pointer(Box::new(TypeDescriptor::object()))
}

pub struct StringAdapter;

impl ObjectAdapter for StringAdapter {
    fn class_name(&self) -> &str {
        "NSString"
    }

    fn to_object(&self, _: &Bridge, value: &HostValue, class: &ClassProxy) -> Result<ObjectHandle> {
        let signature = MethodSignature::new(vec![TypeDescriptor::CString], TypeDescriptor::object());
        alloc_init(class, "initWithUTF8String:", signature, std::slice::from_ref(value))
    }
}

pub struct DataAdapter;

impl ObjectAdapter for DataAdapter {
    fn class_name(&self) -> &str {
        "NSData"
    }

    fn to_object(&self, _: &Bridge, value: &HostValue, class: &ClassProxy) -> Result<ObjectHandle> {
        let HostValue::Bytes(bytes) = value else {
            return Err(BridgeError::TypeMismatch {
                expected: "bytes".to_string(),
                found: value.kind_name().to_string(),
            });
        };
        let signature = MethodSignature::new(
            vec![
                TypeDescriptor::Pointer(Box::new(TypeDescriptor::Void)),
                TypeDescriptor::uint(64),
            ],
            TypeDescriptor::object(),
        );
        alloc_init(
            class,
            "initWithBytes:length:",
            signature,
            &[value.clone(), HostValue::UInt(bytes.len() as u64)],
        )
    }
}

/// Lists and sets: `initWithObjects:count:`.
pub struct CollectionAdapter {
    class: &'static str,
}

impl CollectionAdapter {
    pub fn new(class: &'static str) -> Self {
        Self { class }
    }
}

impl ObjectAdapter for CollectionAdapter {
    fn class_name(&self) -> &str {
        self.class
    }

    fn to_object(&self, bridge: &Bridge, value: &HostValue, class: &ClassProxy) -> Result<ObjectHandle> {
        let (HostValue::List(items) | HostValue::Set(items)) = value else {
            return Err(BridgeError::TypeMismatch {
                expected: "list or set".to_string(),
                found: value.kind_name().to_string(),
            });
        };
        // `_elements` keeps boxed elements alive until the collection has
        // retained them.
        let (_elements, pointers) = object_array(bridge, items)?;
        let signature = MethodSignature::new(
            vec![object_array_type(), TypeDescriptor::uint(64)],
            TypeDescriptor::object(),
        );
        alloc_init(
            class,
            "initWithObjects:count:",
            signature,
            &[HostValue::Bytes(pointers), HostValue::UInt(items.len() as u64)],
        )
    }
}

pub struct DictionaryAdapter;

impl ObjectAdapter for DictionaryAdapter {
    fn class_name(&self) -> &str {
        "NSDictionary"
    }

    fn to_object(&self, bridge: &Bridge, value: &HostValue, class: &ClassProxy) -> Result<ObjectHandle> {
        let HostValue::Dict(entries) = value else {
            return Err(BridgeError::TypeMismatch {
                expected: "dict".to_string(),
                found: value.kind_name().to_string(),
            });
        };
        let (keys, values): (Vec<_>, Vec<_>) = entries.iter().cloned().unzip();
        let (_keys, key_pointers) = object_array(bridge, &keys)?;
        let (_values, value_pointers) = object_array(bridge, &values)?;
        let signature = MethodSignature::new(
            vec![object_array_type(), object_array_type(), TypeDescriptor::uint(64)],
            TypeDescriptor::object(),
        );
        alloc_init(
            class,
            "initWithObjects:forKeys:count:",
            signature,
            &[
                HostValue::Bytes(value_pointers),
                HostValue::Bytes(key_pointers),
                HostValue::UInt(entries.len() as u64),
            ],
        )
    }
}

/// Adapters by host value kind.
pub struct BoxingRegistry {
    adapters: HashMap<HostKind, Arc<dyn ObjectAdapter>>,
}

impl Default for BoxingRegistry {
    fn default() -> Self {
        let mut registry = Self {
            adapters: HashMap::new(),
        };
        registry.register(HostKind::Str, Arc::new(StringAdapter));
        registry.register(HostKind::Bytes, Arc::new(DataAdapter));
        registry.register(HostKind::List, Arc::new(CollectionAdapter::new("NSArray")));
        registry.register(HostKind::Set, Arc::new(CollectionAdapter::new("NSSet")));
        registry.register(HostKind::Dict, Arc::new(DictionaryAdapter));
        registry
    }
}

impl BoxingRegistry {
    pub fn register(&mut self, kind: HostKind, adapter: Arc<dyn ObjectAdapter>) {
        self.adapters.insert(kind, adapter);
    }

    pub fn get(&self, kind: HostKind) -> Option<Arc<dyn ObjectAdapter>> {
        self.adapters.get(&kind).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_registry() {
        let registry = BoxingRegistry::default();
        assert_eq!(registry.get(HostKind::Str).unwrap().class_name(), "NSString");
        assert_eq!(registry.get(HostKind::Set).unwrap().class_name(), "NSSet");
        assert_eq!(registry.get(HostKind::Dict).unwrap().class_name(), "NSDictionary");
        assert!(registry.get(HostKind::Int).is_none());
    }

    #[test]
    fn test_register_replaces() {
        struct Custom;
        impl ObjectAdapter for Custom {
            fn class_name(&self) -> &str {
                "MyString"
            }
            fn to_object(&self, _: &Bridge, _: &HostValue, _: &ClassProxy) -> Result<ObjectHandle> {
                Err(BridgeError::Unsupported("test".into()))
            }
        }
        let mut registry = BoxingRegistry::default();
        registry.register(HostKind::Str, Arc::new(Custom));
        assert_eq!(registry.get(HostKind::Str).unwrap().class_name(), "MyString");
    }
}
