//! Process-wide metadata cache.
//!
//! Class and protocol metadata is introspected from the runtime and decoded
//! the first time a name is looked up, then kept for the life of the cache.
//! Each class level is cached on its own; superclasses are referenced by
//! name and walked on demand.

use crate::{
    error::{BridgeError, DecodeError, EntityKind, Result},
    metrics::{CacheCounters, CacheStat},
    runtime::{ClassPtr, ForeignRuntime, MethodInfo, PropertyInfo, ProtocolPtr},
    types::{
        decode, decode_method_encoding, decode_property_attributes,
        members::{IvarDescription, MethodSignature, PropertyDescription},
    },
    utils::selector_arity,
};
use dashmap::{mapref::entry::Entry, DashMap};
use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    sync::Arc,
};
use tracing::{debug, warn};

#[derive(Clone, Debug, PartialEq)]
pub struct ClassMetadata {
    pub name: String,
    pub class: ClassPtr,
    /// By name; resolved through the cache when needed.
    pub superclass: Option<String>,
    pub protocols: Vec<String>,
    pub instance_methods: HashMap<String, MethodSignature>,
    pub class_methods: HashMap<String, MethodSignature>,
    pub properties: HashMap<String, PropertyDescription>,
    pub class_properties: HashMap<String, PropertyDescription>,
    pub ivars: HashMap<String, IvarDescription>,
    /// Methods whose encodings failed to decode, keyed by selector and
    /// whether they are class methods.
    pub undecodable: HashMap<(String, bool), DecodeError>,
}

impl ClassMetadata {
    /// The signature declared at this level, an error if the declaration
    /// exists but could not be decoded, or `None`.
    pub fn method(
        &self,
        selector: &str,
        is_class: bool,
    ) -> Result<Option<&MethodSignature>, DecodeError> {
        let methods = if is_class {
            &self.class_methods
        } else {
            &self.instance_methods
        };
        if let Some(sig) = methods.get(selector) {
            return Ok(Some(sig));
        }
        match self.undecodable.get(&(selector.to_string(), is_class)) {
            Some(e) => Err(e.clone()),
            None => Ok(None),
        }
    }

    pub fn property(&self, name: &str, is_class: bool) -> Option<&PropertyDescription> {
        if is_class {
            self.class_properties.get(name)
        } else {
            self.properties.get(name)
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProtocolMethod {
    pub signature: MethodSignature,
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProtocolProperty {
    pub description: PropertyDescription,
    pub required: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ProtocolMetadata {
    pub name: String,
    pub protocol: ProtocolPtr,
    /// Inherited protocols, by name.
    pub protocols: Vec<String>,
    pub instance_methods: HashMap<String, ProtocolMethod>,
    pub class_methods: HashMap<String, ProtocolMethod>,
    pub properties: HashMap<String, ProtocolProperty>,
    pub undecodable: HashMap<(String, bool), DecodeError>,
}

impl ProtocolMetadata {
    pub fn method(
        &self,
        selector: &str,
        is_class: bool,
    ) -> Result<Option<&ProtocolMethod>, DecodeError> {
        let methods = if is_class {
            &self.class_methods
        } else {
            &self.instance_methods
        };
        if let Some(m) = methods.get(selector) {
            return Ok(Some(m));
        }
        match self.undecodable.get(&(selector.to_string(), is_class)) {
            Some(e) => Err(e.clone()),
            None => Ok(None),
        }
    }
}

/// The entity a method lookup is performed on.
#[derive(Clone, Copy, Debug)]
pub enum MethodOwner<'a> {
    Class(&'a str),
    Protocol(&'a str),
}

pub struct MetadataCache {
    runtime: Arc<dyn ForeignRuntime>,
    classes: DashMap<String, Arc<ClassMetadata>>,
    protocols: DashMap<String, Arc<ProtocolMetadata>>,
    class_counters: CacheCounters,
    protocol_counters: CacheCounters,
}

/// Insert-if-absent. An existing entry must equal the new one; two
/// different values for the same key is a logic error.
fn commit<T: PartialEq + Debug>(map: &DashMap<String, Arc<T>>, key: &str, value: T) -> Arc<T> {
    match map.entry(key.to_string()) {
        Entry::Occupied(o) => {
            if **o.get() != value {
                panic!(
                    "conflicting metadata committed for {key}: {:?} vs {:?}",
                    o.get(),
                    value
                );
            }
            o.get().clone()
        }
        Entry::Vacant(v) => v.insert(Arc::new(value)).clone(),
    }
}

impl MetadataCache {
    pub fn new(runtime: Arc<dyn ForeignRuntime>) -> Self {
        Self {
            runtime,
            classes: DashMap::new(),
            protocols: DashMap::new(),
            class_counters: CacheCounters::default(),
            protocol_counters: CacheCounters::default(),
        }
    }

    pub fn runtime(&self) -> &Arc<dyn ForeignRuntime> {
        &self.runtime
    }

    pub fn resolve_class(&self, name: &str) -> Result<Arc<ClassMetadata>> {
        if let Some(meta) = self.classes.get(name) {
            self.class_counters.record_hit();
            return Ok(meta.clone());
        }
        self.class_counters.record_miss();

        let class = self
            .runtime
            .lookup_class(name)
            .ok_or_else(|| BridgeError::not_found(EntityKind::Class, name))?;

        // Introspection runs under the entry's shard lock, so racing first
        // lookups of one name decode it once.
        let meta = match self.classes.entry(name.to_string()) {
            Entry::Occupied(o) => o.get().clone(),
            Entry::Vacant(v) => {
                let meta = Arc::new(self.introspect_class(name, class)?);
                self.class_counters.record_decode();
                debug!(
                    class = name,
                    instance_methods = meta.instance_methods.len(),
                    class_methods = meta.class_methods.len(),
                    properties = meta.properties.len(),
                    "committed class metadata"
                );
                v.insert(meta).clone()
            }
        };
        Ok(meta)
    }

    pub fn resolve_protocol(&self, name: &str) -> Result<Arc<ProtocolMetadata>> {
        if let Some(meta) = self.protocols.get(name) {
            self.protocol_counters.record_hit();
            return Ok(meta.clone());
        }
        self.protocol_counters.record_miss();

        let protocol = self
            .runtime
            .lookup_protocol(name)
            .ok_or_else(|| BridgeError::not_found(EntityKind::Protocol, name))?;

        let meta = match self.protocols.entry(name.to_string()) {
            Entry::Occupied(o) => o.get().clone(),
            Entry::Vacant(v) => {
                let meta = Arc::new(self.introspect_protocol(name, protocol)?);
                self.protocol_counters.record_decode();
                debug!(protocol = name, "committed protocol metadata");
                v.insert(meta).clone()
            }
        };
        Ok(meta)
    }

    /// Insert externally produced metadata. Panics if different metadata is
    /// already committed under the same name.
    pub fn seed_class(&self, meta: ClassMetadata) -> Arc<ClassMetadata> {
        let name = meta.name.clone();
        commit(&self.classes, &name, meta)
    }

    /// The signature declared directly on `owner`, without walking
    /// superclasses.
    pub fn resolve_method(
        &self,
        owner: MethodOwner<'_>,
        selector: &str,
        is_class_method: bool,
    ) -> Result<MethodSignature> {
        let found = match owner {
            MethodOwner::Class(name) => self
                .resolve_class(name)?
                .method(selector, is_class_method)?
                .cloned(),
            MethodOwner::Protocol(name) => self
                .resolve_protocol(name)?
                .method(selector, is_class_method)?
                .map(|m| m.signature.clone()),
        };
        found.ok_or_else(|| {
            let (owner, prefix) = match owner {
                MethodOwner::Class(n) | MethodOwner::Protocol(n) => {
                    (n, if is_class_method { '+' } else { '-' })
                }
            };
            BridgeError::not_found(EntityKind::Method, format!("{prefix}[{owner} {selector}]"))
        })
    }

    /// The instance property declared directly on `class`.
    pub fn resolve_property(&self, class: &str, name: &str) -> Result<PropertyDescription> {
        self.resolve_class(class)?
            .property(name, false)
            .cloned()
            .ok_or_else(|| BridgeError::not_found(EntityKind::Property, format!("{class}.{name}")))
    }

    /// `class` followed by its superclasses, root last.
    pub fn ancestors(&self, class: &str) -> Result<Vec<Arc<ClassMetadata>>> {
        let mut chain = vec![];
        let mut next = Some(class.to_string());
        while let Some(name) = next {
            let meta = self.resolve_class(&name)?;
            next = meta.superclass.clone();
            chain.push(meta);
        }
        Ok(chain)
    }

    /// Property lookup through the superclass chain, then adopted protocols.
    pub fn find_property(
        &self,
        class: &str,
        name: &str,
        is_class: bool,
    ) -> Result<PropertyDescription> {
        let chain = self.ancestors(class)?;
        if let Some(p) = chain.iter().find_map(|c| c.property(name, is_class)) {
            return Ok(p.clone());
        }
        if !is_class {
            for meta in &chain {
                for proto in &meta.protocols {
                    if let Some(p) = self.find_protocol_property(proto, name, &mut HashSet::new()) {
                        return Ok(p);
                    }
                }
            }
        }
        Err(BridgeError::not_found(
            EntityKind::Property,
            format!("{class}.{name}"),
        ))
    }

    fn find_protocol_property(
        &self,
        protocol: &str,
        name: &str,
        seen: &mut HashSet<String>,
    ) -> Option<PropertyDescription> {
        if !seen.insert(protocol.to_string()) {
            return None;
        }
        let meta = self.resolve_protocol(protocol).ok()?;
        if let Some(p) = meta.properties.get(name) {
            return Some(p.description.clone());
        }
        meta.protocols
            .iter()
            .find_map(|p| self.find_protocol_property(p, name, seen))
    }

    pub fn find_ivar(&self, class: &str, name: &str) -> Result<IvarDescription> {
        self.ancestors(class)?
            .iter()
            .find_map(|c| c.ivars.get(name).cloned())
            .ok_or_else(|| BridgeError::not_found(EntityKind::Ivar, format!("{class}.{name}")))
    }

    /// Whether `class` is `ancestor` or inherits from it. Lookup failures
    /// count as a negative match.
    pub fn is_subclass(&self, class: &str, ancestor: &str) -> bool {
        self.ancestors(class)
            .map(|chain| chain.iter().any(|c| c.name == ancestor))
            .unwrap_or(false)
    }

    /// Whether `class` or any superclass adopts `protocol`, directly or
    /// through protocol inheritance.
    pub fn conforms_to(&self, class: &str, protocol: &str) -> bool {
        let Ok(chain) = self.ancestors(class) else {
            return false;
        };
        let mut seen = HashSet::new();
        chain.iter().any(|c| {
            c.protocols
                .iter()
                .any(|p| self.protocol_inherits(p, protocol, &mut seen))
        })
    }

    /// Whether `protocol` is `target` or inherits from it.
    pub fn protocol_conforms_to(&self, protocol: &str, target: &str) -> bool {
        self.protocol_inherits(protocol, target, &mut HashSet::new())
    }

    fn protocol_inherits(&self, protocol: &str, target: &str, seen: &mut HashSet<String>) -> bool {
        if protocol == target {
            return true;
        }
        if !seen.insert(protocol.to_string()) {
            return false;
        }
        match self.resolve_protocol(protocol) {
            Ok(meta) => meta
                .protocols
                .iter()
                .any(|p| self.protocol_inherits(p, target, seen)),
            Err(_) => false,
        }
    }

    pub fn class_stats(&self) -> CacheStat {
        self.class_counters.snapshot(self.classes.len())
    }

    pub fn protocol_stats(&self) -> CacheStat {
        self.protocol_counters.snapshot(self.protocols.len())
    }

    fn decode_methods(
        &self,
        owner: &str,
        methods: Vec<MethodInfo>,
        is_class: bool,
        undecodable: &mut HashMap<(String, bool), DecodeError>,
    ) -> HashMap<String, MethodSignature> {
        let mut out = HashMap::new();
        for MethodInfo { selector, encoding } in methods {
            match decode_method_encoding(&encoding, selector_arity(&selector)) {
                Ok(sig) => {
                    out.insert(selector, sig);
                }
                Err(error) => {
                    warn!(owner, %selector, %encoding, %error, "undecodable method encoding");
                    undecodable.insert((selector, is_class), error);
                }
            }
        }
        out
    }

    fn decode_properties(
        &self,
        owner: &str,
        properties: Vec<PropertyInfo>,
    ) -> HashMap<String, PropertyDescription> {
        properties
            .into_iter()
            .filter_map(|PropertyInfo { name, attributes }| {
                match decode_property_attributes(&attributes) {
                    Ok(attributes) => Some((name.clone(), PropertyDescription { name, attributes })),
                    Err(error) => {
                        warn!(owner, property = %name, %error, "undecodable property attributes");
                        None
                    }
                }
            })
            .collect()
    }

    fn introspect_class(&self, name: &str, class: ClassPtr) -> Result<ClassMetadata> {
        let rt = &self.runtime;
        let mut undecodable = HashMap::new();

        let instance_methods =
            self.decode_methods(name, rt.class_methods(class), false, &mut undecodable);
        let meta = rt.metaclass(class);
        let class_methods = match meta {
            Some(m) => self.decode_methods(name, rt.class_methods(m), true, &mut undecodable),
            None => HashMap::new(),
        };
        let class_properties = match meta {
            Some(m) => self.decode_properties(name, rt.class_properties(m)),
            None => HashMap::new(),
        };

        let ivars = rt
            .class_ivars(class)
            .into_iter()
            .filter_map(|i| match decode(&i.encoding) {
                Ok(ty) => Some((
                    i.name.clone(),
                    IvarDescription {
                        name: i.name,
                        ty,
                        offset: i.offset,
                    },
                )),
                Err(error) => {
                    warn!(owner = name, ivar = %i.name, %error, "undecodable ivar encoding");
                    None
                }
            })
            .collect();

        Ok(ClassMetadata {
            name: name.to_string(),
            class,
            superclass: rt.superclass(class).map(|s| rt.class_name(s)).transpose()?,
            protocols: rt
                .class_protocols(class)
                .into_iter()
                .map(|p| rt.protocol_name(p))
                .collect::<Result<_>>()?,
            instance_methods,
            class_methods,
            properties: self.decode_properties(name, rt.class_properties(class)),
            class_properties,
            ivars,
            undecodable,
        })
    }

    fn introspect_protocol(&self, name: &str, protocol: ProtocolPtr) -> Result<ProtocolMetadata> {
        let rt = &self.runtime;
        let mut undecodable = HashMap::new();
        let mut instance_methods = HashMap::new();
        let mut class_methods = HashMap::new();

        for required in [true, false] {
            for instance in [true, false] {
                let decoded = self.decode_methods(
                    name,
                    rt.protocol_methods(protocol, required, instance),
                    !instance,
                    &mut undecodable,
                );
                let target = if instance {
                    &mut instance_methods
                } else {
                    &mut class_methods
                };
                target.extend(
                    decoded
                        .into_iter()
                        .map(|(sel, signature)| (sel, ProtocolMethod { signature, required })),
                );
            }
        }

        let mut properties = HashMap::new();
        for required in [true, false] {
            properties.extend(
                self.decode_properties(name, rt.protocol_properties(protocol, required))
                    .into_iter()
                    .map(|(n, description)| {
                        (
                            n,
                            ProtocolProperty {
                                description,
                                required,
                            },
                        )
                    }),
            );
        }

        Ok(ProtocolMetadata {
            name: name.to_string(),
            protocol,
            protocols: rt
                .protocol_protocols(protocol)
                .into_iter()
                .map(|p| rt.protocol_name(p))
                .collect::<Result<_>>()?,
            instance_methods,
            class_methods,
            properties,
            undecodable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{runtime::local::LocalRuntime, types::TypeDescriptor};
    use std::ffi::c_void;

    extern "C" fn noop(_this: *mut c_void, _cmd: *const c_void) {}

    fn runtime() -> Arc<LocalRuntime> {
        let rt = LocalRuntime::new();
        rt.protocol("Named")
            .required("name", "@16@0:8")
            .property("name", "T@\"NSString\",R", true)
            .register()
            .unwrap();
        rt.protocol("Labelled").inherits("Named").register().unwrap();
        rt.class("Shape")
            .ivar("_sides", "q")
            .instance_method("sides", "q16@0:8", noop as *const c_void)
            .instance_method("broken:", "v24@0:8", noop as *const c_void)
            .class_method("unit", "@16@0:8", noop as *const c_void)
            .property("sides", "Tq,R,V_sides")
            .protocol("Labelled")
            .register()
            .unwrap();
        rt.class("Square")
            .superclass("Shape")
            .instance_method("area", "d16@0:8", noop as *const c_void)
            .register()
            .unwrap();
        Arc::new(rt)
    }

    #[test]
    fn test_not_found_is_distinguishable() {
        let cache = MetadataCache::new(runtime());
        let err = cache.resolve_class("DoesNotExist").unwrap_err();
        assert_eq!(
            err,
            BridgeError::not_found(EntityKind::Class, "DoesNotExist")
        );
        assert!(err.is_not_found());
        assert!(cache.resolve_protocol("Nope").unwrap_err().is_not_found());
        assert_eq!(cache.class_stats().size, 0);
    }

    #[test]
    fn test_class_metadata() {
        let cache = MetadataCache::new(runtime());
        let shape = cache.resolve_class("Shape").unwrap();
        assert_eq!(shape.superclass.as_deref(), Some("NSObject"));
        assert_eq!(shape.protocols, vec!["Labelled".to_string()]);
        assert_eq!(
            shape.instance_methods["sides"].return_type,
            TypeDescriptor::int(64)
        );
        assert!(shape.class_methods.contains_key("unit"));
        assert!(shape.properties["sides"].is_readonly());
        assert_eq!(shape.ivars["_sides"].ty, TypeDescriptor::int(64));
    }

    #[test]
    fn test_lookups_are_cached() {
        let cache = MetadataCache::new(runtime());
        let a = cache.resolve_class("Square").unwrap();
        let b = cache.resolve_class("Square").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let stats = cache.class_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.decodes, 1);
    }

    #[test]
    fn test_resolve_method_is_per_level() {
        let cache = MetadataCache::new(runtime());
        assert!(cache
            .resolve_method(MethodOwner::Class("Shape"), "sides", false)
            .is_ok());
        let err = cache
            .resolve_method(MethodOwner::Class("Square"), "sides", false)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(cache
            .resolve_method(MethodOwner::Class("Shape"), "unit", true)
            .is_ok());
        assert!(cache
            .resolve_method(MethodOwner::Protocol("Named"), "name", false)
            .is_ok());
    }

    #[test]
    fn test_undecodable_method_surfaces_decode_error() {
        let cache = MetadataCache::new(runtime());
        let err = cache
            .resolve_method(MethodOwner::Class("Shape"), "broken:", false)
            .unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Decode(DecodeError::ArgumentCount { .. })
        ));
    }

    #[test]
    fn test_properties_and_ivars_walk_the_chain() {
        let cache = MetadataCache::new(runtime());
        assert!(cache.resolve_property("Square", "sides").is_err());
        assert_eq!(
            cache.find_property("Square", "sides", false).unwrap().name,
            "sides"
        );
        assert_eq!(
            cache.find_property("Square", "name", false).unwrap().ty(),
            &TypeDescriptor::object_of("NSString")
        );
        assert_eq!(cache.find_ivar("Square", "_sides").unwrap().offset, 16);
        assert!(cache.find_ivar("Square", "_nothing").unwrap_err().is_not_found());
    }

    #[test]
    fn test_hierarchy_predicates() {
        let cache = MetadataCache::new(runtime());
        assert!(cache.is_subclass("Square", "Shape"));
        assert!(cache.is_subclass("Square", "NSObject"));
        assert!(!cache.is_subclass("Shape", "Square"));
        assert!(!cache.is_subclass("Missing", "Shape"));
        assert!(cache.conforms_to("Square", "Named"));
        assert!(!cache.conforms_to("NSObject", "Named"));
        assert!(cache.protocol_conforms_to("Labelled", "Named"));
        assert!(!cache.protocol_conforms_to("Named", "Labelled"));
    }

    #[test]
    fn test_concurrent_first_lookup_converges() {
        let cache = Arc::new(MetadataCache::new(runtime()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                std::thread::spawn(move || cache.resolve_class("Square").unwrap())
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results {
            assert_eq!(**r, *results[0]);
        }
        assert_eq!(cache.class_stats().decodes, 1);
    }

    #[test]
    fn test_seed_with_equal_metadata_is_idempotent() {
        let cache = MetadataCache::new(runtime());
        let meta = (*cache.resolve_class("Shape").unwrap()).clone();
        let committed = cache.seed_class(meta.clone());
        assert_eq!(*committed, meta);
    }

    #[test]
    #[should_panic(expected = "conflicting metadata")]
    fn test_conflicting_commit_panics() {
        let cache = MetadataCache::new(runtime());
        let mut meta = (*cache.resolve_class("Shape").unwrap()).clone();
        meta.protocols.clear();
        cache.seed_class(meta);
    }
}
